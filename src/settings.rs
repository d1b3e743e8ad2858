//! Purpose-scoped engine settings.
//!
//! Persists user-configurable settings to disk at `{ralph_home}/settings.json`.
//! Each purpose (task runner, decompose reviewer, spec chat) carries its own
//! engine and model choice; anything unset falls through to auto-detection.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::util::write_json_atomic;

/// A named usage context with its own engine/model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Executing tasks inside the Ralph loop
    TaskRunner,
    /// Peer-reviewing decomposed task lists and finished tasks
    DecomposeReviewer,
    /// Conversational spec authoring
    SpecChat,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::TaskRunner => "task_runner",
            Purpose::DecomposeReviewer => "decompose_reviewer",
            Purpose::SpecChat => "spec_chat",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "task_runner" | "task" | "runner" => Ok(Purpose::TaskRunner),
            "decompose_reviewer" | "reviewer" | "review" => Ok(Purpose::DecomposeReviewer),
            "spec_chat" | "chat" => Ok(Purpose::SpecChat),
            other => Err(format!("unknown purpose '{}'", other)),
        }
    }
}

/// Engine and model chosen for one purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Global application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Per-purpose engine selection.
    #[serde(default)]
    pub purposes: BTreeMap<Purpose, EngineChoice>,
}

/// In-memory store for global settings with disk persistence.
#[derive(Debug)]
pub struct SettingsStore {
    settings: RwLock<Settings>,
    storage_path: PathBuf,
}

impl SettingsStore {
    /// Create a new settings store, loading from disk if available.
    pub async fn new(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();

        let settings = if storage_path.exists() {
            match Self::load_from_path(&storage_path).await {
                Ok(s) => {
                    tracing::debug!("Loaded settings from {}", storage_path.display());
                    s
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load settings from {}: {}, using defaults",
                        storage_path.display(),
                        e
                    );
                    Settings::default()
                }
            }
        } else {
            tracing::debug!(
                "No settings file found at {}, using defaults",
                storage_path.display()
            );
            Settings::default()
        };

        Self {
            settings: RwLock::new(settings),
            storage_path,
        }
    }

    /// A store that never touches disk until `set_purpose` is called.
    pub fn in_memory(storage_path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            storage_path: storage_path.into(),
        }
    }

    async fn load_from_path(path: &Path) -> Result<Settings, std::io::Error> {
        let contents = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Get a clone of the current settings.
    pub async fn get(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Engine/model configured for a purpose, if any.
    pub async fn purpose(&self, purpose: Purpose) -> EngineChoice {
        self.settings
            .read()
            .await
            .purposes
            .get(&purpose)
            .cloned()
            .unwrap_or_default()
    }

    /// Update the choice for one purpose and persist.
    pub async fn set_purpose(
        &self,
        purpose: Purpose,
        choice: EngineChoice,
    ) -> Result<(), std::io::Error> {
        let snapshot = {
            let mut settings = self.settings.write().await;
            if choice == EngineChoice::default() {
                settings.purposes.remove(&purpose);
            } else {
                settings.purposes.insert(purpose, choice);
            }
            settings.clone()
        };
        write_json_atomic(&self.storage_path, &snapshot).await?;
        tracing::debug!("Saved settings to {}", self.storage_path.display());
        Ok(())
    }
}
