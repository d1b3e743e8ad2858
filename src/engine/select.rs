//! Engine/model selection.
//!
//! Precedence, highest first:
//! 1. explicit engine/model in the request
//! 2. `RALPH_ENGINE` / `RALPH_MODEL`
//! 3. `<project>/.ralph/config.json`
//! 4. the purpose-scoped entry in `settings.json`
//! 5. the first available engine in registry order
//!
//! The engine comes from the first level that names one. The model comes from
//! the first level that names one and either names no engine or names the
//! engine that was chosen, so a model meant for another engine never leaks.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::registry::EngineRegistry;
use super::Engine;
use crate::settings::{EngineChoice, Purpose, SettingsStore};
use crate::task::ProjectContext;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("Unknown engine '{name}' (from {source_level})")]
    UnknownEngine {
        name: String,
        source_level: SelectionSource,
    },

    #[error("No engine available (tried: {})", .tried.join(", "))]
    NoEngineAvailable { tried: Vec<String> },
}

/// Which precedence level decided the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Explicit,
    Environment,
    ProjectConfig,
    PurposeSetting,
    AutoDetect,
}

impl std::fmt::Display for SelectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SelectionSource::Explicit => "request",
            SelectionSource::Environment => "environment",
            SelectionSource::ProjectConfig => "project config",
            SelectionSource::PurposeSetting => "purpose setting",
            SelectionSource::AutoDetect => "auto-detect",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    pub project_path: Option<PathBuf>,
    pub engine_name: Option<String>,
    pub model: Option<String>,
    pub purpose: Option<Purpose>,
}

#[derive(Clone)]
pub struct EngineSelection {
    pub engine: Arc<dyn Engine>,
    /// Canonical engine id
    pub engine_name: String,
    pub model: Option<String>,
    pub source: SelectionSource,
}

impl std::fmt::Debug for EngineSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSelection")
            .field("engine_name", &self.engine_name)
            .field("model", &self.model)
            .field("source", &self.source)
            .finish()
    }
}

/// `RALPH_ENGINE` / `RALPH_MODEL`.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub engine: Option<String>,
    pub model: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            engine: read("RALPH_ENGINE"),
            model: read("RALPH_MODEL"),
        }
    }
}

/// Per-project override document (`.ralph/config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ProjectConfig {
    /// Missing or malformed files yield an empty override.
    pub async fn load(project: &ProjectContext) -> Self {
        let path = project.config_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring malformed project config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

pub struct EngineSelector {
    registry: Arc<EngineRegistry>,
    env: EnvOverrides,
    settings: Option<Arc<SettingsStore>>,
}

impl EngineSelector {
    pub fn new(
        registry: Arc<EngineRegistry>,
        env: EnvOverrides,
        settings: Option<Arc<SettingsStore>>,
    ) -> Self {
        Self {
            registry,
            env,
            settings,
        }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub async fn select(&self, request: &SelectRequest) -> Result<EngineSelection, SelectError> {
        let levels = self.collect_levels(request).await;

        let mut chosen: Option<(Arc<dyn Engine>, SelectionSource)> = None;
        for (source, choice) in &levels {
            if let Some(name) = non_empty(&choice.engine) {
                let engine = self.registry.resolve(name).ok_or_else(|| SelectError::UnknownEngine {
                    name: name.to_string(),
                    source_level: *source,
                })?;
                chosen = Some((engine, *source));
                break;
            }
        }

        let (engine, source) = match chosen {
            Some(found) => found,
            None => (self.auto_detect().await?, SelectionSource::AutoDetect),
        };

        let model = levels.iter().find_map(|(_, choice)| {
            let model = non_empty(&choice.model)?;
            let compatible = match non_empty(&choice.engine) {
                None => true,
                Some(name) => self
                    .registry
                    .resolve(name)
                    .is_some_and(|e| e.id() == engine.id()),
            };
            compatible.then(|| model.to_string())
        });

        info!(
            engine = engine.id(),
            model = ?model,
            source = %source,
            "Selected engine"
        );
        Ok(EngineSelection {
            engine_name: engine.id().to_string(),
            engine,
            model,
            source,
        })
    }

    async fn collect_levels(&self, request: &SelectRequest) -> Vec<(SelectionSource, EngineChoice)> {
        let mut levels = vec![
            (
                SelectionSource::Explicit,
                EngineChoice {
                    engine: request.engine_name.clone(),
                    model: request.model.clone(),
                },
            ),
            (
                SelectionSource::Environment,
                EngineChoice {
                    engine: self.env.engine.clone(),
                    model: self.env.model.clone(),
                },
            ),
        ];

        if let Some(path) = &request.project_path {
            let project = ProjectContext::new(path);
            let config = ProjectConfig::load(&project).await;
            levels.push((
                SelectionSource::ProjectConfig,
                EngineChoice {
                    engine: config.engine,
                    model: config.model,
                },
            ));
        }

        if let (Some(purpose), Some(settings)) = (request.purpose, &self.settings) {
            levels.push((SelectionSource::PurposeSetting, settings.purpose(purpose).await));
        }
        levels
    }

    async fn auto_detect(&self) -> Result<Arc<dyn Engine>, SelectError> {
        let mut tried = Vec::new();
        for engine in self.registry.engines() {
            let availability = engine.is_available().await;
            debug!(
                engine = engine.id(),
                available = availability.available,
                version = ?availability.version,
                "Checked engine"
            );
            if availability.available {
                return Ok(Arc::clone(engine));
            }
            tried.push(engine.id().to_string());
        }
        Err(SelectError::NoEngineAvailable { tried })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::StubEngine;
    use crate::settings::Settings;
    use std::sync::atomic::Ordering;

    fn registry(claude_available: bool, codex_available: bool) -> Arc<EngineRegistry> {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(StubEngine::new("claude", claude_available)));
        registry.register(Arc::new(StubEngine::new("codex", codex_available)));
        Arc::new(registry)
    }

    fn settings_with(purpose: Purpose, engine: &str, model: &str) -> Arc<SettingsStore> {
        let mut settings = Settings::default();
        settings.purposes.insert(
            purpose,
            EngineChoice {
                engine: Some(engine.to_string()),
                model: Some(model.to_string()),
            },
        );
        Arc::new(SettingsStore::in_memory("/nonexistent/settings.json", settings))
    }

    fn env(engine: Option<&str>, model: Option<&str>) -> EnvOverrides {
        EnvOverrides {
            engine: engine.map(str::to_string),
            model: model.map(str::to_string),
        }
    }

    async fn project_with_config(json: &str) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = ProjectContext::new(temp.path());
        tokio::fs::create_dir_all(project.state_dir()).await.unwrap();
        tokio::fs::write(project.config_path(), json).await.unwrap();
        temp
    }

    #[tokio::test]
    async fn explicit_override_wins_over_everything() {
        let project = project_with_config(r#"{"engine":"codex","model":"o3"}"#).await;
        let selector = EngineSelector::new(
            registry(true, true),
            env(Some("codex"), Some("gpt-5")),
            Some(settings_with(Purpose::TaskRunner, "codex", "o4-mini")),
        );
        let selection = selector
            .select(&SelectRequest {
                project_path: Some(project.path().to_path_buf()),
                engine_name: Some("Anthropic".to_string()),
                model: Some("opus".to_string()),
                purpose: Some(Purpose::TaskRunner),
            })
            .await
            .expect("select");
        assert_eq!(selection.engine_name, "claude");
        assert_eq!(selection.model.as_deref(), Some("opus"));
        assert_eq!(selection.source, SelectionSource::Explicit);
    }

    #[tokio::test]
    async fn environment_beats_project_and_purpose() {
        let project = project_with_config(r#"{"engine":"claude"}"#).await;
        let selector = EngineSelector::new(
            registry(true, true),
            env(Some("openai"), None),
            Some(settings_with(Purpose::TaskRunner, "claude", "sonnet")),
        );
        let selection = selector
            .select(&SelectRequest {
                project_path: Some(project.path().to_path_buf()),
                purpose: Some(Purpose::TaskRunner),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(selection.engine_name, "codex");
        assert_eq!(selection.source, SelectionSource::Environment);
        // The purpose model belongs to claude and must not leak.
        assert_eq!(selection.model, None);
    }

    #[tokio::test]
    async fn project_config_beats_purpose_setting() {
        let project = project_with_config(r#"{"engine":"codex","model":"o3"}"#).await;
        let selector = EngineSelector::new(
            registry(true, true),
            EnvOverrides::default(),
            Some(settings_with(Purpose::TaskRunner, "claude", "sonnet")),
        );
        let selection = selector
            .select(&SelectRequest {
                project_path: Some(project.path().to_path_buf()),
                purpose: Some(Purpose::TaskRunner),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(selection.engine_name, "codex");
        assert_eq!(selection.model.as_deref(), Some("o3"));
        assert_eq!(selection.source, SelectionSource::ProjectConfig);
    }

    #[tokio::test]
    async fn purpose_setting_is_scoped_to_its_purpose() {
        let selector = EngineSelector::new(
            registry(true, true),
            EnvOverrides::default(),
            Some(settings_with(Purpose::DecomposeReviewer, "codex", "o3")),
        );

        let reviewer = selector
            .select(&SelectRequest {
                purpose: Some(Purpose::DecomposeReviewer),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(reviewer.engine_name, "codex");
        assert_eq!(reviewer.model.as_deref(), Some("o3"));
        assert_eq!(reviewer.source, SelectionSource::PurposeSetting);

        let runner = selector
            .select(&SelectRequest {
                purpose: Some(Purpose::TaskRunner),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(runner.engine_name, "claude");
        assert_eq!(runner.source, SelectionSource::AutoDetect);
    }

    #[tokio::test]
    async fn model_only_override_applies_to_detected_engine() {
        let selector = EngineSelector::new(
            registry(false, true),
            env(None, Some("gpt-5")),
            None,
        );
        let selection = selector
            .select(&SelectRequest::default())
            .await
            .expect("select");
        assert_eq!(selection.engine_name, "codex");
        assert_eq!(selection.model.as_deref(), Some("gpt-5"));
        assert_eq!(selection.source, SelectionSource::AutoDetect);
    }

    #[tokio::test]
    async fn explicitly_named_unavailable_engine_is_still_returned() {
        let registry = registry(false, true);
        let selector = EngineSelector::new(Arc::clone(&registry), EnvOverrides::default(), None);
        let selection = selector
            .select(&SelectRequest {
                engine_name: Some("claude".to_string()),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(selection.engine_name, "claude");
        assert!(!selection.engine.is_available().await.available);
    }

    #[tokio::test]
    async fn explicit_selection_skips_probing() {
        let stub = Arc::new(StubEngine::new("claude", true));
        let mut registry = EngineRegistry::new();
        registry.register(stub.clone());
        let selector = EngineSelector::new(Arc::new(registry), EnvOverrides::default(), None);
        selector
            .select(&SelectRequest {
                engine_name: Some("claude".to_string()),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(stub.availability_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_names_and_empty_detection_are_errors() {
        let selector = EngineSelector::new(registry(false, false), env(Some("gemini"), None), None);
        let err = selector
            .select(&SelectRequest::default())
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            SelectError::UnknownEngine { ref name, source_level: SelectionSource::Environment } if name == "gemini"
        ));

        let selector = EngineSelector::new(registry(false, false), EnvOverrides::default(), None);
        let err = selector
            .select(&SelectRequest::default())
            .await
            .expect_err("nothing available");
        match err {
            SelectError::NoEngineAvailable { tried } => assert_eq!(tried, vec!["claude", "codex"]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_project_config_is_ignored() {
        let project = project_with_config("{not json").await;
        let selector = EngineSelector::new(registry(false, true), EnvOverrides::default(), None);
        let selection = selector
            .select(&SelectRequest {
                project_path: Some(project.path().to_path_buf()),
                ..SelectRequest::default()
            })
            .await
            .expect("select");
        assert_eq!(selection.engine_name, "codex");
        assert_eq!(selection.source, SelectionSource::AutoDetect);
    }
}
