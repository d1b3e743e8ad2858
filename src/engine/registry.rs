use std::sync::Arc;

use super::amp::AmpEngine;
use super::claudecode::ClaudeCodeEngine;
use super::codex::CodexEngine;
use super::Engine;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineInfo {
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
}

/// Known engines, kept in auto-detect preference order.
pub struct EngineRegistry {
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: Vec::new(),
        }
    }

    /// Claude Code, Codex and Amp, configured from the environment.
    pub fn with_default_engines() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeCodeEngine::new(Default::default())));
        registry.register(Arc::new(CodexEngine::new(Default::default())));
        registry.register(Arc::new(AmpEngine::new(Default::default())));
        registry
    }

    /// Append an engine; replaces an existing engine with the same id in place.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        match self.engines.iter().position(|e| e.id() == engine.id()) {
            Some(idx) => self.engines[idx] = engine,
            None => self.engines.push(engine),
        }
    }

    pub fn list(&self) -> Vec<EngineInfo> {
        self.engines
            .iter()
            .map(|engine| EngineInfo {
                id: engine.id().to_string(),
                name: engine.name().to_string(),
                aliases: engine.aliases().iter().map(|a| a.to_string()).collect(),
            })
            .collect()
    }

    /// Engines in preference order.
    pub fn engines(&self) -> &[Arc<dyn Engine>] {
        &self.engines
    }

    /// Look up an engine by id or alias, ignoring case and surrounding space.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Engine>> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.engines
            .iter()
            .find(|engine| {
                engine.id().eq_ignore_ascii_case(&wanted)
                    || engine.aliases().iter().any(|alias| *alias == wanted)
            })
            .cloned()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_default_engines()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::StubEngine;

    #[test]
    fn default_engines_in_preference_order() {
        let ids: Vec<String> = EngineRegistry::with_default_engines()
            .list()
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(ids, vec!["claude", "codex", "amp"]);
    }

    #[test]
    fn aliases_resolve_case_insensitively() {
        let registry = EngineRegistry::with_default_engines();
        for (name, id) in [
            ("Claude-Code", "claude"),
            ("ANTHROPIC", "claude"),
            ("claudecode", "claude"),
            (" OpenAI ", "codex"),
            ("codex-cli", "codex"),
            ("AmpCode", "amp"),
            ("sourcegraph", "amp"),
        ] {
            let resolved = registry.resolve(name).map(|e| e.id().to_string());
            assert_eq!(resolved.as_deref(), Some(id), "{}", name);
        }
        assert!(registry.resolve("gemini").is_none());
        assert!(registry.resolve("").is_none());
    }

    #[test]
    fn register_replaces_same_id_in_place() {
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(StubEngine::new("claude", true)));
        registry.register(Arc::new(StubEngine::new("codex", true)));
        registry.register(Arc::new(StubEngine::new("claude", false)));
        let ids: Vec<String> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["claude", "codex"]);
    }
}
