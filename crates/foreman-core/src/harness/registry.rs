//! Harness registry: the name -> adapter lookup the runner resolves each
//! job's `harness` field against.

use std::collections::HashMap;

use super::claude_code::ClaudeCodeAdapter;
use super::codex::CodexAdapter;
use super::gemini::GeminiAdapter;
use super::trait_def::Harness;

/// Binary path overrides for the built-in adapters. `None` means "look the
/// default name up on `$PATH`".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessBinaries {
    pub claude: Option<String>,
    pub codex: Option<String>,
    pub gemini: Option<String>,
}

/// A collection of registered [`Harness`] implementations, keyed by name.
#[derive(Default)]
pub struct HarnessRegistry {
    harnesses: HashMap<String, Box<dyn Harness>>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `claude-code`, `codex` and `gemini`.
    pub fn with_builtins(binaries: &HarnessBinaries) -> Self {
        let mut registry = Self::new();
        registry.register(match &binaries.claude {
            Some(path) => ClaudeCodeAdapter::with_binary(path),
            None => ClaudeCodeAdapter::new(),
        });
        registry.register(match &binaries.codex {
            Some(path) => CodexAdapter::with_binary(path),
            None => CodexAdapter::new(),
        });
        registry.register(match &binaries.gemini {
            Some(path) => GeminiAdapter::with_binary(path),
            None => GeminiAdapter::new(),
        });
        registry
    }

    /// Register a harness under [`Harness::name`], returning any adapter
    /// it replaced.
    pub fn register(&mut self, harness: impl Harness + 'static) -> Option<Box<dyn Harness>> {
        let name = harness.name().to_string();
        self.harnesses.insert(name, Box::new(harness))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Harness> {
        self.harnesses.get(name).map(|b| b.as_ref())
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.harnesses.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.harnesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harnesses.is_empty()
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("harnesses", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::trait_def::StreamHandler;
    use crate::harness::types::{CommandOptions, HarnessCommand};

    struct FakeHarness {
        harness_name: String,
    }

    impl FakeHarness {
        fn new(name: &str) -> Self {
            Self {
                harness_name: name.to_string(),
            }
        }
    }

    impl Harness for FakeHarness {
        fn name(&self) -> &str {
            &self.harness_name
        }

        fn build_command(&self, _prompt: &str, _options: &CommandOptions) -> HarnessCommand {
            HarnessCommand::new("true")
        }

        fn stream_handler(&self) -> Box<dyn StreamHandler> {
            ClaudeCodeAdapter::new().stream_handler()
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = HarnessRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HarnessRegistry::new();
        assert!(registry.register(FakeHarness::new("alpha")).is_none());
        let old = registry.register(FakeHarness::new("alpha"));
        assert_eq!(old.map(|h| h.name().to_string()).as_deref(), Some("alpha"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = HarnessRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn builtins_are_registered_by_name() {
        let registry = HarnessRegistry::with_builtins(&HarnessBinaries::default());
        assert_eq!(registry.list(), vec!["claude-code", "codex", "gemini"]);
    }

    #[test]
    fn binary_overrides_reach_the_command() {
        let registry = HarnessRegistry::with_builtins(&HarnessBinaries {
            codex: Some("/opt/codex".into()),
            ..Default::default()
        });
        let cmd = registry
            .get("codex")
            .unwrap()
            .build_command("x", &CommandOptions::default());
        assert_eq!(cmd.program, "/opt/codex");
        let cmd = registry
            .get("gemini")
            .unwrap()
            .build_command("x", &CommandOptions::default());
        assert_eq!(cmd.program, "gemini");
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = HarnessRegistry::new();
        registry.register(FakeHarness::new("test-harness"));
        assert!(format!("{registry:?}").contains("test-harness"));
    }
}
