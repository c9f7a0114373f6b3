use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::analyzer::DEFAULT_MAX_ITERATIONS;
use crate::event::DEFAULT_EVENT_CAPACITY;

/// Absolute ceiling on a session's iteration limit
pub const MAX_ITERATIONS_CEILING: u32 = 50;

/// Clamp an iteration limit into `[1, MAX_ITERATIONS_CEILING]`
pub fn clamp_max_iterations(n: u32) -> u32 {
    n.clamp(1, MAX_ITERATIONS_CEILING)
}

/// Per-session continuation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContinuationConfig {
    /// Whether events for this session are evaluated at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether a completed task may be followed by the next one without a human
    #[serde(default = "default_true")]
    pub auto_assign_next: bool,
    /// Evaluations allowed before the session is handed to its owner
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl Default for SessionContinuationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            auto_assign_next: default_true(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl SessionContinuationConfig {
    /// Copy of this config with the iteration limit clamped into range
    pub fn normalized(&self) -> Self {
        Self {
            max_iterations: clamp_max_iterations(self.max_iterations),
            ..self.clone()
        }
    }
}

/// Text handed back to the caller for prompt-injecting actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplates {
    /// Sent when the agent stopped before finishing
    #[serde(default = "default_continue_prompt")]
    pub continue_prompt: String,
    /// Sent when the agent hit an error; hints are appended
    #[serde(default = "default_retry_prompt")]
    pub retry_prompt: String,
}

fn default_continue_prompt() -> String {
    "Continue working on the current task. When it is finished, commit your changes and mark the task complete.".to_string()
}

fn default_retry_prompt() -> String {
    "The last step failed. Fix the error below and try again.".to_string()
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            continue_prompt: default_continue_prompt(),
            retry_prompt: default_retry_prompt(),
        }
    }
}

/// Main configuration for the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Settings given to sessions the first time they are seen
    #[serde(default)]
    pub defaults: SessionContinuationConfig,
    /// Events buffered on the bus before slow consumers start lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Prompt texts for continuation messages
    #[serde(default)]
    pub prompts: PromptTemplates,
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            defaults: SessionContinuationConfig::default(),
            event_capacity: default_event_capacity(),
            prompts: PromptTemplates::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::SupervisorError::ConfigError(e.to_string()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::SupervisorError::ConfigError(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Load from `path` if given, else from the user config file if it
    /// exists, else defaults
    pub fn load(path: Option<&Path>) -> crate::error::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Merge CLI arguments into this configuration
    /// CLI arguments take precedence over config file values
    pub fn merge_cli_args(&mut self, max_iterations: Option<u32>, auto_assign_next: Option<bool>) {
        if let Some(max) = max_iterations {
            self.defaults.max_iterations = clamp_max_iterations(max);
        }
        if let Some(auto) = auto_assign_next {
            self.defaults.auto_assign_next = auto;
        }
    }

    fn normalized(mut self) -> Self {
        self.defaults = self.defaults.normalized();
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}

/// `~/.config/ralph-supervisor/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ralph-supervisor").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionContinuationConfig::default();
        assert!(config.enabled);
        assert!(config.auto_assign_next);
        assert_eq!(config.max_iterations, 10);
    }

    #[test]
    fn test_clamp_bounds() {
        assert_eq!(clamp_max_iterations(0), 1);
        assert_eq!(clamp_max_iterations(1), 1);
        assert_eq!(clamp_max_iterations(25), 25);
        assert_eq!(clamp_max_iterations(50), 50);
        assert_eq!(clamp_max_iterations(500), 50);
        assert_eq!(clamp_max_iterations(u32::MAX), 50);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SupervisorConfig = toml::from_str(
            r#"
            [defaults]
            auto_assign_next = false
            "#,
        )
        .unwrap();

        assert!(config.defaults.enabled);
        assert!(!config.defaults.auto_assign_next);
        assert_eq!(config.defaults.max_iterations, 10);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.prompts, PromptTemplates::default());
    }

    #[test]
    fn test_cli_args_override_and_clamp() {
        let mut config = SupervisorConfig::default();
        config.merge_cli_args(Some(99), Some(false));
        assert_eq!(config.defaults.max_iterations, MAX_ITERATIONS_CEILING);
        assert!(!config.defaults.auto_assign_next);

        config.merge_cli_args(None, None);
        assert_eq!(config.defaults.max_iterations, MAX_ITERATIONS_CEILING);
    }
}
