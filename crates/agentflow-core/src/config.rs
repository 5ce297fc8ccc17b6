//! Configuration management for agentflow
//!
//! Repository-level settings: engine timeouts, the refinement bound, the
//! critique/expansion policy thresholds and model selection.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{FlowError, Result, Severity};

/// Directory holding config and activity log, relative to the working root
pub const CONFIG_DIR: &str = ".agentflow";

/// Repository-level agentflow configuration
///
/// Loaded from `.agentflow/config.toml` in the working root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub refinement: RefinementSettings,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub model: ModelSettings,
}

/// Engine execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Per-stage timeout in seconds; absent means no timeout
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: Option<u64>,

    /// Write `.agentflow/activity.md` for each run
    #[serde(default)]
    pub activity_log: bool,
}

/// Refinement loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementSettings {
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
}

/// Thresholds used by workflow policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Relevance above this is a low-severity critique
    #[serde(default = "default_low_severity_above")]
    pub low_severity_above: f32,

    /// Relevance above this (and not above the low cutoff) is medium severity
    #[serde(default = "default_medium_severity_above")]
    pub medium_severity_above: f32,

    /// Contexts above this relevance feed query expansion
    #[serde(default = "default_expansion_threshold")]
    pub expansion_threshold: f32,
}

/// Model configuration for LLM-backed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model")]
    pub default: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

// Default value providers
fn default_stage_timeout_secs() -> Option<u64> {
    Some(60)
}

fn default_max_refinements() -> u32 {
    3
}

fn default_low_severity_above() -> f32 {
    0.8
}

fn default_medium_severity_above() -> f32 {
    0.6
}

fn default_expansion_threshold() -> f32 {
    0.8
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_tokens() -> usize {
    1024
}

impl FlowConfig {
    /// Load configuration from `.agentflow/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| FlowError::Config(format!("Failed to parse config file: {}", e)))?;
            config.policy.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.agentflow/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| FlowError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    /// Stage timeout as a duration; zero disables it
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.engine
            .stage_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl PolicySettings {
    /// Map a document relevance onto a critique severity
    ///
    /// Unscored documents are treated as high severity.
    pub fn severity_for(&self, relevance: Option<f32>) -> Severity {
        match relevance {
            Some(r) if r > self.low_severity_above => Severity::Low,
            Some(r) if r > self.medium_severity_above => Severity::Medium,
            _ => Severity::High,
        }
    }

    /// Whether a context item is relevant enough to drive query expansion
    pub fn is_expansion_context(&self, relevance: Option<f32>) -> bool {
        relevance.is_some_and(|r| r > self.expansion_threshold)
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.low_severity_above)
            || !in_unit(self.medium_severity_above)
            || !in_unit(self.expansion_threshold)
        {
            return Err(FlowError::Config(
                "policy thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if self.medium_severity_above > self.low_severity_above {
            return Err(FlowError::Config(format!(
                "medium_severity_above ({}) exceeds low_severity_above ({})",
                self.medium_severity_above, self.low_severity_above
            )));
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            refinement: RefinementSettings::default(),
            policy: PolicySettings::default(),
            model: ModelSettings::default(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            activity_log: false,
        }
    }
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            max_refinements: default_max_refinements(),
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            low_severity_above: default_low_severity_above(),
            medium_severity_above: default_medium_severity_above(),
            expansion_threshold: default_expansion_threshold(),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            default: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_severity_policy_defaults() {
        let policy = PolicySettings::default();
        assert_eq!(policy.severity_for(Some(0.85)), Severity::Low);
        assert_eq!(policy.severity_for(Some(0.75)), Severity::Medium);
        assert_eq!(policy.severity_for(Some(0.8)), Severity::Medium);
        assert_eq!(policy.severity_for(Some(0.6)), Severity::High);
        assert_eq!(policy.severity_for(None), Severity::High);
    }

    #[test]
    fn test_expansion_threshold_is_strict() {
        let policy = PolicySettings::default();
        assert!(policy.is_expansion_context(Some(0.9)));
        assert!(!policy.is_expansion_context(Some(0.8)));
        assert!(!policy.is_expansion_context(None));
    }

    #[test]
    fn test_load_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = FlowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, FlowConfig::default());
        assert_eq!(config.refinement.max_refinements, 3);
        assert_eq!(config.stage_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_write_then_load_default() {
        let dir = TempDir::new().unwrap();
        FlowConfig::write_default(dir.path()).unwrap();
        assert!(dir.path().join(".agentflow/config.toml").exists());

        let config = FlowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, FlowConfig::default());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(".agentflow/config.toml"),
            "[refinement]\nmax_refinements = 5\n\n[policy]\nexpansion_threshold = 0.5\n",
        )
        .unwrap();

        let config = FlowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.refinement.max_refinements, 5);
        assert_eq!(config.policy.expansion_threshold, 0.5);
        assert_eq!(config.policy.low_severity_above, 0.8);
        assert_eq!(config.model.api_key_env, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(".agentflow/config.toml"),
            "[policy]\nlow_severity_above = 0.5\nmedium_severity_above = 0.7\n",
        )
        .unwrap();

        let err = FlowConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_malformed_config_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(dir.path().join(".agentflow/config.toml"), "engine = [").unwrap();

        assert!(FlowConfig::load_or_default(dir.path()).is_err());
    }
}
