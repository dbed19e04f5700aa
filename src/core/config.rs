//! Configuration management for Stagewright.
//!
//! Handles loading and saving configuration from TOML files.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{EngineError, EngineResult};
use crate::agent::ProviderConfig;
use crate::cache::CacheConfig;
use crate::workflow::{OrchestratorConfig, StageOverride};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "STAGEWRIGHT_CONFIG";

/// Project-local config file name.
pub const LOCAL_CONFIG: &str = ".stagewright.toml";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// General settings
    pub general: GeneralConfig,

    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,

    /// Prompt cache settings
    pub cache: CacheConfig,

    /// Configured language-model backends, in selection order
    pub providers: Vec<ProviderConfig>,

    /// Per-stage overrides keyed by stage id
    pub stages: BTreeMap<String, StageOverride>,
}

/// General settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Where workflow logs live (defaults to the user data directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            cache: CacheConfig::default(),
            providers: vec![ProviderConfig::new("local").with_capabilities(["text", "code", "review"])],
            stages: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration.
    ///
    /// Looks at `$STAGEWRIGHT_CONFIG`, then `./.stagewright.toml`, then the
    /// global config file, and falls back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return Self::load_from_file(Path::new(&path));
        }

        let local_config = PathBuf::from(LOCAL_CONFIG);
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(global_config) = Self::config_dir().map(|d| d.join("config.toml")) {
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate().with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let config_dir =
            Self::config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        let path = config_dir.join("config.toml");
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> EngineResult<()> {
        if self.providers.is_empty() {
            return Err(EngineError::Config("at least one provider must be configured".into()));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(EngineError::Config("provider name must not be empty".into()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(EngineError::Config(format!("duplicate provider '{}'", provider.name)));
            }
            if provider.request_timeout.is_zero() {
                return Err(EngineError::Config(format!(
                    "provider '{}' has a zero request timeout",
                    provider.name
                )));
            }
            let pricing = provider.pricing;
            if !(pricing.input_per_1k >= 0.0 && pricing.output_per_1k >= 0.0) {
                return Err(EngineError::Config(format!(
                    "provider '{}' has negative pricing",
                    provider.name
                )));
            }
        }

        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(EngineError::Config("cache capacity must be positive when enabled".into()));
        }

        for (id, over) in &self.stages {
            if over.timeout.is_some_and(|t| t.is_zero()) {
                return Err(EngineError::Config(format!("stage '{id}' has a zero timeout")));
            }
            if over.context_budget == Some(0) {
                return Err(EngineError::Config(format!("stage '{id}' has a zero context budget")));
            }
        }

        Ok(())
    }

    /// Directory holding workflow logs.
    pub fn state_dir(&self) -> PathBuf {
        self.general
            .state_dir
            .clone()
            .or_else(|| Self::data_dir().map(|d| d.join("workflows")))
            .unwrap_or_else(|| PathBuf::from(".stagewright").join("workflows"))
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("stagewright"))
    }

    /// Get the data directory path.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("stagewright"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::workflow::VetoPolicy;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 1);
        assert!(config.cache.enabled);
        assert_eq!(config.orchestrator.veto_policy, VetoPolicy::Halt);
    }

    #[test]
    fn test_config_deserialization() {
        let config: EngineConfig = toml::from_str(
            r#"
            [orchestrator]
            veto_policy = "retry"

            [cache]
            capacity = 16

            [[providers]]
            name = "fixture"
            kind = "scripted"
            capabilities = ["text"]
            requests_per_minute = 60
            burst = 5

            [stages.design]
            timeout = 30000
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.veto_policy, VetoPolicy::Retry);
        assert_eq!(config.cache.capacity, 16);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.providers[0].name, "fixture");
        assert_eq!(config.providers[0].burst, 5);
        assert_eq!(config.stages["design"].timeout, Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.providers.push(config.providers[0].clone());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.providers.clear();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());
        config.cache.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = EngineConfig::default();
        config.stages.insert(
            "design".into(),
            StageOverride { context_budget: Some(0), ..Default::default() },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = EngineConfig::default();
        config.general.state_dir = Some(dir.path().join("state"));
        config.orchestrator.veto_policy = VetoPolicy::Retry;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.state_dir(), dir.path().join("state"));
    }

    #[test]
    fn test_load_from_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "providers = 3").unwrap();

        let err = EngineConfig::load_from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }

    #[test]
    #[serial]
    fn test_load_honours_env_var() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[cache]\nenabled = false\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let loaded = EngineConfig::load();
        std::env::remove_var(CONFIG_ENV);

        let config = loaded.unwrap();
        assert!(!config.cache.enabled);
        assert_eq!(config.providers.len(), 1);
    }
}
