//! # Tool Configuration
//!
//! Site-wide settings shared by `mbss-demo` and `overiva-sweep`: logging,
//! evaluation defaults, and where results go. Experiment parameters live
//! in the per-sweep JSON files instead.
//!
//! ## Configuration Search Path
//!
//! Configuration is loaded from the first file found:
//! 1. Path specified via the `OVERIVA_CONFIG` environment variable
//! 2. `./overiva.yaml` (current directory)
//! 3. the user config directory, e.g. `~/.config/overiva/config.yaml`
//! 4. `/etc/overiva/config.yaml` (system config)
//!
//! ## Example Configuration
//!
//! ```yaml
//! logging:
//!   level: info
//!   format: json
//!
//! eval:
//!   filter_len: 512
//!
//! results_dir: data
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::metrics::DEFAULT_FILTER_LEN;
use crate::observe::LogConfig;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "OVERIVA_CONFIG";

/// Error type for configuration operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),
    #[error("failed to read config: {0}")]
    ReadError(String),
    #[error("failed to parse config: {0}")]
    ParseError(String),
    #[error("invalid config: {0}")]
    ValidationError(String),
}

/// Separation quality evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Length of the bss_eval distortion filters in samples
    pub filter_len: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            filter_len: DEFAULT_FILTER_LEN,
        }
    }
}

/// Complete tool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub logging: LogConfig,
    pub eval: EvalConfig,
    /// Parent directory of the sweep result folders
    pub results_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            logging: LogConfig::default(),
            eval: EvalConfig::default(),
            results_dir: PathBuf::from("data"),
        }
    }
}

impl ToolConfig {
    /// Load from the search path, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(ConfigError::NotFound(format!(
                    "{} (from {})",
                    path.display(),
                    CONFIG_ENV
                )));
            }
            return Self::load_from(&path);
        }

        for path in Self::config_search_paths() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load an explicit file, or the search path when `path` is `None`.
    pub fn load_or_search(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if !p.exists() => Err(ConfigError::NotFound(p.display().to_string())),
            Some(p) => Self::load_from(p),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))
    }

    /// Standard locations, most specific first.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./overiva.yaml")];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "overiva") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }
        paths.push(PathBuf::from("/etc/overiva/config.yaml"));
        paths
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eval.filter_len == 0 {
            return Err(ConfigError::ValidationError(
                "eval.filter_len must be > 0".to_string(),
            ));
        }
        if self.results_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "results_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::{LogFormat, LogLevel};
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ToolConfig::default();
        assert_eq!(config.eval.filter_len, 512);
        assert_eq!(config.results_dir, PathBuf::from("data"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = ToolConfig::parse("logging:\n  level: debug\n  format: json\n").unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.eval.filter_len, 512);
    }

    #[test]
    fn test_parse_error() {
        let err = ToolConfig::parse("eval: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = ToolConfig::default();
        config.eval.filter_len = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("overiva.yaml");
        let mut config = ToolConfig::default();
        config.results_dir = PathBuf::from("/tmp/results");
        config.eval.filter_len = 256;
        config.save(&path).unwrap();

        let loaded = ToolConfig::load_or_search(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert!(matches!(
            ToolConfig::load_or_search(Some(&dir.path().join("missing.yaml"))),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_config_search_paths() {
        let paths = ToolConfig::config_search_paths();
        assert_eq!(paths[0], PathBuf::from("./overiva.yaml"));
        assert_eq!(
            paths.last().unwrap(),
            &PathBuf::from("/etc/overiva/config.yaml")
        );
    }
}
