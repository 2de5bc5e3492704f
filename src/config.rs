//! Session configuration
//!
//! Engine and session tunables, persisted as JSON in the platform data directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables shared by the session and the native engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tokens produced when a request does not set `max_length`
    pub default_max_length: u32,
    /// Number of layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Requested context window; capped by what the model was trained with
    pub context_size: u32,
    /// Logical batch size used to feed the prompt
    pub batch_size: u32,
    /// Sampling seed (0 = fresh entropy per generation)
    pub seed: u32,
    /// Wrap prompts in the model's own chat template when it ships one
    pub apply_chat_template: bool,
    /// Largest model file accepted, in MiB (0 = no limit)
    pub memory_budget_mb: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_max_length: 300,
            gpu_layers: 99,
            context_size: 4096,
            batch_size: 512,
            seed: 0,
            apply_chat_template: true,
            memory_budget_mb: 0,
        }
    }
}

impl SessionConfig {
    /// Clamp values into the ranges the engine accepts
    pub fn validate(&mut self) {
        let defaults = Self::default();

        if self.context_size < 512 {
            self.context_size = 512;
        }

        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }

        if self.default_max_length == 0 {
            self.default_max_length = defaults.default_max_length;
        }
        self.default_max_length = self.default_max_length.min(self.context_size);
    }

    /// Memory budget in bytes, if one is set
    pub fn memory_budget_bytes(&self) -> Option<u64> {
        (self.memory_budget_mb > 0).then(|| self.memory_budget_mb.saturating_mul(1024 * 1024))
    }

    /// Load configuration from a file
    ///
    /// Returns defaults if the file doesn't exist or is corrupted
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config from {}, using defaults: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load configuration from a file, propagating errors
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)?;
        let mut config: SessionConfig = serde_json::from_str(&json)?;
        config.validate();

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }
}

/// Get the application data directory
///
/// - Linux: `/home/{user}/.local/share/genai-session`
/// - macOS: `/Users/{user}/Library/Application Support/dev.genai.genai-session`
/// - Windows: `C:\Users\{user}\AppData\Roaming\genai\genai-session\data`
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("dev", "genai", "genai-session")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDir("Could not determine data directory".to_string()))
}

/// Default location of the config file
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(get_data_dir()?.join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.default_max_length, 300);
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.batch_size, 512);
        assert!(config.apply_chat_template);
        assert_eq!(config.memory_budget_bytes(), None);
    }

    #[test]
    fn test_memory_budget_bytes() {
        let config = SessionConfig {
            memory_budget_mb: 2,
            ..SessionConfig::default()
        };
        assert_eq!(config.memory_budget_bytes(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SessionConfig {
            context_size: 16,
            batch_size: 0,
            default_max_length: 0,
            ..SessionConfig::default()
        };
        config.validate();

        assert_eq!(config.context_size, 512);
        assert_eq!(config.batch_size, 512);
        assert_eq!(config.default_max_length, 300);

        config.default_max_length = 100_000;
        config.validate();
        assert_eq!(config.default_max_length, 512);
    }

    #[test]
    fn test_config_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = SessionConfig {
            gpu_layers: 0,
            seed: 42,
            ..SessionConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "seed": 7 }"#).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.seed, 7);
        assert_eq!(loaded.context_size, 4096);
    }

    #[test]
    fn test_corrupt_config_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(SessionConfig::load(&path), Err(ConfigError::Json(_))));
        assert_eq!(SessionConfig::load_or_default(&path), SessionConfig::default());
    }

    #[test]
    fn test_missing_config_is_default() {
        let dir = TempDir::new().unwrap();
        let loaded = SessionConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, SessionConfig::default());
    }
}
