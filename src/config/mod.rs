//! Configuration module for ollama-downloader
//!
//! Loads settings from `$OD_SETTINGS_FILE`, or `$XDG_CONFIG_HOME/ollama-downloader/settings.toml`
//! (`~/.config/ollama-downloader/settings.toml`). Falls back to embedded defaults if the file
//! doesn't exist. Partial configs are merged with defaults using serde's default attributes.
//! Files ending in `.json` are read as JSON, everything else as TOML.
//!
//! # Example
//!
//! ```no_run
//! use ollama_downloader::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models path: {}", config.ollama_library.models_path);
//! println!("Registry: {}", config.ollama_library.registry_base_url);
//! ```

pub mod schema;

pub use schema::Config;

use crate::error::{DownloaderError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the settings file location
pub const SETTINGS_FILE_ENV: &str = "OD_SETTINGS_FILE";

impl Config {
    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = settings_path()?;
        Self::load_from(&path)
    }

    /// Load from an explicit path, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            DownloaderError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| {
                DownloaderError::Config(format!("Failed to parse {}: {e}", path.display()))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                DownloaderError::Config(format!("Failed to parse {}: {e}", path.display()))
            })?
        };

        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(config)
    }
}

/// Resolve the settings file path
pub fn settings_path() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(SETTINGS_FILE_ENV) {
        if !explicit.is_empty() {
            return Ok(PathBuf::from(explicit));
        }
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| DownloaderError::Config("No config directory (HOME not set?)".to_string()))?;
    Ok(config_dir.join("ollama-downloader").join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ollama_library.models_tags_cache, "models_tags.json");
    }

    #[test]
    fn test_load_json_settings() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "ollama_server": {"url": "http://10.0.0.5:11434/", "remove_downloaded_on_error": false},
                "ollama_library": {"verify_ssl": false, "timeout": 30.5}
            }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.ollama_server.url, "http://10.0.0.5:11434/");
        assert!(!config.ollama_server.remove_downloaded_on_error);
        assert!(!config.ollama_library.verify_ssl);
        assert!((config.ollama_library.timeout - 30.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.toml");
        fs::write(&path, "[ollama_server\nurl = 3").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(DownloaderError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_settings_path_env_override() {
        let original = std::env::var(SETTINGS_FILE_ENV).ok();
        std::env::set_var(SETTINGS_FILE_ENV, "/tmp/od-test-settings.json");

        assert_eq!(
            settings_path().unwrap(),
            PathBuf::from("/tmp/od-test-settings.json")
        );

        // Restore original env var
        if let Some(val) = original {
            std::env::set_var(SETTINGS_FILE_ENV, val);
        } else {
            std::env::remove_var(SETTINGS_FILE_ENV);
        }
    }
}
