use crate::error::{DownloaderError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub ollama_server: OllamaServerConfig,
    #[serde(default)]
    pub ollama_library: OllamaLibraryConfig,
    #[serde(default)]
    pub hugging_face: HuggingFaceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct OllamaServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub remove_downloaded_on_error: bool,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct OllamaLibraryConfig {
    #[serde(default = "default_models_path")]
    pub models_path: String,
    #[serde(default = "default_models_tags_cache")]
    pub models_tags_cache: String,
    #[serde(default = "default_registry_base_url")]
    pub registry_base_url: String,
    #[serde(default = "default_library_base_url")]
    pub library_base_url: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// `[user, group]` that should own installed files
    #[serde(default)]
    pub user_group: Option<(String, String)>,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HuggingFaceConfig {
    #[serde(default = "default_hf_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_hf_registry_host")]
    pub registry_host: String,
}

// Default value functions
fn default_server_url() -> String {
    "http://localhost:11434/".to_string()
}
fn default_true() -> bool {
    true
}
fn default_verify_attempts() -> u32 {
    5
}
fn default_verify_interval_secs() -> u64 {
    2
}
fn default_models_path() -> String {
    "~/.ollama/models".to_string()
}
fn default_models_tags_cache() -> String {
    "models_tags.json".to_string()
}
fn default_registry_base_url() -> String {
    "https://registry.ollama.ai/v2/library/".to_string()
}
fn default_library_base_url() -> String {
    "https://ollama.com/library/".to_string()
}
fn default_timeout() -> f64 {
    120.0
}
fn default_max_concurrent_downloads() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_hf_api_base_url() -> String {
    "https://huggingface.co".to_string()
}
fn default_hf_registry_host() -> String {
    "hf.co".to_string()
}

impl Default for OllamaServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: None,
            remove_downloaded_on_error: default_true(),
            verify_attempts: default_verify_attempts(),
            verify_interval_secs: default_verify_interval_secs(),
        }
    }
}

impl Default for OllamaLibraryConfig {
    fn default() -> Self {
        Self {
            models_path: default_models_path(),
            models_tags_cache: default_models_tags_cache(),
            registry_base_url: default_registry_base_url(),
            library_base_url: default_library_base_url(),
            verify_ssl: default_true(),
            timeout: default_timeout(),
            user_group: None,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_hf_api_base_url(),
            registry_host: default_hf_registry_host(),
        }
    }
}

impl Config {
    /// Reject values that would only fail later, deep inside a download.
    pub fn validate(&self) -> Result<()> {
        parse_base_url("ollama_server.url", &self.ollama_server.url)?;
        parse_base_url("ollama_library.registry_base_url", &self.ollama_library.registry_base_url)?;
        parse_base_url("ollama_library.library_base_url", &self.ollama_library.library_base_url)?;
        parse_base_url("hugging_face.api_base_url", &self.hugging_face.api_base_url)?;

        if !(self.ollama_library.timeout.is_finite() && self.ollama_library.timeout > 0.0) {
            return Err(DownloaderError::Config(format!(
                "ollama_library.timeout must be a positive number of seconds, got {}",
                self.ollama_library.timeout
            )));
        }
        if self.ollama_library.max_concurrent_downloads == 0 {
            return Err(DownloaderError::Config(
                "ollama_library.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.ollama_server.verify_attempts == 0 {
            return Err(DownloaderError::Config(
                "ollama_server.verify_attempts must be at least 1".to_string(),
            ));
        }
        if let Some((user, group)) = &self.ollama_library.user_group {
            if user.trim().is_empty() || group.trim().is_empty() {
                return Err(DownloaderError::Config(
                    "ollama_library.user_group must name both a user and a group".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Store root with a leading `~` expanded.
    pub fn models_path(&self) -> Result<PathBuf> {
        expand_home(&self.ollama_library.models_path)
    }

    pub fn tags_cache_path(&self) -> Result<PathBuf> {
        expand_home(&self.ollama_library.models_tags_cache)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ollama_library.timeout)
    }

    pub fn registry_url(&self) -> Result<Url> {
        parse_base_url("ollama_library.registry_base_url", &self.ollama_library.registry_base_url)
    }

    pub fn library_url(&self) -> Result<Url> {
        parse_base_url("ollama_library.library_base_url", &self.ollama_library.library_base_url)
    }

    pub fn server_url(&self) -> Result<Url> {
        parse_base_url("ollama_server.url", &self.ollama_server.url)
    }

    pub fn hf_api_url(&self) -> Result<Url> {
        parse_base_url("hugging_face.api_base_url", &self.hugging_face.api_base_url)
    }

    /// Copy with secrets masked, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if shown.ollama_server.api_key.is_some() {
            shown.ollama_server.api_key = Some("***".to_string());
        }
        shown
    }
}

/// Parse a base URL, forcing a trailing slash so `Url::join` appends instead of replacing
/// the last path segment.
fn parse_base_url(key: &str, raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|e| DownloaderError::Config(format!("{key} is not a valid URL ({raw}): {e}")))?;
    if url.host_str().is_none() {
        return Err(DownloaderError::Config(format!("{key} has no host: {raw}")));
    }
    Ok(url)
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    if let Some(rest) = raw.strip_prefix('~') {
        let home = dirs::home_dir()
            .ok_or_else(|| DownloaderError::Config("HOME directory not found".to_string()))?;
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    Ok(PathBuf::from(raw))
}
