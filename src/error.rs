use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the downloader
#[derive(Error, Debug)]
pub enum DownloaderError {
    #[error("Model not found: {0}\n\nTroubleshooting:\n- Check the spelling of the model or repository name\n- Browse https://ollama.com/library or https://huggingface.co/models?apps=ollama")]
    ModelNotFound(String),

    #[error("Tag not found: {reference}{}\n\nTroubleshooting:\n- List available tags: ollama-downloader list-tags <model> --update", .suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    TagNotFound {
        reference: String,
        suggestion: Option<String>,
    },

    #[error("Unsupported repository: {0} has no GGUF files that Ollama can load\n\nTroubleshooting:\n- Look for a '-GGUF' variant of the repository\n- List quantisations: ollama-downloader hf-list-tags <org>/<repo>")]
    UnsupportedRepository(String),

    #[error("Manifest parse error for {reference}: {detail}")]
    ManifestParse { reference: String, detail: String },

    #[error("Invalid model reference '{0}'\n\nTroubleshooting:\n- Ollama models: <model>[:<tag>], e.g. llama3.1:8b\n- Hugging Face models: <org>/<repo>:<quantisation>, e.g. bartowski/Llama-3.2-1B-Instruct-GGUF:Q4_K_M")]
    InvalidReference(String),

    #[error("Network error: {0}\n\nTroubleshooting:\n- Check internet connection and proxy variables (HTTPS_PROXY, NO_PROXY)\n- Behind a TLS-intercepting proxy, set SSL_CERT_FILE or verify_ssl = false\n- Try again in a moment")]
    Network(String),

    #[error("Timed out: {0}\n\nTroubleshooting:\n- Try increasing ollama_library.timeout in config\n- Check network bandwidth to the registry")]
    Timeout(String),

    #[error("Digest mismatch for blob {wanted}: wanted {wanted}, got {got}\n\nThe downloaded bytes were discarded; re-run the download to fetch this blob again.")]
    DigestMismatch { wanted: String, got: String },

    #[error("Size mismatch for blob {digest}: declared {declared} bytes, received {received}")]
    SizeMismatch {
        digest: String,
        declared: u64,
        received: u64,
    },

    #[error("Install error at {}: {detail}\n\nTroubleshooting:\n- Check permissions on ollama_library.models_path\n- Check free disk space\n- If user_group is set, the process needs privileges to change ownership", .path.display())]
    Install { path: PathBuf, detail: String },

    #[error("Post-download verification failed: {0}\n\nThe files look right locally but the Ollama server does not list the model.\n\nTroubleshooting:\n- Is the Ollama server running at ollama_server.url?\n- Does the server read the same models_path?\n- Restart the server and run: ollama list")]
    PostVerificationFailed(String),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/ollama-downloader/settings.toml (or $OD_SETTINGS_FILE)\n- Run: ollama-downloader show-config\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("Download cancelled")]
    Cancelled,
}

/// Coarse failure classes shown to users so a failure maps to its root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Resolution,
    Transport,
    Integrity,
    Install,
    Acceptance,
    Configuration,
    Cancelled,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Resolution => "resolution failure",
            Self::Transport => "transport failure",
            Self::Integrity => "integrity failure",
            Self::Install => "install failure",
            Self::Acceptance => "acceptance failure",
            Self::Configuration => "configuration error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl DownloaderError {
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ModelNotFound(_)
            | Self::TagNotFound { .. }
            | Self::UnsupportedRepository(_)
            | Self::ManifestParse { .. } => ErrorCategory::Resolution,
            Self::Network(_) | Self::Timeout(_) => ErrorCategory::Transport,
            Self::DigestMismatch { .. } | Self::SizeMismatch { .. } => ErrorCategory::Integrity,
            Self::Install { .. } => ErrorCategory::Install,
            Self::PostVerificationFailed(_) => ErrorCategory::Acceptance,
            Self::InvalidReference(_) | Self::Config(_) => ErrorCategory::Configuration,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Only transient transport errors are worth a local retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub(crate) fn install(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Install {
            path: path.into(),
            detail: err.to_string(),
        }
    }

    pub(crate) fn manifest_parse(reference: impl std::fmt::Display, detail: impl Into<String>) -> Self {
        Self::ManifestParse {
            reference: reference.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<reqwest::Error> for DownloaderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloaderError>;
