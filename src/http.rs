use crate::config::Config;
use crate::error::{DownloaderError, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// User agent sent with every request
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by every stage of the pipeline.
///
/// Only the connect phase is bounded here. Request-level timeouts are applied per call,
/// and blob bodies are bounded per chunk, so a large blob on a slow link is not cut off
/// while it is still making progress.
///
/// Proxy variables (`HTTPS_PROXY`, `NO_PROXY`, ...) are honored by reqwest itself, and the
/// system TLS stack reads `SSL_CERT_FILE` / `SSL_CERT_DIR`.
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    if !config.ollama_library.verify_ssl {
        tracing::warn!("SSL verification is disabled. This is not recommended for production use.");
    }

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.request_timeout())
        .danger_accept_invalid_certs(!config.ollama_library.verify_ssl)
        .build()
        .map_err(|e| DownloaderError::Config(format!("Failed to create HTTP client: {e}")))
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DownloaderError::Cancelled),
        res = fut => res,
    }
}
