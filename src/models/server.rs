use crate::config::Config;
use crate::error::{DownloaderError, Result};
use crate::http::cancellable;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One entry of the server's model listing
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerModel {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

impl ServerModel {
    #[must_use]
    pub fn matches(&self, wanted: &str) -> bool {
        self.name.eq_ignore_ascii_case(wanted)
            || self
                .model
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case(wanted))
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ServerModel>,
}

/// Source of the models a serving runtime currently knows about
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ServerModel>>;
}

/// `GET /api/tags` on an Ollama server
pub struct OllamaServerClient {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl OllamaServerClient {
    pub fn new(client: reqwest::Client, config: &Config) -> Result<Self> {
        Ok(Self {
            client,
            base: config.server_url()?,
            api_key: config.ollama_server.api_key.clone(),
            timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl ModelCatalog for OllamaServerClient {
    async fn list_models(&self) -> Result<Vec<ServerModel>> {
        let url = self
            .base
            .join("api/tags")
            .map_err(|e| DownloaderError::Config(format!("Bad server URL: {e}")))?;

        let mut request = self.client.get(url.clone()).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloaderError::Network(format!("GET {url} returned {status}")));
        }

        let listing: TagsResponse = response.json().await?;
        Ok(listing.models)
    }
}

/// Asks the server whether it sees an installed model, polling until it does.
pub struct PostDownloadVerifier {
    catalog: Arc<dyn ModelCatalog>,
    attempts: u32,
    interval: Duration,
}

impl PostDownloadVerifier {
    #[must_use]
    pub fn new(catalog: Arc<dyn ModelCatalog>, config: &Config) -> Self {
        Self {
            catalog,
            attempts: config.ollama_server.verify_attempts.max(1),
            interval: Duration::from_secs(config.ollama_server.verify_interval_secs),
        }
    }

    pub async fn verify(&self, model_name: &str, cancel: &CancellationToken) -> Result<()> {
        let mut last_problem = String::from("model not listed");

        for attempt in 1..=self.attempts {
            match cancellable(cancel, self.catalog.list_models()).await {
                Ok(models) if models.iter().any(|m| m.matches(model_name)) => {
                    tracing::info!(model = model_name, attempt, "Server lists the model");
                    return Ok(());
                }
                Ok(models) => {
                    tracing::debug!(model = model_name, attempt, listed = models.len(), "Model not listed yet");
                    last_problem = format!("{model_name} is not in the server's model list");
                }
                Err(DownloaderError::Cancelled) => return Err(DownloaderError::Cancelled),
                Err(e) => {
                    tracing::warn!(attempt, "Could not query the server: {e}");
                    last_problem = format!("server query failed: {e}");
                }
            }

            if attempt < self.attempts {
                cancellable(cancel, async {
                    tokio::time::sleep(self.interval).await;
                    Ok(())
                })
                .await?;
            }
        }

        Err(DownloaderError::PostVerificationFailed(format!(
            "{last_problem} (after {} attempts)",
            self.attempts
        )))
    }
}
