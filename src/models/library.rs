use crate::config::Config;
use crate::error::{DownloaderError, Result};
use regex::Regex;
use reqwest::{StatusCode, Url};
use std::time::Duration;

/// Scrapes the public Ollama library pages for model names and tags.
pub struct LibraryClient {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl LibraryClient {
    pub fn new(client: reqwest::Client, config: &Config) -> Result<Self> {
        Ok(Self {
            client,
            base: config.library_url()?,
            timeout: config.request_timeout(),
        })
    }

    /// Every model linked from the library index, in page order.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let page = self.fetch_page(&self.base, "the model library").await?;
        let models = extract_models(&page);
        tracing::debug!(count = models.len(), "Scraped library index");
        Ok(models)
    }

    /// Tags published for `model`, in page order.
    pub async fn list_tags(&self, model: &str) -> Result<Vec<String>> {
        let url = self
            .base
            .join(&format!("{model}/tags"))
            .map_err(|e| DownloaderError::Config(format!("Bad library URL for {model}: {e}")))?;
        let page = self.fetch_page(&url, model).await?;
        let tags = extract_tags(&page, model);
        tracing::debug!(model, count = tags.len(), "Scraped tags");
        Ok(tags)
    }

    async fn fetch_page(&self, url: &Url, what: &str) -> Result<String> {
        tracing::debug!(%url, "GET");
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.text().await?),
            StatusCode::NOT_FOUND => Err(DownloaderError::ModelNotFound(what.to_string())),
            status => Err(DownloaderError::Network(format!("GET {url} returned {status}"))),
        }
    }
}

/// Model names from `/library/<model>` links, de-duplicated.
#[must_use]
pub fn extract_models(html: &str) -> Vec<String> {
    // A fixed pattern: it always compiles.
    let Ok(pattern) = Regex::new(r#"href="/library/([A-Za-z0-9._-]+)""#) else {
        return Vec::new();
    };
    dedup_in_order(pattern.captures_iter(html).map(|c| c[1].to_string()))
}

/// Tags from `/library/<model>:<tag>` links, de-duplicated.
#[must_use]
pub fn extract_tags(html: &str, model: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(&format!(
        r#"href="/library/{}:([A-Za-z0-9._-]+)""#,
        regex::escape(model)
    )) else {
        return Vec::new();
    };
    dedup_in_order(pattern.captures_iter(html).map(|c| c[1].to_string()))
}

fn dedup_in_order(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.filter(|item| seen.insert(item.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
        <a href="/library/llama3.1" class="group">llama3.1</a>
        <a href="/library/gemma3">gemma3</a>
        <a href="/library/llama3.1">again</a>
        <a href="/library/qwen2.5:7b">tag link</a>
        <a href="/search">search</a>
    "#;

    const TAGS: &str = r#"
        <a href="/library/llama3.1:latest">latest</a>
        <a href="/library/llama3.1:8b">8b</a>
        <a href="/library/llama3.1:8b">8b again</a>
        <a href="/library/llama3.1:70b-instruct-q4_K_M">70b</a>
        <a href="/library/llama3.10:1b">other model</a>
    "#;

    #[test]
    fn test_extract_models_keeps_order_and_dedups() {
        assert_eq!(extract_models(INDEX), vec!["llama3.1", "gemma3"]);
    }

    #[test]
    fn test_extract_tags_only_for_requested_model() {
        assert_eq!(
            extract_tags(TAGS, "llama3.1"),
            vec!["latest", "8b", "70b-instruct-q4_K_M"]
        );
    }

    #[test]
    fn test_extract_tags_escapes_model_name() {
        // '.' must not match an arbitrary character
        assert!(extract_tags(r#"href="/library/llama3x1:8b""#, "llama3.1").is_empty());
    }
}
