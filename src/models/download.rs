use crate::config::Config;
use crate::error::{DownloaderError, Result};
use crate::http::cancellable;
use crate::models::manifest::{BlobPlan, BlobSource, Digest};
use futures_util::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::Url;
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// A fully streamed blob waiting in the working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBlob {
    pub path: PathBuf,
    /// SHA-256 of exactly the bytes written to `path`
    pub digest: Digest,
    pub size: u64,
}

/// Streams blobs to temporary files, hashing as it writes.
pub struct BlobDownloader {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    /// Server origin and API key; the key is only sent back to that origin
    auth: Option<(Url, String)>,
    progress: MultiProgress,
}

impl BlobDownloader {
    pub fn new(client: reqwest::Client, config: &Config) -> Result<Self> {
        let auth = match &config.ollama_server.api_key {
            Some(key) => Some((config.server_url()?, key.clone())),
            None => None,
        };

        Ok(Self {
            client,
            timeout: config.request_timeout(),
            max_retries: config.ollama_library.max_retries,
            retry_backoff: Duration::from_secs(1),
            auth,
            progress: MultiProgress::new(),
        })
    }

    /// Base delay between retries, multiplied by the attempt number
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Write the blob described by `plan` to `dest`.
    ///
    /// Transient network failures restart the blob from scratch, up to `max_retries` times.
    pub async fn download(
        &self,
        plan: &BlobPlan,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadedBlob> {
        let url = match &plan.source {
            BlobSource::Inline(bytes) => return write_inline(plan, bytes, dest).await,
            BlobSource::Remote(url) => url,
        };

        let mut attempt = 0;
        loop {
            match self.fetch(plan, url, dest, cancel).await {
                Ok(blob) => return Ok(blob),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        blob = %plan.label(),
                        attempt,
                        max_retries = self.max_retries,
                        "Download failed, retrying: {e}"
                    );
                    cancellable(cancel, async {
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch(
        &self,
        plan: &BlobPlan,
        url: &Url,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadedBlob> {
        let label = plan.label();
        let mut request = self.client.get(url.clone());
        if let Some(key) = self.api_key_for(url) {
            request = request.bearer_auth(key);
        }

        tracing::debug!(%url, "GET");
        let response = cancellable(cancel, async {
            tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| DownloaderError::Timeout(format!("no response from {url}")))?
                .map_err(DownloaderError::from)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloaderError::Network(format!("GET {url} returned {status}")));
        }

        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| DownloaderError::install(dest, e))?;
        let bar = self.progress_bar(plan);
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    bar.abandon();
                    return Err(DownloaderError::Cancelled);
                }
                next = tokio::time::timeout(self.timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    bar.abandon();
                    return Err(DownloaderError::Timeout(format!(
                        "stalled after {received} bytes of {label}"
                    )));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            received += chunk.len() as u64;
            if received > plan.size {
                bar.abandon();
                return Err(DownloaderError::SizeMismatch {
                    digest: label,
                    declared: plan.size,
                    received,
                });
            }

            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloaderError::install(dest, e))?;
            bar.inc(chunk.len() as u64);
        }

        file.sync_all()
            .await
            .map_err(|e| DownloaderError::install(dest, e))?;
        bar.finish_and_clear();

        if received != plan.size {
            return Err(DownloaderError::SizeMismatch {
                digest: label,
                declared: plan.size,
                received,
            });
        }

        let digest = Digest::from_hasher(hasher);
        tracing::debug!(%digest, bytes = received, path = %dest.display(), "Blob streamed");
        Ok(DownloadedBlob {
            path: dest.to_path_buf(),
            digest,
            size: received,
        })
    }

    fn api_key_for(&self, url: &Url) -> Option<&str> {
        let (server, key) = self.auth.as_ref()?;
        let same_origin = server.host_str() == url.host_str()
            && server.port_or_known_default() == url.port_or_known_default();
        same_origin.then_some(key.as_str())
    }

    fn progress_bar(&self, plan: &BlobPlan) -> ProgressBar {
        let bar = self.progress.add(ProgressBar::new(plan.size));
        let style = ProgressStyle::with_template(
            "{msg:24} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
        )
        .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("=> "));
        bar.set_style(style);
        bar.set_message(match &plan.expected {
            Some(digest) => digest.short(),
            None => plan.media_type.rsplit('.').next().unwrap_or("blob").to_string(),
        });
        bar
    }
}

async fn write_inline(plan: &BlobPlan, bytes: &[u8], dest: &Path) -> Result<DownloadedBlob> {
    if bytes.len() as u64 != plan.size {
        return Err(DownloaderError::SizeMismatch {
            digest: plan.label(),
            declared: plan.size,
            received: bytes.len() as u64,
        });
    }
    fs::write(dest, bytes)
        .await
        .map_err(|e| DownloaderError::install(dest, e))?;
    Ok(DownloadedBlob {
        path: dest.to_path_buf(),
        digest: Digest::of(bytes),
        size: plan.size,
    })
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
        assert_eq!(format_bytes(1_610_612_736), "1.50 GB");
    }

    #[test]
    fn test_api_key_only_for_server_origin() {
        let mut config = Config::default();
        config.ollama_server.api_key = Some("secret".to_string());
        let downloader = BlobDownloader::new(reqwest::Client::new(), &config).unwrap();

        let local = Url::parse("http://localhost:11434/v2/library/x/blobs/y").unwrap();
        let registry = Url::parse("https://registry.ollama.ai/v2/library/x/blobs/y").unwrap();
        assert_eq!(downloader.api_key_for(&local), Some("secret"));
        assert_eq!(downloader.api_key_for(&registry), None);
    }

    #[tokio::test]
    async fn test_inline_blob_is_written_and_hashed() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("config.partial");
        let bytes = br#"{"model_format":"gguf"}"#.to_vec();
        let plan = BlobPlan {
            media_type: "application/vnd.docker.container.image.v1+json".to_string(),
            expected: Some(Digest::of(&bytes)),
            size: bytes.len() as u64,
            source: BlobSource::Inline(bytes.clone()),
        };

        let downloader = BlobDownloader::new(reqwest::Client::new(), &Config::default()).unwrap();
        let blob = downloader
            .download(&plan, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(blob.digest, Digest::of(&bytes));
        assert_eq!(std::fs::read(&dest).unwrap(), bytes);
    }
}
