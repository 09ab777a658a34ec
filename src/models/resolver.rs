use crate::config::Config;
use crate::error::{DownloaderError, Result};
use crate::models::manifest::{
    BlobPlan, BlobSource, Digest, Manifest, ResolvedManifest, CONFIG_MEDIA_TYPE,
    MANIFEST_MEDIA_TYPE, MODEL_LAYER_MEDIA_TYPE,
};
use crate::models::reference::{HfReference, ModelReference, ModelSource};
use crate::models::tags::TagsCache;
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

/// Repository listing returned by the Hugging Face model API
#[derive(Debug, Deserialize)]
struct HfModelInfo {
    #[serde(default)]
    siblings: Vec<HfSibling>,
}

#[derive(Debug, Deserialize)]
struct HfSibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<HfLfs>,
}

#[derive(Debug, Deserialize)]
struct HfLfs {
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// One entry of the Hugging Face model search
#[derive(Debug, Deserialize)]
struct HfModelSummary {
    #[serde(alias = "modelId")]
    id: String,
}

/// The Hugging Face search returns at most this many Ollama-compatible models
pub const HF_MODEL_LISTING_LIMIT: usize = 100;

/// A GGUF file in a Hugging Face repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufFile {
    pub file_name: String,
    pub quant: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Turns model references into manifests with a download plan for every blob.
pub struct ManifestResolver {
    client: reqwest::Client,
    registry: Url,
    hf_api: Url,
    timeout: Duration,
}

impl ManifestResolver {
    pub fn new(client: reqwest::Client, config: &Config) -> Result<Self> {
        Ok(Self {
            client,
            registry: config.registry_url()?,
            hf_api: config.hf_api_url()?,
            timeout: config.request_timeout(),
        })
    }

    /// Resolve `source`. A cached tag listing, when present, rejects unknown tags early.
    pub async fn resolve(
        &self,
        source: &ModelSource,
        tags: Option<&TagsCache>,
    ) -> Result<ResolvedManifest> {
        match source {
            ModelSource::Ollama(reference) => {
                if let Some(cache) = tags {
                    cache.check(reference)?;
                }
                self.resolve_registry(source, reference, tags).await
            }
            ModelSource::HuggingFace(reference) => self.resolve_hf(source, reference).await,
        }
    }

    /// Base URL of a model's repository in the registry, with a trailing slash
    fn registry_repo(&self, reference: &ModelReference) -> Result<Url> {
        let relative = if reference.is_library() {
            format!("{}/", reference.name)
        } else {
            // registry_base_url points at the `library/` namespace
            format!("../{}/{}/", reference.namespace, reference.name)
        };
        self.registry
            .join(&relative)
            .map_err(|e| DownloaderError::Config(format!("Bad registry URL for {reference}: {e}")))
    }

    async fn resolve_registry(
        &self,
        source: &ModelSource,
        reference: &ModelReference,
        tags: Option<&TagsCache>,
    ) -> Result<ResolvedManifest> {
        let repo = self.registry_repo(reference)?;
        let url = repo
            .join(&format!("manifests/{}", reference.tag))
            .map_err(|e| DownloaderError::Config(format!("Bad manifest URL for {reference}: {e}")))?;

        tracing::info!(%url, "Fetching manifest for {reference}");
        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, MANIFEST_MEDIA_TYPE)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            if body.contains("NAME_UNKNOWN") {
                return Err(DownloaderError::ModelNotFound(reference.to_string()));
            }
            return Err(DownloaderError::TagNotFound {
                reference: reference.to_string(),
                suggestion: tags
                    .and_then(|cache| cache.get(&reference.name))
                    .and_then(|entry| entry.suggest(&reference.tag))
                    .map(str::to_string),
            });
        }
        if !status.is_success() {
            return Err(DownloaderError::Network(format!("GET {url} returned {status}")));
        }

        let raw = response.bytes().await?.to_vec();
        let manifest = Manifest::parse(reference, &raw)?;
        tracing::debug!(
            layers = manifest.layers.len(),
            total_bytes = manifest.total_size(),
            "Parsed manifest"
        );

        let blob_base = repo
            .join("blobs/")
            .map_err(|e| DownloaderError::Config(format!("Bad blob URL for {reference}: {e}")))?;
        ResolvedManifest::from_registry(source.clone(), &manifest, raw, &blob_base)
    }

    /// GGUF files of a Hugging Face repository, in listing order.
    pub async fn list_gguf_files(&self, org: &str, repo: &str) -> Result<Vec<GgufFile>> {
        let repo_id = format!("{org}/{repo}");
        let mut url = self
            .hf_api
            .join(&format!("api/models/{repo_id}"))
            .map_err(|e| DownloaderError::Config(format!("Bad Hugging Face URL for {repo_id}: {e}")))?;
        url.set_query(Some("blobs=true"));

        tracing::info!(%url, "Fetching repository listing for {repo_id}");
        let response = self.client.get(url.clone()).timeout(self.timeout).send().await?;
        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED) {
            return Err(DownloaderError::ModelNotFound(repo_id));
        }
        if !status.is_success() {
            return Err(DownloaderError::Network(format!("GET {url} returned {status}")));
        }

        let info: HfModelInfo = serde_json::from_slice(&response.bytes().await?)
            .map_err(|e| DownloaderError::manifest_parse(&repo_id, e.to_string()))?;

        let files: Vec<GgufFile> = info
            .siblings
            .into_iter()
            .filter_map(|sibling| {
                let quant = quant_of(&sibling.rfilename)?;
                let lfs = sibling.lfs.unwrap_or(HfLfs {
                    sha256: None,
                    size: None,
                });
                Some(GgufFile {
                    quant,
                    size: sibling.size.or(lfs.size),
                    sha256: lfs.sha256,
                    file_name: sibling.rfilename,
                })
            })
            .collect();

        if files.is_empty() {
            return Err(DownloaderError::UnsupportedRepository(repo_id));
        }
        Ok(files)
    }

    /// Public repositories the Hugging Face hub marks as usable from Ollama, in the
    /// hub's order.
    pub async fn list_hf_models(&self) -> Result<Vec<String>> {
        let mut url = self
            .hf_api
            .join("api/models")
            .map_err(|e| DownloaderError::Config(format!("Bad Hugging Face URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("apps", "ollama")
            .append_pair("gated", "false")
            .append_pair("limit", &HF_MODEL_LISTING_LIMIT.to_string());

        tracing::info!(%url, "Fetching Ollama-compatible models from Hugging Face");
        let response = self.client.get(url.clone()).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloaderError::Network(format!("GET {url} returned {status}")));
        }

        let models: Vec<HfModelSummary> = serde_json::from_slice(&response.bytes().await?)
            .map_err(|e| DownloaderError::manifest_parse("Hugging Face model listing", e.to_string()))?;
        if models.len() >= HF_MODEL_LISTING_LIMIT {
            tracing::warn!(
                "Only the first {HF_MODEL_LISTING_LIMIT} models are listed, browse \
                 https://huggingface.co/models?apps=ollama for the rest"
            );
        }
        Ok(models.into_iter().map(|m| m.id).collect())
    }

    /// Distinct quantisations offered by a Hugging Face repository.
    pub async fn list_hf_quants(&self, org: &str, repo: &str) -> Result<Vec<String>> {
        let files = self.list_gguf_files(org, repo).await?;
        let mut quants: Vec<String> = Vec::with_capacity(files.len());
        for file in files {
            if !quants.contains(&file.quant) {
                quants.push(file.quant);
            }
        }
        Ok(quants)
    }

    async fn resolve_hf(
        &self,
        source: &ModelSource,
        reference: &HfReference,
    ) -> Result<ResolvedManifest> {
        let files = self.list_gguf_files(&reference.org, &reference.repo).await?;
        let Some(file) = files
            .iter()
            .find(|f| f.quant.eq_ignore_ascii_case(&reference.quant))
        else {
            let available: Vec<&str> = files.iter().map(|f| f.quant.as_str()).collect();
            return Err(DownloaderError::ModelNotFound(format!(
                "{reference} (available quantisations: {})",
                available.join(", ")
            )));
        };
        tracing::info!(file = %file.file_name, "Selected GGUF file for {reference}");

        let size = file.size.ok_or_else(|| {
            DownloaderError::manifest_parse(reference, format!("no size reported for {}", file.file_name))
        })?;
        let expected = file
            .sha256
            .as_deref()
            .map(|hex| Digest::parse(&format!("{}{hex}", Digest::PREFIX)))
            .transpose()
            .map_err(|e| DownloaderError::manifest_parse(reference, e.to_string()))?;
        if expected.is_none() {
            tracing::warn!(
                file = %file.file_name,
                "No LFS digest published, the digest will be computed while downloading"
            );
        }

        let mut url = self
            .hf_api
            .join(&format!("{}/resolve/main/", reference.repo_id()))
            .map_err(|e| DownloaderError::Config(format!("Bad Hugging Face URL for {reference}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| DownloaderError::Config("Hugging Face URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(file.file_name.split('/'));

        let config = serde_json::to_vec(&serde_json::json!({
            "model_format": "gguf",
            "file_type": file.quant,
        }))
        .map_err(|e| DownloaderError::manifest_parse(reference, e.to_string()))?;

        let plans = vec![
            BlobPlan {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                expected: Some(Digest::of(&config)),
                size: config.len() as u64,
                source: BlobSource::Inline(config),
            },
            BlobPlan {
                media_type: MODEL_LAYER_MEDIA_TYPE.to_string(),
                expected,
                size,
                source: BlobSource::Remote(url),
            },
        ];
        ResolvedManifest::synthesized(source.clone(), plans)
    }
}

/// Quantisation encoded in a GGUF file name: the stem after its last `-` or `.`.
fn quant_of(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next()?;
    let lower = file_name.to_ascii_lowercase();
    if !lower.ends_with(".gguf") {
        return None;
    }
    let stem = &file_name[..file_name.len() - ".gguf".len()];
    let quant = stem.rsplit(['-', '.']).next()?;
    (!quant.is_empty()).then(|| quant.to_string())
}
