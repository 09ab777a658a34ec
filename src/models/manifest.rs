use crate::error::{DownloaderError, Result};
use crate::models::reference::ModelSource;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Media type of registry image manifests
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Media type of the model config blob
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// Media type of the model weights layer
pub const MODEL_LAYER_MEDIA_TYPE: &str = "application/vnd.ollama.image.model";

/// A validated `sha256:<64 hex>` content digest, hex in lower case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid digest '{0}': expected sha256:<64 hex chars>")]
pub struct InvalidDigest(pub String);

impl Digest {
    pub const PREFIX: &'static str = "sha256:";

    pub fn parse(raw: &str) -> std::result::Result<Self, InvalidDigest> {
        let hex = raw
            .strip_prefix(Self::PREFIX)
            .or_else(|| raw.strip_prefix("sha256-"))
            .ok_or_else(|| InvalidDigest(raw.to_string()))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidDigest(raw.to_string()));
        }
        Ok(Self(format!("{}{}", Self::PREFIX, hex.to_ascii_lowercase())))
    }

    /// Digest of an in-memory buffer
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finish an incremental SHA-256 computation
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{}{}", Self::PREFIX, hex::encode(hasher.finalize())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0[Self::PREFIX.len()..]
    }

    /// Name of the blob in the store: `sha256-<hex>`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("sha256-{}", self.hex())
    }

    /// Abbreviated form for progress bars
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}...{}", &self.0[..11], &self.0[self.0.len() - 4..])
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One content blob as listed in a manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

/// Registry image manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: BlobDescriptor,
    pub layers: Vec<BlobDescriptor>,
}

impl Manifest {
    /// Decode and validate a manifest served for `reference`.
    pub fn parse(reference: impl fmt::Display, bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| DownloaderError::manifest_parse(&reference, e.to_string()))?;

        if manifest.layers.is_empty() {
            return Err(DownloaderError::manifest_parse(
                &reference,
                "manifest lists no layers",
            ));
        }

        Ok(manifest)
    }

    /// Config blob first, then layers in manifest order
    pub fn blobs(&self) -> impl Iterator<Item = &BlobDescriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.blobs().map(|b| b.size).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DownloaderError::manifest_parse("synthesized manifest", e.to_string()))
    }
}

/// Where the bytes of a blob come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    Remote(Url),
    /// Generated locally, e.g. the config blob of a Hugging Face model
    Inline(Vec<u8>),
}

/// A blob the pipeline has to make present in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPlan {
    pub media_type: String,
    /// `None` when the host does not publish a digest; the computed one is then trusted
    pub expected: Option<Digest>,
    pub size: u64,
    pub source: BlobSource,
}

impl BlobPlan {
    #[must_use]
    pub fn label(&self) -> String {
        match &self.expected {
            Some(digest) => digest.to_string(),
            None => format!("{} (digest pending)", self.media_type),
        }
    }
}

/// How the final manifest bytes are produced
#[derive(Debug, Clone, PartialEq, Eq)]
enum ManifestBody {
    /// Registry bytes, stored verbatim
    Raw(Vec<u8>),
    /// Built from the plans once every digest is known
    Synthesized,
}

/// A manifest plus everything needed to fetch its blobs
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub source: ModelSource,
    /// Config blob first, then layers
    pub plans: Vec<BlobPlan>,
    body: ManifestBody,
}

impl ResolvedManifest {
    /// From a registry manifest whose blobs live under `blob_base`
    pub fn from_registry(
        source: ModelSource,
        manifest: &Manifest,
        raw: Vec<u8>,
        blob_base: &Url,
    ) -> Result<Self> {
        let plans = manifest
            .blobs()
            .map(|descriptor| {
                // `sha256:...` would parse as a URL scheme under `Url::join`
                let mut url = blob_base.clone();
                url.path_segments_mut()
                    .map_err(|()| {
                        DownloaderError::manifest_parse(&source, "registry URL cannot hold a path")
                    })?
                    .pop_if_empty()
                    .push(descriptor.digest.as_str());
                Ok(BlobPlan {
                    media_type: descriptor.media_type.clone(),
                    expected: Some(descriptor.digest.clone()),
                    size: descriptor.size,
                    source: BlobSource::Remote(url),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source,
            plans,
            body: ManifestBody::Raw(raw),
        })
    }

    /// From locally built plans; `plans[0]` is the config blob
    pub fn synthesized(source: ModelSource, plans: Vec<BlobPlan>) -> Result<Self> {
        if plans.len() < 2 {
            return Err(DownloaderError::manifest_parse(
                &source,
                "a manifest needs a config blob and at least one layer",
            ));
        }
        Ok(Self {
            source,
            plans,
            body: ManifestBody::Synthesized,
        })
    }

    /// Final manifest bytes given the verified digest of every plan, in plan order.
    pub fn render(&self, digests: &[Digest]) -> Result<Vec<u8>> {
        if digests.len() != self.plans.len() {
            return Err(DownloaderError::manifest_parse(
                &self.source,
                format!("{} digests for {} blobs", digests.len(), self.plans.len()),
            ));
        }

        match &self.body {
            ManifestBody::Raw(raw) => Ok(raw.clone()),
            ManifestBody::Synthesized => {
                let mut descriptors = self.plans.iter().zip(digests).map(|(plan, digest)| {
                    BlobDescriptor {
                        media_type: plan.media_type.clone(),
                        digest: digest.clone(),
                        size: plan.size,
                        urls: None,
                    }
                });
                let config = descriptors.next().ok_or_else(|| {
                    DownloaderError::manifest_parse(&self.source, "missing config blob")
                })?;
                Manifest {
                    schema_version: 2,
                    media_type: MANIFEST_MEDIA_TYPE.to_string(),
                    config,
                    layers: descriptors.collect(),
                }
                .to_json()
            }
        }
    }
}
