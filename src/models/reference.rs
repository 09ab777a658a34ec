use crate::error::{DownloaderError, Result};
use std::fmt;
use std::str::FromStr;

/// Tag assumed when a reference omits one
pub const DEFAULT_TAG: &str = "latest";

/// Namespace of the official Ollama library
pub const LIBRARY_NAMESPACE: &str = "library";

/// A model in the Ollama registry: `[namespace/]name[:tag]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelReference {
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl ModelReference {
    #[must_use]
    pub fn is_library(&self) -> bool {
        self.namespace == LIBRARY_NAMESPACE
    }
}

impl FromStr for ModelReference {
    type Err = DownloaderError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || DownloaderError::InvalidReference(raw.to_string());
        let trimmed = raw.trim();

        let (path, tag) = match trimmed.rsplit_once(':') {
            Some((path, tag)) => (path, tag),
            None => (trimmed, DEFAULT_TAG),
        };
        if !is_valid_segment(tag) {
            return Err(invalid());
        }

        let (namespace, name) = match path.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => (LIBRARY_NAMESPACE, path),
        };
        if !is_valid_segment(namespace) || !is_valid_segment(name) {
            return Err(invalid());
        }

        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_library() {
            write!(f, "{}:{}", self.name, self.tag)
        } else {
            write!(f, "{}/{}:{}", self.namespace, self.name, self.tag)
        }
    }
}

/// A GGUF model on Hugging Face: `org/repo:quant`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HfReference {
    pub org: String,
    pub repo: String,
    pub quant: String,
}

impl HfReference {
    /// `org/repo`
    #[must_use]
    pub fn repo_id(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }
}

impl FromStr for HfReference {
    type Err = DownloaderError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || DownloaderError::InvalidReference(raw.to_string());
        let trimmed = raw.trim();
        // Accept the form Ollama itself prints, e.g. hf.co/org/repo:quant
        let trimmed = trimmed
            .strip_prefix("hf.co/")
            .or_else(|| trimmed.strip_prefix("huggingface.co/"))
            .unwrap_or(trimmed);

        let (repo_id, quant) = trimmed.rsplit_once(':').ok_or_else(invalid)?;
        let (org, repo) = parse_repo_id(repo_id).ok_or_else(invalid)?;
        if !is_valid_segment(quant) {
            return Err(invalid());
        }

        Ok(Self {
            org,
            repo,
            quant: quant.to_string(),
        })
    }
}

impl fmt::Display for HfReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.org, self.repo, self.quant)
    }
}

/// Where a model comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSource {
    Ollama(ModelReference),
    HuggingFace(HfReference),
}

impl ModelSource {
    /// Path segments of the manifest below `manifests/`
    #[must_use]
    pub fn manifest_segments(&self, registry_host: &str, hf_host: &str) -> [String; 4] {
        match self {
            Self::Ollama(r) => [
                registry_host.to_string(),
                r.namespace.clone(),
                r.name.clone(),
                r.tag.clone(),
            ],
            Self::HuggingFace(r) => [
                hf_host.to_string(),
                r.org.clone(),
                r.repo.clone(),
                r.quant.clone(),
            ],
        }
    }

    /// Name the Ollama server lists the model under once installed
    #[must_use]
    pub fn server_model_name(&self, hf_host: &str) -> String {
        match self {
            Self::Ollama(r) => r.to_string(),
            Self::HuggingFace(r) => format!("{hf_host}/{r}"),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama(r) => r.fmt(f),
            Self::HuggingFace(r) => r.fmt(f),
        }
    }
}

/// Split `org/repo`, rejecting anything else.
pub fn parse_repo_id(raw: &str) -> Option<(String, String)> {
    let (org, repo) = raw.trim().split_once('/')?;
    if is_valid_segment(org) && is_valid_segment(repo) {
        Some((org.to_string(), repo.to_string()))
    } else {
        None
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
