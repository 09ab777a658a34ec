use crate::error::DownloaderError;
use crate::models::reference::ModelSource;
use crate::models::store::ManifestInstall;
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a session or blob failed, without the error's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ModelNotFound,
    TagNotFound,
    UnsupportedRepository,
    ManifestParse,
    InvalidReference,
    Network,
    Timeout,
    DigestMismatch,
    SizeMismatch,
    Install,
    PostVerification,
    Config,
    Cancelled,
}

impl From<&DownloaderError> for FailureKind {
    fn from(err: &DownloaderError) -> Self {
        match err {
            DownloaderError::ModelNotFound(_) => Self::ModelNotFound,
            DownloaderError::TagNotFound { .. } => Self::TagNotFound,
            DownloaderError::UnsupportedRepository(_) => Self::UnsupportedRepository,
            DownloaderError::ManifestParse { .. } => Self::ManifestParse,
            DownloaderError::InvalidReference(_) => Self::InvalidReference,
            DownloaderError::Network(_) => Self::Network,
            DownloaderError::Timeout(_) => Self::Timeout,
            DownloaderError::DigestMismatch { .. } => Self::DigestMismatch,
            DownloaderError::SizeMismatch { .. } => Self::SizeMismatch,
            DownloaderError::Install { .. } => Self::Install,
            DownloaderError::PostVerificationFailed(_) => Self::PostVerification,
            DownloaderError::Config(_) => Self::Config,
            DownloaderError::Cancelled => Self::Cancelled,
        }
    }
}

/// Lifecycle of one download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    ResolvingManifest,
    DownloadingBlobs,
    Verifying,
    Installing,
    PostVerifying,
    Completed,
    Failed(FailureKind),
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Successor on the happy path
    const fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::ResolvingManifest),
            Self::ResolvingManifest => Some(Self::DownloadingBlobs),
            Self::DownloadingBlobs => Some(Self::Verifying),
            Self::Verifying => Some(Self::Installing),
            Self::Installing => Some(Self::PostVerifying),
            Self::PostVerifying => Some(Self::Completed),
            Self::Completed | Self::Failed(_) => None,
        }
    }

    fn can_become(self, target: Self) -> bool {
        match target {
            Self::Failed(_) => !self.is_terminal(),
            _ => self.next() == Some(target),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::ResolvingManifest => f.write_str("resolving manifest"),
            Self::DownloadingBlobs => f.write_str("downloading blobs"),
            Self::Verifying => f.write_str("verifying"),
            Self::Installing => f.write_str("installing"),
            Self::PostVerifying => f.write_str("post-download verification"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(kind) => write!(f, "failed ({kind:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Pending,
    Downloading,
    Verifying,
    Verified,
    Failed(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Digest, or media type while the digest is not yet known
    pub label: String,
    pub state: BlobState,
}

/// Everything one download touched. Only the pipeline mutates it.
#[derive(Debug)]
pub struct DownloadSession {
    source: ModelSource,
    state: SessionState,
    blobs: Vec<BlobEntry>,
    working_dir: Option<PathBuf>,
    installed_blobs: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
    manifest: Option<ManifestInstall>,
}

impl DownloadSession {
    #[must_use]
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            state: SessionState::Pending,
            blobs: Vec::new(),
            working_dir: None,
            installed_blobs: Vec::new(),
            created_dirs: Vec::new(),
            manifest: None,
        }
    }

    #[must_use]
    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `target`; illegal transitions are logged and ignored.
    pub fn transition(&mut self, target: SessionState) -> bool {
        if !self.state.can_become(target) {
            tracing::warn!(from = %self.state, to = %target, "Ignoring illegal session transition");
            return false;
        }
        tracing::debug!(from = %self.state, to = %target, "Session transition");
        self.state = target;
        true
    }

    pub fn fail(&mut self, err: &DownloaderError) -> bool {
        self.transition(SessionState::Failed(FailureKind::from(err)))
    }

    pub fn set_blobs(&mut self, labels: impl IntoIterator<Item = String>) {
        self.blobs = labels
            .into_iter()
            .map(|label| BlobEntry {
                label,
                state: BlobState::Pending,
            })
            .collect();
    }

    pub fn set_blob_state(&mut self, index: usize, state: BlobState) {
        if let Some(entry) = self.blobs.get_mut(index) {
            entry.state = state;
        }
    }

    /// Replace a pending label once the digest is known
    pub fn set_blob_label(&mut self, index: usize, label: String) {
        if let Some(entry) = self.blobs.get_mut(index) {
            entry.label = label;
        }
    }

    #[must_use]
    pub fn blobs(&self) -> &[BlobEntry] {
        &self.blobs
    }

    #[must_use]
    pub fn all_blobs_verified(&self) -> bool {
        self.blobs.iter().all(|b| b.state == BlobState::Verified)
    }

    pub fn set_working_dir(&mut self, dir: PathBuf) {
        self.working_dir = Some(dir);
    }

    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn record_installed_blob(&mut self, path: PathBuf) {
        self.installed_blobs.push(path);
    }

    /// Blobs this session created in the store
    #[must_use]
    pub fn installed_blobs(&self) -> &[PathBuf] {
        &self.installed_blobs
    }

    pub fn record_created_dirs(&mut self, dirs: impl IntoIterator<Item = PathBuf>) {
        self.created_dirs.extend(dirs);
    }

    /// Store directories this session created, outermost first
    #[must_use]
    pub fn created_dirs(&self) -> &[PathBuf] {
        &self.created_dirs
    }

    pub fn record_manifest(&mut self, install: ManifestInstall) {
        self.manifest = Some(install);
    }

    #[must_use]
    pub fn manifest_install(&self) -> Option<&ManifestInstall> {
        self.manifest.as_ref()
    }
}
