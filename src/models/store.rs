use crate::config::Config;
use crate::error::{DownloaderError, Result};
use crate::models::manifest::{Digest, Manifest};
use crate::models::reference::ModelSource;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{Gid, Group, Uid, User};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Mode applied to blobs when an owner is configured
const BLOB_MODE: u32 = 0o640;

/// State of a blob under its final name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStatus {
    Missing,
    Verified,
    /// Present but with the wrong size or content
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
}

/// What installing a manifest changed, so it can be undone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestInstall {
    pub path: PathBuf,
    /// Bytes the manifest had before it was overwritten
    pub previous: Option<Vec<u8>>,
    /// Directories created for it, outermost first
    pub created_dirs: Vec<PathBuf>,
}

/// Blob references of a stored manifest, read leniently
#[derive(Debug, Deserialize)]
struct ManifestRefs {
    config: Option<BlobRef>,
    #[serde(default)]
    layers: Vec<BlobRef>,
}

#[derive(Debug, Deserialize)]
struct BlobRef {
    digest: String,
}

/// Exclusive hold on the store's `blobs/` directory, released on drop.
///
/// Taken while a session publishes blobs and a manifest, and while a failed session
/// removes blobs, so a blob is never removed between being counted on and referenced.
pub struct StoreLock {
    _lock: Flock<fs::File>,
}

/// Content-addressable model store:
///
/// ```text
/// <root>/blobs/sha256-<hex>
/// <root>/manifests/<registry host>/<namespace>/<model>/<tag>
/// <root>/manifests/hf.co/<org>/<repo>/<quant>
/// ```
///
/// Files only ever appear under their final name fully written.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    registry_host: String,
    hf_host: String,
    owner: Option<(Uid, Gid)>,
}

impl LocalStore {
    pub fn new(config: &Config) -> Result<Self> {
        let registry = config.registry_url()?;
        let registry_host = match (registry.host_str(), registry.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(DownloaderError::Config(
                    "ollama_library.registry_base_url has no host".to_string(),
                ))
            }
        };

        let owner = match &config.ollama_library.user_group {
            Some((user, group)) => Some(resolve_owner(user, group)?),
            None => None,
        };

        Ok(Self {
            root: config.models_path()?,
            registry_host,
            hf_host: config.hugging_face.registry_host.clone(),
            owner,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    #[must_use]
    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.file_name())
    }

    #[must_use]
    pub fn manifest_path(&self, source: &ModelSource) -> PathBuf {
        let mut path = self.manifests_dir();
        path.extend(source.manifest_segments(&self.registry_host, &self.hf_host));
        path
    }

    /// Create `blobs/` and `manifests/` under the root.
    ///
    /// Returns the directories that did not exist before, outermost first.
    pub fn ensure_layout(&self) -> Result<Vec<PathBuf>> {
        let mut created = self.create_dirs(&self.blobs_dir())?;
        created.extend(self.create_dirs(&self.manifests_dir())?);
        Ok(created)
    }

    /// `create_dir_all` that reports what it created, outermost first
    fn create_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut created: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
            .map(Path::to_path_buf)
            .collect();
        created.reverse();
        fs::create_dir_all(dir).map_err(|e| DownloaderError::install(dir, e))?;
        for dir in &created {
            self.apply_ownership(dir, None)?;
        }
        Ok(created)
    }

    /// Block until no other session is publishing to or cleaning up this store.
    pub fn lock(&self) -> Result<StoreLock> {
        let dir = self.blobs_dir();
        let handle = fs::File::open(&dir).map_err(|e| DownloaderError::install(&dir, e))?;
        let lock = Flock::lock(handle, FlockArg::LockExclusive)
            .map_err(|(_, errno)| DownloaderError::install(&dir, format!("cannot lock store: {errno}")))?;
        Ok(StoreLock { _lock: lock })
    }

    /// Blob paths referenced by any manifest in the store.
    ///
    /// Files that are not manifests are skipped.
    pub fn referenced_blobs(&self) -> Result<HashSet<PathBuf>> {
        let mut referenced = HashSet::new();
        let mut pending = vec![self.manifests_dir()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DownloaderError::install(&dir, e)),
            };
            for entry in entries {
                let path = entry.map_err(|e| DownloaderError::install(&dir, e))?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let refs = fs::read(&path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<ManifestRefs>(&bytes).ok());
                let Some(refs) = refs else {
                    tracing::debug!(path = %path.display(), "Skipping unreadable manifest");
                    continue;
                };
                for blob in refs.config.into_iter().chain(refs.layers) {
                    if let Ok(digest) = Digest::parse(&blob.digest) {
                        referenced.insert(self.blob_path(&digest));
                    }
                }
            }
        }
        Ok(referenced)
    }

    /// The manifest currently installed for `source`, if it can be read.
    #[must_use]
    pub fn read_manifest(&self, source: &ModelSource) -> Option<Manifest> {
        let path = self.manifest_path(source);
        let bytes = fs::read(&path).ok()?;
        match Manifest::parse(source, &bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::debug!(path = %path.display(), "Ignoring installed manifest: {e}");
                None
            }
        }
    }

    /// Check the blob stored for `digest`, hashing it off the async runtime.
    pub async fn blob_status(&self, digest: &Digest, size: u64) -> Result<BlobStatus> {
        let path = self.blob_path(digest);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BlobStatus::Missing),
            Err(e) => return Err(DownloaderError::install(&path, e)),
        };
        if !metadata.is_file() || metadata.len() != size {
            return Ok(BlobStatus::Corrupt);
        }

        let hash_path = path.clone();
        let actual = tokio::task::spawn_blocking(move || hash_file(&hash_path))
            .await
            .map_err(|e| DownloaderError::install(&path, e))?
            .map_err(|e| DownloaderError::install(&path, e))?;

        Ok(if &actual == digest {
            BlobStatus::Verified
        } else {
            BlobStatus::Corrupt
        })
    }

    pub async fn has_verified_blob(&self, digest: &Digest, size: u64) -> Result<bool> {
        Ok(self.blob_status(digest, size).await? == BlobStatus::Verified)
    }

    /// Fresh per-session directory for partial downloads, on the same filesystem as the
    /// store so installs are plain renames.
    pub fn create_working_dir(&self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&self.root)
            .map_err(|e| DownloaderError::install(&self.root, e))?;
        Ok(dir.keep())
    }

    /// Move a verified temp file to `blobs/<digest>` unless that name already exists.
    ///
    /// The temp file is consumed either way. An existing blob is never overwritten.
    pub fn install_blob(&self, temp: &Path, digest: &Digest) -> Result<InstallOutcome> {
        let dest = self.blob_path(digest);
        self.apply_ownership(temp, Some(BLOB_MODE))?;

        let outcome = match fs::hard_link(temp, &dest) {
            Ok(()) => InstallOutcome::Installed,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => InstallOutcome::AlreadyPresent,
            Err(e) => {
                tracing::debug!("Hard link failed ({e}), falling back to rename");
                if dest.exists() {
                    InstallOutcome::AlreadyPresent
                } else {
                    fs::rename(temp, &dest).map_err(|e| DownloaderError::install(&dest, e))?;
                    tracing::info!(%digest, path = %dest.display(), "Installed blob");
                    return Ok(InstallOutcome::Installed);
                }
            }
        };

        if let Err(e) = fs::remove_file(temp) {
            tracing::warn!(path = %temp.display(), "Failed to remove temp file: {e}");
        }
        match outcome {
            InstallOutcome::Installed => {
                tracing::info!(%digest, path = %dest.display(), "Installed blob");
            }
            InstallOutcome::AlreadyPresent => {
                tracing::debug!(%digest, "Blob already present");
            }
        }
        Ok(outcome)
    }

    /// Put a verified temp file over a corrupt blob in one rename.
    ///
    /// Readers see either the old file or the repaired one, never a missing blob.
    pub fn replace_blob(&self, temp: &Path, digest: &Digest) -> Result<()> {
        let dest = self.blob_path(digest);
        self.apply_ownership(temp, Some(BLOB_MODE))?;
        fs::rename(temp, &dest).map_err(|e| DownloaderError::install(&dest, e))?;
        tracing::info!(%digest, path = %dest.display(), "Replaced corrupt blob");
        Ok(())
    }

    /// Write the manifest for `source` atomically (tmp + rename).
    pub fn install_manifest(&self, source: &ModelSource, bytes: &[u8]) -> Result<ManifestInstall> {
        let path = self.manifest_path(source);
        let parent = path
            .parent()
            .ok_or_else(|| DownloaderError::install(&path, "manifest path has no parent"))?;

        let created_dirs = self.create_dirs(parent)?;

        let previous = match fs::read(&path) {
            Ok(previous) => Some(previous),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(DownloaderError::install(&path, e)),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| DownloaderError::install(parent, e))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| DownloaderError::install(tmp.path(), e))?;
        self.apply_ownership(tmp.path(), None)?;
        tmp.persist(&path)
            .map_err(|e| DownloaderError::install(&path, e.error))?;

        tracing::info!(path = %path.display(), replaced = previous.is_some(), "Installed manifest");
        Ok(ManifestInstall {
            path,
            previous,
            created_dirs,
        })
    }

    /// Fail early when the store's filesystem cannot hold `required` more bytes.
    pub fn check_free_space(&self, required: u64) -> Result<()> {
        let stats = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| DownloaderError::install(&self.root, format!("Failed to check disk space: {e}")))?;

        #[allow(clippy::unnecessary_cast)]
        let available = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        if available < required {
            return Err(DownloaderError::install(
                &self.root,
                format!(
                    "Not enough disk space: {} required, {} available",
                    crate::models::download::format_bytes(required),
                    crate::models::download::format_bytes(available)
                ),
            ));
        }
        Ok(())
    }

    fn apply_ownership(&self, path: &Path, mode: Option<u32>) -> Result<()> {
        let Some((uid, gid)) = self.owner else {
            return Ok(());
        };
        nix::unistd::chown(path, Some(uid), Some(gid))
            .map_err(|e| DownloaderError::install(path, format!("chown failed: {e}")))?;
        if let Some(mode) = mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| DownloaderError::install(path, e))?;
        }
        Ok(())
    }
}

fn resolve_owner(user: &str, group: &str) -> Result<(Uid, Gid)> {
    let uid = User::from_name(user)
        .map_err(|e| DownloaderError::Config(format!("Cannot look up user '{user}': {e}")))?
        .ok_or_else(|| DownloaderError::Config(format!("Unknown user '{user}' in user_group")))?
        .uid;
    let gid = Group::from_name(group)
        .map_err(|e| DownloaderError::Config(format!("Cannot look up group '{group}': {e}")))?
        .ok_or_else(|| DownloaderError::Config(format!("Unknown group '{group}' in user_group")))?
        .gid;
    Ok((uid, gid))
}

fn hash_file(path: &Path) -> io::Result<Digest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(Digest::from_hasher(hasher))
}
