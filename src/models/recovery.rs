use crate::models::session::{DownloadSession, SessionState};
use crate::models::store::LocalStore;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// What happened to a session's artifacts once it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReport {
    /// Nothing was left behind
    Nothing,
    /// Paths deleted, or restored to their previous content
    Removed(Vec<PathBuf>),
    /// Paths left in place because cleanup is disabled
    Retained(Vec<PathBuf>),
}

/// Applies the cleanup policy when a session reaches a terminal state.
///
/// Only artifacts recorded in the session are touched, so content that was in the store
/// before the session started always survives. A blob the session installed also stays
/// when another manifest has come to reference it since.
#[derive(Debug, Clone)]
pub struct ErrorRecoveryManager {
    store: LocalStore,
    remove_on_error: bool,
}

impl ErrorRecoveryManager {
    #[must_use]
    pub fn new(store: LocalStore, remove_on_error: bool) -> Self {
        Self {
            store,
            remove_on_error,
        }
    }

    pub fn on_terminal(&self, session: &DownloadSession) -> CleanupReport {
        match session.state() {
            SessionState::Completed => {
                if let Some(dir) = session.working_dir() {
                    remove_dir_logged(dir);
                }
                CleanupReport::Nothing
            }
            SessionState::Failed(kind) if self.remove_on_error => {
                tracing::info!(reason = ?kind, "Removing artifacts of failed download");
                report(CleanupReport::Removed, self.remove_artifacts(session))
            }
            SessionState::Failed(kind) => {
                let retained = artifacts(session);
                for path in &retained {
                    tracing::warn!(reason = ?kind, path = %path.display(), "Retaining artifact of failed download");
                }
                report(CleanupReport::Retained, retained)
            }
            state => {
                tracing::warn!(%state, "Cleanup requested for a session that has not ended");
                CleanupReport::Nothing
            }
        }
    }
}

fn report(variant: fn(Vec<PathBuf>) -> CleanupReport, paths: Vec<PathBuf>) -> CleanupReport {
    if paths.is_empty() {
        CleanupReport::Nothing
    } else {
        variant(paths)
    }
}

fn artifacts(session: &DownloadSession) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = session.working_dir().filter(|d| d.exists()) {
        paths.push(dir.to_path_buf());
    }
    paths.extend(session.installed_blobs().iter().filter(|p| p.exists()).cloned());
    if let Some(install) = session.manifest_install() {
        paths.push(install.path.clone());
    }
    paths
}

impl ErrorRecoveryManager {
    fn remove_artifacts(&self, session: &DownloadSession) -> Vec<PathBuf> {
        let mut removed = Vec::new();

        if let Some(dir) = session.working_dir() {
            if remove_dir_logged(dir) {
                removed.push(dir.to_path_buf());
            }
        }

        // The manifest goes first so it no longer counts as a reference below
        if let Some(install) = session.manifest_install() {
            let result = match &install.previous {
                Some(previous) => restore(&install.path, previous),
                None => fs::remove_file(&install.path),
            };
            match result {
                Ok(()) => removed.push(install.path.clone()),
                Err(e) => tracing::warn!(path = %install.path.display(), "Failed to undo manifest: {e}"),
            }
        }

        if !session.installed_blobs().is_empty() {
            removed.extend(self.remove_unreferenced_blobs(session.installed_blobs()));
        }

        // Innermost first; a directory something else now uses stays
        let manifest_dirs = session
            .manifest_install()
            .map(|install| install.created_dirs.as_slice())
            .unwrap_or_default();
        for dir in manifest_dirs.iter().rev().chain(session.created_dirs().iter().rev()) {
            if fs::remove_dir(dir).is_ok() {
                removed.push(dir.clone());
            }
        }

        removed
    }

    fn remove_unreferenced_blobs(&self, blobs: &[PathBuf]) -> Vec<PathBuf> {
        let _lock = match self.store.lock() {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!("Keeping installed blobs, store is not lockable: {e}");
                return Vec::new();
            }
        };
        let referenced = match self.store.referenced_blobs() {
            Ok(referenced) => referenced,
            Err(e) => {
                tracing::warn!("Keeping installed blobs, manifests are not readable: {e}");
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for blob in blobs {
            if referenced.contains(blob) {
                tracing::info!(path = %blob.display(), "Keeping blob referenced by another manifest");
                continue;
            }
            match fs::remove_file(blob) {
                Ok(()) => removed.push(blob.clone()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %blob.display(), "Failed to remove blob: {e}"),
            }
        }
        removed
    }
}

fn restore(path: &Path, previous: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(previous)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_dir_logged(dir: &Path) -> bool {
    match fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %dir.display(), "Failed to remove working directory: {e}");
            false
        }
    }
}
