use crate::error::{DownloaderError, Result};
use crate::models::library::LibraryClient;
use crate::models::reference::ModelReference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Cached tag listing for one library model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagsCacheEntry {
    pub model_name: String,
    /// In the order the library lists them
    pub tags: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl TagsCacheEntry {
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Find closest tag using Levenshtein distance
    #[must_use]
    pub fn suggest(&self, tag: &str) -> Option<&str> {
        if tag.is_empty() {
            return None;
        }

        self.tags
            .iter()
            .map(|t| (t.as_str(), levenshtein_distance(tag, t)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(t, _)| t)
    }
}

/// When a tag listing may go to the library instead of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagsRefresh {
    /// Only read the cache
    Never,
    /// Fetch what the cache does not hold yet
    #[default]
    IfMissing,
    /// Fetch even when cached
    Always,
}

/// On-disk model → tags mapping. Only [`TagsCache::refresh`] changes it.
#[derive(Debug)]
pub struct TagsCache {
    path: PathBuf,
    entries: BTreeMap<String, TagsCacheEntry>,
}

impl TagsCache {
    /// Load the cache file; a missing or unreadable file gives an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Ignoring corrupt tags cache: {e}");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Cannot read tags cache: {e}");
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Option<&TagsCacheEntry> {
        self.entries.get(model)
    }

    /// Cached model names, sorted
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject a tag that a cached listing does not contain.
    ///
    /// Models without an entry always pass; the registry has the final word.
    pub fn check(&self, reference: &ModelReference) -> Result<()> {
        if !reference.is_library() {
            return Ok(());
        }
        match self.get(&reference.name) {
            Some(entry) if !entry.contains(&reference.tag) => Err(DownloaderError::TagNotFound {
                reference: reference.to_string(),
                suggestion: entry.suggest(&reference.tag).map(str::to_string),
            }),
            _ => Ok(()),
        }
    }

    /// Fetch fresh listings for `model`, or for every library model, and persist them.
    ///
    /// Returns the names of the refreshed entries.
    pub async fn refresh(
        &mut self,
        library: &LibraryClient,
        model: Option<&str>,
    ) -> Result<Vec<String>> {
        let models = match model {
            Some(name) => vec![name.to_string()],
            None => library.list_models().await?,
        };

        for name in &models {
            let tags = library.list_tags(name).await?;
            tracing::info!(model = %name, count = tags.len(), "Refreshed tags");
            self.entries.insert(
                name.clone(),
                TagsCacheEntry {
                    model_name: name.clone(),
                    tags,
                    last_updated: Utc::now(),
                },
            );
        }

        self.save()?;
        Ok(models)
    }

    /// Write atomically (tmp + rename)
    fn save(&self) -> Result<()> {
        let cache_error = |e: &dyn std::fmt::Display| {
            DownloaderError::Config(format!(
                "Failed to write tags cache {}: {e}",
                self.path.display()
            ))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| cache_error(&e))?;
        }

        let json = serde_json::to_vec_pretty(&self.entries).map_err(|e| cache_error(&e))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(|e| cache_error(&e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| cache_error(&e))?;

        tracing::debug!(path = %self.path.display(), "Saved tags cache");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, model: &str, tags: &[&str]) {
        self.entries.insert(
            model.to_string(),
            TagsCacheEntry {
                model_name: model.to_string(),
                tags: tags.iter().map(|t| (*t).to_string()).collect(),
                last_updated: Utc::now(),
            },
        );
    }
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
