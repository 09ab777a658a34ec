use crate::config::Config;
use crate::error::{DownloaderError, Result};
use crate::http::{build_client, cancellable};
use crate::models::download::{format_bytes, BlobDownloader, DownloadedBlob};
use crate::models::library::LibraryClient;
use crate::models::manifest::{BlobPlan, Digest, ResolvedManifest};
use crate::models::recovery::{CleanupReport, ErrorRecoveryManager};
use crate::models::reference::{parse_repo_id, ModelSource};
use crate::models::resolver::ManifestResolver;
use crate::models::server::{ModelCatalog, OllamaServerClient, PostDownloadVerifier};
use crate::models::session::{BlobState, DownloadSession, FailureKind, SessionState};
use crate::models::store::{BlobStatus, InstallOutcome, LocalStore};
use crate::models::tags::{TagsCache, TagsCacheEntry, TagsRefresh};
use crate::models::verify::DigestVerifier;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Result of one download: the finished session and what cleanup did
#[derive(Debug)]
pub struct DownloadOutcome {
    pub session: DownloadSession,
    pub cleanup: CleanupReport,
    pub error: Option<DownloaderError>,
}

impl DownloadOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.session.state() == SessionState::Completed
    }

    pub fn into_result(self) -> Result<DownloadSession> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.session),
        }
    }
}

/// Work left for one blob after checking the store
struct Transfer {
    index: usize,
    dest: PathBuf,
}

/// Drives downloads through resolution, transfer, verification, install and the
/// server's acceptance check.
pub struct ModelManager {
    config: Config,
    store: LocalStore,
    resolver: ManifestResolver,
    library: LibraryClient,
    downloader: BlobDownloader,
    catalog: Arc<dyn ModelCatalog>,
    recovery: ErrorRecoveryManager,
    cancel: CancellationToken,
}

impl ModelManager {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let client = build_client(&config)?;

        let store = LocalStore::new(&config)?;
        Ok(Self {
            recovery: ErrorRecoveryManager::new(
                store.clone(),
                config.ollama_server.remove_downloaded_on_error,
            ),
            store,
            resolver: ManifestResolver::new(client.clone(), &config)?,
            library: LibraryClient::new(client.clone(), &config)?,
            downloader: BlobDownloader::new(client.clone(), &config)?,
            catalog: Arc::new(OllamaServerClient::new(client, &config)?),
            cancel: CancellationToken::new(),
            config,
        })
    }

    /// Replace the server listing used for post-download verification
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.downloader = self.downloader.with_retry_backoff(backoff);
        self
    }

    /// Cancelling this token stops every download in flight
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tags_cache(&self) -> Result<TagsCache> {
        Ok(TagsCache::open(self.config.tags_cache_path()?))
    }

    /// Download, verify and install `source`, then confirm the server sees it.
    ///
    /// Never panics or returns early: the outcome always carries a terminal session and the
    /// cleanup that was applied to it.
    pub async fn download(&self, source: ModelSource) -> DownloadOutcome {
        tracing::info!(model = %source, "Starting download");
        let mut session = DownloadSession::new(source);

        let error = match self.run(&mut session).await {
            Ok(()) => {
                tracing::info!(model = %session.source(), "Download complete");
                None
            }
            Err(e) => {
                tracing::error!(model = %session.source(), category = %e.category(), "Download failed: {e}");
                session.fail(&e);
                Some(e)
            }
        };

        let cleanup = self.recovery.on_terminal(&session);
        DownloadOutcome {
            session,
            cleanup,
            error,
        }
    }

    async fn run(&self, session: &mut DownloadSession) -> Result<()> {
        session.transition(SessionState::ResolvingManifest);
        let tags = self.tags_cache()?;
        let resolved = cancellable(&self.cancel, self.resolver.resolve(session.source(), Some(&tags))).await?;
        session.set_blobs(resolved.plans.iter().map(BlobPlan::label));

        session.transition(SessionState::DownloadingBlobs);
        let created = self.store.ensure_layout()?;
        session.record_created_dirs(created);
        let work = self.store.create_working_dir()?;
        session.set_working_dir(work.clone());

        // Digests only published by the previous install, for plans that defer theirs
        let previous = resolved
            .plans
            .iter()
            .any(|plan| plan.expected.is_none())
            .then(|| self.store.read_manifest(session.source()))
            .flatten();

        let mut digests: Vec<Option<Digest>> = vec![None; resolved.plans.len()];
        let mut repairs: Vec<Option<Digest>> = vec![None; resolved.plans.len()];
        let mut reused = Vec::new();
        let mut transfers = Vec::new();
        let mut needed: u64 = 0;
        for (index, plan) in resolved.plans.iter().enumerate() {
            let known = plan.expected.clone().or_else(|| {
                previous
                    .as_ref()?
                    .blobs()
                    .find(|blob| blob.media_type == plan.media_type && blob.size == plan.size)
                    .map(|blob| blob.digest.clone())
            });
            if let Some(known) = known {
                match self.store.blob_status(&known, plan.size).await? {
                    BlobStatus::Verified => {
                        tracing::info!(digest = %known, "Blob already in store, skipping");
                        session.set_blob_state(index, BlobState::Verified);
                        session.set_blob_label(index, known.to_string());
                        digests[index] = Some(known.clone());
                        reused.push(known);
                        continue;
                    }
                    // Stays readable until the refetched copy replaces it
                    BlobStatus::Corrupt => {
                        tracing::warn!(digest = %known, "Stored blob is corrupt, fetching it again");
                        repairs[index] = Some(known);
                    }
                    BlobStatus::Missing => {}
                }
            }
            needed += plan.size;
            transfers.push(Transfer {
                index,
                dest: work.join(format!("blob-{index}.partial")),
            });
        }

        if !transfers.is_empty() {
            tracing::info!(
                blobs = transfers.len(),
                size = %format_bytes(needed),
                "Downloading {}",
                session.source()
            );
            self.store.check_free_space(needed)?;
        }

        let downloaded = self.transfer_all(session, &resolved, transfers).await?;
        for (index, digest, _) in &downloaded {
            digests[*index] = Some(digest.clone());
            session.set_blob_label(*index, digest.to_string());
        }

        session.transition(SessionState::Verifying);
        let digests: Vec<Digest> = digests.into_iter().flatten().collect();
        if !session.all_blobs_verified() || digests.len() != resolved.plans.len() {
            return Err(DownloaderError::install(
                &work,
                "not every blob was verified before install",
            ));
        }

        session.transition(SessionState::Installing);
        {
            let _lock = self.store.lock()?;
            for digest in &reused {
                let path = self.store.blob_path(digest);
                if !path.is_file() {
                    return Err(DownloaderError::install(
                        &path,
                        "blob was removed by a concurrent cleanup, run the download again",
                    ));
                }
            }
            for (index, digest, blob) in &downloaded {
                if self.cancel.is_cancelled() {
                    return Err(DownloaderError::Cancelled);
                }
                if repairs[*index].as_ref() == Some(digest) {
                    self.store.replace_blob(&blob.path, digest)?;
                } else if self.store.install_blob(&blob.path, digest)? == InstallOutcome::Installed {
                    session.record_installed_blob(self.store.blob_path(digest));
                }
            }
            if self.cancel.is_cancelled() {
                return Err(DownloaderError::Cancelled);
            }
            let manifest = resolved.render(&digests)?;
            let install = self.store.install_manifest(session.source(), &manifest)?;
            session.record_manifest(install);
        }

        session.transition(SessionState::PostVerifying);
        let server_name = session
            .source()
            .server_model_name(&self.config.hugging_face.registry_host);
        PostDownloadVerifier::new(self.catalog.clone(), &self.config)
            .verify(&server_name, &self.cancel)
            .await?;

        session.transition(SessionState::Completed);
        Ok(())
    }

    /// Fetch and verify `transfers` on a bounded pool, in completion order.
    ///
    /// The first failure stops the remaining workers and is returned.
    async fn transfer_all(
        &self,
        session: &mut DownloadSession,
        resolved: &ResolvedManifest,
        transfers: Vec<Transfer>,
    ) -> Result<Vec<(usize, Digest, DownloadedBlob)>> {
        let workers = self.cancel.child_token();
        let (events, mut event_rx) = mpsc::unbounded_channel::<(usize, BlobState)>();

        let mut jobs = futures_util::stream::iter(transfers.into_iter().map(move |transfer| {
            let plan = &resolved.plans[transfer.index];
            let events = events.clone();
            let workers = workers.clone();
            async move {
                let index = transfer.index;
                // The receiver outlives every worker
                let _ = events.send((index, BlobState::Downloading));
                let result = async {
                    let blob = self.downloader.download(plan, &transfer.dest, &workers).await?;
                    let _ = events.send((index, BlobState::Verifying));
                    let digest = DigestVerifier::verify(plan.expected.as_ref(), &blob).await?;
                    Ok::<_, DownloaderError>((digest, blob))
                }
                .await;

                match &result {
                    Ok(_) => {
                        let _ = events.send((index, BlobState::Verified));
                    }
                    Err(e) => {
                        let _ = events.send((index, BlobState::Failed(FailureKind::from(e))));
                        workers.cancel();
                    }
                }
                (index, result)
            }
        }))
        .buffer_unordered(self.config.ollama_library.max_concurrent_downloads);

        let mut downloaded = Vec::new();
        let mut first_error: Option<DownloaderError> = None;
        while let Some((index, result)) = jobs.next().await {
            while let Ok((blob, state)) = event_rx.try_recv() {
                session.set_blob_state(blob, state);
            }
            match result {
                Ok((digest, blob)) => downloaded.push((index, digest, blob)),
                // A sibling's failure is the cause, not the cancellation it triggered
                Err(e) => match &first_error {
                    None | Some(DownloaderError::Cancelled) => first_error = Some(e),
                    Some(_) => {}
                },
            }
        }
        while let Ok((blob, state)) = event_rx.try_recv() {
            session.set_blob_state(blob, state);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(downloaded),
        }
    }

    /// Model names on the library index
    pub async fn list_library_models(&self) -> Result<Vec<String>> {
        cancellable(&self.cancel, self.library.list_models()).await
    }

    /// Tag listings for `model`, or for every cached model.
    ///
    /// Whether the library is asked first depends on `refresh`. With
    /// [`TagsRefresh::Never`] a model missing from the cache yields no entries.
    pub async fn list_tags(
        &self,
        model: Option<&str>,
        refresh: TagsRefresh,
    ) -> Result<Vec<TagsCacheEntry>> {
        let mut cache = self.tags_cache()?;
        let missing = match model {
            Some(name) => cache.get(name).is_none(),
            None => cache.is_empty(),
        };
        let fetch = match refresh {
            TagsRefresh::Never => false,
            TagsRefresh::IfMissing => missing,
            TagsRefresh::Always => true,
        };
        if fetch {
            cancellable(&self.cancel, cache.refresh(&self.library, model)).await?;
        } else if missing {
            tracing::warn!(cache = %cache.path().display(), "No cached tags, run with --update to fetch them");
        }

        let entries = match model {
            Some(name) => cache
                .get(name)
                .cloned()
                .into_iter()
                .collect(),
            None => cache
                .models()
                .filter_map(|name| cache.get(name).cloned())
                .collect(),
        };
        Ok(entries)
    }

    /// Hugging Face repositories that can be pulled into Ollama
    pub async fn list_hf_models(&self) -> Result<Vec<String>> {
        cancellable(&self.cancel, self.resolver.list_hf_models()).await
    }

    /// Quantisations available in a Hugging Face repository (`org/repo`)
    pub async fn list_hf_quants(&self, repo_id: &str) -> Result<Vec<String>> {
        let (org, repo) = parse_repo_id(repo_id)
            .ok_or_else(|| DownloaderError::InvalidReference(repo_id.to_string()))?;
        cancellable(&self.cancel, self.resolver.list_hf_quants(&org, &repo)).await
    }
}
