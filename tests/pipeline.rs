use async_trait::async_trait;
use ollama_downloader::config::Config;
use ollama_downloader::error::DownloaderError;
use ollama_downloader::models::{
    CleanupReport, Digest, FailureKind, ModelCatalog, ModelManager, ModelSource, ServerModel,
    SessionState,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate, Times};

const CONFIG_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const MODEL_TYPE: &str = "application/vnd.ollama.image.model";
const TEMPLATE_TYPE: &str = "application/vnd.ollama.image.template";

/// A model as the registry serves it
struct Published {
    config: Vec<u8>,
    layers: Vec<(&'static str, Vec<u8>)>,
}

impl Published {
    fn new() -> Self {
        Self {
            config: br#"{"model_format":"gguf","model_family":"llama"}"#.to_vec(),
            layers: vec![
                (MODEL_TYPE, vec![0xAA; 1024]),
                (TEMPLATE_TYPE, b"{{ .Prompt }}".to_vec()),
            ],
        }
    }

    fn manifest(&self) -> Vec<u8> {
        let descriptor = |media_type: &str, data: &[u8]| {
            serde_json::json!({
                "mediaType": media_type,
                "digest": Digest::of(data).to_string(),
                "size": data.len(),
            })
        };
        serde_json::to_vec_pretty(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": descriptor(CONFIG_TYPE, &self.config),
            "layers": self.layers.iter().map(|(t, d)| descriptor(t, d)).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    fn blobs(&self) -> Vec<&[u8]> {
        std::iter::once(self.config.as_slice())
            .chain(self.layers.iter().map(|(_, d)| d.as_slice()))
            .collect()
    }
}

fn test_config(temp_dir: &TempDir, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.ollama_server.url = server.uri();
    config.ollama_server.verify_attempts = 2;
    config.ollama_server.verify_interval_secs = 0;
    config.ollama_library.models_path = temp_dir.path().join("models").to_string_lossy().into_owned();
    config.ollama_library.models_tags_cache =
        temp_dir.path().join("models_tags.json").to_string_lossy().into_owned();
    config.ollama_library.registry_base_url = format!("{}/v2/library/", server.uri());
    config.ollama_library.library_base_url = format!("{}/library/", server.uri());
    config.ollama_library.timeout = 5.0;
    config.ollama_library.max_concurrent_downloads = 2;
    config.ollama_library.max_retries = 1;
    config
}

fn manager(config: Config) -> ModelManager {
    ModelManager::new(config)
        .unwrap()
        .with_retry_backoff(Duration::from_millis(10))
}

fn llama() -> ModelSource {
    ModelSource::Ollama("llama3.1:8b".parse().unwrap())
}

async fn mount_manifest(server: &MockServer, manifest: Vec<u8>) {
    mount_tag_manifest(server, "8b", manifest).await;
}

async fn mount_tag_manifest(server: &MockServer, tag: &str, manifest: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/library/llama3.1/manifests/{tag}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest))
        .mount(server)
        .await;
}

async fn mount_blob(
    server: &MockServer,
    digest: &Digest,
    body: Vec<u8>,
    expected_calls: impl Into<Times>,
) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/library/llama3.1/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_server_listing(server: &MockServer, names: &[&str]) {
    let models: Vec<_> = names
        .iter()
        .map(|n| serde_json::json!({"name": n, "model": n}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "models": models })))
        .mount(server)
        .await;
}

async fn mount_published(server: &MockServer, model: &Published, expected_calls: u64) {
    mount_manifest(server, model.manifest()).await;
    for blob in model.blobs() {
        mount_blob(server, &Digest::of(blob), blob.to_vec(), expected_calls).await;
    }
}

fn working_dirs(root: &Path) -> Vec<String> {
    fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(".download-"))
                .collect()
        })
        .unwrap_or_default()
}

/// Every path under `root`, relative and sorted
fn tree(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path.clone());
            }
            paths.push(path.strip_prefix(root).unwrap().to_path_buf());
        }
    }
    paths.sort();
    paths
}

/// Server listing that parks until released, then never lists anything
struct HeldCatalog {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ModelCatalog for HeldCatalog {
    async fn list_models(&self) -> ollama_downloader::Result<Vec<ServerModel>> {
        self.reached.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_fresh_download_installs_blobs_and_manifest() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    mount_published(&server, &model, 1).await;
    mount_server_listing(&server, &["llama3.1:8b"]).await;

    let manager = manager(test_config(&temp_dir, &server));
    let outcome = manager.download(llama()).await;

    assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);
    assert_eq!(outcome.session.state(), SessionState::Completed);
    assert_eq!(outcome.cleanup, CleanupReport::Nothing);

    let store = manager.store();
    for blob in model.blobs() {
        let digest = Digest::of(blob);
        let installed = fs::read(store.blob_path(&digest)).unwrap();
        assert_eq!(installed, blob);
        // Content addressing: the file name is the hash of its bytes
        assert_eq!(Digest::of(&installed), digest);
    }

    let manifest = fs::read(store.manifest_path(&llama())).unwrap();
    assert_eq!(manifest, model.manifest(), "manifest must be stored byte-for-byte");
    assert!(working_dirs(store.root()).is_empty());
}

#[tokio::test]
async fn test_second_download_transfers_nothing() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    // Each blob may be fetched once across both runs
    mount_published(&server, &model, 1).await;
    mount_server_listing(&server, &["llama3.1:8b"]).await;

    let manager = manager(test_config(&temp_dir, &server));
    assert!(manager.download(llama()).await.is_completed());

    let outcome = manager.download(llama()).await;
    assert!(outcome.is_completed());
    assert!(outcome.session.installed_blobs().is_empty());
    assert_eq!(
        outcome.session.manifest_install().unwrap().previous.as_deref(),
        Some(model.manifest().as_slice())
    );
}

#[tokio::test]
async fn test_digest_mismatch_fails_and_leaves_no_blob() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published {
        config: b"{}".to_vec(),
        layers: vec![(MODEL_TYPE, vec![0xAA; 1024])],
    };
    let layer_digest = Digest::of(&model.layers[0].1);
    mount_manifest(&server, model.manifest()).await;
    // May be cancelled before it is requested
    mount_blob(&server, &Digest::of(&model.config), model.config.clone(), 0..=1).await;
    // Same length, different bytes
    mount_blob(&server, &layer_digest, vec![0xBB; 1024], 1).await;

    let manager = manager(test_config(&temp_dir, &server));
    let outcome = manager.download(llama()).await;

    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::DigestMismatch)
    );
    match &outcome.error {
        Some(DownloaderError::DigestMismatch { wanted, got }) => {
            assert_eq!(wanted, &layer_digest.to_string());
            assert_eq!(got, &Digest::of(&[0xBB; 1024]).to_string());
        }
        other => panic!("expected DigestMismatch, got {other:?}"),
    }

    let store = manager.store();
    assert!(!store.blob_path(&layer_digest).exists());
    assert!(!store.manifest_path(&llama()).exists());
    assert!(working_dirs(store.root()).is_empty());
}

#[tokio::test]
async fn test_cleanup_keeps_preexisting_blobs() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    let config_digest = Digest::of(&model.config);
    mount_manifest(&server, model.manifest()).await;
    mount_blob(&server, &config_digest, model.config.clone(), 0).await;
    for (_, data) in &model.layers {
        mount_blob(&server, &Digest::of(data), vec![0u8; data.len()], 0..=1).await;
    }

    let config = test_config(&temp_dir, &server);
    let manager = manager(config);
    // The config blob is already in the store and verified
    fs::create_dir_all(manager.store().blobs_dir()).unwrap();
    fs::write(manager.store().blob_path(&config_digest), &model.config).unwrap();

    let outcome = manager.download(llama()).await;
    assert!(!outcome.is_completed());
    assert!(matches!(outcome.cleanup, CleanupReport::Removed(_)));
    assert_eq!(
        fs::read(manager.store().blob_path(&config_digest)).unwrap(),
        model.config
    );
}

#[tokio::test]
async fn test_cleanup_disabled_retains_working_dir() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published {
        config: b"{}".to_vec(),
        layers: vec![(MODEL_TYPE, vec![0xAA; 64])],
    };
    mount_manifest(&server, model.manifest()).await;
    mount_blob(&server, &Digest::of(&model.config), model.config.clone(), 0..=1).await;
    mount_blob(&server, &Digest::of(&model.layers[0].1), vec![0xBB; 64], 1).await;

    let mut config = test_config(&temp_dir, &server);
    config.ollama_server.remove_downloaded_on_error = false;
    let manager = manager(config);
    let outcome = manager.download(llama()).await;

    assert!(!outcome.is_completed());
    let work = outcome.session.working_dir().unwrap().to_path_buf();
    assert!(work.exists());
    match outcome.cleanup {
        CleanupReport::Retained(paths) => assert!(paths.contains(&work)),
        other => panic!("expected Retained, got {other:?}"),
    }
    assert!(!manager.store().manifest_path(&llama()).exists());
}

#[tokio::test]
async fn test_corrupt_existing_blob_is_refetched() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    mount_published(&server, &model, 1).await;
    mount_server_listing(&server, &["llama3.1:8b"]).await;

    let manager = manager(test_config(&temp_dir, &server));
    let weights = &model.layers[0].1;
    let weights_path = manager.store().blob_path(&Digest::of(weights));
    fs::create_dir_all(weights_path.parent().unwrap()).unwrap();
    // Right size, wrong content: an interrupted copy
    fs::write(&weights_path, vec![0u8; weights.len()]).unwrap();

    let outcome = manager.download(llama()).await;
    assert!(outcome.is_completed(), "unexpected error: {:?}", outcome.error);
    assert_eq!(&fs::read(&weights_path).unwrap(), weights);
}

#[tokio::test]
async fn test_oversized_blob_is_rejected() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published {
        config: b"{}".to_vec(),
        layers: vec![(MODEL_TYPE, vec![0xAA; 16])],
    };
    mount_manifest(&server, model.manifest()).await;
    mount_blob(&server, &Digest::of(&model.config), model.config.clone(), 0..=1).await;
    mount_blob(&server, &Digest::of(&model.layers[0].1), vec![0xAA; 4096], 1).await;

    let manager = manager(test_config(&temp_dir, &server));
    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::SizeMismatch)
    );
}

#[tokio::test]
async fn test_transient_server_error_is_retried() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published {
        config: b"{}".to_vec(),
        layers: vec![(MODEL_TYPE, vec![0xAA; 128])],
    };
    let layer_digest = Digest::of(&model.layers[0].1);
    mount_manifest(&server, model.manifest()).await;
    mount_blob(&server, &Digest::of(&model.config), model.config.clone(), 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/library/llama3.1/blobs/{layer_digest}")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_blob(&server, &layer_digest, model.layers[0].1.clone(), 1).await;
    mount_server_listing(&server, &["llama3.1:8b"]).await;

    let manager = manager(test_config(&temp_dir, &server));
    let outcome = manager.download(llama()).await;
    assert!(outcome.is_completed(), "unexpected error: {:?}", outcome.error);
}

#[tokio::test]
async fn test_missing_tag_is_reported() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v2/library/llama3.1/manifests/8b"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
        ))
        .mount(&server)
        .await;

    let manager = manager(test_config(&temp_dir, &server));
    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::TagNotFound)
    );
    assert_eq!(outcome.cleanup, CleanupReport::Nothing);
}

#[tokio::test]
async fn test_manifest_without_layers_is_a_parse_error() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {"mediaType": CONFIG_TYPE, "digest": Digest::of(b"{}").to_string(), "size": 2},
        "layers": [],
    });
    mount_manifest(&server, serde_json::to_vec(&manifest).unwrap()).await;

    let manager = manager(test_config(&temp_dir, &server));
    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::ManifestParse)
    );
}

#[tokio::test]
async fn test_post_verification_failure_restores_previous_manifest() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    mount_published(&server, &model, 1).await;
    // The server never lists the model
    mount_server_listing(&server, &["gemma3:1b"]).await;

    let manager = manager(test_config(&temp_dir, &server));
    let manifest_path = manager.store().manifest_path(&llama());
    fs::create_dir_all(manifest_path.parent().unwrap()).unwrap();
    fs::write(&manifest_path, b"previous manifest").unwrap();

    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::PostVerification)
    );
    assert_eq!(fs::read(&manifest_path).unwrap(), b"previous manifest");
    for blob in model.blobs() {
        assert!(!manager.store().blob_path(&Digest::of(blob)).exists());
    }
}

#[tokio::test]
async fn test_cancelled_download_installs_nothing() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    mount_manifest(&server, model.manifest()).await;
    for blob in model.blobs() {
        Mock::given(method("GET"))
            .and(path(format!("/v2/library/llama3.1/blobs/{}", Digest::of(blob))))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(blob.to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
    }

    let manager = manager(test_config(&temp_dir, &server));
    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::Cancelled)
    );
    assert!(!manager.store().manifest_path(&llama()).exists());
    for blob in model.blobs() {
        assert!(!manager.store().blob_path(&Digest::of(blob)).exists());
    }
    assert!(working_dirs(manager.store().root()).is_empty());
}

#[tokio::test]
async fn test_failed_session_keeps_blobs_another_manifest_uses() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published::new();
    // Only the first session transfers anything
    mount_published(&server, &model, 1).await;
    mount_tag_manifest(&server, "70b", model.manifest()).await;
    mount_server_listing(&server, &["llama3.1:70b"]).await;

    let mut config = test_config(&temp_dir, &server);
    config.ollama_server.verify_attempts = 1;
    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let first = manager(config.clone()).with_catalog(Arc::new(HeldCatalog {
        reached: reached.clone(),
        release: release.clone(),
    }));
    let second = manager(config);
    let big = ModelSource::Ollama("llama3.1:70b".parse().unwrap());

    let (first_outcome, second_outcome) = tokio::join!(first.download(llama()), async {
        // The first session has installed its blobs and is waiting on the server
        reached.notified().await;
        let outcome = second.download(big.clone()).await;
        release.notify_one();
        outcome
    });

    assert!(second_outcome.is_completed(), "unexpected error: {:?}", second_outcome.error);
    assert_eq!(
        first_outcome.session.state(),
        SessionState::Failed(FailureKind::PostVerification)
    );
    let store = first.store();
    assert!(!store.manifest_path(&llama()).exists());
    assert!(store.manifest_path(&big).exists());
    for blob in model.blobs() {
        assert_eq!(fs::read(store.blob_path(&Digest::of(blob))).unwrap(), blob);
    }
}

#[tokio::test]
async fn test_network_failure_leaves_models_path_as_it_was() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published {
        config: b"{}".to_vec(),
        layers: vec![(MODEL_TYPE, vec![0xAA; 256])],
    };
    mount_manifest(&server, model.manifest()).await;
    mount_blob(&server, &Digest::of(&model.config), model.config.clone(), 1).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/library/llama3.1/blobs/{}",
            Digest::of(&model.layers[0].1)
        )))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir, &server);
    // The config blob is fetched before the layer fails
    config.ollama_library.max_concurrent_downloads = 1;
    config.ollama_library.max_retries = 0;
    fs::write(temp_dir.path().join("notes.txt"), b"unrelated").unwrap();
    let before = tree(temp_dir.path());

    let manager = manager(config);
    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::Network)
    );
    assert!(matches!(outcome.cleanup, CleanupReport::Removed(_)));
    assert_eq!(tree(temp_dir.path()), before);
    assert!(!manager.store().root().exists());
}

#[tokio::test]
async fn test_corrupt_blob_is_not_removed_by_a_failed_refetch() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let model = Published {
        config: b"{}".to_vec(),
        layers: vec![(MODEL_TYPE, vec![0xAA; 64])],
    };
    let layer_digest = Digest::of(&model.layers[0].1);
    mount_manifest(&server, model.manifest()).await;
    mount_blob(&server, &Digest::of(&model.config), model.config.clone(), 0..=1).await;
    mount_blob(&server, &layer_digest, vec![0xBB; 64], 1).await;

    let manager = manager(test_config(&temp_dir, &server));
    let layer_path = manager.store().blob_path(&layer_digest);
    fs::create_dir_all(layer_path.parent().unwrap()).unwrap();
    fs::write(&layer_path, vec![0u8; 64]).unwrap();

    let outcome = manager.download(llama()).await;
    assert_eq!(
        outcome.session.state(),
        SessionState::Failed(FailureKind::DigestMismatch)
    );
    // Left for the next run to repair, never unlinked ahead of a good copy
    assert_eq!(fs::read(&layer_path).unwrap(), vec![0u8; 64]);
}
