pub mod download;
pub mod library;
pub mod manager;
pub mod manifest;
pub mod recovery;
pub mod reference;
pub mod resolver;
pub mod server;
pub mod session;
pub mod store;
pub mod tags;
pub mod verify;

pub use download::{BlobDownloader, DownloadedBlob};
pub use library::LibraryClient;
pub use manager::{DownloadOutcome, ModelManager};
pub use manifest::{BlobDescriptor, Digest, Manifest, ResolvedManifest};
pub use recovery::{CleanupReport, ErrorRecoveryManager};
pub use reference::{HfReference, ModelReference, ModelSource};
pub use resolver::ManifestResolver;
pub use server::{ModelCatalog, OllamaServerClient, PostDownloadVerifier, ServerModel};
pub use session::{BlobState, DownloadSession, FailureKind, SessionState};
pub use store::LocalStore;
pub use tags::{TagsCache, TagsCacheEntry, TagsRefresh};
pub use verify::DigestVerifier;
