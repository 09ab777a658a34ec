use crate::error::{DownloaderError, Result};
use crate::models::download::DownloadedBlob;
use crate::models::manifest::Digest;

/// Checks streamed bytes against the digest a manifest declared for them.
pub struct DigestVerifier;

impl DigestVerifier {
    /// Accept `blob` if it matches `expected`, returning its store identity.
    ///
    /// With no expected digest the computed one is trusted. On mismatch the temporary file
    /// is deleted before the error is returned.
    pub async fn verify(expected: Option<&Digest>, blob: &DownloadedBlob) -> Result<Digest> {
        let Some(wanted) = expected else {
            tracing::debug!(digest = %blob.digest, "Accepting computed digest");
            return Ok(blob.digest.clone());
        };

        // Both sides are normalized to lower-case hex when parsed
        if wanted == &blob.digest {
            tracing::debug!(digest = %wanted, "Digest verified");
            return Ok(wanted.clone());
        }

        if let Err(e) = tokio::fs::remove_file(&blob.path).await {
            tracing::warn!(path = %blob.path.display(), "Failed to remove corrupt download: {e}");
        }
        tracing::error!(wanted = %wanted, got = %blob.digest, "Digest mismatch");
        Err(DownloaderError::DigestMismatch {
            wanted: wanted.to_string(),
            got: blob.digest.to_string(),
        })
    }
}
