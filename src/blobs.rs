//! Attachment blob store — opaque byte storage keyed by ID.
//!
//! Blobs are written before the record that references them, so a stored
//! record never points at a missing blob. The store itself is an external
//! collaborator; the bundled filesystem implementation covers single-node
//! operation and tests.

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BlobError;
use crate::model::AttachmentRef;

/// Opaque attachment byte storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist attachment bytes; returns the reference the record stores.
    async fn put(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<AttachmentRef, BlobError>;

    /// Fetch a blob's bytes by ID.
    async fn get(&self, id: &str) -> Result<Vec<u8>, BlobError>;
}

/// Filesystem-backed blob store. Blobs live flat under a root directory,
/// named by their ID; the URL is `<base_url>/<id>`.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, base_url: impl Into<String>) -> Self {
        Self {
            root,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<AttachmentRef, BlobError> {
        let id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.root.join(&id);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BlobError::Write {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        Ok(AttachmentRef {
            url: format!("{}/{id}", self.base_url.trim_end_matches('/')),
            id,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.root.join(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), "https://blobs.test");

        let blob = store
            .put("report.pdf", "application/pdf", b"pdf-bytes")
            .await
            .unwrap();
        assert_eq!(blob.filename, "report.pdf");
        assert_eq!(blob.size, 9);
        assert_eq!(blob.url, format!("https://blobs.test/{}", blob.id));

        let bytes = store.get(&blob.id).await.unwrap();
        assert_eq!(bytes, b"pdf-bytes");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf(), "https://blobs.test");
        assert!(matches!(
            store.get("nope").await,
            Err(BlobError::NotFound(_))
        ));
    }
}
