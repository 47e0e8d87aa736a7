//! Artifact publishing — package a workspace's results and upload them.

pub mod ipfs;

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::archive;
use crate::error::PublishError;
use crate::task::ArtifactReceipt;

pub use ipfs::{ContentStore, IpfsStore, StoredObject};

/// File name used for uploaded result archives.
pub const ARTIFACT_FILE_NAME: &str = "results.zip";

/// Zips `<workspace>/<results_dir>` and pushes it to a content store.
pub struct ArtifactPublisher {
    store: Arc<dyn ContentStore>,
    results_dir: String,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ContentStore>, results_dir: impl Into<String>) -> Self {
        Self {
            store,
            results_dir: results_dir.into(),
        }
    }

    /// Package the results directory and upload it.
    pub async fn package_and_upload(&self, workspace: &Path) -> Result<ArtifactReceipt, PublishError> {
        let results = workspace.join(&self.results_dir);
        let bytes = tokio::task::spawn_blocking(move || archive::pack_dir(&results))
            .await
            .map_err(|e| PublishError::Packaging(format!("packaging task panicked: {e}")))??;

        let sha256 = hex::encode(Sha256::digest(&bytes));
        let size = bytes.len() as u64;
        info!(size, sha256 = %sha256, "Results packaged");

        let stored = self.store.put(ARTIFACT_FILE_NAME, bytes).await?;

        info!(locator = %stored.locator, content_hash = %stored.content_id, "Results uploaded");

        Ok(ArtifactReceipt {
            locator: stored.locator,
            content_hash: stored.content_id,
            sha256,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct RecordingStore {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl ContentStore for RecordingStore {
        async fn put(&self, file_name: &str, bytes: Vec<u8>) -> Result<StoredObject, PublishError> {
            if self.fail {
                return Err(PublishError::Upload("store unreachable".into()));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((file_name.to_string(), bytes));
            Ok(StoredObject {
                content_id: "QmTest".into(),
                locator: "https://gw/ipfs/QmTest".into(),
            })
        }
    }

    #[tokio::test]
    async fn packages_and_uploads_results() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("results")).unwrap();
        std::fs::write(dir.path().join("results/output.txt"), "Hello from NEAR!\n").unwrap();

        let store = Arc::new(RecordingStore::default());
        let publisher = ArtifactPublisher::new(store.clone(), "results");
        let receipt = publisher.package_and_upload(dir.path()).await.unwrap();

        assert_eq!(receipt.content_hash, "QmTest");
        assert_eq!(receipt.locator, "https://gw/ipfs/QmTest");

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, ARTIFACT_FILE_NAME);
        assert_eq!(receipt.size, uploads[0].1.len() as u64);
        assert_eq!(receipt.sha256, hex::encode(Sha256::digest(&uploads[0].1)));
    }

    #[tokio::test]
    async fn missing_results_is_packaging_error_without_upload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::default());
        let publisher = ArtifactPublisher::new(store.clone(), "results");

        let err = publisher.package_and_upload(dir.path()).await.unwrap_err();
        assert!(matches!(err, PublishError::Packaging(_)));
        assert!(store.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_upload_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("results")).unwrap();
        std::fs::write(dir.path().join("results/out.txt"), "x").unwrap();

        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let publisher = ArtifactPublisher::new(store, "results");
        let err = publisher.package_and_upload(dir.path()).await.unwrap_err();
        assert!(matches!(err, PublishError::Upload(_)));
    }
}
