//! Per-task workspaces on disk.
//!
//! Every task gets `<root>/<task id>`; ids with characters unsafe in a path
//! get a sanitized name plus a short hash suffix. The store downloads the task's
//! archive, clears whatever a previous attempt left behind and extracts the
//! archive into that directory. Nothing outside the task's own directory
//! is touched.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use crate::archive;
use crate::config::WorkspaceConfig;
use crate::error::{ConfigError, WorkspaceError};
use crate::task::TaskId;

/// A materialized task workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task_id: TaskId,
    pub path: PathBuf,
    /// Number of files extracted from the archive.
    pub files: usize,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fetches and extracts task archives into per-task directories.
pub struct WorkspaceStore {
    root: PathBuf,
    client: reqwest::Client,
}

impl WorkspaceStore {
    /// Create a store from configuration.
    pub fn new(config: &WorkspaceConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self::with_client(config.root.clone(), client))
    }

    /// Create a store rooted at `root` using an existing HTTP client.
    pub fn with_client(root: PathBuf, client: reqwest::Client) -> Self {
        Self { root, client }
    }

    /// Root directory holding all task workspaces.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a task id.
    ///
    /// Ledger ids look like `<timestamp>-<random>` or `<account>-<random>`
    /// and are used verbatim when they only contain `[A-Za-z0-9._-]`. Any
    /// other id has those characters replaced and gets `@<hash of the raw
    /// id>` appended, so distinct ids never share a directory and no id can
    /// name a path outside the root.
    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        let raw = task_id.as_str();
        let name: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let verbatim = name == raw && !name.chars().all(|c| c == '.');
        if verbatim {
            return self.root.join(name);
        }
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        self.root.join(format!("{name}@{}", &digest[..16]))
    }

    /// Create the task directory if absent, reuse it if present.
    pub async fn ensure_dir(&self, task_id: &TaskId) -> Result<PathBuf, WorkspaceError> {
        let dir = self.path_for(task_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Download `source_url` and extract it into the task's directory.
    ///
    /// The directory is created first. Prior contents are only cleared once
    /// the download has succeeded, so a failed fetch leaves nothing but the
    /// directory itself.
    pub async fn fetch_and_extract(
        &self,
        source_url: &str,
        task_id: &TaskId,
    ) -> Result<Workspace, WorkspaceError> {
        let dir = self.ensure_dir(task_id).await?;

        let data = self.download(source_url).await?;
        debug!(task_id = %task_id, bytes = data.len(), "Downloaded workspace archive");

        self.clear(&dir).await?;

        let dest = dir.clone();
        let files = tokio::task::spawn_blocking(move || archive::extract(&data, &dest))
            .await
            .map_err(|e| WorkspaceError::Extract(format!("extraction task panicked: {e}")))??;

        info!(task_id = %task_id, files, path = %dir.display(), "Workspace extracted");

        Ok(Workspace {
            task_id: task_id.clone(),
            path: dir,
            files,
        })
    }

    /// Remove a task's workspace entirely.
    pub async fn dispose(&self, task_id: &TaskId) -> Result<(), WorkspaceError> {
        let dir = self.path_for(task_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(task_id = %task_id, "Workspace disposed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, WorkspaceError> {
        let fetch_err = |reason: String| WorkspaceError::Fetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(describe_reqwest(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(describe_reqwest(&e)))?;
        Ok(bytes.to_vec())
    }

    /// Empty `dir` without removing it.
    async fn clear(&self, dir: &Path) -> Result<(), WorkspaceError> {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

fn describe_reqwest(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::zip_of;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    fn test_store() -> (WorkspaceStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = WorkspaceStore::with_client(dir.path().to_path_buf(), reqwest::Client::new());
        (store, dir)
    }

    #[test]
    fn path_for_stays_under_root() {
        let (store, dir) = test_store();
        let p = store.path_for(&TaskId::new("../../etc"));
        assert!(p.starts_with(dir.path()));
        assert_eq!(p.parent().unwrap(), dir.path());
        assert!(p.file_name().unwrap().to_str().unwrap().starts_with(".._.._etc@"));

        let p = store.path_for(&TaskId::new(".."));
        assert_eq!(p.parent().unwrap(), dir.path());
        assert_ne!(p.file_name().unwrap(), "..");

        let p = store.path_for(&TaskId::new(""));
        assert_ne!(p, dir.path());

        let p = store.path_for(&TaskId::new("develoco.testnet-cmawozD4CwTh"));
        assert_eq!(p.file_name().unwrap(), "develoco.testnet-cmawozD4CwTh");
    }

    #[test]
    fn ids_differing_only_in_unsafe_chars_get_distinct_dirs() {
        let (store, _dir) = test_store();
        let slash = store.path_for(&TaskId::new("job/1"));
        let underscore = store.path_for(&TaskId::new("job_1"));
        let space = store.path_for(&TaskId::new("job 1"));
        assert_ne!(slash, underscore);
        assert_ne!(slash, space);
        assert_ne!(underscore, space);
        assert_eq!(slash, store.path_for(&TaskId::new("job/1")));
    }

    #[tokio::test]
    async fn dispose_never_touches_a_similar_looking_task() {
        let (store, _dir) = test_store();
        let kept = store.ensure_dir(&TaskId::new("job_1")).await.unwrap();
        std::fs::write(kept.join("kept.txt"), "retained").unwrap();
        store.ensure_dir(&TaskId::new("job/1")).await.unwrap();

        store.dispose(&TaskId::new("job/1")).await.unwrap();

        assert!(kept.join("kept.txt").is_file());
        assert!(!store.path_for(&TaskId::new("job/1")).exists());
    }

    #[test]
    fn new_builds_store_from_config() {
        let dir = TempDir::new().unwrap();
        let config = WorkspaceConfig {
            root: dir.path().join("workspaces"),
            retain_after_success: false,
            download_timeout: std::time::Duration::from_secs(5),
        };
        let store = WorkspaceStore::new(&config).unwrap();
        assert_eq!(store.root(), dir.path().join("workspaces"));
    }

    #[tokio::test]
    async fn ensure_dir_is_idempotent() {
        let (store, _dir) = test_store();
        let id = TaskId::new("t1");
        let a = store.ensure_dir(&id).await.unwrap();
        let b = store.ensure_dir(&id).await.unwrap();
        assert_eq!(a, b);
        assert!(a.is_dir());
    }

    #[tokio::test]
    async fn fetches_and_extracts_archive() {
        let server = MockServer::start_async().await;
        let body = zip_of(&[
            ("entry_script.py", "print('hello')"),
            ("requirements.txt", ""),
        ]);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/t1.zip");
                then.status(200).body(body.clone());
            })
            .await;

        let (store, _dir) = test_store();
        let ws = store
            .fetch_and_extract(&server.url("/t1.zip"), &TaskId::new("t1"))
            .await
            .unwrap();

        assert_eq!(ws.files, 2);
        assert!(ws.path().join("entry_script.py").exists());
        assert!(ws.path().join("requirements.txt").exists());
    }

    #[tokio::test]
    async fn not_found_is_fetch_error_and_leaves_empty_dir() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing.zip");
                then.status(404);
            })
            .await;

        let (store, _dir) = test_store();
        let id = TaskId::new("t1");
        let err = store
            .fetch_and_extract(&server.url("/missing.zip"), &id)
            .await
            .unwrap_err();

        match err {
            WorkspaceError::Fetch { reason, .. } => assert!(reason.contains("404")),
            other => panic!("expected fetch error, got {other}"),
        }
        let dir = store.path_for(&id);
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn corrupt_archive_is_extract_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bad.zip");
                then.status(200).body("definitely not a zip");
            })
            .await;

        let (store, _dir) = test_store();
        let err = store
            .fetch_and_extract(&server.url("/bad.zip"), &TaskId::new("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Extract(_)));
    }

    #[tokio::test]
    async fn refetch_clears_residual_state() {
        let server = MockServer::start_async().await;
        let body = zip_of(&[("entry_script.py", "print(1)")]);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/t1.zip");
                then.status(200).body(body.clone());
            })
            .await;

        let (store, _dir) = test_store();
        let id = TaskId::new("t1");
        let dir = store.ensure_dir(&id).await.unwrap();
        std::fs::create_dir_all(dir.join("venv/bin")).unwrap();
        std::fs::write(dir.join("stale.txt"), "left over").unwrap();

        let ws = store
            .fetch_and_extract(&server.url("/t1.zip"), &id)
            .await
            .unwrap();
        assert!(!ws.path().join("stale.txt").exists());
        assert!(!ws.path().join("venv").exists());
        assert!(ws.path().join("entry_script.py").exists());
    }

    #[tokio::test]
    async fn dispose_removes_only_that_task() {
        let (store, _dir) = test_store();
        let a = store.ensure_dir(&TaskId::new("a")).await.unwrap();
        let b = store.ensure_dir(&TaskId::new("b")).await.unwrap();

        store.dispose(&TaskId::new("a")).await.unwrap();
        assert!(!a.exists());
        assert!(b.exists());

        // Disposing twice is fine.
        store.dispose(&TaskId::new("a")).await.unwrap();
    }
}
