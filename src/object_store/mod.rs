//! Filesystem-backed `ObjectStore` (OS, §1): the out-of-scope relational/
//! object store's blob half, implemented the simplest way that satisfies
//! [`crate::pipeline::ObjectStore`] — one file per key, nested directories
//! created on demand. A production deployment would point this at S3/GCS
//! instead; the trait boundary is what matters here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{PipelineError, Result};
use crate::pipeline::ObjectStore;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn io_err(context: &str, err: std::io::Error) -> PipelineError {
    PipelineError::TransientExternal(format!("{context}: {err}"))
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_err("create object parent dir", e))?;
        }

        // Write-then-rename so a reader never observes a partially-written
        // blob, same discipline the ledger's claim transaction enforces for
        // rows.
        let tmp_path = tmp_path_for(&path);
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| io_err("create temp object file", e))?;
        file.write_all(&bytes).await.map_err(|e| io_err("write object bytes", e))?;
        file.flush().await.map_err(|e| io_err("flush object file", e))?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| io_err("rename object into place", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path).await.map_err(|e| io_err(&format!("read object {key}"), e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&format!("delete object {key}"), e)),
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("documents/m1/uploads/a.pdf", b"hello".to_vec()).await.unwrap();
        let bytes = store.get("documents/m1/uploads/a.pdf").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn delete_is_idempotent_on_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.delete("documents/m1/uploads/missing.pdf").await.is_ok());
    }

    #[tokio::test]
    async fn get_missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.get("nope").await.is_err());
    }
}
