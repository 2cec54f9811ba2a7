//! Checkpoint Store (C1, spec §4.1).
//!
//! Two implementations sharing one trait: a filesystem-backed store (one file
//! per key, atomic stage-then-rename writes) and an in-memory store for tests
//! and for callers that accept losing checkpoints on restart.

use crate::error::{FraktiError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn add(&self, key: &str, blob: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed checkpoint store. Keys are sandbox ids; `Add` stages to
/// `<root>/sandbox/<key>.tmp` then renames into place so a crash mid-write
/// never leaves a torn file (spec §4.1 invariants), following the on-disk
/// layout spec §6 documents (`<root>/sandbox/<sandboxID>`).
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir = root.join("sandbox");
        fs::create_dir_all(&dir).await.map_err(|e| {
            FraktiError::storage(format!("creating checkpoint dir {}: {}", dir.display(), e))
        })?;
        Ok(Self { root })
    }

    fn dir(&self) -> PathBuf {
        self.root.join("sandbox")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        checkpoint_path(&self.root, key)
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        self.dir().join(format!("{key}.tmp"))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn add(&self, key: &str, blob: &[u8]) -> Result<()> {
        let tmp = self.tmp_path_for(key);
        let dest = self.path_for(key);
        fs::write(&tmp, blob)
            .await
            .map_err(|e| FraktiError::storage(format!("staging {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &dest)
            .await
            .map_err(|e| FraktiError::storage(format!("committing {}: {}", dest.display(), e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FraktiError::not_found(key))
            }
            Err(e) => Err(FraktiError::storage(format!("reading {}: {}", path.display(), e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Idempotent removal: a missing key is success (spec §4.1 failure semantics).
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FraktiError::storage(format!("deleting {}: {}", path.display(), e))),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.dir();
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| FraktiError::storage(format!("listing {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FraktiError::storage(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".tmp") {
                out.push(name);
            }
        }
        Ok(out)
    }
}

/// In-memory checkpoint store. Used by unit tests and by embedders that do
/// not need checkpoints to survive a restart.
#[derive(Default)]
pub struct MemCheckpointStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemCheckpointStore {
    async fn add(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.blobs.lock().unwrap().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| FraktiError::not_found(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.blobs.lock().unwrap().keys().cloned().collect())
    }
}

/// Spec §6's documented on-disk layout: a sandbox checkpoint lives at
/// `<root>/sandbox/<sandboxID>`. `FsCheckpointStore` resolves every key
/// through this so the schema stays in one place.
pub fn checkpoint_path(root: &Path, sandbox_id: &str) -> PathBuf {
    root.join("sandbox").join(sandbox_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip<S: CheckpointStore>(store: S) {
        store.add("p0", b"blob_b").await.unwrap();
        store.add("p1", b"blob_c").await.unwrap();

        let mut keys = store.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["p0".to_string(), "p1".to_string()]);

        assert_eq!(store.get("p0").await.unwrap(), b"blob_b");

        store.delete("p0").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["p1".to_string()]);

        // Idempotent: deleting an already-missing key still succeeds.
        store.delete("p0").await.unwrap();
    }

    #[tokio::test]
    async fn mem_store_roundtrip() {
        roundtrip(MemCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).await.unwrap();
        roundtrip(store).await;
    }

    #[tokio::test]
    async fn fs_store_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).await.unwrap();
        let err = store.get("absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn fs_store_add_is_atomic_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).await.unwrap();
        store.add("k", b"v").await.unwrap();
        let keys = store.list().await.unwrap();
        assert_eq!(keys, vec!["k".to_string()]);
    }
}
