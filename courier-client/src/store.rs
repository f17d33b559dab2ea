//! Persisted key-value state.
//!
//! courier consumes storage through the [`KvStore`] get/put contract; the
//! engine behind it is someone else's concern. Values are opaque encoded
//! byte blobs keyed by `(table, key)`; each call is atomic on its own.
//!
//! Two implementations ship here: [`MemoryStore`] for tests and
//! [`FileStore`], a whole-map snapshot file good enough to back a single
//! daemon instance.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying engine I/O failed.
    #[error("store i/o error: {0}")]
    Io(String),

    /// Persisted data could not be decoded.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

/// The get/put contract courier consumes.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value at `(table, key)`, if present.
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write the value at `(table, key)`, replacing any previous one.
    async fn put(&self, table: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

type KvMap = HashMap<(String, String), Vec<u8>>;

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: std::sync::Mutex<KvMap>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.lock().unwrap();
        Ok(map.get(&(table.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, table: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.lock().unwrap();
        map.insert((table.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }
}

/// Snapshot-file store backing a single daemon instance.
///
/// The whole map is rewritten (write-then-rename) on every put; courier's
/// persisted state is small and rarely written, so simplicity wins over a
/// real engine here.
pub struct FileStore {
    path: PathBuf,
    map: tokio::sync::Mutex<KvMap>,
}

impl FileStore {
    /// Open a store at `path`, loading an existing snapshot if present.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_map(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KvMap::new(),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        Ok(Self {
            path,
            map: tokio::sync::Mutex::new(map),
        })
    }

    async fn persist(&self, map: &KvMap) -> Result<(), StoreError> {
        let entries: Vec<(&(String, String), &Vec<u8>)> = map.iter().collect();
        let bytes = rmp_serde::to_vec(&entries).map_err(|e| StoreError::Io(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

fn decode_map(bytes: &[u8]) -> Result<KvMap, StoreError> {
    let entries: Vec<((String, String), Vec<u8>)> =
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(entries.into_iter().collect())
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.lock().await;
        Ok(map.get(&(table.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, table: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.lock().await;
        map.insert((table.to_string(), key.to_string()), value.to_vec());
        self.persist(&map).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_get_put() {
        let store = MemoryStore::new();
        assert!(store.get("t", "k").await.unwrap().is_none());

        store.put("t", "k", b"value").await.unwrap();
        assert_eq!(store.get("t", "k").await.unwrap().unwrap(), b"value");

        store.put("t", "k", b"updated").await.unwrap();
        assert_eq!(store.get("t", "k").await.unwrap().unwrap(), b"updated");
    }

    #[tokio::test]
    async fn memory_store_tables_are_namespaces() {
        let store = MemoryStore::new();
        store.put("a", "k", b"1").await.unwrap();
        store.put("b", "k", b"2").await.unwrap();
        assert_eq!(store.get("a", "k").await.unwrap().unwrap(), b"1");
        assert_eq!(store.get("b", "k").await.unwrap().unwrap(), b"2");
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.put("outbox", "abc", b"payload").await.unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(
            store.get("outbox", "abc").await.unwrap().unwrap(),
            b"payload"
        );
        assert!(store.get("outbox", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("fresh.bin")).await.unwrap();
        assert!(store.get("t", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_corrupt_snapshot_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        tokio::fs::write(&path, b"\xff\xff not msgpack").await.unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
