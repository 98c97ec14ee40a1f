//! Durable key/value storage collaborator.
//!
//! The queue and the read cache both persist through this narrow
//! interface; neither touches the other's keys. Two implementations are
//! provided:
//!
//! - [`MemoryStore`] — in-process map, used by tests and as a scratch
//!   store. Sharing one instance across component restarts simulates a
//!   process restart over surviving storage.
//! - [`FileStore`] — one file per key with atomic rename on write, for
//!   real on-device durability.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The backing medium is out of space. Surfaced loudly to callers;
    /// a user action must never be dropped silently because of it.
    StorageExhausted(String),
    /// Any other I/O failure.
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageExhausted(e) => write!(f, "Storage exhausted: {e}"),
            Self::Io(e) => write!(f, "Storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable key/value store. Synchronous-looking contract that may
/// suspend on I/O.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store with an optional byte budget.
///
/// The budget exists so tests can exercise the storage-exhausted path
/// deterministically.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    capacity_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity_bytes: None,
        }
    }

    /// Store that rejects writes once the total value size would exceed
    /// `capacity_bytes`.
    pub fn with_capacity_bytes(capacity_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity_bytes: Some(capacity_bytes),
        }
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if let Some(budget) = self.capacity_bytes {
            let current: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if current + value.len() > budget {
                return Err(StoreError::StorageExhausted(format!(
                    "write of {} bytes exceeds {budget}-byte budget",
                    value.len()
                )));
            }
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Directory-backed store: one file per key, hex-encoded filename so
/// arbitrary key strings are safe on any filesystem.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if missing) the store directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(classify_io)?;
        log::debug!("file store opened at {}", root.display());
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() * 2 + 3);
        for byte in key.bytes() {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(".kv");
        self.root.join(name)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify_io(e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await.map_err(classify_io)?;
        // Rename is atomic on the same filesystem, so a crash mid-write
        // leaves either the old value or the new one, never a torn file.
        tokio::fs::rename(&tmp, &path).await.map_err(classify_io)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io(e)),
        }
    }
}

fn classify_io(e: std::io::Error) -> StoreError {
    match e.kind() {
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
            StoreError::StorageExhausted(e.to_string())
        }
        _ => StoreError::Io(e.to_string()),
    }
}
