//! TTL-bounded read cache for previously fetched remote data.
//!
//! Serves stale-but-available data while offline: an entry past its
//! freshness window is still returned, flagged `fresh: false`, and the
//! caller decides whether stale is acceptable. Eviction is lazy (checked
//! on read against a hard horizon well past staleness) plus an optional
//! [`ReadCache::sweep`] to bound storage growth. Never touches the
//! network.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::store::{KeyValueStore, StoreError};

/// One cached value with its freshness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub stored_at: u64,
    pub fresh_until: u64,
}

/// Cache lookup result.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Entry present. `fresh` is false past the TTL; the value is
    /// returned either way.
    Hit { value: Vec<u8>, fresh: bool },
    Miss,
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace prefix inside the shared key/value store.
    pub key_prefix: String,
    /// How long past `fresh_until` an entry is kept before lazy
    /// eviction. Default: 24 hours.
    pub evict_after_stale_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache/".to_string(),
            evict_after_stale_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    /// Config for testing (short hard-evict horizon).
    pub fn for_testing() -> Self {
        Self {
            key_prefix: "cache/".to_string(),
            evict_after_stale_ms: 10_000,
        }
    }
}

/// Cache errors.
#[derive(Debug, Clone)]
pub enum CacheError {
    Storage(StoreError),
    Serialization(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "Cache storage error: {e}"),
            Self::Serialization(e) => write!(f, "Cache serialization error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// The local read cache.
pub struct ReadCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    /// Keys this instance has touched; the sweep only visits these,
    /// since the store contract has no listing primitive.
    seen_keys: Mutex<HashSet<String>>,
}

impl ReadCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
            seen_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Look up a key. Freshness is a pure function of stored time and
    /// TTL; entries far past staleness are lazily evicted here.
    pub async fn get(&self, key: &str) -> Result<Lookup, CacheError> {
        let storage_key = self.storage_key(key);
        let Some(bytes) = self
            .store
            .get(&storage_key)
            .await
            .map_err(CacheError::Storage)?
        else {
            return Ok(Lookup::Miss);
        };

        let (entry, _): (CacheEntry, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let now = self.clock.now_ms();
        if now > entry.fresh_until.saturating_add(self.config.evict_after_stale_ms) {
            log::debug!("lazily evicting long-stale cache entry {key}");
            self.store
                .delete(&storage_key)
                .await
                .map_err(CacheError::Storage)?;
            self.seen_keys.lock().await.remove(key);
            return Ok(Lookup::Miss);
        }

        self.seen_keys.lock().await.insert(key.to_string());
        Ok(Lookup::Hit {
            value: entry.value,
            fresh: now <= entry.fresh_until,
        })
    }

    /// Store a freshly fetched value with its TTL.
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let now = self.clock.now_ms();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            stored_at: now,
            fresh_until: now.saturating_add(ttl.as_millis() as u64),
        };
        let bytes = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.store
            .set(&self.storage_key(key), &bytes)
            .await
            .map_err(CacheError::Storage)?;
        self.seen_keys.lock().await.insert(key.to_string());
        Ok(())
    }

    /// Drop a key explicitly (e.g. after a confirmed local mutation).
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.store
            .delete(&self.storage_key(key))
            .await
            .map_err(CacheError::Storage)?;
        self.seen_keys.lock().await.remove(key);
        Ok(())
    }

    /// Evict every known entry past the hard horizon. Returns the
    /// number evicted.
    pub async fn sweep(&self) -> Result<usize, CacheError> {
        let keys: Vec<String> = self.seen_keys.lock().await.iter().cloned().collect();
        let now = self.clock.now_ms();
        let mut evicted = 0;

        for key in keys {
            let storage_key = self.storage_key(&key);
            let Some(bytes) = self
                .store
                .get(&storage_key)
                .await
                .map_err(CacheError::Storage)?
            else {
                self.seen_keys.lock().await.remove(&key);
                continue;
            };
            let Ok((entry, _)) = bincode::serde::decode_from_slice::<CacheEntry, _>(
                &bytes,
                bincode::config::standard(),
            ) else {
                // Undecodable entry is junk; reclaim the space
                self.store
                    .delete(&storage_key)
                    .await
                    .map_err(CacheError::Storage)?;
                self.seen_keys.lock().await.remove(&key);
                evicted += 1;
                continue;
            };
            if now > entry.fresh_until.saturating_add(self.config.evict_after_stale_ms) {
                self.store
                    .delete(&storage_key)
                    .await
                    .map_err(CacheError::Storage)?;
                self.seen_keys.lock().await.remove(&key);
                evicted += 1;
            }
        }

        if evicted > 0 {
            log::info!("cache sweep evicted {evicted} entries");
        }
        Ok(evicted)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}
