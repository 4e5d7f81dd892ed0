//! Cache store abstraction (C4): `get`/`set`/`delete`/`clear`/`keys` over a
//! single backing tier.
//!
//! Grounded on the teacher's `BackingStore<K, V>` trait
//! (`enterprise::cache::strategy`), narrowed to the string-keyed, JSON-valued
//! shape the cache entry data model calls for, so tiers of different kinds
//! (in-memory, sled-backed) can sit behind one trait object in
//! [`crate::cache::tier::MultiTierCache`].

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::codec::{BincodeCodec, CodecError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A cached value plus its expiry, tags, and free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    /// Milliseconds since epoch; `None` means no expiry.
    pub expires_at: Option<u64>,
    pub tags: Vec<String>,
    pub meta: std::collections::HashMap<String, String>,
}

impl CacheEntry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
            tags: Vec::new(),
            meta: Default::default(),
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.expires_at = Some(now_ms() + ttl_ms);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => now_ms() >= at,
            None => false,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single cache tier. Implementors own their own eviction and expiry
/// policy; [`crate::cache::tier::MultiTierCache`] only orchestrates across
/// tiers.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>>;
    async fn set(&self, key: &str, entry: CacheEntry) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    async fn clear(&self) -> StoreResult<()>;
    async fn keys(&self) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryStoreConfig {
    /// Maximum entries retained. Once reached, the oldest-inserted key is
    /// evicted to make room for a new one (insertion order, not LRU).
    pub max_size: usize,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

/// In-process tier. Eviction is strictly insertion-order: the key that was
/// inserted first (including re-inserted keys, which move to the back of
/// the order) is the one dropped once `max_size` is reached.
pub struct InMemoryStore {
    config: InMemoryStoreConfig,
    entries: DashMap<String, CacheEntry>,
    order: Mutex<VecDeque<String>>,
}

impl InMemoryStore {
    pub fn new(config: InMemoryStoreConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    fn touch_order(&self, key: &str) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.to_string());
    }

    fn evict_if_full(&self, incoming_key: &str) {
        if self.entries.contains_key(incoming_key) {
            return;
        }
        if self.entries.len() < self.config.max_size {
            return;
        }
        let mut order = self.order.lock();
        if let Some(oldest) = order.pop_front() {
            self.entries.remove(&oldest);
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.order.lock().retain(|k| k != key);
                return Ok(None);
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> StoreResult<()> {
        self.evict_if_full(key);
        self.entries.insert(key.to_string(), entry);
        self.touch_order(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed = self.entries.remove(key).is_some();
        self.order.lock().retain(|k| k != key);
        Ok(removed)
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.clear();
        self.order.lock().clear();
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// `sled`-backed tier for an out-of-process cache tier. Values are encoded
/// with [`BincodeCodec`] before being written to the embedded store.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let db = sled::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl CacheStore for SledStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        let raw = self
            .db
            .get(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let Some(bytes) = raw else { return Ok(None) };

        let entry: CacheEntry = BincodeCodec::decode(&bytes)?;
        if entry.is_expired() {
            self.db
                .remove(key)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> StoreResult<()> {
        let bytes = BincodeCodec::encode(&entry)?;
        self.db
            .insert(key, bytes)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed = self
            .db
            .remove(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(removed.is_some())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.db
            .clear()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            out.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(out)
    }
}
