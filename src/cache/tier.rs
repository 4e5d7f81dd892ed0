//! Multi-tier cache orchestration (C5): reads walk tiers in order and
//! promote on a hit found below the first tier; writes and deletes fan out
//! to every tier concurrently; a tag index supports bulk invalidation.
//!
//! Grounded on the teacher's `MultiTierCache<K, V>`
//! (`enterprise::cache::tier`) for the tiered-promotion shape, generalized
//! from the teacher's fixed L1/L2/L3 to an arbitrary ordered list of
//! [`CacheStore`] trait objects, since the contract here promotes on any
//! hit below the head tier rather than only from a named L2/L3.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::store::{CacheEntry, CacheStore, StoreError};

#[derive(Debug, Error)]
pub enum TierError {
    #[error("a multi-tier cache requires at least one tier")]
    NoTiers,
    #[error("invalid glob pattern: {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type TierResult<T> = Result<T, TierError>;

#[derive(Debug, Clone, Default)]
pub struct TierConfig {
    /// Default TTL applied when `set` is called without an explicit one.
    pub default_ttl_ms: Option<u64>,
}

impl TierConfig {
    pub fn validate(&self) -> TierResult<()> {
        Ok(())
    }
}

/// Translates a `*`/`?` glob into an anchored regex, the way `deletePattern`
/// matches keys across the tag index and tier key listings.
fn glob_to_regex(glob: &str) -> TierResult<Regex> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c if "\\.+^$()[]{}|".contains(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| TierError::InvalidPattern(e.to_string()))
}

/// Coordinates a single-flight resolver per key: concurrent callers to
/// `wrap` for the same key block on one in-flight computation instead of
/// all recomputing independently.
#[derive(Default)]
struct InFlight {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl InFlight {
    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Ordered hierarchy of cache tiers plus a tag index for bulk invalidation.
pub struct MultiTierCache {
    tiers: Vec<Arc<dyn CacheStore>>,
    config: TierConfig,
    tag_index: DashMap<String, HashSet<String>>,
    in_flight: InFlight,
}

impl MultiTierCache {
    pub fn new(tiers: Vec<Arc<dyn CacheStore>>, config: TierConfig) -> TierResult<Self> {
        if tiers.is_empty() {
            return Err(TierError::NoTiers);
        }
        config.validate()?;
        Ok(Self {
            tiers,
            config,
            tag_index: DashMap::new(),
            in_flight: InFlight::default(),
        })
    }

    /// Walk tiers in order; the first hit is returned and written back
    /// (promoted) into every tier above it.
    pub async fn get(&self, key: &str) -> TierResult<Option<Value>> {
        for (i, tier) in self.tiers.iter().enumerate() {
            if let Some(entry) = tier.get(key).await? {
                if i > 0 {
                    self.promote(key, &entry, i).await?;
                }
                return Ok(Some(entry.value));
            }
        }
        Ok(None)
    }

    async fn promote(&self, key: &str, entry: &CacheEntry, found_at: usize) -> TierResult<()> {
        for tier in &self.tiers[..found_at] {
            tier.set(key, entry.clone()).await?;
        }
        Ok(())
    }

    /// Write to every tier concurrently.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl_ms: Option<u64>,
        tags: Vec<String>,
    ) -> TierResult<()> {
        let mut entry = CacheEntry::new(value).with_tags(tags.clone());
        if let Some(ttl) = ttl_ms.or(self.config.default_ttl_ms) {
            entry = entry.with_ttl(ttl);
        }

        let writes = self.tiers.iter().map(|tier| {
            let tier = tier.clone();
            let key = key.to_string();
            let entry = entry.clone();
            async move { tier.set(&key, entry).await }
        });
        futures::future::try_join_all(writes).await?;

        for tag in &tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        Ok(())
    }

    /// Delete a key from every tier concurrently.
    pub async fn delete(&self, key: &str) -> TierResult<bool> {
        let deletes = self
            .tiers
            .iter()
            .map(|tier| {
                let tier = tier.clone();
                let key = key.to_string();
                async move { tier.delete(&key).await }
            });
        let results = futures::future::try_join_all(deletes).await?;
        self.untrack_key(key);
        Ok(results.into_iter().any(|r| r))
    }

    /// Delete every key across every tier matching a `*`/`?` glob.
    pub async fn delete_pattern(&self, glob: &str) -> TierResult<usize> {
        let re = glob_to_regex(glob)?;
        let mut seen: HashSet<String> = HashSet::new();
        for tier in &self.tiers {
            for key in tier.keys().await? {
                if re.is_match(&key) {
                    seen.insert(key);
                }
            }
        }
        for key in &seen {
            self.delete(key).await?;
        }
        Ok(seen.len())
    }

    /// Delete every key registered under any of the given tags.
    pub async fn invalidate_tags(&self, tags: &[String]) -> TierResult<usize> {
        let mut keys: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some(set) = self.tag_index.get(tag) {
                keys.extend(set.iter().cloned());
            }
        }
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    fn untrack_key(&self, key: &str) {
        for mut entry in self.tag_index.iter_mut() {
            entry.value_mut().remove(key);
        }
    }

    pub async fn clear(&self) -> TierResult<()> {
        for tier in &self.tiers {
            tier.clear().await?;
        }
        self.tag_index.clear();
        Ok(())
    }

    /// Read-through with single-flight: concurrent callers for the same key
    /// share one resolver invocation instead of each recomputing `loader`.
    /// If `refresh` is false and `key` is already cached, the cached value
    /// is returned without calling `loader`; otherwise `loader` always runs
    /// and its result overwrites the cache.
    pub async fn wrap<F, Fut>(
        &self,
        key: &str,
        ttl_ms: Option<u64>,
        tags: Vec<String>,
        refresh: bool,
        loader: F,
    ) -> TierResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = TierResult<Value>>,
    {
        if !refresh {
            if let Some(value) = self.get(key).await? {
                return Ok(value);
            }
        }

        let lock = self.in_flight.lock_for(key);
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another caller may have just
        // populated the cache while we were waiting. Skipped when
        // refreshing, since a refresh must always call `loader`.
        if !refresh {
            if let Some(value) = self.get(key).await? {
                return Ok(value);
            }
        }

        let value = loader().await?;
        self.set(key, value.clone(), ttl_ms, tags).await?;
        Ok(value)
    }

    /// Memoizes `f` over `args`: computes a cache key via `key_resolver`
    /// (default: a stable JSON serialization of `args`) prefixed with
    /// `key_prefix`, and delegates to [`Self::wrap`]. Rust has no ambient
    /// way to return a fresh closure borrowing `&self` with its own
    /// lifetime, so this collapses "return a memoized function" into "make
    /// one memoized call" — callers memoize a whole function by calling
    /// this once per invocation instead of calling a returned closure.
    pub async fn memoize<A, F, Fut>(
        &self,
        key_prefix: &str,
        args: A,
        ttl_ms: Option<u64>,
        tags: Vec<String>,
        key_resolver: Option<&dyn Fn(&A) -> String>,
        f: F,
    ) -> TierResult<Value>
    where
        A: Serialize,
        F: FnOnce(A) -> Fut,
        Fut: std::future::Future<Output = TierResult<Value>>,
    {
        let key = match key_resolver {
            Some(resolver) => format!("{key_prefix}:{}", resolver(&args)),
            None => {
                let serialized = serde_json::to_string(&args).unwrap_or_default();
                format!("{key_prefix}:{serialized}")
            }
        };
        self.wrap(&key, ttl_ms, tags, false, || f(args)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{InMemoryStore, InMemoryStoreConfig};

    fn two_tier() -> MultiTierCache {
        let l1: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let l2: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        MultiTierCache::new(vec![l1, l2], TierConfig::default()).unwrap()
    }

    #[test]
    fn zero_tiers_rejected() {
        let result = MultiTierCache::new(vec![], TierConfig::default());
        assert!(matches!(result, Err(TierError::NoTiers)));
    }

    #[tokio::test]
    async fn hit_below_head_tier_promotes() {
        let cache = two_tier();
        cache.tiers[1]
            .set("k", CacheEntry::new(Value::from(7)))
            .await
            .unwrap();

        assert!(cache.tiers[0].get("k").await.unwrap().is_none());
        let got = cache.get("k").await.unwrap();
        assert_eq!(got, Some(Value::from(7)));
        assert!(cache.tiers[0].get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn set_writes_every_tier() {
        let cache = two_tier();
        cache.set("k", Value::from(1), None, vec![]).await.unwrap();
        assert!(cache.tiers[0].get("k").await.unwrap().is_some());
        assert!(cache.tiers[1].get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_pattern_matches_glob() {
        let cache = two_tier();
        cache.set("user:1", Value::from(1), None, vec![]).await.unwrap();
        cache.set("user:2", Value::from(2), None, vec![]).await.unwrap();
        cache.set("order:1", Value::from(3), None, vec![]).await.unwrap();

        let deleted = cache.delete_pattern("user:*").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(cache.get("order:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_tags_removes_tagged_keys_only() {
        let cache = two_tier();
        cache
            .set("a", Value::from(1), None, vec!["team".to_string()])
            .await
            .unwrap();
        cache.set("b", Value::from(2), None, vec![]).await.unwrap();

        let removed = cache.invalidate_tags(&["team".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wrap_only_invokes_loader_once_per_key() {
        let cache = two_tier();
        let calls = AtomicU32Counter::new();
        let calls_clone = calls.clone();

        let value = cache
            .wrap("computed", None, vec![], false, || async move {
                calls_clone.increment();
                Ok(Value::from(42))
            })
            .await
            .unwrap();
        assert_eq!(value, Value::from(42));

        let value2 = cache
            .wrap("computed", None, vec![], false, || async { Ok(Value::from(99)) })
            .await
            .unwrap();
        assert_eq!(value2, Value::from(42));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn wrap_with_refresh_always_calls_loader() {
        let cache = two_tier();
        cache.set("k", Value::from(1), None, vec![]).await.unwrap();

        let value = cache
            .wrap("k", None, vec![], true, || async { Ok(Value::from(2)) })
            .await
            .unwrap();
        assert_eq!(value, Value::from(2));
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn memoize_keys_by_argument_and_shares_the_cache() {
        let cache = two_tier();
        let calls = AtomicU32Counter::new();

        let compute = |calls: Arc<AtomicU32Counter>| {
            move |n: i64| {
                let calls = calls.clone();
                async move {
                    calls.increment();
                    Ok(Value::from(n * 2))
                }
            }
        };

        let value = cache
            .memoize("double", 21i64, None, vec![], None, compute(calls.clone()))
            .await
            .unwrap();
        assert_eq!(value, Value::from(42));

        // Same argument hits the cache; loader does not run again.
        let value2 = cache
            .memoize("double", 21i64, None, vec![], None, compute(calls.clone()))
            .await
            .unwrap();
        assert_eq!(value2, Value::from(42));
        assert_eq!(calls.get(), 1);

        // A different argument is a distinct key, so it does call through.
        let value3 = cache
            .memoize("double", 10i64, None, vec![], None, compute(calls.clone()))
            .await
            .unwrap();
        assert_eq!(value3, Value::from(20));
        assert_eq!(calls.get(), 2);
    }

    struct AtomicU32Counter(std::sync::atomic::AtomicU32);
    impl AtomicU32Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self(std::sync::atomic::AtomicU32::new(0)))
        }
        fn increment(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn get(&self) -> u32 {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}
