//! # Cache Engine
//!
//! A single-tier store abstraction (C4) composed into an ordered multi-tier
//! hierarchy with promotion, tag invalidation, and single-flight memoization
//! (C5).

pub mod codec;
pub mod store;
pub mod tier;

pub use store::{CacheEntry, CacheStore, InMemoryStore, InMemoryStoreConfig, SledStore, StoreError, StoreResult};
pub use tier::{MultiTierCache, TierConfig, TierError, TierResult};
