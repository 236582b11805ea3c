//! The job cache.
//!
//! Jobs live in a [`CacheStore`], a plain key/value store with per-entry expiry. The store can be
//! process-local ([`InMemoryStore`]) or shared between instances ([`RedisStore`], behind the
//! `redis` feature). Concurrent starts of the same search are serialized with [`KeyedLocks`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

mod cache_key;
mod locks;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use cache_key::{CacheKey, ParseCacheKeyError};
pub use locks::{KeyedLocks, LockGuard};
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

use crate::config::{CacheBackend, CacheConfig};

/// The longest expiry a [`CacheStore`] will apply, longer TTLs are clamped to this.
pub(crate) const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An error talking to the [`CacheStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store cannot be reached at all.
    #[error("cache store unavailable")]
    Unavailable(#[source] anyhow::Error),
    /// The backing store rejected an operation.
    #[error("cache store operation failed")]
    Backend(#[source] anyhow::Error),
}

/// A key/value store with per-entry expiration.
///
/// Implementations must guarantee read-your-writes for a `set` followed by a `get` of the same
/// key. Nothing else is required for the search engine to be correct.
#[async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync {
    /// Reads the value for `key`. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes `value` for `key`, expiring after `ttl`.
    ///
    /// Overwriting an entry resets its expiry window.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Removes the entry for `key`, if any.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Removes **every** entry of the store.
    ///
    /// This is unscoped: it also wipes entries that were not written by this process or even by
    /// searchjobs at all, if the store is shared. Only use this as an administrative operation.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Creates the [`CacheStore`] described by the config.
pub fn create_store(config: &CacheConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    match &config.backend {
        CacheBackend::Memory { capacity } => Ok(Arc::new(InMemoryStore::new(*capacity))),
        #[cfg(feature = "redis")]
        CacheBackend::Redis { url } => Ok(Arc::new(RedisStore::open(url)?)),
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis { .. } => {
            anyhow::bail!("the redis cache backend requires the `redis` feature")
        }
    }
}
