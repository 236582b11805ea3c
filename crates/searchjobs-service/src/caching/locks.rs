use tokio::sync::{Mutex, MutexGuard};

use super::CacheKey;

/// Proof of holding the lock for a [`CacheKey`].
///
/// The lock is released when this is dropped.
pub type LockGuard<'a> = MutexGuard<'a, ()>;

/// A fixed set of async mutexes, indexed by [`CacheKey`].
///
/// Every key maps to exactly one shard, so holding the lock for a key excludes everyone else
/// trying to lock that same key. Unrelated keys may share a shard and contend, but never
/// deadlock: a caller holds at most one shard at a time.
///
/// The shard table is allocated once and never grows, no matter how many distinct keys are seen.
#[derive(Debug)]
pub struct KeyedLocks {
    shards: Box<[Mutex<()>]>,
}

impl KeyedLocks {
    /// Creates a registry of `shards` locks. Zero is treated as one.
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Waits until the lock for `key` is available and takes it.
    pub async fn acquire(&self, key: &CacheKey) -> LockGuard<'_> {
        let shard = key.shard(self.shards.len());
        self.shards[shard].lock().await
    }

    /// The number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
