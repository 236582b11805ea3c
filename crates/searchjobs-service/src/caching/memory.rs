use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheStore, MAX_TTL, StoreError};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When to evict this item from the in-memory cache.
    deadline: Instant,
    /// The actual data.
    data: Vec<u8>,
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] [`Instant`] as the explicit
/// expiration time.
struct CacheExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, InMemoryItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or_else(|| now + MAX_TTL)
}

/// A process-local [`CacheStore`].
///
/// Entries expire at the deadline given when they were last written. The number of entries is
/// bounded; when full, moka evicts the least valuable entries first.
#[derive(Clone)]
pub struct InMemoryStore {
    cache: moka::future::Cache<String, InMemoryItem>,
}

impl InMemoryStore {
    pub fn new(capacity: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(capacity)
            .name("jobs")
            .expire_after(CacheExpiration)
            .build();
        Self { cache }
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let item = self.cache.get(key).await;
        // moka expires lazily in the background, make sure a stale item never leaks out
        Ok(item
            .filter(|item| item.deadline > Instant::now())
            .map(|item| item.data))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let item = InMemoryItem {
            deadline: deadline_after(ttl),
            data: value,
        };
        self.cache.insert(key.to_owned(), item).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.cache.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryStore::new(100);

        assert_eq!(store.get("a").await.unwrap(), None);

        store.set("a", b"one".to_vec(), TTL).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"one".to_vec()));

        store.set("a", b"two".to_vec(), TTL).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"two".to_vec()));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        // deleting something that does not exist is fine
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = InMemoryStore::new(100);

        store
            .set("short", b"x".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        store.set("long", b"y".to_vec(), TTL).await.unwrap();
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn test_set_resets_expiry() {
        let store = InMemoryStore::new(100);

        store
            .set("a", b"x".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        store.set("a", b"x".to_vec(), TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.get("a").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_huge_ttl() {
        let store = InMemoryStore::new(100);

        store.set("forever", b"x".to_vec(), Duration::MAX).await.unwrap();
        assert_eq!(store.get("forever").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let store = InMemoryStore::new(100);

        store.set("searches:a", b"1".to_vec(), TTL).await.unwrap();
        store.set("unrelated", b"2".to_vec(), TTL).await.unwrap();

        store.clear().await.unwrap();

        assert_eq!(store.get("searches:a").await.unwrap(), None);
        assert_eq!(store.get("unrelated").await.unwrap(), None);

        // the store is still usable afterwards
        store.set("searches:a", b"3".to_vec(), TTL).await.unwrap();
        assert_eq!(store.get("searches:a").await.unwrap(), Some(b"3".to_vec()));
    }
}
