use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tokio::sync::OnceCell;

use super::{CacheStore, MAX_TTL, StoreError};

/// A [`CacheStore`] backed by a Redis server.
///
/// The connection is established lazily on first use and re-established transparently by the
/// [`ConnectionManager`] after it drops. While the server cannot be reached, every operation
/// fails with [`StoreError::Unavailable`].
pub struct RedisStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Validates the connection URL. Does not connect yet.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|err| StoreError::Unavailable(err.into()))?;
        Ok(conn.clone())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Unavailable(err.into())
    } else {
        StoreError::Backend(err.into())
    }
}

/// The `PX` argument for `ttl`.
///
/// PX rejects zero, the shortest expiry redis can do is one millisecond.
fn expiry_millis(ttl: Duration) -> u64 {
    let millis = ttl.min(MAX_TTL).as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let millis = expiry_millis(ttl);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("FLUSHDB")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_err)
    }
}
