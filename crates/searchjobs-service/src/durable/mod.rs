//! Long-term storage of completed searches.
//!
//! Every completed search can be mirrored into a [`DurableStore`], where it outlives the job
//! cache TTL and can be listed again as search history. Records are grouped by an [`Owner`],
//! a user and a task of that user.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::caching::CacheKey;
use crate::config::DurableConfig;
use crate::jobs::JobStatus;

mod memory;
mod sqlite;

pub use memory::InMemoryDurableStore;
pub use sqlite::SqliteDurableStore;

/// An error of the [`DurableStore`].
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// The record refers to a task that was never created.
    #[error("unknown task {0}")]
    UnknownTask(Uuid),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    /// A stored row could not be turned back into a [`SearchRecord`].
    #[error("malformed search record")]
    Malformed(#[source] anyhow::Error),
}

/// The user and task a [`SearchRecord`] is filed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub user_id: Uuid,
    pub task_id: Uuid,
}

/// A completed search, as kept in the [`DurableStore`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchRecord {
    /// The identity of the search. Serialized as `request_id`.
    #[serde(rename = "request_id")]
    pub id: CacheKey,
    pub task_id: Uuid,
    pub query: String,
    pub result: Value,
    pub status: JobStatus,
    /// When the search was started.
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The outcome of [`DurableStore::store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The record was written.
    Stored,
    /// A record with the same id already exists for that task. Nothing was written.
    AlreadyExists,
}

#[async_trait]
pub trait DurableStore: fmt::Debug + Send + Sync {
    /// Creates a new user along with a first task of that user.
    async fn create_owner(&self) -> Result<Owner, DurableError>;

    /// Inserts the record, unless one with the same `(id, task_id)` exists.
    async fn store(&self, record: SearchRecord) -> Result<StoreOutcome, DurableError>;

    /// Returns up to `limit` records across all users, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<SearchRecord>, DurableError>;

    /// Returns all records of the given user, newest first.
    async fn for_user(&self, user_id: Uuid) -> Result<Vec<SearchRecord>, DurableError>;
}

/// Opens the [`DurableStore`] described by the config, if any.
pub async fn create_durable_store(
    config: &DurableConfig,
) -> anyhow::Result<Option<Arc<dyn DurableStore>>> {
    Ok(match config {
        DurableConfig::None => None,
        DurableConfig::Memory => Some(Arc::new(InMemoryDurableStore::default())),
        DurableConfig::Sqlite { path } => Some(Arc::new(SqliteDurableStore::open(path).await?)),
    })
}
