use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::caching::CacheKey;
use crate::durable::{DurableError, DurableStore, Owner, SearchRecord, StoreOutcome};
use crate::jobs::{Job, JobStatus};

/// Mirrors completed searches into a [`DurableStore`].
///
/// Mirroring is best effort. Failures are logged and never affect the job in the cache.
#[derive(Clone, Debug)]
pub struct ResultSync {
    store: Arc<dyn DurableStore>,
    io_pool: tokio::runtime::Handle,
}

impl ResultSync {
    pub fn new(store: Arc<dyn DurableStore>, io_pool: tokio::runtime::Handle) -> Self {
        Self { store, io_pool }
    }

    /// The store searches are mirrored into.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Spawns a one-shot mirror of a completed job, filed under a freshly created owner.
    ///
    /// Jobs that are not completed are skipped.
    pub fn mirror(&self, key: CacheKey, job: Job) -> JoinHandle<()> {
        let this = self.clone();
        self.io_pool.spawn(async move {
            if job.status != JobStatus::Completed {
                tracing::debug!(%key, status = job.status.as_str(), "not mirroring unfinished search");
                return;
            }

            let result = match this.store.create_owner().await {
                Ok(owner) => this.sync(key, &job, owner).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(outcome) => {
                    metric!(counter("sync.mirrored") += 1, "outcome" => outcome_name(outcome));
                    tracing::debug!(%key, ?outcome, "mirrored search result");
                }
                Err(err) => {
                    metric!(counter("sync.failed") += 1);
                    let error: &dyn std::error::Error = &err;
                    tracing::error!(error, %key, "failed to mirror search result");
                }
            }
        })
    }

    /// Stores the job for the given owner.
    ///
    /// Storing the same search for the same owner twice is a no-op that reports
    /// [`StoreOutcome::AlreadyExists`].
    pub async fn sync(
        &self,
        key: CacheKey,
        job: &Job,
        owner: Owner,
    ) -> Result<StoreOutcome, DurableError> {
        let record = SearchRecord {
            id: key,
            task_id: owner.task_id,
            query: job.query.clone(),
            result: job.result.clone().unwrap_or_default(),
            status: job.status,
            created_at: job.started_at,
            completed_at: job.completed_at,
        };
        self.store.store(record).await
    }
}

fn outcome_name(outcome: StoreOutcome) -> &'static str {
    match outcome {
        StoreOutcome::Stored => "stored",
        StoreOutcome::AlreadyExists => "exists",
    }
}
