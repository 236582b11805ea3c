//! The deduplicating search engine.
//!
//! Searches work like this:
//! - [`SearchService::start`] derives the [`CacheKey`] of the query, and either answers from the
//!   cache, joins a search that is already running, or records a new pending job and hands the
//!   computation off to the `cpu_pool`. It never waits for a computation to finish.
//! - The `task_id` of the answer can then be polled using [`SearchService::status`].
//!
//! At most one computation per key runs in a single [`SearchService`]. Multiple instances
//! sharing a remote store additionally see each other's pending jobs and do not start a
//! computation of their own while such a job is fresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use sentry::SentryFutureExt;
use serde_json::Value;

use crate::caching::{CacheKey, CacheStore, KeyedLocks, StoreError};
use crate::config::JobsConfig;
use crate::jobs::{Job, JobStatus, SearchStatus, StartResponse, StatusResponse};
use crate::services::SharedServices;
use crate::services::sync::ResultSync;
use crate::services::upstream::Upstream;
use crate::utils::futures::{CallOnDrop, m, measure};

const STARTED: &str = "Search started successfully";
const ALREADY_RUNNING: &str = "Search is already in progress";

/// An error starting a search.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    /// The query was rejected before any work was done.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The service is already computing the maximum number of searches.
    #[error("maximum number of concurrent searches reached")]
    TooManySearches,
}

/// A computation running in this engine.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    started: Instant,
}

type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlight>>>;

fn lock_in_flight(map: &InFlightMap) -> std::sync::MutexGuard<'_, HashMap<CacheKey, InFlight>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The search engine.
///
/// This is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<SearchServiceInner>,
}

struct SearchServiceInner {
    config: JobsConfig,
    ttl: Duration,

    store: Arc<dyn CacheStore>,
    locks: KeyedLocks,
    upstream: Arc<dyn Upstream>,
    sync: Option<ResultSync>,

    cpu_pool: tokio::runtime::Handle,
    in_flight: InFlightMap,
    current_searches: Arc<AtomicUsize>,
    search_taskmon: tokio_metrics::TaskMonitor,
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchService")
            .field("store", &self.inner.store)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl SearchService {
    /// Creates a new [`SearchService`].
    ///
    /// Background computations are spawned onto `cpu_pool`, their blocking upstream calls run on
    /// its blocking threads.
    pub fn new(services: SharedServices, cpu_pool: tokio::runtime::Handle) -> Self {
        let SharedServices {
            config,
            store,
            upstream,
            durable,
            io_pool,
        } = services;

        let search_taskmon = tokio_metrics::TaskMonitor::new();
        {
            let search_taskmon = search_taskmon.clone();
            io_pool.spawn(async move {
                for interval in search_taskmon.intervals() {
                    record_task_metrics("search", &interval);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }

        let sync = durable.map(|store| ResultSync::new(store, io_pool));

        let inner = SearchServiceInner {
            ttl: config.cache.ttl,
            locks: KeyedLocks::new(config.cache.lock_shards),
            config: config.jobs,

            store,
            upstream,
            sync,

            cpu_pool,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            current_searches: Arc::new(AtomicUsize::new(0)),
            search_taskmon,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// The durable store completed searches are mirrored into, if any.
    pub fn result_sync(&self) -> Option<&ResultSync> {
        self.inner.sync.as_ref()
    }

    /// The number of computations currently running in this engine.
    pub fn in_flight(&self) -> usize {
        lock_in_flight(&self.inner.in_flight).len()
    }

    /// Starts a search for `query`, or joins the one already known.
    ///
    /// With `force_refresh`, a stored result is discarded and computed anew. A search that is
    /// currently running is always joined, never restarted.
    ///
    /// If the cache store cannot be reached, the query is computed right away and its outcome is
    /// returned directly, without being recorded anywhere.
    pub async fn start(
        &self,
        query: &str,
        force_refresh: bool,
    ) -> Result<StartResponse, SearchError> {
        self.validate(query)?;

        let key = CacheKey::from_query(query);
        let guard = self.inner.locks.acquire(&key).await;

        if lock_in_flight(&self.inner.in_flight).contains_key(&key) {
            metric!(counter("searches.joined") += 1, "source" => "local");
            return Ok(StartResponse::pending(key, ALREADY_RUNNING));
        }

        match self.lookup(key, force_refresh).await {
            Ok(Some(response)) => return Ok(response),
            Ok(None) => {}
            Err(err) => {
                drop(guard);
                return self.bypass(key, query, err).await;
            }
        }

        // a rejected search must not leave a pending job behind
        let slot = self.acquire_slot()?;

        let job = Job::pending(query, Utc::now());
        if let Err(err) = self.inner.write(key, &job).await {
            drop(slot);
            drop(guard);
            return self.bypass(key, query, err).await;
        }

        self.spawn_search(key, job, slot);
        metric!(counter("searches.started") += 1);

        Ok(StartResponse::pending(key, STARTED))
    }

    /// Reports what is known about the search with the given `task_id`.
    ///
    /// Ids that are not a valid digest are simply unknown. A stored job that cannot be read is
    /// reported as unknown as well.
    pub async fn status(&self, task_id: &str) -> Result<StatusResponse, StoreError> {
        let Ok(key) = task_id.parse::<CacheKey>() else {
            return Ok(StatusResponse {
                task_id: task_id.to_owned(),
                status: SearchStatus::not_found(),
            });
        };

        let status = match self.read(key).await? {
            Some(job) => {
                SearchStatus::from_job(job, Utc::now(), self.inner.config.max_pending_age)
            }
            None => SearchStatus::not_found(),
        };

        Ok(StatusResponse {
            task_id: key.to_string(),
            status,
        })
    }

    /// Removes the job with the given `task_id` from the cache.
    ///
    /// A computation that is still running for it is not affected, and records its result once
    /// done.
    pub async fn invalidate(&self, task_id: &str) -> Result<(), StoreError> {
        let Ok(key) = task_id.parse::<CacheKey>() else {
            return Ok(());
        };
        metric!(counter("searches.invalidated") += 1);
        self.inner.store.delete(&key.store_key()).await
    }

    /// Wipes the whole cache store.
    ///
    /// See [`CacheStore::clear`]. Running computations are not affected.
    pub async fn clear(&self) -> Result<(), StoreError> {
        tracing::warn!("clearing the entire cache store");
        metric!(counter("searches.cleared") += 1);
        self.inner.store.clear().await
    }

    fn validate(&self, query: &str) -> Result<(), SearchError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(SearchError::InvalidQuery("query must not be empty".into()));
        }
        let min = self.inner.config.min_query_length;
        if trimmed.chars().count() < min {
            return Err(SearchError::InvalidQuery(format!(
                "query must be at least {min} characters long"
            )));
        }
        Ok(())
    }

    /// Decides from the stored job whether a new computation is needed.
    ///
    /// Returns the answer for the caller if not.
    async fn lookup(
        &self,
        key: CacheKey,
        force_refresh: bool,
    ) -> Result<Option<StartResponse>, StoreError> {
        // the pending job written for the new computation replaces the stored one
        if force_refresh {
            return Ok(None);
        }

        let Some(job) = self.read(key).await? else {
            return Ok(None);
        };

        match job.status {
            JobStatus::Completed => {
                metric!(counter("searches.cache_hit") += 1);
                Ok(Some(StartResponse::finished(key, job, true)))
            }
            JobStatus::Pending
                if !job.is_stale(Utc::now(), self.inner.config.max_pending_age) =>
            {
                // no local computation, so some other instance sharing the store owns it
                metric!(counter("searches.joined") += 1, "source" => "remote");
                Ok(Some(StartResponse::pending(key, ALREADY_RUNNING)))
            }
            JobStatus::Pending | JobStatus::Failed => Ok(None),
        }
    }

    async fn read(&self, key: CacheKey) -> Result<Option<Job>, StoreError> {
        let Some(bytes) = self.inner.store.get(&key.store_key()).await? else {
            return Ok(None);
        };
        match Job::decode(&bytes) {
            Ok(job) => Ok(Some(job)),
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::error!(error, %key, "malformed job in cache store");
                Ok(None)
            }
        }
    }

    fn acquire_slot(&self) -> Result<CallOnDrop, SearchError> {
        let current_searches = Arc::clone(&self.inner.current_searches);
        let max = self.inner.config.max_concurrent_searches;

        let previous = current_searches
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| match max {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .map_err(|_| {
                metric!(counter("searches.rejected") += 1);
                SearchError::TooManySearches
            })?;
        metric!(gauge("searches.in_flight") = previous as u64 + 1);

        Ok(CallOnDrop::new(move || {
            current_searches.fetch_sub(1, Ordering::Relaxed);
        }))
    }

    /// Computes the query right away, for when the cache store is not usable.
    async fn bypass(
        &self,
        key: CacheKey,
        query: &str,
        err: StoreError,
    ) -> Result<StartResponse, SearchError> {
        let error: &dyn std::error::Error = &err;
        tracing::warn!(error, %key, "cache store failed, computing search directly");
        metric!(counter("searches.bypassed") += 1);

        let slot = self.acquire_slot()?;
        let job = self.inner.execute(Job::pending(query, Utc::now())).await;
        drop(slot);

        Ok(StartResponse::finished(key, job, false))
    }

    fn spawn_search(&self, key: CacheKey, job: Job, slot: CallOnDrop) {
        let started = Instant::now();
        lock_in_flight(&self.inner.in_flight).insert(key, InFlight { started });

        let in_flight = Arc::clone(&self.inner.in_flight);
        let token = CallOnDrop::new(move || {
            drop(slot);
            if let Some(entry) = lock_in_flight(&in_flight).remove(&key) {
                metric!(timer("searches.duration") = entry.started.elapsed());
            }
        });

        let hub = Arc::new(sentry::Hub::new_from_top(sentry::Hub::current()));
        let inner = Arc::clone(&self.inner);
        let search_future = async move {
            metric!(timer("searches.first_poll") = started.elapsed());

            let job = inner.execute(job).await;
            {
                // a start must never see the finished job while the search is still in flight
                let _guard = inner.locks.acquire(&key).await;
                if let Err(err) = inner.write(key, &job).await {
                    let error: &dyn std::error::Error = &err;
                    tracing::error!(error, %key, "failed to record finished search");
                }
                drop(token);
            }

            if let Some(sync) = &inner.sync {
                if job.status == JobStatus::Completed {
                    sync.mirror(key, job);
                }
            }
        }
        .bind_hub(hub);

        self.inner
            .cpu_pool
            .spawn(self.inner.search_taskmon.instrument(search_future));
    }
}

impl SearchServiceInner {
    async fn write(&self, key: CacheKey, job: &Job) -> Result<(), StoreError> {
        let bytes = job.encode().map_err(|err| StoreError::Backend(err.into()))?;
        self.store.set(&key.store_key(), bytes, self.ttl).await
    }

    /// Runs the upstream computation and moves `job` into its terminal state.
    async fn execute(&self, job: Job) -> Job {
        let result = measure("search", m::result, self.compute(job.query.clone())).await;
        let now = Utc::now();
        match result {
            Ok(value) => job.complete(value, now),
            Err(err) => {
                let error: &dyn std::error::Error = err.as_ref();
                tracing::error!(error, query = %job.query, "search failed");
                job.fail(format!("{err:#}"), now)
            }
        }
    }

    async fn compute(&self, query: String) -> anyhow::Result<Value> {
        let upstream = Arc::clone(&self.upstream);
        let timeout = self.config.compute_timeout;

        // A blocking computation cannot be interrupted. On timeout, it keeps its thread until it
        // returns, and its result is discarded.
        let computation = tokio::task::spawn_blocking(move || upstream.compute(&query));
        match tokio::time::timeout(timeout, computation).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                anyhow::bail!("search computation panicked")
            }
            Ok(Err(_)) => anyhow::bail!("search computation was cancelled"),
            Err(_elapsed) => anyhow::bail!(
                "search timed out after {}",
                humantime::format_duration(timeout)
            ),
        }
    }
}

trait ToMaxingI64: TryInto<i64> + Copy {
    fn to_maxing_i64(self) -> i64 {
        self.try_into().unwrap_or(i64::MAX)
    }
}

impl<T: TryInto<i64> + Copy> ToMaxingI64 for T {}

/// Reports the metrics of a [`tokio_metrics::TaskMonitor`] interval.
pub fn record_task_metrics(name: &str, metrics: &tokio_metrics::TaskMetrics) {
    metric!(counter("tasks.instrumented_count") += metrics.instrumented_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.dropped_count") += metrics.dropped_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.first_poll_count") += metrics.first_poll_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_first_poll_delay") += metrics.total_first_poll_delay.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_idle_duration") += metrics.total_idle_duration.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_poll_count") += metrics.total_poll_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_poll_duration") += metrics.total_poll_duration.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_slow_poll_count") += metrics.total_slow_poll_count.to_maxing_i64(), "taskname" => name);
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use futures::future;
    use serde_json::json;

    use super::*;
    use crate::caching::InMemoryStore;
    use crate::config::Config;
    use crate::durable::{DurableStore, InMemoryDurableStore};

    fn create_service(
        config: Config,
        store: Arc<dyn CacheStore>,
        upstream: impl Upstream,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> SearchService {
        searchjobs_test::setup();
        let handle = tokio::runtime::Handle::current();
        let services = SharedServices {
            config,
            store,
            upstream: Arc::new(upstream),
            durable,
            io_pool: handle.clone(),
        };
        SearchService::new(services, handle)
    }

    fn memory_store() -> Arc<dyn CacheStore> {
        Arc::new(InMemoryStore::new(1000))
    }

    async fn wait_finished(service: &SearchService, key: CacheKey) -> SearchStatus {
        let task_id = key.to_string();
        searchjobs_test::wait_for(|| {
            let service = service.clone();
            let task_id = task_id.clone();
            async move {
                match service.status(&task_id).await.ok()?.status {
                    SearchStatus::Pending { .. } => None,
                    status => Some(status),
                }
            }
        })
        .await
    }

    async fn wait_idle(service: &SearchService) {
        searchjobs_test::wait_for(|| {
            let idle = service.in_flight() == 0;
            async move { idle.then_some(()) }
        })
        .await
    }

    #[derive(Debug)]
    struct UnavailableStore;

    fn unavailable() -> StoreError {
        StoreError::Unavailable(anyhow::anyhow!("connection refused"))
    }

    #[async_trait]
    impl CacheStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(unavailable())
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
            Err(unavailable())
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(unavailable())
        }
        async fn clear(&self) -> Result<(), StoreError> {
            Err(unavailable())
        }
    }

    #[tokio::test]
    async fn test_concurrent_starts_compute_once() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::from_millis(200));
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let responses =
            future::join_all((0..10).map(|_| service.start("rust async runtimes", false))).await;

        let key = CacheKey::from_query("rust async runtimes");
        let mut started = 0;
        for response in responses {
            let response = response.unwrap();
            assert_eq!(response.task_id, key);
            assert_eq!(response.status, JobStatus::Pending);
            assert!(!response.from_cache);
            if response.message.as_deref() == Some(STARTED) {
                started += 1;
            } else {
                assert_eq!(response.message.as_deref(), Some(ALREADY_RUNNING));
            }
        }
        assert_eq!(started, 1);

        let status = wait_finished(&service, key).await;
        let SearchStatus::Completed { query, result, .. } = status else {
            panic!("unexpected status {status:?}");
        };
        assert_eq!(query, "rust async runtimes");
        assert_eq!(result["query"], "rust async runtimes");
        assert_eq!(counter.get(), 1);

        wait_idle(&service).await;
    }

    #[tokio::test]
    async fn test_completed_is_served_from_cache() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let first = service.start("cached", false).await.unwrap();
        wait_finished(&service, first.task_id).await;
        wait_idle(&service).await;

        let second = service.start("cached", false).await.unwrap();
        assert_eq!(second.task_id, first.task_id);
        assert_eq!(second.status, JobStatus::Completed);
        assert!(second.from_cache);
        assert_eq!(second.result.unwrap()["query"], "cached");
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let first = service.start("refresh", false).await.unwrap();
        wait_finished(&service, first.task_id).await;
        wait_idle(&service).await;

        let refreshed = service.start("refresh", true).await.unwrap();
        assert_eq!(refreshed.status, JobStatus::Pending);
        assert_eq!(refreshed.message.as_deref(), Some(STARTED));
        assert!(!refreshed.from_cache);

        wait_finished(&service, refreshed.task_id).await;
        wait_idle(&service).await;
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_right_after_completion() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), memory_store(), upstream, None);

        for round in 1..=20 {
            let first = service.start("refresh", false).await.unwrap();
            wait_finished(&service, first.task_id).await;

            let refreshed = service.start("refresh", true).await.unwrap();
            assert_eq!(refreshed.message.as_deref(), Some(STARTED));

            wait_finished(&service, refreshed.task_id).await;
            wait_idle(&service).await;
            assert_eq!(counter.get(), 2 * round);
        }
    }

    #[tokio::test]
    async fn test_rejected_refresh_keeps_result() {
        let mut config = Config::default();
        config.jobs.max_concurrent_searches = Some(1);
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::from_millis(200));
        let service = create_service(config, memory_store(), upstream, None);

        let cached = service.start("cached", false).await.unwrap();
        wait_finished(&service, cached.task_id).await;
        wait_idle(&service).await;

        let busy = service.start("busy", false).await.unwrap();
        assert_eq!(busy.message.as_deref(), Some(STARTED));

        let err = service.start("cached", true).await.unwrap_err();
        assert!(matches!(err, SearchError::TooManySearches));

        let status = service.status(&cached.task_id.to_string()).await.unwrap();
        let SearchStatus::Completed { result, .. } = status.status else {
            panic!("unexpected status {:?}", status.status);
        };
        assert_eq!(result["query"], "cached");

        wait_finished(&service, busy.task_id).await;
        wait_idle(&service).await;
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_joins_running_search() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::from_millis(200));
        let service = create_service(Config::default(), memory_store(), upstream, None);

        service.start("running", false).await.unwrap();
        let joined = service.start("running", true).await.unwrap();
        assert_eq!(joined.status, JobStatus::Pending);
        assert_eq!(joined.message.as_deref(), Some(ALREADY_RUNNING));

        wait_finished(&service, joined.task_id).await;
        wait_idle(&service).await;
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn test_status_of_unknown_search() {
        let (_, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let unknown = CacheKey::from_query("never started").to_string();
        let response = service.status(&unknown).await.unwrap();
        assert_eq!(response.task_id, unknown);
        assert_eq!(response.status, SearchStatus::not_found());

        let response = service.status("definitely not a digest").await.unwrap();
        assert_eq!(response.task_id, "definitely not a digest");
        assert_eq!(response.status, SearchStatus::not_found());
    }

    #[tokio::test]
    async fn test_pending_status_while_running() {
        let (_, upstream) = searchjobs_test::counting_upstream(Duration::from_millis(200));
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let response = service.start("slow", false).await.unwrap();
        let status = service.status(&response.task_id.to_string()).await.unwrap();
        let SearchStatus::Pending { query, .. } = status.status else {
            panic!("unexpected status {:?}", status.status);
        };
        assert_eq!(query, "slow");

        wait_finished(&service, response.task_id).await;
        wait_idle(&service).await;
    }

    #[tokio::test]
    async fn test_failed_search_is_retried() {
        let upstream = searchjobs_test::failing_upstream("upstream exploded");
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let response = service.start("doomed", false).await.unwrap();
        let status = wait_finished(&service, response.task_id).await;
        let SearchStatus::Failed {
            error,
            completed_at,
            ..
        } = status
        else {
            panic!("unexpected status {status:?}");
        };
        assert_eq!(error, "upstream exploded");
        assert!(completed_at.is_some());
        wait_idle(&service).await;

        // a failed job is not a cached answer, starting again recomputes
        let again = service.start("doomed", false).await.unwrap();
        assert_eq!(again.message.as_deref(), Some(STARTED));
        wait_finished(&service, again.task_id).await;
        wait_idle(&service).await;
    }

    #[tokio::test]
    async fn test_panicking_upstream() {
        let upstream = |_: &str| -> anyhow::Result<Value> { panic!("upstream bug") };
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let response = service.start("panic", false).await.unwrap();
        let status = wait_finished(&service, response.task_id).await;
        let SearchStatus::Failed { error, .. } = status else {
            panic!("unexpected status {status:?}");
        };
        assert_eq!(error, "search computation panicked");
        wait_idle(&service).await;
    }

    #[tokio::test]
    async fn test_compute_timeout() {
        let mut config = Config::default();
        config.jobs.compute_timeout = Duration::from_millis(50);
        let (_, upstream) = searchjobs_test::counting_upstream(Duration::from_millis(300));
        let service = create_service(config, memory_store(), upstream, None);

        let response = service.start("too slow", false).await.unwrap();
        let status = wait_finished(&service, response.task_id).await;
        let SearchStatus::Failed { error, .. } = status else {
            panic!("unexpected status {status:?}");
        };
        assert_eq!(error, "search timed out after 50ms");
        wait_idle(&service).await;
    }

    #[tokio::test]
    async fn test_invalid_queries() {
        let mut config = Config::default();
        config.jobs.min_query_length = 3;
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(config, memory_store(), upstream, None);

        for query in ["", "   ", "ab", " ab "] {
            let err = service.start(query, false).await.unwrap_err();
            assert!(matches!(err, SearchError::InvalidQuery(_)), "{query:?}");
        }
        assert_eq!(counter.get(), 0);
        assert_eq!(service.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_max_concurrent_searches() {
        let mut config = Config::default();
        config.jobs.max_concurrent_searches = Some(1);
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::from_millis(200));
        let service = create_service(config, memory_store(), upstream, None);

        let first = service.start("first", false).await.unwrap();
        assert_eq!(first.message.as_deref(), Some(STARTED));

        let err = service.start("second", false).await.unwrap_err();
        assert!(matches!(err, SearchError::TooManySearches));
        // nothing was recorded for the rejected search
        let status = service
            .status(&CacheKey::from_query("second").to_string())
            .await
            .unwrap();
        assert_eq!(status.status, SearchStatus::not_found());

        // joining a running search does not need a new slot
        let joined = service.start("first", false).await.unwrap();
        assert_eq!(joined.message.as_deref(), Some(ALREADY_RUNNING));

        wait_finished(&service, first.task_id).await;
        wait_idle(&service).await;

        let second = service.start("second", false).await.unwrap();
        assert_eq!(second.message.as_deref(), Some(STARTED));
        wait_finished(&service, second.task_id).await;
        wait_idle(&service).await;
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_expired_job_is_cold() {
        let mut config = Config::default();
        config.cache.ttl = Duration::from_millis(100);
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(config, memory_store(), upstream, None);

        let response = service.start("ephemeral", false).await.unwrap();
        wait_finished(&service, response.task_id).await;
        wait_idle(&service).await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = service
            .status(&response.task_id.to_string())
            .await
            .unwrap();
        assert_eq!(status.status, SearchStatus::not_found());

        let again = service.start("ephemeral", false).await.unwrap();
        assert_eq!(again.message.as_deref(), Some(STARTED));
        assert!(!again.from_cache);
        wait_finished(&service, again.task_id).await;
        wait_idle(&service).await;
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_pending_job_of_other_instance() {
        let store = memory_store();
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), Arc::clone(&store), upstream, None);

        let fresh = CacheKey::from_query("fresh elsewhere");
        let job = Job::pending("fresh elsewhere", Utc::now());
        store
            .set(&fresh.store_key(), job.encode().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let response = service.start("fresh elsewhere", false).await.unwrap();
        assert_eq!(response.message.as_deref(), Some(ALREADY_RUNNING));
        assert_eq!(service.in_flight(), 0);

        // a job stuck in pending for too long is reported as failed and started anew
        let stale = CacheKey::from_query("stale elsewhere");
        let job = Job::pending("stale elsewhere", Utc::now() - ChronoDuration::hours(1));
        store
            .set(&stale.store_key(), job.encode().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let status = service.status(&stale.to_string()).await.unwrap();
        assert!(matches!(status.status, SearchStatus::Failed { .. }));

        let response = service.start("stale elsewhere", false).await.unwrap();
        assert_eq!(response.message.as_deref(), Some(STARTED));
        let status = wait_finished(&service, stale).await;
        assert!(matches!(status, SearchStatus::Completed { .. }));
        wait_idle(&service).await;
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn test_malformed_job() {
        let store = memory_store();
        let (_, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), Arc::clone(&store), upstream, None);

        let key = CacheKey::from_query("garbled");
        store
            .set(&key.store_key(), b"{not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let status = service.status(&key.to_string()).await.unwrap();
        assert_eq!(status.status, SearchStatus::not_found());

        let response = service.start("garbled", false).await.unwrap();
        assert_eq!(response.message.as_deref(), Some(STARTED));
        wait_finished(&service, key).await;
        wait_idle(&service).await;
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(
            Config::default(),
            Arc::new(UnavailableStore),
            upstream,
            None,
        );

        let response = service.start("offline", false).await.unwrap();
        assert_eq!(response.status, JobStatus::Completed);
        assert!(!response.from_cache);
        assert_eq!(response.result.unwrap()["query"], "offline");
        assert_eq!(counter.get(), 1);
        assert_eq!(service.in_flight(), 0);

        let failing = create_service(
            Config::default(),
            Arc::new(UnavailableStore),
            searchjobs_test::failing_upstream("nope"),
            None,
        );
        let response = failing.start("offline", false).await.unwrap();
        assert_eq!(response.status, JobStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("nope"));

        let err = service
            .status(&response.task_id.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let (counter, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(Config::default(), memory_store(), upstream, None);

        let a = service.start("a", false).await.unwrap();
        let b = service.start("b", false).await.unwrap();
        wait_finished(&service, a.task_id).await;
        wait_finished(&service, b.task_id).await;
        wait_idle(&service).await;

        service.invalidate(&a.task_id.to_string()).await.unwrap();
        service.invalidate("not a digest").await.unwrap();

        let status = service.status(&a.task_id.to_string()).await.unwrap();
        assert_eq!(status.status, SearchStatus::not_found());
        let status = service.status(&b.task_id.to_string()).await.unwrap();
        assert!(matches!(status.status, SearchStatus::Completed { .. }));

        service.clear().await.unwrap();
        let status = service.status(&b.task_id.to_string()).await.unwrap();
        assert_eq!(status.status, SearchStatus::not_found());
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_completed_searches_are_mirrored() {
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::default());
        let (_, upstream) = searchjobs_test::counting_upstream(Duration::ZERO);
        let service = create_service(
            Config::default(),
            memory_store(),
            upstream,
            Some(Arc::clone(&durable)),
        );

        let response = service.start("remember me", false).await.unwrap();
        wait_finished(&service, response.task_id).await;

        let records = searchjobs_test::wait_for(|| {
            let durable = Arc::clone(&durable);
            async move {
                let records = durable.recent(10).await.ok()?;
                (!records.is_empty()).then_some(records)
            }
        })
        .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, response.task_id);
        assert_eq!(records[0].query, "remember me");
        assert_eq!(records[0].result["query"], json!("remember me"));
    }
}
