//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    test still uses it.
//!
//!  - A [`Server`] stops serving when dropped. Hold it until all requests to it have been made.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// How long [`wait_for`] polls before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the searchjobs crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("searchjobs=trace,searchjobs_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Polls `poll` until it yields a value and returns that value.
///
/// # Panics
///
/// Panics if nothing was yielded within 10 seconds.
pub async fn wait_for<T, F, Fut>(mut poll: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let polling = async {
        loop {
            if let Some(value) = poll().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    match tokio::time::timeout(WAIT_TIMEOUT, polling).await {
        Ok(value) => value,
        Err(_) => panic!("condition not met within {WAIT_TIMEOUT:?}"),
    }
}

/// Counts how often an upstream was invoked.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Returns the number of calls so far.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates an upstream function that takes `delay` per call and echoes the query.
///
/// The returned [`CallCounter`] tracks the number of calls.
pub fn counting_upstream(
    delay: Duration,
) -> (
    CallCounter,
    impl Fn(&str) -> anyhow::Result<Value> + Send + Sync + 'static,
) {
    let counter = CallCounter::default();
    let upstream = {
        let counter = counter.clone();
        move |query: &str| -> anyhow::Result<Value> {
            counter.hit();
            std::thread::sleep(delay);
            Ok(json!({ "query": query }))
        }
    };
    (counter, upstream)
}

/// Creates an upstream function that always fails with `message`.
pub fn failing_upstream(
    message: &'static str,
) -> impl Fn(&str) -> anyhow::Result<Value> + Send + Sync + 'static {
    move |_query: &str| -> anyhow::Result<Value> { Err(anyhow::anyhow!(message)) }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Starts serving the given router.
    pub async fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses the loopback address the server is bound to.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.addr(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
