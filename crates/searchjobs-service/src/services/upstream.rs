//! The providers that actually answer search queries.
//!
//! An [`Upstream`] is a plain blocking function of the query. It is always invoked on a blocking
//! thread, never on an async worker.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::{Value, json};

use crate::config::UpstreamConfig;

/// Computes the result of a search query.
///
/// This may block for a long time and may fail. Any `Fn(&str) -> anyhow::Result<Value>` is an
/// `Upstream`.
pub trait Upstream: Send + Sync + 'static {
    fn compute(&self, query: &str) -> anyhow::Result<Value>;
}

impl<F> Upstream for F
where
    F: Fn(&str) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn compute(&self, query: &str) -> anyhow::Result<Value> {
        self(query)
    }
}

/// Creates the [`Upstream`] described by the config.
pub fn create_upstream(config: &UpstreamConfig) -> Arc<dyn Upstream> {
    match config {
        UpstreamConfig::Mock { delay } => Arc::new(MockUpstream::new(*delay)),
        UpstreamConfig::Http { url, timeout } => Arc::new(HttpUpstream::new(url, *timeout)),
    }
}

/// A stand-in provider that takes `delay` and then echoes the query.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    delay: Duration,
}

impl MockUpstream {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Upstream for MockUpstream {
    fn compute(&self, query: &str) -> anyhow::Result<Value> {
        tracing::info!(query, "mock upstream received query");
        std::thread::sleep(self.delay);
        Ok(json!({
            "message": "API worked.",
            "query": query,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

/// A provider reachable over HTTP.
///
/// Each query is POSTed as `{"query": "..."}`, and the JSON response body is the result. Any
/// non-success status is an error.
pub struct HttpUpstream {
    url: String,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpUpstream {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: OnceLock::new(),
        }
    }

    // The blocking client must be built off the async runtime, so this is deferred to the first
    // computation.
    fn client(&self) -> anyhow::Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("searchjobs/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Upstream for HttpUpstream {
    fn compute(&self, query: &str) -> anyhow::Result<Value> {
        let response = self
            .client()?
            .post(&self.url)
            .json(&json!({ "query": query }))
            .send()
            .with_context(|| format!("failed to reach upstream at {}", self.url))?
            .error_for_status()?;
        response
            .json()
            .context("upstream responded with invalid JSON")
    }
}
