use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for searchjobs.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "searchjobs".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The backing store of the job cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackend {
    /// A process-local cache.
    ///
    /// Jobs are not shared between multiple searchjobs instances.
    Memory {
        /// Maximum number of jobs held in memory.
        #[serde(default = "default_memory_capacity")]
        capacity: u64,
    },
    /// A remote Redis server, shared between all instances pointing at it.
    Redis {
        /// Connection URL, e.g. `redis://localhost:6379`.
        url: String,
    },
}

fn default_memory_capacity() -> u64 {
    100_000
}

impl Default for CacheBackend {
    fn default() -> Self {
        Self::Memory {
            capacity: default_memory_capacity(),
        }
    }
}

/// Configuration of the job cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Where jobs are stored.
    pub backend: CacheBackend,

    /// How long a job stays visible after it was last written.
    ///
    /// Every state transition resets this window. Defaults to `50m`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Number of lock shards used to serialize concurrent starts of the same search.
    ///
    /// Two different searches only contend if they land in the same shard.
    pub lock_shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            ttl: Duration::from_secs(3000),
            lock_shards: 64,
        }
    }
}

/// Fine-tuning of search job execution.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    /// Age after which a job that is still pending is considered stuck.
    ///
    /// Status polls report such a job as failed, and a new search for the same query will run
    /// the computation again.
    #[serde(with = "humantime_serde")]
    pub max_pending_age: Duration,

    /// Hard upper limit for a single upstream computation.
    #[serde(with = "humantime_serde")]
    pub compute_timeout: Duration,

    /// The maximum number of searches that are computed concurrently.
    ///
    /// A value of `None` indicates no limit.
    pub max_concurrent_searches: Option<usize>,

    /// Queries shorter than this (after trimming whitespace) are rejected.
    pub min_query_length: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_pending_age: Duration::from_secs(15 * 60),
            compute_timeout: Duration::from_secs(15 * 60),
            max_concurrent_searches: Some(200),
            min_query_length: 1,
        }
    }
}

/// The upstream provider answering search queries.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamConfig {
    /// A stand-in provider that sleeps and then echoes the query back.
    Mock {
        /// How long every computation takes.
        #[serde(with = "humantime_serde", default = "default_mock_delay")]
        delay: Duration,
    },
    /// A provider reachable over HTTP.
    ///
    /// The query is sent as `{"query": "..."}` in a POST request, and the JSON response body is
    /// used as the search result.
    Http {
        url: String,
        #[serde(with = "humantime_serde", default = "default_http_timeout")]
        timeout: Duration,
    },
}

fn default_mock_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::Mock {
            delay: default_mock_delay(),
        }
    }
}

/// Where completed searches are mirrored to for later retrieval.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DurableConfig {
    /// Completed searches are not persisted.
    #[default]
    None,
    /// Completed searches are kept in process memory.
    Memory,
    /// Completed searches are written to a SQLite database file.
    Sqlite { path: PathBuf },
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The job cache.
    pub cache: CacheConfig,

    /// Search job execution.
    pub jobs: JobsConfig,

    /// The upstream search provider.
    pub upstream: UpstreamConfig,

    /// Persistence of completed searches.
    pub durable: DurableConfig,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig::default(),
            jobs: JobsConfig::default(),
            upstream: UpstreamConfig::default(),
            durable: DurableConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
