//! Search jobs and their lifecycle.
//!
//! A [`Job`] is created [`pending`](JobStatus::Pending) when a search is started, and moves to
//! [`completed`](JobStatus::Completed) or [`failed`](JobStatus::Failed) exactly once, when the
//! upstream computation finishes. Jobs are stored as JSON in the
//! [`CacheStore`](crate::caching::CacheStore).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::caching::CacheKey;

/// The state of a [`Job`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A single search, as persisted in the cache store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// The query exactly as it was submitted.
    pub query: String,
    pub status: JobStatus,
    /// The upstream result, only set once completed.
    #[serde(default)]
    pub result: Option<Value>,
    /// What went wrong, only set once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the search was started.
    #[serde(rename = "timestamp")]
    pub started_at: DateTime<Utc>,
    /// When the search reached its terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new pending job.
    pub fn pending(query: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            query: query.into(),
            status: JobStatus::Pending,
            result: None,
            error: None,
            started_at: now,
            completed_at: None,
        }
    }

    /// Transitions this job to [`JobStatus::Completed`].
    pub fn complete(self, result: Value, now: DateTime<Utc>) -> Self {
        let completed_at = self.finish_time(now);
        Self {
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
            completed_at: Some(completed_at),
            ..self
        }
    }

    /// Transitions this job to [`JobStatus::Failed`].
    pub fn fail(self, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        let completed_at = self.finish_time(now);
        Self {
            status: JobStatus::Failed,
            result: None,
            error: Some(error.into()),
            completed_at: Some(completed_at),
            ..self
        }
    }

    // wall clocks can jump backwards, but a job never finishes before it started
    fn finish_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(self.started_at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status != JobStatus::Pending
    }

    /// Whether this job has been pending for longer than `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        now.signed_duration_since(self.started_at)
            .to_std()
            .is_ok_and(|age| age > max_age)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The answer to starting a search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub task_id: CacheKey,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the answer was served from a previously completed search.
    pub from_cache: bool,
}

impl StartResponse {
    pub(crate) fn pending(task_id: CacheKey, message: &str) -> Self {
        Self {
            task_id,
            status: JobStatus::Pending,
            message: Some(message.to_owned()),
            result: None,
            error: None,
            from_cache: false,
        }
    }

    /// Reports a terminal job directly.
    pub(crate) fn finished(task_id: CacheKey, job: Job, from_cache: bool) -> Self {
        Self {
            task_id,
            status: job.status,
            message: None,
            result: job.result,
            error: job.error,
            from_cache,
        }
    }
}

/// What is known about a search, as reported to a status poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchStatus {
    Pending {
        query: String,
        timestamp: DateTime<Utc>,
    },
    Completed {
        query: String,
        timestamp: DateTime<Utc>,
        result: Value,
        completed_at: Option<DateTime<Utc>>,
    },
    Failed {
        query: String,
        timestamp: DateTime<Utc>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },
    NotFound {
        message: String,
    },
}

impl SearchStatus {
    pub fn not_found() -> Self {
        Self::NotFound {
            message: "Search task not found".into(),
        }
    }

    /// Describes a stored job.
    ///
    /// A job that has been pending for longer than `max_pending_age` is reported as failed. The
    /// stored job itself is left untouched.
    pub fn from_job(job: Job, now: DateTime<Utc>, max_pending_age: Duration) -> Self {
        if job.is_stale(now, max_pending_age) {
            return Self::Failed {
                error: format!(
                    "Search timed out: still pending after {}",
                    humantime::format_duration(max_pending_age)
                ),
                query: job.query,
                timestamp: job.started_at,
                completed_at: None,
            };
        }

        match job.status {
            JobStatus::Pending => Self::Pending {
                query: job.query,
                timestamp: job.started_at,
            },
            JobStatus::Completed => Self::Completed {
                query: job.query,
                timestamp: job.started_at,
                result: job.result.unwrap_or_default(),
                completed_at: job.completed_at,
            },
            JobStatus::Failed => Self::Failed {
                query: job.query,
                timestamp: job.started_at,
                error: job.error.unwrap_or_default(),
                completed_at: job.completed_at,
            },
        }
    }
}

/// The answer to a status poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: String,
    #[serde(flatten)]
    pub status: SearchStatus,
}
