//! The search job engine behind the `searchjobs` web service.
//!
//! A search is identified by the SHA-256 digest of its query text. The [`SearchService`]
//! guarantees that at most one upstream computation runs per digest, records every search as a
//! [`Job`] inside a TTL-bounded [`CacheStore`], and answers status polls without ever waiting on
//! a running computation.
//!
//! [`SearchService`]: services::search::SearchService
//! [`Job`]: jobs::Job
//! [`CacheStore`]: caching::CacheStore

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod durable;
pub mod jobs;
pub mod logging;
pub mod services;
pub mod utils;
