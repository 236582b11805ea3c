//! Provides the internal searchjobs services and a way to initialize them.
//!
//! The main [`SearchService`] is created from [`SharedServices`], which holds the cache store,
//! the upstream provider and the durable store as configured by the [`Config`].
//!
//! Mirroring results into the durable store happens on a separate asynchronous runtime dedicated
//! to I/O-intensive work.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{CacheStore, create_store};
use crate::config::Config;
use crate::durable::{DurableStore, create_durable_store};

pub mod search;
pub mod sync;
pub mod upstream;

pub use search::{SearchError, SearchService};
pub use upstream::Upstream;

/// The backends a [`SearchService`] is built from.
pub struct SharedServices {
    pub config: Config,
    pub store: Arc<dyn CacheStore>,
    pub upstream: Arc<dyn Upstream>,
    pub durable: Option<Arc<dyn DurableStore>>,
    pub io_pool: tokio::runtime::Handle,
}

impl SharedServices {
    pub async fn new(config: Config, io_pool: tokio::runtime::Handle) -> Result<Self> {
        let store = create_store(&config.cache).context("failed to create cache store")?;
        let upstream = upstream::create_upstream(&config.upstream);
        let durable = create_durable_store(&config.durable)
            .await
            .context("failed to open durable store")?;

        tracing::info!(?store, durable = durable.is_some(), "created search services");

        Ok(Self {
            config,
            store,
            upstream,
            durable,
            io_pool,
        })
    }
}
