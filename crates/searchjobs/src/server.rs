use std::net::SocketAddr;

use anyhow::{Context, Result};
use searchjobs_service::config::Config;
use searchjobs_service::metric;
use searchjobs_service::services::{SearchService, SharedServices};

use crate::endpoints;

/// Creates all services and runs the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("searchjobs-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let cpu_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("searchjobs-cpu")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("searchjobs-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config.bind.parse::<SocketAddr>()?;

    let services = io_pool
        .block_on(SharedServices::new(config, io_pool.handle().to_owned()))
        .context("failed to create search services")?;
    let service = SearchService::new(services, cpu_pool.handle().to_owned());

    let server = axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
