//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use searchjobs_service::config::Config;
use searchjobs_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Searchjobs commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server.
    Run,

    /// Check whether a running server is healthy.
    Healthcheck {
        /// Address of the server to check. Defaults to the configured `bind` address.
        #[arg(long, value_name = "ADDR")]
        addr: Option<SocketAddr>,

        /// Seconds to wait for a response.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "searchjobs", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    if let Command::Healthcheck { addr, timeout } = cli.command {
        return healthcheck::healthcheck(config, addr, timeout);
    }

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("searchjobs@", env!("CARGO_PKG_VERSION")).into()),
        enable_logs: true,
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        let environment = config.metrics.environment_tag.clone().and_then(|tag| {
            sentry
                .options()
                .environment
                .as_ref()
                .map(|name| (tag, name.to_string()))
        });
        tags.extend(hostname);
        tags.extend(environment);

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    server::run(config).context("failed to start the server")?;

    Ok(())
}
