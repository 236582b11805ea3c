//! Searchjobs.
//!
//! Searchjobs is a standalone web service that runs expensive search queries in the background.
//! Identical queries are computed only once and their results are cached. Clients start a search
//! and then poll for its outcome using the returned task id.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;


fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
