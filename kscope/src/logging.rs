//! Logging setup.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Initialize the global subscriber once; later calls are no-ops so
/// library users and tests can both call this freely. `RUST_LOG`
/// narrows the filter as usual.
pub fn initialize_logging(log_file: Option<&Path>) -> Result<()> {
    if INIT_GUARD.set(()).is_err() {
        return Ok(());
    }

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file)
                .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());
            let _ = tracing_subscriber::registry().with(file_layer).try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
                .try_init();
        }
    }

    Ok(())
}
