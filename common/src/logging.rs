//! Log setup for the coreup binaries.
//!
//! Both binaries run unattended: the engine as a long-lived service unit,
//! the finalizer as a short-lived child of the engine. Records therefore
//! go to stderr, where journald (or the invoking engine, which forwards
//! the finalizer's stderr) collects them. JSON mode is for fleets that
//! ship logs off-box; the plain mode stays compact enough to scan in
//! `journalctl`.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `level` seeds the filter. A `RUST_LOG` spec in the environment wins
/// over it, so individual targets can be turned up on a box without
/// touching configuration.
pub fn init(level: &str, json: bool) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(spec) => EnvFilter::try_new(spec)
            .map_err(|e| anyhow!("RUST_LOG is not a valid filter: {e}"))?,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| anyhow!("log level {level:?} is not a valid filter: {e}"))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow!("installing tracing subscriber: {e}"))
}
