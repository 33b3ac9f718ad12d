#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,mediarelay=debug,tower_http=info";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("installing tracing subscriber: {err}"))?;

    tracing::debug!(filter = DEFAULT_FILTER, "logging initialized");
    Ok(())
}
