//! Structured logging setup.
//!
//! Thin wrapper around `tracing_subscriber` so binaries embedding this crate
//! get consistent field-based logs without each one re-deriving an
//! `EnvFilter` setup. Library code never calls this itself; it only emits
//! `tracing` events and spans.

use crate::error::{MetabaseError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber with the given filter
/// directive (e.g. `"metabase=debug,info"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| MetabaseError::InvalidRequest(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| MetabaseError::InvalidRequest("logging already initialized".into()))
}
