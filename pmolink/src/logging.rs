//! Initialisation du logging pour les applications qui embarquent pmolink.
//!
//! The library itself only emits `tracing` records; installing a subscriber
//! is left to the host. [`init_logging`] is a convenience for binaries and
//! tests.

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::errors::{LinkError, Result};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,pmolink=debug";

/// Installs a console subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Fails if a global subscriber is
/// already installed.
pub fn init_logging(default_filter: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .map_err(|e| LinkError::config(format!("invalid log filter: {e}")))?;

    Registry::default()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .map_err(|e| LinkError::config(format!("logging already initialised: {e}")))
}
