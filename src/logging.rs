//! # Structured Logging
//!
//! Environment-aware tracing initialization for binaries and tests. The
//! filter comes from `RUST_LOG` (defaulting to `info`); setting
//! `RELAY_LOG_FORMAT=json` switches to machine-readable output.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process. Safe to call from
/// multiple entry points; later calls are no-ops, and an already-installed
/// global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let json = std::env::var("RELAY_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if json {
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().json().with_target(true))
                .with(filter)
                .try_init();
        } else {
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(filter)
                .try_init();
        }
    });
}
