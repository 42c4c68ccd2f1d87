//! Tracing subscriber initialization.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// An explicit verbosity level takes precedence; otherwise the usual
/// `RUST_LOG` filter applies, defaulting to `info`. `VETRINA_LOG_JSON=1`
/// switches to JSON output for log shippers.
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn init(level: Option<tracing::Level>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::default().add_directive(level.into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let json = std::env::var("VETRINA_LOG_JSON").is_ok_and(|value| value == "1" || value == "true");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| anyhow!("failed to initialize tracing subscriber: {err}"))
}
