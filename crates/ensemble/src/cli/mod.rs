//! CLI utilities and helpers

pub mod commands;
pub mod context;
pub mod handlers;

use anyhow::Result;
pub use commands::build_cli;
use tracing_subscriber::EnvFilter;

/// Whether `ENSEMBLE_DEBUG` asks for verbose tracing.
pub fn debug_requested() -> bool {
    std::env::var("ENSEMBLE_DEBUG").is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Initialize tracing subscriber for logging
///
/// `RUST_LOG` wins when set; otherwise `warn`, or `debug` under
/// `ENSEMBLE_DEBUG`. Output goes to stderr so stdout stays parseable.
///
/// # Errors
/// Returns an error if a subscriber is already installed
pub fn init_tracing() -> Result<()> {
    let default = if debug_requested() { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))
}
