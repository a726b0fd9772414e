//! Global `tracing` subscriber setup.
//!
//! Events go to stderr so that stdout stays clean for JSON output. The
//! filter defaults to `info` and honours `RUST_LOG`.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Default filter directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber with the default filter.
///
/// # Errors
///
/// Returns [`InitError::AlreadyInitialised`] on a second call.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with(DEFAULT_FILTER)
}

/// Install the global subscriber, falling back to `default_filter` when
/// `RUST_LOG` is unset or invalid.
///
/// # Errors
///
/// Returns [`InitError::AlreadyInitialised`] on a second call.
pub fn init_tracing_with(default_filter: &str) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stderr().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A subscriber was already installed by this module.
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
}
