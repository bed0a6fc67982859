//! Logging setup for the command line tool.
//!
//! Logs go to stderr so tables and CSV on stdout stay clean. The filter comes
//! from `RUST_LOG` when set, otherwise from the given default directive.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

pub const DEFAULT_DIRECTIVE: &str = "info";

/// Filter for a `-v` count: 0 keeps `default`, 1 is debug, more is trace.
pub fn filter_for(verbosity: u8, default: &str) -> EnvFilter {
    let directive = match verbosity {
        0 => default,
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(verbosity: u8) -> Result<(), TryInitError> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter_for(verbosity, DEFAULT_DIRECTIVE))
        .with(stderr_layer)
        .try_init()
}
