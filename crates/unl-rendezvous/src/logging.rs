//! Logging initialization

use std::io;

use tracing_subscriber::EnvFilter;

/// Initialize logging based on verbosity level. `RUST_LOG`, when set,
/// overrides the verbosity-derived default filter.
pub fn init_logging(verbosity: u8) -> io::Result<()> {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| io::Error::other(e.to_string()))
}
