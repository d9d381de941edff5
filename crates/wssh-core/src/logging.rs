//! Tracing integration for structured logging.
//!
//! The core only emits `tracing` events; the embedding host decides where
//! they go. This helper covers hosts that want a ready-made subscriber.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Initialize the logging system.
///
/// `verbosity`: 0=error, 1=warn, 2=info, 3=debug, 4+=trace. `RUST_LOG`
/// overrides when set. Fails if a global subscriber is already installed.
pub fn init_logging(verbosity: u8, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wssh_core={level}")));

    let init_result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    init_result.map_err(|e| Error::Internal {
        message: format!("logging init failed: {e}"),
    })
}

/// Initialize logging with defaults for tests. Ignores "already set" errors.
pub fn init_test_logging() {
    let _ = init_logging(2, LogFormat::Text);
}
