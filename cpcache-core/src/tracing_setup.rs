//! Tracing initialization for the cpcache daemon.
//!
//! Console output only; the daemon is expected to run under a process
//! supervisor that captures stdout. `RUST_LOG` overrides the level
//! chosen on the command line.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// `console_level` is the default filter; the `RUST_LOG` environment
/// variable takes precedence when set. Must be called at most once.
pub fn init_tracing(console_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Log levels selectable from the command line.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages.
    Error,
    /// Warning and error messages.
    Warn,
    /// Informational, warning, and error messages.
    Info,
    /// Debug, informational, warning, and error messages.
    Debug,
    /// All messages including detailed tracing.
    Trace,
}

impl CliLogLevel {
    /// The corresponding [`tracing::Level`].
    pub fn to_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
