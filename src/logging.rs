//! Structured logging setup.
//!
//! Logs always go to stderr, matching the Python original's practice of
//! keeping stdout clean for JSON output (CWL executors read a step's outputs
//! as JSON written to stdout).

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// The verbosity level selected by the CLI's `--quiet`/`--debug` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Only warnings and errors.
    Quiet,
    /// Informational messages (the default).
    Normal,
    /// Debug-level tracing.
    Debug,
}

impl Verbosity {
    /// The `tracing` level this verbosity maps to.
    fn level(self) -> Level {
        match self {
            Self::Quiet => Level::WARN,
            Self::Normal => Level::INFO,
            Self::Debug => Level::DEBUG,
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` always takes precedence when set; otherwise the level is
/// derived from `verbosity`.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.level().to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
