//! Logging subsystem
//!
//! Structured logging via tracing, with JSON (production) and plaintext
//! (development) output formats.
//!
//! # Log Targets
//!
//! Consistent target names used across the codebase:
//! - `dispatch` - handler chain decisions
//! - `storage` - durable store operations
//! - `migrate` - endpoint migration batches
//!
//! # Environment Variables
//!
//! - `CARRYOVER_LOG` - primary log level/filter (takes precedence)
//! - `RUST_LOG` - fallback log level/filter

use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Guard so repeated initialization is a no-op.
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Logging errors.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs).
    Json,
    /// Human-readable plaintext for development.
    #[default]
    Plaintext,
}

/// Log output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

/// Configuration for the logging subsystem.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default level when no env filter is set.
    pub default_level: Level,
}

impl LogConfig {
    /// Plaintext to stdout at INFO.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// JSON to stdout at INFO.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Build the env filter: `CARRYOVER_LOG` > `RUST_LOG` > default level.
fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_env("CARRYOVER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// Initialize the global subscriber. Safe to call more than once; only
/// the first call installs anything.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = env_filter(config.default_level);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (config.format, config.output) {
        (LogFormat::Json, LogOutput::Stdout) => builder.json().try_init(),
        (LogFormat::Json, LogOutput::Stderr) => {
            builder.json().with_writer(std::io::stderr).try_init()
        }
        (LogFormat::Plaintext, LogOutput::Stdout) => builder.try_init(),
        (LogFormat::Plaintext, LogOutput::Stderr) => {
            builder.with_writer(std::io::stderr).try_init()
        }
    };

    result.map_err(|e| LoggingError::Init(e.to_string()))?;
    INIT_GUARD.set(()).ok();
    Ok(())
}
