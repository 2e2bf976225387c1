//! Structured logging for muxherd
//!
//! Uses `tracing` with configurable output formats and destinations.
//!
//! # Correlation fields
//!
//! Use these field names consistently in spans and events:
//! - `session`: multiplexer session name
//! - `pane_id`: pane identifier
//! - `agent_type`: agent family (claude, codex, gemini)
//! - `state`: activity or health state
//! - `strategy`: routing strategy name
//!
//! # Safety
//!
//! Never log raw pane contents at info level or above; captured output can
//! contain anything the agent printed, including secrets.

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    Pretty,
    /// Machine-parseable JSON lines for CI and ops
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Can be overridden by the RUST_LOG environment variable.
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional path to a log file; when set, logs go to the file instead
    /// of stderr (useful for diagnostic bundles)
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// Returns whether this call performed the installation.
pub fn init_logging(config: &LogConfig) -> crate::Result<bool> {
    let mut installed = false;

    LOGGING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

        let result = match (&config.file, config.format) {
            (Some(path), format) => std::fs::File::create(path).map(|file| {
                install_with_writer(filter, format, std::sync::Arc::new(file));
            }),
            (None, format) => {
                install_with_writer(filter, format, io::stderr);
                Ok(())
            }
        };

        if let Err(err) = result {
            eprintln!("muxherd: failed to open log file: {err}");
        }

        installed = true;
        true
    });

    Ok(installed)
}

fn install_with_writer<W>(filter: EnvFilter, format: LogFormat, writer: W)
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => {
            let subscriber = fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Json => {
            let subscriber = fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}
