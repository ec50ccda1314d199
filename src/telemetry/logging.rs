//! Subscriber setup for embedders of the pipeline.
//!
//! The crate itself only emits `tracing` events: pool churn at trace,
//! multiplexer and scheduler transitions at debug, accounting anomalies at
//! warn. Binaries that want those events rendered call [`init_logging`] once.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How events are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, with the `pipeline_request` span fields.
    #[default]
    Json,
    /// Multi-line output for local debugging.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(LogError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives, e.g. `info` or `imgpipe_core::memory=trace`.
    pub level: String,
    /// Write to this file instead of stderr.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

impl LogConfig {
    /// Parse the filter directives.
    pub fn filter(&self) -> Result<EnvFilter, LogError> {
        EnvFilter::try_new(&self.level).map_err(|e| LogError::InvalidFilter(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to open log file {path}: {reason}")]
    FileOpen { path: PathBuf, reason: String },
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
    #[error("Unknown log format: {0}")]
    UnknownFormat(String),
}

fn open_log_file(path: &Path) -> Result<Mutex<File>, LogError> {
    File::create(path).map(Mutex::new).map_err(|e| LogError::FileOpen {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber described by `config`.
///
/// Fails with [`LogError::AlreadyInitialized`] if the process already has one.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let registry = tracing_subscriber::registry().with(config.filter()?);
    let installed = match (config.format, config.output_path.as_deref()) {
        (LogFormat::Json, None) => registry.with(fmt::layer().json()).try_init(),
        (LogFormat::Json, Some(path)) => registry
            .with(fmt::layer().json().with_writer(open_log_file(path)?))
            .try_init(),
        (LogFormat::Pretty, None) => registry.with(fmt::layer().pretty()).try_init(),
        (LogFormat::Pretty, Some(path)) => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(false)
                    .with_writer(open_log_file(path)?),
            )
            .try_init(),
    };
    installed.map_err(|_| LogError::AlreadyInitialized)
}
