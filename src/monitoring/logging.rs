//! Structured logging for Aegis.
//!
//! The primitives emit `tracing` events; this module installs a subscriber
//! for processes that do not bring their own.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<bool> = OnceLock::new();

/// Log level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level
    Error = 4,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text
    Text,
    /// JSON
    Json,
}

/// Logger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum log level, overridden by `RUST_LOG`
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include event targets (module paths)
    pub include_targets: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            include_targets: true,
        }
    }
}

impl LoggerConfig {
    /// Filter built from `RUST_LOG`, falling back to the configured level.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_directive()))
    }
}

/// Install the global tracing subscriber once for the process.
///
/// Returns whether a subscriber from this crate is active. Later calls are
/// no-ops and return the first outcome; `false` means another subscriber was
/// already installed.
pub fn init_tracing(config: &LoggerConfig) -> bool {
    *TRACING_INIT.get_or_init(|| {
        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(config.env_filter())
                .with(fmt::layer().json().with_target(config.include_targets))
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(config.env_filter())
                .with(fmt::layer().compact().with_target(config.include_targets))
                .try_init(),
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = %err, "tracing subscriber already installed");
                false
            }
        }
    })
}
