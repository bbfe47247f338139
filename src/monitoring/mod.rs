//! Monitoring Module
//!
//! Tracing subscriber setup for processes embedding Aegis.

pub mod logging;

pub use logging::{init_tracing, LogFormat, LogLevel, LoggerConfig};
