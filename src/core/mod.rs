//! Core utilities and common types for Aegis.

pub mod config;
pub mod error;
pub mod types;

pub use config::AegisConfig;
pub use error::{CircuitOpenError, Classify, Error, ErrorKind, Result, RetryExhaustedError};
pub use types::*;
