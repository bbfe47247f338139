//! Error types for Aegis.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Aegis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a failure, used to decide whether a retry makes sense.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary failure, expected to clear on its own
    Transient,
    /// The operation did not finish in time
    Timeout,
    /// The dependency is down or unreachable
    Unavailable,
    /// The dependency asked us to slow down
    RateLimited,
    /// Failure that will not change on retry
    Permanent,
    /// The request itself is malformed
    InvalidInput,
    /// Missing or rejected credentials
    Unauthorized,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Transient,
        ErrorKind::Timeout,
        ErrorKind::Unavailable,
        ErrorKind::RateLimited,
        ErrorKind::Permanent,
        ErrorKind::InvalidInput,
        ErrorKind::Unauthorized,
        ErrorKind::Other,
    ];
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Permanent => "permanent",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Errors that can tell which [`ErrorKind`] they belong to.
pub trait Classify {
    /// Kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// Returned by a circuit breaker that refuses to run the protected call.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpenError {
    /// Name of the breaker
    pub name: String,
}

/// Returned when every retry attempt failed.
///
/// Carries the error from the final attempt so the caller can still inspect it.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct RetryExhaustedError<E> {
    /// Human-readable summary
    pub message: String,
    /// Error produced by the last attempt
    pub last_error: E,
    /// Number of attempts made
    pub attempts: u32,
}

/// Errors that can occur in Aegis operations.
#[derive(Error, Debug)]
pub enum Error {
    // Resilience errors
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("{message}: {last_error}")]
    RetryExhausted {
        message: String,
        attempts: u32,
        last_error: Box<Error>,
    },

    #[error("{kind} failure: {message}")]
    Operation { kind: ErrorKind, message: String },

    // Consensus errors
    #[error("Consensus {consensus_id} already finalized as {state}")]
    ConsensusFinalized { consensus_id: String, state: String },

    #[error("Consensus request not found: {0}")]
    ConsensusNotFound(String),

    #[error("Agent {agent_id} is not eligible to vote on {consensus_id}")]
    VoterNotEligible {
        consensus_id: String,
        agent_id: String,
    },

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a classified operation failure.
    pub fn operation(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Operation {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::CircuitOpen(_) => ErrorKind::Unavailable,
            Error::RetryExhausted { last_error, .. } => last_error.kind(),
            Error::Operation { kind, .. } => *kind,
            Error::ConsensusFinalized { .. }
            | Error::ConsensusNotFound(_)
            | Error::VoterNotEligible { .. }
            | Error::InvalidVote(_)
            | Error::InvalidConfig(_)
            | Error::SerializationError(_) => ErrorKind::InvalidInput,
            Error::Io(err) => match err.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => ErrorKind::Unavailable,
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                    ErrorKind::Transient
                }
                std::io::ErrorKind::PermissionDenied => ErrorKind::Unauthorized,
                _ => ErrorKind::Other,
            },
            Error::Internal(_) => ErrorKind::Other,
        }
    }
}

impl From<RetryExhaustedError<Error>> for Error {
    fn from(err: RetryExhaustedError<Error>) -> Self {
        Error::RetryExhausted {
            message: err.message,
            attempts: err.attempts,
            last_error: Box::new(err.last_error),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
