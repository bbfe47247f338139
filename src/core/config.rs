//! Process-wide configuration.
//!
//! One document configures every primitive. Missing sections and fields take
//! their defaults; out-of-range values are rejected, never clamped.

use crate::consensus::{ConsensusConfig, ConsensusCoordinator};
use crate::core::{Error, Result};
use crate::monitoring::LoggerConfig;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, RateLimiterConfig, RetryConfig, RetryExecutor,
    SlidingWindowLimiter, TokenBucket, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for all Aegis components.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AegisConfig {
    /// Defaults for breakers created by the registry
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub token_bucket: TokenBucketConfig,
    pub rate_limiter: RateLimiterConfig,
    /// Defaults applied to new consensus requests
    pub consensus: ConsensusConfig,
    pub logging: LoggerConfig,
}

impl AegisConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json).map_err(|err| match err {
            Error::InvalidConfig(msg) => {
                Error::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.token_bucket.validate()?;
        self.rate_limiter.validate()?;
        self.consensus.validate()?;
        Ok(())
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn circuit_breaker_registry(&self) -> Result<CircuitBreakerRegistry> {
        CircuitBreakerRegistry::new(self.circuit_breaker.clone())
    }

    pub fn retry_executor(&self) -> Result<RetryExecutor> {
        RetryExecutor::new(self.retry.clone())
    }

    pub fn token_bucket(&self) -> Result<TokenBucket> {
        TokenBucket::new(self.token_bucket.clone())
    }

    pub fn rate_limiter(&self) -> Result<SlidingWindowLimiter> {
        SlidingWindowLimiter::new(self.rate_limiter.clone())
    }

    pub fn consensus_coordinator(&self) -> Result<ConsensusCoordinator> {
        ConsensusCoordinator::new(self.consensus.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::LogFormat;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = AegisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.token_bucket.burst, 20);
        assert_eq!(config.rate_limiter.max_requests, 100);
        assert_eq!(config.consensus.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_document() {
        let config = AegisConfig::from_json_str(
            r#"{
                "circuit_breaker": {"failure_threshold": 2, "recovery_timeout": 0.5},
                "rate_limiter": {"window_seconds": 10},
                "logging": {"format": "json"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_millis(500));
        assert_eq!(config.circuit_breaker.half_open_trial_count, 3);
        assert_eq!(config.rate_limiter.window, Duration::from_secs(10));
        assert_eq!(config.rate_limiter.max_requests, 100);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = AegisConfig::from_json_str(r#"{"consensus": {"quorum_percentage": 1.5}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = AegisConfig::from_json_str(r#"{"token_bucket": {"rate": -1.0}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = AegisConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));
    }

    #[test]
    fn test_huge_durations_are_errors() {
        let err = AegisConfig::from_json_str(r#"{"retry": {"max_delay": 1e20}}"#).unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));

        let err = AegisConfig::from_json_str(r#"{"consensus": {"timeout_seconds": 1e300}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));

        let err = AegisConfig::from_json_str(r#"{"rate_limiter": {"window_seconds": 1.5e19}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("aegis-{}.json", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"retry": {"max_attempts": 7, "jitter": false}}"#)
            .unwrap();
        drop(file);

        let config = AegisConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert!(!config.retry.jitter);

        assert!(matches!(
            AegisConfig::from_json_file(&path),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_to_json_reloads() {
        let mut config = AegisConfig::default();
        config.token_bucket.rate = 2.5;
        let json = config.to_json().unwrap();
        let reloaded = AegisConfig::from_json_str(&json).unwrap();
        assert_eq!(reloaded.token_bucket.rate, 2.5);
    }

    #[tokio::test]
    async fn test_builds_components() {
        let config = AegisConfig::default();
        assert!(config.circuit_breaker_registry().unwrap().is_empty());
        assert!(config.token_bucket().unwrap().try_acquire(1));
        assert!(config.rate_limiter().unwrap().is_allowed("k"));
        assert_eq!(config.retry_executor().unwrap().config().max_attempts, 3);
        assert!(config.consensus_coordinator().unwrap().is_empty());
    }
}
