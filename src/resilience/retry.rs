//! Retrying executor with exponential backoff and jitter.
//!
//! `delay(attempt) = min(base_delay * exponential_base^attempt, max_delay)`,
//! optionally perturbed by up to `±jitter_factor` of itself and clamped at zero.

use crate::core::error::RetryExhaustedError;
use crate::core::types::{duration_secs, secs_to_duration};
use crate::core::{Classify, Error, ErrorKind, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// What to do with a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Try again if attempts remain
    Retry,
    /// Hand the error straight back to the caller
    Propagate,
}

/// Retry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub exponential_base: f64,
    /// Whether to randomise delays
    pub jitter: bool,
    /// Fraction of the delay used as jitter range
    pub jitter_factor: f64,
    /// Kinds worth retrying, every kind by default
    pub retryable: Vec<ErrorKind>,
    /// Kinds that are never retried; wins over `retryable`.
    /// Defaults to `Permanent` and `InvalidInput`.
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            jitter_factor: 0.1,
            retryable: ErrorKind::ALL.to_vec(),
            non_retryable: vec![ErrorKind::Permanent, ErrorKind::InvalidInput],
        }
    }
}

impl RetryConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::InvalidConfig(format!(
                "max_delay ({:?}) must not be below base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if !self.exponential_base.is_finite() || self.exponential_base <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "exponential_base must be positive, got {}",
                self.exponential_base
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::InvalidConfig(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Delay to wait after the failure of `attempt` (zero-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        // 0 * inf when base_delay is zero and the exponent overflows
        let raw = if raw.is_nan() { 0.0 } else { raw };
        let mut delay = raw.min(self.max_delay.as_secs_f64());

        if self.jitter && self.jitter_factor > 0.0 && delay > 0.0 {
            let range = delay * self.jitter_factor;
            delay += rand::thread_rng().gen_range(-range..=range);
        }

        secs_to_duration(delay.max(0.0))
    }

    /// Decide whether an error of `kind` is retried.
    pub fn classify(&self, kind: ErrorKind) -> RetryDisposition {
        if self.non_retryable.contains(&kind) {
            RetryDisposition::Propagate
        } else if self.retryable.contains(&kind) {
            RetryDisposition::Retry
        } else {
            RetryDisposition::Propagate
        }
    }
}

/// Counters across every run of an executor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetryStatistics {
    /// Individual calls of the operation
    pub total_attempts: u64,
    /// Runs that ended in success
    pub successful_calls: u64,
    /// Runs that ended in an error (exhausted or propagated)
    pub failed_calls: u64,
    /// Retries actually performed
    pub retries: u64,
    /// Runs that used up every attempt
    pub exhausted: u64,
    /// Time spent in backoff, in seconds
    pub total_delay_secs: f64,
    pub last_error: Option<String>,
    /// Failed attempts per error kind
    pub errors_by_kind: HashMap<String, u64>,
}

/// Runs a unit of work until it succeeds, fails permanently, or runs out of attempts.
pub struct RetryExecutor {
    config: RetryConfig,
    stats: Mutex<RetryStatistics>,
}

impl RetryExecutor {
    /// Create an executor.
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: Mutex::new(RetryStatistics::default()),
        })
    }

    /// Executor configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op`, classifying failures through [`Classify`].
    pub async fn run<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display + From<RetryExhaustedError<E>>,
    {
        self.run_with_hook(op, |_, _, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry(next_attempt, &error, delay)`
    /// before each backoff.
    pub async fn run_with_hook<F, Fut, T, E, H>(
        &self,
        op: F,
        on_retry: H,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + Display + From<RetryExhaustedError<E>>,
        H: FnMut(u32, &E, Duration),
    {
        let config = &self.config;
        self.run_inner(
            op,
            |err: &E| {
                let kind = err.kind();
                (config.classify(kind), kind.to_string())
            },
            on_retry,
        )
        .await
    }

    /// Run `op` with a caller-supplied predicate deciding what is retryable.
    ///
    /// Useful for error types that do not implement [`Classify`].
    pub async fn run_with_classifier<F, Fut, T, E, C, H>(
        &self,
        op: F,
        is_retryable: C,
        on_retry: H,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display + From<RetryExhaustedError<E>>,
        C: Fn(&E) -> bool,
        H: FnMut(u32, &E, Duration),
    {
        self.run_inner(
            op,
            |err: &E| {
                let disposition = if is_retryable(err) {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Propagate
                };
                (disposition, "unclassified".to_string())
            },
            on_retry,
        )
        .await
    }

    async fn run_inner<F, Fut, T, E, C, H>(
        &self,
        mut op: F,
        classify: C,
        mut on_retry: H,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display + From<RetryExhaustedError<E>>,
        C: Fn(&E) -> (RetryDisposition, String),
        H: FnMut(u32, &E, Duration),
    {
        let mut attempts = 0u32;
        loop {
            let outcome = op().await;
            attempts += 1;
            self.stats.lock().total_attempts += 1;

            let err = match outcome {
                Ok(value) => {
                    self.stats.lock().successful_calls += 1;
                    return Ok(value);
                }
                Err(err) => err,
            };

            let (disposition, label) = classify(&err);
            {
                let mut stats = self.stats.lock();
                stats.last_error = Some(err.to_string());
                *stats.errors_by_kind.entry(label).or_insert(0) += 1;
                if disposition == RetryDisposition::Propagate {
                    stats.failed_calls += 1;
                }
            }

            if disposition == RetryDisposition::Propagate {
                tracing::debug!(attempt = attempts, error = %err, "non-retryable error");
                return Err(err);
            }

            if attempts >= self.config.max_attempts {
                {
                    let mut stats = self.stats.lock();
                    stats.failed_calls += 1;
                    stats.exhausted += 1;
                }
                tracing::warn!(attempts, error = %err, "retry exhausted");
                return Err(RetryExhaustedError {
                    message: format!("Retry exhausted after {attempts} attempts"),
                    last_error: err,
                    attempts,
                }
                .into());
            }

            let delay = self.config.calculate_delay(attempts - 1);
            tracing::warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            on_retry(attempts, &err, delay);
            tokio::time::sleep(delay).await;

            {
                let mut stats = self.stats.lock();
                stats.retries += 1;
                stats.total_delay_secs += delay.as_secs_f64();
            }
        }
    }

    /// Snapshot of the counters.
    pub fn statistics(&self) -> RetryStatistics {
        self.stats.lock().clone()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self {
            config: RetryConfig::default(),
            stats: Mutex::new(RetryStatistics::default()),
        }
    }
}
