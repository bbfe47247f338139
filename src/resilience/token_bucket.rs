//! Token-bucket backpressure controller.
//!
//! Tokens refill continuously at `rate` per second up to `burst`. Waiting
//! happens with the lock released; after waking the bucket is refilled and
//! checked again before anything is deducted, so the token count never
//! leaves `[0, burst]`.

use crate::core::types::secs_to_duration;
use crate::core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
        }
    }
}

impl TokenBucketConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "rate must be a positive number of tokens per second, got {}",
                self.rate
            )));
        }
        if self.burst == 0 {
            return Err(Error::InvalidConfig("burst must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Controller statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenBucketStatistics {
    pub rate: f64,
    pub burst: u32,
    pub current_tokens: f64,
    /// Completed acquisitions
    pub total_requests: u64,
    /// Acquisitions that had to wait
    pub total_waits: u64,
    /// Seconds spent waiting
    pub total_wait_time: f64,
    /// Waiting acquisitions as a percentage of all (0 when none)
    pub wait_rate: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    total_requests: u64,
    total_waits: u64,
    total_wait_time: Duration,
}

/// Token bucket smoothing the rate of a single resource.
pub struct TokenBucket {
    config: TokenBucketConfig,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
                total_requests: 0,
                total_waits: 0,
                total_wait_time: Duration::ZERO,
            }),
            config,
        })
    }

    /// Bucket configuration.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate).min(f64::from(self.config.burst));
        bucket.last_refill = now;
    }

    /// Take `n` tokens, waiting for the deficit to refill if needed.
    ///
    /// Returns how long the call waited. A request larger than `burst` waits
    /// for its deficit once and then drains the bucket to zero. Dropping the
    /// future while it waits leaves the bucket untouched.
    pub async fn acquire(&self, n: u32) -> Duration {
        let wanted = f64::from(n);
        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);

                let acquired = if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    true
                } else if !waited.is_zero() && wanted > f64::from(self.config.burst) {
                    // Can never be satisfied in full; the deficit has been paid
                    bucket.tokens = 0.0;
                    true
                } else {
                    false
                };

                if acquired {
                    bucket.total_requests += 1;
                    if !waited.is_zero() {
                        bucket.total_waits += 1;
                        bucket.total_wait_time += waited;
                    }
                    return waited;
                }
                secs_to_duration((wanted - bucket.tokens) / self.config.rate)
            };

            tracing::debug!(tokens = n, wait_ms = wait.as_millis() as u64, "backpressure wait");
            // Float rounding can leave a deficit too small to sleep on
            let wait = wait.max(Duration::from_micros(1));
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        let wanted = f64::from(n);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            bucket.total_requests += 1;
            true
        } else {
            false
        }
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Refill to capacity and clear the counters.
    pub fn reset(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = f64::from(self.config.burst);
        bucket.last_refill = Instant::now();
        bucket.total_requests = 0;
        bucket.total_waits = 0;
        bucket.total_wait_time = Duration::ZERO;
    }

    /// Controller statistics.
    pub fn statistics(&self) -> TokenBucketStatistics {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        let wait_rate = if bucket.total_requests == 0 {
            0.0
        } else {
            bucket.total_waits as f64 / bucket.total_requests as f64 * 100.0
        };

        TokenBucketStatistics {
            rate: self.config.rate,
            burst: self.config.burst,
            current_tokens: bucket.tokens,
            total_requests: bucket.total_requests,
            total_waits: bucket.total_waits,
            total_wait_time: bucket.total_wait_time.as_secs_f64(),
            wait_rate,
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        let config = TokenBucketConfig::default();
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
                total_requests: 0,
                total_waits: 0,
                total_wait_time: Duration::ZERO,
            }),
            config,
        }
    }
}
