//! Resilience Module
//!
//! Fault-tolerance primitives wrapping outbound calls:
//! - Circuit breakers with a shared registry
//! - Retry with exponential backoff and jitter
//! - Token-bucket backpressure
//! - Per-key sliding-window rate limiting
//!
//! The primitives compose by nesting: a caller typically runs a retry loop
//! whose attempts go through a breaker, gated by a bucket or limiter.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod token_bucket;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatistics, CircuitState, StateTransition,
};
pub use rate_limiter::{RateLimiterConfig, SlidingWindowLimiter, DEFAULT_KEY, MAX_WINDOW};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryConfig, RetryDisposition, RetryExecutor, RetryStatistics};
pub use token_bucket::{TokenBucket, TokenBucketConfig, TokenBucketStatistics};
