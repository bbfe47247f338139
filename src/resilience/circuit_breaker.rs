//! Circuit breaker for isolating a failing dependency.
//!
//! # State transitions
//! ```text
//! Closed   -> Open:     failure_count >= failure_threshold
//! Open     -> HalfOpen: first can_execute() after recovery_timeout since the last failure
//! HalfOpen -> Closed:   half_open_successes >= half_open_trial_count
//! HalfOpen -> Open:     any failure
//! ```
//!
//! In the closed state every success decays `failure_count` by one, so
//! sporadic failures never add up to a trip.

use crate::core::error::CircuitOpenError;
use crate::core::types::duration_secs;
use crate::core::{now, Error, Result, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Number of state transitions kept for statistics.
pub const TRANSITION_HISTORY: usize = 10;

/// Circuit state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through
    Closed,
    /// Calls are refused
    Open,
    /// Probe calls are let through to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures in the closed state before the circuit opens
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a probe is allowed
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    /// Successful probes needed to close from half-open
    pub half_open_trial_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_trial_count: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_trial_count == 0 {
            return Err(Error::InvalidConfig(
                "half_open_trial_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A recorded state change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// When it happened
    pub timestamp: Timestamp,
    /// What caused it
    pub reason: String,
}

/// Point-in-time view of a breaker, safe to hand to a telemetry sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub failure_threshold: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused because the circuit was open
    pub rejected_calls: u64,
    pub state_changes: u64,
    /// Failures as a percentage of recorded outcomes (0 when none)
    pub failure_rate: f64,
    pub last_failure_time: Option<Timestamp>,
    pub last_success_time: Option<Timestamp>,
    /// Most recent transitions, oldest first
    pub recent_transitions: Vec<StateTransition>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    /// Monotonic instant of the last failure, drives recovery
    last_failure: Option<Instant>,
    last_failure_time: Option<Timestamp>,
    last_success_time: Option<Timestamp>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    state_changes: u64,
    transitions: VecDeque<StateTransition>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            last_failure: None,
            last_failure_time: None,
            last_success_time: None,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            state_changes: 0,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.state_changes += 1;

        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(StateTransition {
            from,
            to,
            timestamp: now(),
            reason: reason.to_string(),
        });

        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %name, %from, reason, "circuit opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %name, %from, reason, "circuit half-open")
            }
            CircuitState::Closed => {
                tracing::info!(breaker = %name, %from, reason, "circuit closed")
            }
        }
    }
}

/// Per-target failure isolation.
///
/// All state lives behind one mutex that is never held while the protected
/// call runs.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new breaker in the closed state.
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_validated(name, config))
    }

    pub(crate) fn with_validated(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without performing the recovery check.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Current failure count.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Whether a call may proceed.
    ///
    /// The first call after the recovery timeout moves an open circuit to
    /// half-open.
    pub fn can_execute(&self) -> bool {
        let mut st = self.state.lock();
        if st.state == CircuitState::Open {
            let cooled_down = st
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
            if cooled_down {
                st.half_open_successes = 0;
                st.transition(&self.name, CircuitState::HalfOpen, "recovery timeout elapsed");
            }
        }
        st.state != CircuitState::Open
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut st = self.state.lock();
        st.total_requests += 1;
        st.total_successes += 1;
        st.last_success_time = Some(now());

        match st.state {
            CircuitState::Closed => {
                st.failure_count = st.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                st.half_open_successes += 1;
                if st.half_open_successes >= self.config.half_open_trial_count {
                    st.failure_count = 0;
                    st.half_open_successes = 0;
                    st.transition(&self.name, CircuitState::Closed, "trial calls succeeded");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.total_requests += 1;
        st.total_failures += 1;
        st.last_failure = Some(Instant::now());
        st.last_failure_time = Some(now());

        match st.state {
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    st.transition(&self.name, CircuitState::Open, "failure threshold reached");
                }
            }
            CircuitState::HalfOpen => {
                st.half_open_successes = 0;
                st.transition(&self.name, CircuitState::Open, "trial call failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Fails fast with [`CircuitOpenError`] when the circuit is open. The
    /// operation's own error is returned untouched after being counted.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        if !self.can_execute() {
            self.state.lock().rejected_calls += 1;
            tracing::debug!(breaker = %self.name, "call rejected, circuit open");
            return Err(CircuitOpenError {
                name: self.name.clone(),
            }
            .into());
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Force the circuit closed and clear every counter.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.transition(&self.name, CircuitState::Closed, "manual reset");
        st.failure_count = 0;
        st.half_open_successes = 0;
        st.last_failure = None;
        st.last_failure_time = None;
        st.last_success_time = None;
        st.total_requests = 0;
        st.total_successes = 0;
        st.total_failures = 0;
        st.rejected_calls = 0;
    }

    /// Force the circuit open, e.g. as an emergency stop.
    ///
    /// The recovery timeout starts counting from now.
    pub fn trip(&self) {
        let mut st = self.state.lock();
        st.last_failure = Some(Instant::now());
        st.half_open_successes = 0;
        st.transition(&self.name, CircuitState::Open, "manual trip");
    }

    /// Snapshot of counters and recent transitions.
    pub fn statistics(&self) -> CircuitBreakerStatistics {
        let st = self.state.lock();
        let failure_rate = if st.total_requests == 0 {
            0.0
        } else {
            st.total_failures as f64 / st.total_requests as f64 * 100.0
        };

        CircuitBreakerStatistics {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            half_open_successes: st.half_open_successes,
            failure_threshold: self.config.failure_threshold,
            total_requests: st.total_requests,
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            rejected_calls: st.rejected_calls,
            state_changes: st.state_changes,
            failure_rate,
            last_failure_time: st.last_failure_time,
            last_success_time: st.last_success_time,
            recent_transitions: st.transitions.iter().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
