//! Sliding-window rate limiter, one window per key.
//!
//! Each key keeps the timestamps of admitted requests inside
//! `(now - window, now]`. Keys are created on first use; the key map is only
//! locked to find or insert a window.

use crate::core::types::duration_secs;
use crate::core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Key used when the caller does not partition traffic.
pub const DEFAULT_KEY: &str = "default";

/// Longest accepted window.
pub const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Rate limiter configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length
    #[serde(rename = "window_seconds", with = "duration_secs")]
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::InvalidConfig(
                "max_requests must be at least 1".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(Error::InvalidConfig("window must be positive".to_string()));
        }
        if self.window > MAX_WINDOW {
            return Err(Error::InvalidConfig(format!(
                "window must not exceed {} seconds",
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(())
    }
}

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Per-key quota enforcement.
pub struct SlidingWindowLimiter {
    config: RateLimiterConfig,
    windows: RwLock<HashMap<String, Window>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            windows: RwLock::new(HashMap::new()),
        })
    }

    /// Limiter configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn window(&self, key: &str) -> Window {
        if let Some(window) = self.windows.read().get(key) {
            return Arc::clone(window);
        }
        let mut windows = self.windows.write();
        Arc::clone(windows.entry(key.to_string()).or_default())
    }

    /// Drop timestamps at or before `now - window`.
    fn purge(&self, stamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = stamps.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit a request for `key` if the window has room.
    pub fn is_allowed(&self, key: &str) -> bool {
        let window = self.window(key);
        let mut stamps = window.lock();
        let now = Instant::now();
        self.purge(&mut stamps, now);

        if stamps.len() < self.config.max_requests as usize {
            stamps.push_back(now);
            true
        } else {
            tracing::debug!(key, limit = self.config.max_requests, "rate limit reached");
            false
        }
    }

    /// Admit a request for `key`, waiting until the window has room.
    ///
    /// Returns how long the call waited. The window is re-checked after
    /// every wait; dropping the future while it waits records nothing.
    pub async fn wait_if_needed(&self, key: &str) -> Duration {
        let window = self.window(key);
        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut stamps = window.lock();
                let now = Instant::now();
                self.purge(&mut stamps, now);

                if stamps.len() < self.config.max_requests as usize {
                    stamps.push_back(now);
                    return waited;
                }
                match stamps.front() {
                    Some(&oldest) => oldest
                        .checked_add(self.config.window)
                        .map_or(self.config.window, |free_at| {
                            free_at.saturating_duration_since(now)
                        }),
                    None => Duration::ZERO,
                }
            };

            tracing::debug!(key, wait_ms = wait.as_millis() as u64, "rate limit wait");
            let wait = wait.max(Duration::from_micros(1));
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Requests still available for `key` in the current window.
    pub fn get_remaining(&self, key: &str) -> u32 {
        let window = match self.windows.read().get(key) {
            Some(window) => Arc::clone(window),
            None => return self.config.max_requests,
        };
        let stamps = window.lock();
        let now = Instant::now();
        let active = stamps
            .iter()
            .filter(|&&ts| now.saturating_duration_since(ts) < self.config.window)
            .count();
        self.config.max_requests.saturating_sub(active as u32)
    }

    /// Forget the history of `key`.
    pub fn reset(&self, key: &str) {
        self.windows.write().remove(key);
    }

    /// Forget keys with no requests left in their window.
    ///
    /// Windows a caller is still using are kept. Returns how many keys were
    /// dropped.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|_, window| {
            if Arc::strong_count(window) > 1 {
                return true;
            }
            let mut stamps = window.lock();
            self.purge(&mut stamps, now);
            !stamps.is_empty()
        });
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = windows.len(), "pruned idle rate limit keys");
        }
        removed
    }

    /// Keys seen so far, sorted.
    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.windows.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self {
            config: RateLimiterConfig::default(),
            windows: RwLock::new(HashMap::new()),
        }
    }
}
