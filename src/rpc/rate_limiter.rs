//! Fixed minimum-spacing gate keyed by provider identity.
//!
//! This is not a token bucket: idle time never turns into burst allowance.
//! Each key remembers the instant of its most recent slot and the next caller
//! gets `last + interval` (or now, whichever is later).

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct LimiterState {
    intervals: HashMap<String, Duration>,
    last_call: HashMap<String, Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    default_interval: Duration,
    state: Mutex<LimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_default(DEFAULT_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter whose unconfigured keys use `default_interval`.
    pub fn with_default(default_interval: Duration) -> Self {
        Self {
            default_interval,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn set_interval(&self, key: &str, interval: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.intervals.insert(key.to_string(), interval);
    }

    pub fn interval_for(&self, key: &str) -> Duration {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .intervals
            .get(key)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Wait until `key` is allowed another call, then record the slot.
    ///
    /// The slot is reserved under the lock and the sleep happens outside it,
    /// so concurrent waiters on one key queue up behind each other while
    /// waiters on other keys are never held back.
    pub async fn wait(&self, key: &str) {
        let slot = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let interval = state
                .intervals
                .get(key)
                .copied()
                .unwrap_or(self.default_interval);
            let now = Instant::now();
            let slot = match state.last_call.get(key) {
                Some(last) => (*last + interval).max(now),
                None => now,
            };
            state.last_call.insert(key.to_string(), slot);
            slot
        };

        if slot > Instant::now() {
            log::trace!("rate limiter: {} waiting {:?}", key, slot - Instant::now());
            sleep_until(slot).await;
        }
    }
}
