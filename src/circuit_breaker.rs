//! Circuit breaker for the translation provider.
//!
//! Closed -> Open when `fail_count` reaches the threshold. There is no
//! half-open probe: the breaker closes lazily once `now >= open_until`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    }
}

/// Mutable breaker state. `fail_count` resets on success and on tripping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitState {
    pub fail_count: u32,
    pub open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitState::default()),
            trips: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.breaker_threshold, config.breaker_cooldown)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        self.lock().open_until.is_some_and(|until| now < until)
    }

    pub fn state(&self) -> BreakerState {
        if self.is_open() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    pub fn on_success(&self) {
        self.lock().fail_count = 0;
    }

    /// Record a transient failure. Returns true when this failure tripped the breaker.
    pub fn on_failure(&self) -> bool {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        state.fail_count += 1;
        if state.fail_count < self.threshold {
            return false;
        }
        state.fail_count = 0;
        state.open_until = Some(now + self.cooldown);
        drop(state);

        self.trips.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Circuit breaker opened after {} consecutive provider failures, pausing translations for {:?}",
            self.threshold, self.cooldown
        );
        true
    }

    pub fn snapshot(&self) -> CircuitState {
        *self.lock()
    }

    /// Number of times the breaker has opened since startup
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
