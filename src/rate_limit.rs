//! Process-wide token bucket guarding the translation provider.
//!
//! One governor exists per process (not per guild) so the provider sees a
//! globally bounded request rate. Tokens refill continuously at
//! `refill_rate` per second up to `capacity`, and each granted call debits
//! exactly one token.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::Config;

/// Smallest wait used when the bucket is fractionally short of a token
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Token bucket state. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone)]
pub struct RateBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    /// Create a full bucket
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Debit one token if available, otherwise return how long until one accumulates
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate);
        Err(wait.max(MIN_WAIT))
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Shared, mutex-guarded token bucket. The lock is never held across a sleep.
#[derive(Debug)]
pub struct RateGovernor {
    bucket: Mutex<RateBucket>,
}

impl RateGovernor {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            bucket: Mutex::new(RateBucket::new(capacity, refill_rate, Instant::now())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.provider_burst, config.provider_rate_cap)
    }

    /// Suspend until a token is available, then debit it. Never fails.
    pub async fn acquire(&self) {
        loop {
            let outcome = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.try_take(Instant::now())
            };
            match outcome {
                Ok(()) => return,
                Err(wait) => {
                    debug!("Rate governor: waiting {:?} for a provider token", wait);
                    sleep(wait).await;
                }
            }
        }
    }

    /// Current token balance after refilling to now
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill(Instant::now());
        bucket.tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ==================== Bucket Arithmetic ====================

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = RateBucket::new(5.0, 1.0, Instant::now());
        assert!((bucket.tokens() - 5.0).abs() < f64::EPSILON);
        assert!((bucket.capacity() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_burst_then_wait() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(3.0, 2.0, start);

        for _ in 0..3 {
            assert!(bucket.try_take(start).is_ok());
        }

        // Empty bucket at 2 tokens/s needs half a second for the next token
        let wait = bucket.try_take(start).unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));

        assert!(bucket.try_take(start + Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(4.0, 10.0, start);
        bucket.try_take(start).unwrap();

        bucket.refill(start + Duration::from_secs(60));
        assert!((bucket.tokens() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_token_wait_is_proportional() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(1.0, 4.0, start);
        bucket.try_take(start).unwrap();

        // 100ms at 4/s refills 0.4 tokens; 0.6 remaining takes 150ms
        let wait = bucket
            .try_take(start + Duration::from_millis(100))
            .unwrap_err();
        assert!(wait >= Duration::from_millis(149) && wait <= Duration::from_millis(151));
    }

    #[test]
    fn test_clock_going_backwards_does_not_underflow() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut bucket = RateBucket::new(2.0, 1.0, start);
        assert!(bucket.try_take(start - Duration::from_secs(5)).is_ok());
        assert!(bucket.tokens() >= 0.0);
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..50,
            rate in 1u32..20,
            steps in proptest::collection::vec(0u64..2_000, 1..200),
        ) {
            let start = Instant::now();
            let mut bucket = RateBucket::new(capacity as f64, rate as f64, start);
            let mut now = start;

            for step_ms in steps {
                now += Duration::from_millis(step_ms);
                let _ = bucket.try_take(now);
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= capacity as f64);
            }
        }

        #[test]
        fn prop_wait_is_enough_for_one_token(
            rate in 1u32..50,
            elapsed_ms in 0u64..1_000,
        ) {
            let start = Instant::now();
            let mut bucket = RateBucket::new(1.0, rate as f64, start);
            bucket.try_take(start).unwrap();

            let probe = start + Duration::from_millis(elapsed_ms);
            if let Err(wait) = bucket.try_take(probe) {
                prop_assert!(bucket.try_take(probe + wait + MIN_WAIT).is_ok());
            }
        }
    }

    // ==================== Governor ====================

    #[tokio::test(start_paused = true)]
    async fn test_sixth_call_waits_for_refill() {
        let governor = RateGovernor::new(5.0, 1.0);
        let start = Instant::now();

        for _ in 0..5 {
            governor.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));

        governor.acquire().await;
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(990) && waited <= Duration::from_millis(1_100),
            "sixth acquire should wait about one second, waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_are_rate_bounded() {
        let governor = std::sync::Arc::new(RateGovernor::new(2.0, 10.0));
        let start = Instant::now();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let g = governor.clone();
                tokio::spawn(async move { g.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // 2 immediate, 4 more at 10/s need at least 400ms
        assert!(start.elapsed() >= Duration::from_millis(390));
        assert!(governor.available_tokens() < 1.0);
    }

    #[test]
    fn test_from_config_uses_burst_and_rate() {
        let config = Config {
            provider_burst: 7.0,
            provider_rate_cap: 3.0,
            ..Config::default()
        };
        let governor = RateGovernor::from_config(&config);
        assert!((governor.available_tokens() - 7.0).abs() < 1e-6);
    }
}
