//! Relay counters and observability.
//!
//! Every dropped message increments a per-reason counter, so relay failures
//! that are invisible to end users still leave a signal behind.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DropReason;

/// Relay metrics shared by the pipeline, the HTTP server and the scheduler.
#[derive(Debug)]
pub struct RelayMetrics {
    /// Inbound message events accepted for processing
    received: AtomicU64,

    /// Messages relayed with a translation
    relayed: AtomicU64,

    /// Messages relayed as-is (attachments or links only)
    passthrough: AtomicU64,

    /// Drops, indexed by `DropReason::index()`
    drops: [AtomicU64; DropReason::ALL.len()],

    /// Calls made to the translation provider (each attempt counts)
    provider_calls: AtomicU64,

    /// Provider calls that failed
    provider_failures: AtomicU64,

    /// Characters charged against guild quotas
    translated_chars: AtomicU64,

    /// 90% quota warnings delivered to a guild owner or admin
    quota_warnings: AtomicU64,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
            drops: std::array::from_fn(|_| AtomicU64::new(0)),
            provider_calls: AtomicU64::new(0),
            provider_failures: AtomicU64::new(0),
            translated_chars: AtomicU64::new(0),
            quota_warnings: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self, translated: bool) {
        if translated {
            self.relayed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.passthrough.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_call(&self) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_failure(&self) {
        self.provider_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_translated_chars(&self, chars: u64) {
        self.translated_chars.fetch_add(chars, Ordering::Relaxed);
    }

    pub fn record_quota_warning(&self) {
        self.quota_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    pub fn provider_failures(&self) -> u64 {
        self.provider_failures.load(Ordering::Relaxed)
    }

    /// Generate a metrics report. `breaker_trips` comes from the circuit breaker.
    pub fn report(&self, breaker_trips: u64) -> MetricsReport {
        let calls = self.provider_calls();
        let failures = self.provider_failures();
        let provider_success_rate = if calls > 0 {
            (calls.saturating_sub(failures) as f64 / calls as f64) * 100.0
        } else {
            0.0
        };

        let drops = DropReason::ALL
            .iter()
            .map(|reason| (reason.as_str(), self.drops(*reason)))
            .filter(|(_, count)| *count > 0)
            .collect();

        MetricsReport {
            received: self.received.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            drops,
            provider_calls: calls,
            provider_failures: failures,
            provider_success_rate,
            breaker_trips,
            translated_chars: self.translated_chars.load(Ordering::Relaxed),
            quota_warnings: self.quota_warnings.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of the relay counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub received: u64,
    pub relayed: u64,
    pub passthrough: u64,

    /// Non-zero drop counters keyed by reason
    pub drops: BTreeMap<&'static str, u64>,

    pub provider_calls: u64,
    pub provider_failures: u64,

    /// Provider success rate as a percentage (0-100)
    pub provider_success_rate: f64,

    pub breaker_trips: u64,
    pub translated_chars: u64,
    pub quota_warnings: u64,
}

impl std::fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dropped: u64 = self.drops.values().sum();
        write!(
            f,
            "received={} relayed={} passthrough={} dropped={} provider_calls={} provider_success={:.1}% breaker_trips={} chars={}",
            self.received,
            self.relayed,
            self.passthrough,
            dropped,
            self.provider_calls,
            self.provider_success_rate,
            self.breaker_trips,
            self.translated_chars
        )
    }
}
