//! Decision counters for the operational collaborator.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated on every decision.
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    bypassed: AtomicU64,
    store_unavailable: AtomicU64,
}

/// Point-in-time copy of [`LimiterMetrics`], labelled with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub backend: &'static str,
    /// Requests admitted, including those admitted because the store failed
    pub allowed: u64,
    /// Requests rejected, including those rejected because the store failed
    pub denied: u64,
    /// Requests admitted without counting because quotas are disabled
    pub bypassed: u64,
    /// Increments that failed with `StoreUnavailable`
    pub store_unavailable: u64,
}

impl LimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_unavailable(&self) {
        self.store_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, backend: &'static str) -> MetricsSnapshot {
        MetricsSnapshot {
            backend,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            store_unavailable: self.store_unavailable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let metrics = LimiterMetrics::default();
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_denied();
        metrics.record_store_unavailable();

        let snapshot = metrics.snapshot("memory");
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                backend: "memory",
                allowed: 2,
                denied: 1,
                bypassed: 0,
                store_unavailable: 1,
            }
        );

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["store_unavailable"], 1);
    }
}
