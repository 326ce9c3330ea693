//! In-process counter store.
//!
//! Counters live in a sharded map, so increments of different keys only
//! contend when they hash to the same shard. Each increment holds one shard
//! lock for O(1) work. Expired windows are dropped by a background sweeper;
//! an expired window found on lookup is simply reopened in place.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::store::{ClientKey, Count, CounterStore};
use crate::error::Result;

/// A fixed window for one key.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    started: Instant,
    ttl: Duration,
}

impl Window {
    fn open(now: Instant, ttl: Duration) -> Self {
        Self {
            count: 0,
            started: now,
            ttl,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.ttl
    }

    /// Count one hit, reopening the window first if it has elapsed.
    fn hit(&mut self, now: Instant, interval: Duration) -> Count {
        if self.expired(now) {
            *self = Window::open(now, interval);
        }
        self.count += 1;
        Count {
            count: self.count,
            ttl: self.ttl.saturating_sub(now.saturating_duration_since(self.started)),
        }
    }
}

/// Counter store backed by process memory.
///
/// Quotas kept here are per process and reset on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, Window>,
}

impl MemoryStore {
    /// Create an empty store. No sweeper runs until [`spawn_sweeper`] is called.
    ///
    /// [`spawn_sweeper`]: MemoryStore::spawn_sweeper
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store wrapped in an `Arc` with its sweeper already running.
    pub fn with_sweeper(every: Duration) -> Arc<Self> {
        let store = Arc::new(Self::new());
        store.spawn_sweeper(every);
        store
    }

    /// Remove every window that has elapsed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, window| !window.expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Run [`sweep`](MemoryStore::sweep) every `every` on the tokio runtime.
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Memory store dropped, stopping sweeper");
                    break;
                };
                let removed = store.sweep();
                if removed > 0 {
                    trace!(removed, remaining = store.len(), "Swept expired quota windows");
                }
            }
        })
    }

    /// Number of windows currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &ClientKey, interval: Duration) -> Result<Count> {
        let now = Instant::now();

        // Known keys avoid allocating an owned key.
        if let Some(mut window) = self.counters.get_mut(key.as_str()) {
            return Ok(window.hit(now, interval));
        }

        let count = self
            .counters
            .entry(key.as_str().to_owned())
            .or_insert_with(|| Window::open(now, interval))
            .hit(now, interval);
        Ok(count)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(s: &str) -> ClientKey {
        ClientKey::new(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_increment_opens_window() {
        let store = MemoryStore::new();

        let count = store.increment(&key("10.0.0.1"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(count.count, 1);
        assert_eq!(count.ttl, Duration::from_secs(1));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increments_report_remaining_ttl() {
        let store = MemoryStore::new();
        let k = key("10.0.0.1");
        let interval = Duration::from_secs(10);

        store.increment(&k, interval).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        let count = store.increment(&k, interval).await.unwrap();
        assert_eq!(count.count, 2);
        assert_eq!(count.ttl, Duration::from_secs(6));

        // Hits never push the window end out.
        tokio::time::advance(Duration::from_secs(3)).await;
        let count = store.increment(&k, interval).await.unwrap();
        assert_eq!(count.count, 3);
        assert_eq!(count.ttl, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rollover() {
        let store = MemoryStore::new();
        let k = key("10.0.0.1");
        let interval = Duration::from_secs(1);

        for expected in 1..=3 {
            assert_eq!(store.increment(&k, interval).await.unwrap().count, expected);
        }

        tokio::time::advance(Duration::from_millis(1100)).await;

        let count = store.increment(&k, interval).await.unwrap();
        assert_eq!(count.count, 1);
        assert_eq!(count.ttl, interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_exactly_at_interval() {
        let store = MemoryStore::new();
        let k = key("k");
        let interval = Duration::from_secs(2);

        store.increment(&k, interval).await.unwrap();
        tokio::time::advance(interval).await;

        assert_eq!(store.increment(&k, interval).await.unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let store = MemoryStore::new();
        let interval = Duration::from_secs(60);

        store.increment(&key("a"), interval).await.unwrap();
        store.increment(&key("a"), interval).await.unwrap();
        let b = store.increment(&key("b"), interval).await.unwrap();

        assert_eq!(b.count, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_increments_are_gap_free() {
        let store = Arc::new(MemoryStore::new());
        let interval = Duration::from_secs(3600);
        let n = 2000u64;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment(&ClientKey::new("10.0.0.1").unwrap(), interval)
                        .await
                        .unwrap()
                        .count
                })
            })
            .collect();

        let counts: HashSet<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let expected: HashSet<u64> = (1..=n).collect();
        assert_eq!(counts, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let store = MemoryStore::new();

        store.increment(&key("short"), Duration::from_secs(1)).await.unwrap();
        store.increment(&key("long"), Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_returns_table_to_empty() {
        let store = MemoryStore::with_sweeper(Duration::from_secs(1));
        let interval = Duration::from_secs(1);

        for i in 0..500 {
            store
                .increment(&key(&format!("10.0.{}.{}", i / 256, i % 256)), interval)
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 500);

        // Past the window and one full sweep cycle.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_store_dropped() {
        let store = Arc::new(MemoryStore::new());
        let handle = store.spawn_sweeper(Duration::from_millis(10));

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
