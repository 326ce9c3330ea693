//! Admission decisions on top of a counter store.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::memcache_store::MemcacheStore;
use super::memory::MemoryStore;
use super::metrics::{LimiterMetrics, MetricsSnapshot};
use super::redis_store::RedisStore;
use super::store::{ClientKey, Count, CounterStore};
use crate::config::{AppConfig, Backend, FailurePolicy, QuotaSettings};
use crate::error::{QuotaError, Result};

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests counted in the current window, this one included
    pub count: u64,
    /// Time until the current window ends
    #[serde(serialize_with = "serialize_millis")]
    pub remaining_ttl: Duration,
}

impl Decision {
    /// Decision returned while quotas are disabled.
    pub const UNLIMITED: Decision = Decision {
        allowed: true,
        count: 0,
        remaining_ttl: Duration::ZERO,
    };

    /// Requests still available in this window under `limit`.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Fixed-window quota limiter.
///
/// Holds nothing besides its configuration, the store handle and metrics,
/// so it can be shared behind an `Arc` and called from any task.
pub struct Limiter {
    limit: u64,
    interval: Duration,
    policy: FailurePolicy,
    store: Arc<dyn CounterStore>,
    metrics: LimiterMetrics,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .field("policy", &self.policy)
            .field("backend", &self.store.backend())
            .finish()
    }
}

impl Limiter {
    /// Create a limiter over an already constructed store.
    pub fn new(settings: &QuotaSettings, store: Arc<dyn CounterStore>) -> Result<Self> {
        if settings.interval.is_zero() {
            return Err(QuotaError::InvalidConfig(
                "quota interval must be a positive duration".to_string(),
            ));
        }

        Ok(Self {
            limit: settings.limit,
            interval: settings.interval,
            policy: settings.on_store_error,
            store,
            metrics: LimiterMetrics::default(),
        })
    }

    /// Validate `config` and build the limiter with the selected backend.
    ///
    /// For the memory backend this spawns the sweeper, so it must be called
    /// from within a tokio runtime.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let quota = &config.quota;

        let store: Arc<dyn CounterStore> = match quota.backend {
            Backend::Memory if quota.enabled() => MemoryStore::with_sweeper(quota.interval),
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Redis => Arc::new(RedisStore::new(&config.redis)?),
            Backend::Memcache => Arc::new(MemcacheStore::new(&config.memcache)?),
        };

        info!(
            backend = %quota.backend,
            limit = quota.limit,
            interval = ?quota.interval,
            on_store_error = ?quota.on_store_error,
            "Quota limiter initialized"
        );
        if !quota.enabled() {
            info!("Quota limit is 0, quotas are disabled");
        }

        Self::new(quota, store)
    }

    /// Count one request for `key` and decide whether it may proceed.
    ///
    /// Never fails: a store error is resolved by the failure policy.
    pub async fn allow(&self, key: &ClientKey) -> Decision {
        if !self.enabled() {
            self.metrics.record_bypassed();
            return Decision::UNLIMITED;
        }

        let result = self.store.increment(key, self.interval).await;
        self.decide(key, result)
    }

    /// Like [`allow`](Limiter::allow), but gives up on the store after `deadline`.
    pub async fn allow_within(&self, key: &ClientKey, deadline: Duration) -> Decision {
        if !self.enabled() {
            self.metrics.record_bypassed();
            return Decision::UNLIMITED;
        }

        let result = match tokio::time::timeout(deadline, self.store.increment(key, self.interval)).await {
            Ok(result) => result,
            Err(_) => Err(QuotaError::unavailable(
                self.store.backend(),
                format!("no answer within {:?}", deadline),
            )),
        };
        self.decide(key, result)
    }

    fn decide(&self, key: &ClientKey, result: Result<Count>) -> Decision {
        match result {
            Ok(Count { count, ttl }) => {
                let allowed = count <= self.limit;
                if allowed {
                    self.metrics.record_allowed();
                    trace!(key = %key, count, ttl = ?ttl, "Request within quota");
                } else {
                    self.metrics.record_denied();
                    debug!(key = %key, count, limit = self.limit, ttl = ?ttl, "Quota exceeded");
                }
                Decision {
                    allowed,
                    count,
                    remaining_ttl: ttl,
                }
            }
            Err(e) => {
                self.metrics.record_store_unavailable();
                warn!(
                    key = %key,
                    backend = self.store.backend(),
                    policy = ?self.policy,
                    error = %e,
                    "Quota store failed"
                );
                match self.policy {
                    FailurePolicy::Open => {
                        self.metrics.record_allowed();
                        Decision::UNLIMITED
                    }
                    FailurePolicy::Closed => {
                        self.metrics.record_denied();
                        Decision {
                            allowed: false,
                            count: 0,
                            remaining_ttl: self.interval,
                        }
                    }
                }
            }
        }
    }

    /// Whether quotas are enforced.
    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.store.backend())
    }
}
