//! Quota counting and admission decisions.

mod limiter;
mod memcache_store;
mod memory;
mod metrics;
mod redis_store;
mod store;

pub use limiter::{Decision, Limiter};
pub use memcache_store::MemcacheStore;
pub use memory::MemoryStore;
pub use metrics::{LimiterMetrics, MetricsSnapshot};
pub use redis_store::RedisStore;
pub use store::{ClientKey, Count, CounterStore};
