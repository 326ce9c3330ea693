//! Memcache counter store.
//!
//! Memcache has no increment-with-expiry, so a window is opened with
//! `add key 1 <exptime>`, which creates the counter and its expiry in one
//! command. Every later hit is an `incr`. A caller that loses the race to
//! `add` increments the winner's counter instead.
//!
//! Memcache cannot report a key's remaining lifetime, so the window deadline
//! is written to a companion key right after the counter is created. That
//! write is not atomic with the `add`; if it is lost the full interval is
//! reported as the remaining time. The counter itself always carries an
//! expiry. Expiry is second granular, so sub-second intervals last 1s.
//!
//! Each node keeps a small pool of connections. A call takes the first idle
//! slot and only queues when every slot of the node is busy.

use async_trait::async_trait;
use memcache_async::ascii::Protocol;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout_at, Instant};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, trace};

use super::store::{node_for, ClientKey, Count, CounterStore};
use crate::config::MemcacheConfig;
use crate::error::{QuotaError, Result};

const BACKEND: &str = "memcache";

/// Longest key memcache accepts.
const MAX_KEY_LEN: usize = 250;
/// Suffix of the companion key holding the window deadline.
const DEADLINE_SUFFIX: &str = ":w";
/// Expiry values above this are read by memcache as unix timestamps.
const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;

type Connection = Protocol<Compat<TcpStream>>;

struct Node {
    addr: String,
    slots: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
}

impl Node {
    fn new(addr: &str, pool_size: usize) -> Self {
        Self {
            addr: addr.to_string(),
            slots: (0..pool_size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Take an idle connection slot, or queue on one in turn when all are busy.
    async fn checkout(&self) -> MutexGuard<'_, Option<Connection>> {
        for slot in &self.slots {
            if let Ok(guard) = slot.try_lock() {
                return guard;
            }
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[i].lock().await
    }
}

/// Counter store shared by every instance pointed at the same memcache servers.
pub struct MemcacheStore {
    nodes: Vec<Node>,
    timeout: Duration,
    key_prefix: String,
}

impl std::fmt::Debug for MemcacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheStore")
            .field("nodes", &self.nodes.iter().map(|n| &n.addr).collect::<Vec<_>>())
            .field("pool_size", &self.nodes.first().map_or(0, |n| n.slots.len()))
            .field("timeout", &self.timeout)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl MemcacheStore {
    /// Create a store for the configured servers. Connections are opened lazily.
    pub fn new(config: &MemcacheConfig) -> Result<Self> {
        if config.addrs.is_empty() {
            return Err(QuotaError::InvalidConfig(
                "memcache store needs at least one address".to_string(),
            ));
        }
        if config.pool_size == 0 {
            return Err(QuotaError::InvalidConfig(
                "memcache pool_size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            nodes: config
                .addrs
                .iter()
                .map(|addr| Node::new(addr, config.pool_size))
                .collect(),
            timeout: config.timeout,
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Memcache keys must be printable ASCII without spaces and at most 250 bytes.
    fn counter_key(&self, key: &ClientKey) -> String {
        let mut out: String = self
            .key_prefix
            .chars()
            .chain(key.as_str().chars())
            .map(|c| if c.is_ascii_graphic() { c } else { '_' })
            .collect();
        out.truncate(MAX_KEY_LEN - DEADLINE_SUFFIX.len());
        out
    }

    async fn connect(addr: &str) -> Result<Connection> {
        debug!(addr = %addr, "Connecting to memcache");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| QuotaError::unavailable(BACKEND, format!("connect {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| QuotaError::unavailable(BACKEND, e))?;
        Ok(Protocol::new(stream.compat()))
    }

    /// One increment on an exclusively held connection slot.
    async fn hit(
        slot: &mut Option<Connection>,
        addr: &str,
        key: &str,
        interval: Duration,
    ) -> Result<Count> {
        if slot.is_none() {
            *slot = Some(Self::connect(addr).await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(QuotaError::unavailable(BACKEND, "connection lost"));
        };
        let deadline_key = format!("{}{}", key, DEADLINE_SUFFIX);

        match conn.increment(&key, 1).await {
            Ok(count) => {
                let ttl = remaining(conn, &deadline_key, interval).await?;
                return Ok(Count { count, ttl });
            }
            Err(e) if is_miss(&e) => {}
            Err(e) => return Err(QuotaError::unavailable(BACKEND, e)),
        }

        let exptime = expiration(interval);
        match conn.add(&key, b"1", exptime).await {
            Ok(()) => {
                let deadline = unix_millis() + interval.as_millis() as i64;
                conn.set(&deadline_key.as_str(), deadline.to_string().as_bytes(), exptime)
                    .await
                    .map_err(|e| QuotaError::unavailable(BACKEND, e))?;
                return Ok(Count {
                    count: 1,
                    ttl: interval,
                });
            }
            // Another caller opened the window first.
            Err(e) if is_not_stored(&e) => {
                trace!(key = %key, "Lost window creation race");
            }
            Err(e) => return Err(QuotaError::unavailable(BACKEND, e)),
        }

        let count = conn
            .increment(&key, 1)
            .await
            .map_err(|e| QuotaError::unavailable(BACKEND, e))?;
        let ttl = remaining(conn, &deadline_key, interval).await?;
        Ok(Count { count, ttl })
    }
}

/// Time left in the window, from the companion deadline key.
async fn remaining(conn: &mut Connection, deadline_key: &str, interval: Duration) -> Result<Duration> {
    match conn.get(&deadline_key).await {
        Ok(raw) => {
            let left = std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(|deadline| Duration::from_millis((deadline - unix_millis()).max(0) as u64))
                .unwrap_or(interval);
            Ok(left.min(interval))
        }
        Err(e) if is_miss(&e) => Ok(interval),
        Err(e) => Err(QuotaError::unavailable(BACKEND, e)),
    }
}

fn is_miss(e: &io::Error) -> bool {
    e.kind() == ErrorKind::NotFound
}

/// `add` reports NOT_STORED as `AlreadyExists`. Server and client errors are `Other`.
fn is_not_stored(e: &io::Error) -> bool {
    e.kind() == ErrorKind::AlreadyExists
}

/// Memcache `exptime` for a window of `interval`.
fn expiration(interval: Duration) -> u32 {
    let mut secs = interval.as_secs();
    if interval.subsec_nanos() > 0 || secs == 0 {
        secs += 1;
    }
    if secs > MAX_RELATIVE_EXPIRY {
        secs += chrono::Utc::now().timestamp().max(0) as u64;
    }
    secs.min(u32::MAX as u64) as u32
}

fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl CounterStore for MemcacheStore {
    async fn increment(&self, key: &ClientKey, interval: Duration) -> Result<Count> {
        let node = &self.nodes[node_for(key.as_str(), self.nodes.len())];
        let counter_key = self.counter_key(key);
        let deadline = Instant::now() + self.timeout;
        let timed_out = || {
            QuotaError::unavailable(
                BACKEND,
                format!("{} timed out after {:?}", node.addr, self.timeout),
            )
        };

        trace!(key = %counter_key, node = %node.addr, "Incrementing memcache counter");

        let mut slot = timeout_at(deadline, node.checkout())
            .await
            .map_err(|_| timed_out())?;

        let outcome = timeout_at(deadline, Self::hit(&mut slot, &node.addr, &counter_key, interval)).await;

        // A connection that failed or was abandoned mid-command is discarded.
        match outcome {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => {
                *slot = None;
                Err(e)
            }
            Err(_) => {
                *slot = None;
                Err(timed_out())
            }
        }
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
