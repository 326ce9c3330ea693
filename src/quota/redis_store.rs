//! Redis counter store.
//!
//! Each increment is a single Lua script run on the node owning the key:
//! `INCR`, set the window expiry when the counter is new, and read back the
//! remaining time. The script runs atomically on the server, so a key can
//! never be created without an expiry and concurrent increments from any
//! number of instances see gap-free counts.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::store::{node_for, ClientKey, Count, CounterStore};
use crate::config::RedisConfig;
use crate::error::{QuotaError, Result};

const BACKEND: &str = "redis";

/// KEYS[1] = counter key, ARGV[1] = window length in milliseconds.
///
/// A key found without an expiry (negative PTTL) gets one, so stray keys
/// left by other writers cannot pin a client forever.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

struct Node {
    addr: String,
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

/// Counter store shared by every instance pointed at the same Redis servers.
pub struct RedisStore {
    nodes: Vec<Node>,
    timeout: Duration,
    key_prefix: String,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("nodes", &self.nodes.iter().map(|n| &n.addr).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the configured servers.
    ///
    /// Nothing is dialled here; each node connects on its first increment
    /// so an unreachable server does not prevent startup.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        if config.addrs.is_empty() {
            return Err(QuotaError::InvalidConfig(
                "redis store needs at least one address".to_string(),
            ));
        }

        let nodes = config
            .addrs
            .iter()
            .map(|addr| {
                let client = redis::Client::open(connection_url(addr)).map_err(|e| {
                    QuotaError::InvalidConfig(format!("invalid redis address {:?}: {}", addr, e))
                })?;
                Ok(Node {
                    addr: addr.clone(),
                    client,
                    conn: OnceCell::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            nodes,
            timeout: config.timeout,
            key_prefix: config.key_prefix.clone(),
            script: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn counter_key(&self, key: &ClientKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self, node: &Node) -> Result<ConnectionManager> {
        let conn = node
            .conn
            .get_or_try_init(|| async {
                debug!(addr = %node.addr, "Connecting to redis");
                ConnectionManager::new(node.client.clone()).await
            })
            .await
            .map_err(|e| QuotaError::unavailable(BACKEND, format!("connect {}: {}", node.addr, e)))?;
        Ok(conn.clone())
    }

    async fn run_script(&self, node: &Node, key: &str, interval: Duration) -> Result<Count> {
        let mut conn = self.connection(node).await?;
        let window_ms = interval.as_millis().clamp(1, i64::MAX as u128) as i64;

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QuotaError::unavailable(BACKEND, e))?;

        Ok(Count {
            count,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }
}

/// Accept bare `host:port` as well as full `redis://` URLs.
fn connection_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}", addr)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &ClientKey, interval: Duration) -> Result<Count> {
        let node = &self.nodes[node_for(key.as_str(), self.nodes.len())];
        let counter_key = self.counter_key(key);

        trace!(key = %counter_key, node = %node.addr, "Incrementing redis counter");

        match tokio::time::timeout(self.timeout, self.run_script(node, &counter_key, interval)).await {
            Ok(result) => result,
            Err(_) => Err(QuotaError::unavailable(
                BACKEND,
                format!("{} timed out after {:?}", node.addr, self.timeout),
            )),
        }
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
