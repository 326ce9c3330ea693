//! Counter store abstraction shared by the memory and network backends.

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{QuotaError, Result};

/// Identifies the caller a quota is charged to, normally an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Create a key from an arbitrary non-empty string.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(QuotaError::InvalidKey("client key must not be empty".to_string()));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counter state observed by one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    /// Value of the counter after this increment, starting at 1 per window
    pub count: u64,
    /// Time left in the window the increment landed in
    pub ttl: Duration,
}

/// A store of fixed-window counters.
///
/// Implementations must linearize increments of the same key: within one
/// window the returned counts are exactly 1, 2, 3, ... no matter how many
/// callers race. The first increment of a window sets its length to
/// `interval`; later increments report the remaining time and never extend it.
/// Backend failures are reported as [`QuotaError::StoreUnavailable`].
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter for `key`, opening a new window if needed.
    async fn increment(&self, key: &ClientKey, interval: Duration) -> Result<Count>;

    /// Backend name used in logs and metrics.
    fn backend(&self) -> &'static str;
}

/// Pick the node responsible for `key` among `nodes` servers.
///
/// Uses FNV-1a so every instance routes a key to the same server regardless
/// of how it was built.
pub(crate) fn node_for(key: &str, nodes: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    if nodes <= 1 {
        return 0;
    }
    let hash = key
        .bytes()
        .fold(OFFSET, |h, b| (h ^ b as u64).wrapping_mul(PRIME));
    (hash % nodes as u64) as usize
}
