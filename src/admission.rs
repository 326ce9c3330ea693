//! What the HTTP admission middleware needs from the quota engine.
//!
//! This module is transport agnostic: the middleware hands over the peer
//! address and the raw `X-Forwarded-For` header, and gets back a [`Verdict`]
//! carrying the status code and header values to write.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AdmissionConfig;
use crate::quota::{ClientKey, Decision, Limiter};

/// Status sent when a client is over quota.
pub const REJECT_STATUS: u16 = 403;

/// Values for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Unix time (seconds) at which the window resets
    pub reset: i64,
}

impl RateLimitHeaders {
    fn new(limit: u64, decision: &Decision) -> Self {
        Self {
            limit,
            remaining: decision.remaining(limit),
            reset: chrono::Utc::now().timestamp() + ceil_secs(decision.remaining_ttl) as i64,
        }
    }

    /// Header name/value pairs ready to be written.
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ]
    }
}

/// What the middleware should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Serve the request. Headers are absent when quotas are disabled.
    Proceed { headers: Option<RateLimitHeaders> },
    /// Answer with `status` and a `Retry-After` of `retry_after` seconds.
    Reject {
        status: u16,
        retry_after: u64,
        headers: RateLimitHeaders,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Proceed { .. })
    }
}

/// Derives client keys and turns decisions into verdicts.
#[derive(Debug, Clone)]
pub struct Admission {
    limiter: Arc<Limiter>,
    use_x_forwarded_for: bool,
}

impl Admission {
    pub fn new(limiter: Arc<Limiter>, config: &AdmissionConfig) -> Self {
        Self {
            limiter,
            use_x_forwarded_for: config.use_x_forwarded_for,
        }
    }

    /// The key a request is counted under.
    ///
    /// With `use_x_forwarded_for` the left-most valid address of the header
    /// wins; otherwise, or when the header has none, the peer address is used.
    pub fn client_key(&self, peer: IpAddr, forwarded_for: Option<&str>) -> ClientKey {
        if self.use_x_forwarded_for {
            if let Some(ip) = forwarded_for.and_then(first_forwarded_ip) {
                return ClientKey::from(ip);
            }
        }
        ClientKey::from(peer)
    }

    /// Count the request and decide what to answer.
    pub async fn admit(&self, peer: IpAddr, forwarded_for: Option<&str>) -> Verdict {
        let key = self.client_key(peer, forwarded_for);
        let decision = self.limiter.allow(&key).await;
        self.verdict(&decision)
    }

    /// Map a decision onto the response the middleware should send.
    pub fn verdict(&self, decision: &Decision) -> Verdict {
        if !self.limiter.enabled() {
            return Verdict::Proceed { headers: None };
        }

        let headers = RateLimitHeaders::new(self.limiter.limit(), decision);
        if decision.allowed {
            Verdict::Proceed {
                headers: Some(headers),
            }
        } else {
            Verdict::Reject {
                status: REJECT_STATUS,
                retry_after: ceil_secs(decision.remaining_ttl).max(1),
                headers,
            }
        }
    }
}

fn first_forwarded_ip(header: &str) -> Option<IpAddr> {
    header.split(',').map(str::trim).find_map(|entry| {
        entry
            .parse::<IpAddr>()
            .ok()
            .or_else(|| entry.parse::<SocketAddr>().ok().map(|a| a.ip()))
    })
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, FailurePolicy, QuotaSettings};
    use crate::quota::MemoryStore;

    fn admission(limit: u64, use_x_forwarded_for: bool) -> Admission {
        let settings = QuotaSettings {
            backend: Backend::Memory,
            limit,
            interval: Duration::from_secs(60),
            on_store_error: FailurePolicy::Open,
        };
        let limiter = Limiter::new(&settings, Arc::new(MemoryStore::new())).unwrap();
        Admission::new(Arc::new(limiter), &AdmissionConfig { use_x_forwarded_for })
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_client_key_ignores_header_without_opt_in() {
        let admission = admission(1, false);
        let key = admission.client_key(ip("10.0.0.1"), Some("203.0.113.7"));
        assert_eq!(key.as_str(), "10.0.0.1");
    }

    #[test]
    fn test_client_key_uses_left_most_forwarded_ip() {
        let admission = admission(1, true);

        let key = admission.client_key(ip("10.0.0.1"), Some("203.0.113.7, 10.1.1.1"));
        assert_eq!(key.as_str(), "203.0.113.7");

        let key = admission.client_key(ip("10.0.0.1"), Some("unknown, [2001:db8::5]:443"));
        assert_eq!(key.as_str(), "2001:db8::5");

        let key = admission.client_key(ip("10.0.0.1"), Some("garbage"));
        assert_eq!(key.as_str(), "10.0.0.1");

        let key = admission.client_key(ip("10.0.0.1"), None);
        assert_eq!(key.as_str(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_admit_rejects_over_quota() {
        let admission = admission(2, false);
        let peer = ip("10.0.0.1");

        let first = admission.admit(peer, None).await;
        match first {
            Verdict::Proceed { headers: Some(headers) } => {
                assert_eq!(headers.limit, 2);
                assert_eq!(headers.remaining, 1);
                assert!(headers.reset >= chrono::Utc::now().timestamp());
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert!(admission.admit(peer, None).await.is_allowed());

        match admission.admit(peer, None).await {
            Verdict::Reject {
                status,
                retry_after,
                headers,
            } => {
                assert_eq!(status, REJECT_STATUS);
                assert!(retry_after >= 1 && retry_after <= 60);
                assert_eq!(headers.remaining, 0);
                let pairs = headers.pairs();
                assert_eq!(pairs[0], ("X-RateLimit-Limit", "2".to_string()));
                assert_eq!(pairs[1], ("X-RateLimit-Remaining", "0".to_string()));
            }
            other => panic!("unexpected verdict {:?}", other),
        }

        // Another client still has its full quota.
        assert!(admission.admit(ip("10.0.0.2"), None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_admit_disabled_sends_no_headers() {
        let admission = admission(0, false);
        for _ in 0..5 {
            assert_eq!(
                admission.admit(ip("10.0.0.1"), None).await,
                Verdict::Proceed { headers: None }
            );
        }
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::from_millis(3001)), 4);
    }
}
