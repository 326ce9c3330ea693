//! Configuration management for the quota engine.
//!
//! Configuration is read once at startup: defaults, then an optional file,
//! then `GEOQUOTA__SECTION__FIELD` environment variables. The binary applies
//! command-line overrides on top and calls [`AppConfig::validate`] before
//! anything is constructed from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{QuotaError, Result};

/// Main configuration for the quota engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Quota limit, window and backend selection
    pub quota: QuotaSettings,

    /// Redis connection parameters, used when `quota.backend` is `redis`
    pub redis: RedisConfig,

    /// Memcache connection parameters, used when `quota.backend` is `memcache`
    pub memcache: MemcacheConfig,

    /// How the admission middleware derives client keys
    pub admission: AdmissionConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// In-process counters; quotas are per process
    #[serde(rename = "memory", alias = "map")]
    Memory,
    /// Redis; quotas are shared by every instance using the same servers
    #[serde(rename = "redis", alias = "network-kv")]
    Redis,
    /// Memcache; quotas are shared by every instance using the same servers
    #[serde(rename = "memcache", alias = "network-cache")]
    Memcache,
}

impl Backend {
    /// Stable name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Redis => "redis",
            Backend::Memcache => "memcache",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "map" => Ok(Backend::Memory),
            "redis" | "network-kv" => Ok(Backend::Redis),
            "memcache" | "network-cache" => Ok(Backend::Memcache),
            other => Err(QuotaError::InvalidConfig(format!(
                "unknown quota backend {:?} (expected memory, redis or memcache)",
                other
            ))),
        }
    }
}

/// What the limiter does when its store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Counter store backend
    pub backend: Backend,

    /// Max requests per client key per interval; 0 turns quotas off
    pub limit: u64,

    /// Length of each fixed quota window
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Decision taken when the store cannot be reached
    pub on_store_error: FailurePolicy,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Redis,
            limit: 0,
            interval: Duration::from_secs(3600),
            on_store_error: FailurePolicy::Open,
        }
    }
}

impl QuotaSettings {
    /// Whether quotas are enforced at all.
    pub fn enabled(&self) -> bool {
        self.limit > 0
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server addresses (`host:port` or `redis://` URLs)
    #[serde(deserialize_with = "addr_list::deserialize")]
    pub addrs: Vec<String>,

    /// Upper bound for a single increment, connect included
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Namespace prepended to every counter key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["localhost:6379".to_string()],
            timeout: Duration::from_secs(1),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Memcache connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcacheConfig {
    /// Server addresses in `host:port` form
    #[serde(deserialize_with = "addr_list::deserialize")]
    pub addrs: Vec<String>,

    /// Upper bound for a single increment, connect included
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Namespace prepended to every counter key
    pub key_prefix: String,

    /// Connections kept per server
    pub pool_size: usize,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["localhost:11211".to_string()],
            timeout: Duration::from_secs(1),
            key_prefix: default_key_prefix(),
            pool_size: 8,
        }
    }
}

fn default_key_prefix() -> String {
    "geoquota:".to_string()
}

/// Client key derivation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Count requests under the X-Forwarded-For client instead of the peer
    pub use_x_forwarded_for: bool,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Prefix log lines with a timestamp
    pub timestamp: bool,
    /// Write to stdout instead of stderr
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            timestamp: true,
            stdout: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file and the environment.
    ///
    /// The file format follows its extension (yaml, toml or json).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GEOQUOTA")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::InvalidConfig(format!("Failed to parse configuration: {}", e)))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.quota.interval.is_zero() {
            return Err(QuotaError::InvalidConfig(
                "quota.interval must be a positive duration".to_string(),
            ));
        }

        match self.quota.backend {
            Backend::Memory => Ok(()),
            Backend::Redis => check_endpoint("redis", &self.redis.addrs, self.redis.timeout),
            Backend::Memcache => {
                check_endpoint("memcache", &self.memcache.addrs, self.memcache.timeout)?;
                if self.memcache.pool_size == 0 {
                    return Err(QuotaError::InvalidConfig(
                        "memcache.pool_size must be at least 1".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_endpoint(section: &str, addrs: &[String], timeout: Duration) -> Result<()> {
    if addrs.is_empty() {
        return Err(QuotaError::InvalidConfig(format!(
            "{}.addrs must name at least one server",
            section
        )));
    }
    if let Some(blank) = addrs.iter().find(|a| a.trim().is_empty()) {
        return Err(QuotaError::InvalidConfig(format!(
            "{}.addrs contains an empty address {:?}",
            section, blank
        )));
    }
    if timeout.is_zero() {
        return Err(QuotaError::InvalidConfig(format!(
            "{}.timeout must be a positive duration",
            section
        )));
    }
    Ok(())
}

/// Split a `host:port[,host:port]` list.
pub fn parse_addr_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a duration such as `"1h30m"`, `"500ms"` or `"2.5s"`.
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = |why: &str| QuotaError::InvalidConfig(format!("invalid duration {:?}: {}", input, why));

    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        total_nanos += (value * scale).round();
        rest = &rest[unit_len..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

/// Render a duration in the same notation [`parse_duration`] accepts.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let ms = d.subsec_millis();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    if ms > 0 {
        out.push_str(&format!("{}ms", ms));
    }
    if out.is_empty() {
        out.push_str(&format!("{}us", d.subsec_micros()));
    }
    out
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

mod addr_list {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(list) => super::parse_addr_list(&list),
            Raw::Many(addrs) => addrs
                .iter()
                .flat_map(|a| super::parse_addr_list(a))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.quota.backend, Backend::Redis);
        assert_eq!(config.quota.limit, 0);
        assert!(!config.quota.enabled());
        assert_eq!(config.quota.interval, Duration::from_secs(3600));
        assert_eq!(config.quota.on_store_error, FailurePolicy::Open);
        assert_eq!(config.redis.addrs, vec!["localhost:6379"]);
        assert_eq!(config.memcache.addrs, vec!["localhost:11211"]);
        assert_eq!(config.memcache.pool_size, 8);
        assert_eq!(config.redis.timeout, Duration::from_secs(1));
        assert!(!config.admission.use_x_forwarded_for);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2.5s").unwrap(), Duration::from_millis(2500));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 1s ").unwrap(), Duration::from_secs(1));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("1.5").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_format_duration_is_parseable() {
        for d in [
            Duration::from_secs(3600),
            Duration::from_secs(5401),
            Duration::from_millis(1500),
            Duration::from_micros(250),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
    }

    #[test]
    fn test_backend_names_and_aliases() {
        assert_eq!("memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!("map".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!("network-kv".parse::<Backend>().unwrap(), Backend::Redis);
        assert_eq!("Memcache".parse::<Backend>().unwrap(), Backend::Memcache);
        assert_eq!("network-cache".parse::<Backend>().unwrap(), Backend::Memcache);

        let err = "etcd".parse::<Backend>().unwrap_err();
        assert!(matches!(err, QuotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
quota:
  backend: memcache
  limit: 100
  interval: 1m
  on_store_error: closed
memcache:
  addrs: "10.0.0.1:11211, 10.0.0.2:11211"
  timeout: 250ms
  pool_size: 4
admission:
  use_x_forwarded_for: true
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.quota.backend, Backend::Memcache);
        assert_eq!(config.quota.limit, 100);
        assert_eq!(config.quota.interval, Duration::from_secs(60));
        assert_eq!(config.quota.on_store_error, FailurePolicy::Closed);
        assert_eq!(config.memcache.addrs, vec!["10.0.0.1:11211", "10.0.0.2:11211"]);
        assert_eq!(config.memcache.timeout, Duration::from_millis(250));
        assert_eq!(config.memcache.key_prefix, "geoquota:");
        assert_eq!(config.memcache.pool_size, 4);
        assert!(config.admission.use_x_forwarded_for);
        // untouched sections keep their defaults
        assert_eq!(config.redis.addrs, vec!["localhost:6379"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_unknown_backend() {
        let yaml = "quota:\n  backend: etcd\n";
        assert!(matches!(
            AppConfig::from_yaml(yaml),
            Err(QuotaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_yaml_negative_limit() {
        let yaml = "quota:\n  limit: -5\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = AppConfig::default();
        config.quota.interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(QuotaError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_checks_selected_backend_only() {
        let mut config = AppConfig::default();
        config.memcache.addrs.clear();
        config.quota.backend = Backend::Redis;
        assert!(config.validate().is_ok());

        config.quota.backend = Backend::Memcache;
        assert!(config.validate().is_err());

        config.quota.backend = Backend::Redis;
        config.redis.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.quota.backend = Backend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_memcache_pool() {
        let mut config = AppConfig::default();
        config.quota.backend = Backend::Memcache;
        config.memcache.pool_size = 0;
        assert!(matches!(config.validate(), Err(QuotaError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("geoquota-test-{}.yaml", std::process::id()));
        std::fs::write(&path, "quota:\n  backend: map\n  limit: 7\n  interval: 30s\n").unwrap();

        let config = AppConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();

        assert_eq!(config.quota.backend, Backend::Memory);
        assert_eq!(config.quota.limit, 7);
        assert_eq!(config.quota.interval, Duration::from_secs(30));
    }
}
