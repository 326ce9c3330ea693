use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use geoquota::admission::{Admission, Verdict};
use geoquota::config::{parse_addr_list, parse_duration, AppConfig, Backend, LoggingConfig};
use geoquota::quota::Limiter;

/// Quota admission control for IP geolocation APIs.
#[derive(Debug, Parser)]
#[command(name = "geoquota", version, about)]
struct Cli {
    /// Configuration file (yaml, toml or json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend for rate limiter: memory (map), redis, or memcache
    #[arg(long, global = true)]
    quota_backend: Option<Backend>,

    /// Max requests per source IP per interval; set 0 to turn quotas off
    #[arg(long, global = true)]
    quota_max: Option<u64>,

    /// Quota expiration interval, per source IP querying the API
    #[arg(long, global = true, value_parser = parse_duration)]
    quota_interval: Option<Duration>,

    /// Redis address in form of host:port[,host:port] for quota
    #[arg(long, global = true)]
    redis: Option<String>,

    /// Redis read/write timeout
    #[arg(long, global = true, value_parser = parse_duration)]
    redis_timeout: Option<Duration>,

    /// Memcache address in form of host:port[,host:port] for quota
    #[arg(long, global = true)]
    memcache: Option<String>,

    /// Memcache read/write timeout
    #[arg(long, global = true, value_parser = parse_duration)]
    memcache_timeout: Option<Duration>,

    /// Connections kept per memcache server
    #[arg(long, global = true)]
    memcache_pool_size: Option<usize>,

    /// Use the X-Forwarded-For header when available (e.g. behind proxy)
    #[arg(long, global = true)]
    use_x_forwarded_for: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration
    Config,
    /// Run admission decisions for a client against the configured backend
    Check {
        /// Client source address
        key: IpAddr,

        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        hits: u32,

        /// X-Forwarded-For header value to present
        #[arg(long)]
        forwarded_for: Option<String>,
    },
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(backend) = self.quota_backend {
            config.quota.backend = backend;
        }
        if let Some(limit) = self.quota_max {
            config.quota.limit = limit;
        }
        if let Some(interval) = self.quota_interval {
            config.quota.interval = interval;
        }
        if let Some(addrs) = &self.redis {
            config.redis.addrs = parse_addr_list(addrs);
        }
        if let Some(timeout) = self.redis_timeout {
            config.redis.timeout = timeout;
        }
        if let Some(addrs) = &self.memcache {
            config.memcache.addrs = parse_addr_list(addrs);
        }
        if let Some(timeout) = self.memcache_timeout {
            config.memcache.timeout = timeout;
        }
        if let Some(pool_size) = self.memcache_pool_size {
            config.memcache.pool_size = pool_size;
        }
        if self.use_x_forwarded_for {
            config.admission.use_x_forwarded_for = true;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let writer = if logging.stdout {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(writer);

    match (logging.json, logging.timestamp) {
        (true, _) => builder.json().init(),
        (false, true) => builder.init(),
        (false, false) => builder.without_time().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Loaded configuration file");
    }

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Check {
            key,
            hits,
            forwarded_for,
        } => {
            let limiter = Arc::new(Limiter::from_config(&config)?);
            let admission = Admission::new(limiter.clone(), &config.admission);
            let client = admission.client_key(key, forwarded_for.as_deref());

            for _ in 0..hits {
                let decision = limiter.allow(&client).await;
                let status = match admission.verdict(&decision) {
                    Verdict::Proceed { .. } => 200,
                    Verdict::Reject { status, .. } => status,
                };
                println!(
                    "{}",
                    json!({ "key": client.as_str(), "status": status, "decision": decision })
                );
            }

            println!("{}", serde_json::to_string(&limiter.metrics())?);
        }
    }

    Ok(())
}
