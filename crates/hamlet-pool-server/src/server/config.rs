use crate::server::handlers::BUILTIN_ENDPOINTS;
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use hamlet_pool::{Backpressure, EndpointConfig, PoolConfig, ReusePolicy};
use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf};

/// Runtime configuration for the `hamlet-pool-server` binary.
///
/// Every value can be set on the command line or through the matching
/// environment variable (a `.env` file is loaded first). The per-endpoint
/// values act as defaults for every endpoint; an endpoints file can override
/// them one endpoint at a time.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hamlet-pool-server",
    version,
    about = "An HTTP dispatch front running endpoint handlers on isolated worker pools"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3000"))]
    pub server_addr: String,

    /// Comma separated endpoint names to serve. Ignored when
    /// `--endpoints-file` is given.
    ///
    /// Environment variable: `ENDPOINTS`
    #[arg(long, env = "ENDPOINTS", value_delimiter = ',', default_value = "Echo,Delay,Fail")]
    pub endpoints: Vec<String>,

    /// JSON file mapping endpoint names to per-endpoint overrides, e.g.
    /// `{"Echo": {"min_idle": 4, "reuse": true}}`.
    ///
    /// Environment variable: `ENDPOINTS_FILE`
    #[arg(long, env = "ENDPOINTS_FILE")]
    pub endpoints_file: Option<PathBuf>,

    /// Idle handler instances kept warm per endpoint.
    ///
    /// Environment variable: `MIN_IDLE`
    #[arg(long, env = "MIN_IDLE", default_value_t = 2)]
    pub min_idle: usize,

    /// Upper bound on idle instances per endpoint at rest.
    ///
    /// Environment variable: `MAX_IDLE`
    #[arg(long, env = "MAX_IDLE", default_value_t = 4)]
    pub max_idle: usize,

    /// Upper bound on idle + busy + spawning instances per endpoint.
    ///
    /// Environment variable: `MAX_SIZE`
    #[arg(long, env = "MAX_SIZE", default_value_t = 10)]
    pub max_size: usize,

    /// How long a request waits for a free instance, in milliseconds.
    ///
    /// Environment variable: `ACQUIRE_TIMEOUT_MS`
    #[arg(long, env = "ACQUIRE_TIMEOUT_MS", default_value_t = 1_000)]
    pub acquire_timeout_ms: u64,

    /// How long a handler may take to answer, in milliseconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// How long creating one handler instance may take, in milliseconds.
    ///
    /// Environment variable: `SPAWN_TIMEOUT_MS`
    #[arg(long, env = "SPAWN_TIMEOUT_MS", default_value_t = 2_000)]
    pub spawn_timeout_ms: u64,

    /// Reject requests immediately when an endpoint is at capacity instead
    /// of waiting for a free instance.
    ///
    /// Environment variable: `FAIL_FAST`
    #[arg(long, env = "FAIL_FAST", default_value_t = false)]
    pub fail_fast: bool,

    /// Return cleanly completed instances to the idle set instead of
    /// discarding them after one request.
    ///
    /// Environment variable: `REUSE_INSTANCES`
    #[arg(long, env = "REUSE_INSTANCES", default_value_t = false)]
    pub reuse: bool,

    /// Seconds to wait for in-flight requests during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Attempts per background replacement spawn.
    ///
    /// Environment variable: `REPLACEMENT_RETRIES`
    #[arg(long, env = "REPLACEMENT_RETRIES", default_value_t = 3)]
    pub replacement_retries: u32,
}

/// Per-endpoint overrides read from the endpoints file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointOverrides {
    pub min_idle: Option<usize>,
    pub max_idle: Option<usize>,
    pub max_size: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub spawn_timeout_ms: Option<u64>,
    pub fail_fast: Option<bool>,
    pub reuse: Option<bool>,
}

impl EndpointOverrides {
    fn apply(&self, base: EndpointConfig) -> EndpointConfig {
        let mut config = base;
        if let Some(n) = self.min_idle {
            config = config.min_idle(n);
        }
        if let Some(n) = self.max_idle {
            config = config.max_idle(n);
        }
        if let Some(n) = self.max_size {
            config = config.max_size(n);
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config = config.acquire_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.request_timeout_ms {
            config = config.request_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.spawn_timeout_ms {
            config = config.spawn_timeout(Duration::from_millis(ms));
        }
        if let Some(fail_fast) = self.fail_fast {
            config = config.backpressure(backpressure(fail_fast));
        }
        if let Some(reuse) = self.reuse {
            config = config.reuse(reuse_policy(reuse));
        }
        config
    }
}

const fn backpressure(fail_fast: bool) -> Backpressure {
    if fail_fast {
        Backpressure::FailFast
    } else {
        Backpressure::Wait
    }
}

const fn reuse_policy(reuse: bool) -> ReusePolicy {
    if reuse {
        ReusePolicy::Reuse
    } else {
        ReusePolicy::DiscardAfterUse
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub pool: PoolConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let base = EndpointConfig::new()
            .min_idle(args.min_idle)
            .max_idle(args.max_idle)
            .max_size(args.max_size)
            .acquire_timeout(Duration::from_millis(args.acquire_timeout_ms))
            .request_timeout(Duration::from_millis(args.request_timeout_ms))
            .spawn_timeout(Duration::from_millis(args.spawn_timeout_ms))
            .backpressure(backpressure(args.fail_fast))
            .reuse(reuse_policy(args.reuse));

        let overrides = match &args.endpoints_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                parse_endpoints_file(&raw)
                    .with_context(|| format!("invalid endpoints file {}", path.display()))?
            }
            None => args
                .endpoints
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), EndpointOverrides::default()))
                .collect(),
        };

        if overrides.is_empty() {
            bail!("ENDPOINTS must name at least one endpoint");
        }

        let mut pool = PoolConfig::new()
            .shutdown_grace(Duration::from_secs(args.shutdown_timeout))
            .replacement_retries(args.replacement_retries);
        for (name, endpoint) in overrides {
            if !BUILTIN_ENDPOINTS.contains(&name.as_str()) {
                bail!(
                    "No handler for endpoint `{name}` (available: {})",
                    BUILTIN_ENDPOINTS.join(", ")
                );
            }
            let config = endpoint.apply(base);
            pool = pool.endpoint(name, config);
        }
        pool.validate()?;

        Ok(Self {
            server_addr: args.server_addr,
            pool,
        })
    }
}

/// Parses `{"<endpoint>": { ...overrides }}`.
pub fn parse_endpoints_file(raw: &str) -> anyhow::Result<BTreeMap<String, EndpointOverrides>> {
    Ok(serde_json::from_str(raw)?)
}
