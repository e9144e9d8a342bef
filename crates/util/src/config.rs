use std::{env, fmt, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use super::{DEFAULT_BIND_ADDR, DEFAULT_DATABASE_URL};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Shared secret bytes. `Debug` never prints the value.
#[derive(Clone)]
pub struct Secret(Arc<[u8]>);

impl Secret {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(value.into().into_boxed_slice()))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// HMAC signing secrets, one per webhook provider. A missing secret means
/// every delivery from that provider fails verification.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub alchemy: Option<Secret>,
    pub quicknode: Option<Secret>,
}

/// Chain access used by reconciliation and amount decoding.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network: String,
    pub rpc_url: Option<String>,
    pub rpc_timeout: Duration,
    /// Lowercase `0x`-prefixed contract addresses.
    pub contract_addresses: Vec<String>,
    pub amount_decimals: u32,
}

/// Per-event deadline and retry schedule, shared by the queue consumers and
/// reconciliation replays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub process_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl RetryPolicy {
    /// `retry_base * 2^(attempt-1)`, capped at 2^10 multiples.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        self.retry_base.saturating_mul(1 << exponent)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            process_timeout: Duration::from_millis(5000),
            max_attempts: 5,
            retry_base: Duration::from_millis(200),
        }
    }
}

/// Tuning of the partitioned processing queue.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub partitions: usize,
    pub queue_capacity: usize,
    /// Budget for enqueuing a whole webhook delivery, not each event.
    pub enqueue_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            queue_capacity: 256,
            enqueue_timeout: Duration::from_millis(2000),
            retry: RetryPolicy::default(),
        }
    }
}

/// Reconciliation schedule and chunking.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Option<Duration>,
    pub chunk_size: u64,
    pub confirmations: u64,
    pub start_block: u64,
    pub retry: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: None,
            chunk_size: 2000,
            confirmations: 12,
            start_block: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook_secrets: WebhookSecrets,
    pub admin_token: Option<Secret>,
    pub chain: ChainConfig,
    pub sync: SyncConfig,
    pub reconcile: ReconcileConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Constructs the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let env_value = get("APP_ENV").unwrap_or_else(|| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = get("APP_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(ConfigError::BindAddress)?;
        let database_url = get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let webhook_secrets = WebhookSecrets {
            alchemy: get("ALCHEMY_SIGNING_KEY").map(Secret::new),
            quicknode: get("QUICKNODE_SIGNING_KEY").map(Secret::new),
        };
        let admin_token = get("ADMIN_TOKEN").map(Secret::new);

        let contract_addresses = get("INVOICE_CONTRACT_ADDRESSES")
            .map(|raw| parse_addresses(&raw))
            .transpose()?
            .unwrap_or_default();
        let amount_decimals: u32 = parse_or(&get, "CHAIN_AMOUNT_DECIMALS", 6)?;
        if !(2..=36).contains(&amount_decimals) {
            return Err(ConfigError::OutOfRange {
                var: "CHAIN_AMOUNT_DECIMALS",
                value: amount_decimals.to_string(),
            });
        }
        let chain = ChainConfig {
            network: get("CHAIN_NETWORK").unwrap_or_else(|| "eth-mainnet".to_string()),
            rpc_url: get("CHAIN_RPC_URL"),
            rpc_timeout: Duration::from_millis(parse_or(&get, "CHAIN_RPC_TIMEOUT_MS", 10_000)?),
            contract_addresses,
            amount_decimals,
        };

        let retry = RetryPolicy {
            process_timeout: Duration::from_millis(parse_or(
                &get,
                "SYNC_PROCESS_TIMEOUT_MS",
                5000,
            )?),
            max_attempts: parse_positive(&get, "SYNC_MAX_ATTEMPTS", 5)?,
            retry_base: Duration::from_millis(parse_or(&get, "SYNC_RETRY_BASE_MS", 200)?),
        };
        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            partitions: parse_positive(&get, "SYNC_PARTITIONS", defaults.partitions)?,
            queue_capacity: parse_positive(&get, "SYNC_QUEUE_CAPACITY", defaults.queue_capacity)?,
            enqueue_timeout: Duration::from_millis(parse_or(
                &get,
                "SYNC_ENQUEUE_TIMEOUT_MS",
                2000,
            )?),
            retry: retry.clone(),
        };

        let reconcile = ReconcileConfig {
            interval: get("RECONCILE_INTERVAL_SECS")
                .map(|raw| parse_value::<u64>("RECONCILE_INTERVAL_SECS", &raw))
                .transpose()?
                .map(Duration::from_secs),
            chunk_size: parse_positive(&get, "RECONCILE_CHUNK_SIZE", 2000)?,
            confirmations: parse_or(&get, "RECONCILE_CONFIRMATIONS", 12)?,
            start_block: parse_or(&get, "RECONCILE_START_BLOCK", 0)?,
            retry,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook_secrets,
            admin_token,
            chain,
            sync,
            reconcile,
        })
    }
}

fn parse_value<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.to_string(),
    })
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

fn parse_positive<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, var, default)?;
    if value <= T::default() {
        return Err(ConfigError::OutOfRange {
            var,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn parse_addresses(raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let lowered = item.to_ascii_lowercase();
            let valid = lowered
                .strip_prefix("0x")
                .filter(|hex_part| hex_part.len() == 40)
                .map(|hex_part| hex::decode(hex_part).is_ok())
                .unwrap_or(false);
            if valid {
                Ok(lowered)
            } else {
                Err(ConfigError::InvalidAddress(item.to_string()))
            }
        })
        .collect()
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { var: &'static str, value: String },
    OutOfRange { var: &'static str, value: String },
    InvalidAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a non-negative integer (got {value})")
            }
            Self::OutOfRange { var, value } => write!(f, "{var} is out of range (got {value})"),
            Self::InvalidAddress(value) => write!(
                f,
                "INVOICE_CONTRACT_ADDRESSES contains an invalid address: {value}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
