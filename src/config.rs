//! Process configuration, read from environment variables.

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::utils::BackoffPolicy;

/// Upper bound for every configured duration
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: String, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Pool size for the durable store
    pub db_max_connections: u32,
    pub kafka: KafkaConfig,
    pub cache: CacheConfig,
    pub retry: RetrySettings,
    /// Port of the /metrics and /health exporter
    pub metrics_port: u16,
    /// Grace period for the consumer to stop after a shutdown signal
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
    /// Malformed or conflicting messages go here when set
    pub dead_letter_topic: Option<String>,
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: NonZeroUsize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Newest orders loaded into the cache at startup; 0 disables warm-up
    pub warmup_limit: u32,
}

/// One backoff profile per retried I/O boundary
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub db_write: BackoffPolicy,
    pub db_read: BackoffPolicy,
    pub broker_read: BackoffPolicy,
    pub persist: BackoffPolicy,
    pub producer_send: BackoffPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            db_write: BackoffPolicy::db_write(),
            db_read: BackoffPolicy::db_read(),
            broker_read: BackoffPolicy::broker_read(),
            persist: BackoffPolicy::persist_after_consume(),
            producer_send: BackoffPolicy::producer_send(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let brokers: Vec<String> = env
            .required("KAFKA_BROKERS")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(ConfigError::Invalid {
                name: "KAFKA_BROKERS".to_string(),
                value: String::new(),
            });
        }

        let cache_size: usize = env.parsed("CACHE_SIZE", 1000)?;
        let max_size = NonZeroUsize::new(cache_size).ok_or_else(|| ConfigError::Invalid {
            name: "CACHE_SIZE".to_string(),
            value: cache_size.to_string(),
        })?;

        let initial_interval =
            env.duration("RETRY_INITIAL_INTERVAL", Duration::from_millis(100))?;
        let defaults = RetrySettings::default();

        let retry = RetrySettings {
            db_write: BackoffPolicy::new(
                "db_write",
                env.duration("RETRY_MAX_ELAPSED_TIME_DB", Duration::from_secs(5))?,
                initial_interval,
                env.duration("RETRY_MAX_INTERVAL_DB", Duration::from_secs(1))?,
            ),
            db_read: BackoffPolicy::new(
                "db_read",
                env.duration("RETRY_MAX_ELAPSED_TIME_READ", Duration::from_secs(3))?,
                initial_interval,
                env.duration("RETRY_MAX_INTERVAL_READ", Duration::from_millis(500))?,
            ),
            broker_read: env.profile("RETRY_BROKER_READ", defaults.broker_read)?,
            persist: env.profile("RETRY_PERSIST", defaults.persist)?,
            producer_send: env.profile("RETRY_PRODUCER_SEND", defaults.producer_send)?,
        };

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            db_max_connections: env.parsed("DB_MAX_CONNECTIONS", 10)?,
            kafka: KafkaConfig {
                brokers,
                topic: env.required("KAFKA_TOPIC")?,
                group_id: env
                    .optional("KAFKA_GROUP_ID")
                    .unwrap_or_else(|| "orders-group".to_string()),
                dead_letter_topic: env.optional("KAFKA_DEAD_LETTER_TOPIC"),
            },
            cache: CacheConfig {
                max_size,
                ttl: env.duration("CACHE_TTL", Duration::from_secs(30 * 60))?,
                sweep_interval: env.duration("CACHE_SWEEP_INTERVAL", Duration::from_secs(60))?,
                warmup_limit: env.parsed("CACHE_WARMUP_LIMIT", 100)?,
            },
            retry,
            metrics_port: env.parsed("METRICS_PORT", 9090)?,
            shutdown_timeout: env.duration("SHUTDOWN_TIMEOUT", Duration::from_secs(30))?,
        })
    }
}

struct Env<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Env<L> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(name) {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn duration(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.optional(name) {
            Some(value) => parse_duration(&value)
                .filter(|d| *d <= MAX_DURATION)
                .ok_or_else(|| ConfigError::Invalid {
                    name: name.to_string(),
                    value,
                }),
            None => Ok(default),
        }
    }

    /// Reads `<PREFIX>_MAX_ELAPSED_TIME`, `_INITIAL_INTERVAL` and `_MAX_INTERVAL`
    fn profile(&self, prefix: &str, base: BackoffPolicy) -> Result<BackoffPolicy, ConfigError> {
        Ok(BackoffPolicy {
            max_elapsed_time: self
                .duration(&format!("{prefix}_MAX_ELAPSED_TIME"), base.max_elapsed_time)?,
            initial_interval: self
                .duration(&format!("{prefix}_INITIAL_INTERVAL"), base.initial_interval)?,
            max_interval: self.duration(&format!("{prefix}_MAX_INTERVAL"), base.max_interval)?,
            ..base
        })
    }
}

/// Parses `250ms`, `5s`, `30m`, `1h`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: u64 = number.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(number)),
        "" | "s" => Some(Duration::from_secs(number)),
        "m" => number.checked_mul(60).map(Duration::from_secs),
        "h" => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
