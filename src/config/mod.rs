//! Application configuration.
//!
//! Aggregates configuration for every component into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "token-exchange.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TOKEN_EXCHANGE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TOKEN_EXCHANGE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TOKEN_EXCHANGE_LOG";
/// Environment variable for database URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";

/// Default notification channel name.
pub const DEFAULT_CHANNEL: &str = "user_replicated";
/// Default exchange service address.
pub const DEFAULT_EXCHANGE_ADDRESS: &str = "http://localhost:50051";

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 120;
/// Default wait between attempts when no notification arrives.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Default deadline for a single exchange call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5000;
/// Default time a producer waits for queue space before dropping.
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5000;
/// Default per-listener queue capacity.
pub const DEFAULT_LISTENER_CAPACITY: usize = 16;
/// Default fan-in queue capacity.
pub const DEFAULT_FAN_IN_CAPACITY: usize = 64;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database holding the replication notification channel.
    pub database: DatabaseConfig,
    /// Exchange service endpoint.
    pub exchange: ExchangeEndpointConfig,
    /// Attempt budget and timing.
    pub retry: RetryPolicy,
    /// Notification source settings.
    pub listener: ListenerConfig,
    /// Fan-in multiplexer settings.
    pub fan_in: FanInConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `token-exchange.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        if config.database.url.is_none() {
            config.database.url = std::env::var(DATABASE_URL_ENV_VAR).ok();
        }
        Ok(config)
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL. None = run without change notifications.
    pub url: Option<String>,
    /// Pool size. Each listener holds one connection for its lifetime.
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 4,
            acquire_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Exchange service endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeEndpointConfig {
    /// gRPC address (http://host:port).
    pub address: String,
    /// Seconds allowed for establishing the channel.
    pub connect_timeout_secs: u64,
}

impl Default for ExchangeEndpointConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_EXCHANGE_ADDRESS.to_string(),
            connect_timeout_secs: 5,
        }
    }
}

impl ExchangeEndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Attempt budget and timing for one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum exchange calls before giving up. Zero is treated as one.
    pub max_attempts: u32,
    /// Milliseconds to wait between attempts when no notification arrives.
    pub poll_interval_ms: u64,
    /// Deadline for a single exchange call in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, poll_interval: Duration) -> Self {
        Self {
            max_attempts,
            poll_interval_ms: millis(poll_interval),
            ..Default::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = millis(timeout);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Upper bound on wall-clock time for one exchange.
    pub fn worst_case(&self) -> Duration {
        (self.poll_interval() + self.call_timeout()) * self.attempts()
    }
}

/// Notification source settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Channel name passed to `LISTEN`.
    pub channel: String,
    /// Capacity of the listener's event queue.
    pub queue_capacity: usize,
    /// Milliseconds to wait for queue space before dropping an event.
    pub delivery_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            queue_capacity: DEFAULT_LISTENER_CAPACITY,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
        }
    }
}

impl ListenerConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Fan-in multiplexer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanInConfig {
    /// Capacity of the merged event queue.
    pub queue_capacity: usize,
    /// Milliseconds a forwarder waits for queue space before dropping.
    pub delivery_timeout_ms: u64,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_FAN_IN_CAPACITY,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
        }
    }
}

impl FanInConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}
