//! Gateway Configuration Settings
//!
//! Configuration types for the broker gateway, loaded from environment
//! variables. Everything except the broker identity and credentials has a
//! default.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::backoff::BackoffConfig;
use crate::application::dispatch::DispatchSettings;
use crate::application::pipeline::ForwarderSettings;
use crate::application::ports::Credentials;
use crate::application::rate_limit::{Quota, RateLimitSettings};
use crate::application::reconciliation::ReconciliationSettings;
use crate::domain::{AccountId, SessionId};
use crate::infrastructure::connection::{ConnectionSettings, HeartbeatConfig};

/// Trading environment (paper vs live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Paper trading environment (simulated).
    #[default]
    Paper,
    /// Live trading environment (real money).
    Live,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Paper,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }
}

/// Broker endpoint identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client id. Two sessions with the same id conflict.
    pub client_id: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 1,
        }
    }
}

impl BrokerSettings {
    /// Identity under which checkpoints are stored.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId::from(format!("{}:{}:{}", self.host, self.port, self.client_id))
    }
}

/// Session timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTimings {
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Login timeout.
    pub auth_timeout: Duration,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Event pipeline and downstream settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Capacity of the downstream event channel.
    pub downstream_capacity: usize,
    /// Backlog watermarks.
    pub forwarder: ForwarderSettings,
    /// How often the backlog is retried.
    pub flush_interval: Duration,
    /// Processed event ids remembered for deduplication.
    pub dedup_window: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            downstream_capacity: 10_000,
            forwarder: ForwarderSettings::default(),
            flush_interval: Duration::from_millis(100),
            dedup_window: 10_000,
        }
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSettings {
    /// Checkpoint file.
    pub path: PathBuf,
    /// Maximum age of a checkpoint worth restoring.
    pub ttl: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/gateway-checkpoint.json"),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Trading environment.
    pub environment: Environment,
    /// Broker identity.
    pub broker: BrokerSettings,
    /// Login credentials and account.
    pub credentials: Credentials,
    /// Session timing.
    pub session: SessionTimings,
    /// Per-class quotas.
    pub rate_limits: RateLimitSettings,
    /// Dispatch timeouts and retries.
    pub dispatch: DispatchSettings,
    /// Reconciliation cadence.
    pub reconciliation: ReconciliationSettings,
    /// Event pipeline.
    pub pipeline: PipelineSettings,
    /// Checkpoint file.
    pub checkpoint: CheckpointSettings,
    /// HTTP server.
    pub server: ServerSettings,
}

impl GatewayConfig {
    /// Configuration with defaults for everything but identity.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            environment: Environment::default(),
            broker: BrokerSettings::default(),
            credentials,
            session: SessionTimings::default(),
            rate_limits: RateLimitSettings::default(),
            dispatch: DispatchSettings::default(),
            reconciliation: ReconciliationSettings::default(),
            pipeline: PipelineSettings::default(),
            checkpoint: CheckpointSettings::default(),
            server: ServerSettings::default(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// empty, or a numeric override does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let username = env.required("BROKER_USERNAME")?;
        let password = env.required("BROKER_PASSWORD")?;
        let account_id = env.required("BROKER_ACCOUNT_ID")?;
        let credentials = Credentials::new(username, password, AccountId::from(account_id));

        let mut config = Self::new(credentials);

        config.environment = env
            .get("GATEWAY_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let broker = BrokerSettings::default();
        config.broker = BrokerSettings {
            host: env.get("BROKER_HOST").unwrap_or(broker.host),
            port: env.parse("BROKER_PORT", broker.port)?,
            client_id: env.parse("BROKER_CLIENT_ID", broker.client_id)?,
        };

        let session = SessionTimings::default();
        config.session = SessionTimings {
            connect_timeout: env.secs("GATEWAY_CONNECT_TIMEOUT_SECS", session.connect_timeout)?,
            auth_timeout: env.secs("GATEWAY_AUTH_TIMEOUT_SECS", session.auth_timeout)?,
            heartbeat: HeartbeatConfig {
                interval: env.secs(
                    "GATEWAY_HEARTBEAT_INTERVAL_SECS",
                    session.heartbeat.interval,
                )?,
                timeout: env.secs("GATEWAY_HEARTBEAT_TIMEOUT_SECS", session.heartbeat.timeout)?,
            },
            backoff: BackoffConfig {
                base_delay: env.millis(
                    "GATEWAY_RECONNECT_BASE_DELAY_MS",
                    session.backoff.base_delay,
                )?,
                max_delay: env.secs("GATEWAY_RECONNECT_MAX_DELAY_SECS", session.backoff.max_delay)?,
                jitter_factor: env.parse("GATEWAY_RECONNECT_JITTER", session.backoff.jitter_factor)?,
                max_attempts: env.parse(
                    "GATEWAY_MAX_RECONNECT_ATTEMPTS",
                    session.backoff.max_attempts,
                )?,
            },
        };

        let limits = RateLimitSettings::default();
        config.rate_limits = RateLimitSettings {
            market_data: env.quota("GATEWAY_RATE_MARKET_DATA", limits.market_data)?,
            orders: env.quota("GATEWAY_RATE_ORDERS", limits.orders)?,
            account: env.quota("GATEWAY_RATE_ACCOUNT", limits.account)?,
        };

        let dispatch = DispatchSettings::default();
        config.dispatch = DispatchSettings {
            request_timeout: env.secs("GATEWAY_REQUEST_TIMEOUT_SECS", dispatch.request_timeout)?,
            admission_timeout: env.secs(
                "GATEWAY_ADMISSION_TIMEOUT_SECS",
                dispatch.admission_timeout,
            )?,
            retry: BackoffConfig {
                max_attempts: env.parse("GATEWAY_DISPATCH_RETRIES", dispatch.retry.max_attempts)?,
                ..dispatch.retry
            },
        };

        let reconciliation = ReconciliationSettings::default();
        config.reconciliation = ReconciliationSettings {
            interval: env.secs("GATEWAY_RECONCILE_INTERVAL_SECS", reconciliation.interval)?,
            checkpoint_interval: env.secs(
                "GATEWAY_CHECKPOINT_INTERVAL_SECS",
                reconciliation.checkpoint_interval,
            )?,
        };

        let pipeline = PipelineSettings::default();
        config.pipeline = PipelineSettings {
            downstream_capacity: env.parse(
                "GATEWAY_DOWNSTREAM_CAPACITY",
                pipeline.downstream_capacity,
            )?,
            forwarder: ForwarderSettings {
                degraded_watermark: env.parse(
                    "GATEWAY_BACKLOG_DEGRADED",
                    pipeline.forwarder.degraded_watermark,
                )?,
                down_watermark: env.parse(
                    "GATEWAY_BACKLOG_DOWN",
                    pipeline.forwarder.down_watermark,
                )?,
            },
            flush_interval: env.millis("GATEWAY_FLUSH_INTERVAL_MS", pipeline.flush_interval)?,
            dedup_window: env.parse("GATEWAY_DEDUP_WINDOW", pipeline.dedup_window)?,
        };

        let checkpoint = CheckpointSettings::default();
        config.checkpoint = CheckpointSettings {
            path: env
                .get("CHECKPOINT_PATH")
                .map_or(checkpoint.path, PathBuf::from),
            ttl: env.secs("CHECKPOINT_TTL_SECS", checkpoint.ttl)?,
        };

        config.server = ServerSettings {
            health_port: env.parse("HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        Ok(config)
    }

    /// Session identity used to validate checkpoints.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.broker.session_id()
    }

    /// The account this gateway trades.
    #[must_use]
    pub const fn account_id(&self) -> &AccountId {
        self.credentials.account_id()
    }

    /// Connection manager settings.
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            credentials: self.credentials.clone(),
            connect_timeout: self.session.connect_timeout,
            auth_timeout: self.session.auth_timeout,
            heartbeat: self.session.heartbeat,
            backoff: self.session.backoff,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.lookup)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }

    /// `<PREFIX>_CAPACITY` and `<PREFIX>_WINDOW_SECS`.
    fn quota(&self, prefix: &str, default: Quota) -> Result<Quota, ConfigError> {
        let capacity = self.parse(&format!("{prefix}_CAPACITY"), default.capacity)?;
        let window = self.secs(&format!("{prefix}_WINDOW_SECS"), default.window)?;
        Ok(Quota::new(capacity, window))
    }
}
