//! Runtime Configuration
//!
//! Every setting is read from the environment by a `from_env()` constructor.
//! Numeric settings that fail to parse fall back to their defaults; driver
//! names and the Postgres SSL mode are validated and fail startup instead.

use crate::db::DbConfig;
use clientele_core::{ClienteleResult, ConfigError, LOOKUP_CACHE_TTL, UPSERT_ACTIVITY_TIMEOUT};
use clientele_delivery::{ActivityOptions, RetryPolicy, DEFAULT_RUN_RETENTION};
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use std::time::Duration;

/// Queue the upsert subscriber consumes from when none is configured.
pub const DEFAULT_UPSERT_QUEUE: &str = "client.upsert.subscriber";

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

/// `redis://[:password@]host:port/`
fn redis_url(host: &str, port: u16, password: Option<&SecretString>) -> String {
    match password {
        Some(password) => format!(
            "redis://:{}@{}:{}/",
            urlencoding::encode(password.expose_secret()),
            host,
            port
        ),
        None => format!("redis://{}:{}/", host, port),
    }
}

// ============================================================================
// DRIVERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseDriver {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDriver {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDriver {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowDriver {
    InProcess,
}

fn unsupported(role: &str, driver: &str) -> ConfigError {
    ConfigError::DriverNotSupported {
        role: role.to_string(),
        driver: driver.to_string(),
    }
}

/// Which backend fills each outbound role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub database: DatabaseDriver,
    pub cache: CacheDriver,
    pub message: MessageDriver,
    pub workflow: WorkflowDriver,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            database: DatabaseDriver::Memory,
            cache: CacheDriver::Memory,
            message: MessageDriver::Memory,
            workflow: WorkflowDriver::InProcess,
        }
    }
}

impl DriverConfig {
    /// Environment variables:
    /// - `OUTBOUND_DATABASE_DRIVER`: `postgres` or `memory` (default: memory)
    /// - `OUTBOUND_CACHE_DRIVER`: `redis` or `memory` (default: memory)
    /// - `OUTBOUND_MESSAGE_DRIVER`: `redis` or `memory` (default: memory)
    /// - `OUTBOUND_WORKFLOW_DRIVER`: `inprocess` (default)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(
            &env_or("OUTBOUND_DATABASE_DRIVER", "memory"),
            &env_or("OUTBOUND_CACHE_DRIVER", "memory"),
            &env_or("OUTBOUND_MESSAGE_DRIVER", "memory"),
            &env_or("OUTBOUND_WORKFLOW_DRIVER", "inprocess"),
        )
    }

    pub fn parse(
        database: &str,
        cache: &str,
        message: &str,
        workflow: &str,
    ) -> Result<Self, ConfigError> {
        let database = match database.to_lowercase().as_str() {
            "postgres" => DatabaseDriver::Postgres,
            "memory" => DatabaseDriver::Memory,
            other => return Err(unsupported("database", other)),
        };
        let cache = match cache.to_lowercase().as_str() {
            "redis" => CacheDriver::Redis,
            "memory" => CacheDriver::Memory,
            other => return Err(unsupported("cache", other)),
        };
        let message = match message.to_lowercase().as_str() {
            "redis" => MessageDriver::Redis,
            "memory" => MessageDriver::Memory,
            other => return Err(unsupported("message", other)),
        };
        let workflow = match workflow.to_lowercase().as_str() {
            "inprocess" => WorkflowDriver::InProcess,
            other => return Err(unsupported("workflow", other)),
        };
        Ok(Self {
            database,
            cache,
            message,
            workflow,
        })
    }

    /// Whether the broker lives in this process. The subscriber must then
    /// run in the same process as the publishers.
    pub fn is_process_local_broker(&self) -> bool {
        self.message == MessageDriver::Memory
    }
}

// ============================================================================
// CACHE
// ============================================================================

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    pub ttl: Duration,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            ttl: LOOKUP_CACHE_TTL,
            key_prefix: String::new(),
        }
    }
}

impl CacheConfig {
    /// Environment variables:
    /// - `CACHE_HOST` (default: localhost)
    /// - `CACHE_PORT` (default: 6379)
    /// - `CACHE_PASSWORD` (optional)
    /// - `CACHE_TTL_SECS` (default: 86400)
    /// - `CACHE_KEY_PREFIX` (default: empty)
    pub fn from_env() -> Self {
        Self {
            host: env_or("CACHE_HOST", "localhost"),
            port: env_parse("CACHE_PORT", 6379),
            password: env_secret("CACHE_PASSWORD"),
            ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", LOOKUP_CACHE_TTL.as_secs())),
            key_prefix: env_or("CACHE_KEY_PREFIX", ""),
        }
    }

    pub fn url(&self) -> String {
        redis_url(&self.host, self.port, self.password.as_ref())
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

#[derive(Debug, Clone)]
pub struct MessageConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    /// Queue bound to the upsert topic.
    pub upsert_queue: String,
    pub block: Duration,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            upsert_queue: DEFAULT_UPSERT_QUEUE.to_string(),
            block: Duration::from_millis(5000),
        }
    }
}

impl MessageConfig {
    /// Environment variables:
    /// - `MESSAGE_HOST` (default: localhost)
    /// - `MESSAGE_PORT` (default: 6379)
    /// - `MESSAGE_PASSWORD` (optional)
    /// - `UPSERT_CLIENT_MESSAGE_SUBSCRIBE` (default: client.upsert.subscriber)
    /// - `MESSAGE_BLOCK_MS` (default: 5000)
    pub fn from_env() -> Self {
        Self {
            host: env_or("MESSAGE_HOST", "localhost"),
            port: env_parse("MESSAGE_PORT", 6379),
            password: env_secret("MESSAGE_PASSWORD"),
            upsert_queue: env_or("UPSERT_CLIENT_MESSAGE_SUBSCRIBE", DEFAULT_UPSERT_QUEUE),
            block: Duration::from_millis(env_parse("MESSAGE_BLOCK_MS", 5000)),
        }
    }

    pub fn url(&self) -> String {
        redis_url(&self.host, self.port, self.password.as_ref())
    }
}

// ============================================================================
// WORKFLOW
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub namespace: String,
    pub activity: ActivityOptions,
    /// How long finished runs stay readable.
    pub run_retention: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            activity: ActivityOptions::new(UPSERT_ACTIVITY_TIMEOUT)
                .with_retry_policy(RetryPolicy::default()),
            run_retention: DEFAULT_RUN_RETENTION,
        }
    }
}

impl WorkflowConfig {
    /// Environment variables:
    /// - `WORKFLOW_NAMESPACE` (default: default)
    /// - `WORKFLOW_ACTIVITY_TIMEOUT_SECS` (default: 300)
    /// - `WORKFLOW_MAX_ATTEMPTS` (default: 5)
    /// - `WORKFLOW_INITIAL_INTERVAL_MS` (default: 1000)
    /// - `WORKFLOW_BACKOFF_COEFFICIENT` (default: 2.0)
    /// - `WORKFLOW_MAX_INTERVAL_SECS` (default: 100)
    /// - `WORKFLOW_RUN_RETENTION_SECS` (default: 3600)
    pub fn from_env() -> Self {
        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_attempts: env_parse("WORKFLOW_MAX_ATTEMPTS", defaults.max_attempts),
            initial_interval: Duration::from_millis(env_parse(
                "WORKFLOW_INITIAL_INTERVAL_MS",
                defaults.initial_interval.as_millis() as u64,
            )),
            backoff_coefficient: env_parse(
                "WORKFLOW_BACKOFF_COEFFICIENT",
                defaults.backoff_coefficient,
            ),
            max_interval: Duration::from_secs(env_parse(
                "WORKFLOW_MAX_INTERVAL_SECS",
                defaults.max_interval.as_secs(),
            )),
        };
        let timeout = Duration::from_secs(env_parse(
            "WORKFLOW_ACTIVITY_TIMEOUT_SECS",
            UPSERT_ACTIVITY_TIMEOUT.as_secs(),
        ));

        Self {
            namespace: env_or("WORKFLOW_NAMESPACE", "default"),
            activity: ActivityOptions::new(timeout).with_retry_policy(retry_policy),
            run_retention: Duration::from_secs(env_parse(
                "WORKFLOW_RUN_RETENTION_SECS",
                DEFAULT_RUN_RETENTION.as_secs(),
            )),
        }
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Log output mode. `release` switches the formatter to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Debug,
    Release,
}

impl AppMode {
    pub fn from_env() -> Self {
        match env_or("APP_MODE", "debug").to_lowercase().as_str() {
            "release" => Self::Release,
            _ => Self::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret for `/internal/*`. Internal routes reject every request
    /// when unset.
    pub internal_key: Option<SecretString>,
    /// Window over which `/v1/ping` samples CPU counters.
    pub ping_sample: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            internal_key: None,
            ping_sample: Duration::from_millis(1000),
        }
    }
}

impl ServerConfig {
    /// Environment variables:
    /// - `SERVER_HOST` (default: 0.0.0.0)
    /// - `SERVER_PORT` (default: 8000)
    /// - `INTERNAL_KEY` (optional)
    /// - `PING_SAMPLE_MS` (default: 1000)
    pub fn from_env() -> Self {
        Self {
            host: env_or("SERVER_HOST", "0.0.0.0"),
            port: env_parse("SERVER_PORT", 8000),
            internal_key: env_secret("INTERNAL_KEY"),
            ping_sample: Duration::from_millis(env_parse("PING_SAMPLE_MS", 1000)),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "SERVER_HOST".to_string(),
                value: addr.clone(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// AUTH
// ============================================================================

/// How `/v1/*` bearer tokens are checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthDriver {
    /// The token is a client bearer key, looked up through the resolver.
    #[default]
    ClientKey,
    /// The token is a JWT verified against the key set at `jwks_url`.
    Jwt { jwks_url: String },
}

impl AuthDriver {
    /// Environment variables:
    /// - `AUTH_DRIVER`: `client` or `jwt` (default: client)
    /// - `AUTH_JWKS_URL`: required when `AUTH_DRIVER=jwt`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(
            &env_or("AUTH_DRIVER", "client"),
            std::env::var("AUTH_JWKS_URL").ok(),
        )
    }

    pub fn parse(driver: &str, jwks_url: Option<String>) -> Result<Self, ConfigError> {
        match driver.to_lowercase().as_str() {
            "" | "client" => Ok(Self::ClientKey),
            "jwt" => jwks_url
                .filter(|url| !url.is_empty())
                .map(|jwks_url| Self::Jwt { jwks_url })
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: "AUTH_JWKS_URL".to_string(),
                }),
            other => Err(unsupported("auth", other)),
        }
    }
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Everything the binary needs, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: AppMode,
    pub drivers: DriverConfig,
    pub server: ServerConfig,
    pub auth: AuthDriver,
    pub database: DbConfig,
    pub cache: CacheConfig,
    pub message: MessageConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    pub fn from_env() -> ClienteleResult<Self> {
        let drivers = DriverConfig::from_env()?;
        let database = DbConfig::from_env();
        if drivers.database == DatabaseDriver::Postgres {
            database.validate()?;
        }

        Ok(Self {
            mode: AppMode::from_env(),
            drivers,
            server: ServerConfig::from_env(),
            auth: AuthDriver::from_env()?,
            database,
            cache: CacheConfig::from_env(),
            message: MessageConfig::from_env(),
            workflow: WorkflowConfig::from_env(),
        })
    }

    /// In-memory backends and defaults everywhere.
    pub fn in_memory() -> Self {
        Self {
            mode: AppMode::Debug,
            drivers: DriverConfig::default(),
            server: ServerConfig::default(),
            auth: AuthDriver::default(),
            database: DbConfig::default(),
            cache: CacheConfig::default(),
            message: MessageConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}
