//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{ConfigError, Result};

/// Deployment environment. Worker routes are only open without a shared
/// secret in development.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> std::result::Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::InvalidValue {
                key: "FAST_TALK_ENV".to_string(),
                message: format!("expected development or production, got {other}"),
            }),
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the HTTP server binds.
    pub port: u16,
    /// Deployment environment.
    pub environment: Environment,
    /// Shared secret required by worker routes outside development.
    pub worker_secret: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            environment: Environment::Development,
            worker_secret: None,
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs one batch invocation claims.
    pub batch_size: usize,
    /// Maximum handlers executing simultaneously within a batch.
    pub concurrency: usize,
    /// Processing jobs older than this are presumed abandoned.
    pub stale_threshold: Duration,
    /// Attempt budget before a stale job is failed for good.
    pub max_attempts: u32,
    /// In-process worker poll interval (None disables the loop).
    pub worker_interval: Option<Duration>,
    /// Stale-sweep interval for the maintenance task.
    pub maintenance_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 3,
            stale_threshold: Duration::from_secs(300), // 5 minutes
            max_attempts: 3,
            worker_interval: Some(Duration::from_secs(10)),
            maintenance_interval: Duration::from_secs(60), // 1 minute
        }
    }
}

/// Routing configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Confidence at or above which a trivial classification bypasses the
    /// two-phase flow.
    pub bypass_threshold: f32,
    /// Agent used when no heuristic matches and no model is available.
    pub default_agent: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bypass_threshold: 0.85,
            default_agent: "deep-reasoning".to_string(),
        }
    }
}

/// Full service configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub router: RouterConfig,
    pub db_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment = Environment::parse(
            &std::env::var("FAST_TALK_ENV").unwrap_or_else(|_| "development".to_string()),
        )?;

        let worker_secret = std::env::var("FAST_TALK_WORKER_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        if !environment.is_development() && worker_secret.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "FAST_TALK_WORKER_SECRET".to_string(),
                hint: "worker routes must not be publicly invocable outside development"
                    .to_string(),
            }
            .into());
        }

        let port: u16 = std::env::var("FAST_TALK_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let batch_size: usize = std::env::var("FAST_TALK_BATCH_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let concurrency: usize = std::env::var("FAST_TALK_CONCURRENCY")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let stale_secs: u64 = std::env::var("FAST_TALK_STALE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let max_attempts: u32 = std::env::var("FAST_TALK_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let worker_secs: u64 = std::env::var("FAST_TALK_WORKER_INTERVAL_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let bypass_threshold: f32 = std::env::var("FAST_TALK_BYPASS_THRESHOLD")
            .unwrap_or_else(|_| "0.85".to_string())
            .parse()
            .unwrap_or(0.85);

        let db_path =
            std::env::var("FAST_TALK_DB_PATH").unwrap_or_else(|_| "./data/fast-talk.db".to_string());

        Ok(Self {
            server: ServerConfig {
                port,
                environment,
                worker_secret,
            },
            queue: QueueConfig {
                batch_size,
                concurrency,
                stale_threshold: Duration::from_secs(stale_secs),
                max_attempts,
                worker_interval: (worker_secs > 0).then(|| Duration::from_secs(worker_secs)),
                maintenance_interval: Duration::from_secs(60),
            },
            router: RouterConfig {
                bypass_threshold,
                ..RouterConfig::default()
            },
            db_path,
        })
    }
}
