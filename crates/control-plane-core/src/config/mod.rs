//! Configuration for the control-plane server.
//!
//! Loaded from environment variables with defaults matching the documented
//! keys; `validate()` is called once at startup so misconfiguration fails
//! fast instead of surfacing mid-request.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlPlaneError, RetryPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub event_store: EventStoreConfig,
    pub snapshot: SnapshotConfig,
    pub lock_retry: LockRetryConfig,
}

/// HTTP server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Registry backend and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Redis connection URL for the routing/health key-value store.
    pub redis_url: String,
    /// TTL attached to every `health:*` and `instance:*` write.
    pub health_ttl_seconds: u64,
    /// Heartbeat interval returned to workers.
    pub heartbeat_interval_seconds: u64,
}

/// Event log connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    pub database_url: String,
    pub connection_pool_size: u32,
}

/// Snapshot policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Events since the last snapshot before a new one is advised.
    pub threshold: i64,
    /// Snapshots older than this many days are deleted by the daily sweep.
    pub retention_days: i64,
    /// Whether the daily cleanup task runs at all.
    pub cleanup_enabled: bool,
}

/// Optimistic-retry settings for the aggregate lock manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub multiplier: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            health_ttl_seconds: 120,
            heartbeat_interval_seconds: 30,
        }
    }
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/control_plane".to_string(),
            connection_pool_size: 10,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            retention_days: 30,
            cleanup_enabled: true,
        }
    }
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 100,
            multiplier: 2.0,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            event_store: EventStoreConfig::default(),
            snapshot: SnapshotConfig::default(),
            lock_retry: LockRetryConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ControlPlaneError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ControlPlaneError::ConfigurationError {
            message: format!("{}: {}", key, e),
        }),
        Err(_) => Ok(default),
    }
}

impl ControlPlaneConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ControlPlaneError> {
        let defaults = Self::default();

        let config = Self {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env_or("PORT", defaults.server.port)?,
            },
            registry: RegistryConfig {
                redis_url: env::var("REDIS_URL").unwrap_or(defaults.registry.redis_url),
                health_ttl_seconds: env_or(
                    "HEALTH_TTL_SECONDS",
                    defaults.registry.health_ttl_seconds,
                )?,
                heartbeat_interval_seconds: env_or(
                    "HEARTBEAT_INTERVAL_SECONDS",
                    defaults.registry.heartbeat_interval_seconds,
                )?,
            },
            event_store: EventStoreConfig {
                database_url: env::var("DATABASE_URL")
                    .unwrap_or(defaults.event_store.database_url),
                connection_pool_size: env_or(
                    "EVENT_STORE_POOL_SIZE",
                    defaults.event_store.connection_pool_size,
                )?,
            },
            snapshot: SnapshotConfig {
                threshold: env_or("SNAPSHOT_THRESHOLD", defaults.snapshot.threshold)?,
                retention_days: env_or(
                    "SNAPSHOT_RETENTION_DAYS",
                    defaults.snapshot.retention_days,
                )?,
                cleanup_enabled: env_or(
                    "SNAPSHOT_CLEANUP_ENABLED",
                    defaults.snapshot.cleanup_enabled,
                )?,
            },
            lock_retry: LockRetryConfig {
                max_attempts: env_or("LOCK_RETRY_MAX_ATTEMPTS", defaults.lock_retry.max_attempts)?,
                base_ms: env_or("LOCK_RETRY_BASE_MS", defaults.lock_retry.base_ms)?,
                multiplier: env_or("LOCK_RETRY_MULTIPLIER", defaults.lock_retry.multiplier)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        if self.server.port == 0 {
            return Err(ControlPlaneError::ConfigurationError {
                message: "PORT must be non-zero".to_string(),
            });
        }
        if self.registry.health_ttl_seconds == 0 {
            return Err(ControlPlaneError::ConfigurationError {
                message: "HEALTH_TTL_SECONDS must be non-zero".to_string(),
            });
        }
        if self.snapshot.threshold <= 0 {
            return Err(ControlPlaneError::ConfigurationError {
                message: "SNAPSHOT_THRESHOLD must be positive".to_string(),
            });
        }
        if self.lock_retry.max_attempts == 0 {
            return Err(ControlPlaneError::ConfigurationError {
                message: "LOCK_RETRY_MAX_ATTEMPTS must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Health record TTL as a [`Duration`].
    pub fn health_ttl(&self) -> Duration {
        self.registry.health_ttl()
    }
}

impl RegistryConfig {
    /// Health record TTL as a [`Duration`].
    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_seconds)
    }
}

impl LockRetryConfig {
    /// Build the retry policy the lock manager uses for optimistic retries.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.base_ms),
            multiplier: self.multiplier,
            ..RetryPolicy::default()
        }
    }
}
