use std::{env, fmt, str::FromStr, time::Duration};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// AppConfig
///
/// Holds the application's entire configuration state. Read once at startup and
/// immutable afterwards; shared through `AppState`.
#[derive(Clone)]
pub struct AppConfig {
    // Runtime environment marker. Selects the log format.
    pub env: Env,
    pub bind_addr: String,
    pub storage: StorageBackend,
    // Shared secret used to verify session tokens (HS256).
    pub storage_key: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    // Retry budget for idempotent reads.
    pub retry: RetryPolicy,
}

/// Env
///
/// Defines the runtime context: pretty logs locally, JSON logs in production.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Env {
    Local,
    Production,
}

/// StorageBackend
///
/// Where rows live. `memory://` runs the in-process policy-enforcing store.
#[derive(Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres(String),
}

impl fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Memory => f.write_str("Memory"),
            // The URL carries credentials.
            StorageBackend::Postgres(_) => f.write_str("Postgres(<redacted>)"),
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("bind_addr", &self.bind_addr)
            .field("storage", &self.storage)
            .field("storage_key", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for AppConfig {
    /// default
    ///
    /// A configuration for tests and scaffolding: in-process storage and a fixed
    /// development key. Never used by `main`.
    fn default() -> Self {
        Self {
            env: Env::Local,
            bind_addr: "0.0.0.0:3000".to_string(),
            storage: StorageBackend::Memory,
            storage_key: "local-development-storage-key".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_millis(3000),
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// load
    ///
    /// Reads the configuration from the process environment (call `dotenv` first).
    /// Fails fast on a missing required variable or any unparsable value.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// from_lookup
    ///
    /// Same as `load` with an arbitrary key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let env = match lookup("APP_ENV").as_deref() {
            None | Some("local") => Env::Local,
            Some("production") => Env::Production,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "APP_ENV",
                    value: other.to_string(),
                    reason: "expected `local` or `production`".to_string(),
                });
            }
        };

        let storage_url = lookup("STORAGE_URL").ok_or(ConfigError::Missing("STORAGE_URL"))?;
        let storage = parse_storage(&storage_url)?;

        let storage_key = lookup("STORAGE_KEY")
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::Missing("STORAGE_KEY"))?;

        let max_connections: u32 =
            parsed(&lookup, "STORAGE_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "STORAGE_MAX_CONNECTIONS",
                value: "0".to_string(),
                reason: "at least one connection is required".to_string(),
            });
        }

        let acquire_timeout = parsed(&lookup, "STORAGE_ACQUIRE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.acquire_timeout);

        let retry = RetryPolicy {
            max_retries: parsed(&lookup, "STORAGE_READ_RETRIES")?
                .unwrap_or(defaults.retry.max_retries),
            base_backoff: parsed(&lookup, "STORAGE_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_backoff),
        };

        Ok(Self {
            env,
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            storage,
            storage_key,
            max_connections,
            acquire_timeout,
            retry,
        })
    }
}

fn parse_storage(url: &str) -> Result<StorageBackend, ConfigError> {
    if url == "memory://" {
        Ok(StorageBackend::Memory)
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(StorageBackend::Postgres(url.to_string()))
    } else {
        Err(ConfigError::Invalid {
            key: "STORAGE_URL",
            value: url.split("://").next().unwrap_or_default().to_string(),
            reason: "expected a postgres:// or memory:// url".to_string(),
        })
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}
