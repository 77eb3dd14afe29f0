//! Postgres pool for the bill run worker
//!
//! Pool sizing comes from `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` and
//! `DB_ACQUIRE_TIMEOUT_SECS`. A bill run holds one connection per billing
//! period write and one for each status check, so the defaults are small.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset keys fall back to the defaults; malformed values are errors
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = Self::default();

        let number = |key: &str, default: u64| -> Result<u64, String> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("{key} must be a whole number, got '{value}'")),
                None => Ok(default),
            }
        };

        let max_connections = number("DB_MAX_CONNECTIONS", defaults.max_connections.into())?;
        let min_connections = number("DB_MIN_CONNECTIONS", defaults.min_connections.into())?;
        let acquire_timeout_secs =
            number("DB_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout.as_secs())?;

        let max_connections = u32::try_from(max_connections)
            .map_err(|_| "DB_MAX_CONNECTIONS is too large".to_string())?;
        let min_connections = u32::try_from(min_connections)
            .map_err(|_| "DB_MIN_CONNECTIONS is too large".to_string())?;

        if max_connections == 0 {
            return Err("DB_MAX_CONNECTIONS must be at least 1".to_string());
        }
        if min_connections > max_connections {
            return Err(format!(
                "DB_MIN_CONNECTIONS ({min_connections}) exceeds DB_MAX_CONNECTIONS ({max_connections})"
            ));
        }

        Ok(Self {
            max_connections,
            min_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        })
    }
}

pub async fn init_pool(database_url: &str, settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    tracing::debug!(
        max_connections = settings.max_connections,
        min_connections = settings.min_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        "Opening database pool"
    );

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
}
