use std::env;
use std::time::Duration;

use crate::db::PoolSettings;

/// Worker configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub pool: PoolSettings,
    pub host: String,
    pub port: u16,
    pub charge_gateway_url: Option<String>,
    pub charge_gateway_token: Option<String>,
    pub charge_gateway_timeout: Duration,
    pub poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL must be set".to_string())?;

        let pool = PoolSettings::from_env()?;

        let host = env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8095".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        // No URL means charges are stamped by the local stub gateway
        let charge_gateway_url = env::var("CHARGE_GATEWAY_URL").ok().filter(|v| !v.is_empty());
        let charge_gateway_token = env::var("CHARGE_GATEWAY_TOKEN").ok().filter(|v| !v.is_empty());

        let charge_gateway_timeout = parse_secs("CHARGE_GATEWAY_TIMEOUT_SECS", 30)?;
        let poll_interval = parse_secs("WORKER_POLL_INTERVAL_SECS", 10)?;

        Ok(Config {
            database_url,
            pool,
            host,
            port,
            charge_gateway_url,
            charge_gateway_token,
            charge_gateway_timeout,
            poll_interval,
        })
    }
}

fn parse_secs(key: &str, default: u64) -> Result<Duration, String> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("{} must be a whole number of seconds", key)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
