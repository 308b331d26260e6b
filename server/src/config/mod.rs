use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::{security_headers, SecurityHeaders};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/ticketing";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_ORDER_EXPIRY_SECS: u64 = 15 * 60;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
const DEFAULT_REAPER_BATCH_SIZE: i64 = 100;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub database_max_connections: u32,
    pub database_acquire_timeout: Duration,
    /// Pending orders older than this are cancelled by the reaper.
    pub order_expiry: Duration,
    pub reaper_interval: Duration,
    pub reaper_batch_size: i64,
    /// Comma separated list of origins for CORS.
    pub cors_allowed_origins: String,
    /// Enables HSTS.
    pub production: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid {
                name: "BIND_ADDR",
                expected: "a socket address",
                value: bind_addr.clone(),
            })?;

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            bind_addr,
            database_max_connections: parse_positive(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_MAX_CONNECTIONS,
            )?,
            database_acquire_timeout: Duration::from_secs(parse_positive(
                &lookup,
                "DATABASE_ACQUIRE_TIMEOUT_SECS",
                DEFAULT_ACQUIRE_TIMEOUT_SECS,
            )?),
            order_expiry: Duration::from_secs(parse_positive(
                &lookup,
                "ORDER_EXPIRY_SECS",
                DEFAULT_ORDER_EXPIRY_SECS,
            )?),
            reaper_interval: Duration::from_secs(parse_positive(
                &lookup,
                "REAPER_INTERVAL_SECS",
                DEFAULT_REAPER_INTERVAL_SECS,
            )?),
            reaper_batch_size: parse_positive(
                &lookup,
                "REAPER_BATCH_SIZE",
                DEFAULT_REAPER_BATCH_SIZE,
            )?,
            cors_allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string()),
            production: lookup("RUST_ENV")
                .map(|v| v.to_lowercase() == "production")
                .unwrap_or(false),
        })
    }
}

fn parse_positive<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a positive integer",
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_addr.port(), 3001);
        assert_eq!(config.order_expiry, Duration::from_secs(900));
        assert_eq!(config.reaper_batch_size, 100);
        assert!(!config.production);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("ORDER_EXPIRY_SECS", "60"),
            ("REAPER_BATCH_SIZE", "10"),
            ("RUST_ENV", "Production"),
        ])
        .unwrap();
        assert_eq!(config.order_expiry, Duration::from_secs(60));
        assert_eq!(config.reaper_batch_size, 10);
        assert!(config.production);
    }

    #[test]
    fn test_rejects_malformed_numbers() {
        assert!(config_from(&[("ORDER_EXPIRY_SECS", "soon")]).is_err());
        assert!(config_from(&[("REAPER_BATCH_SIZE", "0")]).is_err());
        assert!(config_from(&[("BIND_ADDR", "localhost")]).is_err());
    }
}
