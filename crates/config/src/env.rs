use std::env;
use std::str::FromStr;

use lumen_common::error::{LumenError, LumenResult};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> LumenResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            host: get_var_or("HOST", "0.0.0.0"),
            port: get_parsed_or("PORT", 8080)?,
            log_level: get_var_or("LOG_LEVEL", "info"),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn get_var(key: &str) -> LumenResult<String> {
    env::var(key).map_err(|_| LumenError::Config(format!("{key} is required but not set")))
}

pub fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parse an optional variable, falling back to `default` when unset.
/// A value that is set but does not parse is a configuration error.
pub fn get_parsed_or<T>(key: &str, default: T) -> LumenResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| LumenError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}
