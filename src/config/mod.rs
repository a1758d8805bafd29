//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString so it
//! never reaches a log line.

pub mod secrets;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// TOML file declaring command kinds and their hooks.
    pub kinds_file: Option<PathBuf>,
    /// Dispatcher idle poll interval.
    pub poll_interval: Duration,
    /// Maximum commands executing at once.
    pub max_concurrent: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let poll_interval_ms: u64 = optional_parsed("CMDQ_POLL_INTERVAL_MS")?.unwrap_or(1000);
        let max_concurrent: usize = optional_parsed("CMDQ_MAX_CONCURRENT")?.unwrap_or(4);
        if max_concurrent == 0 {
            return Err(Error::Config(
                "CMDQ_MAX_CONCURRENT must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            kinds_file: kinds_file_from_env(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_concurrent,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// The kinds file named by `CMDQ_KINDS_FILE`, if any.
///
/// Needs no other configuration, for commands that never open the store.
pub fn kinds_file_from_env() -> Option<PathBuf> {
    std::env::var("CMDQ_KINDS_FILE").ok().map(PathBuf::from)
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}
