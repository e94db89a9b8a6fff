//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs.

pub mod secrets;

use crate::error::{Error, Result};
use crate::model::ClaimStrategy;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Persist debug events to the store (`BUS_DEBUG=1`).
    pub debug_events: bool,
    pub claim_strategy: ClaimStrategy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let claim_strategy = match std::env::var("BUS_CLAIM_STRATEGY") {
            Ok(s) if !s.trim().is_empty() => s.trim().parse()?,
            _ => ClaimStrategy::default(),
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            debug_events: std::env::var("BUS_DEBUG").is_ok_and(|v| v == "1"),
            claim_strategy,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
