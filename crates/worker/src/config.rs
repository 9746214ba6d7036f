//! Worker configuration

use std::env;
use thiserror::Error;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Job cadence (6-field cron expressions, seconds first)
    pub downgrade_schedule: String,
    pub order_expiry_schedule: String,

    /// Hours a pending order may sit unpaid before it is cancelled
    pub pending_order_max_age_hours: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            // Downgrades materialize at billing-cycle boundaries, so a short
            // sweep interval only bounds how late they land.
            downgrade_schedule: env::var("DOWNGRADE_SCHEDULE")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            order_expiry_schedule: env::var("ORDER_EXPIRY_SCHEDULE")
                .unwrap_or_else(|_| "0 15 * * * *".to_string()),
            pending_order_max_age_hours: env::var("PENDING_ORDER_MAX_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
        })
    }
}
