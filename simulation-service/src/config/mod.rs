//! Configuration module for simulation-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub billing: BillingProviderConfig,
    pub quota: QuotaConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BillingProviderConfig {
    pub webhook_secret: String,
}

/// Thresholds governing when a session consumes quota.
#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    /// Minimum session length in seconds before it counts against quota.
    pub countable_threshold_seconds: i64,
    /// Hard cap on recorded session duration.
    pub max_session_seconds: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Open sessions older than this are treated as orphaned.
    pub stale_after_seconds: i64,
    pub batch_size: i64,
}

impl SimulationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "simulation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            billing: BillingProviderConfig {
                webhook_secret: env::var("BILLING_WEBHOOK_SECRET").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("BILLING_WEBHOOK_SECRET is required"))
                })?,
            },
            quota: QuotaConfig {
                countable_threshold_seconds: env::var("COUNTABLE_THRESHOLD_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
                max_session_seconds: env::var("MAX_SESSION_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(14_400),
            },
            reconciler: ReconcilerConfig {
                enabled: env::var("RECONCILER_ENABLED")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(true),
                interval_seconds: env::var("RECONCILER_INTERVAL_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
                stale_after_seconds: env::var("RECONCILER_STALE_AFTER_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(21_600),
                batch_size: env::var("RECONCILER_BATCH_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            },
        })
    }
}
