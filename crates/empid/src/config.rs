//! Worker configuration from environment variables.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub database_url: String,
    pub metrics_port: u16,
    /// Sleep between polls of the job table when no work is found.
    pub poll_interval_secs: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            worker_id: std::env::var("WORKER_ID")
                .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL required")?,
            metrics_port: std::env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()
                .context("Invalid METRICS_PORT")?,
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("Invalid POLL_INTERVAL_SECS")?,
        })
    }
}
