//! Process configuration for the API binary.

use std::env;
use std::net::SocketAddr;

use anyhow::{Context, Result};

use portal_infra::config::{DatabaseConfig, JobsConfig};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        let database = DatabaseConfig::from_env()?;
        let jobs = JobsConfig::from_env()?;

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("BIND_ADDR must be a socket address like 0.0.0.0:8080")?;

        Ok(Self {
            bind_addr,
            database,
            jobs,
        })
    }
}
