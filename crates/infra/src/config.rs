//! Configuration loading from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::jobs::runner::{clamp_batch_size, DEFAULT_BATCH_SIZE};
use crate::jobs::schedule::{DEFAULT_RECONCILE_INTERVAL, DEFAULT_SWEEP_INTERVAL};
use crate::jobs::{RunnerId, ScheduleConfig, SweepRequest};

/// Database settings. Without a URL the process runs on the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
        })
    }
}

/// Runner and timer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    pub runner_id: RunnerId,
    /// Already clamped to `1..=50`.
    pub batch_size: usize,
    pub sweep_interval: Duration,
    pub reconcile_interval: Duration,
    /// Stale-lock reclaim is off unless set.
    pub stale_lock_timeout: Option<Duration>,
}

impl JobsConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let runner_id = lookup("JOBS_RUNNER_ID")
            .filter(|id| !id.trim().is_empty())
            .map(RunnerId::new)
            .unwrap_or_else(RunnerId::generate);

        let batch_size: usize = parse_or(&lookup, "JOBS_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let sweep_secs = parse_or(&lookup, "JOBS_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL.as_secs())?;
        let reconcile_secs = parse_or(
            &lookup,
            "JOBS_RECONCILE_INTERVAL_SECS",
            DEFAULT_RECONCILE_INTERVAL.as_secs(),
        )?;
        if sweep_secs == 0 || reconcile_secs == 0 {
            anyhow::bail!("job intervals must be at least one second");
        }

        let stale_lock_timeout = match lookup("JOBS_STALE_LOCK_SECS") {
            Some(raw) => Some(Duration::from_secs(
                raw.trim()
                    .parse()
                    .context("JOBS_STALE_LOCK_SECS must be a number of seconds")?,
            )),
            None => None,
        };

        Ok(Self {
            runner_id,
            batch_size: clamp_batch_size(batch_size),
            sweep_interval: Duration::from_secs(sweep_secs),
            reconcile_interval: Duration::from_secs(reconcile_secs),
            stale_lock_timeout,
        })
    }

    pub fn sweep_request(&self) -> SweepRequest {
        SweepRequest::new(self.runner_id.clone()).with_batch_size(self.batch_size)
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig::new(self.sweep_request())
            .with_sweep_interval(self.sweep_interval)
            .with_reconcile_interval(self.reconcile_interval)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        None => Ok(default),
    }
}
