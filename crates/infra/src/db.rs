//! Database wiring: pool construction and store selection.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};

/// Build the job store selected by `config`.
///
/// With a database URL this connects, creates the schema if needed and
/// returns the Postgres store; otherwise it falls back to the in-memory store.
pub async fn connect_job_store(config: &DatabaseConfig) -> Result<Arc<dyn JobStore>> {
    let Some(url) = config.url.as_deref() else {
        warn!("DATABASE_URL not set, jobs are kept in memory only");
        return Ok(Arc::new(InMemoryJobStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .context("failed to connect to database")?;

    let store = PostgresJobStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to create jobs schema")?;

    info!(max_connections = config.max_connections, "postgres job store ready");
    Ok(Arc::new(store))
}
