//! Service wiring: one job store shared by the queue and the runner.

use std::sync::Arc;

use anyhow::Result;

use portal_infra::db::connect_job_store;
use portal_infra::jobs::{
    Dispatcher, InMemoryJobStore, JobQueue, JobRunner, JobStore, RunnerId, ServiceHandlers,
    SweepRequest, UnconfiguredHandlers,
};

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub queue: JobQueue,
    pub runner: JobRunner,
    /// Runner identity and default batch size for admin-triggered sweeps.
    /// The id is derived from the scheduled runner's id with an `-admin`
    /// suffix so manual and timed sweeps never share a lock holder.
    pub sweep: SweepRequest,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<dyn ServiceHandlers>,
        sweep: SweepRequest,
    ) -> Self {
        let queue = JobQueue::new(store.clone());
        let runner = JobRunner::new(store.clone(), Dispatcher::new(handlers));
        let sweep = SweepRequest::new(admin_runner_id(&sweep.runner_id))
            .with_batch_size(sweep.batch_size);
        Self {
            store,
            queue,
            runner,
            sweep,
        }
    }

    /// In-memory store with no external service configured (dev/test).
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(UnconfiguredHandlers),
            SweepRequest::new(RunnerId::generate()),
        )
    }
}

fn admin_runner_id(scheduled: &RunnerId) -> RunnerId {
    RunnerId::new(format!("{scheduled}-admin"))
}

/// Wire services from configuration.
///
/// No account-service client ships with the portal yet, so handlers report
/// `CONFIG_MISSING` and jobs fail terminally instead of retrying.
pub async fn build_services(config: &AppConfig) -> Result<AppServices> {
    let store = connect_job_store(&config.database).await?;
    let mut services = AppServices::new(
        store,
        Arc::new(UnconfiguredHandlers),
        config.jobs.sweep_request(),
    );

    if let Some(timeout) = config.jobs.stale_lock_timeout {
        services.runner = services.runner.with_stale_lock_timeout(timeout);
    }
    Ok(services)
}
