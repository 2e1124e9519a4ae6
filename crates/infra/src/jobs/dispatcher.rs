//! Routes a job's type and payload to the matching service handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use portal_core::OwnerId;

use super::command::{
    ChangePassword, ChangePlan, JobCommand, ProvisionAccount, RenewSubscription, SuspendAccount,
    SyncAccounts,
};
use super::error::JobError;

/// Side-effecting operations against the external account service.
///
/// Implementations classify their own failures: a [`JobError::Retryable`]
/// is rescheduled with backoff, a terminal error fails the job for good.
#[async_trait]
pub trait ServiceHandlers: Send + Sync {
    async fn provision(
        &self,
        owner: Option<OwnerId>,
        payload: &ProvisionAccount,
    ) -> Result<(), JobError>;

    async fn renew(
        &self,
        owner: Option<OwnerId>,
        payload: &RenewSubscription,
    ) -> Result<(), JobError>;

    async fn suspend(&self, owner: Option<OwnerId>, payload: &SuspendAccount)
    -> Result<(), JobError>;

    async fn sync(&self, owner: Option<OwnerId>, payload: &SyncAccounts) -> Result<(), JobError>;

    async fn change_password(
        &self,
        owner: Option<OwnerId>,
        payload: &ChangePassword,
    ) -> Result<(), JobError>;

    async fn change_plan(&self, owner: Option<OwnerId>, payload: &ChangePlan)
    -> Result<(), JobError>;
}

/// Handlers for a deployment without an external service configured.
///
/// Every call fails with `CONFIG_MISSING`, so jobs fail after one attempt
/// instead of cycling through retries.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredHandlers;

impl UnconfiguredHandlers {
    fn missing(operation: &str) -> JobError {
        JobError::config_missing(format!("no account service configured for {operation}"))
    }
}

#[async_trait]
impl ServiceHandlers for UnconfiguredHandlers {
    async fn provision(&self, _: Option<OwnerId>, _: &ProvisionAccount) -> Result<(), JobError> {
        Err(Self::missing("provision"))
    }

    async fn renew(&self, _: Option<OwnerId>, _: &RenewSubscription) -> Result<(), JobError> {
        Err(Self::missing("renew"))
    }

    async fn suspend(&self, _: Option<OwnerId>, _: &SuspendAccount) -> Result<(), JobError> {
        Err(Self::missing("suspend"))
    }

    async fn sync(&self, _: Option<OwnerId>, _: &SyncAccounts) -> Result<(), JobError> {
        Err(Self::missing("sync"))
    }

    async fn change_password(&self, _: Option<OwnerId>, _: &ChangePassword) -> Result<(), JobError> {
        Err(Self::missing("change_password"))
    }

    async fn change_plan(&self, _: Option<OwnerId>, _: &ChangePlan) -> Result<(), JobError> {
        Err(Self::missing("change_plan"))
    }
}

/// Fixed mapping from job type to handler.
///
/// Holds no retry logic: handler errors are returned unchanged and the runner
/// decides what they mean for the record.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<dyn ServiceHandlers>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<dyn ServiceHandlers>) -> Self {
        Self { handlers }
    }

    /// Dispatcher whose handlers all report missing configuration.
    pub fn unconfigured() -> Self {
        Self::new(Arc::new(UnconfiguredHandlers))
    }

    #[instrument(skip(self, payload), fields(owner_id = ?owner))]
    pub async fn dispatch(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        owner: Option<OwnerId>,
    ) -> Result<(), JobError> {
        let command = JobCommand::decode(job_type, payload)?;
        debug!(kind = %command.kind(), "dispatching job");
        self.execute(&command, owner).await
    }

    /// Run an already-decoded command.
    pub async fn execute(&self, command: &JobCommand, owner: Option<OwnerId>) -> Result<(), JobError> {
        let handlers = self.handlers.as_ref();
        match command {
            JobCommand::Provision(p) => handlers.provision(owner, p).await,
            JobCommand::Renew(p) => handlers.renew(owner, p).await,
            JobCommand::Suspend(p) => handlers.suspend(owner, p).await,
            JobCommand::Sync(p) => handlers.sync(owner, p).await,
            JobCommand::ChangePassword(p) => handlers.change_password(owner, p).await,
            JobCommand::ChangePlan(p) => handlers.change_plan(owner, p).await,
        }
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
