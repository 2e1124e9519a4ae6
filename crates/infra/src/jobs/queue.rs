//! Client-facing job API: enqueue, look up, list and cancel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use portal_core::{Clock, JobId, OwnerId, SystemClock};

use super::command::JobCommand;
use super::error::JobError;
use super::store::{JobStore, JobStoreError, PatchOutcome};
use super::types::{Job, JobPatch, JobStatus, NewJob, Precondition, MAX_ATTEMPTS_LIMIT};

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

// Re-reads allowed when a cancel races a concurrent update of the same job.
const CANCEL_MAX_TRIES: usize = 4;

/// Optional knobs for a new job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub owner_id: Option<OwnerId>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn owned_by(owner_id: OwnerId) -> Self {
        Self {
            owner_id: Some(owner_id),
            ..Self::default()
        }
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Why a cancel request changed nothing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelRefusal {
    AlreadyFinished,
    AlreadyCanceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CancelRefusal>,
}

impl CancelOutcome {
    fn canceled() -> Self {
        Self {
            canceled: true,
            reason: None,
        }
    }

    fn refused(reason: CancelRefusal) -> Self {
        Self {
            canceled: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("not allowed to modify job {0}")]
    Forbidden(JobId),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<JobError> for QueueError {
    fn from(err: JobError) -> Self {
        QueueError::Validation(err.to_string())
    }
}

/// Entry point for everything outside the runner that creates or changes jobs.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a `pending` job by type string.
    ///
    /// The type is not checked here; an unknown type fails at dispatch time.
    /// A missing payload is stored as `{}`.
    #[instrument(skip(self, payload, options), fields(owner_id = ?options.owner_id), err)]
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Option<serde_json::Value>,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        match options.max_attempts {
            Some(0) => {
                return Err(QueueError::Validation(
                    "max_attempts must be at least 1".to_string(),
                ));
            }
            Some(n) if n > MAX_ATTEMPTS_LIMIT => {
                return Err(QueueError::Validation(format!(
                    "max_attempts must be at most {MAX_ATTEMPTS_LIMIT}"
                )));
            }
            _ => {}
        }

        let mut request = NewJob::new(
            job_type,
            payload.unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        );
        request.owner_id = options.owner_id;
        request.run_at = options.run_at;
        request.max_attempts = options.max_attempts;

        let job = Job::new(request, self.clock.now());
        let id = self.store.insert(job).await?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Validate a typed command and enqueue it.
    pub async fn enqueue_command(
        &self,
        command: &JobCommand,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        command.validate()?;
        let payload = command.payload()?;
        self.enqueue(command.kind().as_str(), Some(payload), options)
            .await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Jobs of one owner, most recent first. `limit` defaults to 20 and is
    /// clamped to `1..=100`.
    pub async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, QueueError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.by_owner(owner_id, limit).await?)
    }

    /// Cancel a job on behalf of its owner.
    ///
    /// Cancel does not interrupt a handler that is already running; the
    /// runner's outcome write will find the job canceled and drop its result.
    #[instrument(skip(self), err)]
    pub async fn cancel(
        &self,
        job_id: JobId,
        requester: OwnerId,
    ) -> Result<CancelOutcome, QueueError> {
        for _ in 0..CANCEL_MAX_TRIES {
            let job = self
                .store
                .get(job_id)
                .await?
                .ok_or(QueueError::NotFound(job_id))?;

            if job.owner_id != Some(requester) {
                return Err(QueueError::Forbidden(job_id));
            }

            match job.status {
                JobStatus::Succeeded | JobStatus::Failed => {
                    return Ok(CancelOutcome::refused(CancelRefusal::AlreadyFinished));
                }
                JobStatus::Canceled => {
                    return Ok(CancelOutcome::refused(CancelRefusal::AlreadyCanceled));
                }
                JobStatus::Pending | JobStatus::Running => {}
            }

            let expected = Precondition {
                locked_by: job.locked_by.clone(),
                locked_at: job.locked_at,
                ..Precondition::status(job.status)
            };
            match self
                .store
                .patch_if(job_id, &expected, JobPatch::cancel(self.clock.now()))
                .await?
            {
                PatchOutcome::Applied(_) => {
                    info!(job_id = %job_id, previous = %job.status, "job canceled");
                    return Ok(CancelOutcome::canceled());
                }
                PatchOutcome::Missing => return Err(QueueError::NotFound(job_id)),
                PatchOutcome::Rejected(_) => continue,
            }
        }

        warn!(job_id = %job_id, "cancel kept losing to concurrent updates");
        Err(QueueError::Conflict(format!(
            "job {job_id} changed during cancel, try again"
        )))
    }
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}
