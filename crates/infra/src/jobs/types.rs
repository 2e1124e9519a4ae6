//! Core job record types and the field-level patches that move a record
//! through its lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portal_core::{JobId, OwnerId};

/// Attempt ceiling applied when the caller does not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Largest attempt ceiling the `jobs` table can hold (INTEGER column).
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// Job lifecycle status.
///
/// ```text
/// pending ──lock──▶ running ──ok──────────▶ succeeded
///    ▲                 │ ──retryable──▶ pending
///    │                 │ ──terminal/ceiling──▶ failed
///    └── cancel ───────┴──────────────▶ canceled
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for its `next_run_at`.
    Pending,
    /// Claimed by a runner; lock fields are set.
    Running,
    /// Handler returned normally.
    Succeeded,
    /// Terminal failure or attempt ceiling reached.
    Failed,
    /// Canceled by its owner.
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// `succeeded` or `failed`: the runner is done with the job for good.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Identity a runner stamps into `locked_by` when it claims a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(String);

impl RunnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique identifier (`runner-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("runner-{}", uuid::Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler selector, validated only at dispatch time.
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub owner_id: Option<OwnerId>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not attempted before this instant (only meaningful while pending).
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation request for a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub owner_id: Option<OwnerId>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            owner_id: None,
            run_at: None,
            max_attempts: None,
        }
    }

    pub fn owned_by(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
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

impl Job {
    /// Materialize a fresh `pending` record.
    pub fn new(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: request.job_type,
            status: JobStatus::Pending,
            payload: request.payload,
            owner_id: request.owner_id,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            next_run_at: request.run_at.unwrap_or(now),
            locked_by: None,
            locked_at: None,
            last_attempt_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at <= now
    }

    /// `running` iff both lock fields are present.
    pub fn lock_fields_consistent(&self) -> bool {
        let locked = self.locked_by.is_some() && self.locked_at.is_some();
        let unlocked = self.locked_by.is_none() && self.locked_at.is_none();
        if self.status == JobStatus::Running {
            locked
        } else {
            unlocked
        }
    }

    /// Apply a patch in place (used by stores that hold records in memory).
    pub fn apply(&mut self, patch: &JobPatch) {
        self.status = patch.status;
        self.locked_by = patch.locked_by.clone();
        self.locked_at = patch.locked_at;
        self.updated_at = patch.updated_at;

        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(at) = patch.next_run_at {
            self.next_run_at = at;
        }
        if let Some(at) = patch.last_attempt_at {
            self.last_attempt_at = Some(at);
        }
        match &patch.last_error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Set(msg) => self.last_error = Some(msg.clone()),
            ErrorUpdate::Clear => self.last_error = None,
        }
    }
}

/// How a patch treats `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorUpdate {
    Keep,
    Set(String),
    Clear,
}

/// Field-level update for a single lifecycle transition.
///
/// `status`, the lock fields and `updated_at` are always written; the
/// remaining fields are only written when present.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: ErrorUpdate,
    pub updated_at: DateTime<Utc>,
}

impl JobPatch {
    fn unlocked(status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            locked_by: None,
            locked_at: None,
            attempts: None,
            next_run_at: None,
            last_attempt_at: None,
            last_error: ErrorUpdate::Keep,
            updated_at: now,
        }
    }

    /// `pending → running`.
    pub fn lock(runner_id: &RunnerId, now: DateTime<Utc>) -> Self {
        Self {
            locked_by: Some(runner_id.as_str().to_string()),
            locked_at: Some(now),
            last_attempt_at: Some(now),
            ..Self::unlocked(JobStatus::Running, now)
        }
    }

    /// `running → succeeded`.
    pub fn succeed(now: DateTime<Utc>) -> Self {
        Self {
            last_error: ErrorUpdate::Clear,
            ..Self::unlocked(JobStatus::Succeeded, now)
        }
    }

    /// `running → pending`, rescheduled at `next_run_at`.
    pub fn retry(
        attempts: u32,
        error: impl Into<String>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            attempts: Some(attempts),
            next_run_at: Some(next_run_at),
            last_error: ErrorUpdate::Set(error.into()),
            ..Self::unlocked(JobStatus::Pending, now)
        }
    }

    /// `running → failed`.
    pub fn fail(attempts: u32, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            attempts: Some(attempts),
            last_error: ErrorUpdate::Set(error.into()),
            ..Self::unlocked(JobStatus::Failed, now)
        }
    }

    /// `pending/running → canceled`.
    pub fn cancel(now: DateTime<Utc>) -> Self {
        Self::unlocked(JobStatus::Canceled, now)
    }
}

/// What a record must still look like for a conditional patch to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub status: JobStatus,
    /// Require `next_run_at <= due_by`.
    pub due_by: Option<DateTime<Utc>>,
    /// Require `locked_by == Some(locked_by)`.
    pub locked_by: Option<String>,
    /// Require `locked_at == Some(locked_at)`.
    pub locked_at: Option<DateTime<Utc>>,
}

impl Precondition {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            due_by: None,
            locked_by: None,
            locked_at: None,
        }
    }

    /// Pending and due at `now` (lock acquisition).
    pub fn due_pending(now: DateTime<Utc>) -> Self {
        Self {
            due_by: Some(now),
            ..Self::status(JobStatus::Pending)
        }
    }

    /// Running under the lease taken by `runner_id` at `locked_at`
    /// (outcome recording, reclaim).
    ///
    /// Runner ids are reused across sweeps, so the lock time is part of the
    /// lease: a job reclaimed and relocked under the same id is a new lease.
    pub fn held_by(runner_id: &str, locked_at: DateTime<Utc>) -> Self {
        Self {
            locked_by: Some(runner_id.to_string()),
            locked_at: Some(locked_at),
            ..Self::status(JobStatus::Running)
        }
    }

    /// The lease recorded on `job`, if it is locked.
    pub fn lease_of(job: &Job) -> Option<Self> {
        match (job.locked_by.as_deref(), job.locked_at) {
            (Some(runner_id), Some(locked_at)) => Some(Self::held_by(runner_id, locked_at)),
            _ => None,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.status != self.status {
            return false;
        }
        if let Some(due_by) = self.due_by {
            if job.next_run_at > due_by {
                return false;
            }
        }
        if let Some(expected) = &self.locked_by {
            if job.locked_by.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = self.locked_at {
            if job.locked_at != Some(expected) {
                return false;
            }
        }
        true
    }
}
