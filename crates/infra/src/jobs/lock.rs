//! Lock acquisition: the only way a job moves from `pending` to `running`.

use chrono::{DateTime, Utc};
use tracing::debug;

use portal_core::JobId;

use super::store::{JobStore, JobStoreError, PatchOutcome};
use super::types::{Job, JobPatch, JobStatus, Precondition, RunnerId};

/// Why a lock attempt was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRefusal {
    Missing,
    NotPending,
    NotDue,
}

impl LockRefusal {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockRefusal::Missing => "missing",
            LockRefusal::NotPending => "not_pending",
            LockRefusal::NotDue => "not_due",
        }
    }

    /// Refusal reason for a record that failed the lock precondition.
    fn for_record(job: &Job, now: DateTime<Utc>) -> Option<Self> {
        if job.status != JobStatus::Pending {
            Some(LockRefusal::NotPending)
        } else if job.next_run_at > now {
            Some(LockRefusal::NotDue)
        } else {
            None
        }
    }
}

impl core::fmt::Display for LockRefusal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// The caller now holds the job; the record is in `running` state.
    Locked(Job),
    Refused(LockRefusal),
}

impl LockOutcome {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockOutcome::Locked(_))
    }
}

/// Try to claim `job_id` for `runner_id`.
///
/// The write is a conditional patch on `status = pending AND next_run_at <= now`,
/// so of several concurrent callers at most one gets `Locked`.
pub async fn acquire<S>(
    store: &S,
    job_id: JobId,
    runner_id: &RunnerId,
    now: DateTime<Utc>,
) -> Result<LockOutcome, JobStoreError>
where
    S: JobStore + ?Sized,
{
    let Some(current) = store.get(job_id).await? else {
        return Ok(LockOutcome::Refused(LockRefusal::Missing));
    };
    if let Some(refusal) = LockRefusal::for_record(&current, now) {
        debug!(job_id = %job_id, reason = %refusal, "lock refused");
        return Ok(LockOutcome::Refused(refusal));
    }

    let outcome = store
        .patch_if(
            job_id,
            &Precondition::due_pending(now),
            JobPatch::lock(runner_id, now),
        )
        .await?;

    match outcome {
        PatchOutcome::Applied(job) => {
            debug!(job_id = %job_id, runner_id = %runner_id, "lock acquired");
            Ok(LockOutcome::Locked(job))
        }
        PatchOutcome::Rejected(job) => {
            // Lost a race between the read and the write.
            let refusal = LockRefusal::for_record(&job, now).unwrap_or(LockRefusal::NotPending);
            debug!(job_id = %job_id, reason = %refusal, "lock lost to concurrent writer");
            Ok(LockOutcome::Refused(refusal))
        }
        PatchOutcome::Missing => Ok(LockOutcome::Refused(LockRefusal::Missing)),
    }
}
