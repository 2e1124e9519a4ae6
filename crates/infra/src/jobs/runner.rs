//! Runner loop: claim due jobs, dispatch them, record what happened.
//!
//! ## State machine
//!
//! ```text
//! pending --lock--> running --ok--------------------------> succeeded
//!                      |----retryable, attempts < max----> pending (backoff)
//!                      |----terminal or attempts >= max---> failed
//! pending/running --owner cancel--> canceled
//! ```
//!
//! Outcome recording is itself conditional: the patch requires the job to
//! still be `running` under the exact lease this runner took (runner id and
//! lock time). If an owner canceled the job, or a stale-lock reclaim took it
//! over while the handler ran, the outcome is dropped and reported as
//! superseded. That holds even when the job was relocked under the same
//! runner id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use portal_core::{Clock, SystemClock};

use super::backoff::RetryPolicy;
use super::dispatcher::Dispatcher;
use super::error::JobError;
use super::lock::{acquire, LockOutcome};
use super::store::{JobStore, JobStoreError, PatchOutcome};
use super::types::{Job, JobPatch, Precondition, RunnerId};

/// Upper bound on jobs claimed by one sweep.
pub const MAX_BATCH_SIZE: usize = 50;

pub const DEFAULT_BATCH_SIZE: usize = 25;

pub fn clamp_batch_size(batch_size: usize) -> usize {
    batch_size.clamp(1, MAX_BATCH_SIZE)
}

/// Parameters of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepRequest {
    pub runner_id: RunnerId,
    pub batch_size: usize,
}

impl SweepRequest {
    pub fn new(runner_id: RunnerId) -> Self {
        Self {
            runner_id,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due jobs returned by the store.
    pub fetched: usize,
    pub locked: usize,
    /// Lock refused; another runner got there first or the job changed.
    pub skipped: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub superseded: usize,
    /// Expired locks returned to the queue before the batch ran.
    pub reclaimed: usize,
    /// Per-job store errors; the batch continued past them.
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Retried { .. } => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Superseded => self.superseded += 1,
        }
    }
}

/// What recording an attempt did to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retried { next_run_at: DateTime<Utc> },
    Failed,
    /// The job was no longer held by this runner; nothing was written.
    Superseded,
}

/// Executes due jobs against a store and a dispatcher.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    stale_lock_timeout: Option<Duration>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            stale_lock_timeout: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reclaim running jobs whose lock is older than `timeout` at the start
    /// of every sweep.
    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Claim and run up to `batch_size` due jobs, one after another.
    ///
    /// Only a failure of the due-query aborts the sweep; errors on individual
    /// jobs are logged and counted.
    #[instrument(skip(self, request), fields(runner_id = %request.runner_id), err)]
    pub async fn sweep(&self, request: &SweepRequest) -> Result<SweepReport, JobStoreError> {
        let batch_size = clamp_batch_size(request.batch_size);
        let runner_id = &request.runner_id;
        let mut report = SweepReport::default();

        if let Some(timeout) = self.stale_lock_timeout {
            let (reclaimed, errors) = self.reclaim_stale(timeout, batch_size).await?;
            report.reclaimed = reclaimed;
            report.errors += errors;
        }

        let due = self.store.due(self.clock.now(), batch_size).await?;
        report.fetched = due.len();

        for candidate in due {
            let job = match acquire(&*self.store, candidate.id, runner_id, self.clock.now()).await {
                Ok(LockOutcome::Locked(job)) => job,
                Ok(LockOutcome::Refused(reason)) => {
                    debug!(job_id = %candidate.id, reason = %reason, "skipping job");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(job_id = %candidate.id, error = %err, "failed to lock job");
                    report.errors += 1;
                    continue;
                }
            };
            report.locked += 1;

            match self.run_locked(&job, runner_id).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to record job outcome");
                    report.errors += 1;
                }
            }
        }

        if report.fetched > 0 || report.reclaimed > 0 {
            info!(
                fetched = report.fetched,
                locked = report.locked,
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.failed,
                superseded = report.superseded,
                reclaimed = report.reclaimed,
                errors = report.errors,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Dispatch a job this runner holds and record the result.
    async fn run_locked(&self, job: &Job, runner_id: &RunnerId) -> Result<Outcome, JobStoreError> {
        let result = self
            .dispatcher
            .dispatch(&job.job_type, &job.payload, job.owner_id)
            .await;
        self.record_outcome(job, runner_id, result).await
    }

    /// Write the result of one attempt on a job locked by `runner_id`.
    ///
    /// `job` is the record as it was when the lock was taken.
    #[instrument(skip(self, job, result), fields(job_id = %job.id, job_type = %job.job_type))]
    pub async fn record_outcome(
        &self,
        job: &Job,
        runner_id: &RunnerId,
        result: Result<(), JobError>,
    ) -> Result<Outcome, JobStoreError> {
        let Some(locked_at) = job.locked_at else {
            warn!("job snapshot carries no lock, outcome dropped");
            return Ok(Outcome::Superseded);
        };
        let lease = Precondition::held_by(runner_id.as_str(), locked_at);

        let now = self.clock.now();
        let (patch, outcome) = match result {
            Ok(()) => (JobPatch::succeed(now), Outcome::Succeeded),
            Err(err) => self.failure_patch(job, &err, now),
        };

        let written = self.store.patch_if(job.id, &lease, patch).await?;

        match written {
            PatchOutcome::Applied(updated) => {
                match &outcome {
                    Outcome::Succeeded => info!(attempts = updated.attempts, "job succeeded"),
                    Outcome::Retried { next_run_at } => warn!(
                        attempts = updated.attempts,
                        next_run_at = %next_run_at,
                        error = updated.last_error.as_deref().unwrap_or_default(),
                        "job failed, retry scheduled"
                    ),
                    _ => warn!(
                        attempts = updated.attempts,
                        error = updated.last_error.as_deref().unwrap_or_default(),
                        "job failed permanently"
                    ),
                }
                Ok(outcome)
            }
            PatchOutcome::Rejected(current) => {
                warn!(
                    status = %current.status,
                    locked_by = current.locked_by.as_deref().unwrap_or_default(),
                    "job changed while running, outcome dropped"
                );
                Ok(Outcome::Superseded)
            }
            PatchOutcome::Missing => {
                warn!("job disappeared while running, outcome dropped");
                Ok(Outcome::Superseded)
            }
        }
    }

    fn failure_patch(&self, job: &Job, err: &JobError, now: DateTime<Utc>) -> (JobPatch, Outcome) {
        let attempts = job.attempts.saturating_add(1);
        let message = err.to_string();

        if err.is_terminal() || attempts >= job.max_attempts {
            (JobPatch::fail(attempts, message, now), Outcome::Failed)
        } else {
            let next_run_at = self.policy.next_run_at(attempts, now);
            (
                JobPatch::retry(attempts, message, next_run_at, now),
                Outcome::Retried { next_run_at },
            )
        }
    }

    /// Return running jobs whose lock expired to the queue.
    ///
    /// The lost attempt counts as a retryable failure, so a job that keeps
    /// crashing its runner still reaches its attempt ceiling. Returns the
    /// number of reclaimed jobs and the number of per-job store errors.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(
        &self,
        timeout: Duration,
        limit: usize,
    ) -> Result<(usize, usize), JobStoreError> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self.store.stale_running(cutoff, limit).await?;
        let mut reclaimed = 0;
        let mut errors = 0;

        for job in stale {
            let (Some(holder), Some(lease)) = (job.locked_by.clone(), Precondition::lease_of(&job))
            else {
                continue;
            };
            let err = JobError::retryable(format!("lock expired (held by {holder})"));
            let (patch, _) = self.failure_patch(&job, &err, now);

            match self.store.patch_if(job.id, &lease, patch).await {
                Ok(PatchOutcome::Applied(updated)) => {
                    warn!(
                        job_id = %job.id,
                        runner_id = %holder,
                        status = %updated.status,
                        "reclaimed job with expired lock"
                    );
                    reclaimed += 1;
                }
                Ok(_) => debug!(job_id = %job.id, "stale job changed before reclaim"),
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to reclaim stale job");
                    errors += 1;
                }
            }
        }

        Ok((reclaimed, errors))
    }
}

impl core::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("policy", &self.policy)
            .field("stale_lock_timeout", &self.stale_lock_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::command::JobKind;
    use crate::jobs::dispatcher::testing::ScriptedHandlers;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, NewJob};
    use portal_core::{JobId, ManualClock};
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        handlers: Arc<ScriptedHandlers>,
        clock: Arc<ManualClock>,
        runner: JobRunner,
    }

    impl Harness {
        fn new() -> Self {
            let store = InMemoryJobStore::arc();
            let handlers = ScriptedHandlers::new();
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let runner = JobRunner::new(store.clone(), Dispatcher::new(handlers.clone()))
                .with_clock(clock.clone());
            Self {
                store,
                handlers,
                clock,
                runner,
            }
        }

        async fn insert(&self, request: NewJob) -> JobId {
            self.store
                .insert(Job::new(request, self.clock.now()))
                .await
                .unwrap()
        }

        async fn job(&self, id: JobId) -> Job {
            self.store.get(id).await.unwrap().unwrap()
        }

        async fn sweep(&self) -> SweepReport {
            self.runner
                .sweep(&SweepRequest::new(RunnerId::new("runner-test")))
                .await
                .unwrap()
        }
    }

    fn sync_job() -> NewJob {
        NewJob::new("service.sync", json!({}))
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(clamp_batch_size(0), 1);
        assert_eq!(clamp_batch_size(10), 10);
        assert_eq!(clamp_batch_size(500), MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn successful_job_is_completed_and_unlocked() {
        let h = Harness::new();
        let id = h.insert(sync_job()).await;

        let report = h.sweep().await;
        assert_eq!(report.fetched, 1);
        assert_eq!(report.succeeded, 1);

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.locked_at, None);
        assert_eq!(job.last_error, None);
        assert_eq!(job.last_attempt_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn unknown_type_fails_after_one_sweep() {
        let h = Harness::new();
        let id = h.insert(NewJob::new("service.teleport", json!({}))).await;

        let report = h.sweep().await;
        assert_eq!(report.failed, 1);

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().starts_with("NOT_IMPLEMENTED"));
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_fail_at_ceiling() {
        let h = Harness::new();
        h.handlers
            .always_fail(JobKind::Sync, JobError::retryable("temporary glitch"));
        let id = h.insert(sync_job().max_attempts(2)).await;
        let start = h.clock.now();

        let report = h.sweep().await;
        assert_eq!(report.retried, 1);
        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.next_run_at, start + chrono::Duration::milliseconds(60_000));
        assert_eq!(job.last_error.as_deref(), Some("temporary glitch"));
        assert!(job.lock_fields_consistent());

        // Not due yet.
        let report = h.sweep().await;
        assert_eq!(report.fetched, 0);

        h.clock.advance(chrono::Duration::seconds(60));
        let report = h.sweep().await;
        assert_eq!(report.failed, 1);
        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("temporary glitch"));
    }

    #[tokio::test]
    async fn always_failing_job_fails_exactly_at_max_attempts() {
        let h = Harness::new();
        h.handlers
            .always_fail(JobKind::Sync, JobError::retryable("still down"));
        let id = h.insert(sync_job().max_attempts(4)).await;

        for expected_attempts in 1..=4u32 {
            let job = h.job(id).await;
            assert_eq!(job.status, JobStatus::Pending);
            h.clock.set(job.next_run_at);
            h.sweep().await;
            assert_eq!(h.job(id).await.attempts, expected_attempts);
        }
        assert_eq!(h.job(id).await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_error_fails_regardless_of_ceiling() {
        let h = Harness::new();
        h.handlers
            .push(JobKind::Sync, Err(JobError::validation("bad input")));
        let id = h.insert(sync_job().max_attempts(10)).await;

        h.sweep().await;
        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("VALIDATION_ERROR: bad input"));
    }

    #[tokio::test]
    async fn future_jobs_wait_for_their_run_time() {
        let h = Harness::new();
        let run_at = h.clock.now() + chrono::Duration::minutes(5);
        let id = h.insert(sync_job().run_at(run_at)).await;

        assert_eq!(h.sweep().await.fetched, 0);
        assert_eq!(h.job(id).await.status, JobStatus::Pending);

        h.clock.set(run_at);
        assert_eq!(h.sweep().await.succeeded, 1);
    }

    #[tokio::test]
    async fn sweep_respects_batch_size_and_due_order() {
        let h = Harness::new();
        let now = h.clock.now();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                h.insert(sync_job().run_at(now - chrono::Duration::seconds(10 - i)))
                    .await,
            );
        }

        let report = h
            .runner
            .sweep(&SweepRequest::new(RunnerId::new("r")).with_batch_size(2))
            .await
            .unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(h.job(ids[0]).await.status, JobStatus::Succeeded);
        assert_eq!(h.job(ids[1]).await.status, JobStatus::Succeeded);
        assert_eq!(h.job(ids[2]).await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn outcome_after_cancel_is_superseded() {
        let h = Harness::new();
        let id = h.insert(sync_job()).await;
        let runner = RunnerId::new("runner-a");

        let LockOutcome::Locked(job) = acquire(&h.store, id, &runner, h.clock.now()).await.unwrap()
        else {
            panic!("expected lock");
        };
        h.store
            .patch_if(id, &Precondition::status(JobStatus::Running), JobPatch::cancel(h.clock.now()))
            .await
            .unwrap();

        let outcome = h.runner.record_outcome(&job, &runner, Ok(())).await.unwrap();
        assert_eq!(outcome, Outcome::Superseded);
        assert_eq!(h.job(id).await.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_as_retry() {
        let h = Harness::new();
        let runner = h
            .runner
            .clone()
            .with_stale_lock_timeout(Duration::from_secs(600));
        let id = h.insert(sync_job()).await;

        let crashed = RunnerId::new("runner-crashed");
        assert!(acquire(&h.store, id, &crashed, h.clock.now()).await.unwrap().is_locked());

        h.clock.advance(chrono::Duration::minutes(5));
        let (reclaimed, _) = runner.reclaim_stale(Duration::from_secs(600), 10).await.unwrap();
        assert_eq!(reclaimed, 0);

        h.clock.advance(chrono::Duration::minutes(6));
        let report = runner
            .sweep(&SweepRequest::new(RunnerId::new("runner-b")))
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 1);
        // Reclaimed job backs off, so it is not run in the same sweep.
        assert_eq!(report.fetched, 0);

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.locked_at, None);
        assert_eq!(
            job.last_error.as_deref(),
            Some("lock expired (held by runner-crashed)")
        );

        // The crashed runner's late outcome no longer applies.
        let mut stale = job.clone();
        stale.status = JobStatus::Running;
        let outcome = runner.record_outcome(&stale, &crashed, Ok(())).await.unwrap();
        assert_eq!(outcome, Outcome::Superseded);
    }

    #[tokio::test]
    async fn late_outcome_does_not_touch_relocked_job_with_same_runner_id() {
        let h = Harness::new();
        let id = h.insert(sync_job()).await;
        let shared = RunnerId::new("runner-shared");

        let LockOutcome::Locked(first_lease) =
            acquire(&h.store, id, &shared, h.clock.now()).await.unwrap()
        else {
            panic!("expected lock");
        };

        h.clock.advance(chrono::Duration::minutes(11));
        let (reclaimed, errors) = h
            .runner
            .reclaim_stale(Duration::from_secs(600), 10)
            .await
            .unwrap();
        assert_eq!((reclaimed, errors), (1, 0));

        h.clock.advance(chrono::Duration::minutes(1));
        let relocked_at = h.clock.now();
        let LockOutcome::Locked(second_lease) =
            acquire(&h.store, id, &shared, relocked_at).await.unwrap()
        else {
            panic!("expected relock after backoff");
        };
        assert_eq!(second_lease.attempts, 1);

        let outcome = h
            .runner
            .record_outcome(&first_lease, &shared, Err(JobError::retryable("late failure")))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Superseded);

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.locked_by.as_deref(), Some("runner-shared"));
        assert_eq!(job.locked_at, Some(relocked_at));
        assert_eq!(job.attempts, 1);

        let outcome = h
            .runner
            .record_outcome(&second_lease, &shared, Ok(()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(h.job(id).await.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn owner_is_passed_to_handlers() {
        let h = Harness::new();
        let owner = portal_core::OwnerId::new();
        h.insert(sync_job().owned_by(owner)).await;
        h.insert(sync_job()).await;

        h.sweep().await;
        let owners: Vec<_> = h.handlers.calls().into_iter().map(|(_, o)| o).collect();
        assert_eq!(owners.len(), 2);
        assert!(owners.contains(&Some(owner)));
        assert!(owners.contains(&None));
    }
}
