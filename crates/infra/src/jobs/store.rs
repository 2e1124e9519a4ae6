//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use portal_core::{JobId, OwnerId};

use super::types::{Job, JobPatch, JobStatus, Precondition};

/// Result of a conditional patch.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    /// The precondition held; the updated record is returned.
    Applied(Job),
    /// The record exists but no longer matches; its current state is returned.
    Rejected(Job),
    /// No record with that id.
    Missing,
}

/// Job store abstraction.
///
/// Only the runner and the queue API mutate records, and every mutation after
/// insert goes through [`JobStore::patch_if`]. Implementations must apply the
/// precondition check and the write atomically with respect to other patches
/// of the same record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Point read.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Pending jobs with `next_run_at <= now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs owned by `owner_id`, most recently created first.
    async fn by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Running jobs whose lock was taken before `locked_before`, oldest first.
    async fn stale_running(
        &self,
        locked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Apply `patch` only if the record still matches `expected`.
    async fn patch_if(
        &self,
        job_id: JobId,
        expected: &Precondition,
        patch: JobPatch,
    ) -> Result<PatchOutcome, JobStoreError>;

    /// Record counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Canceled => self.canceled += count,
        }
    }
}

/// In-memory job store for tests/dev.
///
/// A single `RwLock` around the map serializes all patches, which is what
/// makes `patch_if` a compare-and-swap.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();

        result.sort_by_key(|j| (j.next_run_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner_id == Some(owner_id))
            .cloned()
            .collect();

        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn stale_running(
        &self,
        locked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.locked_at.is_some_and(|at| at < locked_before)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.locked_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn patch_if(
        &self,
        job_id: JobId,
        expected: &Precondition,
        patch: JobPatch,
    ) -> Result<PatchOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(PatchOutcome::Missing);
        };

        if !expected.matches(job) {
            return Ok(PatchOutcome::Rejected(job.clone()));
        }

        job.apply(&patch);
        Ok(PatchOutcome::Applied(job.clone()))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).due(now, limit).await
    }

    async fn by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).by_owner(owner_id, limit).await
    }

    async fn stale_running(
        &self,
        locked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).stale_running(locked_before, limit).await
    }

    async fn patch_if(
        &self,
        job_id: JobId,
        expected: &Precondition,
        patch: JobPatch,
    ) -> Result<PatchOutcome, JobStoreError> {
        (**self).patch_if(job_id, expected, patch).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
