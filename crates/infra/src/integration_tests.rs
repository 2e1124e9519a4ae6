//! Integration tests for the full job pipeline.
//!
//! Tests: JobQueue → JobStore → JobRunner → Dispatcher → ServiceHandlers
//!
//! Verifies:
//! - Jobs created through the queue are executed by a sweep
//! - Retry, terminal failure and cancel paths end in the right state
//! - Concurrent runners never execute one job twice

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use portal_core::{Clock, ManualClock, OwnerId};

    use crate::jobs::command::{ChangePassword, JobKind, ProvisionAccount, SyncAccounts};
    use crate::jobs::dispatcher::testing::ScriptedHandlers;
    use crate::jobs::{
        CancelRefusal, Dispatcher, EnqueueOptions, InMemoryJobStore, JobCommand, JobError,
        JobQueue, JobRunner, JobStatus, JobStore, RunnerId, SweepRequest,
    };

    struct Pipeline {
        store: Arc<InMemoryJobStore>,
        handlers: Arc<ScriptedHandlers>,
        clock: Arc<ManualClock>,
        queue: JobQueue,
        runner: JobRunner,
    }

    fn setup() -> Pipeline {
        let store = InMemoryJobStore::arc();
        let handlers = ScriptedHandlers::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = JobQueue::new(store.clone()).with_clock(clock.clone());
        let runner = JobRunner::new(store.clone(), Dispatcher::new(handlers.clone()))
            .with_clock(clock.clone());
        Pipeline {
            store,
            handlers,
            clock,
            queue,
            runner,
        }
    }

    fn sweep_as(runner_id: &str) -> SweepRequest {
        SweepRequest::new(RunnerId::new(runner_id))
    }

    #[tokio::test]
    async fn typed_command_is_executed_for_its_owner() {
        let p = setup();
        let owner = OwnerId::new();
        let command = JobCommand::Provision(ProvisionAccount {
            username: "ada".into(),
            plan: "family".into(),
            email: None,
            invite_code: Some("WELCOME".into()),
        });

        let id = p
            .queue
            .enqueue_command(&command, EnqueueOptions::owned_by(owner))
            .await
            .unwrap();
        let report = p.runner.sweep(&sweep_as("runner-1")).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(p.handlers.calls(), vec![(JobKind::Provision, Some(owner))]);
        let job = p.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn unknown_type_fails_with_not_implemented() {
        let p = setup();
        let id = p
            .queue
            .enqueue("service.unknown", Some(json!({})), EnqueueOptions::default())
            .await
            .unwrap();

        p.runner.sweep(&sweep_as("runner-1")).await.unwrap();

        let job = p.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().starts_with("NOT_IMPLEMENTED"));
        assert!(p.handlers.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_fails_with_validation_error() {
        let p = setup();
        let id = p
            .queue
            .enqueue(
                "service.change_password",
                Some(json!("not an object")),
                EnqueueOptions::default().max_attempts(5),
            )
            .await
            .unwrap();

        p.runner.sweep(&sweep_as("runner-1")).await.unwrap();

        let job = p.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().starts_with("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_the_ceiling() {
        let p = setup();
        p.handlers
            .always_fail(JobKind::Sync, JobError::retryable("temporary glitch"));
        let id = p
            .queue
            .enqueue_command(
                &JobCommand::Sync(SyncAccounts::default()),
                EnqueueOptions::default().max_attempts(2),
            )
            .await
            .unwrap();
        let start = p.clock.now();

        p.runner.sweep(&sweep_as("runner-1")).await.unwrap();
        let job = p.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_run_at, start + Duration::milliseconds(60_000));

        p.clock.advance(Duration::minutes(1));
        p.runner.sweep(&sweep_as("runner-2")).await.unwrap();
        let job = p.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("temporary glitch"));
    }

    #[tokio::test]
    async fn transient_failure_then_success_clears_last_error() {
        let p = setup();
        p.handlers.push(
            JobKind::ChangePassword,
            Err(JobError::retryable("upstream timeout")),
        );
        let id = p
            .queue
            .enqueue_command(
                &JobCommand::ChangePassword(ChangePassword {
                    account_ref: "acct-9".into(),
                    new_password: "correct horse".into(),
                }),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        p.runner.sweep(&sweep_as("runner-1")).await.unwrap();
        assert_eq!(
            p.queue.get(id).await.unwrap().unwrap().last_error.as_deref(),
            Some("upstream timeout")
        );

        p.clock.advance(Duration::minutes(1));
        p.runner.sweep(&sweep_as("runner-1")).await.unwrap();
        let job = p.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error, None);
    }

    #[tokio::test]
    async fn canceled_jobs_are_never_run() {
        let p = setup();
        let owner = OwnerId::new();
        let id = p
            .queue
            .enqueue("service.sync", None, EnqueueOptions::owned_by(owner))
            .await
            .unwrap();

        assert!(p.queue.cancel(id, owner).await.unwrap().canceled);
        let report = p.runner.sweep(&sweep_as("runner-1")).await.unwrap();

        assert_eq!(report.fetched, 0);
        assert!(p.handlers.calls().is_empty());
        let outcome = p.queue.cancel(id, owner).await.unwrap();
        assert_eq!(outcome.reason, Some(CancelRefusal::AlreadyCanceled));
    }

    #[tokio::test]
    async fn finished_jobs_cannot_be_canceled() {
        let p = setup();
        let owner = OwnerId::new();
        let id = p
            .queue
            .enqueue("service.sync", None, EnqueueOptions::owned_by(owner))
            .await
            .unwrap();
        p.runner.sweep(&sweep_as("runner-1")).await.unwrap();
        let before = p.queue.get(id).await.unwrap().unwrap();

        let outcome = p.queue.cancel(id, owner).await.unwrap();
        assert!(!outcome.canceled);
        assert_eq!(outcome.reason, Some(CancelRefusal::AlreadyFinished));
        assert_eq!(p.queue.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runners_execute_each_job_once() {
        let p = setup();
        for _ in 0..40 {
            p.queue
                .enqueue("service.sync", None, EnqueueOptions::default())
                .await
                .unwrap();
        }

        let sweeps: Vec<_> = (0..4)
            .map(|i| {
                let runner = p.runner.clone();
                tokio::spawn(async move {
                    runner
                        .sweep(&SweepRequest::new(RunnerId::new(format!("runner-{i}"))).with_batch_size(50))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut succeeded = 0;
        for sweep in sweeps {
            let report = sweep.await.unwrap();
            assert_eq!(report.locked + report.skipped, report.fetched);
            succeeded += report.succeeded;
        }

        assert_eq!(succeeded, 40);
        assert_eq!(p.handlers.calls().len(), 40);
        assert_eq!(p.store.stats().await.unwrap().succeeded, 40);
    }

    #[tokio::test]
    async fn owners_only_see_their_jobs() {
        let p = setup();
        let alice = OwnerId::new();
        let bob = OwnerId::new();
        for owner in [alice, alice, bob] {
            p.clock.advance(Duration::seconds(1));
            p.queue
                .enqueue("service.sync", None, EnqueueOptions::owned_by(owner))
                .await
                .unwrap();
        }

        let listed = p.queue.list_by_owner(alice, None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|j| j.owner_id == Some(alice)));
        assert_eq!(p.queue.list_by_owner(bob, Some(10)).await.unwrap().len(), 1);
    }
}
