//! Periodic triggers: the sweep interval and the daily reconciliation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::command::{JobCommand, SyncAccounts};
use super::queue::{EnqueueOptions, JobQueue, QueueError};
use super::runner::{JobRunner, SweepReport, SweepRequest};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timer configuration.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub sweep: SweepRequest,
    pub sweep_interval: Duration,
    pub reconcile_interval: Duration,
}

impl ScheduleConfig {
    pub fn new(sweep: SweepRequest) -> Self {
        Self {
            sweep,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// Counters kept by a running schedule.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScheduleStats {
    pub sweeps: u64,
    pub sweep_errors: u64,
    pub reconciliations: u64,
    pub last_sweep: Option<SweepReport>,
    pub uptime_secs: u64,
}

/// Handle to the background timer tasks.
#[derive(Debug)]
pub struct ScheduleHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ScheduleStats>>,
    started: Instant,
}

impl ScheduleHandle {
    /// Stop both timers, wait for an in-flight sweep to finish and return
    /// the final counters.
    pub async fn shutdown(mut self) -> ScheduleStats {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "schedule task ended abnormally");
            }
        }
        let stats = self.stats();
        info!(
            sweeps = stats.sweeps,
            sweep_errors = stats.sweep_errors,
            reconciliations = stats.reconciliations,
            uptime_secs = stats.uptime_secs,
            "job schedule stopped"
        );
        stats
    }

    pub fn stats(&self) -> ScheduleStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock_stats(stats: &Mutex<ScheduleStats>) -> std::sync::MutexGuard<'_, ScheduleStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Spawn the sweep and reconciliation timers on the current tokio runtime.
///
/// The first sweep runs immediately; the first reconciliation runs one full
/// interval after start.
pub fn spawn_schedule(runner: JobRunner, queue: JobQueue, config: ScheduleConfig) -> ScheduleHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(Mutex::new(ScheduleStats::default()));

    info!(
        runner_id = %config.sweep.runner_id,
        batch_size = config.sweep.batch_size,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        "job schedule started"
    );

    let sweep_task = tokio::spawn(sweep_loop(
        runner,
        config.sweep,
        config.sweep_interval,
        shutdown_rx.clone(),
        stats.clone(),
    ));
    let reconcile_task = tokio::spawn(reconcile_loop(
        queue,
        config.reconcile_interval,
        shutdown_rx,
        stats.clone(),
    ));

    ScheduleHandle {
        shutdown: shutdown_tx,
        tasks: vec![sweep_task, reconcile_task],
        stats,
        started: Instant::now(),
    }
}

async fn sweep_loop(
    runner: JobRunner,
    request: SweepRequest,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ScheduleStats>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let result = runner.sweep(&request).await;
        {
            let mut current = lock_stats(&stats);
            current.sweeps += 1;
            match result {
                Ok(report) => current.last_sweep = Some(report),
                Err(err) => {
                    current.sweep_errors += 1;
                    error!(error = %err, "job sweep failed");
                }
            }
        }
    }
}

async fn reconcile_loop(
    queue: JobQueue,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ScheduleStats>>,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match enqueue_reconciliation(&queue).await {
            Ok(()) => lock_stats(&stats).reconciliations += 1,
            Err(err) => error!(error = %err, "failed to enqueue reconciliation"),
        }
    }
}

/// Enqueue one system-owned `service.sync` job covering every account.
pub async fn enqueue_reconciliation(queue: &JobQueue) -> Result<(), QueueError> {
    let id = queue
        .enqueue_command(
            &JobCommand::Sync(SyncAccounts::default()),
            EnqueueOptions::default(),
        )
        .await?;
    info!(job_id = %id, "reconciliation enqueued");
    Ok(())
}
