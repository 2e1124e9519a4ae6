//! Durable background jobs for the account portal.
//!
//! ## Design
//!
//! - Jobs are persisted records; every state change after insert is a
//!   conditional patch, so concurrent runners coordinate through the store
//! - Failures are either retryable (exponential backoff) or terminal
//! - Outcomes are only recorded while the recording runner still holds the lock
//! - Timers run the sweep periodically and enqueue a daily reconciliation
//!
//! ## Components
//!
//! - `Job`, `JobPatch`, `Precondition`: record and transition types
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `acquire`: the lock protocol
//! - `Dispatcher` / `ServiceHandlers`: type-to-handler routing
//! - `JobRunner`: sweep and outcome recording
//! - `JobQueue`: enqueue, list and cancel on behalf of callers
//! - `spawn_schedule`: interval and reconciliation timers

pub mod backoff;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod postgres;
pub mod queue;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod types;

pub use backoff::{compute_backoff, RetryPolicy};
pub use command::{JobCommand, JobKind};
pub use dispatcher::{Dispatcher, ServiceHandlers, UnconfiguredHandlers};
pub use error::{is_terminal_error, JobError, TerminalKind};
pub use lock::{acquire, LockOutcome, LockRefusal};
pub use postgres::PostgresJobStore;
pub use queue::{CancelOutcome, CancelRefusal, EnqueueOptions, JobQueue, QueueError};
pub use runner::{JobRunner, Outcome, SweepReport, SweepRequest, MAX_BATCH_SIZE};
pub use schedule::{spawn_schedule, ScheduleConfig, ScheduleHandle, ScheduleStats};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, PatchOutcome};
pub use types::{Job, JobPatch, JobStatus, NewJob, Precondition, RunnerId};
