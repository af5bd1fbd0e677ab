//! Dual-backend job scheduling.
//!
//! The critical heartbeat runs on the in-process [`PrimaryScheduler`]; every
//! other job is fired by a third-party push scheduler that calls back over
//! HTTP. Both paths end in [`JobRunner::fire`], which owns retries, cycle
//! idempotence and status bookkeeping.

pub mod catalog;
pub mod cycle;
pub mod error;
pub mod events;
pub mod handler;
pub mod handlers;
pub mod primary;
pub mod retry;
pub mod runner;
pub mod secondary;
pub mod status;
pub mod sync;
pub mod types;

pub use catalog::{HEARTBEAT_JOB, JobCatalog, MAX_RETRIES, builtin_definitions};
pub use error::{SchedulerError, SchedulerResult};
pub use events::{EventKind, EventLog, SchedulerEvent};
pub use handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use handlers::{HandlerDeps, HeartbeatReader, builtin_registry};
pub use primary::{PrimaryHandle, PrimaryScheduler};
pub use retry::RetryConfig;
pub use runner::{JobRunner, RunOutcome, RunState};
pub use secondary::{
    HttpPushScheduler, MemoryPushScheduler, PushScheduler, RemoteSchedule, SecondaryConfig,
    callback_cycle, sign_callback, verify_callback,
};
pub use status::{JobStatusRecord, JobStatusStore};
pub use sync::{DeletionReason, SyncPlan, SyncReport, plan, sync_schedules};
pub use types::{Cadence, JobAction, JobBackend, JobDefinition, JobPriority, RunStatus, ScheduledJob};
