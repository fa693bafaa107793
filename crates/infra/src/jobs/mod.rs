//! Multi-tenant marketplace job dispatcher.
//!
//! ## Design
//!
//! - The job table is the queue: producers insert PENDING rows, workers claim
//!   them with row locks and flip them to PROCESSING
//! - Claiming honours priority, per-action rate limits and global/per-tenant
//!   concurrency ceilings
//! - Retryable failures go back to PENDING with exponential backoff; the last
//!   attempt lands in FAILED or TIMEOUT
//! - Terminal transitions are guarded by a claim token and are idempotent
//! - Batches roll up the outcomes of their children
//! - Maintenance expires overdue jobs, recovers stale claims and prunes history
//!
//! ## Components
//!
//! - `ActionRegistry`: action policies keyed by (marketplace, action_code)
//! - `JobService`: enqueue, query and cancel
//! - `JobStore` / `BatchStore` / `StatsStore`: persistence (in-memory or Postgres)
//! - `ClaimEngine`: one claim pass under the concurrency rules
//! - `JobExecutor`: runs one claimed attempt and records the outcome
//! - `Dispatcher`: bounded worker pool driving claim and execute
//! - `MaintenanceScheduler`: periodic sweeps

pub mod batch;
pub mod claim;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod finalize;
pub mod maintenance;
pub mod memory;
pub mod notify;
pub mod postgres;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use batch::{BatchCancellation, BatchOrchestrator};
pub use claim::{plan_claims, Candidate, ClaimEngine, ClaimLimits, ClaimRequest, InFlight};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherReport};
pub use error::{ExecutionError, JobError, JobStoreError};
pub use executor::{
    ActionError, ActionErrorKind, ActionExecutor, ActionRequest, ActionSuccess, ExecutionOutcome,
    JobExecutor, EXECUTE_STEP,
};
pub use finalize::{Completion, JobFinalizer};
pub use maintenance::{MaintenanceConfig, MaintenanceScheduler, SweepReport};
pub use memory::InMemoryJobStore;
pub use notify::{PgJobListener, WakeSignal, JOBS_CHANNEL};
pub use postgres::{PostgresActionSource, PostgresJobStore};
pub use registry::{ActionKey, ActionPolicy, ActionRegistry, ActionSource, RegistryError, StaticActionSource};
pub use service::JobService;
pub use store::{BatchStore, DispatchStore, JobStore, StatsStore, RECOVERY_STEP};
pub use types::{
    BackoffPolicy, Batch, BatchPolicy, BatchStatus, CancelOutcome, ChildOutcome, ClaimToken,
    CompletionSample, DailyStats, Job, JobCounts, JobStatus, NewJob, TerminalOutcome, Transition,
};
