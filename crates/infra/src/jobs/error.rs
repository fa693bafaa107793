//! Error types of the dispatcher subsystem.

use std::time::Duration;

use relister_core::{BatchId, JobId, TenantId};

use super::registry::RegistryError;
use super::types::JobStatus;

/// Storage-level failure (both the in-memory and the Postgres store).
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// The lifecycle does not allow this move. Should never happen in correct
    /// operation.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The caller no longer holds the claim (recovered as stale, or re-claimed).
    #[error("claim lost for job {0}")]
    ClaimLost(JobId),

    #[error("batch {0} is closed")]
    BatchClosed(BatchId),

    #[error("batch {batch_id} belongs to another tenant than {tenant_id}")]
    TenantMismatch { batch_id: BatchId, tenant_id: TenantId },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Error surfaced to producers and operators by `JobService`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("unknown action {action_code} for marketplace {marketplace}")]
    UnknownAction {
        marketplace: String,
        action_code: String,
    },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error(transparent)]
    Store(JobStoreError),
}

impl From<RegistryError> for JobError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownAction {
                marketplace,
                action_code,
            } => JobError::UnknownAction {
                marketplace,
                action_code,
            },
            other => JobError::Store(JobStoreError::Storage(other.to_string())),
        }
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::JobNotFound(id),
            JobStoreError::BatchNotFound(id) => JobError::BatchNotFound(id),
            other => JobError::Store(other),
        }
    }
}

/// Classified failure of one execution attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// Transient external failure; re-queued with backoff while attempts remain.
    #[error("retryable failure at {step}: {message}")]
    Retryable {
        message: String,
        step: String,
        retry_after: Option<Duration>,
    },

    /// Permanent external failure; the job fails immediately.
    #[error("non-retryable failure at {step}: {message}")]
    NonRetryable { message: String, step: String },

    /// The per-attempt deadline elapsed and the call was abandoned.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::NonRetryable { .. })
    }

    pub fn step(&self) -> &str {
        match self {
            ExecutionError::Retryable { step, .. } | ExecutionError::NonRetryable { step, .. } => {
                step
            }
            ExecutionError::DeadlineExceeded(_) => "execute",
        }
    }
}
