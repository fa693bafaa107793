//! Job executor with timeout, error classification, retry and backoff.
//!
//! The marketplace call itself is delegated to an `ActionExecutor`. It is
//! run under the job's per-attempt timeout; on expiry the call is dropped
//! (abandoned, not rolled back), so actions must tolerate at-least-once
//! delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use relister_core::{Clock, JobId, TenantId};

use super::error::{ExecutionError, JobStoreError};
use super::finalize::{Completion, JobFinalizer};
use super::store::DispatchStore;
use super::types::{BackoffPolicy, ClaimToken, Job, JobStatus, TerminalOutcome, Transition};

/// Step name recorded when no finer-grained step is known.
pub const EXECUTE_STEP: &str = "execute";

/// Input of one action call, executed under the tenant's data context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub marketplace: String,
    pub action_code: String,
    pub target_id: Option<i64>,
    pub attempt: u32,
    /// The executor stops waiting at this instant.
    pub deadline: DateTime<Utc>,
}

impl ActionRequest {
    pub fn for_job(job: &Job, now: DateTime<Utc>) -> Self {
        let timeout = chrono::Duration::from_std(job.timeout).unwrap_or(chrono::Duration::zero());
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id,
            marketplace: job.marketplace.clone(),
            action_code: job.action_code.clone(),
            target_id: job.target_id,
            attempt: job.attempts,
            deadline: now.checked_add_signed(timeout).unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSuccess {
    pub result: JsonValue,
}

/// Failure category reported by the marketplace client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// Connection or transport failure
    Network,
    /// 429-equivalent
    RateLimited,
    /// 5xx-equivalent
    Upstream,
    /// Payload rejected as invalid
    Validation,
    /// Other 4xx-equivalent
    Rejected,
    Unauthorized,
}

impl ActionErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActionErrorKind::Network | ActionErrorKind::RateLimited | ActionErrorKind::Upstream
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
    /// Internal stage that failed, for diagnostics
    pub step: Option<String>,
    /// Server-provided hint before retrying
    pub retry_after: Option<Duration>,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step: None,
            retry_after: None,
        }
    }

    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl From<ActionError> for ExecutionError {
    fn from(err: ActionError) -> Self {
        let step = err.step.unwrap_or_else(|| EXECUTE_STEP.to_string());
        if err.kind.is_retryable() {
            ExecutionError::Retryable {
                message: err.message,
                step,
                retry_after: err.retry_after,
            }
        } else {
            ExecutionError::NonRetryable {
                message: err.message,
                step,
            }
        }
    }
}

/// The marketplace-client collaborator.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute_action(&self, request: ActionRequest) -> Result<ActionSuccess, ActionError>;
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded,
    Requeued { delay: Duration },
    Failed,
    TimedOut,
    /// Another writer took the job over (stale recovery, expiry).
    ClaimLost,
    /// The outcome could not be written; stale recovery will pick the job up.
    StoreFailed,
}

/// Runs claimed jobs and writes their outcome back.
///
/// Never returns an error: every failure ends as a job state transition or,
/// if the store itself fails, as a log line.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn DispatchStore>,
    actions: Arc<dyn ActionExecutor>,
    finalizer: JobFinalizer,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        actions: Arc<dyn ActionExecutor>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let finalizer = JobFinalizer::new(store.clone());
        Self {
            store,
            actions,
            finalizer,
            backoff,
            clock,
        }
    }

    pub async fn execute(&self, job: Job) -> ExecutionOutcome {
        let Some(claim) = job.claim() else {
            warn!(job_id = %job.id, status = %job.status, "refusing to execute unclaimed job");
            return ExecutionOutcome::ClaimLost;
        };

        let request = ActionRequest::for_job(&job, self.clock.now());
        let attempt = tokio::time::timeout(job.timeout, self.actions.execute_action(request)).await;
        let result = match attempt {
            Ok(Ok(success)) => Ok(success.result),
            Ok(Err(err)) => Err(ExecutionError::from(err)),
            Err(_) => Err(ExecutionError::DeadlineExceeded(job.timeout)),
        };

        match result {
            Ok(value) => {
                debug!(job_id = %job.id, attempt = job.attempts, "action succeeded");
                self.finish(&job, claim, TerminalOutcome::Success { result: value }).await
            }
            Err(err) if err.is_retryable() && job.attempts_remaining() => {
                self.retry(&job, claim, err).await
            }
            Err(ExecutionError::DeadlineExceeded(limit)) => {
                warn!(job_id = %job.id, attempt = job.attempts, timeout = ?limit, "deadline exceeded on last attempt");
                let outcome = TerminalOutcome::Timeout {
                    error: ExecutionError::DeadlineExceeded(limit).to_string(),
                    failed_step: Some(EXECUTE_STEP.to_string()),
                };
                self.finish(&job, claim, outcome).await
            }
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "job failed"
                );
                let outcome = TerminalOutcome::failed(err.to_string(), Some(err.step().to_string()));
                self.finish(&job, claim, outcome).await
            }
        }
    }

    async fn retry(&self, job: &Job, claim: ClaimToken, err: ExecutionError) -> ExecutionOutcome {
        let hint = match &err {
            ExecutionError::Retryable { retry_after, .. } => retry_after.unwrap_or_default(),
            _ => Duration::ZERO,
        };
        let delay = self.backoff.delay_for_attempt(job.attempts).max(hint);

        warn!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying job"
        );

        match self
            .store
            .requeue(job.id, claim, delay, &err.to_string(), Some(err.step()))
            .await
        {
            Ok(_) => ExecutionOutcome::Requeued { delay },
            Err(JobStoreError::ClaimLost(_)) => {
                warn!(job_id = %job.id, "claim lost before re-queue");
                ExecutionOutcome::ClaimLost
            }
            Err(store_err) => {
                error!(job_id = %job.id, error = %store_err, "failed to re-queue job");
                ExecutionOutcome::StoreFailed
            }
        }
    }

    async fn finish(&self, job: &Job, claim: ClaimToken, outcome: TerminalOutcome) -> ExecutionOutcome {
        let status = outcome.status();
        match self.store.mark_terminal(job.id, Some(claim), outcome).await {
            Ok(Transition::Applied(done)) => {
                self.finalizer.job_finished(&done, Completion::Executed).await;
                ExecutionOutcome::from_status(done.status)
            }
            Ok(Transition::Unchanged(done)) => ExecutionOutcome::from_status(done.status),
            Err(JobStoreError::ClaimLost(_)) => {
                warn!(job_id = %job.id, "claim lost before completion");
                ExecutionOutcome::ClaimLost
            }
            Err(err @ JobStoreError::IllegalTransition { .. }) => {
                // The row already holds a different terminal status and keeps it.
                error!(job_id = %job.id, target = %status, error = %err, "illegal transition, reporting job as failed");
                ExecutionOutcome::Failed
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to record job outcome");
                ExecutionOutcome::StoreFailed
            }
        }
    }
}

impl ExecutionOutcome {
    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Success => ExecutionOutcome::Succeeded,
            JobStatus::Timeout => ExecutionOutcome::TimedOut,
            _ => ExecutionOutcome::Failed,
        }
    }
}
