//! Storage seams of the dispatcher.
//!
//! Job rows are the only shared mutable state between workers. Every status
//! change happens inside one store call, so callers never coordinate locks
//! themselves.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use relister_core::{BatchId, JobId, TenantId};

use super::claim::ClaimRequest;
use super::error::JobStoreError;
use super::types::{
    Batch, BatchPolicy, BatchStatus, CancelOutcome, ChildOutcome, ClaimToken, CompletionSample,
    DailyStats, Job, JobCounts, JobStatus, NewJob, TerminalOutcome, Transition,
};

/// Failure step recorded when maintenance gives up on a stale claim.
pub const RECOVERY_STEP: &str = "recovery";

/// Durable job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job. When `batch_id` is set the batch counters are
    /// bumped in the same operation; closed batches and batches of another
    /// tenant are rejected.
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by ID. Soft-deleted jobs are not returned.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// List a tenant's jobs in one status, in claim order.
    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn counts(&self, tenant_id: TenantId) -> Result<JobCounts, JobStoreError>;

    /// Atomically move up to `request.slots` eligible jobs to PROCESSING.
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job to a terminal state.
    ///
    /// Repeating the current terminal status is a no-op (`Transition::Unchanged`);
    /// any other move out of a terminal state is `IllegalTransition`. Leaving
    /// PROCESSING requires the current claim token.
    async fn mark_terminal(
        &self,
        job_id: JobId,
        claim: Option<ClaimToken>,
        outcome: TerminalOutcome,
    ) -> Result<Transition, JobStoreError>;

    /// Return a claimed job to PENDING, claimable again after `delay`.
    async fn requeue(
        &self,
        job_id: JobId,
        claim: ClaimToken,
        delay: Duration,
        error: &str,
        failed_step: Option<&str>,
    ) -> Result<Job, JobStoreError>;

    /// Cancel a job if it is still PENDING.
    async fn cancel_pending(&self, job_id: JobId, reason: &str) -> Result<CancelOutcome, JobStoreError>;

    /// Cancel every PENDING child of a batch; returns the cancelled jobs.
    async fn cancel_pending_in_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Move PENDING/PROCESSING jobs past `expires_at` to TIMEOUT.
    async fn expire_overdue(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Release PROCESSING jobs started more than `stale_after` ago: back to
    /// PENDING when attempts remain, FAILED otherwise.
    async fn recover_stale(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError>;

    /// Soft-delete terminal jobs completed more than `retention` ago.
    async fn prune_terminal(&self, retention: Duration) -> Result<u64, JobStoreError>;
}

/// Batch rows and their progress counters.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn insert_batch(&self, tenant_id: TenantId, policy: BatchPolicy) -> Result<Batch, JobStoreError>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, JobStoreError>;

    /// Fold one terminal child outcome into the counters and settle the batch
    /// once nothing is pending.
    async fn apply_batch_outcome(
        &self,
        batch_id: BatchId,
        outcome: ChildOutcome,
    ) -> Result<Batch, JobStoreError>;

    /// Force a terminal batch status (no-op if already terminal).
    async fn close_batch(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch, JobStoreError>;

    /// Rebuild counters from the children and settle if drained.
    async fn recompute_batch(&self, batch_id: BatchId) -> Result<Batch, JobStoreError>;

    /// Open batches with no active child left.
    async fn stalled_batches(&self, limit: usize) -> Result<Vec<BatchId>, JobStoreError>;
}

/// Per-day execution statistics.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn record_completion(&self, sample: &CompletionSample) -> Result<(), JobStoreError>;

    async fn daily_stats(&self, tenant_id: TenantId, day: NaiveDate) -> Result<Vec<DailyStats>, JobStoreError>;
}

/// Everything the dispatcher needs from storage.
pub trait DispatchStore: JobStore + BatchStore + StatsStore {}

impl<T> DispatchStore for T where T: JobStore + BatchStore + StatsStore {}

/// Decide what a terminal write does to a job in its current state.
///
/// Shared by both stores so the lifecycle rules live in one place.
pub(crate) fn check_terminal_write(
    job: &Job,
    claim: Option<ClaimToken>,
    target: JobStatus,
) -> Result<Option<Transition>, JobStoreError> {
    if job.status.is_terminal() {
        if job.status == target {
            return Ok(Some(Transition::Unchanged(job.clone())));
        }
        if claim.is_some_and(|c| job.claim_token != Some(c.0)) {
            return Err(JobStoreError::ClaimLost(job.id));
        }
        return Err(JobStoreError::IllegalTransition {
            job_id: job.id,
            from: job.status,
            to: target,
        });
    }

    if job.status == JobStatus::Processing && claim.is_none_or(|c| job.claim_token != Some(c.0)) {
        return Err(JobStoreError::ClaimLost(job.id));
    }
    if job.status == JobStatus::Pending && claim.is_some() {
        return Err(JobStoreError::ClaimLost(job.id));
    }
    if !job.status.can_transition_to(target) {
        return Err(JobStoreError::IllegalTransition {
            job_id: job.id,
            from: job.status,
            to: target,
        });
    }
    Ok(None)
}

/// Same as `check_terminal_write` for a move back to PENDING.
pub(crate) fn check_requeue(job: &Job, claim: ClaimToken) -> Result<(), JobStoreError> {
    if job.claim_token != Some(claim.0) {
        return Err(JobStoreError::ClaimLost(job.id));
    }
    if job.status != JobStatus::Processing {
        return Err(JobStoreError::IllegalTransition {
            job_id: job.id,
            from: job.status,
            to: JobStatus::Pending,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn job(status: JobStatus, token: Option<Uuid>) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(7),
            tenant_id: TenantId::new(),
            marketplace: "ebay".into(),
            action_code: "publish".into(),
            target_id: None,
            batch_id: None,
            status,
            priority: 1,
            attempts: 1,
            max_attempts: 3,
            rate_limit: Duration::ZERO,
            timeout: Duration::from_secs(30),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            expires_at: None,
            not_before: now,
            claimed_by: None,
            claim_token: token,
            result: None,
            error_message: None,
            failed_step: None,
            deleted_at: None,
        }
    }

    #[test]
    fn repeated_terminal_status_is_unchanged() {
        let token = ClaimToken::new();
        let done = job(JobStatus::Success, Some(token.0));

        let outcome = check_terminal_write(&done, Some(token), JobStatus::Success).unwrap();
        assert!(matches!(outcome, Some(Transition::Unchanged(_))));
    }

    #[test]
    fn different_terminal_status_is_illegal() {
        let token = ClaimToken::new();
        let done = job(JobStatus::Success, Some(token.0));

        let err = check_terminal_write(&done, Some(token), JobStatus::Failed).unwrap_err();
        assert!(matches!(err, JobStoreError::IllegalTransition { .. }));
    }

    #[test]
    fn processing_requires_current_token() {
        let running = job(JobStatus::Processing, Some(Uuid::now_v7()));

        assert!(matches!(
            check_terminal_write(&running, Some(ClaimToken::new()), JobStatus::Success),
            Err(JobStoreError::ClaimLost(_))
        ));
        assert!(matches!(
            check_terminal_write(&running, None, JobStatus::Success),
            Err(JobStoreError::ClaimLost(_))
        ));
    }

    #[test]
    fn pending_cannot_succeed() {
        let pending = job(JobStatus::Pending, None);

        assert!(check_terminal_write(&pending, None, JobStatus::Cancelled).unwrap().is_none());
        assert!(matches!(
            check_terminal_write(&pending, None, JobStatus::Success),
            Err(JobStoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn requeue_after_recovery_reports_lost_claim() {
        let token = ClaimToken::new();
        let recovered = job(JobStatus::Pending, None);

        assert!(matches!(check_requeue(&recovered, token), Err(JobStoreError::ClaimLost(_))));
        assert!(check_requeue(&job(JobStatus::Processing, Some(token.0)), token).is_ok());
    }
}
