//! Producer, query and operator surface of the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use relister_core::{BatchId, Clock, JobId, SystemClock, TenantId};

use super::batch::{BatchCancellation, BatchOrchestrator};
use super::error::JobError;
use super::finalize::{Completion, JobFinalizer};
use super::registry::ActionRegistry;
use super::store::DispatchStore;
use super::types::{Batch, BatchPolicy, CancelOutcome, DailyStats, Job, JobCounts, JobStatus, NewJob};

const LIST_LIMIT: usize = 1000;

/// Entry point for producers (enqueue), status queries and operators.
#[derive(Clone)]
pub struct JobService {
    registry: Arc<ActionRegistry>,
    store: Arc<dyn DispatchStore>,
    batches: BatchOrchestrator,
    finalizer: JobFinalizer,
    clock: Arc<dyn Clock>,
    job_ttl: Option<Duration>,
}

impl JobService {
    pub fn new(registry: Arc<ActionRegistry>, store: Arc<dyn DispatchStore>) -> Self {
        Self {
            batches: BatchOrchestrator::new(store.clone()),
            finalizer: JobFinalizer::new(store.clone()),
            registry,
            store,
            clock: Arc::new(SystemClock),
            job_ttl: None,
        }
    }

    /// Give every new job a hard deadline `ttl` after enqueue.
    pub fn with_job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = Some(ttl);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Queue a marketplace action for a tenant.
    ///
    /// The action policy is resolved now and copied onto the job.
    pub async fn enqueue(
        &self,
        tenant_id: TenantId,
        marketplace: &str,
        action_code: &str,
        target_id: Option<i64>,
        batch_id: Option<BatchId>,
    ) -> Result<Job, JobError> {
        let policy = self.registry.resolve(marketplace, action_code)?;
        let expires_at = self
            .job_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl));

        let job = self
            .store
            .insert(NewJob {
                tenant_id,
                marketplace: policy.marketplace.clone(),
                action_code: policy.action_code.clone(),
                target_id,
                batch_id,
                priority: policy.priority,
                max_attempts: policy.max_attempts(),
                rate_limit: policy.rate_limit,
                timeout: policy.timeout,
                expires_at,
            })
            .await?;

        tracing::debug!(
            job_id = %job.id,
            tenant_id = %tenant_id,
            marketplace = %job.marketplace,
            action_code = %job.action_code,
            batch_id = ?batch_id,
            "job enqueued"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, JobError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(JobError::JobNotFound(job_id))
    }

    pub async fn list_pending(&self, tenant_id: TenantId) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .list_by_status(tenant_id, JobStatus::Pending, LIST_LIMIT)
            .await?)
    }

    pub async fn counts(&self, tenant_id: TenantId) -> Result<JobCounts, JobError> {
        Ok(self.store.counts(tenant_id).await?)
    }

    pub async fn daily_stats(&self, tenant_id: TenantId, day: NaiveDate) -> Result<Vec<DailyStats>, JobError> {
        Ok(self.store.daily_stats(tenant_id, day).await?)
    }

    /// Cancel a PENDING job. PROCESSING jobs are never preempted; they are
    /// reported as in flight and left to finish or time out.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<CancelOutcome, JobError> {
        let outcome = self.store.cancel_pending(job_id, "cancelled by operator").await?;
        match &outcome {
            CancelOutcome::Cancelled(job) => {
                tracing::info!(job_id = %job_id, tenant_id = %job.tenant_id, "job cancelled");
                self.finalizer.job_finished(job, Completion::Swept).await;
            }
            CancelOutcome::InFlight(_) => {
                tracing::info!(job_id = %job_id, "cancel refused, job in flight");
            }
            CancelOutcome::AlreadyFinished(_) => {}
        }
        Ok(outcome)
    }

    pub async fn create_batch(&self, tenant_id: TenantId, policy: BatchPolicy) -> Result<Batch, JobError> {
        Ok(self.batches.create_batch(tenant_id, policy).await?)
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> Result<Batch, JobError> {
        self.batches
            .get_batch(batch_id)
            .await?
            .ok_or(JobError::BatchNotFound(batch_id))
    }

    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<BatchCancellation, JobError> {
        Ok(self.batches.cancel_batch(batch_id).await?)
    }
}
