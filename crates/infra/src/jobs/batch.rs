//! Batch orchestrator: groups jobs under a parent and rolls up progress.

use std::sync::Arc;

use relister_core::{BatchId, TenantId};

use super::error::JobStoreError;
use super::store::DispatchStore;
use super::types::{Batch, BatchPolicy, BatchStatus, ChildOutcome, Job, JobStatus};

/// Result of a batch cancel.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCancellation {
    pub batch: Batch,
    /// Children that were still PENDING and are now CANCELLED
    pub cancelled: Vec<Job>,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Arc<dyn DispatchStore>,
}

impl BatchOrchestrator {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    pub async fn create_batch(&self, tenant_id: TenantId, policy: BatchPolicy) -> Result<Batch, JobStoreError> {
        let batch = self.store.insert_batch(tenant_id, policy).await?;
        tracing::debug!(batch_id = %batch.id, tenant_id = %tenant_id, policy = policy.as_str(), "batch created");
        Ok(batch)
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, JobStoreError> {
        self.store.get_batch(batch_id).await
    }

    /// Count one terminal child. Non-terminal statuses are ignored.
    pub async fn update_progress(
        &self,
        batch_id: BatchId,
        status: JobStatus,
    ) -> Result<Option<Batch>, JobStoreError> {
        let Some(outcome) = ChildOutcome::from_status(status) else {
            return Ok(None);
        };
        let batch = self.store.apply_batch_outcome(batch_id, outcome).await?;
        if batch.pending == 0 && batch.status.is_terminal() {
            tracing::info!(
                batch_id = %batch.id,
                status = batch.status.as_str(),
                succeeded = batch.succeeded,
                failed = batch.failed,
                cancelled = batch.cancelled,
                "batch settled"
            );
        }
        Ok(Some(batch))
    }

    /// Mark the batch CANCELLED and cancel its PENDING children.
    ///
    /// PROCESSING children keep running; their outcomes still reach the
    /// counters but no longer change the batch status.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<BatchCancellation, JobStoreError> {
        let closed = self.store.close_batch(batch_id, BatchStatus::Cancelled).await?;
        if closed.status != BatchStatus::Cancelled {
            return Ok(BatchCancellation {
                batch: closed,
                cancelled: Vec::new(),
            });
        }

        let cancelled = self
            .store
            .cancel_pending_in_batch(batch_id, "batch cancelled")
            .await?;

        let mut batch = closed;
        for _ in &cancelled {
            batch = self.store.apply_batch_outcome(batch_id, ChildOutcome::Cancelled).await?;
        }

        tracing::info!(
            batch_id = %batch_id,
            cancelled = cancelled.len(),
            still_running = batch.pending,
            "batch cancelled"
        );
        Ok(BatchCancellation { batch, cancelled })
    }

    /// Rebuild open batches whose children are all terminal.
    pub async fn reconcile(&self, limit: usize) -> Result<Vec<Batch>, JobStoreError> {
        let mut repaired = Vec::new();
        for batch_id in self.store.stalled_batches(limit).await? {
            let batch = self.store.recompute_batch(batch_id).await?;
            tracing::warn!(batch_id = %batch_id, status = batch.status.as_str(), "batch counters repaired");
            repaired.push(batch);
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::InMemoryJobStore;
    use crate::jobs::store::{BatchStore, JobStore};
    use crate::jobs::types::NewJob;
    use std::time::Duration;

    fn child(tenant_id: TenantId, batch_id: BatchId) -> NewJob {
        NewJob {
            tenant_id,
            marketplace: "vinted".into(),
            action_code: "publish".into(),
            target_id: None,
            batch_id: Some(batch_id),
            priority: 2,
            max_attempts: 1,
            rate_limit: Duration::ZERO,
            timeout: Duration::from_secs(10),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn fail_fast_batch_fails_on_first_failed_child() {
        let store = InMemoryJobStore::arc();
        let orchestrator = BatchOrchestrator::new(store.clone());
        let tenant = TenantId::new();
        let batch = orchestrator.create_batch(tenant, BatchPolicy::FailFast).await.unwrap();
        store.insert(child(tenant, batch.id)).await.unwrap();
        store.insert(child(tenant, batch.id)).await.unwrap();

        let after_one = orchestrator.update_progress(batch.id, JobStatus::Success).await.unwrap().unwrap();
        assert_eq!(after_one.status, BatchStatus::Pending);
        let settled = orchestrator.update_progress(batch.id, JobStatus::Timeout).await.unwrap().unwrap();

        assert_eq!(settled.status, BatchStatus::Failed);
        assert_eq!((settled.succeeded, settled.failed, settled.pending), (1, 1, 0));
        assert!(orchestrator.update_progress(batch.id, JobStatus::Processing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_repairs_drifted_counters() {
        let store = InMemoryJobStore::arc();
        let orchestrator = BatchOrchestrator::new(store.clone());
        let tenant = TenantId::new();
        let batch = orchestrator.create_batch(tenant, BatchPolicy::BestEffort).await.unwrap();
        let job = store.insert(child(tenant, batch.id)).await.unwrap();
        // Cancelled without telling the batch.
        store.cancel_pending(job.id, "lost update").await.unwrap();

        let repaired = orchestrator.reconcile(10).await.unwrap();

        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].cancelled, 1);
        assert_eq!(repaired[0].status, BatchStatus::Failed);
        assert!(store.stalled_batches(10).await.unwrap().is_empty());
    }
}
