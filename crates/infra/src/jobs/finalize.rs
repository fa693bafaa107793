//! Post-processing of terminal transitions.

use std::sync::Arc;

use super::batch::BatchOrchestrator;
use super::store::DispatchStore;
use super::types::{CompletionSample, Job, JobStatus};

/// How a job reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// An executor observed the outcome of an attempt.
    Executed,
    /// Cancel, expiry or stale recovery; no attempt outcome to measure.
    Swept,
}

/// Records statistics and batch progress for jobs that just became terminal.
///
/// Failures are logged, never returned: the job row is already final and the
/// batch rollup can be rebuilt by maintenance.
#[derive(Clone)]
pub struct JobFinalizer {
    store: Arc<dyn DispatchStore>,
    batches: BatchOrchestrator,
}

impl JobFinalizer {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        let batches = BatchOrchestrator::new(store.clone());
        Self { store, batches }
    }

    pub async fn job_finished(&self, job: &Job, completion: Completion) {
        if !job.status.is_terminal() {
            return;
        }

        if completion == Completion::Executed {
            if let (Some(completed_at), Some(duration)) = (job.completed_at, job.attempt_duration()) {
                let sample = CompletionSample {
                    marketplace: job.marketplace.clone(),
                    action_code: job.action_code.clone(),
                    tenant_id: job.tenant_id,
                    day: completed_at.date_naive(),
                    success: job.status == JobStatus::Success,
                    duration,
                };
                if let Err(err) = self.store.record_completion(&sample).await {
                    tracing::error!(job_id = %job.id, error = %err, "failed to record daily stats");
                }
            }
        }

        if let Some(batch_id) = job.batch_id {
            if let Err(err) = self.batches.update_progress(batch_id, job.status).await {
                tracing::error!(job_id = %job.id, batch_id = %batch_id, error = %err, "failed to update batch progress");
            }
        }
    }
}
