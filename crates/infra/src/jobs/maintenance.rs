//! Maintenance scheduler: expiry, stale-claim recovery, pruning, batch repair.
//!
//! Every step is idempotent, so any number of processes may run the sweep
//! concurrently. A failing step is logged and retried on the next period.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::batch::BatchOrchestrator;
use super::finalize::{Completion, JobFinalizer};
use super::store::DispatchStore;
use super::types::JobStatus;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// PROCESSING longer than this means the owning worker is gone. Must
    /// exceed every action timeout.
    pub stale_after: Duration,
    /// Terminal jobs older than this are soft-deleted
    pub retention: Duration,
    /// Batches repaired per sweep
    pub batch_repair_limit: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(3600),
            retention: Duration::from_secs(30 * 24 * 3600),
            batch_repair_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: u64,
    pub requeued_stale: u64,
    pub failed_stale: u64,
    pub pruned: u64,
    pub batches_repaired: u64,
}

pub struct MaintenanceScheduler {
    store: Arc<dyn DispatchStore>,
    finalizer: JobFinalizer,
    batches: BatchOrchestrator,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(store: Arc<dyn DispatchStore>, config: MaintenanceConfig) -> Self {
        Self {
            finalizer: JobFinalizer::new(store.clone()),
            batches: BatchOrchestrator::new(store.clone()),
            store,
            config,
        }
    }

    /// Run every step once.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.store.expire_overdue().await {
            Ok(expired) => {
                for job in &expired {
                    warn!(job_id = %job.id, tenant_id = %job.tenant_id, "job deadline passed, timed out");
                    self.finalizer.job_finished(job, Completion::Swept).await;
                }
                report.expired = expired.len() as u64;
            }
            Err(err) => error!(error = %err, "expire sweep failed"),
        }

        match self.store.recover_stale(self.config.stale_after).await {
            Ok(recovered) => {
                for job in &recovered {
                    if job.status == JobStatus::Pending {
                        warn!(job_id = %job.id, attempts = job.attempts, "stale claim released, job re-queued");
                        report.requeued_stale += 1;
                    } else {
                        warn!(job_id = %job.id, attempts = job.attempts, "stale claim with no attempts left, job failed");
                        self.finalizer.job_finished(job, Completion::Swept).await;
                        report.failed_stale += 1;
                    }
                }
            }
            Err(err) => error!(error = %err, "stale recovery failed"),
        }

        match self.store.prune_terminal(self.config.retention).await {
            Ok(pruned) => report.pruned = pruned,
            Err(err) => error!(error = %err, "prune failed"),
        }

        match self.batches.reconcile(self.config.batch_repair_limit).await {
            Ok(repaired) => report.batches_repaired = repaired.len() as u64,
            Err(err) => error!(error = %err, "batch repair failed"),
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                requeued_stale = report.requeued_stale,
                failed_stale = report.failed_stale,
                pruned = report.pruned,
                batches_repaired = report.batches_repaired,
                "maintenance sweep"
            );
        }
        report
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.config.interval.as_secs(), "maintenance scheduler started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            info!("maintenance scheduler stopped");
        })
    }
}
