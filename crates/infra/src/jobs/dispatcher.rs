//! Per-process dispatcher loop.
//!
//! The loop sleeps until a wake signal, a finished task, or the poll interval,
//! then claims up to its free local capacity and runs each claimed job as its
//! own task. Local capacity is a semaphore owned by the dispatcher; global and
//! per-tenant ceilings are enforced by the store at claim time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::claim::{ClaimEngine, ClaimLimits};
use super::executor::{ExecutionOutcome, JobExecutor};
use super::notify::WakeSignal;
use super::store::DispatchStore;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Claim owner label
    pub worker_id: String,
    /// Maximum concurrent jobs in this process
    pub max_concurrent: usize,
    /// Fallback wake-up when notifications are missed
    pub poll_interval: Duration,
    pub limits: ClaimLimits,
    /// Only claim jobs of this marketplace
    pub marketplace: Option<String>,
    /// Grace period used if the handle is dropped without `shutdown`
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: "dispatcher".to_string(),
            max_concurrent: 8,
            poll_interval: Duration::from_secs(1),
            limits: ClaimLimits::default(),
            marketplace: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_limits(mut self, limits: ClaimLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_marketplace(mut self, marketplace: impl Into<String>) -> Self {
        self.marketplace = Some(marketplace.into());
        self
    }
}

/// Counters of one dispatcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherReport {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub requeued: u64,
    pub claim_lost: u64,
    pub store_failed: u64,
    pub panicked: u64,
    /// Tasks still running when the grace period ended
    pub abandoned: u64,
}

impl DispatcherReport {
    fn record(&mut self, finished: Result<ExecutionOutcome, JoinError>) {
        let outcome = match finished {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => {
                self.abandoned += 1;
                return;
            }
            Err(err) => {
                error!(error = %err, "job task panicked");
                self.panicked += 1;
                return;
            }
        };

        self.processed += 1;
        match outcome {
            ExecutionOutcome::Succeeded => self.succeeded += 1,
            ExecutionOutcome::Failed => self.failed += 1,
            ExecutionOutcome::TimedOut => self.timed_out += 1,
            ExecutionOutcome::Requeued { .. } => self.requeued += 1,
            ExecutionOutcome::ClaimLost => self.claim_lost += 1,
            ExecutionOutcome::StoreFailed => self.store_failed += 1,
        }
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<Option<Duration>>,
    join: JoinHandle<DispatcherReport>,
}

impl DispatcherHandle {
    /// Stop claiming, wait up to `grace` for in-flight jobs, then abandon the
    /// rest. Abandoned jobs stay PROCESSING until stale recovery releases them.
    pub async fn shutdown(self, grace: Duration) -> DispatcherReport {
        let _ = self.shutdown.send(Some(grace));
        match self.join.await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "dispatcher task failed");
                DispatcherReport::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    claims: ClaimEngine,
    executor: JobExecutor,
    wake: WakeSignal,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn DispatchStore>,
        executor: JobExecutor,
        wake: WakeSignal,
    ) -> Self {
        let claims = ClaimEngine::new(store, config.worker_id.clone(), config.limits)
            .with_marketplace(config.marketplace.clone());
        Self {
            config,
            claims,
            executor,
            wake,
        }
    }

    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown, shutdown_rx) = watch::channel(None);
        let join = tokio::spawn(self.run(shutdown_rx));
        DispatcherHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<Option<Duration>>) -> DispatcherReport {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks: JoinSet<ExecutionOutcome> = JoinSet::new();
        let mut report = DispatcherReport::default();

        info!(
            worker = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent,
            marketplace = ?self.config.marketplace,
            "dispatcher started"
        );

        let grace = loop {
            while let Some(finished) = tasks.try_join_next() {
                report.record(finished);
            }
            if let Some(grace) = *shutdown.borrow() {
                break grace;
            }

            let free = semaphore.available_permits();
            if free > 0 {
                match self.claims.claim(free).await {
                    Ok(jobs) => {
                        for job in jobs {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(err) => {
                                    // Claim passes never exceed free capacity.
                                    error!(job_id = %job.id, error = %err, "no local capacity for claimed job");
                                    continue;
                                }
                            };
                            let executor = self.executor.clone();
                            tasks.spawn(async move {
                                let _permit = permit;
                                executor.execute(job).await
                            });
                        }
                    }
                    Err(err) => {
                        error!(worker = %self.config.worker_id, error = %err, "claim pass failed");
                    }
                }
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break self.config.shutdown_grace;
                    }
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    report.record(finished);
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        info!(
            worker = %self.config.worker_id,
            in_flight = tasks.len(),
            grace_ms = grace.as_millis() as u64,
            "dispatcher draining"
        );

        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = tasks.join_next().await {
                report.record(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker = %self.config.worker_id,
                remaining = tasks.len(),
                "grace period elapsed, abandoning in-flight jobs"
            );
            tasks.abort_all();
            while let Some(finished) = tasks.join_next().await {
                report.record(finished);
            }
        }

        info!(
            worker = %self.config.worker_id,
            processed = report.processed,
            abandoned = report.abandoned,
            "dispatcher stopped"
        );
        report
    }
}
