//! In-memory dispatch store for tests and local development.
//!
//! One mutex guards all rows, which makes every operation (including a whole
//! claim pass) atomic. Time comes from an injectable `Clock`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use relister_core::{BatchId, Clock, JobId, SystemClock, TenantId};

use super::claim::{plan_claims, Candidate, ClaimRequest, InFlight};
use super::error::JobStoreError;
use super::notify::WakeSignal;
use super::store::{check_requeue, check_terminal_write, BatchStore, JobStore, StatsStore, RECOVERY_STEP};
use super::types::{
    Batch, BatchPolicy, BatchStatus, CancelOutcome, ChildOutcome, ClaimToken, CompletionSample,
    DailyStats, Job, JobCounts, JobStatus, NewJob, TerminalOutcome, Transition,
};

type StatsKey = (String, String, TenantId, NaiveDate);

#[derive(Debug, Default)]
struct State {
    last_job_id: i64,
    last_batch_id: i64,
    jobs: BTreeMap<JobId, Job>,
    batches: HashMap<BatchId, Batch>,
    stats: HashMap<StatsKey, DailyStats>,
}

impl State {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(&job_id)
            .filter(|j| j.deleted_at.is_none())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn batch_mut(&mut self, batch_id: BatchId) -> Result<&mut Batch, JobStoreError> {
        self.batches
            .get_mut(&batch_id)
            .ok_or(JobStoreError::BatchNotFound(batch_id))
    }

    fn children(&self, batch_id: BatchId) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(move |j| j.batch_id == Some(batch_id))
    }
}

/// In-memory implementation of `JobStore`, `BatchStore` and `StatsStore`.
pub struct InMemoryJobStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    wake: Option<WakeSignal>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            wake: None,
        }
    }

    /// Wake this signal whenever a job becomes claimable or capacity frees.
    pub fn with_wake(mut self, wake: WakeSignal) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn wake(&self) {
        if let Some(wake) = &self.wake {
            wake.notify();
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &self.lock().jobs.len())
            .finish_non_exhaustive()
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn finish(job: &mut Job, outcome: TerminalOutcome, now: DateTime<Utc>) {
    job.status = outcome.status();
    let (result, error, step) = outcome.into_columns();
    job.result = result;
    job.error_message = error;
    if step.is_some() {
        job.failed_step = step;
    }
    job.completed_at = Some(now);
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let now = self.now();
        let job = {
            let mut state = self.lock();

            if let Some(batch_id) = new.batch_id {
                let batch = state.batch_mut(batch_id)?;
                if batch.tenant_id != new.tenant_id {
                    return Err(JobStoreError::TenantMismatch {
                        batch_id,
                        tenant_id: new.tenant_id,
                    });
                }
                if batch.status.is_terminal() {
                    return Err(JobStoreError::BatchClosed(batch_id));
                }
                batch.total += 1;
                batch.pending += 1;
            }

            state.last_job_id += 1;
            let job = Job {
                id: JobId::new(state.last_job_id),
                tenant_id: new.tenant_id,
                marketplace: new.marketplace,
                action_code: new.action_code,
                target_id: new.target_id,
                batch_id: new.batch_id,
                status: JobStatus::Pending,
                priority: new.priority,
                attempts: 0,
                max_attempts: new.max_attempts,
                rate_limit: new.rate_limit,
                timeout: new.timeout,
                created_at: now,
                started_at: None,
                completed_at: None,
                expires_at: new.expires_at,
                not_before: now,
                claimed_by: None,
                claim_token: None,
                result: None,
                error_message: None,
                failed_step: None,
                deleted_at: None,
            };
            state.jobs.insert(job.id, job.clone());
            job
        };
        self.wake();
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .lock()
            .jobs
            .get(&job_id)
            .filter(|j| j.deleted_at.is_none())
            .cloned())
    }

    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock();
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.status == status && j.deleted_at.is_none())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.priority, j.created_at, j.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn counts(&self, tenant_id: TenantId) -> Result<JobCounts, JobStoreError> {
        let state = self.lock();
        let mut counts = JobCounts::default();
        for job in state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.deleted_at.is_none())
        {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Job>, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();

        let mut in_flight = InFlight::default();
        let mut last_started: HashMap<(TenantId, &str, &str), DateTime<Utc>> = HashMap::new();
        for job in state.jobs.values() {
            if job.status == JobStatus::Processing {
                in_flight.global += 1;
                *in_flight.per_tenant.entry(job.tenant_id).or_insert(0) += 1;
            }
            if let Some(started) = job.started_at {
                let key = (job.tenant_id, job.marketplace.as_str(), job.action_code.as_str());
                let latest = last_started.entry(key).or_insert(started);
                if started > *latest {
                    *latest = started;
                }
            }
        }

        let mut eligible: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.deleted_at.is_none()
                    && j.not_before <= now
                    && j.expires_at.is_none_or(|at| at > now)
                    && request
                        .marketplace
                        .as_deref()
                        .is_none_or(|m| m == j.marketplace)
            })
            .collect();
        eligible.sort_by_key(|j| (j.priority, j.created_at, j.id));

        let candidates: Vec<Candidate> = eligible
            .into_iter()
            .map(|j| Candidate {
                job_id: j.id,
                tenant_id: j.tenant_id,
                marketplace: j.marketplace.clone(),
                action_code: j.action_code.clone(),
                rate_limit: j.rate_limit,
                last_started_at: last_started
                    .get(&(j.tenant_id, j.marketplace.as_str(), j.action_code.as_str()))
                    .copied(),
            })
            .collect();
        drop(last_started);

        let planned = plan_claims(&candidates, &in_flight, request.limits, request.slots, now);

        let mut claimed = Vec::with_capacity(planned.len());
        for job_id in planned {
            let job = state.job_mut(job_id)?;
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.started_at = Some(now);
            job.completed_at = None;
            job.claimed_by = Some(request.worker_id.clone());
            job.claim_token = Some(ClaimToken::new().0);
            let job = job.clone();

            if let Some(batch_id) = job.batch_id {
                if let Ok(batch) = state.batch_mut(batch_id) {
                    if batch.status == BatchStatus::Pending {
                        batch.status = BatchStatus::Running;
                    }
                }
            }
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn mark_terminal(
        &self,
        job_id: JobId,
        claim: Option<ClaimToken>,
        outcome: TerminalOutcome,
    ) -> Result<Transition, JobStoreError> {
        let now = self.now();
        let transition = {
            let mut state = self.lock();
            let job = state.job_mut(job_id)?;
            if let Some(unchanged) = check_terminal_write(job, claim, outcome.status())? {
                return Ok(unchanged);
            }
            finish(job, outcome, now);
            Transition::Applied(job.clone())
        };
        self.wake();
        Ok(transition)
    }

    async fn requeue(
        &self,
        job_id: JobId,
        claim: ClaimToken,
        delay: Duration,
        error: &str,
        failed_step: Option<&str>,
    ) -> Result<Job, JobStoreError> {
        let now = self.now();
        let job = {
            let mut state = self.lock();
            let job = state.job_mut(job_id)?;
            check_requeue(job, claim)?;
            job.status = JobStatus::Pending;
            job.not_before = after(now, delay);
            job.error_message = Some(error.to_string());
            job.failed_step = failed_step.map(str::to_string);
            job.claimed_by = None;
            job.claim_token = None;
            job.clone()
        };
        self.wake();
        Ok(job)
    }

    async fn cancel_pending(&self, job_id: JobId, reason: &str) -> Result<CancelOutcome, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        let outcome = match job.status {
            JobStatus::Pending => {
                finish(
                    job,
                    TerminalOutcome::Cancelled {
                        reason: reason.to_string(),
                    },
                    now,
                );
                CancelOutcome::Cancelled(job.clone())
            }
            JobStatus::Processing => CancelOutcome::InFlight(job.clone()),
            _ => CancelOutcome::AlreadyFinished(job.clone()),
        };
        Ok(outcome)
    }

    async fn cancel_pending_in_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
    ) -> Result<Vec<Job>, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();
        let mut cancelled = Vec::new();
        for job in state
            .jobs
            .values_mut()
            .filter(|j| j.batch_id == Some(batch_id) && j.status == JobStatus::Pending)
        {
            finish(
                job,
                TerminalOutcome::Cancelled {
                    reason: reason.to_string(),
                },
                now,
            );
            cancelled.push(job.clone());
        }
        Ok(cancelled)
    }

    async fn expire_overdue(&self) -> Result<Vec<Job>, JobStoreError> {
        let now = self.now();
        let expired = {
            let mut state = self.lock();
            let mut expired = Vec::new();
            for job in state.jobs.values_mut().filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Processing)
                    && j.expires_at.is_some_and(|at| at <= now)
            }) {
                job.claim_token = None;
                finish(
                    job,
                    TerminalOutcome::Timeout {
                        error: "job deadline exceeded".to_string(),
                        failed_step: None,
                    },
                    now,
                );
                expired.push(job.clone());
            }
            expired
        };
        if !expired.is_empty() {
            self.wake();
        }
        Ok(expired)
    }

    async fn recover_stale(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError> {
        let now = self.now();
        let cutoff = before(now, stale_after);
        let recovered = {
            let mut state = self.lock();
            let mut recovered = Vec::new();
            for job in state.jobs.values_mut().filter(|j| {
                j.status == JobStatus::Processing && j.started_at.is_some_and(|at| at <= cutoff)
            }) {
                job.claim_token = None;
                job.claimed_by = None;
                if job.attempts_remaining() {
                    job.status = JobStatus::Pending;
                    job.not_before = now;
                    job.error_message = Some("claim went stale; re-queued".to_string());
                    job.failed_step = Some(RECOVERY_STEP.to_string());
                } else {
                    finish(
                        job,
                        TerminalOutcome::failed(
                            "claim went stale with no attempts left",
                            Some(RECOVERY_STEP.to_string()),
                        ),
                        now,
                    );
                }
                recovered.push(job.clone());
            }
            recovered
        };
        if !recovered.is_empty() {
            self.wake();
        }
        Ok(recovered)
    }

    async fn prune_terminal(&self, retention: Duration) -> Result<u64, JobStoreError> {
        let now = self.now();
        let cutoff = before(now, retention);
        let mut state = self.lock();
        let mut pruned = 0;
        for job in state.jobs.values_mut().filter(|j| {
            j.status.is_terminal()
                && j.deleted_at.is_none()
                && j.completed_at.is_some_and(|at| at <= cutoff)
        }) {
            job.deleted_at = Some(now);
            pruned += 1;
        }
        Ok(pruned)
    }
}

#[async_trait]
impl BatchStore for InMemoryJobStore {
    async fn insert_batch(&self, tenant_id: TenantId, policy: BatchPolicy) -> Result<Batch, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();
        state.last_batch_id += 1;
        let batch = Batch {
            id: BatchId::new(state.last_batch_id),
            tenant_id,
            status: BatchStatus::Pending,
            policy,
            total: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            pending: 0,
            created_at: now,
            completed_at: None,
        };
        state.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, JobStoreError> {
        Ok(self.lock().batches.get(&batch_id).cloned())
    }

    async fn apply_batch_outcome(
        &self,
        batch_id: BatchId,
        outcome: ChildOutcome,
    ) -> Result<Batch, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();
        let batch = state.batch_mut(batch_id)?;
        batch.apply(outcome, now);
        Ok(batch.clone())
    }

    async fn close_batch(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();
        let batch = state.batch_mut(batch_id)?;
        if !batch.status.is_terminal() {
            batch.status = status;
            batch.completed_at = Some(now);
        }
        Ok(batch.clone())
    }

    async fn recompute_batch(&self, batch_id: BatchId) -> Result<Batch, JobStoreError> {
        let now = self.now();
        let mut state = self.lock();

        let mut counts = JobCounts::default();
        for child in state.children(batch_id) {
            counts.add(child.status, 1);
        }

        let batch = state.batch_mut(batch_id)?;
        batch.recount(&counts, now);
        Ok(batch.clone())
    }

    async fn stalled_batches(&self, limit: usize) -> Result<Vec<BatchId>, JobStoreError> {
        let state = self.lock();
        let mut stalled: Vec<BatchId> = state
            .batches
            .values()
            .filter(|b| !b.status.is_terminal() && b.total > 0)
            .filter(|b| state.children(b.id).all(|j| j.status.is_terminal()))
            .map(|b| b.id)
            .collect();
        stalled.sort();
        stalled.truncate(limit);
        Ok(stalled)
    }
}

#[async_trait]
impl StatsStore for InMemoryJobStore {
    async fn record_completion(&self, sample: &CompletionSample) -> Result<(), JobStoreError> {
        let mut state = self.lock();
        let key = (
            sample.marketplace.clone(),
            sample.action_code.clone(),
            sample.tenant_id,
            sample.day,
        );
        state
            .stats
            .entry(key)
            .or_insert_with(|| DailyStats {
                marketplace: sample.marketplace.clone(),
                action_code: sample.action_code.clone(),
                tenant_id: sample.tenant_id,
                day: sample.day,
                total: 0,
                succeeded: 0,
                failed: 0,
                avg_duration_ms: 0.0,
            })
            .record(sample.success, sample.duration);
        Ok(())
    }

    async fn daily_stats(&self, tenant_id: TenantId, day: NaiveDate) -> Result<Vec<DailyStats>, JobStoreError> {
        let state = self.lock();
        let mut stats: Vec<_> = state
            .stats
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.day == day)
            .cloned()
            .collect();
        stats.sort_by(|a, b| (&a.marketplace, &a.action_code).cmp(&(&b.marketplace, &b.action_code)));
        Ok(stats)
    }
}
