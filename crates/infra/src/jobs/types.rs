//! Core job types, the lifecycle state machine, and backoff policy.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use relister_core::{BatchId, JobId, TenantId};

/// Job lifecycle status.
///
/// ```text
/// PENDING ──claim──▶ PROCESSING ──success──▶ SUCCESS
///    │  ▲                │  ├──exhausted / permanent──▶ FAILED
///    │  └───re-queue─────┘  └──deadline──▶ TIMEOUT
///    ├──deadline──▶ TIMEOUT
///    └──cancel────▶ CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Timeout)
                | (Pending, Cancelled)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Timeout)
                | (Processing, Pending)
                | (Processing, Cancelled)
        )
    }

    /// Statuses from which `target` is reachable in one step.
    pub fn sources_of(target: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Bounded exponential backoff between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) to spread retries of jobs failing together
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Same delay for every attempt, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

/// A queued marketplace operation.
///
/// Priority, attempt budget, rate limit, and timeout are copied from the
/// action policy at enqueue time; later policy edits never reach jobs already
/// in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub marketplace: String,
    pub action_code: String,
    /// Entity the action operates on (e.g. a product)
    pub target_id: Option<i64>,
    pub batch_id: Option<BatchId>,
    pub status: JobStatus,
    /// Lower is served first
    pub priority: i32,
    /// Claims so far (incremented when the job enters PROCESSING)
    pub attempts: u32,
    pub max_attempts: u32,
    pub rate_limit: Duration,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Hard deadline, independent of the per-attempt timeout
    pub expires_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed (backoff)
    pub not_before: DateTime<Utc>,
    pub claimed_by: Option<String>,
    /// Fresh token per claim; completion writes must present it
    pub claim_token: Option<Uuid>,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub failed_step: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Current claim, if the job is PROCESSING.
    pub fn claim(&self) -> Option<ClaimToken> {
        match (self.status, self.claim_token) {
            (JobStatus::Processing, Some(token)) => Some(ClaimToken(token)),
            _ => None,
        }
    }

    /// Duration of the current (or last) attempt, if it started.
    pub fn attempt_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        Some((finished - started).to_std().unwrap_or_default())
    }
}

/// Proof of claim ownership handed out with each PROCESSING transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A job row ready to be inserted (policy already resolved and copied).
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub marketplace: String,
    pub action_code: String,
    pub target_id: Option<i64>,
    pub batch_id: Option<BatchId>,
    pub priority: i32,
    pub max_attempts: u32,
    pub rate_limit: Duration,
    pub timeout: Duration,
    pub expires_at: Option<DateTime<Utc>>,
}

/// How a job leaves the non-terminal part of its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Success { result: JsonValue },
    Failed {
        error: String,
        failed_step: Option<String>,
    },
    Timeout {
        error: String,
        failed_step: Option<String>,
    },
    Cancelled { reason: String },
}

impl TerminalOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            TerminalOutcome::Success { .. } => JobStatus::Success,
            TerminalOutcome::Failed { .. } => JobStatus::Failed,
            TerminalOutcome::Timeout { .. } => JobStatus::Timeout,
            TerminalOutcome::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    pub fn failed(error: impl Into<String>, failed_step: Option<String>) -> Self {
        Self::Failed {
            error: error.into(),
            failed_step,
        }
    }

    pub(crate) fn into_columns(self) -> (Option<JsonValue>, Option<String>, Option<String>) {
        match self {
            TerminalOutcome::Success { result } => (Some(result), None, None),
            TerminalOutcome::Failed { error, failed_step } => (None, Some(error), failed_step),
            TerminalOutcome::Timeout { error, failed_step } => (None, Some(error), failed_step),
            TerminalOutcome::Cancelled { reason } => (None, Some(reason), None),
        }
    }
}

/// Result of an idempotent terminal write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job moved to the requested state.
    Applied(Job),
    /// The job was already in the requested terminal state; nothing changed.
    Unchanged(Job),
}

impl Transition {
    pub fn job(&self) -> &Job {
        match self {
            Transition::Applied(job) | Transition::Unchanged(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Result of a single-job cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(Job),
    /// The job is PROCESSING; in-flight external calls are never preempted.
    InFlight(Job),
    /// The job already reached a terminal state.
    AlreadyFinished(Job),
}

/// Per-status job counts for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Success => self.success += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Timeout => self.timeout += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 5] = [
        BatchStatus::Pending,
        BatchStatus::Running,
        BatchStatus::Completed,
        BatchStatus::Failed,
        BatchStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown batch status: {s}"))
    }
}

/// What a failed child means for its batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Any failed child fails the batch.
    #[default]
    FailFast,
    /// Partial success still completes the batch.
    BestEffort,
}

impl BatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPolicy::FailFast => "fail_fast",
            BatchPolicy::BestEffort => "best_effort",
        }
    }

    /// Final status once no child is pending.
    pub fn settle(&self, succeeded: u32, failed: u32, cancelled: u32) -> BatchStatus {
        let unsuccessful = failed + cancelled;
        match self {
            BatchPolicy::FailFast if unsuccessful > 0 => BatchStatus::Failed,
            BatchPolicy::BestEffort if succeeded == 0 && unsuccessful > 0 => BatchStatus::Failed,
            _ => BatchStatus::Completed,
        }
    }
}

impl FromStr for BatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" => Ok(BatchPolicy::FailFast),
            "best_effort" => Ok(BatchPolicy::BestEffort),
            other => Err(format!("unknown batch policy: {other}")),
        }
    }
}

/// Parent grouping of jobs with incrementally maintained counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub status: BatchStatus,
    pub policy: BatchPolicy,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub cancelled: u32,
    /// Children not yet terminal
    pub pending: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Fold one terminal child outcome into the counters.
    ///
    /// Returns `true` when the batch settled as a result.
    pub fn apply(&mut self, outcome: ChildOutcome, now: DateTime<Utc>) -> bool {
        // A drained batch was already rebuilt from its children.
        if self.pending == 0 {
            return false;
        }
        self.pending -= 1;
        match outcome {
            ChildOutcome::Succeeded => self.succeeded += 1,
            ChildOutcome::Failed => self.failed += 1,
            ChildOutcome::Cancelled => self.cancelled += 1,
        }
        self.settle_if_drained(now)
    }

    /// Replace the counters with a fresh count of the children.
    pub(crate) fn recount(&mut self, children: &JobCounts, now: DateTime<Utc>) -> bool {
        self.succeeded = children.success as u32;
        self.failed = (children.failed + children.timeout) as u32;
        self.cancelled = children.cancelled as u32;
        self.pending = (children.pending + children.processing) as u32;
        self.total = self.succeeded + self.failed + self.cancelled + self.pending;
        self.settle_if_drained(now)
    }

    pub(crate) fn settle_if_drained(&mut self, now: DateTime<Utc>) -> bool {
        if self.pending > 0 || self.status.is_terminal() {
            return false;
        }
        self.status = self.policy.settle(self.succeeded, self.failed, self.cancelled);
        self.completed_at = Some(now);
        true
    }
}

/// Terminal child outcome as seen by its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Succeeded,
    /// FAILED or TIMEOUT
    Failed,
    Cancelled,
}

impl ChildOutcome {
    pub fn from_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Success => Some(ChildOutcome::Succeeded),
            JobStatus::Failed | JobStatus::Timeout => Some(ChildOutcome::Failed),
            JobStatus::Cancelled => Some(ChildOutcome::Cancelled),
            JobStatus::Pending | JobStatus::Processing => None,
        }
    }
}

/// Per-day execution statistics for one (marketplace, action, tenant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub marketplace: String,
    pub action_code: String,
    pub tenant_id: TenantId,
    pub day: NaiveDate,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
}

impl DailyStats {
    pub fn record(&mut self, success: bool, duration: Duration) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let sample = duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms += (sample - self.avg_duration_ms) / self.total as f64;
    }
}

/// One completed execution, as fed into the daily stats.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSample {
    pub marketplace: String,
    pub action_code: String,
    pub tenant_id: TenantId,
    pub day: NaiveDate,
    pub success: bool,
    pub duration: Duration,
}
