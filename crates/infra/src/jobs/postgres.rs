//! Postgres-backed dispatch store.
//!
//! The job table is both the durable queue and the lock manager:
//!
//! - A claim pass runs in one transaction. It waits for an advisory
//!   transaction lock so concurrent passes queue behind each other instead of
//!   over-counting PROCESSING rows, selects claimable candidates with
//!   `FOR UPDATE OF j SKIP LOCKED`, and flips the planned rows to PROCESSING
//!   before committing. Rows locked by other writers (cancels, terminal
//!   writes) are skipped individually. All locks vanish with the transaction.
//! - Writes that leave PROCESSING lock the row, check the claim token, and
//!   update it in the same transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Conflict` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use relister_core::{BatchId, JobId, TenantId};

use super::claim::{plan_claims, Candidate, ClaimRequest, InFlight};
use super::error::JobStoreError;
use super::registry::{ActionPolicy, ActionSource, RegistryError};
use super::store::{check_requeue, check_terminal_write, BatchStore, JobStore, StatsStore, RECOVERY_STEP};
use super::types::{
    Batch, BatchPolicy, BatchStatus, CancelOutcome, ChildOutcome, ClaimToken, CompletionSample,
    DailyStats, Job, JobCounts, JobStatus, NewJob, TerminalOutcome, Transition,
};

const SCHEMA: &str = include_str!("../../migrations/0001_marketplace_jobs.sql");

/// Advisory lock serializing claim passes across processes. Held only for
/// the duration of a pass; PROCESSING counts read under it stay exact.
pub const CLAIM_LOCK_KEY: i64 = 0x6d6b_7470_6c63_6c6d;

const MAX_CANDIDATES: i64 = 500;

/// Eligible PENDING rows for one pass, in claim order.
///
/// Rate-limited (tenant, marketplace, action) keys are dropped here, a
/// rate-limited key contributes only its first job, and no tenant
/// contributes more rows than its remaining ceiling. Every returned row is
/// therefore claimable, so a backlog of one tenant cannot fill the window.
const CANDIDATES_SQL: &str = r#"
WITH running AS (
    SELECT tenant_id, COUNT(*) AS n
    FROM marketplace_jobs
    WHERE status = 'processing'
    GROUP BY tenant_id
),
eligible AS (
    SELECT j.id, j.tenant_id, j.marketplace, j.action_code, j.rate_limit_ms,
           j.priority, j.created_at, ls.last_started_at
    FROM marketplace_jobs j
    LEFT JOIN LATERAL (
        SELECT MAX(p.started_at) AS last_started_at
        FROM marketplace_jobs p
        WHERE p.tenant_id = j.tenant_id
          AND p.marketplace = j.marketplace
          AND p.action_code = j.action_code
    ) ls ON TRUE
    WHERE j.status = 'pending'
      AND j.deleted_at IS NULL
      AND j.not_before <= NOW()
      AND (j.expires_at IS NULL OR j.expires_at > NOW())
      AND ($1::text IS NULL OR j.marketplace = $1)
      AND (j.rate_limit_ms = 0
           OR ls.last_started_at IS NULL
           OR ls.last_started_at <= NOW() - j.rate_limit_ms * INTERVAL '1 millisecond')
),
keyed AS (
    SELECT e.*,
           ROW_NUMBER() OVER (
               PARTITION BY e.tenant_id, e.marketplace, e.action_code
               ORDER BY e.priority, e.created_at, e.id
           ) AS key_rank
    FROM eligible e
),
ranked AS (
    SELECT k.id, k.tenant_id, k.last_started_at,
           ROW_NUMBER() OVER (
               PARTITION BY k.tenant_id
               ORDER BY k.priority, k.created_at, k.id
           ) AS tenant_rank
    FROM keyed k
    WHERE k.rate_limit_ms = 0 OR k.key_rank = 1
)
SELECT j.id, j.tenant_id, j.marketplace, j.action_code, j.rate_limit_ms, r.last_started_at
FROM marketplace_jobs j
JOIN ranked r ON r.id = j.id
LEFT JOIN running rn ON rn.tenant_id = r.tenant_id
WHERE j.status = 'pending'
  AND j.deleted_at IS NULL
  AND r.tenant_rank <= $2::bigint - COALESCE(rn.n, 0)
ORDER BY j.priority ASC, j.created_at ASC, j.id ASC
LIMIT $3
FOR UPDATE OF j SKIP LOCKED
"#;

const JOB_COLUMNS: &str = "id, tenant_id, marketplace, action_code, target_id, batch_id, status, \
     priority, attempts, max_attempts, rate_limit_ms, timeout_ms, created_at, started_at, \
     completed_at, expires_at, not_before, claimed_by, claim_token, result, error_message, \
     failed_step, deleted_at";

const BATCH_COLUMNS: &str = "id, tenant_id, status, policy, total, succeeded, failed, cancelled, \
     pending, created_at, completed_at";

/// Postgres implementation of `JobStore`, `BatchStore` and `StatsStore`.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the notification trigger if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn lock_job(
        tx: &mut Transaction<'static, Postgres>,
        job_id: JobId,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM marketplace_jobs WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        job_from_row(&row)
    }

    async fn lock_batch(
        tx: &mut Transaction<'static, Postgres>,
        batch_id: BatchId,
    ) -> Result<Batch, JobStoreError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM job_batches WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(batch_id.get())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_batch", e))?
            .ok_or(JobStoreError::BatchNotFound(batch_id))?;
        batch_from_row(&row)
    }

    async fn write_batch(
        tx: &mut Transaction<'static, Postgres>,
        batch: &Batch,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE job_batches
            SET status = $2,
                total = $3,
                succeeded = $4,
                failed = $5,
                cancelled = $6,
                pending = $7,
                completed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(batch.id.get())
        .bind(batch.status.as_str())
        .bind(batch.total as i32)
        .bind(batch.succeeded as i32)
        .bind(batch.failed as i32)
        .bind(batch.cancelled as i32)
        .bind(batch.pending as i32)
        .bind(batch.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_batch", e))?;
        Ok(())
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), JobStoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

async fn db_now(tx: &mut Transaction<'static, Postgres>) -> Result<DateTime<Utc>, JobStoreError> {
    sqlx::query_scalar("SELECT NOW()")
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("now", e))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, action_code = %job.action_code), err)]
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;

        if let Some(batch_id) = job.batch_id {
            let batch = Self::lock_batch(&mut tx, batch_id).await?;
            if batch.tenant_id != job.tenant_id {
                return Err(JobStoreError::TenantMismatch {
                    batch_id,
                    tenant_id: job.tenant_id,
                });
            }
            if batch.status.is_terminal() {
                return Err(JobStoreError::BatchClosed(batch_id));
            }
            sqlx::query("UPDATE job_batches SET total = total + 1, pending = pending + 1 WHERE id = $1")
                .bind(batch_id.get())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("attach_to_batch", e))?;
        }

        let sql = format!(
            r#"
            INSERT INTO marketplace_jobs (
                tenant_id, marketplace, action_code, target_id, batch_id,
                priority, max_attempts, rate_limit_ms, timeout_ms, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.tenant_id.as_uuid())
            .bind(&job.marketplace)
            .bind(&job.action_code)
            .bind(job.target_id)
            .bind(job.batch_id.map(|b| b.get()))
            .bind(job.priority)
            .bind(job.max_attempts as i32)
            .bind(millis(job.rate_limit))
            .bind(millis(job.timeout))
            .bind(job.expires_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        let inserted = job_from_row(&row)?;

        Self::commit(tx).await?;
        Ok(inserted)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM marketplace_jobs WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM marketplace_jobs
            WHERE tenant_id = $1 AND status = $2 AND deleted_at IS NULL
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn counts(&self, tenant_id: TenantId) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM marketplace_jobs
            WHERE tenant_id = $1 AND deleted_at IS NULL
            GROUP BY status
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("counts", e))?;
        status_counts(&rows)
    }

    #[instrument(skip(self, request), fields(worker = %request.worker_id, slots = request.slots), err)]
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_lock", e))?;

        let now = db_now(&mut tx).await?;

        let running = sqlx::query(
            "SELECT tenant_id, COUNT(*) AS n FROM marketplace_jobs WHERE status = 'processing' GROUP BY tenant_id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("count_processing", e))?;

        let mut in_flight = InFlight::default();
        for row in &running {
            let tenant: Uuid = row.try_get("tenant_id").map_err(|e| decode_error("tenant_id", e))?;
            let n: i64 = row.try_get("n").map_err(|e| decode_error("n", e))?;
            in_flight.global += n as u32;
            in_flight.per_tenant.insert(TenantId::from_uuid(tenant), n as u32);
        }
        if in_flight.global >= request.limits.global {
            Self::commit(tx).await?;
            return Ok(Vec::new());
        }

        let fetch = (request.slots as i64).min(MAX_CANDIDATES);
        let rows = sqlx::query(CANDIDATES_SQL)
            .bind(request.marketplace.as_deref())
            .bind(i64::from(request.limits.per_tenant))
            .bind(fetch)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_candidates", e))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let tenant: Uuid = row.try_get("tenant_id").map_err(|e| decode_error("tenant_id", e))?;
            let rate_limit_ms: i64 = row.try_get("rate_limit_ms").map_err(|e| decode_error("rate_limit_ms", e))?;
            candidates.push(Candidate {
                job_id: JobId::new(row.try_get("id").map_err(|e| decode_error("id", e))?),
                tenant_id: TenantId::from_uuid(tenant),
                marketplace: row.try_get("marketplace").map_err(|e| decode_error("marketplace", e))?,
                action_code: row.try_get("action_code").map_err(|e| decode_error("action_code", e))?,
                rate_limit: from_millis(rate_limit_ms),
                last_started_at: row
                    .try_get("last_started_at")
                    .map_err(|e| decode_error("last_started_at", e))?,
            });
        }

        let planned = plan_claims(&candidates, &in_flight, request.limits, request.slots, now);
        if planned.is_empty() {
            Self::commit(tx).await?;
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = planned.iter().map(|id| id.get()).collect();

        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = NOW(),
                completed_at = NULL,
                claimed_by = $2,
                claim_token = gen_random_uuid()
            WHERE id = ANY($1)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .bind(&request.worker_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_jobs", e))?;

        sqlx::query(
            r#"
            UPDATE job_batches
            SET status = 'running'
            WHERE status = 'pending'
              AND id IN (SELECT batch_id FROM marketplace_jobs WHERE id = ANY($1) AND batch_id IS NOT NULL)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_batches_running", e))?;

        Self::commit(tx).await?;

        let mut by_id: HashMap<JobId, Job> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let job = job_from_row(row)?;
            by_id.insert(job.id, job);
        }
        Ok(planned.into_iter().filter_map(|id| by_id.remove(&id)).collect())
    }

    #[instrument(skip(self, claim, outcome), fields(status = %outcome.status()), err)]
    async fn mark_terminal(
        &self,
        job_id: JobId,
        claim: Option<ClaimToken>,
        outcome: TerminalOutcome,
    ) -> Result<Transition, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        let status = outcome.status();
        if let Some(unchanged) = check_terminal_write(&job, claim, status)? {
            return Ok(unchanged);
        }

        let (result, error, step) = outcome.into_columns();
        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = $2,
                result = $3,
                error_message = $4,
                failed_step = COALESCE($5, failed_step),
                completed_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(status.as_str())
            .bind(result)
            .bind(error)
            .bind(step)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_terminal", e))?;
        let updated = job_from_row(&row)?;

        Self::commit(tx).await?;
        Ok(Transition::Applied(updated))
    }

    #[instrument(skip(self, claim, error), err)]
    async fn requeue(
        &self,
        job_id: JobId,
        claim: ClaimToken,
        delay: Duration,
        error: &str,
        failed_step: Option<&str>,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        check_requeue(&job, claim)?;

        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'pending',
                not_before = NOW() + ($2::bigint * INTERVAL '1 millisecond'),
                error_message = $3,
                failed_step = $4,
                claimed_by = NULL,
                claim_token = NULL
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(millis(delay))
            .bind(error)
            .bind(failed_step)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;
        let updated = job_from_row(&row)?;

        Self::commit(tx).await?;
        Ok(updated)
    }

    #[instrument(skip(self), err)]
    async fn cancel_pending(&self, job_id: JobId, reason: &str) -> Result<CancelOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        match job.status {
            JobStatus::Pending => {}
            JobStatus::Processing => return Ok(CancelOutcome::InFlight(job)),
            _ => return Ok(CancelOutcome::AlreadyFinished(job)),
        }

        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'cancelled', error_message = $2, completed_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(reason)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_pending", e))?;
        let cancelled = job_from_row(&row)?;

        Self::commit(tx).await?;
        Ok(CancelOutcome::Cancelled(cancelled))
    }

    #[instrument(skip(self), err)]
    async fn cancel_pending_in_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'cancelled', error_message = $2, completed_at = NOW()
            WHERE batch_id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id.get())
            .bind(reason)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel_pending_in_batch", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn expire_overdue(&self) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = 'timeout',
                error_message = 'job deadline exceeded',
                completed_at = NOW(),
                claim_token = NULL
            WHERE status IN ('pending', 'processing')
              AND expires_at <= NOW()
              AND deleted_at IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("expire_overdue", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE marketplace_jobs
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                error_message = CASE WHEN attempts < max_attempts
                    THEN 'claim went stale; re-queued'
                    ELSE 'claim went stale with no attempts left' END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                not_before = NOW(),
                failed_step = $2,
                claimed_by = NULL,
                claim_token = NULL
            WHERE status = 'processing'
              AND started_at <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
              AND deleted_at IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(millis(stale_after))
            .bind(RECOVERY_STEP)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("recover_stale", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn prune_terminal(&self, retention: Duration) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE marketplace_jobs
            SET deleted_at = NOW()
            WHERE status IN ('success', 'failed', 'timeout', 'cancelled')
              AND deleted_at IS NULL
              AND completed_at <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
            "#,
        )
        .bind(millis(retention))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_terminal", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BatchStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn insert_batch(&self, tenant_id: TenantId, policy: BatchPolicy) -> Result<Batch, JobStoreError> {
        let sql = format!("INSERT INTO job_batches (tenant_id, policy) VALUES ($1, $2) RETURNING {BATCH_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(policy.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;
        batch_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, JobStoreError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM job_batches WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(batch_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_batch", e))?;
        row.as_ref().map(batch_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn apply_batch_outcome(
        &self,
        batch_id: BatchId,
        outcome: ChildOutcome,
    ) -> Result<Batch, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut batch = Self::lock_batch(&mut tx, batch_id).await?;
        let now = db_now(&mut tx).await?;
        batch.apply(outcome, now);
        Self::write_batch(&mut tx, &batch).await?;
        Self::commit(tx).await?;
        Ok(batch)
    }

    #[instrument(skip(self), err)]
    async fn close_batch(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE job_batches
            SET status = $2, completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {BATCH_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(batch_id.get())
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("close_batch", e))?;
        match row {
            Some(row) => batch_from_row(&row),
            None => self
                .get_batch(batch_id)
                .await?
                .ok_or(JobStoreError::BatchNotFound(batch_id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn recompute_batch(&self, batch_id: BatchId) -> Result<Batch, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut batch = Self::lock_batch(&mut tx, batch_id).await?;
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM marketplace_jobs WHERE batch_id = $1 GROUP BY status")
            .bind(batch_id.get())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("recount_children", e))?;
        let children = status_counts(&rows)?;
        let now = db_now(&mut tx).await?;
        batch.recount(&children, now);
        Self::write_batch(&mut tx, &batch).await?;
        Self::commit(tx).await?;
        Ok(batch)
    }

    #[instrument(skip(self), err)]
    async fn stalled_batches(&self, limit: usize) -> Result<Vec<BatchId>, JobStoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT b.id
            FROM job_batches b
            WHERE b.status IN ('pending', 'running')
              AND b.total > 0
              AND NOT EXISTS (
                  SELECT 1 FROM marketplace_jobs j
                  WHERE j.batch_id = b.id AND j.status IN ('pending', 'processing')
              )
            ORDER BY b.id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stalled_batches", e))?;
        Ok(ids.into_iter().map(BatchId::new).collect())
    }
}

#[async_trait]
impl StatsStore for PostgresJobStore {
    #[instrument(skip(self, sample), fields(tenant_id = %sample.tenant_id, action_code = %sample.action_code), err)]
    async fn record_completion(&self, sample: &CompletionSample) -> Result<(), JobStoreError> {
        let duration_ms = sample.duration.as_secs_f64() * 1000.0;
        sqlx::query(
            r#"
            INSERT INTO job_daily_stats (
                marketplace, action_code, tenant_id, day, total, succeeded, failed, avg_duration_ms
            )
            VALUES ($1, $2, $3, $4, 1, $5, $6, $7)
            ON CONFLICT (marketplace, action_code, tenant_id, day)
            DO UPDATE SET
                total = job_daily_stats.total + 1,
                succeeded = job_daily_stats.succeeded + EXCLUDED.succeeded,
                failed = job_daily_stats.failed + EXCLUDED.failed,
                avg_duration_ms = job_daily_stats.avg_duration_ms
                    + (EXCLUDED.avg_duration_ms - job_daily_stats.avg_duration_ms)
                      / (job_daily_stats.total + 1)
            "#,
        )
        .bind(&sample.marketplace)
        .bind(&sample.action_code)
        .bind(sample.tenant_id.as_uuid())
        .bind(sample.day)
        .bind(i64::from(sample.success))
        .bind(i64::from(!sample.success))
        .bind(duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_completion", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn daily_stats(&self, tenant_id: TenantId, day: NaiveDate) -> Result<Vec<DailyStats>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT marketplace, action_code, tenant_id, day, total, succeeded, failed, avg_duration_ms
            FROM job_daily_stats
            WHERE tenant_id = $1 AND day = $2
            ORDER BY marketplace, action_code
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(day)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("daily_stats", e))?;

        rows.iter()
            .map(|row| {
                let stats = DailyStatsRow::from_row(row).map_err(|e| decode_error("job_daily_stats", e))?;
                Ok(stats.into())
            })
            .collect()
    }
}

/// Loads the action registry from `marketplace_actions`.
#[derive(Debug, Clone)]
pub struct PostgresActionSource {
    pool: PgPool,
}

impl PostgresActionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace one registry entry.
    #[instrument(skip(self, policy), fields(action = %policy.key()), err)]
    pub async fn upsert(&self, policy: &ActionPolicy) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO marketplace_actions (
                marketplace, action_code, priority, is_batch, rate_limit_ms, max_retries, timeout_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (marketplace, action_code)
            DO UPDATE SET
                priority = EXCLUDED.priority,
                is_batch = EXCLUDED.is_batch,
                rate_limit_ms = EXCLUDED.rate_limit_ms,
                max_retries = EXCLUDED.max_retries,
                timeout_ms = EXCLUDED.timeout_ms
            "#,
        )
        .bind(&policy.marketplace)
        .bind(&policy.action_code)
        .bind(policy.priority)
        .bind(policy.is_batch)
        .bind(millis(policy.rate_limit))
        .bind(policy.max_retries as i32)
        .bind(millis(policy.timeout))
        .execute(&self.pool)
        .await
        .map_err(|e| RegistryError::Source(format!("upsert_action: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ActionSource for PostgresActionSource {
    async fn load(&self) -> Result<Vec<ActionPolicy>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT marketplace, action_code, priority, is_batch, rate_limit_ms, max_retries, timeout_ms
            FROM marketplace_actions
            ORDER BY marketplace, action_code
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegistryError::Source(format!("load_actions: {e}")))?;

        rows.iter()
            .map(|row| {
                let policy = ActionPolicyRow::from_row(row)
                    .map_err(|e| RegistryError::Source(format!("failed to decode action row: {e}")))?;
                Ok(policy.into())
            })
            .collect()
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

fn status_counts(rows: &[PgRow]) -> Result<JobCounts, JobStoreError> {
    let mut counts = JobCounts::default();
    for row in rows {
        let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
        let n: i64 = row.try_get("n").map_err(|e| decode_error("n", e))?;
        let status = status.parse::<JobStatus>().map_err(JobStoreError::Storage)?;
        counts.add(status, n as u64);
    }
    Ok(counts)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(column: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode {column}: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    tenant_id: Uuid,
    marketplace: String,
    action_code: String,
    target_id: Option<i64>,
    batch_id: Option<i64>,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    rate_limit_ms: i64,
    timeout_ms: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    not_before: DateTime<Utc>,
    claimed_by: Option<String>,
    claim_token: Option<Uuid>,
    result: Option<JsonValue>,
    error_message: Option<String>,
    failed_step: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            marketplace: row.try_get("marketplace")?,
            action_code: row.try_get("action_code")?,
            target_id: row.try_get("target_id")?,
            batch_id: row.try_get("batch_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            rate_limit_ms: row.try_get("rate_limit_ms")?,
            timeout_ms: row.try_get("timeout_ms")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            expires_at: row.try_get("expires_at")?,
            not_before: row.try_get("not_before")?,
            claimed_by: row.try_get("claimed_by")?,
            claim_token: row.try_get("claim_token")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            failed_step: row.try_get("failed_step")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::new(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            marketplace: row.marketplace,
            action_code: row.action_code,
            target_id: row.target_id,
            batch_id: row.batch_id.map(BatchId::new),
            status: row.status.parse().map_err(JobStoreError::Storage)?,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            rate_limit: from_millis(row.rate_limit_ms),
            timeout: from_millis(row.timeout_ms),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
            not_before: row.not_before,
            claimed_by: row.claimed_by,
            claim_token: row.claim_token,
            result: row.result,
            error_message: row.error_message,
            failed_step: row.failed_step,
            deleted_at: row.deleted_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| decode_error("marketplace_jobs", e))?
        .try_into()
}

#[derive(Debug)]
struct BatchRow {
    id: i64,
    tenant_id: Uuid,
    status: String,
    policy: String,
    total: i32,
    succeeded: i32,
    failed: i32,
    cancelled: i32,
    pending: i32,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for BatchRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            policy: row.try_get("policy")?,
            total: row.try_get("total")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
            cancelled: row.try_get("cancelled")?,
            pending: row.try_get("pending")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn batch_from_row(row: &PgRow) -> Result<Batch, JobStoreError> {
    let row = BatchRow::from_row(row).map_err(|e| decode_error("job_batches", e))?;
    Ok(Batch {
        id: BatchId::new(row.id),
        tenant_id: TenantId::from_uuid(row.tenant_id),
        status: row.status.parse().map_err(JobStoreError::Storage)?,
        policy: row.policy.parse().map_err(JobStoreError::Storage)?,
        total: row.total.max(0) as u32,
        succeeded: row.succeeded.max(0) as u32,
        failed: row.failed.max(0) as u32,
        cancelled: row.cancelled.max(0) as u32,
        pending: row.pending.max(0) as u32,
        created_at: row.created_at,
        completed_at: row.completed_at,
    })
}

#[derive(Debug)]
struct DailyStatsRow {
    marketplace: String,
    action_code: String,
    tenant_id: Uuid,
    day: NaiveDate,
    total: i64,
    succeeded: i64,
    failed: i64,
    avg_duration_ms: f64,
}

impl<'r> FromRow<'r, PgRow> for DailyStatsRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DailyStatsRow {
            marketplace: row.try_get("marketplace")?,
            action_code: row.try_get("action_code")?,
            tenant_id: row.try_get("tenant_id")?,
            day: row.try_get("day")?,
            total: row.try_get("total")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
            avg_duration_ms: row.try_get("avg_duration_ms")?,
        })
    }
}

impl From<DailyStatsRow> for DailyStats {
    fn from(row: DailyStatsRow) -> Self {
        DailyStats {
            marketplace: row.marketplace,
            action_code: row.action_code,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            day: row.day,
            total: row.total.max(0) as u64,
            succeeded: row.succeeded.max(0) as u64,
            failed: row.failed.max(0) as u64,
            avg_duration_ms: row.avg_duration_ms,
        }
    }
}

#[derive(Debug)]
struct ActionPolicyRow {
    marketplace: String,
    action_code: String,
    priority: i32,
    is_batch: bool,
    rate_limit_ms: i64,
    max_retries: i32,
    timeout_ms: i64,
}

impl<'r> FromRow<'r, PgRow> for ActionPolicyRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ActionPolicyRow {
            marketplace: row.try_get("marketplace")?,
            action_code: row.try_get("action_code")?,
            priority: row.try_get("priority")?,
            is_batch: row.try_get("is_batch")?,
            rate_limit_ms: row.try_get("rate_limit_ms")?,
            max_retries: row.try_get("max_retries")?,
            timeout_ms: row.try_get("timeout_ms")?,
        })
    }
}

impl From<ActionPolicyRow> for ActionPolicy {
    fn from(row: ActionPolicyRow) -> Self {
        ActionPolicy {
            marketplace: row.marketplace,
            action_code: row.action_code,
            priority: row.priority,
            is_batch: row.is_batch,
            rate_limit: from_millis(row.rate_limit_ms),
            max_retries: row.max_retries.max(0) as u32,
            timeout: from_millis(row.timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturates_instead_of_wrapping() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), i64::MAX);
        assert_eq!(from_millis(-5), Duration::ZERO);
    }

    #[test]
    fn schema_declares_notification_trigger() {
        assert!(SCHEMA.contains("pg_notify('marketplace_jobs'"));
        assert!(SCHEMA.contains(super::super::notify::JOBS_CHANNEL));
    }
}
