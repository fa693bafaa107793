//! Postgres store checks. Skipped unless `DATABASE_URL` points at a scratch
//! database; every test uses its own marketplace so runs do not interfere.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use relister_core::TenantId;
use relister_infra::jobs::{
    ActionPolicy, ActionRegistry, ActionSource, BatchPolicy, BatchStatus, BatchStore, ClaimLimits,
    ClaimRequest, JobStore, JobStoreError, NewJob, PostgresActionSource, PostgresJobStore,
    TerminalOutcome, Transition,
};
use relister_infra::jobs::postgres::CLAIM_LOCK_KEY;

async fn store() -> Option<PostgresJobStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await
        .expect("failed to connect to DATABASE_URL");
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await.expect("schema");
    Some(store)
}

fn marketplace() -> String {
    format!("pg-test-{}", Uuid::now_v7())
}

fn new_job(tenant_id: TenantId, marketplace: &str, priority: i32) -> NewJob {
    NewJob {
        tenant_id,
        marketplace: marketplace.to_string(),
        action_code: "publish".into(),
        target_id: Some(priority as i64),
        batch_id: None,
        priority,
        max_attempts: 2,
        rate_limit: Duration::ZERO,
        timeout: Duration::from_secs(30),
        expires_at: None,
    }
}

fn request(worker: &str, marketplace: &str, slots: usize, limits: ClaimLimits) -> ClaimRequest {
    ClaimRequest {
        worker_id: worker.to_string(),
        slots,
        limits,
        marketplace: Some(marketplace.to_string()),
    }
}

const WIDE: ClaimLimits = ClaimLimits {
    global: 10_000,
    per_tenant: 10_000,
};

#[tokio::test]
async fn claim_orders_by_priority_and_respects_tenant_ceiling() {
    let Some(store) = store().await else { return };
    let market = marketplace();
    let tenant = TenantId::new();
    let low = store.insert(new_job(tenant, &market, 5)).await.unwrap();
    let high = store.insert(new_job(tenant, &market, 1)).await.unwrap();

    let limits = ClaimLimits { global: 10_000, per_tenant: 1 };
    let claimed = store.claim(&request("w1", &market, 4, limits)).await.unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, high.id);
    assert!(claimed[0].claim_token.is_some());
    assert_eq!(claimed[0].attempts, 1);
    assert!(store.claim(&request("w2", &market, 4, limits)).await.unwrap().is_empty());
    assert_eq!(store.get(low.id).await.unwrap().unwrap().status.as_str(), "pending");
}

#[tokio::test]
async fn racing_claimers_get_disjoint_jobs() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    let market = marketplace();
    for i in 0..20 {
        store.insert(new_job(TenantId::new(), &market, i % 3)).await.unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for w in 0..4 {
        let store = store.clone();
        let req = request(&format!("w{w}"), &market, 3, WIDE);
        tasks.spawn(async move {
            let mut mine = Vec::new();
            for _ in 0..20 {
                mine.extend(store.claim(&req).await.unwrap().into_iter().map(|j| j.id));
            }
            mine
        });
    }

    let mut all = Vec::new();
    while let Some(res) = tasks.join_next().await {
        all.extend(res.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len());
}

#[tokio::test]
async fn rate_limited_backlog_does_not_starve_other_tenants() {
    let Some(store) = store().await else { return };
    let market = marketplace();
    let busy = TenantId::new();
    let quiet = TenantId::new();
    for _ in 0..20 {
        let mut job = new_job(busy, &market, 1);
        job.action_code = "sync".into();
        job.rate_limit = Duration::from_secs(60);
        store.insert(job).await.unwrap();
    }
    let other = store.insert(new_job(quiet, &market, 3)).await.unwrap();

    let first = store.claim(&request("w1", &market, 1, WIDE)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].tenant_id, busy);

    let second = store.claim(&request("w1", &market, 1, WIDE)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, other.id);

    assert!(store.claim(&request("w1", &market, 1, WIDE)).await.unwrap().is_empty());
}

#[tokio::test]
async fn tenants_behind_a_large_backlog_are_reached() {
    let Some(store) = store().await else { return };
    let market = marketplace();
    let busy = TenantId::new();
    for _ in 0..50 {
        store.insert(new_job(busy, &market, 1)).await.unwrap();
    }
    let others: Vec<TenantId> = (0..3).map(|_| TenantId::new()).collect();
    for tenant in &others {
        store.insert(new_job(*tenant, &market, 5)).await.unwrap();
    }

    let limits = ClaimLimits { global: 10_000, per_tenant: 1 };
    let claimed = store.claim(&request("w1", &market, 4, limits)).await.unwrap();

    let tenants: HashSet<TenantId> = claimed.iter().map(|j| j.tenant_id).collect();
    assert_eq!(claimed.len(), 4);
    assert!(tenants.contains(&busy));
    for tenant in &others {
        assert!(tenants.contains(tenant));
    }
}

#[tokio::test]
async fn pass_waits_for_a_concurrent_pass_instead_of_skipping() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    let market = marketplace();
    for _ in 0..5 {
        store.insert(new_job(TenantId::new(), &market, 1)).await.unwrap();
    }

    let mut holder = store.pool().begin().await.unwrap();
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(CLAIM_LOCK_KEY)
        .execute(&mut *holder)
        .await
        .unwrap();

    let racing = {
        let store = store.clone();
        let req = request("w2", &market, 5, WIDE);
        tokio::spawn(async move { store.claim(&req).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!racing.is_finished());

    holder.commit().await.unwrap();
    let claimed = racing.await.unwrap().unwrap();
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn terminal_write_is_guarded_and_idempotent() {
    let Some(store) = store().await else { return };
    let market = marketplace();
    store.insert(new_job(TenantId::new(), &market, 1)).await.unwrap();
    let job = store.claim(&request("w1", &market, 1, WIDE)).await.unwrap().remove(0);
    let claim = job.claim().unwrap();

    let success = TerminalOutcome::Success { result: json!({ "listing": 7 }) };
    let first = store.mark_terminal(job.id, Some(claim), success.clone()).await.unwrap();
    assert!(first.is_applied());
    let again = store.mark_terminal(job.id, Some(claim), success).await.unwrap();
    assert!(matches!(again, Transition::Unchanged(_)));

    let late = store
        .mark_terminal(job.id, Some(claim), TerminalOutcome::failed("late", None))
        .await;
    assert!(matches!(late, Err(JobStoreError::IllegalTransition { .. })));
}

#[tokio::test]
async fn requeue_delays_next_claim() {
    let Some(store) = store().await else { return };
    let market = marketplace();
    store.insert(new_job(TenantId::new(), &market, 1)).await.unwrap();
    let job = store.claim(&request("w1", &market, 1, WIDE)).await.unwrap().remove(0);

    let requeued = store
        .requeue(job.id, job.claim().unwrap(), Duration::from_secs(3600), "503", Some("upload"))
        .await
        .unwrap();

    assert_eq!(requeued.status.as_str(), "pending");
    assert!(requeued.claim_token.is_none());
    assert!(store.claim(&request("w1", &market, 1, WIDE)).await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_counters_follow_children() {
    let Some(store) = store().await else { return };
    let market = marketplace();
    let tenant = TenantId::new();
    let batch = store.insert_batch(tenant, BatchPolicy::FailFast).await.unwrap();
    for _ in 0..2 {
        let mut job = new_job(tenant, &market, 1);
        job.batch_id = Some(batch.id);
        store.insert(job).await.unwrap();
    }

    let mut foreign = new_job(TenantId::new(), &market, 1);
    foreign.batch_id = Some(batch.id);
    assert!(matches!(
        store.insert(foreign).await,
        Err(JobStoreError::TenantMismatch { .. })
    ));

    let cancelled = store.cancel_pending_in_batch(batch.id, "test").await.unwrap();
    assert_eq!(cancelled.len(), 2);
    assert!(store.stalled_batches(1000).await.unwrap().contains(&batch.id));

    let repaired = store.recompute_batch(batch.id).await.unwrap();
    assert_eq!((repaired.total, repaired.cancelled, repaired.pending), (2, 2, 0));
    assert_eq!(repaired.status, BatchStatus::Failed);
}

#[tokio::test]
async fn action_source_round_trips_policies() {
    let Some(store) = store().await else { return };
    let source = PostgresActionSource::new(store.pool().clone());
    let market = marketplace();
    source
        .upsert(
            &ActionPolicy::new(market.clone(), "sync")
                .with_rate_limit(Duration::from_millis(2000))
                .with_timeout(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    let loaded = source.load().await.unwrap();
    let registry = ActionRegistry::new(loaded).unwrap();
    let policy = registry.resolve(&market, "sync").unwrap();

    assert_eq!(policy.rate_limit, Duration::from_millis(2000));
    assert_eq!(policy.timeout, Duration::from_secs(20));
}
