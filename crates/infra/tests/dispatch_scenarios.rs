//! End-to-end dispatch scenarios against the in-memory store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use relister_core::{ManualClock, TenantId};
use relister_infra::jobs::{
    ActionError, ActionErrorKind, ActionExecutor, ActionPolicy, ActionRegistry, ActionRequest,
    ActionSuccess, BackoffPolicy, BatchPolicy, BatchStatus, ClaimEngine, ClaimLimits,
    ExecutionOutcome, InMemoryJobStore, JobExecutor, JobService, JobStatus, JobStore,
    MaintenanceConfig, MaintenanceScheduler,
};

fn registry() -> Arc<ActionRegistry> {
    Arc::new(
        ActionRegistry::new(vec![
            ActionPolicy::new("ebay", "publish").with_priority(1).with_max_retries(3),
            ActionPolicy::new("ebay", "relist").with_priority(3),
            ActionPolicy::new("vinted", "sync")
                .with_priority(2)
                .with_rate_limit(Duration::from_millis(2000)),
            ActionPolicy::new("vinted", "publish").batch(),
        ])
        .unwrap(),
    )
}

struct Harness {
    clock: ManualClock,
    store: Arc<InMemoryJobStore>,
    service: JobService,
}

fn harness() -> Harness {
    let clock = ManualClock::starting_now();
    let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
    let service = JobService::new(registry(), store.clone()).with_clock(Arc::new(clock.clone()));
    Harness {
        clock,
        store,
        service,
    }
}

fn engine(store: &Arc<InMemoryJobStore>, worker: &str, limits: ClaimLimits) -> ClaimEngine {
    ClaimEngine::new(store.clone(), worker, limits)
}

/// Always fails with the given kind.
struct AlwaysFails(ActionErrorKind);

#[async_trait]
impl ActionExecutor for AlwaysFails {
    async fn execute_action(&self, _request: ActionRequest) -> Result<ActionSuccess, ActionError> {
        Err(ActionError::new(self.0, "marketplace unavailable").at_step("upload"))
    }
}

/// Succeeds and remembers which jobs it ran.
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl ActionExecutor for Recording {
    async fn execute_action(&self, request: ActionRequest) -> Result<ActionSuccess, ActionError> {
        self.seen.lock().unwrap().push(request.job_id.get());
        Ok(ActionSuccess {
            result: json!({ "listing": request.target_id }),
        })
    }
}

#[tokio::test]
async fn higher_priority_runs_first_under_tenant_ceiling_of_one() {
    let h = harness();
    let tenant = TenantId::new();
    let b = h.service.enqueue(tenant, "ebay", "relist", Some(2), None).await.unwrap();
    let a = h.service.enqueue(tenant, "ebay", "publish", Some(1), None).await.unwrap();
    let claims = engine(&h.store, "w1", ClaimLimits { global: 10, per_tenant: 1 });

    let first = claims.claim(4).await.unwrap();
    assert_eq!(first.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id]);
    assert!(claims.claim(4).await.unwrap().is_empty());
    assert_eq!(h.service.get_job(b.id).await.unwrap().status, JobStatus::Pending);

    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(Recording::default()),
        BackoffPolicy::default(),
        Arc::new(h.clock.clone()),
    );
    let job = first.into_iter().next().unwrap();
    assert_eq!(executor.execute(job).await, ExecutionOutcome::Succeeded);

    let second = claims.claim(4).await.unwrap();
    assert_eq!(second.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id]);
}

#[tokio::test]
async fn rate_limited_action_waits_for_its_interval() {
    let h = harness();
    let tenant = TenantId::new();
    let first = h.service.enqueue(tenant, "vinted", "sync", Some(1), None).await.unwrap();
    let second = h.service.enqueue(tenant, "vinted", "sync", Some(2), None).await.unwrap();
    let claims = engine(&h.store, "w1", ClaimLimits::default());

    let claimed = claims.claim(8).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, first.id);
    let started = claimed[0].started_at.unwrap();

    h.clock.advance(Duration::from_millis(1999));
    assert!(claims.claim(8).await.unwrap().is_empty());

    h.clock.advance(Duration::from_millis(1));
    let claimed = claims.claim(8).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, second.id);
    assert!(claimed[0].started_at.unwrap() - started >= chrono::Duration::milliseconds(2000));
}

#[tokio::test]
async fn other_tenants_are_not_rate_limited_by_each_other() {
    let h = harness();
    h.service.enqueue(TenantId::new(), "vinted", "sync", None, None).await.unwrap();
    h.service.enqueue(TenantId::new(), "vinted", "sync", None, None).await.unwrap();

    let claimed = engine(&h.store, "w1", ClaimLimits::default()).claim(8).await.unwrap();

    assert_eq!(claimed.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_job() {
    let h = harness();
    let tenants: Vec<TenantId> = (0..5).map(|_| TenantId::new()).collect();
    for i in 0..40 {
        h.service
            .enqueue(tenants[i % tenants.len()], "ebay", "publish", Some(i as i64), None)
            .await
            .unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for w in 0..8 {
        let claims = engine(&h.store, &format!("w{w}"), ClaimLimits { global: 100, per_tenant: 100 });
        tasks.spawn(async move {
            let mut mine = Vec::new();
            for _ in 0..10 {
                mine.extend(claims.claim(2).await.unwrap().into_iter().map(|j| j.id));
                tokio::task::yield_now().await;
            }
            mine
        });
    }

    let mut all = Vec::new();
    while let Some(res) = tasks.join_next().await {
        all.extend(res.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "a job was claimed twice");
    assert_eq!(all.len(), 40);
}

#[tokio::test]
async fn ceilings_hold_across_claimers() {
    let h = harness();
    let busy = TenantId::new();
    let quiet = TenantId::new();
    for _ in 0..6 {
        h.service.enqueue(busy, "ebay", "publish", None, None).await.unwrap();
    }
    h.service.enqueue(quiet, "ebay", "publish", None, None).await.unwrap();
    let limits = ClaimLimits { global: 4, per_tenant: 2 };

    let mut claimed = Vec::new();
    for worker in ["w1", "w2", "w3"] {
        claimed.extend(engine(&h.store, worker, limits).claim(8).await.unwrap());
    }

    assert_eq!(claimed.len(), 3);
    assert_eq!(claimed.iter().filter(|j| j.tenant_id == busy).count(), 2);
    assert_eq!(claimed.iter().filter(|j| j.tenant_id == quiet).count(), 1);
    assert_eq!(h.service.counts(busy).await.unwrap().processing, 2);
}

#[tokio::test]
async fn retryable_failures_exhaust_after_exactly_max_retries() {
    let h = harness();
    let tenant = TenantId::new();
    let job = h.service.enqueue(tenant, "ebay", "publish", Some(1), None).await.unwrap();
    assert_eq!(job.max_attempts, 3);

    let claims = engine(&h.store, "w1", ClaimLimits::default());
    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(AlwaysFails(ActionErrorKind::Network)),
        BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10)),
        Arc::new(h.clock.clone()),
    );

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        h.clock.advance(Duration::from_secs(60));
        for claimed in claims.claim(1).await.unwrap() {
            outcomes.push(executor.execute(claimed).await);
        }
    }

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], ExecutionOutcome::Requeued { .. }));
    assert!(matches!(outcomes[1], ExecutionOutcome::Requeued { .. }));
    assert_eq!(outcomes[2], ExecutionOutcome::Failed);

    let failed = h.service.get_job(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.failed_step.as_deref(), Some("upload"));
    assert!(failed.error_message.unwrap().contains("marketplace unavailable"));
}

#[tokio::test]
async fn non_retryable_failure_skips_remaining_attempts() {
    let h = harness();
    let job = h.service.enqueue(TenantId::new(), "ebay", "publish", None, None).await.unwrap();
    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(AlwaysFails(ActionErrorKind::Validation)),
        BackoffPolicy::default(),
        Arc::new(h.clock.clone()),
    );

    let claimed = engine(&h.store, "w1", ClaimLimits::default()).claim(1).await.unwrap();
    let outcome = executor.execute(claimed.into_iter().next().unwrap()).await;

    assert_eq!(outcome, ExecutionOutcome::Failed);
    assert_eq!(h.service.get_job(job.id).await.unwrap().attempts, 1);
}

#[tokio::test]
async fn batch_completes_only_after_every_child_is_terminal() {
    let h = harness();
    let tenant = TenantId::new();
    let batch = h.service.create_batch(tenant, BatchPolicy::FailFast).await.unwrap();
    for target in 0..5 {
        h.service
            .enqueue(tenant, "vinted", "publish", Some(target), Some(batch.id))
            .await
            .unwrap();
    }
    let claims = engine(&h.store, "w1", ClaimLimits::default());
    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(Recording::default()),
        BackoffPolicy::default(),
        Arc::new(h.clock.clone()),
    );

    let mut finished = 0;
    loop {
        let claimed = claims.claim(2).await.unwrap();
        if claimed.is_empty() {
            break;
        }
        for job in claimed {
            executor.execute(job).await;
            finished += 1;
            let progress = h.service.get_batch(batch.id).await.unwrap();
            if finished < 5 {
                assert_eq!(progress.status, BatchStatus::Running);
                assert_eq!(progress.pending, 5 - finished);
            }
        }
    }

    let done = h.service.get_batch(batch.id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!((done.total, done.succeeded, done.pending), (5, 5, 0));
}

#[tokio::test]
async fn cancelling_a_batch_spares_processing_children() {
    let h = harness();
    let tenant = TenantId::new();
    let batch = h.service.create_batch(tenant, BatchPolicy::BestEffort).await.unwrap();
    for target in 0..5 {
        h.service
            .enqueue(tenant, "vinted", "publish", Some(target), Some(batch.id))
            .await
            .unwrap();
    }
    let running = engine(&h.store, "w1", ClaimLimits::default()).claim(2).await.unwrap();
    assert_eq!(running.len(), 2);

    let cancellation = h.service.cancel_batch(batch.id).await.unwrap();

    assert_eq!(cancellation.cancelled.len(), 3);
    assert!(cancellation.cancelled.iter().all(|j| j.status == JobStatus::Cancelled));
    assert_eq!(cancellation.batch.status, BatchStatus::Cancelled);
    assert_eq!(cancellation.batch.pending, 2);

    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(Recording::default()),
        BackoffPolicy::default(),
        Arc::new(h.clock.clone()),
    );
    for job in running {
        assert_eq!(executor.execute(job).await, ExecutionOutcome::Succeeded);
    }

    let settled = h.service.get_batch(batch.id).await.unwrap();
    assert_eq!(settled.status, BatchStatus::Cancelled);
    assert_eq!((settled.succeeded, settled.cancelled, settled.pending), (2, 3, 0));
    assert!(h.service.enqueue(tenant, "vinted", "publish", None, Some(batch.id)).await.is_err());
}

#[tokio::test]
async fn stale_job_without_attempts_fails_with_no_dispatcher_alive() {
    let h = harness();
    let tenant = TenantId::new();
    let job = h.service.enqueue(tenant, "ebay", "publish", None, None).await.unwrap();
    let claims = engine(&h.store, "crashed", ClaimLimits::default());
    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(AlwaysFails(ActionErrorKind::Upstream)),
        BackoffPolicy::fixed(Duration::ZERO),
        Arc::new(h.clock.clone()),
    );
    // Burn two attempts, then leave the third claimed as if the worker died.
    for _ in 0..2 {
        let claimed = claims.claim(1).await.unwrap();
        executor.execute(claimed.into_iter().next().unwrap()).await;
    }
    let orphan = claims.claim(1).await.unwrap();
    assert_eq!(orphan[0].attempts, 3);

    let scheduler = MaintenanceScheduler::new(
        h.store.clone(),
        MaintenanceConfig {
            stale_after: Duration::from_secs(900),
            ..MaintenanceConfig::default()
        },
    );
    h.clock.advance(Duration::from_secs(901));
    let report = scheduler.sweep().await;

    assert_eq!(report.failed_stale, 1);
    let failed = h.store.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.claim_token.is_none());
}

#[tokio::test]
async fn terminal_jobs_ignore_later_outcomes() {
    let h = harness();
    h.service.enqueue(TenantId::new(), "ebay", "publish", None, None).await.unwrap();
    let claimed = engine(&h.store, "w1", ClaimLimits::default()).claim(1).await.unwrap();
    let job = claimed.into_iter().next().unwrap();
    let executor = JobExecutor::new(
        h.store.clone(),
        Arc::new(Recording::default()),
        BackoffPolicy::default(),
        Arc::new(h.clock.clone()),
    );

    assert_eq!(executor.execute(job.clone()).await, ExecutionOutcome::Succeeded);
    // Replaying the same claimed attempt is a no-op.
    assert_eq!(executor.execute(job.clone()).await, ExecutionOutcome::Succeeded);

    let done = h.service.get_job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.attempts, 1);
}
