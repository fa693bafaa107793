//! Claim engine.
//!
//! A claim pass is split in two halves. The store gathers the current
//! PROCESSING counts and the eligible PENDING candidates while holding its
//! exclusive claim section (a mutex in memory, an advisory transaction lock
//! plus row locks with `SKIP LOCKED` in Postgres). `plan_claims` then picks
//! which candidates to take, and the store flips exactly those to PROCESSING
//! before leaving the section.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relister_core::{JobId, TenantId};

use super::error::JobStoreError;
use super::store::DispatchStore;
use super::types::Job;

/// Concurrency ceilings enforced by counting PROCESSING rows at claim time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLimits {
    /// System-wide in-flight jobs
    pub global: u32,
    /// In-flight jobs per tenant
    pub per_tenant: u32,
}

impl Default for ClaimLimits {
    fn default() -> Self {
        Self {
            global: 64,
            per_tenant: 4,
        }
    }
}

/// One claim pass request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub worker_id: String,
    /// Free local capacity of the requesting worker
    pub slots: usize,
    pub limits: ClaimLimits,
    pub marketplace: Option<String>,
}

/// Eligible PENDING job as seen by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub marketplace: String,
    pub action_code: String,
    pub rate_limit: Duration,
    /// Latest start of the same action for the same tenant
    pub last_started_at: Option<DateTime<Utc>>,
}

/// PROCESSING counts at the start of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlight {
    pub global: u32,
    pub per_tenant: HashMap<TenantId, u32>,
}

impl InFlight {
    pub fn tenant(&self, tenant_id: &TenantId) -> u32 {
        self.per_tenant.get(tenant_id).copied().unwrap_or(0)
    }
}

/// Choose which candidates to claim.
///
/// `candidates` must already be ordered by (priority, created_at, id). Tenants
/// at their ceiling and rate-limited (tenant, marketplace, action) keys are
/// skipped, not reordered; a key taken earlier in the same pass counts as
/// started `now`. The result never exceeds `slots` nor the remaining global
/// budget.
pub fn plan_claims(
    candidates: &[Candidate],
    in_flight: &InFlight,
    limits: ClaimLimits,
    slots: usize,
    now: DateTime<Utc>,
) -> Vec<JobId> {
    let global_budget = limits.global.saturating_sub(in_flight.global) as usize;
    let budget = slots.min(global_budget);
    if budget == 0 {
        return Vec::new();
    }

    let mut per_tenant = in_flight.per_tenant.clone();
    let mut started_this_pass: HashSet<(TenantId, &str, &str)> = HashSet::new();
    let mut planned = Vec::with_capacity(budget);

    for candidate in candidates {
        if planned.len() == budget {
            break;
        }

        let running = per_tenant.entry(candidate.tenant_id).or_insert(0);
        if *running >= limits.per_tenant {
            continue;
        }

        let key = (
            candidate.tenant_id,
            candidate.marketplace.as_str(),
            candidate.action_code.as_str(),
        );
        if !candidate.rate_limit.is_zero() {
            if started_this_pass.contains(&key) {
                continue;
            }
            if let Some(last) = candidate.last_started_at {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < candidate.rate_limit {
                    continue;
                }
            }
        }

        *running += 1;
        started_this_pass.insert(key);
        planned.push(candidate.job_id);
    }

    planned
}

/// Worker-side handle on the store's claim pass.
#[derive(Clone)]
pub struct ClaimEngine {
    store: Arc<dyn DispatchStore>,
    worker_id: String,
    limits: ClaimLimits,
    marketplace: Option<String>,
}

impl ClaimEngine {
    pub fn new(store: Arc<dyn DispatchStore>, worker_id: impl Into<String>, limits: ClaimLimits) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            limits,
            marketplace: None,
        }
    }

    /// Restrict claims to one marketplace.
    pub fn with_marketplace(mut self, marketplace: Option<String>) -> Self {
        self.marketplace = marketplace;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `slots` jobs. Jobs locked by a racing pass are skipped.
    pub async fn claim(&self, slots: usize) -> Result<Vec<Job>, JobStoreError> {
        if slots == 0 {
            return Ok(Vec::new());
        }
        let request = ClaimRequest {
            worker_id: self.worker_id.clone(),
            slots,
            limits: self.limits,
            marketplace: self.marketplace.clone(),
        };
        let claimed = self.store.claim(&request).await?;
        for job in &claimed {
            tracing::debug!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                marketplace = %job.marketplace,
                action_code = %job.action_code,
                attempt = job.attempts,
                worker = %self.worker_id,
                "job claimed"
            );
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, tenant: TenantId, action: &str) -> Candidate {
        Candidate {
            job_id: JobId::new(id),
            tenant_id: tenant,
            marketplace: "ebay".into(),
            action_code: action.into(),
            rate_limit: Duration::ZERO,
            last_started_at: None,
        }
    }

    #[test]
    fn respects_order_and_tenant_ceiling() {
        let a = TenantId::new();
        let b = TenantId::new();
        let candidates = vec![
            candidate(1, a, "publish"),
            candidate(2, a, "publish"),
            candidate(3, b, "publish"),
        ];
        let limits = ClaimLimits { global: 10, per_tenant: 1 };

        let planned = plan_claims(&candidates, &InFlight::default(), limits, 10, Utc::now());

        assert_eq!(planned, vec![JobId::new(1), JobId::new(3)]);
    }

    #[test]
    fn counts_jobs_already_in_flight() {
        let a = TenantId::new();
        let mut in_flight = InFlight::default();
        in_flight.global = 9;
        in_flight.per_tenant.insert(a, 2);
        let candidates = vec![candidate(1, a, "publish"), candidate(2, TenantId::new(), "publish")];

        let planned = plan_claims(
            &candidates,
            &in_flight,
            ClaimLimits { global: 10, per_tenant: 2 },
            5,
            Utc::now(),
        );

        assert_eq!(planned, vec![JobId::new(2)]);
        assert_eq!(in_flight.tenant(&a), 2);
    }

    #[test]
    fn never_exceeds_requested_slots() {
        let candidates: Vec<_> = (1..=5).map(|i| candidate(i, TenantId::new(), "sync")).collect();

        let planned = plan_claims(&candidates, &InFlight::default(), ClaimLimits::default(), 2, Utc::now());

        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn rate_limited_key_is_skipped_not_reordered() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let mut limited = candidate(1, tenant, "sync");
        limited.rate_limit = Duration::from_secs(2);
        limited.last_started_at = Some(now - chrono::Duration::milliseconds(1500));
        let other = candidate(2, tenant, "publish");

        let planned = plan_claims(&[limited.clone(), other], &InFlight::default(), ClaimLimits::default(), 5, now);
        assert_eq!(planned, vec![JobId::new(2)]);

        let later = now + chrono::Duration::milliseconds(500);
        let planned = plan_claims(&[limited], &InFlight::default(), ClaimLimits::default(), 5, later);
        assert_eq!(planned, vec![JobId::new(1)]);
    }

    #[test]
    fn same_pass_counts_as_a_start_for_rate_limits() {
        let tenant = TenantId::new();
        let mut first = candidate(1, tenant, "sync");
        first.rate_limit = Duration::from_secs(2);
        let mut second = candidate(2, tenant, "sync");
        second.rate_limit = Duration::from_secs(2);
        let mut other_tenant = candidate(3, TenantId::new(), "sync");
        other_tenant.rate_limit = Duration::from_secs(2);

        let planned = plan_claims(
            &[first, second, other_tenant],
            &InFlight::default(),
            ClaimLimits::default(),
            5,
            Utc::now(),
        );

        assert_eq!(planned, vec![JobId::new(1), JobId::new(3)]);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: a plan never pushes any tenant or the whole system past its ceiling.
            #[test]
            fn plan_respects_ceilings(
                tenants in proptest::collection::vec(0usize..4, 0..40),
                running in proptest::collection::vec(0u32..4, 4),
                global in 0u32..20,
                per_tenant in 1u32..4,
                slots in 0usize..20,
            ) {
                let ids: Vec<TenantId> = (0..4).map(|_| TenantId::new()).collect();
                let candidates: Vec<_> = tenants
                    .iter()
                    .enumerate()
                    .map(|(i, t)| candidate(i as i64 + 1, ids[*t], "publish"))
                    .collect();
                let mut in_flight = InFlight::default();
                for (tenant, n) in ids.iter().zip(&running) {
                    in_flight.per_tenant.insert(*tenant, *n);
                    in_flight.global += n;
                }
                let limits = ClaimLimits { global, per_tenant };

                let planned = plan_claims(&candidates, &in_flight, limits, slots, Utc::now());

                prop_assert!(planned.len() <= slots);
                prop_assert!(in_flight.global + planned.len() as u32 <= global.max(in_flight.global));
                for tenant in &ids {
                    let added = candidates
                        .iter()
                        .filter(|c| planned.contains(&c.job_id) && c.tenant_id == *tenant)
                        .count() as u32;
                    let before = in_flight.tenant(tenant);
                    prop_assert!(added == 0 || before + added <= per_tenant);
                }
            }
        }
    }
}
