//! Action registry: per (marketplace, action code) execution policy.
//!
//! The registry is an immutable map loaded at startup. A reload builds a new
//! map and swaps it in atomically; readers holding the previous snapshot keep
//! using it until they drop it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Registry lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub marketplace: String,
    pub action_code: String,
}

impl ActionKey {
    pub fn new(marketplace: impl Into<String>, action_code: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.into(),
            action_code: action_code.into(),
        }
    }
}

impl core::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.marketplace, self.action_code)
    }
}

/// Execution policy of one marketplace action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPolicy {
    pub marketplace: String,
    pub action_code: String,
    /// Lower is served first
    pub priority: i32,
    pub is_batch: bool,
    /// Minimum spacing between starts for the same tenant and action
    pub rate_limit: Duration,
    pub max_retries: u32,
    /// Per-attempt execution timeout
    pub timeout: Duration,
}

impl ActionPolicy {
    pub fn new(marketplace: impl Into<String>, action_code: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.into(),
            action_code: action_code.into(),
            priority: 5,
            is_batch: false,
            rate_limit: Duration::ZERO,
            max_retries: 3,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn batch(mut self) -> Self {
        self.is_batch = true;
        self
    }

    pub fn key(&self) -> ActionKey {
        ActionKey::new(&self.marketplace, &self.action_code)
    }

    /// Claim budget copied onto each job. Always at least one attempt.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown action {action_code} for marketplace {marketplace}")]
    UnknownAction {
        marketplace: String,
        action_code: String,
    },

    #[error("invalid action policy {key}: {reason}")]
    InvalidPolicy { key: ActionKey, reason: String },

    #[error("failed to load action registry: {0}")]
    Source(String),
}

/// Where registry entries come from.
#[async_trait]
pub trait ActionSource: Send + Sync {
    async fn load(&self) -> Result<Vec<ActionPolicy>, RegistryError>;
}

/// Fixed set of policies (tests, embedded defaults).
#[derive(Debug, Clone, Default)]
pub struct StaticActionSource {
    policies: Vec<ActionPolicy>,
}

impl StaticActionSource {
    pub fn new(policies: Vec<ActionPolicy>) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl ActionSource for StaticActionSource {
    async fn load(&self) -> Result<Vec<ActionPolicy>, RegistryError> {
        Ok(self.policies.clone())
    }
}

type PolicyMap = HashMap<ActionKey, Arc<ActionPolicy>>;

/// Cached, atomically swappable action registry.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    entries: RwLock<Arc<PolicyMap>>,
}

impl ActionRegistry {
    pub fn new(policies: Vec<ActionPolicy>) -> Result<Self, RegistryError> {
        Ok(Self {
            entries: RwLock::new(Arc::new(build_map(policies)?)),
        })
    }

    pub async fn load(source: &dyn ActionSource) -> Result<Self, RegistryError> {
        Self::new(source.load().await?)
    }

    /// Look up the policy for an action.
    pub fn resolve(
        &self,
        marketplace: &str,
        action_code: &str,
    ) -> Result<Arc<ActionPolicy>, RegistryError> {
        self.snapshot()
            .get(&ActionKey::new(marketplace, action_code))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAction {
                marketplace: marketplace.to_string(),
                action_code: action_code.to_string(),
            })
    }

    /// Re-read the source and swap the map. On error the current map stays.
    pub async fn reload(&self, source: &dyn ActionSource) -> Result<usize, RegistryError> {
        Ok(self.replace(Self::load(source).await?))
    }

    /// Swap in the map of an already loaded registry.
    pub fn replace(&self, next: ActionRegistry) -> usize {
        let map = next.snapshot();
        let count = map.len();
        *self.entries.write().unwrap() = map;
        tracing::info!(actions = count, "action registry reloaded");
        count
    }

    /// Largest configured per-attempt timeout.
    pub fn max_timeout(&self) -> Duration {
        self.snapshot()
            .values()
            .map(|p| p.timeout)
            .max()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<PolicyMap> {
        Arc::clone(&self.entries.read().unwrap())
    }
}

fn build_map(policies: Vec<ActionPolicy>) -> Result<PolicyMap, RegistryError> {
    let mut map = HashMap::with_capacity(policies.len());
    for policy in policies {
        let key = policy.key();
        if policy.timeout.is_zero() {
            return Err(RegistryError::InvalidPolicy {
                key,
                reason: "timeout must be positive".into(),
            });
        }
        if map.insert(key.clone(), Arc::new(policy)).is_some() {
            return Err(RegistryError::InvalidPolicy {
                key,
                reason: "duplicate entry".into(),
            });
        }
    }
    Ok(map)
}
