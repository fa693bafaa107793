//! Worker configuration loaded from environment variables.
//!
//! Every variable has a default except `DATABASE_URL` and
//! `RELISTER_ACTION_ENDPOINT`. Malformed values are reported as
//! `ConfigError`, never silently replaced by the default.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::claim::ClaimLimits;
use crate::jobs::dispatcher::DispatcherConfig;
use crate::jobs::maintenance::MaintenanceConfig;
use crate::jobs::types::BackoffPolicy;

const SECS_PER_DAY: u64 = 24 * 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(
        "stale threshold {stale_after:?} must exceed the largest action timeout {max_timeout:?}"
    )]
    StaleThresholdTooLow {
        stale_after: Duration,
        max_timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub action_endpoint: String,
    pub dispatcher: DispatcherConfig,
    pub backoff: BackoffPolicy,
    /// Horizon for `expires_at` on new jobs
    pub job_ttl: Duration,
    pub maintenance: MaintenanceConfig,
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database_url = env.required("DATABASE_URL")?;
        let action_endpoint = env
            .required("RELISTER_ACTION_ENDPOINT")?
            .trim_end_matches('/')
            .to_string();

        let worker_id = env
            .get("RELISTER_WORKER_ID")
            .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7()));
        let max_concurrent: usize = env.positive("RELISTER_MAX_CONCURRENT", 8)?;

        let limits = ClaimLimits {
            global: env.positive("RELISTER_GLOBAL_LIMIT", 64)?,
            per_tenant: env.positive("RELISTER_TENANT_LIMIT", 4)?,
        };

        let mut dispatcher = DispatcherConfig::default()
            .with_worker_id(worker_id)
            .with_max_concurrent(max_concurrent)
            .with_poll_interval(Duration::from_millis(env.positive("RELISTER_POLL_INTERVAL_MS", 1000)?))
            .with_limits(limits);
        if let Some(marketplace) = env.get("RELISTER_MARKETPLACE") {
            dispatcher = dispatcher.with_marketplace(marketplace);
        }
        dispatcher.shutdown_grace = Duration::from_secs(env.parse("RELISTER_SHUTDOWN_GRACE_SECS", 30)?);

        let base: u64 = env.parse("RELISTER_BACKOFF_BASE_MS", 1000)?;
        let max: u64 = env.parse("RELISTER_BACKOFF_MAX_MS", 300_000)?;
        if max < base {
            return Err(ConfigError::Invalid {
                key: "RELISTER_BACKOFF_MAX_MS",
                value: max.to_string(),
                reason: format!("must be at least RELISTER_BACKOFF_BASE_MS ({base})"),
            });
        }
        let backoff = BackoffPolicy::exponential(Duration::from_millis(base), Duration::from_millis(max));

        let retention_days: u64 = env.positive("RELISTER_RETENTION_DAYS", 30)?;
        let retention_secs = retention_days
            .checked_mul(SECS_PER_DAY)
            .ok_or_else(|| ConfigError::Invalid {
                key: "RELISTER_RETENTION_DAYS",
                value: retention_days.to_string(),
                reason: "too large".to_string(),
            })?;
        let maintenance = MaintenanceConfig {
            interval: Duration::from_secs(env.positive("RELISTER_MAINTENANCE_INTERVAL_SECS", 60)?),
            stale_after: Duration::from_secs(env.positive("RELISTER_STALE_AFTER_SECS", 3600)?),
            retention: Duration::from_secs(retention_secs),
            ..MaintenanceConfig::default()
        };

        Ok(Self {
            database_url,
            db_max_connections: env.positive("RELISTER_DB_MAX_CONNECTIONS", 10)?,
            action_endpoint,
            dispatcher,
            backoff,
            job_ttl: Duration::from_secs(env.parse("RELISTER_JOB_TTL_SECS", 86_400)?),
            maintenance,
        })
    }

    /// A claim may only be considered stale once no action could still be
    /// running it.
    pub fn validate_stale_threshold(&self, max_timeout: Duration) -> Result<(), ConfigError> {
        let stale_after = self.maintenance.stale_after;
        if stale_after <= max_timeout {
            return Err(ConfigError::StaleThresholdTooLow {
                stale_after,
                max_timeout,
            });
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    /// Like `parse`, but zero is rejected.
    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialEq + Default + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value == T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/relister"),
        ("RELISTER_ACTION_ENDPOINT", "http://clients.internal/"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = load(&REQUIRED).unwrap();

        assert_eq!(config.action_endpoint, "http://clients.internal");
        assert_eq!(config.db_max_connections, 10);
        assert!(config.dispatcher.worker_id.starts_with("worker-"));
        assert_eq!(config.dispatcher.max_concurrent, 8);
        assert_eq!(config.dispatcher.limits, ClaimLimits { global: 64, per_tenant: 4 });
        assert_eq!(config.dispatcher.marketplace, None);
        assert_eq!(config.dispatcher.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.backoff.base_delay, Duration::from_secs(1));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(300));
        assert_eq!(config.job_ttl, Duration::from_secs(86_400));
        assert_eq!(config.maintenance.stale_after, Duration::from_secs(3600));
        assert_eq!(config.maintenance.retention, Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("RELISTER_WORKER_ID", "w-7"),
            ("RELISTER_MARKETPLACE", "vinted"),
            ("RELISTER_TENANT_LIMIT", "1"),
            ("RELISTER_POLL_INTERVAL_MS", "250"),
            ("RELISTER_RETENTION_DAYS", "7"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.dispatcher.worker_id, "w-7");
        assert_eq!(config.dispatcher.marketplace.as_deref(), Some("vinted"));
        assert_eq!(config.dispatcher.limits.per_tenant, 1);
        assert_eq!(config.dispatcher.poll_interval, Duration::from_millis(250));
        assert_eq!(config.maintenance.retention, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn missing_and_malformed_values_are_errors() {
        assert_eq!(
            load(&[("DATABASE_URL", "postgres://x")]).unwrap_err(),
            ConfigError::Missing("RELISTER_ACTION_ENDPOINT")
        );

        let mut vars = REQUIRED.to_vec();
        vars.push(("RELISTER_GLOBAL_LIMIT", "lots"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "RELISTER_GLOBAL_LIMIT", .. }
        ));

        let mut vars = REQUIRED.to_vec();
        vars.push(("RELISTER_MAX_CONCURRENT", "0"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn zero_intervals_and_ceilings_are_rejected() {
        for key in [
            "RELISTER_MAINTENANCE_INTERVAL_SECS",
            "RELISTER_POLL_INTERVAL_MS",
            "RELISTER_TENANT_LIMIT",
            "RELISTER_GLOBAL_LIMIT",
            "RELISTER_STALE_AFTER_SECS",
            "RELISTER_RETENTION_DAYS",
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((key, "0"));
            match load(&vars) {
                Err(ConfigError::Invalid { key: rejected, .. }) => assert_eq!(rejected, key),
                other => panic!("{key}=0 should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn retention_overflow_is_an_error() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RELISTER_RETENTION_DAYS", "18446744073709551615"));

        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "RELISTER_RETENTION_DAYS", .. }
        ));
    }

    #[test]
    fn stale_threshold_must_exceed_every_timeout() {
        let config = load(&REQUIRED).unwrap();

        assert!(config.validate_stale_threshold(Duration::from_secs(120)).is_ok());
        assert!(matches!(
            config.validate_stale_threshold(Duration::from_secs(3600)),
            Err(ConfigError::StaleThresholdTooLow { .. })
        ));
    }
}
