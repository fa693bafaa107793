//! Worker process: connects to Postgres, loads the action registry, and runs
//! the dispatcher, the notification listener and the maintenance scheduler
//! until asked to stop.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;

use relister_core::SystemClock;
use relister_infra::config::WorkerConfig;
use relister_infra::jobs::{
    ActionRegistry, ActionSource, Dispatcher, DispatcherReport, JobExecutor, JobService, MaintenanceScheduler,
    PgJobListener, PostgresActionSource, PostgresJobStore, WakeSignal,
};

use crate::http_executor::HttpActionExecutor;

/// Load the source once, check it against the stale threshold, and swap that
/// same map in.
async fn reload_checked(
    registry: &ActionRegistry,
    source: &dyn ActionSource,
    config: &WorkerConfig,
) -> anyhow::Result<usize> {
    let candidate = ActionRegistry::load(source).await?;
    config.validate_stale_threshold(candidate.max_timeout())?;
    Ok(registry.replace(candidate))
}

pub struct Worker {
    config: WorkerConfig,
    pool: PgPool,
    store: Arc<PostgresJobStore>,
    actions: PostgresActionSource,
    registry: Arc<ActionRegistry>,
}

impl Worker {
    /// Connect, create the schema if needed and load the action registry.
    ///
    /// Refuses to start when the stale threshold does not exceed every action
    /// timeout.
    pub async fn connect(config: WorkerConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;

        let store = Arc::new(PostgresJobStore::new(pool.clone()));
        store.ensure_schema().await.context("failed to apply schema")?;

        let actions = PostgresActionSource::new(pool.clone());
        let registry = Arc::new(
            ActionRegistry::load(&actions)
                .await
                .context("failed to load action registry")?,
        );
        if registry.is_empty() {
            tracing::warn!("action registry is empty; every enqueue will be rejected");
        }
        config.validate_stale_threshold(registry.max_timeout())?;

        tracing::info!(
            worker = %config.dispatcher.worker_id,
            actions = registry.len(),
            max_concurrent = config.dispatcher.max_concurrent,
            "worker connected"
        );

        Ok(Self {
            config,
            pool,
            store,
            actions,
            registry,
        })
    }

    /// Producer and operator surface sharing this worker's pool and registry.
    pub fn job_service(&self) -> JobService {
        JobService::new(self.registry.clone(), self.store.clone()).with_job_ttl(self.config.job_ttl)
    }

    /// Re-read the action registry. The old map stays if loading fails or the
    /// new timeouts would make stale recovery unsafe.
    pub async fn reload_actions(&self) -> anyhow::Result<usize> {
        reload_checked(&self.registry, &self.actions, &self.config).await
    }

    /// Run until `shutdown` resolves, then drain in-flight jobs for the
    /// configured grace period.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<DispatcherReport>
    where
        F: Future<Output = ()>,
    {
        let actions = HttpActionExecutor::new(self.config.action_endpoint.clone())
            .context("failed to build HTTP client")?;
        let executor = JobExecutor::new(
            self.store.clone(),
            Arc::new(actions),
            self.config.backoff.clone(),
            Arc::new(SystemClock),
        );

        let (stop, stop_rx) = watch::channel(false);
        let wake = WakeSignal::new();
        let listener = PgJobListener::new(self.pool.clone(), wake.clone()).spawn(stop_rx.clone());
        let maintenance =
            MaintenanceScheduler::new(self.store.clone(), self.config.maintenance.clone()).spawn(stop_rx);
        let dispatcher =
            Dispatcher::new(self.config.dispatcher.clone(), self.store.clone(), executor, wake).spawn();

        tokio::pin!(shutdown);
        let mut reload = reload_signal()?;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(()) = reload.recv() => match self.reload_actions().await {
                    Ok(count) => tracing::info!(actions = count, "reload requested"),
                    Err(err) => tracing::error!(error = %err, "action registry reload rejected"),
                },
            }
        }

        tracing::info!(
            grace_secs = self.config.dispatcher.shutdown_grace.as_secs(),
            "shutdown requested, draining in-flight jobs"
        );
        let report = dispatcher.shutdown(self.config.dispatcher.shutdown_grace).await;
        let _ = stop.send(true);
        let _ = tokio::join!(listener, maintenance);
        self.pool.close().await;

        tracing::info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            requeued = report.requeued,
            abandoned = report.abandoned,
            "worker stopped"
        );
        Ok(report)
    }
}

/// Yields once per SIGHUP. Never yields on platforms without signals.
#[cfg(unix)]
fn reload_signal() -> anyhow::Result<tokio::sync::mpsc::Receiver<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
fn reload_signal() -> anyhow::Result<tokio::sync::mpsc::Receiver<()>> {
    // A closed channel disables the reload branch.
    let (_, rx) = tokio::sync::mpsc::channel(1);
    Ok(rx)
}

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
