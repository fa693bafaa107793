use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use serde::Serialize;

use relister_infra::config::WorkerConfig;
use relister_infra::jobs::CancelOutcome;
use relister_worker::cli::{Cli, Command};
use relister_worker::runtime::{shutdown_signal, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relister_observability::init();

    let command = Cli::parse().into_command();
    let config = WorkerConfig::from_env().context("invalid configuration")?;
    let worker = Worker::connect(config).await?;

    if command == Command::Run {
        worker.run(shutdown_signal()).await?;
        return Ok(());
    }

    let service = worker.job_service();
    match command {
        Command::Run => {}
        Command::Enqueue {
            tenant_id,
            marketplace,
            action_code,
            target_id,
            batch_id,
        } => {
            let job = service
                .enqueue(tenant_id, &marketplace, &action_code, target_id, batch_id)
                .await?;
            print_json(&job)?;
        }
        Command::CreateBatch { tenant_id, policy } => {
            print_json(&service.create_batch(tenant_id, policy).await?)?;
        }
        Command::Job { job_id } => print_json(&service.get_job(job_id).await?)?,
        Command::Batch { batch_id } => print_json(&service.get_batch(batch_id).await?)?,
        Command::Pending { tenant_id } => print_json(&service.list_pending(tenant_id).await?)?,
        Command::Stats { tenant_id, day } => {
            let day = day.unwrap_or_else(|| Utc::now().date_naive());
            print_json(&service.daily_stats(tenant_id, day).await?)?;
        }
        Command::CancelJob { job_id } => match service.cancel_job(job_id).await? {
            CancelOutcome::Cancelled(job) => print_json(&job)?,
            CancelOutcome::InFlight(job) => {
                tracing::warn!(job_id = %job.id, "job is in flight and cannot be cancelled");
                print_json(&job)?;
            }
            CancelOutcome::AlreadyFinished(job) => {
                tracing::info!(job_id = %job.id, status = %job.status, "job already finished");
                print_json(&job)?;
            }
        },
        Command::CancelBatch { batch_id } => {
            let cancellation = service.cancel_batch(batch_id).await?;
            print_json(&cancellation.batch)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
