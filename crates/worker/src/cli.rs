//! Command-line surface of the worker binary.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use relister_core::{BatchId, JobId, TenantId};
use relister_infra::jobs::BatchPolicy;

/// Marketplace job dispatcher. Runs the worker when no subcommand is given.
#[derive(Parser, Debug)]
#[command(name = "relister-worker", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Claim and execute jobs until SIGINT or SIGTERM
    Run,
    /// Enqueue one job
    Enqueue {
        tenant_id: TenantId,
        marketplace: String,
        action_code: String,
        target_id: Option<i64>,
        /// Attach the job to an open batch
        #[arg(long = "batch")]
        batch_id: Option<BatchId>,
    },
    /// Open a new batch
    CreateBatch {
        tenant_id: TenantId,
        /// fail_fast or best_effort
        #[arg(default_value = "fail_fast")]
        policy: BatchPolicy,
    },
    /// Show one job
    Job { job_id: JobId },
    /// Show one batch with its counters
    Batch { batch_id: BatchId },
    /// List a tenant's PENDING jobs in claim order
    Pending { tenant_id: TenantId },
    /// Daily completion stats; defaults to today (UTC)
    Stats {
        tenant_id: TenantId,
        day: Option<NaiveDate>,
    },
    /// Cancel a PENDING job
    CancelJob { job_id: JobId },
    /// Close a batch and cancel its PENDING children
    CancelBatch { batch_id: BatchId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Command, clap::Error> {
        let argv = std::iter::once("relister-worker").chain(args.iter().copied());
        Cli::try_parse_from(argv).map(Cli::into_command)
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_runs_the_worker() {
        assert_eq!(parse(&[]).unwrap(), Command::Run);
        assert_eq!(parse(&["run"]).unwrap(), Command::Run);
    }

    #[test]
    fn enqueue_accepts_optional_target_and_batch() {
        let tenant = TenantId::new();
        let t = tenant.to_string();

        assert_eq!(
            parse(&["enqueue", &t, "ebay", "publish", "17", "--batch", "3"]).unwrap(),
            Command::Enqueue {
                tenant_id: tenant,
                marketplace: "ebay".into(),
                action_code: "publish".into(),
                target_id: Some(17),
                batch_id: Some(BatchId::new(3)),
            }
        );
        assert!(matches!(
            parse(&["enqueue", &t, "ebay", "sync"]).unwrap(),
            Command::Enqueue { target_id: None, batch_id: None, .. }
        ));
    }

    #[test]
    fn create_batch_defaults_to_fail_fast() {
        let t = TenantId::new().to_string();

        assert!(matches!(
            parse(&["create-batch", &t]).unwrap(),
            Command::CreateBatch { policy: BatchPolicy::FailFast, .. }
        ));
        assert!(matches!(
            parse(&["create-batch", &t, "best_effort"]).unwrap(),
            Command::CreateBatch { policy: BatchPolicy::BestEffort, .. }
        ));
    }

    #[test]
    fn stats_day_is_optional() {
        let tenant = TenantId::new();
        let t = tenant.to_string();

        assert_eq!(
            parse(&["stats", &t, "2026-10-19"]).unwrap(),
            Command::Stats {
                tenant_id: tenant,
                day: NaiveDate::from_ymd_opt(2026, 10, 19),
            }
        );
        assert_eq!(parse(&["stats", &t]).unwrap(), Command::Stats { tenant_id: tenant, day: None });
    }

    #[test]
    fn bad_input_is_reported() {
        assert_eq!(parse(&["job"]).unwrap_err().kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(parse(&["job", "0"]).unwrap_err().kind(), ErrorKind::ValueValidation);
        assert_eq!(parse(&["pending", "not-a-uuid"]).unwrap_err().kind(), ErrorKind::ValueValidation);
        assert_eq!(parse(&["cancel-job", "4", "5"]).unwrap_err().kind(), ErrorKind::UnknownArgument);
        assert_eq!(parse(&["explode"]).unwrap_err().kind(), ErrorKind::InvalidSubcommand);
    }
}
