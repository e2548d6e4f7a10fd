#![forbid(unsafe_code)]

mod adapters;
mod process;
mod render;
mod worker;

use adapters::ToolsConfig;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use sm_core::ids::{JobId, WorkerId};
use sm_core::model::Phase;
use sm_pipeline::PipelineError;
use sm_pipeline::api::{PipelineApi, SubmitRequest};
use sm_pipeline::clock::{Clock, SystemClock};
use sm_pipeline::config::PipelineConfig;
use sm_pipeline::orchestrator::Orchestrator;
use sm_pipeline::services::{ProgressSink, TracingProgressSink};
use sm_pipeline::{SharedStore, shared_store};
use sm_storage::{SqliteStore, StoreError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::WorkerOptions;

#[derive(Debug, thiserror::Error)]
pub(crate) enum RunnerError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Pipeline(PipelineError::UnknownJob(_)) => "UNKNOWN_ID",
            Self::Pipeline(PipelineError::InvalidInput(_)) | Self::InvalidInput(_) => {
                "INVALID_INPUT"
            }
            Self::Pipeline(PipelineError::Store(err)) | Self::Store(err) => match err {
                StoreError::UnknownId => "UNKNOWN_ID",
                StoreError::InvalidInput(_) => "INVALID_INPUT",
                StoreError::JobTerminal { .. } => "JOB_TERMINAL",
                StoreError::LeaseHeld { .. } => "LEASE_HELD",
                _ => "STORE_ERROR",
            },
            Self::Pipeline(PipelineError::Config(_)) | Self::Config(_) => "CONFIG",
            Self::Pipeline(_) => "PIPELINE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "sm_runner", version, about = "Site migration job runner")]
struct Cli {
    /// Directory holding the job database.
    #[arg(long, env = "SM_STORAGE_DIR", default_value = ".sm", global = true)]
    storage_dir: PathBuf,

    /// Pipeline configuration (YAML). Built-in defaults apply when omitted.
    #[arg(long, env = "SM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue a new migration job.
    Submit {
        source_url: String,
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        instructions: Option<String>,
    },
    /// Print a job with its attempts, manifest, gate results, assets and events.
    Status {
        job_id: String,
        /// Only events with a sequence number above this one.
        #[arg(long, default_value_t = 0)]
        events_after: i64,
    },
    /// Cancel a job, or flag it for cancellation when a worker holds it.
    Cancel { job_id: String },
    /// Rewind a job to an earlier phase and start a new migration attempt.
    Invalidate {
        job_id: String,
        #[arg(long)]
        from_phase: String,
    },
    /// Claim and drive queued jobs.
    Work {
        /// YAML file naming the collaborator commands.
        #[arg(long, env = "SM_TOOLS")]
        tools: PathBuf,
        #[arg(long, env = "SM_WORKER_ID")]
        worker_id: Option<String>,
        #[arg(long, env = "SM_POLL_MS", default_value_t = 1_000)]
        poll_ms: u64,
        /// Exit as soon as nothing is claimable.
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 5)]
        max_failures: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, RunnerError> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn open_store(storage_dir: &Path) -> Result<SharedStore, RunnerError> {
    Ok(shared_store(SqliteStore::open(storage_dir)?))
}

fn parse_job_id(raw: &str) -> Result<JobId, RunnerError> {
    JobId::try_new(raw).map_err(|e| RunnerError::InvalidInput(e.message().to_string()))
}

fn parse_phase(raw: &str) -> Result<Phase, RunnerError> {
    Phase::parse(raw).ok_or_else(|| RunnerError::InvalidInput(format!("unknown phase: {raw}")))
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

fn run(cli: Cli) -> Result<Value, RunnerError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let progress: Arc<dyn ProgressSink> = Arc::new(TracingProgressSink);
    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&cli.storage_dir)?;
    let api = PipelineApi::new(store.clone(), clock.clone()).with_progress(progress.clone());

    match cli.command {
        Command::Submit {
            source_url,
            project_id,
            user_id,
            instructions,
        } => {
            let job = api.submit_job(SubmitRequest {
                source_url,
                project_id,
                user_id,
                instructions,
            })?;
            tracing::info!(job_id = %job.id, "job submitted");
            Ok(render::job(&job))
        }
        Command::Status {
            job_id,
            events_after,
        } => {
            let status = api.get_job_status(&parse_job_id(&job_id)?, events_after)?;
            Ok(render::status(&status))
        }
        Command::Cancel { job_id } => Ok(render::job(&api.cancel_job(&parse_job_id(&job_id)?)?)),
        Command::Invalidate { job_id, from_phase } => {
            let job_id = parse_job_id(&job_id)?;
            let job = api.invalidate_job(&job_id, parse_phase(&from_phase)?)?;
            Ok(render::job(&job))
        }
        Command::Work {
            tools,
            worker_id,
            poll_ms,
            once,
            max_failures,
        } => {
            let tools = ToolsConfig::load(&tools)?;
            let worker_id = WorkerId::try_new(worker_id.unwrap_or_else(default_worker_id))
                .map_err(|e| RunnerError::InvalidInput(e.message().to_string()))?;
            let orchestrator = Orchestrator::new(
                store,
                tools.services(progress),
                Arc::new(config),
                clock.clone(),
                worker_id,
            );
            let options = WorkerOptions {
                poll: Duration::from_millis(poll_ms.max(1)),
                once,
                max_failures,
            };
            let stats = worker::run(&orchestrator, clock.as_ref(), &options)?;
            Ok(json!({
                "worker_id": orchestrator.worker_id().as_str(),
                "claims": stats.claims,
                "completed": stats.completed,
                "failed": stats.failed,
                "cancelled": stats.cancelled,
                "requeued": stats.requeued,
                "lease_lost": stats.lease_lost,
            }))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run(cli) {
        Ok(value) => {
            println!("{value:#}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            println!(
                "{:#}",
                json!({ "error": { "code": err.code(), "message": err.to_string() } })
            );
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn phases_parse_case_insensitively() {
        assert_eq!(parse_phase("verify").expect("phase"), Phase::Verify);
        assert!(matches!(parse_phase("ship"), Err(RunnerError::InvalidInput(_))));
        assert!(matches!(parse_job_id("JOB-1"), Err(RunnerError::InvalidInput(_))));
    }

    #[test]
    fn store_errors_map_to_stable_codes() {
        let err = RunnerError::from(PipelineError::Store(StoreError::LeaseHeld {
            job_id: "MIG-0001".to_string(),
            holder: "w1".to_string(),
            expires_at_ms: 10,
        }));
        assert_eq!(err.code(), "LEASE_HELD");
        assert_eq!(RunnerError::Config("x".to_string()).code(), "CONFIG");
    }
}
