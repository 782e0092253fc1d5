//! Job Runner - executes one registered job
//!
//! Spawned by the admission controller for each admitted run, or run by hand.
//!
//! Usage:
//!   job_runner <job_name> [run_id]
//!
//! With a run id the controller owns the `job_runs` row: the runner marks it
//! running, stores the JSON result and leaves the terminal status to the
//! controller (which reads the exit code). Without one the runner creates its
//! own row and records the outcome itself.
//!
//! Logs go to stdout; stderr carries only the failure message so the
//! controller can store it as the run's error.

use dotenv::dotenv;
use env_logger::{Env, Target};
use ledgerflow::config::RuntimeConfig;
use ledgerflow::db::Database;
use ledgerflow::jobs::registry::{is_registered, run_job, JobContext, JOB_NAMES};
use ledgerflow::jobs::{JobOutcome, JobRunStore, JobStatus};
use log::{error, info};
use std::env;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .init();

    let mut args = env::args().skip(1);
    let Some(job_name) = args.next() else {
        eprintln!("Usage: job_runner <job_name> [run_id]");
        eprintln!("Jobs: {}", JOB_NAMES.join(", "));
        return Ok(ExitCode::from(2));
    };
    let run_id = match args.next() {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| format!("invalid run id: {}", raw))?),
        None => None,
    };

    if !is_registered(&job_name) {
        eprintln!("Unknown job: {}", job_name);
        return Ok(ExitCode::from(2));
    }

    let config = RuntimeConfig::from_env();
    let db = Database::open(&config.db_path)?;
    db.init_schema()?;
    let store = JobRunStore::new(db.clone());

    let (run_id, owns_run) = match run_id {
        Some(id) => (id, false),
        None => (store.create_run(&job_name)?, true),
    };
    store.advance(run_id, JobStatus::Running)?;

    info!("🚀 Running job {}", job_name);
    info!("   ├─ Run: {}", run_id);
    info!("   └─ Database: {}", config.db_path);

    let ctx = JobContext {
        db,
        config,
        run_id: Some(run_id),
    };

    match run_job(&job_name, &ctx).await {
        Ok(result) => {
            store.set_result(run_id, &result)?;
            if owns_run {
                store.finish(run_id, &JobOutcome::Completed { exit_code: 0 })?;
            }
            info!("✅ Job {} finished", job_name);
            println!("{}", result);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("❌ Job {} failed: {}", job_name, e);
            if owns_run {
                store.finish(
                    run_id,
                    &JobOutcome::Failed {
                        error: e.to_string(),
                        exit_code: 1,
                    },
                )?;
            }
            eprintln!("Error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
