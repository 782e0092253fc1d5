//! Admission Runtime - submits configured jobs on a fixed tick
//!
//! Every `ADM_TICK_SECS` each job in `ADM_JOBS` gets a `job_runs` row and is
//! offered to the concurrency controller. Admitted runs execute as
//! `job_runner` child processes; rejected runs are marked failed with a
//! capacity error.
//!
//! Usage:
//!   cargo run --release --bin adm
//!
//! Environment variables:
//!   LEDGERFLOW_DB_PATH - SQLite database path (default: data/ledgerflow.db)
//!   MAX_JOBS_RUNNING / MAX_JOBS_QUEUED - controller caps (default: 20 / 50)
//!   ADM_JOBS - comma-separated job names (default: rpc-executor-multi)
//!   ADM_TICK_SECS - submission interval (default: 60)
//!   JOB_RUNNER_BIN - job runner executable (default: job_runner next to adm)

use dotenv::dotenv;
use ledgerflow::config::RuntimeConfig;
use ledgerflow::db::Database;
use ledgerflow::jobs::registry::is_registered;
use ledgerflow::jobs::{Admission, JobController, JobOutcome, JobRunStore, ProcessLauncher};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

const CAPACITY_ERROR: &str = "Job queue is full (capacity exceeded)";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RuntimeConfig::from_env();
    let (jobs, unknown): (Vec<String>, Vec<String>) =
        config.adm_jobs.iter().cloned().partition(|name| is_registered(name));
    for name in &unknown {
        warn!("⚠️  Ignoring unknown job in ADM_JOBS: {}", name);
    }
    if jobs.is_empty() {
        error!("❌ No runnable jobs configured (ADM_JOBS)");
        return Ok(());
    }

    let runner = config.job_runner_path();
    info!("🚀 Admission runtime");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Jobs: {}", jobs.join(", "));
    info!("   ├─ Tick: {}s", config.adm_tick_secs);
    info!("   ├─ Max running: {}", config.max_jobs_running);
    info!("   ├─ Max queued: {}", config.max_jobs_queued);
    info!("   └─ Runner: {}", runner.display());

    let db = Database::open(&config.db_path)?;
    db.init_schema()?;
    let store = JobRunStore::new(db);
    let controller = JobController::new(
        config.controller_limits(),
        store.clone(),
        Arc::new(ProcessLauncher::new(runner)),
    );

    let mut ticker = interval(Duration::from_secs(config.adm_tick_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for name in &jobs {
                    if let Err(e) = submit(&controller, &store, name) {
                        error!("❌ Failed to submit {}: {}", name, e);
                    }
                }
                let stats = controller.snapshot();
                info!(
                    "📊 Jobs: {} running, {} queued, {} dropped",
                    stats.running, stats.queued, stats.dropped
                );
                for (name, totals) in &stats.jobs {
                    info!(
                        "   ├─ {}: {} runs, {} failed, last {:.1}s, total {:.1}s",
                        name,
                        totals.runs,
                        totals.failures,
                        totals.last_duration.as_secs_f64(),
                        totals.total_duration.as_secs_f64()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested, waiting for running jobs (Ctrl+C again to exit now)");
                break;
            }
        }
    }

    tokio::select! {
        _ = controller.wait_idle() => info!("✅ All jobs finished"),
        _ = tokio::signal::ctrl_c() => warn!("⚠️  Exiting with jobs still running"),
    }
    Ok(())
}

fn submit(
    controller: &Arc<JobController>,
    store: &JobRunStore,
    name: &str,
) -> ledgerflow::Result<()> {
    let run_id = store.create_run(name)?;
    if controller.admit(name, run_id) == Admission::Rejected {
        warn!("🚫 Over quota, dropping {} (run {})", name, run_id);
        store.finish(
            run_id,
            &JobOutcome::Failed {
                error: CAPACITY_ERROR.to_string(),
                exit_code: -1,
            },
        )?;
    }
    Ok(())
}
