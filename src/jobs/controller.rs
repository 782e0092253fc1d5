//! Job concurrency controller
//!
//! Admits named job runs under two caps:
//! - at most `max_running` executions at once
//! - at most `max_queued` runs waiting; anything beyond that is rejected and
//!   counted in `dropped`
//!
//! When a running job finishes, the oldest queued run is promoted. The counter
//! lock is a plain `std::sync::Mutex` and is never held across an await.
//!
//! Finished runs are also tallied per job name (runs, failures, durations).

use super::launcher::{JobExit, JobLauncher, OutputStream};
use super::store::{JobOutcome, JobRunStore, JobStatus};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerLimits {
    pub max_running: usize,
    pub max_queued: usize,
}

impl Default for ControllerLimits {
    fn default() -> Self {
        Self {
            max_running: 20,
            max_queued: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Running,
    Queued,
    Rejected,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Finished-run totals for one job name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobTotals {
    pub runs: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub last_duration: Duration,
}

impl JobTotals {
    fn record(&mut self, failed: bool, duration: Duration) {
        self.runs += 1;
        if failed {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.last_duration = duration;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub running: usize,
    pub queued: usize,
    pub dropped: u64,
    /// Keyed by job name; only runs that reached an outcome are counted.
    pub jobs: BTreeMap<String, JobTotals>,
}

impl ControllerStats {
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.queued == 0
    }
}

#[derive(Debug)]
struct QueuedJob {
    job_name: String,
    run_id: i64,
}

#[derive(Debug, Default)]
struct ControllerState {
    running: usize,
    queue: VecDeque<QueuedJob>,
    dropped: u64,
    jobs: BTreeMap<String, JobTotals>,
}

impl ControllerState {
    fn stats(&self) -> ControllerStats {
        ControllerStats {
            running: self.running,
            queued: self.queue.len(),
            dropped: self.dropped,
            jobs: self.jobs.clone(),
        }
    }
}

pub struct JobController {
    limits: ControllerLimits,
    state: Mutex<ControllerState>,
    store: JobRunStore,
    launcher: Arc<dyn JobLauncher>,
    stats_tx: watch::Sender<ControllerStats>,
}

impl JobController {
    pub fn new(
        limits: ControllerLimits,
        store: JobRunStore,
        launcher: Arc<dyn JobLauncher>,
    ) -> Arc<Self> {
        let (stats_tx, _) = watch::channel(ControllerStats::default());
        Arc::new(Self {
            limits,
            state: Mutex::new(ControllerState::default()),
            store,
            launcher,
            stats_tx,
        })
    }

    pub fn limits(&self) -> ControllerLimits {
        self.limits
    }

    /// Admit a run that already has a `job_runs` row.
    ///
    /// Must be called from within a tokio runtime: a `Running` admission
    /// spawns the supervising task immediately.
    pub fn admit(self: &Arc<Self>, job_name: &str, run_id: i64) -> Admission {
        let admission = {
            let mut state = self.lock();
            let admission = if state.running < self.limits.max_running {
                state.running += 1;
                Admission::Running
            } else if state.queue.len() < self.limits.max_queued {
                state.queue.push_back(QueuedJob {
                    job_name: job_name.to_string(),
                    run_id,
                });
                Admission::Queued
            } else {
                state.dropped += 1;
                Admission::Rejected
            };
            self.publish(&state);
            admission
        };

        match admission {
            Admission::Running => self.start(job_name.to_string(), run_id),
            Admission::Queued => {
                log::info!("⏳ Queued {} (run {})", job_name, run_id);
                self.advance(run_id, JobStatus::Queued);
            }
            Admission::Rejected => {
                log::warn!(
                    "🚫 Rejected {} (run {}): {} running, queue full",
                    job_name,
                    run_id,
                    self.limits.max_running
                );
            }
        }
        admission
    }

    /// Release one running slot and promote the oldest queued run.
    pub fn on_finish(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            let next = state.queue.pop_front();
            if next.is_some() {
                state.running += 1;
            }
            self.publish(&state);
            next
        };

        if let Some(job) = next {
            log::info!("⬆️  Promoting {} (run {}) from queue", job.job_name, job.run_id);
            self.start(job.job_name, job.run_id);
        }
    }

    pub fn snapshot(&self) -> ControllerStats {
        self.lock().stats()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStats> {
        self.stats_tx.subscribe()
    }

    /// Resolve once nothing is running or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stats| stats.is_idle()).await;
    }

    fn start(self: &Arc<Self>, job_name: String, run_id: i64) {
        self.advance(run_id, JobStatus::Running);
        let slot = SlotGuard(Arc::clone(self));
        tokio::spawn(async move {
            slot.0.supervise(&job_name, run_id).await;
            drop(slot);
        });
    }

    /// Run one job to completion and record how it ended.
    async fn supervise(&self, job_name: &str, run_id: i64) {
        let started = Instant::now();
        log::info!("▶️  Starting {} (run {})", job_name, run_id);

        let outcome = match self.launcher.launch(job_name, run_id) {
            Ok(mut job) => {
                let mut diagnostics = String::new();
                while let Some(line) = job.output.recv().await {
                    match line.stream {
                        OutputStream::Stdout => {
                            log::info!("   [{} #{}] {}", job_name, run_id, line.line)
                        }
                        OutputStream::Stderr => {
                            log::warn!("   [{} #{}] {}", job_name, run_id, line.line);
                            diagnostics.push_str(&line.line);
                            diagnostics.push('\n');
                        }
                    }
                }
                let exit = job.completion.await.unwrap_or(JobExit::failed(-1));
                outcome_for(exit, &diagnostics)
            }
            Err(e) => {
                log::error!("❌ Failed to start {} (run {}): {}", job_name, run_id, e);
                JobOutcome::Failed {
                    error: format!("Unexpected error: {}", e),
                    exit_code: -1,
                }
            }
        };

        let elapsed = started.elapsed();
        match &outcome {
            JobOutcome::Completed { .. } => log::info!(
                "✅ {} (run {}) completed in {:.2}s",
                job_name,
                run_id,
                elapsed.as_secs_f64()
            ),
            JobOutcome::Failed { exit_code, .. } => log::error!(
                "❌ {} (run {}) failed with exit code {} after {:.2}s",
                job_name,
                run_id,
                exit_code,
                elapsed.as_secs_f64()
            ),
        }
        self.tally(job_name, &outcome, elapsed);

        if let Err(e) = self.store.finish(run_id, &outcome) {
            log::error!("❌ Failed to record outcome for run {}: {}", run_id, e);
        }
    }

    fn tally(&self, job_name: &str, outcome: &JobOutcome, elapsed: Duration) {
        let mut state = self.lock();
        state
            .jobs
            .entry(job_name.to_string())
            .or_default()
            .record(matches!(outcome, JobOutcome::Failed { .. }), elapsed);
        self.publish(&state);
    }

    fn advance(&self, run_id: i64, status: JobStatus) {
        if let Err(e) = self.store.advance(run_id, status) {
            log::error!("❌ Failed to mark run {} as {}: {}", run_id, status, e);
        }
    }

    fn publish(&self, state: &ControllerState) {
        self.stats_tx.send_replace(state.stats());
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn outcome_for(exit: JobExit, diagnostics: &str) -> JobOutcome {
    if exit.success {
        return JobOutcome::Completed { exit_code: exit.code };
    }
    let diagnostics = diagnostics.trim();
    let error = if diagnostics.is_empty() {
        format!("Job failed with exit code {}", exit.code)
    } else {
        diagnostics.to_string()
    };
    JobOutcome::Failed {
        error,
        exit_code: exit.code,
    }
}

/// Holds one running slot; releasing it (even while unwinding) calls
/// `on_finish` exactly once.
struct SlotGuard(Arc<JobController>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.on_finish();
    }
}
