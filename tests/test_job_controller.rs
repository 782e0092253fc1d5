//! Controller driving real child processes.

#![cfg(unix)]

mod common;

use common::create_test_db;
use ledgerflow::jobs::{
    Admission, ControllerLimits, JobController, JobRunStore, JobStatus, ProcessLauncher,
};
use std::sync::Arc;
use std::time::Duration;

const SCRIPT: &str = r#"
case "$0" in
  good) echo "working on run $1" ;;
  slow) sleep 0.2; echo done ;;
  bad) echo boom >&2; exit 3 ;;
  *) echo "unknown job $0" >&2; exit 2 ;;
esac
"#;

fn shell_launcher() -> Arc<ProcessLauncher> {
    Arc::new(ProcessLauncher::new("sh").with_args(vec!["-c".to_string(), SCRIPT.to_string()]))
}

async fn wait_idle(controller: &Arc<JobController>) {
    tokio::time::timeout(Duration::from_secs(10), controller.wait_idle())
        .await
        .expect("jobs did not finish in time");
}

#[tokio::test]
async fn test_exit_status_becomes_run_outcome() {
    let (_dir, db) = create_test_db();
    let store = JobRunStore::new(db);
    let controller = JobController::new(
        ControllerLimits {
            max_running: 2,
            max_queued: 2,
        },
        store.clone(),
        shell_launcher(),
    );

    let good = store.create_run("good").unwrap();
    let bad = store.create_run("bad").unwrap();
    assert_eq!(controller.admit("good", good), Admission::Running);
    assert_eq!(controller.admit("bad", bad), Admission::Running);
    wait_idle(&controller).await;

    let good_run = store.get_run(good).unwrap().unwrap();
    assert_eq!(good_run.status, JobStatus::Completed);
    assert_eq!(good_run.exit_code, Some(0));
    assert!(good_run.finished_at.is_some());

    let bad_run = store.get_run(bad).unwrap().unwrap();
    assert_eq!(bad_run.status, JobStatus::Failed);
    assert_eq!(bad_run.exit_code, Some(3));
    assert_eq!(bad_run.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_queued_runs_execute_after_running_ones() {
    let (_dir, db) = create_test_db();
    let store = JobRunStore::new(db);
    let controller = JobController::new(
        ControllerLimits {
            max_running: 1,
            max_queued: 1,
        },
        store.clone(),
        shell_launcher(),
    );

    let first = store.create_run("slow").unwrap();
    let second = store.create_run("good").unwrap();
    let third = store.create_run("good").unwrap();
    assert_eq!(controller.admit("slow", first), Admission::Running);
    assert_eq!(controller.admit("good", second), Admission::Queued);
    assert_eq!(controller.admit("good", third), Admission::Rejected);
    assert_eq!(
        store.get_run(second).unwrap().unwrap().status,
        JobStatus::Queued
    );
    assert_eq!(controller.snapshot().dropped, 1);

    wait_idle(&controller).await;

    let first_run = store.get_run(first).unwrap().unwrap();
    let second_run = store.get_run(second).unwrap().unwrap();
    assert_eq!(first_run.status, JobStatus::Completed);
    assert_eq!(second_run.status, JobStatus::Completed);
    assert!(second_run.finished_at >= first_run.finished_at);
    // Rejected runs are left for the submitter to close out.
    assert_eq!(
        store.get_run(third).unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn test_missing_binary_fails_run() {
    let (_dir, db) = create_test_db();
    let store = JobRunStore::new(db);
    let controller = JobController::new(
        ControllerLimits::default(),
        store.clone(),
        Arc::new(ProcessLauncher::new("/nonexistent/job_runner")),
    );

    let run_id = store.create_run("good").unwrap();
    controller.admit("good", run_id);
    wait_idle(&controller).await;

    let run = store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, JobStatus::Failed);
    assert_eq!(run.exit_code, Some(-1));
    assert!(run.error.unwrap().starts_with("Unexpected error"));
}
