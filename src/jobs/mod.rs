//! Job runs: persistence, launching, bounded admission and the job registry.

pub mod controller;
pub mod launcher;
pub mod registry;
pub mod store;

pub use controller::{Admission, ControllerLimits, ControllerStats, JobController, JobTotals};
pub use launcher::{FnLauncher, JobExit, JobLauncher, JobOutput, LaunchedJob, ProcessLauncher};
pub use registry::{run_job, JobContext, JOB_NAMES};
pub use store::{JobOutcome, JobRun, JobRunStore, JobStatus};
