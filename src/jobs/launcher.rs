//! Starting job executions
//!
//! The controller only sees a [`LaunchedJob`]: a stream of output lines and a
//! completion signal. [`ProcessLauncher`] runs each job as a child process of
//! the `job_runner` binary; [`FnLauncher`] runs an async closure in-process.

use crate::error::LaunchError;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobExit {
    pub success: bool,
    pub code: i32,
}

impl JobExit {
    pub fn ok() -> Self {
        Self { success: true, code: 0 }
    }

    pub fn failed(code: i32) -> Self {
        Self { success: false, code }
    }
}

/// Handle to a started job. `output` closes once the job has no more output;
/// `completion` resolves with the exit status.
pub struct LaunchedJob {
    pub output: mpsc::UnboundedReceiver<OutputLine>,
    pub completion: oneshot::Receiver<JobExit>,
}

/// Capability to start a named job for a run id.
///
/// Called from inside the tokio runtime; implementations may spawn tasks.
pub trait JobLauncher: Send + Sync {
    fn launch(&self, job_name: &str, run_id: i64) -> Result<LaunchedJob, LaunchError>;
}

/// Spawns `<program> [args...] <job_name> <run_id>` and streams its output.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the job name.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl JobLauncher for ProcessLauncher {
    fn launch(&self, job_name: &str, run_id: i64) -> Result<LaunchedJob, LaunchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(job_name)
            .arg(run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, line_tx));
        }

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => JobExit {
                    success: status.success(),
                    code: status.code().unwrap_or(-1),
                },
                Err(e) => {
                    log::error!("❌ Failed to wait for job process: {}", e);
                    JobExit::failed(-1)
                }
            };
            let _ = done_tx.send(exit);
        });

        Ok(LaunchedJob {
            output: line_rx,
            completion: done_rx,
        })
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(OutputLine { stream, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("⚠️  Error reading job {}: {}", stream.as_str(), e);
                break;
            }
        }
    }
}

/// Sink handed to in-process jobs for their output.
#[derive(Clone)]
pub struct JobOutput {
    tx: mpsc::UnboundedSender<OutputLine>,
}

impl JobOutput {
    pub fn stdout(&self, line: impl Into<String>) {
        self.send(OutputStream::Stdout, line.into());
    }

    pub fn stderr(&self, line: impl Into<String>) {
        self.send(OutputStream::Stderr, line.into());
    }

    fn send(&self, stream: OutputStream, line: String) {
        let _ = self.tx.send(OutputLine { stream, line });
    }
}

type JobFn =
    dyn Fn(String, i64, JobOutput) -> Pin<Box<dyn Future<Output = JobExit> + Send>> + Send + Sync;

/// Runs jobs as tasks inside the current process.
#[derive(Clone)]
pub struct FnLauncher {
    job: Arc<JobFn>,
}

impl FnLauncher {
    pub fn new<F, Fut>(job: F) -> Self
    where
        F: Fn(String, i64, JobOutput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobExit> + Send + 'static,
    {
        Self {
            job: Arc::new(move |name, run_id, output| Box::pin(job(name, run_id, output))),
        }
    }
}

impl JobLauncher for FnLauncher {
    fn launch(&self, job_name: &str, run_id: i64) -> Result<LaunchedJob, LaunchError> {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let fut = (self.job)(job_name.to_string(), run_id, JobOutput { tx: line_tx });

        tokio::spawn(async move {
            // The output sender lives inside `fut`, so the line stream closes
            // when the job future is dropped.
            let exit = fut.await;
            let _ = done_tx.send(exit);
        });

        Ok(LaunchedJob {
            output: line_rx,
            completion: done_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut job: LaunchedJob) -> (Vec<OutputLine>, JobExit) {
        let mut lines = Vec::new();
        while let Some(line) = job.output.recv().await {
            lines.push(line);
        }
        (lines, job.completion.await.unwrap())
    }

    #[tokio::test]
    async fn test_fn_launcher_streams_output_then_exit() {
        let launcher = FnLauncher::new(|name, run_id, out| async move {
            out.stdout(format!("{} started as run {}", name, run_id));
            out.stderr("warning: slow provider");
            JobExit::failed(3)
        });

        let (lines, exit) = collect(launcher.launch("demo", 7).unwrap()).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stream, OutputStream::Stdout);
        assert_eq!(lines[0].line, "demo started as run 7");
        assert_eq!(lines[1].stream, OutputStream::Stderr);
        assert_eq!(exit, JobExit::failed(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_passes_job_and_run_id() {
        let launcher = ProcessLauncher::new("sh").with_args(vec![
            "-c".to_string(),
            "echo \"$0 $1\"; echo oops >&2; exit 2".to_string(),
        ]);

        let (lines, exit) = collect(launcher.launch("demo-job", 42).unwrap()).await;
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.line == "demo-job 42"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.line == "oops"));
        assert_eq!(exit, JobExit::failed(2));
    }

    #[tokio::test]
    async fn test_process_launcher_missing_binary() {
        let launcher = ProcessLauncher::new("/nonexistent/ledgerflow-job-runner");
        assert!(matches!(launcher.launch("demo", 1), Err(LaunchError::Spawn(_))));
    }
}
