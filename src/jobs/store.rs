//! `job_runs` persistence
//!
//! Status only moves forward (pending → queued → running → completed|failed).
//! Every update carries the rank guard in its WHERE clause, so a late or
//! out-of-order write can never pull a run back to an earlier state.

use crate::db::{now_millis, Database};
use crate::error::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL expression giving the rank of the stored status.
const STATUS_RANK: &str = "CASE status
    WHEN 'pending' THEN 0
    WHEN 'queued' THEN 1
    WHEN 'running' THEN 2
    ELSE 3 END";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub job_name: String,
    pub status: JobStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { exit_code: i32 },
    Failed { error: String, exit_code: i32 },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Clone)]
pub struct JobRunStore {
    db: Database,
}

impl JobRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new pending run and return its id.
    pub fn create_run(&self, job_name: &str) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_runs (job_name, status, started_at) VALUES (?1, 'pending', ?2)",
                params![job_name, now_millis()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Move a run forward to `status`. Returns false when the run is missing
    /// or already at or past that status.
    pub fn advance(&self, run_id: i64, status: JobStatus) -> Result<bool> {
        let sql = format!(
            "UPDATE job_runs SET status = ?2, started_at = CASE WHEN ?2 = 'running' THEN ?4 ELSE started_at END
             WHERE id = ?1 AND {STATUS_RANK} < ?3"
        );
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &sql,
                params![run_id, status.as_str(), status.rank(), now_millis()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record the terminal status. A run that is already terminal is left alone.
    pub fn finish(&self, run_id: i64, outcome: &JobOutcome) -> Result<bool> {
        let (error, exit_code) = match outcome {
            JobOutcome::Completed { exit_code } => (None, *exit_code),
            JobOutcome::Failed { error, exit_code } => (Some(error.as_str()), *exit_code),
        };
        let sql = format!(
            "UPDATE job_runs SET status = ?2, finished_at = ?3, error = ?4, exit_code = ?5
             WHERE id = ?1 AND {STATUS_RANK} < 3"
        );
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &sql,
                params![run_id, outcome.status().as_str(), now_millis(), error, exit_code],
            )?;
            Ok(changed > 0)
        })
    }

    /// Store the JSON value a job returned.
    pub fn set_result(&self, run_id: i64, result: &Value) -> Result<()> {
        let text = serde_json::to_string(result)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE job_runs SET result = ?2 WHERE id = ?1",
                params![run_id, text],
            )?;
            Ok(())
        })
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<JobRun>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, job_name, status, started_at, finished_at, result, error, exit_code
                     FROM job_runs WHERE id = ?1",
                    params![run_id],
                    RawRun::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawRun::into_run).transpose()
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<JobRun>> {
        let raw: Vec<RawRun> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_name, status, started_at, finished_at, result, error, exit_code
                 FROM job_runs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], RawRun::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raw.into_iter().map(RawRun::into_run).collect()
    }
}

struct RawRun {
    id: i64,
    job_name: String,
    status: String,
    started_at: i64,
    finished_at: Option<i64>,
    result: Option<String>,
    error: Option<String>,
    exit_code: Option<i32>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_name: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            finished_at: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            exit_code: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<JobRun> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            crate::error::LedgerError::InvalidPayload(format!("job status '{}'", self.status))
        })?;
        let result = match self.result {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(JobRun {
            id: self.id,
            job_name: self.job_name,
            status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result,
            error: self.error,
            exit_code: self.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> JobRunStore {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        JobRunStore::new(db)
    }

    #[test]
    fn test_status_moves_forward_only() {
        let store = test_store();
        let id = store.create_run("rpc-executor-multi").unwrap();
        assert_eq!(store.get_run(id).unwrap().unwrap().status, JobStatus::Pending);

        assert!(store.advance(id, JobStatus::Running).unwrap());
        // Late "queued" write from a racing admission is ignored.
        assert!(!store.advance(id, JobStatus::Queued).unwrap());
        assert_eq!(store.get_run(id).unwrap().unwrap().status, JobStatus::Running);

        assert!(store
            .finish(id, &JobOutcome::Failed { error: "boom".to_string(), exit_code: 1 })
            .unwrap());
        assert!(!store.finish(id, &JobOutcome::Completed { exit_code: 0 }).unwrap());
        assert!(!store.advance(id, JobStatus::Running).unwrap());

        let run = store.get_run(id).unwrap().unwrap();
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(run.exit_code, Some(1));
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_result_and_listing() {
        let store = test_store();
        let first = store.create_run("a").unwrap();
        let second = store.create_run("b").unwrap();
        store.set_result(first, &json!({"scheduled": 3})).unwrap();

        assert_eq!(
            store.get_run(first).unwrap().unwrap().result,
            Some(json!({"scheduled": 3}))
        );
        let ids: Vec<i64> = store.recent_runs(10).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second, first]);
        assert!(store.get_run(999).unwrap().is_none());
    }

    #[test]
    fn test_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
