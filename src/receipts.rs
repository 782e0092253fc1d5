//! Receipt ledger
//!
//! Append-only idempotency markers. A receipt for (origin, target[, action])
//! means that unit of work is done. Work done under a receipt must be
//! overwrite-idempotent, so a duplicate receipt from a racing process is
//! harmless.

use crate::db::{now_millis, Database};
use crate::error::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target prefix used when the unit of work is a ledger call.
pub const CALL_TARGET_PREFIX: &str = "rpc_call/";

/// Receipt target naming an RPC call.
pub fn call_target(call_id: i64) -> String {
    format!("{}{}", CALL_TARGET_PREFIX, call_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: i64,
    pub origin: String,
    pub target: String,
    pub action: Option<String>,
    pub metadata: Option<Value>,
    pub job_id: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReceipt {
    pub origin: String,
    pub target: String,
    pub action: Option<String>,
    pub metadata: Option<Value>,
    pub job_id: Option<i64>,
}

impl NewReceipt {
    pub fn new(origin: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            target: target.into(),
            action: None,
            metadata: None,
            job_id: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_job_id(mut self, job_id: Option<i64>) -> Self {
        self.job_id = job_id;
        self
    }
}

struct RawReceipt {
    id: i64,
    origin: String,
    target: String,
    action: Option<String>,
    metadata: Option<String>,
    job_id: Option<i64>,
    created_at: i64,
}

impl RawReceipt {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            origin: row.get(1)?,
            target: row.get(2)?,
            action: row.get(3)?,
            metadata: row.get(4)?,
            job_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_receipt(self) -> Result<Receipt> {
        let metadata = match self.metadata {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(Receipt {
            id: self.id,
            origin: self.origin,
            target: self.target,
            action: self.action,
            metadata,
            job_id: self.job_id,
            created_at: self.created_at,
        })
    }
}

#[derive(Clone)]
pub struct ReceiptLedger {
    db: Database,
}

impl ReceiptLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a receipt. Never updates or replaces an existing one.
    pub fn create_receipt(&self, receipt: &NewReceipt) -> Result<Receipt> {
        let metadata = receipt
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let created_at = now_millis();

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO receipts (origin, target, action, metadata, job_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    receipt.origin,
                    receipt.target,
                    receipt.action,
                    metadata,
                    receipt.job_id,
                    created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(Receipt {
            id,
            origin: receipt.origin.clone(),
            target: receipt.target.clone(),
            action: receipt.action.clone(),
            metadata: receipt.metadata.clone(),
            job_id: receipt.job_id,
            created_at,
        })
    }

    /// Whether `origin` has already done `target`.
    ///
    /// `Some(action)` requires a receipt with that action; `None` accepts a
    /// receipt with any action (or none). `RpcLedger::fetch_unprocessed`
    /// applies the same rule.
    pub fn has_processed(&self, origin: &str, target: &str, action: Option<&str>) -> Result<bool> {
        self.db.with_conn(|conn| {
            let exists = match action {
                Some(action) => conn
                    .prepare_cached(
                        "SELECT 1 FROM receipts WHERE origin = ?1 AND target = ?2 AND action = ?3 LIMIT 1",
                    )?
                    .exists(params![origin, target, action])?,
                None => conn
                    .prepare_cached("SELECT 1 FROM receipts WHERE origin = ?1 AND target = ?2 LIMIT 1")?
                    .exists(params![origin, target])?,
            };
            Ok(exists)
        })
    }

    /// Most recent receipt for (origin, target[, action]).
    pub fn latest_receipt(
        &self,
        origin: &str,
        target: &str,
        action: Option<&str>,
    ) -> Result<Option<Receipt>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, origin, target, action, metadata, job_id, created_at
                     FROM receipts
                     WHERE origin = ?1 AND target = ?2 AND (?3 IS NULL OR action = ?3)
                     ORDER BY id DESC LIMIT 1",
                    params![origin, target, action],
                    RawReceipt::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawReceipt::into_receipt).transpose()
    }

    /// All receipts for a target, newest first, optionally narrowed to one origin.
    pub fn receipts_for_target(&self, target: &str, origin: Option<&str>) -> Result<Vec<Receipt>> {
        let raw: Vec<RawReceipt> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, origin, target, action, metadata, job_id, created_at
                 FROM receipts
                 WHERE target = ?1 AND (?2 IS NULL OR origin = ?2)
                 ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map(params![target, origin], RawReceipt::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raw.into_iter().map(RawReceipt::into_receipt).collect()
    }
}
