//! RPC call ledger
//!
//! Tables (see `sql/02_rpc_calls.sql`):
//! - `rpc_calls` - one row per distinct (method, params), never deleted
//! - `rpc_call_results` - append-only, one row per attempt
//!
//! A call stays pending until some result row has `result IS NOT NULL AND
//! error IS NULL`. Failed attempts therefore leave the call visible to every
//! later fetch, which is the only retry mechanism there is.

use super::client::RpcResponse;
use crate::db::{now_millis, Database};
use crate::error::Result;
use crate::receipts::CALL_TARGET_PREFIX;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CALL_COLUMNS: &str =
    "c.id, c.method, c.params, c.priority, c.rate_limit_key, c.job_id, c.created_at";

const SATISFIED: &str = "r.result IS NOT NULL AND r.error IS NULL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub id: i64,
    pub method: String,
    pub params: Value,
    pub priority: i64,
    pub rate_limit_key: Option<String>,
    pub job_id: Option<i64>,
    pub created_at: i64,
}

/// Request to schedule a call.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCall {
    pub method: String,
    pub params: Value,
    pub priority: i64,
    pub rate_limit_key: Option<String>,
    pub job_id: Option<i64>,
}

impl NewCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            priority: 0,
            rate_limit_key: None,
            job_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn with_job_id(mut self, job_id: Option<i64>) -> Self {
        self.job_id = job_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCallResult {
    pub id: i64,
    pub rpc_call_id: i64,
    pub source: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: i64,
}

impl RpcCallResult {
    pub fn is_satisfying(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }
}

/// A satisfied call together with its first error-free result.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    pub call: RpcCall,
    pub source: String,
    pub result: Value,
}

/// Row as stored; JSON columns are still text.
struct RawCall {
    id: i64,
    method: String,
    params: String,
    priority: i64,
    rate_limit_key: Option<String>,
    job_id: Option<i64>,
    created_at: i64,
}

impl RawCall {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            method: row.get(1)?,
            params: row.get(2)?,
            priority: row.get(3)?,
            rate_limit_key: row.get(4)?,
            job_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_call(self) -> Result<RpcCall> {
        Ok(RpcCall {
            id: self.id,
            method: self.method,
            params: serde_json::from_str(&self.params)?,
            priority: self.priority,
            rate_limit_key: self.rate_limit_key,
            job_id: self.job_id,
            created_at: self.created_at,
        })
    }
}

struct RawResult {
    id: i64,
    rpc_call_id: i64,
    source: String,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    completed_at: i64,
}

impl RawResult {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            rpc_call_id: row.get(1)?,
            source: row.get(2)?,
            result: row.get(3)?,
            error: row.get(4)?,
            created_at: row.get(5)?,
            completed_at: row.get(6)?,
        })
    }

    fn into_result(self) -> Result<RpcCallResult> {
        let result = match self.result {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(RpcCallResult {
            id: self.id,
            rpc_call_id: self.rpc_call_id,
            source: self.source,
            result,
            error: self.error,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Clone)]
pub struct RpcLedger {
    db: Database,
}

impl RpcLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Schedule a call, collapsing identical (method, params) onto one row.
    ///
    /// Returns the id of the existing row whatever its state, or of the newly
    /// inserted pending row.
    pub fn create_call(&self, call: &NewCall) -> Result<i64> {
        let params_text = serde_json::to_string(&call.params)?;
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO rpc_calls (method, params, priority, rate_limit_key, job_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(method, params) DO NOTHING",
                params![
                    call.method,
                    params_text,
                    call.priority,
                    call.rate_limit_key,
                    call.job_id,
                    now_millis(),
                ],
            )?;

            let id: i64 = conn.query_row(
                "SELECT id FROM rpc_calls WHERE method = ?1 AND params = ?2",
                params![call.method, params_text],
                |row| row.get(0),
            )?;

            if inserted == 0 {
                log::debug!("♻️  {} already scheduled as call {}", call.method, id);
            }
            Ok(id)
        })
    }

    /// Calls with no error-free result yet, highest priority first, then oldest.
    pub fn fetch_pending(&self, limit: usize) -> Result<Vec<RpcCall>> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM rpc_calls c
             WHERE NOT EXISTS (
                 SELECT 1 FROM rpc_call_results r WHERE r.rpc_call_id = c.id AND {SATISFIED}
             )
             ORDER BY c.priority DESC, c.created_at ASC, c.id ASC
             LIMIT ?1"
        );
        self.query_calls(&sql, params![limit as i64])
    }

    /// Like [`fetch_pending`](Self::fetch_pending) but restricted to calls whose
    /// rate-limit key is `chain` or starts with `"{chain}-"`.
    pub fn fetch_pending_for_chain(&self, chain: &str, limit: usize) -> Result<Vec<RpcCall>> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM rpc_calls c
             WHERE (c.rate_limit_key = ?2
                    OR substr(c.rate_limit_key, 1, length(?2) + 1) = ?2 || '-')
               AND NOT EXISTS (
                 SELECT 1 FROM rpc_call_results r WHERE r.rpc_call_id = c.id AND {SATISFIED}
             )
             ORDER BY c.priority DESC, c.created_at ASC, c.id ASC
             LIMIT ?1"
        );
        self.query_calls(&sql, params![limit as i64, chain])
    }

    /// Append one attempt. `started_at` is when the attempt began (ms).
    pub fn record_result(
        &self,
        call_id: i64,
        source: &str,
        response: &RpcResponse,
        started_at: i64,
    ) -> Result<i64> {
        let (result, error) = match response {
            RpcResponse::Success { result, .. } => (Some(serde_json::to_string(result)?), None),
            RpcResponse::Failure { error, .. } => (None, Some(error.clone())),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rpc_call_results (rpc_call_id, source, result, error, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![call_id, source, result, error, started_at, now_millis()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_call(&self, id: i64) -> Result<Option<RpcCall>> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM rpc_calls c WHERE c.id = ?1");
        Ok(self.query_calls(&sql, params![id])?.into_iter().next())
    }

    /// Look a call up by its identity.
    pub fn find_call(&self, method: &str, call_params: &Value) -> Result<Option<RpcCall>> {
        let params_text = serde_json::to_string(call_params)?;
        let sql = format!("SELECT {CALL_COLUMNS} FROM rpc_calls c WHERE c.method = ?1 AND c.params = ?2");
        Ok(self
            .query_calls(&sql, params![method, params_text])?
            .into_iter()
            .next())
    }

    pub fn calls_for_job(&self, job_id: i64) -> Result<Vec<RpcCall>> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM rpc_calls c WHERE c.job_id = ?1 ORDER BY c.created_at ASC, c.id ASC"
        );
        self.query_calls(&sql, params![job_id])
    }

    /// Every attempt for a call, oldest first.
    pub fn results_for(&self, call_id: i64) -> Result<Vec<RpcCallResult>> {
        let raw: Vec<RawResult> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, rpc_call_id, source, result, error, created_at, completed_at
                 FROM rpc_call_results WHERE rpc_call_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![call_id], RawResult::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raw.into_iter().map(RawResult::into_result).collect()
    }

    /// The earliest error-free result, if the call has been satisfied.
    pub fn satisfied_result(&self, call_id: i64) -> Result<Option<RpcCallResult>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT r.id, r.rpc_call_id, r.source, r.result, r.error, r.created_at, r.completed_at
                         FROM rpc_call_results r
                         WHERE r.rpc_call_id = ?1 AND {SATISFIED}
                         ORDER BY r.id ASC LIMIT 1"
                    ),
                    params![call_id],
                    RawResult::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawResult::into_result).transpose()
    }

    /// Satisfied calls of `method` that `origin` has not receipted yet under
    /// `rpc_call/<id>`.
    ///
    /// Matches receipts the same way as
    /// [`ReceiptLedger::has_processed`](crate::receipts::ReceiptLedger::has_processed):
    /// `Some(action)` requires that action, `None` accepts a receipt with any
    /// action (or none).
    pub fn fetch_unprocessed(
        &self,
        method: &str,
        origin: &str,
        action: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CompletedCall>> {
        let rows: Vec<(RawCall, String, String)> = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {CALL_COLUMNS}, r.source, r.result
                 FROM rpc_calls c
                 JOIN rpc_call_results r ON r.id = (
                     SELECT MIN(r.id) FROM rpc_call_results r WHERE r.rpc_call_id = c.id AND {SATISFIED}
                 )
                 WHERE c.method = ?1
                   AND NOT EXISTS (
                     SELECT 1 FROM receipts rec
                     WHERE rec.origin = ?2 AND rec.target = ?3 || c.id
                       AND (?4 IS NULL OR rec.action = ?4)
                 )
                 ORDER BY c.priority DESC, c.created_at ASC, c.id ASC
                 LIMIT ?5"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![method, origin, CALL_TARGET_PREFIX, action, limit as i64],
                    |row| Ok((RawCall::from_row(row)?, row.get(7)?, row.get(8)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(raw, source, result)| {
                Ok(CompletedCall {
                    call: raw.into_call()?,
                    source,
                    result: serde_json::from_str(&result)?,
                })
            })
            .collect()
    }

    fn query_calls(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<RpcCall>> {
        let raw: Vec<RawCall> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(args, RawCall::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raw.into_iter().map(RawCall::into_call).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipts::{call_target, NewReceipt, ReceiptLedger};
    use serde_json::json;

    fn test_ledger() -> (Database, RpcLedger) {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        (db.clone(), RpcLedger::new(db))
    }

    fn ok(result: Value) -> RpcResponse {
        RpcResponse::Success {
            result,
            status_code: 200,
        }
    }

    fn failed(error: &str) -> RpcResponse {
        RpcResponse::Failure {
            error: error.to_string(),
            status_code: Some(429),
        }
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn test_create_call_is_idempotent() {
        let (db, ledger) = test_ledger();
        let call = NewCall::new("getTransaction", json!(["sig1", {"encoding": "json"}]));

        let first = ledger.create_call(&call).unwrap();
        let second = ledger.create_call(&call.clone().with_priority(9)).unwrap();

        assert_eq!(first, second);
        assert_eq!(count(&db, "rpc_calls"), 1);
    }

    #[test]
    fn test_params_key_order_does_not_split_calls() {
        let (db, ledger) = test_ledger();
        let a: Value = serde_json::from_str(r#"["addr", {"limit": 10, "before": "x"}]"#).unwrap();
        let b: Value = serde_json::from_str(r#"["addr", {"before": "x", "limit": 10}]"#).unwrap();

        let id_a = ledger.create_call(&NewCall::new("getSignaturesForAddress", a)).unwrap();
        let id_b = ledger.create_call(&NewCall::new("getSignaturesForAddress", b)).unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(count(&db, "rpc_calls"), 1);
    }

    #[test]
    fn test_existing_id_returned_after_satisfied() {
        let (_db, ledger) = test_ledger();
        let call = NewCall::new("getAccountInfo", json!(["market1"]));
        let id = ledger.create_call(&call).unwrap();
        ledger.record_result(id, "helius", &ok(json!({"value": 1})), now_millis()).unwrap();

        assert_eq!(ledger.create_call(&call).unwrap(), id);
        assert!(ledger.fetch_pending(10).unwrap().is_empty());
    }

    #[test]
    fn test_fetch_pending_order_and_stability() {
        let (_db, ledger) = test_ledger();
        let low = ledger.create_call(&NewCall::new("m", json!([1]))).unwrap();
        let high = ledger.create_call(&NewCall::new("m", json!([2])).with_priority(5)).unwrap();
        let low_later = ledger.create_call(&NewCall::new("m", json!([3]))).unwrap();
        let mid = ledger.create_call(&NewCall::new("m", json!([4])).with_priority(1)).unwrap();

        let first: Vec<i64> = ledger.fetch_pending(10).unwrap().iter().map(|c| c.id).collect();
        let second: Vec<i64> = ledger.fetch_pending(10).unwrap().iter().map(|c| c.id).collect();

        assert_eq!(first, vec![high, mid, low, low_later]);
        assert_eq!(first, second);

        let limited: Vec<i64> = ledger.fetch_pending(2).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(limited, vec![high, mid]);
    }

    #[test]
    fn test_error_result_keeps_call_pending() {
        let (db, ledger) = test_ledger();
        let id = ledger
            .create_call(&NewCall::new("getTransaction", json!(["sig1", {"encoding": "json"}])))
            .unwrap();

        ledger.record_result(id, "publicnode", &failed("HTTP 429: Too Many Requests"), now_millis()).unwrap();
        let pending = ledger.fetch_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert!(ledger.satisfied_result(id).unwrap().is_none());

        ledger.record_result(id, "helius", &ok(json!({"slot": 7})), now_millis()).unwrap();
        assert!(ledger.fetch_pending(10).unwrap().is_empty());

        let satisfied = ledger.satisfied_result(id).unwrap().unwrap();
        assert_eq!(satisfied.source, "helius");
        assert_eq!(satisfied.result, Some(json!({"slot": 7})));

        // Both attempts are kept; the call row itself is untouched.
        assert_eq!(ledger.results_for(id).unwrap().len(), 2);
        assert_eq!(count(&db, "rpc_calls"), 1);
    }

    #[test]
    fn test_null_result_satisfies_call() {
        let (_db, ledger) = test_ledger();
        let id = ledger.create_call(&NewCall::new("getTransaction", json!(["gone"]))).unwrap();
        ledger.record_result(id, "helius", &ok(Value::Null), now_millis()).unwrap();

        assert!(ledger.fetch_pending(10).unwrap().is_empty());
        let satisfied = ledger.satisfied_result(id).unwrap().unwrap();
        assert_eq!(satisfied.result, Some(Value::Null));
    }

    #[test]
    fn test_fetch_pending_for_chain() {
        let (_db, ledger) = test_ledger();
        let sol = ledger
            .create_call(&NewCall::new("m", json!([1])).with_rate_limit_key("solana-mainnet"))
            .unwrap();
        let sol_bare = ledger
            .create_call(&NewCall::new("m", json!([2])).with_rate_limit_key("solana"))
            .unwrap();
        ledger
            .create_call(&NewCall::new("m", json!([3])).with_rate_limit_key("solanax-mainnet"))
            .unwrap();
        ledger
            .create_call(&NewCall::new("m", json!([4])).with_rate_limit_key("ethereum-mainnet"))
            .unwrap();
        ledger.create_call(&NewCall::new("m", json!([5]))).unwrap();

        let ids: Vec<i64> = ledger
            .fetch_pending_for_chain("solana", 10)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![sol, sol_bare]);
        assert_eq!(ledger.fetch_pending(10).unwrap().len(), 5);
    }

    #[test]
    fn test_fetch_unprocessed_skips_receipted_calls() {
        let (db, ledger) = test_ledger();
        let receipts = ReceiptLedger::new(db);

        let a = ledger.create_call(&NewCall::new("getAccountInfo", json!(["a"]))).unwrap();
        let b = ledger.create_call(&NewCall::new("getAccountInfo", json!(["b"]))).unwrap();
        let pending = ledger.create_call(&NewCall::new("getAccountInfo", json!(["c"]))).unwrap();
        let other = ledger.create_call(&NewCall::new("getBalance", json!(["a"]))).unwrap();

        ledger.record_result(a, "p1", &failed("boom"), now_millis()).unwrap();
        ledger.record_result(a, "p2", &ok(json!({"first": true})), now_millis()).unwrap();
        ledger.record_result(a, "p1", &ok(json!({"first": false})), now_millis()).unwrap();
        ledger.record_result(b, "p1", &ok(json!(2)), now_millis()).unwrap();
        ledger.record_result(other, "p1", &ok(json!(3)), now_millis()).unwrap();
        ledger.record_result(pending, "p1", &failed("boom"), now_millis()).unwrap();

        let unprocessed = ledger
            .fetch_unprocessed("getAccountInfo", "market-processor", Some("processed"), 10)
            .unwrap();
        assert_eq!(unprocessed.len(), 2);
        assert_eq!(unprocessed[0].call.id, a);
        assert_eq!(unprocessed[0].source, "p2");
        assert_eq!(unprocessed[0].result, json!({"first": true}));

        receipts
            .create_receipt(&NewReceipt::new("market-processor", call_target(a)).with_action("processed"))
            .unwrap();
        // A receipt under a different action does not count.
        receipts
            .create_receipt(&NewReceipt::new("market-processor", call_target(b)).with_action("other"))
            .unwrap();

        let ids: Vec<i64> = ledger
            .fetch_unprocessed("getAccountInfo", "market-processor", Some("processed"), 10)
            .unwrap()
            .iter()
            .map(|c| c.call.id)
            .collect();
        assert_eq!(ids, vec![b]);
    }

    #[test]
    fn test_fetch_unprocessed_without_action_matches_any_receipt() {
        let (db, ledger) = test_ledger();
        let receipts = ReceiptLedger::new(db);

        let a = ledger.create_call(&NewCall::new("getAccountInfo", json!(["a"]))).unwrap();
        let b = ledger.create_call(&NewCall::new("getAccountInfo", json!(["b"]))).unwrap();
        let c = ledger.create_call(&NewCall::new("getAccountInfo", json!(["c"]))).unwrap();
        for id in [a, b, c] {
            ledger.record_result(id, "p1", &ok(json!(id)), now_millis()).unwrap();
        }

        receipts
            .create_receipt(&NewReceipt::new("coin-processor", call_target(a)).with_action("processed"))
            .unwrap();
        receipts
            .create_receipt(&NewReceipt::new("coin-processor", call_target(b)))
            .unwrap();

        let ids: Vec<i64> = ledger
            .fetch_unprocessed("getAccountInfo", "coin-processor", None, 10)
            .unwrap()
            .iter()
            .map(|c| c.call.id)
            .collect();
        assert_eq!(ids, vec![c]);
        for id in [a, b] {
            assert!(receipts.has_processed("coin-processor", &call_target(id), None).unwrap());
        }
        assert!(!receipts.has_processed("coin-processor", &call_target(c), None).unwrap());
    }

    #[test]
    fn test_lookup_helpers() {
        let (_db, ledger) = test_ledger();
        let params = json!(["addr", {"limit": 1000}]);
        let id = ledger
            .create_call(&NewCall::new("getSignaturesForAddress", params.clone()).with_job_id(Some(42)))
            .unwrap();

        let found = ledger.find_call("getSignaturesForAddress", &params).unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.params, params);
        assert_eq!(ledger.get_call(id).unwrap().unwrap().job_id, Some(42));
        assert_eq!(ledger.calls_for_job(42).unwrap().len(), 1);
        assert!(ledger.find_call("getSignaturesForAddress", &json!(["other"])).unwrap().is_none());
        assert!(ledger.get_call(999).unwrap().is_none());
    }
}
