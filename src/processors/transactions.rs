//! Transaction download scheduling and `getTransaction` → `transactions`

use super::ProcessReport;
use crate::db::{now_millis, Database};
use crate::error::{LedgerError, Result};
use crate::receipts::{call_target, NewReceipt, ReceiptLedger};
use crate::rpc::ledger::{CompletedCall, NewCall, RpcLedger};
use rusqlite::params;
use serde_json::{json, Value};

pub const TRANSACTION_METHOD: &str = "getTransaction";
pub const DOWNLOADER_ORIGIN: &str = "solana-transaction-downloader";
pub const DOWNLOAD_ACTION: &str = "download";
pub const TRANSACTION_PROCESSOR_ORIGIN: &str = "solana-transaction-processor";
pub const PROCESSED_TRANSACTION_ACTION: &str = "processed_transaction";

/// Transaction downloads run ahead of backfill pages.
pub const DOWNLOAD_PRIORITY: i64 = 5;

pub fn signature_target(signature: &str) -> String {
    format!("signature/{}", signature)
}

pub fn transaction_params(signature: &str) -> Value {
    json!([
        signature,
        { "encoding": "json", "maxSupportedTransactionVersion": 0 }
    ])
}

/// Schedules a `getTransaction` call for every stored signature that has no
/// `download` receipt yet.
pub struct TransactionDownloader {
    db: Database,
    calls: RpcLedger,
    receipts: ReceiptLedger,
    rate_limit_key: String,
}

impl TransactionDownloader {
    pub fn new(db: Database, chain: &str) -> Self {
        Self {
            calls: RpcLedger::new(db.clone()),
            receipts: ReceiptLedger::new(db.clone()),
            rate_limit_key: format!("{}-mainnet", chain),
            db,
        }
    }

    /// Newest signatures without a download receipt.
    pub fn undownloaded(&self, limit: usize) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.signature FROM signatures s
                 WHERE NOT EXISTS (
                     SELECT 1 FROM receipts r
                     WHERE r.origin = ?1 AND r.target = 'signature/' || s.signature AND r.action = ?2
                 )
                 ORDER BY s.block_time DESC, s.id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![DOWNLOADER_ORIGIN, DOWNLOAD_ACTION, limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    pub fn run(&self, batch_size: usize, job_id: Option<i64>) -> Result<ProcessReport> {
        let signatures = self.undownloaded(batch_size)?;
        log::info!("🔍 Found {} signatures to download", signatures.len());

        let mut report = ProcessReport::default();
        for signature in &signatures {
            match self.schedule(signature, job_id) {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    log::error!("❌ Error scheduling download for {}: {}", signature, e);
                    report.failed += 1;
                }
            }
        }

        report.log(DOWNLOADER_ORIGIN);
        Ok(report)
    }

    fn schedule(&self, signature: &str, job_id: Option<i64>) -> Result<i64> {
        let call_id = self.calls.create_call(
            &NewCall::new(TRANSACTION_METHOD, transaction_params(signature))
                .with_priority(DOWNLOAD_PRIORITY)
                .with_rate_limit_key(self.rate_limit_key.as_str())
                .with_job_id(job_id),
        )?;
        self.receipts.create_receipt(
            &NewReceipt::new(DOWNLOADER_ORIGIN, signature_target(signature))
                .with_action(DOWNLOAD_ACTION)
                .with_metadata(json!({ "rpc_call_id": call_id }))
                .with_job_id(job_id),
        )?;
        Ok(call_id)
    }
}

/// Stores satisfied `getTransaction` results.
pub struct TransactionProcessor {
    db: Database,
    calls: RpcLedger,
    receipts: ReceiptLedger,
}

impl TransactionProcessor {
    pub fn new(db: Database) -> Self {
        Self {
            calls: RpcLedger::new(db.clone()),
            receipts: ReceiptLedger::new(db.clone()),
            db,
        }
    }

    pub fn run(&self, batch_size: usize, job_id: Option<i64>) -> Result<ProcessReport> {
        let pending = self.calls.fetch_unprocessed(
            TRANSACTION_METHOD,
            TRANSACTION_PROCESSOR_ORIGIN,
            Some(PROCESSED_TRANSACTION_ACTION),
            batch_size,
        )?;

        let mut report = ProcessReport::default();
        for completed in &pending {
            match self.process(completed, job_id) {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    log::error!("❌ Error processing transaction call {}: {}", completed.call.id, e);
                    report.failed += 1;
                }
            }
        }

        report.log(TRANSACTION_PROCESSOR_ORIGIN);
        Ok(report)
    }

    /// Returns false when the node did not know the transaction.
    fn process(&self, completed: &CompletedCall, job_id: Option<i64>) -> Result<bool> {
        let call = &completed.call;
        let signature = call
            .params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::InvalidPayload(format!("call {} has no signature", call.id)))?;

        let receipt = NewReceipt::new(TRANSACTION_PROCESSOR_ORIGIN, call_target(call.id))
            .with_action(PROCESSED_TRANSACTION_ACTION)
            .with_job_id(job_id);

        if completed.result.is_null() {
            log::warn!("⚠️  Transaction {} not found (call {})", signature, call.id);
            self.receipts.create_receipt(
                &receipt.with_metadata(json!({ "signature": signature, "missing": true })),
            )?;
            return Ok(false);
        }

        store_transaction(&self.db, signature, &completed.result, call.id)?;
        self.receipts
            .create_receipt(&receipt.with_metadata(json!({ "signature": signature })))?;
        Ok(true)
    }
}

/// Upsert one transaction keyed by signature.
pub fn store_transaction(db: &Database, signature: &str, tx: &Value, rpc_call_id: i64) -> Result<()> {
    if !tx.is_object() {
        return Err(LedgerError::InvalidPayload(format!(
            "transaction {} is not an object",
            signature
        )));
    }
    let meta = tx.get("meta");
    let err = meta
        .and_then(|m| m.get("err"))
        .filter(|v| !v.is_null())
        .map(Value::to_string);
    let raw = serde_json::to_string(tx)?;

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO transactions (signature, slot, block_time, fee, err, raw, rpc_call_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(signature) DO UPDATE SET
                slot = excluded.slot,
                block_time = excluded.block_time,
                fee = excluded.fee,
                err = excluded.err,
                raw = excluded.raw,
                rpc_call_id = excluded.rpc_call_id,
                updated_at = excluded.updated_at",
            params![
                signature,
                tx.get("slot").and_then(Value::as_i64),
                tx.get("blockTime").and_then(Value::as_i64),
                meta.and_then(|m| m.get("fee")).and_then(Value::as_i64),
                err,
                raw,
                rpc_call_id,
                now_millis(),
            ],
        )?;
        Ok(())
    })
}
