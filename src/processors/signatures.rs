//! `getSignaturesForAddress` pages → `signatures`

use super::ProcessReport;
use crate::backfill::SIGNATURES_METHOD;
use crate::db::{now_millis, Database};
use crate::error::{LedgerError, Result};
use crate::receipts::{call_target, NewReceipt, ReceiptLedger};
use crate::rpc::ledger::{CompletedCall, RpcLedger};
use rusqlite::params;
use serde_json::{json, Value};

pub const SIGNATURE_PROCESSOR_ORIGIN: &str = "solana-signature-processor";
pub const PROCESSED_SIGNATURES_ACTION: &str = "processed_signatures";

pub struct SignatureProcessor {
    db: Database,
    calls: RpcLedger,
    receipts: ReceiptLedger,
}

impl SignatureProcessor {
    pub fn new(db: Database) -> Self {
        Self {
            calls: RpcLedger::new(db.clone()),
            receipts: ReceiptLedger::new(db.clone()),
            db,
        }
    }

    pub fn run(&self, batch_size: usize, job_id: Option<i64>) -> Result<ProcessReport> {
        let pending = self.calls.fetch_unprocessed(
            SIGNATURES_METHOD,
            SIGNATURE_PROCESSOR_ORIGIN,
            Some(PROCESSED_SIGNATURES_ACTION),
            batch_size,
        )?;

        let mut report = ProcessReport::default();
        if pending.is_empty() {
            log::info!("No unprocessed signature pages");
            return Ok(report);
        }
        log::info!("🔍 Processing {} signature pages", pending.len());

        for completed in &pending {
            match self.process(completed, job_id) {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    log::error!("❌ Error processing signature call {}: {}", completed.call.id, e);
                    report.failed += 1;
                }
            }
        }

        report.log(SIGNATURE_PROCESSOR_ORIGIN);
        Ok(report)
    }

    fn process(&self, completed: &CompletedCall, job_id: Option<i64>) -> Result<()> {
        let call = &completed.call;
        let address = call
            .params
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::InvalidPayload(format!("call {} has no address", call.id)))?;

        let entries: &[Value] = match &completed.result {
            Value::Array(entries) => entries.as_slice(),
            Value::Null => &[],
            other => {
                return Err(LedgerError::InvalidPayload(format!(
                    "expected a signature list, got {}",
                    other
                )))
            }
        };

        let inserted = store_signatures(&self.db, address, entries, call.id)?;
        log::info!(
            "   ├─ {} new signatures for {} (call {})",
            inserted,
            address,
            call.id
        );

        self.receipts.create_receipt(
            &NewReceipt::new(SIGNATURE_PROCESSOR_ORIGIN, call_target(call.id))
                .with_action(PROCESSED_SIGNATURES_ACTION)
                .with_metadata(json!({
                    "address": address,
                    "signatures_count": entries.len(),
                    "inserted": inserted,
                    "method": call.method,
                }))
                .with_job_id(job_id),
        )?;
        Ok(())
    }
}

/// Insert a page of signature entries; existing signatures are left as they
/// are. Returns the number of new rows.
pub fn store_signatures(db: &Database, address: &str, entries: &[Value], rpc_call_id: i64) -> Result<usize> {
    db.with_transaction(|tx| {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO signatures
                (signature, address, slot, err, memo, block_time, confirmation_status, rpc_call_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        let now = now_millis();
        let mut inserted = 0;

        for entry in entries {
            let Some(signature) = entry.get("signature").and_then(Value::as_str) else {
                log::warn!("⚠️  Skipping signature entry without a signature: {}", entry);
                continue;
            };
            let err = entry
                .get("err")
                .filter(|v| !v.is_null())
                .map(Value::to_string);
            inserted += stmt.execute(params![
                signature,
                address,
                entry.get("slot").and_then(Value::as_i64),
                err,
                entry.get("memo").and_then(Value::as_str),
                entry.get("blockTime").and_then(Value::as_i64),
                entry.get("confirmationStatus").and_then(Value::as_str),
                rpc_call_id,
                now,
            ])?;
        }
        Ok(inserted)
    })
}
