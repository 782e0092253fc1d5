//! Coin metadata: scheduling and `getAccountInfo` → `coins`

use super::{ready_account_info, schedule_account_info, ProcessReport};
use crate::config::TrackedAccount;
use crate::db::{now_millis, Database};
use crate::error::Result;
use crate::receipts::{call_target, NewReceipt, ReceiptLedger};
use crate::rpc::ledger::RpcLedger;
use rusqlite::params;
use serde_json::{json, Value};

pub const METADATA_SCHEDULER_ORIGIN: &str = "solana-metadata-scheduler";
pub const METADATA_PROCESSOR_ORIGIN: &str = "solana-metadata-processor";

pub struct CoinMetadata {
    db: Database,
    calls: RpcLedger,
    receipts: ReceiptLedger,
    rate_limit_key: String,
}

impl CoinMetadata {
    pub fn new(db: Database, chain: &str) -> Self {
        Self {
            calls: RpcLedger::new(db.clone()),
            receipts: ReceiptLedger::new(db.clone()),
            rate_limit_key: format!("{}-mainnet", chain),
            db,
        }
    }

    pub fn schedule(&self, coins: &[TrackedAccount], job_id: Option<i64>) -> ProcessReport {
        log::info!("📅 Scheduling metadata for {} coins", coins.len());
        let report = schedule_account_info(&self.calls, coins, &self.rate_limit_key, job_id);
        report.log(METADATA_SCHEDULER_ORIGIN);
        report
    }

    pub fn process(&self, coins: &[TrackedAccount], job_id: Option<i64>) -> Result<ProcessReport> {
        let ready = ready_account_info(&self.calls, &self.receipts, METADATA_PROCESSOR_ORIGIN, coins)?;
        let mut report = ProcessReport::default();

        for (coin, call, metadata) in &ready {
            let stored = upsert_coin(&self.db, coin, metadata).and_then(|_| {
                self.receipts.create_receipt(
                    &NewReceipt::new(METADATA_PROCESSOR_ORIGIN, call_target(call.id))
                        .with_metadata(json!({ "address": coin.address, "symbol": coin.symbol }))
                        .with_job_id(job_id),
                )
            });
            match stored {
                Ok(_) => {
                    log::info!(
                        "   ├─ Upserted coin {} ({})",
                        coin.symbol.as_deref().unwrap_or(&coin.name),
                        coin.address
                    );
                    report.processed += 1;
                }
                Err(e) => {
                    log::error!("❌ Error storing coin {}: {}", coin.address, e);
                    report.failed += 1;
                }
            }
        }

        report.log(METADATA_PROCESSOR_ORIGIN);
        Ok(report)
    }
}

pub fn upsert_coin(db: &Database, coin: &TrackedAccount, metadata: &Value) -> Result<()> {
    let metadata = serde_json::to_string(metadata)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO coins (address, name, symbol, chain, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(address) DO UPDATE SET
                name = excluded.name,
                symbol = excluded.symbol,
                chain = excluded.chain,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                coin.address,
                coin.name,
                coin.symbol,
                coin.chain,
                metadata,
                now_millis()
            ],
        )?;
        Ok(())
    })
}
