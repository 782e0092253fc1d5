//! Market account info: scheduling and `getAccountInfo` → `markets`

use super::{ready_account_info, schedule_account_info, ProcessReport};
use crate::config::TrackedAccount;
use crate::db::{now_millis, Database};
use crate::error::Result;
use crate::receipts::{call_target, NewReceipt, ReceiptLedger};
use crate::rpc::ledger::RpcLedger;
use rusqlite::params;
use serde_json::{json, Value};

pub const MARKET_SCHEDULER_ORIGIN: &str = "solana-market-info-scheduler";
pub const MARKET_PROCESSOR_ORIGIN: &str = "solana-market-info-processor";

pub struct MarketInfo {
    db: Database,
    calls: RpcLedger,
    receipts: ReceiptLedger,
    rate_limit_key: String,
}

impl MarketInfo {
    pub fn new(db: Database, chain: &str) -> Self {
        Self {
            calls: RpcLedger::new(db.clone()),
            receipts: ReceiptLedger::new(db.clone()),
            rate_limit_key: format!("{}-mainnet", chain),
            db,
        }
    }

    pub fn schedule(&self, markets: &[TrackedAccount], job_id: Option<i64>) -> ProcessReport {
        log::info!("📅 Scheduling account info for {} markets", markets.len());
        let report = schedule_account_info(&self.calls, markets, &self.rate_limit_key, job_id);
        report.log(MARKET_SCHEDULER_ORIGIN);
        report
    }

    pub fn process(&self, markets: &[TrackedAccount], job_id: Option<i64>) -> Result<ProcessReport> {
        let ready = ready_account_info(&self.calls, &self.receipts, MARKET_PROCESSOR_ORIGIN, markets)?;
        let mut report = ProcessReport::default();

        for (market, call, info) in &ready {
            let stored = upsert_market(&self.db, &market.address, Some(&market.name), info).and_then(|_| {
                self.receipts.create_receipt(
                    &NewReceipt::new(MARKET_PROCESSOR_ORIGIN, call_target(call.id))
                        .with_metadata(json!({ "address": market.address }))
                        .with_job_id(job_id),
                )
            });
            match stored {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    log::error!("❌ Error storing market {}: {}", market.address, e);
                    report.failed += 1;
                }
            }
        }

        report.log(MARKET_PROCESSOR_ORIGIN);
        Ok(report)
    }
}

pub fn upsert_market(db: &Database, address: &str, name: Option<&str>, metadata: &Value) -> Result<()> {
    let metadata = serde_json::to_string(metadata)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO markets (address, name, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(address) DO UPDATE SET
                name = COALESCE(excluded.name, markets.name),
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![address, name, metadata, now_millis()],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{account_info_params, ACCOUNT_INFO_METHOD};
    use crate::rpc::client::RpcResponse;

    fn market(name: &str, address: &str) -> TrackedAccount {
        TrackedAccount {
            name: name.to_string(),
            chain: "solana".to_string(),
            address: address.to_string(),
            kind: Some("orderbook".to_string()),
            symbol: None,
        }
    }

    #[test]
    fn test_schedule_then_process() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let markets = vec![market("SOL/USDC", "mktA"), market("BONK/SOL", "mktB")];
        let job = MarketInfo::new(db.clone(), "solana");

        assert_eq!(job.schedule(&markets, Some(1)).processed, 2);
        // Scheduling again reuses the same calls.
        job.schedule(&markets, Some(2));
        let calls = RpcLedger::new(db.clone());
        assert_eq!(calls.fetch_pending(10).unwrap().len(), 2);

        // Nothing satisfied yet.
        assert_eq!(job.process(&markets, None).unwrap(), ProcessReport::default());

        let call = calls
            .find_call(ACCOUNT_INFO_METHOD, &account_info_params("mktA"))
            .unwrap()
            .unwrap();
        calls
            .record_result(
                call.id,
                "test",
                &RpcResponse::Success {
                    result: json!({"value": {"owner": "srmqPvymJeFKQ4zGQed1GFppgkRHL9kaELCbyksJtPX6"}}),
                    status_code: 200,
                },
                0,
            )
            .unwrap();

        assert_eq!(job.process(&markets, None).unwrap().processed, 1);
        assert_eq!(job.process(&markets, None).unwrap().processed, 0);

        let (name, metadata): (String, String) = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT name, metadata FROM markets WHERE address = 'mktA'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(name, "SOL/USDC");
        assert!(metadata.contains("srmqPvym"));
    }
}
