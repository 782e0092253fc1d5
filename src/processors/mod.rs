//! Downstream processors
//!
//! Each processor turns satisfied ledger calls into rows of a projection
//! table. The pattern is the same everywhere:
//! 1. Select work that has no receipt for this processor
//! 2. Write the projection with overwrite-idempotent SQL
//! 3. Only then write the receipt
//!
//! A failure on one item is logged and counted; no receipt is written, so the
//! item is picked up again next run.

pub mod coins;
pub mod markets;
pub mod signatures;
pub mod transactions;

use crate::config::TrackedAccount;
use crate::error::Result;
use crate::receipts::{call_target, ReceiptLedger};
use crate::rpc::ledger::{NewCall, RpcCall, RpcLedger};
use serde::Serialize;
use serde_json::{json, Value};

pub const ACCOUNT_INFO_METHOD: &str = "getAccountInfo";

/// Counters returned by every processor and scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProcessReport {
    fn log(&self, name: &str) {
        log::info!(
            "📊 {}: {} processed, {} skipped, {} failed",
            name,
            self.processed,
            self.skipped,
            self.failed
        );
    }
}

pub fn account_info_params(address: &str) -> Value {
    json!([address, { "encoding": "jsonParsed" }])
}

/// Schedule one `getAccountInfo` call per account. An account that fails to
/// schedule is logged and counted.
pub(crate) fn schedule_account_info(
    calls: &RpcLedger,
    accounts: &[TrackedAccount],
    rate_limit_key: &str,
    job_id: Option<i64>,
) -> ProcessReport {
    let mut report = ProcessReport::default();

    for account in accounts {
        let call = NewCall::new(ACCOUNT_INFO_METHOD, account_info_params(&account.address))
            .with_rate_limit_key(rate_limit_key)
            .with_job_id(job_id);
        match calls.create_call(&call) {
            Ok(id) => {
                log::info!("   ├─ {} ({}) → call {}", account.name, account.address, id);
                report.processed += 1;
            }
            Err(e) => {
                log::error!("❌ Failed to schedule {}: {}", account.name, e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Account-info work ready for `origin`: accounts whose call is satisfied
/// and not yet receipted by that origin.
pub(crate) fn ready_account_info(
    calls: &RpcLedger,
    receipts: &ReceiptLedger,
    origin: &str,
    accounts: &[TrackedAccount],
) -> Result<Vec<(TrackedAccount, RpcCall, Value)>> {
    let mut ready = Vec::new();
    for account in accounts {
        let Some(call) = calls.find_call(ACCOUNT_INFO_METHOD, &account_info_params(&account.address))?
        else {
            continue;
        };
        if receipts.has_processed(origin, &call_target(call.id), None)? {
            continue;
        }
        if let Some(result) = calls.satisfied_result(call.id)?.and_then(|r| r.result) {
            ready.push((account.clone(), call, result));
        }
    }
    Ok(ready)
}
