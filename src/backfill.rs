//! Signature backfill scheduler
//!
//! Walks each tracked address backwards through `getSignaturesForAddress`
//! pages. There is no cursor column: the position is derived from the latest
//! `schedule_page` receipt for the address, the call it links to, and that
//! call's first error-free result.
//!
//! | latest receipt | linked call        | state            | action               |
//! |----------------|--------------------|------------------|----------------------|
//! | none           | -                  | FirstRun         | schedule first page  |
//! | some           | no result yet      | Pending          | nothing              |
//! | some           | non-empty page     | ReadyWithCursor  | schedule next page   |
//! | some           | empty page         | ReadyEmpty       | nothing, exhausted   |
//!
//! A page that is neither a list of signature entries nor `null` is an error
//! for that address; it is reported and retried on the next run rather than
//! being mistaken for the end of history.
//!
//! Scheduling creates the call first and the receipt second. A crash in
//! between is repaired on the next run: the address is still FirstRun (or
//! still at the old cursor), and the dedup upsert returns the same call id.

use crate::error::{LedgerError, Result};
use crate::receipts::{NewReceipt, ReceiptLedger};
use crate::rpc::ledger::{NewCall, RpcLedger};
use serde::Serialize;
use serde_json::{json, Value};

pub const BACKFILL_ORIGIN: &str = "solana-signature-backfill";
pub const SCHEDULE_PAGE_ACTION: &str = "schedule_page";
pub const SIGNATURES_METHOD: &str = "getSignaturesForAddress";

/// Backfill pages outrank everything but explicit user work.
pub const BACKFILL_PRIORITY: i64 = 1;

pub fn account_target(address: &str) -> String {
    format!("account/{}", address)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackfillState {
    FirstRun,
    Pending { call_id: i64 },
    ReadyWithCursor { call_id: i64, cursor: String },
    ReadyEmpty { call_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressReport {
    pub address: String,
    pub state: BackfillState,
    /// Call scheduled this run, if any.
    pub scheduled_call: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub addresses: Vec<AddressReport>,
    /// Addresses that failed and will be retried next run.
    pub errors: Vec<String>,
}

impl BackfillReport {
    pub fn scheduled_calls(&self) -> Vec<i64> {
        self.addresses.iter().filter_map(|a| a.scheduled_call).collect()
    }
}

pub struct SignatureBackfill {
    calls: RpcLedger,
    receipts: ReceiptLedger,
    rate_limit_key: String,
    page_limit: usize,
}

impl SignatureBackfill {
    pub fn new(calls: RpcLedger, receipts: ReceiptLedger, chain: &str, page_limit: usize) -> Self {
        Self {
            calls,
            receipts,
            rate_limit_key: format!("{}-mainnet", chain),
            page_limit,
        }
    }

    /// Work out where the backfill for `address` stands.
    pub fn derive_state(&self, address: &str) -> Result<BackfillState> {
        let latest = self.receipts.latest_receipt(
            BACKFILL_ORIGIN,
            &account_target(address),
            Some(SCHEDULE_PAGE_ACTION),
        )?;

        let Some(receipt) = latest else {
            return Ok(BackfillState::FirstRun);
        };

        let call_id = match receipt
            .metadata
            .as_ref()
            .and_then(|m| m.get("rpc_call_id"))
            .and_then(Value::as_i64)
        {
            Some(id) => id,
            None => {
                log::warn!(
                    "⚠️  Receipt {} for {} has no rpc_call_id, starting over",
                    receipt.id,
                    address
                );
                return Ok(BackfillState::FirstRun);
            }
        };

        let Some(result) = self.calls.satisfied_result(call_id)? else {
            return Ok(BackfillState::Pending { call_id });
        };

        let page = result.result.unwrap_or(Value::Null);
        Ok(match page_cursor(&page, call_id)? {
            Some(cursor) => BackfillState::ReadyWithCursor { call_id, cursor },
            None => BackfillState::ReadyEmpty { call_id },
        })
    }

    /// Derive and act on the state of every address. A failing address is
    /// logged and left for the next run; the others carry on.
    pub fn run(&self, addresses: &[String], job_id: Option<i64>) -> BackfillReport {
        let mut report = BackfillReport::default();

        for address in addresses {
            match self.step(address, job_id) {
                Ok(entry) => report.addresses.push(entry),
                Err(e) => {
                    log::error!("❌ Backfill failed for {}: {}", address, e);
                    report.errors.push(address.clone());
                }
            }
        }

        log::info!(
            "📊 Backfill: {} addresses, {} pages scheduled, {} errors",
            addresses.len(),
            report.scheduled_calls().len(),
            report.errors.len()
        );
        report
    }

    fn step(&self, address: &str, job_id: Option<i64>) -> Result<AddressReport> {
        let state = self.derive_state(address)?;

        let scheduled_call = match &state {
            BackfillState::FirstRun => {
                log::info!("   ├─ {}: first page", address);
                Some(self.schedule_page(address, None, job_id)?)
            }
            BackfillState::ReadyWithCursor { cursor, .. } => {
                log::info!("   ├─ {}: next page before {}", address, short(cursor));
                Some(self.schedule_page(address, Some(cursor), job_id)?)
            }
            BackfillState::Pending { call_id } => {
                log::debug!("{}: page call {} still pending", address, call_id);
                None
            }
            BackfillState::ReadyEmpty { .. } => {
                log::debug!("{}: backfill exhausted", address);
                None
            }
        };

        Ok(AddressReport {
            address: address.to_string(),
            state,
            scheduled_call,
        })
    }

    fn schedule_page(&self, address: &str, before: Option<&str>, job_id: Option<i64>) -> Result<i64> {
        let call_id = self.calls.create_call(
            &NewCall::new(SIGNATURES_METHOD, page_params(address, self.page_limit, before))
                .with_priority(BACKFILL_PRIORITY)
                .with_rate_limit_key(self.rate_limit_key.as_str())
                .with_job_id(job_id),
        )?;

        self.receipts.create_receipt(
            &NewReceipt::new(BACKFILL_ORIGIN, account_target(address))
                .with_action(SCHEDULE_PAGE_ACTION)
                .with_metadata(json!({ "rpc_call_id": call_id }))
                .with_job_id(job_id),
        )?;
        Ok(call_id)
    }
}

/// Params for one `getSignaturesForAddress` page.
pub fn page_params(address: &str, limit: usize, before: Option<&str>) -> Value {
    let mut options = json!({ "limit": limit });
    if let Some(before) = before {
        options["before"] = Value::from(before);
    }
    json!([address, options])
}

/// Cursor for the next page: the signature of the last (oldest) entry.
/// `None` means the page was empty (or `null`) and history is exhausted.
fn page_cursor(page: &Value, call_id: i64) -> Result<Option<String>> {
    let entries = match page {
        Value::Null => return Ok(None),
        Value::Array(entries) => entries,
        other => {
            return Err(LedgerError::InvalidPayload(format!(
                "call {}: expected a signature list, got {}",
                call_id, other
            )))
        }
    };
    let Some(last) = entries.last() else {
        return Ok(None);
    };
    match last.get("signature").and_then(Value::as_str) {
        Some(signature) => Ok(Some(signature.to_string())),
        None => Err(LedgerError::InvalidPayload(format!(
            "call {}: last entry has no signature: {}",
            call_id, last
        ))),
    }
}

fn short(signature: &str) -> &str {
    signature.get(..8).unwrap_or(signature)
}
