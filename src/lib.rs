//! ledgerflow: ledger-driven blockchain ingestion.
//!
//! Outbound JSON-RPC calls are scheduled into a deduplicated call ledger and
//! executed by rate-limited provider loops. Processors turn satisfied calls
//! into projection rows and mark each unit of work with a receipt. Batch jobs
//! are admitted by a bounded concurrency controller.

pub mod backfill;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod processors;
pub mod receipts;
pub mod rpc;

pub use error::{ConfigError, JobError, LaunchError, LedgerError, Result};
