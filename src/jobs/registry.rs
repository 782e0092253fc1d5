//! Named jobs runnable by `job_runner`

use crate::backfill::SignatureBackfill;
use crate::config::{RuntimeConfig, TrackedAccount};
use crate::db::Database;
use crate::error::JobError;
use crate::processors::coins::CoinMetadata;
use crate::processors::markets::MarketInfo;
use crate::processors::signatures::SignatureProcessor;
use crate::processors::transactions::{TransactionDownloader, TransactionProcessor};
use crate::receipts::ReceiptLedger;
use crate::rpc::{Dispatcher, ProviderFile, RateLimiter, RpcClient, RpcLedger};
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;

/// Chain used by schedulers when `TARGET_CHAIN` is not set.
pub const DEFAULT_CHAIN: &str = "solana";

pub const JOB_NAMES: &[&str] = &[
    "rpc-executor-multi",
    "solana-signature-backfill",
    "solana-signature-processor",
    "solana-transaction-downloader",
    "solana-transaction-processor",
    "solana-market-info-scheduler",
    "solana-market-info-processor",
    "solana-metadata-scheduler",
    "solana-metadata-processor",
];

pub fn is_registered(job_name: &str) -> bool {
    JOB_NAMES.contains(&job_name)
}

/// Everything a job body needs.
#[derive(Clone)]
pub struct JobContext {
    pub db: Database,
    pub config: RuntimeConfig,
    /// The `job_runs` row this execution belongs to, if any.
    pub run_id: Option<i64>,
}

impl JobContext {
    fn chain(&self) -> &str {
        self.config.target_chain.as_deref().unwrap_or(DEFAULT_CHAIN)
    }

    fn tracked(&self, path: &str) -> Result<Vec<TrackedAccount>, JobError> {
        let accounts = TrackedAccount::load_list(path)?;
        Ok(TrackedAccount::on_chain(accounts, self.chain()))
    }
}

/// Run a job by name and return its JSON result.
pub async fn run_job(job_name: &str, ctx: &JobContext) -> Result<Value, JobError> {
    let job_id = ctx.run_id;
    let batch = ctx.config.rpc_processing_batch_size;

    match job_name {
        "rpc-executor-multi" => dispatch(ctx).await,
        "solana-signature-backfill" => {
            let markets = ctx.tracked(&ctx.config.markets_path)?;
            let addresses: Vec<String> = markets.into_iter().map(|m| m.address).collect();
            let backfill = SignatureBackfill::new(
                RpcLedger::new(ctx.db.clone()),
                ReceiptLedger::new(ctx.db.clone()),
                ctx.chain(),
                ctx.config.max_signatures_per_call,
            );
            Ok(json!(backfill.run(&addresses, job_id)))
        }
        "solana-signature-processor" => {
            Ok(json!(SignatureProcessor::new(ctx.db.clone()).run(batch, job_id)?))
        }
        "solana-transaction-downloader" => {
            let downloader = TransactionDownloader::new(ctx.db.clone(), ctx.chain());
            Ok(json!(downloader.run(ctx.config.signature_batch_size, job_id)?))
        }
        "solana-transaction-processor" => {
            Ok(json!(TransactionProcessor::new(ctx.db.clone()).run(batch, job_id)?))
        }
        "solana-market-info-scheduler" => {
            let markets = ctx.tracked(&ctx.config.markets_path)?;
            Ok(json!(MarketInfo::new(ctx.db.clone(), ctx.chain()).schedule(&markets, job_id)))
        }
        "solana-market-info-processor" => {
            let markets = ctx.tracked(&ctx.config.markets_path)?;
            Ok(json!(MarketInfo::new(ctx.db.clone(), ctx.chain()).process(&markets, job_id)?))
        }
        "solana-metadata-scheduler" => {
            let coins = ctx.tracked(&ctx.config.coins_path)?;
            Ok(json!(CoinMetadata::new(ctx.db.clone(), ctx.chain()).schedule(&coins, job_id)))
        }
        "solana-metadata-processor" => {
            let coins = ctx.tracked(&ctx.config.coins_path)?;
            Ok(json!(CoinMetadata::new(ctx.db.clone(), ctx.chain()).process(&coins, job_id)?))
        }
        other => Err(JobError::UnknownJob(other.to_string())),
    }
}

/// One bounded dispatch invocation across every active provider.
async fn dispatch(ctx: &JobContext) -> Result<Value, JobError> {
    let file = ProviderFile::load(&ctx.config.rpc_providers_path)?;
    let chain = ctx
        .config
        .target_chain
        .clone()
        .unwrap_or_else(|| file.defaults.target_chain.clone());

    let providers = file.active_providers(
        &chain,
        ctx.config.rpc_max_cycles,
        ctx.config.rpc_max_calls_per_cycle,
        |name| env::var(name).ok(),
    )?;

    let client = RpcClient::new(Arc::new(RateLimiter::new()), ctx.config.rpc_timeout())?;
    let dispatcher = Dispatcher::new(RpcLedger::new(ctx.db.clone()), Arc::new(client), chain.as_str())
        .with_safety_timeout(ctx.config.dispatch_safety_timeout());

    let summary = dispatcher.run(providers).await;
    Ok(json!({
        "chain": chain,
        "total_attempts": summary.total_attempts(),
        "timed_out": summary.timed_out,
        "providers": summary.providers,
    }))
}
