//! Runtime configuration from environment variables, plus the tracked
//! account lists (`markets.yml`, `coins.yml`).

use crate::error::ConfigError;
use crate::jobs::controller::ControllerLimits;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by `adm` and `job_runner`.
///
/// Loaded from environment variables with defaults. Values that fail to parse
/// fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Path to the SQLite database file
    pub db_path: String,

    pub max_jobs_running: usize,
    pub max_jobs_queued: usize,

    /// Overrides `defaults.target_chain` from the provider file
    pub target_chain: Option<String>,

    pub rpc_providers_path: String,
    pub markets_path: String,
    pub coins_path: String,

    /// Per-request HTTP timeout in milliseconds
    pub rpc_timeout_ms: u64,
    pub dispatch_safety_timeout_secs: u64,

    /// Override the per-provider cycle count / calls per cycle
    pub rpc_max_cycles: Option<u32>,
    pub rpc_max_calls_per_cycle: Option<usize>,

    /// Satisfied calls handled per processor run
    pub rpc_processing_batch_size: usize,
    /// Signatures handed to the transaction downloader per run
    pub signature_batch_size: usize,
    /// `limit` for getSignaturesForAddress pages
    pub max_signatures_per_call: usize,

    /// Executable started for each admitted job
    pub job_runner_bin: Option<String>,
    /// Job names `adm` submits every tick
    pub adm_jobs: Vec<String>,
    pub adm_tick_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `LEDGERFLOW_DB_PATH` (default: data/ledgerflow.db)
    /// - `MAX_JOBS_RUNNING` (default: 20)
    /// - `MAX_JOBS_QUEUED` (default: 50)
    /// - `TARGET_CHAIN` (default: from rpc-providers.yml)
    /// - `RPC_PROVIDERS_PATH` / `MARKETS_PATH` / `COINS_PATH`
    /// - `RPC_TIMEOUT_MS` (default: 10000)
    /// - `DISPATCH_SAFETY_TIMEOUT_SECS` (default: 45)
    /// - `RPC_MAX_CYCLES` / `RPC_MAX_CALLS_PER_CYCLE` (default: from rpc-providers.yml)
    /// - `RPC_PROCESSING_BATCH_SIZE` (default: 50)
    /// - `SIGNATURE_BATCH_SIZE` (default: 100)
    /// - `MAX_SIGNATURES_PER_CALL` (default: 1000)
    /// - `JOB_RUNNER_BIN` (default: `job_runner` next to the current executable)
    /// - `ADM_JOBS` (comma-separated, default: rpc-executor-multi)
    /// - `ADM_TICK_SECS` (default: 60)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str, default: &str| {
            lookup(name)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            db_path: text("LEDGERFLOW_DB_PATH", "data/ledgerflow.db"),

            max_jobs_running: parse_var(lookup("MAX_JOBS_RUNNING")).unwrap_or(20),
            max_jobs_queued: parse_var(lookup("MAX_JOBS_QUEUED")).unwrap_or(50),

            target_chain: lookup("TARGET_CHAIN").filter(|s| !s.trim().is_empty()),

            rpc_providers_path: text("RPC_PROVIDERS_PATH", "rpc-providers.yml"),
            markets_path: text("MARKETS_PATH", "markets.yml"),
            coins_path: text("COINS_PATH", "coins.yml"),

            rpc_timeout_ms: parse_var(lookup("RPC_TIMEOUT_MS")).unwrap_or(10_000),
            dispatch_safety_timeout_secs: parse_var(lookup("DISPATCH_SAFETY_TIMEOUT_SECS")).unwrap_or(45),

            rpc_max_cycles: parse_var(lookup("RPC_MAX_CYCLES")),
            rpc_max_calls_per_cycle: parse_var(lookup("RPC_MAX_CALLS_PER_CYCLE")),

            rpc_processing_batch_size: parse_var(lookup("RPC_PROCESSING_BATCH_SIZE")).unwrap_or(50),
            signature_batch_size: parse_var(lookup("SIGNATURE_BATCH_SIZE")).unwrap_or(100),
            max_signatures_per_call: parse_var(lookup("MAX_SIGNATURES_PER_CALL")).unwrap_or(1000),

            job_runner_bin: lookup("JOB_RUNNER_BIN").filter(|s| !s.trim().is_empty()),
            adm_jobs: lookup("ADM_JOBS")
                .map(|s| split_list(&s))
                .unwrap_or_else(|| vec!["rpc-executor-multi".to_string()]),
            adm_tick_secs: parse_var(lookup("ADM_TICK_SECS")).unwrap_or(60),
        }
    }

    pub fn controller_limits(&self) -> ControllerLimits {
        ControllerLimits {
            max_running: self.max_jobs_running,
            max_queued: self.max_jobs_queued,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn dispatch_safety_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_safety_timeout_secs)
    }

    /// The job runner to spawn: `JOB_RUNNER_BIN`, else `job_runner` beside
    /// the running executable.
    pub fn job_runner_path(&self) -> PathBuf {
        if let Some(path) = &self.job_runner_bin {
            return PathBuf::from(path);
        }
        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("job_runner")))
            .unwrap_or_else(|| PathBuf::from("job_runner"))
    }
}

/// Parse an optional raw value. Blank or malformed values count as unset.
fn parse_var<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| s.trim().parse().ok())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// An on-chain account listed in `markets.yml` or `coins.yml`.
///
/// ```yaml
/// - name: SOL/USDC
///   chain: solana
///   type: orderbook
///   address: 8BnEgHoWFysVcuFFX7QztDmzuH8r5ZFvyP3sYwn1XTh6
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackedAccount {
    pub name: String,
    pub chain: String,
    pub address: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl TrackedAccount {
    /// Load a YAML list. A file whose root is not a list yields no accounts.
    pub fn load_list(path: impl AsRef<Path>) -> Result<Vec<Self>, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::list_from_yaml_str(&content)
    }

    pub fn list_from_yaml_str(yaml: &str) -> Result<Vec<Self>, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        if !value.is_sequence() {
            log::warn!("⚠️  Account list is not a YAML sequence, ignoring");
            return Ok(Vec::new());
        }
        let accounts: Vec<TrackedAccount> = serde_yaml::from_value(value)?;
        for account in &accounts {
            if account.address.trim().is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "account '{}' has an empty address",
                    account.name
                )));
            }
        }
        Ok(accounts)
    }

    /// Keep only the accounts on `chain`.
    pub fn on_chain(accounts: Vec<Self>, chain: &str) -> Vec<Self> {
        accounts.into_iter().filter(|a| a.chain == chain).collect()
    }
}
