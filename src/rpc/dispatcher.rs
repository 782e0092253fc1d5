//! Multi-provider dispatcher
//!
//! Each provider runs its own polling loop on its own interval:
//! 1. Pull up to `max_calls_per_cycle` pending calls for the chain
//! 2. Execute them one at a time through the transport client
//! 3. Append one result row per attempt, tagged with the provider name
//!
//! A loop stops after `max_cycles` cycles. The run as a whole returns when all
//! loops have stopped or the safety timeout fires, whichever comes first. On
//! timeout the loops are told to stop and `run` returns at once. Loops are
//! detached tasks, so a call that is already in flight keeps going and its
//! result is still recorded (as long as the runtime is alive) before the loop
//! exits. The summary reflects what had finished by the deadline.
//!
//! Rows are not claimed before execution, so two providers may run the same
//! call inside one window. Extra result rows are harmless to the ledger and
//! processors only ever read the first error-free result.

use super::client::{CallTransport, RpcResponse};
use super::ledger::{RpcCall, RpcLedger};
use super::providers::Provider;
use crate::db::now_millis;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_SAFETY_TIMEOUT: Duration = Duration::from_secs(45);

/// Per-provider counters for one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub cycles: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub providers: BTreeMap<String, ProviderStats>,
    pub timed_out: bool,
}

impl DispatchSummary {
    pub fn total_attempts(&self) -> u32 {
        self.providers.values().map(|s| s.succeeded + s.failed).sum()
    }
}

pub struct Dispatcher {
    ledger: RpcLedger,
    transport: Arc<dyn CallTransport>,
    chain: String,
    safety_timeout: Duration,
}

impl Dispatcher {
    pub fn new(ledger: RpcLedger, transport: Arc<dyn CallTransport>, chain: impl Into<String>) -> Self {
        Self {
            ledger,
            transport,
            chain: chain.into(),
            safety_timeout: DEFAULT_SAFETY_TIMEOUT,
        }
    }

    pub fn with_safety_timeout(mut self, timeout: Duration) -> Self {
        self.safety_timeout = timeout;
        self
    }

    /// Run every provider loop until each has used its cycles or the safety
    /// timeout elapses.
    pub async fn run(&self, providers: Vec<Provider>) -> DispatchSummary {
        log::info!(
            "🚀 Dispatching for chain {} with {} providers (safety timeout {:?})",
            self.chain,
            providers.len(),
            self.safety_timeout
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let stats: SharedStats = Arc::new(Mutex::new(BTreeMap::new()));

        for provider in providers {
            if let Some(spacing) = provider.spacing {
                self.transport.set_spacing(&provider.name, spacing);
            }
            log::info!(
                "   ├─ {} ({}, interval: {:?}, {} cycles x {} calls)",
                provider.name,
                provider.url,
                provider.interval,
                provider.max_cycles,
                provider.max_calls_per_cycle
            );

            lock_stats(&stats).insert(provider.name.clone(), ProviderStats::default());
            let worker = ProviderLoop {
                ledger: self.ledger.clone(),
                transport: Arc::clone(&self.transport),
                chain: self.chain.clone(),
                provider,
                stop: stop_rx.clone(),
                stats: Arc::clone(&stats),
            };
            let done = done_tx.clone();
            tokio::spawn(async move {
                let name = worker.run().await;
                let _ = done.send(name);
            });
        }
        drop(done_tx);

        let mut timed_out = false;
        let deadline = tokio::time::sleep(self.safety_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                finished = done_rx.recv() => match finished {
                    Some(name) => log::debug!("Provider loop {} finished", name),
                    None => break,
                },
                _ = &mut deadline => {
                    log::warn!("⏰ Safety timeout reached, stopping provider loops");
                    timed_out = true;
                    let _ = stop_tx.send(true);
                    break;
                }
            }
        }

        if !timed_out {
            log::info!("✅ All providers completed their cycles");
        }
        let providers = lock_stats(&stats).clone();
        DispatchSummary {
            providers,
            timed_out,
        }
    }
}

type SharedStats = Arc<Mutex<BTreeMap<String, ProviderStats>>>;

fn lock_stats(stats: &SharedStats) -> std::sync::MutexGuard<'_, BTreeMap<String, ProviderStats>> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ProviderLoop {
    ledger: RpcLedger,
    transport: Arc<dyn CallTransport>,
    chain: String,
    provider: Provider,
    stop: watch::Receiver<bool>,
    stats: SharedStats,
}

impl ProviderLoop {
    async fn run(mut self) -> String {
        let mut cycles = 0;
        let mut timer = interval(self.provider.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while cycles < self.provider.max_cycles {
            tokio::select! {
                _ = timer.tick() => {}
                changed = self.stop.changed() => {
                    // Sender gone: the dispatch run was dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if self.stopped() {
                break;
            }

            self.cycle(cycles).await;
            cycles += 1;
            self.update(|stats| stats.cycles = cycles);
        }

        if cycles >= self.provider.max_cycles {
            log::info!("🏁 Provider {} completed {} cycles", self.provider.name, cycles);
        }
        self.provider.name
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn update(&self, f: impl FnOnce(&mut ProviderStats)) {
        if let Some(stats) = lock_stats(&self.stats).get_mut(&self.provider.name) {
            f(stats);
        }
    }

    async fn cycle(&self, completed_cycles: u32) {
        let calls = match self
            .ledger
            .fetch_pending_for_chain(&self.chain, self.provider.max_calls_per_cycle)
        {
            Ok(calls) => calls,
            Err(e) => {
                log::error!("❌ Failed to fetch pending calls for {}: {}", self.provider.name, e);
                return;
            }
        };

        if calls.is_empty() {
            log::debug!("No pending calls for provider {}", self.provider.name);
            return;
        }

        log::info!(
            "📡 {} executing {} calls (cycle {}/{})",
            self.provider.name,
            calls.len(),
            completed_cycles + 1,
            self.provider.max_cycles
        );

        for call in calls {
            if self.stopped() {
                break;
            }
            if self.execute(&call).await {
                self.update(|stats| stats.succeeded += 1);
            } else {
                self.update(|stats| stats.failed += 1);
            }
        }
    }

    /// Execute and record one attempt. Returns whether it succeeded.
    async fn execute(&self, call: &RpcCall) -> bool {
        let started_at = now_millis();
        let response = self
            .transport
            .execute(call, &self.provider.url, Some(&self.provider.name))
            .await;

        match &response {
            RpcResponse::Success { .. } => {
                log::debug!("✅ call {} ({}) via {}", call.id, call.method, self.provider.name)
            }
            RpcResponse::Failure { error, .. } => {
                log::warn!(
                    "⚠️  call {} ({}) via {} failed: {}",
                    call.id,
                    call.method,
                    self.provider.name,
                    error
                )
            }
        }

        if let Err(e) = self
            .ledger
            .record_result(call.id, &self.provider.name, &response, started_at)
        {
            log::error!("❌ Failed to record result for call {}: {}", call.id, e);
        }
        response.is_success()
    }
}
