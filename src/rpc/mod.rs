//! Outbound JSON-RPC: rate limiting, transport, the call ledger and the
//! multi-provider dispatcher.

pub mod client;
pub mod dispatcher;
pub mod ledger;
pub mod providers;
pub mod rate_limiter;

pub use client::{CallTransport, RpcClient, RpcResponse};
pub use dispatcher::{DispatchSummary, Dispatcher, ProviderStats};
pub use ledger::{CompletedCall, NewCall, RpcCall, RpcCallResult, RpcLedger};
pub use providers::{Provider, ProviderFile};
pub use rate_limiter::RateLimiter;
