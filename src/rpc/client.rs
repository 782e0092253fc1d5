//! JSON-RPC 2.0 transport
//!
//! One POST per call. Every failure mode (connect error, timeout, non-2xx,
//! undecodable body, JSON-RPC `error` envelope) comes back as
//! [`RpcResponse::Failure`] so a calling loop can never be aborted by the
//! transport.

use super::ledger::RpcCall;
use super::rate_limiter::RateLimiter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Success {
        result: Value,
        status_code: u16,
    },
    Failure {
        error: String,
        status_code: Option<u16>,
    },
}

impl RpcResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, RpcResponse::Success { .. })
    }

    fn failure(error: impl Into<String>, status_code: Option<u16>) -> Self {
        RpcResponse::Failure {
            error: error.into(),
            status_code,
        }
    }
}

/// Carries a call to an endpoint. The dispatcher only talks to this seam.
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn execute(
        &self,
        call: &RpcCall,
        endpoint_url: &str,
        rate_limit_key: Option<&str>,
    ) -> RpcResponse;

    /// Minimum spacing between two calls under `key`.
    fn set_spacing(&self, key: &str, spacing: Duration);
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl RpcClient {
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, limiter })
    }

    /// Execute one call against `endpoint_url`.
    ///
    /// When `rate_limit_key` is set the call first waits on the shared limiter
    /// under that key.
    pub async fn execute(
        &self,
        call: &RpcCall,
        endpoint_url: &str,
        rate_limit_key: Option<&str>,
    ) -> RpcResponse {
        if let Some(key) = rate_limit_key {
            self.limiter.wait(key).await;
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": call.id,
            "method": call.method,
            "params": call.params,
        });

        let response = match self.http.post(endpoint_url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return RpcResponse::failure(e.to_string(), None),
        };

        let status = response.status();
        if !status.is_success() {
            return RpcResponse::failure(
                format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
                Some(status.as_u16()),
            );
        }

        let data: Value = match response.json().await {
            Ok(data) => data,
            Err(e) => return RpcResponse::failure(e.to_string(), Some(status.as_u16())),
        };

        interpret_envelope(data, status.as_u16())
    }
}

#[async_trait]
impl CallTransport for RpcClient {
    async fn execute(
        &self,
        call: &RpcCall,
        endpoint_url: &str,
        rate_limit_key: Option<&str>,
    ) -> RpcResponse {
        RpcClient::execute(self, call, endpoint_url, rate_limit_key).await
    }

    fn set_spacing(&self, key: &str, spacing: Duration) {
        self.limiter.set_interval(key, spacing);
    }
}

/// Map a decoded JSON-RPC envelope to a response.
fn interpret_envelope(mut data: Value, status_code: u16) -> RpcResponse {
    if let Some(error) = data.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return RpcResponse::failure(message, Some(status_code));
    }

    match data.get_mut("result") {
        Some(result) => RpcResponse::Success {
            result: result.take(),
            status_code,
        },
        None => RpcResponse::failure("response missing result", Some(status_code)),
    }
}
