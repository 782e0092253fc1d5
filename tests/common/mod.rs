//! Shared fixtures: a local JSON-RPC stub server and file-backed databases.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use ledgerflow::db::Database;
use ledgerflow::rpc::Provider;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

type Handler = dyn Fn(&Value) -> (StatusCode, Value) + Send + Sync;

#[derive(Clone)]
struct StubState {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// JSON-RPC endpoint on `127.0.0.1:0` answering through a closure.
pub struct RpcStub {
    pub url: String,
    requests: Arc<Mutex<Vec<Value>>>,
    _task: JoinHandle<()>,
}

impl RpcStub {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> (StatusCode, Value) + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = StubState {
            handler: Arc::new(handler),
            requests: requests.clone(),
        };
        let app = Router::new().route("/", post(handle)).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url,
            requests,
            _task: task,
        }
    }

    /// Request bodies received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle(State(state): State<StubState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state.requests.lock().unwrap().push(body.clone());
    let (status, response) = (state.handler)(&body);
    (status, Json(response))
}

pub fn rpc_ok(request: &Value, result: Value) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
    )
}

pub fn rpc_error(request: &Value, code: i64, message: &str) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({ "jsonrpc": "2.0", "id": request["id"], "error": { "code": code, "message": message } }),
    )
}

/// File-backed database with the schema applied. Keep the `TempDir` alive.
pub fn create_test_db() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("ledgerflow.db")).unwrap();
    db.init_schema().unwrap();
    (dir, db)
}

pub fn provider(name: &str, url: &str, max_cycles: u32, max_calls_per_cycle: usize) -> Provider {
    Provider {
        name: name.to_string(),
        chain: "solana".to_string(),
        url: url.to_string(),
        interval: Duration::from_millis(100),
        max_cycles,
        max_calls_per_cycle,
        spacing: Some(Duration::from_millis(10)),
    }
}
