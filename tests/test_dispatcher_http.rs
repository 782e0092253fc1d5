//! Dispatcher and processors against a local JSON-RPC endpoint.

mod common;

use axum::http::StatusCode;
use common::{create_test_db, provider, rpc_error, rpc_ok, RpcStub};
use ledgerflow::backfill::{BackfillState, SignatureBackfill};
use ledgerflow::processors::signatures::SignatureProcessor;
use ledgerflow::receipts::ReceiptLedger;
use ledgerflow::rpc::ledger::NewCall;
use ledgerflow::rpc::{Dispatcher, RateLimiter, RpcClient, RpcLedger};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn dispatcher(ledger: &RpcLedger) -> Dispatcher {
    let client = RpcClient::new(Arc::new(RateLimiter::new()), Duration::from_secs(5)).unwrap();
    Dispatcher::new(ledger.clone(), Arc::new(client), "solana")
        .with_safety_timeout(Duration::from_secs(20))
}

#[tokio::test]
async fn test_failed_provider_leaves_call_pending_for_next_one() {
    let (_dir, db) = create_test_db();
    let ledger = RpcLedger::new(db);
    let call_id = ledger
        .create_call(
            &NewCall::new("getSlot", json!([])).with_rate_limit_key("solana-mainnet"),
        )
        .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let flaky_hits = hits.clone();
    let flaky = RpcStub::start(move |req| {
        if flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
            (StatusCode::SERVICE_UNAVAILABLE, json!({}))
        } else {
            rpc_error(req, -32005, "Node is behind")
        }
    })
    .await;

    let summary = dispatcher(&ledger)
        .run(vec![provider("flaky", &flaky.url, 2, 10)])
        .await;
    assert!(!summary.timed_out);
    assert_eq!(summary.providers["flaky"].failed, 2);

    let results = ledger.results_for(call_id).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].error.as_deref(), Some("HTTP 503: Service Unavailable"));
    assert_eq!(results[1].error.as_deref(), Some("Node is behind"));
    assert_eq!(ledger.fetch_pending(10).unwrap().len(), 1);

    let good = RpcStub::start(|req| rpc_ok(req, json!(4242))).await;
    let summary = dispatcher(&ledger)
        .run(vec![provider("good", &good.url, 1, 10)])
        .await;
    assert_eq!(summary.providers["good"].succeeded, 1);

    let satisfied = ledger.satisfied_result(call_id).unwrap().unwrap();
    assert_eq!(satisfied.source, "good");
    assert_eq!(satisfied.result, Some(json!(4242)));
    assert!(ledger.fetch_pending(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_request_is_a_json_rpc_envelope() {
    let (_dir, db) = create_test_db();
    let ledger = RpcLedger::new(db);
    let params = json!(["mktA", { "limit": 5 }]);
    let call_id = ledger
        .create_call(
            &NewCall::new("getSignaturesForAddress", params.clone())
                .with_rate_limit_key("solana-mainnet"),
        )
        .unwrap();

    let stub = RpcStub::start(|req| rpc_ok(req, json!([]))).await;
    dispatcher(&ledger)
        .run(vec![provider("stub", &stub.url, 1, 10)])
        .await;

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["jsonrpc"], "2.0");
    assert_eq!(requests[0]["id"], call_id);
    assert_eq!(requests[0]["method"], "getSignaturesForAddress");
    assert_eq!(requests[0]["params"], params);
}

#[tokio::test]
async fn test_unreachable_provider_records_error() {
    let (_dir, db) = create_test_db();
    let ledger = RpcLedger::new(db);
    let call_id = ledger
        .create_call(&NewCall::new("getSlot", json!([])).with_rate_limit_key("solana"))
        .unwrap();

    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);

    let summary = dispatcher(&ledger)
        .run(vec![provider("down", &url, 1, 10)])
        .await;
    assert_eq!(summary.providers["down"].failed, 1);

    let results = ledger.results_for(call_id).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].result.is_none());
    assert!(results[0].error.is_some());
}

#[tokio::test]
async fn test_backfill_walks_history_through_dispatcher() {
    let (_dir, db) = create_test_db();
    let ledger = RpcLedger::new(db.clone());
    let backfill = SignatureBackfill::new(
        ledger.clone(),
        ReceiptLedger::new(db.clone()),
        "solana",
        2,
    );

    let stub = RpcStub::start(|req| {
        let before = req["params"][1].get("before").and_then(|b| b.as_str());
        match before {
            None => rpc_ok(
                req,
                json!([
                    { "signature": "sigA", "slot": 11, "blockTime": 1700000100, "err": null },
                    { "signature": "sigB", "slot": 10, "blockTime": 1700000000, "err": null }
                ]),
            ),
            Some(_) => rpc_ok(req, json!([])),
        }
    })
    .await;
    let addresses = vec!["mktA".to_string()];

    let first = backfill.run(&addresses, Some(1));
    assert_eq!(first.addresses[0].state, BackfillState::FirstRun);
    dispatcher(&ledger)
        .run(vec![provider("stub", &stub.url, 1, 10)])
        .await;

    let second = backfill.run(&addresses, Some(2));
    assert!(matches!(
        &second.addresses[0].state,
        BackfillState::ReadyWithCursor { cursor, .. } if cursor == "sigB"
    ));
    dispatcher(&ledger)
        .run(vec![provider("stub", &stub.url, 1, 10)])
        .await;

    let third = backfill.run(&addresses, Some(3));
    assert!(matches!(third.addresses[0].state, BackfillState::ReadyEmpty { .. }));
    assert!(third.scheduled_calls().is_empty());

    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1]["params"][1]["before"], "sigB");

    let report = SignatureProcessor::new(db.clone()).run(10, Some(4)).unwrap();
    assert_eq!(report.processed, 2);
    let stored: i64 = db
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM signatures", [], |r| r.get(0))?))
        .unwrap();
    assert_eq!(stored, 2);
}
