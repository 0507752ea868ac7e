//! End-to-end paywall behavior against an in-memory ledger.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use agentgate::ledger::{LogView, ReceiptView, StaticLedger};
use agentgate::pricing::{PriceEntry, PricingTable, endpoint_key};
use agentgate::replay::UsedReferences;
use agentgate::types::{EvmAddress, PaymentObserved, TokenDescriptor, TransactionHash};
use agentgate::verifier::encode_transfer_log;
use agentgate_axum::{Paywall, PaywallConfig};
use alloy::primitives::{Address, U256};

const CHAIN_ID: u64 = 84532;

fn addr(byte: u8) -> EvmAddress {
    EvmAddress(Address::from([byte; 20]))
}

fn recipient() -> EvmAddress {
    addr(0xBB)
}

fn sender() -> EvmAddress {
    addr(0x51)
}

fn token() -> TokenDescriptor {
    TokenDescriptor {
        symbol: "USDC".to_string(),
        address: addr(0xAA),
        decimals: 6,
    }
}

fn transfer_log(log_index: u64, value: u64) -> LogView {
    let (topics, data) = encode_transfer_log(sender(), recipient(), U256::from(value));
    LogView {
        address: token().address,
        topics,
        data: data.into(),
        log_index,
    }
}

fn receipt(logs: Vec<LogView>) -> ReceiptView {
    ReceiptView {
        status: true,
        block_number: 123,
        logs,
    }
}

struct Gateway {
    app: Router,
    used: UsedReferences,
    observed: Arc<Mutex<Vec<PaymentObserved>>>,
}

fn gateway(ledger: StaticLedger) -> Gateway {
    let pricing = PricingTable::new()
        .with_price(
            endpoint_key("POST", "/api/chat"),
            PriceEntry::new("0.005").with_description("Chat completion"),
        )
        .with_price(endpoint_key("GET", "/api/scrape"), PriceEntry::new("0.01"));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let used = UsedReferences::new();
    let paywall = Paywall::new(
        PaywallConfig {
            recipient: recipient(),
            token: token(),
            chain_id: CHAIN_ID,
            expiry_window_secs: 300,
            pricing,
        },
        ledger,
    )
    .with_used_references(used.clone())
    .with_hook(Arc::new(move |payment: &PaymentObserved| {
        sink.lock().unwrap().push(payment.clone());
    }));

    let app = Router::new()
        .route("/public", get(|| async { "public" }))
        .route("/api/chat", post(|| async { Json(json!({"reply": "hi"})) }))
        .route("/api/scrape", get(|| async { Json(json!({"page": "..."})) }))
        .layer(paywall.layer());

    Gateway {
        app,
        used,
        observed,
    }
}

fn chat_request(payment: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(value) = payment {
        builder = builder.header("X-Payment", value);
    }
    builder
        .body(Body::from(r#"{"prompt":"hello"}"#))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn payment_header(tx: TransactionHash) -> String {
    format!("{tx}:{CHAIN_ID}")
}

#[tokio::test]
async fn unpriced_path_passes_through() {
    let gw = gateway(StaticLedger::new());
    let response = gw
        .app
        .clone()
        .oneshot(Request::get("/public").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gw.used.is_empty());
}

#[tokio::test]
async fn missing_header_yields_challenge() {
    let gw = gateway(StaticLedger::new());
    let response = gw.app.clone().oneshot(chat_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(
        response.headers().get("X-Payment-Amount").unwrap(),
        "5000"
    );
    let body = body_json(response).await;
    assert_eq!(body["payment"]["amountRequired"], "5000");
    assert_eq!(body["payment"]["amountHuman"], "0.005");
    assert_eq!(
        body["payment"]["recipientAddress"],
        recipient().to_string()
    );
    assert_eq!(body["payment"]["chainId"], CHAIN_ID);
    assert_eq!(body["payment"]["endpoint"], "POST /api/chat");
    assert_eq!(body["instructions"]["header"], "X-Payment");
    // Nonce and memo are present and non-trivial.
    assert!(!body["payment"]["nonce"].as_str().unwrap().is_empty());
    assert!(body["payment"]["memo"].as_str().unwrap().starts_with("0x"));
}

#[tokio::test]
async fn malformed_header_is_bad_request() {
    let gw = gateway(StaticLedger::new());
    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some("notvalid")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("Invalid"));
}

#[tokio::test]
async fn verified_settlement_admits_and_notifies_hook() {
    let tx = TransactionHash([0x42; 32]);
    let ledger = StaticLedger::new().with_receipt(tx, receipt(vec![transfer_log(0, 5000)]));
    let gw = gateway(ledger);

    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&payment_header(tx))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["reply"], "hi");

    let observed = gw.observed.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].from, sender());
    assert_eq!(observed[0].amount.to_string(), "5000");
    assert_eq!(observed[0].endpoint, "POST /api/chat");
    assert_eq!(observed[0].tx_hash, tx);
    assert_eq!(gw.used.len(), 1);
}

#[tokio::test]
async fn replayed_reference_is_conflict() {
    let tx = TransactionHash([0x43; 32]);
    let ledger = StaticLedger::new().with_receipt(tx, receipt(vec![transfer_log(0, 5000)]));
    let gw = gateway(ledger);
    let header = payment_header(tx);

    let first = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&header)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&header)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = body_json(second).await;
    assert_eq!(body["code"], "REPLAY");
    // Hook fired exactly once.
    assert_eq!(gw.observed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_retries_admit_exactly_once() {
    let tx = TransactionHash([0x44; 32]);
    let ledger = StaticLedger::new().with_receipt(tx, receipt(vec![transfer_log(0, 5000)]));
    let gw = gateway(ledger);
    let header = payment_header(tx);

    let (a, b) = tokio::join!(
        gw.app.clone().oneshot(chat_request(Some(&header))),
        gw.app.clone().oneshot(chat_request(Some(&header))),
    );
    let statuses = [a.unwrap().status(), b.unwrap().status()];
    assert!(statuses.contains(&StatusCode::OK));
    assert!(statuses.contains(&StatusCode::CONFLICT));
    assert_eq!(gw.observed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn batch_settlement_admits_one_request_per_log() {
    let tx = TransactionHash([0x45; 32]);
    let ledger = StaticLedger::new().with_receipt(
        tx,
        receipt(vec![
            transfer_log(0, 5000),
            transfer_log(1, 5000),
            transfer_log(2, 5000),
        ]),
    );
    let gw = gateway(ledger);
    let header = payment_header(tx);

    for _ in 0..3 {
        let response = gw
            .app
            .clone()
            .oneshot(chat_request(Some(&header)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    // Three distinct (txHash, logIndex) entries were consumed.
    assert_eq!(gw.used.len(), 3);

    // The fourth retry has nothing left to claim.
    let exhausted = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&header)))
        .await
        .unwrap();
    assert_eq!(exhausted.status(), StatusCode::CONFLICT);
    assert_eq!(gw.observed.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn underpayment_is_rejected_with_code() {
    let tx = TransactionHash([0x46; 32]);
    let ledger = StaticLedger::new().with_receipt(tx, receipt(vec![transfer_log(0, 4999)]));
    let gw = gateway(ledger);

    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&payment_header(tx))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INSUFFICIENT");
    assert!(gw.used.is_empty());
}

#[tokio::test]
async fn overpayment_is_accepted() {
    let tx = TransactionHash([0x47; 32]);
    let ledger = StaticLedger::new().with_receipt(tx, receipt(vec![transfer_log(0, 5001)]));
    let gw = gateway(ledger);

    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&payment_header(tx))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_chain_reference_is_rejected() {
    let tx = TransactionHash([0x48; 32]);
    let ledger = StaticLedger::new().with_receipt(tx, receipt(vec![transfer_log(0, 5000)]));
    let gw = gateway(ledger);

    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&format!("{tx}:1"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "NO_MATCH");
}

#[tokio::test]
async fn unknown_transaction_is_retryable_rpc_error() {
    let gw = gateway(StaticLedger::new());
    let tx = TransactionHash([0x49; 32]);

    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&payment_header(tx))))
        .await
        .unwrap();
    // 402, not 5xx: the client should resubmit rather than treat the
    // gateway as down.
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RPC_UNAVAILABLE");
}

#[tokio::test]
async fn reverted_transaction_is_rejected() {
    let tx = TransactionHash([0x4A; 32]);
    let ledger = StaticLedger::new().with_receipt(
        tx,
        ReceiptView {
            status: false,
            block_number: 5,
            logs: vec![transfer_log(0, 5000)],
        },
    );
    let gw = gateway(ledger);

    let response = gw
        .app
        .clone()
        .oneshot(chat_request(Some(&payment_header(tx))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "TX_REVERTED");
}
