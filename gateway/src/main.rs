//! agentgate gateway HTTP entrypoint.
//!
//! Launches an Axum server whose priced routes sit behind the payment
//! paywall. The priced handlers here are stand-ins; the gateway's value is
//! the middleware in front of them.
//!
//! Endpoints:
//! - `GET /healthz` – liveness check
//! - `GET /.well-known/x-agentgate.json` – payment discovery document
//! - `POST /api/chat`, `POST /api/exec`, `GET /api/scrape` – priced demo
//!   handlers, gated by the paywall when listed in the pricing table
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `RPC_URL`, `RECIPIENT_ADDRESS`, `CHAIN_ID`, `TOKEN_*` configure the
//!   payment parameters (or use `--config agentgate.json`)
//! - `OTEL_*` variables enable tracing export

use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use dotenvy::dotenv;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use agentgate::config::Config;
use agentgate::ledger::RpcLedger;
use agentgate::revenue::RevenueLedger;
use agentgate::telemetry::Telemetry;
use agentgate_axum::{DISCOVERY_PATH, Paywall, PaywallConfig, discovery_document, discovery_response};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let _telemetry = Telemetry::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let app = match build_gateway(&config) {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to initialize gateway: {e}");
            std::process::exit(1);
        }
    };

    let addr = SocketAddr::from((config.host(), config.port()));
    tracing::info!("Starting agentgate at http://{addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {e}");
    }
}

fn build_gateway(config: &Config) -> Result<Router, Box<dyn std::error::Error>> {
    let paywall_config = PaywallConfig {
        recipient: config.recipient()?,
        token: config.token()?,
        chain_id: config.chain_id(),
        expiry_window_secs: config.expiry_window_secs(),
        pricing: config.pricing_table()?,
    };
    let ledger = RpcLedger::connect(config.rpc_url()?)?;
    let revenue = RevenueLedger::new();
    let paywall = Paywall::new(paywall_config.clone(), ledger)
        .with_revenue(revenue.clone())
        .with_hook(revenue.as_hook());

    let discovery = Arc::new(discovery_document(
        config.name(),
        env!("CARGO_PKG_VERSION"),
        config.chain_name(),
        &paywall_config,
    ));

    let revenue_for_stats = revenue.clone();
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            DISCOVERY_PATH,
            get(move || {
                let discovery = discovery.clone();
                async move { discovery_response(&discovery) }
            }),
        )
        .route(
            "/stats",
            get(move || {
                let revenue = revenue_for_stats.clone();
                async move {
                    let totals = revenue.totals();
                    Json(json!({
                        "requests": totals.requests,
                        "paid": totals.paid,
                        "collected": totals.collected.to_string(),
                    }))
                }
            }),
        )
        .route("/api/chat", post(chat))
        .route("/api/exec", post(exec))
        .route("/api/scrape", get(scrape))
        .layer(paywall.layer())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );
    Ok(app)
}

// The handlers below are placeholders for whatever a deployment actually
// sells. The paywall treats them as opaque.

async fn chat() -> Json<serde_json::Value> {
    Json(json!({ "reply": "This response was paid for." }))
}

async fn exec() -> Json<serde_json::Value> {
    Json(json!({ "stdout": "", "exitCode": 0 }))
}

async fn scrape() -> Json<serde_json::Value> {
    Json(json!({ "content": "" }))
}
