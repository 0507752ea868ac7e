//! The discovery endpoint.
//!
//! `GET /.well-known/x-agentgate.json` advertises the gateway's payment
//! parameters so clients can settle without any out-of-band configuration:
//! chain, token, recipient, and the priced endpoints with their display
//! prices. The same JSON serves humans and machines; no content negotiation.

use axum_core::body::Body;
use axum_core::response::Response;
use http::{StatusCode, header};

use agentgate::types::{DiscoveryChain, DiscoveryDocument, EvmAddress, TokenDescriptor};

use crate::gate::PaywallConfig;

/// Conventional path the document is served at.
pub const DISCOVERY_PATH: &str = "/.well-known/x-agentgate.json";

/// Assembles the discovery document for one gateway.
pub fn discovery_document(
    name: &str,
    version: &str,
    chain_name: &str,
    config: &PaywallConfig,
) -> DiscoveryDocument {
    DiscoveryDocument {
        name: name.to_string(),
        version: version.to_string(),
        chain: DiscoveryChain {
            id: config.chain_id,
            name: chain_name.to_string(),
        },
        token: config.token.clone(),
        recipient: config.recipient,
        endpoints: config.pricing.discovery_endpoints(),
    }
}

/// Renders the document as a response. Route it with a closure:
///
/// ```rust,ignore
/// let doc = Arc::new(discovery_document("agentgate", "0.3.0", "base-sepolia", &config));
/// router.route(DISCOVERY_PATH, get(move || {
///     let doc = doc.clone();
///     async move { discovery_response(&doc) }
/// }))
/// ```
pub fn discovery_response(document: &DiscoveryDocument) -> Response {
    let bytes = serde_json::to_vec(document).expect("discovery document serialization failed");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("Failed to construct response")
}
