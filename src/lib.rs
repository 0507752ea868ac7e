//! Core library for the agentgate payment gateway.
//!
//! agentgate puts HTTP endpoints behind on-chain payments using the 402
//! status code. A request to a priced endpoint without proof of payment
//! receives a machine-readable payment requirement; the client transfers
//! tokens on an EVM-compatible ledger and retries with an `X-Payment`
//! header; the gateway verifies the referenced transaction against the
//! ledger before admitting the request.
//!
//! This crate holds the pieces shared by the server and client sides:
//!
//! - [`types`] — wire types: payment requirements, settlement references,
//!   the 402 body, the discovery document,
//! - [`memo`] — request-fingerprint memos,
//! - [`money`] — display-unit amount parsing and integer scaling,
//! - [`pricing`] — the endpoint pricing table,
//! - [`ledger`] / [`verifier`] — receipt fetching and settlement
//!   verification,
//! - [`replay`] — the used-reference set,
//! - [`revenue`] — operational revenue counters,
//! - [`signer`] — transfer submission via a local key or a custody API,
//! - [`config`] / [`telemetry`] — gateway configuration and observability.
//!
//! The axum middleware lives in the `agentgate-axum` crate; the client
//! settlement engine lives in `agentgate-reqwest`.

pub mod config;
pub mod ledger;
pub mod memo;
pub mod money;
pub mod pricing;
pub mod replay;
pub mod revenue;
pub mod signer;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod verifier;
