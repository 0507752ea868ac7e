//! Axum middleware enforcing agentgate payments on priced routes.
//!
//! The paywall maps each request to a price by its `"METHOD path"`
//! identifier. Requests without an `X-Payment` header receive a
//! `402 Payment Required` challenge describing the transfer owed; requests
//! carrying a settlement reference are verified against the ledger, checked
//! for replay, and admitted to the inner handler only once per ledger log
//! record.
//!
//! See [`Paywall`] for construction and [`gate`] for the per-request state
//! machine. The discovery document for `/.well-known/x-agentgate.json` is
//! assembled by [`discovery::discovery_document`].

pub mod discovery;
pub mod gate;
pub mod layer;

pub use discovery::{DISCOVERY_PATH, discovery_document, discovery_response};
pub use gate::{Paywall, PaywallConfig};
pub use layer::{PaywallLayer, PaywallService};
