//! Client-side settlement for agentgate-protected endpoints.
//!
//! Two ways in:
//!
//! - [`SettlementClient`] — an explicit client with single
//!   ([`fetch`](SettlementClient::fetch)), parallel
//!   ([`fetch_many`](SettlementClient::fetch_many)), and batched
//!   ([`fetch_batch`](SettlementClient::fetch_batch)) settlement, deadlines,
//!   backoff, balance prechecks, and a structured event stream.
//! - [`PaywallPayments`] — a `reqwest_middleware::Middleware` that settles
//!   402s transparently inside an existing middleware stack.
//!
//! Both pay through an [`agentgate::signer::Signer`], so the local-key and
//! custody backends are interchangeable here.
//!
//! ## Example
//!
//! ```rust,no_run
//! use agentgate::signer::{LocalSigner, Signer};
//! use agentgate_reqwest::SettlementClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = Signer::Local(LocalSigner::connect(
//!     "0x…private key…",
//!     "https://sepolia.base.org",
//!     None,
//! )?);
//! let client = SettlementClient::new(reqwest::Client::new(), signer);
//!
//! let request = reqwest::Client::new()
//!     .post("https://api.example/api/chat")
//!     .body(r#"{"prompt":"hello"}"#)
//!     .build()?;
//! let response = client.fetch(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod events;
pub mod middleware;

pub use client::{SettleError, SettlementClient};
pub use events::{EventSink, PaymentEvent};
pub use middleware::{PaywallPayments, PaywallPaymentsError};
