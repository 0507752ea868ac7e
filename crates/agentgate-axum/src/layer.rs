//! Tower layer plumbing for the paywall.
//!
//! [`Paywall::layer`] produces a [`PaywallLayer`] that can be applied to an
//! axum `Router` or any tower service speaking axum's request/response
//! types. The wrapped service runs only for admitted (or unpriced)
//! requests; everything else is answered by the gate itself.
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::{Router, routing::post};
//! use axum::response::IntoResponse;
//! use agentgate::ledger::RpcLedger;
//! use agentgate::pricing::{PriceEntry, PricingTable, endpoint_key};
//! use agentgate_axum::{Paywall, PaywallConfig};
//!
//! let pricing = PricingTable::new()
//!     .with_price(endpoint_key("POST", "/api/chat"), PriceEntry::new("0.005"));
//! let paywall = Paywall::new(
//!     PaywallConfig {
//!         recipient: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
//!         token: agentgate::types::TokenDescriptor {
//!             symbol: "USDC".into(),
//!             address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap(),
//!             decimals: 6,
//!         },
//!         chain_id: 84532,
//!         expiry_window_secs: 300,
//!         pricing,
//!     },
//!     RpcLedger::connect("https://sepolia.base.org").unwrap(),
//! );
//!
//! let app: Router = Router::new()
//!     .route("/api/chat", post(handler))
//!     .layer(paywall.layer());
//!
//! async fn handler() -> impl IntoResponse { "paid content" }
//! ```

use axum_core::extract::Request;
use axum_core::response::Response;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use agentgate::ledger::LedgerSource;

use crate::gate::Paywall;

impl<L> Paywall<L> {
    /// Wraps this paywall as a tower layer.
    pub fn layer(&self) -> PaywallLayer<L> {
        PaywallLayer {
            paywall: self.clone(),
        }
    }
}

/// Layer applying a [`Paywall`] to an inner service.
pub struct PaywallLayer<L> {
    paywall: Paywall<L>,
}

impl<L> Clone for PaywallLayer<L> {
    fn clone(&self) -> Self {
        PaywallLayer {
            paywall: self.paywall.clone(),
        }
    }
}

impl<S, L> Layer<S> for PaywallLayer<L>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = PaywallService<L>;

    fn layer(&self, inner: S) -> Self::Service {
        PaywallService {
            paywall: self.paywall.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// The service produced by [`PaywallLayer`].
pub struct PaywallService<L> {
    paywall: Paywall<L>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<L> Clone for PaywallService<L> {
    fn clone(&self) -> Self {
        PaywallService {
            paywall: self.paywall.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<L> Service<Request> for PaywallService<L>
where
    L: LedgerSource + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let paywall = self.paywall.clone();
        let inner = self.inner.clone();
        Box::pin(async move { Ok(paywall.handle(inner, req).await) })
    }
}
