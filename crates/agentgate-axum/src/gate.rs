//! The per-request payment gate.
//!
//! Each request through the paywall walks a small state machine:
//!
//! ```text
//!   UNPRICED          path not in the pricing table -> pass through
//!   CHALLENGE_ISSUED  no X-Payment header           -> 402 + requirement
//!   HEADER_MALFORMED  header present, unparseable   -> 400
//!   VERIFYING         header parsed                 -> ledger round trip
//!   REPLAY            every matching log spent      -> 409
//!   REJECTED          verification failed           -> 402 + reason code
//!   ADMITTED          a log claimed                 -> inner handler
//! ```
//!
//! Transitions are serial and leak no state between requests. The
//! used-reference claim happens before the payment-observed hook and before
//! the inner handler runs; under concurrent retries of one settlement
//! reference, exactly one request admits.

use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::Response;
use http::{HeaderValue, StatusCode, header};
use http_body_util::{BodyExt, Limited};
use serde_json::json;
use std::convert::Infallible;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tower::Service;
use tower::util::BoxCloneSyncService;
use tracing::instrument;
use uuid::Uuid;

use agentgate::ledger::LedgerSource;
use agentgate::memo::Memo;
use agentgate::pricing::{PriceEntry, PricingTable, endpoint_key};
use agentgate::replay::UsedReferences;
use agentgate::revenue::RevenueLedger;
use agentgate::timestamp::UnixTimestamp;
use agentgate::types::{
    AMOUNT_HEADER, ErrorCode, EvmAddress, PAYMENT_HEADER, PaymentHook, PaymentObserved,
    PaymentRequiredBody, PaymentRequirement, RECIPIENT_HEADER, SettlementRef, TOKEN_HEADER,
    TokenDescriptor,
};
use agentgate::verifier::{LedgerVerifier, MemoPolicy, TransferProof, Verification};

/// Largest request body buffered to fingerprint a challenge.
const MAX_CHALLENGE_BODY_BYTES: usize = 1024 * 1024;

/// Static configuration of one paywall instance.
#[derive(Debug, Clone)]
pub struct PaywallConfig {
    /// Address payments must be sent to.
    pub recipient: EvmAddress,
    /// Token payments are denominated in, unless a pricing entry overrides it.
    pub token: TokenDescriptor,
    pub chain_id: u64,
    /// Seconds a challenge stays settleable. Default 300.
    pub expiry_window_secs: u64,
    pub pricing: PricingTable,
}

/// The payment gate shared by every request worker.
///
/// Cheap to clone; all state is behind [`Arc`]s. The used-reference set may
/// be shared across several paywall instances to give them a common replay
/// domain.
pub struct Paywall<L> {
    config: Arc<PaywallConfig>,
    verifier: Arc<LedgerVerifier<L>>,
    used: UsedReferences,
    hook: Option<PaymentHook>,
    revenue: Option<RevenueLedger>,
}

impl<L> Clone for Paywall<L> {
    fn clone(&self) -> Self {
        Paywall {
            config: self.config.clone(),
            verifier: self.verifier.clone(),
            used: self.used.clone(),
            hook: self.hook.clone(),
            revenue: self.revenue.clone(),
        }
    }
}

impl<L> Paywall<L> {
    pub fn new(config: PaywallConfig, ledger: L) -> Self {
        Paywall {
            config: Arc::new(config),
            verifier: Arc::new(LedgerVerifier::new(ledger)),
            used: UsedReferences::new(),
            hook: None,
            revenue: None,
        }
    }

    /// Installs the payment-observed hook, invoked once per admitted
    /// request after the settlement reference is claimed.
    pub fn with_hook(mut self, hook: PaymentHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Shares a used-reference set with other paywall instances.
    pub fn with_used_references(mut self, used: UsedReferences) -> Self {
        self.used = used;
        self
    }

    /// Counts priced requests into `revenue`. Admissions are recorded
    /// through the hook, not here.
    pub fn with_revenue(mut self, revenue: RevenueLedger) -> Self {
        self.revenue = Some(revenue);
        self
    }

    pub fn config(&self) -> &PaywallConfig {
        &self.config
    }

    pub fn used_references(&self) -> &UsedReferences {
        &self.used
    }

    fn token_for(&self, entry: &PriceEntry) -> TokenDescriptor {
        entry.token.clone().unwrap_or_else(|| self.config.token.clone())
    }

    /// Rebuilds the requirement a retry is verified against.
    ///
    /// Verification is stateless: nothing from the original 402 is stored,
    /// so the requirement is reconstructed from the pricing entry with a
    /// fresh expiry and the zero memo. The memo stays a reconciliation aid;
    /// binding it cryptographically would require server-side challenge
    /// state.
    fn requirement_for_retry(
        &self,
        endpoint: &str,
        entry: &PriceEntry,
    ) -> Option<PaymentRequirement> {
        let token = self.token_for(entry);
        let expiry = UnixTimestamp::now() + self.config.expiry_window_secs;
        let mut requirement = PaymentRequirement::build(
            self.config.recipient,
            &token,
            &entry.price,
            endpoint,
            &Memo::body_hash(&[]),
            Uuid::new_v4().to_string(),
            expiry,
            self.config.chain_id,
            entry.description.clone(),
        )
        .ok()?;
        requirement.memo = Memo::ZERO;
        Some(requirement)
    }
}

impl<L: Clone> Paywall<L> {
    /// Switches the verifier's memo policy; the default is permissive.
    pub fn with_memo_policy(mut self, policy: MemoPolicy) -> Self {
        let verifier = (*self.verifier).clone().with_memo_policy(policy);
        self.verifier = Arc::new(verifier);
        self
    }
}

impl<L> Paywall<L>
where
    L: LedgerSource + Send + Sync,
{
    /// Runs the state machine for one request.
    #[instrument(name = "paywall.handle", skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn handle(
        &self,
        mut inner: BoxCloneSyncService<Request, Response, Infallible>,
        req: Request,
    ) -> Response {
        let endpoint = endpoint_key(req.method().as_str(), req.uri().path());
        let Some(entry) = self.config.pricing.lookup(&endpoint).cloned() else {
            // UNPRICED: not ours to gate.
            return match inner.call(req).await {
                Ok(response) => response,
                Err(infallible) => match infallible {},
            };
        };
        if let Some(revenue) = &self.revenue {
            revenue.count_request();
        }

        let header = req
            .headers()
            .get(PAYMENT_HEADER)
            .map(|h| h.to_str().unwrap_or("").to_string());
        match header {
            None => self.issue_challenge(&endpoint, &entry, req).await,
            Some(raw) => match SettlementRef::parse_header(&raw) {
                None => malformed_header_response(),
                Some(reference) => {
                    self.verify_and_admit(&endpoint, &entry, reference, inner, req)
                        .await
                }
            },
        }
    }

    /// CHALLENGE_ISSUED: fingerprint the request and describe what it costs.
    async fn issue_challenge(&self, endpoint: &str, entry: &PriceEntry, req: Request) -> Response {
        let token = self.token_for(entry);
        let body = Limited::new(req.into_body(), MAX_CHALLENGE_BODY_BYTES);
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => {
                return json_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    json!({ "error": "Request body too large to price" }),
                );
            }
        };
        let expiry = UnixTimestamp::now() + self.config.expiry_window_secs;
        let requirement = PaymentRequirement::build(
            self.config.recipient,
            &token,
            &entry.price,
            endpoint,
            &Memo::body_hash(&body_bytes),
            Uuid::new_v4().to_string(),
            expiry,
            self.config.chain_id,
            entry.description.clone(),
        );
        match requirement {
            Ok(requirement) => {
                tracing::debug!(endpoint, amount = %requirement.amount_required, "Issuing payment challenge");
                payment_required_response(PaymentRequiredBody::new(
                    requirement,
                    ErrorCode::PaymentRequired,
                    "Payment Required",
                ))
            }
            // Prices are validated at construction; reaching this means the
            // table was built bypassing validate().
            Err(e) => {
                tracing::error!(endpoint, error = %e, "Unpriceable endpoint");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Endpoint misconfigured" }),
                )
            }
        }
    }

    /// VERIFYING -> ADMITTED | REJECTED | REPLAY.
    async fn verify_and_admit(
        &self,
        endpoint: &str,
        entry: &PriceEntry,
        reference: SettlementRef,
        mut inner: BoxCloneSyncService<Request, Response, Infallible>,
        req: Request,
    ) -> Response {
        let Some(requirement) = self.requirement_for_retry(endpoint, entry) else {
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Endpoint misconfigured" }),
            );
        };
        if reference.chain_id != self.config.chain_id {
            tracing::debug!(
                got = reference.chain_id,
                want = self.config.chain_id,
                "Settlement on wrong chain"
            );
            return rejected_response(&requirement, ErrorCode::NoMatch, "Wrong chain");
        }
        let verification = match self.verifier.verify(reference, &requirement).await {
            Ok(verification) => verification,
            Err(e) => {
                tracing::debug!(error = %e, "Settlement verification failed");
                return rejected_response(&requirement, e.wire_code(), &e.to_string());
            }
        };

        // The claim must precede both the hook and the inner handler; this
        // closes the race where two concurrent retries of one reference
        // both pass verification.
        let Some(claimed) = self.claim_first_unused(&verification) else {
            tracing::debug!(tx = %reference.tx_hash, "Settlement reference already used");
            return replay_response();
        };

        let observed = PaymentObserved {
            from: claimed.from,
            amount: claimed.value,
            endpoint: endpoint.to_string(),
            tx_hash: verification.tx_hash,
            log_index: claimed.log_index,
            observed_at: UnixTimestamp::now(),
        };
        self.notify_hook(&observed);

        tracing::info!(
            tx = %observed.tx_hash,
            log_index = observed.log_index,
            from = %observed.from,
            amount = %observed.amount,
            endpoint,
            "Payment admitted"
        );
        match inner.call(req).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        }
    }

    /// Claims the first proof not already consumed. A batch transaction
    /// carries one log per settled request; each retry bearing the shared
    /// reference consumes the next unused log.
    fn claim_first_unused(&self, verification: &Verification) -> Option<TransferProof> {
        verification.proofs.iter().find_map(|proof| {
            self.used
                .check_and_claim(verification.tx_hash, proof.log_index)
                .then(|| proof.clone())
        })
    }

    /// Hook failures are logged and swallowed; admission is already decided.
    fn notify_hook(&self, observed: &PaymentObserved) {
        if let Some(hook) = &self.hook {
            let result = catch_unwind(AssertUnwindSafe(|| hook(observed)));
            if result.is_err() {
                tracing::error!(tx = %observed.tx_hash, "Payment hook panicked");
            }
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("Failed to construct response")
}

/// HEADER_MALFORMED: 400 with the expected shape spelled out.
fn malformed_header_response() -> Response {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({
            "error": format!("Invalid {PAYMENT_HEADER} header"),
            "expected": "<txHash>:<chainId>",
        }),
    )
}

/// REPLAY: 409, nothing left to claim on this reference.
fn replay_response() -> Response {
    json_response(
        StatusCode::CONFLICT,
        json!({
            "error": "Settlement reference already used",
            "code": "REPLAY",
        }),
    )
}

/// Serializes a 402 with the flat shortcut headers attached.
fn payment_required_response(body: PaymentRequiredBody) -> Response {
    let amount = body.payment.amount_required.to_string();
    let token = body.payment.token_address.to_string();
    let recipient = body.payment.recipient_address.to_string();
    let bytes = serde_json::to_vec(&body).expect("402 body serialization failed");
    let mut response = Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("Failed to construct response");
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&amount) {
        headers.insert(AMOUNT_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&token) {
        headers.insert(TOKEN_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&recipient) {
        headers.insert(RECIPIENT_HEADER, value);
    }
    response
}

/// REJECTED: 402 carrying the failure code and a fresh challenge.
fn rejected_response(requirement: &PaymentRequirement, code: ErrorCode, reason: &str) -> Response {
    payment_required_response(PaymentRequiredBody::new(requirement.clone(), code, reason))
}
