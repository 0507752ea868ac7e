//! Middleware for transparent 402 settlement with `reqwest_middleware`.
//!
//! [`PaywallPayments`] handles the single-fetch flow inline with an
//! existing middleware stack: on a 402 it pays the challenge through the
//! configured [`Signer`] and retries once with the settlement header. For
//! parallel or batched settlement use
//! [`SettlementClient`](crate::SettlementClient) directly.

use http::Extensions;
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware as rqm;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use agentgate::signer::{Signer, SignerError};
use agentgate::types::{
    EvmAddress, PAYMENT_HEADER, PaymentRequiredBody, SettlementRef, TokenAmount,
};

/// Errors raised while settling a 402 inside the middleware stack.
#[derive(Debug, thiserror::Error)]
pub enum PaywallPaymentsError {
    #[error("402 response carried no parseable payment requirement")]
    InvalidChallenge,
    /// The challenge demands more than the configured cap for its token.
    /// Guards a client against a hostile gateway draining its account.
    #[error("Challenge demands {requested} but at most {allowed} is allowed for {token}")]
    AmountAboveCap {
        requested: TokenAmount,
        allowed: TokenAmount,
        token: EvmAddress,
    },
    #[error("Request object is not cloneable. Are you passing a streaming body?")]
    RequestNotCloneable,
    #[error("Signer failed: {0}")]
    Signer(#[from] SignerError),
}

impl From<PaywallPaymentsError> for rqm::Error {
    fn from(error: PaywallPaymentsError) -> Self {
        rqm::Error::Middleware(error.into())
    }
}

/// Middleware that settles 402 challenges automatically.
#[derive(Clone)]
pub struct PaywallPayments {
    signer: Arc<Signer>,
    max_amount: HashMap<EvmAddress, TokenAmount>,
}

impl PaywallPayments {
    pub fn with_signer(signer: Signer) -> Self {
        PaywallPayments {
            signer: Arc::new(signer),
            max_amount: HashMap::new(),
        }
    }

    /// Caps the amount this client will pay per call for `token`.
    /// Challenges above the cap fail instead of settling.
    pub fn max(mut self, token: EvmAddress, amount: TokenAmount) -> Self {
        self.max_amount.insert(token, amount);
        self
    }

    fn assert_under_cap(
        &self,
        token: EvmAddress,
        requested: TokenAmount,
    ) -> Result<(), PaywallPaymentsError> {
        if let Some(allowed) = self.max_amount.get(&token) {
            if requested > *allowed {
                return Err(PaywallPaymentsError::AmountAboveCap {
                    requested,
                    allowed: *allowed,
                    token,
                });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl rqm::Middleware for PaywallPayments {
    /// Intercepts the response; on 402, pays and retries once.
    #[instrument(name = "paywall_payments.handle", skip_all, fields(method = %req.method(), url = %req.url()))]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let retry_req = req.try_clone();

        let res = next.clone().run(req, extensions).await?;
        if res.status() != StatusCode::PAYMENT_REQUIRED {
            return Ok(res);
        }

        let body: PaymentRequiredBody = res
            .json()
            .await
            .map_err(|_| PaywallPaymentsError::InvalidChallenge)?;
        let challenge = body.payment;
        self.assert_under_cap(challenge.token_address, challenge.amount_required)?;

        let tx_hash = self
            .signer
            .submit_transfer(
                challenge.token_address,
                challenge.recipient_address,
                challenge.amount_required,
                Some(challenge.memo),
            )
            .await
            .map_err(PaywallPaymentsError::from)?;
        let reference = SettlementRef {
            tx_hash,
            chain_id: challenge.chain_id,
        };

        let mut retry = retry_req.ok_or(PaywallPaymentsError::RequestNotCloneable)?;
        retry.headers_mut().insert(
            PAYMENT_HEADER,
            reference
                .to_string()
                .parse()
                .expect("settlement reference is always a valid header value"),
        );
        next.run(retry, extensions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate::signer::{CustodyCredentials, CustodySigner};

    fn payments() -> PaywallPayments {
        let signer = Signer::Custody(
            CustodySigner::new(
                "https://custody.example/",
                CustodyCredentials {
                    app_id: "app".to_string(),
                    app_secret: "secret".to_string(),
                    wallet_id: "w-1".to_string(),
                },
                false,
            )
            .unwrap(),
        );
        PaywallPayments::with_signer(signer)
    }

    #[test]
    fn test_cap_enforced_per_token() {
        let token: EvmAddress = "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap();
        let other: EvmAddress = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap();
        let payments = payments().max(token, TokenAmount::from(10_000u64));

        assert!(payments.assert_under_cap(token, TokenAmount::from(5000u64)).is_ok());
        assert!(payments.assert_under_cap(token, TokenAmount::from(10_000u64)).is_ok());
        assert!(matches!(
            payments.assert_under_cap(token, TokenAmount::from(10_001u64)),
            Err(PaywallPaymentsError::AmountAboveCap { .. })
        ));
        // Tokens without a cap are unrestricted.
        assert!(
            payments
                .assert_under_cap(other, TokenAmount::from(u64::MAX))
                .is_ok()
        );
    }
}
