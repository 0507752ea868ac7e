//! The client-side settlement engine.
//!
//! [`SettlementClient`] wraps a plain [`reqwest::Client`] with the
//! challenge/settle flow: it detects 402 responses, pays the advertised
//! requirement through a [`Signer`], and retries the request carrying the
//! settlement reference. Three entry points cover the common shapes:
//!
//! - [`fetch`](SettlementClient::fetch) — one request, with deadline,
//!   exponential backoff, and balance precheck,
//! - [`fetch_many`](SettlementClient::fetch_many) — several requests
//!   settled individually, concurrently when the signer's account
//!   tolerates parallel pending transactions,
//! - [`fetch_batch`](SettlementClient::fetch_batch) — several requests
//!   settled by one atomic multi-transfer, every retry carrying the same
//!   `X-Payment` header.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::instrument;

use agentgate::signer::{Signer, SignerError, TransferInstruction};
use agentgate::types::{
    EvmAddress, PAYMENT_HEADER, PaymentRequiredBody, PaymentRequirement, SettlementRef,
    TokenAmount, TransactionHash,
};

use crate::events::{EventSink, PaymentEvent};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRIES: u32 = 3;
const BACKOFF_CAP_MS: u64 = 10_000;

/// Errors surfaced by the settlement engine.
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    /// The 402 body was missing or malformed. Not retryable: the server
    /// will keep sending the same challenge.
    #[error("402 response carried no parseable payment requirement")]
    InvalidChallenge,
    /// The signing account cannot cover the requirement. Not retryable.
    #[error("Balance {balance} below required {required}")]
    InsufficientBalance {
        balance: TokenAmount,
        required: TokenAmount,
    },
    #[error("Deadline exceeded")]
    Timeout,
    #[error("Retries exhausted after {0} attempts")]
    Exhausted(u32),
    #[error("Signer failed: {0}")]
    Signer(#[from] SignerError),
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The request body is a stream and cannot be replayed.
    #[error("Request object is not cloneable. Are you passing a streaming body?")]
    RequestNotCloneable,
}

impl SettleError {
    /// Whether the single-fetch loop should back off and try again.
    fn is_retryable(&self) -> bool {
        match self {
            SettleError::Transport(_) | SettleError::Signer(_) => true,
            SettleError::InvalidChallenge
            | SettleError::InsufficientBalance { .. }
            | SettleError::Timeout
            | SettleError::Exhausted(_)
            | SettleError::RequestNotCloneable => false,
        }
    }
}

/// HTTP client with transparent 402 settlement.
#[derive(Clone)]
pub struct SettlementClient {
    http: reqwest::Client,
    signer: Arc<Signer>,
    timeout: Duration,
    max_retries: u32,
    precheck_balance: bool,
    events: EventSink,
}

impl SettlementClient {
    pub fn new(http: reqwest::Client, signer: Signer) -> Self {
        SettlementClient {
            http,
            signer: Arc::new(signer),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            precheck_balance: true,
            events: EventSink::disabled(),
        }
    }

    /// Overall deadline for one `fetch` call, settlement included.
    /// Default 60 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry budget for transient failures. Default 3.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Skips the balance read before submitting a transfer.
    pub fn without_balance_precheck(mut self) -> Self {
        self.precheck_balance = false;
        self
    }

    /// Streams [`PaymentEvent`]s to `sender`.
    pub fn with_event_sender(
        mut self,
        sender: tokio::sync::mpsc::UnboundedSender<PaymentEvent>,
    ) -> Self {
        self.events = EventSink::new(sender);
        self
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Submits `request`, settling a 402 challenge if one comes back.
    ///
    /// Transient failures (transport, ledger) are retried under exponential
    /// backoff up to the retry budget, all within the configured deadline.
    /// [`SettleError::InvalidChallenge`] and
    /// [`SettleError::InsufficientBalance`] fail immediately.
    ///
    /// The retried response is returned whatever its status: the payment
    /// already happened, and the caller needs to see what it bought.
    #[instrument(name = "settlement.fetch", skip_all, fields(url = %request.url()))]
    pub async fn fetch(&self, request: reqwest::Request) -> Result<reqwest::Response, SettleError> {
        let deadline = Instant::now() + self.timeout;
        for attempt in 0..=self.max_retries {
            if Instant::now() > deadline {
                return Err(SettleError::Timeout);
            }
            match self.fetch_once(&request, deadline).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(attempt, error = %e, "Retryable settlement failure");
                    if attempt == self.max_retries {
                        break;
                    }
                    let delay = backoff_delay(attempt);
                    self.events.emit(PaymentEvent::Retrying {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if Instant::now() + delay > deadline {
                        return Err(SettleError::Timeout);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SettleError::Exhausted(self.max_retries))
    }

    /// One attempt: submit, settle on 402, resubmit.
    async fn fetch_once(
        &self,
        request: &reqwest::Request,
        deadline: Instant,
    ) -> Result<reqwest::Response, SettleError> {
        let initial = request.try_clone().ok_or(SettleError::RequestNotCloneable)?;
        let response = self.execute(initial, deadline).await?;
        if response.status() != reqwest::StatusCode::PAYMENT_REQUIRED {
            return Ok(response);
        }
        let challenge = parse_challenge(response).await?;
        self.events.emit(PaymentEvent::PaymentRequired {
            endpoint: challenge.endpoint.clone(),
            amount: challenge.amount_required,
            token_symbol: challenge.token_symbol.clone(),
        });
        let tx_hash = self.settle_one(&challenge, deadline).await?;
        let retry = retry_with_reference(
            request,
            SettlementRef {
                tx_hash,
                chain_id: challenge.chain_id,
            },
        )?;
        self.execute(retry, deadline).await
    }

    /// Submits several requests, settling each 402 individually.
    ///
    /// Output index `i` corresponds to input index `i`; settlement order
    /// across tasks is undefined. When the signer cannot hold several
    /// pending transactions at once the settlements run as a sequential
    /// pipeline instead.
    #[instrument(name = "settlement.fetch_many", skip_all, fields(requests = requests.len()))]
    pub async fn fetch_many(
        &self,
        requests: Vec<reqwest::Request>,
    ) -> Result<Vec<reqwest::Response>, SettleError> {
        let deadline = Instant::now() + self.timeout;
        let (mut slots, pending) = self.submit_initial(requests, deadline).await?;

        if self.signer.supports_concurrent() {
            let settled = join_all(pending.into_iter().map(|(index, request, challenge)| {
                let client = self;
                async move {
                    let response = client
                        .settle_and_retry(&request, &challenge, deadline)
                        .await?;
                    Ok::<_, SettleError>((index, response))
                }
            }))
            .await;
            for result in settled {
                let (index, response) = result?;
                slots[index] = Some(response);
            }
        } else {
            // Strict-nonce account: one pending transaction at a time.
            for (index, request, challenge) in pending {
                let response = self.settle_and_retry(&request, &challenge, deadline).await?;
                slots[index] = Some(response);
            }
        }
        Ok(collect_slots(slots))
    }

    /// Submits several requests, settling every 402 with one atomic
    /// multi-transfer when the signer supports it.
    ///
    /// All retries then carry the **same** `X-Payment` header; the gateway
    /// binds each admitted request to a distinct log record inside the one
    /// receipt. Signers without batch capability fall back to
    /// [`fetch_many`](Self::fetch_many) semantics. Batches spanning more
    /// than one token also fall back, one transaction per token being no
    /// longer atomic.
    #[instrument(name = "settlement.fetch_batch", skip_all, fields(requests = requests.len()))]
    pub async fn fetch_batch(
        &self,
        requests: Vec<reqwest::Request>,
    ) -> Result<Vec<reqwest::Response>, SettleError> {
        let deadline = Instant::now() + self.timeout;
        let (mut slots, pending) = self.submit_initial(requests, deadline).await?;
        if pending.is_empty() {
            return Ok(collect_slots(slots));
        }

        let token = pending[0].2.token_address;
        let single_token = pending.iter().all(|(_, _, c)| c.token_address == token);
        if !self.signer.supports_batch() || !single_token {
            tracing::debug!(
                batchable = self.signer.supports_batch(),
                single_token,
                "Falling back to individual settlement"
            );
            return self.settle_pending_individually(slots, pending, deadline).await;
        }

        if self.precheck_balance {
            let required = pending.iter().fold(TokenAmount::ZERO, |acc, (_, _, c)| {
                TokenAmount(acc.0.saturating_add(c.amount_required.0))
            });
            self.assert_balance(token, required, deadline).await?;
        }

        let instructions: Vec<TransferInstruction> = pending
            .iter()
            .map(|(_, _, challenge)| TransferInstruction {
                recipient: challenge.recipient_address,
                amount: challenge.amount_required,
                memo: Some(challenge.memo),
            })
            .collect();
        for (_, _, challenge) in &pending {
            self.events.emit(PaymentEvent::PaymentSending {
                endpoint: challenge.endpoint.clone(),
                amount: challenge.amount_required,
            });
        }
        let tx_hash = timeout_at(deadline, self.signer.submit_batch(token, &instructions))
            .await
            .map_err(|_| SettleError::Timeout)??;
        self.events.emit(PaymentEvent::PaymentConfirmed { tx_hash });

        let retried = join_all(pending.into_iter().map(|(index, request, challenge)| {
            let reference = SettlementRef {
                tx_hash,
                chain_id: challenge.chain_id,
            };
            async move {
                let retry = retry_with_reference(&request, reference)?;
                let response = self.execute(retry, deadline).await?;
                Ok::<_, SettleError>((index, response))
            }
        }))
        .await;
        for result in retried {
            let (index, response) = result?;
            slots[index] = Some(response);
        }
        Ok(collect_slots(slots))
    }

    /// Phase 1 and 2 shared by `fetch_many` and `fetch_batch`: fire all
    /// initial requests concurrently, keep non-402 responses, and parse the
    /// challenges of the 402s.
    #[allow(clippy::type_complexity)]
    async fn submit_initial(
        &self,
        requests: Vec<reqwest::Request>,
        deadline: Instant,
    ) -> Result<
        (
            Vec<Option<reqwest::Response>>,
            Vec<(usize, reqwest::Request, PaymentRequirement)>,
        ),
        SettleError,
    > {
        let initial = join_all(requests.iter().map(|request| async {
            let clone = request.try_clone().ok_or(SettleError::RequestNotCloneable)?;
            self.execute(clone, deadline).await
        }))
        .await;

        let mut slots: Vec<Option<reqwest::Response>> = Vec::with_capacity(requests.len());
        let mut pending = Vec::new();
        for (request, result) in requests.into_iter().zip(initial) {
            let response = result?;
            if response.status() != reqwest::StatusCode::PAYMENT_REQUIRED {
                slots.push(Some(response));
            } else {
                let challenge = parse_challenge(response).await?;
                self.events.emit(PaymentEvent::PaymentRequired {
                    endpoint: challenge.endpoint.clone(),
                    amount: challenge.amount_required,
                    token_symbol: challenge.token_symbol.clone(),
                });
                let index = slots.len();
                slots.push(None);
                pending.push((index, request, challenge));
            }
        }
        Ok((slots, pending))
    }

    async fn settle_pending_individually(
        &self,
        mut slots: Vec<Option<reqwest::Response>>,
        pending: Vec<(usize, reqwest::Request, PaymentRequirement)>,
        deadline: Instant,
    ) -> Result<Vec<reqwest::Response>, SettleError> {
        for (index, request, challenge) in pending {
            let response = self.settle_and_retry(&request, &challenge, deadline).await?;
            slots[index] = Some(response);
        }
        Ok(collect_slots(slots))
    }

    /// Pays one challenge and resubmits the corresponding request.
    async fn settle_and_retry(
        &self,
        request: &reqwest::Request,
        challenge: &PaymentRequirement,
        deadline: Instant,
    ) -> Result<reqwest::Response, SettleError> {
        let tx_hash = self.settle_one(challenge, deadline).await?;
        let retry = retry_with_reference(
            request,
            SettlementRef {
                tx_hash,
                chain_id: challenge.chain_id,
            },
        )?;
        self.execute(retry, deadline).await
    }

    /// Transfers what one challenge demands and awaits confirmation.
    async fn settle_one(
        &self,
        challenge: &PaymentRequirement,
        deadline: Instant,
    ) -> Result<TransactionHash, SettleError> {
        if self.precheck_balance {
            self.assert_balance(challenge.token_address, challenge.amount_required, deadline)
                .await?;
        }
        self.events.emit(PaymentEvent::PaymentSending {
            endpoint: challenge.endpoint.clone(),
            amount: challenge.amount_required,
        });
        let tx_hash = timeout_at(
            deadline,
            self.signer.submit_transfer(
                challenge.token_address,
                challenge.recipient_address,
                challenge.amount_required,
                Some(challenge.memo),
            ),
        )
        .await
        .map_err(|_| SettleError::Timeout)??;
        self.events.emit(PaymentEvent::PaymentConfirmed { tx_hash });
        Ok(tx_hash)
    }

    async fn assert_balance(
        &self,
        token: EvmAddress,
        required: TokenAmount,
        deadline: Instant,
    ) -> Result<(), SettleError> {
        let balance = timeout_at(deadline, self.signer.balance(token))
            .await
            .map_err(|_| SettleError::Timeout)??;
        if balance < required {
            return Err(SettleError::InsufficientBalance { balance, required });
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: reqwest::Request,
        deadline: Instant,
    ) -> Result<reqwest::Response, SettleError> {
        timeout_at(deadline, self.http.execute(request))
            .await
            .map_err(|_| SettleError::Timeout)?
            .map_err(SettleError::from)
    }
}

/// `min(1000 * 2^attempt, 10000)` milliseconds.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 1000u64
        .saturating_mul(1u64 << attempt.min(10))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// Extracts the requirement from a 402 response body.
async fn parse_challenge(response: reqwest::Response) -> Result<PaymentRequirement, SettleError> {
    let body: PaymentRequiredBody = response
        .json()
        .await
        .map_err(|_| SettleError::InvalidChallenge)?;
    if body.payment.amount_required.is_zero() {
        return Err(SettleError::InvalidChallenge);
    }
    Ok(body.payment)
}

/// Clones the original request with the settlement header attached.
fn retry_with_reference(
    request: &reqwest::Request,
    reference: SettlementRef,
) -> Result<reqwest::Request, SettleError> {
    let mut retry = request.try_clone().ok_or(SettleError::RequestNotCloneable)?;
    let value = reference
        .to_string()
        .parse()
        .expect("settlement reference is always a valid header value");
    retry.headers_mut().insert(PAYMENT_HEADER, value);
    Ok(retry)
}

fn collect_slots(slots: Vec<Option<reqwest::Response>>) -> Vec<reqwest::Response> {
    slots
        .into_iter()
        .map(|slot| slot.expect("every slot filled by settlement phase"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3), Duration::from_millis(8000));
        assert_eq!(backoff_delay(4), Duration::from_millis(10000));
        assert_eq!(backoff_delay(30), Duration::from_millis(10000));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!SettleError::InvalidChallenge.is_retryable());
        assert!(
            !SettleError::InsufficientBalance {
                balance: TokenAmount::from(1u64),
                required: TokenAmount::from(2u64),
            }
            .is_retryable()
        );
        assert!(!SettleError::Timeout.is_retryable());
        assert!(!SettleError::RequestNotCloneable.is_retryable());
        assert!(SettleError::Signer(SignerError::Rpc("boom".to_string())).is_retryable());
    }

    #[test]
    fn test_retry_request_carries_header() {
        let client = reqwest::Client::new();
        let request = client
            .post("http://gateway.example/api/chat")
            .body(r#"{"prompt":"hi"}"#)
            .build()
            .unwrap();
        let reference = SettlementRef {
            tx_hash: TransactionHash([0xAB; 32]),
            chain_id: 84532,
        };
        let retry = retry_with_reference(&request, reference).unwrap();
        let header = retry.headers().get(PAYMENT_HEADER).unwrap();
        assert_eq!(header.to_str().unwrap(), reference.to_string());
        // The original body survived the clone.
        assert!(retry.body().is_some());
    }
}
