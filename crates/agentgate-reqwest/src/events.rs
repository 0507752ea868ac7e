//! Structured settlement events.
//!
//! The settlement client narrates its progress through [`PaymentEvent`]s so
//! callers can surface payment activity (spinners, audit logs) without
//! scraping log output. Events are best-effort: a dropped receiver never
//! blocks or fails a settlement.

use tokio::sync::mpsc::UnboundedSender;

use agentgate::types::{TokenAmount, TransactionHash};

/// One step of a settlement in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    /// A 402 challenge arrived and was parsed.
    PaymentRequired {
        endpoint: String,
        amount: TokenAmount,
        token_symbol: String,
    },
    /// The transfer is being submitted to the ledger.
    PaymentSending {
        endpoint: String,
        amount: TokenAmount,
    },
    /// The transfer confirmed.
    PaymentConfirmed { tx_hash: TransactionHash },
    /// A retryable failure; the client will back off and try again.
    Retrying { attempt: u32, delay_ms: u64 },
}

/// Fan-out point for [`PaymentEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<UnboundedSender<PaymentEvent>>,
}

impl EventSink {
    pub fn new(sender: UnboundedSender<PaymentEvent>) -> Self {
        EventSink {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        EventSink::default()
    }

    /// Emits to the channel (when attached) and to tracing.
    pub fn emit(&self, event: PaymentEvent) {
        match &event {
            PaymentEvent::PaymentRequired {
                endpoint, amount, ..
            } => {
                tracing::debug!(endpoint = %endpoint, %amount, "Payment required");
            }
            PaymentEvent::PaymentSending { endpoint, amount } => {
                tracing::debug!(endpoint = %endpoint, %amount, "Submitting payment");
            }
            PaymentEvent::PaymentConfirmed { tx_hash } => {
                tracing::info!(tx = %tx_hash, "Payment confirmed");
            }
            PaymentEvent::Retrying { attempt, delay_ms } => {
                tracing::debug!(attempt, delay_ms, "Retrying after failure");
            }
        }
        if let Some(sender) = &self.sender {
            // A closed receiver is not an error.
            let _ = sender.send(event);
        }
    }
}
