//! Ledger access for settlement verification.
//!
//! [`LedgerSource`] is the seam between the verifier and the chain: it
//! yields transaction receipts in a provider-independent shape. The
//! production implementation ([`RpcLedger`]) reads an EVM-compatible
//! JSON-RPC endpoint through Alloy; tests use [`StaticLedger`].

use alloy::primitives::{B256, Bytes};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::types::{EvmAddress, TransactionHash};

/// One emitted log record, reduced to what verification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogView {
    /// Emitter contract address.
    pub address: EvmAddress,
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Position of this log within the receipt.
    pub log_index: u64,
}

/// A transaction receipt, reduced to what verification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptView {
    /// Whether the transaction executed successfully.
    pub status: bool,
    pub block_number: u64,
    pub logs: Vec<LogView>,
}

/// Source of transaction receipts.
///
/// Implementations must be cheap to clone or shareable behind [`Arc`]; the
/// middleware holds one per gateway and queries it once per verification.
pub trait LedgerSource {
    type Error: Debug + Display;

    /// Fetches the receipt for `tx_hash`, or `None` when the ledger does
    /// not know the transaction (not mined, pruned, or never existed).
    fn receipt(
        &self,
        tx_hash: TransactionHash,
    ) -> impl Future<Output = Result<Option<ReceiptView>, Self::Error>> + Send;
}

impl<T: LedgerSource + Sync> LedgerSource for Arc<T> {
    type Error = T::Error;

    fn receipt(
        &self,
        tx_hash: TransactionHash,
    ) -> impl Future<Output = Result<Option<ReceiptView>, Self::Error>> + Send {
        self.as_ref().receipt(tx_hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid RPC URL: {0}")]
    InvalidUrl(String),
    #[error("Ledger RPC error: {0}")]
    Rpc(String),
}

/// [`LedgerSource`] backed by an EVM JSON-RPC endpoint.
///
/// The underlying Alloy provider is connection-pooled and cloneable; one
/// instance serves all request workers.
#[derive(Debug, Clone)]
pub struct RpcLedger {
    provider: DynProvider,
}

impl RpcLedger {
    /// Connects to an HTTP JSON-RPC endpoint.
    pub fn connect(rpc_url: &str) -> Result<Self, LedgerError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e| LedgerError::InvalidUrl(format!("{e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(RpcLedger { provider })
    }

    /// Wraps an already-built provider. Used by the gateway binary to share
    /// one provider between the verifier and other chain reads.
    pub fn from_provider(provider: DynProvider) -> Self {
        RpcLedger { provider }
    }
}

impl LedgerSource for RpcLedger {
    type Error = LedgerError;

    async fn receipt(
        &self,
        tx_hash: TransactionHash,
    ) -> Result<Option<ReceiptView>, Self::Error> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash.into())
            .await
            .map_err(|e| LedgerError::Rpc(format!("{e}")))?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let logs = receipt
            .inner
            .logs()
            .iter()
            .enumerate()
            .map(|(position, log)| LogView {
                address: EvmAddress(log.inner.address),
                topics: log.inner.data.topics().to_vec(),
                data: log.inner.data.data.clone(),
                log_index: log.log_index.unwrap_or(position as u64),
            })
            .collect();
        Ok(Some(ReceiptView {
            status: receipt.status(),
            block_number: receipt.block_number.unwrap_or_default(),
            logs,
        }))
    }
}

/// Fixed in-memory ledger for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct StaticLedger {
    receipts: HashMap<TransactionHash, ReceiptView>,
}

impl StaticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_receipt(mut self, tx_hash: TransactionHash, receipt: ReceiptView) -> Self {
        self.receipts.insert(tx_hash, receipt);
        self
    }
}

impl LedgerSource for StaticLedger {
    type Error = LedgerError;

    async fn receipt(
        &self,
        tx_hash: TransactionHash,
    ) -> Result<Option<ReceiptView>, Self::Error> {
        Ok(self.receipts.get(&tx_hash).cloned())
    }
}
