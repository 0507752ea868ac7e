//! Transfer submission: the signer abstraction.
//!
//! Two backends sit behind one tagged union: [`LocalSigner`] holds a private
//! key in memory and talks straight to the RPC endpoint; [`CustodySigner`]
//! delegates signing to an external custody API authenticated with app
//! credentials. Callers go through [`Signer`] and never branch on the
//! variant; optional capabilities (batching, concurrent submission) are
//! probed through capability flags.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy::providers::{Identity, ProviderBuilder, RootProvider};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::memo::Memo;
use crate::types::{EvmAddress, TokenAmount, TransactionHash};

sol! {
    /// Minimal surface of the payment token: balance reads plus the plain
    /// and memo-tagged transfer entry points.
    #[sol(rpc)]
    interface IPaidToken {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 value) external returns (bool);
        function transferWithMemo(address to, uint256 value, bytes32 memo) external returns (bool);
    }

    /// Helper contract packing several transfers into one atomic
    /// transaction. Either every transfer lands or the whole call reverts.
    #[sol(rpc)]
    interface ITransferDispatcher {
        function batchTransfer(
            address token,
            address[] calldata to,
            uint256[] calldata values,
            bytes32[] calldata memos
        ) external;
    }
}

/// The fully composed provider type used by the local signer.
///
/// Combines filler layers for gas, blob gas, nonce, and chain id with a
/// wallet for signing, over a [`RootProvider`] doing the JSON-RPC I/O. The
/// nonce filler keeps a per-address cache, which is what lets one account
/// hold several pending transactions at once.
pub type SigningProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// One transfer inside a batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInstruction {
    pub recipient: EvmAddress,
    pub amount: TokenAmount,
    pub memo: Option<Memo>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Invalid signing key: {0}")]
    Key(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Ledger RPC error: {0}")]
    Rpc(String),
    #[error("Transfer transaction {0} reverted")]
    Reverted(TransactionHash),
    #[error("Custody API error (status {status}): {message}")]
    Custody { status: u16, message: String },
    #[error("Custody API transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected custody API response: {0}")]
    InvalidResponse(String),
    #[error("Signer does not support batch submission")]
    BatchUnsupported,
}

/// Signs and submits token transfers.
///
/// `submit_transfer` and `submit_batch` return only after the transaction
/// has at least one confirmation.
#[derive(Debug, Clone)]
pub enum Signer {
    Local(LocalSigner),
    Custody(CustodySigner),
}

impl Signer {
    /// Address transfers are sent from.
    pub async fn address(&self) -> Result<EvmAddress, SignerError> {
        match self {
            Signer::Local(signer) => Ok(signer.address()),
            Signer::Custody(signer) => signer.resolve_address().await,
        }
    }

    /// Token balance of the signing account, in smallest units.
    pub async fn balance(&self, token: EvmAddress) -> Result<TokenAmount, SignerError> {
        match self {
            Signer::Local(signer) => signer.balance(token).await,
            Signer::Custody(signer) => signer.balance(token).await,
        }
    }

    /// Submits one transfer and awaits its first confirmation.
    pub async fn submit_transfer(
        &self,
        token: EvmAddress,
        recipient: EvmAddress,
        amount: TokenAmount,
        memo: Option<Memo>,
    ) -> Result<TransactionHash, SignerError> {
        match self {
            Signer::Local(signer) => signer.submit_transfer(token, recipient, amount, memo).await,
            Signer::Custody(signer) => {
                signer.submit_transfer(token, recipient, amount, memo).await
            }
        }
    }

    /// Packs several transfers into one atomic transaction.
    ///
    /// Only available when [`supports_batch`](Self::supports_batch) is
    /// true; other signers return [`SignerError::BatchUnsupported`].
    pub async fn submit_batch(
        &self,
        token: EvmAddress,
        transfers: &[TransferInstruction],
    ) -> Result<TransactionHash, SignerError> {
        match self {
            Signer::Local(signer) => signer.submit_batch(token, transfers).await,
            Signer::Custody(_) => Err(SignerError::BatchUnsupported),
        }
    }

    /// Whether [`submit_batch`](Self::submit_batch) is available.
    pub fn supports_batch(&self) -> bool {
        match self {
            Signer::Local(signer) => signer.dispatcher.is_some(),
            Signer::Custody(_) => false,
        }
    }

    /// Whether the backing account tolerates several pending transactions
    /// in a short window. When false, parallel settlement degrades to a
    /// sequential pipeline.
    pub fn supports_concurrent(&self) -> bool {
        match self {
            // The cached nonce filler hands out consecutive nonces without
            // waiting for confirmations.
            Signer::Local(_) => true,
            Signer::Custody(_) => false,
        }
    }
}

/// Signer holding a private key in memory.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    provider: SigningProvider,
    address: EvmAddress,
    /// Batch helper contract; batching is unavailable without one.
    dispatcher: Option<EvmAddress>,
}

impl LocalSigner {
    /// Connects a key to an RPC endpoint.
    pub fn connect(
        private_key: &str,
        rpc_url: &str,
        dispatcher: Option<EvmAddress>,
    ) -> Result<Self, SignerError> {
        let key: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| SignerError::Key(format!("{e}")))?;
        let address = EvmAddress(key.address());
        let wallet = EthereumWallet::from(key);
        let url: Url = rpc_url
            .parse()
            .map_err(|e| SignerError::InvalidUrl(format!("{e}")))?;
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(NonceFiller::default(), ChainIdFiller::default()),
            ),
        );
        let provider: SigningProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_http(url);
        tracing::info!(signer = %address, "Initialized local signer");
        Ok(LocalSigner {
            provider,
            address,
            dispatcher,
        })
    }

    pub fn address(&self) -> EvmAddress {
        self.address
    }

    async fn balance(&self, token: EvmAddress) -> Result<TokenAmount, SignerError> {
        let contract = IPaidToken::new(token.into(), &self.provider);
        let balance: U256 = contract
            .balanceOf(self.address.into())
            .call()
            .await
            .map_err(|e| SignerError::Rpc(format!("{e}")))?;
        Ok(TokenAmount(balance))
    }

    #[instrument(skip_all, err, fields(token = %token, to = %recipient, amount = %amount))]
    async fn submit_transfer(
        &self,
        token: EvmAddress,
        recipient: EvmAddress,
        amount: TokenAmount,
        memo: Option<Memo>,
    ) -> Result<TransactionHash, SignerError> {
        let contract = IPaidToken::new(token.into(), &self.provider);
        let pending = match memo.filter(|m| !m.is_zero()) {
            Some(memo) => contract
                .transferWithMemo(recipient.into(), amount.0, FixedBytes(memo.0))
                .send()
                .await
                .map_err(|e| SignerError::Rpc(format!("{e}")))?,
            None => contract
                .transfer(recipient.into(), amount.0)
                .send()
                .await
                .map_err(|e| SignerError::Rpc(format!("{e}")))?,
        };
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| SignerError::Rpc(format!("{e}")))?;
        let tx_hash = TransactionHash::from(receipt.transaction_hash);
        if !receipt.status() {
            return Err(SignerError::Reverted(tx_hash));
        }
        tracing::debug!(tx = %tx_hash, "Transfer confirmed");
        Ok(tx_hash)
    }

    #[instrument(skip_all, err, fields(token = %token, transfers = transfers.len()))]
    async fn submit_batch(
        &self,
        token: EvmAddress,
        transfers: &[TransferInstruction],
    ) -> Result<TransactionHash, SignerError> {
        let dispatcher = self.dispatcher.ok_or(SignerError::BatchUnsupported)?;
        let contract = ITransferDispatcher::new(dispatcher.into(), &self.provider);
        let to: Vec<Address> = transfers.iter().map(|t| t.recipient.into()).collect();
        let values: Vec<U256> = transfers.iter().map(|t| t.amount.0).collect();
        let memos: Vec<FixedBytes<32>> = transfers
            .iter()
            .map(|t| FixedBytes(t.memo.unwrap_or(Memo::ZERO).0))
            .collect();
        let pending = contract
            .batchTransfer(token.into(), to, values, memos)
            .send()
            .await
            .map_err(|e| SignerError::Rpc(format!("{e}")))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| SignerError::Rpc(format!("{e}")))?;
        let tx_hash = TransactionHash::from(receipt.transaction_hash);
        if !receipt.status() {
            return Err(SignerError::Reverted(tx_hash));
        }
        tracing::debug!(tx = %tx_hash, "Batch transfer confirmed");
        Ok(tx_hash)
    }
}

/// Credentials for a remote custody service.
#[derive(Debug, Clone)]
pub struct CustodyCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub wallet_id: String,
}

/// Signer delegating to an external custody API.
///
/// The API signs and submits on our behalf and answers only once the
/// transaction has a confirmation, so `submit_transfer` needs no ledger
/// access of its own. The `sponsor_fees` flag asks the service to cover
/// gas; when the service rejects sponsorship, the submission is retried
/// once without it.
#[derive(Debug, Clone)]
pub struct CustodySigner {
    http: reqwest::Client,
    base_url: Url,
    credentials: CustodyCredentials,
    sponsor_fees: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CustodyTransferRequest {
    token: EvmAddress,
    to: EvmAddress,
    amount: TokenAmount,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<Memo>,
    sponsor_fees: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustodyTransferResponse {
    tx_hash: TransactionHash,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustodyWalletResponse {
    address: EvmAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustodyBalanceResponse {
    amount: TokenAmount,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CustodyErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

const SPONSORSHIP_REJECTED: &str = "SPONSORSHIP_REJECTED";

impl CustodySigner {
    pub fn new(
        base_url: &str,
        credentials: CustodyCredentials,
        sponsor_fees: bool,
    ) -> Result<Self, SignerError> {
        let base_url: Url = base_url
            .parse()
            .map_err(|e| SignerError::InvalidUrl(format!("{e}")))?;
        Ok(CustodySigner {
            http: reqwest::Client::new(),
            base_url,
            credentials,
            sponsor_fees,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SignerError> {
        self.base_url
            .join(path)
            .map_err(|e| SignerError::InvalidUrl(format!("{e}")))
    }

    async fn resolve_address(&self) -> Result<EvmAddress, SignerError> {
        let url = self.endpoint(&format!("v1/wallets/{}", self.credentials.wallet_id))?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.credentials.app_id, Some(&self.credentials.app_secret))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let wallet: CustodyWalletResponse = response
            .json()
            .await
            .map_err(|e| SignerError::InvalidResponse(format!("{e}")))?;
        Ok(wallet.address)
    }

    async fn balance(&self, token: EvmAddress) -> Result<TokenAmount, SignerError> {
        let url = self.endpoint(&format!(
            "v1/wallets/{}/balance",
            self.credentials.wallet_id
        ))?;
        let response = self
            .http
            .get(url)
            .query(&[("token", token.to_string())])
            .basic_auth(&self.credentials.app_id, Some(&self.credentials.app_secret))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let balance: CustodyBalanceResponse = response
            .json()
            .await
            .map_err(|e| SignerError::InvalidResponse(format!("{e}")))?;
        Ok(balance.amount)
    }

    #[instrument(skip_all, err, fields(token = %token, to = %recipient, amount = %amount))]
    async fn submit_transfer(
        &self,
        token: EvmAddress,
        recipient: EvmAddress,
        amount: TokenAmount,
        memo: Option<Memo>,
    ) -> Result<TransactionHash, SignerError> {
        let memo = memo.filter(|m| !m.is_zero());
        match self
            .submit_once(token, recipient, amount, memo, self.sponsor_fees)
            .await
        {
            Err(SignerError::Custody { status: _, message }) if self.sponsor_fees && message == SPONSORSHIP_REJECTED => {
                tracing::warn!("Fee sponsorship rejected, retrying without it");
                self.submit_once(token, recipient, amount, memo, false).await
            }
            other => other,
        }
    }

    async fn submit_once(
        &self,
        token: EvmAddress,
        recipient: EvmAddress,
        amount: TokenAmount,
        memo: Option<Memo>,
        sponsor_fees: bool,
    ) -> Result<TransactionHash, SignerError> {
        let url = self.endpoint(&format!(
            "v1/wallets/{}/transfers",
            self.credentials.wallet_id
        ))?;
        let request = CustodyTransferRequest {
            token,
            to: recipient,
            amount,
            memo,
            sponsor_fees,
        };
        let response = self
            .http
            .post(url)
            .basic_auth(&self.credentials.app_id, Some(&self.credentials.app_secret))
            .json(&request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let submitted: CustodyTransferResponse = response
            .json()
            .await
            .map_err(|e| SignerError::InvalidResponse(format!("{e}")))?;
        tracing::debug!(tx = %submitted.tx_hash, "Custody transfer confirmed");
        Ok(submitted.tx_hash)
    }

    /// Maps non-success responses to [`SignerError::Custody`], surfacing
    /// the service's error code as the message when one is present.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SignerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: CustodyErrorBody = response.json().await.unwrap_or_default();
        let message = body
            .code
            .or(body.message)
            .unwrap_or_else(|| "unknown error".to_string());
        Err(SignerError::Custody {
            status: status.as_u16(),
            message,
        })
    }
}
