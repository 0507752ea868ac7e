//! Wire types for the agentgate payment protocol.
//!
//! The protocol is a challenge/settle handshake over HTTP 402: a priced
//! endpoint answers an unpaid request with a [`PaymentRequiredBody`] carrying
//! a [`PaymentRequirement`]; the client transfers tokens on the ledger and
//! retries with an `X-Payment` header holding a [`SettlementRef`]. The
//! gateway rediscovers recipient, token, and amount from the transaction's
//! emitted events, so the reference itself stays minimal.

use alloy::hex;
use alloy::primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::Arc;

use crate::memo::Memo;
use crate::money::{InvalidAmount, MoneyAmount};
use crate::timestamp::UnixTimestamp;

/// Name of the request header carrying a settlement reference.
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Flat-value shortcut headers attached to every 402 response, for clients
/// that do not parse JSON on error bodies.
pub const AMOUNT_HEADER: &str = "X-Payment-Amount";
pub const TOKEN_HEADER: &str = "X-Payment-Token";
pub const RECIPIENT_HEADER: &str = "X-Payment-Recipient";

/// Represents an EVM address.
///
/// Wrapper around `alloy::primitives::Address` providing display and
/// serialization support.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct EvmAddress(pub alloy::primitives::Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode EVM address")]
pub struct EvmAddressDecodingError;

impl FromStr for EvmAddress {
    type Err = EvmAddressDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address =
            alloy::primitives::Address::from_str(s).map_err(|_| EvmAddressDecodingError)?;
        Ok(Self(address))
    }
}

impl From<alloy::primitives::Address> for EvmAddress {
    fn from(address: alloy::primitives::Address) -> Self {
        EvmAddress(address)
    }
}

impl From<EvmAddress> for alloy::primitives::Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

/// A 32-byte ledger transaction hash, 0x-prefixed hex on the wire.
///
/// Hex comparison is case-insensitive: the parser lowercases into raw bytes,
/// so two spellings of one hash are equal.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHash(pub [u8; 32]);

static TX_HASH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid tx hash regex"));

#[derive(Debug, thiserror::Error)]
#[error("Invalid transaction hash format: must be 0x-prefixed and 64 hex chars")]
pub struct TransactionHashDecodingError;

impl FromStr for TransactionHash {
    type Err = TransactionHashDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !TX_HASH_REGEX.is_match(s) {
            return Err(TransactionHashDecodingError);
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| TransactionHashDecodingError)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| TransactionHashDecodingError)?;
        Ok(TransactionHash(array))
    }
}

impl Debug for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionHash(0x{})", hex::encode(self.0))
    }
}

impl Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for TransactionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TransactionHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TransactionHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<alloy::primitives::B256> for TransactionHash {
    fn from(value: alloy::primitives::B256) -> Self {
        TransactionHash(value.0)
    }
}

impl From<TransactionHash> for alloy::primitives::B256 {
    fn from(value: TransactionHash) -> Self {
        alloy::primitives::B256::from(value.0)
    }
}

/// A precise on-chain token amount in smallest units.
///
/// Serialized as a decimal string (`"5000"`, never hex, never a JSON number)
/// to prevent precision loss in clients that parse JSON numbers as floats.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256::ZERO);

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid token amount: must be a decimal integer")]
pub struct TokenAmountDecodingError;

impl FromStr for TokenAmount {
    type Err = TokenAmountDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenAmountDecodingError);
        }
        let value = U256::from_str_radix(s, 10).map_err(|_| TokenAmountDecodingError)?;
        Ok(TokenAmount(value))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TokenAmount::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        TokenAmount(value)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

/// A deployed token accepted by a gateway: symbol, contract, decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDescriptor {
    pub symbol: String,
    pub address: EvmAddress,
    pub decimals: u8,
}

/// The settlement reference a client sends back after paying.
///
/// Wire format is `<txHash>:<chainId>` in the `X-Payment` header. The hash
/// identifies the ledger transaction; the chain id disambiguates which
/// ledger it landed on. Everything else is rediscovered from the receipt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SettlementRef {
    pub tx_hash: TransactionHash,
    pub chain_id: u64,
}

impl SettlementRef {
    /// Parses an `X-Payment` header value.
    ///
    /// Splits on the last colon: the hash never contains one, and the chain
    /// id is always a decimal integer. Returns `None` on any malformation.
    pub fn parse_header(value: &str) -> Option<SettlementRef> {
        let value = value.trim();
        let (hash_part, chain_part) = value.rsplit_once(':')?;
        let tx_hash = hash_part.parse::<TransactionHash>().ok()?;
        let chain_id = chain_part.parse::<u64>().ok()?;
        Some(SettlementRef { tx_hash, chain_id })
    }
}

impl Display for SettlementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.chain_id)
    }
}

/// The server-issued description of what payment is owed for one call.
///
/// Issued in the body of a 402 response. Amounts appear twice: in smallest
/// units for machines (`amount_required`) and in the display unit for humans
/// (`amount_human`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub recipient_address: EvmAddress,
    pub token_address: EvmAddress,
    pub token_symbol: String,
    pub amount_required: TokenAmount,
    pub amount_human: String,
    /// Endpoint identifier, `"METHOD path"`.
    pub endpoint: String,
    pub nonce: String,
    pub expiry: UnixTimestamp,
    pub chain_id: u64,
    pub memo: Memo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentRequirement {
    /// Builds a requirement for one priced call.
    ///
    /// `price` is a display-unit decimal string (`"0.005"`); it is scaled to
    /// smallest units with integer arithmetic. The memo fingerprint binds
    /// the requirement to `(endpoint, body_hash, nonce, expiry)`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAmount`] when the price is non-positive or carries
    /// more fractional digits than the token's decimals.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        recipient: EvmAddress,
        token: &TokenDescriptor,
        price: &str,
        endpoint: &str,
        body_hash: &[u8; 32],
        nonce: String,
        expiry: UnixTimestamp,
        chain_id: u64,
        description: Option<String>,
    ) -> Result<PaymentRequirement, InvalidAmount> {
        let money = MoneyAmount::parse(price)?;
        let amount_required = TokenAmount(money.as_token_amount(token.decimals as u32)?);
        let memo = Memo::compute(endpoint, body_hash, &nonce, expiry);
        Ok(PaymentRequirement {
            recipient_address: recipient,
            token_address: token.address,
            token_symbol: token.symbol.clone(),
            amount_required,
            amount_human: money.to_string(),
            endpoint: endpoint.to_string(),
            nonce,
            expiry,
            chain_id,
            memo,
            description,
        })
    }
}

/// Machine-readable reason codes carried in 402 bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "PAYMENT_REQUIRED")]
    PaymentRequired,
    #[serde(rename = "PAYMENT_EXPIRED")]
    PaymentExpired,
    #[serde(rename = "TX_REVERTED")]
    TxReverted,
    #[serde(rename = "INSUFFICIENT")]
    Insufficient,
    #[serde(rename = "NO_MATCH")]
    NoMatch,
    #[serde(rename = "MEMO_MISMATCH")]
    MemoMismatch,
    #[serde(rename = "RPC_UNAVAILABLE")]
    RpcUnavailable,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::PaymentRequired => "PAYMENT_REQUIRED",
            ErrorCode::PaymentExpired => "PAYMENT_EXPIRED",
            ErrorCode::TxReverted => "TX_REVERTED",
            ErrorCode::Insufficient => "INSUFFICIENT",
            ErrorCode::NoMatch => "NO_MATCH",
            ErrorCode::MemoMismatch => "MEMO_MISMATCH",
            ErrorCode::RpcUnavailable => "RPC_UNAVAILABLE",
        };
        write!(f, "{s}")
    }
}

/// Human-readable settlement instructions included in 402 bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstructions {
    pub header: String,
    pub format: String,
    pub steps: Vec<String>,
}

impl PaymentInstructions {
    pub fn for_requirement(requirement: &PaymentRequirement) -> Self {
        PaymentInstructions {
            header: PAYMENT_HEADER.to_string(),
            format: "<txHash>:<chainId>".to_string(),
            steps: vec![
                format!(
                    "Transfer {} {} ({} smallest units) to {} on chain {}",
                    requirement.amount_human,
                    requirement.token_symbol,
                    requirement.amount_required,
                    requirement.recipient_address,
                    requirement.chain_id,
                ),
                format!(
                    "Include the header `{}: <txHash>:{}` on your retry",
                    PAYMENT_HEADER, requirement.chain_id,
                ),
                format!("Retry {} within {} seconds", requirement.endpoint, {
                    let now = UnixTimestamp::now();
                    requirement.expiry.as_secs().saturating_sub(now.as_secs())
                }),
            ],
        }
    }
}

/// Body of every 402 response: the requirement plus how to satisfy it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub payment: PaymentRequirement,
    pub instructions: PaymentInstructions,
}

impl PaymentRequiredBody {
    pub fn new(payment: PaymentRequirement, code: ErrorCode, error: impl Into<String>) -> Self {
        let instructions = PaymentInstructions::for_requirement(&payment);
        PaymentRequiredBody {
            error: error.into(),
            code: Some(code),
            payment,
            instructions,
        }
    }
}

/// Metadata handed to the payment-observed hook once per admitted request.
#[derive(Debug, Clone)]
pub struct PaymentObserved {
    pub from: EvmAddress,
    pub amount: TokenAmount,
    pub endpoint: String,
    pub tx_hash: TransactionHash,
    pub log_index: u64,
    pub observed_at: UnixTimestamp,
}

/// Side-effect callback invoked once per admitted request.
///
/// Runs after the settlement reference has been claimed and before the
/// downstream handler. Must never block admission: errors and panics are
/// logged and swallowed by the caller.
pub type PaymentHook = Arc<dyn Fn(&PaymentObserved) + Send + Sync>;

/// The discovery document served at `/.well-known/x-agentgate.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub version: String,
    pub chain: DiscoveryChain,
    pub token: TokenDescriptor,
    pub recipient: EvmAddress,
    pub endpoints: Vec<DiscoveryEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryChain {
    pub id: u64,
    pub name: String,
}

/// One priced endpoint as advertised in the discovery document. Prices are
/// decimal strings in the token's display unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEndpoint {
    pub method: String,
    pub path: String,
    pub price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn token() -> TokenDescriptor {
        TokenDescriptor {
            symbol: "USDC".to_string(),
            address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap(),
            decimals: 6,
        }
    }

    #[test]
    fn test_settlement_ref_parse_valid() {
        let header = "0x71b2f2c2cfc8d368a9bcb4a9ccc58e47511f49a38b05a5bbc8d1b9e6e3a1f0aa:84532";
        let parsed = SettlementRef::parse_header(header).unwrap();
        assert_eq!(parsed.chain_id, 84532);
        assert_eq!(parsed.to_string(), header);
    }

    #[test]
    fn test_settlement_ref_case_insensitive_hash() {
        let lower = "0xab000000000000000000000000000000000000000000000000000000000000cd:1";
        let upper = "0xAB000000000000000000000000000000000000000000000000000000000000CD:1";
        assert_eq!(
            SettlementRef::parse_header(lower).unwrap().tx_hash,
            SettlementRef::parse_header(upper).unwrap().tx_hash,
        );
    }

    #[test]
    fn test_settlement_ref_rejects_malformed() {
        for bad in [
            "notvalid",
            "0xabcd:1",
            "71b2f2c2cfc8d368a9bcb4a9ccc58e47511f49a38b05a5bbc8d1b9e6e3a1f0aa:1",
            "0x71b2f2c2cfc8d368a9bcb4a9ccc58e47511f49a38b05a5bbc8d1b9e6e3a1f0aa",
            "0x71b2f2c2cfc8d368a9bcb4a9ccc58e47511f49a38b05a5bbc8d1b9e6e3a1f0aa:abc",
            "0x71b2f2c2cfc8d368a9bcb4a9ccc58e47511f49a38b05a5bbc8d1b9e6e3a1f0aa:-5",
            "",
        ] {
            assert!(SettlementRef::parse_header(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_settlement_ref_roundtrip_random() {
        let mut rng = rand::rng();
        for _ in 0..128 {
            let hash: [u8; 32] = rng.random();
            let chain_id = rng.random::<u32>() as u64;
            let reference = SettlementRef {
                tx_hash: TransactionHash(hash),
                chain_id,
            };
            let header = reference.to_string();
            assert_eq!(SettlementRef::parse_header(&header), Some(reference));
        }
    }

    #[test]
    fn test_token_amount_decimal_serde() {
        let amount = TokenAmount::from(5000u64);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"5000\"");
        let back: TokenAmount = serde_json::from_str("\"5000\"").unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<TokenAmount>("\"0x1388\"").is_err());
        assert!(serde_json::from_str::<TokenAmount>("\"12.5\"").is_err());
    }

    #[test]
    fn test_requirement_build_scales_price() {
        let requirement = PaymentRequirement::build(
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
            &token(),
            "0.005",
            "POST /api/chat",
            &[0u8; 32],
            "nonce-1".to_string(),
            UnixTimestamp(2_000_000_000),
            84532,
            None,
        )
        .unwrap();
        assert_eq!(requirement.amount_required, TokenAmount::from(5000u64));
        assert_eq!(requirement.amount_human, "0.005");
        assert!(!requirement.memo.is_zero());
    }

    #[test]
    fn test_requirement_build_rejects_bad_amounts() {
        let recipient: EvmAddress =
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap();
        for bad in ["0", "-1", "0.0000001"] {
            let result = PaymentRequirement::build(
                recipient,
                &token(),
                bad,
                "POST /api/chat",
                &[0u8; 32],
                "n".to_string(),
                UnixTimestamp(2_000_000_000),
                84532,
                None,
            );
            assert!(result.is_err(), "accepted price {bad:?}");
        }
    }

    #[test]
    fn test_requirement_wire_shape() {
        let requirement = PaymentRequirement::build(
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
            &token(),
            "0.005",
            "POST /api/chat",
            &[0u8; 32],
            "nonce-1".to_string(),
            UnixTimestamp(2_000_000_000),
            84532,
            Some("chat".to_string()),
        )
        .unwrap();
        let body = PaymentRequiredBody::new(
            requirement,
            ErrorCode::PaymentRequired,
            "Payment Required",
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["payment"]["amountRequired"], "5000");
        assert_eq!(json["payment"]["chainId"], 84532);
        assert_eq!(json["payment"]["expiry"], 2_000_000_000u64);
        assert_eq!(json["instructions"]["header"], "X-Payment");
        assert_eq!(json["code"], "PAYMENT_REQUIRED");
    }
}
