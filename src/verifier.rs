//! Settlement verification against the ledger.
//!
//! The verifier is stateless with respect to prior challenges: given a
//! settlement reference and a payment requirement, it reconstructs what must
//! be true (recipient, token, amount, optionally memo) and checks the
//! on-chain receipt against it. Nothing about the original 402 needs to be
//! stored server-side.
//!
//! A receipt may carry several admissible transfer logs — one batch
//! transaction settling many requests. The verifier therefore returns every
//! admissible proof, ordered memo-matches first and then by log index; the
//! middleware claims the first proof not already consumed.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use tracing::instrument;

use crate::ledger::{LedgerSource, LogView};
use crate::memo::Memo;
use crate::timestamp::UnixTimestamp;
use crate::types::{
    ErrorCode, EvmAddress, PaymentRequirement, SettlementRef, TokenAmount, TransactionHash,
};

sol! {
    /// Canonical ERC-20 transfer event.
    event Transfer(address indexed from, address indexed to, uint256 value);

    /// Extended transfer event carrying a 32-byte reconciliation memo.
    event TransferWithMemo(address indexed from, address indexed to, uint256 value, bytes32 memo);
}

/// How strictly a required memo is enforced.
///
/// The protocol default is permissive: a plain `Transfer` without a memo is
/// acceptable even when the requirement carried one, because the memo is a
/// reconciliation aid rather than a security primitive. Strict deployments
/// may refuse transfers missing a required memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoPolicy {
    #[default]
    Permissive,
    Strict,
}

/// One ledger log record that satisfies a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProof {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    /// Memo carried by the log, when it was a `TransferWithMemo`.
    pub memo: Option<Memo>,
    pub log_index: u64,
}

/// Successful verification: the receipt context plus every admissible proof.
#[derive(Debug, Clone)]
pub struct Verification {
    pub tx_hash: TransactionHash,
    pub block_number: u64,
    /// Admissible proofs, memo-matches first, then ascending log index.
    /// Never empty.
    pub proofs: Vec<TransferProof>,
}

impl Verification {
    /// The preferred proof under the tie-break rules.
    pub fn best(&self) -> &TransferProof {
        &self.proofs[0]
    }
}

/// Why a settlement reference failed verification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error("Payment requirement expired at {0}")]
    Expired(UnixTimestamp),
    #[error("Transaction reverted on-chain")]
    TxReverted,
    #[error("No transfer to the required recipient from the required token")]
    NoMatchingTransfer,
    #[error("Transferred {sent} but {required} required")]
    Insufficient {
        sent: TokenAmount,
        required: TokenAmount,
    },
    #[error("Transfer memo does not match the required memo")]
    MemoMismatch,
    #[error("Ledger read failed: {0}")]
    Ledger(String),
}

impl VerifyError {
    /// The machine-readable code carried in the 402 body.
    ///
    /// Ledger-read failures map to `RPC_UNAVAILABLE` and stay retryable:
    /// the client should resubmit rather than treat the gateway as down.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            VerifyError::Expired(_) => ErrorCode::PaymentExpired,
            VerifyError::TxReverted => ErrorCode::TxReverted,
            VerifyError::NoMatchingTransfer => ErrorCode::NoMatch,
            VerifyError::Insufficient { .. } => ErrorCode::Insufficient,
            VerifyError::MemoMismatch => ErrorCode::MemoMismatch,
            VerifyError::Ledger(_) => ErrorCode::RpcUnavailable,
        }
    }
}

/// A decoded transfer-shaped log, before requirement matching.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DecodedTransfer {
    from: EvmAddress,
    to: EvmAddress,
    value: U256,
    memo: Option<Memo>,
    log_index: u64,
}

/// Verifies settlement references against a [`LedgerSource`].
#[derive(Debug, Clone)]
pub struct LedgerVerifier<L> {
    ledger: L,
    memo_policy: MemoPolicy,
}

impl<L> LedgerVerifier<L> {
    pub fn new(ledger: L) -> Self {
        LedgerVerifier {
            ledger,
            memo_policy: MemoPolicy::default(),
        }
    }

    pub fn with_memo_policy(mut self, policy: MemoPolicy) -> Self {
        self.memo_policy = policy;
        self
    }
}

impl<L: LedgerSource + Sync> LedgerVerifier<L> {
    /// Checks the referenced transaction against `requirement`.
    ///
    /// # Errors
    ///
    /// - [`VerifyError::Expired`] when the requirement's expiry has passed,
    /// - [`VerifyError::Ledger`] on any ledger-read failure (unreachable
    ///   RPC, unknown receipt),
    /// - [`VerifyError::TxReverted`] when the transaction did not succeed,
    /// - [`VerifyError::NoMatchingTransfer`] / [`VerifyError::Insufficient`]
    ///   / [`VerifyError::MemoMismatch`] when no log satisfies the
    ///   requirement.
    #[instrument(skip_all, err, fields(tx = %reference.tx_hash, endpoint = %requirement.endpoint))]
    pub async fn verify(
        &self,
        reference: SettlementRef,
        requirement: &PaymentRequirement,
    ) -> Result<Verification, VerifyError> {
        if UnixTimestamp::now() > requirement.expiry {
            return Err(VerifyError::Expired(requirement.expiry));
        }
        let receipt = self
            .ledger
            .receipt(reference.tx_hash)
            .await
            .map_err(|e| VerifyError::Ledger(format!("{e}")))?
            .ok_or_else(|| VerifyError::Ledger("receipt not found".to_string()))?;
        if !receipt.status {
            return Err(VerifyError::TxReverted);
        }
        let decoded = decode_transfer_logs(&receipt.logs, requirement.token_address);
        let proofs = match_transfers(&decoded, requirement, self.memo_policy)?;
        tracing::debug!(
            proofs = proofs.len(),
            block = receipt.block_number,
            "Settlement verified"
        );
        Ok(Verification {
            tx_hash: reference.tx_hash,
            block_number: receipt.block_number,
            proofs,
        })
    }
}

/// Decodes every transfer-shaped log emitted by `token`.
///
/// Logs from other contracts, or with unknown topics, are skipped silently:
/// a settlement transaction may touch arbitrary other contracts.
fn decode_transfer_logs(logs: &[LogView], token: EvmAddress) -> Vec<DecodedTransfer> {
    logs.iter()
        .filter(|log| log.address == token)
        .filter_map(decode_one)
        .collect()
}

fn decode_one(log: &LogView) -> Option<DecodedTransfer> {
    let [signature, from_topic, to_topic] = log.topics.as_slice() else {
        return None;
    };
    let from = EvmAddress(Address::from_word(*from_topic));
    let to = EvmAddress(Address::from_word(*to_topic));
    if *signature == Transfer::SIGNATURE_HASH && log.data.len() >= 32 {
        Some(DecodedTransfer {
            from,
            to,
            value: U256::from_be_slice(&log.data[..32]),
            memo: None,
            log_index: log.log_index,
        })
    } else if *signature == TransferWithMemo::SIGNATURE_HASH && log.data.len() >= 64 {
        let mut memo = [0u8; 32];
        memo.copy_from_slice(&log.data[32..64]);
        Some(DecodedTransfer {
            from,
            to,
            value: U256::from_be_slice(&log.data[..32]),
            memo: Some(Memo(memo)),
            log_index: log.log_index,
        })
    } else {
        None
    }
}

/// Applies the requirement to decoded transfers.
///
/// Returns every admissible proof ordered memo-matches first then ascending
/// log index, or the failure of the preferred candidate when none is
/// admissible: recipient/token mismatch before amount before memo, matching
/// the order the checks are specified in.
fn match_transfers(
    decoded: &[DecodedTransfer],
    requirement: &PaymentRequirement,
    policy: MemoPolicy,
) -> Result<Vec<TransferProof>, VerifyError> {
    let required = requirement.amount_required.0;
    let want_memo = (!requirement.memo.is_zero()).then_some(requirement.memo);

    let mut candidates: Vec<&DecodedTransfer> = decoded
        .iter()
        .filter(|t| t.to == requirement.recipient_address)
        .collect();
    if candidates.is_empty() {
        return Err(VerifyError::NoMatchingTransfer);
    }
    // Prefer a memo match over any plain transfer; among equals, the
    // earliest log index wins.
    candidates.sort_by_key(|t| {
        let memo_rank = match (want_memo, t.memo) {
            (Some(want), Some(got)) if want == got => 0u8,
            _ => 1u8,
        };
        (memo_rank, t.log_index)
    });

    let mut proofs = Vec::new();
    for candidate in &candidates {
        if candidate.value < required {
            continue;
        }
        match (want_memo, candidate.memo) {
            (Some(want), Some(got)) if want != got => continue,
            (Some(_), None) if policy == MemoPolicy::Strict => continue,
            _ => {}
        }
        proofs.push(TransferProof {
            from: candidate.from,
            to: candidate.to,
            value: TokenAmount(candidate.value),
            memo: candidate.memo,
            log_index: candidate.log_index,
        });
    }
    if !proofs.is_empty() {
        return Ok(proofs);
    }

    // Nothing admissible: report why the preferred candidate failed,
    // amount before memo.
    let preferred = candidates[0];
    if preferred.value < required {
        return Err(VerifyError::Insufficient {
            sent: TokenAmount(preferred.value),
            required: requirement.amount_required,
        });
    }
    Err(VerifyError::MemoMismatch)
}

/// Builds the topics/data of a `Transfer` log. Shared with tests and the
/// in-memory ledger used for local development.
pub fn encode_transfer_log(from: EvmAddress, to: EvmAddress, value: U256) -> (Vec<B256>, Vec<u8>) {
    let topics = vec![
        Transfer::SIGNATURE_HASH,
        from.0.into_word(),
        to.0.into_word(),
    ];
    (topics, value.to_be_bytes::<32>().to_vec())
}

/// Builds the topics/data of a `TransferWithMemo` log.
pub fn encode_transfer_with_memo_log(
    from: EvmAddress,
    to: EvmAddress,
    value: U256,
    memo: Memo,
) -> (Vec<B256>, Vec<u8>) {
    let topics = vec![
        TransferWithMemo::SIGNATURE_HASH,
        from.0.into_word(),
        to.0.into_word(),
    ];
    let mut data = value.to_be_bytes::<32>().to_vec();
    data.extend_from_slice(&memo.0);
    (topics, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ReceiptView, StaticLedger};
    use crate::types::{TokenDescriptor, TransactionHash};

    fn addr(byte: u8) -> EvmAddress {
        EvmAddress(Address::from([byte; 20]))
    }

    fn token() -> TokenDescriptor {
        TokenDescriptor {
            symbol: "USDC".to_string(),
            address: addr(0xAA),
            decimals: 6,
        }
    }

    fn requirement(memo: Memo) -> PaymentRequirement {
        let mut requirement = PaymentRequirement::build(
            addr(0xBB),
            &token(),
            "0.005",
            "POST /api/chat",
            &[0u8; 32],
            "nonce-1".to_string(),
            UnixTimestamp(4_000_000_000),
            84532,
            None,
        )
        .unwrap();
        requirement.memo = memo;
        requirement
    }

    fn transfer_log(log_index: u64, from: EvmAddress, to: EvmAddress, value: u64) -> LogView {
        let (topics, data) = encode_transfer_log(from, to, U256::from(value));
        LogView {
            address: token().address,
            topics,
            data: data.into(),
            log_index,
        }
    }

    fn memo_log(
        log_index: u64,
        from: EvmAddress,
        to: EvmAddress,
        value: u64,
        memo: Memo,
    ) -> LogView {
        let (topics, data) =
            encode_transfer_with_memo_log(from, to, U256::from(value), memo);
        LogView {
            address: token().address,
            topics,
            data: data.into(),
            log_index,
        }
    }

    fn decoded(logs: &[LogView]) -> Vec<DecodedTransfer> {
        decode_transfer_logs(logs, token().address)
    }

    #[test]
    fn test_exact_payment_matches() {
        let logs = [transfer_log(0, addr(1), addr(0xBB), 5000)];
        let proofs =
            match_transfers(&decoded(&logs), &requirement(Memo::ZERO), MemoPolicy::Permissive)
                .unwrap();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].value, TokenAmount::from(5000u64));
        assert_eq!(proofs[0].from, addr(1));
    }

    #[test]
    fn test_overpayment_accepted() {
        let logs = [transfer_log(0, addr(1), addr(0xBB), 5001)];
        let proofs =
            match_transfers(&decoded(&logs), &requirement(Memo::ZERO), MemoPolicy::Permissive)
                .unwrap();
        assert_eq!(proofs[0].value, TokenAmount::from(5001u64));
    }

    #[test]
    fn test_underpayment_by_one_unit() {
        let logs = [transfer_log(0, addr(1), addr(0xBB), 4999)];
        let err =
            match_transfers(&decoded(&logs), &requirement(Memo::ZERO), MemoPolicy::Permissive)
                .unwrap_err();
        assert!(matches!(err, VerifyError::Insufficient { .. }));
        assert_eq!(err.wire_code(), ErrorCode::Insufficient);
    }

    #[test]
    fn test_wrong_recipient_is_no_match() {
        let logs = [transfer_log(0, addr(1), addr(0xCC), 5000)];
        let err =
            match_transfers(&decoded(&logs), &requirement(Memo::ZERO), MemoPolicy::Permissive)
                .unwrap_err();
        assert!(matches!(err, VerifyError::NoMatchingTransfer));
    }

    #[test]
    fn test_wrong_token_is_no_match() {
        let mut log = transfer_log(0, addr(1), addr(0xBB), 5000);
        log.address = addr(0xDD);
        let err = match_transfers(
            &decode_transfer_logs(&[log], token().address),
            &requirement(Memo::ZERO),
            MemoPolicy::Permissive,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::NoMatchingTransfer));
    }

    #[test]
    fn test_tie_break_earliest_log_index() {
        let logs = [
            transfer_log(4, addr(2), addr(0xBB), 5000),
            transfer_log(0, addr(1), addr(0xBB), 5000),
        ];
        let proofs =
            match_transfers(&decoded(&logs), &requirement(Memo::ZERO), MemoPolicy::Permissive)
                .unwrap();
        assert_eq!(proofs[0].log_index, 0);
        assert_eq!(proofs[1].log_index, 4);
    }

    #[test]
    fn test_memo_match_preferred_over_earlier_plain_transfer() {
        let want = Memo([7u8; 32]);
        let logs = [
            transfer_log(0, addr(1), addr(0xBB), 5000),
            memo_log(3, addr(2), addr(0xBB), 5000, want),
        ];
        let proofs =
            match_transfers(&decoded(&logs), &requirement(want), MemoPolicy::Permissive).unwrap();
        assert_eq!(proofs[0].log_index, 3);
        assert_eq!(proofs[0].memo, Some(want));
    }

    #[test]
    fn test_memo_mismatch_rejected() {
        let logs = [memo_log(0, addr(1), addr(0xBB), 5000, Memo([9u8; 32]))];
        let err = match_transfers(&decoded(&logs), &requirement(Memo([7u8; 32])), MemoPolicy::Permissive)
            .unwrap_err();
        assert!(matches!(err, VerifyError::MemoMismatch));
    }

    #[test]
    fn test_plain_transfer_satisfies_memo_requirement_when_permissive() {
        let logs = [transfer_log(0, addr(1), addr(0xBB), 5000)];
        let proofs = match_transfers(
            &decoded(&logs),
            &requirement(Memo([7u8; 32])),
            MemoPolicy::Permissive,
        )
        .unwrap();
        assert_eq!(proofs.len(), 1);
    }

    #[test]
    fn test_strict_policy_requires_memo() {
        let logs = [transfer_log(0, addr(1), addr(0xBB), 5000)];
        let err = match_transfers(
            &decoded(&logs),
            &requirement(Memo([7u8; 32])),
            MemoPolicy::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::MemoMismatch));
    }

    #[test]
    fn test_batch_receipt_yields_all_admissible_proofs() {
        let logs = [
            transfer_log(0, addr(1), addr(0xBB), 5000),
            transfer_log(1, addr(1), addr(0xBB), 5000),
            transfer_log(2, addr(1), addr(0xBB), 5000),
        ];
        let proofs =
            match_transfers(&decoded(&logs), &requirement(Memo::ZERO), MemoPolicy::Permissive)
                .unwrap();
        assert_eq!(proofs.len(), 3);
        let indexes: Vec<u64> = proofs.iter().map(|p| p.log_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn test_unknown_events_are_skipped() {
        let mut bogus = transfer_log(0, addr(1), addr(0xBB), 5000);
        bogus.topics[0] = B256::from([0x42u8; 32]);
        assert!(decoded(&[bogus]).is_empty());
    }

    #[tokio::test]
    async fn test_verify_expired_requirement() {
        let verifier = LedgerVerifier::new(StaticLedger::new());
        let mut req = requirement(Memo::ZERO);
        req.expiry = UnixTimestamp::now() - 1;
        let reference = SettlementRef {
            tx_hash: TransactionHash([1u8; 32]),
            chain_id: 84532,
        };
        let err = verifier.verify(reference, &req).await.unwrap_err();
        assert!(matches!(err, VerifyError::Expired(_)));
        assert_eq!(err.wire_code(), ErrorCode::PaymentExpired);
    }

    #[tokio::test]
    async fn test_verify_unknown_receipt_is_ledger_error() {
        let verifier = LedgerVerifier::new(StaticLedger::new());
        let reference = SettlementRef {
            tx_hash: TransactionHash([1u8; 32]),
            chain_id: 84532,
        };
        let err = verifier
            .verify(reference, &requirement(Memo::ZERO))
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), ErrorCode::RpcUnavailable);
    }

    #[tokio::test]
    async fn test_verify_reverted_transaction() {
        let tx = TransactionHash([2u8; 32]);
        let ledger = StaticLedger::new().with_receipt(
            tx,
            ReceiptView {
                status: false,
                block_number: 10,
                logs: vec![transfer_log(0, addr(1), addr(0xBB), 5000)],
            },
        );
        let verifier = LedgerVerifier::new(ledger);
        let reference = SettlementRef { tx_hash: tx, chain_id: 84532 };
        let err = verifier
            .verify(reference, &requirement(Memo::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::TxReverted));
    }

    #[tokio::test]
    async fn test_verify_success_end_to_end() {
        let tx = TransactionHash([3u8; 32]);
        let ledger = StaticLedger::new().with_receipt(
            tx,
            ReceiptView {
                status: true,
                block_number: 77,
                logs: vec![transfer_log(1, addr(1), addr(0xBB), 6000)],
            },
        );
        let verifier = LedgerVerifier::new(ledger);
        let reference = SettlementRef { tx_hash: tx, chain_id: 84532 };
        let verification = verifier
            .verify(reference, &requirement(Memo::ZERO))
            .await
            .unwrap();
        assert_eq!(verification.block_number, 77);
        assert_eq!(verification.best().log_index, 1);
        assert_eq!(verification.best().value, TokenAmount::from(6000u64));
    }
}
