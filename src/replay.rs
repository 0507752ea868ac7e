//! Replay defense: the used-reference set.
//!
//! Every admitted request consumes one ledger log record. The set keys on
//! `(txHash, logIndex)` rather than the transaction hash alone, so a single
//! batch transaction carrying several transfer logs can legitimately settle
//! several requests while each individual log is still spent exactly once.
//!
//! The set is process-wide, constructed at startup and injected into the
//! middleware. The critical section covers only the contains-and-insert
//! pair; ledger verification runs outside it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::types::TransactionHash;

/// One spendable unit of a settlement: a log record within a transaction.
pub type ClaimKey = (TransactionHash, u64);

/// Set of settlement references already accepted by this gateway.
///
/// Entries are never removed during the retention window; a restart clears
/// the set, which bounds replay defense to the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct UsedReferences {
    inner: Arc<Mutex<HashSet<ClaimKey>>>,
}

impl UsedReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims `(tx_hash, log_index)`.
    ///
    /// Returns `true` when the reference was newly added — the caller has
    /// won the claim and may admit the request. Returns `false` when some
    /// earlier request already consumed it. Under concurrent retries of the
    /// same reference, exactly one caller sees `true`.
    pub fn check_and_claim(&self, tx_hash: TransactionHash, log_index: u64) -> bool {
        let mut set = self.inner.lock().expect("used-reference set poisoned");
        set.insert((tx_hash, log_index))
    }

    /// Whether any log of `tx_hash` has been consumed. Introspection only;
    /// admission decisions go through [`check_and_claim`](Self::check_and_claim).
    pub fn contains_tx(&self, tx_hash: TransactionHash) -> bool {
        let set = self.inner.lock().expect("used-reference set poisoned");
        set.iter().any(|(hash, _)| *hash == tx_hash)
    }

    pub fn len(&self) -> usize {
        let set = self.inner.lock().expect("used-reference set poisoned");
        set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn hash(byte: u8) -> TransactionHash {
        TransactionHash([byte; 32])
    }

    #[test]
    fn test_claim_is_once_only() {
        let set = UsedReferences::new();
        assert!(set.check_and_claim(hash(1), 0));
        assert!(!set.check_and_claim(hash(1), 0));
    }

    #[test]
    fn test_distinct_log_indexes_are_independent() {
        let set = UsedReferences::new();
        assert!(set.check_and_claim(hash(1), 0));
        assert!(set.check_and_claim(hash(1), 1));
        assert!(set.check_and_claim(hash(1), 2));
        assert!(!set.check_and_claim(hash(1), 1));
        assert_eq!(set.len(), 3);
        assert!(set.contains_tx(hash(1)));
        assert!(!set.contains_tx(hash(2)));
    }

    #[test]
    fn test_concurrent_claims_admit_exactly_one() {
        let set = UsedReferences::new();
        let workers: Vec<_> = (0..16)
            .map(|_| {
                let set = set.clone();
                thread::spawn(move || set.check_and_claim(hash(7), 3))
            })
            .collect();
        let admitted = workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(set.len(), 1);
    }
}
