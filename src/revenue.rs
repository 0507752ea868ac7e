//! Operational revenue counters.
//!
//! Not protocol-critical: totals plus a bounded ring of the most recent
//! accepted settlements, for dashboards and debugging. Updated from the
//! payment-observed hook, which runs after admission; a failure here must
//! never reject an already-verified request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use alloy::primitives::U256;

use crate::types::{PaymentHook, PaymentObserved, TokenAmount};

/// How many recent settlements the ring buffer retains.
const RECENT_CAPACITY: usize = 100;

/// Monotonic totals since process start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevenueTotals {
    /// Priced requests seen, paid or not.
    pub requests: u64,
    /// Requests admitted with a verified settlement.
    pub paid: u64,
    /// Cumulative smallest-unit amount across admitted settlements.
    pub collected: TokenAmount,
}

#[derive(Debug)]
struct Inner {
    totals: RevenueTotals,
    recent: VecDeque<PaymentObserved>,
}

/// Process-wide revenue ledger, injected at startup.
#[derive(Debug, Clone)]
pub struct RevenueLedger {
    inner: Arc<Mutex<Inner>>,
}

impl Default for RevenueLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RevenueLedger {
    pub fn new() -> Self {
        RevenueLedger {
            inner: Arc::new(Mutex::new(Inner {
                totals: RevenueTotals::default(),
                recent: VecDeque::with_capacity(RECENT_CAPACITY),
            })),
        }
    }

    /// Counts one priced request, before its outcome is known.
    pub fn count_request(&self) {
        let mut inner = self.inner.lock().expect("revenue ledger poisoned");
        inner.totals.requests += 1;
    }

    /// Records one admitted settlement.
    pub fn record(&self, observed: &PaymentObserved) {
        let mut inner = self.inner.lock().expect("revenue ledger poisoned");
        inner.totals.paid += 1;
        inner.totals.collected =
            TokenAmount(inner.totals.collected.0.saturating_add(observed.amount.0));
        if inner.recent.len() == RECENT_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(observed.clone());
    }

    pub fn totals(&self) -> RevenueTotals {
        let inner = self.inner.lock().expect("revenue ledger poisoned");
        inner.totals.clone()
    }

    /// Most recent accepted settlements, oldest first, at most 100.
    pub fn recent(&self) -> Vec<PaymentObserved> {
        let inner = self.inner.lock().expect("revenue ledger poisoned");
        inner.recent.iter().cloned().collect()
    }

    /// Wraps this ledger as a payment-observed hook.
    pub fn as_hook(&self) -> PaymentHook {
        let ledger = self.clone();
        Arc::new(move |observed: &PaymentObserved| ledger.record(observed))
    }
}

impl RevenueTotals {
    pub fn collected_u256(&self) -> U256 {
        self.collected.0
    }
}
