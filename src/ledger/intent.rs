//! Payment Intent Rows
//!
//! An intent tracks one wager funding attempt against external custodial
//! confirmations. The idempotency key is the externally supplied
//! `reference`; statuses only move forward, so duplicate webhook delivery
//! is harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{DuelId, UserId};

/// Normalized funding status. Transitions are monotonic: once out of
/// `Pending` a row never changes status again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Awaiting external confirmation.
    Pending,
    /// Funds confirmed by the payment provider.
    Confirmed,
    /// Confirmation failed or timed out.
    Failed,
    /// Cancelled before confirmation.
    Cancelled,
}

impl IntentStatus {
    /// Whether the status admits a transition to `to`. A same-state
    /// "transition" is allowed and treated as a duplicate-delivery no-op.
    pub fn can_transition(self, to: IntentStatus) -> bool {
        self == to || self == IntentStatus::Pending
    }
}

/// Refund lifecycle for a deposit that became reclaimable.
///
/// `Processing` exists so a crash mid-payout cannot be retried into a
/// double payment: only the lease-holding worker moves a row out of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Not reclaimable.
    None,
    /// Reclaimable until the refund deadline.
    Eligible,
    /// A refund payout is in flight.
    Processing,
    /// Refund paid out; terminal.
    Completed,
    /// Last payout attempt failed; retryable.
    Failed,
}

/// One wager funding intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// External idempotency reference.
    pub reference: String,
    /// Owning user.
    pub user: UserId,
    /// Funded amount in micro-units.
    pub amount_micros: u64,
    /// Duel this intent ended up funding, set at pairing. Weak link: the
    /// duel row never cascades into this one.
    pub duel: Option<DuelId>,
    /// Normalized funding status.
    pub status: IntentStatus,
    /// External transaction id reported at confirmation.
    pub external_tx_id: Option<String>,
    /// Whether a queue join has consumed this intent. A confirmed intent
    /// is consumable exactly once.
    pub consumed: bool,
    /// Cooperative lease: when the current worker took the row.
    pub locked_at: Option<DateTime<Utc>>,
    /// Cooperative lease: which worker holds the row.
    pub locked_by: Option<String>,
    /// Retry attempts so far.
    pub retry_count: u32,
    /// Earliest instant of the next retry attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Refund lifecycle state.
    pub refund_status: RefundStatus,
    /// Deadline for reclaiming the deposit once eligible.
    pub refund_deadline: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Create a fresh pending intent.
    pub fn new(reference: String, user: UserId, amount_micros: u64, now: DateTime<Utc>) -> Self {
        Self {
            reference,
            user,
            amount_micros,
            duel: None,
            status: IntentStatus::Pending,
            external_tx_id: None,
            consumed: false,
            locked_at: None,
            locked_by: None,
            retry_count: 0,
            next_retry_at: None,
            refund_status: RefundStatus::None,
            refund_deadline: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the lease is free or expired at `now`.
    pub fn lease_available(&self, lease_secs: i64, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            None => true,
            Some(taken) => now - taken > chrono::Duration::seconds(lease_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_monotonicity() {
        use IntentStatus::*;

        assert!(Pending.can_transition(Confirmed));
        assert!(Pending.can_transition(Failed));
        assert!(Pending.can_transition(Cancelled));

        // Duplicate delivery is a no-op, not an error
        assert!(Confirmed.can_transition(Confirmed));
        assert!(Failed.can_transition(Failed));

        // Settled statuses never regress
        assert!(!Confirmed.can_transition(Failed));
        assert!(!Confirmed.can_transition(Pending));
        assert!(!Failed.can_transition(Confirmed));
        assert!(!Cancelled.can_transition(Confirmed));
    }

    #[test]
    fn test_lease_availability() {
        let now = Utc::now();
        let mut intent = PaymentIntent::new("ref-1".into(), UserId::new([1; 16]), 100, now);

        assert!(intent.lease_available(30, now));

        intent.locked_at = Some(now);
        assert!(!intent.lease_available(30, now));

        // An expired lease is reclaimable
        let later = now + chrono::Duration::seconds(31);
        assert!(intent.lease_available(30, later));
    }
}
