//! Payment Intent Ledger
//!
//! Tracks wager funding intents against external custodial confirmations.
//! Creation is idempotent by reference, status transitions are monotonic,
//! and a confirmed intent is consumable by exactly one queue join. Retry
//! workers coordinate through a cooperative lease rather than blocking
//! each other.

pub mod intent;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::core::{DuelId, UserId};
use crate::store::Table;

pub use intent::{IntentStatus, PaymentIntent, RefundStatus};

/// Ledger operation errors.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// No intent under this reference.
    #[error("unknown payment reference")]
    NotFound,

    /// The intent belongs to a different user.
    #[error("payment reference owned by another user")]
    WrongOwner,

    /// The intent is not confirmed yet.
    #[error("payment not confirmed")]
    NotConfirmed,

    /// The intent already funded a queue join.
    #[error("payment already consumed")]
    AlreadyConsumed,

    /// A settled status cannot move.
    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status.
        from: IntentStatus,
        /// Rejected target status.
        to: IntentStatus,
    },

    /// The deposit is not reclaimable.
    #[error("deposit is not refund-eligible")]
    NotRefundEligible,

    /// A refund payout is already in flight.
    #[error("refund already processing")]
    RefundInProgress,

    /// The refund window has closed.
    #[error("refund window expired")]
    RefundExpired,
}

/// The payment intent ledger.
pub struct PaymentLedger {
    config: Arc<Config>,
    intents: Table<String, PaymentIntent>,
}

impl PaymentLedger {
    /// Create an empty ledger.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            intents: Table::new(),
        }
    }

    /// Idempotent create: a repeat call with the same reference returns
    /// the original record unchanged.
    pub async fn create(
        &self,
        reference: &str,
        user: UserId,
        amount_micros: u64,
        now: DateTime<Utc>,
    ) -> PaymentIntent {
        let row = PaymentIntent::new(reference.to_string(), user, amount_micros, now);
        let handle = match self.intents.insert_if_absent(reference.to_string(), row).await {
            Ok(created) => {
                debug!("payment intent {} created for {}", reference, user.short());
                created
            }
            Err(existing) => existing,
        };
        let guard = handle.lock().await;
        guard.clone()
    }

    /// Confirm funding. Repeat confirmation of an already-confirmed
    /// reference is a no-op, defending against duplicate webhook delivery.
    pub async fn confirm(
        &self,
        reference: &str,
        tx_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentIntent, LedgerError> {
        self.transition(reference, IntentStatus::Confirmed, Some(tx_id), now)
            .await
    }

    /// Mark funding as failed.
    pub async fn fail(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentIntent, LedgerError> {
        self.transition(reference, IntentStatus::Failed, None, now).await
    }

    /// Cancel an unconfirmed intent.
    pub async fn cancel(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentIntent, LedgerError> {
        self.transition(reference, IntentStatus::Cancelled, None, now).await
    }

    async fn transition(
        &self,
        reference: &str,
        to: IntentStatus,
        tx_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PaymentIntent, LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.status == to {
            // Duplicate delivery: return the record unchanged
            return Ok(guard.clone());
        }
        if !guard.status.can_transition(to) {
            return Err(LedgerError::InvalidTransition {
                from: guard.status,
                to,
            });
        }

        guard.status = to;
        if let Some(tx) = tx_id {
            guard.external_tx_id = Some(tx.to_string());
        }
        guard.updated_at = now;
        info!("payment intent {} -> {:?}", reference, to);
        Ok(guard.clone())
    }

    /// Take the cooperative lease. Returns false when another worker holds
    /// an unexpired lease.
    pub async fn acquire_lock(
        &self,
        reference: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;

        if !guard.lease_available(self.config.lease_secs, now) {
            return Ok(false);
        }
        guard.locked_at = Some(now);
        guard.locked_by = Some(owner.to_string());
        Ok(true)
    }

    /// Release the lease if this owner holds it.
    pub async fn release_lock(&self, reference: &str, owner: &str) -> Result<(), LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.locked_by.as_deref() == Some(owner) {
            guard.locked_at = None;
            guard.locked_by = None;
        }
        Ok(())
    }

    /// Arm the next retry with exponential backoff:
    /// `delay = min(base * 2^retry_count, cap)`.
    pub async fn schedule_retry(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;
        Ok(self.arm_retry_locked(&mut guard, now))
    }

    /// Backoff arithmetic for a row whose lock the caller already holds.
    pub fn arm_retry_locked(&self, intent: &mut PaymentIntent, now: DateTime<Utc>) -> DateTime<Utc> {
        let shift = intent.retry_count.min(30);
        let delay_secs = self
            .config
            .retry_base_secs
            .saturating_mul(1i64 << shift)
            .min(self.config.retry_cap_secs);
        let next = now + Duration::seconds(delay_secs);

        intent.retry_count += 1;
        intent.next_retry_at = Some(next);
        intent.updated_at = now;
        next
    }

    /// Bulk-fail pending intents with no external transaction id past the
    /// timeout. Idempotent; safe from multiple workers since only rows in
    /// the precondition state are touched.
    pub async fn expire_stale_payments(&self, timeout_minutes: i64, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(timeout_minutes);
        let mut expired = 0;

        for (reference, handle) in self.intents.snapshot().await {
            let mut guard = handle.lock().await;
            if guard.status == IntentStatus::Pending
                && guard.external_tx_id.is_none()
                && guard.created_at < cutoff
            {
                guard.status = IntentStatus::Failed;
                guard.updated_at = now;
                expired += 1;
                info!("payment intent {} expired after timeout", reference);
            }
        }
        expired
    }

    /// Consume a confirmed intent for one queue join. Fails unless the
    /// intent is confirmed, unconsumed, and owned by `user`.
    pub async fn consume_for_join(
        &self,
        reference: &str,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.user != user {
            return Err(LedgerError::WrongOwner);
        }
        if guard.status != IntentStatus::Confirmed {
            return Err(LedgerError::NotConfirmed);
        }
        if guard.consumed {
            return Err(LedgerError::AlreadyConsumed);
        }

        guard.consumed = true;
        guard.updated_at = now;
        Ok(guard.amount_micros)
    }

    /// Return a consumed intent to the pool (queue cancellation before
    /// pairing).
    pub async fn release_consumption(&self, reference: &str, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;
        guard.consumed = false;
        guard.updated_at = now;
        Ok(())
    }

    /// Record which duel this intent ended up funding.
    pub async fn link_duel(&self, reference: &str, duel: DuelId) -> Result<(), LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;
        guard.duel = Some(duel);
        Ok(())
    }

    /// Flag the deposit as reclaimable until `deadline`. Idempotent: rows
    /// already in the refund flow are untouched.
    pub async fn mark_refund_eligible(
        &self,
        reference: &str,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let handle = self.intents.get(&reference.to_string()).await.ok_or(LedgerError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.refund_status == RefundStatus::None {
            guard.refund_status = RefundStatus::Eligible;
            guard.refund_deadline = Some(deadline);
            guard.updated_at = now;
            info!("payment intent {} refund-eligible until {}", reference, deadline);
        }
        Ok(())
    }

    /// Row handle for the refund flow, which needs the lock held across
    /// the payout call.
    pub async fn intent_row(&self, reference: &str) -> Option<Arc<Mutex<PaymentIntent>>> {
        self.intents.get(&reference.to_string()).await
    }

    /// Snapshot an intent.
    pub async fn get(&self, reference: &str) -> Option<PaymentIntent> {
        let handle = self.intents.get(&reference.to_string()).await?;
        let guard = handle.lock().await;
        Some(guard.clone())
    }

    /// References of refundable rows due for a retry attempt at `now`.
    pub async fn refunds_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for (reference, handle) in self.intents.snapshot().await {
            let guard = handle.lock().await;
            let retry_ready = guard.next_retry_at.is_none_or(|at| at <= now);
            if guard.refund_status == RefundStatus::Failed && retry_ready {
                due.push(reference);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> PaymentLedger {
        PaymentLedger::new(Arc::new(Config::default()))
    }

    fn user(byte: u8) -> UserId {
        UserId::new([byte; 16])
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_reference() {
        let ledger = ledger();
        let now = Utc::now();

        let first = ledger.create("ref-1", user(1), 100_000, now).await;
        // Repeat with different arguments returns the original unchanged
        let second = ledger.create("ref-1", user(2), 999_999, now).await;

        assert_eq!(second.user, first.user);
        assert_eq!(second.amount_micros, 100_000);
    }

    #[tokio::test]
    async fn test_duplicate_confirm_is_noop() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.create("ref-1", user(1), 100_000, now).await;

        let confirmed = ledger.confirm("ref-1", "tx-a", now).await.unwrap();
        assert_eq!(confirmed.status, IntentStatus::Confirmed);
        assert_eq!(confirmed.external_tx_id.as_deref(), Some("tx-a"));

        // Second delivery of the same confirmation
        let again = ledger.confirm("ref-1", "tx-b", now).await.unwrap();
        assert_eq!(again.status, IntentStatus::Confirmed);
        // Original transaction id is kept
        assert_eq!(again.external_tx_id.as_deref(), Some("tx-a"));
    }

    #[tokio::test]
    async fn test_confirmed_never_fails() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.create("ref-1", user(1), 100_000, now).await;
        ledger.confirm("ref-1", "tx-a", now).await.unwrap();

        let err = ledger.fail("ref-1", now).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_consume_exactly_once() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.create("ref-1", user(1), 100_000, now).await;

        // Unconfirmed intents cannot fund a join
        assert!(matches!(
            ledger.consume_for_join("ref-1", user(1), now).await,
            Err(LedgerError::NotConfirmed)
        ));

        ledger.confirm("ref-1", "tx-a", now).await.unwrap();

        // Wrong owner rejected
        assert!(matches!(
            ledger.consume_for_join("ref-1", user(2), now).await,
            Err(LedgerError::WrongOwner)
        ));

        assert_eq!(ledger.consume_for_join("ref-1", user(1), now).await.unwrap(), 100_000);
        assert!(matches!(
            ledger.consume_for_join("ref-1", user(1), now).await,
            Err(LedgerError::AlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn test_lease_exclusion_and_reclaim() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.create("ref-1", user(1), 100_000, now).await;

        assert!(ledger.acquire_lock("ref-1", "worker-a", now).await.unwrap());
        assert!(!ledger.acquire_lock("ref-1", "worker-b", now).await.unwrap());

        // Expired lease is reclaimable
        let later = now + Duration::seconds(Config::default().lease_secs + 1);
        assert!(ledger.acquire_lock("ref-1", "worker-b", later).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_backoff_doubles_to_cap() {
        let config = Arc::new(Config::default());
        let ledger = PaymentLedger::new(config.clone());
        let now = Utc::now();
        ledger.create("ref-1", user(1), 100_000, now).await;

        let mut prev_delay = 0i64;
        for attempt in 0..4 {
            let next = ledger.schedule_retry("ref-1", now).await.unwrap();
            let delay = (next - now).num_seconds();
            assert_eq!(delay, config.retry_base_secs << attempt);
            assert!(delay > prev_delay);
            prev_delay = delay;
        }

        // Push past the cap
        for _ in 0..10 {
            ledger.schedule_retry("ref-1", now).await.unwrap();
        }
        let capped = ledger.schedule_retry("ref-1", now).await.unwrap();
        assert_eq!((capped - now).num_seconds(), config.retry_cap_secs);
    }

    #[tokio::test]
    async fn test_expire_stale_payments() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.create("old", user(1), 100_000, now - Duration::minutes(20)).await;
        ledger.create("fresh", user(2), 100_000, now).await;
        ledger.create("confirmed", user(3), 100_000, now - Duration::minutes(20)).await;
        ledger.confirm("confirmed", "tx-a", now).await.unwrap();

        let expired = ledger.expire_stale_payments(15, now).await;
        assert_eq!(expired, 1);
        assert_eq!(ledger.get("old").await.unwrap().status, IntentStatus::Failed);
        assert_eq!(ledger.get("fresh").await.unwrap().status, IntentStatus::Pending);
        assert_eq!(ledger.get("confirmed").await.unwrap().status, IntentStatus::Confirmed);

        // Sweep is idempotent
        assert_eq!(ledger.expire_stale_payments(15, now).await, 0);
    }

    #[tokio::test]
    async fn test_mark_refund_eligible_is_idempotent() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.create("ref-1", user(1), 100_000, now).await;

        let deadline = now + Duration::hours(72);
        ledger.mark_refund_eligible("ref-1", deadline, now).await.unwrap();
        let row = ledger.get("ref-1").await.unwrap();
        assert_eq!(row.refund_status, RefundStatus::Eligible);
        assert_eq!(row.refund_deadline, Some(deadline));

        // Second sweep pass must not reset anything
        let other = now + Duration::hours(100);
        ledger.mark_refund_eligible("ref-1", other, now).await.unwrap();
        assert_eq!(ledger.get("ref-1").await.unwrap().refund_deadline, Some(deadline));
    }
}
