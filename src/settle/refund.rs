//! Deposit Refunds
//!
//! Reclaims a deposit that became refund-eligible through a matchmaking
//! timeout, a draw, or a pre-resolution cancellation. The intent row lock
//! is held across the payout call, and the row sits in `Processing` while
//! the transfer is in flight so a crash mid-payout cannot be retried into
//! a double payment. Failed payouts are re-armed with backoff and driven
//! by the lease-holding retry worker.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::UserId;
use crate::ledger::{PaymentIntent, RefundStatus};
use crate::settle::{
    SettleError, SettlementKind, SettlementProcessor, SettlementReceipt, SettlementRecord, Treasury,
};

impl<T: Treasury> SettlementProcessor<T> {
    /// Reclaim a refund-eligible deposit. Idempotent: a repeat call after
    /// completion returns the prior settlement reference as an
    /// already-claimed success, never a second payment.
    pub async fn claim_deposit(
        &self,
        reference: &str,
        caller: &UserId,
        now: DateTime<Utc>,
    ) -> Result<SettlementReceipt, SettleError> {
        let handle = self.ledger.intent_row(reference).await.ok_or(SettleError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.user != *caller {
            return Err(SettleError::WrongOwner);
        }

        match guard.refund_status {
            RefundStatus::Completed => {
                let prior = self
                    .records
                    .find_last(|r| {
                        r.kind == SettlementKind::Refund
                            && r.payment_reference.as_deref() == Some(reference)
                    })
                    .await
                    .ok_or(SettleError::NotFound)?;
                return Ok(SettlementReceipt {
                    amount_micros: prior.amount_micros,
                    settlement_ref: prior.external_ref,
                    already_claimed: true,
                });
            }
            RefundStatus::Processing => return Err(SettleError::RefundInProgress),
            RefundStatus::None => return Err(SettleError::NotRefundEligible),
            RefundStatus::Eligible | RefundStatus::Failed => {}
        }

        if let Some(deadline) = guard.refund_deadline {
            if now > deadline {
                return Err(SettleError::RefundExpired);
            }
        }

        self.refund_locked(&mut guard, now).await
    }

    /// Execute the refund payout for a row whose lock is held. Shared by
    /// the user-facing claim and the retry worker.
    async fn refund_locked(
        &self,
        guard: &mut PaymentIntent,
        now: DateTime<Utc>,
    ) -> Result<SettlementReceipt, SettleError> {
        let wallet = self
            .users
            .wallet_of(&guard.user)
            .await
            .ok_or(SettleError::WalletUnknown)?;
        let amount_micros = self.config.refund_micros(guard.amount_micros);

        // Crash guard: while in flight, nothing else may start a payout
        guard.refund_status = RefundStatus::Processing;
        guard.updated_at = now;

        match self.treasury.send_payout(&wallet, amount_micros).await {
            Ok(external_ref) => {
                self.records
                    .append(SettlementRecord {
                        id: uuid::Uuid::new_v4(),
                        kind: SettlementKind::Refund,
                        user: guard.user,
                        duel: guard.duel,
                        payment_reference: Some(guard.reference.clone()),
                        amount_micros,
                        external_ref: external_ref.clone(),
                        created_at: now,
                    })
                    .await;
                guard.refund_status = RefundStatus::Completed;
                guard.updated_at = now;
                info!(
                    "deposit {} refunded {} micros ({})",
                    guard.reference, amount_micros, external_ref
                );
                Ok(SettlementReceipt {
                    amount_micros,
                    settlement_ref: external_ref,
                    already_claimed: false,
                })
            }
            Err(e) => {
                guard.refund_status = RefundStatus::Failed;
                let next = self.ledger.arm_retry_locked(guard, now);
                warn!(
                    "deposit {} refund failed ({}), retry at {}",
                    guard.reference, e, next
                );
                Err(SettleError::Downstream(e.to_string()))
            }
        }
    }

    /// Retry worker pass: drives failed refunds whose backoff elapsed,
    /// under the cooperative lease so concurrent workers never double-run
    /// a row. Returns the number of refunds completed.
    pub async fn drive_refunds(&self, worker: &str, now: DateTime<Utc>) -> usize {
        let mut completed = 0;

        for reference in self.ledger.refunds_due(now).await {
            if !self
                .ledger
                .acquire_lock(&reference, worker, now)
                .await
                .unwrap_or(false)
            {
                continue;
            }

            if let Some(handle) = self.ledger.intent_row(&reference).await {
                let mut guard = handle.lock().await;
                // Re-check under the row lock
                let due = guard.refund_status == RefundStatus::Failed
                    && guard.next_retry_at.is_none_or(|at| at <= now);
                if due && self.refund_locked(&mut guard, now).await.is_ok() {
                    completed += 1;
                }
            }

            let _ = self.ledger.release_lock(&reference, worker).await;
        }
        completed
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::duel::DuelEngine;
    use crate::ledger::PaymentLedger;
    use crate::settle::treasury::testing::RecordingTreasury;
    use crate::store::Users;
    use chrono::Duration;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Harness {
        processor: Arc<SettlementProcessor<Arc<RecordingTreasury>>>,
        treasury: Arc<RecordingTreasury>,
        ledger: Arc<PaymentLedger>,
        users: Arc<Users>,
    }

    fn harness() -> Harness {
        let config = Arc::new(Config::default());
        let users = Arc::new(Users::new());
        let ledger = Arc::new(PaymentLedger::new(config.clone()));
        let (tx, _rx) = mpsc::channel(64);
        let engine = Arc::new(DuelEngine::new(config.clone(), users.clone(), ledger.clone(), tx));
        let treasury = RecordingTreasury::new();
        let processor = Arc::new(SettlementProcessor::new(
            config,
            users.clone(),
            engine,
            ledger.clone(),
            treasury.clone(),
        ));
        Harness {
            processor,
            treasury,
            ledger,
            users,
        }
    }

    fn user(byte: u8) -> UserId {
        UserId::new([byte; 16])
    }

    /// A confirmed, refund-eligible deposit of 0.5 for user(1).
    async fn eligible_deposit(h: &Harness, now: DateTime<Utc>) -> &'static str {
        let reference = "pay-1";
        h.users.ensure(user(1), "0xaaa", now).await;
        h.ledger.create(reference, user(1), 500_000, now).await;
        h.ledger.confirm(reference, "tx-1", now).await.unwrap();
        h.ledger
            .mark_refund_eligible(reference, now + Duration::hours(72), now)
            .await
            .unwrap();
        reference
    }

    #[tokio::test]
    async fn test_refund_is_stake_minus_fee() {
        let h = harness();
        let now = Utc::now();
        let reference = eligible_deposit(&h, now).await;

        let receipt = h.processor.claim_deposit(reference, &user(1), now).await.unwrap();
        // stake 0.5 at 3% fee => 0.485
        assert_eq!(receipt.amount_micros, 485_000);
        assert!(!receipt.already_claimed);
        assert_eq!(
            h.ledger.get(reference).await.unwrap().refund_status,
            RefundStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_repeat_claim_never_double_pays() {
        let h = harness();
        let now = Utc::now();
        let reference = eligible_deposit(&h, now).await;

        let first = h.processor.claim_deposit(reference, &user(1), now).await.unwrap();
        let second = h.processor.claim_deposit(reference, &user(1), now).await.unwrap();

        assert!(second.already_claimed);
        assert_eq!(second.settlement_ref, first.settlement_ref);
        assert_eq!(h.treasury.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_deposit_rejected() {
        let h = harness();
        let now = Utc::now();
        h.users.ensure(user(1), "0xaaa", now).await;
        h.ledger.create("pay-1", user(1), 500_000, now).await;
        h.ledger.confirm("pay-1", "tx-1", now).await.unwrap();

        let err = h.processor.claim_deposit("pay-1", &user(1), now).await.unwrap_err();
        assert!(matches!(err, SettleError::NotRefundEligible));
    }

    #[tokio::test]
    async fn test_wrong_owner_rejected() {
        let h = harness();
        let now = Utc::now();
        let reference = eligible_deposit(&h, now).await;

        let err = h.processor.claim_deposit(reference, &user(2), now).await.unwrap_err();
        assert!(matches!(err, SettleError::WrongOwner));
    }

    #[tokio::test]
    async fn test_expired_refund_window_rejected() {
        let h = harness();
        let now = Utc::now();
        let reference = eligible_deposit(&h, now).await;

        let late = now + Duration::hours(73);
        let err = h.processor.claim_deposit(reference, &user(1), late).await.unwrap_err();
        assert!(matches!(err, SettleError::RefundExpired));
    }

    #[tokio::test]
    async fn test_failed_payout_arms_retry_and_worker_completes() {
        let h = harness();
        let now = Utc::now();
        let reference = eligible_deposit(&h, now).await;

        h.treasury.set_failing(true);
        let err = h.processor.claim_deposit(reference, &user(1), now).await.unwrap_err();
        assert!(matches!(err, SettleError::Downstream(_)));

        let intent = h.ledger.get(reference).await.unwrap();
        assert_eq!(intent.refund_status, RefundStatus::Failed);
        let next_retry = intent.next_retry_at.unwrap();
        assert!(next_retry > now);

        // Worker runs before the backoff elapses: nothing happens
        h.treasury.set_failing(false);
        assert_eq!(h.processor.drive_refunds("worker-a", now).await, 0);

        // After the backoff the worker completes the refund
        let later = next_retry + Duration::seconds(1);
        assert_eq!(h.processor.drive_refunds("worker-a", later).await, 1);
        assert_eq!(
            h.ledger.get(reference).await.unwrap().refund_status,
            RefundStatus::Completed
        );

        // And only one transfer ever went out
        assert_eq!(h.treasury.call_count(), 1);

        // The user's own retry now sees the completed refund
        let receipt = h.processor.claim_deposit(reference, &user(1), later).await.unwrap();
        assert!(receipt.already_claimed);
    }

    #[tokio::test]
    async fn test_processing_row_rejects_concurrent_claim() {
        let h = harness();
        let now = Utc::now();
        let reference = eligible_deposit(&h, now).await;

        {
            let handle = h.ledger.intent_row(reference).await.unwrap();
            let mut guard = handle.lock().await;
            guard.refund_status = RefundStatus::Processing;
        }

        let err = h.processor.claim_deposit(reference, &user(1), now).await.unwrap_err();
        assert!(matches!(err, SettleError::RefundInProgress));
        assert_eq!(h.treasury.call_count(), 0);
    }
}
