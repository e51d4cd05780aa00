//! Winner Claims
//!
//! The claim opens with an exclusive duel row lock and re-reads the
//! caller's result and payout state under it - that lock is what prevents
//! two concurrent claims from both paying out. The payout call runs while
//! the lock is held; only a confirmed settlement reference flips
//! `payout_state`, so a provider failure leaves the row exactly as it was.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::core::{DuelId, UserId};
use crate::duel::{ClaimStatus, DuelResult, PayoutState};
use crate::settle::{
    SettleError, SettlementKind, SettlementProcessor, SettlementReceipt, SettlementRecord, Treasury,
};

/// Read-only claim status view.
#[derive(Clone, Debug)]
pub struct ClaimStatusView {
    /// Claim lifecycle of the duel.
    pub claim_status: ClaimStatus,
    /// The caller's payout flag.
    pub payout_state: PayoutState,
    /// Claim deadline, once resolved.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Settlement reference, once paid.
    pub settlement_ref: Option<String>,
}

impl<T: Treasury> SettlementProcessor<T> {
    /// Claim the pot for a won duel. Idempotent: a repeat call returns the
    /// prior settlement reference as an already-claimed success.
    pub async fn claim(
        &self,
        duel_id: &DuelId,
        caller: &UserId,
        now: DateTime<Utc>,
    ) -> Result<SettlementReceipt, SettleError> {
        let handle = self.engine.duel_row(duel_id).await.ok_or(SettleError::NotFound)?;
        // Exclusive row lock; held across the payout call
        let mut guard = handle.lock().await;

        let idx = guard.slot_index(caller).ok_or(SettleError::NotParticipant)?;

        // Re-read result and payout state under the lock
        match guard.players[idx].result {
            None => return Err(SettleError::NotResolved),
            Some(DuelResult::Loss) => return Err(SettleError::NotWinner),
            Some(DuelResult::Draw) | Some(DuelResult::NoMatch) => {
                return Err(SettleError::UseRefundFlow)
            }
            Some(DuelResult::Win) => {}
        }

        let amount_micros = self.config.payout_micros(guard.stake_micros);
        if guard.players[idx].payout_state == PayoutState::Paid {
            let prior = self
                .records
                .find_last(|r| {
                    r.kind == SettlementKind::Payout && r.duel == Some(*duel_id) && r.user == *caller
                })
                .await
                .ok_or(SettleError::NotFound)?;
            return Ok(SettlementReceipt {
                amount_micros: prior.amount_micros,
                settlement_ref: prior.external_ref,
                already_claimed: true,
            });
        }

        let deadline = guard.claim_deadline.ok_or(SettleError::NotResolved)?;
        if now > deadline {
            return Err(SettleError::ClaimExpired);
        }

        let wallet = self
            .users
            .wallet_of(caller)
            .await
            .ok_or(SettleError::WalletUnknown)?;

        // External payout; a failure here rolls the whole claim back
        // because nothing has been written yet
        let external_ref = self
            .treasury
            .send_payout(&wallet, amount_micros)
            .await
            .map_err(|e| SettleError::Downstream(e.to_string()))?;

        let expected = guard.state_version;
        self.records
            .append(SettlementRecord {
                id: uuid::Uuid::new_v4(),
                kind: SettlementKind::Payout,
                user: *caller,
                duel: Some(*duel_id),
                payment_reference: None,
                amount_micros,
                external_ref: external_ref.clone(),
                created_at: now,
            })
            .await;
        guard.players[idx].payout_state = PayoutState::Paid;
        guard.claim_status = ClaimStatus::Claimed;
        guard.bump(expected)?;

        info!(
            "duel {} pot of {} claimed by {} ({})",
            duel_id.short(),
            amount_micros,
            caller.short(),
            external_ref
        );
        Ok(SettlementReceipt {
            amount_micros,
            settlement_ref: external_ref,
            already_claimed: false,
        })
    }

    /// Read-only claim status. Never mutates.
    pub async fn claim_status(
        &self,
        duel_id: &DuelId,
        caller: &UserId,
    ) -> Result<ClaimStatusView, SettleError> {
        let duel = self.engine.snapshot(duel_id).await.ok_or(SettleError::NotFound)?;
        let slot = duel.slot(caller).ok_or(SettleError::NotParticipant)?;

        let settlement_ref = if slot.payout_state == PayoutState::Paid {
            self.records
                .find_last(|r| {
                    r.kind == SettlementKind::Payout && r.duel == Some(*duel_id) && r.user == *caller
                })
                .await
                .map(|r| r.external_ref)
        } else {
            None
        };

        Ok(ClaimStatusView {
            claim_status: duel.claim_status,
            payout_state: slot.payout_state,
            claim_deadline: duel.claim_deadline,
            settlement_ref,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
