//! Claim & Settlement Processor
//!
//! Converts a resolved outcome into an idempotent, exactly-once payout or
//! refund:
//!
//! - `treasury`: the external payout provider seam
//! - `claim`: winner payout under the exclusive duel row lock
//! - `refund`: deposit reclaim with the `Processing` crash guard and the
//!   lease-driven retry worker
//!
//! Every executed transfer appends one immutable SettlementRecord; replays
//! are answered from it instead of paying twice.

pub mod claim;
pub mod refund;
pub mod treasury;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::core::{DuelId, UserId, VersionConflict};
use crate::duel::DuelEngine;
use crate::ledger::PaymentLedger;
use crate::store::{Log, Users};

pub use treasury::{DevTreasury, Treasury, TreasuryError};

/// What a settlement record settles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    /// Winner payout of the pot minus fee.
    Payout,
    /// Deposit refund minus fee.
    Refund,
}

/// One executed transfer; append-only, used for idempotent replay
/// detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Record id.
    pub id: uuid::Uuid,
    /// Payout or refund.
    pub kind: SettlementKind,
    /// Receiving user.
    pub user: UserId,
    /// Duel settled, when known.
    pub duel: Option<DuelId>,
    /// Payment reference refunded, for refunds.
    pub payment_reference: Option<String>,
    /// Transferred amount in micro-units.
    pub amount_micros: u64,
    /// External settlement reference from the treasury provider.
    pub external_ref: String,
    /// Execution time.
    pub created_at: DateTime<Utc>,
}

/// Settlement errors.
#[derive(Debug, Clone, Error)]
pub enum SettleError {
    /// No such duel or payment reference.
    #[error("not found")]
    NotFound,

    /// Caller is not a participant.
    #[error("not a participant in this duel")]
    NotParticipant,

    /// The duel has not resolved yet.
    #[error("duel not resolved yet")]
    NotResolved,

    /// Caller lost; nothing to claim.
    #[error("not the winner")]
    NotWinner,

    /// Draws and cancellations settle through the refund flow.
    #[error("no pot to claim; use the refund flow")]
    UseRefundFlow,

    /// The claim window has closed.
    #[error("claim window expired")]
    ClaimExpired,

    /// The payment reference belongs to a different user.
    #[error("payment reference owned by another user")]
    WrongOwner,

    /// The deposit is not reclaimable.
    #[error("deposit is not refund-eligible")]
    NotRefundEligible,

    /// A refund payout is already in flight for this reference.
    #[error("refund already processing, try again")]
    RefundInProgress,

    /// The refund window has closed.
    #[error("refund window expired")]
    RefundExpired,

    /// The wallet for the receiving user is unknown.
    #[error("no wallet on record")]
    WalletUnknown,

    /// Provider-side failure; the transaction rolled back, try again.
    #[error("payout provider failure: {0}")]
    Downstream(String),

    /// A write raced a concurrent transition.
    #[error(transparent)]
    Version(#[from] VersionConflict),
}

/// Receipt for a claim or refund, success-shaped even on replay so
/// "already succeeded" is never confused with "failed".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementReceipt {
    /// Amount transferred (originally, for replays).
    pub amount_micros: u64,
    /// The external settlement reference.
    pub settlement_ref: String,
    /// True when this call found the transfer already executed.
    pub already_claimed: bool,
}

/// The claim & settlement processor.
pub struct SettlementProcessor<T: Treasury> {
    pub(crate) config: Arc<Config>,
    pub(crate) users: Arc<Users>,
    pub(crate) engine: Arc<DuelEngine>,
    pub(crate) ledger: Arc<PaymentLedger>,
    pub(crate) treasury: T,
    pub(crate) records: Log<SettlementRecord>,
}

impl<T: Treasury> SettlementProcessor<T> {
    /// Create the processor.
    pub fn new(
        config: Arc<Config>,
        users: Arc<Users>,
        engine: Arc<DuelEngine>,
        ledger: Arc<PaymentLedger>,
        treasury: T,
    ) -> Self {
        Self {
            config,
            users,
            engine,
            ledger,
            treasury,
            records: Log::new(),
        }
    }

    /// The append-only settlement log.
    pub fn records(&self) -> &Log<SettlementRecord> {
        &self.records
    }
}
