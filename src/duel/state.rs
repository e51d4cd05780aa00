//! Duel Rows
//!
//! The match row owns the authoritative outcome. Status, per-player
//! results and payout states are closed variants with boundary-enforced
//! transitions; the phase a client sees is always derived from persisted
//! instants, never computed client-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{DuelId, StateVersion, UserId, VersionConflict};

/// Row-level duel status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    /// Paired, waiting for both players to ready up.
    Pending,
    /// Armed: the go instant is persisted and counting down.
    InProgress,
    /// Resolved; terminal.
    Completed,
    /// Cancelled before resolution; terminal.
    Cancelled,
}

/// Per-player outcome. `NoMatch` is reserved for duels that were
/// cancelled or never started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuelResult {
    Win,
    Loss,
    Draw,
    NoMatch,
}

/// Per-player settlement flag; flips to `Paid` at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutState {
    NotPaid,
    Paid,
}

/// Claim lifecycle of a resolved duel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Nothing claimable yet, or claimable but untouched.
    Unclaimed,
    /// Winner collected the pot.
    Claimed,
    /// Claim window elapsed unclaimed.
    Expired,
}

/// Client-visible phase, derived from persisted instants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelPhase {
    /// Waiting for both ready submissions.
    ReadyWait,
    /// Fixed countdown running.
    Countdown,
    /// Countdown elapsed; the randomized delay is running. A tap here is
    /// a false start.
    Armed,
    /// Go instant passed; taps are valid.
    Signal,
    /// Terminal: resolved.
    Resolved,
    /// Terminal: cancelled.
    Cancelled,
}

/// One accepted tap. At most one per player per duel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TapRecord {
    /// Server receive time - the authoritative tap time.
    pub tapped_at: DateTime<Utc>,
    /// Client-reported timestamp, kept for anti-cheat skew analysis only.
    pub client_timestamp_ms: i64,
    /// `tapped_at - go_instant` for taps after the signal; `None` for
    /// false starts.
    pub reaction_ms: Option<i64>,
    /// Tap landed before the go instant.
    pub false_start: bool,
    /// Reaction below the human-plausibility floor; routed to anti-cheat,
    /// not disqualified.
    pub implausible: bool,
}

/// Per-player slot on the duel row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerSlot {
    /// Player identity.
    pub user: UserId,
    /// Payment reference that funded this player's stake, if staked.
    pub funding: Option<String>,
    /// Ready flag.
    pub ready: bool,
    /// Liveness stamp, refreshed by the heartbeat channel.
    pub last_heartbeat: DateTime<Utc>,
    /// The player's single tap, once submitted.
    pub tap: Option<TapRecord>,
    /// Outcome; set exactly once at resolution, never regressed.
    pub result: Option<DuelResult>,
    /// Settlement flag.
    pub payout_state: PayoutState,
}

impl PlayerSlot {
    fn new(user: UserId, funding: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user,
            funding,
            ready: false,
            last_heartbeat: now,
            tap: None,
            result: None,
            payout_state: PayoutState::NotPaid,
        }
    }

    /// A valid tap: submitted after the go instant, not disqualified.
    pub fn valid_reaction_ms(&self) -> Option<i64> {
        self.tap.as_ref().filter(|t| !t.false_start).and_then(|t| t.reaction_ms)
    }

    /// Whether the player's heartbeat is stale past the grace window.
    pub fn is_absent(&self, grace_secs: i64, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > chrono::Duration::seconds(grace_secs)
    }
}

/// The match row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Duel {
    /// Row identifier.
    pub id: DuelId,
    /// Per-player stake in micro-units.
    pub stake_micros: u64,
    /// Row status.
    pub status: DuelStatus,
    /// Optimistic lock; every state-mutating write advances it via CAS.
    pub state_version: StateVersion,
    /// Single-use nonce minted at arming; seeds the randomized delay.
    pub signal_nonce: Option<[u8; 16]>,
    /// Both player slots, ordered by user id.
    pub players: [PlayerSlot; 2],
    /// Pairing time.
    pub created_at: DateTime<Utc>,
    /// Deadline for both ready submissions.
    pub ready_deadline: DateTime<Utc>,
    /// Instant the fixed countdown elapses and the armed window begins.
    pub armed_at: Option<DateTime<Utc>>,
    /// The authoritative go instant; persisted once at arming.
    pub go_instant: Option<DateTime<Utc>>,
    /// Winner, if the duel resolved with one.
    pub winner: Option<UserId>,
    /// Claim lifecycle.
    pub claim_status: ClaimStatus,
    /// Deadline for the winner's claim.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Duel {
    /// Create a freshly paired duel in `Pending`/ready-wait.
    pub fn new(
        id: DuelId,
        a: (UserId, Option<String>),
        b: (UserId, Option<String>),
        stake_micros: u64,
        ready_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        // Slots ordered by user id so signal seed derivation is stable
        let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        Self {
            id,
            stake_micros,
            status: DuelStatus::Pending,
            state_version: StateVersion::initial(),
            signal_nonce: None,
            players: [
                PlayerSlot::new(first.0, first.1, now),
                PlayerSlot::new(second.0, second.1, now),
            ],
            created_at: now,
            ready_deadline,
            armed_at: None,
            go_instant: None,
            winner: None,
            claim_status: ClaimStatus::Unclaimed,
            claim_deadline: None,
            resolved_at: None,
        }
    }

    /// Slot index for a participant.
    pub fn slot_index(&self, user: &UserId) -> Option<usize> {
        self.players.iter().position(|p| p.user == *user)
    }

    /// Participant slot.
    pub fn slot(&self, user: &UserId) -> Option<&PlayerSlot> {
        self.slot_index(user).map(|i| &self.players[i])
    }

    /// Mutable participant slot.
    pub fn slot_mut(&mut self, user: &UserId) -> Option<&mut PlayerSlot> {
        let i = self.slot_index(user)?;
        Some(&mut self.players[i])
    }

    /// The other participant.
    pub fn opponent_of(&self, user: &UserId) -> Option<UserId> {
        let i = self.slot_index(user)?;
        Some(self.players[1 - i].user)
    }

    /// Both ready flags set.
    pub fn both_ready(&self) -> bool {
        self.players.iter().all(|p| p.ready)
    }

    /// Both taps submitted.
    pub fn both_tapped(&self) -> bool {
        self.players.iter().all(|p| p.tap.is_some())
    }

    /// Terminal status check.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DuelStatus::Completed | DuelStatus::Cancelled)
    }

    /// Derive the phase at `now` from persisted instants.
    pub fn phase(&self, now: DateTime<Utc>) -> DuelPhase {
        match self.status {
            DuelStatus::Cancelled => DuelPhase::Cancelled,
            DuelStatus::Completed => DuelPhase::Resolved,
            _ => match (self.armed_at, self.go_instant) {
                (Some(armed_at), Some(go_instant)) => {
                    if now < armed_at {
                        DuelPhase::Countdown
                    } else if now < go_instant {
                        DuelPhase::Armed
                    } else {
                        DuelPhase::Signal
                    }
                }
                _ => DuelPhase::ReadyWait,
            },
        }
    }

    /// Advance the version, conditioned on the version the writer read.
    pub fn bump(&mut self, expected: StateVersion) -> Result<StateVersion, VersionConflict> {
        self.state_version.advance(expected)
    }

    /// Set a slot result exactly once. Returns false (and leaves the row
    /// untouched) if the slot already carries a result.
    pub fn assign_result(&mut self, index: usize, result: DuelResult) -> bool {
        if self.players[index].result.is_some() {
            return false;
        }
        self.players[index].result = Some(result);
        true
    }
}
