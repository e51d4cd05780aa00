//! Match State Machine Engine
//!
//! Drives a duel from ready-wait through the randomized signal to exactly
//! one resolution write. Every mutation happens under the duel row lock
//! and advances the state version via CAS; follow-up effects (refund
//! eligibility, user tallies, anti-cheat observations) are applied after
//! the row lock is released so intent locks are never nested under a duel
//! lock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::anticheat::Observation;
use crate::config::Config;
use crate::core::{DeterministicRng, DuelId, UserId, VersionConflict};
use crate::duel::state::{
    ClaimStatus, Duel, DuelPhase, DuelResult, DuelStatus, TapRecord,
};
use crate::ledger::PaymentLedger;
use crate::store::{lock_row, Table, Users};

/// Match state machine errors.
#[derive(Debug, Clone, Error)]
pub enum DuelError {
    /// No duel row under this id.
    #[error("duel not found")]
    NotFound,

    /// Caller is not one of the two players.
    #[error("not a participant in this duel")]
    NotParticipant,

    /// The duel already reached a terminal state.
    #[error("duel already resolved")]
    AlreadyResolved,

    /// Ready submissions are no longer accepted.
    #[error("ready window is over")]
    ReadyWindowOver,

    /// Taps are only accepted once the signal sequence is armed.
    #[error("signal not armed")]
    NotArmed,

    /// The player already submitted their single tap.
    #[error("tap already submitted")]
    AlreadyTapped,

    /// A write raced a concurrent transition; re-read and retry.
    #[error(transparent)]
    Version(#[from] VersionConflict),
}

/// Acknowledgement for a ready submission.
#[derive(Debug, Clone, Copy)]
pub struct ReadyAck {
    /// Both players are now ready.
    pub both_ready: bool,
    /// The go instant has been persisted.
    pub armed: bool,
}

/// Acknowledgement for a tap.
#[derive(Debug, Clone, Copy)]
pub struct TapAck {
    /// Tap landed before the go instant.
    pub false_start: bool,
    /// Reaction time for taps after the signal.
    pub reaction_ms: Option<i64>,
    /// This tap completed the duel.
    pub resolved: bool,
}

/// Resolution computed while the row lock was held; applied afterwards.
#[derive(Debug, Default)]
struct ResolutionEffects {
    duel: DuelId,
    /// Payment references that become refund-eligible.
    refunds: Vec<String>,
    /// Per-user tally updates: (user, won, valid reaction).
    stats: Vec<(UserId, Option<bool>, Option<i64>)>,
    /// Committed outcomes for the anti-cheat monitor.
    observations: Vec<Observation>,
}

/// How a duel ends, decided under the row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Index of the winning slot.
    Winner(usize),
    Draw,
    Cancel,
}

/// The match state machine.
pub struct DuelEngine {
    config: Arc<Config>,
    users: Arc<Users>,
    ledger: Arc<PaymentLedger>,
    duels: Table<DuelId, Duel>,
    monitor: mpsc::Sender<Observation>,
}

impl DuelEngine {
    /// Create an engine over an empty duel table.
    pub fn new(
        config: Arc<Config>,
        users: Arc<Users>,
        ledger: Arc<PaymentLedger>,
        monitor: mpsc::Sender<Observation>,
    ) -> Self {
        Self {
            config,
            users,
            ledger,
            duels: Table::new(),
            monitor,
        }
    }

    /// Create the duel row for a fresh pairing. The caller (queue pairing)
    /// holds both entry locks, making entry transition plus row creation
    /// one atomic unit.
    pub async fn create_duel(
        &self,
        a: (UserId, Option<String>),
        b: (UserId, Option<String>),
        stake_micros: u64,
        now: DateTime<Utc>,
    ) -> DuelId {
        let id = DuelId::generate();
        let ready_deadline = now + Duration::seconds(self.config.ready_timeout_secs);
        let duel = Duel::new(id, a, b, stake_micros, ready_deadline, now);
        self.duels.insert(id, duel).await;
        info!("duel {} created, stake {}", id.short(), stake_micros);
        id
    }

    /// Row handle for the claim processor, which needs the exclusive lock
    /// held across its payout call.
    pub async fn duel_row(&self, id: &DuelId) -> Option<Arc<Mutex<Duel>>> {
        self.duels.get(id).await
    }

    /// Snapshot a duel row.
    pub async fn snapshot(&self, id: &DuelId) -> Option<Duel> {
        let handle = self.duels.get(id).await?;
        let guard = handle.lock().await;
        Some(guard.clone())
    }

    /// Submit a ready flag. When the second player readies up, the engine
    /// mints the single-use signal nonce, draws the randomized extra
    /// delay, and persists the go instant once.
    pub async fn mark_ready(
        &self,
        id: &DuelId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<ReadyAck, DuelError> {
        let handle = self.duels.get(id).await.ok_or(DuelError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.is_terminal() {
            return Err(DuelError::AlreadyResolved);
        }
        let idx = guard.slot_index(user).ok_or(DuelError::NotParticipant)?;

        if guard.go_instant.is_some() {
            // Duplicate ready after arming: idempotent
            return Ok(ReadyAck {
                both_ready: true,
                armed: true,
            });
        }
        if now > guard.ready_deadline {
            return Err(DuelError::ReadyWindowOver);
        }

        let expected = guard.state_version;
        guard.players[idx].ready = true;
        guard.players[idx].last_heartbeat = now;

        if guard.both_ready() {
            let nonce: [u8; 16] = uuid::Uuid::new_v4().into_bytes();
            let player_ids = [guard.players[0].user.0, guard.players[1].user.0];
            let mut rng = DeterministicRng::from_signal_params(&nonce, guard.id.as_bytes(), &player_ids);
            let extra_ms = rng.signal_delay_ms(
                self.config.signal_delay_min_ms,
                self.config.signal_delay_max_ms,
            );

            let armed_at = now + Duration::milliseconds(self.config.countdown_ms as i64);
            let go_instant = armed_at + Duration::milliseconds(extra_ms as i64);

            guard.signal_nonce = Some(nonce);
            guard.armed_at = Some(armed_at);
            guard.go_instant = Some(go_instant);
            guard.status = DuelStatus::InProgress;
            info!(
                "duel {} armed, go in {}ms",
                guard.id.short(),
                (go_instant - now).num_milliseconds()
            );
        }

        guard.bump(expected)?;
        Ok(ReadyAck {
            both_ready: guard.both_ready(),
            armed: guard.go_instant.is_some(),
        })
    }

    /// Refresh a player's liveness stamp. A heartbeat on a terminal duel
    /// is harmless and ignored.
    pub async fn heartbeat(
        &self,
        id: &DuelId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), DuelError> {
        let handle = self.duels.get(id).await.ok_or(DuelError::NotFound)?;
        let mut guard = handle.lock().await;

        let idx = guard.slot_index(user).ok_or(DuelError::NotParticipant)?;
        if guard.is_terminal() {
            return Ok(());
        }

        let expected = guard.state_version;
        guard.players[idx].last_heartbeat = now;
        guard.bump(expected)?;
        Ok(())
    }

    /// Submit the player's single tap. Accepted only in `Armed`/`Signal`;
    /// a tap before the go instant is a disqualifying false start.
    pub async fn tap(
        &self,
        id: &DuelId,
        user: &UserId,
        client_timestamp_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<TapAck, DuelError> {
        let handle = self.duels.get(id).await.ok_or(DuelError::NotFound)?;
        let mut guard = handle.lock().await;

        if guard.is_terminal() {
            return Err(DuelError::AlreadyResolved);
        }
        let idx = guard.slot_index(user).ok_or(DuelError::NotParticipant)?;

        match guard.phase(now) {
            DuelPhase::Armed | DuelPhase::Signal => {}
            _ => return Err(DuelError::NotArmed),
        }
        if guard.players[idx].tap.is_some() {
            return Err(DuelError::AlreadyTapped);
        }

        let go_instant = guard.go_instant.ok_or(DuelError::NotArmed)?;
        let false_start = now < go_instant;
        let reaction_ms = if false_start {
            None
        } else {
            Some((now - go_instant).num_milliseconds())
        };
        let implausible = reaction_ms.is_some_and(|r| r < self.config.min_reaction_ms as i64);
        if implausible {
            warn!(
                "duel {} tap from {} at {}ms is below the plausibility floor",
                guard.id.short(),
                user.short(),
                reaction_ms.unwrap_or_default()
            );
        }

        let expected = guard.state_version;
        guard.players[idx].tap = Some(TapRecord {
            tapped_at: now,
            client_timestamp_ms,
            reaction_ms,
            false_start,
            implausible,
        });
        guard.players[idx].last_heartbeat = now;
        guard.bump(expected)?;

        let effects = if guard.both_tapped() {
            self.resolve_locked(&mut guard, now)?
        } else {
            None
        };
        let resolved = effects.is_some();
        drop(guard);

        if let Some(effects) = effects {
            self.apply_effects(effects, now).await;
        }

        Ok(TapAck {
            false_start,
            reaction_ms,
            resolved,
        })
    }

    /// Periodic sweep: resolves duels past the post-signal timeout and
    /// judges ready-wait abandonment. Idempotent and safe from multiple
    /// workers - a terminal row is skipped under its lock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut settled = 0;
        let grace = self.config.heartbeat_grace_secs;

        for (_, handle) in self.duels.snapshot().await {
            let mut guard = lock_row(&handle).await;
            if guard.is_terminal() {
                continue;
            }

            let effects = match guard.phase(now) {
                DuelPhase::ReadyWait => {
                    let a_gone = guard.players[0].is_absent(grace, now);
                    let b_gone = guard.players[1].is_absent(grace, now);

                    let outcome = if a_gone && b_gone {
                        // Both abandoned: cancel with refunds
                        Some(Outcome::Cancel)
                    } else if a_gone {
                        Some(Outcome::Winner(1))
                    } else if b_gone {
                        Some(Outcome::Winner(0))
                    } else if now > guard.ready_deadline {
                        // Deadline passed with both connected: whoever
                        // readied up wins; neither ready cancels
                        match (guard.players[0].ready, guard.players[1].ready) {
                            (true, false) => Some(Outcome::Winner(0)),
                            (false, true) => Some(Outcome::Winner(1)),
                            _ => Some(Outcome::Cancel),
                        }
                    } else {
                        None
                    };

                    match outcome {
                        Some(o) => self.finalize_locked(&mut guard, o, now).ok(),
                        None => None,
                    }
                }
                DuelPhase::Signal => {
                    let go = guard.go_instant.unwrap_or(now);
                    let deadline = go + Duration::milliseconds(self.config.tap_timeout_ms as i64);
                    if now > deadline {
                        self.resolve_locked(&mut guard, now).unwrap_or(None)
                    } else {
                        None
                    }
                }
                // Countdown and armed windows are bounded by the
                // post-signal timeout; nothing to do yet
                _ => None,
            };

            drop(guard);
            if let Some(effects) = effects {
                self.apply_effects(effects, now).await;
                settled += 1;
            }
        }
        settled
    }

    /// Decide the outcome from the taps on the row and finalize it.
    /// Returns `Ok(None)` when the row is already terminal.
    fn resolve_locked(
        &self,
        guard: &mut Duel,
        now: DateTime<Utc>,
    ) -> Result<Option<ResolutionEffects>, DuelError> {
        if guard.is_terminal() {
            return Ok(None);
        }

        let grace = self.config.heartbeat_grace_secs;
        let ra = guard.players[0].valid_reaction_ms();
        let rb = guard.players[1].valid_reaction_ms();

        let outcome = match (ra, rb) {
            (Some(a), Some(b)) if a < b => Outcome::Winner(0),
            (Some(a), Some(b)) if b < a => Outcome::Winner(1),
            // Exactly equal reactions: draw
            (Some(_), Some(_)) => Outcome::Draw,
            (Some(_), None) => Outcome::Winner(0),
            (None, Some(_)) => Outcome::Winner(1),
            (None, None) => {
                let a_false = guard.players[0].tap.is_some_and(|t| t.false_start);
                let b_false = guard.players[1].tap.is_some_and(|t| t.false_start);
                if a_false && b_false {
                    Outcome::Draw
                } else {
                    // No valid tap on either side: a player who never
                    // tapped and stopped heartbeating is absent
                    let a_gone = guard.players[0].tap.is_none()
                        && guard.players[0].is_absent(grace, now);
                    let b_gone = guard.players[1].tap.is_none()
                        && guard.players[1].is_absent(grace, now);
                    match (a_gone, b_gone) {
                        (true, true) => Outcome::Cancel,
                        // A false-starter is disqualified and cannot be
                        // awarded the abandonment win; those pairs draw
                        (true, false) if !b_false => Outcome::Winner(1),
                        (false, true) if !a_false => Outcome::Winner(0),
                        _ => Outcome::Draw,
                    }
                }
            }
        };

        self.finalize_locked(guard, outcome, now).map(Some)
    }

    /// The single resolution write: status, winner, per-player results,
    /// claim fields and the version advance, all at once.
    fn finalize_locked(
        &self,
        guard: &mut Duel,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<ResolutionEffects, DuelError> {
        let expected = guard.state_version;
        let mut effects = ResolutionEffects {
            duel: guard.id,
            ..Default::default()
        };

        match outcome {
            Outcome::Winner(i) => {
                guard.status = DuelStatus::Completed;
                guard.winner = Some(guard.players[i].user);
                guard.assign_result(i, DuelResult::Win);
                guard.assign_result(1 - i, DuelResult::Loss);
                guard.claim_status = ClaimStatus::Unclaimed;
                guard.claim_deadline =
                    Some(now + Duration::seconds(self.config.claim_window_secs));
                info!(
                    "duel {} resolved, winner {}",
                    guard.id.short(),
                    guard.players[i].user.short()
                );
            }
            Outcome::Draw => {
                guard.status = DuelStatus::Completed;
                guard.winner = None;
                guard.assign_result(0, DuelResult::Draw);
                guard.assign_result(1, DuelResult::Draw);
                guard.claim_status = ClaimStatus::Unclaimed;
                guard.claim_deadline =
                    Some(now + Duration::seconds(self.config.claim_window_secs));
                // Draws release both deposits into the refund flow
                for slot in &guard.players {
                    if let Some(reference) = &slot.funding {
                        effects.refunds.push(reference.clone());
                    }
                }
                info!("duel {} resolved as a draw", guard.id.short());
            }
            Outcome::Cancel => {
                guard.status = DuelStatus::Cancelled;
                guard.winner = None;
                guard.assign_result(0, DuelResult::NoMatch);
                guard.assign_result(1, DuelResult::NoMatch);
                for slot in &guard.players {
                    if let Some(reference) = &slot.funding {
                        effects.refunds.push(reference.clone());
                    }
                }
                info!("duel {} cancelled", guard.id.short());
            }
        }
        guard.resolved_at = Some(now);
        guard.bump(expected)?;

        for (idx, slot) in guard.players.iter().enumerate() {
            let won = match outcome {
                Outcome::Winner(i) => Some(i == idx),
                _ => None,
            };
            let reaction = slot.valid_reaction_ms();
            effects.stats.push((slot.user, won, reaction));
            effects.observations.push(Observation {
                user: slot.user,
                duel: guard.id,
                result: slot.result.unwrap_or(DuelResult::NoMatch),
                reaction_ms: reaction,
                false_start: slot.tap.is_some_and(|t| t.false_start),
                implausible: slot.tap.is_some_and(|t| t.implausible),
            });
        }

        Ok(effects)
    }

    /// Apply post-commit effects. The duel row lock is released by now, so
    /// intent and user row locks are taken without nesting.
    async fn apply_effects(&self, effects: ResolutionEffects, now: DateTime<Utc>) {
        let refund_deadline = now + Duration::seconds(self.config.refund_window_secs);
        for reference in &effects.refunds {
            if let Err(e) = self
                .ledger
                .mark_refund_eligible(reference, refund_deadline, now)
                .await
            {
                warn!("duel {}: refund eligibility for {} failed: {}", effects.duel.short(), reference, e);
            }
        }
        for (user, won, reaction) in &effects.stats {
            self.users.record_outcome(user, *won, *reaction).await;
        }
        for observation in effects.observations {
            // The monitor must never delay settlement; drop on backpressure
            if let Err(e) = self.monitor.try_send(observation) {
                debug!("anti-cheat observation dropped: {}", e);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
