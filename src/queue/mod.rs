//! Matchmaking Queue
//!
//! Pairs two funded, equal-stake players exactly once each. Candidate
//! selection uses a lock-and-skip read: a row held by a concurrent
//! matcher is skipped rather than waited on, and every precondition is
//! re-checked under the candidate's lock before pairing. Both entries
//! flip to `Matched` and the duel row is created while both entry locks
//! are held - one atomic unit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::core::{DuelId, EntryId, UserId};
use crate::duel::DuelEngine;
use crate::ledger::{LedgerError, PaymentLedger};
use crate::store::{lock_row, try_lock_row, Table};

/// Queue entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for an opponent.
    Searching,
    /// Paired into a duel.
    Matched,
    /// Cancelled by the player.
    Cancelled,
    /// Timed out unmatched.
    Expired,
}

impl EntryStatus {
    /// Live entries block further joins by the same user.
    pub fn is_live(self) -> bool {
        matches!(self, EntryStatus::Searching | EntryStatus::Matched)
    }
}

/// One matchmaking queue entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Row identifier.
    pub id: EntryId,
    /// Queued player.
    pub user: UserId,
    /// Stake in micro-units; zero for free duels.
    pub stake_micros: u64,
    /// Entry status.
    pub status: EntryStatus,
    /// Consumed payment reference funding the stake.
    pub funding: Option<String>,
    /// Duel this entry was paired into.
    pub duel: Option<DuelId>,
    /// Join time.
    pub created_at: DateTime<Utc>,
    /// Timeout-sweep deadline.
    pub expires_at: DateTime<Utc>,
}

/// Matchmaking errors.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The user already has a live entry.
    #[error("already queued")]
    AlreadyQueued,

    /// Stake exceeds the configured ceiling.
    #[error("stake {stake_micros} exceeds cap {cap_micros}")]
    StakeCapExceeded {
        /// Requested stake.
        stake_micros: u64,
        /// Configured ceiling.
        cap_micros: u64,
    },

    /// A staked join needs a confirmed payment reference.
    #[error("stake requires a confirmed payment reference")]
    PaymentRequired,

    /// The funding amount does not match the stake.
    #[error("payment amount does not match the stake")]
    FundingMismatch,

    /// The user has no queue entry.
    #[error("not queued")]
    NotQueued,

    /// The entry was already paired; cancellation is too late.
    #[error("entry already matched")]
    AlreadyMatched,

    /// Funding-side ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The matchmaking queue.
pub struct Matchmaking {
    config: Arc<Config>,
    ledger: Arc<PaymentLedger>,
    engine: Arc<DuelEngine>,
    entries: Table<EntryId, QueueEntry>,
    /// Per-user uniqueness index: at most one live entry per user.
    by_user: RwLock<BTreeMap<UserId, EntryId>>,
}

impl Matchmaking {
    /// Create an empty queue.
    pub fn new(config: Arc<Config>, ledger: Arc<PaymentLedger>, engine: Arc<DuelEngine>) -> Self {
        Self {
            config,
            ledger,
            engine,
            entries: Table::new(),
            by_user: RwLock::new(BTreeMap::new()),
        }
    }

    /// Join the queue, then immediately attempt pairing. For stakes above
    /// zero the caller must present a confirmed, not-yet-consumed payment
    /// intent they own; the intent lock is taken before any queue row.
    pub async fn enqueue(
        &self,
        user: UserId,
        stake_micros: u64,
        funding: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueError> {
        if stake_micros > self.config.stake_cap_micros {
            return Err(QueueError::StakeCapExceeded {
                stake_micros,
                cap_micros: self.config.stake_cap_micros,
            });
        }

        let entry_id = {
            // The index write lock is the uniqueness gate: concurrent
            // joins by the same user serialize here
            let mut by_user = self.by_user.write().await;

            if let Some(existing_id) = by_user.get(&user) {
                if let Some(handle) = self.entries.get(existing_id).await {
                    let row = handle.lock().await;
                    if row.status.is_live() {
                        return Err(QueueError::AlreadyQueued);
                    }
                }
            }

            let consumed_ref = if stake_micros > 0 {
                let reference = funding.ok_or(QueueError::PaymentRequired)?;
                let amount = self.ledger.consume_for_join(reference, user, now).await?;
                if amount != stake_micros {
                    self.ledger.release_consumption(reference, now).await?;
                    return Err(QueueError::FundingMismatch);
                }
                Some(reference.to_string())
            } else {
                None
            };

            let entry = QueueEntry {
                id: EntryId::generate(),
                user,
                stake_micros,
                status: EntryStatus::Searching,
                funding: consumed_ref,
                duel: None,
                created_at: now,
                expires_at: now + Duration::seconds(self.config.queue_ttl_secs),
            };
            let entry_id = entry.id;
            self.entries.insert(entry_id, entry).await;
            by_user.insert(user, entry_id);
            entry_id
        };

        debug!("user {} queued as {}", user.short(), entry_id.short());
        self.try_pair(&entry_id, now).await;
        self.snapshot_entry(&entry_id).await.ok_or(QueueError::NotQueued)
    }

    /// Attempt to pair one searching entry against the oldest compatible
    /// candidate. Returns the duel id if pairing happened (or already had).
    pub async fn try_pair(&self, entry_id: &EntryId, now: DateTime<Utc>) -> Option<DuelId> {
        let my_handle = self.entries.get(entry_id).await?;
        let mut me = lock_row(&my_handle).await;

        if me.status != EntryStatus::Searching {
            return me.duel;
        }
        let stake = me.stake_micros;
        let user = me.user;

        // Lock-skip scan: collect compatible candidates, oldest first.
        // Rows held by concurrent matchers are skipped, not waited on.
        let mut candidates: Vec<(DateTime<Utc>, EntryId)> = Vec::new();
        for (id, handle) in self.entries.snapshot().await {
            if id == *entry_id {
                continue;
            }
            let Some(row) = try_lock_row(&handle) else {
                continue;
            };
            if row.status == EntryStatus::Searching
                && row.stake_micros == stake
                && row.user != user
                && row.expires_at > now
            {
                candidates.push((row.created_at, id));
            }
        }
        candidates.sort();

        for (_, candidate_id) in candidates {
            let Some(handle) = self.entries.get(&candidate_id).await else {
                continue;
            };
            let Some(mut candidate) = try_lock_row(&handle) else {
                continue;
            };
            // Re-check under the lock: a concurrent matcher may have
            // taken this entry between the scan and now
            if candidate.status != EntryStatus::Searching
                || candidate.stake_micros != stake
                || candidate.user == user
                || candidate.expires_at <= now
            {
                continue;
            }

            // Atomic unit: both entries flip and the duel row is created
            // while both entry locks are held
            let duel_id = self
                .engine
                .create_duel(
                    (me.user, me.funding.clone()),
                    (candidate.user, candidate.funding.clone()),
                    stake,
                    now,
                )
                .await;
            me.status = EntryStatus::Matched;
            me.duel = Some(duel_id);
            candidate.status = EntryStatus::Matched;
            candidate.duel = Some(duel_id);

            for funding in [me.funding.clone(), candidate.funding.clone()]
                .into_iter()
                .flatten()
            {
                let _ = self.ledger.link_duel(&funding, duel_id).await;
            }

            info!(
                "paired {} and {} into duel {}",
                me.user.short(),
                candidate.user.short(),
                duel_id.short()
            );
            return Some(duel_id);
        }

        None
    }

    /// The user's current entry, if any.
    pub async fn status(&self, user: &UserId) -> Result<QueueEntry, QueueError> {
        let by_user = self.by_user.read().await;
        let entry_id = by_user.get(user).ok_or(QueueError::NotQueued)?;
        self.snapshot_entry(entry_id).await.ok_or(QueueError::NotQueued)
    }

    /// Cancel a searching entry. Funding is released back to the wallet
    /// ledger, usable by a later join. Cancelling a terminal entry is an
    /// idempotent no-op; a matched entry can no longer be cancelled.
    pub async fn cancel(&self, user: &UserId, now: DateTime<Utc>) -> Result<QueueEntry, QueueError> {
        let entry_id = {
            let by_user = self.by_user.read().await;
            *by_user.get(user).ok_or(QueueError::NotQueued)?
        };
        let handle = self.entries.get(&entry_id).await.ok_or(QueueError::NotQueued)?;
        let mut guard = handle.lock().await;

        match guard.status {
            EntryStatus::Searching => {
                guard.status = EntryStatus::Cancelled;
                if let Some(reference) = guard.funding.clone() {
                    self.ledger.release_consumption(&reference, now).await?;
                }
                info!("user {} left the queue", user.short());
                Ok(guard.clone())
            }
            EntryStatus::Matched => Err(QueueError::AlreadyMatched),
            _ => Ok(guard.clone()),
        }
    }

    /// Periodic timeout sweep: searching entries past expiry become
    /// `Expired`, and funded ones release their deposit into the refund
    /// flow with a fixed deadline. Idempotent and safe from concurrent
    /// workers - only rows still in the precondition state are touched.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let refund_deadline = now + Duration::seconds(self.config.refund_window_secs);
        let mut expired = 0;

        for (id, handle) in self.entries.snapshot().await {
            let mut guard = lock_row(&handle).await;
            if guard.status != EntryStatus::Searching || guard.expires_at > now {
                continue;
            }
            guard.status = EntryStatus::Expired;
            expired += 1;
            info!("queue entry {} expired", id.short());

            if let Some(reference) = guard.funding.clone() {
                let _ = self
                    .ledger
                    .mark_refund_eligible(&reference, refund_deadline, now)
                    .await;
            }
        }
        expired
    }

    /// Periodic pairing pass for entries left searching by interleaved
    /// joins. Same lock-skip discipline as the inline attempt.
    pub async fn pair_sweep(&self, now: DateTime<Utc>) -> usize {
        let mut searching: Vec<(DateTime<Utc>, EntryId)> = Vec::new();
        for (id, handle) in self.entries.snapshot().await {
            let Some(row) = try_lock_row(&handle) else {
                continue;
            };
            if row.status == EntryStatus::Searching && row.expires_at > now {
                searching.push((row.created_at, id));
            }
        }
        searching.sort();

        let mut paired = 0;
        for (_, id) in searching {
            if self.try_pair(&id, now).await.is_some() {
                paired += 1;
            }
        }
        paired
    }

    async fn snapshot_entry(&self, id: &EntryId) -> Option<QueueEntry> {
        let handle = self.entries.get(id).await?;
        let guard = handle.lock().await;
        Some(guard.clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================
