//! Anti-Cheat Monitor
//!
//! Asynchronous observer of committed duel outcomes. Tracks a rolling
//! per-user reaction average and appends a SuspiciousActivityRecord when
//! the average across the configured window drops below the implausibility
//! threshold, or when a single reaction lands under the human floor.
//! Purely observational: it never blocks or delays settlement, and its
//! records are immutable once written.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{DuelId, UserId};
use crate::duel::DuelResult;
use crate::store::Log;

/// A committed outcome, one per player per resolved duel.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// Observed player.
    pub user: UserId,
    /// Resolved duel.
    pub duel: DuelId,
    /// The player's committed result.
    pub result: DuelResult,
    /// Valid reaction time, if the player had one.
    pub reaction_ms: Option<i64>,
    /// Player false-started.
    pub false_start: bool,
    /// Reaction was under the plausibility floor.
    pub implausible: bool,
}

/// Why a record was appended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    /// A single reaction under the human floor.
    BelowHumanFloor,
    /// The rolling average across the window is implausibly fast.
    ImplausibleRollingAverage,
}

/// Append-only suspicion record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuspiciousActivityRecord {
    /// Record id.
    pub id: uuid::Uuid,
    /// Flagged player.
    pub user: UserId,
    /// Duel that triggered the flag.
    pub duel: DuelId,
    /// The triggering reaction, when a single tap caused the flag.
    pub reaction_ms: Option<i64>,
    /// Rolling average at flag time, when the window caused the flag.
    pub rolling_avg_ms: Option<i64>,
    /// Flag reason.
    pub reason: SuspicionReason,
    /// Observation time.
    pub created_at: DateTime<Utc>,
}

/// The monitor task plus the shared record log.
pub struct AntiCheatMonitor {
    records: Arc<Log<SuspiciousActivityRecord>>,
    /// Last-N valid reactions per user.
    windows: BTreeMap<UserId, VecDeque<i64>>,
    config: Arc<Config>,
}

impl AntiCheatMonitor {
    /// Spawn the monitor. Returns the observation sender, the shared
    /// record log, and the task handle.
    pub fn spawn(
        config: Arc<Config>,
    ) -> (
        mpsc::Sender<Observation>,
        Arc<Log<SuspiciousActivityRecord>>,
        JoinHandle<()>,
    ) {
        let (tx, mut rx) = mpsc::channel::<Observation>(256);
        let records = Arc::new(Log::new());

        let mut monitor = Self {
            records: records.clone(),
            windows: BTreeMap::new(),
            config,
        };

        let handle = tokio::spawn(async move {
            while let Some(observation) = rx.recv().await {
                monitor.observe(observation, Utc::now()).await;
            }
        });

        (tx, records, handle)
    }

    /// Fold one committed outcome into the rolling window and flag
    /// anything implausible.
    pub async fn observe(&mut self, observation: Observation, now: DateTime<Utc>) {
        if observation.implausible {
            warn!(
                "user {} reaction {}ms under human floor in duel {}",
                observation.user.short(),
                observation.reaction_ms.unwrap_or_default(),
                observation.duel.short()
            );
            self.records
                .append(SuspiciousActivityRecord {
                    id: uuid::Uuid::new_v4(),
                    user: observation.user,
                    duel: observation.duel,
                    reaction_ms: observation.reaction_ms,
                    rolling_avg_ms: None,
                    reason: SuspicionReason::BelowHumanFloor,
                    created_at: now,
                })
                .await;
        }

        let Some(reaction) = observation.reaction_ms else {
            return;
        };

        let window = self.windows.entry(observation.user).or_default();
        window.push_back(reaction);
        while window.len() > self.config.anticheat_window {
            window.pop_front();
        }

        if window.len() < self.config.anticheat_window {
            return;
        }
        let avg = window.iter().sum::<i64>() / window.len() as i64;
        if avg < self.config.implausible_avg_ms as i64 {
            info!(
                "user {} rolling average {}ms over {} duels is implausible",
                observation.user.short(),
                avg,
                window.len()
            );
            self.records
                .append(SuspiciousActivityRecord {
                    id: uuid::Uuid::new_v4(),
                    user: observation.user,
                    duel: observation.duel,
                    reaction_ms: Some(reaction),
                    rolling_avg_ms: Some(avg),
                    reason: SuspicionReason::ImplausibleRollingAverage,
                    created_at: now,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(user: UserId, reaction_ms: Option<i64>, implausible: bool) -> Observation {
        Observation {
            user,
            duel: DuelId::new([3; 16]),
            result: DuelResult::Win,
            reaction_ms,
            false_start: false,
            implausible,
        }
    }

    fn monitor(window: usize, threshold: u32) -> AntiCheatMonitor {
        let config = Config {
            anticheat_window: window,
            implausible_avg_ms: threshold,
            ..Default::default()
        };
        AntiCheatMonitor {
            records: Arc::new(Log::new()),
            windows: BTreeMap::new(),
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn test_below_floor_is_flagged_immediately() {
        let mut m = monitor(10, 150);
        let user = UserId::new([1; 16]);

        m.observe(observation(user, Some(40), true), Utc::now()).await;

        let records = m.records.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, SuspicionReason::BelowHumanFloor);
    }

    #[tokio::test]
    async fn test_rolling_average_flags_after_full_window() {
        let mut m = monitor(3, 150);
        let user = UserId::new([1; 16]);
        let now = Utc::now();

        // Two fast reactions: window not full yet, no flag
        m.observe(observation(user, Some(100), false), now).await;
        m.observe(observation(user, Some(110), false), now).await;
        assert!(m.records.is_empty().await);

        // Third fills the window; average 105 < 150
        m.observe(observation(user, Some(105), false), now).await;
        let records = m.records.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, SuspicionReason::ImplausibleRollingAverage);
        assert_eq!(records[0].rolling_avg_ms, Some(105));
    }

    #[tokio::test]
    async fn test_plausible_average_not_flagged() {
        let mut m = monitor(3, 150);
        let user = UserId::new([1; 16]);
        let now = Utc::now();

        for _ in 0..5 {
            m.observe(observation(user, Some(240), false), now).await;
        }
        assert!(m.records.is_empty().await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let mut m = monitor(3, 150);
        let user = UserId::new([1; 16]);
        let now = Utc::now();

        // Slow history keeps the average up
        m.observe(observation(user, Some(400), false), now).await;
        m.observe(observation(user, Some(400), false), now).await;
        m.observe(observation(user, Some(100), false), now).await;
        assert!(m.records.is_empty().await);

        // Two more fast ones push the old taps out of the window
        m.observe(observation(user, Some(100), false), now).await;
        m.observe(observation(user, Some(100), false), now).await;
        assert_eq!(m.records.len().await, 1);
    }

    #[tokio::test]
    async fn test_false_starts_do_not_enter_window() {
        let mut m = monitor(1, 150);
        let user = UserId::new([1; 16]);

        let mut obs = observation(user, None, false);
        obs.false_start = true;
        m.observe(obs, Utc::now()).await;
        assert!(m.records.is_empty().await);
    }
}
