//! User Rows
//!
//! A user row is created on first authenticated request and mutated only
//! by match resolution (win/loss tallies, rolling reaction average).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::UserId;
use crate::store::Table;

/// A registered player.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    /// Identity derived from the gateway's subject claim.
    pub id: UserId,
    /// Custodial wallet address supplied by the identity gateway.
    pub wallet: String,
    /// Cumulative duel wins.
    pub wins: u32,
    /// Cumulative duel losses.
    pub losses: u32,
    /// Rolling mean reaction time in milliseconds.
    pub avg_reaction_ms: Option<f64>,
    /// Number of reactions folded into the rolling mean.
    pub reaction_samples: u32,
    /// First sign-in time.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a fresh row at first sign-in.
    pub fn new(id: UserId, wallet: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            wallet,
            wins: 0,
            losses: 0,
            avg_reaction_ms: None,
            reaction_samples: 0,
            created_at: now,
        }
    }

    /// Fold a reaction time into the rolling mean.
    pub fn record_reaction(&mut self, reaction_ms: i64) {
        self.reaction_samples += 1;
        let x = reaction_ms as f64;
        let mean = self.avg_reaction_ms.unwrap_or(0.0);
        self.avg_reaction_ms = Some(mean + (x - mean) / self.reaction_samples as f64);
    }
}

/// All user rows.
pub struct Users {
    rows: Table<UserId, User>,
}

impl Users {
    /// Create an empty user table.
    pub fn new() -> Self {
        Self { rows: Table::new() }
    }

    /// Create the row on first sign-in; later calls return the existing
    /// row untouched.
    pub async fn ensure(&self, id: UserId, wallet: &str, now: DateTime<Utc>) -> User {
        let handle = match self
            .rows
            .insert_if_absent(id, User::new(id, wallet.to_string(), now))
            .await
        {
            Ok(created) => created,
            Err(existing) => existing,
        };
        let row = handle.lock().await;
        row.clone()
    }

    /// Snapshot a user row.
    pub async fn get(&self, id: &UserId) -> Option<User> {
        let handle = self.rows.get(id).await?;
        let row = handle.lock().await;
        Some(row.clone())
    }

    /// Wallet address for payouts.
    pub async fn wallet_of(&self, id: &UserId) -> Option<String> {
        self.get(id).await.map(|u| u.wallet)
    }

    /// Apply a committed duel outcome to the tallies. Draws touch neither
    /// counter; reaction times fold into the rolling mean when present.
    pub async fn record_outcome(&self, id: &UserId, won: Option<bool>, reaction_ms: Option<i64>) {
        let Some(handle) = self.rows.get(id).await else {
            return;
        };
        let mut row = handle.lock().await;
        match won {
            Some(true) => row.wins += 1,
            Some(false) => row.losses += 1,
            None => {}
        }
        if let Some(ms) = reaction_ms {
            row.record_reaction(ms);
        }
    }
}

impl Default for Users {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let users = Users::new();
        let id = UserId::from_subject("alice");
        let now = Utc::now();

        let first = users.ensure(id, "0xabc", now).await;
        assert_eq!(first.wallet, "0xabc");

        // A second sign-in with a different wallet does not overwrite
        let second = users.ensure(id, "0xdef", now).await;
        assert_eq!(second.wallet, "0xabc");
    }

    #[tokio::test]
    async fn test_record_outcome_tallies() {
        let users = Users::new();
        let id = UserId::from_subject("bob");
        users.ensure(id, "0xabc", Utc::now()).await;

        users.record_outcome(&id, Some(true), Some(200)).await;
        users.record_outcome(&id, Some(false), Some(300)).await;
        users.record_outcome(&id, None, None).await;

        let row = users.get(&id).await.unwrap();
        assert_eq!(row.wins, 1);
        assert_eq!(row.losses, 1);
        assert_eq!(row.reaction_samples, 2);
        assert_eq!(row.avg_reaction_ms, Some(250.0));
    }

    #[test]
    fn test_rolling_mean() {
        let mut user = User::new(UserId::new([1; 16]), "w".into(), Utc::now());
        user.record_reaction(100);
        user.record_reaction(200);
        user.record_reaction(300);
        assert_eq!(user.avg_reaction_ms, Some(200.0));
    }
}
