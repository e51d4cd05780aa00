//! Shared Transactional Store
//!
//! One store backs every request handler; correctness comes from its row
//! locks, not from cross-request in-process state. A table row is an
//! `Arc<Mutex<V>>`: holding the mutex is holding the row lock, and every
//! read or write of row state happens under it. `try_lock_row` gives the
//! lock-skip read used by queue pairing - a candidate held by a concurrent
//! matcher is skipped, never waited on.
//!
//! Nested lock acquisition order, fixed to avoid deadlock:
//! queue entry → payment intent. Duel rows are never held while acquiring
//! an intent lock; resolution commits the duel row first and applies
//! intent/user follow-ups after releasing it.

pub mod user;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

pub use user::{User, Users};

/// A keyed table of individually lockable rows.
pub struct Table<K, V> {
    rows: RwLock<BTreeMap<K, Arc<Mutex<V>>>>,
}

impl<K: Ord + Clone, V> Table<K, V> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a row, replacing any previous row under the key.
    pub async fn insert(&self, key: K, row: V) -> Arc<Mutex<V>> {
        let handle = Arc::new(Mutex::new(row));
        let mut rows = self.rows.write().await;
        rows.insert(key, handle.clone());
        handle
    }

    /// Insert only if the key is absent. Returns `Ok` with the new row
    /// handle, or `Err` with the existing one - the idempotent-create
    /// primitive.
    pub async fn insert_if_absent(&self, key: K, row: V) -> Result<Arc<Mutex<V>>, Arc<Mutex<V>>> {
        let mut rows = self.rows.write().await;
        if let Some(existing) = rows.get(&key) {
            return Err(existing.clone());
        }
        let handle = Arc::new(Mutex::new(row));
        rows.insert(key, handle.clone());
        Ok(handle)
    }

    /// Get a row handle by key.
    pub async fn get(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        let rows = self.rows.read().await;
        rows.get(key).cloned()
    }

    /// Remove a row.
    pub async fn remove(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        let mut rows = self.rows.write().await;
        rows.remove(key)
    }

    /// Snapshot of all row handles, for sweep passes.
    pub async fn snapshot(&self) -> Vec<(K, Arc<Mutex<V>>)> {
        let rows = self.rows.read().await;
        rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Number of rows.
    pub async fn len(&self) -> usize {
        let rows = self.rows.read().await;
        rows.len()
    }

    /// Whether the table holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<K: Ord + Clone, V> Default for Table<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a row, blocking until the current holder releases it.
pub async fn lock_row<V>(row: &Arc<Mutex<V>>) -> MutexGuard<'_, V> {
    row.lock().await
}

/// Try to lock a row without waiting. `None` means a concurrent holder
/// has it - lock-skip semantics for pairing scans.
pub fn try_lock_row<V>(row: &Arc<Mutex<V>>) -> Option<MutexGuard<'_, V>> {
    row.try_lock().ok()
}

/// An append-only log. Records are immutable once written; replay
/// detection reads them, nothing mutates them.
pub struct Log<T> {
    entries: RwLock<Vec<T>>,
}

impl<T: Clone> Log<T> {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append a record.
    pub async fn append(&self, record: T) {
        let mut entries = self.entries.write().await;
        entries.push(record);
    }

    /// Most recent record matching the predicate.
    pub async fn find_last<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let entries = self.entries.read().await;
        entries.iter().rev().find(|r| pred(r)).cloned()
    }

    /// All records, oldest first.
    pub async fn snapshot(&self) -> Vec<T> {
        let entries = self.entries.read().await;
        entries.clone()
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<T: Clone> Default for Log<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let table: Table<u32, String> = Table::new();

        table.insert(1, "one".into()).await;
        assert_eq!(table.len().await, 1);

        let row = table.get(&1).await.unwrap();
        assert_eq!(*row.lock().await, "one");

        table.remove(&1).await;
        assert!(table.get(&1).await.is_none());
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let table: Table<u32, String> = Table::new();

        assert!(table.insert_if_absent(1, "first".into()).await.is_ok());

        // Second insert returns the original row unchanged
        let existing = table.insert_if_absent(1, "second".into()).await.unwrap_err();
        assert_eq!(*existing.lock().await, "first");
    }

    #[tokio::test]
    async fn test_try_lock_skips_held_row() {
        let table: Table<u32, u32> = Table::new();
        let row = table.insert(1, 0).await;

        let held = row.lock().await;
        assert!(try_lock_row(&row).is_none());
        drop(held);

        assert!(try_lock_row(&row).is_some());
    }

    #[tokio::test]
    async fn test_log_append_and_find() {
        let log: Log<(u32, &str)> = Log::new();
        log.append((1, "a")).await;
        log.append((2, "b")).await;
        log.append((1, "c")).await;

        // find_last returns the most recent match
        let found = log.find_last(|(k, _)| *k == 1).await.unwrap();
        assert_eq!(found.1, "c");

        assert!(log.find_last(|(k, _)| *k == 9).await.is_none());
        assert_eq!(log.len().await, 3);
    }
}
