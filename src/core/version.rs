//! Optimistic State Version
//!
//! Every mutable row carries a monotonically increasing version counter.
//! Writers read the version, prepare a change, and advance the counter
//! conditioned on the version being unchanged. A stale write is rejected;
//! the caller must re-read and retry, never overwrite blindly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected write against a stale version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stale state version: expected {expected}, current {current}")]
pub struct VersionConflict {
    /// Version the writer last read.
    pub expected: u64,
    /// Version the row actually holds.
    pub current: u64,
}

/// Monotonic version counter with a compare-and-swap advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateVersion(u64);

impl StateVersion {
    /// Initial version of a freshly created row.
    pub const fn initial() -> Self {
        Self(1)
    }

    /// Raw counter value.
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Advance the counter by one, conditioned on `expected` matching the
    /// current value. Returns the new version on success.
    pub fn advance(&mut self, expected: StateVersion) -> Result<StateVersion, VersionConflict> {
        if self.0 != expected.0 {
            return Err(VersionConflict {
                expected: expected.0,
                current: self.0,
            });
        }
        self.0 += 1;
        Ok(*self)
    }
}

impl Default for StateVersion {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_with_current_version() {
        let mut v = StateVersion::initial();
        let read = v;

        let next = v.advance(read).unwrap();
        assert_eq!(next.get(), 2);
        assert_eq!(v.get(), 2);
    }

    #[test]
    fn test_stale_write_rejected() {
        let mut v = StateVersion::initial();
        let stale = v;
        v.advance(stale).unwrap();

        // A writer still holding the old version must be rejected
        let err = v.advance(stale).unwrap_err();
        assert_eq!(err.expected, 1);
        assert_eq!(err.current, 2);

        // Version is untouched by the failed write
        assert_eq!(v.get(), 2);
    }

    #[test]
    fn test_versions_are_monotonic() {
        let mut v = StateVersion::initial();
        for expected in 1..100u64 {
            assert_eq!(v.get(), expected);
            let read = v;
            v.advance(read).unwrap();
        }
    }
}
