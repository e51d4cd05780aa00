//! Core primitives.
//!
//! Typed identifiers, the signal-delay RNG, and the optimistic version
//! counter shared by every state-mutating operation.

pub mod id;
pub mod rng;
pub mod version;

// Re-export core types
pub use id::{DuelId, EntryId, UserId};
pub use rng::{derive_signal_seed, DeterministicRng};
pub use version::{StateVersion, VersionConflict};
