//! Match State Machine
//!
//! The duel row and the engine that drives it:
//!
//! - `state`: the match row, statuses, per-player slots, phase derivation
//! - `engine`: ready/heartbeat/tap handling, the randomized signal, the
//!   single resolution write, and the abandonment/timeout sweeps

pub mod engine;
pub mod state;

// Re-export key types
pub use engine::{DuelEngine, DuelError, ReadyAck, TapAck};
pub use state::{
    ClaimStatus, Duel, DuelPhase, DuelResult, DuelStatus, PayoutState, PlayerSlot, TapRecord,
};
