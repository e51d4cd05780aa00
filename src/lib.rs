//! # SnapDuel Match & Settlement Engine
//!
//! Authoritative server for real-money, head-to-head reflex duels: two
//! players stake a wager, race to react to a randomized signal, and the
//! winner claims the pot minus the platform fee.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SNAPDUEL SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/          - Shared primitives                         │
//! │  ├── id.rs      - Typed 16-byte identifiers                 │
//! │  ├── rng.rs     - Nonce-seeded Xorshift128+ signal delay    │
//! │  └── version.rs - Optimistic version counter (CAS)          │
//! │                                                             │
//! │  store/         - Shared transactional store                │
//! │  ├── mod.rs     - Row-locked tables, lock-skip, logs        │
//! │  └── user.rs    - User rows                                 │
//! │                                                             │
//! │  ledger/        - Payment intent ledger                     │
//! │  queue/         - Matchmaking queue (exactly-once pairing)  │
//! │  duel/          - Match state machine + resolution sweeps   │
//! │  settle/        - Claim/refund processor, treasury seam     │
//! │  anticheat.rs   - Async outcome observer                    │
//! │                                                             │
//! │  network/       - HTTP surface (non-authoritative)          │
//! │  ├── auth.rs    - Bearer JWT validation                     │
//! │  ├── api.rs     - axum routes and handlers                  │
//! │  └── error.rs   - Error taxonomy -> status codes            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Correctness Model
//!
//! There is no cross-request in-process mutable state the engine relies
//! on: every guarantee comes from the store's row locks and the version
//! CAS applied by each state-mutating write. Queue pairing uses lock-skip
//! candidate selection, timeouts are enforced by idempotent sweeps safe
//! to run from many workers, and settlement flips a payout flag only
//! after the provider returned a settlement reference.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod anticheat;
pub mod config;
pub mod core;
pub mod duel;
pub mod ledger;
pub mod network;
pub mod queue;
pub mod settle;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use crate::core::{DuelId, EntryId, StateVersion, UserId};
pub use duel::{Duel, DuelEngine, DuelPhase, DuelResult, DuelStatus};
pub use ledger::{PaymentIntent, PaymentLedger};
pub use network::{router, App};
pub use queue::Matchmaking;
pub use settle::{DevTreasury, SettlementProcessor, Treasury};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
