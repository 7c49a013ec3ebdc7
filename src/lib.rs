//! # Even/Odd Table Server
//!
//! A dice game with exact pool accounting: members wager credit on whether
//! the sum of two dice is even or odd, winners are paid double from a pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    EVEN/ODD SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── account.rs  - Account ids and amounts                   │
//! │  ├── clock.rs    - Wall clock for membership expiry          │
//! │  ├── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │  └── hash.rs     - Round hashing for audits                  │
//! │                                                              │
//! │  ledger/         - Balances and memberships                  │
//! │  ├── cash.rs     - Credit ledger with allowances             │
//! │  └── member_card.rs - Time-limited member cards              │
//! │                                                              │
//! │  game/           - Rounds and settlement                     │
//! │  ├── state.rs    - Dice, wagers, rounds                      │
//! │  ├── outcome.rs  - Dice sources                              │
//! │  ├── engine.rs   - Round state machine                       │
//! │  └── table.rs    - One deployment, all three wired           │
//! │                                                              │
//! │  proof/          - Commit-reveal and round transcripts       │
//! │                                                              │
//! │  network/        - Async service and WebSocket server        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Accounting Guarantee
//!
//! A wager is accepted only while the pool can pay every wager on that
//! side, so settlement never runs the pool dry. Settlement is
//! all-or-nothing: either every winner is paid or nothing moves.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod ledger;
pub mod network;
pub mod proof;

// Re-export commonly used types
pub use core::account::{AccountId, Amount};
pub use core::rng::DeterministicRng;
pub use game::engine::{EngineError, MatchEngine, Settlement, PAYOUT_MULTIPLIER};
pub use game::state::{Dice, Outcome, Parity, RoundId, Wager};
pub use game::table::{Table, TableConfig};
pub use ledger::cash::{Cash, CreditLedger, LedgerError};
pub use ledger::member_card::{CardId, MemberCard, MembershipConfig, MembershipError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
