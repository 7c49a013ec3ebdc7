//! Game Logic Module
//!
//! The betting game itself. Everything here except the outcome draw is
//! deterministic.
//!
//! ## Module Structure
//!
//! - `state`: Parity, dice, wagers, rounds and the engine phase
//! - `outcome`: Pluggable dice sources
//! - `engine`: Round state machine and settlement
//! - `table`: Cash + MemberCard + engine as one deployment

pub mod state;
pub mod outcome;
pub mod engine;
pub mod table;

// Re-export key types
pub use state::{Dice, EnginePhase, InvalidDice, Outcome, Parity, Round, RoundId, RoundStatus, Wager};
pub use outcome::{CommitRevealDice, EntropyDice, FixedDice, OutcomeError, OutcomeSource, SeededDice};
pub use engine::{EngineError, MatchEngine, Payout, Settlement, PAYOUT_MULTIPLIER};
pub use table::{Table, TableConfig};
