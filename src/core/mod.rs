//! Core primitives.
//!
//! Identity, hashing, randomness and time. Everything except [`clock::SystemClock`]
//! and [`rng::DeterministicRng::from_entropy`] is fully deterministic.

pub mod account;
pub mod clock;
pub mod rng;
pub mod hash;

// Re-export core types
pub use account::{AccountId, Amount};
pub use clock::{Clock, ManualClock, SystemClock};
pub use rng::DeterministicRng;
pub use hash::{StateHash, StateHasher};
