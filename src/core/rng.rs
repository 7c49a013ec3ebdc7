//! Deterministic Random Number Generator
//!
//! Uses Xorshift128+ for fast, replayable randomness.
//! Given the same seed, produces the identical sequence on all platforms,
//! which is what lets a settled round be re-rolled by an auditor.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use super::hash::StateHash;

/// Number of faces on a die.
pub const DIE_FACES: u8 = 6;

/// Domain separator for round seed derivation.
const ROUND_SEED_DOMAIN: &[u8] = b"EVEN_ODD_ROUND_SEED_V1";

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use even_odd::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.roll_die(), b.roll_die());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG seeded from fresh OS entropy.
    ///
    /// The seed comes from a v4 UUID (backed by the OS RNG) folded through
    /// SHA-256. Sequences are not replayable.
    pub fn from_entropy() -> Self {
        let nonce = uuid::Uuid::new_v4();
        let mut hasher = Sha256::new();
        hasher.update(b"EVEN_ODD_ENTROPY_V1");
        hasher.update(nonce.as_bytes());
        let hash = hasher.finalize();

        let mut seed = [0u8; 8];
        seed.copy_from_slice(&hash[..8]);
        Self::new(u64::from_le_bytes(seed))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a uniform integer in range [0, max).
    ///
    /// Rejection sampling: draws that fall in the biased tail of the
    /// u64 range are discarded.
    pub fn next_below(&mut self, max: u64) -> u64 {
        if max <= 1 {
            return 0;
        }
        let zone = u64::MAX - (u64::MAX % max);
        loop {
            let value = self.next_u64();
            if value < zone {
                return value % max;
            }
        }
    }

    /// Roll one fair six-sided die, returning a value in 1..=6.
    #[inline]
    pub fn roll_die(&mut self) -> u8 {
        self.next_below(DIE_FACES as u64) as u8 + 1
    }

    /// Get current state (for checkpointing/debugging).
    pub fn state(&self) -> [u64; 2] {
        self.state
    }

    /// Restore from saved state.
    pub fn set_state(&mut self, state: [u64; 2]) {
        self.state = state;
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive the seed for a round's dice roll.
///
/// Mixes the operator's revealed secret with the round id and the digest of
/// every wager accepted in that round, so the roll is fixed only once the
/// wagers are final and the secret was committed before they were placed.
pub fn derive_round_seed(secret: &[u8; 32], round_id: u64, wager_digest: &StateHash) -> u64 {
    let mut hasher = Sha256::new();

    hasher.update(ROUND_SEED_DOMAIN);
    hasher.update(secret);
    hasher.update(round_id.to_le_bytes());
    hasher.update(wager_digest);

    let hash = hasher.finalize();

    // First 8 bytes as seed
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================
