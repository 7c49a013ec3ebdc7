//! Round Commitment Protocol
//!
//! The operator commits to a secret for a round before that round accepts
//! wagers. At settlement the secret is revealed and combined with the final
//! wager digest to seed the dice, so anyone can recompute the roll.

use sha2::{Sha256, Digest};
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::hash::StateHash;
use crate::core::rng::{derive_round_seed, DeterministicRng};
use crate::game::state::{Dice, RoundId};

/// Domain separator for commitments.
const COMMITMENT_DOMAIN: &[u8] = b"EVEN_ODD_COMMIT_V1";

/// Published before a round opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCommitment {
    /// Round the commitment binds.
    pub round_id: RoundId,
    /// SHA-256 of the domain, round id and secret.
    pub commitment_hash: StateHash,
}

/// Secret opened at settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReveal {
    /// Round the secret was committed for.
    pub round_id: RoundId,
    /// Operator secret.
    pub secret: [u8; 32],
}

/// Errors that can occur during commitment verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    /// Reveal is for another round.
    #[error("reveal for round {got} does not match commitment for round {expected}")]
    RoundMismatch {
        /// Round in the commitment.
        expected: RoundId,
        /// Round in the reveal.
        got: RoundId,
    },

    /// Secret hash doesn't match commitment.
    #[error("revealed secret does not match commitment")]
    PreimageMismatch,
}

impl RoundCommitment {
    /// Commit to `secret` for `round_id`.
    pub fn new(round_id: RoundId, secret: &[u8; 32]) -> Self {
        Self {
            round_id,
            commitment_hash: compute_commitment_hash(round_id, secret),
        }
    }

    /// Verify that a reveal opens this commitment.
    pub fn verify(&self, reveal: &SeedReveal) -> Result<(), CommitmentError> {
        if reveal.round_id != self.round_id {
            return Err(CommitmentError::RoundMismatch {
                expected: self.round_id,
                got: reveal.round_id,
            });
        }

        if compute_commitment_hash(reveal.round_id, &reveal.secret) != self.commitment_hash {
            return Err(CommitmentError::PreimageMismatch);
        }

        Ok(())
    }
}

impl SeedReveal {
    /// Generate a fresh secret for a round.
    pub fn generate(round_id: RoundId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        Self {
            round_id,
            secret: hasher.finalize().into(),
        }
    }

    /// Commitment for this secret.
    pub fn commitment(&self) -> RoundCommitment {
        RoundCommitment::new(self.round_id, &self.secret)
    }

    /// Roll the dice this secret determines for a final wager list.
    pub fn roll(&self, wager_digest: &StateHash) -> Dice {
        let seed = derive_round_seed(&self.secret, self.round_id, wager_digest);
        Dice::roll(&mut DeterministicRng::new(seed))
    }
}

/// Compute commitment hash.
fn compute_commitment_hash(round_id: RoundId, secret: &[u8; 32]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(round_id.to_le_bytes());
    hasher.update(secret);
    hasher.finalize().into()
}
