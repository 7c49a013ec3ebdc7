//! Outcome Sources
//!
//! The dice draw is the only non-determinism in a round. It sits behind the
//! [`OutcomeSource`] trait so the engine can run on replayable seeds, fresh
//! entropy, a scripted sequence, or an operator commit-reveal scheme.
//!
//! The legacy deployment drew from block-derived entropy, which whoever
//! orders transactions can predict. [`CommitRevealDice`] replaces it in the
//! service: the operator commits to a per-round secret before the round
//! accepts wagers, and the dice are seeded from that secret together with
//! the final wager digest. This changes the fairness model and is not a
//! drop-in for the legacy behavior.

use std::collections::{BTreeMap, VecDeque};

use sha2::{Sha256, Digest};
use thiserror::Error;

use crate::core::hash::StateHash;
use crate::core::rng::DeterministicRng;
use crate::game::state::{Dice, RoundId};
use crate::proof::commitment::{CommitmentError, RoundCommitment, SeedReveal};

/// Outcome source failures. The engine aborts settlement with no state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutcomeError {
    /// Scripted sequence has no rolls left.
    #[error("scripted dice exhausted")]
    ScriptExhausted,

    /// Scripted face outside 1..=6.
    #[error("invalid die faces ({die1}, {die2})")]
    InvalidFace {
        /// First face.
        die1: u8,
        /// Second face.
        die2: u8,
    },

    /// No secret was committed for the round.
    #[error("no commitment for round {0}")]
    MissingCommitment(RoundId),

    /// Stored secret no longer opens the published commitment.
    #[error("commitment check failed: {0}")]
    Commitment(#[from] CommitmentError),
}

/// Produces two independent uniform draws from {1..6} per round.
pub trait OutcomeSource: Send + Sync {
    /// Publish a commitment for a round that is about to open.
    fn commit(&mut self, _round_id: RoundId) -> Option<RoundCommitment> {
        None
    }

    /// Draw the dice for a round whose wagers hash to `wager_digest`.
    fn roll(&mut self, round_id: RoundId, wager_digest: &StateHash) -> Result<Dice, OutcomeError>;

    /// Hand over the opened secret once a round has settled.
    fn take_reveal(&mut self, _round_id: RoundId) -> Option<SeedReveal> {
        None
    }
}

// =============================================================================
// SEEDED / ENTROPY
// =============================================================================

/// Replayable dice from a fixed seed.
#[derive(Debug, Clone)]
pub struct SeededDice {
    rng: DeterministicRng,
}

impl SeededDice {
    /// Dice seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self { rng: DeterministicRng::new(seed) }
    }
}

impl OutcomeSource for SeededDice {
    fn roll(&mut self, _round_id: RoundId, _wager_digest: &StateHash) -> Result<Dice, OutcomeError> {
        Ok(Dice::roll(&mut self.rng))
    }
}

/// Dice seeded from fresh entropy at construction.
#[derive(Debug, Clone)]
pub struct EntropyDice {
    rng: DeterministicRng,
}

impl EntropyDice {
    /// Seed from the OS.
    pub fn new() -> Self {
        Self { rng: DeterministicRng::from_entropy() }
    }
}

impl Default for EntropyDice {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeSource for EntropyDice {
    fn roll(&mut self, _round_id: RoundId, _wager_digest: &StateHash) -> Result<Dice, OutcomeError> {
        Ok(Dice::roll(&mut self.rng))
    }
}

// =============================================================================
// FIXED
// =============================================================================

/// Scripted rolls, consumed in order.
#[derive(Debug, Clone, Default)]
pub struct FixedDice {
    script: VecDeque<(u8, u8)>,
    fallback: Option<(u8, u8)>,
}

impl FixedDice {
    /// Play back `rolls`, then fail with [`OutcomeError::ScriptExhausted`].
    pub fn new(rolls: impl IntoIterator<Item = (u8, u8)>) -> Self {
        Self {
            script: rolls.into_iter().collect(),
            fallback: None,
        }
    }

    /// Always roll the same faces.
    pub fn always(die1: u8, die2: u8) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Some((die1, die2)),
        }
    }

    /// Queue more rolls.
    pub fn push(&mut self, die1: u8, die2: u8) {
        self.script.push_back((die1, die2));
    }

    /// Scripted rolls not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl OutcomeSource for FixedDice {
    fn roll(&mut self, _round_id: RoundId, _wager_digest: &StateHash) -> Result<Dice, OutcomeError> {
        let (die1, die2) = match self.script.front() {
            Some(faces) => *faces,
            None => self.fallback.ok_or(OutcomeError::ScriptExhausted)?,
        };
        let dice = Dice::new(die1, die2).ok_or(OutcomeError::InvalidFace { die1, die2 })?;
        self.script.pop_front();
        Ok(dice)
    }
}

// =============================================================================
// COMMIT-REVEAL
// =============================================================================

/// Operator commit-reveal dice.
///
/// A secret is generated and committed when a round opens. Rolling the same
/// round twice (for example after a settlement that was rejected) yields the
/// same dice, so a failed settlement can't be used to reroll.
#[derive(Debug, Clone, Default)]
pub struct CommitRevealDice {
    master: Option<[u8; 32]>,
    pending: BTreeMap<RoundId, (RoundCommitment, SeedReveal)>,
}

impl CommitRevealDice {
    /// Fresh random secret per round.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-round secrets derived from a master secret, for replays.
    pub fn from_master_secret(master: [u8; 32]) -> Self {
        Self {
            master: Some(master),
            pending: BTreeMap::new(),
        }
    }

    /// Commitment published for a round still awaiting settlement.
    pub fn commitment_for(&self, round_id: RoundId) -> Option<RoundCommitment> {
        self.pending.get(&round_id).map(|(commitment, _)| *commitment)
    }

    fn secret_for(&self, round_id: RoundId) -> SeedReveal {
        match self.master {
            Some(master) => {
                let mut hasher = Sha256::new();
                hasher.update(b"EVEN_ODD_ROUND_SECRET_V1");
                hasher.update(master);
                hasher.update(round_id.to_le_bytes());
                SeedReveal { round_id, secret: hasher.finalize().into() }
            }
            None => SeedReveal::generate(round_id),
        }
    }
}

impl OutcomeSource for CommitRevealDice {
    fn commit(&mut self, round_id: RoundId) -> Option<RoundCommitment> {
        let reveal = self.secret_for(round_id);
        let commitment = reveal.commitment();
        self.pending.insert(round_id, (commitment, reveal));
        Some(commitment)
    }

    fn roll(&mut self, round_id: RoundId, wager_digest: &StateHash) -> Result<Dice, OutcomeError> {
        let (commitment, reveal) = self
            .pending
            .get(&round_id)
            .ok_or(OutcomeError::MissingCommitment(round_id))?;
        commitment.verify(reveal)?;
        Ok(reveal.roll(wager_digest))
    }

    fn take_reveal(&mut self, round_id: RoundId) -> Option<SeedReveal> {
        self.pending.remove(&round_id).map(|(_, reveal)| reveal)
    }
}
