//! Verification API
//!
//! Audit a settled round by replaying its transcript: rebuild the round from
//! its wagers, re-derive the dice from the reveal when there is one, and
//! recompute every payout.

use thiserror::Error;

use crate::core::hash::StateHash;
use crate::game::engine::PAYOUT_MULTIPLIER;
use crate::game::state::{Dice, Outcome, Round};
use crate::ledger::member_card::CardId;
use crate::proof::commitment::CommitmentError;
use crate::proof::transcript::{RoundTranscript, TRANSCRIPT_VERSION};

/// Verification result.
#[derive(Debug)]
pub struct VerificationResult {
    /// Did verification pass?
    pub valid: bool,

    /// Round hash from replay.
    pub computed_round_hash: StateHash,

    /// Round hash recorded in the transcript.
    pub expected_round_hash: StateHash,

    /// Detailed error if verification failed.
    pub error: Option<VerificationError>,
}

/// Errors that can occur during verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Transcript version mismatch.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected version.
        expected: u8,
        /// Actual version.
        got: u8,
    },

    /// A card bet twice in the round.
    #[error("{0} appears twice in the round")]
    DuplicateWager(CardId),

    /// A recorded wager has no stake, or stakes overflow.
    #[error("invalid wager at index {0}")]
    InvalidWager(usize),

    /// Parity does not follow from the dice.
    #[error("recorded parity does not match the dice")]
    ParityMismatch,

    /// Reveal present without a commitment.
    #[error("reveal without commitment")]
    MissingCommitment,

    /// Reveal does not open the commitment.
    #[error("commitment check failed: {0}")]
    Commitment(#[from] CommitmentError),

    /// Dice re-derived from the reveal differ from the recorded outcome.
    #[error("dice mismatch: recorded {recorded:?}, derived {derived:?}")]
    DiceMismatch {
        /// Dice in the transcript.
        recorded: Dice,
        /// Dice derived from the reveal.
        derived: Dice,
    },

    /// Payout list differs from the one the wagers imply.
    #[error("payout mismatch at position {0}")]
    PayoutMismatch(usize),

    /// Round hash mismatch.
    #[error("round hash mismatch")]
    RoundHashMismatch {
        /// Expected hash.
        expected: StateHash,
        /// Computed hash.
        computed: StateHash,
    },
}

/// Verify a round transcript by replay.
pub fn verify_transcript(transcript: &RoundTranscript) -> VerificationResult {
    let expected = transcript.round_hash;
    match replay(transcript) {
        Ok(computed) if computed == expected => VerificationResult {
            valid: true,
            computed_round_hash: computed,
            expected_round_hash: expected,
            error: None,
        },
        Ok(computed) => VerificationResult {
            valid: false,
            computed_round_hash: computed,
            expected_round_hash: expected,
            error: Some(VerificationError::RoundHashMismatch { expected, computed }),
        },
        Err(error) => VerificationResult {
            valid: false,
            computed_round_hash: [0; 32],
            expected_round_hash: expected,
            error: Some(error),
        },
    }
}

/// Rebuild the settled round and return its hash.
fn replay(transcript: &RoundTranscript) -> Result<StateHash, VerificationError> {
    if transcript.version != TRANSCRIPT_VERSION {
        return Err(VerificationError::VersionMismatch {
            expected: TRANSCRIPT_VERSION,
            got: transcript.version,
        });
    }

    let mut round = Round::open(transcript.round_id);
    for (index, wager) in transcript.wagers.iter().enumerate() {
        if round.has_bettor(wager.card_id) {
            return Err(VerificationError::DuplicateWager(wager.card_id));
        }
        if wager.amount == 0 {
            return Err(VerificationError::InvalidWager(index));
        }
        let side_total = round
            .side_total(wager.side)
            .checked_add(wager.amount)
            .ok_or(VerificationError::InvalidWager(index))?;
        round.record(*wager, side_total);
    }

    let outcome = transcript.outcome;
    if Outcome::from_dice(outcome.dice) != outcome {
        return Err(VerificationError::ParityMismatch);
    }

    if let Some(reveal) = &transcript.reveal {
        let commitment = transcript.commitment.ok_or(VerificationError::MissingCommitment)?;
        commitment.verify(reveal)?;

        let derived = reveal.roll(&round.wager_digest());
        if derived != outcome.dice {
            return Err(VerificationError::DiceMismatch { recorded: outcome.dice, derived });
        }
    }

    verify_payouts(transcript)?;

    round.settle(outcome, transcript.reveal);
    Ok(round.compute_hash())
}

/// Winners are paid in submission order, each stake times the multiplier.
fn verify_payouts(transcript: &RoundTranscript) -> Result<(), VerificationError> {
    let mut payouts = transcript.payouts.iter();
    let mut position = 0;

    for (index, wager) in transcript.wagers.iter().enumerate() {
        if !transcript.outcome.pays(wager.side) {
            continue;
        }
        let payout = payouts.next().ok_or(VerificationError::PayoutMismatch(position))?;
        let owed = wager.amount.checked_mul(PAYOUT_MULTIPLIER);
        if payout.index != index || payout.card_id != wager.card_id || Some(payout.amount) != owed {
            return Err(VerificationError::PayoutMismatch(position));
        }
        position += 1;
    }

    if payouts.next().is_some() {
        return Err(VerificationError::PayoutMismatch(position));
    }
    Ok(())
}
