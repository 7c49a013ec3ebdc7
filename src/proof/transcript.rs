//! Round Transcript Recording
//!
//! Records everything needed to audit a settled round: the wagers in
//! submission order, the outcome, the payouts made and, under
//! commit-reveal, the published commitment and the opened secret.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::hash::StateHash;
use crate::game::engine::{Payout, Settlement};
use crate::game::state::{Outcome, Round, RoundId, Wager};
use crate::proof::commitment::{RoundCommitment, SeedReveal};

/// Current transcript version.
pub const TRANSCRIPT_VERSION: u8 = 1;

/// Immutable record of a settled round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTranscript {
    /// Version for forward compatibility.
    pub version: u8,

    /// Settled round.
    pub round_id: RoundId,

    /// Wagers in submission order.
    pub wagers: Vec<Wager>,

    /// Rolled outcome.
    pub outcome: Outcome,

    /// Payouts made at settlement.
    pub payouts: Vec<Payout>,

    /// Commitment published when the round opened, if any.
    pub commitment: Option<RoundCommitment>,

    /// Opened secret, if any.
    pub reveal: Option<SeedReveal>,

    /// Hash of the settled round.
    pub round_hash: StateHash,
}

/// Errors that can occur with transcripts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    /// Round has no outcome yet.
    #[error("round {0} is not settled")]
    Incomplete(RoundId),

    /// Settlement report is for a different round.
    #[error("settlement for round {settlement} does not match round {round}")]
    RoundMismatch {
        /// Round recorded.
        round: RoundId,
        /// Round in the settlement report.
        settlement: RoundId,
    },

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Version mismatch.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Supported version.
        expected: u8,
        /// Version found.
        got: u8,
    },
}

impl RoundTranscript {
    /// Record a round that `settlement` has just settled.
    pub fn record(round: &Round, settlement: &Settlement) -> Result<Self, TranscriptError> {
        if round.id != settlement.round_id {
            return Err(TranscriptError::RoundMismatch {
                round: round.id,
                settlement: settlement.round_id,
            });
        }
        let outcome = round.outcome().ok_or(TranscriptError::Incomplete(round.id))?;

        Ok(Self {
            version: TRANSCRIPT_VERSION,
            round_id: round.id,
            wagers: round.wagers().to_vec(),
            outcome,
            payouts: settlement.payouts.clone(),
            commitment: round.commitment,
            reveal: round.reveal,
            round_hash: round.compute_hash(),
        })
    }

    /// Total paid out.
    pub fn total_paid(&self) -> u128 {
        self.payouts.iter().map(|p| p.amount).sum()
    }

    /// Serialize to bytes using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TranscriptError> {
        bincode::serialize(self).map_err(|e| TranscriptError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TranscriptError> {
        let transcript: Self = bincode::deserialize(data)
            .map_err(|e| TranscriptError::DeserializationFailed(e.to_string()))?;

        if transcript.version != TRANSCRIPT_VERSION {
            return Err(TranscriptError::VersionMismatch {
                expected: TRANSCRIPT_VERSION,
                got: transcript.version,
            });
        }
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::account::AccountId;
    use crate::game::state::{Dice, Parity};
    use crate::ledger::member_card::CardId;

    fn settled_round() -> (Round, Settlement) {
        let mut round = Round::open(3);
        round.record(Wager { card_id: CardId(1), side: Parity::Odd, amount: 5 }, 5);
        round.record(Wager { card_id: CardId(2), side: Parity::Even, amount: 7 }, 7);

        let outcome = Outcome::from_dice(Dice::new(2, 5).unwrap());
        round.settle(outcome, None);

        let settlement = Settlement {
            round_id: 3,
            outcome,
            payouts: vec![Payout {
                index: 0,
                card_id: CardId(1),
                recipient: AccountId::new([1; 16]),
                amount: 10,
            }],
            total_staked: 12,
            total_paid: 10,
            next_round_id: 4,
        };
        (round, settlement)
    }

    #[test]
    fn test_record_settled_round() {
        let (round, settlement) = settled_round();
        let transcript = RoundTranscript::record(&round, &settlement).unwrap();

        assert_eq!(transcript.version, TRANSCRIPT_VERSION);
        assert_eq!(transcript.wagers.len(), 2);
        assert_eq!(transcript.total_paid(), 10);
        assert_eq!(transcript.round_hash, round.compute_hash());
    }

    #[test]
    fn test_open_round_is_incomplete() {
        let (_, settlement) = settled_round();
        let open = Round::open(3);

        assert_eq!(
            RoundTranscript::record(&open, &settlement),
            Err(TranscriptError::Incomplete(3))
        );
    }

    #[test]
    fn test_round_mismatch() {
        let (round, mut settlement) = settled_round();
        settlement.round_id = 9;

        assert!(matches!(
            RoundTranscript::record(&round, &settlement),
            Err(TranscriptError::RoundMismatch { round: 3, settlement: 9 })
        ));
    }

    #[test]
    fn test_transcript_serialization_roundtrip() {
        let (round, settlement) = settled_round();
        let transcript = RoundTranscript::record(&round, &settlement).unwrap();

        let bytes = transcript.to_bytes().unwrap();
        let decoded = RoundTranscript::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, transcript);
    }

    #[test]
    fn test_version_checked_on_decode() {
        let (round, settlement) = settled_round();
        let mut transcript = RoundTranscript::record(&round, &settlement).unwrap();
        transcript.version = 99;

        let bytes = transcript.to_bytes().unwrap();
        assert_eq!(
            RoundTranscript::from_bytes(&bytes),
            Err(TranscriptError::VersionMismatch { expected: TRANSCRIPT_VERSION, got: 99 })
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            RoundTranscript::from_bytes(&[1, 2, 3]),
            Err(TranscriptError::DeserializationFailed(_))
        ));
    }
}
