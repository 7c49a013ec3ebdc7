//! Round State Definitions
//!
//! Rounds, wagers and outcomes. A round accepts wagers only while it is the
//! current open round; once settled it is immutable history.

use std::collections::BTreeSet;

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::account::Amount;
use crate::core::hash::{StateHash, StateHasher};
use crate::core::rng::DeterministicRng;
use crate::ledger::member_card::CardId;
use crate::proof::commitment::{RoundCommitment, SeedReveal};

/// Zero-based, strictly increasing round identifier.
pub type RoundId = u64;

// =============================================================================
// PARITY / DICE / OUTCOME
// =============================================================================

/// Which parity of the dice sum a wager backs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// Sum is even.
    Even,
    /// Sum is odd.
    Odd,
}

impl Parity {
    /// Map the wire-level `is_odd` flag.
    pub const fn from_odd(is_odd: bool) -> Self {
        if is_odd { Parity::Odd } else { Parity::Even }
    }

    /// True for [`Parity::Odd`].
    pub const fn is_odd(self) -> bool {
        matches!(self, Parity::Odd)
    }

    /// Parity of a sum.
    pub const fn of_sum(sum: u8) -> Self {
        Self::from_odd(sum % 2 == 1)
    }
}

/// Two die faces, each in 1..=6. Decoding goes through [`Dice::new`], so
/// out-of-range faces never deserialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u8, u8)", into = "(u8, u8)")]
pub struct Dice {
    die1: u8,
    die2: u8,
}

/// A face outside 1..=6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid dice ({0}, {1})")]
pub struct InvalidDice(pub u8, pub u8);

impl TryFrom<(u8, u8)> for Dice {
    type Error = InvalidDice;

    fn try_from((die1, die2): (u8, u8)) -> Result<Self, Self::Error> {
        Dice::new(die1, die2).ok_or(InvalidDice(die1, die2))
    }
}

impl From<Dice> for (u8, u8) {
    fn from(dice: Dice) -> Self {
        (dice.die1, dice.die2)
    }
}

impl Dice {
    /// Validate two faces.
    pub fn new(die1: u8, die2: u8) -> Option<Self> {
        let face = 1..=6;
        if face.contains(&die1) && face.contains(&die2) {
            Some(Self { die1, die2 })
        } else {
            None
        }
    }

    /// Roll both dice from `rng`.
    pub fn roll(rng: &mut DeterministicRng) -> Self {
        let die1 = rng.roll_die();
        let die2 = rng.roll_die();
        Self { die1, die2 }
    }

    /// First die.
    pub fn die1(&self) -> u8 {
        self.die1
    }

    /// Second die.
    pub fn die2(&self) -> u8 {
        self.die2
    }

    /// Sum of both faces (2..=12).
    pub fn sum(&self) -> u8 {
        self.die1.saturating_add(self.die2)
    }
}

/// Settled result of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// The rolled dice.
    pub dice: Dice,
    /// Parity of the sum.
    pub parity: Parity,
}

impl Outcome {
    /// Derive the outcome of a roll.
    pub fn from_dice(dice: Dice) -> Self {
        Self { dice, parity: Parity::of_sum(dice.sum()) }
    }

    /// Whether a wager on `side` wins this outcome.
    #[inline]
    pub fn pays(&self, side: Parity) -> bool {
        self.parity == side
    }
}

// =============================================================================
// WAGER
// =============================================================================

/// One participant's bet in one round. Never mutated after creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    /// Membership identity of the bettor.
    pub card_id: CardId,
    /// Side backed.
    pub side: Parity,
    /// Stake, strictly positive.
    pub amount: Amount,
}

impl Wager {
    /// True when the wager backs odd.
    pub fn bets_odd(&self) -> bool {
        self.side.is_odd()
    }

    /// Hash this wager for verification.
    pub fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_u64(self.card_id.0);
        hasher.update_bool(self.side.is_odd());
        hasher.update_u128(self.amount);
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// Lifecycle of a single round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Accepting wagers.
    Open,
    /// Settled with a recorded outcome.
    Settled {
        /// The outcome.
        outcome: Outcome,
    },
}

/// A betting round and its append-only wager list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    /// Round identifier.
    pub id: RoundId,
    /// Wagers in submission order.
    wagers: Vec<Wager>,
    /// Cards that already bet this round.
    bettors: BTreeSet<CardId>,
    /// Stake totals: [even, odd].
    side_totals: [Amount; 2],
    /// Current status.
    pub status: RoundStatus,
    /// Outcome commitment published when the round opened.
    pub commitment: Option<RoundCommitment>,
    /// Opened secret, once settled under commit-reveal.
    pub reveal: Option<SeedReveal>,
}

impl Round {
    /// Open an empty round.
    pub fn open(id: RoundId) -> Self {
        Self {
            id,
            wagers: Vec::new(),
            bettors: BTreeSet::new(),
            side_totals: [0, 0],
            status: RoundStatus::Open,
            commitment: None,
            reveal: None,
        }
    }

    /// Wagers in submission order.
    pub fn wagers(&self) -> &[Wager] {
        &self.wagers
    }

    /// Wager at `index`, if recorded.
    pub fn wager_at(&self, index: usize) -> Option<&Wager> {
        self.wagers.get(index)
    }

    /// Whether `card_id` already has a wager in this round.
    pub fn has_bettor(&self, card_id: CardId) -> bool {
        self.bettors.contains(&card_id)
    }

    /// Total staked on one side.
    pub fn side_total(&self, side: Parity) -> Amount {
        self.side_totals[side as usize]
    }

    /// Total staked on both sides.
    pub fn total_staked(&self) -> Amount {
        self.side_totals[0].saturating_add(self.side_totals[1])
    }

    /// Outcome, once settled.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.status {
            RoundStatus::Open => None,
            RoundStatus::Settled { outcome } => Some(outcome),
        }
    }

    /// True while wagers are accepted.
    pub fn is_open(&self) -> bool {
        matches!(self.status, RoundStatus::Open)
    }

    /// Append a wager. The caller has already validated it and updated
    /// `side_total` headroom with checked arithmetic.
    pub(crate) fn record(&mut self, wager: Wager, new_side_total: Amount) {
        self.side_totals[wager.side as usize] = new_side_total;
        self.bettors.insert(wager.card_id);
        self.wagers.push(wager);
    }

    /// Freeze the round with its outcome.
    pub(crate) fn settle(&mut self, outcome: Outcome, reveal: Option<SeedReveal>) {
        self.status = RoundStatus::Settled { outcome };
        self.reveal = reveal;
    }

    /// Digest of the wager list, in submission order.
    pub fn wager_digest(&self) -> StateHash {
        let mut hasher = StateHasher::for_wagers();
        hasher.update_u64(self.id);
        hasher.update_u64(self.wagers.len() as u64);
        for wager in &self.wagers {
            wager.hash_into(&mut hasher);
        }
        hasher.finalize()
    }

    /// Hash of the full round, including the outcome once settled.
    pub fn compute_hash(&self) -> StateHash {
        let mut hasher = StateHasher::for_round();
        hasher.update_bytes(&self.wager_digest());
        match self.status {
            RoundStatus::Open => hasher.update_u8(0),
            RoundStatus::Settled { outcome } => {
                hasher.update_u8(1);
                hasher.update_u8(outcome.dice.die1());
                hasher.update_u8(outcome.dice.die2());
            }
        }
        hasher.finalize()
    }
}

/// Engine lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    /// Round is accepting wagers.
    Open(RoundId),
    /// Round is being rolled and paid out.
    Resolving(RoundId),
    /// Engine torn down. No further rounds.
    Closed,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dice_validation() {
        assert!(Dice::new(1, 6).is_some());
        assert!(Dice::new(0, 3).is_none());
        assert!(Dice::new(3, 7).is_none());
    }

    #[test]
    fn test_outcome_parity() {
        let even = Outcome::from_dice(Dice::new(3, 5).unwrap());
        assert_eq!(even.parity, Parity::Even);
        assert!(even.pays(Parity::Even));
        assert!(!even.pays(Parity::Odd));

        let odd = Outcome::from_dice(Dice::new(3, 4).unwrap());
        assert_eq!(odd.parity, Parity::Odd);
    }

    #[test]
    fn test_every_dice_pair_has_consistent_parity() {
        for a in 1..=6u8 {
            for b in 1..=6u8 {
                let outcome = Outcome::from_dice(Dice::new(a, b).unwrap());
                assert_eq!(outcome.parity.is_odd(), (a + b) % 2 == 1);
            }
        }
    }

    #[test]
    fn test_round_records_wagers_in_order() {
        let mut round = Round::open(0);
        let w1 = Wager { card_id: CardId(1), side: Parity::Odd, amount: 5 };
        let w2 = Wager { card_id: CardId(2), side: Parity::Even, amount: 3 };

        round.record(w1, 5);
        round.record(w2, 3);

        assert_eq!(round.wager_at(0), Some(&w1));
        assert_eq!(round.wager_at(1), Some(&w2));
        assert_eq!(round.wager_at(2), None);
        assert!(round.has_bettor(CardId(1)));
        assert!(!round.has_bettor(CardId(3)));
        assert_eq!(round.side_total(Parity::Odd), 5);
        assert_eq!(round.side_total(Parity::Even), 3);
        assert_eq!(round.total_staked(), 8);
    }

    #[test]
    fn test_wager_digest_depends_on_order() {
        let w1 = Wager { card_id: CardId(1), side: Parity::Odd, amount: 5 };
        let w2 = Wager { card_id: CardId(2), side: Parity::Odd, amount: 5 };

        let mut a = Round::open(0);
        a.record(w1, 5);
        a.record(w2, 10);

        let mut b = Round::open(0);
        b.record(w2, 5);
        b.record(w1, 10);

        assert_ne!(a.wager_digest(), b.wager_digest());
    }

    #[test]
    fn test_settle_changes_hash() {
        let mut round = Round::open(4);
        let open_hash = round.compute_hash();

        round.settle(Outcome::from_dice(Dice::new(2, 2).unwrap()), None);

        assert!(!round.is_open());
        assert_ne!(round.compute_hash(), open_hash);
        assert_eq!(round.outcome().unwrap().dice.sum(), 4);
    }
}
