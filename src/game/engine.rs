//! Match Engine
//!
//! The round state machine. Wagers move stake from the bettor into the pool
//! through a [`CreditLedger`]; settlement rolls the dice through an
//! [`OutcomeSource`] and pays every winner double from the pool.
//!
//! Lifecycle: `Open(n)` -> `Resolving(n)` -> round `n` settled -> `Open(n+1)`.
//! Every operation validates all of its preconditions before it touches the
//! ledger, so a failed call leaves balances, allowances and history as they
//! were.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::account::{AccountId, Amount};
use crate::game::outcome::{OutcomeError, OutcomeSource};
use crate::game::state::{EnginePhase, Outcome, Parity, Round, RoundId, Wager};
use crate::ledger::cash::{CreditLedger, LedgerError};
use crate::ledger::member_card::{CardId, MembershipError, MembershipRegistry};

/// A winning wager is paid this multiple of its stake.
pub const PAYOUT_MULTIPLIER: Amount = 2;

// =============================================================================
// ERRORS
// =============================================================================

/// Engine errors. Every failure aborts the call with no state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Caller lacks a valid membership.
    #[error("not eligible: {0}")]
    NotEligible(MembershipError),

    /// Card already has a wager in the current round.
    #[error("{card_id} already has a wager in round {round_id}")]
    DuplicateWager {
        /// The bettor.
        card_id: CardId,
        /// Current round.
        round_id: RoundId,
    },

    /// Stake must be positive.
    #[error("wager amount must be greater than zero")]
    InvalidAmount,

    /// Accepting the wager could leave its side uncovered.
    #[error("insufficient pool coverage ({pool} < {required})")]
    InsufficientPoolCoverage {
        /// Pool balance including the incoming stake.
        pool: Amount,
        /// Double the side total including the incoming stake.
        required: Amount,
    },

    /// Credit ledger failure, surfaced verbatim.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// No round is accepting wagers.
    #[error("round is not open")]
    RoundNotOpen,

    /// Operator-only action by someone else.
    #[error("caller is not the operator")]
    Unauthorized,

    /// Wager index past the end of a round.
    #[error("no wager at index {index} in round {round_id}")]
    IndexOutOfRange {
        /// Queried round.
        round_id: RoundId,
        /// Queried index.
        index: usize,
    },

    /// Round has no outcome yet.
    #[error("round {0} is not settled")]
    NotSettled(RoundId),

    /// Round id beyond the current round.
    #[error("round {0} does not exist")]
    UnknownRound(RoundId),

    /// A wager references a card the registry no longer knows.
    #[error("no owner recorded for {0}")]
    UnknownCard(CardId),

    /// Engine has been torn down.
    #[error("engine is closed")]
    EngineClosed,

    /// Arithmetic overflow.
    #[error("amount overflow")]
    Overflow,

    /// Outcome source failed.
    #[error("outcome source failed: {0}")]
    Outcome(#[from] OutcomeError),

    /// Settlement would overdraw the pool.
    #[error("pool shortfall at settlement ({pool} < {owed})")]
    PoolShortfall {
        /// Pool balance.
        pool: Amount,
        /// Total owed to winners.
        owed: Amount,
    },
}

// =============================================================================
// SETTLEMENT REPORT
// =============================================================================

/// A single payout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Position of the winning wager in the round.
    pub index: usize,
    /// Winning card.
    pub card_id: CardId,
    /// Account credited.
    pub recipient: AccountId,
    /// Amount credited (stake times [`PAYOUT_MULTIPLIER`]).
    pub amount: Amount,
}

/// Result of advancing a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Round that was settled.
    pub round_id: RoundId,
    /// Rolled outcome.
    pub outcome: Outcome,
    /// Payouts in submission order.
    pub payouts: Vec<Payout>,
    /// Sum of all stakes in the round.
    pub total_staked: Amount,
    /// Sum of all payouts.
    pub total_paid: Amount,
    /// Round now open.
    pub next_round_id: RoundId,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Round state machine.
pub struct MatchEngine {
    operator: AccountId,
    pool_account: AccountId,
    phase: EnginePhase,
    current_round: RoundId,
    rounds: Vec<Round>,
    source: Box<dyn OutcomeSource>,
}

impl std::fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchEngine")
            .field("operator", &self.operator)
            .field("pool_account", &self.pool_account)
            .field("phase", &self.phase)
            .field("rounds", &self.rounds.len())
            .finish()
    }
}

impl MatchEngine {
    /// Create an engine with round 0 open.
    ///
    /// `pool_account` is the ledger account the engine holds stakes in. It
    /// is also the spender participants approve for wagers.
    pub fn new(
        operator: AccountId,
        pool_account: AccountId,
        source: impl OutcomeSource + 'static,
    ) -> Self {
        let mut engine = Self {
            operator,
            pool_account,
            phase: EnginePhase::Open(0),
            current_round: 0,
            rounds: Vec::new(),
            source: Box::new(source),
        };
        engine.open_round(0);
        engine
    }

    fn open_round(&mut self, round_id: RoundId) {
        let mut round = Round::open(round_id);
        round.commitment = self.source.commit(round_id);
        self.rounds.push(round);
        self.current_round = round_id;
        self.phase = EnginePhase::Open(round_id);
    }

    /// Id of the round accepting wagers, or the matching error.
    fn open_round_id(&self) -> Result<RoundId, EngineError> {
        match self.phase {
            EnginePhase::Open(round_id) => Ok(round_id),
            EnginePhase::Resolving(_) => Err(EngineError::RoundNotOpen),
            EnginePhase::Closed => Err(EngineError::EngineClosed),
        }
    }

    fn ensure_operator(&self, caller: &AccountId) -> Result<(), EngineError> {
        if *caller != self.operator {
            return Err(EngineError::Unauthorized);
        }
        Ok(())
    }

    /// Check that `caller` may run an administrative action now.
    pub fn authorize_operator(&self, caller: &AccountId) -> Result<(), EngineError> {
        self.ensure_operator(caller)?;
        if self.phase == EnginePhase::Closed {
            return Err(EngineError::EngineClosed);
        }
        Ok(())
    }

    // =========================================================================
    // WAGERS
    // =========================================================================

    /// Accept a wager from `participant` on `side`.
    ///
    /// Checks, in order: round open, membership, duplicate, positive amount,
    /// pool coverage. Only then is the stake pulled into the pool.
    pub fn submit_wager<L, M>(
        &mut self,
        ledger: &mut L,
        members: &M,
        participant: &AccountId,
        side: Parity,
        amount: Amount,
    ) -> Result<Wager, EngineError>
    where
        L: CreditLedger + ?Sized,
        M: MembershipRegistry + ?Sized,
    {
        let round_id = self.open_round_id()?;
        let card_id = members.check_valid(participant).map_err(EngineError::NotEligible)?;

        let pool_account = self.pool_account;
        let round = self.round_mut(round_id)?;

        if round.has_bettor(card_id) {
            return Err(EngineError::DuplicateWager { card_id, round_id });
        }
        if amount == 0 {
            return Err(EngineError::InvalidAmount);
        }

        // Coverage against the pool after the incoming stake lands
        let side_total = round.side_total(side).checked_add(amount).ok_or(EngineError::Overflow)?;
        let required = side_total.checked_mul(PAYOUT_MULTIPLIER).ok_or(EngineError::Overflow)?;
        let pool = ledger
            .balance_of(&pool_account)
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;
        if pool < required {
            debug!("Wager from {} rejected: pool {} < required {}", card_id, pool, required);
            return Err(EngineError::InsufficientPoolCoverage { pool, required });
        }

        ledger.pull(&pool_account, participant, &pool_account, amount)?;

        let wager = Wager { card_id, side, amount };
        round.record(wager, side_total);

        info!("Round {}: {} bet {} on {:?}", round_id, card_id, amount, side);
        Ok(wager)
    }

    // =========================================================================
    // SETTLEMENT
    // =========================================================================

    /// Roll, pay winners and open the next round. Operator only.
    ///
    /// All-or-nothing: on any failure the round stays open with its wagers
    /// and no payout has been made.
    pub fn advance_round<L, M>(
        &mut self,
        ledger: &mut L,
        members: &M,
        caller: &AccountId,
    ) -> Result<Settlement, EngineError>
    where
        L: CreditLedger + ?Sized,
        M: MembershipRegistry + ?Sized,
    {
        self.ensure_operator(caller)?;
        let round_id = self.open_round_id()?;

        self.phase = EnginePhase::Resolving(round_id);
        match self.settle_round(ledger, members, round_id) {
            Ok(settlement) => {
                info!(
                    "Round {} settled: {}+{} {:?}, {} winners, paid {}",
                    round_id,
                    settlement.outcome.dice.die1(),
                    settlement.outcome.dice.die2(),
                    settlement.outcome.parity,
                    settlement.payouts.len(),
                    settlement.total_paid
                );
                Ok(settlement)
            }
            Err(e) => {
                self.phase = EnginePhase::Open(round_id);
                warn!("Round {} settlement aborted: {}", round_id, e);
                Err(e)
            }
        }
    }

    fn settle_round<L, M>(
        &mut self,
        ledger: &mut L,
        members: &M,
        round_id: RoundId,
    ) -> Result<Settlement, EngineError>
    where
        L: CreditLedger + ?Sized,
        M: MembershipRegistry + ?Sized,
    {
        let digest = self.round_ref(round_id)?.wager_digest();
        let outcome = Outcome::from_dice(self.source.roll(round_id, &digest)?);

        let round = self.round_ref(round_id)?;
        let total_staked = round.total_staked();

        let mut payouts = Vec::new();
        let mut total_paid: Amount = 0;
        let mut owed: BTreeMap<AccountId, Amount> = BTreeMap::new();
        for (index, wager) in round.wagers().iter().enumerate() {
            if !outcome.pays(wager.side) {
                continue;
            }
            let recipient = members
                .owner_of(wager.card_id)
                .ok_or(EngineError::UnknownCard(wager.card_id))?;
            let amount = wager.amount.checked_mul(PAYOUT_MULTIPLIER).ok_or(EngineError::Overflow)?;

            total_paid = total_paid.checked_add(amount).ok_or(EngineError::Overflow)?;
            let due = owed.entry(recipient).or_insert(0);
            *due = due.checked_add(amount).ok_or(EngineError::Overflow)?;

            payouts.push(Payout { index, card_id: wager.card_id, recipient, amount });
        }

        // Everything that could make a push fail is checked up front
        let pool = ledger.balance_of(&self.pool_account);
        if pool < total_paid {
            return Err(EngineError::PoolShortfall { pool, owed: total_paid });
        }
        for (recipient, due) in &owed {
            if *recipient != self.pool_account
                && ledger.balance_of(recipient).checked_add(*due).is_none()
            {
                return Err(EngineError::Overflow);
            }
        }

        for payout in &payouts {
            ledger.push(&self.pool_account, &payout.recipient, payout.amount)?;
            #[cfg(feature = "debug-tracing")]
            tracing::trace!("Round {}: paid {} to {}", round_id, payout.amount, payout.card_id);
        }

        let reveal = self.source.take_reveal(round_id);
        self.round_mut(round_id)?.settle(outcome, reveal);

        let next_round_id = round_id + 1;
        self.open_round(next_round_id);

        Ok(Settlement {
            round_id,
            outcome,
            payouts,
            total_staked,
            total_paid,
            next_round_id,
        })
    }

    // =========================================================================
    // ADMIN
    // =========================================================================

    /// Sweep the pool to the operator and close the engine. Operator only.
    ///
    /// Returns the amount swept. Stakes in the open round are swept with
    /// the rest of the pool.
    pub fn destroy<L>(&mut self, ledger: &mut L, caller: &AccountId) -> Result<Amount, EngineError>
    where
        L: CreditLedger + ?Sized,
    {
        self.ensure_operator(caller)?;
        self.open_round_id()?;

        let swept = ledger.balance_of(&self.pool_account);
        if swept > 0 {
            ledger.push(&self.pool_account, &self.operator, swept)?;
        }
        self.phase = EnginePhase::Closed;

        info!("Engine closed at round {}, swept {} to operator", self.current_round, swept);
        Ok(swept)
    }

    // =========================================================================
    // READS
    // =========================================================================

    fn round_ref(&self, round_id: RoundId) -> Result<&Round, EngineError> {
        self.round(round_id).ok_or(EngineError::UnknownRound(round_id))
    }

    fn round_mut(&mut self, round_id: RoundId) -> Result<&mut Round, EngineError> {
        usize::try_from(round_id)
            .ok()
            .and_then(|i| self.rounds.get_mut(i))
            .ok_or(EngineError::UnknownRound(round_id))
    }

    /// Round by id, if it has been opened.
    pub fn round(&self, round_id: RoundId) -> Option<&Round> {
        usize::try_from(round_id).ok().and_then(|i| self.rounds.get(i))
    }

    /// All rounds, oldest first. The last one is current.
    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    /// Wager at `index` of `round_id`, in submission order.
    pub fn wager_at(&self, round_id: RoundId, index: usize) -> Result<Wager, EngineError> {
        self.round_ref(round_id)?
            .wager_at(index)
            .copied()
            .ok_or(EngineError::IndexOutOfRange { round_id, index })
    }

    /// Number of wagers in a round.
    pub fn wager_count(&self, round_id: RoundId) -> Result<usize, EngineError> {
        Ok(self.round_ref(round_id)?.wagers().len())
    }

    /// Outcome of a settled round.
    pub fn outcome_of(&self, round_id: RoundId) -> Result<Outcome, EngineError> {
        self.round(round_id)
            .and_then(Round::outcome)
            .ok_or(EngineError::NotSettled(round_id))
    }

    /// Id of the newest round. Increments by one per settlement.
    pub fn current_round_id(&self) -> RoundId {
        self.current_round
    }

    /// Stake totals of the current round as (even, odd).
    pub fn side_totals(&self) -> (Amount, Amount) {
        self.round(self.current_round)
            .map(|r| (r.side_total(Parity::Even), r.side_total(Parity::Odd)))
            .unwrap_or((0, 0))
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Ledger account holding the pool.
    pub fn pool_account(&self) -> &AccountId {
        &self.pool_account
    }

    /// Operator account.
    pub fn operator(&self) -> &AccountId {
        &self.operator
    }
}

// =============================================================================
// TESTS
// =============================================================================
