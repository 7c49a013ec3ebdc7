//! Table Deployment
//!
//! One deployment of the game: a Cash ledger, a MemberCard registry and a
//! MatchEngine wired together. Every call names its caller explicitly; the
//! table never assumes who is speaking.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::core::account::{AccountId, Amount};
use crate::core::clock::{Clock, SystemClock};
use crate::game::engine::{EngineError, MatchEngine, Settlement};
use crate::game::outcome::OutcomeSource;
use crate::game::state::{Outcome, Parity, RoundId, Wager};
use crate::ledger::cash::{Cash, CreditLedger, LedgerError};
use crate::ledger::member_card::{CardId, MemberCard, MembershipConfig, MembershipError};
use crate::proof::transcript::{RoundTranscript, TranscriptError};

/// Label of the ledger account that holds the pool.
pub const POOL_ACCOUNT_LABEL: &str = "even-odd-pool";

/// Deployment configuration.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Operator account.
    pub operator: AccountId,
    /// Base value sent with the deployment, minted into the pool.
    pub initial_pool: Amount,
    /// Membership card settings.
    pub membership: MembershipConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            operator: AccountId::derive("operator"),
            initial_pool: 0,
            membership: MembershipConfig::default(),
        }
    }
}

impl TableConfig {
    /// Create config from environment variables.
    ///
    /// `EVEN_ODD_OPERATOR` is the operator's auth subject, mapped the same
    /// way authenticated callers are.
    pub fn from_env() -> Self {
        let operator = std::env::var("EVEN_ODD_OPERATOR")
            .map(|subject| AccountId::derive(&subject))
            .unwrap_or_else(|_| AccountId::derive("operator"));

        let initial_pool = std::env::var("EVEN_ODD_INITIAL_POOL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Self {
            operator,
            initial_pool,
            membership: MembershipConfig::from_env(),
        }
    }
}

/// A deployed table.
pub struct Table {
    cash: Cash,
    cards: MemberCard,
    engine: MatchEngine,
    transcripts: BTreeMap<RoundId, RoundTranscript>,
}

impl Table {
    /// Deploy on the system clock.
    pub fn new(config: TableConfig, source: impl OutcomeSource + 'static) -> Result<Self, LedgerError> {
        Self::deploy(config, source, Arc::new(SystemClock))
    }

    /// Deploy and fund the pool with `config.initial_pool`.
    pub fn deploy(
        config: TableConfig,
        source: impl OutcomeSource + 'static,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        let pool_account = AccountId::system(POOL_ACCOUNT_LABEL);

        let mut cash = Cash::new();
        if config.initial_pool > 0 {
            cash.deposit(&pool_account, config.initial_pool)?;
            cash.buy_cash(&pool_account, config.initial_pool)?;
        }

        let cards = MemberCard::with_clock(config.membership, clock);
        let engine = MatchEngine::new(config.operator, pool_account, source);

        info!("Table deployed, operator {}, pool {}", config.operator, config.initial_pool);
        Ok(Self {
            cash,
            cards,
            engine,
            transcripts: BTreeMap::new(),
        })
    }

    // =========================================================================
    // CASH
    // =========================================================================

    /// Convert the caller's deposited base value into credit.
    pub fn buy_cash(&mut self, caller: &AccountId, value: Amount) -> Result<Amount, LedgerError> {
        self.cash.buy_cash(caller, value)
    }

    /// Redeem credit back into the caller's reserve.
    pub fn withdraw(&mut self, caller: &AccountId, amount: Amount) -> Result<Amount, LedgerError> {
        self.cash.withdraw(caller, amount)
    }

    /// Send credit to another account.
    pub fn transfer(&mut self, caller: &AccountId, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        self.cash.transfer(caller, to, amount)
    }

    /// Set the allowance `spender` may pull from the caller.
    pub fn approve(&mut self, caller: &AccountId, spender: &AccountId, amount: Amount) {
        self.cash.approve(caller, spender, amount)
    }

    /// Record base value received from `account`. Operator only.
    ///
    /// Returns the account's new reserve.
    pub fn credit_deposit(
        &mut self,
        caller: &AccountId,
        account: &AccountId,
        value: Amount,
    ) -> Result<Amount, EngineError> {
        self.engine.authorize_operator(caller)?;
        let reserve = self.cash.deposit(account, value)?;

        info!("Deposit of {} credited to {}", value, account);
        Ok(reserve)
    }

    /// Base value an account has on deposit.
    pub fn reserve_of(&self, account: &AccountId) -> Amount {
        self.cash.reserve_of(account)
    }

    /// Credit balance of an account.
    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.cash.balance_of(account)
    }

    /// Credit `spender` may still pull from `owner`.
    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.cash.allowance(owner, spender)
    }

    /// Credit in circulation.
    pub fn total_supply(&self) -> Amount {
        self.cash.total_supply()
    }

    // =========================================================================
    // MEMBER CARDS
    // =========================================================================

    /// Buy the caller's card.
    pub fn buy_card(&mut self, caller: &AccountId) -> Result<CardId, MembershipError> {
        self.cards.buy_card(caller)
    }

    /// Renew the caller's expired card.
    pub fn extend_card_period(&mut self, caller: &AccountId) -> Result<DateTime<Utc>, MembershipError> {
        self.cards.extend_card_period(caller)
    }

    /// Whether the account's card has lapsed.
    pub fn is_expired(&self, account: &AccountId) -> Result<bool, MembershipError> {
        self.cards.is_expired(account)
    }

    /// Card held by an account.
    pub fn card_id_of(&self, account: &AccountId) -> Option<CardId> {
        self.cards.card_id_of(account)
    }

    /// End of a card's validity window.
    pub fn expiration_of(&self, card_id: CardId) -> Option<DateTime<Utc>> {
        self.cards.expiration_of(card_id)
    }

    /// Highest card id issued so far, 0 before the first sale.
    pub fn latest_card_id(&self) -> u64 {
        self.cards.latest_card_id()
    }

    // =========================================================================
    // GAME
    // =========================================================================

    /// Place the caller's wager for the current round.
    pub fn bet(&mut self, caller: &AccountId, side: Parity, amount: Amount) -> Result<Wager, EngineError> {
        self.engine.submit_wager(&mut self.cash, &self.cards, caller, side, amount)
    }

    /// Settle the current round. Operator only.
    pub fn play(&mut self, caller: &AccountId) -> Result<Settlement, EngineError> {
        let settlement = self.engine.advance_round(&mut self.cash, &self.cards, caller)?;

        // advance_round has stored the outcome under settlement.round_id, so
        // the round exists and is settled. The payouts are already applied
        // and cannot be unwound, hence no error return here.
        match self
            .engine
            .round(settlement.round_id)
            .ok_or(TranscriptError::Incomplete(settlement.round_id))
            .and_then(|round| RoundTranscript::record(round, &settlement))
        {
            Ok(transcript) => {
                self.transcripts.insert(settlement.round_id, transcript);
            }
            Err(e) => error!("Settled round {} has no transcript: {}", settlement.round_id, e),
        }
        Ok(settlement)
    }

    /// Mint credit into the pool against the operator's reserve. Operator only.
    ///
    /// Returns the new pool balance.
    pub fn add_cash_supply(&mut self, caller: &AccountId, value: Amount) -> Result<Amount, EngineError> {
        self.engine.authorize_operator(caller)?;
        let pool_account = *self.engine.pool_account();
        let balance = self.cash.buy_cash_into(caller, &pool_account, value)?;

        info!("Pool funded with {}, balance {}", value, balance);
        Ok(balance)
    }

    /// Sweep the pool to the operator and close the table. Operator only.
    pub fn destroy(&mut self, caller: &AccountId) -> Result<Amount, EngineError> {
        self.engine.destroy(&mut self.cash, caller)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Round currently accepting wagers.
    pub fn current_round_id(&self) -> RoundId {
        self.engine.current_round_id()
    }

    /// Wager at `index` of `round_id`.
    pub fn wager_at(&self, round_id: RoundId, index: usize) -> Result<Wager, EngineError> {
        self.engine.wager_at(round_id, index)
    }

    /// Outcome of a settled round.
    pub fn outcome_of(&self, round_id: RoundId) -> Result<Outcome, EngineError> {
        self.engine.outcome_of(round_id)
    }

    /// Credit currently held by the pool.
    pub fn pool_balance(&self) -> Amount {
        self.cash.balance_of(self.engine.pool_account())
    }

    /// Account participants approve as spender before betting.
    pub fn engine_account(&self) -> AccountId {
        *self.engine.pool_account()
    }

    /// Audit record of a settled round.
    pub fn transcript(&self, round_id: RoundId) -> Option<&RoundTranscript> {
        self.transcripts.get(&round_id)
    }

    /// The match engine.
    pub fn engine(&self) -> &MatchEngine {
        &self.engine
    }

    /// The credit ledger.
    pub fn cash(&self) -> &Cash {
        &self.cash
    }

    /// The membership registry.
    pub fn cards(&self) -> &MemberCard {
        &self.cards
    }
}
