//! Cash: fungible credit pegged 1:1 to the base settlement currency.
//!
//! Base value enters through [`Cash::deposit`] and sits in the depositor's
//! reserve; credit is only ever minted against that reserve and burning
//! credit returns it. Balances, reserves and allowances live in `BTreeMap`s
//! keyed by [`AccountId`].
//!
//! Every mutating call validates fully before it writes, so a failed call
//! leaves no trace.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::core::account::{AccountId, Amount};

/// Ledger errors. Surfaced verbatim by the match engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Spender's allowance is lower than the requested amount.
    #[error("transfer amount exceeds allowance ({allowance} < {requested})")]
    AllowanceExceeded {
        /// Allowance currently granted.
        allowance: Amount,
        /// Amount requested.
        requested: Amount,
    },

    /// Source balance is lower than the requested amount.
    #[error("transfer amount exceeds balance ({balance} < {requested})")]
    InsufficientBalance {
        /// Balance currently held.
        balance: Amount,
        /// Amount requested.
        requested: Amount,
    },

    /// Not enough deposited base value to back the purchase.
    #[error("purchase exceeds deposited value ({reserve} < {requested})")]
    InsufficientReserve {
        /// Base value on deposit.
        reserve: Amount,
        /// Amount requested.
        requested: Amount,
    },

    /// Arithmetic overflow.
    #[error("amount overflow")]
    Overflow,
}

/// The capability the match engine needs from a credit ledger.
pub trait CreditLedger {
    /// Current balance of an account.
    fn balance_of(&self, account: &AccountId) -> Amount;

    /// Pull `amount` from `from` into `to`, spending `spender`'s allowance.
    fn pull(
        &mut self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError>;

    /// Push `amount` from `from` (an account the caller controls) to `to`.
    fn push(&mut self, from: &AccountId, to: &AccountId, amount: Amount) -> Result<(), LedgerError>;
}

/// In-memory credit ledger.
#[derive(Clone, Debug, Default)]
pub struct Cash {
    balances: BTreeMap<AccountId, Amount>,
    /// Deposited base value not yet converted to credit
    reserves: BTreeMap<AccountId, Amount>,
    /// (owner, spender) -> remaining allowance
    allowances: BTreeMap<(AccountId, AccountId), Amount>,
    total_supply: Amount,
}

impl Cash {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record base value received from `account`. Returns the new reserve.
    pub fn deposit(&mut self, account: &AccountId, value: Amount) -> Result<Amount, LedgerError> {
        let reserve = self.reserve_of(account).checked_add(value).ok_or(LedgerError::Overflow)?;
        set_entry(&mut self.reserves, account, reserve);

        debug!(%account, value, "base value deposited");
        Ok(reserve)
    }

    /// Base value `account` has on deposit.
    pub fn reserve_of(&self, account: &AccountId) -> Amount {
        self.reserves.get(account).copied().unwrap_or(0)
    }

    /// Mint credit 1:1 against base value `account` has deposited.
    pub fn buy_cash(&mut self, account: &AccountId, value: Amount) -> Result<Amount, LedgerError> {
        self.buy_cash_into(account, account, value)
    }

    /// Spend `payer`'s reserve to mint credit for `recipient`.
    ///
    /// Returns the recipient's new balance.
    pub fn buy_cash_into(
        &mut self,
        payer: &AccountId,
        recipient: &AccountId,
        value: Amount,
    ) -> Result<Amount, LedgerError> {
        let reserve = self.reserve_of(payer);
        if reserve < value {
            return Err(LedgerError::InsufficientReserve { reserve, requested: value });
        }
        let supply = self.total_supply.checked_add(value).ok_or(LedgerError::Overflow)?;
        let balance = self.balance_of(recipient).checked_add(value).ok_or(LedgerError::Overflow)?;

        set_entry(&mut self.reserves, payer, reserve - value);
        self.total_supply = supply;
        set_entry(&mut self.balances, recipient, balance);

        debug!(%payer, %recipient, value, "cash minted");
        Ok(balance)
    }

    /// Burn credit and return the same base value to `account`'s reserve.
    ///
    /// Returns the base value redeemed.
    pub fn withdraw(&mut self, account: &AccountId, amount: Amount) -> Result<Amount, LedgerError> {
        let balance = self.balance_of(account);
        if balance < amount {
            return Err(LedgerError::InsufficientBalance { balance, requested: amount });
        }
        let reserve = self.reserve_of(account).checked_add(amount).ok_or(LedgerError::Overflow)?;

        set_entry(&mut self.balances, account, balance - amount);
        set_entry(&mut self.reserves, account, reserve);
        self.total_supply -= amount;

        debug!(%account, amount, "cash redeemed");
        Ok(amount)
    }

    /// Move credit between accounts.
    pub fn transfer(&mut self, from: &AccountId, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let from_balance = self.balance_of(from);
        if from_balance < amount {
            return Err(LedgerError::InsufficientBalance { balance: from_balance, requested: amount });
        }
        if from == to {
            return Ok(());
        }

        let to_balance = self.balance_of(to).checked_add(amount).ok_or(LedgerError::Overflow)?;
        set_entry(&mut self.balances, from, from_balance - amount);
        set_entry(&mut self.balances, to, to_balance);
        Ok(())
    }

    /// Set (not add to) the amount `spender` may pull from `owner`.
    pub fn approve(&mut self, owner: &AccountId, spender: &AccountId, amount: Amount) {
        if amount == 0 {
            self.allowances.remove(&(*owner, *spender));
        } else {
            self.allowances.insert((*owner, *spender), amount);
        }
        debug!(%owner, %spender, amount, "allowance set");
    }

    /// Remaining allowance granted by `owner` to `spender`.
    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.allowances.get(&(*owner, *spender)).copied().unwrap_or(0)
    }

    /// Delegated transfer. Allowance is checked before balance.
    pub fn transfer_from(
        &mut self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let allowance = self.allowance(from, spender);
        if allowance < amount {
            return Err(LedgerError::AllowanceExceeded { allowance, requested: amount });
        }

        self.transfer(from, to, amount)?;
        self.approve(from, spender, allowance - amount);
        Ok(())
    }

    /// Total credit in circulation.
    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }
}

/// Zero entries are removed so maps only hold live accounts.
fn set_entry(map: &mut BTreeMap<AccountId, Amount>, account: &AccountId, amount: Amount) {
    if amount == 0 {
        map.remove(account);
    } else {
        map.insert(*account, amount);
    }
}

impl CreditLedger for Cash {
    fn balance_of(&self, account: &AccountId) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn pull(
        &mut self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.transfer_from(spender, from, to, amount)
    }

    fn push(&mut self, from: &AccountId, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        self.transfer(from, to, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETHER: Amount = 1_000_000_000_000_000_000;

    fn alice() -> AccountId {
        AccountId::new([1; 16])
    }

    fn bob() -> AccountId {
        AccountId::new([2; 16])
    }

    fn engine() -> AccountId {
        AccountId::new([9; 16])
    }

    fn fund(cash: &mut Cash, account: &AccountId, value: Amount) {
        cash.deposit(account, value).unwrap();
        cash.buy_cash(account, value).unwrap();
    }

    #[test]
    fn test_buy_cash_requires_deposit() {
        let mut cash = Cash::new();
        assert_eq!(
            cash.buy_cash(&alice(), ETHER),
            Err(LedgerError::InsufficientReserve { reserve: 0, requested: ETHER })
        );

        cash.deposit(&alice(), ETHER).unwrap();
        assert_eq!(
            cash.buy_cash(&alice(), 2 * ETHER),
            Err(LedgerError::InsufficientReserve { reserve: ETHER, requested: 2 * ETHER })
        );
        assert_eq!(cash.total_supply(), 0);
        assert_eq!(cash.reserve_of(&alice()), ETHER);

        cash.buy_cash(&alice(), ETHER).unwrap();
        assert_eq!(cash.reserve_of(&alice()), 0);
        assert_eq!(cash.balance_of(&alice()), ETHER);
    }

    #[test]
    fn test_buy_cash_into_spends_payer_reserve() {
        let mut cash = Cash::new();
        cash.deposit(&alice(), 5).unwrap();

        assert_eq!(cash.buy_cash_into(&alice(), &engine(), 3).unwrap(), 3);
        assert_eq!(cash.reserve_of(&alice()), 2);
        assert_eq!(cash.balance_of(&alice()), 0);
        assert_eq!(cash.balance_of(&engine()), 3);
        assert!(cash.buy_cash_into(&bob(), &engine(), 1).is_err());
    }

    #[test]
    fn test_buy_cash_mints_one_to_one() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), 10 * ETHER);
        fund(&mut cash, &bob(), 10 * ETHER);

        assert_eq!(cash.balance_of(&alice()), 10 * ETHER);
        assert_eq!(cash.balance_of(&bob()), 10 * ETHER);
        assert_eq!(cash.total_supply(), 20 * ETHER);
    }

    #[test]
    fn test_withdraw_more_than_balance_fails() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), 10 * ETHER);

        let result = cash.withdraw(&alice(), 12 * ETHER);
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));
        assert_eq!(cash.balance_of(&alice()), 10 * ETHER);
    }

    #[test]
    fn test_withdraw_burns() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), 10 * ETHER);

        assert_eq!(cash.withdraw(&alice(), 8 * ETHER).unwrap(), 8 * ETHER);
        assert_eq!(cash.balance_of(&alice()), 2 * ETHER);
        assert_eq!(cash.total_supply(), 2 * ETHER);
        // Redeemed value goes back on deposit, not out of thin air
        assert_eq!(cash.reserve_of(&alice()), 8 * ETHER);
    }

    #[test]
    fn test_transfer_from_checks_allowance_first() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), 10 * ETHER);
        cash.approve(&alice(), &engine(), 2 * ETHER);

        let result = cash.transfer_from(&engine(), &alice(), &engine(), 3 * ETHER);
        assert_eq!(
            result,
            Err(LedgerError::AllowanceExceeded { allowance: 2 * ETHER, requested: 3 * ETHER })
        );
        assert_eq!(cash.balance_of(&alice()), 10 * ETHER);
        assert_eq!(cash.allowance(&alice(), &engine()), 2 * ETHER);
    }

    #[test]
    fn test_transfer_from_balance_shortfall_keeps_allowance() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), ETHER);
        cash.approve(&alice(), &engine(), 5 * ETHER);

        let result = cash.transfer_from(&engine(), &alice(), &engine(), 2 * ETHER);
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));
        assert_eq!(cash.allowance(&alice(), &engine()), 5 * ETHER);
    }

    #[test]
    fn test_transfer_from_spends_allowance() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), 10 * ETHER);
        cash.approve(&alice(), &engine(), 5 * ETHER);

        cash.transfer_from(&engine(), &alice(), &engine(), 5 * ETHER).unwrap();

        assert_eq!(cash.balance_of(&alice()), 5 * ETHER);
        assert_eq!(cash.balance_of(&engine()), 5 * ETHER);
        assert_eq!(cash.allowance(&alice(), &engine()), 0);
    }

    #[test]
    fn test_approve_overwrites() {
        let mut cash = Cash::new();
        cash.approve(&alice(), &engine(), 2);
        cash.approve(&alice(), &engine(), 7);
        assert_eq!(cash.allowance(&alice(), &engine()), 7);
    }

    #[test]
    fn test_transfer_between_accounts() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), 10);

        cash.transfer(&alice(), &bob(), 4).unwrap();
        assert_eq!(cash.balance_of(&alice()), 6);
        assert_eq!(cash.balance_of(&bob()), 4);

        // Self-transfer is a no-op
        cash.transfer(&bob(), &bob(), 4).unwrap();
        assert_eq!(cash.balance_of(&bob()), 4);
    }

    #[test]
    fn test_mint_overflow_rejected() {
        let mut cash = Cash::new();
        fund(&mut cash, &alice(), Amount::MAX);
        cash.deposit(&bob(), 1).unwrap();
        assert_eq!(cash.buy_cash(&bob(), 1), Err(LedgerError::Overflow));
        assert_eq!(cash.reserve_of(&bob()), 1);
        assert_eq!(cash.balance_of(&bob()), 0);
    }

    #[test]
    fn test_random_operations_conserve_supply() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let accounts: Vec<AccountId> = (0..4u8).map(|i| AccountId::new([i + 1; 16])).collect();
        let mut cash = Cash::new();
        let mut deposited: Amount = 0;

        for _ in 0..2_000 {
            let a = accounts[rng.gen_range(0..accounts.len())];
            let b = accounts[rng.gen_range(0..accounts.len())];
            let amount: Amount = rng.gen_range(0..50);
            let before: Vec<Amount> = accounts.iter().map(|x| cash.balance_of(x)).collect();

            let result = match rng.gen_range(0..6) {
                0 => cash.buy_cash(&a, amount).map(|_| ()),
                5 => cash.deposit(&a, amount).map(|_| deposited += amount),
                1 => cash.withdraw(&a, amount).map(|_| ()),
                2 => cash.transfer(&a, &b, amount),
                3 => {
                    cash.approve(&a, &b, amount);
                    Ok(())
                }
                _ => cash.transfer_from(&b, &a, &b, amount),
            };

            let after: Vec<Amount> = accounts.iter().map(|x| cash.balance_of(x)).collect();
            if result.is_err() {
                assert_eq!(before, after);
            }
            assert_eq!(after.iter().sum::<Amount>(), cash.total_supply());
            let reserves: Amount = accounts.iter().map(|x| cash.reserve_of(x)).sum();
            assert_eq!(reserves + cash.total_supply(), deposited);
        }
    }
}
