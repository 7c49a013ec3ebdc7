//! MemberCard: time-boxed eligibility cards, one per account.
//!
//! A card is issued once per account and stays bound to it. Validity runs
//! for a fixed window from issuance or from the last renewal; renewal is
//! only allowed once the current window has lapsed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::account::AccountId;
use crate::core::clock::{Clock, SystemClock};

/// Stable membership identity recorded on wagers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CardId(pub u64);

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "card#{}", self.0)
    }
}

/// Membership errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// Account never bought a card.
    #[error("account has no member card")]
    NoCard,

    /// Card exists but its validity window has passed.
    #[error("member card {card_id} expired at {expired_at}")]
    Expired {
        /// The expired card.
        card_id: CardId,
        /// When it expired.
        expired_at: DateTime<Utc>,
    },

    /// Account already owns a card (expired or not).
    #[error("account already owns member card {0}")]
    AlreadyHasCard(CardId),

    /// Renewal attempted while the card is still valid.
    #[error("member card {card_id} is valid until {expires_at}")]
    NotExpired {
        /// The card.
        card_id: CardId,
        /// Current expiry.
        expires_at: DateTime<Utc>,
    },
}

/// The capability the match engine needs from a membership registry.
pub trait MembershipRegistry {
    /// Card id of `account` if it holds a currently valid card.
    fn check_valid(&self, account: &AccountId) -> Result<CardId, MembershipError>;

    /// Account a card is bound to.
    fn owner_of(&self, card_id: CardId) -> Option<AccountId>;
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// How long a card stays valid after issue or renewal.
    pub validity: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            validity: Duration::days(1),
        }
    }
}

impl MembershipConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let validity = std::env::var("EVEN_ODD_CARD_VALIDITY_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::seconds)
            .unwrap_or_else(|| Duration::days(1));
        Self { validity }
    }
}

/// A single issued card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCardRecord {
    /// Card identifier.
    pub card_id: CardId,
    /// Bound account.
    pub owner: AccountId,
    /// End of the current validity window.
    pub expires_at: DateTime<Utc>,
}

/// In-memory membership registry.
pub struct MemberCard {
    config: MembershipConfig,
    clock: Arc<dyn Clock>,
    cards: BTreeMap<CardId, MemberCardRecord>,
    card_of: BTreeMap<AccountId, CardId>,
    latest_card_id: u64,
}

impl MemberCard {
    /// Registry on the system clock.
    pub fn new(config: MembershipConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Registry on an explicit clock.
    pub fn with_clock(config: MembershipConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            cards: BTreeMap::new(),
            card_of: BTreeMap::new(),
            latest_card_id: 0,
        }
    }

    /// Issue a card to `owner`. Ids start at 1.
    pub fn buy_card(&mut self, owner: &AccountId) -> Result<CardId, MembershipError> {
        if let Some(existing) = self.card_of.get(owner) {
            return Err(MembershipError::AlreadyHasCard(*existing));
        }

        self.latest_card_id += 1;
        let card_id = CardId(self.latest_card_id);
        let expires_at = self.clock.now() + self.config.validity;

        self.cards.insert(card_id, MemberCardRecord { card_id, owner: *owner, expires_at });
        self.card_of.insert(*owner, card_id);

        info!(%owner, %card_id, %expires_at, "member card issued");
        Ok(card_id)
    }

    /// Renew an expired card for another validity window.
    pub fn extend_card_period(&mut self, owner: &AccountId) -> Result<DateTime<Utc>, MembershipError> {
        let now = self.clock.now();
        let card_id = *self.card_of.get(owner).ok_or(MembershipError::NoCard)?;
        let record = self.cards.get_mut(&card_id).ok_or(MembershipError::NoCard)?;

        if now < record.expires_at {
            return Err(MembershipError::NotExpired { card_id, expires_at: record.expires_at });
        }

        record.expires_at = now + self.config.validity;
        debug!(%owner, %card_id, expires_at = %record.expires_at, "member card renewed");
        Ok(record.expires_at)
    }

    /// Whether `owner`'s card has lapsed. Fails if there is no card.
    pub fn is_expired(&self, owner: &AccountId) -> Result<bool, MembershipError> {
        let record = self.record_of(owner).ok_or(MembershipError::NoCard)?;
        Ok(self.clock.now() >= record.expires_at)
    }

    /// Card bound to `owner`, if any.
    pub fn card_id_of(&self, owner: &AccountId) -> Option<CardId> {
        self.card_of.get(owner).copied()
    }

    /// Expiry of a card.
    pub fn expiration_of(&self, card_id: CardId) -> Option<DateTime<Utc>> {
        self.cards.get(&card_id).map(|r| r.expires_at)
    }

    /// Most recently issued card id (0 before any card).
    pub fn latest_card_id(&self) -> u64 {
        self.latest_card_id
    }

    /// Full record for `owner`'s card.
    pub fn record_of(&self, owner: &AccountId) -> Option<&MemberCardRecord> {
        self.card_of.get(owner).and_then(|id| self.cards.get(id))
    }
}

impl MembershipRegistry for MemberCard {
    fn check_valid(&self, account: &AccountId) -> Result<CardId, MembershipError> {
        let record = self.record_of(account).ok_or(MembershipError::NoCard)?;
        if self.clock.now() >= record.expires_at {
            return Err(MembershipError::Expired {
                card_id: record.card_id,
                expired_at: record.expires_at,
            });
        }
        Ok(record.card_id)
    }

    fn owner_of(&self, card_id: CardId) -> Option<AccountId> {
        self.cards.get(&card_id).map(|r| r.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    const DAY_SECS: i64 = 86_400;

    fn registry() -> (MemberCard, ManualClock) {
        let clock = ManualClock::default();
        let cards = MemberCard::with_clock(MembershipConfig::default(), Arc::new(clock.clone()));
        (cards, clock)
    }

    fn user(n: u8) -> AccountId {
        AccountId::new([n; 16])
    }

    #[test]
    fn test_double_buy_rejected() {
        let (mut cards, _) = registry();
        let id = cards.buy_card(&user(1)).unwrap();

        assert_eq!(cards.buy_card(&user(1)), Err(MembershipError::AlreadyHasCard(id)));
        assert_eq!(cards.latest_card_id(), 1);
    }

    #[test]
    fn test_card_ids_are_sequential() {
        let (mut cards, _) = registry();

        let first = cards.buy_card(&user(1)).unwrap();
        assert_eq!(first, CardId(cards.latest_card_id()));
        assert_eq!(cards.card_id_of(&user(1)), Some(first));

        let second = cards.buy_card(&user(2)).unwrap();
        assert_eq!(second, CardId(cards.latest_card_id()));
        assert_eq!(second, CardId(2));
        assert_eq!(cards.owner_of(second), Some(user(2)));
    }

    #[test]
    fn test_is_expired_requires_card() {
        let (cards, _) = registry();
        assert_eq!(cards.is_expired(&user(1)), Err(MembershipError::NoCard));
    }

    #[test]
    fn test_card_expires_after_window() {
        let (mut cards, clock) = registry();
        cards.buy_card(&user(1)).unwrap();
        assert_eq!(cards.is_expired(&user(1)), Ok(false));
        assert!(cards.check_valid(&user(1)).is_ok());

        clock.advance(Duration::seconds(DAY_SECS + 1));

        assert_eq!(cards.is_expired(&user(1)), Ok(true));
        assert!(matches!(cards.check_valid(&user(1)), Err(MembershipError::Expired { .. })));
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let (mut cards, clock) = registry();
        cards.buy_card(&user(1)).unwrap();

        clock.advance(Duration::seconds(DAY_SECS - 1));
        assert_eq!(cards.is_expired(&user(1)), Ok(false));

        clock.advance(Duration::seconds(1));
        assert_eq!(cards.is_expired(&user(1)), Ok(true));
    }

    #[test]
    fn test_extend_requires_card() {
        let (mut cards, _) = registry();
        assert_eq!(cards.extend_card_period(&user(1)), Err(MembershipError::NoCard));
    }

    #[test]
    fn test_extend_rejected_while_valid() {
        let (mut cards, _) = registry();
        cards.buy_card(&user(1)).unwrap();

        assert!(matches!(
            cards.extend_card_period(&user(1)),
            Err(MembershipError::NotExpired { .. })
        ));
    }

    #[test]
    fn test_extend_after_expiry() {
        let (mut cards, clock) = registry();
        let card_id = cards.buy_card(&user(1)).unwrap();
        clock.advance(Duration::seconds(DAY_SECS));

        let expires_at = cards.extend_card_period(&user(1)).unwrap();

        assert_eq!(cards.is_expired(&user(1)), Ok(false));
        assert_eq!(cards.expiration_of(card_id), Some(expires_at));
        // Same card, same identity
        assert_eq!(cards.check_valid(&user(1)), Ok(card_id));
    }

    #[test]
    fn test_check_valid_without_card() {
        let (cards, _) = registry();
        assert_eq!(cards.check_valid(&user(3)), Err(MembershipError::NoCard));
    }
}
