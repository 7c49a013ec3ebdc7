//! Collaborator Ledgers
//!
//! The two leaf components the match engine consumes through traits:
//!
//! - `cash`: fungible credit with allowance-gated pulls ([`CreditLedger`])
//! - `member_card`: time-boxed eligibility cards ([`MembershipRegistry`])

pub mod cash;
pub mod member_card;

pub use cash::{Cash, CreditLedger, LedgerError};
pub use member_card::{
    CardId, MemberCard, MemberCardRecord, MembershipConfig, MembershipError, MembershipRegistry,
};
