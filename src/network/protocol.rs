//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Messages are
//! JSON, tagged by `type`. Amounts travel as decimal strings so clients
//! without 128-bit integers don't lose precision; accounts travel as hex.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::account::{AccountId, Amount};
use crate::game::engine::{EngineError, Settlement};
use crate::game::state::{Outcome, Parity, RoundId, Wager};
use crate::ledger::cash::LedgerError;
use crate::ledger::member_card::MembershipError;
use crate::network::auth::AuthError;

/// Serde adapter for amounts as decimal strings.
pub mod amount_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::core::account::Amount;

    /// Write as a decimal string.
    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    /// Read from a decimal string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| de::Error::custom(format!("invalid amount: {}", s)))
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Convert deposited base value into credit.
    BuyCash {
        #[serde(with = "amount_str")]
        value: Amount,
    },

    /// Redeem credit.
    Withdraw {
        #[serde(with = "amount_str")]
        amount: Amount,
    },

    /// Send credit to another account.
    Transfer {
        to: String,
        #[serde(with = "amount_str")]
        amount: Amount,
    },

    /// Set an allowance. Spender defaults to the engine.
    Approve {
        #[serde(default)]
        spender: Option<String>,
        #[serde(with = "amount_str")]
        amount: Amount,
    },

    /// Buy a member card.
    BuyCard,

    /// Renew an expired member card.
    ExtendCard,

    /// Wager on the current round.
    Bet {
        is_odd: bool,
        #[serde(with = "amount_str")]
        amount: Amount,
    },

    /// Settle the current round (operator).
    Play,

    /// Record base value received from an account (operator).
    Deposit {
        account: String,
        #[serde(with = "amount_str")]
        value: Amount,
    },

    /// Fund the pool from the operator's reserve (operator).
    AddCashSupply {
        #[serde(with = "amount_str")]
        value: Amount,
    },

    /// Sweep the pool and close the table (operator).
    Destroy,

    /// Balance of an account (own account by default).
    GetBalance {
        #[serde(default)]
        account: Option<String>,
    },

    /// Base value on deposit for an account (own account by default).
    GetReserve {
        #[serde(default)]
        account: Option<String>,
    },

    /// Allowance granted by `owner` to `spender`.
    GetAllowance { owner: String, spender: String },

    /// Member card of an account (own account by default).
    GetCard {
        #[serde(default)]
        account: Option<String>,
    },

    /// Current round summary.
    GetRound,

    /// Wager by round and index.
    GetWager { round_id: RoundId, index: usize },

    /// Outcome of a settled round.
    GetOutcome { round_id: RoundId },

    /// Hex-encoded transcript of a settled round.
    GetTranscript { round_id: RoundId },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// JWT.
    pub token: String,
    /// Subject to trust when the server runs without a key (dev only).
    #[serde(default)]
    pub subject: Option<String>,
    /// Client version for compatibility check.
    pub client_version: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Balance of an account.
    Balance {
        account: String,
        #[serde(with = "amount_str")]
        balance: Amount,
    },

    /// Base value on deposit for an account.
    Reserve {
        account: String,
        #[serde(with = "amount_str")]
        reserve: Amount,
    },

    /// Allowance between two accounts.
    Allowance {
        owner: String,
        spender: String,
        #[serde(with = "amount_str")]
        amount: Amount,
    },

    /// Member card details.
    Card(CardInfo),

    /// Current round summary.
    Round(RoundInfo),

    /// A recorded wager.
    Wager(WagerInfo),

    /// A settled round's outcome.
    Outcome(OutcomeInfo),

    /// A round was settled. Broadcast to every connection.
    RoundSettled(RoundSettledInfo),

    /// Pool balance after funding.
    PoolFunded {
        #[serde(with = "amount_str")]
        pool: Amount,
    },

    /// Table closed.
    Destroyed {
        #[serde(with = "amount_str")]
        swept: Amount,
    },

    /// Round transcript, bincode as hex.
    Transcript { round_id: RoundId, data: String },

    /// Request applied, nothing to report.
    Ok,

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Authenticated account (hex).
    pub account: Option<String>,
    /// Account to approve before betting (hex).
    pub engine_account: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Error code if failed.
    #[serde(default)]
    pub code: Option<ErrorCode>,
    /// Server version.
    pub server_version: String,
}

/// Member card details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardInfo {
    /// Card id.
    pub card_id: u64,
    /// End of the current validity window.
    pub expires_at: DateTime<Utc>,
    /// Whether the window has passed.
    pub expired: bool,
}

/// Current round summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundInfo {
    /// Newest round id.
    pub round_id: RoundId,
    /// Whether the table accepts wagers.
    pub open: bool,
    /// Whether the table has been closed.
    pub closed: bool,
    /// Wagers in the current round.
    pub wager_count: usize,
    /// Staked on even.
    #[serde(with = "amount_str")]
    pub even_total: Amount,
    /// Staked on odd.
    #[serde(with = "amount_str")]
    pub odd_total: Amount,
    /// Pool balance.
    #[serde(with = "amount_str")]
    pub pool: Amount,
    /// Commitment hash for the round (hex), under commit-reveal.
    pub commitment: Option<String>,
}

/// A recorded wager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerInfo {
    /// Round.
    pub round_id: RoundId,
    /// Position in the round.
    pub index: usize,
    /// Bettor's card.
    pub card_id: u64,
    /// Side backed.
    pub is_odd: bool,
    /// Stake.
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

impl WagerInfo {
    /// Wire form of a wager.
    pub fn new(round_id: RoundId, index: usize, wager: &Wager) -> Self {
        Self {
            round_id,
            index,
            card_id: wager.card_id.0,
            is_odd: wager.bets_odd(),
            amount: wager.amount,
        }
    }
}

/// A settled round's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeInfo {
    /// Round.
    pub round_id: RoundId,
    /// First die.
    pub die1: u8,
    /// Second die.
    pub die2: u8,
    /// Parity of the sum.
    pub is_odd: bool,
}

impl OutcomeInfo {
    /// Wire form of an outcome.
    pub fn new(round_id: RoundId, outcome: &Outcome) -> Self {
        Self {
            round_id,
            die1: outcome.dice.die1(),
            die2: outcome.dice.die2(),
            is_odd: outcome.parity == Parity::Odd,
        }
    }
}

/// Settlement broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSettledInfo {
    /// Outcome of the settled round.
    pub outcome: OutcomeInfo,
    /// Winning accounts (hex) and amounts, in submission order.
    pub payouts: Vec<PayoutInfo>,
    /// Sum of stakes.
    #[serde(with = "amount_str")]
    pub total_staked: Amount,
    /// Sum of payouts.
    #[serde(with = "amount_str")]
    pub total_paid: Amount,
    /// Round now open.
    pub next_round_id: RoundId,
}

/// One payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutInfo {
    /// Winning card.
    pub card_id: u64,
    /// Credited account (hex).
    pub account: String,
    /// Amount credited.
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

impl From<&Settlement> for RoundSettledInfo {
    fn from(settlement: &Settlement) -> Self {
        Self {
            outcome: OutcomeInfo::new(settlement.round_id, &settlement.outcome),
            payouts: settlement
                .payouts
                .iter()
                .map(|p| PayoutInfo {
                    card_id: p.card_id.0,
                    account: p.recipient.to_hex(),
                    amount: p.amount,
                })
                .collect(),
            total_staked: settlement.total_staked,
            total_paid: settlement.total_paid,
            next_round_id: settlement.next_round_id,
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Malformed request.
    InvalidInput,
    /// No valid member card.
    NotEligible,
    /// Card already bet this round.
    DuplicateWager,
    /// Zero stake.
    InvalidAmount,
    /// Pool can't cover the wager.
    InsufficientPoolCoverage,
    /// Allowance too low.
    AllowanceExceeded,
    /// Balance too low.
    InsufficientBalance,
    /// Not enough deposited base value.
    InsufficientReserve,
    /// No round accepting wagers.
    RoundNotOpen,
    /// Operator-only action.
    Unauthorized,
    /// Wager index out of range.
    IndexOutOfRange,
    /// Round not settled.
    NotSettled,
    /// Round does not exist.
    UnknownRound,
    /// Table closed.
    EngineClosed,
    /// Account already has a card.
    AlreadyHasCard,
    /// Card still valid, renewal refused.
    NotExpired,
    /// Arithmetic overflow.
    Overflow,
    /// Settlement could not complete.
    SettlementFailed,
    /// Server overloaded.
    ServerOverloaded,
    /// Version mismatch.
    VersionMismatch,
    /// Internal error.
    InternalError,
}

impl ServerError {
    /// Error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<&LedgerError> for ErrorCode {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::AllowanceExceeded { .. } => ErrorCode::AllowanceExceeded,
            LedgerError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            LedgerError::InsufficientReserve { .. } => ErrorCode::InsufficientReserve,
            LedgerError::Overflow => ErrorCode::Overflow,
        }
    }
}

impl From<&MembershipError> for ErrorCode {
    fn from(err: &MembershipError) -> Self {
        match err {
            MembershipError::NoCard | MembershipError::Expired { .. } => ErrorCode::NotEligible,
            MembershipError::AlreadyHasCard(_) => ErrorCode::AlreadyHasCard,
            MembershipError::NotExpired { .. } => ErrorCode::NotExpired,
        }
    }
}

impl From<&EngineError> for ErrorCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::NotEligible(_) => ErrorCode::NotEligible,
            EngineError::DuplicateWager { .. } => ErrorCode::DuplicateWager,
            EngineError::InvalidAmount => ErrorCode::InvalidAmount,
            EngineError::InsufficientPoolCoverage { .. } => ErrorCode::InsufficientPoolCoverage,
            EngineError::Ledger(e) => e.into(),
            EngineError::RoundNotOpen => ErrorCode::RoundNotOpen,
            EngineError::Unauthorized => ErrorCode::Unauthorized,
            EngineError::IndexOutOfRange { .. } => ErrorCode::IndexOutOfRange,
            EngineError::NotSettled(_) => ErrorCode::NotSettled,
            EngineError::UnknownRound(_) => ErrorCode::UnknownRound,
            EngineError::EngineClosed => ErrorCode::EngineClosed,
            EngineError::Overflow => ErrorCode::Overflow,
            EngineError::UnknownCard(_)
            | EngineError::Outcome(_)
            | EngineError::PoolShortfall { .. } => ErrorCode::SettlementFailed,
        }
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::NotConfigured => ErrorCode::AuthFailed,
            AuthError::InvalidKey(_) => ErrorCode::InternalError,
            AuthError::Expired => ErrorCode::TokenExpired,
            _ => ErrorCode::InvalidToken,
        }
    }
}

impl From<&LedgerError> for ServerError {
    fn from(err: &LedgerError) -> Self {
        Self::new(err.into(), err.to_string())
    }
}

impl From<&MembershipError> for ServerError {
    fn from(err: &MembershipError) -> Self {
        Self::new(err.into(), err.to_string())
    }
}

impl From<&EngineError> for ServerError {
    fn from(err: &EngineError) -> Self {
        Self::new(err.into(), err.to_string())
    }
}

/// Parse an account from the wire: 32 hex digits, or a hyphenated UUID.
pub fn parse_account(s: &str) -> Result<AccountId, ServerError> {
    AccountId::from_hex(s)
        .or_else(|| AccountId::from_uuid_str(s))
        .ok_or_else(|| ServerError::new(ErrorCode::InvalidInput, format!("invalid account: {}", s)))
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Whether the message needs an authenticated caller.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, ClientMessage::Auth(_) | ClientMessage::Ping { .. })
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error message from a code and text.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}

impl From<ServerError> for ServerMessage {
    fn from(err: ServerError) -> Self {
        ServerMessage::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Dice;
    use crate::ledger::member_card::CardId;

    #[test]
    fn test_bet_json_shape() {
        let msg = ClientMessage::from_json(r#"{"type":"bet","is_odd":true,"amount":"5000000000000000000"}"#)
            .unwrap();

        if let ClientMessage::Bet { is_odd, amount } = msg {
            assert!(is_odd);
            assert_eq!(amount, 5_000_000_000_000_000_000);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_amount_above_u64_roundtrip() {
        let msg = ClientMessage::BuyCash { value: u128::from(u64::MAX) * 3 };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"buy_cash\""));

        if let ClientMessage::BuyCash { value } = ClientMessage::from_json(&json).unwrap() {
            assert_eq!(value, u128::from(u64::MAX) * 3);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_bad_amount_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"withdraw","amount":"1.5"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"withdraw","amount":"-1"}"#).is_err());
    }

    #[test]
    fn test_unit_and_optional_fields() {
        assert!(matches!(ClientMessage::from_json(r#"{"type":"play"}"#).unwrap(), ClientMessage::Play));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"get_balance"}"#).unwrap(),
            ClientMessage::GetBalance { account: None }
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"approve","amount":"10"}"#).unwrap(),
            ClientMessage::Approve { spender: None, amount: 10 }
        ));
    }

    #[test]
    fn test_round_settled_json_roundtrip() {
        let settlement = Settlement {
            round_id: 4,
            outcome: Outcome::from_dice(Dice::new(3, 4).unwrap()),
            payouts: vec![crate::game::engine::Payout {
                index: 0,
                card_id: CardId(2),
                recipient: AccountId::new([7; 16]),
                amount: 10,
            }],
            total_staked: 5,
            total_paid: 10,
            next_round_id: 5,
        };

        let msg = ServerMessage::RoundSettled((&settlement).into());
        let json = msg.to_json().unwrap();
        assert!(json.contains("round_settled"));

        if let ServerMessage::RoundSettled(info) = ServerMessage::from_json(&json).unwrap() {
            assert_eq!(info.outcome.round_id, 4);
            assert!(info.outcome.is_odd);
            assert_eq!(info.payouts[0].account, AccountId::new([7; 16]).to_hex());
            assert_eq!(info.total_paid, 10);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_error_codes() {
        let err = EngineError::Ledger(LedgerError::AllowanceExceeded { allowance: 1, requested: 2 });
        assert_eq!(ErrorCode::from(&err), ErrorCode::AllowanceExceeded);

        let err = EngineError::NotEligible(MembershipError::NoCard);
        assert_eq!(ErrorCode::from(&err), ErrorCode::NotEligible);

        assert_eq!(ErrorCode::from(&AuthError::Expired), ErrorCode::TokenExpired);
        assert_eq!(ErrorCode::from(&AuthError::InvalidSignature), ErrorCode::InvalidToken);

        let json = ServerMessage::from(ServerError::from(&EngineError::RoundNotOpen)).to_json().unwrap();
        assert!(json.contains("round_not_open"));
    }

    #[test]
    fn test_auth_gate() {
        assert!(!ClientMessage::Ping { timestamp: 1 }.requires_auth());
        assert!(ClientMessage::Play.requires_auth());
        assert!(ClientMessage::GetReserve { account: None }.requires_auth());
    }

    #[test]
    fn test_deposit_json_shape() {
        let json = r#"{"type":"deposit","account":"03030303030303030303030303030303","value":"7"}"#;
        assert!(ClientMessage::from_json(json).is_ok());
        assert!(ClientMessage::from_json(r#"{"type":"deposit","value":"7"}"#).is_err());

        let reply = ServerMessage::Reserve { account: "ab".into(), reserve: 7 }.to_json().unwrap();
        assert!(reply.contains(r#""reserve":"7""#));
    }

    #[test]
    fn test_parse_account() {
        let id = AccountId::new([3; 16]);
        assert_eq!(parse_account(&id.to_hex()).unwrap(), id);
        assert_eq!(parse_account("zz").unwrap_err().code, ErrorCode::InvalidInput);

        let uuid = parse_account("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(uuid.to_hex(), "67e5504410b1426f9247bb680e5fe0c8");
    }
}
