//! Table Service
//!
//! Async front for a [`Table`]. One `RwLock` around the whole table puts
//! every operation in a single total order: writers run one at a time,
//! reads see a state between writes. Settlements are broadcast to every
//! subscriber.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::core::account::AccountId;
use crate::game::state::{EnginePhase, Parity};
use crate::game::table::Table;
use crate::ledger::member_card::MembershipError;
use crate::network::auth::{authenticate, AuthConfig};
use crate::network::protocol::{
    parse_account, AuthRequest, AuthResult, CardInfo, ClientMessage, ErrorCode, OutcomeInfo,
    RoundInfo, ServerError, ServerMessage, WagerInfo,
};

/// Capacity of the settlement broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared handle to a table.
#[derive(Clone)]
pub struct TableService {
    table: Arc<RwLock<Table>>,
    auth: AuthConfig,
    events: broadcast::Sender<ServerMessage>,
    version: String,
}

impl TableService {
    /// Wrap a deployed table.
    pub fn new(table: Table, auth: AuthConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            table: Arc::new(RwLock::new(table)),
            auth,
            events,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Receive `RoundSettled` notices.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// The shared table.
    pub fn table(&self) -> Arc<RwLock<Table>> {
        self.table.clone()
    }

    /// Resolve an auth request. Returns the account on success along with
    /// the reply for the client.
    pub async fn login(&self, request: &AuthRequest) -> (Option<AccountId>, ServerMessage) {
        if !versions_compatible(&request.client_version, &self.version) {
            let reply = ServerMessage::error(
                ErrorCode::VersionMismatch,
                format!("client {} incompatible with server {}", request.client_version, self.version),
            );
            return (None, reply);
        }

        match authenticate(&request.token, request.subject.as_deref(), &self.auth) {
            Ok(account) => {
                let engine_account = self.table.read().await.engine_account();
                debug!("Authenticated {}", account);
                let reply = ServerMessage::AuthResult(AuthResult {
                    success: true,
                    account: Some(account.to_hex()),
                    engine_account: Some(engine_account.to_hex()),
                    error: None,
                    code: None,
                    server_version: self.version.clone(),
                });
                (Some(account), reply)
            }
            Err(e) => {
                debug!("Authentication failed: {}", e);
                let reply = ServerMessage::AuthResult(AuthResult {
                    success: false,
                    account: None,
                    engine_account: None,
                    error: Some(e.to_string()),
                    code: Some(ErrorCode::from(&e)),
                    server_version: self.version.clone(),
                });
                (None, reply)
            }
        }
    }

    /// Run one request on behalf of `caller`.
    #[instrument(skip_all, fields(caller = %caller))]
    pub async fn execute(&self, caller: &AccountId, msg: ClientMessage) -> ServerMessage {
        match self.dispatch(caller, msg).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Request from {} failed: {:?} {}", caller, e.code, e.message);
                ServerMessage::Error(e)
            }
        }
    }

    async fn dispatch(&self, caller: &AccountId, msg: ClientMessage) -> Result<ServerMessage, ServerError> {
        match msg {
            ClientMessage::Auth(_) => Err(ServerError::new(ErrorCode::InvalidInput, "already authenticated")),
            ClientMessage::Ping { timestamp } => Ok(pong(timestamp)),

            ClientMessage::BuyCash { value } => {
                let balance = self.table.write().await.buy_cash(caller, value).map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Balance { account: caller.to_hex(), balance })
            }
            ClientMessage::Withdraw { amount } => {
                let balance = self.table.write().await.withdraw(caller, amount).map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Balance { account: caller.to_hex(), balance })
            }
            ClientMessage::Transfer { to, amount } => {
                let to = parse_account(&to)?;
                self.table.write().await.transfer(caller, &to, amount).map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Ok)
            }
            ClientMessage::Approve { spender, amount } => {
                let mut table = self.table.write().await;
                let spender = match spender {
                    Some(hex) => parse_account(&hex)?,
                    None => table.engine_account(),
                };
                table.approve(caller, &spender, amount);
                Ok(ServerMessage::Allowance {
                    owner: caller.to_hex(),
                    spender: spender.to_hex(),
                    amount,
                })
            }

            ClientMessage::BuyCard => {
                let mut table = self.table.write().await;
                table.buy_card(caller).map_err(|e| ServerError::from(&e))?;
                card_info(&table, caller)
            }
            ClientMessage::ExtendCard => {
                let mut table = self.table.write().await;
                table.extend_card_period(caller).map_err(|e| ServerError::from(&e))?;
                card_info(&table, caller)
            }

            ClientMessage::Bet { is_odd, amount } => {
                let side = Parity::from_odd(is_odd);
                let mut table = self.table.write().await;
                let wager = table.bet(caller, side, amount).map_err(|e| ServerError::from(&e))?;
                let round_id = table.current_round_id();
                let index = table.engine().wager_count(round_id).map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Wager(WagerInfo::new(round_id, index.saturating_sub(1), &wager)))
            }
            ClientMessage::Play => {
                let settlement = self.table.write().await.play(caller).map_err(|e| ServerError::from(&e))?;
                let notice = ServerMessage::RoundSettled((&settlement).into());
                if self.events.send(notice.clone()).is_err() {
                    debug!("No subscribers for round {} settlement", settlement.round_id);
                }
                Ok(notice)
            }
            ClientMessage::Deposit { account, value } => {
                let account = parse_account(&account)?;
                let reserve = self
                    .table
                    .write()
                    .await
                    .credit_deposit(caller, &account, value)
                    .map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Reserve { account: account.to_hex(), reserve })
            }
            ClientMessage::AddCashSupply { value } => {
                let pool = self
                    .table
                    .write()
                    .await
                    .add_cash_supply(caller, value)
                    .map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::PoolFunded { pool })
            }
            ClientMessage::Destroy => {
                let swept = self.table.write().await.destroy(caller).map_err(|e| ServerError::from(&e))?;
                info!("Table destroyed by {}, swept {}", caller, swept);
                let notice = ServerMessage::Shutdown { reason: "table closed".to_string() };
                if self.events.send(notice).is_err() {
                    debug!("No subscribers for table close");
                }
                Ok(ServerMessage::Destroyed { swept })
            }

            ClientMessage::GetBalance { account } => {
                let account = match account {
                    Some(hex) => parse_account(&hex)?,
                    None => *caller,
                };
                let balance = self.table.read().await.balance_of(&account);
                Ok(ServerMessage::Balance { account: account.to_hex(), balance })
            }
            ClientMessage::GetReserve { account } => {
                let account = match account {
                    Some(hex) => parse_account(&hex)?,
                    None => *caller,
                };
                let reserve = self.table.read().await.reserve_of(&account);
                Ok(ServerMessage::Reserve { account: account.to_hex(), reserve })
            }
            ClientMessage::GetAllowance { owner, spender } => {
                let owner = parse_account(&owner)?;
                let spender = parse_account(&spender)?;
                let amount = self.table.read().await.allowance(&owner, &spender);
                Ok(ServerMessage::Allowance {
                    owner: owner.to_hex(),
                    spender: spender.to_hex(),
                    amount,
                })
            }
            ClientMessage::GetCard { account } => {
                let account = match account {
                    Some(hex) => parse_account(&hex)?,
                    None => *caller,
                };
                card_info(&*self.table.read().await, &account)
            }
            ClientMessage::GetRound => Ok(ServerMessage::Round(round_info(&*self.table.read().await))),
            ClientMessage::GetWager { round_id, index } => {
                let wager = self.table.read().await.wager_at(round_id, index).map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Wager(WagerInfo::new(round_id, index, &wager)))
            }
            ClientMessage::GetOutcome { round_id } => {
                let outcome = self.table.read().await.outcome_of(round_id).map_err(|e| ServerError::from(&e))?;
                Ok(ServerMessage::Outcome(OutcomeInfo::new(round_id, &outcome)))
            }
            ClientMessage::GetTranscript { round_id } => {
                let table = self.table.read().await;
                table.outcome_of(round_id).map_err(|e| ServerError::from(&e))?;
                let transcript = table.transcript(round_id).ok_or_else(|| {
                    warn!("Settled round {} has no transcript", round_id);
                    ServerError::new(ErrorCode::InternalError, "transcript unavailable")
                })?;
                let bytes = transcript
                    .to_bytes()
                    .map_err(|e| ServerError::new(ErrorCode::InternalError, e.to_string()))?;
                Ok(ServerMessage::Transcript { round_id, data: hex::encode(bytes) })
            }
        }
    }
}

/// Same major version.
fn versions_compatible(client: &str, server: &str) -> bool {
    let major = |v: &str| v.split('.').next().unwrap_or("").to_string();
    !client.is_empty() && major(client) == major(server)
}

/// Current server time in milliseconds.
pub(crate) fn server_time_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Pong for a client ping.
pub(crate) fn pong(timestamp: u64) -> ServerMessage {
    ServerMessage::Pong { timestamp, server_time: server_time_millis() }
}

fn card_info(table: &Table, account: &AccountId) -> Result<ServerMessage, ServerError> {
    let record = table
        .cards()
        .record_of(account)
        .ok_or_else(|| ServerError::from(&MembershipError::NoCard))?;
    let expired = table.is_expired(account).map_err(|e| ServerError::from(&e))?;

    Ok(ServerMessage::Card(CardInfo {
        card_id: record.card_id.0,
        expires_at: record.expires_at,
        expired,
    }))
}

fn round_info(table: &Table) -> RoundInfo {
    let engine = table.engine();
    let round_id = engine.current_round_id();
    let (even_total, odd_total) = engine.side_totals();
    let round = engine.round(round_id);

    RoundInfo {
        round_id,
        open: matches!(engine.phase(), EnginePhase::Open(_)),
        closed: engine.phase() == EnginePhase::Closed,
        wager_count: round.map_or(0, |r| r.wagers().len()),
        even_total,
        odd_total,
        pool: table.pool_balance(),
        commitment: round
            .and_then(|r| r.commitment)
            .map(|c| hex::encode(c.commitment_hash)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::account::Amount;
    use crate::game::outcome::{CommitRevealDice, FixedDice, OutcomeSource};
    use crate::game::table::TableConfig;
    use crate::proof::transcript::RoundTranscript;
    use crate::proof::verify::verify_transcript;

    fn operator() -> AccountId {
        AccountId::derive("operator")
    }

    fn service(source: impl OutcomeSource + 'static, pool: Amount) -> TableService {
        let config = TableConfig { initial_pool: pool, ..TableConfig::default() };
        let table = Table::new(config, source).unwrap();
        let auth = AuthConfig { allow_insecure_dev_auth: true, ..Default::default() };
        TableService::new(table, auth)
    }

    async fn join(service: &TableService, name: &str, funds: Amount) -> AccountId {
        let request = AuthRequest {
            token: String::new(),
            subject: Some(name.to_string()),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let (account, reply) = service.login(&request).await;
        assert!(matches!(reply, ServerMessage::AuthResult(AuthResult { success: true, .. })));
        let account = account.unwrap();

        let deposit = ClientMessage::Deposit { account: account.to_hex(), value: funds };
        assert!(matches!(service.execute(&operator(), deposit).await, ServerMessage::Reserve { .. }));
        service.execute(&account, ClientMessage::BuyCash { value: funds }).await;
        service.execute(&account, ClientMessage::Approve { spender: None, amount: funds }).await;
        assert!(matches!(service.execute(&account, ClientMessage::BuyCard).await, ServerMessage::Card(_)));
        account
    }

    #[tokio::test]
    async fn test_login_rejects_version_mismatch() {
        let service = service(FixedDice::always(1, 1), 0);
        let request = AuthRequest {
            token: String::new(),
            subject: Some("alice".into()),
            client_version: "999.0.0".into(),
        };

        let (account, reply) = service.login(&request).await;
        assert!(account.is_none());
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::VersionMismatch, .. })));
    }

    #[tokio::test]
    async fn test_login_failure_carries_code() {
        let table = Table::new(TableConfig::default(), FixedDice::always(1, 1)).unwrap();
        let service = TableService::new(table, AuthConfig::default());
        let request = AuthRequest {
            token: "not-a-jwt".into(),
            subject: Some("alice".into()),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let (account, reply) = service.login(&request).await;
        assert!(account.is_none());
        if let ServerMessage::AuthResult(result) = reply {
            assert!(!result.success);
            assert_eq!(result.code, Some(ErrorCode::AuthFailed));
        } else {
            panic!("Wrong reply: {:?}", reply);
        }
    }

    #[tokio::test]
    async fn test_buy_cash_without_deposit_fails() {
        let service = service(FixedDice::always(1, 1), 0);
        let mallory = AccountId::derive("mallory");

        let reply = service.execute(&mallory, ClientMessage::BuyCash { value: 1_000 }).await;
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::InsufficientReserve, .. })));

        // Only the operator can credit a deposit
        let deposit = ClientMessage::Deposit { account: mallory.to_hex(), value: 1_000 };
        let reply = service.execute(&mallory, deposit).await;
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::Unauthorized, .. })));

        let reply = service.execute(&mallory, ClientMessage::Withdraw { amount: 1 }).await;
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::InsufficientBalance, .. })));

        let table = service.table();
        assert_eq!(table.read().await.total_supply(), 0);

        let deposit = ClientMessage::Deposit { account: mallory.to_hex(), value: 1_000 };
        service.execute(&operator(), deposit).await;
        service.execute(&mallory, ClientMessage::BuyCash { value: 400 }).await;
        let reply = service.execute(&mallory, ClientMessage::GetReserve { account: None }).await;
        assert!(matches!(reply, ServerMessage::Reserve { reserve: 600, .. }));
    }

    #[tokio::test]
    async fn test_bet_and_play_broadcasts() {
        let service = service(FixedDice::always(2, 3), 1_000);
        let mut events = service.subscribe();
        let alice = join(&service, "alice", 100).await;

        let reply = service.execute(&alice, ClientMessage::Bet { is_odd: true, amount: 40 }).await;
        if let ServerMessage::Wager(info) = reply {
            assert_eq!(info.round_id, 0);
            assert_eq!(info.index, 0);
            assert_eq!(info.amount, 40);
        } else {
            panic!("Wrong reply: {:?}", reply);
        }

        let reply = service.execute(&operator(), ClientMessage::Play).await;
        assert!(matches!(reply, ServerMessage::RoundSettled(_)));

        if let ServerMessage::RoundSettled(info) = events.recv().await.unwrap() {
            assert_eq!(info.payouts.len(), 1);
            assert_eq!(info.payouts[0].amount, 80);
            assert_eq!(info.next_round_id, 1);
        } else {
            panic!("Wrong broadcast");
        }

        let reply = service.execute(&alice, ClientMessage::GetBalance { account: None }).await;
        assert!(matches!(reply, ServerMessage::Balance { balance: 140, .. }));
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let service = service(FixedDice::always(1, 1), 10);
        let alice = join(&service, "alice", 100).await;

        let reply = service.execute(&alice, ClientMessage::Play).await;
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::Unauthorized, .. })));

        let reply = service.execute(&alice, ClientMessage::Bet { is_odd: false, amount: 50 }).await;
        assert!(matches!(
            reply,
            ServerMessage::Error(ServerError { code: ErrorCode::InsufficientPoolCoverage, .. })
        ));

        let reply = service.execute(&alice, ClientMessage::Transfer { to: "nope".into(), amount: 1 }).await;
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::InvalidInput, .. })));

        let reply = service.execute(&alice, ClientMessage::GetOutcome { round_id: 0 }).await;
        assert!(matches!(reply, ServerMessage::Error(ServerError { code: ErrorCode::NotSettled, .. })));
    }

    #[tokio::test]
    async fn test_round_info_and_transcript() {
        let service = service(CommitRevealDice::new(), 1_000);
        let alice = join(&service, "alice", 100).await;
        service.execute(&alice, ClientMessage::Bet { is_odd: false, amount: 10 }).await;

        if let ServerMessage::Round(info) = service.execute(&alice, ClientMessage::GetRound).await {
            assert!(info.open);
            assert_eq!(info.wager_count, 1);
            assert_eq!(info.even_total, 10);
            assert!(info.commitment.is_some());
        } else {
            panic!("Wrong reply");
        }

        service.execute(&operator(), ClientMessage::Play).await;
        let reply = service.execute(&alice, ClientMessage::GetTranscript { round_id: 0 }).await;
        if let ServerMessage::Transcript { data, .. } = reply {
            let transcript = RoundTranscript::from_bytes(&hex::decode(data).unwrap()).unwrap();
            assert!(verify_transcript(&transcript).valid);
        } else {
            panic!("Wrong reply: {:?}", reply);
        }
    }

    #[tokio::test]
    async fn test_concurrent_bets_serialize() {
        let service = service(FixedDice::always(1, 1), 1_000_000);
        let mut accounts = Vec::new();
        for i in 0..16 {
            accounts.push(join(&service, &format!("p{}", i), 1_000).await);
        }

        let handles: Vec<_> = accounts
            .iter()
            .map(|account| {
                let service = service.clone();
                let account = *account;
                tokio::spawn(async move {
                    service.execute(&account, ClientMessage::Bet { is_odd: true, amount: 10 }).await
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), ServerMessage::Wager(_)));
        }

        let table = service.table();
        let table = table.read().await;
        assert_eq!(table.engine().wager_count(0), Ok(16));
        assert_eq!(table.pool_balance(), 1_000_000 + 160);
    }

    #[tokio::test]
    async fn test_destroy_sweeps_and_closes() {
        let service = service(FixedDice::always(1, 1), 500);
        let mut events = service.subscribe();

        let reply = service.execute(&operator(), ClientMessage::Destroy).await;
        assert!(matches!(reply, ServerMessage::Destroyed { swept: 500 }));
        assert!(matches!(events.recv().await.unwrap(), ServerMessage::Shutdown { .. }));

        let reply = service.execute(&operator(), ClientMessage::GetRound).await;
        assert!(matches!(reply, ServerMessage::Round(RoundInfo { closed: true, open: false, .. })));
    }
}
