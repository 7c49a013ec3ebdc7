//! WebSocket Table Server
//!
//! Async WebSocket server in front of a [`TableService`]. Each connection
//! gets its own task; a connection must authenticate before anything but a
//! ping is accepted. A connection holds its slot from accept until close,
//! handshake included.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::core::account::AccountId;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::service::{pong, TableService};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for longer than this are dropped.
    pub idle_timeout: Duration,
    /// How often idle connections are swept.
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("EVEN_ODD_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("EVEN_ODD_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

/// Table server errors.
#[derive(Debug, thiserror::Error)]
pub enum TableServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// How long an over-limit connection gets to receive its rejection.
const REJECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected client state.
struct ConnectedClient {
    /// Account (after auth).
    account: Option<AccountId>,
    /// Last activity.
    last_activity: Instant,
    /// Disconnect signal, fired by idle cleanup.
    kick: mpsc::Sender<()>,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The table server.
pub struct TableServer {
    config: ServerConfig,
    service: TableService,
    clients: Clients,
    shutdown_tx: broadcast::Sender<()>,
}

impl TableServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, service: TableService) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            service,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Run the server until [`TableServer::shutdown`] is called.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), TableServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Table server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TableServerError> {
        let cleanup_clients = self.clients.clone();
        let cleanup_config = self.config.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_config).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => match self.reserve_slot(addr).await {
                            Some(kick_rx) => {
                                info!("New connection from {}", addr);
                                self.handle_connection(stream, addr, kick_rx);
                            }
                            None => {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(async move {
                                    if tokio::time::timeout(REJECT_TIMEOUT, Self::reject_overloaded(stream)).await.is_err() {
                                        debug!("Rejection of {} timed out", addr);
                                    }
                                });
                            }
                        },
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Claim a connection slot for `addr`, counting it against
    /// `max_connections` before the handshake starts. Returns the client's
    /// kick receiver, or `None` when the server is full.
    async fn reserve_slot(&self, addr: SocketAddr) -> Option<mpsc::Receiver<()>> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_connections {
            return None;
        }

        let (kick_tx, kick_rx) = mpsc::channel::<()>(1);
        match clients.entry(addr) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(ConnectedClient {
                    account: None,
                    last_activity: Instant::now(),
                    kick: kick_tx,
                });
                Some(kick_rx)
            }
        }
    }

    /// Complete the handshake only to tell the client why it is refused.
    async fn reject_overloaded(stream: TcpStream) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(_) => return,
        };
        let reply = ServerMessage::error(ErrorCode::ServerOverloaded, "connection limit reached");
        if let Ok(text) = reply.to_json() {
            let _ = ws.send(Message::Text(text)).await;
        }
        let _ = ws.close(None).await;
    }

    /// Handle a new WebSocket connection whose slot is already reserved.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, mut kick_rx: mpsc::Receiver<()>) {
        let clients = self.clients.clone();
        let service = self.service.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut events = service.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&addr);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };

                                let reply = Self::handle_client_message(addr, client_msg, &clients, &service).await;
                                if msg_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                let _ = msg_tx.send(pong(0)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(notice) => {
                                let _ = msg_tx.send(notice).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Client {} missed {} notices", addr, skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => {}
                        }
                    }
                    _ = kick_rx.recv() => {
                        debug!("Client {} idle, disconnecting", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued replies drain before closing
            drop(msg_tx);
            let _ = sender_task.await;

            clients.write().await.remove(&addr);
            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        clients: &Clients,
        service: &TableService,
    ) -> ServerMessage {
        let account = {
            let mut clients = clients.write().await;
            match clients.get_mut(&addr) {
                Some(client) => {
                    client.last_activity = Instant::now();
                    client.account
                }
                None => None,
            }
        };

        if msg.requires_auth() && account.is_none() {
            return ServerMessage::error(ErrorCode::NotAuthenticated, "authenticate first");
        }

        match (msg, account) {
            (ClientMessage::Auth(request), _) => {
                let (authenticated, reply) = service.login(&request).await;
                if let Some(account) = authenticated {
                    if let Some(client) = clients.write().await.get_mut(&addr) {
                        client.account = Some(account);
                    }
                    debug!("Client {} authenticated as {}", addr, account);
                }
                reply
            }
            (ClientMessage::Ping { timestamp }, _) => pong(timestamp),
            (msg, Some(account)) => service.execute(&account, msg).await,
            (_, None) => ServerMessage::error(ErrorCode::InvalidInput, "unsupported request"),
        }
    }

    /// Drop connections that have gone quiet.
    async fn run_cleanup_loop(clients: Clients, config: ServerConfig) {
        let mut interval = interval(config.cleanup_interval);

        loop {
            interval.tick().await;

            let now = Instant::now();
            let idle: Vec<_> = {
                let clients = clients.read().await;
                clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > config.idle_timeout)
                    .map(|(addr, c)| (*addr, c.kick.clone()))
                    .collect()
            };

            for (addr, kick) in idle {
                if kick.try_send(()).is_ok() {
                    info!("Removing idle client {}", addr);
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get authenticated connection count.
    pub async fn authenticated_count(&self) -> usize {
        self.clients.read().await.values().filter(|c| c.account.is_some()).count()
    }
}
