//! Network Layer
//!
//! WebSocket front for a table. Every state change goes through
//! [`TableService`], which owns the only lock on the table.

pub mod auth;
pub mod protocol;
pub mod service;
pub mod server;

pub use auth::{authenticate, AccountClaims, AuthConfig, AuthError, TokenKey};
pub use protocol::{AuthRequest, ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use service::TableService;
pub use server::{ServerConfig, TableServer, TableServerError};
