/// PDV Chat - conversation session core for the PDV admin dashboard
///
/// Conversation list, open conversation, unread bookkeeping and read receipts
/// over a REST backend and a real-time WebSocket channel.

pub mod error;
pub mod config;
pub mod auth;
pub mod types;
pub mod conversation_store;
pub mod message_store;
pub mod notify;
pub mod rest;
pub mod channel;
pub mod ws;
pub mod session;
pub mod cli_app;

pub use error::{ChatError, Result};
pub use config::Config;
pub use session::SessionManager;
