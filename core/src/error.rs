/// Error types for the chat session core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Unauthorized ({0})")]
    Unauthorized(u16),

    #[error("Not connected to the chat channel")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Authentication is missing or was rejected by the backend.
    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::NotAuthenticated | ChatError::Unauthorized(_))
    }

    /// Message a backend attached to a failed request, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ChatError::Api { message, .. } if !message.is_empty() => Some(message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
