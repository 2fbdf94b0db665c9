use thiserror::Error;

/// Result type for doclink operations
pub type DoclinkResult<T> = Result<T, DoclinkError>;

/// Errors that can occur while setting up or driving the realtime client
///
/// Steady-state operations (subscribing, delivering updates, evicting) never
/// return these; failures there are absorbed into metrics and notifications.
#[derive(Error, Debug)]
pub enum DoclinkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
