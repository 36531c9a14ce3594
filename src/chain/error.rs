//! Error types for chain reads and event subscriptions.

use thiserror::Error;

/// Errors specific to blockchain connectivity and queries.
///
/// Every variant means "the chain could not be consulted", never "the
/// wallet has no access". Callers must keep that distinction.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Failed to connect to chain RPC at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Chain RPC request timed out")]
    Timeout,

    #[error("RPC request failed: {0}")]
    RpcError(String),

    #[error("RPC returned error {code}: {message}")]
    RpcResponse { code: i64, message: String },

    #[error("Failed to decode chain data: {0}")]
    DecodeError(String),

    #[error("Event subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Chain backend unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout
        } else {
            ChainError::RpcError(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChainError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChainError::SubscriptionClosed(e.to_string())
    }
}
