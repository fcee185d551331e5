//! Error types for the GraphQL client runtime core
//!
//! This module deliberately covers only construction-time and
//! programmer-facing failures. Runtime network and protocol failures are
//! never propagated as `Err` — they are captured into a `GraphQlResult`
//! (`network_error: true`) or a subscription `CloseReason` instead, per
//! the no-throw contract described in the crate's top-level docs.

use thiserror::Error;

/// Top-level error type for construction-time failures.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// A reconnection or timeout strategy was constructed with invalid parameters.
    #[error("invalid strategy configuration: {0}")]
    InvalidConfiguration(String),

    /// The client was built without a required field (e.g. no `url` for queries).
    #[error("missing client configuration: {0}")]
    MissingConfiguration(String),

    /// Transport-level failure surfaced during a synchronous setup step
    /// (e.g. building the underlying `reqwest::Client`), not during a
    /// per-request send.
    #[error("transport setup failed: {0}")]
    Transport(String),

    /// A WebSocket URL or sub-protocol was rejected before a connection
    /// attempt was made.
    #[error("invalid websocket configuration: {0}")]
    InvalidWebSocketConfig(String),

    /// Catch-all for conditions that don't warrant a dedicated variant.
    #[error("{0}")]
    Custom(String),
}

/// Type alias for `Result`s using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a custom error with a message.
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        CoreError::Custom(msg.into())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(error: reqwest::Error) -> Self {
        CoreError::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::Custom(format!("serialization error: {error}"))
    }
}

impl From<tungstenite::Error> for CoreError {
    fn from(error: tungstenite::Error) -> Self {
        CoreError::InvalidWebSocketConfig(error.to_string())
    }
}
