//! Error types for ChatGuard

/// Result type alias using ChatGuard's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for ChatGuard operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or timeout failure talking to an external capability or the broker
    #[error("transient io error: {0}")]
    TransientIo(String),

    /// External capability answered with something we could not interpret
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Another arbiter already committed a decision for this message
    #[error("decision already committed for message {0}")]
    DuplicateDecision(String),

    /// Arbitration window elapsed before every stage reported
    #[error("arbitration window elapsed for message {0}")]
    ArbitrationTimeout(String),

    /// Broker stayed unreachable past the retry budget
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new transient io error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a new malformed response error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Create a new broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry may succeed.
    ///
    /// Malformed responses count as transient: a model that produced junk
    /// once frequently answers correctly on the next call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::MalformedResponse(_) | Self::BrokerUnavailable(_)
        )
    }
}
