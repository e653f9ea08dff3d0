use serde::Serialize;
use thiserror::Error;

/// Delivery-level failures.
///
/// Apart from [`BusError::InvalidSubscription`], none of these ever escape
/// the bus as an `Err`; they are reported inside a
/// [`PublishOutcome`](super::PublishOutcome).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusError {
    #[error("Duplicate message")]
    DuplicateMessage { message_id: String },
    #[error("No matching subscription")]
    NoMatchingSubscription { receiver: Option<String> },
    #[error("Circuit breaker open")]
    CircuitOpen { agent_id: String },
    #[error("{message}")]
    CallbackError { message: String },
    #[error("Timeout")]
    Timeout { after_ms: u64 },
    #[error("invalid subscription: {reason}")]
    InvalidSubscription { reason: String },
    #[error("failed to serialize message: {reason}")]
    Serialization { reason: String },
}

impl BusError {
    pub fn callback(message: impl Into<String>) -> Self {
        Self::CallbackError {
            message: message.into(),
        }
    }

    /// Terminal errors are never retried and never counted against a breaker.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateMessage { .. }
                | Self::NoMatchingSubscription { .. }
                | Self::InvalidSubscription { .. }
                | Self::Serialization { .. }
        )
    }
}
