//! Error types for the subscription engine.

use crate::types::EngineId;
use std::io::ErrorKind;
use thiserror::Error;

/// Main error type for subscription operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Parameter {0} is part of the subscription identity and cannot change once started")]
    IdentityLocked(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Reconnect wait budget of {0:?} exhausted")]
    WaitBudgetExhausted(std::time::Duration),

    #[error("Invocation command failed: {0}")]
    Invocation(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },

    #[error("Equivalent subscription already running: {0}")]
    Duplicate(String),

    #[error("Engine {0} is already managed")]
    AlreadyManaged(EngineId),

    #[error("Engine is not in a startable state: {0}")]
    NotStartable(String),

    #[error("Subscription manager has been terminated")]
    ManagerClosed,

    #[error("Interrupted by termination request")]
    Interrupted,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Session store is locked by another process")]
    Locked,
}

impl SubscriptionError {
    /// Shorthand for [`SubscriptionError::InvalidParameter`].
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SubscriptionError::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for transient failures that the repair cycle retries.
    ///
    /// Socket-level IO errors (refused, reset, timed out) count as well.
    pub fn is_connection(&self) -> bool {
        match self {
            SubscriptionError::Connection(_) => true,
            SubscriptionError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::AddrNotAvailable
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True for failures that must never be retried automatically.
    pub fn is_authentication(&self) -> bool {
        matches!(self, SubscriptionError::Authentication(_))
    }
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubscriptionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriptionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriptionError::Deserialization(e.to_string())
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
