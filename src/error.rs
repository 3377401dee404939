//! Error types
//!
//! Every fallible operation of the bridge reports one of these.

use thiserror::Error;

/// Errors surfaced by the bridge's wrappers.
///
/// Rejected asynchronous requests and terminal stream failures are deliberately not
/// represented here: the former is the `false` return of [`crate::Conversation::send_async`],
/// the latter arrives as [`crate::InferenceEvent::Error`] on the notification channel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    /// The native factory returned no handle.
    #[error("Native allocation failed: {0}")]
    Allocation(String),

    /// A synchronous send produced no reply.
    #[error("Send failed: {0}")]
    Send(String),

    /// The wrapper has already been released.
    #[error("{0} has already been released")]
    Disposed(&'static str),

    /// Asynchronous engine creation was cancelled before the engine became ready.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Settings error: {0}")]
    Settings(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Settings(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Settings(e.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
