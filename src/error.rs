//! Error types for quizlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No free verification code after {0} attempts")]
    CodeSpaceExhausted(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap a rusqlite error with the operation that produced it
    pub fn db(op: &str, err: rusqlite::Error) -> Self {
        StorageError::Database(format!("{}: {}", op, err))
    }
}

/// Outcome of a failed code redemption.
///
/// Everything except `Storage` is an expected, user-facing result.
#[derive(Error, Debug)]
pub enum RedeemError {
    #[error("Verification code not found")]
    NotFound,

    #[error("Verification code expired")]
    Expired,

    #[error("Verification code already used")]
    AlreadyVerified,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RedeemError {
    /// True for outcomes the redeeming user caused, as opposed to system faults
    pub fn is_expected(&self) -> bool {
        !matches!(self, RedeemError::Storage(_))
    }
}

/// Notification delivery failure. Logged by the dispatcher, never surfaced.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Notifier disabled: no base URL configured")]
    Disabled,

    #[error("Invalid notifier URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Delivery timed out")]
    Timeout,

    #[error("Endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else if let Some(status) = err.status() {
            DeliveryError::Status(status.as_u16())
        } else {
            DeliveryError::Transport(err.to_string())
        }
    }
}
