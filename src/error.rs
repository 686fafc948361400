//! Error types for the Turnstile service.

use std::time::Duration;

use thiserror::Error;

/// Failures raised by a [`RateLimitStore`](crate::store::RateLimitStore).
///
/// Contention and an unelapsed period are not errors; they are reported as
/// [`StoreOutcome`](crate::store::StoreOutcome) values.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database returned an error that is not a recognized outcome.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store answered, but the answer could not be interpreted.
    #[error("Malformed store result: {0}")]
    Malformed(String),

    /// The store could not be reached or configured.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced by the admission gate.
#[derive(Error, Debug)]
pub enum GateError {
    /// The user id was empty.
    #[error("User id must not be empty")]
    InvalidUser,

    /// The store failed; never coerced into a denial.
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    /// The call deadline elapsed before the store responded. The decision may
    /// still have been made.
    #[error("Decision outcome unknown after {0:?}")]
    OutcomeUnknown(Duration),
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store errors outside of an admission decision
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Gate errors
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TurnstileError {
    fn from(err: ::config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
