//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Settings could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A period name that does not resolve to a window
    #[error("Unknown period: {0}")]
    UnknownPeriod(String),

    /// A rule limit outside the accepted range
    #[error("Invalid limit {limit} for period {period}: limits must be positive")]
    InvalidLimit {
        /// Period the limit was given for
        period: String,
        /// The rejected value
        limit: i64,
    },

    /// The client has no rules configured
    #[error("No limits configured for client {0}")]
    EmptyConfig(String),

    /// A procedure reply or stored value did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Counter store failures, passed through untouched
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error rejects a rule before the store is touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TollgateError::UnknownPeriod(_) | TollgateError::InvalidLimit { .. }
        )
    }
}

/// Errors raised by a counter store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis transport or command failure
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// A key holds a value of the wrong type for the command
    #[error("WRONGTYPE operation against key {0}")]
    WrongType(String),

    /// A stored value is not an integer
    #[error("value at key {0} is not an integer")]
    NotInteger(String),

    /// A procedure was invoked with malformed keys or arguments
    #[error("ERR script error: {0}")]
    Script(String),
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::Store(StoreError::Redis(err))
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
