//! Parse Errors
//!
//! Error taxonomy shared by the codec, the field parsers and the dispatcher.
//! Only [`ParseError::EmptyPayload`] ever reaches the caller of
//! [`Dispatcher::process`](crate::dispatcher::Dispatcher::process); the other
//! variants are recovered locally.

use thiserror::Error;

/// Errors that can occur while decoding a ledger transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("Invalid value {value:?} for field '{field}': {reason}")]
    InvalidFieldValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unrecognized protocol: {0}")]
    UnrecognizedProtocol(String),

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Transaction {0} carries no key/value pairs and no recognizable output data")]
    EmptyPayload(String),
}

impl ParseError {
    /// Build an `InvalidFieldValue` error
    pub fn invalid_field(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ParseError::InvalidFieldValue {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if processing may continue with a degraded record
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ParseError::EmptyPayload(_))
    }
}
