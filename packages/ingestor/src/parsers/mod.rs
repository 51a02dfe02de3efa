//! Protocol Field Parsers
//!
//! Stateless parsers for the lock, vote and media fields of a transaction.
//! Each one reads from a shared [`ParseInput`] and records any degraded field
//! as a [`FieldWarning`] instead of failing.

pub mod lock;
pub mod media;
pub mod vote;

pub use lock::{is_lock_transaction, parse_lock, LockParser};
pub use media::{parse_media, sniff_mime, MediaParser};
pub use vote::{is_vote_transaction, parse_vote, VoteParser};

use crate::error::ParseError;
use crate::types::FieldWarning;

/// Everything a field parser may read from one transaction
#[derive(Debug, Clone, Copy)]
pub struct ParseInput<'a> {
    pub pairs: &'a [(String, String)],
    /// Decoded output scripts
    pub outputs: &'a [Vec<u8>],
    pub block_height: Option<u64>,
}

impl<'a> ParseInput<'a> {
    pub fn new(pairs: &'a [(String, String)], outputs: &'a [Vec<u8>]) -> Self {
        Self {
            pairs,
            outputs,
            block_height: None,
        }
    }

    pub fn with_block_height(mut self, block_height: Option<u64>) -> Self {
        self.block_height = block_height;
        self
    }
}

/// A parser for one family of protocol fields
pub trait FieldParser {
    type Output;

    /// Parse the fields, substituting defaults for values that fail coercion
    fn parse(&self, input: &ParseInput<'_>, warnings: &mut Vec<FieldWarning>) -> Self::Output;
}

/// Coerce a boolean-ish value: `true`/`false`, ignoring case
pub(crate) fn parse_bool(field: &str, value: &str) -> Result<bool, ParseError> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("true") => Ok(true),
        v if v.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(ParseError::invalid_field(field, value, "expected true or false")),
    }
}

/// Coerce a non-negative integer value
pub(crate) fn parse_u64(field: &str, value: &str) -> Result<u64, ParseError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ParseError::invalid_field(field, value, "expected a non-negative integer"))
}

/// Unwrap a coerced value or record a warning and fall back to `default`
pub(crate) fn or_degrade<T>(
    result: Result<T, ParseError>,
    default: T,
    warnings: &mut Vec<FieldWarning>,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Degrading field to default");
            warnings.push(FieldWarning::from(e));
            default
        }
    }
}
