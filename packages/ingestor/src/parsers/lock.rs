//! Lock-Protocol Parser
//!
//! Reads the commitment fields (`is_locked`, `lock_amount`, `lock_duration`)
//! and derives the unlock height from the confirming block.

use crate::content::{extract_author, find_field, has_field};
use crate::error::ParseError;
use crate::types::{FieldWarning, LockPayload};

use super::{or_degrade, parse_bool, parse_u64, FieldParser, ParseInput};

pub const IS_LOCKED_KEY: &str = "is_locked";
pub const LOCK_AMOUNT_KEY: &str = "lock_amount";
pub const LOCK_DURATION_KEY: &str = "lock_duration";

/// Keys whose presence marks a transaction as carrying a commitment
pub const LOCK_MARKER_KEYS: &[&str] = &[IS_LOCKED_KEY, LOCK_AMOUNT_KEY, LOCK_DURATION_KEY];

/// Returns `true` if any lock marker key is present
pub fn is_lock_transaction(pairs: &[(String, String)]) -> bool {
    LOCK_MARKER_KEYS.iter().any(|key| has_field(pairs, key))
}

/// Degrading lock parser
#[derive(Debug, Clone, Copy, Default)]
pub struct LockParser;

impl FieldParser for LockParser {
    type Output = LockPayload;

    fn parse(&self, input: &ParseInput<'_>, warnings: &mut Vec<FieldWarning>) -> LockPayload {
        let pairs = input.pairs;

        let locked = find_field(pairs, IS_LOCKED_KEY)
            .map(|value| or_degrade(parse_bool(IS_LOCKED_KEY, value), false, warnings))
            .unwrap_or(false);

        let lock_amount = find_field(pairs, LOCK_AMOUNT_KEY)
            .map(|value| or_degrade(parse_u64(LOCK_AMOUNT_KEY, value), 0, warnings))
            .unwrap_or(0);

        // a degraded duration does not count as available for the unlock height
        let duration = find_field(pairs, LOCK_DURATION_KEY).and_then(|value| {
            or_degrade(parse_u64(LOCK_DURATION_KEY, value).map(Some), None, warnings)
        });

        let unlock_height = match (input.block_height, duration) {
            (Some(height), Some(duration)) => Some(height.saturating_add(duration)),
            _ => None,
        };

        LockPayload {
            author_address: extract_author(pairs),
            lock_amount,
            lock_duration: duration.unwrap_or(0),
            unlock_height,
            locked,
        }
    }
}

/// Parse the lock fields, failing on the first value that cannot be coerced
///
/// # Arguments
/// * `pairs` - The transaction's key/value pairs
/// * `block_height` - Height of the confirming block, if confirmed
///
/// # Returns
/// The lock payload with documented defaults for absent fields, or
/// `InvalidFieldValue` for a present field with an uncoercible value
pub fn parse_lock(
    pairs: &[(String, String)],
    block_height: Option<u64>,
) -> Result<LockPayload, ParseError> {
    let mut warnings = Vec::new();
    let input = ParseInput::new(pairs, &[]).with_block_height(block_height);
    let payload = LockParser.parse(&input, &mut warnings);

    match warnings.into_iter().next() {
        Some(warning) => Err(warning.into_error()),
        None => Ok(payload),
    }
}
