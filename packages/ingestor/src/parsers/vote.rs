//! Vote Parser
//!
//! A vote is a question followed by a variable-length option list encoded as
//! repeated `option` pairs. Options keep their encounter order.

use crate::content::{extract_author, extract_content, find_field, has_field};
use crate::types::{FieldWarning, VoteOption, VotePayload};

use super::{or_degrade, parse_bool, FieldParser, ParseInput};

pub const QUESTION_KEY: &str = "question";
pub const OPTION_KEY: &str = "option";
/// Older producers sent the whole option list as one JSON array
pub const OPTIONS_KEY: &str = "options";
pub const VOTE_FLAG_KEYS: &[&str] = &["is_vote", "vote"];

/// Returns `true` if a vote flag is true or a question is present
///
/// Uncoercible flag values are recorded as warnings and read as `false`.
pub fn is_vote_transaction(pairs: &[(String, String)], warnings: &mut Vec<FieldWarning>) -> bool {
    if has_field(pairs, QUESTION_KEY) {
        return true;
    }
    VOTE_FLAG_KEYS.iter().any(|key| {
        find_field(pairs, key)
            .map(|value| or_degrade(parse_bool(key, value), false, warnings))
            .unwrap_or(false)
    })
}

/// Vote question and option parser
#[derive(Debug, Clone, Copy, Default)]
pub struct VoteParser;

impl FieldParser for VoteParser {
    type Output = VotePayload;

    fn parse(&self, input: &ParseInput<'_>, warnings: &mut Vec<FieldWarning>) -> VotePayload {
        let question = find_field(input.pairs, QUESTION_KEY)
            .map(str::to_string)
            .or_else(|| extract_content(input.pairs, input.outputs))
            .map(|question| question.trim().to_string())
            .unwrap_or_default();

        let author = extract_author(input.pairs);
        let mut options = Vec::new();

        for (key, value) in input.pairs {
            let key = key.trim();
            let texts = if key.eq_ignore_ascii_case(OPTION_KEY) {
                vec![value.clone()]
            } else if key.eq_ignore_ascii_case(OPTIONS_KEY) {
                match serde_json::from_str::<Vec<String>>(value) {
                    Ok(texts) => texts,
                    Err(e) => {
                        warnings.push(FieldWarning::new(OPTIONS_KEY, value.as_str(), e.to_string()));
                        continue;
                    }
                }
            } else {
                continue;
            };

            for text in texts {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                options.push(VoteOption {
                    text: text.to_string(),
                    index: options.len() as u32,
                    author_address: author.clone(),
                    lock_amount: 0,
                    lock_duration: 0,
                });
            }
        }

        VotePayload { question, options }
    }
}

/// Parse a vote's question and options
///
/// # Arguments
/// * `pairs` - The transaction's key/value pairs
/// * `raw_outputs` - Decoded output scripts, used when the question falls
///   back to the content field
///
/// # Returns
/// The vote payload; zero options is valid
pub fn parse_vote(pairs: &[(String, String)], raw_outputs: &[Vec<u8>]) -> VotePayload {
    let mut warnings = Vec::new();
    VoteParser.parse(&ParseInput::new(pairs, raw_outputs), &mut warnings)
}
