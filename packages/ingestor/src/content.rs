//! Content Extraction
//!
//! Case-insensitive field lookup over key/value pairs and the fallback chain
//! that recovers a transaction's text content.

use crate::codec::{map_pairs, protocol_segments, MarkerKind, ProtocolSegment};

/// Key holding the text of a post
pub const CONTENT_KEY: &str = "content";

/// Keys holding the author address, in priority order
pub const AUTHOR_KEYS: &[&str] = &["author_address", "author"];

/// Value of the first pair whose key matches `key`, ignoring ASCII case
pub fn find_field<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    find_fields(pairs, key).next()
}

/// Values of every pair whose key matches `key`, in encounter order
pub fn find_fields<'a, 'k>(
    pairs: &'a [(String, String)],
    key: &'k str,
) -> impl Iterator<Item = &'a str> + 'k
where
    'a: 'k,
{
    pairs
        .iter()
        .filter(move |(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Returns `true` if a pair with the given key is present
pub fn has_field(pairs: &[(String, String)], key: &str) -> bool {
    find_field(pairs, key).is_some()
}

/// Recover the text content of a transaction
///
/// Recovery order, first match wins:
/// 1. a `content` pair (any casing)
/// 2. when `pairs` is empty, the first MAP `content` field or text B payload
///    found in `raw_outputs`
///
/// # Returns
/// `None` when no content is present; this is not an error.
pub fn extract_content(pairs: &[(String, String)], raw_outputs: &[Vec<u8>]) -> Option<String> {
    if let Some(content) = find_field(pairs, CONTENT_KEY) {
        return Some(content.to_string());
    }

    if !pairs.is_empty() {
        return None;
    }

    protocol_segments(raw_outputs)
        .iter()
        .find_map(segment_text)
}

/// Text carried by a single protocol segment, if any
fn segment_text(segment: &ProtocolSegment<'_>) -> Option<String> {
    match segment.kind {
        MarkerKind::Map => find_field(&map_pairs(segment), CONTENT_KEY).map(str::to_string),
        MarkerKind::B => {
            let declared_type = segment.text_field(1).map(str::trim).unwrap_or_default();
            let is_text = if declared_type.is_empty() {
                segment.fields.first().is_some_and(|data| is_plain_text(data))
            } else {
                is_text_mime(declared_type)
            };
            if !is_text {
                return None;
            }
            segment
                .text_field(0)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        }
    }
}

/// Returns `true` if untyped B data reads as text rather than binary
///
/// The data must be UTF-8 with no control characters besides tab, CR and LF.
pub fn is_plain_text(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok_and(|text| {
        text.chars()
            .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
    })
}

/// Returns `true` for `text/*` MIME types
pub fn is_text_mime(mime: &str) -> bool {
    mime.trim()
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/"))
}

/// Author address, trying each of [`AUTHOR_KEYS`] in turn
pub fn extract_author(pairs: &[(String, String)]) -> Option<String> {
    AUTHOR_KEYS
        .iter()
        .find_map(|key| find_field(pairs, key))
        .map(str::trim)
        .filter(|author| !author.is_empty())
        .map(str::to_string)
}

/// Tags from repeated `tag` pairs and from `tags` pairs
///
/// A `tags` value is read as a JSON string array when it parses as one,
/// otherwise as a comma-separated list. Order is preserved, blanks and
/// duplicates are dropped.
pub fn extract_tags(pairs: &[(String, String)]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    for (key, value) in pairs {
        let key = key.trim();
        let candidates = if key.eq_ignore_ascii_case("tag") {
            vec![value.clone()]
        } else if key.eq_ignore_ascii_case("tags") {
            serde_json::from_str::<Vec<String>>(value).unwrap_or_else(|_| {
                value.split(',').map(str::to_string).collect()
            })
        } else {
            continue;
        };

        for tag in candidates {
            let tag = tag.trim();
            if !tag.is_empty() && !tags.iter().any(|known| known == tag) {
                tags.push(tag.to_string());
            }
        }
    }

    tags
}
