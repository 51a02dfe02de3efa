//! Codec Utilities
//!
//! Hex decoding, key/value splitting, timestamp normalization and a small
//! Bitcoin script tokenizer used to find bitcom protocol segments (MAP and B)
//! inside output scripts.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::ParseError;

/// Bitcom prefix of the Magic Attribute Protocol (key/value pairs)
pub const MAP_PREFIX: &[u8] = b"1PuQa7K62MiKCtssSLKy1kh56WWU7MtUR5";

/// Bitcom prefix of the B protocol (data with a MIME type)
pub const B_PREFIX: &[u8] = b"19HxigV4QyBv3tHpQVcUEQyq1pzZVdoAut";

/// Push separating bitcom protocols within one output
pub const PROTOCOL_SEPARATOR: &[u8] = b"|";

/// Epoch values at or above this magnitude are read as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

/// Parse a hex string to bytes (with or without 0x prefix)
///
/// # Returns
/// The decoded bytes, or `MalformedEncoding` on odd length or non-hex characters
pub fn decode_hex(hex_str: &str) -> Result<Vec<u8>, ParseError> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| ParseError::MalformedEncoding(e.to_string()))
}

/// Split a `key=value` string on the first `=`
///
/// A string without `=` is returned whole as the key with an empty value.
pub fn split_key_value(pair: &str) -> (&str, &str) {
    pair.split_once('=').unwrap_or((pair, ""))
}

/// Normalize a timestamp given as ISO-8601 text or as a numeric epoch
///
/// Numeric values are read as seconds, or as milliseconds when their
/// magnitude is at least 10^12. Returns `None` for anything unparseable.
pub fn normalize_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(epoch) = value.parse::<i64>() {
        return timestamp_from_epoch(epoch);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Convert an epoch value (seconds or milliseconds) to a UTC timestamp
pub fn timestamp_from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD as u64 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}

/// Extract the data pushes of a script, in order
///
/// Non-push opcodes are skipped. `OP_0` yields an empty push.
///
/// # Returns
/// The pushed byte slices, or `MalformedEncoding` if a push runs past the end
/// of the script
pub fn script_pushes(script: &[u8]) -> Result<Vec<&[u8]>, ParseError> {
    let mut pushes = Vec::new();
    let mut cursor = 0;

    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;

        let len = match opcode {
            OP_0 => {
                pushes.push(&script[cursor..cursor]);
                continue;
            }
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => read_push_len(script, &mut cursor, 1)?,
            OP_PUSHDATA2 => read_push_len(script, &mut cursor, 2)?,
            OP_PUSHDATA4 => read_push_len(script, &mut cursor, 4)?,
            _ => continue,
        };

        let end = cursor
            .checked_add(len)
            .filter(|end| *end <= script.len())
            .ok_or_else(|| {
                ParseError::MalformedEncoding(format!(
                    "push of {len} bytes at offset {cursor} overruns script of {} bytes",
                    script.len()
                ))
            })?;
        pushes.push(&script[cursor..end]);
        cursor = end;
    }

    Ok(pushes)
}

/// Read a little-endian push length of `width` bytes
fn read_push_len(script: &[u8], cursor: &mut usize, width: usize) -> Result<usize, ParseError> {
    let bytes = script.get(*cursor..*cursor + width).ok_or_else(|| {
        ParseError::MalformedEncoding(format!("truncated push length at offset {cursor}"))
    })?;
    *cursor += width;
    Ok(bytes
        .iter()
        .rev()
        .fold(0usize, |len, byte| (len << 8) | *byte as usize))
}

/// Bitcom protocol identified by a segment's leading push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Magic Attribute Protocol
    Map,
    /// B protocol
    B,
}

impl MarkerKind {
    /// Match a push against the known bitcom prefixes
    pub fn from_prefix(push: &[u8]) -> Option<Self> {
        match push {
            MAP_PREFIX => Some(MarkerKind::Map),
            B_PREFIX => Some(MarkerKind::B),
            _ => None,
        }
    }
}

/// The pushes following a recognized bitcom prefix, up to the next separator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSegment<'a> {
    pub output_index: usize,
    pub kind: MarkerKind,
    pub fields: Vec<&'a [u8]>,
}

impl<'a> ProtocolSegment<'a> {
    /// Field at `index` decoded as UTF-8, if present and valid
    pub fn text_field(&self, index: usize) -> Option<&'a str> {
        self.fields
            .get(index)
            .and_then(|field| std::str::from_utf8(field).ok())
    }
}

/// Find every recognized protocol segment across the given output scripts
///
/// Outputs whose pushes cannot be tokenized are skipped.
pub fn protocol_segments(outputs: &[Vec<u8>]) -> Vec<ProtocolSegment<'_>> {
    let mut segments = Vec::new();

    for (output_index, script) in outputs.iter().enumerate() {
        let pushes = match script_pushes(script) {
            Ok(pushes) => pushes,
            Err(e) => {
                tracing::trace!(output_index, error = %e, "Skipping untokenizable output");
                continue;
            }
        };

        for chunk in pushes.split(|push| *push == PROTOCOL_SEPARATOR) {
            // OP_FALSE ahead of OP_RETURN tokenizes as an empty push
            let leading = chunk.iter().take_while(|push| push.is_empty()).count();
            let Some((prefix, fields)) = chunk[leading..].split_first() else {
                continue;
            };
            if let Some(kind) = MarkerKind::from_prefix(prefix) {
                segments.push(ProtocolSegment {
                    output_index,
                    kind,
                    fields: fields.to_vec(),
                });
            }
        }
    }

    segments
}

/// Returns `true` if any output carries a recognized protocol segment
pub fn has_protocol_marker(outputs: &[Vec<u8>]) -> bool {
    !protocol_segments(outputs).is_empty()
}

/// Read the `SET key value ...` pairs of a MAP segment
///
/// A trailing key without a value is dropped. Non-UTF-8 bytes are replaced.
pub fn map_pairs(segment: &ProtocolSegment<'_>) -> Vec<(String, String)> {
    if segment.kind != MarkerKind::Map {
        return Vec::new();
    }
    let Some((command, rest)) = segment.fields.split_first() else {
        return Vec::new();
    };
    if !command.eq_ignore_ascii_case(b"SET") {
        return Vec::new();
    }

    rest.chunks_exact(2)
        .map(|kv| {
            (
                String::from_utf8_lossy(kv[0]).into_owned(),
                String::from_utf8_lossy(kv[1]).into_owned(),
            )
        })
        .collect()
}

/// Encode `data` as a single script push
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(data.len() + 5);
    match data.len() {
        0 => script.push(OP_0),
        len @ 1..=0x4b => script.push(len as u8),
        len @ 0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
    script
}

/// Build an `OP_FALSE OP_RETURN` script pushing each item in turn
pub fn op_return_script(items: &[&[u8]]) -> Vec<u8> {
    let mut script = vec![OP_0, 0x6a];
    for item in items {
        script.extend(push_data(item));
    }
    script
}
