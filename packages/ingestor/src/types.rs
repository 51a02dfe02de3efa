//! Transaction Types
//!
//! The raw input delivered by the upstream stream and the typed record the
//! dispatcher produces from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::decode_hex;
use crate::error::ParseError;

/// A ledger transaction as delivered by the upstream stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTransaction {
    /// Transaction id
    pub txid: String,
    /// Block height, `None` while unconfirmed
    pub block_height: Option<u64>,
    /// Block time in unix seconds, `None` while unconfirmed
    pub block_time: Option<i64>,
    /// Output scripts, hex-encoded
    pub outputs: Vec<String>,
    /// Embedded key/value pairs in the order they were extracted
    pub pairs: Vec<(String, String)>,
}

impl RawTransaction {
    /// Create an empty unconfirmed transaction
    pub fn new(txid: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            ..Default::default()
        }
    }

    pub fn with_block(mut self, height: u64, time: i64) -> Self {
        self.block_height = Some(height);
        self.block_time = Some(time);
        self
    }

    pub fn with_pair(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Append an output script given as raw bytes
    pub fn with_output(mut self, script: &[u8]) -> Self {
        self.outputs.push(hex::encode(script));
        self
    }

    /// Append an output script given as hex text, stored verbatim
    pub fn with_output_hex(mut self, script_hex: impl Into<String>) -> Self {
        self.outputs.push(script_hex.into());
        self
    }

    /// Decode every output script.
    ///
    /// Fails as a whole on the first undecodable output.
    pub fn decode_outputs(&self) -> Result<Vec<Vec<u8>>, ParseError> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                decode_hex(output).map_err(|e| match e {
                    ParseError::MalformedEncoding(reason) => {
                        ParseError::MalformedEncoding(format!("output {index}: {reason}"))
                    }
                    other => other,
                })
            })
            .collect()
    }
}

/// Classification of a parsed transaction's primary payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Content,
    Vote,
    Lock,
    Unknown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Content => "content",
            ContentKind::Vote => "vote",
            ContentKind::Lock => "lock",
            ContentKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock/commitment metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPayload {
    pub author_address: Option<String>,
    /// Locked amount in satoshis
    pub lock_amount: u64,
    /// Lock duration in blocks
    pub lock_duration: u64,
    pub unlock_height: Option<u64>,
    pub locked: bool,
}

/// A text post
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    pub text: String,
    pub author_address: Option<String>,
    pub tags: Vec<String>,
    /// Lock fields carried by a locked post
    pub lock: Option<LockPayload>,
}

/// One answer of a vote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOption {
    pub text: String,
    /// Position in encounter order, starting at 0
    pub index: u32,
    pub author_address: Option<String>,
    pub lock_amount: u64,
    pub lock_duration: u64,
}

/// A vote question and its options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub question: String,
    pub options: Vec<VoteOption>,
}

impl VotePayload {
    /// Copy the transaction's lock fields onto every option
    pub fn attach_lock(&mut self, lock: &LockPayload) {
        for option in &mut self.options {
            option.lock_amount = lock.lock_amount;
            option.lock_duration = lock.lock_duration;
            if option.author_address.is_none() {
                option.author_address = lock.author_address.clone();
            }
        }
    }
}

/// Content recovered from a transaction whose protocol is not recognized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownPayload {
    pub content: Option<String>,
    pub author_address: Option<String>,
    pub tags: Vec<String>,
    pub lock: Option<LockPayload>,
}

/// The payload of a parsed transaction; its variant defines the content kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Content(ContentPayload),
    Vote(VotePayload),
    Lock(LockPayload),
    Unknown(UnknownPayload),
}

impl Payload {
    pub fn kind(&self) -> ContentKind {
        match self {
            Payload::Content(_) => ContentKind::Content,
            Payload::Vote(_) => ContentKind::Vote,
            Payload::Lock(_) => ContentKind::Lock,
            Payload::Unknown(_) => ContentKind::Unknown,
        }
    }

    pub fn as_content(&self) -> Option<&ContentPayload> {
        match self {
            Payload::Content(content) => Some(content),
            _ => None,
        }
    }

    pub fn as_vote(&self) -> Option<&VotePayload> {
        match self {
            Payload::Vote(vote) => Some(vote),
            _ => None,
        }
    }

    pub fn as_lock(&self) -> Option<&LockPayload> {
        match self {
            Payload::Lock(lock) => Some(lock),
            _ => None,
        }
    }
}

/// Binary content embedded in an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub mime_type: String,
    /// Index of the output the bytes were recovered from
    pub output_index: usize,
    pub encoding: Option<String>,
    pub filename: Option<String>,
}

/// A field whose raw value failed coercion and was replaced by its default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWarning {
    pub field: String,
    pub value: String,
    pub reason: String,
}

impl FieldWarning {
    pub fn new(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Convert back into the error it was recovered from
    pub fn into_error(self) -> ParseError {
        ParseError::InvalidFieldValue {
            field: self.field,
            value: self.value,
            reason: self.reason,
        }
    }
}

impl From<ParseError> for FieldWarning {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidFieldValue { field, value, reason } => Self { field, value, reason },
            other => Self::new("transaction", "", other.to_string()),
        }
    }
}

impl std::fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:?}: {}", self.field, self.value, self.reason)
    }
}

/// The typed record produced for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub txid: String,
    /// Declared application, with `@version` when one was declared
    pub protocol: String,
    pub block_height: Option<u64>,
    pub block_time: Option<DateTime<Utc>>,
    /// Author-supplied `timestamp` field
    pub created_at: Option<DateTime<Utc>>,
    pub payload: Payload,
    pub media: Option<MediaDescriptor>,
    pub warnings: Vec<FieldWarning>,
}

impl ParsedTransaction {
    pub fn content_kind(&self) -> ContentKind {
        self.payload.kind()
    }

    /// Returns `true` if any field was replaced by its default
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}
