//! Transaction Dispatcher
//!
//! Entry point for parsing. Each transaction is checked against the dedup
//! cache, classified by its declared protocol markers and routed to the field
//! parsers that build its payload.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::cache::{CacheConfig, DedupCache};
use crate::codec::{map_pairs, normalize_timestamp, protocol_segments, timestamp_from_epoch, MarkerKind};
use crate::content::{extract_author, extract_content, extract_tags, find_field, CONTENT_KEY};
use crate::error::ParseError;
use crate::parsers::{
    is_lock_transaction, is_vote_transaction, FieldParser, LockParser, MediaParser, ParseInput,
    VoteParser,
};
use crate::protocol::{DeclaredProtocol, DeclaredType};
use crate::types::{
    ContentPayload, FieldWarning, ParsedTransaction, Payload, RawTransaction, UnknownPayload,
};

/// Key holding the author-supplied creation time
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Result of processing one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// First sighting, fully parsed
    Parsed(ParsedTransaction),
    /// Already processed
    Skipped,
}

impl ProcessOutcome {
    pub fn parsed(self) -> Option<ParsedTransaction> {
        match self {
            ProcessOutcome::Parsed(parsed) => Some(parsed),
            ProcessOutcome::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ProcessOutcome::Skipped)
    }
}

/// Running counters kept by the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    parsed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    degraded: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    pub parsed: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Parsed records carrying at least one warning
    pub degraded: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            parsed: self.parsed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Dedup-aware transaction parser
#[derive(Debug)]
pub struct Dispatcher {
    cache: Mutex<DedupCache>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            cache: Mutex::new(DedupCache::new(config)),
            stats: DispatcherStats::default(),
        }
    }

    /// Parse a transaction unless it has already been seen
    ///
    /// The id is recorded as seen before parsing starts, so a transaction that
    /// fails is not retried on redelivery.
    ///
    /// # Arguments
    /// * `raw` - The transaction as delivered upstream
    ///
    /// # Returns
    /// `Parsed` on first sighting, `Skipped` for a known id, or `EmptyPayload`
    /// when there is nothing to parse
    pub fn process(&self, raw: &RawTransaction) -> Result<ProcessOutcome, ParseError> {
        let first_sighting = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_insert(&raw.txid);

        if let Err(e) = first_sighting {
            debug!(txid = %raw.txid, reason = %e, "Skipping transaction");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(ProcessOutcome::Skipped);
        }

        match parse_transaction(raw) {
            Ok(parsed) => {
                self.stats.parsed.fetch_add(1, Ordering::Relaxed);
                if parsed.is_degraded() {
                    self.stats.degraded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ProcessOutcome::Parsed(parsed))
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> DispatcherSnapshot {
        self.stats.snapshot()
    }

    /// Number of ids currently remembered
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn has_seen(&self, txid: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(txid)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn parse_transaction(raw: &RawTransaction) -> Result<ParsedTransaction, ParseError> {
    let mut warnings = Vec::new();

    // raw-output recovery is dropped, the pairs are still parsed
    let outputs = raw.decode_outputs().unwrap_or_else(|e| {
        warn!(txid = %raw.txid, error = %e, "Ignoring undecodable outputs");
        warnings.push(FieldWarning::new("outputs", "", e.to_string()));
        Vec::new()
    });

    let segments = protocol_segments(&outputs);
    if raw.pairs.is_empty() && segments.is_empty() {
        return Err(ParseError::EmptyPayload(raw.txid.clone()));
    }

    let pairs: Cow<'_, [(String, String)]> = if raw.pairs.is_empty() {
        Cow::Owned(
            segments
                .iter()
                .filter(|segment| segment.kind == MarkerKind::Map)
                .flat_map(map_pairs)
                .collect(),
        )
    } else {
        Cow::Borrowed(&raw.pairs)
    };

    let input = ParseInput::new(&pairs, &outputs).with_block_height(raw.block_height);
    let declared = DeclaredProtocol::from_pairs(&pairs);

    let payload = match declared.variant() {
        Ok(variant) => {
            let payload = classify(&declared, &input, &raw.pairs, &mut warnings);
            debug!(txid = %raw.txid, app = variant.name(), kind = %payload.kind(), "Classified transaction");
            payload
        }
        Err(e) => {
            debug!(txid = %raw.txid, reason = %e, "Unrecognized protocol");
            Payload::Unknown(UnknownPayload {
                content: extract_content(&raw.pairs, &outputs),
                author_address: extract_author(&pairs),
                tags: extract_tags(&pairs),
                lock: is_lock_transaction(&pairs).then(|| LockParser.parse(&input, &mut warnings)),
            })
        }
    };

    let media = MediaParser.parse(&input, &mut warnings);

    let created_at = find_field(&pairs, TIMESTAMP_KEY).and_then(|value| {
        let normalized = normalize_timestamp(value);
        if normalized.is_none() {
            warn!(txid = %raw.txid, value, "Ignoring unparseable timestamp");
            warnings.push(FieldWarning::new(TIMESTAMP_KEY, value, "unrecognized timestamp format"));
        }
        normalized
    });

    Ok(ParsedTransaction {
        txid: raw.txid.clone(),
        protocol: declared.tag(),
        block_height: raw.block_height,
        block_time: raw.block_time.and_then(timestamp_from_epoch),
        created_at,
        payload,
        media,
        warnings,
    })
}

/// Route a recognized transaction to the parsers for its type
///
/// `delivered_pairs` are the pairs as received; content recovery falls back
/// to the outputs only when they are empty.
fn classify(
    declared: &DeclaredProtocol,
    input: &ParseInput<'_>,
    delivered_pairs: &[(String, String)],
    warnings: &mut Vec<FieldWarning>,
) -> Payload {
    let is_vote =
        declared.declared_type == DeclaredType::Vote || is_vote_transaction(input.pairs, warnings);

    if is_vote {
        let mut vote = VoteParser.parse(input, warnings);
        let lock = LockParser.parse(input, warnings);
        vote.attach_lock(&lock);
        return Payload::Vote(vote);
    }

    if declared.declared_type == DeclaredType::Lock {
        if let Some(text) = extract_content(delivered_pairs, input.outputs) {
            warnings.push(FieldWarning::new(CONTENT_KEY, text, "content is not carried by a lock record"));
        }
        return Payload::Lock(LockParser.parse(input, warnings));
    }

    let has_lock = is_lock_transaction(input.pairs);
    match extract_content(delivered_pairs, input.outputs) {
        None if has_lock => Payload::Lock(LockParser.parse(input, warnings)),
        text => Payload::Content(ContentPayload {
            text: text.unwrap_or_default(),
            author_address: extract_author(input.pairs),
            tags: extract_tags(input.pairs),
            lock: has_lock.then(|| LockParser.parse(input, warnings)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{op_return_script, B_PREFIX, MAP_PREFIX, PROTOCOL_SEPARATOR};
    use crate::types::ContentKind;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

    fn parse(raw: &RawTransaction) -> ParsedTransaction {
        Dispatcher::default()
            .process(raw)
            .unwrap()
            .parsed()
            .unwrap()
    }

    fn lockd(txid: &str) -> RawTransaction {
        RawTransaction::new(txid).with_pair("app", "lockd.app")
    }

    // ==================== Dedup tests ====================

    #[test]
    fn test_process_twice_parses_then_skips() {
        let dispatcher = Dispatcher::default();
        let raw = lockd("tx1").with_pair("content", "hello");

        let first = dispatcher.process(&raw).unwrap();
        let second = dispatcher.process(&raw).unwrap();

        assert!(matches!(first, ProcessOutcome::Parsed(_)));
        assert_eq!(second, ProcessOutcome::Skipped);

        let stats = dispatcher.stats();
        assert_eq!(stats.parsed, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_failed_transaction_is_marked_seen() {
        let dispatcher = Dispatcher::default();
        let raw = RawTransaction::new("empty");

        assert_eq!(
            dispatcher.process(&raw),
            Err(ParseError::EmptyPayload("empty".into()))
        );
        assert!(dispatcher.has_seen("empty"));
        assert_eq!(dispatcher.process(&raw), Ok(ProcessOutcome::Skipped));
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[test]
    fn test_dispatcher_cache_respects_config() {
        let dispatcher = Dispatcher::new(CacheConfig { max_size: 1000, prune_fraction: 0.2 });
        for i in 0..1001 {
            let raw = lockd(&format!("tx{i}")).with_pair("content", "x");
            dispatcher.process(&raw).unwrap();
        }
        assert_eq!(dispatcher.cache_len(), 800);
        assert!(!dispatcher.has_seen("tx0"));
        assert!(dispatcher.has_seen("tx1000"));
    }

    // ==================== Classification tests ====================

    #[test]
    fn test_end_to_end_vote() {
        let raw = lockd("vote1")
            .with_pair("type", "vote")
            .with_pair("question", "Favorite color?")
            .with_pair("option", "Red")
            .with_pair("option", "Blue");

        let parsed = parse(&raw);
        assert_eq!(parsed.content_kind(), ContentKind::Vote);
        assert_eq!(parsed.protocol, "lockd.app");
        assert!(parsed.media.is_none());

        let vote = parsed.payload.as_vote().unwrap();
        assert_eq!(vote.question, "Favorite color?");
        assert_eq!(vote.options.len(), 2);
        assert_eq!((vote.options[0].text.as_str(), vote.options[0].index), ("Red", 0));
        assert_eq!((vote.options[1].text.as_str(), vote.options[1].index), ("Blue", 1));
    }

    #[test]
    fn test_vote_options_carry_lock_fields() {
        let raw = lockd("vote2")
            .with_block(100, 1_700_000_000)
            .with_pair("is_vote", "true")
            .with_pair("content", "Ship it?")
            .with_pair("option", "Yes")
            .with_pair("lock_amount", "1000")
            .with_pair("lock_duration", "10")
            .with_pair("author_address", "1Voter");

        let parsed = parse(&raw);
        let vote = parsed.payload.as_vote().unwrap();
        assert_eq!(vote.question, "Ship it?");
        assert_eq!(vote.options[0].lock_amount, 1000);
        assert_eq!(vote.options[0].lock_duration, 10);
        assert_eq!(vote.options[0].author_address.as_deref(), Some("1Voter"));
    }

    #[test]
    fn test_content_post() {
        let raw = lockd("post1")
            .with_pair("version", "1.0.0")
            .with_pair("content", "gm")
            .with_pair("tag", "bitcoin")
            .with_pair("tags", r#"["bsv","bitcoin"]"#)
            .with_pair("author", "1Poster");

        let parsed = parse(&raw);
        assert_eq!(parsed.protocol, "lockd.app@1.0.0");

        let content = parsed.payload.as_content().unwrap();
        assert_eq!(content.text, "gm");
        assert_eq!(content.tags, vec!["bitcoin", "bsv"]);
        assert_eq!(content.author_address.as_deref(), Some("1Poster"));
        assert!(content.lock.is_none());
        assert!(!parsed.is_degraded());
    }

    #[test]
    fn test_locked_post_keeps_content() {
        let raw = lockd("post2")
            .with_block(800_000, 1_700_000_000)
            .with_pair("content", "locked words")
            .with_pair("is_locked", "true")
            .with_pair("lock_duration", "144");

        let parsed = parse(&raw);
        let content = parsed.payload.as_content().unwrap();
        let lock = content.lock.as_ref().unwrap();
        assert!(lock.locked);
        assert_eq!(lock.unlock_height, Some(800_144));
    }

    #[test]
    fn test_lock_without_content() {
        let raw = lockd("lock1")
            .with_pair("lock_amount", "5000")
            .with_pair("lock_duration", "6");

        let parsed = parse(&raw);
        assert_eq!(parsed.content_kind(), ContentKind::Lock);
        assert_eq!(parsed.payload.as_lock().unwrap().lock_amount, 5000);
    }

    #[test]
    fn test_declared_lock_type() {
        let raw = lockd("lock2").with_pair("type", "lock").with_pair("lock_amount", "10");
        let parsed = parse(&raw);
        assert_eq!(parsed.content_kind(), ContentKind::Lock);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_declared_lock_type_flags_dropped_content() {
        let raw = lockd("lock3").with_pair("type", "lock").with_pair("content", "hello");
        let parsed = parse(&raw);
        assert_eq!(parsed.content_kind(), ContentKind::Lock);
        assert!(parsed.is_degraded());
        assert_eq!(parsed.warnings[0].field, "content");
        assert_eq!(parsed.warnings[0].value, "hello");
    }

    #[test]
    fn test_unknown_protocol_keeps_content() {
        let raw = RawTransaction::new("other")
            .with_pair("app", "twetch")
            .with_pair("content", "hello");

        let parsed = parse(&raw);
        assert_eq!(parsed.content_kind(), ContentKind::Unknown);
        assert_eq!(parsed.protocol, "twetch");
        assert!(matches!(
            &parsed.payload,
            Payload::Unknown(UnknownPayload { content: Some(text), .. }) if text == "hello"
        ));
    }

    #[test]
    fn test_missing_app_is_unknown() {
        let parsed = parse(&RawTransaction::new("anon").with_pair("content", "x"));
        assert_eq!(parsed.content_kind(), ContentKind::Unknown);
        assert_eq!(parsed.protocol, "unknown");
    }

    #[test]
    fn test_app_name_case_insensitive() {
        let raw = RawTransaction::new("tx").with_pair("APP", "LOCKD.APP").with_pair("content", "x");
        assert_eq!(parse(&raw).content_kind(), ContentKind::Content);
    }

    // ==================== Degradation tests ====================

    #[test]
    fn test_degraded_field_keeps_rest_of_record() {
        let dispatcher = Dispatcher::default();
        let raw = lockd("degraded")
            .with_pair("content", "still here")
            .with_pair("tag", "kept")
            .with_pair("lock_duration", "abc");

        let parsed = dispatcher.process(&raw).unwrap().parsed().unwrap();
        let content = parsed.payload.as_content().unwrap();
        assert_eq!(content.text, "still here");
        assert_eq!(content.tags, vec!["kept"]);
        assert_eq!(content.lock.as_ref().unwrap().lock_duration, 0);

        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].field, "lock_duration");
        assert_eq!(parsed.warnings[0].value, "abc");
        assert_eq!(dispatcher.stats().degraded, 1);
    }

    #[test]
    fn test_degraded_field_without_app() {
        let dispatcher = Dispatcher::default();
        let raw = RawTransaction::new("noapp")
            .with_block(100, 1_700_000_000)
            .with_pair("content", "x")
            .with_pair("tag", "kept")
            .with_pair("author", "1Author")
            .with_pair("lock_duration", "abc");

        let parsed = dispatcher.process(&raw).unwrap().parsed().unwrap();
        assert_eq!(parsed.content_kind(), ContentKind::Unknown);
        let Payload::Unknown(unknown) = &parsed.payload else {
            panic!("expected unknown payload, got {:?}", parsed.payload);
        };
        assert_eq!(unknown.content.as_deref(), Some("x"));
        assert_eq!(unknown.tags, vec!["kept"]);
        assert_eq!(unknown.author_address.as_deref(), Some("1Author"));
        let lock = unknown.lock.as_ref().unwrap();
        assert_eq!(lock.lock_duration, 0);
        assert_eq!(lock.unlock_height, None);

        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].field, "lock_duration");
        assert_eq!(dispatcher.stats().degraded, 1);
    }

    #[test]
    fn test_unknown_protocol_without_lock_markers() {
        let parsed = parse(&RawTransaction::new("plain").with_pair("content", "x"));
        let Payload::Unknown(unknown) = &parsed.payload else {
            panic!("expected unknown payload");
        };
        assert!(unknown.lock.is_none());
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_malformed_outputs_only_disable_raw_recovery() {
        let raw = lockd("badhex").with_pair("content", "text").with_output_hex("abc");

        let parsed = parse(&raw);
        assert_eq!(parsed.payload.as_content().unwrap().text, "text");
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].field, "outputs");
    }

    #[test]
    fn test_bad_timestamp_is_warning() {
        let parsed = parse(&lockd("ts").with_pair("content", "x").with_pair("timestamp", "yesterday"));
        assert_eq!(parsed.created_at, None);
        assert_eq!(parsed.warnings[0].field, "timestamp");
    }

    #[test]
    fn test_timestamps_normalized() {
        let parsed = parse(
            &lockd("ts2")
                .with_block(1, 1_700_000_000)
                .with_pair("content", "x")
                .with_pair("timestamp", "2024-01-02T03:04:05Z"),
        );
        assert_eq!(parsed.created_at.unwrap().to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert_eq!(parsed.block_time.unwrap().timestamp(), 1_700_000_000);
    }

    // ==================== Raw output tests ====================

    #[test]
    fn test_empty_payload_error() {
        let raw = RawTransaction::new("nothing").with_output(&[0x00, 0x6a]);
        assert_eq!(
            Dispatcher::default().process(&raw),
            Err(ParseError::EmptyPayload("nothing".into()))
        );
    }

    #[test]
    fn test_pairs_recovered_from_map_outputs() {
        let script = op_return_script(&[
            MAP_PREFIX,
            b"SET",
            b"app",
            b"lockd.app",
            b"type",
            b"post",
            b"content",
            b"from outputs",
            PROTOCOL_SEPARATOR,
            B_PREFIX,
            PNG,
            b"image/png",
        ]);
        let parsed = parse(&RawTransaction::new("raw").with_output(&script));

        assert_eq!(parsed.content_kind(), ContentKind::Content);
        assert_eq!(parsed.payload.as_content().unwrap().text, "from outputs");

        let media = parsed.media.unwrap();
        assert_eq!(media.mime_type, "image/png");
        assert_eq!(media.data, PNG);
    }

    #[test]
    fn test_media_attached_to_content() {
        let raw = lockd("img")
            .with_pair("content", "look")
            .with_output(&op_return_script(&[B_PREFIX, PNG]));

        let parsed = parse(&raw);
        assert_eq!(parsed.content_kind(), ContentKind::Content);
        assert_eq!(parsed.media.unwrap().output_index, 0);
    }
}
