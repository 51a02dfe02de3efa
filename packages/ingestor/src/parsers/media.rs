//! Media Parser
//!
//! Finds binary content embedded with the B protocol and classifies its MIME
//! type. B segments carrying text are content, not media, and are skipped.

use crate::codec::{protocol_segments, MarkerKind, ProtocolSegment};
use crate::content::{is_plain_text, is_text_mime};
use crate::types::{FieldWarning, MediaDescriptor};

use super::{FieldParser, ParseInput};

/// MIME type reported for binary data with no recognizable signature
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A byte signature: every `(offset, bytes)` part must match
struct Signature {
    parts: &'static [(usize, &'static [u8])],
    mime: &'static str,
}

/// Magic numbers of common media formats
const SIGNATURES: &[Signature] = &[
    Signature { parts: &[(0, b"\x89PNG\r\n\x1a\n")], mime: "image/png" },
    Signature { parts: &[(0, b"\xff\xd8\xff")], mime: "image/jpeg" },
    Signature { parts: &[(0, b"GIF87a")], mime: "image/gif" },
    Signature { parts: &[(0, b"GIF89a")], mime: "image/gif" },
    Signature { parts: &[(0, b"RIFF"), (8, b"WEBP")], mime: "image/webp" },
    Signature { parts: &[(4, b"ftypavif")], mime: "image/avif" },
    Signature { parts: &[(0, b"BM")], mime: "image/bmp" },
    Signature { parts: &[(0, b"\x00\x00\x01\x00")], mime: "image/x-icon" },
    Signature { parts: &[(0, b"%PDF-")], mime: "application/pdf" },
    Signature { parts: &[(0, b"<svg")], mime: "image/svg+xml" },
];

/// Classify data by its leading bytes
///
/// # Returns
/// `Some(mime)` for a known signature, `None` otherwise
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    SIGNATURES
        .iter()
        .find(|signature| {
            signature.parts.iter().all(|(offset, magic)| {
                data.get(*offset..offset + magic.len()) == Some(*magic)
            })
        })
        .map(|signature| signature.mime)
}

/// Media parser over B protocol segments
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaParser;

impl FieldParser for MediaParser {
    type Output = Option<MediaDescriptor>;

    fn parse(&self, input: &ParseInput<'_>, _warnings: &mut Vec<FieldWarning>) -> Option<MediaDescriptor> {
        parse_media(input.outputs)
    }
}

/// Find the first media payload in the output scripts
///
/// # Arguments
/// * `raw_outputs` - Decoded output scripts
///
/// # Returns
/// The media descriptor, or `None` when no output carries binary B data
pub fn parse_media(raw_outputs: &[Vec<u8>]) -> Option<MediaDescriptor> {
    protocol_segments(raw_outputs)
        .iter()
        .filter(|segment| segment.kind == MarkerKind::B)
        .find_map(media_from_segment)
}

fn media_from_segment(segment: &ProtocolSegment<'_>) -> Option<MediaDescriptor> {
    let data = segment.fields.first().filter(|data| !data.is_empty())?;

    let declared = segment
        .text_field(1)
        .map(str::trim)
        .filter(|mime| !mime.is_empty());

    let mime_type = match declared {
        Some(mime) if is_text_mime(mime) => return None,
        Some(mime) => mime.to_string(),
        // untyped text belongs to the content extractor, whatever its first bytes
        None if is_plain_text(data) => return None,
        None => sniff_mime(data).unwrap_or(OCTET_STREAM).to_string(),
    };

    let optional_text = |index| {
        segment
            .text_field(index)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    Some(MediaDescriptor {
        data: data.to_vec(),
        mime_type,
        output_index: segment.output_index,
        encoding: optional_text(2),
        filename: optional_text(3),
    })
}
