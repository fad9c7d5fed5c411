//! Transfer events.
//!
//! One JSON object per line. The `type` field selects the variant:
//!
//! ```text
//! {"type":"log","message":"pulling alpine:latest"}
//! {"type":"size","size":7340032}
//! {"type":"url","message":"http://10.0.0.5:30000/alpine_latest.tar"}
//! {"type":"error","message":"pull failed"}
//! ```
//!
//! Decoding is tolerant: a line that is blank, not JSON, or names an unknown
//! `type` decodes to [`LineDecode::Skip`] instead of an error, so newer
//! exporters can add event kinds without breaking older importers.

use serde::{Deserialize, Serialize};

/// A single event on the download stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferEvent {
    /// Progress or diagnostic text for the operator.
    Log { message: String },
    /// The artifact is ready for download at this URL.
    #[serde(rename = "url")]
    UrlReady {
        #[serde(rename = "message")]
        url: String,
    },
    /// Exact size in bytes of the artifact behind the advertised URL.
    #[serde(rename = "size")]
    SizeKnown { size: u64 },
    /// The export failed. Always the last event of its stream.
    Error { message: String },
}

impl TransferEvent {
    /// Create a log event.
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    /// Create an error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Create a url event.
    pub fn url_ready(url: impl Into<String>) -> Self {
        Self::UrlReady { url: url.into() }
    }

    /// Create a size event.
    pub fn size_known(size: u64) -> Self {
        Self::SizeKnown { size }
    }

    /// Wire name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::UrlReady { .. } => "url",
            Self::SizeKnown { .. } => "size",
            Self::Error { .. } => "error",
        }
    }

    /// True for the event that ends a failed stream.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Why a line was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty or whitespace-only line.
    Blank,
    /// Not a JSON object, or a known `type` with missing/invalid fields.
    Malformed,
    /// Valid JSON object whose `type` this version does not know.
    UnknownType,
}

/// Result of decoding one line of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDecode {
    Event(TransferEvent),
    Skip(SkipReason),
}

impl LineDecode {
    /// The decoded event, if any.
    pub fn into_event(self) -> Option<TransferEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Skip(_) => None,
        }
    }
}

const KNOWN_TYPES: &[&str] = &["log", "url", "size", "error"];

/// Encode an event as a single line, including the trailing newline.
pub fn encode_event(event: &TransferEvent) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line of the stream. Never fails; see [`SkipReason`].
pub fn decode_line(line: &str) -> LineDecode {
    let line = line.trim();
    if line.is_empty() {
        return LineDecode::Skip(SkipReason::Blank);
    }

    match serde_json::from_str::<TransferEvent>(line) {
        Ok(event) => LineDecode::Event(event),
        Err(_) => {
            // Distinguish "newer exporter" from "garbage" for diagnostics only.
            let kind = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));
            match kind {
                Some(kind) if !KNOWN_TYPES.contains(&kind.as_str()) => {
                    LineDecode::Skip(SkipReason::UnknownType)
                }
                _ => LineDecode::Skip(SkipReason::Malformed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_event_has_no_message_field() {
        let line = encode_event(&TransferEvent::size_known(1000)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();

        assert_eq!(value["type"], "size");
        assert_eq!(value["size"], 1000);
        assert!(value.get("message").is_none());
        assert_eq!(*line.last().unwrap(), b'\n');
    }

    #[test]
    fn test_url_event_uses_message_field() {
        let line = encode_event(&TransferEvent::url_ready("http://h:30000/a.tar")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();

        assert_eq!(value["type"], "url");
        assert_eq!(value["message"], "http://h:30000/a.tar");
        assert!(value.get("size").is_none());
    }

    #[test]
    fn test_encoded_event_is_single_line() {
        let line = encode_event(&TransferEvent::log("pull failed\nexit status 1\n")).unwrap();
        let newlines = line.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_decode_size_with_empty_message() {
        // Older exporters always wrote a message field, even for size.
        let decoded = decode_line(r#"{"type":"size","message":"","size":42}"#);
        assert_eq!(decoded, LineDecode::Event(TransferEvent::size_known(42)));
    }

    #[test]
    fn test_decode_error() {
        let decoded = decode_line(r#"{"type":"error","message":"save failed"}"#);
        assert_eq!(decoded, LineDecode::Event(TransferEvent::error("save failed")));
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let decoded = decode_line(r#"{"type":"progress","percent":50}"#);
        assert_eq!(decoded, LineDecode::Skip(SkipReason::UnknownType));
    }

    #[test]
    fn test_garbage_is_skipped() {
        assert_eq!(decode_line("not json"), LineDecode::Skip(SkipReason::Malformed));
        assert_eq!(decode_line("   "), LineDecode::Skip(SkipReason::Blank));
        assert_eq!(
            decode_line(r#"{"type":"size","size":-1}"#),
            LineDecode::Skip(SkipReason::Malformed)
        );
        assert_eq!(
            decode_line(r#"{"type":"url"}"#),
            LineDecode::Skip(SkipReason::Malformed)
        );
    }

    #[test]
    fn test_kind_matches_wire_name() {
        for event in [
            TransferEvent::log("x"),
            TransferEvent::url_ready("u"),
            TransferEvent::size_known(1),
            TransferEvent::error("e"),
        ] {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }
}
