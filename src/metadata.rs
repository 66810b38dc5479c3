//! Metadata channel conventions
//!
//! Converters park everything that must survive a round trip but has no
//! native slot in the target schema under namespaced field names:
//! `scorebridge:source:N` carries the percent-encoded original document in
//! order-numbered chunks, `scorebridge:diagnostic:N` carries one JSON
//! diagnostic per field, and plain miscellaneous fields keep their original
//! names. In MusicXML these are `<miscellaneous-field>` elements; in MEI
//! they ride `<annot>` elements with the field name in `label`.

use crate::diagnostics::Diagnostic;

/// Field-name prefix for embedded source chunks
pub const SOURCE_FIELD_PREFIX: &str = "scorebridge:source:";

/// Field-name prefix for serialized diagnostics
pub const DIAGNOSTIC_FIELD_PREFIX: &str = "scorebridge:diagnostic:";

/// `annot`-type used when miscellaneous fields ride an MEI document
pub const MEI_ANNOT_TYPE: &str = "scorebridge:misc";

/// Maximum characters per embedded source chunk. Keeps any single text node
/// at a size XML tooling is comfortable with.
const SOURCE_CHUNK_LEN: usize = 2000;

/// Percent-encode raw source bytes and split into numbered chunks.
pub fn encode_source_chunks(source: &[u8]) -> Vec<String> {
    let encoded = urlencoding::encode_binary(source).into_owned();
    let mut chunks = Vec::new();
    let bytes = encoded.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let end = (start + SOURCE_CHUNK_LEN).min(bytes.len());
        // encode_binary output is pure ASCII, safe to slice anywhere
        chunks.push(encoded[start..end].to_string());
        start = end;
    }
    chunks
}

/// Reassemble chunks produced by [`encode_source_chunks`].
///
/// `chunks` must already be in chunk-number order; callers collect the
/// numbered fields and sort by suffix before handing them over.
pub fn decode_source_chunks(chunks: &[String]) -> Vec<u8> {
    let joined: String = chunks.concat();
    urlencoding::decode_binary(joined.as_bytes()).into_owned()
}

/// Serialize a diagnostic for its metadata field.
pub fn diagnostic_field_value(diag: &Diagnostic) -> String {
    // Diagnostic is a plain data struct; serialization cannot fail
    serde_json::to_string(diag).unwrap_or_default()
}

/// Parse a diagnostic back out of a metadata field, if it still parses.
pub fn parse_diagnostic_field(value: &str) -> Option<Diagnostic> {
    serde_json::from_str(value).ok()
}

/// Split a `scorebridge:source:N` field name into its chunk number.
pub fn source_chunk_index(name: &str) -> Option<usize> {
    name.strip_prefix(SOURCE_FIELD_PREFIX)?.parse().ok()
}

/// Per-measure occupancy audit, keyed by part id and measure number.
///
/// Emitted as extra metadata fields when the debug option is on.
pub fn debug_audit_fields(score: &crate::models::Score) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for part in &score.parts {
        let mut state = crate::models::AttributeState::default();
        for measure in &part.measures {
            if let Some(attrs) = &measure.attributes {
                state.apply(attrs);
            }
            let times = crate::rhythm::timing::timeline(&measure.events);
            fields.push((
                format!("scorebridge:debug:{}:{}", part.id, measure.number),
                format!(
                    "events={};occupied={};capacity={}",
                    measure.events.len(),
                    times.occupied,
                    state.measure_capacity()
                ),
            ));
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticAction, DiagnosticKind};

    #[test]
    fn test_source_chunks_round_trip() {
        let source = "<score-partwise>\u{00e9}\u{4e16}</score-partwise>".as_bytes();
        let chunks = encode_source_chunks(source);
        assert!(!chunks.is_empty());
        assert_eq!(decode_source_chunks(&chunks), source);
    }

    #[test]
    fn test_long_source_splits_into_multiple_chunks() {
        let source = vec![b'x'; 5000];
        let chunks = encode_source_chunks(&source);
        assert!(chunks.len() >= 3);
        assert_eq!(decode_source_chunks(&chunks), source);
    }

    #[test]
    fn test_diagnostic_field_round_trip() {
        let d = Diagnostic::new(
            DiagnosticKind::UnsupportedElement,
            DiagnosticAction::Dropped,
            "figured-bass",
        )
        .at_measure(2);
        let value = diagnostic_field_value(&d);
        assert_eq!(parse_diagnostic_field(&value), Some(d));
    }

    #[test]
    fn test_source_chunk_index() {
        assert_eq!(source_chunk_index("scorebridge:source:7"), Some(7));
        assert_eq!(source_chunk_index("scorebridge:diagnostic:7"), None);
        assert_eq!(source_chunk_index("scorebridge:source:x"), None);
    }
}
