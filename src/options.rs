//! Conversion options
//!
//! One options struct shared by every converter entry point. Field names
//! serialize camelCase because the JS host hands them across the WASM
//! boundary as a plain object.

use serde::{Deserialize, Serialize};

/// Configuration for a single conversion call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvertOptions {
    /// Embed per-event diagnostic fields into the output's metadata channel
    pub debug_metadata: bool,

    /// Embed the verbatim source bytes (percent-encoded, chunked) so the
    /// original document can be recovered from the output
    pub source_metadata: bool,

    /// Hard-fail on an overfull measure instead of clamping it
    pub fail_on_overfull_drop: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            debug_metadata: false,
            source_metadata: false,
            fail_on_overfull_drop: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_wire_names() {
        let opts: ConvertOptions =
            serde_json::from_str(r#"{"failOnOverfullDrop":true}"#).unwrap();
        assert!(opts.fail_on_overfull_drop);
        assert!(!opts.debug_metadata);
        assert!(!opts.source_metadata);
    }
}
