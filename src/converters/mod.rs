//! Format converters
//!
//! Each converter maps one external schema onto the pivot score and back.
//! MusicXML itself is handled by [`crate::musicxml`]; the modules here
//! cover the non-pivot formats.

pub mod mei;
pub mod musescore;

use crate::models::{AttributeState, Part, Score};
use crate::rhythm::timing;

/// Attribute state in effect at each of a part's measures
pub(crate) fn fold_states(part: &Part) -> Vec<AttributeState> {
    let mut state = AttributeState::default();
    part.measures
        .iter()
        .map(|m| {
            if let Some(attrs) = &m.attributes {
                state.apply(attrs);
            }
            state.clone()
        })
        .collect()
}

/// Global staff numbering across parts
pub(crate) struct StaffLayout {
    /// (first global staff minus one, staff count) per part
    parts: Vec<(u32, u32)>,
}

impl StaffLayout {
    pub(crate) fn build(score: &Score) -> StaffLayout {
        let mut parts = Vec::new();
        let mut offset = 0;
        for part in &score.parts {
            let mut staves = 1u32;
            for measure in &part.measures {
                if let Some(s) = measure.attributes.as_ref().and_then(|a| a.staves) {
                    staves = staves.max(s);
                }
                for staff in timing::measure_staves(&measure.events) {
                    staves = staves.max(staff);
                }
            }
            parts.push((offset, staves));
            offset += staves;
        }
        StaffLayout { parts }
    }

    pub(crate) fn global(&self, part: usize, local: u32) -> u32 {
        self.parts[part].0 + local
    }

    pub(crate) fn staves(&self, part: usize) -> u32 {
        self.parts[part].1
    }
}

/// MusicXML harmony kinds and the chord-symbol suffixes the other formats
/// spell them with
const HARMONY_KINDS: &[(&str, &str)] = &[
    ("major", ""),
    ("minor", "m"),
    ("dominant", "7"),
    ("major-seventh", "maj7"),
    ("minor-seventh", "m7"),
    ("diminished", "dim"),
    ("augmented", "aug"),
    ("half-diminished", "m7b5"),
    ("suspended-second", "sus2"),
    ("suspended-fourth", "sus4"),
    ("major-sixth", "6"),
    ("minor-sixth", "m6"),
    ("dominant-ninth", "9"),
];

/// Suffix for a harmony kind; unknown kinds pass through as written
pub(crate) fn kind_to_suffix(kind: &str) -> &str {
    HARMONY_KINDS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, s)| *s)
        .unwrap_or(kind)
}

/// Harmony kind for a chord-symbol suffix; unknown suffixes pass through
pub(crate) fn suffix_to_kind(suffix: &str) -> String {
    HARMONY_KINDS
        .iter()
        .find(|(_, s)| *s == suffix)
        .map(|(k, _)| k.to_string())
        .unwrap_or_else(|| suffix.to_string())
}
