//! Score structure: parts, measures, running attributes
//!
//! The score is the pivot every converter reads from and writes to. Its
//! shape mirrors partwise MusicXML: parts own measures, measures own an
//! ordered event list, and attribute changes ride inside the measure that
//! introduces them.

use serde::{Deserialize, Serialize};

use super::event::MeasureEvent;
use super::Ticks;
use crate::diagnostics::Diagnostic;

/// Meter fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub beats: u32,
    pub beat_type: u32,
}

impl TimeSignature {
    /// Beat type must be a power of two no larger than 128
    pub fn new(beats: u32, beat_type: u32) -> Option<TimeSignature> {
        if beats == 0 || beat_type == 0 || beat_type > 128 || !beat_type.is_power_of_two() {
            return None;
        }
        Some(TimeSignature { beats, beat_type })
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        TimeSignature {
            beats: 4,
            beat_type: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClefSign {
    G,
    F,
    C,
    Percussion,
}

impl ClefSign {
    pub fn name(self) -> &'static str {
        match self {
            ClefSign::G => "G",
            ClefSign::F => "F",
            ClefSign::C => "C",
            ClefSign::Percussion => "percussion",
        }
    }

    pub fn from_name(s: &str) -> Option<ClefSign> {
        match s {
            "G" => Some(ClefSign::G),
            "F" => Some(ClefSign::F),
            "C" => Some(ClefSign::C),
            "percussion" => Some(ClefSign::Percussion),
            _ => None,
        }
    }

    /// Staff line the sign usually sits on
    pub fn default_line(self) -> u32 {
        match self {
            ClefSign::G => 2,
            ClefSign::F => 4,
            ClefSign::C => 3,
            ClefSign::Percussion => 2,
        }
    }
}

/// Clef for one staff of a part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clef {
    /// Staff the clef applies to, 1-based
    pub staff: u32,
    pub sign: ClefSign,
    pub line: Option<u32>,
    /// Octave transposition, -1 for the vocal tenor G clef
    #[serde(default)]
    pub octave_change: i32,
}

/// Attribute changes introduced by a measure
///
/// Every field is optional; a measure only carries the attributes it
/// changes. [`AttributeState`] folds them into the running state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    pub divisions: Option<i64>,
    pub key_fifths: Option<i32>,
    pub time: Option<TimeSignature>,
    pub staves: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clefs: Vec<Clef>,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        self.divisions.is_none()
            && self.key_fifths.is_none()
            && self.time.is_none()
            && self.staves.is_none()
            && self.clefs.is_empty()
    }
}

/// Running attribute values while walking a part's measures
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeState {
    pub divisions: i64,
    pub key_fifths: i32,
    pub time: TimeSignature,
    pub staves: u32,
}

impl Default for AttributeState {
    fn default() -> Self {
        AttributeState {
            divisions: 1,
            key_fifths: 0,
            time: TimeSignature::default(),
            staves: 1,
        }
    }
}

impl AttributeState {
    /// Fold a measure's attribute changes into the running state
    pub fn apply(&mut self, attrs: &Attributes) {
        if let Some(d) = attrs.divisions {
            self.divisions = d;
        }
        if let Some(k) = attrs.key_fifths {
            self.key_fifths = k;
        }
        if let Some(t) = attrs.time {
            self.time = t;
        }
        if let Some(s) = attrs.staves {
            self.staves = s;
        }
    }

    /// Nominal tick length of a full measure under the current meter
    pub fn measure_capacity(&self) -> Ticks {
        self.divisions * 4 * self.time.beats as i64 / self.time.beat_type as i64
    }
}

/// One measure of one part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Measure label from the source, usually "1", "2", ...
    pub number: String,
    pub attributes: Option<Attributes>,
    pub events: Vec<MeasureEvent>,
}

impl Measure {
    pub fn new(number: impl Into<String>) -> Measure {
        Measure {
            number: number.into(),
            attributes: None,
            events: Vec::new(),
        }
    }
}

/// One part (an instrument), holding its measures in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub name: Option<String>,
    pub measures: Vec<Measure>,
}

impl Part {
    pub fn new(id: impl Into<String>) -> Part {
        Part {
            id: id.into(),
            name: None,
            measures: Vec::new(),
        }
    }
}

/// The whole score
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Score {
    pub title: Option<String>,
    /// miscellaneous-field entries carried through identification,
    /// including the round-trip payload chunks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub misc_fields: Vec<(String, String)>,
    /// What the importer could not represent, for the caller to surface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    pub parts: Vec<Part>,
}

impl Score {
    pub fn new() -> Score {
        Score::default()
    }

    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_signature_validation() {
        assert!(TimeSignature::new(4, 4).is_some());
        assert!(TimeSignature::new(7, 8).is_some());
        assert!(TimeSignature::new(0, 4).is_none());
        assert!(TimeSignature::new(4, 3).is_none());
        assert!(TimeSignature::new(4, 256).is_none());
    }

    #[test]
    fn test_attribute_state_apply_keeps_unset_fields() {
        let mut state = AttributeState::default();
        state.apply(&Attributes {
            divisions: Some(480),
            time: TimeSignature::new(3, 4),
            ..Attributes::default()
        });
        assert_eq!(state.divisions, 480);
        assert_eq!(state.time, TimeSignature { beats: 3, beat_type: 4 });
        assert_eq!(state.key_fifths, 0);

        state.apply(&Attributes {
            key_fifths: Some(2),
            ..Attributes::default()
        });
        assert_eq!(state.divisions, 480);
        assert_eq!(state.key_fifths, 2);
    }

    #[test]
    fn test_measure_capacity() {
        let mut state = AttributeState::default();
        state.divisions = 480;
        assert_eq!(state.measure_capacity(), 1920);
        state.time = TimeSignature { beats: 6, beat_type: 8 };
        assert_eq!(state.measure_capacity(), 1440);
        state.time = TimeSignature { beats: 3, beat_type: 4 };
        assert_eq!(state.measure_capacity(), 1440);
    }
}
