//! Conversion diagnostics
//!
//! Anything a converter cannot carry into the target format is recorded here
//! instead of being silently discarded: one record per dropped or altered
//! construct, carrying its location, a reason code and the action taken.
//! Diagnostics ride the output's metadata channel (MusicXML
//! `<miscellaneous-field>` / MEI `<annot>`) so downstream tools can surface
//! them.

use serde::{Deserialize, Serialize};

/// Why a construct could not be carried over as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    /// Source element with no target representation
    UnsupportedElement,
    /// Articulation/ornament/technique mark missing from the lookup table
    UnmappedMark,
    /// Voice content exceeded the measure's tick capacity
    OverfullMeasure,
    /// A spanner start token never found its matching end token (or vice versa)
    UnresolvedSpanner,
    /// A control event referenced a note id or timestamp that resolves to nothing
    UnresolvedControl,
    /// More concurrent lanes than the target format can hold
    ExcessVoices,
    /// A duration no chain of tied symbols can express
    UnrepresentableDuration,
}

/// What the converter did about it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticAction {
    /// Construct was removed from the output
    Dropped,
    /// Construct was shortened to fit
    Clamped,
    /// Construct was replaced by a near-equivalent
    Substituted,
}

/// One recoverable conversion fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// 1-based measure ordinal, when the fault is measure-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staff: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<u32>,
    /// Human-readable description of the construct involved
    pub detail: String,
    pub action: DiagnosticAction,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, action: DiagnosticAction, detail: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            measure: None,
            staff: None,
            voice: None,
            detail: detail.into(),
            action,
        }
    }

    pub fn at_measure(mut self, measure: u32) -> Self {
        self.measure = Some(measure);
        self
    }

    pub fn at_staff(mut self, staff: u32) -> Self {
        self.staff = Some(staff);
        self
    }

    pub fn at_voice(mut self, voice: u32) -> Self {
        self.voice = Some(voice);
        self
    }
}
