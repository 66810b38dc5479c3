//! Pivot score model
//!
//! Format-agnostic representation every converter reads from and writes to.
//! The shape follows MusicXML `score-partwise` (parts → measures → timed
//! events) because that is the hub format; MEI and MuseScore documents are
//! mapped onto this model and back.

pub mod event;
pub mod pitch;
pub mod score;

pub use event::{
    Articulation, Beam, BeamValue, Direction, DirectionKind, GlissandoMark, Harmony, Lyric,
    MeasureEvent, Notations, Note, NoteType, OctaveShiftKind, Ornament, PedalKind, Placement,
    Rest, SlurMark, StartStop, Syllabic, Technical, TimeModification, TupletMark, WedgeKind,
};
pub use pitch::{diatonic_alter, Accidental, Pitch, Step};
pub use score::{AttributeState, Attributes, Clef, ClefSign, Measure, Part, Score, TimeSignature};

/// Smallest time unit. Scaled by the divisions-per-quarter-note in force;
/// signed because backup cursors can transiently dip below a measure start
/// in malformed input.
pub type Ticks = i64;
