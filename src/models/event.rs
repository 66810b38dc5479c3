//! Events inside a measure: notes, rests, voice cursor moves, directions
//!
//! The event list of a [`crate::models::Measure`] follows MusicXML document
//! order. Timing is implicit: notes and rests advance a per-measure cursor,
//! `backup` rewinds it and `forward` advances it without sounding anything.

use serde::{Deserialize, Serialize};

use super::pitch::{Accidental, Pitch};
use super::Ticks;

/// Written note value, `whole` down to `128th`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NoteType {
    Whole,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
    SixtyFourth,
    HundredTwentyEighth,
}

impl NoteType {
    /// Longest first, the order the duration codec tries bases in
    pub const ALL: [NoteType; 8] = [
        NoteType::Whole,
        NoteType::Half,
        NoteType::Quarter,
        NoteType::Eighth,
        NoteType::Sixteenth,
        NoteType::ThirtySecond,
        NoteType::SixtyFourth,
        NoteType::HundredTwentyEighth,
    ];

    /// 1 for whole, 2 for half, 4 for quarter and so on
    pub fn denominator(self) -> i64 {
        match self {
            NoteType::Whole => 1,
            NoteType::Half => 2,
            NoteType::Quarter => 4,
            NoteType::Eighth => 8,
            NoteType::Sixteenth => 16,
            NoteType::ThirtySecond => 32,
            NoteType::SixtyFourth => 64,
            NoteType::HundredTwentyEighth => 128,
        }
    }

    /// Undotted length in ticks at the given quarter-note resolution
    pub fn ticks(self, divisions: i64) -> Ticks {
        divisions * 4 / self.denominator()
    }

    /// Number of beams the value carries (eighth = 1, 16th = 2, ...)
    pub fn beam_level(self) -> u32 {
        match self {
            NoteType::Whole | NoteType::Half | NoteType::Quarter => 0,
            NoteType::Eighth => 1,
            NoteType::Sixteenth => 2,
            NoteType::ThirtySecond => 3,
            NoteType::SixtyFourth => 4,
            NoteType::HundredTwentyEighth => 5,
        }
    }

    /// MusicXML `<type>` text, also used by MuseScore `durationType`
    pub fn name(self) -> &'static str {
        match self {
            NoteType::Whole => "whole",
            NoteType::Half => "half",
            NoteType::Quarter => "quarter",
            NoteType::Eighth => "eighth",
            NoteType::Sixteenth => "16th",
            NoteType::ThirtySecond => "32nd",
            NoteType::SixtyFourth => "64th",
            NoteType::HundredTwentyEighth => "128th",
        }
    }

    pub fn from_name(s: &str) -> Option<NoteType> {
        match s {
            "whole" => Some(NoteType::Whole),
            "half" => Some(NoteType::Half),
            "quarter" => Some(NoteType::Quarter),
            "eighth" => Some(NoteType::Eighth),
            "16th" => Some(NoteType::Sixteenth),
            "32nd" => Some(NoteType::ThirtySecond),
            "64th" => Some(NoteType::SixtyFourth),
            "128th" => Some(NoteType::HundredTwentyEighth),
            _ => None,
        }
    }

    /// MEI `dur` attribute value
    pub fn mei_dur(self) -> &'static str {
        match self {
            NoteType::Whole => "1",
            NoteType::Half => "2",
            NoteType::Quarter => "4",
            NoteType::Eighth => "8",
            NoteType::Sixteenth => "16",
            NoteType::ThirtySecond => "32",
            NoteType::SixtyFourth => "64",
            NoteType::HundredTwentyEighth => "128",
        }
    }

    pub fn from_mei_dur(s: &str) -> Option<NoteType> {
        match s {
            "1" => Some(NoteType::Whole),
            "2" => Some(NoteType::Half),
            "4" => Some(NoteType::Quarter),
            "8" => Some(NoteType::Eighth),
            "16" => Some(NoteType::Sixteenth),
            "32" => Some(NoteType::ThirtySecond),
            "64" => Some(NoteType::SixtyFourth),
            "128" => Some(NoteType::HundredTwentyEighth),
            _ => None,
        }
    }
}

/// Tuplet scaling: the note occupies `normal / actual` of its written value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeModification {
    /// Notes actually played in the span
    pub actual_notes: u32,
    /// Notes the span would normally hold
    pub normal_notes: u32,
}

impl TimeModification {
    pub fn new(actual_notes: u32, normal_notes: u32) -> Option<TimeModification> {
        if actual_notes == 0 || normal_notes == 0 {
            return None;
        }
        Some(TimeModification {
            actual_notes,
            normal_notes,
        })
    }
}

/// One beam line on a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beam {
    /// Beam level, 1 for the eighth-note beam
    pub number: u32,
    pub value: BeamValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeamValue {
    Begin,
    Continue,
    End,
    /// Stub pointing at the following note
    ForwardHook,
    /// Stub pointing back at the preceding note
    BackwardHook,
}

impl BeamValue {
    /// MusicXML `<beam>` text
    pub fn name(self) -> &'static str {
        match self {
            BeamValue::Begin => "begin",
            BeamValue::Continue => "continue",
            BeamValue::End => "end",
            BeamValue::ForwardHook => "forward hook",
            BeamValue::BackwardHook => "backward hook",
        }
    }

    pub fn from_name(s: &str) -> Option<BeamValue> {
        match s {
            "begin" => Some(BeamValue::Begin),
            "continue" => Some(BeamValue::Continue),
            "end" => Some(BeamValue::End),
            "forward hook" => Some(BeamValue::ForwardHook),
            "backward hook" => Some(BeamValue::BackwardHook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartStop {
    Start,
    Stop,
}

impl StartStop {
    pub fn name(self) -> &'static str {
        match self {
            StartStop::Start => "start",
            StartStop::Stop => "stop",
        }
    }

    pub fn from_name(s: &str) -> Option<StartStop> {
        match s {
            "start" => Some(StartStop::Start),
            "stop" => Some(StartStop::Stop),
            _ => None,
        }
    }
}

/// One end of a slur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurMark {
    pub kind: StartStop,
    /// Slur level for overlapping slurs, 1-based
    pub number: u32,
}

/// One end of a tuplet bracket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupletMark {
    pub kind: StartStop,
}

/// One end of a glissando line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlissandoMark {
    pub kind: StartStop,
    pub number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Articulation {
    Staccato,
    Staccatissimo,
    Accent,
    StrongAccent,
    Tenuto,
    DetachedLegato,
}

impl Articulation {
    /// MusicXML element name under `<articulations>`
    pub fn name(self) -> &'static str {
        match self {
            Articulation::Staccato => "staccato",
            Articulation::Staccatissimo => "staccatissimo",
            Articulation::Accent => "accent",
            Articulation::StrongAccent => "strong-accent",
            Articulation::Tenuto => "tenuto",
            Articulation::DetachedLegato => "detached-legato",
        }
    }

    pub fn from_name(s: &str) -> Option<Articulation> {
        match s {
            "staccato" => Some(Articulation::Staccato),
            "staccatissimo" => Some(Articulation::Staccatissimo),
            "accent" => Some(Articulation::Accent),
            "strong-accent" => Some(Articulation::StrongAccent),
            "tenuto" => Some(Articulation::Tenuto),
            "detached-legato" => Some(Articulation::DetachedLegato),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ornament {
    Trill,
    Mordent,
    InvertedMordent,
    Turn,
}

impl Ornament {
    /// MusicXML element name under `<ornaments>`
    pub fn name(self) -> &'static str {
        match self {
            Ornament::Trill => "trill-mark",
            Ornament::Mordent => "mordent",
            Ornament::InvertedMordent => "inverted-mordent",
            Ornament::Turn => "turn",
        }
    }

    pub fn from_name(s: &str) -> Option<Ornament> {
        match s {
            "trill-mark" => Some(Ornament::Trill),
            "mordent" => Some(Ornament::Mordent),
            "inverted-mordent" => Some(Ornament::InvertedMordent),
            "turn" => Some(Ornament::Turn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Technical {
    UpBow,
    DownBow,
    Harmonic,
    OpenString,
    Stopped,
    SnapPizzicato,
}

impl Technical {
    /// MusicXML element name under `<technical>`
    pub fn name(self) -> &'static str {
        match self {
            Technical::UpBow => "up-bow",
            Technical::DownBow => "down-bow",
            Technical::Harmonic => "harmonic",
            Technical::OpenString => "open-string",
            Technical::Stopped => "stopped",
            Technical::SnapPizzicato => "snap-pizzicato",
        }
    }

    pub fn from_name(s: &str) -> Option<Technical> {
        match s {
            "up-bow" => Some(Technical::UpBow),
            "down-bow" => Some(Technical::DownBow),
            "harmonic" => Some(Technical::Harmonic),
            "open-string" => Some(Technical::OpenString),
            "stopped" => Some(Technical::Stopped),
            "snap-pizzicato" => Some(Technical::SnapPizzicato),
            _ => None,
        }
    }
}

/// Marks attached to a single note or rest
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Notations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slurs: Vec<SlurMark>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tuplets: Vec<TupletMark>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub articulations: Vec<Articulation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ornaments: Vec<Ornament>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub technical: Vec<Technical>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub glissandos: Vec<GlissandoMark>,
    #[serde(default)]
    pub fermata: bool,
    #[serde(default)]
    pub arpeggiate: bool,
}

impl Notations {
    pub fn is_empty(&self) -> bool {
        self.slurs.is_empty()
            && self.tuplets.is_empty()
            && self.articulations.is_empty()
            && self.ornaments.is_empty()
            && self.technical.is_empty()
            && self.glissandos.is_empty()
            && !self.fermata
            && !self.arpeggiate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Syllabic {
    Single,
    Begin,
    Middle,
    End,
}

impl Syllabic {
    pub fn name(self) -> &'static str {
        match self {
            Syllabic::Single => "single",
            Syllabic::Begin => "begin",
            Syllabic::Middle => "middle",
            Syllabic::End => "end",
        }
    }

    pub fn from_name(s: &str) -> Option<Syllabic> {
        match s {
            "single" => Some(Syllabic::Single),
            "begin" => Some(Syllabic::Begin),
            "middle" => Some(Syllabic::Middle),
            "end" => Some(Syllabic::End),
            _ => None,
        }
    }
}

/// One lyric syllable attached to a note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lyric {
    /// Verse number, 1-based
    pub number: u32,
    pub syllabic: Option<Syllabic>,
    pub text: String,
}

/// A sounded note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Element id carried through from the source, when it had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub pitch: Pitch,
    /// Length in ticks; zero for grace notes
    pub duration: Ticks,
    pub voice: u32,
    pub staff: u32,
    /// Sounds together with the preceding note instead of following it
    #[serde(default)]
    pub chord: bool,
    #[serde(default)]
    pub grace: bool,
    #[serde(default)]
    pub grace_slash: bool,
    #[serde(default)]
    pub tie_start: bool,
    #[serde(default)]
    pub tie_stop: bool,
    pub note_type: Option<NoteType>,
    #[serde(default)]
    pub dots: u32,
    pub time_mod: Option<TimeModification>,
    /// Printed accidental, when the source printed one
    pub accidental: Option<Accidental>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub beams: Vec<Beam>,
    #[serde(default, skip_serializing_if = "Notations::is_empty")]
    pub notations: Notations,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lyrics: Vec<Lyric>,
}

impl Note {
    /// Minimal pitched note, quarter by default; callers fill in the rest
    pub fn new(pitch: Pitch, duration: Ticks, voice: u32, staff: u32) -> Note {
        Note {
            id: None,
            pitch,
            duration,
            voice,
            staff,
            chord: false,
            grace: false,
            grace_slash: false,
            tie_start: false,
            tie_stop: false,
            note_type: None,
            dots: 0,
            time_mod: None,
            accidental: None,
            beams: Vec::new(),
            notations: Notations::default(),
            lyrics: Vec::new(),
        }
    }
}

/// A silence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rest {
    pub duration: Ticks,
    pub voice: u32,
    pub staff: u32,
    /// Whole-measure rest regardless of written value
    #[serde(default)]
    pub measure_rest: bool,
    pub note_type: Option<NoteType>,
    #[serde(default)]
    pub dots: u32,
    pub time_mod: Option<TimeModification>,
    #[serde(default, skip_serializing_if = "Notations::is_empty")]
    pub notations: Notations,
}

impl Rest {
    pub fn new(duration: Ticks, voice: u32, staff: u32) -> Rest {
        Rest {
            duration,
            voice,
            staff,
            measure_rest: false,
            note_type: None,
            dots: 0,
            time_mod: None,
            notations: Notations::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Above,
    Below,
}

impl Placement {
    pub fn name(self) -> &'static str {
        match self {
            Placement::Above => "above",
            Placement::Below => "below",
        }
    }

    pub fn from_name(s: &str) -> Option<Placement> {
        match s {
            "above" => Some(Placement::Above),
            "below" => Some(Placement::Below),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WedgeKind {
    Crescendo,
    Diminuendo,
    Stop,
}

impl WedgeKind {
    pub fn name(self) -> &'static str {
        match self {
            WedgeKind::Crescendo => "crescendo",
            WedgeKind::Diminuendo => "diminuendo",
            WedgeKind::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PedalKind {
    Start,
    Stop,
    Change,
}

impl PedalKind {
    pub fn name(self) -> &'static str {
        match self {
            PedalKind::Start => "start",
            PedalKind::Stop => "stop",
            PedalKind::Change => "change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OctaveShiftKind {
    /// Play an octave higher than written (8va line above the staff)
    Down,
    /// Play an octave lower than written
    Up,
    Stop,
}

impl OctaveShiftKind {
    pub fn name(self) -> &'static str {
        match self {
            OctaveShiftKind::Down => "down",
            OctaveShiftKind::Up => "up",
            OctaveShiftKind::Stop => "stop",
        }
    }
}

/// What a direction says
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectionKind {
    /// Dynamic mark, `p` through `fff` and friends
    Dynamic(String),
    Wedge(WedgeKind),
    Pedal(PedalKind),
    OctaveShift {
        kind: OctaveShiftKind,
        /// Interval size, 8 or 15
        size: u32,
    },
    Words(String),
    Metronome {
        beat_unit: NoteType,
        per_minute: String,
    },
}

/// Performance instruction placed at the current cursor position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub kind: DirectionKind,
    pub placement: Option<Placement>,
    pub staff: u32,
    /// Voice the direction travels with, when the source said
    pub voice: Option<u32>,
}

/// Chord symbol above the staff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Harmony {
    pub root: super::pitch::Step,
    #[serde(default)]
    pub root_alter: i32,
    /// MusicXML kind value, `major`, `minor`, `dominant` and so on
    pub kind: String,
    pub bass: Option<(super::pitch::Step, i32)>,
}

/// One entry in a measure's event list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeasureEvent {
    Note(Note),
    Rest(Rest),
    /// Rewind the cursor, starting a new voice or returning to an earlier beat
    Backup { duration: Ticks },
    /// Advance the cursor without sounding anything
    Forward {
        duration: Ticks,
        voice: Option<u32>,
        staff: Option<u32>,
    },
    Direction(Direction),
    Harmony(Harmony),
}
