//! Written pitch: step letter, chromatic alteration, octave
//!
//! Also carries the circle-of-fifths helpers shared by the key estimator,
//! the spelling engine and the MuseScore tonal-pitch-class codec.

use serde::{Deserialize, Serialize};

/// Letter step of a written pitch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    C,
    D,
    E,
    F,
    G,
    A,
    B,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::C,
        Step::D,
        Step::E,
        Step::F,
        Step::G,
        Step::A,
        Step::B,
    ];

    /// Semitones above C of the natural step
    pub fn semitones(self) -> i32 {
        match self {
            Step::C => 0,
            Step::D => 2,
            Step::E => 4,
            Step::F => 5,
            Step::G => 7,
            Step::A => 9,
            Step::B => 11,
        }
    }

    /// Position in the sharp order F C G D A E B. Doubles as the step's
    /// coordinate on the circle of fifths (used by key defaults and tpc).
    pub fn fifths_index(self) -> i32 {
        match self {
            Step::F => 0,
            Step::C => 1,
            Step::G => 2,
            Step::D => 3,
            Step::A => 4,
            Step::E => 5,
            Step::B => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::C => "C",
            Step::D => "D",
            Step::E => "E",
            Step::F => "F",
            Step::G => "G",
            Step::A => "A",
            Step::B => "B",
        }
    }

    /// Parse a step letter; accepts both MusicXML uppercase and MEI
    /// lowercase `pname`.
    pub fn from_name(s: &str) -> Option<Step> {
        match s {
            "C" | "c" => Some(Step::C),
            "D" | "d" => Some(Step::D),
            "E" | "e" => Some(Step::E),
            "F" | "f" => Some(Step::F),
            "G" | "g" => Some(Step::G),
            "A" | "a" => Some(Step::A),
            "B" | "b" => Some(Step::B),
            _ => None,
        }
    }
}

/// Default alteration of a step under a key signature.
///
/// Sharps apply in the order F C G D A E B, flats in the order B E A D G C F;
/// a key of `fifths` sharps alters the first `fifths` steps of the sharp
/// order, and symmetrically for flats.
pub fn diatonic_alter(step: Step, fifths: i32) -> i32 {
    let idx = step.fifths_index();
    if fifths > 0 && idx < fifths.min(7) {
        1
    } else if fifths < 0 && idx >= 7 + fifths.max(-7) {
        -1
    } else {
        0
    }
}

/// A written pitch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pitch {
    pub step: Step,
    /// Chromatic alteration in semitones, -2 (double flat) to +2 (double sharp)
    pub alter: i32,
    /// Scientific octave; 4 holds middle C
    pub octave: i32,
}

impl Pitch {
    pub fn new(step: Step, alter: i32, octave: i32) -> Self {
        Pitch {
            step,
            alter,
            octave,
        }
    }

    /// Absolute semitone number, 0 = C-1 (MIDI convention)
    pub fn midi(&self) -> i32 {
        (self.octave + 1) * 12 + self.step.semitones() + self.alter
    }

    /// Chromatic pitch class 0..=11, 0 = C
    pub fn pitch_class(&self) -> i32 {
        self.midi().rem_euclid(12)
    }

    /// MuseScore tonal pitch class. C natural is 14; each step up the
    /// circle of fifths adds 1 and each sharp adds 7.
    pub fn tpc(&self) -> i32 {
        13 + self.step.fifths_index() + 7 * self.alter
    }

    /// Recover a spelled pitch from MuseScore's (tpc, midi) pair.
    ///
    /// Returns None when the pair is inconsistent (the spelling does not
    /// land on the given semitone) or the tpc needs an alteration outside
    /// ±2; callers then fall back to the spelling engine.
    pub fn from_tpc(tpc: i32, midi: i32) -> Option<Pitch> {
        let x = tpc - 13;
        let alter = x.div_euclid(7);
        let fifths_idx = x.rem_euclid(7);
        if !(-2..=2).contains(&alter) {
            return None;
        }
        let step = Step::ALL
            .iter()
            .copied()
            .find(|s| s.fifths_index() == fifths_idx)?;
        let natural = midi - alter - step.semitones();
        // natural must sit exactly on an octave boundary of this step
        if natural.rem_euclid(12) != 0 {
            return None;
        }
        Some(Pitch {
            step,
            alter,
            octave: natural / 12 - 1,
        })
    }
}

/// Printed accidental glyph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accidental {
    DoubleFlat,
    Flat,
    Natural,
    Sharp,
    DoubleSharp,
}

impl Accidental {
    /// Glyph matching a note's sounding alteration
    pub fn from_alter(alter: i32) -> Option<Accidental> {
        match alter {
            -2 => Some(Accidental::DoubleFlat),
            -1 => Some(Accidental::Flat),
            0 => Some(Accidental::Natural),
            1 => Some(Accidental::Sharp),
            2 => Some(Accidental::DoubleSharp),
            _ => None,
        }
    }

    pub fn alter(self) -> i32 {
        match self {
            Accidental::DoubleFlat => -2,
            Accidental::Flat => -1,
            Accidental::Natural => 0,
            Accidental::Sharp => 1,
            Accidental::DoubleSharp => 2,
        }
    }

    /// MusicXML `<accidental>` text
    pub fn musicxml_name(self) -> &'static str {
        match self {
            Accidental::DoubleFlat => "flat-flat",
            Accidental::Flat => "flat",
            Accidental::Natural => "natural",
            Accidental::Sharp => "sharp",
            Accidental::DoubleSharp => "double-sharp",
        }
    }

    pub fn from_musicxml_name(s: &str) -> Option<Accidental> {
        match s {
            "flat-flat" => Some(Accidental::DoubleFlat),
            "flat" => Some(Accidental::Flat),
            "natural" => Some(Accidental::Natural),
            "sharp" => Some(Accidental::Sharp),
            "double-sharp" | "sharp-sharp" => Some(Accidental::DoubleSharp),
            _ => None,
        }
    }

    /// MEI `accid` attribute value
    pub fn mei_name(self) -> &'static str {
        match self {
            Accidental::DoubleFlat => "ff",
            Accidental::Flat => "f",
            Accidental::Natural => "n",
            Accidental::Sharp => "s",
            Accidental::DoubleSharp => "x",
        }
    }

    pub fn from_mei_name(s: &str) -> Option<Accidental> {
        match s {
            "ff" => Some(Accidental::DoubleFlat),
            "f" => Some(Accidental::Flat),
            "n" => Some(Accidental::Natural),
            "s" => Some(Accidental::Sharp),
            "x" | "ss" => Some(Accidental::DoubleSharp),
            _ => None,
        }
    }
}
