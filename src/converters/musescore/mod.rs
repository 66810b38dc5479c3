//! MuseScore converter
//!
//! The `.mscx` project format is trackwise: parts declare their staves up
//! front, then each staff carries its own measure list with up to four
//! `<voice>` streams. Durations are written symbols plus whole-note
//! fractions, pitches are (midi, tpc) pairs, and spanners are paired
//! start/end tokens pointing at each other through relative
//! measure/fraction offsets.

pub mod export;
pub mod import;
pub(crate) mod marks;

pub use export::write_musescore;
pub use import::read_musescore;

use num_rational::Rational32;

use crate::models::{Accidental, Clef, ClefSign, NoteType, Step, Ticks};

pub(crate) use super::{fold_states, StaffLayout};

/// Tick resolution MuseScore projects are written at
pub const MU_DIVISIONS: i64 = 480;

/// Voice streams one staff can hold
pub(crate) const MAX_VOICES: usize = 4;

/// Position or length as a fraction of a whole note
pub(crate) fn fraction_of(ticks: Ticks, divisions: i64) -> Rational32 {
    Rational32::new(ticks as i32, (divisions * 4) as i32)
}

pub(crate) fn format_rational(r: Rational32) -> String {
    format!("{}/{}", r.numer(), r.denom())
}

pub(crate) fn format_fraction(ticks: Ticks, divisions: i64) -> String {
    format_rational(fraction_of(ticks, divisions))
}

/// Ticks of a whole-note fraction at this resolution
pub(crate) fn parse_fraction(s: &str, divisions: i64) -> Option<Ticks> {
    let (n, d) = s.trim().split_once('/')?;
    let numer: i64 = n.trim().parse().ok()?;
    let denom: i64 = d.trim().parse().ok()?;
    if denom <= 0 {
        return None;
    }
    Some(numer * divisions * 4 / denom)
}

pub(crate) fn parse_rational(s: &str) -> Option<Rational32> {
    let (n, d) = s.trim().split_once('/')?;
    let numer: i32 = n.trim().parse().ok()?;
    let denom: i32 = d.trim().parse().ok()?;
    if denom <= 0 {
        return None;
    }
    Some(Rational32::new(numer, denom))
}

/// MuseScore clef type token for a pivot clef
pub(crate) fn clef_type(clef: &Clef) -> &'static str {
    match (clef.sign, clef.octave_change) {
        (ClefSign::G, 1) => "G8va",
        (ClefSign::G, 2) => "G15ma",
        (ClefSign::G, -1) => "G8vb",
        (ClefSign::G, -2) => "G15mb",
        (ClefSign::G, _) => "G",
        (ClefSign::F, 1) => "F8va",
        (ClefSign::F, 2) => "F15ma",
        (ClefSign::F, -1) => "F8vb",
        (ClefSign::F, -2) => "F15mb",
        (ClefSign::F, _) => "F",
        (ClefSign::C, _) => match clef.line {
            Some(1) => "C1",
            Some(2) => "C2",
            Some(4) => "C4",
            Some(5) => "C5",
            _ => "C3",
        },
        (ClefSign::Percussion, _) => "PERC",
    }
}

/// Pivot clef for a MuseScore clef type token
pub(crate) fn clef_from_type(token: &str, staff: u32) -> Option<Clef> {
    let (sign, line, octave_change) = match token {
        "G" => (ClefSign::G, 2, 0),
        "G8va" => (ClefSign::G, 2, 1),
        "G15ma" => (ClefSign::G, 2, 2),
        "G8vb" => (ClefSign::G, 2, -1),
        "G15mb" => (ClefSign::G, 2, -2),
        "F" => (ClefSign::F, 4, 0),
        "F8va" => (ClefSign::F, 4, 1),
        "F15ma" => (ClefSign::F, 4, 2),
        "F8vb" => (ClefSign::F, 4, -1),
        "F15mb" => (ClefSign::F, 4, -2),
        "C1" => (ClefSign::C, 1, 0),
        "C2" => (ClefSign::C, 2, 0),
        "C3" => (ClefSign::C, 3, 0),
        "C4" => (ClefSign::C, 4, 0),
        "C5" => (ClefSign::C, 5, 0),
        "PERC" | "PERC2" => (ClefSign::Percussion, 2, 0),
        _ => return None,
    };
    Some(Clef {
        staff,
        sign,
        line: Some(line),
        octave_change,
    })
}

pub(crate) fn accidental_subtype(acc: Accidental) -> &'static str {
    match acc {
        Accidental::DoubleFlat => "accidentalDoubleFlat",
        Accidental::Flat => "accidentalFlat",
        Accidental::Natural => "accidentalNatural",
        Accidental::Sharp => "accidentalSharp",
        Accidental::DoubleSharp => "accidentalDoubleSharp",
    }
}

pub(crate) fn accidental_from_subtype(s: &str) -> Option<Accidental> {
    match s {
        "accidentalDoubleFlat" => Some(Accidental::DoubleFlat),
        "accidentalFlat" => Some(Accidental::Flat),
        "accidentalNatural" => Some(Accidental::Natural),
        "accidentalSharp" => Some(Accidental::Sharp),
        "accidentalDoubleSharp" => Some(Accidental::DoubleSharp),
        _ => None,
    }
}

/// MuseScore stores tempo as quarter notes per second
pub(crate) fn tempo_qps(beat_unit: NoteType, per_minute: &str) -> Option<f64> {
    let bpm: f64 = per_minute.trim().parse().ok()?;
    Some(bpm * 4.0 / beat_unit.denominator() as f64 / 60.0)
}

/// Quarter-note beats per minute of a tempo value, trimmed of float noise
pub(crate) fn bpm_text(qps: f64) -> String {
    trim_float((qps * 60.0 * 100.0).round() / 100.0)
}

pub(crate) fn qps_text(qps: f64) -> String {
    trim_float((qps * 10000.0).round() / 10000.0)
}

fn trim_float(v: f64) -> String {
    if v == v.trunc() {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Tonal pitch class of a chord-symbol root or bass
pub(crate) fn tpc_of(step: Step, alter: i32) -> i32 {
    13 + step.fifths_index() + 7 * alter
}

/// Step and alteration named by a tonal pitch class
pub(crate) fn step_alter_of(tpc: i32) -> Option<(Step, i32)> {
    let alter = (tpc - 13).div_euclid(7);
    let idx = (tpc - 13).rem_euclid(7);
    if !(-2..=2).contains(&alter) {
        return None;
    }
    let step = Step::ALL.iter().copied().find(|s| s.fifths_index() == idx)?;
    Some((step, alter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_formatting_reduces() {
        assert_eq!(format_fraction(480, 480), "1/4");
        assert_eq!(format_fraction(1920, 480), "1/1");
        assert_eq!(format_fraction(720, 480), "3/8");
        assert_eq!(format_fraction(0, 480), "0/1");
        assert_eq!(format_fraction(-480, 480), "-1/4");
    }

    #[test]
    fn test_fraction_parsing() {
        assert_eq!(parse_fraction("1/4", 480), Some(480));
        assert_eq!(parse_fraction("3/8", 480), Some(720));
        assert_eq!(parse_fraction("-1/2", 480), Some(-960));
        assert_eq!(parse_fraction("1/0", 480), None);
        assert_eq!(parse_fraction("x", 480), None);
    }

    #[test]
    fn test_clef_tokens_round_trip() {
        for token in ["G", "G8vb", "G15ma", "F", "F8vb", "C1", "C3", "C4", "PERC"] {
            let clef = clef_from_type(token, 1).unwrap();
            assert_eq!(clef_type(&clef), token, "token {token}");
        }
        assert!(clef_from_type("TAB", 1).is_none());
    }

    #[test]
    fn test_tempo_units_are_quarters_per_second() {
        assert_eq!(tempo_qps(NoteType::Quarter, "120"), Some(2.0));
        assert_eq!(tempo_qps(NoteType::Half, "60"), Some(2.0));
        assert_eq!(tempo_qps(NoteType::Eighth, "120"), Some(1.0));
        assert_eq!(tempo_qps(NoteType::Quarter, "ca. 60"), None);
        assert_eq!(bpm_text(2.0), "120");
        assert_eq!(qps_text(2.0), "2");
    }

    #[test]
    fn test_tpc_codec() {
        assert_eq!(tpc_of(Step::C, 0), 14);
        assert_eq!(tpc_of(Step::F, 1), 20);
        assert_eq!(tpc_of(Step::B, -1), 12);
        assert_eq!(step_alter_of(14), Some((Step::C, 0)));
        assert_eq!(step_alter_of(20), Some((Step::F, 1)));
        assert_eq!(step_alter_of(12), Some((Step::B, -1)));
        // past B double sharp and F double flat nothing is nameable
        assert_eq!(step_alter_of(34), None);
        assert_eq!(step_alter_of(-2), None);
    }
}
