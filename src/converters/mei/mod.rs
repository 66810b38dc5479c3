//! MEI converter
//!
//! MEI is timewise where the pivot is partwise: one `<measure>` spans all
//! parts, each part contributes `<staff>` elements addressed by a global
//! staff number, and voices become `<layer>` children. Durations are
//! written symbols only, so a fixed tick resolution is used on import.
//! Control events (slurs, hairpins, dynamics, ornaments) live beside the
//! staves and point at notes by id or by beat timestamp.

pub mod export;
pub mod import;

pub use export::write_mei;
pub use import::read_mei;

use crate::models::{Articulation, ClefSign, Harmony, Notations, Step, Technical, Ticks};

pub(crate) use super::{fold_states, StaffLayout};

/// Tick resolution assumed for imported MEI, which carries none of its own
pub const MEI_DIVISIONS: i64 = 480;

/// MEI `artic` tokens for a note's articulations and technique marks.
///
/// The detached-legato articulation has no single MEI token and becomes the
/// tenuto-staccato pair, which reads back as two separate marks.
pub(crate) fn artic_tokens(notations: &Notations) -> Vec<&'static str> {
    let mut tokens = Vec::new();
    for artic in &notations.articulations {
        match artic {
            Articulation::Staccato => tokens.push("stacc"),
            Articulation::Staccatissimo => tokens.push("stacciss"),
            Articulation::Accent => tokens.push("acc"),
            Articulation::StrongAccent => tokens.push("marc"),
            Articulation::Tenuto => tokens.push("ten"),
            Articulation::DetachedLegato => {
                tokens.push("ten");
                tokens.push("stacc");
            }
        }
    }
    for tech in &notations.technical {
        tokens.push(match tech {
            Technical::UpBow => "upbow",
            Technical::DownBow => "dnbow",
            Technical::Harmonic => "harm",
            Technical::OpenString => "open",
            Technical::Stopped => "stop",
            Technical::SnapPizzicato => "snap",
        });
    }
    tokens.dedup();
    tokens
}

/// Map one `artic` token back onto the notations. Returns false for tokens
/// with no pivot counterpart.
pub(crate) fn apply_artic_token(token: &str, notations: &mut Notations) -> bool {
    match token {
        "stacc" => notations.articulations.push(Articulation::Staccato),
        "stacciss" => notations.articulations.push(Articulation::Staccatissimo),
        "acc" => notations.articulations.push(Articulation::Accent),
        "marc" => notations.articulations.push(Articulation::StrongAccent),
        "ten" => notations.articulations.push(Articulation::Tenuto),
        "upbow" => notations.technical.push(Technical::UpBow),
        "dnbow" => notations.technical.push(Technical::DownBow),
        "harm" => notations.technical.push(Technical::Harmonic),
        "open" => notations.technical.push(Technical::OpenString),
        "stop" => notations.technical.push(Technical::Stopped),
        "snap" => notations.technical.push(Technical::SnapPizzicato),
        _ => return false,
    }
    true
}

pub(crate) fn clef_shape(sign: ClefSign) -> &'static str {
    match sign {
        ClefSign::G => "G",
        ClefSign::F => "F",
        ClefSign::C => "C",
        ClefSign::Percussion => "perc",
    }
}

pub(crate) fn clef_sign_from_shape(shape: &str) -> Option<ClefSign> {
    match shape {
        "G" => Some(ClefSign::G),
        "F" => Some(ClefSign::F),
        "C" => Some(ClefSign::C),
        "perc" => Some(ClefSign::Percussion),
        _ => None,
    }
}

/// Chord-symbol text for a `<harm>` element ("D7", "F#m7", "Bb/F")
pub(crate) fn harmony_text(harmony: &Harmony) -> String {
    let mut text = String::new();
    text.push_str(harmony.root.name());
    text.push_str(&alter_marks(harmony.root_alter));
    text.push_str(crate::converters::kind_to_suffix(&harmony.kind));
    if let Some((step, alter)) = &harmony.bass {
        text.push('/');
        text.push_str(step.name());
        text.push_str(&alter_marks(*alter));
    }
    text
}

pub(crate) fn parse_harmony_text(text: &str) -> Option<Harmony> {
    let (main, bass_text) = match text.split_once('/') {
        Some((m, b)) => (m.trim(), Some(b.trim())),
        None => (text.trim(), None),
    };
    let (root, root_alter, suffix) = split_chord_root(main)?;
    let bass = match bass_text {
        Some(b) => {
            let (step, alter, rest) = split_chord_root(b)?;
            if !rest.is_empty() {
                return None;
            }
            Some((step, alter))
        }
        None => None,
    };
    Some(Harmony {
        root,
        root_alter,
        kind: crate::converters::suffix_to_kind(suffix),
        bass,
    })
}

fn alter_marks(alter: i32) -> String {
    if alter >= 0 {
        "#".repeat(alter as usize)
    } else {
        "b".repeat(-alter as usize)
    }
}

fn split_chord_root(s: &str) -> Option<(Step, i32, &str)> {
    let mut chars = s.char_indices();
    let (_, letter) = chars.next()?;
    let step = Step::from_name(&letter.to_string())?;
    let rest = &s[1..];
    let mut alter = 0;
    let mut consumed = 0;
    for c in rest.chars() {
        match c {
            '#' => alter += 1,
            'b' => alter -= 1,
            _ => break,
        }
        consumed += 1;
    }
    Some((step, alter, &rest[consumed..]))
}

/// Render a key signature as MEI `key.sig` ("2s", "3f", "0")
pub(crate) fn format_key_sig(fifths: i32) -> String {
    match fifths {
        0 => "0".to_string(),
        f if f > 0 => format!("{f}s"),
        f => format!("{}f", -f),
    }
}

pub(crate) fn parse_key_sig(s: &str) -> Option<i32> {
    if s == "0" {
        return Some(0);
    }
    let (digits, sign) = if let Some(d) = s.strip_suffix('s') {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('f') {
        (d, -1)
    } else {
        (s, 1)
    };
    let n: i32 = digits.parse().ok()?;
    if (0..=7).contains(&n) {
        Some(sign * n)
    } else {
        None
    }
}

/// Beat position of a tick offset, 1-based in meter-unit beats, as a
/// tstamp value ("1", "2.5", "1.3333")
pub(crate) fn format_beat(onset: Ticks, unit: Ticks) -> String {
    if unit <= 0 {
        return "1".to_string();
    }
    let beat = 1.0 + onset as f64 / unit as f64;
    let rounded = (beat * 10000.0).round() / 10000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        let s = format!("{rounded:.4}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Tick offset of a tstamp beat value
pub(crate) fn parse_beat(s: &str, unit: Ticks) -> Option<Ticks> {
    let beat: f64 = s.trim().parse().ok()?;
    Some(((beat - 1.0) * unit as f64).round() as Ticks)
}

/// Split a tstamp2 ("2m+1.5" or plain "3") into measure delta and beat
pub(crate) fn parse_tstamp2(s: &str) -> Option<(u32, &str)> {
    match s.split_once("m+") {
        Some((measures, beat)) => Some((measures.trim().parse().ok()?, beat)),
        None => Some((0, s)),
    }
}

pub(crate) fn format_tstamp2(measure_delta: u32, beat: &str) -> String {
    if measure_delta == 0 {
        beat.to_string()
    } else {
        format!("{measure_delta}m+{beat}")
    }
}
