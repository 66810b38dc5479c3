//! Chord mark lookup
//!
//! MuseScore writes articulations, ornaments and technique marks as
//! `<Articulation>` subtypes named after SMuFL glyphs. One table maps them
//! onto the pivot's notation kinds; export writes the first subtype listed
//! for a kind, so aliases further down read back but never come out again.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::models::{Articulation, Notations, Ornament, Technical};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mark {
    Artic(Articulation),
    Ornament(Ornament),
    Technical(Technical),
}

const MARKS: &[(&str, Mark)] = &[
    ("articStaccatoAbove", Mark::Artic(Articulation::Staccato)),
    ("articStaccatoBelow", Mark::Artic(Articulation::Staccato)),
    ("articStaccatissimoAbove", Mark::Artic(Articulation::Staccatissimo)),
    ("articStaccatissimoBelow", Mark::Artic(Articulation::Staccatissimo)),
    ("articAccentAbove", Mark::Artic(Articulation::Accent)),
    ("articAccentBelow", Mark::Artic(Articulation::Accent)),
    ("articMarcatoAbove", Mark::Artic(Articulation::StrongAccent)),
    ("articMarcatoBelow", Mark::Artic(Articulation::StrongAccent)),
    ("articTenutoAbove", Mark::Artic(Articulation::Tenuto)),
    ("articTenutoBelow", Mark::Artic(Articulation::Tenuto)),
    ("articTenutoStaccatoAbove", Mark::Artic(Articulation::DetachedLegato)),
    ("articTenutoStaccatoBelow", Mark::Artic(Articulation::DetachedLegato)),
    ("ornamentTrill", Mark::Ornament(Ornament::Trill)),
    ("ornamentMordent", Mark::Ornament(Ornament::Mordent)),
    ("ornamentShortTrill", Mark::Ornament(Ornament::InvertedMordent)),
    ("ornamentTurn", Mark::Ornament(Ornament::Turn)),
    ("stringsUpBow", Mark::Technical(Technical::UpBow)),
    ("stringsDownBow", Mark::Technical(Technical::DownBow)),
    ("stringsHarmonic", Mark::Technical(Technical::Harmonic)),
    ("brassMuteOpen", Mark::Technical(Technical::OpenString)),
    ("brassMuteClosed", Mark::Technical(Technical::Stopped)),
    // left-hand pizzicato shares the stopped glyph's meaning for us
    ("pluckedLeftHandPizzicato", Mark::Technical(Technical::Stopped)),
    ("pluckedSnapPizzicatoAbove", Mark::Technical(Technical::SnapPizzicato)),
    ("pluckedSnapPizzicatoBelow", Mark::Technical(Technical::SnapPizzicato)),
];

static BY_SUBTYPE: Lazy<HashMap<&'static str, Mark>> =
    Lazy::new(|| MARKS.iter().copied().collect());

pub(crate) fn mark_for(subtype: &str) -> Option<Mark> {
    BY_SUBTYPE.get(subtype).copied()
}

/// Subtype export writes for a mark: the table's first entry of that kind
pub(crate) fn subtype_for(mark: Mark) -> Option<&'static str> {
    MARKS.iter().find(|(_, m)| *m == mark).map(|(s, _)| *s)
}

pub(crate) fn apply_mark(mark: Mark, notations: &mut Notations) {
    match mark {
        Mark::Artic(a) => notations.articulations.push(a),
        Mark::Ornament(o) => notations.ornaments.push(o),
        Mark::Technical(t) => notations.technical.push(t),
    }
}

/// Subtypes for everything a note's notations carry
pub(crate) fn subtypes_of(notations: &Notations) -> Vec<&'static str> {
    let mut out = Vec::new();
    for &a in &notations.articulations {
        out.extend(subtype_for(Mark::Artic(a)));
    }
    for &o in &notations.ornaments {
        out.extend(subtype_for(Mark::Ornament(o)));
    }
    for &t in &notations.technical {
        out.extend(subtype_for(Mark::Technical(t)));
    }
    out
}
