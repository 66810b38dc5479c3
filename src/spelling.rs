//! Enharmonic spelling and accidental display
//!
//! Two jobs: pick a written (step, alter) for a bare semitone number, and
//! decide when a note needs a printed accidental. Both lean on the same
//! measure-scoped [`AccidentalState`].

use std::collections::HashMap;

use crate::models::{diatonic_alter, Accidental, Pitch, Step};

/// Written spellings per pitch class, sharp side declared first.
///
/// White keys get their single natural spelling; black keys the two
/// single-accidental ones. Double accidentals never win a spelling contest
/// and are only reachable through explicit source spellings.
const CANDIDATES: [&[(Step, i32)]; 12] = [
    &[(Step::C, 0)],
    &[(Step::C, 1), (Step::D, -1)],
    &[(Step::D, 0)],
    &[(Step::D, 1), (Step::E, -1)],
    &[(Step::E, 0)],
    &[(Step::F, 0)],
    &[(Step::F, 1), (Step::G, -1)],
    &[(Step::G, 0)],
    &[(Step::G, 1), (Step::A, -1)],
    &[(Step::A, 0)],
    &[(Step::A, 1), (Step::B, -1)],
    &[(Step::B, 0)],
];

/// Valid spellings of a pitch class, sharp candidate first
pub fn spelling_candidates(pitch_class: i32) -> &'static [(Step, i32)] {
    CANDIDATES[pitch_class.rem_euclid(12) as usize]
}

/// Last-sounding alteration per (step, octave), scoped to one measure.
///
/// Lookups fall back to the key signature's diatonic default. A tie held
/// over the barline carries its note's alteration into the next measure.
#[derive(Debug, Clone)]
pub struct AccidentalState {
    key_fifths: i32,
    altered: HashMap<(Step, i32), i32>,
}

impl AccidentalState {
    pub fn new(key_fifths: i32) -> AccidentalState {
        AccidentalState {
            key_fifths,
            altered: HashMap::new(),
        }
    }

    pub fn set_key(&mut self, key_fifths: i32) {
        self.key_fifths = key_fifths;
    }

    /// Alteration a reader currently assumes for this staff position
    pub fn active_alter(&self, step: Step, octave: i32) -> i32 {
        self.altered
            .get(&(step, octave))
            .copied()
            .unwrap_or_else(|| diatonic_alter(step, self.key_fifths))
    }

    /// Decide the printed glyph for a note and remember its alteration.
    ///
    /// Returns a glyph only when the note's alteration differs from the
    /// active one; the state updates either way. A tie continuation never
    /// prints a glyph, whatever the state says.
    pub fn resolve(&mut self, pitch: &Pitch, tie_continuation: bool) -> Option<Accidental> {
        let active = self.active_alter(pitch.step, pitch.octave);
        self.altered.insert((pitch.step, pitch.octave), pitch.alter);
        if tie_continuation || pitch.alter == active {
            None
        } else {
            Accidental::from_alter(pitch.alter)
        }
    }

    /// Cross a barline: forget the measure's accidentals except those held
    /// through by an unterminated tie
    pub fn next_measure(&mut self, tied_through: &[Pitch]) {
        self.altered.clear();
        for pitch in tied_through {
            self.altered.insert((pitch.step, pitch.octave), pitch.alter);
        }
    }
}

/// Spell a bare semitone number as a written pitch.
///
/// Candidates are scored in quarter units to stay integral: 4 when the
/// spelling needs a printed accidental against the current state, plus 2
/// per semitone the alteration strays from the key's default, minus 1 when
/// the accidental leans with the melodic direction (flats falling, sharps
/// rising). Lowest score wins; a tie keeps the earlier candidate, so the
/// sharp spelling.
pub fn spell(
    semitone: i32,
    key_fifths: i32,
    previous_semitone: Option<i32>,
    state: &AccidentalState,
) -> Pitch {
    let candidates = spelling_candidates(semitone);
    let mut best: Option<(i32, Pitch)> = None;
    for &(step, alter) in candidates {
        let natural = semitone - alter - step.semitones();
        let octave = natural.div_euclid(12) - 1;
        let pitch = Pitch::new(step, alter, octave);

        let mut score = 0;
        if state.active_alter(step, octave) != alter {
            score += 4;
        }
        score += 2 * (alter - diatonic_alter(step, key_fifths)).abs();
        if let Some(prev) = previous_semitone {
            if (semitone < prev && alter < 0) || (semitone > prev && alter > 0) {
                score -= 1;
            }
        }

        if best.map_or(true, |(b, _)| score < b) {
            best = Some((score, pitch));
        }
    }
    // candidate table always has at least one entry per pitch class
    best.map(|(_, p)| p).unwrap_or(Pitch::new(Step::C, 0, 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_default_needs_no_glyph() {
        // F sharp in G major is the key default
        let mut state = AccidentalState::new(1);
        let fis = Pitch::new(Step::F, 1, 4);
        assert_eq!(state.resolve(&fis, false), None);
        // C natural is diatonic too
        let c = Pitch::new(Step::C, 0, 4);
        assert_eq!(state.resolve(&c, false), None);
    }

    #[test]
    fn test_accidental_emitted_once_per_measure() {
        let mut state = AccidentalState::new(0);
        let cis = Pitch::new(Step::C, 1, 4);
        assert_eq!(state.resolve(&cis, false), Some(Accidental::Sharp));
        assert_eq!(state.resolve(&cis, false), None);
        // new measure starts fresh
        state.next_measure(&[]);
        assert_eq!(state.resolve(&cis, false), Some(Accidental::Sharp));
    }

    #[test]
    fn test_natural_cancels_earlier_sharp() {
        let mut state = AccidentalState::new(0);
        let fis = Pitch::new(Step::F, 1, 4);
        let f = Pitch::new(Step::F, 0, 4);
        assert_eq!(state.resolve(&fis, false), Some(Accidental::Sharp));
        assert_eq!(state.resolve(&f, false), Some(Accidental::Natural));
        assert_eq!(state.resolve(&f, false), None);
    }

    #[test]
    fn test_octaves_tracked_separately() {
        let mut state = AccidentalState::new(0);
        let cis4 = Pitch::new(Step::C, 1, 4);
        let cis5 = Pitch::new(Step::C, 1, 5);
        assert_eq!(state.resolve(&cis4, false), Some(Accidental::Sharp));
        assert_eq!(state.resolve(&cis5, false), Some(Accidental::Sharp));
    }

    #[test]
    fn test_tie_continuation_never_prints() {
        let mut state = AccidentalState::new(0);
        let cis = Pitch::new(Step::C, 1, 4);
        assert_eq!(state.resolve(&cis, true), None);
        // but the state still learned the alteration
        assert_eq!(state.resolve(&cis, false), None);
    }

    #[test]
    fn test_tie_carries_over_barline() {
        let mut state = AccidentalState::new(0);
        let gis = Pitch::new(Step::G, 1, 4);
        assert_eq!(state.resolve(&gis, false), Some(Accidental::Sharp));
        state.next_measure(&[gis]);
        // the tied continuation and a re-struck G# both stay glyphless
        assert_eq!(state.resolve(&gis, true), None);
        assert_eq!(state.resolve(&gis, false), None);
    }

    #[test]
    fn test_spell_prefers_key_spelling() {
        let state = AccidentalState::new(2);
        // pc 6 in D major is F#, not Gb
        let p = spell(66, 2, None, &state);
        assert_eq!((p.step, p.alter, p.octave), (Step::F, 1, 4));
        // pc 10 in Bb major is Bb
        let state = AccidentalState::new(-2);
        let p = spell(70, -2, None, &state);
        assert_eq!((p.step, p.alter, p.octave), (Step::B, -1, 4));
    }

    #[test]
    fn test_spell_follows_melodic_direction() {
        let state = AccidentalState::new(0);
        // descending onto pc 3 favors the flat
        let p = spell(63, 0, Some(65), &state);
        assert_eq!((p.step, p.alter), (Step::E, -1));
        // ascending onto pc 3 favors the sharp
        let p = spell(63, 0, Some(62), &state);
        assert_eq!((p.step, p.alter), (Step::D, 1));
    }

    #[test]
    fn test_spell_tie_breaks_sharp_first() {
        let state = AccidentalState::new(0);
        let p = spell(61, 0, None, &state);
        assert_eq!((p.step, p.alter), (Step::C, 1));
    }

    #[test]
    fn test_spell_reuses_active_spelling() {
        let mut state = AccidentalState::new(0);
        // an Eb already sounded in this measure
        state.resolve(&Pitch::new(Step::E, -1, 4), false);
        // even ascending, re-using the flat identity is cheaper
        let p = spell(63, 0, Some(62), &state);
        assert_eq!((p.step, p.alter), (Step::E, -1));
    }

    #[test]
    fn test_spell_white_key() {
        let state = AccidentalState::new(0);
        let p = spell(60, 0, None, &state);
        assert_eq!((p.step, p.alter, p.octave), (Step::C, 0, 4));
    }
}
