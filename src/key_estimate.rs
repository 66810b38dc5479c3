//! Key signature estimation from note content
//!
//! Used when a source carries notes but no key signature. Every trial key
//! is scored by how far the notes' spellings sit from its diatonic
//! defaults, weighted by duration so passing ornaments don't outvote held
//! chords.

use crate::models::diatonic_alter;
use crate::spelling::spelling_candidates;

/// One note for estimation purposes: its pitch class and its tick weight
#[derive(Debug, Clone, Copy)]
pub struct WeightedPitch {
    pub semitone: i32,
    /// Duration in ticks; zero-length notes count as weight 1
    pub weight: i64,
}

/// Trial keys nearest C first, sharp side before flat
const FIFTHS_ORDER: [i32; 15] = [0, 1, -1, 2, -2, 3, -3, 4, -4, 5, -5, 6, -6, 7, -7];

/// Weighted misfit of the notes against one trial key, in tick units.
///
/// Each note contributes its cheapest spelling: the candidate whose
/// alteration is closest to the key's default for its step.
pub fn fit_penalty(notes: &[WeightedPitch], fifths: i32) -> i64 {
    notes
        .iter()
        .map(|note| {
            let misfit = spelling_candidates(note.semitone)
                .iter()
                .map(|&(step, alter)| (alter - diatonic_alter(step, fifths)).abs() as i64)
                .min()
                .unwrap_or(0);
            misfit * note.weight.max(1)
        })
        .sum()
}

/// Best single key for a whole track
pub fn estimate_track_fifths(notes: &[WeightedPitch]) -> i32 {
    let mut best = 0;
    let mut best_penalty = i64::MAX;
    for &fifths in &FIFTHS_ORDER {
        let penalty = fit_penalty(notes, fifths);
        if penalty < best_penalty {
            best = fifths;
            best_penalty = penalty;
        }
    }
    best
}

/// Switching keys must pay for itself by at least this much
fn damping_threshold(total_weight: i64) -> i64 {
    (total_weight / 4).max(360)
}

/// Best key per measure, damped so one stray note cannot flip the key.
///
/// A measure keeps the previous measure's key unless some other key beats
/// it by more than `max(360, totalWeight/4)` tick units. Empty measures
/// keep the previous key; the first measure's "previous" is `fallback`.
pub fn estimate_by_measure(measures: &[Vec<WeightedPitch>], fallback: i32) -> Vec<i32> {
    let mut out = Vec::with_capacity(measures.len());
    let mut prev = fallback;
    for notes in measures {
        if notes.is_empty() {
            out.push(prev);
            continue;
        }
        let prev_penalty = fit_penalty(notes, prev);
        let mut best = prev;
        let mut best_penalty = prev_penalty;
        for &fifths in &FIFTHS_ORDER {
            let penalty = fit_penalty(notes, fifths);
            if penalty < best_penalty {
                best = fifths;
                best_penalty = penalty;
            }
        }
        let total: i64 = notes.iter().map(|n| n.weight.max(1)).sum();
        if prev_penalty - best_penalty > damping_threshold(total) {
            prev = best;
        }
        out.push(prev);
    }
    out
}
