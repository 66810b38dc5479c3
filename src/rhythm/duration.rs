//! Duration codec: ticks to written symbols and back
//!
//! Tick counts are scaled by `divisions` ticks per quarter note. A written
//! symbol is a base note value plus up to two dots; durations no single
//! symbol can express decompose into a chain of tied fragments.

use crate::models::{NoteType, Ticks, TimeModification};

/// Longest tie chain `decompose` will emit before giving up
pub const MAX_TIE_FRAGMENTS: usize = 16;

/// Undotted tick value of a base symbol, when it divides evenly at this
/// resolution
fn exact_base(note_type: NoteType, divisions: i64) -> Option<Ticks> {
    let whole = divisions * 4;
    let den = note_type.denominator();
    if whole % den == 0 && whole / den > 0 {
        Some(whole / den)
    } else {
        None
    }
}

/// Dotted value of a base, when the dots land on whole ticks
fn dotted(base: Ticks, dots: u32) -> Option<Ticks> {
    let num = base * ((1i64 << (dots + 1)) - 1);
    let den = 1i64 << dots;
    if num % den == 0 {
        Some(num / den)
    } else {
        None
    }
}

/// Exact written symbol for a tick count, largest base first, 0 then 1 then
/// 2 dots per base
pub fn encode(ticks: Ticks, divisions: i64) -> Option<(NoteType, u32)> {
    if ticks <= 0 || divisions <= 0 {
        return None;
    }
    for note_type in NoteType::ALL {
        let Some(base) = exact_base(note_type, divisions) else {
            continue;
        };
        for dots in 0..=2 {
            if dotted(base, dots) == Some(ticks) {
                return Some((note_type, dots));
            }
        }
    }
    None
}

/// Like [`encode`] but never fails: inexact durations fall back to the
/// undotted base nearest in tick value
pub fn encode_or_nearest(ticks: Ticks, divisions: i64) -> (NoteType, u32) {
    if let Some(hit) = encode(ticks, divisions) {
        return hit;
    }
    if divisions <= 0 {
        return (NoteType::Quarter, 0);
    }
    let mut best = NoteType::Quarter;
    let mut best_dist = i64::MAX;
    for note_type in NoteType::ALL {
        let base = divisions * 4 / note_type.denominator();
        let dist = (base - ticks).abs();
        if dist < best_dist {
            best = note_type;
            best_dist = dist;
        }
    }
    (best, 0)
}

/// Largest symbol whose value fits in `ticks`
fn largest_fitting(ticks: Ticks, divisions: i64) -> Option<(NoteType, u32, Ticks)> {
    let mut best: Option<(NoteType, u32, Ticks)> = None;
    for note_type in NoteType::ALL {
        let Some(base) = exact_base(note_type, divisions) else {
            continue;
        };
        for dots in 0..=2 {
            if let Some(value) = dotted(base, dots) {
                if value <= ticks && best.map_or(true, |(_, _, b)| value > b) {
                    best = Some((note_type, dots, value));
                }
            }
        }
    }
    best
}

/// Split a tick count into tied written fragments, largest first.
///
/// Returns None when a remainder smaller than any symbol is reached or the
/// fragment cap is hit; the caller then treats the duration as
/// unrepresentable by ties alone.
pub fn decompose(ticks: Ticks, divisions: i64) -> Option<Vec<(NoteType, u32)>> {
    if ticks <= 0 || divisions <= 0 {
        return None;
    }
    let mut remainder = ticks;
    let mut fragments = Vec::new();
    while remainder > 0 {
        if fragments.len() >= MAX_TIE_FRAGMENTS {
            return None;
        }
        let (note_type, dots, value) = largest_fitting(remainder, divisions)?;
        fragments.push((note_type, dots));
        remainder -= value;
    }
    Some(fragments)
}

/// Tick value of a written symbol at this resolution, when expressible
pub fn symbol_ticks(note_type: NoteType, dots: u32, divisions: i64) -> Option<Ticks> {
    dotted(exact_base(note_type, divisions)?, dots)
}

/// Written duration of a sounding tick count under an optional tuplet ratio.
///
/// A triplet eighth sounds for 2/3 of its written value, so the written
/// ticks are the sounding ticks scaled back up by actual/normal.
pub fn written_ticks(sounding: Ticks, time_mod: Option<TimeModification>) -> Ticks {
    match time_mod {
        Some(tm) => sounding * tm.actual_notes as i64 / tm.normal_notes as i64,
        None => sounding,
    }
}

/// Sounding duration of a written tick count under an optional tuplet ratio
pub fn sounding_ticks(written: Ticks, time_mod: Option<TimeModification>) -> Ticks {
    match time_mod {
        Some(tm) => written * tm.normal_notes as i64 / tm.actual_notes as i64,
        None => written,
    }
}

/// Written symbol of an event: its declared type when it has one, the
/// nearest encoding of its written ticks otherwise
pub fn written_symbol(
    note_type: Option<NoteType>,
    dots: u32,
    sounding: Ticks,
    time_mod: Option<TimeModification>,
    divisions: i64,
) -> (NoteType, u32) {
    match note_type {
        Some(nt) => (nt, dots),
        None => encode_or_nearest(written_ticks(sounding, time_mod), divisions),
    }
}

/// Group a sequential run of tuplet signatures into bracket spans.
///
/// Input is the time-modification of each sequential same-voice note; a
/// change of signature (or its absence) closes the active group. Returns
/// inclusive (first, last) index pairs; groups of fewer than two members
/// get no bracket and are omitted.
pub fn group_tuplet_runs(signatures: &[Option<TimeModification>]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut active: Option<(usize, TimeModification)> = None;
    for (i, sig) in signatures.iter().enumerate() {
        match (*sig, active) {
            (Some(s), Some((_, current))) if s == current => {}
            (Some(s), Some((start, _))) => {
                if i - start >= 2 {
                    runs.push((start, i - 1));
                }
                active = Some((i, s));
            }
            (Some(s), None) => {
                active = Some((i, s));
            }
            (None, Some((start, _))) => {
                if i - start >= 2 {
                    runs.push((start, i - 1));
                }
                active = None;
            }
            (None, None) => {}
        }
    }
    if let Some((start, _)) = active {
        if signatures.len() - start >= 2 {
            runs.push((start, signatures.len() - 1));
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_values() {
        assert_eq!(encode(480, 480), Some((NoteType::Quarter, 0)));
        assert_eq!(encode(1920, 480), Some((NoteType::Whole, 0)));
        assert_eq!(encode(240, 480), Some((NoteType::Eighth, 0)));
        assert_eq!(encode(15, 480), Some((NoteType::HundredTwentyEighth, 0)));
    }

    #[test]
    fn test_encode_dotted_values() {
        assert_eq!(encode(720, 480), Some((NoteType::Quarter, 1)));
        assert_eq!(encode(840, 480), Some((NoteType::Quarter, 2)));
        assert_eq!(encode(1440, 480), Some((NoteType::Half, 1)));
        assert_eq!(encode(360, 480), Some((NoteType::Eighth, 1)));
    }

    #[test]
    fn test_encode_prefers_largest_base() {
        // 1440 is both a dotted half and three tied quarters; the dotted
        // half wins because the half is tried first
        assert_eq!(encode(1440, 480), Some((NoteType::Half, 1)));
    }

    #[test]
    fn test_encode_inexact_is_none() {
        assert_eq!(encode(500, 480), None);
        assert_eq!(encode(0, 480), None);
        assert_eq!(encode(-480, 480), None);
    }

    #[test]
    fn test_encode_skips_bases_below_resolution() {
        // at divisions=2 a 16th is 0.5 ticks and must not match anything
        assert_eq!(encode(1, 2), Some((NoteType::Eighth, 0)));
        assert_eq!(encode(3, 2), Some((NoteType::Quarter, 1)));
    }

    #[test]
    fn test_nearest_fallback() {
        assert_eq!(encode_or_nearest(500, 480), (NoteType::Quarter, 0));
        assert_eq!(encode_or_nearest(1900, 480), (NoteType::Whole, 0));
        assert_eq!(encode_or_nearest(1, 480), (NoteType::HundredTwentyEighth, 0));
    }

    #[test]
    fn test_decompose_exact_values_are_single() {
        assert_eq!(decompose(720, 480), Some(vec![(NoteType::Quarter, 1)]));
    }

    #[test]
    fn test_decompose_tied_chain() {
        // 600 = quarter + 16th
        assert_eq!(
            decompose(600, 480),
            Some(vec![(NoteType::Quarter, 0), (NoteType::Sixteenth, 0)])
        );
        // 5 quarters = whole + quarter
        assert_eq!(
            decompose(2400, 480),
            Some(vec![(NoteType::Whole, 0), (NoteType::Quarter, 0)])
        );
    }

    #[test]
    fn test_decompose_sums_back() {
        let divisions = 480;
        for ticks in [15, 240, 705, 1920, 1935, 2895] {
            let frags = decompose(ticks, divisions).unwrap();
            let total: i64 = frags
                .iter()
                .map(|&(nt, dots)| {
                    let base = nt.ticks(divisions);
                    base * ((1 << (dots + 1)) - 1) / (1 << dots)
                })
                .sum();
            assert_eq!(total, ticks, "decompose({ticks}) must sum back");
        }
    }

    #[test]
    fn test_decompose_unrepresentable_remainder() {
        // smallest symbol at divisions=480 is 15 ticks
        assert_eq!(decompose(487, 480), None);
    }

    #[test]
    fn test_written_ticks_triplet() {
        let tm = TimeModification::new(3, 2);
        assert_eq!(written_ticks(160, tm), 240);
        assert_eq!(sounding_ticks(240, tm), 160);
        assert_eq!(written_ticks(160, None), 160);
    }

    #[test]
    fn test_group_tuplet_runs() {
        let t32 = TimeModification::new(3, 2);
        let t54 = TimeModification::new(5, 4);
        let sigs = [None, t32, t32, t32, None, t54, t32, t32];
        // the lone 5:4 between groups is too short for a bracket
        assert_eq!(group_tuplet_runs(&sigs), vec![(1, 3), (6, 7)]);
    }

    #[test]
    fn test_group_tuplet_single_discarded() {
        let t32 = TimeModification::new(3, 2);
        assert_eq!(group_tuplet_runs(&[None, t32, None]), vec![]);
    }

    #[test]
    fn test_group_tuplet_run_to_end() {
        let t32 = TimeModification::new(3, 2);
        assert_eq!(group_tuplet_runs(&[t32, t32, t32]), vec![(0, 2)]);
    }
}
