//! Beam derivation over a voice timeline
//!
//! Sources that carry no explicit beam information get their beams derived
//! here: unbroken runs of eighth-or-shorter notes beam together, split at
//! felt-beat boundaries. Sources that do mark beams keep them untouched.

use crate::models::{AttributeState, Beam, BeamValue, MeasureEvent, Score, Ticks, TimeSignature};
use crate::rhythm::timing::{self, MeasureTimeline};

/// Beat length used to split derived beams.
///
/// Compound meters (denominator 8 or finer, numerator divisible by three)
/// beam in felt beats of three written beats.
pub fn beat_ticks(divisions: i64, time: &TimeSignature) -> Ticks {
    let unit = divisions * 4 / time.beat_type as i64;
    if time.beat_type >= 8 && time.beats % 3 == 0 {
        unit * 3
    } else {
        unit
    }
}

/// True when any note of the (staff, voice) lane already carries beams
pub fn lane_has_explicit_beams(events: &[MeasureEvent], staff: u32, voice: u32) -> bool {
    events.iter().any(|event| match event {
        MeasureEvent::Note(n) => n.staff == staff && n.voice == voice && !n.beams.is_empty(),
        _ => false,
    })
}

/// Assign begin/continue/end and hooks across one beamed run.
///
/// `levels[i]` is the member's own beam count (1 for an eighth). At each
/// level a member continues when both neighbors reach it, begins or ends at
/// the run edges, and degrades to a hook when neither neighbor reaches it:
/// forward-pointing on the run's first member, backward-pointing elsewhere.
pub fn assign_run(levels: &[u32]) -> Vec<Vec<Beam>> {
    let n = levels.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut beams = Vec::new();
        for level in 1..=levels[i] {
            let left = i > 0 && levels[i - 1] >= level;
            let right = i + 1 < n && levels[i + 1] >= level;
            let value = match (left, right) {
                (true, true) => BeamValue::Continue,
                (false, true) => BeamValue::Begin,
                (true, false) => BeamValue::End,
                (false, false) => {
                    if i == 0 {
                        BeamValue::ForwardHook
                    } else {
                        BeamValue::BackwardHook
                    }
                }
            };
            beams.push(Beam {
                number: level,
                value,
            });
        }
        out.push(beams);
    }
    out
}

fn flush(runs: &mut Vec<Vec<usize>>, current: &mut Vec<usize>) {
    if current.len() >= 2 {
        runs.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Derive beams for one (staff, voice) lane in place.
///
/// Chord members and grace notes are transparent: they neither join nor
/// break a run. Rests, quarter-or-longer notes, onset gaps and backups all
/// close the active run; a positive `beat` additionally closes it whenever
/// a member starts in a later beat than its predecessor. Lanes with
/// explicit beams are left alone.
pub fn derive_beams(
    events: &mut [MeasureEvent],
    times: &MeasureTimeline,
    staff: u32,
    voice: u32,
    beat: Ticks,
) {
    if lane_has_explicit_beams(events, staff, voice) {
        return;
    }

    let mut runs: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut prev: Option<(Ticks, Ticks)> = None;
    for (i, event) in events.iter().enumerate() {
        if matches!(event, MeasureEvent::Backup { .. }) {
            flush(&mut runs, &mut current);
            prev = None;
            continue;
        }
        let (level, duration) = match event {
            MeasureEvent::Note(n)
                if n.staff == staff && n.voice == voice && !n.chord && !n.grace =>
            {
                (n.note_type.map_or(0, |t| t.beam_level()), n.duration)
            }
            MeasureEvent::Rest(r) if r.staff == staff && r.voice == voice => (0, r.duration),
            _ => continue,
        };
        let onset = times.events[i].onset;
        if level == 0 {
            flush(&mut runs, &mut current);
            prev = None;
            continue;
        }
        let gap = prev.map_or(false, |(_, end)| end != onset);
        let crossed = beat > 0
            && prev.map_or(false, |(prev_onset, _)| {
                prev_onset.div_euclid(beat) != onset.div_euclid(beat)
            });
        if gap || crossed {
            flush(&mut runs, &mut current);
        }
        current.push(i);
        prev = Some((onset, onset + duration));
    }
    flush(&mut runs, &mut current);

    for run in runs {
        let levels: Vec<u32> = run
            .iter()
            .map(|&i| match &events[i] {
                MeasureEvent::Note(n) => n.note_type.map_or(0, |t| t.beam_level()),
                _ => 0,
            })
            .collect();
        let assigned = assign_run(&levels);
        for (&i, beams) in run.iter().zip(assigned) {
            if let MeasureEvent::Note(n) = &mut events[i] {
                n.beams = beams;
            }
        }
    }
}

/// Derive beams for every lane of every measure that lacks them.
///
/// Exporters to formats with explicit beam state run this first so their
/// output beams the way an engraver would.
pub fn derive_score_beams(score: &mut Score) {
    for part in &mut score.parts {
        let mut state = AttributeState::default();
        for measure in &mut part.measures {
            if let Some(attrs) = &measure.attributes {
                state.apply(attrs);
            }
            let beat = beat_ticks(state.divisions, &state.time);
            let times = timing::timeline(&measure.events);
            for staff in timing::measure_staves(&measure.events) {
                for voice in timing::staff_voices(&measure.events, staff) {
                    derive_beams(&mut measure.events, &times, staff, voice, beat);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Note, NoteType, Pitch, Rest, Step};

    fn note(note_type: NoteType, divisions: i64) -> MeasureEvent {
        let duration = note_type.ticks(divisions);
        let mut n = Note::new(Pitch::new(Step::C, 0, 4), duration, 1, 1);
        n.note_type = Some(note_type);
        MeasureEvent::Note(n)
    }

    fn beams_of(event: &MeasureEvent) -> Vec<(u32, BeamValue)> {
        match event {
            MeasureEvent::Note(n) => n.beams.iter().map(|b| (b.number, b.value)).collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_assign_run_uniform_sixteenths() {
        let out = assign_run(&[2, 2, 2, 2]);
        assert_eq!(
            out[0],
            vec![
                Beam { number: 1, value: BeamValue::Begin },
                Beam { number: 2, value: BeamValue::Begin }
            ]
        );
        assert_eq!(out[1][0].value, BeamValue::Continue);
        assert_eq!(out[1][1].value, BeamValue::Continue);
        assert_eq!(out[3][0].value, BeamValue::End);
        assert_eq!(out[3][1].value, BeamValue::End);
    }

    #[test]
    fn test_assign_run_hooks() {
        // sixteenth, eighth, sixteenth
        let out = assign_run(&[2, 1, 2]);
        assert_eq!(out[0][1].value, BeamValue::ForwardHook);
        assert_eq!(out[1], vec![Beam { number: 1, value: BeamValue::Continue }]);
        assert_eq!(out[2][1].value, BeamValue::BackwardHook);
    }

    #[test]
    fn test_derive_splits_at_beat() {
        // four eighths in 2/4: two beamed pairs
        let mut events = vec![
            note(NoteType::Eighth, 480),
            note(NoteType::Eighth, 480),
            note(NoteType::Eighth, 480),
            note(NoteType::Eighth, 480),
        ];
        let times = timing::timeline(&events);
        derive_beams(&mut events, &times, 1, 1, 480);
        assert_eq!(beams_of(&events[0]), vec![(1, BeamValue::Begin)]);
        assert_eq!(beams_of(&events[1]), vec![(1, BeamValue::End)]);
        assert_eq!(beams_of(&events[2]), vec![(1, BeamValue::Begin)]);
        assert_eq!(beams_of(&events[3]), vec![(1, BeamValue::End)]);
    }

    #[test]
    fn test_derive_quarter_breaks_run() {
        let mut events = vec![
            note(NoteType::Eighth, 480),
            note(NoteType::Quarter, 480),
            note(NoteType::Eighth, 480),
            note(NoteType::Eighth, 480),
        ];
        let times = timing::timeline(&events);
        derive_beams(&mut events, &times, 1, 1, 0);
        assert_eq!(beams_of(&events[0]), vec![]);
        assert_eq!(beams_of(&events[1]), vec![]);
        assert_eq!(beams_of(&events[2]), vec![(1, BeamValue::Begin)]);
        assert_eq!(beams_of(&events[3]), vec![(1, BeamValue::End)]);
    }

    #[test]
    fn test_derive_rest_breaks_run() {
        let mut events = vec![
            note(NoteType::Eighth, 480),
            MeasureEvent::Rest(Rest::new(240, 1, 1)),
            note(NoteType::Eighth, 480),
        ];
        let times = timing::timeline(&events);
        derive_beams(&mut events, &times, 1, 1, 0);
        assert_eq!(beams_of(&events[0]), vec![]);
        assert_eq!(beams_of(&events[2]), vec![]);
    }

    #[test]
    fn test_derive_backup_resets_run() {
        let mut events = vec![
            note(NoteType::Eighth, 480),
            MeasureEvent::Backup { duration: 240 },
            note(NoteType::Eighth, 480),
        ];
        let times = timing::timeline(&events);
        derive_beams(&mut events, &times, 1, 1, 0);
        assert_eq!(beams_of(&events[0]), vec![]);
        assert_eq!(beams_of(&events[2]), vec![]);
    }

    #[test]
    fn test_derive_grace_is_transparent() {
        let mut grace = Note::new(Pitch::new(Step::D, 0, 4), 0, 1, 1);
        grace.grace = true;
        grace.note_type = Some(NoteType::Eighth);
        let mut events = vec![
            note(NoteType::Eighth, 480),
            MeasureEvent::Note(grace),
            note(NoteType::Eighth, 480),
        ];
        let times = timing::timeline(&events);
        derive_beams(&mut events, &times, 1, 1, 480);
        assert_eq!(beams_of(&events[0]), vec![(1, BeamValue::Begin)]);
        assert_eq!(beams_of(&events[1]), vec![]);
        assert_eq!(beams_of(&events[2]), vec![(1, BeamValue::End)]);
    }

    #[test]
    fn test_explicit_beams_disable_derivation() {
        let mut events = vec![
            note(NoteType::Eighth, 480),
            note(NoteType::Eighth, 480),
            note(NoteType::Eighth, 480),
        ];
        if let MeasureEvent::Note(n) = &mut events[0] {
            n.beams = vec![Beam { number: 1, value: BeamValue::Begin }];
        }
        let times = timing::timeline(&events);
        derive_beams(&mut events, &times, 1, 1, 480);
        // the hand-authored state survives untouched
        assert_eq!(beams_of(&events[0]), vec![(1, BeamValue::Begin)]);
        assert_eq!(beams_of(&events[1]), vec![]);
        assert_eq!(beams_of(&events[2]), vec![]);
    }

    #[test]
    fn test_beat_ticks_compound_meter() {
        assert_eq!(beat_ticks(480, &TimeSignature { beats: 4, beat_type: 4 }), 480);
        assert_eq!(beat_ticks(480, &TimeSignature { beats: 6, beat_type: 8 }), 720);
        assert_eq!(beat_ticks(480, &TimeSignature { beats: 3, beat_type: 4 }), 480);
        assert_eq!(beat_ticks(480, &TimeSignature { beats: 7, beat_type: 8 }), 240);
    }
}
