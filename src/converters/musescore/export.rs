//! Pivot to MuseScore
//!
//! The partwise pivot becomes trackwise: each staff serializes its own
//! measure list, voices inside a measure become `<voice>` streams, and
//! everything that connects two moments (ties, slurs, hairpins, pedal and
//! octave lines) becomes a pair of `<Spanner>` tokens pointing at each
//! other through relative measure/fraction offsets. Those offsets are
//! resolved up front, before any text is emitted.

use std::collections::HashMap;

use num_rational::Rational32;

use crate::beaming;
use crate::diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
use crate::metadata;
use crate::models::{
    AttributeState, BeamValue, DirectionKind, GlissandoMark, Harmony, Measure, MeasureEvent,
    Note, NoteType, OctaveShiftKind, Part, PedalKind, Pitch, Placement, Rest, Score, SlurMark,
    StartStop, Ticks, TimeModification, WedgeKind,
};
use crate::options::ConvertOptions;
use crate::rhythm::{duration, timing};
use crate::spelling::AccidentalState;
use crate::xml::xml_escape;

use super::{
    accidental_subtype, clef_type, fold_states, format_fraction, format_rational, fraction_of,
    marks, qps_text, tempo_qps, StaffLayout, MAX_VOICES, MU_DIVISIONS,
};

/// Serialize the pivot score as a MuseScore 3 project
pub fn write_musescore(score: &Score, options: &ConvertOptions) -> String {
    let mut prepared = score.clone();
    beaming::derive_score_beams(&mut prepared);

    let layout = StaffLayout::build(&prepared);
    let states: Vec<Vec<AttributeState>> =
        prepared.parts.iter().map(|p| fold_states(p)).collect();

    let mut diagnostics = Vec::new();
    scan_excess_voices(&prepared, &mut diagnostics);
    let spans = SpanTable::build(&prepared, &states, &mut diagnostics);

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<museScore version=\"3.02\">\n");
    out.push_str("  <Score>\n");
    out.push_str(&format!("    <Division>{MU_DIVISIONS}</Division>\n"));
    write_meta_tags(&mut out, &prepared, &diagnostics, options);
    for (pi, part) in prepared.parts.iter().enumerate() {
        write_part(&mut out, part, &layout, pi);
    }
    for (pi, part) in prepared.parts.iter().enumerate() {
        for local in 1..=layout.staves(pi) {
            write_staff(&mut out, part, &states[pi], &spans, &layout, pi, local);
        }
    }
    out.push_str("  </Score>\n");
    out.push_str("</museScore>\n");
    out
}

fn write_meta_tags(
    out: &mut String,
    score: &Score,
    extra: &[Diagnostic],
    options: &ConvertOptions,
) {
    if let Some(title) = &score.title {
        out.push_str(&format!(
            "    <metaTag name=\"workTitle\">{}</metaTag>\n",
            xml_escape(title)
        ));
    }
    let mut fields: Vec<(String, String)> = score.misc_fields.clone();
    for (i, diag) in score.diagnostics.iter().chain(extra).enumerate() {
        fields.push((
            format!("{}{}", metadata::DIAGNOSTIC_FIELD_PREFIX, i),
            metadata::diagnostic_field_value(diag),
        ));
    }
    if options.debug_metadata {
        fields.extend(metadata::debug_audit_fields(score));
    }
    for (name, value) in &fields {
        out.push_str(&format!(
            "    <metaTag name=\"{}\">{}</metaTag>\n",
            xml_escape(name),
            xml_escape(value)
        ));
    }
}

fn write_part(out: &mut String, part: &Part, layout: &StaffLayout, pi: usize) {
    out.push_str("    <Part>\n");
    for local in 1..=layout.staves(pi) {
        out.push_str(&format!(
            "      <Staff id=\"{}\">\n",
            layout.global(pi, local)
        ));
        out.push_str("        <StaffType group=\"pitched\">\n");
        out.push_str("          <name>stdNormal</name>\n");
        out.push_str("        </StaffType>\n");
        out.push_str("      </Staff>\n");
    }
    if let Some(name) = &part.name {
        out.push_str(&format!(
            "      <trackName>{}</trackName>\n",
            xml_escape(name)
        ));
        out.push_str("      <Instrument>\n");
        out.push_str(&format!(
            "        <longName>{}</longName>\n",
            xml_escape(name)
        ));
        out.push_str(&format!(
            "        <trackName>{}</trackName>\n",
            xml_escape(name)
        ));
        out.push_str("      </Instrument>\n");
    }
    out.push_str("    </Part>\n");
}

/// More lanes than MuseScore's four voice slots can carry
fn scan_excess_voices(score: &Score, diagnostics: &mut Vec<Diagnostic>) {
    for part in &score.parts {
        for (mi, measure) in part.measures.iter().enumerate() {
            let times = timing::timeline(&measure.events);
            for staff in timing::measure_staves(&measure.events) {
                let mut lanes = 0;
                for voice in timing::staff_voices(&measure.events, staff) {
                    let clusters =
                        timing::voice_clusters(&measure.events, &times, staff, voice);
                    lanes += timing::slice_lanes(clusters).len();
                }
                if lanes > MAX_VOICES {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticKind::ExcessVoices,
                            DiagnosticAction::Dropped,
                            format!("{lanes} concurrent voices, keeping {MAX_VOICES}"),
                        )
                        .at_measure(mi as u32 + 1)
                        .at_staff(staff),
                    );
                }
            }
        }
    }
}

type NoteKey = (usize, usize, usize);
type Offset = (i32, Rational32);

fn offset_between(start: (usize, Rational32), end: (usize, Rational32)) -> Offset {
    (end.0 as i32 - start.0 as i32, end.1 - start.1)
}

fn negate((dm, df): Offset) -> Offset {
    (-dm, -df)
}

/// Everything positional resolved before streaming: tie and glissando
/// offsets per note, slur tokens per chord, and the staff-anchored blocks
/// (dynamics, texts, tempos, chord symbols, line spanners) to interleave
/// at their beats.
struct SpanTable {
    tie_next: HashMap<NoteKey, Offset>,
    tie_prev: HashMap<NoteKey, Offset>,
    gliss_next: HashMap<NoteKey, Offset>,
    gliss_prev: HashMap<NoteKey, Offset>,
    slur_starts: HashMap<NoteKey, Vec<Offset>>,
    slur_stops: HashMap<NoteKey, Vec<Offset>>,
    /// (part, measure, local staff) to rendered blocks at their onsets
    extras: HashMap<(usize, usize, u32), Vec<(Ticks, usize, String)>>,
}

struct NoteEntry {
    mi: usize,
    ei: usize,
    staff: u32,
    voice: u32,
    midi: i32,
    pos: (usize, Rational32),
    tie_start: bool,
    tie_stop: bool,
    slurs: Vec<SlurMark>,
    glissandos: Vec<GlissandoMark>,
}

impl SpanTable {
    fn build(
        score: &Score,
        states: &[Vec<AttributeState>],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> SpanTable {
        let mut table = SpanTable {
            tie_next: HashMap::new(),
            tie_prev: HashMap::new(),
            gliss_next: HashMap::new(),
            gliss_prev: HashMap::new(),
            slur_starts: HashMap::new(),
            slur_stops: HashMap::new(),
            extras: HashMap::new(),
        };
        for (pi, part) in score.parts.iter().enumerate() {
            table.collect_note_spans(pi, part, &states[pi], diagnostics);
            table.collect_directions(pi, part, &states[pi], diagnostics);
        }
        for list in table.extras.values_mut() {
            list.sort_by_key(|&(onset, seq, _)| (onset, seq));
        }
        table
    }

    fn push_extra(
        &mut self,
        pi: usize,
        mi: usize,
        staff: u32,
        onset: Ticks,
        seq: usize,
        block: String,
    ) {
        self.extras
            .entry((pi, mi, staff))
            .or_default()
            .push((onset, seq, block));
    }

    fn extras_for(&self, pi: usize, mi: usize, staff: u32) -> Vec<(Ticks, usize, String)> {
        self.extras
            .get(&(pi, mi, staff))
            .cloned()
            .unwrap_or_default()
    }

    fn collect_note_spans(
        &mut self,
        pi: usize,
        part: &Part,
        pstates: &[AttributeState],
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let mut entries: Vec<NoteEntry> = Vec::new();
        for (mi, measure) in part.measures.iter().enumerate() {
            let times = timing::timeline(&measure.events);
            let div = pstates[mi].divisions;
            for (ei, event) in measure.events.iter().enumerate() {
                if let MeasureEvent::Note(n) = event {
                    entries.push(NoteEntry {
                        mi,
                        ei,
                        staff: n.staff,
                        voice: n.voice,
                        midi: n.pitch.midi(),
                        pos: (mi, fraction_of(times.events[ei].onset, div)),
                        tie_start: n.tie_start,
                        tie_stop: n.tie_stop,
                        slurs: n.notations.slurs.clone(),
                        glissandos: n.notations.glissandos.clone(),
                    });
                }
            }
        }

        // a tie start pairs with the next unclaimed stop on the same
        // staff, voice and sounding pitch
        let mut claimed = vec![false; entries.len()];
        for i in 0..entries.len() {
            if !entries[i].tie_start {
                continue;
            }
            let hit = (i + 1..entries.len()).find(|&j| {
                !claimed[j]
                    && entries[j].tie_stop
                    && entries[j].staff == entries[i].staff
                    && entries[j].voice == entries[i].voice
                    && entries[j].midi == entries[i].midi
            });
            match hit {
                Some(j) => {
                    claimed[j] = true;
                    let delta = offset_between(entries[i].pos, entries[j].pos);
                    self.tie_next
                        .insert((pi, entries[i].mi, entries[i].ei), delta);
                    self.tie_prev
                        .insert((pi, entries[j].mi, entries[j].ei), negate(delta));
                }
                None => diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::UnresolvedSpanner,
                        DiagnosticAction::Dropped,
                        "tie start without a matching stop",
                    )
                    .at_measure(entries[i].mi as u32 + 1)
                    .at_staff(entries[i].staff)
                    .at_voice(entries[i].voice),
                ),
            }
        }
        for (j, entry) in entries.iter().enumerate() {
            if entry.tie_stop && !claimed[j] {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::UnresolvedSpanner,
                        DiagnosticAction::Dropped,
                        "tie stop without a matching start",
                    )
                    .at_measure(entry.mi as u32 + 1)
                    .at_staff(entry.staff)
                    .at_voice(entry.voice),
                );
            }
        }

        let mut open_slurs: HashMap<u32, usize> = HashMap::new();
        let mut open_gliss: HashMap<u32, usize> = HashMap::new();
        for idx in 0..entries.len() {
            for mark in &entries[idx].slurs {
                match mark.kind {
                    StartStop::Start => {
                        open_slurs.insert(mark.number, idx);
                    }
                    StartStop::Stop => match open_slurs.remove(&mark.number) {
                        Some(s) => {
                            let delta = offset_between(entries[s].pos, entries[idx].pos);
                            self.slur_starts
                                .entry((pi, entries[s].mi, entries[s].ei))
                                .or_default()
                                .push(delta);
                            self.slur_stops
                                .entry((pi, entries[idx].mi, entries[idx].ei))
                                .or_default()
                                .push(negate(delta));
                        }
                        None => diagnostics.push(
                            Diagnostic::new(
                                DiagnosticKind::UnresolvedSpanner,
                                DiagnosticAction::Dropped,
                                "slur stop without a matching start",
                            )
                            .at_measure(entries[idx].mi as u32 + 1)
                            .at_staff(entries[idx].staff)
                            .at_voice(entries[idx].voice),
                        ),
                    },
                }
            }
            for mark in &entries[idx].glissandos {
                match mark.kind {
                    StartStop::Start => {
                        open_gliss.insert(mark.number, idx);
                    }
                    StartStop::Stop => match open_gliss.remove(&mark.number) {
                        Some(s) => {
                            let delta = offset_between(entries[s].pos, entries[idx].pos);
                            self.gliss_next
                                .insert((pi, entries[s].mi, entries[s].ei), delta);
                            self.gliss_prev
                                .insert((pi, entries[idx].mi, entries[idx].ei), negate(delta));
                        }
                        None => diagnostics.push(
                            Diagnostic::new(
                                DiagnosticKind::UnresolvedSpanner,
                                DiagnosticAction::Dropped,
                                "glissando stop without a matching start",
                            )
                            .at_measure(entries[idx].mi as u32 + 1)
                            .at_staff(entries[idx].staff)
                            .at_voice(entries[idx].voice),
                        ),
                    },
                }
            }
        }
        for (_, s) in open_slurs {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedSpanner,
                    DiagnosticAction::Dropped,
                    "slur start never closed",
                )
                .at_measure(entries[s].mi as u32 + 1)
                .at_staff(entries[s].staff),
            );
        }
        for (_, s) in open_gliss {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedSpanner,
                    DiagnosticAction::Dropped,
                    "glissando start never closed",
                )
                .at_measure(entries[s].mi as u32 + 1)
                .at_staff(entries[s].staff),
            );
        }
    }

    fn collect_directions(
        &mut self,
        pi: usize,
        part: &Part,
        pstates: &[AttributeState],
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let mut seq = 0usize;
        let mut open_wedges: HashMap<u32, (usize, Ticks, u8, Option<Placement>)> = HashMap::new();
        let mut open_pedals: HashMap<u32, (usize, Ticks)> = HashMap::new();
        let mut open_octaves: HashMap<u32, (usize, Ticks, &'static str)> = HashMap::new();
        for (mi, measure) in part.measures.iter().enumerate() {
            let times = timing::timeline(&measure.events);
            for (ei, event) in measure.events.iter().enumerate() {
                let onset = times.events[ei].onset;
                match event {
                    MeasureEvent::Direction(d) => {
                        seq += 1;
                        match &d.kind {
                            DirectionKind::Dynamic(text) => {
                                self.push_extra(
                                    pi,
                                    mi,
                                    d.staff,
                                    onset,
                                    seq,
                                    dynamic_block(text, d.placement),
                                );
                            }
                            DirectionKind::Words(text) => {
                                self.push_extra(
                                    pi,
                                    mi,
                                    d.staff,
                                    onset,
                                    seq,
                                    staff_text_block(text, d.placement),
                                );
                            }
                            DirectionKind::Metronome {
                                beat_unit,
                                per_minute,
                            } => match tempo_qps(*beat_unit, per_minute) {
                                Some(qps) => self.push_extra(
                                    pi,
                                    mi,
                                    d.staff,
                                    onset,
                                    seq,
                                    tempo_block(qps, per_minute),
                                ),
                                None => {
                                    diagnostics.push(
                                        Diagnostic::new(
                                            DiagnosticKind::UnmappedMark,
                                            DiagnosticAction::Substituted,
                                            format!(
                                                "non-numeric tempo '{per_minute}' written as staff text"
                                            ),
                                        )
                                        .at_measure(mi as u32 + 1)
                                        .at_staff(d.staff),
                                    );
                                    self.push_extra(
                                        pi,
                                        mi,
                                        d.staff,
                                        onset,
                                        seq,
                                        staff_text_block(per_minute, d.placement),
                                    );
                                }
                            },
                            DirectionKind::Pedal(PedalKind::Start) => {
                                if let Some((sm, _)) = open_pedals.insert(d.staff, (mi, onset)) {
                                    diagnostics.push(never_closed("pedal", sm, d.staff));
                                }
                            }
                            DirectionKind::Pedal(PedalKind::Change) => {
                                // a change releases the open line and opens a new one
                                if let Some(start) = open_pedals.remove(&d.staff) {
                                    self.push_pedal(pi, d.staff, start, (mi, onset), pstates, &mut seq);
                                }
                                open_pedals.insert(d.staff, (mi, onset));
                            }
                            DirectionKind::Pedal(PedalKind::Stop) => {
                                match open_pedals.remove(&d.staff) {
                                    Some(start) => self.push_pedal(
                                        pi,
                                        d.staff,
                                        start,
                                        (mi, onset),
                                        pstates,
                                        &mut seq,
                                    ),
                                    None => diagnostics.push(no_start("pedal", mi, d.staff)),
                                }
                            }
                            DirectionKind::Wedge(WedgeKind::Crescendo) => {
                                if let Some((sm, ..)) =
                                    open_wedges.insert(d.staff, (mi, onset, 0, d.placement))
                                {
                                    diagnostics.push(never_closed("hairpin", sm, d.staff));
                                }
                            }
                            DirectionKind::Wedge(WedgeKind::Diminuendo) => {
                                if let Some((sm, ..)) =
                                    open_wedges.insert(d.staff, (mi, onset, 1, d.placement))
                                {
                                    diagnostics.push(never_closed("hairpin", sm, d.staff));
                                }
                            }
                            DirectionKind::Wedge(WedgeKind::Stop) => {
                                match open_wedges.remove(&d.staff) {
                                    Some((sm, sonset, subtype, placement)) => {
                                        let payload = hairpin_payload(subtype, placement);
                                        self.push_pair(
                                            pi,
                                            d.staff,
                                            "HairPin",
                                            payload,
                                            (sm, sonset),
                                            (mi, onset),
                                            pstates,
                                            &mut seq,
                                        );
                                    }
                                    None => diagnostics.push(no_start("hairpin", mi, d.staff)),
                                }
                            }
                            DirectionKind::OctaveShift { kind, size } => match kind {
                                OctaveShiftKind::Down | OctaveShiftKind::Up => {
                                    let subtype = ottava_subtype(*kind, *size);
                                    if let Some((sm, ..)) =
                                        open_octaves.insert(d.staff, (mi, onset, subtype))
                                    {
                                        diagnostics.push(never_closed("ottava", sm, d.staff));
                                    }
                                }
                                OctaveShiftKind::Stop => match open_octaves.remove(&d.staff) {
                                    Some((sm, sonset, subtype)) => {
                                        let payload = format!(
                                            "            <Ottava>\n              <subtype>{subtype}</subtype>\n            </Ottava>\n"
                                        );
                                        self.push_pair(
                                            pi,
                                            d.staff,
                                            "Ottava",
                                            payload,
                                            (sm, sonset),
                                            (mi, onset),
                                            pstates,
                                            &mut seq,
                                        );
                                    }
                                    None => diagnostics.push(no_start("ottava", mi, d.staff)),
                                },
                            },
                        }
                    }
                    MeasureEvent::Harmony(h) => {
                        seq += 1;
                        self.push_extra(pi, mi, 1, onset, seq, harmony_block(h));
                    }
                    _ => {}
                }
            }
        }
        for (staff, (sm, ..)) in open_wedges {
            diagnostics.push(never_closed("hairpin", sm, staff));
        }
        for (staff, (sm, _)) in open_pedals {
            diagnostics.push(never_closed("pedal", sm, staff));
        }
        for (staff, (sm, ..)) in open_octaves {
            diagnostics.push(never_closed("ottava", sm, staff));
        }
    }

    fn push_pedal(
        &mut self,
        pi: usize,
        staff: u32,
        start: (usize, Ticks),
        end: (usize, Ticks),
        pstates: &[AttributeState],
        seq: &mut usize,
    ) {
        self.push_pair(
            pi,
            staff,
            "Pedal",
            String::from("            <Pedal/>\n"),
            start,
            end,
            pstates,
            seq,
        );
    }

    /// Start token at the start beat, end token at the end beat, each
    /// pointing at the other
    fn push_pair(
        &mut self,
        pi: usize,
        staff: u32,
        ty: &str,
        payload: String,
        start: (usize, Ticks),
        end: (usize, Ticks),
        pstates: &[AttributeState],
        seq: &mut usize,
    ) {
        let spos = (start.0, fraction_of(start.1, pstates[start.0].divisions));
        let epos = (end.0, fraction_of(end.1, pstates[end.0].divisions));
        let delta = offset_between(spos, epos);
        *seq += 1;
        let mut block = format!("          <Spanner type=\"{ty}\">\n");
        block.push_str(&payload);
        block.push_str(&link_lines("next", delta));
        block.push_str("          </Spanner>\n");
        self.push_extra(pi, start.0, staff, start.1, *seq, block);
        *seq += 1;
        let mut block = format!("          <Spanner type=\"{ty}\">\n");
        block.push_str(&link_lines("prev", negate(delta)));
        block.push_str("          </Spanner>\n");
        self.push_extra(pi, end.0, staff, end.1, *seq, block);
    }
}

fn never_closed(what: &str, start_measure: usize, staff: u32) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::UnresolvedSpanner,
        DiagnosticAction::Dropped,
        format!("{what} start never closed"),
    )
    .at_measure(start_measure as u32 + 1)
    .at_staff(staff)
}

fn no_start(what: &str, measure: usize, staff: u32) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::UnresolvedSpanner,
        DiagnosticAction::Dropped,
        format!("{what} stop without a matching start"),
    )
    .at_measure(measure as u32 + 1)
    .at_staff(staff)
}

fn ottava_subtype(kind: OctaveShiftKind, size: u32) -> &'static str {
    match (kind, size) {
        (OctaveShiftKind::Down, 15) => "15ma",
        (OctaveShiftKind::Down, 22) => "22ma",
        (OctaveShiftKind::Down, _) => "8va",
        (_, 15) => "15mb",
        (_, 22) => "22mb",
        (_, _) => "8vb",
    }
}

fn link_lines(tag: &str, (dm, df): Offset) -> String {
    let mut s = format!("            <{tag}>\n              <location>\n");
    if dm != 0 {
        s.push_str(&format!("                <measures>{dm}</measures>\n"));
    }
    if *df.numer() != 0 || dm == 0 {
        s.push_str(&format!(
            "                <fractions>{}</fractions>\n",
            format_rational(df)
        ));
    }
    s.push_str(&format!("              </location>\n            </{tag}>\n"));
    s
}

/// Same shape as [`link_lines`] two levels deeper, for spanners inside a
/// `<Note>`
fn note_link_lines(tag: &str, (dm, df): Offset) -> String {
    let mut s = format!("                <{tag}>\n                  <location>\n");
    if dm != 0 {
        s.push_str(&format!("                    <measures>{dm}</measures>\n"));
    }
    if *df.numer() != 0 || dm == 0 {
        s.push_str(&format!(
            "                    <fractions>{}</fractions>\n",
            format_rational(df)
        ));
    }
    s.push_str(&format!(
        "                  </location>\n                </{tag}>\n"
    ));
    s
}

fn dynamic_block(text: &str, placement: Option<Placement>) -> String {
    let mut s = String::from("          <Dynamic>\n");
    s.push_str(&format!(
        "            <subtype>{}</subtype>\n",
        xml_escape(text)
    ));
    if let Some(p) = placement {
        s.push_str(&format!("            <placement>{}</placement>\n", p.name()));
    }
    s.push_str("          </Dynamic>\n");
    s
}

fn staff_text_block(text: &str, placement: Option<Placement>) -> String {
    let mut s = String::from("          <StaffText>\n");
    if let Some(p) = placement {
        s.push_str(&format!("            <placement>{}</placement>\n", p.name()));
    }
    s.push_str(&format!("            <text>{}</text>\n", xml_escape(text)));
    s.push_str("          </StaffText>\n");
    s
}

fn tempo_block(qps: f64, per_minute: &str) -> String {
    let mut s = String::from("          <Tempo>\n");
    s.push_str(&format!("            <tempo>{}</tempo>\n", qps_text(qps)));
    s.push_str(&format!(
        "            <text>{}</text>\n",
        xml_escape(per_minute)
    ));
    s.push_str("          </Tempo>\n");
    s
}

fn hairpin_payload(subtype: u8, placement: Option<Placement>) -> String {
    let mut s = String::from("            <HairPin>\n");
    s.push_str(&format!("              <subtype>{subtype}</subtype>\n"));
    if let Some(p) = placement {
        s.push_str(&format!(
            "              <placement>{}</placement>\n",
            p.name()
        ));
    }
    s.push_str("            </HairPin>\n");
    s
}

fn harmony_block(harmony: &Harmony) -> String {
    let mut s = String::from("          <Harmony>\n");
    s.push_str(&format!(
        "            <root>{}</root>\n",
        super::tpc_of(harmony.root, harmony.root_alter)
    ));
    let suffix = crate::converters::kind_to_suffix(&harmony.kind);
    if !suffix.is_empty() {
        s.push_str(&format!(
            "            <name>{}</name>\n",
            xml_escape(suffix)
        ));
    }
    if let Some((step, alter)) = harmony.bass {
        s.push_str(&format!(
            "            <base>{}</base>\n",
            super::tpc_of(step, alter)
        ));
    }
    s.push_str("          </Harmony>\n");
    s
}

fn write_staff(
    out: &mut String,
    part: &Part,
    pstates: &[AttributeState],
    spans: &SpanTable,
    layout: &StaffLayout,
    pi: usize,
    local: u32,
) {
    out.push_str(&format!(
        "    <Staff id=\"{}\">\n",
        layout.global(pi, local)
    ));
    let key0 = pstates.first().map_or(0, |s| s.key_fifths);
    let mut speller = AccidentalState::new(key0);
    for (mi, measure) in part.measures.iter().enumerate() {
        let state = &pstates[mi];
        // key changes reach the speller before the measure's content
        if mi > 0 && pstates[mi - 1].key_fifths != state.key_fifths {
            speller.set_key(state.key_fifths);
        }
        write_measure(out, measure, state, spans, pi, mi, local, &mut speller);
    }
    out.push_str("    </Staff>\n");
}

fn write_measure(
    out: &mut String,
    measure: &Measure,
    state: &AttributeState,
    spans: &SpanTable,
    pi: usize,
    mi: usize,
    local: u32,
    speller: &mut AccidentalState,
) {
    let times = timing::timeline(&measure.events);
    let capacity = state.measure_capacity();
    let pickup = mi == 0 && times.occupied > 0 && times.occupied < capacity;
    if pickup {
        out.push_str(&format!(
            "      <Measure len=\"{}\">\n",
            format_fraction(times.occupied, state.divisions)
        ));
    } else {
        out.push_str("      <Measure>\n");
    }

    let mut lanes: Vec<Vec<timing::LaneItem>> = Vec::new();
    for voice in timing::staff_voices(&measure.events, local) {
        let clusters = timing::voice_clusters(&measure.events, &times, local, voice);
        lanes.extend(timing::slice_lanes(clusters));
    }
    lanes.truncate(MAX_VOICES);

    let mut extras = spans.extras_for(pi, mi, local);
    let mut carried: Vec<Pitch> = Vec::new();
    for (vi, lane) in lanes.iter().enumerate() {
        out.push_str("        <voice>\n");
        if vi == 0 {
            write_measure_attrs(out, measure, local);
            render_lane(
                out,
                measure,
                lane,
                state,
                spans,
                pi,
                mi,
                speller,
                &mut carried,
                Some(&mut extras),
            );
        } else {
            render_lane(
                out, measure, lane, state, spans, pi, mi, speller, &mut carried, None,
            );
        }
        out.push_str("        </voice>\n");
    }
    if lanes.is_empty() {
        // nothing on this staff; a measure rest keeps the staves aligned
        let fill = if pickup { times.occupied } else { capacity };
        out.push_str("        <voice>\n");
        write_measure_attrs(out, measure, local);
        let mut cursor = 0;
        flush_extras(out, &mut extras, Ticks::MAX, &mut cursor, state.divisions);
        out.push_str("          <Rest>\n");
        out.push_str("            <durationType>measure</durationType>\n");
        out.push_str(&format!(
            "            <duration>{}</duration>\n",
            format_fraction(fill, state.divisions)
        ));
        out.push_str("          </Rest>\n");
        out.push_str("        </voice>\n");
    }
    speller.next_measure(&carried);
    out.push_str("      </Measure>\n");
}

/// Clef, key and time changes open the first voice of the measure
fn write_measure_attrs(out: &mut String, measure: &Measure, local: u32) {
    let Some(attrs) = &measure.attributes else {
        return;
    };
    for clef in attrs.clefs.iter().filter(|c| c.staff == local) {
        let token = clef_type(clef);
        out.push_str("          <Clef>\n");
        out.push_str(&format!(
            "            <concertClefType>{token}</concertClefType>\n"
        ));
        out.push_str(&format!(
            "            <transposingClefType>{token}</transposingClefType>\n"
        ));
        out.push_str("          </Clef>\n");
    }
    if let Some(fifths) = attrs.key_fifths {
        out.push_str("          <KeySig>\n");
        out.push_str(&format!(
            "            <accidental>{fifths}</accidental>\n"
        ));
        out.push_str("          </KeySig>\n");
    }
    if let Some(time) = &attrs.time {
        out.push_str("          <TimeSig>\n");
        out.push_str(&format!("            <sigN>{}</sigN>\n", time.beats));
        out.push_str(&format!("            <sigD>{}</sigD>\n", time.beat_type));
        out.push_str("          </TimeSig>\n");
    }
}

/// Pop every pending block at or before `upto`, moving the cursor when a
/// block sits past it
fn flush_extras(
    out: &mut String,
    extras: &mut Vec<(Ticks, usize, String)>,
    upto: Ticks,
    cursor: &mut Ticks,
    divisions: i64,
) {
    while extras.first().map_or(false, |&(onset, ..)| onset <= upto) {
        let (onset, _, block) = extras.remove(0);
        if onset > *cursor {
            push_location(out, onset - *cursor, divisions);
            *cursor = onset;
        }
        out.push_str(&block);
    }
}

fn push_location(out: &mut String, gap: Ticks, divisions: i64) {
    out.push_str("          <location>\n");
    out.push_str(&format!(
        "            <fractions>{}</fractions>\n",
        format_fraction(gap, divisions)
    ));
    out.push_str("          </location>\n");
}

fn render_lane(
    out: &mut String,
    measure: &Measure,
    lane: &[timing::LaneItem],
    state: &AttributeState,
    spans: &SpanTable,
    pi: usize,
    mi: usize,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
    mut extras: Option<&mut Vec<(Ticks, usize, String)>>,
) {
    let explicit = lane
        .iter()
        .find_map(|item| timing::principal_note(&measure.events, item))
        .map_or(false, |n| {
            beaming::lane_has_explicit_beams(&measure.events, n.staff, n.voice)
        });
    let sigs: Vec<Option<TimeModification>> = lane
        .iter()
        .map(|item| timing::principal_time_mod(&measure.events, item))
        .collect();
    let tuplet_runs = duration::group_tuplet_runs(&sigs);

    let mut cursor: Ticks = 0;
    for (k, item) in lane.iter().enumerate() {
        if let Some(ex) = extras.as_deref_mut() {
            flush_extras(out, ex, item.onset, &mut cursor, state.divisions);
        }
        if item.onset > cursor {
            push_location(out, item.onset - cursor, state.divisions);
        }
        cursor = item.onset + item.duration;

        if tuplet_runs.iter().any(|&(s, _)| s == k) {
            if let Some(tm) = sigs[k] {
                render_tuplet_open(out, measure, item, state, tm);
            }
        }
        render_cluster(
            out, measure, item, state, spans, pi, mi, speller, carried, explicit,
        );
        if tuplet_runs.iter().any(|&(_, e)| e == k) {
            out.push_str("          <endTuplet/>\n");
        }
    }
    if let Some(ex) = extras.as_deref_mut() {
        flush_extras(out, ex, Ticks::MAX, &mut cursor, state.divisions);
    }
}

fn render_tuplet_open(
    out: &mut String,
    measure: &Measure,
    item: &timing::LaneItem,
    state: &AttributeState,
    tm: TimeModification,
) {
    let base = match timing::principal_note(&measure.events, item) {
        Some(n) => duration::written_symbol(n.note_type, n.dots, n.duration, n.time_mod, state.divisions).0,
        None => match first_rest(measure, item) {
            Some(r) => {
                duration::written_symbol(r.note_type, r.dots, r.duration, r.time_mod, state.divisions).0
            }
            None => NoteType::Quarter,
        },
    };
    out.push_str("          <Tuplet>\n");
    out.push_str(&format!(
        "            <normalNotes>{}</normalNotes>\n",
        tm.normal_notes
    ));
    out.push_str(&format!(
        "            <actualNotes>{}</actualNotes>\n",
        tm.actual_notes
    ));
    out.push_str(&format!("            <baseNote>{}</baseNote>\n", base.name()));
    out.push_str("            <Number>\n");
    out.push_str("              <style>tuplet</style>\n");
    out.push_str(&format!(
        "              <text>{}</text>\n",
        tm.actual_notes
    ));
    out.push_str("            </Number>\n");
    out.push_str("          </Tuplet>\n");
}

fn first_rest<'a>(measure: &'a Measure, item: &timing::LaneItem) -> Option<&'a Rest> {
    item.indices.iter().find_map(|&i| match &measure.events[i] {
        MeasureEvent::Rest(r) => Some(r),
        _ => None,
    })
}

fn beam_mode(note: &Note) -> Option<&'static str> {
    for beam in &note.beams {
        if beam.number != 1 {
            continue;
        }
        return Some(match beam.value {
            BeamValue::Begin | BeamValue::ForwardHook => "begin",
            BeamValue::Continue | BeamValue::End | BeamValue::BackwardHook => "mid",
        });
    }
    None
}

fn render_cluster(
    out: &mut String,
    measure: &Measure,
    item: &timing::LaneItem,
    state: &AttributeState,
    spans: &SpanTable,
    pi: usize,
    mi: usize,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
    explicit: bool,
) {
    let mut graces: Vec<(usize, &Note)> = Vec::new();
    let mut notes: Vec<(usize, &Note)> = Vec::new();
    let mut rest: Option<&Rest> = None;
    for &i in &item.indices {
        match &measure.events[i] {
            MeasureEvent::Note(n) if n.grace => graces.push((i, n)),
            MeasureEvent::Note(n) => notes.push((i, n)),
            MeasureEvent::Rest(r) => rest = Some(r),
            _ => {}
        }
    }

    // grace members flagged as chord ride with the grace before them
    let mut groups: Vec<Vec<(usize, &Note)>> = Vec::new();
    for (ei, n) in graces {
        match groups.last_mut() {
            Some(last) if n.chord => last.push((ei, n)),
            _ => groups.push(vec![(ei, n)]),
        }
    }
    for group in &groups {
        render_grace_group(out, group, spans, pi, mi, speller, carried);
    }

    let principal_ei = notes.first().map(|&(ei, _)| ei);
    if let Some(pe) = principal_ei {
        let key = (pi, mi, pe);
        for &delta in spans.slur_stops.get(&key).into_iter().flatten() {
            out.push_str("          <Spanner type=\"Slur\">\n");
            out.push_str(&link_lines("prev", delta));
            out.push_str("          </Spanner>\n");
        }
        for &delta in spans.slur_starts.get(&key).into_iter().flatten() {
            out.push_str("          <Spanner type=\"Slur\">\n");
            out.push_str("            <Slur/>\n");
            out.push_str(&link_lines("next", delta));
            out.push_str("          </Spanner>\n");
        }
    }

    let has_fermata = notes
        .first()
        .map(|&(_, n)| n.notations.fermata)
        .or(rest.map(|r| r.notations.fermata))
        .unwrap_or(false);
    if has_fermata {
        out.push_str("          <Fermata>\n");
        out.push_str("            <subtype>fermataAbove</subtype>\n");
        out.push_str("          </Fermata>\n");
    }

    if let Some(r) = rest {
        render_rest(out, r, state);
        return;
    }
    let Some(&(_, first)) = notes.first() else {
        return;
    };

    out.push_str("          <Chord>\n");
    let (nt, dots) = duration::written_symbol(
        first.note_type,
        first.dots,
        first.duration,
        first.time_mod,
        state.divisions,
    );
    if explicit && nt.beam_level() > 0 {
        let mode = beam_mode(first).unwrap_or("no");
        out.push_str(&format!("            <BeamMode>{mode}</BeamMode>\n"));
    }
    if dots > 0 {
        out.push_str(&format!("            <dots>{dots}</dots>\n"));
    }
    out.push_str(&format!(
        "            <durationType>{}</durationType>\n",
        nt.name()
    ));
    for subtype in marks::subtypes_of(&first.notations) {
        out.push_str("            <Articulation>\n");
        out.push_str(&format!("              <subtype>{subtype}</subtype>\n"));
        out.push_str("            </Articulation>\n");
    }
    if first.notations.arpeggiate {
        out.push_str("            <Arpeggio>\n");
        out.push_str("              <subtype>0</subtype>\n");
        out.push_str("            </Arpeggio>\n");
    }
    for lyric in &first.lyrics {
        render_lyric(out, lyric);
    }
    for (ei, note) in notes {
        render_note(out, note, spans, pi, mi, ei, speller, carried);
    }
    out.push_str("          </Chord>\n");
}

fn render_rest(out: &mut String, rest: &Rest, state: &AttributeState) {
    out.push_str("          <Rest>\n");
    if rest.measure_rest {
        out.push_str("            <durationType>measure</durationType>\n");
        out.push_str(&format!(
            "            <duration>{}</duration>\n",
            format_fraction(rest.duration, state.divisions)
        ));
    } else {
        let (nt, dots) = duration::written_symbol(
            rest.note_type,
            rest.dots,
            rest.duration,
            rest.time_mod,
            state.divisions,
        );
        if dots > 0 {
            out.push_str(&format!("            <dots>{dots}</dots>\n"));
        }
        out.push_str(&format!(
            "            <durationType>{}</durationType>\n",
            nt.name()
        ));
    }
    out.push_str("          </Rest>\n");
}

fn render_grace_group(
    out: &mut String,
    group: &[(usize, &Note)],
    spans: &SpanTable,
    pi: usize,
    mi: usize,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
) {
    let Some(&(_, first)) = group.first() else {
        return;
    };
    out.push_str("          <Chord>\n");
    out.push_str(if first.grace_slash {
        "            <acciaccatura/>\n"
    } else {
        "            <appoggiatura/>\n"
    });
    let (nt, dots) = match first.note_type {
        Some(nt) => (nt, first.dots),
        None => (NoteType::Eighth, 0),
    };
    if dots > 0 {
        out.push_str(&format!("            <dots>{dots}</dots>\n"));
    }
    out.push_str(&format!(
        "            <durationType>{}</durationType>\n",
        nt.name()
    ));
    for subtype in marks::subtypes_of(&first.notations) {
        out.push_str("            <Articulation>\n");
        out.push_str(&format!("              <subtype>{subtype}</subtype>\n"));
        out.push_str("            </Articulation>\n");
    }
    for &(ei, note) in group {
        render_note(out, note, spans, pi, mi, ei, speller, carried);
    }
    out.push_str("          </Chord>\n");
}

fn render_lyric(out: &mut String, lyric: &crate::models::Lyric) {
    out.push_str("            <Lyrics>\n");
    if lyric.number > 1 {
        out.push_str(&format!("              <no>{}</no>\n", lyric.number - 1));
    }
    if let Some(syllabic) = lyric.syllabic {
        if syllabic != crate::models::Syllabic::Single {
            out.push_str(&format!(
                "              <syllabic>{}</syllabic>\n",
                syllabic.name()
            ));
        }
    }
    out.push_str(&format!(
        "              <text>{}</text>\n",
        xml_escape(&lyric.text)
    ));
    out.push_str("            </Lyrics>\n");
}

fn render_note(
    out: &mut String,
    note: &Note,
    spans: &SpanTable,
    pi: usize,
    mi: usize,
    ei: usize,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
) {
    out.push_str("            <Note>\n");
    let key = (pi, mi, ei);
    if let Some(&delta) = spans.tie_next.get(&key) {
        out.push_str("              <Spanner type=\"Tie\">\n");
        out.push_str("                <Tie/>\n");
        out.push_str(&note_link_lines("next", delta));
        out.push_str("              </Spanner>\n");
    }
    if let Some(&delta) = spans.tie_prev.get(&key) {
        out.push_str("              <Spanner type=\"Tie\">\n");
        out.push_str(&note_link_lines("prev", delta));
        out.push_str("              </Spanner>\n");
    }
    if let Some(&delta) = spans.gliss_next.get(&key) {
        out.push_str("              <Spanner type=\"Glissando\">\n");
        out.push_str("                <Glissando>\n");
        out.push_str("                  <text>gliss.</text>\n");
        out.push_str("                </Glissando>\n");
        out.push_str(&note_link_lines("next", delta));
        out.push_str("              </Spanner>\n");
    }
    if let Some(&delta) = spans.gliss_prev.get(&key) {
        out.push_str("              <Spanner type=\"Glissando\">\n");
        out.push_str(&note_link_lines("prev", delta));
        out.push_str("              </Spanner>\n");
    }
    let resolved = speller.resolve(&note.pitch, note.tie_stop);
    if let Some(acc) = note.accidental.or(resolved) {
        out.push_str("              <Accidental>\n");
        out.push_str(&format!(
            "                <subtype>{}</subtype>\n",
            accidental_subtype(acc)
        ));
        out.push_str("              </Accidental>\n");
    }
    out.push_str(&format!("              <pitch>{}</pitch>\n", note.pitch.midi()));
    out.push_str(&format!("              <tpc>{}</tpc>\n", note.pitch.tpc()));
    out.push_str("            </Note>\n");
    if note.tie_stop {
        carried.retain(|p| *p != note.pitch);
    }
    if note.tie_start {
        carried.push(note.pitch);
    }
}
