//! Pivot to MEI
//!
//! The partwise pivot is turned inside out: measures are emitted timewise
//! with one `<staff>` per (part, local staff) under a global numbering,
//! voices become layers, and paired directions (wedges, octave lines)
//! collapse into single control events spanning their start and end beats.

use std::collections::{BTreeMap, HashMap};

use crate::beaming;
use crate::diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
use crate::metadata;
use crate::models::{
    diatonic_alter, Accidental, AttributeState, BeamValue, Clef, DirectionKind, Measure,
    MeasureEvent, Note, NoteType, OctaveShiftKind, Ornament, PedalKind, Pitch, Placement, Rest,
    Score, StartStop, Ticks, TimeModification, WedgeKind,
};
use crate::options::ConvertOptions;
use crate::rhythm::{duration, timing};
use crate::spelling::AccidentalState;
use crate::xml::xml_escape;

use super::{
    artic_tokens, clef_shape, fold_states, format_beat, format_key_sig, format_tstamp2,
    harmony_text, StaffLayout,
};

/// Serialize the pivot score as an MEI 4 document
pub fn write_mei(score: &Score, options: &ConvertOptions) -> String {
    let mut prepared = score.clone();
    beaming::derive_score_beams(&mut prepared);
    assign_note_ids(&mut prepared);

    let layout = StaffLayout::build(&prepared);
    let states: Vec<Vec<AttributeState>> =
        prepared.parts.iter().map(|p| fold_states(p)).collect();

    let mut diagnostics = Vec::new();
    let controls = collect_controls(&prepared, &layout, &states, &mut diagnostics);
    let body = render_body(&prepared, &layout, &states, &controls);

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<mei xmlns=\"http://www.music-encoding.org/ns/mei\" meiversion=\"4.0.1\">\n");
    out.push_str("  <meiHead>\n");
    out.push_str("    <fileDesc>\n");
    out.push_str("      <titleStmt>\n");
    match &prepared.title {
        Some(title) => out.push_str(&format!("        <title>{}</title>\n", xml_escape(title))),
        None => out.push_str("        <title/>\n"),
    }
    out.push_str("      </titleStmt>\n");
    out.push_str("      <pubStmt/>\n");
    let mut fields: Vec<(String, String)> = prepared.misc_fields.clone();
    for (i, diag) in prepared.diagnostics.iter().chain(&diagnostics).enumerate() {
        fields.push((
            format!("{}{}", metadata::DIAGNOSTIC_FIELD_PREFIX, i),
            metadata::diagnostic_field_value(diag),
        ));
    }
    if options.debug_metadata {
        fields.extend(metadata::debug_audit_fields(&prepared));
    }
    if !fields.is_empty() {
        out.push_str("      <notesStmt>\n");
        for (name, value) in &fields {
            out.push_str(&format!(
                "        <annot type=\"{}\" label=\"{}\">{}</annot>\n",
                metadata::MEI_ANNOT_TYPE,
                xml_escape(name),
                xml_escape(value)
            ));
        }
        out.push_str("      </notesStmt>\n");
    }
    out.push_str("    </fileDesc>\n");
    out.push_str("  </meiHead>\n");
    out.push_str("  <music>\n");
    out.push_str("    <body>\n");
    out.push_str("      <mdiv>\n");
    out.push_str("        <score>\n");
    out.push_str(&body);
    out.push_str("        </score>\n");
    out.push_str("      </mdiv>\n");
    out.push_str("    </body>\n");
    out.push_str("  </music>\n");
    out.push_str("</mei>\n");
    out
}

fn beat_unit(state: &AttributeState) -> Ticks {
    state.divisions * 4 / state.time.beat_type as i64
}

fn assign_note_ids(score: &mut Score) {
    let mut counter = 0usize;
    for part in &mut score.parts {
        for measure in &mut part.measures {
            for event in &mut measure.events {
                if let MeasureEvent::Note(n) = event {
                    counter += 1;
                    if n.id.is_none() {
                        n.id = Some(format!("sb-n{counter}"));
                    }
                }
            }
        }
    }
}

fn place_attr(placement: Option<Placement>) -> String {
    match placement {
        Some(p) => format!(" place=\"{}\"", p.name()),
        None => String::new(),
    }
}

/// Gather every control event, bucketed by the measure it starts in.
///
/// Paired directions are matched per staff in document order; unpaired
/// legs are dropped with a diagnostic.
fn collect_controls(
    score: &Score,
    layout: &StaffLayout,
    states: &[Vec<AttributeState>],
    diagnostics: &mut Vec<Diagnostic>,
) -> BTreeMap<usize, Vec<String>> {
    let mut out: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (pi, part) in score.parts.iter().enumerate() {
        let pstates = &states[pi];
        let mut open_slurs: HashMap<u32, (usize, u32, String)> = HashMap::new();
        let mut open_gliss: HashMap<u32, (usize, u32, String)> = HashMap::new();
        let mut open_wedges: HashMap<u32, (usize, Ticks, &'static str, Option<Placement>)> =
            HashMap::new();
        let mut open_octaves: HashMap<u32, (usize, Ticks, u32, &'static str)> = HashMap::new();
        for (mi, measure) in part.measures.iter().enumerate() {
            let times = timing::timeline(&measure.events);
            let unit = beat_unit(&pstates[mi]);
            for (ei, event) in measure.events.iter().enumerate() {
                match event {
                    MeasureEvent::Note(n) => {
                        let Some(id) = n.id.clone() else { continue };
                        let staff = layout.global(pi, n.staff);
                        for mark in &n.notations.slurs {
                            match mark.kind {
                                StartStop::Start => {
                                    open_slurs.insert(mark.number, (mi, staff, id.clone()));
                                }
                                StartStop::Stop => {
                                    match open_slurs.remove(&mark.number) {
                                        Some((sm, sstaff, sid)) => {
                                            out.entry(sm).or_default().push(format!(
                                                "<slur staff=\"{sstaff}\" startid=\"#{sid}\" endid=\"#{id}\"/>"
                                            ));
                                        }
                                        None => diagnostics.push(
                                            Diagnostic::new(
                                                DiagnosticKind::UnresolvedControl,
                                                DiagnosticAction::Dropped,
                                                "slur stop without a matching start",
                                            )
                                            .at_measure(mi as u32 + 1)
                                            .at_staff(n.staff)
                                            .at_voice(n.voice),
                                        ),
                                    }
                                }
                            }
                        }
                        for mark in &n.notations.glissandos {
                            match mark.kind {
                                StartStop::Start => {
                                    open_gliss.insert(mark.number, (mi, staff, id.clone()));
                                }
                                StartStop::Stop => {
                                    match open_gliss.remove(&mark.number) {
                                        Some((sm, sstaff, sid)) => {
                                            out.entry(sm).or_default().push(format!(
                                                "<gliss staff=\"{sstaff}\" startid=\"#{sid}\" endid=\"#{id}\"/>"
                                            ));
                                        }
                                        None => diagnostics.push(
                                            Diagnostic::new(
                                                DiagnosticKind::UnresolvedControl,
                                                DiagnosticAction::Dropped,
                                                "glissando stop without a matching start",
                                            )
                                            .at_measure(mi as u32 + 1)
                                            .at_staff(n.staff)
                                            .at_voice(n.voice),
                                        ),
                                    }
                                }
                            }
                        }
                        for ornament in &n.notations.ornaments {
                            let line = match ornament {
                                Ornament::Trill => {
                                    format!("<trill staff=\"{staff}\" startid=\"#{id}\"/>")
                                }
                                Ornament::Mordent => format!(
                                    "<mordent staff=\"{staff}\" form=\"lower\" startid=\"#{id}\"/>"
                                ),
                                Ornament::InvertedMordent => format!(
                                    "<mordent staff=\"{staff}\" form=\"upper\" startid=\"#{id}\"/>"
                                ),
                                Ornament::Turn => {
                                    format!("<turn staff=\"{staff}\" startid=\"#{id}\"/>")
                                }
                            };
                            out.entry(mi).or_default().push(line);
                        }
                        if n.notations.arpeggiate && !n.chord && !n.grace {
                            let mut plist = vec![format!("#{id}")];
                            for later in &measure.events[ei + 1..] {
                                match later {
                                    MeasureEvent::Note(m) if m.chord => {
                                        if let Some(mid) = &m.id {
                                            plist.push(format!("#{mid}"));
                                        }
                                    }
                                    _ => break,
                                }
                            }
                            out.entry(mi).or_default().push(format!(
                                "<arpeg staff=\"{staff}\" plist=\"{}\"/>",
                                plist.join(" ")
                            ));
                        }
                    }
                    MeasureEvent::Direction(d) => {
                        let onset = times.events[ei].onset;
                        let staff = layout.global(pi, d.staff);
                        let tstamp = format_beat(onset, unit);
                        let place = place_attr(d.placement);
                        match &d.kind {
                            DirectionKind::Dynamic(text) => {
                                out.entry(mi).or_default().push(format!(
                                    "<dynam staff=\"{staff}\" tstamp=\"{tstamp}\"{place}>{}</dynam>",
                                    xml_escape(text)
                                ));
                            }
                            DirectionKind::Words(text) => {
                                out.entry(mi).or_default().push(format!(
                                    "<dir staff=\"{staff}\" tstamp=\"{tstamp}\"{place}>{}</dir>",
                                    xml_escape(text)
                                ));
                            }
                            DirectionKind::Metronome {
                                beat_unit: bu,
                                per_minute,
                            } => {
                                let line = if per_minute.parse::<f64>().is_ok() {
                                    format!(
                                        "<tempo staff=\"{staff}\" tstamp=\"{tstamp}\" mm=\"{}\" mm.unit=\"{}\"/>",
                                        xml_escape(per_minute),
                                        bu.mei_dur()
                                    )
                                } else {
                                    format!(
                                        "<tempo staff=\"{staff}\" tstamp=\"{tstamp}\" mm.unit=\"{}\">{}</tempo>",
                                        bu.mei_dur(),
                                        xml_escape(per_minute)
                                    )
                                };
                                out.entry(mi).or_default().push(line);
                            }
                            DirectionKind::Pedal(kind) => {
                                let dir = match kind {
                                    PedalKind::Start => "down",
                                    PedalKind::Stop => "up",
                                    PedalKind::Change => "bounce",
                                };
                                out.entry(mi).or_default().push(format!(
                                    "<pedal staff=\"{staff}\" tstamp=\"{tstamp}\" dir=\"{dir}\"/>"
                                ));
                            }
                            DirectionKind::Wedge(WedgeKind::Crescendo) => {
                                open_wedges.insert(d.staff, (mi, onset, "cres", d.placement));
                            }
                            DirectionKind::Wedge(WedgeKind::Diminuendo) => {
                                open_wedges.insert(d.staff, (mi, onset, "dim", d.placement));
                            }
                            DirectionKind::Wedge(WedgeKind::Stop) => {
                                match open_wedges.remove(&d.staff) {
                                    Some((sm, sonset, form, splace)) => {
                                        let sunit = beat_unit(&pstates[sm]);
                                        out.entry(sm).or_default().push(format!(
                                            "<hairpin staff=\"{staff}\" form=\"{form}\" tstamp=\"{}\" tstamp2=\"{}\"{}/>",
                                            format_beat(sonset, sunit),
                                            format_tstamp2(
                                                (mi - sm) as u32,
                                                &format_beat(onset, unit)
                                            ),
                                            place_attr(splace)
                                        ));
                                    }
                                    None => diagnostics.push(
                                        Diagnostic::new(
                                            DiagnosticKind::UnresolvedControl,
                                            DiagnosticAction::Dropped,
                                            "wedge stop without a matching start",
                                        )
                                        .at_measure(mi as u32 + 1)
                                        .at_staff(d.staff),
                                    ),
                                }
                            }
                            DirectionKind::OctaveShift { kind, size } => match kind {
                                OctaveShiftKind::Down => {
                                    open_octaves.insert(d.staff, (mi, onset, *size, "above"));
                                }
                                OctaveShiftKind::Up => {
                                    open_octaves.insert(d.staff, (mi, onset, *size, "below"));
                                }
                                OctaveShiftKind::Stop => match open_octaves.remove(&d.staff) {
                                    Some((sm, sonset, size, dis_place)) => {
                                        let sunit = beat_unit(&pstates[sm]);
                                        let dis = match size {
                                            15 => 15,
                                            22 => 22,
                                            _ => 8,
                                        };
                                        out.entry(sm).or_default().push(format!(
                                            "<octave staff=\"{staff}\" dis=\"{dis}\" dis.place=\"{dis_place}\" tstamp=\"{}\" tstamp2=\"{}\"/>",
                                            format_beat(sonset, sunit),
                                            format_tstamp2(
                                                (mi - sm) as u32,
                                                &format_beat(onset, unit)
                                            )
                                        ));
                                    }
                                    None => diagnostics.push(
                                        Diagnostic::new(
                                            DiagnosticKind::UnresolvedControl,
                                            DiagnosticAction::Dropped,
                                            "octave-shift stop without a matching start",
                                        )
                                        .at_measure(mi as u32 + 1)
                                        .at_staff(d.staff),
                                    ),
                                },
                            },
                        }
                    }
                    MeasureEvent::Harmony(h) => {
                        let onset = times.events[ei].onset;
                        let staff = layout.global(pi, 1);
                        out.entry(mi).or_default().push(format!(
                            "<harm staff=\"{staff}\" tstamp=\"{}\">{}</harm>",
                            format_beat(onset, unit),
                            xml_escape(&harmony_text(h))
                        ));
                    }
                    _ => {}
                }
            }
        }
        for (_, (sm, staff, _)) in open_slurs {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedControl,
                    DiagnosticAction::Dropped,
                    "slur start never closed",
                )
                .at_measure(sm as u32 + 1)
                .at_staff(staff),
            );
        }
        for (_, (sm, staff, _)) in open_gliss {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedControl,
                    DiagnosticAction::Dropped,
                    "glissando start never closed",
                )
                .at_measure(sm as u32 + 1)
                .at_staff(staff),
            );
        }
        for (staff, (sm, ..)) in open_wedges {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedControl,
                    DiagnosticAction::Dropped,
                    "wedge start never closed",
                )
                .at_measure(sm as u32 + 1)
                .at_staff(staff),
            );
        }
        for (staff, (sm, ..)) in open_octaves {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::UnresolvedControl,
                    DiagnosticAction::Dropped,
                    "octave-shift start never closed",
                )
                .at_measure(sm as u32 + 1)
                .at_staff(staff),
            );
        }
    }
    out
}

fn render_body(
    score: &Score,
    layout: &StaffLayout,
    states: &[Vec<AttributeState>],
    controls: &BTreeMap<usize, Vec<String>>,
) -> String {
    let mut out = String::new();
    render_score_def(&mut out, score, layout);
    out.push_str("          <section>\n");

    let measure_count = score.parts.iter().map(|p| p.measures.len()).max().unwrap_or(0);
    let mut spellers: Vec<Vec<AccidentalState>> = score
        .parts
        .iter()
        .enumerate()
        .map(|(pi, _)| {
            let key = states[pi].first().map_or(0, |s| s.key_fifths);
            (0..layout.staves(pi))
                .map(|_| AccidentalState::new(key))
                .collect()
        })
        .collect();

    for mi in 0..measure_count {
        render_measure_defs(&mut out, score, layout, mi);

        let number = score
            .parts
            .first()
            .and_then(|p| p.measures.get(mi))
            .map(|m| m.number.clone())
            .unwrap_or_else(|| (mi + 1).to_string());
        out.push_str(&format!("            <measure n=\"{}\">\n", xml_escape(&number)));

        for (pi, part) in score.parts.iter().enumerate() {
            // key changes reach the speller before the measure's content
            if mi > 0
                && states[pi].get(mi).map(|s| s.key_fifths)
                    != states[pi].get(mi - 1).map(|s| s.key_fifths)
            {
                if let Some(state) = states[pi].get(mi) {
                    for speller in &mut spellers[pi] {
                        speller.set_key(state.key_fifths);
                    }
                }
            }
            let Some(measure) = part.measures.get(mi) else {
                for s in 1..=layout.staves(pi) {
                    out.push_str(&format!(
                        "              <staff n=\"{}\">\n                <layer n=\"1\"/>\n              </staff>\n",
                        layout.global(pi, s)
                    ));
                }
                continue;
            };
            let state = &states[pi][mi];
            let times = timing::timeline(&measure.events);
            for s in 1..=layout.staves(pi) {
                out.push_str(&format!(
                    "              <staff n=\"{}\">\n",
                    layout.global(pi, s)
                ));
                let speller = &mut spellers[pi][(s - 1) as usize];
                let mut carried: Vec<Pitch> = Vec::new();
                let mut layer_n = 0;
                for voice in timing::staff_voices(&measure.events, s) {
                    let clusters = timing::voice_clusters(&measure.events, &times, s, voice);
                    for lane in timing::slice_lanes(clusters) {
                        layer_n += 1;
                        out.push_str(&format!("                <layer n=\"{layer_n}\">\n"));
                        render_lane(&mut out, measure, &lane, state, speller, &mut carried, 18);
                        out.push_str("                </layer>\n");
                    }
                }
                if layer_n == 0 {
                    out.push_str("                <layer n=\"1\"/>\n");
                }
                speller.next_measure(&carried);
                out.push_str("              </staff>\n");
            }
        }

        if let Some(lines) = controls.get(&mi) {
            for line in lines {
                out.push_str(&format!("              {line}\n"));
            }
        }
        out.push_str("            </measure>\n");
    }

    out.push_str("          </section>\n");
    out
}

fn render_score_def(out: &mut String, score: &Score, layout: &StaffLayout) {
    let first_attrs = score
        .parts
        .first()
        .and_then(|p| p.measures.first())
        .and_then(|m| m.attributes.clone())
        .unwrap_or_default();
    let mut head = String::from("          <scoreDef");
    if let Some(time) = &first_attrs.time {
        head.push_str(&format!(
            " meter.count=\"{}\" meter.unit=\"{}\"",
            time.beats, time.beat_type
        ));
    }
    if let Some(fifths) = first_attrs.key_fifths {
        head.push_str(&format!(" key.sig=\"{}\"", format_key_sig(fifths)));
    }
    head.push_str(">\n");
    out.push_str(&head);
    out.push_str("            <staffGrp>\n");
    for (pi, part) in score.parts.iter().enumerate() {
        out.push_str("              <staffGrp>\n");
        if let Some(name) = &part.name {
            out.push_str(&format!(
                "                <label>{}</label>\n",
                xml_escape(name)
            ));
        }
        let clefs: Vec<Clef> = part
            .measures
            .first()
            .and_then(|m| m.attributes.as_ref())
            .map(|a| a.clefs.clone())
            .unwrap_or_default();
        for s in 1..=layout.staves(pi) {
            let mut line = format!(
                "                <staffDef n=\"{}\" lines=\"5\"",
                layout.global(pi, s)
            );
            if let Some(clef) = clefs.iter().find(|c| c.staff == s) {
                line.push_str(&clef_attrs(clef));
            }
            line.push_str("/>\n");
            out.push_str(&line);
        }
        out.push_str("              </staffGrp>\n");
    }
    out.push_str("            </staffGrp>\n");
    out.push_str("          </scoreDef>\n");
}

fn clef_attrs(clef: &Clef) -> String {
    let mut attrs = format!(
        " clef.shape=\"{}\" clef.line=\"{}\"",
        clef_shape(clef.sign),
        clef.line.unwrap_or_else(|| clef.sign.default_line())
    );
    if clef.octave_change != 0 {
        let dis = 1 + 7 * clef.octave_change.unsigned_abs();
        attrs.push_str(&format!(
            " clef.dis=\"{dis}\" clef.dis.place=\"{}\"",
            if clef.octave_change < 0 { "below" } else { "above" }
        ));
    }
    attrs
}

/// Key, meter and clef changes take effect before the measure they sit in
fn render_measure_defs(out: &mut String, score: &Score, layout: &StaffLayout, mi: usize) {
    if mi == 0 {
        return;
    }
    if let Some(part) = score.parts.first() {
        if let Some(attrs) = part.measures.get(mi).and_then(|m| m.attributes.as_ref()) {
            let mut line = String::from("            <scoreDef");
            let mut any = false;
            if let Some(time) = &attrs.time {
                line.push_str(&format!(
                    " meter.count=\"{}\" meter.unit=\"{}\"",
                    time.beats, time.beat_type
                ));
                any = true;
            }
            if let Some(fifths) = attrs.key_fifths {
                line.push_str(&format!(" key.sig=\"{}\"", format_key_sig(fifths)));
                any = true;
            }
            if any {
                line.push_str("/>\n");
                out.push_str(&line);
            }
        }
    }
    for (pi, part) in score.parts.iter().enumerate() {
        if let Some(attrs) = part.measures.get(mi).and_then(|m| m.attributes.as_ref()) {
            for clef in &attrs.clefs {
                out.push_str(&format!(
                    "            <staffDef n=\"{}\"{}/>\n",
                    layout.global(pi, clef.staff),
                    clef_attrs(clef)
                ));
            }
        }
    }
}

fn render_lane(
    out: &mut String,
    measure: &Measure,
    lane: &[timing::LaneItem],
    state: &AttributeState,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
    indent: usize,
) {
    // tuplet brackets come from ratio runs, beams from level-1 begin/end
    let sigs: Vec<Option<TimeModification>> = lane
        .iter()
        .map(|item| timing::principal_time_mod(&measure.events, item))
        .collect();
    let tuplet_runs = duration::group_tuplet_runs(&sigs);
    let beam_runs = beam_ranges(measure, lane, &tuplet_runs);

    let mut cursor: Ticks = 0;
    let mut depth = 0usize;
    for (k, item) in lane.iter().enumerate() {
        if item.onset > cursor {
            render_spaces(
                out,
                item.onset - cursor,
                state.divisions,
                &" ".repeat(indent + depth * 2),
            );
        }
        cursor = item.onset + item.duration;

        if tuplet_runs.iter().any(|&(s, _)| s == k) {
            if let Some(tm) = sigs[k] {
                out.push_str(&format!(
                    "{}<tuplet num=\"{}\" numbase=\"{}\">\n",
                    " ".repeat(indent + depth * 2),
                    tm.actual_notes,
                    tm.normal_notes
                ));
                depth += 1;
            }
        }
        if beam_runs.iter().any(|&(s, _)| s == k) {
            out.push_str(&format!("{}<beam>\n", " ".repeat(indent + depth * 2)));
            depth += 1;
        }

        render_item(out, measure, item, state, speller, carried, indent + depth * 2);

        if beam_runs.iter().any(|&(_, e)| e == k) && depth > 0 {
            depth -= 1;
            out.push_str(&format!("{}</beam>\n", " ".repeat(indent + depth * 2)));
        }
        if tuplet_runs.iter().any(|&(_, e)| e == k) && depth > 0 {
            depth -= 1;
            out.push_str(&format!("{}</tuplet>\n", " ".repeat(indent + depth * 2)));
        }
    }
}

/// Level-1 begin..end spans over lane items, kept only when they nest
/// cleanly with the tuplet brackets
fn beam_ranges(
    measure: &Measure,
    lane: &[timing::LaneItem],
    tuplet_runs: &[(usize, usize)],
) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    for (k, item) in lane.iter().enumerate() {
        let Some(note) = timing::principal_note(&measure.events, item) else {
            continue;
        };
        for beam in &note.beams {
            if beam.number != 1 {
                continue;
            }
            match beam.value {
                BeamValue::Begin => open = Some(k),
                BeamValue::End => {
                    if let Some(s) = open.take() {
                        if k > s {
                            ranges.push((s, k));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    ranges.retain(|&(bs, be)| {
        tuplet_runs
            .iter()
            .all(|&(ts, te)| (bs >= ts && be <= te) || be < ts || bs > te)
    });
    ranges
}

fn render_spaces(out: &mut String, gap: Ticks, divisions: i64, pad: &str) {
    match duration::decompose(gap, divisions) {
        Some(fragments) => {
            for (nt, dots) in fragments {
                if dots > 0 {
                    out.push_str(&format!(
                        "{pad}<space dur=\"{}\" dots=\"{dots}\"/>\n",
                        nt.mei_dur()
                    ));
                } else {
                    out.push_str(&format!("{pad}<space dur=\"{}\"/>\n", nt.mei_dur()));
                }
            }
        }
        None => {
            let (nt, _) = duration::encode_or_nearest(gap, divisions);
            out.push_str(&format!("{pad}<space dur=\"{}\"/>\n", nt.mei_dur()));
        }
    }
}

fn render_item(
    out: &mut String,
    measure: &Measure,
    item: &timing::LaneItem,
    state: &AttributeState,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
    indent: usize,
) {
    let pad = " ".repeat(indent);
    let mut notes: Vec<&Note> = Vec::new();
    let mut rest: Option<&Rest> = None;
    let mut graces: Vec<&Note> = Vec::new();
    for &i in &item.indices {
        match &measure.events[i] {
            MeasureEvent::Note(n) if n.grace => graces.push(n),
            MeasureEvent::Note(n) => notes.push(n),
            MeasureEvent::Rest(r) => rest = Some(r),
            _ => {}
        }
    }

    for grace in &graces {
        let line = note_attrs(grace, state, speller, carried, true);
        out.push_str(&format!("{pad}<note{line}/>\n"));
    }

    if let Some(r) = rest {
        if r.measure_rest {
            out.push_str(&format!("{pad}<mRest/>\n"));
        } else {
            let (nt, dots) =
                duration::written_symbol(r.note_type, r.dots, r.duration, r.time_mod, state.divisions);
            let mut attrs = format!(" dur=\"{}\"", nt.mei_dur());
            if dots > 0 {
                attrs.push_str(&format!(" dots=\"{dots}\""));
            }
            if r.notations.fermata {
                attrs.push_str(" fermata=\"above\"");
            }
            out.push_str(&format!("{pad}<rest{attrs}/>\n"));
        }
        return;
    }

    match notes.len() {
        0 => {}
        1 => {
            let line = note_attrs(notes[0], state, speller, carried, false);
            out.push_str(&format!("{pad}<note{line}/>\n"));
        }
        _ => {
            let first = notes[0];
            let (nt, dots) = duration::written_symbol(
                first.note_type,
                first.dots,
                first.duration,
                first.time_mod,
                state.divisions,
            );
            let mut attrs = format!(" dur=\"{}\"", nt.mei_dur());
            if dots > 0 {
                attrs.push_str(&format!(" dots=\"{dots}\""));
            }
            let tokens = artic_tokens(&first.notations);
            if !tokens.is_empty() {
                attrs.push_str(&format!(" artic=\"{}\"", tokens.join(" ")));
            }
            if first.notations.fermata {
                attrs.push_str(" fermata=\"above\"");
            }
            out.push_str(&format!("{pad}<chord{attrs}>\n"));
            for note in &notes {
                let line = pitch_attrs(note, state.key_fifths, speller, carried);
                out.push_str(&format!("{pad}  <note{line}/>\n"));
            }
            out.push_str(&format!("{pad}</chord>\n"));
        }
    }
}

fn tie_attr(start: bool, stop: bool) -> Option<&'static str> {
    match (start, stop) {
        (true, true) => Some("m"),
        (true, false) => Some("i"),
        (false, true) => Some("t"),
        (false, false) => None,
    }
}

fn track_ties(note: &Note, carried: &mut Vec<Pitch>) {
    if note.tie_stop {
        carried.retain(|p| {
            !(p.step == note.pitch.step
                && p.octave == note.pitch.octave
                && p.alter == note.pitch.alter)
        });
    }
    if note.tie_start {
        carried.push(note.pitch);
    }
}

/// Pitch, glyph and tie attributes shared by full notes and chord members
fn pitch_attrs(
    note: &Note,
    key_fifths: i32,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
) -> String {
    let mut attrs = String::new();
    if let Some(id) = &note.id {
        attrs.push_str(&format!(" xml:id=\"{}\"", xml_escape(id)));
    }
    attrs.push_str(&format!(
        " pname=\"{}\" oct=\"{}\"",
        note.pitch.step.name().to_ascii_lowercase(),
        note.pitch.octave
    ));
    let resolved = speller.resolve(&note.pitch, note.tie_stop);
    let glyph = note.accidental.or(resolved);
    match glyph {
        Some(acc) => attrs.push_str(&format!(" accid=\"{}\"", acc.mei_name())),
        None => {
            // sounding alteration comes from the key; only a stray one
            // needs a gestural record
            if note.pitch.alter != diatonic_alter(note.pitch.step, key_fifths) {
                if let Some(acc) = Accidental::from_alter(note.pitch.alter) {
                    attrs.push_str(&format!(" accid.ges=\"{}\"", acc.mei_name()));
                }
            }
        }
    }
    if let Some(tie) = tie_attr(note.tie_start, note.tie_stop) {
        attrs.push_str(&format!(" tie=\"{tie}\""));
    }
    track_ties(note, carried);
    attrs
}

fn note_attrs(
    note: &Note,
    state: &AttributeState,
    speller: &mut AccidentalState,
    carried: &mut Vec<Pitch>,
    grace: bool,
) -> String {
    let mut attrs = pitch_attrs(note, state.key_fifths, speller, carried);
    let (nt, dots) = if grace && note.note_type.is_none() {
        (NoteType::Eighth, 0)
    } else {
        duration::written_symbol(
            note.note_type,
            note.dots,
            note.duration,
            note.time_mod,
            state.divisions,
        )
    };
    attrs.push_str(&format!(" dur=\"{}\"", nt.mei_dur()));
    if dots > 0 {
        attrs.push_str(&format!(" dots=\"{dots}\""));
    }
    if grace {
        attrs.push_str(&format!(
            " grace=\"{}\"",
            if note.grace_slash { "unacc" } else { "acc" }
        ));
    }
    let tokens = artic_tokens(&note.notations);
    if !tokens.is_empty() {
        attrs.push_str(&format!(" artic=\"{}\"", tokens.join(" ")));
    }
    if note.notations.fermata {
        attrs.push_str(" fermata=\"above\"");
    }
    attrs
}
