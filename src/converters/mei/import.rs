//! MEI to pivot
//!
//! Layout state (scoreDef/staffDef) folds in document order and lands on
//! the next measure as pivot attributes; timewise staff/layer trees expand
//! back into partwise event streams with backups between lanes. Control
//! events are collected during the walk and resolved afterwards against a
//! note index, by id first and by beat timestamp when ids are absent.

use std::collections::{BTreeMap, HashMap};

use roxmltree::{Document, Node, NodeId};

use crate::beaming;
use crate::diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
use crate::errors::{ConvertError, ConvertResult};
use crate::metadata;
use crate::models::{
    diatonic_alter, Accidental, AttributeState, Attributes, Clef, Direction, DirectionKind,
    GlissandoMark, Measure, MeasureEvent, Note, NoteType, OctaveShiftKind, Ornament, Part,
    PedalKind, Pitch, Placement, Rest, Score, SlurMark, StartStop, Step, Ticks,
    TimeModification, TimeSignature, TupletMark, WedgeKind,
};
use crate::rhythm::{duration, timing};
use crate::xml::{attr_i32, attr_u32, child, child_text, children};

use super::{
    apply_artic_token, clef_sign_from_shape, fold_states, parse_beat, parse_harmony_text,
    parse_key_sig, parse_tstamp2, MEI_DIVISIONS,
};

/// Measure children resolved after the body walk
const CONTROL_EVENTS: &[&str] = &[
    "slur", "tie", "gliss", "hairpin", "dynam", "dir", "tempo", "pedal", "octave", "harm",
    "arpeg", "trill", "mordent", "turn", "fermata", "tupletSpan", "beamSpan",
];

/// Parse an MEI document into the pivot score
pub fn read_mei(text: &str) -> ConvertResult<Score> {
    let doc = Document::parse(text).map_err(|e| ConvertError::MalformedXml(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "mei" {
        return Err(ConvertError::UnsupportedRoot(
            root.tag_name().name().to_string(),
        ));
    }

    let mut score = Score::new();
    if let Some(stmt) = root
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "titleStmt")
    {
        score.title = child_text(stmt, "title")
            .filter(|t| !t.is_empty())
            .map(String::from);
    }
    for annot in root
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "annot")
    {
        if annot.attribute("type") != Some(metadata::MEI_ANNOT_TYPE) {
            continue;
        }
        let Some(label) = annot.attribute("label") else {
            continue;
        };
        let value = annot.text().unwrap_or_default();
        if label.starts_with(metadata::DIAGNOSTIC_FIELD_PREFIX) {
            if let Some(diag) = metadata::parse_diagnostic_field(value) {
                score.diagnostics.push(diag);
                continue;
            }
        }
        score.misc_fields.push((label.to_string(), value.to_string()));
    }

    let mut reader = MeiReader::new();
    let mut first_scoredef: Option<NodeId> = None;
    for node in root.descendants().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "scoreDef" => {
                if node.ancestors().skip(1).any(|a| a.tag_name().name() == "measure") {
                    continue;
                }
                match first_scoredef {
                    None => {
                        first_scoredef = Some(node.id());
                        reader.read_first_score_def(node);
                    }
                    Some(_) => reader.apply_score_attrs(node),
                }
            }
            "staffDef" => {
                let in_first = first_scoredef
                    .map_or(false, |id| node.ancestors().skip(1).any(|a| a.id() == id));
                if !in_first {
                    reader.apply_staff_def(node);
                }
            }
            "measure" => reader.read_measure(node),
            _ => {}
        }
    }
    reader.into_score(&mut score);
    log::debug!(
        "read MEI document: {} parts, {} measures, {} diagnostics",
        score.parts.len(),
        score.parts.first().map_or(0, |p| p.measures.len()),
        score.diagnostics.len()
    );
    Ok(score)
}

/// Per-layer reading context, copied down into beam and tuplet subtrees
#[derive(Clone, Copy)]
struct LayerCtx {
    time_mod: Option<TimeModification>,
    voice: u32,
    staff: u32,
    key_fifths: i32,
    capacity: Ticks,
    measure_no: u32,
}

#[derive(Clone, Copy, PartialEq)]
enum SpanKind {
    Slur,
    Gliss,
}

/// A slur or glissando with both endpoints resolved to note positions
struct Span {
    kind: SpanKind,
    start: (usize, usize, usize),
    end: (usize, usize, usize),
}

struct MeiReader<'a, 'input> {
    parts: Vec<Part>,
    /// Global staff number to (part index, local staff)
    staff_map: HashMap<u32, (usize, u32)>,
    staff_counts: Vec<u32>,
    /// Attribute changes waiting for the next measure, one per part
    pending: Vec<Attributes>,
    states: Vec<AttributeState>,
    measure_count: usize,
    controls: Vec<(usize, Node<'a, 'input>)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a, 'input> MeiReader<'a, 'input> {
    fn new() -> Self {
        MeiReader {
            parts: Vec::new(),
            staff_map: HashMap::new(),
            staff_counts: Vec::new(),
            pending: Vec::new(),
            states: Vec::new(),
            measure_count: 0,
            controls: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn unsupported(&mut self, measure: u32, detail: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Dropped,
                detail,
            )
            .at_measure(measure),
        );
    }

    fn unmapped(&mut self, measure: u32, detail: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnmappedMark,
                DiagnosticAction::Dropped,
                detail,
            )
            .at_measure(measure),
        );
    }

    fn substituted(&mut self, measure: u32, detail: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Substituted,
                detail,
            )
            .at_measure(measure),
        );
    }

    fn dropped_control(&mut self, measure: u32, name: &str) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnresolvedControl,
                DiagnosticAction::Dropped,
                format!("<{name}> endpoints could not be resolved"),
            )
            .at_measure(measure),
        );
    }

    fn add_part(&mut self, name: Option<String>, globals: &[u32]) -> usize {
        let pi = self.parts.len();
        let mut part = Part::new(format!("P{}", pi + 1));
        part.name = name;
        self.parts.push(part);
        self.staff_counts.push(globals.len() as u32);
        self.states.push(AttributeState::default());
        let mut attrs = Attributes::default();
        attrs.divisions = Some(MEI_DIVISIONS);
        if globals.len() > 1 {
            attrs.staves = Some(globals.len() as u32);
        }
        self.pending.push(attrs);
        for (i, &global) in globals.iter().enumerate() {
            self.staff_map.insert(global, (pi, i as u32 + 1));
        }
        // a part declared mid-document catches up with the measures read so far
        while self.parts[pi].measures.len() < self.measure_count {
            self.start_measure(pi, None);
        }
        pi
    }

    fn resolve_staff(&mut self, global: u32) -> (usize, u32) {
        if let Some(&hit) = self.staff_map.get(&global) {
            return hit;
        }
        if self.parts.is_empty() {
            self.add_part(None, &[global]);
        } else {
            let pi = self.parts.len() - 1;
            self.staff_counts[pi] += 1;
            self.staff_map.insert(global, (pi, self.staff_counts[pi]));
        }
        self.staff_map[&global]
    }

    fn start_measure(&mut self, pi: usize, number: Option<&str>) {
        let n = number
            .map(String::from)
            .unwrap_or_else(|| (self.parts[pi].measures.len() + 1).to_string());
        let mut measure = Measure::new(n);
        let pending = std::mem::take(&mut self.pending[pi]);
        if !pending.is_empty() {
            self.states[pi].apply(&pending);
            measure.attributes = Some(pending);
        }
        self.parts[pi].measures.push(measure);
    }

    fn read_first_score_def(&mut self, node: Node) {
        let group = child(node, "staffGrp").unwrap_or(node);
        let mut next_global = 1u32;
        for item in group.children().filter(|n| n.is_element()) {
            match item.tag_name().name() {
                "staffGrp" => {
                    let defs: Vec<Node> = item
                        .descendants()
                        .filter(|n| n.is_element() && n.tag_name().name() == "staffDef")
                        .collect();
                    if !defs.is_empty() {
                        self.add_group(label_of(item), &defs, &mut next_global);
                    }
                }
                "staffDef" => {
                    self.add_group(label_of(item), &[item], &mut next_global);
                }
                // group symbols, labels and instrument furniture carry no content
                _ => {}
            }
        }
        self.apply_score_attrs(node);
    }

    fn add_group(&mut self, name: Option<String>, defs: &[Node], next_global: &mut u32) {
        let globals: Vec<u32> = defs
            .iter()
            .map(|def| {
                let g = attr_u32(*def, "n").unwrap_or(*next_global);
                *next_global = g + 1;
                g
            })
            .collect();
        let pi = self.add_part(name, &globals);
        for (i, def) in defs.iter().enumerate() {
            let local = i as u32 + 1;
            if let Some(clef) = clef_from_def(*def, local) {
                self.pending[pi].clefs.push(clef);
            }
            if let Some(fifths) = key_of(*def) {
                self.pending[pi].key_fifths = Some(fifths);
            }
        }
    }

    /// Score-wide key and meter land on every part's next measure
    fn apply_score_attrs(&mut self, node: Node) {
        let key = key_of(node);
        let time = meter_of(node);
        if key.is_none() && time.is_none() {
            return;
        }
        for pending in &mut self.pending {
            if let Some(fifths) = key {
                pending.key_fifths = Some(fifths);
            }
            if let Some(ts) = time {
                pending.time = Some(ts);
            }
        }
    }

    /// A staffDef outside the opening scoreDef overrides one staff
    fn apply_staff_def(&mut self, node: Node) {
        let Some(global) = attr_u32(node, "n") else {
            self.unsupported(self.measure_count as u32 + 1, "staffDef without a staff number");
            return;
        };
        let (pi, local) = self.resolve_staff(global);
        if let Some(clef) = clef_from_def(node, local) {
            self.pending[pi].clefs.retain(|c| c.staff != local);
            self.pending[pi].clefs.push(clef);
        }
        if let Some(fifths) = key_of(node) {
            self.pending[pi].key_fifths = Some(fifths);
        }
        if let Some(ts) = meter_of(node) {
            self.pending[pi].time = Some(ts);
        }
    }

    fn read_measure(&mut self, node: Node<'a, 'input>) {
        let mi = self.measure_count;
        self.measure_count += 1;
        let number = node.attribute("n");
        for pi in 0..self.parts.len() {
            self.start_measure(pi, number);
        }

        let mut lanes: Vec<Vec<(Vec<MeasureEvent>, Ticks)>> = vec![Vec::new(); self.parts.len()];
        let mut next_staff = 1u32;
        for item in node.children().filter(|n| n.is_element()) {
            let name = item.tag_name().name();
            if name == "staff" {
                let global = attr_u32(item, "n").unwrap_or(next_staff);
                next_staff = global + 1;
                let (pi, local) = self.resolve_staff(global);
                if lanes.len() < self.parts.len() {
                    lanes.resize_with(self.parts.len(), Vec::new);
                }
                let capacity = self.states[pi].measure_capacity();
                let key_fifths = self.states[pi].key_fifths;
                let mut layer_count = 0u32;
                for layer in children(item, "layer") {
                    layer_count += 1;
                    let layer_n = attr_u32(layer, "n").unwrap_or(layer_count);
                    let ctx = LayerCtx {
                        time_mod: None,
                        voice: (local - 1) * 4 + layer_n,
                        staff: local,
                        key_fifths,
                        capacity,
                        measure_no: mi as u32 + 1,
                    };
                    let mut events = Vec::new();
                    let mut advance: Ticks = 0;
                    self.read_layer_items(layer, &ctx, &mut events, &mut advance);
                    lanes[pi].push((events, advance));
                }
            } else if CONTROL_EVENTS.contains(&name) {
                self.controls.push((mi, item));
            } else if name == "annot" {
                // picked up by the head scan
            } else {
                self.unsupported(mi as u32 + 1, format!("measure element <{name}>"));
            }
        }

        for (pi, part_lanes) in lanes.into_iter().enumerate() {
            let measure = &mut self.parts[pi].measures[mi];
            let mut prev_advance: Ticks = 0;
            for (i, (events, advance)) in part_lanes.into_iter().enumerate() {
                if i > 0 && prev_advance > 0 {
                    measure.events.push(MeasureEvent::Backup {
                        duration: prev_advance,
                    });
                }
                measure.events.extend(events);
                prev_advance = advance;
            }
        }
    }

    fn read_layer_items(
        &mut self,
        node: Node,
        ctx: &LayerCtx,
        events: &mut Vec<MeasureEvent>,
        advance: &mut Ticks,
    ) {
        for item in node.children().filter(|n| n.is_element()) {
            match item.tag_name().name() {
                "note" => {
                    if let Some(note) = self.read_note(item, ctx, None) {
                        if !note.grace {
                            *advance += note.duration;
                        }
                        events.push(MeasureEvent::Note(note));
                    }
                }
                "chord" => self.read_chord(item, ctx, events, advance),
                "rest" => {
                    let (note_type, dots) = match item
                        .attribute("dur")
                        .and_then(NoteType::from_mei_dur)
                    {
                        Some(nt) => (nt, attr_u32(item, "dots").unwrap_or(0)),
                        None => {
                            self.substituted(
                                ctx.measure_no,
                                "rest without a duration read as a quarter",
                            );
                            (NoteType::Quarter, 0)
                        }
                    };
                    let sounding = duration::sounding_ticks(
                        written_ticks_of(note_type, dots),
                        ctx.time_mod,
                    );
                    let mut rest = Rest::new(sounding, ctx.voice, ctx.staff);
                    rest.note_type = Some(note_type);
                    rest.dots = dots;
                    rest.time_mod = ctx.time_mod;
                    if item.attribute("fermata").is_some() {
                        rest.notations.fermata = true;
                    }
                    *advance += rest.duration;
                    events.push(MeasureEvent::Rest(rest));
                }
                "mRest" => {
                    let mut rest = Rest::new(ctx.capacity, ctx.voice, ctx.staff);
                    rest.measure_rest = true;
                    if item.attribute("fermata").is_some() {
                        rest.notations.fermata = true;
                    }
                    *advance += rest.duration;
                    events.push(MeasureEvent::Rest(rest));
                }
                "space" => {
                    let Some(note_type) = item.attribute("dur").and_then(NoteType::from_mei_dur)
                    else {
                        self.unsupported(ctx.measure_no, "space without a duration");
                        continue;
                    };
                    let dots = attr_u32(item, "dots").unwrap_or(0);
                    let sounding = duration::sounding_ticks(
                        written_ticks_of(note_type, dots),
                        ctx.time_mod,
                    );
                    events.push(MeasureEvent::Forward {
                        duration: sounding,
                        voice: Some(ctx.voice),
                        staff: Some(ctx.staff),
                    });
                    *advance += sounding;
                }
                "mSpace" => {
                    events.push(MeasureEvent::Forward {
                        duration: ctx.capacity,
                        voice: Some(ctx.voice),
                        staff: Some(ctx.staff),
                    });
                    *advance += ctx.capacity;
                }
                "beam" => self.read_beam(item, ctx, events, advance),
                "tuplet" => self.read_tuplet(item, ctx, events, advance),
                "clef" => self.unsupported(ctx.measure_no, "mid-measure clef change"),
                other => self.unsupported(ctx.measure_no, format!("layer element <{other}>")),
            }
        }
    }

    fn read_note(
        &mut self,
        node: Node,
        ctx: &LayerCtx,
        inherited: Option<(NoteType, u32)>,
    ) -> Option<Note> {
        let Some(step) = node.attribute("pname").and_then(Step::from_name) else {
            self.unsupported(ctx.measure_no, "note without a pitch name");
            return None;
        };
        let Some(octave) = attr_i32(node, "oct") else {
            self.unsupported(ctx.measure_no, "note without an octave");
            return None;
        };

        let own = node
            .attribute("dur")
            .and_then(NoteType::from_mei_dur)
            .map(|nt| (nt, attr_u32(node, "dots").unwrap_or(0)));
        let (note_type, dots) = match own.or(inherited) {
            Some(symbol) => symbol,
            None => {
                self.substituted(ctx.measure_no, "note without a duration read as a quarter");
                (NoteType::Quarter, 0)
            }
        };
        let sounding = duration::sounding_ticks(written_ticks_of(note_type, dots), ctx.time_mod);

        // printed glyph first, then a gestural alteration, then the key default
        let ges = node
            .attribute("accid.ges")
            .or_else(|| child(node, "accid").and_then(|a| a.attribute("accid.ges")));
        let mut accidental = None;
        let mut alter = ges
            .and_then(Accidental::from_mei_name)
            .map_or_else(|| diatonic_alter(step, ctx.key_fifths), |a| a.alter());
        let glyph = node
            .attribute("accid")
            .or_else(|| child(node, "accid").and_then(|a| a.attribute("accid")));
        if let Some(name) = glyph {
            match Accidental::from_mei_name(name) {
                Some(acc) => {
                    accidental = Some(acc);
                    alter = acc.alter();
                }
                None => self.unmapped(ctx.measure_no, format!("accidental '{name}'")),
            }
        }

        let mut note = Note::new(Pitch::new(step, alter, octave), sounding, ctx.voice, ctx.staff);
        note.id = node
            .attributes()
            .find(|a| a.name() == "id")
            .map(|a| a.value().to_string());
        note.note_type = Some(note_type);
        note.dots = dots;
        note.time_mod = ctx.time_mod;
        note.accidental = accidental;
        if let Some(grace) = node.attribute("grace") {
            note.grace = true;
            note.grace_slash = grace == "unacc";
            note.duration = 0;
        }
        match node.attribute("tie") {
            Some("i") => note.tie_start = true,
            Some("m") => {
                note.tie_start = true;
                note.tie_stop = true;
            }
            Some("t") => note.tie_stop = true,
            _ => {}
        }
        if let Some(artic) = node.attribute("artic") {
            for token in artic.split_whitespace() {
                if !apply_artic_token(token, &mut note.notations) {
                    self.unmapped(ctx.measure_no, format!("articulation '{token}'"));
                }
            }
        }
        if node.attribute("fermata").is_some() {
            note.notations.fermata = true;
        }
        Some(note)
    }

    fn read_chord(
        &mut self,
        node: Node,
        ctx: &LayerCtx,
        events: &mut Vec<MeasureEvent>,
        advance: &mut Ticks,
    ) {
        let inherited = node
            .attribute("dur")
            .and_then(NoteType::from_mei_dur)
            .map(|nt| (nt, attr_u32(node, "dots").unwrap_or(0)));
        let grace = node.attribute("grace");
        let tie = node.attribute("tie");
        let mut members = Vec::new();
        for item in children(node, "note") {
            if let Some(note) = self.read_note(item, ctx, inherited) {
                members.push(note);
            }
        }
        if members.is_empty() {
            self.unsupported(ctx.measure_no, "chord without readable notes");
            return;
        }
        for (i, note) in members.iter_mut().enumerate() {
            note.chord = i > 0;
            if let Some(g) = grace {
                note.grace = true;
                note.grace_slash = g == "unacc";
                note.duration = 0;
            }
            if let Some(t) = tie {
                note.tie_start |= matches!(t, "i" | "m");
                note.tie_stop |= matches!(t, "t" | "m");
            }
        }
        // chord-level articulation and fermata ride the first member
        if let Some(artic) = node.attribute("artic") {
            for token in artic.split_whitespace() {
                if !apply_artic_token(token, &mut members[0].notations) {
                    self.unmapped(ctx.measure_no, format!("articulation '{token}'"));
                }
            }
        }
        if node.attribute("fermata").is_some() {
            members[0].notations.fermata = true;
        }
        if !members[0].grace {
            *advance += members[0].duration;
        }
        events.extend(members.into_iter().map(MeasureEvent::Note));
    }

    fn read_beam(
        &mut self,
        node: Node,
        ctx: &LayerCtx,
        events: &mut Vec<MeasureEvent>,
        advance: &mut Ticks,
    ) {
        let start = events.len();
        self.read_layer_items(node, ctx, events, advance);
        let members: Vec<usize> = (start..events.len())
            .filter(|&i| matches!(&events[i], MeasureEvent::Note(n) if !n.grace && !n.chord))
            .collect();
        if members.len() < 2 {
            return;
        }
        let levels: Vec<u32> = members
            .iter()
            .map(|&i| match &events[i] {
                MeasureEvent::Note(n) => n.note_type.map_or(0, |t| t.beam_level()),
                _ => 0,
            })
            .collect();
        for (&i, beams) in members.iter().zip(beaming::assign_run(&levels)) {
            if let MeasureEvent::Note(n) = &mut events[i] {
                n.beams = beams;
            }
        }
    }

    fn read_tuplet(
        &mut self,
        node: Node,
        ctx: &LayerCtx,
        events: &mut Vec<MeasureEvent>,
        advance: &mut Ticks,
    ) {
        let ratio = match (attr_u32(node, "num"), attr_u32(node, "numbase")) {
            (Some(num), Some(base)) => TimeModification::new(num, base),
            _ => None,
        };
        let Some(ratio) = ratio else {
            self.unsupported(ctx.measure_no, "tuplet without num/numbase");
            self.read_layer_items(node, ctx, events, advance);
            return;
        };
        // nested tuplets compound their ratios
        let combined = match ctx.time_mod {
            Some(outer) => TimeModification::new(
                outer.actual_notes * ratio.actual_notes,
                outer.normal_notes * ratio.normal_notes,
            ),
            None => Some(ratio),
        };
        let inner = LayerCtx {
            time_mod: combined,
            ..*ctx
        };
        let start = events.len();
        self.read_layer_items(node, &inner, events, advance);
        let principals: Vec<usize> = (start..events.len())
            .filter(|&i| match &events[i] {
                MeasureEvent::Note(n) => !n.grace && !n.chord,
                MeasureEvent::Rest(_) => true,
                _ => false,
            })
            .collect();
        if principals.len() >= 2 {
            mark_tuplet(&mut events[principals[0]], StartStop::Start);
            mark_tuplet(&mut events[principals[principals.len() - 1]], StartStop::Stop);
        }
    }

    fn into_score(mut self, score: &mut Score) {
        self.resolve_controls();
        for (pi, part) in self.parts.iter_mut().enumerate() {
            let staves = self.staff_counts[pi];
            if staves > 1 {
                if let Some(first) = part.measures.first_mut() {
                    let attrs = first.attributes.get_or_insert_with(Attributes::default);
                    attrs.staves = Some(staves);
                }
            }
        }
        score.parts = std::mem::take(&mut self.parts);
        score.diagnostics.append(&mut self.diagnostics);
    }

    fn note_index(&self) -> HashMap<String, (usize, usize, usize)> {
        let mut ids = HashMap::new();
        for (pi, part) in self.parts.iter().enumerate() {
            for (mi, measure) in part.measures.iter().enumerate() {
                for (ei, event) in measure.events.iter().enumerate() {
                    if let MeasureEvent::Note(n) = event {
                        if let Some(id) = &n.id {
                            ids.insert(id.clone(), (pi, mi, ei));
                        }
                    }
                }
            }
        }
        ids
    }

    fn resolve_controls(&mut self) {
        let controls = std::mem::take(&mut self.controls);
        if controls.is_empty() {
            return;
        }
        let ids = self.note_index();

        // span tuplets and beams first: they rewrite durations the
        // timelines below must already reflect
        for &(mi, node) in &controls {
            match node.tag_name().name() {
                "tupletSpan" => self.apply_tuplet_span(node, mi, &ids),
                "beamSpan" => self.apply_beam_span(node, mi, &ids),
                _ => {}
            }
        }

        let states: Vec<Vec<AttributeState>> = self.parts.iter().map(fold_states).collect();
        let timelines: Vec<Vec<timing::MeasureTimeline>> = self
            .parts
            .iter()
            .map(|p| p.measures.iter().map(|m| timing::timeline(&m.events)).collect())
            .collect();

        let mut spans: Vec<Span> = Vec::new();
        let mut inserts: Vec<(usize, usize, Ticks, MeasureEvent)> = Vec::new();
        for &(mi, node) in &controls {
            let name = node.tag_name().name();
            let measure_no = mi as u32 + 1;
            match name {
                "slur" | "gliss" => {
                    let start =
                        self.note_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp");
                    let end =
                        self.note_anchor(node, mi, &ids, &states, &timelines, "endid", "tstamp2");
                    let key = |p: (usize, usize, usize)| {
                        (p.1, timelines[p.0][p.1].events[p.2].onset, p.2)
                    };
                    match (start, end) {
                        (Some(s), Some(e)) if s.0 == e.0 && key(s) < key(e) => {
                            spans.push(Span {
                                kind: if name == "slur" {
                                    SpanKind::Slur
                                } else {
                                    SpanKind::Gliss
                                },
                                start: s,
                                end: e,
                            });
                        }
                        _ => self.dropped_control(measure_no, name),
                    }
                }
                "tie" => {
                    let start =
                        self.note_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp");
                    let end =
                        self.note_anchor(node, mi, &ids, &states, &timelines, "endid", "tstamp2");
                    match (start, end) {
                        (Some(s), Some(e)) if s != e => {
                            if let MeasureEvent::Note(n) =
                                &mut self.parts[s.0].measures[s.1].events[s.2]
                            {
                                n.tie_start = true;
                            }
                            if let MeasureEvent::Note(n) =
                                &mut self.parts[e.0].measures[e.1].events[e.2]
                            {
                                n.tie_stop = true;
                            }
                        }
                        _ => self.dropped_control(measure_no, name),
                    }
                }
                "trill" | "mordent" | "turn" => {
                    let Some((pi, nmi, ei)) =
                        self.note_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp")
                    else {
                        self.dropped_control(measure_no, name);
                        continue;
                    };
                    let ornament = match name {
                        "trill" => Ornament::Trill,
                        "turn" => Ornament::Turn,
                        _ => {
                            if node.attribute("form") == Some("upper") {
                                Ornament::InvertedMordent
                            } else {
                                Ornament::Mordent
                            }
                        }
                    };
                    if let MeasureEvent::Note(n) = &mut self.parts[pi].measures[nmi].events[ei] {
                        n.notations.ornaments.push(ornament);
                    }
                }
                "fermata" => {
                    let Some((pi, nmi, ei)) =
                        self.note_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp")
                    else {
                        self.dropped_control(measure_no, name);
                        continue;
                    };
                    if let MeasureEvent::Note(n) = &mut self.parts[pi].measures[nmi].events[ei] {
                        n.notations.fermata = true;
                    }
                }
                "arpeg" => {
                    let target = node
                        .attribute("plist")
                        .and_then(|p| p.split_whitespace().next())
                        .or_else(|| node.attribute("startid"))
                        .and_then(|raw| ids.get(raw.trim_start_matches('#')).copied());
                    let Some((pi, nmi, ei)) = target else {
                        self.dropped_control(measure_no, name);
                        continue;
                    };
                    let events = &mut self.parts[pi].measures[nmi].events;
                    // a chord member walks back to the cluster principal
                    let mut k = ei;
                    while k > 0 && matches!(&events[k], MeasureEvent::Note(n) if n.chord) {
                        k -= 1;
                    }
                    if let MeasureEvent::Note(n) = &mut events[k] {
                        n.notations.arpeggiate = true;
                    }
                }
                "dynam" | "dir" | "tempo" | "pedal" => {
                    let Some((pi, nmi, onset, staff)) =
                        self.span_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp")
                    else {
                        self.dropped_control(measure_no, name);
                        continue;
                    };
                    let placement = node.attribute("place").and_then(Placement::from_name);
                    let kind = match name {
                        "dynam" => text_of(node).map(DirectionKind::Dynamic),
                        "dir" => text_of(node).map(DirectionKind::Words),
                        "tempo" => {
                            let beat_unit = node
                                .attribute("mm.unit")
                                .and_then(NoteType::from_mei_dur)
                                .unwrap_or(NoteType::Quarter);
                            node.attribute("mm")
                                .map(String::from)
                                .or_else(|| text_of(node))
                                .map(|per_minute| DirectionKind::Metronome {
                                    beat_unit,
                                    per_minute,
                                })
                        }
                        _ => match node.attribute("dir") {
                            Some("down") => Some(DirectionKind::Pedal(PedalKind::Start)),
                            Some("up") => Some(DirectionKind::Pedal(PedalKind::Stop)),
                            Some("bounce") => Some(DirectionKind::Pedal(PedalKind::Change)),
                            _ => None,
                        },
                    };
                    match kind {
                        Some(kind) => inserts.push((
                            pi,
                            nmi,
                            onset,
                            MeasureEvent::Direction(Direction {
                                kind,
                                placement,
                                staff,
                                voice: None,
                            }),
                        )),
                        None => {
                            self.unmapped(measure_no, format!("<{name}> without usable content"))
                        }
                    }
                }
                "hairpin" => {
                    let start =
                        self.span_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp");
                    let end =
                        self.span_anchor(node, mi, &ids, &states, &timelines, "endid", "tstamp2");
                    let kind = match node.attribute("form") {
                        Some("cres") => Some(WedgeKind::Crescendo),
                        Some("dim") => Some(WedgeKind::Diminuendo),
                        _ => None,
                    };
                    match (start, end, kind) {
                        (Some(s), Some(e), Some(kind)) if s.0 == e.0 => {
                            let placement =
                                node.attribute("place").and_then(Placement::from_name);
                            inserts.push((
                                s.0,
                                s.1,
                                s.2,
                                MeasureEvent::Direction(Direction {
                                    kind: DirectionKind::Wedge(kind),
                                    placement,
                                    staff: s.3,
                                    voice: None,
                                }),
                            ));
                            inserts.push((
                                e.0,
                                e.1,
                                e.2,
                                MeasureEvent::Direction(Direction {
                                    kind: DirectionKind::Wedge(WedgeKind::Stop),
                                    placement: None,
                                    staff: e.3,
                                    voice: None,
                                }),
                            ));
                        }
                        _ => self.dropped_control(measure_no, name),
                    }
                }
                "octave" => {
                    let start =
                        self.span_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp");
                    let end =
                        self.span_anchor(node, mi, &ids, &states, &timelines, "endid", "tstamp2");
                    let size = match node.attribute("dis") {
                        Some("15") => 15,
                        Some("22") => 22,
                        _ => 8,
                    };
                    let kind = match node.attribute("dis.place") {
                        Some("below") => OctaveShiftKind::Up,
                        _ => OctaveShiftKind::Down,
                    };
                    match (start, end) {
                        (Some(s), Some(e)) if s.0 == e.0 => {
                            inserts.push((
                                s.0,
                                s.1,
                                s.2,
                                MeasureEvent::Direction(Direction {
                                    kind: DirectionKind::OctaveShift { kind, size },
                                    placement: None,
                                    staff: s.3,
                                    voice: None,
                                }),
                            ));
                            inserts.push((
                                e.0,
                                e.1,
                                e.2,
                                MeasureEvent::Direction(Direction {
                                    kind: DirectionKind::OctaveShift {
                                        kind: OctaveShiftKind::Stop,
                                        size,
                                    },
                                    placement: None,
                                    staff: e.3,
                                    voice: None,
                                }),
                            ));
                        }
                        _ => self.dropped_control(measure_no, name),
                    }
                }
                "harm" => {
                    let Some((pi, nmi, onset, _)) =
                        self.span_anchor(node, mi, &ids, &states, &timelines, "startid", "tstamp")
                    else {
                        self.dropped_control(measure_no, name);
                        continue;
                    };
                    match text_of(node).as_deref().and_then(parse_harmony_text) {
                        Some(harmony) => {
                            inserts.push((pi, nmi, onset, MeasureEvent::Harmony(harmony)))
                        }
                        None => self.unmapped(measure_no, "unreadable harmony text"),
                    }
                }
                // handled in the first pass
                "tupletSpan" | "beamSpan" => {}
                _ => {}
            }
        }

        self.number_spans(&timelines, spans);
        self.apply_inserts(&timelines, inserts);
    }

    fn apply_tuplet_span(
        &mut self,
        node: Node,
        mi: usize,
        ids: &HashMap<String, (usize, usize, usize)>,
    ) {
        let measure_no = mi as u32 + 1;
        let ratio = match (attr_u32(node, "num"), attr_u32(node, "numbase")) {
            (Some(num), Some(base)) => TimeModification::new(num, base),
            _ => None,
        };
        let Some(tm) = ratio else {
            self.unsupported(measure_no, "tupletSpan without num/numbase");
            return;
        };
        let (Some(start), Some(end)) =
            (anchor_of(ids, node, "startid"), anchor_of(ids, node, "endid"))
        else {
            self.dropped_control(measure_no, "tupletSpan");
            return;
        };
        if start.0 != end.0 || start.1 != end.1 || end.2 < start.2 {
            self.dropped_control(measure_no, "tupletSpan");
            return;
        }
        let (pi, nmi) = (start.0, start.1);
        let (staff, voice) = match &self.parts[pi].measures[nmi].events[start.2] {
            MeasureEvent::Note(n) => (n.staff, n.voice),
            _ => return,
        };
        let mut principals = Vec::new();
        for ei in start.2..=end.2 {
            match &mut self.parts[pi].measures[nmi].events[ei] {
                MeasureEvent::Note(n) if !n.grace && n.staff == staff && n.voice == voice => {
                    if n.time_mod.is_none() {
                        n.time_mod = Some(tm);
                        n.duration = duration::sounding_ticks(n.duration, Some(tm));
                    }
                    if !n.chord {
                        principals.push(ei);
                    }
                }
                MeasureEvent::Rest(r) if r.staff == staff && r.voice == voice => {
                    if r.time_mod.is_none() {
                        r.time_mod = Some(tm);
                        r.duration = duration::sounding_ticks(r.duration, Some(tm));
                    }
                    principals.push(ei);
                }
                _ => {}
            }
        }
        if principals.len() >= 2 {
            let events = &mut self.parts[pi].measures[nmi].events;
            mark_tuplet(&mut events[principals[0]], StartStop::Start);
            mark_tuplet(&mut events[principals[principals.len() - 1]], StartStop::Stop);
        }
    }

    fn apply_beam_span(
        &mut self,
        node: Node,
        mi: usize,
        ids: &HashMap<String, (usize, usize, usize)>,
    ) {
        let measure_no = mi as u32 + 1;
        let (Some(start), Some(end)) =
            (anchor_of(ids, node, "startid"), anchor_of(ids, node, "endid"))
        else {
            self.dropped_control(measure_no, "beamSpan");
            return;
        };
        if start.0 != end.0 || start.1 != end.1 || end.2 < start.2 {
            self.dropped_control(measure_no, "beamSpan");
            return;
        }
        let (pi, nmi) = (start.0, start.1);
        let (staff, voice) = match &self.parts[pi].measures[nmi].events[start.2] {
            MeasureEvent::Note(n) => (n.staff, n.voice),
            _ => return,
        };
        let events = &mut self.parts[pi].measures[nmi].events;
        let members: Vec<usize> = (start.2..=end.2)
            .filter(|&ei| {
                matches!(&events[ei], MeasureEvent::Note(n)
                    if !n.grace && !n.chord && n.staff == staff && n.voice == voice)
            })
            .collect();
        if members.len() < 2 {
            return;
        }
        let levels: Vec<u32> = members
            .iter()
            .map(|&ei| match &events[ei] {
                MeasureEvent::Note(n) => n.note_type.map_or(0, |t| t.beam_level()),
                _ => 0,
            })
            .collect();
        for (&ei, beams) in members.iter().zip(beaming::assign_run(&levels)) {
            if let MeasureEvent::Note(n) = &mut events[ei] {
                n.beams = beams;
            }
        }
    }

    /// Resolve a note reference, by id when present, else by nearest onset
    fn note_anchor(
        &self,
        node: Node,
        mi: usize,
        ids: &HashMap<String, (usize, usize, usize)>,
        states: &[Vec<AttributeState>],
        timelines: &[Vec<timing::MeasureTimeline>],
        id_attr: &str,
        ts_attr: &str,
    ) -> Option<(usize, usize, usize)> {
        if let Some(raw) = node.attribute(id_attr) {
            return ids.get(raw.trim_start_matches('#')).copied();
        }
        let (pi, nmi, target, _) = self.beat_anchor(node, mi, states, ts_attr)?;
        let ei = self.note_near(timelines, pi, nmi, target)?;
        Some((pi, nmi, ei))
    }

    /// Resolve a position reference to (part, measure, onset, local staff)
    fn span_anchor(
        &self,
        node: Node,
        mi: usize,
        ids: &HashMap<String, (usize, usize, usize)>,
        states: &[Vec<AttributeState>],
        timelines: &[Vec<timing::MeasureTimeline>],
        id_attr: &str,
        ts_attr: &str,
    ) -> Option<(usize, usize, Ticks, u32)> {
        if let Some(raw) = node.attribute(id_attr) {
            let &(pi, nmi, ei) = ids.get(raw.trim_start_matches('#'))?;
            let onset = timelines.get(pi)?.get(nmi)?.events.get(ei)?.onset;
            let staff = match &self.parts[pi].measures[nmi].events[ei] {
                MeasureEvent::Note(n) => n.staff,
                _ => 1,
            };
            return Some((pi, nmi, onset, staff));
        }
        self.beat_anchor(node, mi, states, ts_attr)
    }

    fn beat_anchor(
        &self,
        node: Node,
        mi: usize,
        states: &[Vec<AttributeState>],
        ts_attr: &str,
    ) -> Option<(usize, usize, Ticks, u32)> {
        let global = attr_u32(node, "staff").unwrap_or(1);
        let &(pi, local) = self.staff_map.get(&global)?;
        let raw = node.attribute(ts_attr)?;
        let (delta, beat) = if ts_attr == "tstamp2" {
            parse_tstamp2(raw)?
        } else {
            (0, raw)
        };
        let nmi = mi + delta as usize;
        let state = states.get(pi)?.get(nmi)?;
        let unit = state.divisions * 4 / state.time.beat_type as i64;
        let onset = parse_beat(beat, unit)?;
        Some((pi, nmi, onset, local))
    }

    /// Principal note with the onset nearest to the target, earliest wins ties
    fn note_near(
        &self,
        timelines: &[Vec<timing::MeasureTimeline>],
        pi: usize,
        mi: usize,
        target: Ticks,
    ) -> Option<usize> {
        let measure = self.parts.get(pi)?.measures.get(mi)?;
        let times = timelines.get(pi)?.get(mi)?;
        let mut best: Option<(Ticks, usize)> = None;
        for (ei, event) in measure.events.iter().enumerate() {
            let MeasureEvent::Note(n) = event else {
                continue;
            };
            if n.chord || n.grace {
                continue;
            }
            let distance = (times.events[ei].onset - target).abs();
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, ei));
            }
        }
        best.map(|(_, ei)| ei)
    }

    /// Assign slur and glissando numbers so overlapping spans never collide
    fn number_spans(&mut self, timelines: &[Vec<timing::MeasureTimeline>], mut spans: Vec<Span>) {
        let key = |p: (usize, usize, usize)| {
            (p.0, p.1, timelines[p.0][p.1].events[p.2].onset, p.2)
        };
        spans.sort_by_key(|s| key(s.start));
        let mut active: Vec<((usize, usize, Ticks, usize), u32, SpanKind)> = Vec::new();
        for span in spans {
            let start_key = key(span.start);
            let end_key = key(span.end);
            active.retain(|&(k, _, _)| k > start_key);
            let mut number = 1;
            while active.iter().any(|&(_, n, sk)| n == number && sk == span.kind) {
                number += 1;
            }
            active.push((end_key, number, span.kind));
            for (point, kind) in [(span.start, StartStop::Start), (span.end, StartStop::Stop)] {
                if let MeasureEvent::Note(n) =
                    &mut self.parts[point.0].measures[point.1].events[point.2]
                {
                    match span.kind {
                        SpanKind::Slur => n.notations.slurs.push(SlurMark { kind, number }),
                        SpanKind::Gliss => {
                            n.notations.glissandos.push(GlissandoMark { kind, number })
                        }
                    }
                }
            }
        }
    }

    /// Insert directions and harmony before the first note at their beat
    fn apply_inserts(
        &mut self,
        timelines: &[Vec<timing::MeasureTimeline>],
        inserts: Vec<(usize, usize, Ticks, MeasureEvent)>,
    ) {
        let mut grouped: BTreeMap<(usize, usize), Vec<(Ticks, MeasureEvent)>> = BTreeMap::new();
        for (pi, mi, onset, event) in inserts {
            grouped.entry((pi, mi)).or_default().push((onset, event));
        }
        for ((pi, mi), mut group) in grouped {
            group.sort_by_key(|&(onset, _)| onset);
            let Some(times) = timelines.get(pi).and_then(|t| t.get(mi)) else {
                continue;
            };
            let Some(measure) = self.parts.get_mut(pi).and_then(|p| p.measures.get_mut(mi))
            else {
                continue;
            };
            let mut positions = Vec::with_capacity(group.len());
            for &(onset, _) in &group {
                let mut pos = measure.events.len();
                for (ei, event) in measure.events.iter().enumerate() {
                    if !matches!(event, MeasureEvent::Note(_) | MeasureEvent::Rest(_)) {
                        continue;
                    }
                    if times.events[ei].onset >= onset {
                        pos = ei;
                        break;
                    }
                }
                positions.push(pos);
            }
            for ((_, event), pos) in group.into_iter().zip(positions).rev() {
                measure.events.insert(pos, event);
            }
        }
    }
}

fn mark_tuplet(event: &mut MeasureEvent, kind: StartStop) {
    let notations = match event {
        MeasureEvent::Note(n) => &mut n.notations,
        MeasureEvent::Rest(r) => &mut r.notations,
        _ => return,
    };
    notations.tuplets.push(TupletMark { kind });
}

fn anchor_of(
    ids: &HashMap<String, (usize, usize, usize)>,
    node: Node,
    attr: &str,
) -> Option<(usize, usize, usize)> {
    ids.get(node.attribute(attr)?.trim_start_matches('#')).copied()
}

fn written_ticks_of(note_type: NoteType, dots: u32) -> Ticks {
    duration::symbol_ticks(note_type, dots, MEI_DIVISIONS)
        .unwrap_or_else(|| note_type.ticks(MEI_DIVISIONS))
}

fn label_of(node: Node) -> Option<String> {
    child_text(node, "label")
        .or_else(|| node.attribute("label"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn key_of(node: Node) -> Option<i32> {
    node.attribute("key.sig")
        .or_else(|| child(node, "keySig").and_then(|k| k.attribute("sig")))
        .and_then(parse_key_sig)
}

fn meter_of(node: Node) -> Option<TimeSignature> {
    let count = attr_u32(node, "meter.count")
        .or_else(|| child(node, "meterSig").and_then(|m| attr_u32(m, "count")));
    let unit = attr_u32(node, "meter.unit")
        .or_else(|| child(node, "meterSig").and_then(|m| attr_u32(m, "unit")));
    match (count, unit) {
        (Some(c), Some(u)) => TimeSignature::new(c, u),
        _ => match node.attribute("meter.sym") {
            Some("common") => TimeSignature::new(4, 4),
            Some("cut") => TimeSignature::new(2, 2),
            _ => None,
        },
    }
}

fn clef_from_def(node: Node, staff: u32) -> Option<Clef> {
    let (shape, line, dis, place) = match child(node, "clef") {
        Some(c) => (
            c.attribute("shape"),
            attr_u32(c, "line"),
            attr_u32(c, "dis"),
            c.attribute("dis.place"),
        ),
        None => (
            node.attribute("clef.shape"),
            attr_u32(node, "clef.line"),
            attr_u32(node, "clef.dis"),
            node.attribute("clef.dis.place"),
        ),
    };
    let sign = clef_sign_from_shape(shape?)?;
    let magnitude = match dis {
        Some(15) => 2,
        Some(22) => 3,
        Some(_) => 1,
        None => 0,
    };
    let octave_change = if place == Some("below") {
        -magnitude
    } else {
        magnitude
    };
    Some(Clef {
        staff,
        sign,
        line,
        octave_change,
    })
}

fn text_of(node: Node) -> Option<String> {
    let text = node.text().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BeamValue, ClefSign};

    fn wrap(score_def: &str, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<mei xmlns="http://www.music-encoding.org/ns/mei" meiversion="4.0.1">
  <meiHead><fileDesc><titleStmt><title>Test</title></titleStmt><pubStmt/></fileDesc></meiHead>
  <music><body><mdiv><score>
    {score_def}
    <section>
      {body}
    </section>
  </score></mdiv></body></music></mei>"#
        )
    }

    fn one_staff_def(attrs: &str) -> String {
        format!(
            r#"<scoreDef {attrs}>
      <staffGrp><staffGrp><label>Music</label><staffDef n="1" lines="5" clef.shape="G" clef.line="2"/></staffGrp></staffGrp>
    </scoreDef>"#
        )
    }

    #[test]
    fn test_key_default_supplies_alteration() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4" key.sig="1s""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <note pname="f" oct="4" dur="4"/>
                <note pname="c" oct="4" dur="4"/>
                <rest dur="2"/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        assert_eq!(score.title.as_deref(), Some("Test"));
        let part = &score.parts[0];
        assert_eq!(part.name.as_deref(), Some("Music"));
        let attrs = part.measures[0].attributes.as_ref().unwrap();
        assert_eq!(attrs.divisions, Some(480));
        assert_eq!(attrs.key_fifths, Some(1));
        assert_eq!(attrs.time, TimeSignature::new(4, 4));
        assert_eq!(attrs.clefs.len(), 1);
        assert_eq!(attrs.clefs[0].sign, ClefSign::G);
        assert_eq!(attrs.clefs[0].line, Some(2));

        let events = &part.measures[0].events;
        let MeasureEvent::Note(f) = &events[0] else {
            panic!("expected note");
        };
        assert_eq!(f.pitch, Pitch::new(Step::F, 1, 4));
        assert_eq!(f.accidental, None);
        assert_eq!(f.duration, 480);
        assert_eq!(f.note_type, Some(NoteType::Quarter));
        let MeasureEvent::Note(c) = &events[1] else {
            panic!("expected note");
        };
        assert_eq!(c.pitch, Pitch::new(Step::C, 0, 4));
        assert!(matches!(&events[2], MeasureEvent::Rest(r) if r.duration == 960));
    }

    #[test]
    fn test_explicit_and_gestural_accidentals() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4" key.sig="0""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <note pname="f" oct="4" dur="4" accid="s"/>
                <note pname="f" oct="4" dur="4" accid.ges="s"/>
                <note pname="b" oct="4" dur="2"/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        let MeasureEvent::Note(printed) = &events[0] else {
            panic!("expected note");
        };
        assert_eq!(printed.accidental, Some(Accidental::Sharp));
        assert_eq!(printed.pitch.alter, 1);
        let MeasureEvent::Note(gestural) = &events[1] else {
            panic!("expected note");
        };
        assert_eq!(gestural.accidental, None);
        assert_eq!(gestural.pitch.alter, 1);
        let MeasureEvent::Note(plain) = &events[2] else {
            panic!("expected note");
        };
        assert_eq!(plain.pitch.alter, 0);
    }

    #[test]
    fn test_layers_become_voices_with_backup() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1">
                <layer n="1"><note pname="c" oct="5" dur="1"/></layer>
                <layer n="2"><note pname="e" oct="4" dur="1"/></layer>
            </staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], MeasureEvent::Note(n) if n.voice == 1));
        assert!(matches!(&events[1], MeasureEvent::Backup { duration: 1920 }));
        assert!(matches!(&events[2], MeasureEvent::Note(n) if n.voice == 2));
    }

    #[test]
    fn test_chord_members_share_duration() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <chord dur="4" dots="1">
                    <note pname="c" oct="4"/>
                    <note pname="e" oct="4"/>
                </chord>
                <rest dur="4"/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        let MeasureEvent::Note(first) = &events[0] else {
            panic!("expected note");
        };
        assert!(!first.chord);
        assert_eq!(first.duration, 720);
        assert_eq!(first.dots, 1);
        let MeasureEvent::Note(second) = &events[1] else {
            panic!("expected note");
        };
        assert!(second.chord);
        assert_eq!(second.duration, 720);
    }

    #[test]
    fn test_tuplet_scales_durations_and_marks_edges() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <tuplet num="3" numbase="2">
                    <note pname="c" oct="4" dur="8"/>
                    <note pname="d" oct="4" dur="8"/>
                    <note pname="e" oct="4" dur="8"/>
                </tuplet>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        for event in events {
            let MeasureEvent::Note(n) = event else {
                panic!("expected note");
            };
            assert_eq!(n.duration, 160);
            assert_eq!(n.time_mod, TimeModification::new(3, 2));
        }
        let marks = |i: usize| match &events[i] {
            MeasureEvent::Note(n) => n.notations.tuplets.clone(),
            _ => Vec::new(),
        };
        assert_eq!(marks(0), vec![TupletMark { kind: StartStop::Start }]);
        assert!(marks(1).is_empty());
        assert_eq!(marks(2), vec![TupletMark { kind: StartStop::Stop }]);
    }

    #[test]
    fn test_measure_rest_fills_meter() {
        let text = wrap(
            &one_staff_def(r#"meter.count="3" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1"><mRest/></layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let MeasureEvent::Rest(rest) = &score.parts[0].measures[0].events[0] else {
            panic!("expected rest");
        };
        assert!(rest.measure_rest);
        assert_eq!(rest.duration, 1440);
    }

    #[test]
    fn test_space_becomes_forward() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <space dur="4"/>
                <note pname="g" oct="4" dur="4"/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(
            &events[0],
            MeasureEvent::Forward { duration: 480, voice: Some(1), staff: Some(1) }
        ));
        assert!(matches!(&events[1], MeasureEvent::Note(_)));
    }

    #[test]
    fn test_grace_note_keeps_zero_duration() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <note pname="d" oct="5" dur="8" grace="unacc"/>
                <note pname="c" oct="5" dur="1"/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let MeasureEvent::Note(grace) = &score.parts[0].measures[0].events[0] else {
            panic!("expected note");
        };
        assert!(grace.grace);
        assert!(grace.grace_slash);
        assert_eq!(grace.duration, 0);
        assert_eq!(grace.note_type, Some(NoteType::Eighth));
    }

    #[test]
    fn test_beam_assigns_explicit_state() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <beam>
                    <note pname="c" oct="4" dur="8"/>
                    <note pname="d" oct="4" dur="8"/>
                </beam>
                <rest dur="2"/><rest dur="4"/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        let beams = |i: usize| match &events[i] {
            MeasureEvent::Note(n) => n.beams.clone(),
            _ => Vec::new(),
        };
        assert_eq!(beams(0).len(), 1);
        assert_eq!(beams(0)[0].value, BeamValue::Begin);
        assert_eq!(beams(1)[0].value, BeamValue::End);
    }

    #[test]
    fn test_slur_resolved_by_id() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r##"<measure n="1">
                <staff n="1"><layer n="1">
                    <note xml:id="a" pname="c" oct="4" dur="2"/>
                    <note xml:id="b" pname="d" oct="4" dur="2"/>
                </layer></staff>
                <slur staff="1" startid="#a" endid="#b"/>
            </measure>"##,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        let MeasureEvent::Note(start) = &events[0] else {
            panic!("expected note");
        };
        assert_eq!(
            start.notations.slurs,
            vec![SlurMark { kind: StartStop::Start, number: 1 }]
        );
        let MeasureEvent::Note(end) = &events[1] else {
            panic!("expected note");
        };
        assert_eq!(
            end.notations.slurs,
            vec![SlurMark { kind: StartStop::Stop, number: 1 }]
        );
        assert!(score.diagnostics.is_empty());
    }

    #[test]
    fn test_unresolved_slur_diagnosed() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r##"<measure n="1">
                <staff n="1"><layer n="1">
                    <note xml:id="a" pname="c" oct="4" dur="1"/>
                </layer></staff>
                <slur staff="1" startid="#a" endid="#missing"/>
            </measure>"##,
        );
        let score = read_mei(&text).unwrap();
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(score.diagnostics[0].kind, DiagnosticKind::UnresolvedControl);
        let MeasureEvent::Note(n) = &score.parts[0].measures[0].events[0] else {
            panic!("expected note");
        };
        assert!(n.notations.slurs.is_empty());
    }

    #[test]
    fn test_hairpin_tstamps_become_wedge_pair() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1">
                <staff n="1"><layer n="1"><note pname="c" oct="4" dur="1"/></layer></staff>
                <hairpin staff="1" form="cres" tstamp="1" tstamp2="1m+3"/>
            </measure>
            <measure n="2">
                <staff n="1"><layer n="1"><note pname="d" oct="4" dur="1"/></layer></staff>
            </measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let first = &score.parts[0].measures[0].events;
        assert!(matches!(
            &first[0],
            MeasureEvent::Direction(Direction { kind: DirectionKind::Wedge(WedgeKind::Crescendo), staff: 1, .. })
        ));
        let second = &score.parts[0].measures[1].events;
        assert!(second.iter().any(|e| matches!(
            e,
            MeasureEvent::Direction(Direction { kind: DirectionKind::Wedge(WedgeKind::Stop), .. })
        )));
    }

    #[test]
    fn test_dynam_inserts_before_its_beat() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1">
                <staff n="1"><layer n="1">
                    <note pname="c" oct="4" dur="2"/>
                    <note pname="d" oct="4" dur="2"/>
                </layer></staff>
                <dynam staff="1" tstamp="3" place="below">p</dynam>
            </measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(&events[0], MeasureEvent::Note(_)));
        assert!(matches!(
            &events[1],
            MeasureEvent::Direction(Direction {
                kind: DirectionKind::Dynamic(d),
                placement: Some(Placement::Below),
                ..
            }) if d == "p"
        ));
        assert!(matches!(&events[2], MeasureEvent::Note(_)));
    }

    #[test]
    fn test_tempo_with_metronome_number() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1">
                <staff n="1"><layer n="1"><note pname="c" oct="4" dur="1"/></layer></staff>
                <tempo staff="1" tstamp="1" mm="120" mm.unit="4"/>
            </measure>"#,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(
            &events[0],
            MeasureEvent::Direction(Direction {
                kind: DirectionKind::Metronome { beat_unit: NoteType::Quarter, per_minute },
                ..
            }) if per_minute == "120"
        ));
    }

    #[test]
    fn test_mordent_forms() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r##"<measure n="1">
                <staff n="1"><layer n="1">
                    <note xml:id="a" pname="c" oct="4" dur="2"/>
                    <note xml:id="b" pname="d" oct="4" dur="2"/>
                </layer></staff>
                <mordent staff="1" form="lower" startid="#a"/>
                <mordent staff="1" form="upper" startid="#b"/>
            </measure>"##,
        );
        let score = read_mei(&text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(
            &events[0],
            MeasureEvent::Note(n) if n.notations.ornaments == vec![Ornament::Mordent]
        ));
        assert!(matches!(
            &events[1],
            MeasureEvent::Note(n) if n.notations.ornaments == vec![Ornament::InvertedMordent]
        ));
    }

    #[test]
    fn test_two_part_staff_numbering() {
        let score_def = r#"<scoreDef meter.count="4" meter.unit="4">
      <staffGrp>
        <staffGrp><label>One</label><staffDef n="1" lines="5"/></staffGrp>
        <staffGrp><label>Two</label><staffDef n="2" lines="5"/></staffGrp>
      </staffGrp>
    </scoreDef>"#;
        let text = wrap(
            score_def,
            r#"<measure n="1">
                <staff n="1"><layer n="1"><note pname="c" oct="5" dur="1"/></layer></staff>
                <staff n="2"><layer n="1"><note pname="c" oct="3" dur="1"/></layer></staff>
            </measure>"#,
        );
        let score = read_mei(&text).unwrap();
        assert_eq!(score.parts.len(), 2);
        assert_eq!(score.parts[0].name.as_deref(), Some("One"));
        assert_eq!(score.parts[1].name.as_deref(), Some("Two"));
        assert!(matches!(
            &score.parts[1].measures[0].events[0],
            MeasureEvent::Note(n) if n.staff == 1 && n.pitch.octave == 3
        ));
    }

    #[test]
    fn test_key_change_lands_on_second_measure() {
        let body = r#"<measure n="1">
                <staff n="1"><layer n="1"><note pname="c" oct="4" dur="1"/></layer></staff>
            </measure>
            <scoreDef key.sig="2s"/>
            <measure n="2">
                <staff n="1"><layer n="1"><note pname="c" oct="4" dur="1"/></layer></staff>
            </measure>"#;
        let text = wrap(&one_staff_def(r#"meter.count="4" meter.unit="4" key.sig="0""#), body);
        let score = read_mei(&text).unwrap();
        let part = &score.parts[0];
        assert_eq!(part.measures[0].attributes.as_ref().unwrap().key_fifths, Some(0));
        assert_eq!(part.measures[1].attributes.as_ref().unwrap().key_fifths, Some(2));
    }

    #[test]
    fn test_annot_fields_recovered() {
        let text = format!(
            r#"<mei xmlns="http://www.music-encoding.org/ns/mei">
  <meiHead><fileDesc><titleStmt><title/></titleStmt><pubStmt/>
    <notesStmt>
      <annot type="{}" label="mx:source-format">musicxml</annot>
      <annot type="{}" label="{}0">{}</annot>
    </notesStmt>
  </fileDesc></meiHead>
  <music/>
</mei>"#,
            metadata::MEI_ANNOT_TYPE,
            metadata::MEI_ANNOT_TYPE,
            metadata::DIAGNOSTIC_FIELD_PREFIX,
            metadata::diagnostic_field_value(&Diagnostic::new(
                DiagnosticKind::UnmappedMark,
                DiagnosticAction::Dropped,
                "lost mark",
            )),
        );
        let score = read_mei(&text).unwrap();
        assert_eq!(score.title, None);
        assert_eq!(
            score.misc_fields,
            vec![("mx:source-format".to_string(), "musicxml".to_string())]
        );
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(score.diagnostics[0].kind, DiagnosticKind::UnmappedMark);
        assert_eq!(score.diagnostics[0].detail, "lost mark");
    }

    #[test]
    fn test_rejects_foreign_root() {
        let err = read_mei("<musicxml/>");
        assert!(matches!(err, Err(ConvertError::UnsupportedRoot(r)) if r == "musicxml"));
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(matches!(
            read_mei("<mei><music>"),
            Err(ConvertError::MalformedXml(_))
        ));
    }

    #[test]
    fn test_unknown_layer_element_diagnosed() {
        let text = wrap(
            &one_staff_def(r#"meter.count="4" meter.unit="4""#),
            r#"<measure n="1"><staff n="1"><layer n="1">
                <note pname="c" oct="4" dur="1"/>
                <bTrem/>
            </layer></staff></measure>"#,
        );
        let score = read_mei(&text).unwrap();
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(score.diagnostics[0].kind, DiagnosticKind::UnsupportedElement);
        assert_eq!(score.diagnostics[0].measure, Some(1));
    }
}
