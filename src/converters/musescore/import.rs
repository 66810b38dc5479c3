//! MuseScore to pivot
//!
//! Trackwise staves fold back into partwise measures: every `<voice>`
//! stream is read with a tick cursor, later voices join their measure
//! behind a backup, and `<Spanner>` tokens are collected during the walk.
//! A start token pairs with the end token its relative offset points at,
//! and only with one whose own offset points back, so overlapping spanners
//! of the same type cannot cross-link. Notes without a usable tpc are
//! respelled afterwards against the declared key, or against an estimated
//! one when the file declares none.

use std::collections::{BTreeMap, HashMap, HashSet};

use num_rational::Rational32;
use roxmltree::{Document, Node};

use crate::beaming;
use crate::diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
use crate::errors::{ConvertError, ConvertResult};
use crate::key_estimate::{estimate_by_measure, WeightedPitch};
use crate::metadata;
use crate::models::{
    AttributeState, Attributes, Direction, DirectionKind, GlissandoMark, Harmony, Lyric, Measure,
    MeasureEvent, Note, NoteType, OctaveShiftKind, Ornament, Part, PedalKind, Pitch, Placement,
    Rest, Score, SlurMark, StartStop, Syllabic, Ticks, TimeModification, TimeSignature, TupletMark,
    WedgeKind,
};
use crate::rhythm::{duration, timing};
use crate::spelling::{spell, AccidentalState};
use crate::xml::{attr_u32, child, child_i32, child_i64, child_text, child_u32, children};

use super::{
    accidental_from_subtype, bpm_text, clef_from_type, fold_states, fraction_of, marks,
    parse_fraction, parse_rational, step_alter_of, MAX_VOICES, MU_DIVISIONS,
};

/// Grace chord markers and whether they carry a slash
const GRACE_MARKERS: &[(&str, bool)] = &[
    ("acciaccatura", true),
    ("appoggiatura", false),
    ("grace4", false),
    ("grace8", false),
    ("grace16", false),
    ("grace32", false),
    ("grace8after", false),
    ("grace16after", false),
    ("grace32after", false),
];

/// Spanner types the pivot can express
const SPANNER_TYPES: &[&str] = &["Slur", "HairPin", "Pedal", "Ottava", "Trill"];

/// Layout and playback properties with no pivot counterpart
const SKIPPED: &[&str] = &[
    "BarLine", "LayoutBreak", "MeasureNumber", "StemDirection", "color", "irregular",
    "noOffset", "offset", "stretch", "visible", "vspacerDown", "vspacerUp",
];

/// Parse a MuseScore 3 project into the pivot score
pub fn read_musescore(text: &str) -> ConvertResult<Score> {
    let doc = Document::parse(text).map_err(|e| ConvertError::MalformedXml(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "museScore" {
        return Err(ConvertError::UnsupportedRoot(
            root.tag_name().name().to_string(),
        ));
    }
    let score_el =
        child(root, "Score").ok_or_else(|| ConvertError::MissingElement("Score".into()))?;

    let mut score = Score::new();
    for tag in children(score_el, "metaTag") {
        let Some(name) = tag.attribute("name") else {
            continue;
        };
        let value = tag.text().unwrap_or_default();
        if name == "workTitle" {
            if !value.trim().is_empty() {
                score.title = Some(value.to_string());
            }
            continue;
        }
        if name.starts_with(metadata::DIAGNOSTIC_FIELD_PREFIX) {
            if let Some(diag) = metadata::parse_diagnostic_field(value) {
                score.diagnostics.push(diag);
                continue;
            }
        }
        score.misc_fields.push((name.to_string(), value.to_string()));
    }

    let division = child_i64(score_el, "Division")
        .filter(|&d| d > 0)
        .unwrap_or(MU_DIVISIONS);
    let mut reader = MuseReader::new(division);
    for el in score_el.children().filter(|n| n.is_element()) {
        match el.tag_name().name() {
            "Part" => reader.add_part(el),
            "Staff" => reader.read_staff(el),
            _ => {}
        }
    }
    reader.into_score(&mut score);
    log::debug!(
        "read MuseScore project: {} parts, {} measures, {} diagnostics",
        score.parts.len(),
        score.parts.first().map_or(0, |p| p.measures.len()),
        score.diagnostics.len()
    );
    Ok(score)
}

/// One half of a paired spanner, held until both halves are in
struct SpanToken {
    name: String,
    part: usize,
    /// Local staff within the part
    staff: u32,
    /// (measure, whole-note fraction into it)
    pos: (i32, Rational32),
    next: Option<(i32, Rational32)>,
    prev: Option<(i32, Rational32)>,
    subtype: Option<String>,
    placement: Option<Placement>,
    /// Event the token hangs marks on, once known
    anchor: Option<(usize, usize)>,
}

#[derive(Clone, Copy)]
struct VoiceCtx {
    pi: usize,
    mi: usize,
    local: u32,
    vi: u32,
}

impl VoiceCtx {
    fn voice(self) -> u32 {
        (self.local - 1) * MAX_VOICES as u32 + self.vi + 1
    }
}

/// Cursor and pending state while one `<voice>` is walked
struct VoiceState {
    events: Vec<MeasureEvent>,
    cursor: Ticks,
    /// Nested tuplet frames: combined ratio and principal event indices
    tuplets: Vec<(Option<TimeModification>, Vec<usize>)>,
    pending_fermata: bool,
    /// Spanner tokens waiting for the next chord or rest to anchor to
    pending_anchors: Vec<usize>,
    beam_modes: HashMap<usize, &'static str>,
}

impl VoiceState {
    fn new() -> VoiceState {
        VoiceState {
            events: Vec::new(),
            cursor: 0,
            tuplets: Vec::new(),
            pending_fermata: false,
            pending_anchors: Vec::new(),
            beam_modes: HashMap::new(),
        }
    }
}

struct MuseReader {
    divisions: i64,
    parts: Vec<Part>,
    /// Global staff id to (part index, local staff)
    staff_map: HashMap<u32, (usize, u32)>,
    /// Cursor position at the end of the last joined voice, per part and measure
    advances: Vec<Vec<Ticks>>,
    /// Irregular measure lengths from `len` attributes
    lens: HashMap<(usize, usize), Ticks>,
    /// Whether the part declared any key signature
    keyed: Vec<bool>,
    spanners: Vec<SpanToken>,
    /// Notes read without a usable tpc, respelled after the walk
    respell: Vec<(usize, usize, usize)>,
    diagnostics: Vec<Diagnostic>,
}

impl MuseReader {
    fn new(divisions: i64) -> MuseReader {
        MuseReader {
            divisions,
            parts: Vec::new(),
            staff_map: HashMap::new(),
            advances: Vec::new(),
            lens: HashMap::new(),
            keyed: Vec::new(),
            spanners: Vec::new(),
            respell: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn report(
        &mut self,
        kind: DiagnosticKind,
        action: DiagnosticAction,
        detail: impl Into<String>,
        ctx: VoiceCtx,
    ) {
        self.diagnostics.push(
            Diagnostic::new(kind, action, detail)
                .at_measure(ctx.mi as u32 + 1)
                .at_staff(ctx.local)
                .at_voice(ctx.voice()),
        );
    }

    fn add_part(&mut self, el: Node) {
        let pi = self.parts.len();
        let mut part = Part::new(format!("P{}", pi + 1));
        part.name = child_text(el, "trackName")
            .or_else(|| child(el, "Instrument").and_then(|i| child_text(i, "longName")))
            .filter(|s| !s.is_empty())
            .map(String::from);
        let mut next = self.staff_map.len() as u32 + 1;
        let mut local = 0;
        for staff_el in children(el, "Staff") {
            local += 1;
            let id = attr_u32(staff_el, "id").unwrap_or(next);
            self.staff_map.insert(id, (pi, local));
            next = id + 1;
        }
        if local == 0 {
            self.staff_map.insert(next, (pi, 1));
        }
        self.parts.push(part);
        self.advances.push(Vec::new());
        self.keyed.push(false);
    }

    /// Content staves that no `<Part>` declared get a part of their own
    fn resolve_staff(&mut self, id: u32) -> (usize, u32) {
        if let Some(&hit) = self.staff_map.get(&id) {
            return hit;
        }
        let pi = self.parts.len();
        self.parts.push(Part::new(format!("P{}", pi + 1)));
        self.advances.push(Vec::new());
        self.keyed.push(false);
        self.staff_map.insert(id, (pi, 1));
        (pi, 1)
    }

    fn ensure_measure(&mut self, pi: usize, mi: usize) {
        let part = &mut self.parts[pi];
        while part.measures.len() <= mi {
            let number = part.measures.len() + 1;
            let mut measure = Measure::new(number.to_string());
            if part.measures.is_empty() {
                let attrs = measure.attributes.get_or_insert_with(Attributes::default);
                attrs.divisions = Some(self.divisions);
            }
            part.measures.push(measure);
        }
        let advances = &mut self.advances[pi];
        while advances.len() <= mi {
            advances.push(0);
        }
    }

    fn attrs_mut(&mut self, pi: usize, mi: usize) -> &mut Attributes {
        self.parts[pi].measures[mi]
            .attributes
            .get_or_insert_with(Attributes::default)
    }

    fn capacity_at(&self, pi: usize, mi: usize) -> Ticks {
        let mut state = AttributeState::default();
        for measure in self.parts[pi].measures.iter().take(mi + 1) {
            if let Some(attrs) = &measure.attributes {
                state.apply(attrs);
            }
        }
        state.measure_capacity()
    }

    fn read_staff(&mut self, staff_el: Node) {
        let id = attr_u32(staff_el, "id").unwrap_or(1);
        let (pi, local) = self.resolve_staff(id);
        for (mi, measure_el) in children(staff_el, "Measure").enumerate() {
            self.ensure_measure(pi, mi);
            if let Some(len) = measure_el
                .attribute("len")
                .and_then(|v| parse_fraction(v, self.divisions))
            {
                self.lens.insert((pi, mi), len);
            }
            for (vi, voice_el) in children(measure_el, "voice").enumerate() {
                let ctx = VoiceCtx {
                    pi,
                    mi,
                    local,
                    vi: vi as u32,
                };
                let span_from = self.spanners.len();
                let respell_from = self.respell.len();
                let (events, advance) = self.read_voice(voice_el, ctx);
                if events.is_empty() {
                    continue;
                }
                let prior = self.advances[pi][mi];
                let measure = &mut self.parts[pi].measures[mi];
                let mut base = measure.events.len();
                if prior > 0 {
                    measure.events.push(MeasureEvent::Backup { duration: prior });
                    base += 1;
                }
                measure.events.extend(events);
                self.advances[pi][mi] = advance;
                // token and respell indices were local to the voice stream
                for token in self.spanners.iter_mut().skip(span_from) {
                    if let Some((_, ei)) = &mut token.anchor {
                        *ei += base;
                    }
                }
                for entry in self.respell.iter_mut().skip(respell_from) {
                    entry.2 += base;
                }
            }
        }
    }

    fn read_voice(&mut self, voice_el: Node, ctx: VoiceCtx) -> (Vec<MeasureEvent>, Ticks) {
        let mut vs = VoiceState::new();
        for el in voice_el.children().filter(|n| n.is_element()) {
            match el.tag_name().name() {
                "location" => self.read_location(el, &mut vs, ctx),
                "Clef" => self.read_clef(el, &mut vs, ctx),
                "KeySig" => self.read_key_sig(el, ctx),
                "TimeSig" => self.read_time_sig(el, ctx),
                "Tempo" => self.read_tempo(el, &mut vs, ctx),
                "Dynamic" => self.read_dynamic(el, &mut vs, ctx),
                "StaffText" => self.read_staff_text(el, &mut vs, ctx),
                "Harmony" => self.read_harmony(el, &mut vs, ctx),
                "Fermata" => vs.pending_fermata = true,
                "Tuplet" => self.open_tuplet(el, &mut vs, ctx),
                "endTuplet" => self.close_tuplet(&mut vs, ctx),
                "Chord" => self.read_chord(el, &mut vs, ctx),
                "Rest" => self.read_rest(el, &mut vs, ctx),
                "Spanner" => self.read_voice_spanner(el, &mut vs, ctx),
                name if SKIPPED.contains(&name) => {}
                name => self.report(
                    DiagnosticKind::UnsupportedElement,
                    DiagnosticAction::Dropped,
                    format!("voice element <{name}>"),
                    ctx,
                ),
            }
        }
        if !vs.beam_modes.is_empty() {
            apply_beam_modes(&mut vs.events, &vs.beam_modes, self.divisions);
        }
        (vs.events, vs.cursor)
    }

    fn read_location(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let Some(delta) = child_text(el, "fractions")
            .and_then(|tok| parse_fraction(tok, self.divisions))
        else {
            return;
        };
        if delta < 0 {
            let back = (-delta).min(vs.cursor);
            if back > 0 {
                vs.events.push(MeasureEvent::Backup { duration: back });
                vs.cursor -= back;
            }
        } else if delta > 0 {
            vs.events.push(MeasureEvent::Forward {
                duration: delta,
                voice: Some(ctx.voice()),
                staff: Some(ctx.local),
            });
            vs.cursor += delta;
        }
    }

    fn read_clef(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let Some(token) = child_text(el, "concertClefType").or_else(|| el.attribute("subtype"))
        else {
            return;
        };
        match clef_from_type(token, ctx.local) {
            Some(clef) => {
                if vs.cursor > 0 {
                    self.report(
                        DiagnosticKind::UnsupportedElement,
                        DiagnosticAction::Dropped,
                        "mid-measure clef change",
                        ctx,
                    );
                } else {
                    let attrs = self.attrs_mut(ctx.pi, ctx.mi);
                    attrs.clefs.retain(|c| c.staff != ctx.local);
                    attrs.clefs.push(clef);
                }
            }
            None => self.report(
                DiagnosticKind::UnmappedMark,
                DiagnosticAction::Dropped,
                format!("clef '{token}'"),
                ctx,
            ),
        }
    }

    fn read_key_sig(&mut self, el: Node, ctx: VoiceCtx) {
        let Some(fifths) = child_i32(el, "accidental") else {
            return;
        };
        let clamped = fifths.clamp(-7, 7);
        if clamped != fifths {
            self.report(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Clamped,
                format!("key of {fifths} fifths"),
                ctx,
            );
        }
        // every staff restates the signature; the first one speaks for the part
        if ctx.local == 1 && ctx.vi == 0 {
            self.attrs_mut(ctx.pi, ctx.mi).key_fifths = Some(clamped);
            self.keyed[ctx.pi] = true;
        }
    }

    fn read_time_sig(&mut self, el: Node, ctx: VoiceCtx) {
        let n = child_u32(el, "sigN").unwrap_or(0);
        let d = child_u32(el, "sigD").unwrap_or(0);
        match TimeSignature::new(n, d) {
            Some(time) => {
                if ctx.local == 1 && ctx.vi == 0 {
                    self.attrs_mut(ctx.pi, ctx.mi).time = Some(time);
                }
            }
            None => self.report(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Dropped,
                format!("time signature {n}/{d}"),
                ctx,
            ),
        }
    }

    fn read_tempo(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let qps = child_text(el, "tempo").and_then(|t| t.parse::<f64>().ok());
        let kind = match qps {
            Some(q) if q > 0.0 => DirectionKind::Metronome {
                beat_unit: NoteType::Quarter,
                per_minute: bpm_text(q),
            },
            _ => {
                let text = child(el, "text").map(rich_text).unwrap_or_default();
                if text.trim().is_empty() {
                    self.report(
                        DiagnosticKind::UnsupportedElement,
                        DiagnosticAction::Dropped,
                        "tempo without a rate",
                        ctx,
                    );
                    return;
                }
                self.report(
                    DiagnosticKind::UnmappedMark,
                    DiagnosticAction::Substituted,
                    format!("tempo '{}' kept as words", text.trim()),
                    ctx,
                );
                DirectionKind::Words(text.trim().to_string())
            }
        };
        vs.events.push(MeasureEvent::Direction(Direction {
            kind,
            placement: placement_of(el),
            staff: ctx.local,
            voice: None,
        }));
    }

    fn read_dynamic(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let Some(subtype) = child_text(el, "subtype") else {
            return;
        };
        vs.events.push(MeasureEvent::Direction(Direction {
            kind: DirectionKind::Dynamic(subtype.to_string()),
            placement: placement_of(el),
            staff: ctx.local,
            voice: None,
        }));
    }

    fn read_staff_text(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let text = child(el, "text").map(rich_text).unwrap_or_default();
        if text.trim().is_empty() {
            return;
        }
        vs.events.push(MeasureEvent::Direction(Direction {
            kind: DirectionKind::Words(text.trim().to_string()),
            placement: placement_of(el),
            staff: ctx.local,
            voice: None,
        }));
    }

    fn read_harmony(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let Some(tpc) = child_i32(el, "root") else {
            return;
        };
        match step_alter_of(tpc) {
            Some((root, root_alter)) => {
                let kind =
                    crate::converters::suffix_to_kind(child_text(el, "name").unwrap_or(""));
                let bass = child_i32(el, "base").and_then(step_alter_of);
                vs.events.push(MeasureEvent::Harmony(Harmony {
                    root,
                    root_alter,
                    kind,
                    bass,
                }));
            }
            None => self.report(
                DiagnosticKind::UnmappedMark,
                DiagnosticAction::Dropped,
                format!("harmony root tpc {tpc}"),
                ctx,
            ),
        }
    }

    fn open_tuplet(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let own = match (child_u32(el, "actualNotes"), child_u32(el, "normalNotes")) {
            (Some(a), Some(n)) => TimeModification::new(a, n),
            _ => None,
        };
        let enclosing = vs.tuplets.last().and_then(|f| f.0);
        let combined = match own {
            Some(inner) => match enclosing {
                Some(outer) => TimeModification::new(
                    outer.actual_notes * inner.actual_notes,
                    outer.normal_notes * inner.normal_notes,
                ),
                None => Some(inner),
            },
            None => {
                self.report(
                    DiagnosticKind::UnsupportedElement,
                    DiagnosticAction::Dropped,
                    "tuplet without a valid ratio",
                    ctx,
                );
                enclosing
            }
        };
        vs.tuplets.push((combined, Vec::new()));
    }

    fn close_tuplet(&mut self, vs: &mut VoiceState, ctx: VoiceCtx) {
        match vs.tuplets.pop() {
            Some((Some(_), principals)) if principals.len() >= 2 => {
                mark_tuplet(&mut vs.events[principals[0]], StartStop::Start);
                mark_tuplet(&mut vs.events[principals[principals.len() - 1]], StartStop::Stop);
            }
            Some(_) => {}
            None => self.report(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Dropped,
                "endTuplet without an open tuplet",
                ctx,
            ),
        }
    }

    fn read_symbol(&mut self, el: Node, ctx: VoiceCtx) -> (NoteType, u32) {
        let nt = match child_text(el, "durationType") {
            Some(token) => match NoteType::from_name(token) {
                Some(nt) => nt,
                None => {
                    self.report(
                        DiagnosticKind::UnrepresentableDuration,
                        DiagnosticAction::Substituted,
                        format!("duration '{token}' read as a quarter"),
                        ctx,
                    );
                    NoteType::Quarter
                }
            },
            None => NoteType::Quarter,
        };
        (nt, child_u32(el, "dots").unwrap_or(0))
    }

    fn read_chord(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let marker = GRACE_MARKERS
            .iter()
            .find(|&&(name, _)| child(el, name).is_some());
        let (grace, grace_slash) = match marker {
            Some(&(_, slash)) => (true, slash),
            None => (false, false),
        };

        let (nt, dots) = self.read_symbol(el, ctx);
        let written = duration::symbol_ticks(nt, dots, self.divisions)
            .unwrap_or_else(|| nt.ticks(self.divisions));
        let time_mod = vs.tuplets.last().and_then(|f| f.0);
        let sounding = duration::sounding_ticks(written, time_mod);

        let mode = child_text(el, "BeamMode").and_then(|token| match token {
            "begin" | "begin32" | "begin64" => Some("begin"),
            "mid" => Some("mid"),
            "no" => Some("no"),
            _ => None,
        });

        let mut found: Vec<marks::Mark> = Vec::new();
        for artic in children(el, "Articulation") {
            let Some(subtype) = child_text(artic, "subtype") else {
                continue;
            };
            match marks::mark_for(subtype) {
                Some(mark) => found.push(mark),
                None => self.report(
                    DiagnosticKind::UnmappedMark,
                    DiagnosticAction::Dropped,
                    format!("articulation '{subtype}'"),
                    ctx,
                ),
            }
        }
        let arpeggiate = child(el, "Arpeggio").is_some();
        let mut lyrics = Vec::new();
        for verse in children(el, "Lyrics") {
            lyrics.push(Lyric {
                number: child_u32(verse, "no").unwrap_or(0) + 1,
                syllabic: child_text(verse, "syllabic").and_then(Syllabic::from_name),
                text: child_text(verse, "text").unwrap_or("").to_string(),
            });
        }

        let mut principal: Option<usize> = None;
        for (i, note_el) in children(el, "Note").enumerate() {
            let Some(midi) = child_i32(note_el, "pitch") else {
                self.report(
                    DiagnosticKind::UnsupportedElement,
                    DiagnosticAction::Dropped,
                    "note without a pitch",
                    ctx,
                );
                continue;
            };
            let (pitch, provisional) = match child_i32(note_el, "tpc")
                .and_then(|tpc| Pitch::from_tpc(tpc, midi))
            {
                Some(p) => (p, false),
                None => (spell(midi, 0, None, &AccidentalState::new(0)), true),
            };
            let mut note = Note::new(pitch, if grace { 0 } else { sounding }, ctx.voice(), ctx.local);
            note.chord = i > 0;
            note.grace = grace;
            note.grace_slash = grace_slash;
            note.note_type = Some(nt);
            note.dots = dots;
            note.time_mod = time_mod;
            if let Some(acc_el) = child(note_el, "Accidental") {
                let subtype = child_text(acc_el, "subtype").unwrap_or("");
                match accidental_from_subtype(subtype) {
                    Some(acc) => note.accidental = Some(acc),
                    None => self.report(
                        DiagnosticKind::UnmappedMark,
                        DiagnosticAction::Dropped,
                        format!("accidental '{subtype}'"),
                        ctx,
                    ),
                }
            }
            let ei = vs.events.len();
            for sp in children(note_el, "Spanner") {
                match sp.attribute("type") {
                    Some("Tie") => {
                        if child(sp, "next").is_some() {
                            note.tie_start = true;
                        }
                        if child(sp, "prev").is_some() {
                            note.tie_stop = true;
                        }
                    }
                    Some("Glissando") => self.note_gliss_token(sp, vs.cursor, ctx, ei),
                    Some(other) => self.report(
                        DiagnosticKind::UnsupportedElement,
                        DiagnosticAction::Dropped,
                        format!("note spanner '{other}'"),
                        ctx,
                    ),
                    None => {}
                }
            }
            if child(note_el, "Tie").is_some() {
                note.tie_start = true;
            }
            if provisional {
                self.respell.push((ctx.pi, ctx.mi, ei));
            }
            if i == 0 {
                principal = Some(ei);
            }
            vs.events.push(MeasureEvent::Note(note));
        }
        let Some(pe) = principal else {
            return;
        };
        if let MeasureEvent::Note(first) = &mut vs.events[pe] {
            for mark in found {
                marks::apply_mark(mark, &mut first.notations);
            }
            first.notations.arpeggiate = arpeggiate;
            first.lyrics = lyrics;
            if vs.pending_fermata {
                first.notations.fermata = true;
                vs.pending_fermata = false;
            }
        }
        if let Some(m) = mode {
            vs.beam_modes.insert(pe, m);
        }
        for idx in std::mem::take(&mut vs.pending_anchors) {
            self.spanners[idx].anchor = Some((ctx.mi, pe));
        }
        if !grace {
            for frame in &mut vs.tuplets {
                frame.1.push(pe);
            }
            vs.cursor += sounding;
        }
    }

    fn read_rest(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let ei = vs.events.len();
        let mut rest;
        if child_text(el, "durationType") == Some("measure") {
            let ticks = child_text(el, "duration")
                .and_then(|t| parse_fraction(t, self.divisions))
                .or_else(|| self.lens.get(&(ctx.pi, ctx.mi)).copied())
                .unwrap_or_else(|| self.capacity_at(ctx.pi, ctx.mi));
            rest = Rest::new(ticks, ctx.voice(), ctx.local);
            rest.measure_rest = true;
        } else {
            let (nt, dots) = self.read_symbol(el, ctx);
            let written = duration::symbol_ticks(nt, dots, self.divisions)
                .unwrap_or_else(|| nt.ticks(self.divisions));
            let time_mod = vs.tuplets.last().and_then(|f| f.0);
            rest = Rest::new(
                duration::sounding_ticks(written, time_mod),
                ctx.voice(),
                ctx.local,
            );
            rest.note_type = Some(nt);
            rest.dots = dots;
            rest.time_mod = time_mod;
            for frame in &mut vs.tuplets {
                frame.1.push(ei);
            }
        }
        if vs.pending_fermata {
            rest.notations.fermata = true;
            vs.pending_fermata = false;
        }
        for idx in std::mem::take(&mut vs.pending_anchors) {
            self.spanners[idx].anchor = Some((ctx.mi, ei));
        }
        vs.cursor += rest.duration;
        vs.events.push(MeasureEvent::Rest(rest));
    }

    fn read_voice_spanner(&mut self, el: Node, vs: &mut VoiceState, ctx: VoiceCtx) {
        let ty = el.attribute("type").unwrap_or("");
        if !SPANNER_TYPES.contains(&ty) {
            self.report(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Dropped,
                format!("spanner type '{ty}'"),
                ctx,
            );
            return;
        }
        let next = child(el, "next").map(read_link);
        let prev = child(el, "prev").map(read_link);
        if next.is_none() && prev.is_none() {
            self.report(
                DiagnosticKind::UnresolvedSpanner,
                DiagnosticAction::Dropped,
                format!("{} token with no link", ty.to_lowercase()),
                ctx,
            );
            return;
        }
        let payload = child(el, ty);
        let idx = self.spanners.len();
        self.spanners.push(SpanToken {
            name: ty.to_string(),
            part: ctx.pi,
            staff: ctx.local,
            pos: (ctx.mi as i32, fraction_of(vs.cursor, self.divisions)),
            next,
            prev,
            subtype: payload.and_then(|p| child_text(p, "subtype")).map(String::from),
            placement: payload.and_then(placement_of),
            anchor: None,
        });
        // slurs and trills hang off notes; lines stand on their beat alone
        if ty == "Slur" || ty == "Trill" {
            vs.pending_anchors.push(idx);
        }
    }

    fn note_gliss_token(&mut self, sp: Node, cursor: Ticks, ctx: VoiceCtx, ei: usize) {
        let next = child(sp, "next").map(read_link);
        let prev = child(sp, "prev").map(read_link);
        if next.is_none() && prev.is_none() {
            return;
        }
        self.spanners.push(SpanToken {
            name: "Glissando".to_string(),
            part: ctx.pi,
            staff: ctx.local,
            pos: (ctx.mi as i32, fraction_of(cursor, self.divisions)),
            next,
            prev,
            subtype: None,
            placement: None,
            anchor: Some((ctx.mi, ei)),
        });
    }

    fn into_score(mut self, score: &mut Score) {
        self.declare_staves();
        self.respell_parts();
        self.match_spanners();
        score.parts = std::mem::take(&mut self.parts);
        score.diagnostics.append(&mut self.diagnostics);
    }

    fn declare_staves(&mut self) {
        let mut counts: HashMap<usize, u32> = HashMap::new();
        for &(pi, local) in self.staff_map.values() {
            let entry = counts.entry(pi).or_insert(0);
            *entry = (*entry).max(local);
        }
        for (pi, part) in self.parts.iter_mut().enumerate() {
            let staves = counts.get(&pi).copied().unwrap_or(1);
            if staves > 1 {
                if let Some(first) = part.measures.first_mut() {
                    let attrs = first.attributes.get_or_insert_with(Attributes::default);
                    attrs.staves = Some(staves);
                }
            }
        }
    }

    /// Respell provisional pitches against the key, estimating one for
    /// parts that never declared a signature. Estimated keys steer the
    /// spelling only; the output carries no signature it never had.
    fn respell_parts(&mut self) {
        let provisional: HashSet<(usize, usize, usize)> = self.respell.drain(..).collect();
        let keyed = std::mem::take(&mut self.keyed);
        for (pi, part) in self.parts.iter_mut().enumerate() {
            let keys: Vec<i32> = if keyed.get(pi).copied().unwrap_or(false) {
                fold_states(part).iter().map(|s| s.key_fifths).collect()
            } else {
                let samples: Vec<Vec<WeightedPitch>> = part
                    .measures
                    .iter()
                    .map(|m| {
                        m.events
                            .iter()
                            .filter_map(|e| match e {
                                MeasureEvent::Note(n) => Some(WeightedPitch {
                                    semitone: n.pitch.midi(),
                                    weight: n.duration,
                                }),
                                _ => None,
                            })
                            .collect()
                    })
                    .collect();
                estimate_by_measure(&samples, 0)
            };
            let mut spellers: HashMap<u32, AccidentalState> = HashMap::new();
            let mut previous: HashMap<(u32, u32), i32> = HashMap::new();
            let mut carried: HashMap<u32, Vec<Pitch>> = HashMap::new();
            for (mi, measure) in part.measures.iter_mut().enumerate() {
                let key = keys.get(mi).copied().unwrap_or(0);
                if mi > 0 && keys.get(mi - 1) != keys.get(mi) {
                    for speller in spellers.values_mut() {
                        speller.set_key(key);
                    }
                }
                for (ei, event) in measure.events.iter_mut().enumerate() {
                    let MeasureEvent::Note(note) = event else {
                        continue;
                    };
                    let staff = note.staff;
                    let speller = spellers
                        .entry(staff)
                        .or_insert_with(|| AccidentalState::new(key));
                    if provisional.contains(&(pi, mi, ei)) {
                        let prev = previous.get(&(staff, note.voice)).copied();
                        note.pitch = spell(note.pitch.midi(), key, prev, speller);
                    }
                    speller.resolve(&note.pitch, note.tie_stop);
                    previous.insert((staff, note.voice), note.pitch.midi());
                    if note.tie_stop {
                        if let Some(list) = carried.get_mut(&staff) {
                            list.retain(|p| *p != note.pitch);
                        }
                    }
                    if note.tie_start {
                        carried.entry(staff).or_default().push(note.pitch);
                    }
                }
                for (staff, speller) in spellers.iter_mut() {
                    let list = carried.get(staff).map(Vec::as_slice).unwrap_or(&[]);
                    speller.next_measure(list);
                }
            }
        }
    }

    /// Pair start and end tokens by mutual offsets, then turn the pairs
    /// into pivot marks and directions
    fn match_spanners(&mut self) {
        let tokens = std::mem::take(&mut self.spanners);
        let mut used = vec![false; tokens.len()];
        let mut slur_pairs: Vec<(usize, usize)> = Vec::new();
        let mut gliss_pairs: Vec<(usize, usize)> = Vec::new();
        let mut inserts: Vec<(usize, usize, Ticks, MeasureEvent)> = Vec::new();

        for i in 0..tokens.len() {
            if used[i] || tokens[i].next.is_none() {
                continue;
            }
            used[i] = true;
            let start = &tokens[i];
            let target = shift(start.pos, start.next.unwrap_or_default());
            let hit = (0..tokens.len()).find(|&j| {
                !used[j]
                    && tokens[j].next.is_none()
                    && tokens[j].prev.is_some()
                    && tokens[j].name == start.name
                    && tokens[j].part == start.part
                    && tokens[j].staff == start.staff
                    && tokens[j].pos == target
                    && shift(tokens[j].pos, tokens[j].prev.unwrap_or_default()) == start.pos
            });
            let Some(j) = hit else {
                self.diagnostics
                    .push(span_diag(start, "start token with no matching end"));
                continue;
            };
            used[j] = true;
            let end = &tokens[j];
            match start.name.as_str() {
                "Slur" => slur_pairs.push((i, j)),
                "Glissando" => gliss_pairs.push((i, j)),
                "Trill" => self.attach_trill(start),
                "HairPin" => {
                    let kind = hairpin_kind(start.subtype.as_deref());
                    inserts.push(direction_at(start, DirectionKind::Wedge(kind), self.divisions));
                    inserts.push(direction_at(
                        end,
                        DirectionKind::Wedge(WedgeKind::Stop),
                        self.divisions,
                    ));
                }
                "Pedal" => {
                    inserts.push(direction_at(
                        start,
                        DirectionKind::Pedal(PedalKind::Start),
                        self.divisions,
                    ));
                    inserts.push(direction_at(
                        end,
                        DirectionKind::Pedal(PedalKind::Stop),
                        self.divisions,
                    ));
                }
                "Ottava" => {
                    let (kind, size) = ottava_kind(start.subtype.as_deref());
                    inserts.push(direction_at(
                        start,
                        DirectionKind::OctaveShift { kind, size },
                        self.divisions,
                    ));
                    inserts.push(direction_at(
                        end,
                        DirectionKind::OctaveShift {
                            kind: OctaveShiftKind::Stop,
                            size,
                        },
                        self.divisions,
                    ));
                }
                _ => {}
            }
        }
        for j in 0..tokens.len() {
            if !used[j] {
                self.diagnostics
                    .push(span_diag(&tokens[j], "end token with no matching start"));
            }
        }

        self.attach_pairs(&tokens, slur_pairs, false);
        self.attach_pairs(&tokens, gliss_pairs, true);
        self.apply_inserts(inserts);
    }

    fn attach_trill(&mut self, token: &SpanToken) {
        let Some((mi, ei)) = token.anchor else {
            self.diagnostics
                .push(span_diag(token, "token with nothing to anchor to"));
            return;
        };
        if let Some(MeasureEvent::Note(note)) = self
            .parts
            .get_mut(token.part)
            .and_then(|p| p.measures.get_mut(mi))
            .and_then(|m| m.events.get_mut(ei))
        {
            note.notations.ornaments.push(Ornament::Trill);
        }
    }

    /// Overlapping pairs of the same kind get distinct 1-based numbers
    fn attach_pairs(&mut self, tokens: &[SpanToken], mut pairs: Vec<(usize, usize)>, gliss: bool) {
        pairs.sort_by(|a, b| {
            (tokens[a.0].part, tokens[a.0].pos).cmp(&(tokens[b.0].part, tokens[b.0].pos))
        });
        let mut active: Vec<(usize, (i32, Rational32), u32)> = Vec::new();
        for (i, j) in pairs {
            let (start, end) = (&tokens[i], &tokens[j]);
            active.retain(|&(p, epos, _)| p == start.part && epos >= start.pos);
            let mut number = 1;
            while active.iter().any(|&(_, _, n)| n == number) {
                number += 1;
            }
            active.push((end.part, end.pos, number));
            self.attach_mark(start, StartStop::Start, number, gliss);
            self.attach_mark(end, StartStop::Stop, number, gliss);
        }
    }

    fn attach_mark(&mut self, token: &SpanToken, kind: StartStop, number: u32, gliss: bool) {
        let Some((mi, ei)) = token.anchor else {
            self.diagnostics
                .push(span_diag(token, "token with nothing to anchor to"));
            return;
        };
        let Some(event) = self
            .parts
            .get_mut(token.part)
            .and_then(|p| p.measures.get_mut(mi))
            .and_then(|m| m.events.get_mut(ei))
        else {
            return;
        };
        let notations = match event {
            MeasureEvent::Note(n) => &mut n.notations,
            MeasureEvent::Rest(r) => &mut r.notations,
            _ => return,
        };
        if gliss {
            notations.glissandos.push(GlissandoMark { kind, number });
        } else {
            notations.slurs.push(SlurMark { kind, number });
        }
    }

    fn apply_inserts(&mut self, inserts: Vec<(usize, usize, Ticks, MeasureEvent)>) {
        let mut grouped: BTreeMap<(usize, usize), Vec<(Ticks, MeasureEvent)>> = BTreeMap::new();
        for (pi, mi, onset, event) in inserts {
            grouped.entry((pi, mi)).or_default().push((onset, event));
        }
        for ((pi, mi), mut group) in grouped {
            group.sort_by_key(|&(onset, _)| onset);
            let Some(measure) = self.parts.get_mut(pi).and_then(|p| p.measures.get_mut(mi))
            else {
                continue;
            };
            let times = timing::timeline(&measure.events);
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

/// `<next>`/`<prev>` link as a (measures, whole-note fraction) offset
fn read_link(link: Node) -> (i32, Rational32) {
    let loc = child(link, "location");
    let dm = loc.and_then(|l| child_i32(l, "measures")).unwrap_or(0);
    let df = loc
        .and_then(|l| child_text(l, "fractions"))
        .and_then(parse_rational)
        .unwrap_or_else(|| Rational32::new(0, 1));
    (dm, df)
}

fn shift(pos: (i32, Rational32), (dm, df): (i32, Rational32)) -> (i32, Rational32) {
    (pos.0 + dm, pos.1 + df)
}

fn placement_of(el: Node) -> Option<Placement> {
    child_text(el, "placement").and_then(Placement::from_name)
}

/// Concatenated text of a node and its styled runs
fn rich_text(node: Node) -> String {
    let mut out = String::new();
    for piece in node.descendants() {
        if piece.is_text() {
            out.push_str(piece.text().unwrap_or(""));
        }
    }
    out
}

fn span_diag(token: &SpanToken, detail: &str) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::UnresolvedSpanner,
        DiagnosticAction::Dropped,
        format!("{} {detail}", token.name.to_lowercase()),
    )
    .at_measure((token.pos.0.max(0) + 1) as u32)
    .at_staff(token.staff)
}

fn direction_at(
    token: &SpanToken,
    kind: DirectionKind,
    divisions: i64,
) -> (usize, usize, Ticks, MeasureEvent) {
    let frac = token.pos.1;
    let onset = (*frac.numer() as i64 * divisions * 4 / *frac.denom() as i64).max(0);
    (
        token.part,
        token.pos.0.max(0) as usize,
        onset,
        MeasureEvent::Direction(Direction {
            kind,
            placement: token.placement,
            staff: token.staff,
            voice: None,
        }),
    )
}

fn hairpin_kind(subtype: Option<&str>) -> WedgeKind {
    match subtype.map(str::trim) {
        Some("1") | Some("3") | Some("decrescHairpin") | Some("decrescLine") => {
            WedgeKind::Diminuendo
        }
        _ => WedgeKind::Crescendo,
    }
}

fn ottava_kind(subtype: Option<&str>) -> (OctaveShiftKind, u32) {
    match subtype.map(str::trim) {
        Some("8vb") => (OctaveShiftKind::Up, 8),
        Some("15ma") => (OctaveShiftKind::Down, 15),
        Some("15mb") => (OctaveShiftKind::Up, 15),
        Some("22ma") => (OctaveShiftKind::Down, 22),
        Some("22mb") => (OctaveShiftKind::Up, 22),
        _ => (OctaveShiftKind::Down, 8),
    }
}

/// Explicit beam modes become beam runs; notes left on auto break them
fn apply_beam_modes(
    events: &mut [MeasureEvent],
    modes: &HashMap<usize, &'static str>,
    divisions: i64,
) {
    enum Slot {
        Principal(u32),
        Member,
        Break,
    }
    let mut run: Vec<usize> = Vec::new();
    for ei in 0..events.len() {
        let slot = match &events[ei] {
            MeasureEvent::Note(n) if !n.chord && !n.grace => Slot::Principal(
                duration::written_symbol(n.note_type, n.dots, n.duration, n.time_mod, divisions)
                    .0
                    .beam_level(),
            ),
            MeasureEvent::Note(_) => Slot::Member,
            MeasureEvent::Rest(_) => Slot::Break,
            MeasureEvent::Backup { .. } | MeasureEvent::Forward { .. } => Slot::Break,
            _ => Slot::Member,
        };
        match slot {
            Slot::Member => {}
            Slot::Break => {
                flush_beam_run(events, &run, divisions);
                run.clear();
            }
            Slot::Principal(level) => match modes.get(&ei).copied() {
                Some("begin") if level > 0 => {
                    flush_beam_run(events, &run, divisions);
                    run.clear();
                    run.push(ei);
                }
                Some("mid") if level > 0 => run.push(ei),
                _ => {
                    flush_beam_run(events, &run, divisions);
                    run.clear();
                }
            },
        }
    }
    flush_beam_run(events, &run, divisions);
}

fn flush_beam_run(events: &mut [MeasureEvent], run: &[usize], divisions: i64) {
    if run.len() < 2 {
        return;
    }
    let levels: Vec<u32> = run
        .iter()
        .map(|&ei| match &events[ei] {
            MeasureEvent::Note(n) => {
                duration::written_symbol(n.note_type, n.dots, n.duration, n.time_mod, divisions)
                    .0
                    .beam_level()
            }
            _ => 0,
        })
        .collect();
    for (&ei, beams) in run.iter().zip(beaming::assign_run(&levels)) {
        if let MeasureEvent::Note(n) = &mut events[ei] {
            n.beams = beams;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Articulation, BeamValue, Step, Technical};

    fn doc(measures: &str) -> String {
        format!(
            "<museScore version=\"3.02\"><Score><Division>480</Division>\
             <metaTag name=\"workTitle\">Test</metaTag>\
             <Part><Staff id=\"1\"><StaffType group=\"pitched\"/></Staff>\
             <trackName>Music</trackName></Part>\
             <Staff id=\"1\">{measures}</Staff></Score></museScore>"
        )
    }

    fn read(measures: &str) -> Score {
        read_musescore(&doc(measures)).unwrap()
    }

    fn notes(score: &Score) -> Vec<&Note> {
        score.parts[0]
            .measures
            .iter()
            .flat_map(|m| &m.events)
            .filter_map(|e| match e {
                MeasureEvent::Note(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    const ATTRS: &str = "<KeySig><accidental>1</accidental></KeySig>\
                         <TimeSig><sigN>4</sigN><sigD>4</sigD></TimeSig>";

    fn chord(pitch: i32, tpc: i32) -> String {
        format!(
            "<Chord><durationType>quarter</durationType>\
             <Note><pitch>{pitch}</pitch><tpc>{tpc}</tpc></Note></Chord>"
        )
    }

    #[test]
    fn test_reads_part_and_notes() {
        let score = read(&format!("<Measure><voice>{ATTRS}{}</voice></Measure>", chord(66, 20)));
        assert_eq!(score.title.as_deref(), Some("Test"));
        assert_eq!(score.parts.len(), 1);
        assert_eq!(score.parts[0].name.as_deref(), Some("Music"));
        let attrs = score.parts[0].measures[0].attributes.as_ref().unwrap();
        assert_eq!(attrs.divisions, Some(480));
        assert_eq!(attrs.key_fifths, Some(1));
        assert_eq!(attrs.time.map(|t| (t.beats, t.beat_type)), Some((4, 4)));
        let ns = notes(&score);
        assert_eq!(ns.len(), 1);
        assert_eq!(ns[0].pitch, Pitch::new(Step::F, 1, 4));
        assert_eq!(ns[0].duration, 480);
        assert_eq!(ns[0].voice, 1);
    }

    #[test]
    fn test_missing_tpc_spelled_from_key() {
        let score = read(&format!(
            "<Measure><voice>{ATTRS}\
             <Chord><durationType>quarter</durationType>\
             <Note><pitch>66</pitch></Note></Chord></voice></Measure>"
        ));
        let ns = notes(&score);
        assert_eq!(ns[0].pitch, Pitch::new(Step::F, 1, 4));
    }

    #[test]
    fn test_key_estimated_for_spelling_only() {
        let body: String = [62, 66, 69, 73]
            .iter()
            .map(|&midi| {
                format!(
                    "<Chord><durationType>quarter</durationType>\
                     <Note><pitch>{midi}</pitch></Note></Chord>"
                )
            })
            .collect();
        let score = read(&format!("<Measure><voice>{body}</voice></Measure>"));
        let ns = notes(&score);
        assert_eq!(ns[1].pitch, Pitch::new(Step::F, 1, 4));
        assert_eq!(ns[3].pitch, Pitch::new(Step::C, 1, 5));
        // the estimate never becomes a written signature
        let attrs = score.parts[0].measures[0].attributes.as_ref().unwrap();
        assert_eq!(attrs.key_fifths, None);
    }

    #[test]
    fn test_second_voice_joins_behind_backup() {
        let score = read(
            "<Measure>\
             <voice><Chord><durationType>whole</durationType>\
             <Note><pitch>76</pitch><tpc>18</tpc></Note></Chord></voice>\
             <voice><Chord><durationType>whole</durationType>\
             <Note><pitch>60</pitch><tpc>14</tpc></Note></Chord></voice>\
             </Measure>",
        );
        let events = &score.parts[0].measures[0].events;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], MeasureEvent::Backup { duration: 1920 }));
        let ns = notes(&score);
        assert_eq!(ns[0].voice, 1);
        assert_eq!(ns[1].voice, 2);
    }

    #[test]
    fn test_tuplet_scales_and_marks() {
        let score = read(&format!(
            "<Measure><voice>\
             <Tuplet><normalNotes>2</normalNotes><actualNotes>3</actualNotes>\
             <baseNote>eighth</baseNote></Tuplet>\
             {}{}{}<endTuplet/></voice></Measure>",
            eighth(72, 14),
            eighth(74, 16),
            eighth(76, 18)
        ));
        let ns = notes(&score);
        assert_eq!(ns.len(), 3);
        for n in &ns {
            assert_eq!(n.duration, 160);
            assert_eq!(n.time_mod, TimeModification::new(3, 2));
        }
        assert_eq!(ns[0].notations.tuplets, vec![TupletMark { kind: StartStop::Start }]);
        assert_eq!(ns[2].notations.tuplets, vec![TupletMark { kind: StartStop::Stop }]);
    }

    fn eighth(pitch: i32, tpc: i32) -> String {
        format!(
            "<Chord><durationType>eighth</durationType>\
             <Note><pitch>{pitch}</pitch><tpc>{tpc}</tpc></Note></Chord>"
        )
    }

    #[test]
    fn test_location_gap_becomes_forward() {
        let score = read(&format!(
            "<Measure><voice>\
             <location><fractions>1/4</fractions></location>{}</voice></Measure>",
            chord(72, 14)
        ));
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(
            events[0],
            MeasureEvent::Forward { duration: 480, .. }
        ));
        let times = timing::timeline(events);
        assert_eq!(times.events[1].onset, 480);
    }

    #[test]
    fn test_slur_matched_by_mutual_offsets() {
        let score = read(&format!(
            "<Measure><voice>\
             <Spanner type=\"Slur\"><Slur/>\
             <next><location><fractions>1/4</fractions></location></next></Spanner>\
             {}\
             <Spanner type=\"Slur\">\
             <prev><location><fractions>-1/4</fractions></location></prev></Spanner>\
             {}</voice></Measure>",
            chord(72, 14),
            chord(74, 16)
        ));
        assert!(score.diagnostics.is_empty());
        let ns = notes(&score);
        assert_eq!(
            ns[0].notations.slurs,
            vec![SlurMark { kind: StartStop::Start, number: 1 }]
        );
        assert_eq!(
            ns[1].notations.slurs,
            vec![SlurMark { kind: StartStop::Stop, number: 1 }]
        );
    }

    #[test]
    fn test_unmatched_spanner_diagnosed() {
        let score = read(&format!(
            "<Measure><voice>\
             <Spanner type=\"Slur\"><Slur/>\
             <next><location><fractions>1/2</fractions></location></next></Spanner>\
             {}</voice></Measure>",
            chord(72, 14)
        ));
        assert!(notes(&score)[0].notations.slurs.is_empty());
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(score.diagnostics[0].kind, DiagnosticKind::UnresolvedSpanner);
    }

    #[test]
    fn test_hairpin_pair_becomes_wedges() {
        let score = read(&format!(
            "<Measure><voice>\
             <Spanner type=\"HairPin\"><HairPin><subtype>0</subtype></HairPin>\
             <next><location><measures>1</measures></location></next></Spanner>\
             <Chord><durationType>whole</durationType>\
             <Note><pitch>72</pitch><tpc>14</tpc></Note></Chord></voice></Measure>\
             <Measure><voice>\
             <Spanner type=\"HairPin\">\
             <prev><location><measures>-1</measures></location></prev></Spanner>\
             {}</voice></Measure>",
            chord(72, 14)
        ));
        assert!(score.diagnostics.is_empty());
        let first = &score.parts[0].measures[0].events;
        assert!(first.iter().any(|e| matches!(
            e,
            MeasureEvent::Direction(d)
                if d.kind == DirectionKind::Wedge(WedgeKind::Crescendo)
        )));
        let second = &score.parts[0].measures[1].events;
        assert!(second.iter().any(|e| matches!(
            e,
            MeasureEvent::Direction(d) if d.kind == DirectionKind::Wedge(WedgeKind::Stop)
        )));
    }

    #[test]
    fn test_tie_tokens_set_flags() {
        let score = read(
            "<Measure><voice>\
             <Chord><durationType>quarter</durationType><Note>\
             <Spanner type=\"Tie\"><Tie/>\
             <next><location><fractions>1/4</fractions></location></next></Spanner>\
             <pitch>72</pitch><tpc>14</tpc></Note></Chord>\
             <Chord><durationType>quarter</durationType><Note>\
             <Spanner type=\"Tie\">\
             <prev><location><fractions>-1/4</fractions></location></prev></Spanner>\
             <pitch>72</pitch><tpc>14</tpc></Note></Chord>\
             </voice></Measure>",
        );
        let ns = notes(&score);
        assert!(ns[0].tie_start && !ns[0].tie_stop);
        assert!(ns[1].tie_stop && !ns[1].tie_start);
    }

    #[test]
    fn test_fermata_lands_on_next_chord() {
        let score = read(&format!(
            "<Measure><voice>\
             <Fermata><subtype>fermataAbove</subtype></Fermata>{}</voice></Measure>",
            chord(72, 14)
        ));
        assert!(notes(&score)[0].notations.fermata);
    }

    #[test]
    fn test_marks_looked_up_and_unknown_diagnosed() {
        let score = read(
            "<Measure><voice>\
             <Chord><durationType>quarter</durationType>\
             <Articulation><subtype>articStaccatoBelow</subtype></Articulation>\
             <Articulation><subtype>articSoftAccentAbove</subtype></Articulation>\
             <Articulation><subtype>pluckedLeftHandPizzicato</subtype></Articulation>\
             <Note><pitch>72</pitch><tpc>14</tpc></Note></Chord></voice></Measure>",
        );
        let ns = notes(&score);
        assert_eq!(ns[0].notations.articulations, vec![Articulation::Staccato]);
        assert_eq!(ns[0].notations.technical, vec![Technical::Stopped]);
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(score.diagnostics[0].kind, DiagnosticKind::UnmappedMark);
    }

    #[test]
    fn test_grace_chord_reads_as_grace_notes() {
        let score = read(&format!(
            "<Measure><voice>\
             <Chord><acciaccatura/><durationType>eighth</durationType>\
             <Note><pitch>74</pitch><tpc>16</tpc></Note></Chord>{}</voice></Measure>",
            chord(72, 14)
        ));
        let ns = notes(&score);
        assert!(ns[0].grace && ns[0].grace_slash);
        assert_eq!(ns[0].duration, 0);
        assert!(!ns[1].grace);
        let times = timing::timeline(&score.parts[0].measures[0].events);
        assert_eq!(times.events[1].onset, 0);
    }

    #[test]
    fn test_foreign_root_rejected() {
        let err = read_musescore("<score-partwise/>").unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedRoot(root) if root == "score-partwise"));
    }

    #[test]
    fn test_measure_rest_fills_the_bar() {
        let score = read(
            "<Measure><voice>\
             <TimeSig><sigN>3</sigN><sigD>4</sigD></TimeSig>\
             <Rest><durationType>measure</durationType></Rest></voice></Measure>",
        );
        let events = &score.parts[0].measures[0].events;
        let rest = events
            .iter()
            .find_map(|e| match e {
                MeasureEvent::Rest(r) => Some(r),
                _ => None,
            })
            .unwrap();
        assert!(rest.measure_rest);
        assert_eq!(rest.duration, 1440);
    }

    #[test]
    fn test_beam_modes_become_runs() {
        let score = read(&format!(
            "<Measure><voice>\
             <Chord><BeamMode>begin</BeamMode><durationType>eighth</durationType>\
             <Note><pitch>72</pitch><tpc>14</tpc></Note></Chord>\
             <Chord><BeamMode>mid</BeamMode><durationType>eighth</durationType>\
             <Note><pitch>74</pitch><tpc>16</tpc></Note></Chord>\
             {}</voice></Measure>",
            chord(76, 18)
        ));
        let ns = notes(&score);
        assert_eq!(ns[0].beams.len(), 1);
        assert_eq!(ns[0].beams[0].value, BeamValue::Begin);
        assert_eq!(ns[1].beams[0].value, BeamValue::End);
        assert!(ns[2].beams.is_empty());
    }

    #[test]
    fn test_meta_tags_kept_as_fields() {
        let text = "<museScore version=\"3.02\"><Score><Division>480</Division>\
                    <metaTag name=\"workTitle\">Piece</metaTag>\
                    <metaTag name=\"composer\">Anon</metaTag>\
                    <Part><Staff id=\"1\"/></Part><Staff id=\"1\">\
                    <Measure><voice><Chord><durationType>quarter</durationType>\
                    <Note><pitch>72</pitch><tpc>14</tpc></Note></Chord></voice></Measure>\
                    </Staff></Score></museScore>";
        let score = read_musescore(text).unwrap();
        assert_eq!(score.title.as_deref(), Some("Piece"));
        assert!(score
            .misc_fields
            .iter()
            .any(|(k, v)| k == "composer" && v == "Anon"));
    }

    #[test]
    fn test_unknown_voice_element_diagnosed() {
        let score = read(&format!(
            "<Measure><voice><Tremolo><subtype>r8</subtype></Tremolo>{}</voice></Measure>",
            chord(72, 14)
        ));
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(
            score.diagnostics[0].kind,
            DiagnosticKind::UnsupportedElement
        );
        assert!(score.diagnostics[0].detail.contains("Tremolo"));
    }
}
