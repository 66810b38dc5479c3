//! Pivot document reader
//!
//! One DOM pass over a partwise document. Constructs with no pivot
//! representation are dropped with a diagnostic, never silently.

use std::collections::HashMap;

use roxmltree::{Document, Node};

use crate::diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
use crate::errors::{ConvertError, ConvertResult};
use crate::metadata;
use crate::models::{
    Accidental, Articulation, Attributes, Clef, ClefSign, Direction, DirectionKind,
    GlissandoMark, Harmony, Lyric, Measure, MeasureEvent, Note, NoteType, OctaveShiftKind,
    Ornament, Part, PedalKind, Pitch, Placement, Rest, Score, SlurMark, StartStop, Step,
    Syllabic, Technical, TimeModification, TimeSignature, TupletMark, WedgeKind,
};
use crate::models::{Beam, BeamValue, Notations};
use crate::xml::{attr_u32, child, child_i32, child_i64, child_text, child_u32, children};

struct ReaderContext {
    diagnostics: Vec<Diagnostic>,
    measure: u32,
}

impl ReaderContext {
    fn unsupported(&mut self, detail: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Dropped,
                detail,
            )
            .at_measure(self.measure),
        );
    }

    fn unmapped(&mut self, detail: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnmappedMark,
                DiagnosticAction::Dropped,
                detail,
            )
            .at_measure(self.measure),
        );
    }

    fn substituted(&mut self, detail: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticKind::UnsupportedElement,
                DiagnosticAction::Substituted,
                detail,
            )
            .at_measure(self.measure),
        );
    }
}

/// Parse a partwise document into the pivot score
pub fn read_musicxml(text: &str) -> ConvertResult<Score> {
    let doc = Document::parse(text).map_err(|e| ConvertError::MalformedXml(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "score-partwise" {
        return Err(ConvertError::UnsupportedRoot(
            root.tag_name().name().to_string(),
        ));
    }

    let mut ctx = ReaderContext {
        diagnostics: Vec::new(),
        measure: 0,
    };
    let mut score = Score::new();

    score.title = child(root, "work")
        .and_then(|w| child_text(w, "work-title"))
        .or_else(|| child_text(root, "movement-title"))
        .map(String::from);

    if let Some(ident) = child(root, "identification") {
        if let Some(misc) = child(ident, "miscellaneous") {
            for field in children(misc, "miscellaneous-field") {
                let name = field.attribute("name").unwrap_or_default();
                let value = field.text().unwrap_or_default();
                if name.starts_with(metadata::DIAGNOSTIC_FIELD_PREFIX) {
                    if let Some(diag) = metadata::parse_diagnostic_field(value) {
                        score.diagnostics.push(diag);
                        continue;
                    }
                }
                score.misc_fields.push((name.to_string(), value.to_string()));
            }
        }
    }

    let mut part_names: HashMap<&str, &str> = HashMap::new();
    if let Some(list) = child(root, "part-list") {
        for entry in children(list, "score-part") {
            if let (Some(id), Some(name)) = (entry.attribute("id"), child_text(entry, "part-name"))
            {
                part_names.insert(id, name);
            }
        }
    }

    for part_node in children(root, "part") {
        let Some(id) = part_node.attribute("id") else {
            return Err(ConvertError::MissingElement("part id".into()));
        };
        let mut part = Part::new(id);
        part.name = part_names
            .get(id)
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string());
        for (i, measure_node) in children(part_node, "measure").enumerate() {
            ctx.measure = i as u32 + 1;
            let number = measure_node
                .attribute("number")
                .map(String::from)
                .unwrap_or_else(|| (i + 1).to_string());
            part.measures.push(read_measure(measure_node, number, &mut ctx));
        }
        score.parts.push(part);
    }

    score.diagnostics.append(&mut ctx.diagnostics);
    log::debug!(
        "read pivot document: {} parts, {} diagnostics",
        score.parts.len(),
        score.diagnostics.len()
    );
    Ok(score)
}

fn read_measure(node: Node, number: String, ctx: &mut ReaderContext) -> Measure {
    let mut measure = Measure::new(number);
    for item in node.children().filter(|n| n.is_element()) {
        match item.tag_name().name() {
            "attributes" => {
                let read = read_attributes(item, ctx);
                match &mut measure.attributes {
                    Some(existing) => merge_attributes(existing, read),
                    None => measure.attributes = Some(read),
                }
            }
            "note" => {
                if let Some(event) = read_note(item, ctx) {
                    measure.events.push(event);
                }
            }
            "backup" => {
                let duration = child_i64(item, "duration").unwrap_or(0);
                measure.events.push(MeasureEvent::Backup { duration });
            }
            "forward" => {
                measure.events.push(MeasureEvent::Forward {
                    duration: child_i64(item, "duration").unwrap_or(0),
                    voice: child_u32(item, "voice"),
                    staff: child_u32(item, "staff"),
                });
            }
            "direction" => {
                measure.events.extend(read_direction(item, ctx));
            }
            "harmony" => {
                if let Some(harmony) = read_harmony(item, ctx) {
                    measure.events.push(MeasureEvent::Harmony(harmony));
                }
            }
            // presentation-only elements carry nothing the pivot keeps
            "print" | "sound" | "barline" => {}
            other => ctx.unsupported(format!("measure element <{other}>")),
        }
    }
    measure
}

fn merge_attributes(existing: &mut Attributes, new: Attributes) {
    if new.divisions.is_some() {
        existing.divisions = new.divisions;
    }
    if new.key_fifths.is_some() {
        existing.key_fifths = new.key_fifths;
    }
    if new.time.is_some() {
        existing.time = new.time;
    }
    if new.staves.is_some() {
        existing.staves = new.staves;
    }
    existing.clefs.extend(new.clefs);
}

fn read_attributes(node: Node, ctx: &mut ReaderContext) -> Attributes {
    let mut attrs = Attributes::default();
    attrs.divisions = child_i64(node, "divisions");
    if let Some(key) = child(node, "key") {
        attrs.key_fifths = child_i32(key, "fifths");
    }
    if let Some(time) = child(node, "time") {
        match (child_u32(time, "beats"), child_u32(time, "beat-type")) {
            (Some(beats), Some(beat_type)) => match TimeSignature::new(beats, beat_type) {
                Some(ts) => attrs.time = Some(ts),
                None => ctx.unsupported(format!("time signature {beats}/{beat_type}")),
            },
            _ => ctx.unsupported("time element without beats/beat-type"),
        }
    }
    attrs.staves = child_u32(node, "staves");
    for clef_node in children(node, "clef") {
        let staff = attr_u32(clef_node, "number").unwrap_or(1);
        let Some(sign) = child_text(clef_node, "sign").and_then(ClefSign::from_name) else {
            ctx.unsupported("clef without a recognized sign");
            continue;
        };
        attrs.clefs.push(Clef {
            staff,
            sign,
            line: child_u32(clef_node, "line"),
            octave_change: child_i32(clef_node, "clef-octave-change").unwrap_or(0),
        });
    }
    attrs
}

fn read_note(node: Node, ctx: &mut ReaderContext) -> Option<MeasureEvent> {
    let grace = child(node, "grace");
    let is_grace = grace.is_some();
    let grace_slash = grace.map_or(false, |g| g.attribute("slash") == Some("yes"));
    let duration = child_i64(node, "duration").unwrap_or(0);
    let voice = child_u32(node, "voice").unwrap_or(1);
    let staff = child_u32(node, "staff").unwrap_or(1);
    let note_type = child_text(node, "type").and_then(NoteType::from_name);
    let dots = children(node, "dot").count() as u32;
    let time_mod = child(node, "time-modification").and_then(|tm| {
        TimeModification::new(
            child_u32(tm, "actual-notes")?,
            child_u32(tm, "normal-notes")?,
        )
    });
    let (notations, tied_start, tied_stop) = read_notations(node, ctx);

    if let Some(rest_node) = child(node, "rest") {
        let mut rest = Rest::new(duration, voice, staff);
        rest.measure_rest = rest_node.attribute("measure") == Some("yes");
        rest.note_type = note_type;
        rest.dots = dots;
        rest.time_mod = time_mod;
        rest.notations = notations;
        return Some(MeasureEvent::Rest(rest));
    }

    if child(node, "unpitched").is_some() {
        ctx.substituted("unpitched note replaced by a rest");
        let mut rest = Rest::new(duration, voice, staff);
        rest.note_type = note_type;
        rest.dots = dots;
        rest.time_mod = time_mod;
        return Some(MeasureEvent::Rest(rest));
    }

    let Some(pitch_node) = child(node, "pitch") else {
        ctx.unsupported("note without pitch or rest");
        return None;
    };
    let Some(step) = child_text(pitch_node, "step").and_then(Step::from_name) else {
        ctx.unsupported("pitch without a valid step");
        return None;
    };
    let Some(octave) = child_i32(pitch_node, "octave") else {
        ctx.unsupported("pitch without an octave");
        return None;
    };
    let alter = match child_text(pitch_node, "alter") {
        Some(text) => match text.parse::<f64>() {
            Ok(a) if a.fract() == 0.0 => a as i32,
            Ok(a) => {
                ctx.substituted(format!("microtonal alter {a} rounded to a semitone"));
                a.round() as i32
            }
            Err(_) => {
                ctx.unsupported(format!("unparseable alter '{text}'"));
                0
            }
        },
        None => 0,
    };
    let alter = if (-2..=2).contains(&alter) {
        alter
    } else {
        ctx.substituted(format!("alteration {alter} clamped to two semitones"));
        alter.clamp(-2, 2)
    };

    let mut note = Note::new(
        Pitch::new(step, alter, octave),
        if is_grace { 0 } else { duration },
        voice,
        staff,
    );
    note.chord = child(node, "chord").is_some();
    note.grace = is_grace;
    note.grace_slash = grace_slash;
    note.note_type = note_type;
    note.dots = dots;
    note.time_mod = time_mod;
    note.notations = notations;
    note.tie_start = tied_start;
    note.tie_stop = tied_stop;
    for tie in children(node, "tie") {
        match tie.attribute("type") {
            Some("start") => note.tie_start = true,
            Some("stop") => note.tie_stop = true,
            _ => {}
        }
    }
    if let Some(name) = child_text(node, "accidental") {
        match Accidental::from_musicxml_name(name) {
            Some(acc) => note.accidental = Some(acc),
            None => ctx.unmapped(format!("accidental '{name}'")),
        }
    }
    for beam_node in children(node, "beam") {
        let number = attr_u32(beam_node, "number").unwrap_or(1);
        match beam_node.text().map(str::trim).and_then(BeamValue::from_name) {
            Some(value) => note.beams.push(Beam { number, value }),
            None => ctx.unsupported("beam with an unknown value"),
        }
    }
    for lyric_node in children(node, "lyric") {
        let Some(text) = child_text(lyric_node, "text") else {
            continue;
        };
        note.lyrics.push(Lyric {
            number: attr_u32(lyric_node, "number").unwrap_or(1),
            syllabic: child_text(lyric_node, "syllabic").and_then(Syllabic::from_name),
            text: text.to_string(),
        });
    }
    Some(MeasureEvent::Note(note))
}

fn read_notations(node: Node, ctx: &mut ReaderContext) -> (Notations, bool, bool) {
    let mut notations = Notations::default();
    let mut tied_start = false;
    let mut tied_stop = false;
    for block in children(node, "notations") {
        for item in block.children().filter(|n| n.is_element()) {
            match item.tag_name().name() {
                "tied" => match item.attribute("type") {
                    Some("start") => tied_start = true,
                    Some("stop") => tied_stop = true,
                    _ => {}
                },
                "slur" => {
                    let number = attr_u32(item, "number").unwrap_or(1);
                    match item.attribute("type").and_then(StartStop::from_name) {
                        Some(kind) => notations.slurs.push(SlurMark { kind, number }),
                        // a continue leg carries no information of its own
                        None => {}
                    }
                }
                "tuplet" => {
                    if let Some(kind) = item.attribute("type").and_then(StartStop::from_name) {
                        notations.tuplets.push(TupletMark { kind });
                    }
                }
                "glissando" | "slide" => {
                    if let Some(kind) = item.attribute("type").and_then(StartStop::from_name) {
                        notations.glissandos.push(GlissandoMark {
                            kind,
                            number: attr_u32(item, "number").unwrap_or(1),
                        });
                    }
                }
                "fermata" => notations.fermata = true,
                "arpeggiate" => notations.arpeggiate = true,
                "articulations" => {
                    for mark in item.children().filter(|n| n.is_element()) {
                        match Articulation::from_name(mark.tag_name().name()) {
                            Some(a) => notations.articulations.push(a),
                            None => {
                                ctx.unmapped(format!(
                                    "articulation <{}>",
                                    mark.tag_name().name()
                                ));
                            }
                        }
                    }
                }
                "ornaments" => {
                    for mark in item.children().filter(|n| n.is_element()) {
                        match Ornament::from_name(mark.tag_name().name()) {
                            Some(o) => notations.ornaments.push(o),
                            None => {
                                ctx.unmapped(format!("ornament <{}>", mark.tag_name().name()));
                            }
                        }
                    }
                }
                "technical" => {
                    for mark in item.children().filter(|n| n.is_element()) {
                        match Technical::from_name(mark.tag_name().name()) {
                            Some(t) => notations.technical.push(t),
                            None => {
                                ctx.unmapped(format!("technical <{}>", mark.tag_name().name()));
                            }
                        }
                    }
                }
                other => ctx.unmapped(format!("notation <{other}>")),
            }
        }
    }
    (notations, tied_start, tied_stop)
}

fn read_direction(node: Node, ctx: &mut ReaderContext) -> Vec<MeasureEvent> {
    let placement = node.attribute("placement").and_then(Placement::from_name);
    let staff = child_u32(node, "staff").unwrap_or(1);
    let voice = child_u32(node, "voice");
    let mut out = Vec::new();
    for dt in children(node, "direction-type") {
        for item in dt.children().filter(|n| n.is_element()) {
            let kind = match item.tag_name().name() {
                "dynamics" => item
                    .children()
                    .find(|n| n.is_element())
                    .map(|d| {
                        if d.tag_name().name() == "other-dynamics" {
                            DirectionKind::Dynamic(d.text().unwrap_or_default().trim().to_string())
                        } else {
                            DirectionKind::Dynamic(d.tag_name().name().to_string())
                        }
                    }),
                "wedge" => match item.attribute("type") {
                    Some("crescendo") => Some(DirectionKind::Wedge(WedgeKind::Crescendo)),
                    Some("diminuendo") => Some(DirectionKind::Wedge(WedgeKind::Diminuendo)),
                    Some("stop") => Some(DirectionKind::Wedge(WedgeKind::Stop)),
                    other => {
                        ctx.unmapped(format!("wedge type {other:?}"));
                        None
                    }
                },
                "pedal" => match item.attribute("type") {
                    Some("start") => Some(DirectionKind::Pedal(PedalKind::Start)),
                    Some("stop") => Some(DirectionKind::Pedal(PedalKind::Stop)),
                    Some("change") => Some(DirectionKind::Pedal(PedalKind::Change)),
                    other => {
                        ctx.unmapped(format!("pedal type {other:?}"));
                        None
                    }
                },
                "octave-shift" => {
                    let size = attr_u32(item, "size").unwrap_or(8);
                    match item.attribute("type") {
                        Some("up") => Some(DirectionKind::OctaveShift {
                            kind: OctaveShiftKind::Up,
                            size,
                        }),
                        Some("down") => Some(DirectionKind::OctaveShift {
                            kind: OctaveShiftKind::Down,
                            size,
                        }),
                        Some("stop") => Some(DirectionKind::OctaveShift {
                            kind: OctaveShiftKind::Stop,
                            size,
                        }),
                        other => {
                            ctx.unmapped(format!("octave-shift type {other:?}"));
                            None
                        }
                    }
                }
                "words" => {
                    let text = item.text().unwrap_or_default().trim();
                    if text.is_empty() {
                        None
                    } else {
                        Some(DirectionKind::Words(text.to_string()))
                    }
                }
                "metronome" => {
                    let unit = child_text(item, "beat-unit").and_then(NoteType::from_name);
                    let per_minute = child_text(item, "per-minute");
                    match (unit, per_minute) {
                        (Some(beat_unit), Some(pm)) => Some(DirectionKind::Metronome {
                            beat_unit,
                            per_minute: pm.to_string(),
                        }),
                        _ => {
                            ctx.unmapped("metronome without beat-unit/per-minute");
                            None
                        }
                    }
                }
                other => {
                    ctx.unmapped(format!("direction <{other}>"));
                    None
                }
            };
            if let Some(kind) = kind {
                out.push(MeasureEvent::Direction(Direction {
                    kind,
                    placement,
                    staff,
                    voice,
                }));
            }
        }
    }
    out
}

fn read_harmony(node: Node, ctx: &mut ReaderContext) -> Option<Harmony> {
    let Some(root) = child(node, "root") else {
        ctx.unsupported("harmony without a root");
        return None;
    };
    let Some(step) = child_text(root, "root-step").and_then(Step::from_name) else {
        ctx.unsupported("harmony root without a valid step");
        return None;
    };
    let bass = child(node, "bass").and_then(|b| {
        let step = child_text(b, "bass-step").and_then(Step::from_name)?;
        Some((step, child_i32(b, "bass-alter").unwrap_or(0)))
    });
    Some(Harmony {
        root: step,
        root_alter: child_i32(root, "root-alter").unwrap_or(0),
        kind: child_text(node, "kind").unwrap_or("major").to_string(),
        bass,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<score-partwise version="3.1">
  <work><work-title>Test piece</work-title></work>
  <part-list>
    <score-part id="P1"><part-name>Flute</part-name></score-part>
  </part-list>
  <part id="P1">
    <measure number="1">
      <attributes>
        <divisions>480</divisions>
        <key><fifths>1</fifths></key>
        <time><beats>4</beats><beat-type>4</beat-type></time>
      </attributes>
      <note>
        <pitch><step>F</step><alter>1</alter><octave>4</octave></pitch>
        <duration>480</duration>
        <voice>1</voice>
        <type>quarter</type>
      </note>
      <note>
        <rest/>
        <duration>1440</duration>
        <voice>1</voice>
      </note>
    </measure>
  </part>
</score-partwise>
"#;

    #[test]
    fn test_read_simple_document() {
        let score = read_musicxml(SIMPLE).unwrap();
        assert_eq!(score.title.as_deref(), Some("Test piece"));
        assert_eq!(score.parts.len(), 1);
        let part = &score.parts[0];
        assert_eq!(part.name.as_deref(), Some("Flute"));
        let measure = &part.measures[0];
        let attrs = measure.attributes.as_ref().unwrap();
        assert_eq!(attrs.divisions, Some(480));
        assert_eq!(attrs.key_fifths, Some(1));
        match &measure.events[0] {
            MeasureEvent::Note(n) => {
                assert_eq!(n.pitch, Pitch::new(Step::F, 1, 4));
                assert_eq!(n.duration, 480);
                assert_eq!(n.note_type, Some(NoteType::Quarter));
            }
            other => panic!("expected note, got {other:?}"),
        }
        assert!(matches!(&measure.events[1], MeasureEvent::Rest(r) if r.duration == 1440));
    }

    #[test]
    fn test_rejects_timewise_root() {
        let err = read_musicxml("<score-timewise/>");
        assert!(matches!(err, Err(ConvertError::UnsupportedRoot(r)) if r == "score-timewise"));
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(matches!(
            read_musicxml("<score-partwise><unclosed>"),
            Err(ConvertError::MalformedXml(_))
        ));
    }

    #[test]
    fn test_unknown_measure_element_diagnosed() {
        let text = r#"<score-partwise><part-list/><part id="P1">
            <measure number="1"><listening/></measure></part></score-partwise>"#;
        let score = read_musicxml(text).unwrap();
        assert_eq!(score.diagnostics.len(), 1);
        assert_eq!(score.diagnostics[0].kind, DiagnosticKind::UnsupportedElement);
        assert_eq!(score.diagnostics[0].measure, Some(1));
    }

    #[test]
    fn test_note_details_round_in() {
        let text = r#"<score-partwise><part-list/><part id="P1"><measure number="1">
          <attributes><divisions>480</divisions></attributes>
          <note>
            <pitch><step>C</step><alter>1</alter><octave>5</octave></pitch>
            <duration>160</duration>
            <tie type="start"/>
            <voice>2</voice>
            <type>eighth</type>
            <accidental>sharp</accidental>
            <time-modification><actual-notes>3</actual-notes><normal-notes>2</normal-notes></time-modification>
            <staff>1</staff>
            <beam number="1">begin</beam>
            <notations>
              <slur number="1" type="start"/>
              <tuplet type="start"/>
              <articulations><staccato/></articulations>
            </notations>
            <lyric number="1"><syllabic>single</syllabic><text>la</text></lyric>
          </note>
        </measure></part></score-partwise>"#;
        let score = read_musicxml(text).unwrap();
        let MeasureEvent::Note(n) = &score.parts[0].measures[0].events[0] else {
            panic!("expected note");
        };
        assert!(n.tie_start);
        assert_eq!(n.voice, 2);
        assert_eq!(n.accidental, Some(Accidental::Sharp));
        assert_eq!(n.time_mod, TimeModification::new(3, 2));
        assert_eq!(n.beams.len(), 1);
        assert_eq!(n.notations.slurs.len(), 1);
        assert_eq!(n.notations.tuplets.len(), 1);
        assert_eq!(n.notations.articulations, vec![Articulation::Staccato]);
        assert_eq!(n.lyrics[0].text, "la");
        assert_eq!(n.lyrics[0].syllabic, Some(Syllabic::Single));
    }

    #[test]
    fn test_direction_and_harmony() {
        let text = r#"<score-partwise><part-list/><part id="P1"><measure number="1">
          <direction placement="below">
            <direction-type><dynamics><mf/></dynamics></direction-type>
            <staff>1</staff>
          </direction>
          <direction><direction-type><wedge type="crescendo"/></direction-type></direction>
          <harmony>
            <root><root-step>D</root-step></root>
            <kind>minor</kind>
          </harmony>
        </measure></part></score-partwise>"#;
        let score = read_musicxml(text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(
            &events[0],
            MeasureEvent::Direction(Direction {
                kind: DirectionKind::Dynamic(d),
                placement: Some(Placement::Below),
                ..
            }) if d == "mf"
        ));
        assert!(matches!(
            &events[1],
            MeasureEvent::Direction(Direction {
                kind: DirectionKind::Wedge(WedgeKind::Crescendo),
                ..
            })
        ));
        assert!(matches!(
            &events[2],
            MeasureEvent::Harmony(Harmony { root: Step::D, kind, .. }) if kind == "minor"
        ));
    }

    #[test]
    fn test_grace_and_chord_flags() {
        let text = r#"<score-partwise><part-list/><part id="P1"><measure number="1">
          <note><grace slash="yes"/><pitch><step>D</step><octave>5</octave></pitch><voice>1</voice><type>eighth</type></note>
          <note><pitch><step>C</step><octave>5</octave></pitch><duration>480</duration><voice>1</voice></note>
          <note><chord/><pitch><step>E</step><octave>5</octave></pitch><duration>480</duration><voice>1</voice></note>
        </measure></part></score-partwise>"#;
        let score = read_musicxml(text).unwrap();
        let events = &score.parts[0].measures[0].events;
        assert!(matches!(&events[0], MeasureEvent::Note(n) if n.grace && n.grace_slash && n.duration == 0));
        assert!(matches!(&events[1], MeasureEvent::Note(n) if !n.chord));
        assert!(matches!(&events[2], MeasureEvent::Note(n) if n.chord));
    }
}
