//! Pivot document writer
//!
//! Serializes the pivot score as a partwise document. Element order
//! inside <note> follows the schema sequence, so output validates
//! against the 3.1 DTD.

use crate::metadata;
use crate::models::{
    Attributes, Direction, DirectionKind, Harmony, MeasureEvent, Note, Notations, Rest, Score,
};
use crate::options::ConvertOptions;
use crate::xml::xml_escape;

const KNOWN_DYNAMICS: &[&str] = &[
    "p", "pp", "ppp", "pppp", "f", "ff", "fff", "ffff", "mp", "mf", "sf", "sfp", "sfpp", "fp",
    "rf", "rfz", "sfz", "sffz", "fz",
];

/// Serialize the pivot score as partwise MusicXML 3.1
pub fn write_musicxml(score: &Score, options: &ConvertOptions) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<!DOCTYPE score-partwise PUBLIC \"-//Recordare//DTD MusicXML 3.1 Partwise//EN\" \"http://www.musicxml.org/dtds/partwise.dtd\">\n");
    out.push_str("<score-partwise version=\"3.1\">\n");

    if let Some(title) = &score.title {
        out.push_str("  <work>\n");
        out.push_str(&format!(
            "    <work-title>{}</work-title>\n",
            xml_escape(title)
        ));
        out.push_str("  </work>\n");
    }

    write_identification(&mut out, score, options);
    write_part_list(&mut out, score);

    for part in &score.parts {
        out.push_str(&format!("  <part id=\"{}\">\n", xml_escape(&part.id)));
        for measure in &part.measures {
            out.push_str(&format!(
                "    <measure number=\"{}\">\n",
                xml_escape(&measure.number)
            ));
            if let Some(attrs) = &measure.attributes {
                if !attrs.is_empty() {
                    write_attributes(&mut out, attrs);
                }
            }
            for event in &measure.events {
                match event {
                    MeasureEvent::Note(n) => write_note(&mut out, n),
                    MeasureEvent::Rest(r) => write_rest(&mut out, r),
                    MeasureEvent::Backup { duration } => {
                        out.push_str("      <backup>\n");
                        out.push_str(&format!("        <duration>{duration}</duration>\n"));
                        out.push_str("      </backup>\n");
                    }
                    MeasureEvent::Forward {
                        duration,
                        voice,
                        staff,
                    } => {
                        out.push_str("      <forward>\n");
                        out.push_str(&format!("        <duration>{duration}</duration>\n"));
                        if let Some(v) = voice {
                            out.push_str(&format!("        <voice>{v}</voice>\n"));
                        }
                        if let Some(s) = staff {
                            out.push_str(&format!("        <staff>{s}</staff>\n"));
                        }
                        out.push_str("      </forward>\n");
                    }
                    MeasureEvent::Direction(d) => write_direction(&mut out, d),
                    MeasureEvent::Harmony(h) => write_harmony(&mut out, h),
                }
            }
            out.push_str("    </measure>\n");
        }
        out.push_str("  </part>\n");
    }

    out.push_str("</score-partwise>\n");
    out
}

fn write_identification(out: &mut String, score: &Score, options: &ConvertOptions) {
    let mut fields: Vec<(String, String)> = score.misc_fields.clone();
    for (i, diag) in score.diagnostics.iter().enumerate() {
        fields.push((
            format!("{}{}", metadata::DIAGNOSTIC_FIELD_PREFIX, i),
            metadata::diagnostic_field_value(diag),
        ));
    }
    if options.debug_metadata {
        fields.extend(metadata::debug_audit_fields(score));
    }

    out.push_str("  <identification>\n");
    out.push_str("    <encoding>\n");
    out.push_str("      <software>scorebridge</software>\n");
    out.push_str("    </encoding>\n");
    if !fields.is_empty() {
        out.push_str("    <miscellaneous>\n");
        for (name, value) in &fields {
            out.push_str(&format!(
                "      <miscellaneous-field name=\"{}\">{}</miscellaneous-field>\n",
                xml_escape(name),
                xml_escape(value)
            ));
        }
        out.push_str("    </miscellaneous>\n");
    }
    out.push_str("  </identification>\n");
}

fn write_part_list(out: &mut String, score: &Score) {
    out.push_str("  <part-list>\n");
    for (i, part) in score.parts.iter().enumerate() {
        out.push_str(&format!(
            "    <score-part id=\"{}\">\n",
            xml_escape(&part.id)
        ));
        let name = part
            .name
            .clone()
            .unwrap_or_else(|| format!("Part {}", i + 1));
        out.push_str(&format!(
            "      <part-name>{}</part-name>\n",
            xml_escape(&name)
        ));
        out.push_str("    </score-part>\n");
    }
    out.push_str("  </part-list>\n");
}

fn write_attributes(out: &mut String, attrs: &Attributes) {
    out.push_str("      <attributes>\n");
    if let Some(divisions) = attrs.divisions {
        out.push_str(&format!("        <divisions>{divisions}</divisions>\n"));
    }
    if let Some(fifths) = attrs.key_fifths {
        out.push_str("        <key>\n");
        out.push_str(&format!("          <fifths>{fifths}</fifths>\n"));
        out.push_str("        </key>\n");
    }
    if let Some(time) = &attrs.time {
        out.push_str("        <time>\n");
        out.push_str(&format!("          <beats>{}</beats>\n", time.beats));
        out.push_str(&format!(
            "          <beat-type>{}</beat-type>\n",
            time.beat_type
        ));
        out.push_str("        </time>\n");
    }
    if let Some(staves) = attrs.staves {
        out.push_str(&format!("        <staves>{staves}</staves>\n"));
    }
    for clef in &attrs.clefs {
        if clef.staff > 1 {
            out.push_str(&format!("        <clef number=\"{}\">\n", clef.staff));
        } else {
            out.push_str("        <clef>\n");
        }
        out.push_str(&format!("          <sign>{}</sign>\n", clef.sign.name()));
        if let Some(line) = clef.line {
            out.push_str(&format!("          <line>{line}</line>\n"));
        }
        if clef.octave_change != 0 {
            out.push_str(&format!(
                "          <clef-octave-change>{}</clef-octave-change>\n",
                clef.octave_change
            ));
        }
        out.push_str("        </clef>\n");
    }
    out.push_str("      </attributes>\n");
}

fn write_note(out: &mut String, note: &Note) {
    out.push_str("      <note>\n");
    if note.grace {
        if note.grace_slash {
            out.push_str("        <grace slash=\"yes\"/>\n");
        } else {
            out.push_str("        <grace/>\n");
        }
    }
    if note.chord {
        out.push_str("        <chord/>\n");
    }
    out.push_str("        <pitch>\n");
    out.push_str(&format!(
        "          <step>{}</step>\n",
        note.pitch.step.name()
    ));
    if note.pitch.alter != 0 {
        out.push_str(&format!("          <alter>{}</alter>\n", note.pitch.alter));
    }
    out.push_str(&format!(
        "          <octave>{}</octave>\n",
        note.pitch.octave
    ));
    out.push_str("        </pitch>\n");
    if !note.grace {
        out.push_str(&format!("        <duration>{}</duration>\n", note.duration));
    }
    if note.tie_stop {
        out.push_str("        <tie type=\"stop\"/>\n");
    }
    if note.tie_start {
        out.push_str("        <tie type=\"start\"/>\n");
    }
    out.push_str(&format!("        <voice>{}</voice>\n", note.voice));
    if let Some(note_type) = note.note_type {
        out.push_str(&format!("        <type>{}</type>\n", note_type.name()));
    }
    for _ in 0..note.dots {
        out.push_str("        <dot/>\n");
    }
    if let Some(acc) = note.accidental {
        out.push_str(&format!(
            "        <accidental>{}</accidental>\n",
            acc.musicxml_name()
        ));
    }
    if let Some(tm) = &note.time_mod {
        out.push_str("        <time-modification>\n");
        out.push_str(&format!(
            "          <actual-notes>{}</actual-notes>\n",
            tm.actual_notes
        ));
        out.push_str(&format!(
            "          <normal-notes>{}</normal-notes>\n",
            tm.normal_notes
        ));
        out.push_str("        </time-modification>\n");
    }
    out.push_str(&format!("        <staff>{}</staff>\n", note.staff));
    for beam in &note.beams {
        out.push_str(&format!(
            "        <beam number=\"{}\">{}</beam>\n",
            beam.number,
            beam.value.name()
        ));
    }
    if !note.notations.is_empty() || note.tie_start || note.tie_stop {
        write_notations(out, &note.notations, note.tie_start, note.tie_stop);
    }
    for lyric in &note.lyrics {
        out.push_str(&format!("        <lyric number=\"{}\">\n", lyric.number));
        if let Some(syllabic) = lyric.syllabic {
            out.push_str(&format!(
                "          <syllabic>{}</syllabic>\n",
                syllabic.name()
            ));
        }
        out.push_str(&format!("          <text>{}</text>\n", xml_escape(&lyric.text)));
        out.push_str("        </lyric>\n");
    }
    out.push_str("      </note>\n");
}

fn write_rest(out: &mut String, rest: &Rest) {
    out.push_str("      <note>\n");
    if rest.measure_rest {
        out.push_str("        <rest measure=\"yes\"/>\n");
    } else {
        out.push_str("        <rest/>\n");
    }
    out.push_str(&format!("        <duration>{}</duration>\n", rest.duration));
    out.push_str(&format!("        <voice>{}</voice>\n", rest.voice));
    if let Some(note_type) = rest.note_type {
        out.push_str(&format!("        <type>{}</type>\n", note_type.name()));
    }
    for _ in 0..rest.dots {
        out.push_str("        <dot/>\n");
    }
    if let Some(tm) = &rest.time_mod {
        out.push_str("        <time-modification>\n");
        out.push_str(&format!(
            "          <actual-notes>{}</actual-notes>\n",
            tm.actual_notes
        ));
        out.push_str(&format!(
            "          <normal-notes>{}</normal-notes>\n",
            tm.normal_notes
        ));
        out.push_str("        </time-modification>\n");
    }
    out.push_str(&format!("        <staff>{}</staff>\n", rest.staff));
    if !rest.notations.is_empty() {
        write_notations(out, &rest.notations, false, false);
    }
    out.push_str("      </note>\n");
}

fn write_notations(out: &mut String, notations: &Notations, tie_start: bool, tie_stop: bool) {
    out.push_str("        <notations>\n");
    if tie_stop {
        out.push_str("          <tied type=\"stop\"/>\n");
    }
    if tie_start {
        out.push_str("          <tied type=\"start\"/>\n");
    }
    for slur in &notations.slurs {
        out.push_str(&format!(
            "          <slur number=\"{}\" type=\"{}\"/>\n",
            slur.number,
            slur.kind.name()
        ));
    }
    for tuplet in &notations.tuplets {
        out.push_str(&format!(
            "          <tuplet type=\"{}\"/>\n",
            tuplet.kind.name()
        ));
    }
    for gliss in &notations.glissandos {
        out.push_str(&format!(
            "          <glissando number=\"{}\" type=\"{}\"/>\n",
            gliss.number,
            gliss.kind.name()
        ));
    }
    if !notations.ornaments.is_empty() {
        out.push_str("          <ornaments>\n");
        for ornament in &notations.ornaments {
            out.push_str(&format!("            <{}/>\n", ornament.name()));
        }
        out.push_str("          </ornaments>\n");
    }
    if !notations.technical.is_empty() {
        out.push_str("          <technical>\n");
        for technical in &notations.technical {
            out.push_str(&format!("            <{}/>\n", technical.name()));
        }
        out.push_str("          </technical>\n");
    }
    if !notations.articulations.is_empty() {
        out.push_str("          <articulations>\n");
        for articulation in &notations.articulations {
            out.push_str(&format!("            <{}/>\n", articulation.name()));
        }
        out.push_str("          </articulations>\n");
    }
    if notations.fermata {
        out.push_str("          <fermata/>\n");
    }
    if notations.arpeggiate {
        out.push_str("          <arpeggiate/>\n");
    }
    out.push_str("        </notations>\n");
}

fn write_direction(out: &mut String, direction: &Direction) {
    match &direction.placement {
        Some(p) => out.push_str(&format!("      <direction placement=\"{}\">\n", p.name())),
        None => out.push_str("      <direction>\n"),
    }
    out.push_str("        <direction-type>\n");
    match &direction.kind {
        DirectionKind::Dynamic(value) => {
            if KNOWN_DYNAMICS.contains(&value.as_str()) {
                out.push_str(&format!("          <dynamics><{value}/></dynamics>\n"));
            } else {
                out.push_str(&format!(
                    "          <dynamics><other-dynamics>{}</other-dynamics></dynamics>\n",
                    xml_escape(value)
                ));
            }
        }
        DirectionKind::Wedge(kind) => {
            out.push_str(&format!("          <wedge type=\"{}\"/>\n", kind.name()));
        }
        DirectionKind::Pedal(kind) => {
            out.push_str(&format!("          <pedal type=\"{}\"/>\n", kind.name()));
        }
        DirectionKind::OctaveShift { kind, size } => {
            out.push_str(&format!(
                "          <octave-shift type=\"{}\" size=\"{}\"/>\n",
                kind.name(),
                size
            ));
        }
        DirectionKind::Words(text) => {
            out.push_str(&format!("          <words>{}</words>\n", xml_escape(text)));
        }
        DirectionKind::Metronome {
            beat_unit,
            per_minute,
        } => {
            out.push_str("          <metronome>\n");
            out.push_str(&format!(
                "            <beat-unit>{}</beat-unit>\n",
                beat_unit.name()
            ));
            out.push_str(&format!(
                "            <per-minute>{}</per-minute>\n",
                xml_escape(per_minute)
            ));
            out.push_str("          </metronome>\n");
        }
    }
    out.push_str("        </direction-type>\n");
    if let Some(v) = direction.voice {
        out.push_str(&format!("        <voice>{v}</voice>\n"));
    }
    out.push_str(&format!("        <staff>{}</staff>\n", direction.staff));
    out.push_str("      </direction>\n");
}

fn write_harmony(out: &mut String, harmony: &Harmony) {
    out.push_str("      <harmony>\n");
    out.push_str("        <root>\n");
    out.push_str(&format!(
        "          <root-step>{}</root-step>\n",
        harmony.root.name()
    ));
    if harmony.root_alter != 0 {
        out.push_str(&format!(
            "          <root-alter>{}</root-alter>\n",
            harmony.root_alter
        ));
    }
    out.push_str("        </root>\n");
    out.push_str(&format!(
        "        <kind>{}</kind>\n",
        xml_escape(&harmony.kind)
    ));
    if let Some((step, alter)) = &harmony.bass {
        out.push_str("        <bass>\n");
        out.push_str(&format!("          <bass-step>{}</bass-step>\n", step.name()));
        if *alter != 0 {
            out.push_str(&format!("          <bass-alter>{alter}</bass-alter>\n"));
        }
        out.push_str("        </bass>\n");
    }
    out.push_str("      </harmony>\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
    use crate::models::{
        Measure, Note, NoteType, Part, Pitch, Rest, Step, TimeModification, TimeSignature,
    };
    use crate::musicxml::read_musicxml;

    fn one_measure_score() -> Score {
        let mut score = Score::new();
        score.title = Some("Round trip".into());
        let mut part = Part::new("P1");
        part.name = Some("Piano".into());
        let mut measure = Measure::new("1");
        let mut attrs = Attributes::default();
        attrs.divisions = Some(480);
        attrs.key_fifths = Some(2);
        attrs.time = TimeSignature::new(3, 4);
        measure.attributes = Some(attrs);
        let mut note = Note::new(Pitch::new(Step::F, 1, 4), 480, 1, 1);
        note.note_type = Some(NoteType::Quarter);
        measure.events.push(MeasureEvent::Note(note));
        let mut rest = Rest::new(960, 1, 1);
        rest.note_type = Some(NoteType::Half);
        measure.events.push(MeasureEvent::Rest(rest));
        part.measures.push(measure);
        score.parts.push(part);
        score
    }

    #[test]
    fn test_writer_reader_round_trip() {
        let score = one_measure_score();
        let text = write_musicxml(&score, &ConvertOptions::default());
        let back = read_musicxml(&text).unwrap();
        assert_eq!(back.title, score.title);
        assert_eq!(back.parts.len(), 1);
        assert_eq!(back.parts[0].name.as_deref(), Some("Piano"));
        let attrs = back.parts[0].measures[0].attributes.as_ref().unwrap();
        assert_eq!(attrs.divisions, Some(480));
        assert_eq!(attrs.key_fifths, Some(2));
        assert_eq!(attrs.time, TimeSignature::new(3, 4));
        assert_eq!(back.parts[0].measures[0].events.len(), 2);
    }

    #[test]
    fn test_alter_element_only_when_nonzero() {
        let mut score = one_measure_score();
        score.parts[0].measures[0]
            .events
            .push(MeasureEvent::Note(Note::new(Pitch::new(Step::G, 0, 4), 480, 1, 1)));
        let text = write_musicxml(&score, &ConvertOptions::default());
        assert_eq!(text.matches("<alter>").count(), 1);
    }

    #[test]
    fn test_diagnostics_written_as_misc_fields() {
        let mut score = one_measure_score();
        score.diagnostics.push(Diagnostic::new(
            DiagnosticKind::UnmappedMark,
            DiagnosticAction::Dropped,
            "ornament <shake>",
        ));
        let text = write_musicxml(&score, &ConvertOptions::default());
        assert!(text.contains("miscellaneous-field name=\"scorebridge:diagnostic:0\""));
        let back = read_musicxml(&text).unwrap();
        assert_eq!(back.diagnostics.len(), 1);
        assert_eq!(back.diagnostics[0].kind, DiagnosticKind::UnmappedMark);
        assert!(back.misc_fields.is_empty());
    }

    #[test]
    fn test_debug_metadata_audit_fields() {
        let score = one_measure_score();
        let options = ConvertOptions {
            debug_metadata: true,
            ..ConvertOptions::default()
        };
        let text = write_musicxml(&score, &options);
        assert!(text.contains("scorebridge:debug:P1:1"));
        assert!(text.contains("occupied=1440;capacity=1440"));
    }

    #[test]
    fn test_tuplet_note_carries_time_modification() {
        let mut score = one_measure_score();
        let mut note = Note::new(Pitch::new(Step::A, 0, 4), 160, 1, 1);
        note.note_type = Some(NoteType::Eighth);
        note.time_mod = TimeModification::new(3, 2);
        score.parts[0].measures[0].events.push(MeasureEvent::Note(note));
        let text = write_musicxml(&score, &ConvertOptions::default());
        assert!(text.contains("<actual-notes>3</actual-notes>"));
        assert!(text.contains("<normal-notes>2</normal-notes>"));
    }

    #[test]
    fn test_escapes_title_text() {
        let mut score = one_measure_score();
        score.title = Some("Airs & <Graces>".into());
        let text = write_musicxml(&score, &ConvertOptions::default());
        assert!(text.contains("<work-title>Airs &amp; &lt;Graces&gt;</work-title>"));
    }
}
