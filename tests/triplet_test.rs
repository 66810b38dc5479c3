// Test tuplet durations decomposing to written symbols with group markers

use scorebridge::models::{MeasureEvent, StartStop, TimeModification};
use scorebridge::musicxml::read_musicxml;
use scorebridge::{
    mei_to_musicxml, musescore_to_musicxml, musicxml_to_mei, musicxml_to_musescore, ConvertOptions,
};

// 3/4 at 480 divisions: eighth rest, an eighth-note triplet, then a
// dotted quarter filling the remaining 720 ticks. No written types
// anywhere; the exporters must derive them from the tick values.
const TRIPLET: &str = r#"<score-partwise version="3.1">
  <part-list><score-part id="P1"><part-name>Music</part-name></score-part></part-list>
  <part id="P1"><measure number="1">
    <attributes><divisions>480</divisions><key><fifths>0</fifths></key>
      <time><beats>3</beats><beat-type>4</beat-type></time>
      <clef><sign>G</sign><line>2</line></clef></attributes>
    <note><rest/><duration>240</duration><voice>1</voice></note>
    <note><pitch><step>C</step><octave>5</octave></pitch><duration>160</duration><voice>1</voice>
      <time-modification><actual-notes>3</actual-notes><normal-notes>2</normal-notes></time-modification></note>
    <note><pitch><step>D</step><octave>5</octave></pitch><duration>160</duration><voice>1</voice>
      <time-modification><actual-notes>3</actual-notes><normal-notes>2</normal-notes></time-modification></note>
    <note><pitch><step>E</step><octave>5</octave></pitch><duration>160</duration><voice>1</voice>
      <time-modification><actual-notes>3</actual-notes><normal-notes>2</normal-notes></time-modification></note>
    <note><pitch><step>G</step><octave>4</octave></pitch><duration>720</duration><voice>1</voice></note>
  </measure></part></score-partwise>"#;

#[test]
fn test_mei_gets_a_bracket_and_written_durations() {
    let options = ConvertOptions::default();
    let mei = musicxml_to_mei(TRIPLET, &options).unwrap();
    assert_eq!(mei.matches("<tuplet num=\"3\" numbase=\"2\">").count(), 1);
    assert_eq!(mei.matches("</tuplet>").count(), 1);
    // the rest and the three triplet notes all write as eighths
    assert_eq!(mei.matches("dur=\"8\"").count(), 4, "in: {mei}");
    // 720 ticks come out as a dotted quarter
    assert!(mei.contains("dur=\"4\" dots=\"1\""));
}

#[test]
fn test_musescore_gets_a_tuplet_element() {
    let options = ConvertOptions::default();
    let mscx = musicxml_to_musescore(TRIPLET, &options).unwrap();
    assert_eq!(mscx.matches("<Tuplet>").count(), 1);
    assert!(mscx.contains("<normalNotes>2</normalNotes>"));
    assert!(mscx.contains("<actualNotes>3</actualNotes>"));
    assert_eq!(mscx.matches("<endTuplet/>").count(), 1);
    assert_eq!(mscx.matches("<durationType>eighth</durationType>").count(), 4);
}

fn triplet_notes_of(pivot: &str) -> Vec<(i64, Option<TimeModification>, Vec<StartStop>)> {
    let score = read_musicxml(pivot).unwrap();
    score.parts[0].measures[0]
        .events
        .iter()
        .filter_map(|e| match e {
            MeasureEvent::Note(n) if n.time_mod.is_some() => Some((
                n.duration,
                n.time_mod,
                n.notations.tuplets.iter().map(|t| t.kind).collect(),
            )),
            _ => None,
        })
        .collect()
}

#[test]
fn test_musescore_round_trip_restores_ticks_and_marks() {
    let options = ConvertOptions::default();
    let mscx = musicxml_to_musescore(TRIPLET, &options).unwrap();
    let pivot = musescore_to_musicxml(&mscx, &options).unwrap();
    assert!(pivot.contains("<type>eighth</type>"));
    assert!(pivot.contains("<actual-notes>3</actual-notes>"));

    let triplet = triplet_notes_of(&pivot);
    assert_eq!(triplet.len(), 3);
    for (duration, time_mod, _) in &triplet {
        assert_eq!(*duration, 160);
        assert_eq!(*time_mod, TimeModification::new(3, 2));
    }
    // group markers land on the first and last members only
    assert_eq!(triplet[0].2, vec![StartStop::Start]);
    assert!(triplet[1].2.is_empty());
    assert_eq!(triplet[2].2, vec![StartStop::Stop]);
}

#[test]
fn test_mei_round_trip_restores_ticks_and_marks() {
    let options = ConvertOptions::default();
    let mei = musicxml_to_mei(TRIPLET, &options).unwrap();
    let pivot = mei_to_musicxml(&mei, &options).unwrap();
    let triplet = triplet_notes_of(&pivot);
    assert_eq!(triplet.len(), 3);
    for (duration, time_mod, _) in &triplet {
        assert_eq!(*duration, 160);
        assert_eq!(*time_mod, TimeModification::new(3, 2));
    }
    assert_eq!(triplet[0].2, vec![StartStop::Start]);
    assert_eq!(triplet[2].2, vec![StartStop::Stop]);
}
