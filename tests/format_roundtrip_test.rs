// Test note timing, voices and ties surviving each foreign format

use scorebridge::models::{MeasureEvent, Score};
use scorebridge::musicxml::read_musicxml;
use scorebridge::rhythm::timing;
use scorebridge::{
    mei_to_musicxml, musescore_to_musicxml, musicxml_to_mei, musicxml_to_musescore,
    normalize_musicxml, ConvertOptions,
};

// Two measures, two voices, a dotted rhythm and a tie across the barline
const SOURCE: &str = r#"<score-partwise version="3.1">
  <part-list><score-part id="P1"><part-name>Music</part-name></score-part></part-list>
  <part id="P1">
    <measure number="1">
      <attributes><divisions>480</divisions><key><fifths>1</fifths></key>
        <time><beats>4</beats><beat-type>4</beat-type></time>
        <clef><sign>G</sign><line>2</line></clef></attributes>
      <note><pitch><step>F</step><alter>1</alter><octave>4</octave></pitch>
        <duration>720</duration><voice>1</voice><type>quarter</type><dot/></note>
      <note><pitch><step>G</step><octave>4</octave></pitch>
        <duration>240</duration><voice>1</voice><type>eighth</type></note>
      <note><pitch><step>A</step><octave>4</octave></pitch>
        <duration>480</duration><voice>1</voice><type>quarter</type></note>
      <note><pitch><step>B</step><octave>4</octave></pitch>
        <duration>480</duration><voice>1</voice><type>quarter</type>
        <tie type="start"/><notations><tied type="start"/></notations></note>
      <backup><duration>1920</duration></backup>
      <note><pitch><step>C</step><octave>4</octave></pitch>
        <duration>960</duration><voice>2</voice><type>half</type></note>
      <note><pitch><step>D</step><octave>4</octave></pitch>
        <duration>960</duration><voice>2</voice><type>half</type></note>
    </measure>
    <measure number="2">
      <note><pitch><step>B</step><octave>4</octave></pitch>
        <duration>1920</duration><voice>1</voice><type>whole</type>
        <tie type="stop"/><notations><tied type="stop"/></notations></note>
      <backup><duration>1920</duration></backup>
      <note><pitch><step>E</step><octave>4</octave></pitch>
        <duration>1920</duration><voice>2</voice><type>whole</type></note>
    </measure>
  </part>
</score-partwise>"#;

/// Per measure: sorted (onset, duration, midi, voice, tie start, tie stop)
type Shape = (i64, i64, i32, u32, bool, bool);

fn note_shapes(score: &Score) -> Vec<Vec<Shape>> {
    assert_eq!(score.parts.len(), 1);
    score.parts[0]
        .measures
        .iter()
        .map(|measure| {
            let times = timing::timeline(&measure.events);
            let mut shapes: Vec<Shape> = measure
                .events
                .iter()
                .zip(&times.events)
                .filter_map(|(event, t)| match event {
                    MeasureEvent::Note(n) => Some((
                        t.onset,
                        n.duration,
                        n.pitch.midi(),
                        n.voice,
                        n.tie_start,
                        n.tie_stop,
                    )),
                    _ => None,
                })
                .collect();
            shapes.sort();
            shapes
        })
        .collect()
}

#[test]
fn test_reference_shapes_read_as_expected() {
    let shapes = note_shapes(&read_musicxml(SOURCE).unwrap());
    assert_eq!(shapes.len(), 2);
    assert_eq!(shapes[0].len(), 6);
    assert_eq!(shapes[1].len(), 2);
    // voice 1 opens with the dotted quarter on F sharp
    assert!(shapes[0].contains(&(0, 720, 66, 1, false, false)));
    // voice 2 halves sit at beats one and three
    assert!(shapes[0].contains(&(0, 960, 60, 2, false, false)));
    assert!(shapes[0].contains(&(960, 960, 62, 2, false, false)));
    // the tie closes on the second measure's whole note
    assert!(shapes[1].contains(&(0, 1920, 71, 1, false, true)));
}

#[test]
fn test_mei_round_trip_preserves_note_shapes() {
    let options = ConvertOptions::default();
    let reference = note_shapes(&read_musicxml(SOURCE).unwrap());
    let mei = musicxml_to_mei(SOURCE, &options).unwrap();
    let back = read_musicxml(&mei_to_musicxml(&mei, &options).unwrap()).unwrap();
    assert_eq!(note_shapes(&back), reference);
}

#[test]
fn test_musescore_round_trip_preserves_note_shapes() {
    let options = ConvertOptions::default();
    let reference = note_shapes(&read_musicxml(SOURCE).unwrap());
    let mscx = musicxml_to_musescore(SOURCE, &options).unwrap();
    let back = read_musicxml(&musescore_to_musicxml(&mscx, &options).unwrap()).unwrap();
    assert_eq!(note_shapes(&back), reference);
}

#[test]
fn test_normalization_is_idempotent() {
    let options = ConvertOptions::default();
    let once = normalize_musicxml(SOURCE, &options).unwrap();
    let twice = normalize_musicxml(&once, &options).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn test_second_pass_through_mei_is_stable() {
    let options = ConvertOptions::default();
    let first = mei_to_musicxml(&musicxml_to_mei(SOURCE, &options).unwrap(), &options).unwrap();
    let second = mei_to_musicxml(&musicxml_to_mei(&first, &options).unwrap(), &options).unwrap();
    assert_eq!(
        note_shapes(&read_musicxml(&first).unwrap()),
        note_shapes(&read_musicxml(&second).unwrap())
    );
}
