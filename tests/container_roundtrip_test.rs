// Test compressed score containers end to end

use std::fs;

use scorebridge::container::{
    extract_by_path, extract_score, read_entries, METHOD_DEFLATED, METHOD_STORED,
};
use scorebridge::musicxml::read_musicxml;
use scorebridge::{archive_to_musicxml, musicxml_to_archive, ArchiveError, ConvertOptions};

const SOURCE: &str = r#"<score-partwise version="3.1">
  <part-list><score-part id="P1"><part-name>Music</part-name></score-part></part-list>
  <part id="P1"><measure number="1">
    <attributes><divisions>480</divisions><key><fifths>0</fifths></key>
      <time><beats>4</beats><beat-type>4</beat-type></time>
      <clef><sign>G</sign><line>2</line></clef></attributes>
    <note><pitch><step>C</step><octave>4</octave></pitch>
      <duration>1920</duration><voice>1</voice><type>whole</type></note>
  </measure></part></score-partwise>"#;

#[test]
fn test_wrapped_archive_lists_manifest_and_score() {
    let options = ConvertOptions::default();
    let bytes = musicxml_to_archive(SOURCE, "score.xml", &options).unwrap();
    let entries = read_entries(&bytes).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["META-INF/container.xml", "score.xml"]);
    // the tiny manifest stays stored, the score text compresses
    assert_eq!(entries[0].method, METHOD_STORED);
    assert_eq!(entries[1].method, METHOD_DEFLATED);
    assert!(entries[1].compressed_size < entries[1].uncompressed_size);
}

#[test]
fn test_extract_score_follows_the_manifest() {
    let options = ConvertOptions::default();
    let bytes = musicxml_to_archive(SOURCE, "score.xml", &options).unwrap();
    let (name, payload) = extract_score(&bytes).unwrap();
    assert_eq!(name, "score.xml");
    let text = String::from_utf8(payload).unwrap();
    let score = read_musicxml(&text).unwrap();
    assert_eq!(score.parts.len(), 1);
    assert_eq!(score.parts[0].measures.len(), 1);
}

#[test]
fn test_mscz_payload_goes_through_musescore() {
    let options = ConvertOptions::default();
    let bytes = musicxml_to_archive(SOURCE, "piece.mscx", &options).unwrap();
    let (name, payload) = extract_score(&bytes).unwrap();
    assert_eq!(name, "piece.mscx");
    assert!(String::from_utf8(payload).unwrap().contains("<museScore"));

    let back = archive_to_musicxml(&bytes, &options).unwrap();
    assert!(back.contains("<step>C</step>"));
    assert!(back.contains("<duration>1920</duration>"));
}

#[test]
fn test_archive_survives_a_disk_round_trip() {
    let options = ConvertOptions::default();
    let bytes = musicxml_to_archive(SOURCE, "score.xml", &options).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("piece.mxl");
    fs::write(&path, &bytes).unwrap();
    let reread = fs::read(&path).unwrap();

    let back = archive_to_musicxml(&reread, &options).unwrap();
    assert!(back.contains("<score-partwise"));
    assert!(back.contains("<step>C</step>"));
}

#[test]
fn test_missing_member_is_reported_by_name() {
    let options = ConvertOptions::default();
    let bytes = musicxml_to_archive(SOURCE, "score.xml", &options).unwrap();
    let err = extract_by_path(&bytes, "missing.xml").unwrap_err();
    assert!(matches!(err, ArchiveError::MemberNotFound { name } if name == "missing.xml"));
}

#[test]
fn test_garbage_bytes_are_rejected() {
    let options = ConvertOptions::default();
    let err = archive_to_musicxml(b"this is not a zip archive", &options).unwrap_err();
    assert!(err.to_string().contains("end of central directory"));
}
