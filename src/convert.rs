//! Top-level conversion pipelines
//!
//! Every pipeline is a pure function over document text: parse the source,
//! normalize measure timing, optionally embed the verbatim source bytes,
//! serialize the target. The pivot (partwise MusicXML) sits in the middle
//! of every pair, so MEI and MuseScore never talk to each other directly.

use crate::container;
use crate::converters::mei::{read_mei, write_mei};
use crate::converters::musescore::{read_musescore, write_musescore};
use crate::errors::ConvertResult;
use crate::metadata;
use crate::models::Score;
use crate::musicxml::{read_musicxml, write_musicxml};
use crate::options::ConvertOptions;
use crate::rhythm::timing::normalize_score;

pub fn musicxml_to_mei(source: &str, options: &ConvertOptions) -> ConvertResult<String> {
    let mut score = read_musicxml(source)?;
    finish_import(&mut score, source, options)?;
    log::debug!("pivot -> MEI: {} parts", score.parts.len());
    Ok(write_mei(&score, options))
}

pub fn mei_to_musicxml(source: &str, options: &ConvertOptions) -> ConvertResult<String> {
    let mut score = read_mei(source)?;
    finish_import(&mut score, source, options)?;
    log::debug!("MEI -> pivot: {} parts", score.parts.len());
    Ok(write_musicxml(&score, options))
}

pub fn musicxml_to_musescore(source: &str, options: &ConvertOptions) -> ConvertResult<String> {
    let mut score = read_musicxml(source)?;
    finish_import(&mut score, source, options)?;
    log::debug!("pivot -> MuseScore: {} parts", score.parts.len());
    Ok(write_musescore(&score, options))
}

pub fn musescore_to_musicxml(source: &str, options: &ConvertOptions) -> ConvertResult<String> {
    let mut score = read_musescore(source)?;
    finish_import(&mut score, source, options)?;
    log::debug!("MuseScore -> pivot: {} parts", score.parts.len());
    Ok(write_musicxml(&score, options))
}

/// Re-serialize a pivot document, applying the same normalization the
/// converters apply
pub fn normalize_musicxml(source: &str, options: &ConvertOptions) -> ConvertResult<String> {
    let mut score = read_musicxml(source)?;
    finish_import(&mut score, source, options)?;
    Ok(write_musicxml(&score, options))
}

/// Unwrap an `.mxl`/`.mscz`-style archive and convert its payload to
/// pivot text, dispatching on the payload's extension
pub fn archive_to_musicxml(bytes: &[u8], options: &ConvertOptions) -> ConvertResult<String> {
    let (name, payload) = container::extract_score(bytes)?;
    let text = String::from_utf8_lossy(&payload).into_owned();
    log::debug!("archive payload '{}': {} bytes", name, payload.len());
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".mscx") {
        musescore_to_musicxml(&text, options)
    } else if lower.ends_with(".mei") {
        mei_to_musicxml(&text, options)
    } else {
        normalize_musicxml(&text, options)
    }
}

/// Convert pivot text and wrap the result in a compressed archive
pub fn musicxml_to_archive(
    source: &str,
    score_path: &str,
    options: &ConvertOptions,
) -> ConvertResult<Vec<u8>> {
    let lower = score_path.to_ascii_lowercase();
    let text = if lower.ends_with(".mscx") {
        musicxml_to_musescore(source, options)?
    } else if lower.ends_with(".mei") {
        musicxml_to_mei(source, options)?
    } else {
        normalize_musicxml(source, options)?
    };
    Ok(container::wrap_score(score_path, &text))
}

fn finish_import(score: &mut Score, source: &str, options: &ConvertOptions) -> ConvertResult<()> {
    normalize_score(score, options.fail_on_overfull_drop)?;
    if options.source_metadata {
        embed_source(score, source);
    }
    Ok(())
}

/// Park the verbatim source bytes in order-numbered metadata fields
fn embed_source(score: &mut Score, source: &str) {
    for (i, chunk) in metadata::encode_source_chunks(source.as_bytes())
        .into_iter()
        .enumerate()
    {
        score
            .misc_fields
            .push((format!("{}{i}", metadata::SOURCE_FIELD_PREFIX), chunk));
    }
}

/// Recover the verbatim source document a previous conversion embedded,
/// if the score carries one
pub fn embedded_source(score: &Score) -> Option<Vec<u8>> {
    let mut numbered: Vec<(usize, &str)> = score
        .misc_fields
        .iter()
        .filter_map(|(name, value)| {
            let n = name
                .strip_prefix(metadata::SOURCE_FIELD_PREFIX)?
                .parse()
                .ok()?;
            Some((n, value.as_str()))
        })
        .collect();
    if numbered.is_empty() {
        return None;
    }
    numbered.sort_by_key(|&(n, _)| n);
    let chunks: Vec<String> = numbered.into_iter().map(|(_, v)| v.to_string()).collect();
    Some(metadata::decode_source_chunks(&chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConvertError;

    const SOURCE: &str = "<score-partwise version=\"3.1\">\
        <part-list><score-part id=\"P1\"><part-name>Music</part-name></score-part></part-list>\
        <part id=\"P1\"><measure number=\"1\">\
        <attributes><divisions>480</divisions><key><fifths>0</fifths></key>\
        <time><beats>4</beats><beat-type>4</beat-type></time>\
        <clef><sign>G</sign><line>2</line></clef></attributes>\
        <note><pitch><step>C</step><octave>4</octave></pitch>\
        <duration>1920</duration><voice>1</voice><type>whole</type></note>\
        </measure></part></score-partwise>";

    const OVERFULL: &str = "<score-partwise version=\"3.1\">\
        <part id=\"P1\"><measure number=\"1\">\
        <attributes><divisions>480</divisions>\
        <time><beats>4</beats><beat-type>4</beat-type></time></attributes>\
        <note><pitch><step>C</step><octave>4</octave></pitch>\
        <duration>1920</duration><voice>1</voice><type>whole</type></note>\
        <note><pitch><step>D</step><octave>4</octave></pitch>\
        <duration>480</duration><voice>1</voice><type>quarter</type></note>\
        </measure></part></score-partwise>";

    #[test]
    fn test_pivot_to_mei_and_back() {
        let options = ConvertOptions::default();
        let mei = musicxml_to_mei(SOURCE, &options).unwrap();
        assert!(mei.contains("<mei"));
        assert!(mei.contains("<note"));
        let back = mei_to_musicxml(&mei, &options).unwrap();
        assert!(back.contains("<score-partwise"));
        assert!(back.contains("<step>C</step>"));
    }

    #[test]
    fn test_pivot_to_musescore_and_back() {
        let options = ConvertOptions::default();
        let mscx = musicxml_to_musescore(SOURCE, &options).unwrap();
        assert!(mscx.contains("<museScore"));
        assert!(mscx.contains("<pitch>60</pitch>"));
        let back = musescore_to_musicxml(&mscx, &options).unwrap();
        assert!(back.contains("<step>C</step>"));
        assert!(back.contains("<duration>1920</duration>"));
    }

    #[test]
    fn test_strict_mode_fails_on_overfull() {
        let options = ConvertOptions {
            fail_on_overfull_drop: true,
            ..ConvertOptions::default()
        };
        let err = musicxml_to_mei(OVERFULL, &options).unwrap_err();
        assert!(matches!(err, ConvertError::OverfullMeasure { measure: 1, .. }));
    }

    #[test]
    fn test_default_mode_clamps_with_diagnostic() {
        let mei = musicxml_to_mei(OVERFULL, &ConvertOptions::default()).unwrap();
        assert!(mei.contains("overfull-measure"));
    }

    #[test]
    fn test_source_metadata_survives_into_target() {
        let options = ConvertOptions {
            source_metadata: true,
            ..ConvertOptions::default()
        };
        let mei = musicxml_to_mei(SOURCE, &options).unwrap();
        let score = read_mei(&mei).unwrap();
        let recovered = embedded_source(&score).unwrap();
        assert_eq!(recovered, SOURCE.as_bytes());
    }

    #[test]
    fn test_archive_round_trip() {
        let options = ConvertOptions::default();
        let bytes = musicxml_to_archive(SOURCE, "piece.mscx", &options).unwrap();
        let back = archive_to_musicxml(&bytes, &options).unwrap();
        assert!(back.contains("<step>C</step>"));
    }

    #[test]
    fn test_embedded_source_absent() {
        let score = read_musicxml(SOURCE).unwrap();
        assert!(embedded_source(&score).is_none());
    }
}
