//! WASM API for score conversion
//!
//! The JavaScript-facing surface: one function per conversion direction,
//! plus the archive helpers. All functions are stateless; the host passes
//! document text (or archive bytes) in and gets the converted document
//! back. Options arrive as a plain JS object matching
//! [`crate::options::ConvertOptions`]; `undefined`/`null` means defaults.
//! Failures come back as `JsValue` strings carrying the error display.

pub mod helpers;

use wasm_bindgen::prelude::*;

use crate::container;
use crate::convert;
use crate::options::ConvertOptions;
use crate::{wasm_info, wasm_log};

fn parse_options(options: JsValue) -> Result<ConvertOptions, JsValue> {
    if options.is_undefined() || options.is_null() {
        return Ok(ConvertOptions::default());
    }
    helpers::deserialize(options, "invalid conversion options")
}

/// Convert pivot MusicXML text to an MEI document
#[wasm_bindgen(js_name = convertMusicXmlToMei)]
pub fn convert_musicxml_to_mei(source: &str, options: JsValue) -> Result<String, JsValue> {
    wasm_info!("convertMusicXmlToMei called: {} bytes", source.len());
    let options = parse_options(options)?;
    let out = convert::musicxml_to_mei(source, &options)
        .map_err(|e| helpers::js_error("MEI export failed", e))?;
    wasm_log!("  MEI generated: {} bytes", out.len());
    Ok(out)
}

/// Convert an MEI document to pivot MusicXML text
#[wasm_bindgen(js_name = convertMeiToMusicXml)]
pub fn convert_mei_to_musicxml(source: &str, options: JsValue) -> Result<String, JsValue> {
    wasm_info!("convertMeiToMusicXml called: {} bytes", source.len());
    let options = parse_options(options)?;
    let out = convert::mei_to_musicxml(source, &options)
        .map_err(|e| helpers::js_error("MEI import failed", e))?;
    wasm_log!("  MusicXML generated: {} bytes", out.len());
    Ok(out)
}

/// Convert pivot MusicXML text to a MuseScore project
#[wasm_bindgen(js_name = convertMusicXmlToMuseScore)]
pub fn convert_musicxml_to_musescore(source: &str, options: JsValue) -> Result<String, JsValue> {
    wasm_info!("convertMusicXmlToMuseScore called: {} bytes", source.len());
    let options = parse_options(options)?;
    let out = convert::musicxml_to_musescore(source, &options)
        .map_err(|e| helpers::js_error("MuseScore export failed", e))?;
    wasm_log!("  MuseScore project generated: {} bytes", out.len());
    Ok(out)
}

/// Convert a MuseScore project to pivot MusicXML text
#[wasm_bindgen(js_name = convertMuseScoreToMusicXml)]
pub fn convert_musescore_to_musicxml(source: &str, options: JsValue) -> Result<String, JsValue> {
    wasm_info!("convertMuseScoreToMusicXml called: {} bytes", source.len());
    let options = parse_options(options)?;
    let out = convert::musescore_to_musicxml(source, &options)
        .map_err(|e| helpers::js_error("MuseScore import failed", e))?;
    wasm_log!("  MusicXML generated: {} bytes", out.len());
    Ok(out)
}

/// Re-serialize pivot MusicXML, applying measure normalization
#[wasm_bindgen(js_name = normalizeMusicXml)]
pub fn normalize_musicxml(source: &str, options: JsValue) -> Result<String, JsValue> {
    wasm_info!("normalizeMusicXml called: {} bytes", source.len());
    let options = parse_options(options)?;
    convert::normalize_musicxml(source, &options)
        .map_err(|e| helpers::js_error("normalization failed", e))
}

/// Unwrap an `.mxl`/`.mscz` archive and convert its payload to pivot text
#[wasm_bindgen(js_name = convertArchiveToMusicXml)]
pub fn convert_archive_to_musicxml(bytes: &[u8], options: JsValue) -> Result<String, JsValue> {
    wasm_info!("convertArchiveToMusicXml called: {} bytes", bytes.len());
    let options = parse_options(options)?;
    convert::archive_to_musicxml(bytes, &options)
        .map_err(|e| helpers::js_error("archive conversion failed", e))
}

/// Convert pivot text and wrap the result in a compressed archive.
/// `score_path` picks the target format by extension and names the
/// payload inside the archive.
#[wasm_bindgen(js_name = convertMusicXmlToArchive)]
pub fn convert_musicxml_to_archive(
    source: &str,
    score_path: &str,
    options: JsValue,
) -> Result<Vec<u8>, JsValue> {
    wasm_info!("convertMusicXmlToArchive called: payload '{}'", score_path);
    let options = parse_options(options)?;
    convert::musicxml_to_archive(source, score_path, &options)
        .map_err(|e| helpers::js_error("archive build failed", e))
}

/// List the file entries of an archive
#[wasm_bindgen(js_name = archiveEntries)]
pub fn archive_entries(bytes: &[u8]) -> Result<JsValue, JsValue> {
    let entries = container::read_entries(bytes)
        .map_err(|e| helpers::js_error("archive read failed", e))?;
    helpers::serialize(&entries, "archive entry serialization failed")
}

/// Extract one archive entry by its exact path
#[wasm_bindgen(js_name = extractArchiveEntry)]
pub fn extract_archive_entry(bytes: &[u8], path: &str) -> Result<Vec<u8>, JsValue> {
    container::extract_by_path(bytes, path)
        .map_err(|e| helpers::js_error("archive extraction failed", e))
}

/// Recover the verbatim source document embedded in pivot text by an
/// earlier conversion with `sourceMetadata` set, if any
#[wasm_bindgen(js_name = extractEmbeddedSource)]
pub fn extract_embedded_source(source: &str) -> Result<Option<Vec<u8>>, JsValue> {
    let score = crate::musicxml::read_musicxml(source)
        .map_err(|e| helpers::js_error("MusicXML parse failed", e))?;
    Ok(convert::embedded_source(&score))
}
