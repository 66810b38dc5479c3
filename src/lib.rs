//! Score conversion WASM module
//!
//! Converts symbolic-music scores among partwise MusicXML (the pivot
//! representation), MEI and MuseScore projects, and reads/writes the
//! compressed `.mxl`/`.mscz` containers around them. The JavaScript-facing
//! surface lives in [`api`]; everything else is plain Rust usable from
//! native code and tests.

pub mod api;
pub mod beaming;
pub mod container;
pub mod convert;
pub mod converters;
pub mod diagnostics;
pub mod errors;
pub mod key_estimate;
pub mod metadata;
pub mod models;
pub mod musicxml;
pub mod options;
pub mod rhythm;
pub mod spelling;
pub mod xml;

// Re-export the types most callers need
pub use convert::{
    archive_to_musicxml, mei_to_musicxml, musescore_to_musicxml, musicxml_to_archive,
    musicxml_to_mei, musicxml_to_musescore, normalize_musicxml,
};
pub use diagnostics::{Diagnostic, DiagnosticAction, DiagnosticKind};
pub use errors::{ArchiveError, ConvertError, ConvertResult};
pub use options::ConvertOptions;

use wasm_bindgen::prelude::*;

// This is like the `main` function, but for WASM modules.
#[wasm_bindgen(start)]
pub fn main() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log::Level::Debug).expect("failed to initialize logger");

    log::info!("score conversion WASM module initialized");
}
