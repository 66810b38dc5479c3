//! Pivot format codec
//!
//! Partwise MusicXML is the hub representation every converter reads from
//! and writes to. The reader walks the DOM into [`crate::models::Score`];
//! the writer serializes a score back to document text.

pub mod reader;
pub mod writer;

pub use reader::read_musicxml;
pub use writer::write_musicxml;
