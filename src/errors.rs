//! Error types for score conversion
//!
//! Defines the failure taxonomy: structural parse failures and archive
//! violations are fatal to a conversion call; everything recoverable goes
//! through the diagnostics channel instead (see `diagnostics`).

use thiserror::Error;

/// Result alias used by all converter entry points
pub type ConvertResult<T> = Result<T, ConvertError>;

/// Top-level conversion error type
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// Source text is not well-formed XML
    #[error("XML parsing failed: {0}")]
    MalformedXml(String),

    /// Well-formed XML but not a document this converter accepts
    #[error("unsupported document root <{0}>")]
    UnsupportedRoot(String),

    /// Required structural element is missing
    #[error("missing required element: {0}")]
    MissingElement(String),

    /// An element or attribute carried a value we cannot interpret
    #[error("invalid value '{value}' for {element}: {reason}")]
    InvalidValue {
        element: String,
        value: String,
        reason: String,
    },

    /// Overfull measure under strict mode (`fail_on_overfull_drop`).
    /// The default policy clamps and diagnoses instead of failing.
    #[error(
        "measure {measure}, staff {staff}, voice {voice}: \
         content occupies {occupied} ticks but capacity is {capacity}"
    )]
    OverfullMeasure {
        measure: u32,
        staff: u32,
        voice: u32,
        occupied: i64,
        capacity: i64,
    },

    /// Container-level failure
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Structural violations raised by the ZIP container codec.
///
/// Each variant names the exact violation so callers can tell a truncated
/// download from a file that was never an archive.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// No end-of-central-directory record in the final 65,557 bytes
    #[error("end of central directory record not found")]
    MissingEndOfCentralDirectory,

    /// EOCD points at a central directory outside the buffer
    #[error("central directory at offset {offset} (size {size}) exceeds archive of {archive_len} bytes")]
    CentralDirectoryOutOfRange {
        offset: usize,
        size: usize,
        archive_len: usize,
    },

    /// A central directory record did not start with its signature
    #[error("bad central directory signature for entry #{index}")]
    BadCentralSignature { index: usize },

    /// The local header an entry points at is missing or malformed
    #[error("missing or malformed local file header for entry '{name}'")]
    MissingLocalHeader { name: String },

    /// Entry data extends past the end of the buffer
    #[error("entry '{name}' is truncated: needs {needed} bytes at offset {offset}, archive has {archive_len}")]
    TruncatedEntry {
        name: String,
        offset: usize,
        needed: usize,
        archive_len: usize,
    },

    /// Compression method other than stored (0) or deflate (8)
    #[error("entry '{name}' uses unsupported compression method {method}")]
    UnsupportedMethod { name: String, method: u16 },

    /// Raw-deflate stream failed to inflate
    #[error("entry '{name}' failed to inflate: {detail}")]
    Inflate { name: String, detail: String },

    /// Lookup by path or extension found nothing
    #[error("archive has no entry matching '{name}'")]
    MemberNotFound { name: String },
}
