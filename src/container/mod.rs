//! Minimal ZIP container codec
//!
//! Reads and writes the compressed wrappers (`.mxl`, `.mscz`) around score
//! XML. Only what those archives need is implemented: stored and deflated
//! entries, CRC-32, and the end-of-central-directory walk. Structural
//! violations raise a distinct `ArchiveError` instead of partial data.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use crate::errors::ArchiveError;

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

/// EOCD record size plus the largest possible trailing comment
const EOCD_SCAN_LIMIT: usize = 22 + u16::MAX as usize;

/// General-purpose flag bit 11: name is UTF-8
const FLAG_UTF8: u16 = 1 << 11;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

/// One file in the archive, located and cross-validated against its
/// local header
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipEntry {
    pub name: String,
    pub method: u16,
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub crc32: u32,
    /// Offset of the entry's payload, past the local header
    pub data_offset: usize,
}

fn u16_at(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_le_bytes(raw))
}

fn u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// The EOCD record is 22 bytes plus a comment of up to 65,535, so its
/// signature must sit within the final 65,557 bytes
fn find_eocd(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 22 {
        return None;
    }
    let floor = bytes.len().saturating_sub(EOCD_SCAN_LIMIT);
    let mut pos = bytes.len() - 22;
    loop {
        if u32_at(bytes, pos) == Some(EOCD_SIG) {
            return Some(pos);
        }
        if pos == floor {
            return None;
        }
        pos -= 1;
    }
}

/// Walk the central directory and return every file entry.
///
/// Names are decoded as UTF-8 when flag bit 11 is set, byte-for-byte
/// otherwise. Directory entries (trailing `/`) are excluded.
pub fn read_entries(bytes: &[u8]) -> Result<Vec<ZipEntry>, ArchiveError> {
    let eocd = find_eocd(bytes).ok_or(ArchiveError::MissingEndOfCentralDirectory)?;
    let count = u16_at(bytes, eocd + 10).unwrap_or(0) as usize;
    let size = u32_at(bytes, eocd + 12).unwrap_or(0) as usize;
    let offset = u32_at(bytes, eocd + 16).unwrap_or(0) as usize;
    if offset.checked_add(size).map_or(true, |end| end > bytes.len()) {
        return Err(ArchiveError::CentralDirectoryOutOfRange {
            offset,
            size,
            archive_len: bytes.len(),
        });
    }

    let mut entries = Vec::with_capacity(count);
    let mut pos = offset;
    for index in 0..count {
        if u32_at(bytes, pos) != Some(CENTRAL_SIG) {
            return Err(ArchiveError::BadCentralSignature { index });
        }
        let bad = || ArchiveError::BadCentralSignature { index };
        let flags = u16_at(bytes, pos + 8).ok_or_else(bad)?;
        let method = u16_at(bytes, pos + 10).ok_or_else(bad)?;
        let crc32 = u32_at(bytes, pos + 16).ok_or_else(bad)?;
        let compressed_size = u32_at(bytes, pos + 20).ok_or_else(bad)? as usize;
        let uncompressed_size = u32_at(bytes, pos + 24).ok_or_else(bad)? as usize;
        let name_len = u16_at(bytes, pos + 28).ok_or_else(bad)? as usize;
        let extra_len = u16_at(bytes, pos + 30).ok_or_else(bad)? as usize;
        let comment_len = u16_at(bytes, pos + 32).ok_or_else(bad)? as usize;
        let header_offset = u32_at(bytes, pos + 42).ok_or_else(bad)? as usize;
        let name_bytes = bytes.get(pos + 46..pos + 46 + name_len).ok_or_else(bad)?;
        let name = if flags & FLAG_UTF8 != 0 {
            String::from_utf8_lossy(name_bytes).into_owned()
        } else {
            name_bytes.iter().map(|&b| b as char).collect()
        };
        pos += 46 + name_len + extra_len + comment_len;
        if name.ends_with('/') {
            continue;
        }
        let data_offset = local_data_offset(bytes, header_offset, &name)?;
        entries.push(ZipEntry {
            name,
            method,
            compressed_size,
            uncompressed_size,
            crc32,
            data_offset,
        });
    }
    Ok(entries)
}

/// Cross-validate the local header a central record points at; the data
/// starts past the local header's own name and extra fields
fn local_data_offset(
    bytes: &[u8],
    header_offset: usize,
    name: &str,
) -> Result<usize, ArchiveError> {
    let miss = || ArchiveError::MissingLocalHeader {
        name: name.to_string(),
    };
    if u32_at(bytes, header_offset) != Some(LOCAL_SIG) {
        return Err(miss());
    }
    let name_len = u16_at(bytes, header_offset + 26).ok_or_else(miss)? as usize;
    let extra_len = u16_at(bytes, header_offset + 28).ok_or_else(miss)? as usize;
    Ok(header_offset + 30 + name_len + extra_len)
}

/// Payload of one entry: the raw slice for method 0, inflated bytes for
/// method 8, a hard failure for anything else
pub fn extract(bytes: &[u8], entry: &ZipEntry) -> Result<Vec<u8>, ArchiveError> {
    let data = entry
        .data_offset
        .checked_add(entry.compressed_size)
        .and_then(|end| bytes.get(entry.data_offset..end))
        .ok_or_else(|| ArchiveError::TruncatedEntry {
            name: entry.name.clone(),
            offset: entry.data_offset,
            needed: entry.compressed_size,
            archive_len: bytes.len(),
        })?;
    match entry.method {
        METHOD_STORED => Ok(data.to_vec()),
        METHOD_DEFLATED => {
            let mut out = Vec::with_capacity(entry.uncompressed_size);
            DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Inflate {
                    name: entry.name.clone(),
                    detail: e.to_string(),
                })?;
            Ok(out)
        }
        method => Err(ArchiveError::UnsupportedMethod {
            name: entry.name.clone(),
            method,
        }),
    }
}

/// Extract the entry with exactly this path
pub fn extract_by_path(bytes: &[u8], path: &str) -> Result<Vec<u8>, ArchiveError> {
    let entries = read_entries(bytes)?;
    let entry = entries
        .iter()
        .find(|e| e.name == path)
        .ok_or_else(|| ArchiveError::MemberNotFound {
            name: path.to_string(),
        })?;
    extract(bytes, entry)
}

/// Extensions the score-payload fallback accepts
const SCORE_EXTENSIONS: &[&str] = &[".xml", ".musicxml", ".mei", ".mscx"];

/// Locate and extract the score payload of an `.mxl`/`.mscz` archive.
///
/// Prefers the rootfile named by `META-INF/container.xml`; otherwise the
/// first entry outside `META-INF/` with a score extension wins. Returns
/// the entry name with the payload so callers can dispatch on it.
pub fn extract_score(bytes: &[u8]) -> Result<(String, Vec<u8>), ArchiveError> {
    let entries = read_entries(bytes)?;
    if let Some(manifest) = entries.iter().find(|e| e.name == "META-INF/container.xml") {
        let xml = extract(bytes, manifest)?;
        if let Some(path) = rootfile_path(&xml) {
            if let Some(entry) = entries.iter().find(|e| e.name == path) {
                return Ok((entry.name.clone(), extract(bytes, entry)?));
            }
        }
    }
    let entry = entries
        .iter()
        .filter(|e| !e.name.starts_with("META-INF/"))
        .find(|e| {
            let lower = e.name.to_ascii_lowercase();
            SCORE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
        })
        .ok_or_else(|| ArchiveError::MemberNotFound {
            name: "score payload".to_string(),
        })?;
    Ok((entry.name.clone(), extract(bytes, entry)?))
}

/// First `rootfile full-path` in a container manifest
fn rootfile_path(container_xml: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(container_xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"rootfile" {
                    let path = e
                        .attributes()
                        .filter_map(|a| a.ok())
                        .find(|a| a.key.as_ref() == b"full-path")
                        .and_then(|a| String::from_utf8(a.value.to_vec()).ok());
                    if path.is_some() {
                        return path;
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// In-memory archive writer. Entries go in one at a time; `finish`
/// appends the central directory and EOCD record. Timestamps are zeroed
/// so identical input produces identical bytes.
pub struct ArchiveBuilder {
    data: Vec<u8>,
    central: Vec<u8>,
    count: u16,
}

impl ArchiveBuilder {
    pub fn new() -> ArchiveBuilder {
        ArchiveBuilder {
            data: Vec::new(),
            central: Vec::new(),
            count: 0,
        }
    }

    /// Add an entry with its payload copied as-is
    pub fn add_stored(&mut self, name: &str, payload: &[u8]) -> &mut Self {
        self.push_entry(name, payload, METHOD_STORED, payload)
    }

    /// Add an entry compressed with raw deflate. Falls back to stored
    /// when deflate does not shrink the payload.
    pub fn add_deflated(&mut self, name: &str, payload: &[u8]) -> &mut Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        match encoder.write_all(payload).and_then(|_| encoder.finish()) {
            Ok(compressed) if compressed.len() < payload.len() => {
                self.push_entry(name, payload, METHOD_DEFLATED, &compressed)
            }
            _ => self.push_entry(name, payload, METHOD_STORED, payload),
        }
    }

    fn push_entry(&mut self, name: &str, payload: &[u8], method: u16, data: &[u8]) -> &mut Self {
        let mut crc = Crc::new();
        crc.update(payload);
        let crc32 = crc.sum();
        let flags = if name.is_ascii() { 0 } else { FLAG_UTF8 };
        let header_offset = self.data.len() as u32;

        push_u32(&mut self.data, LOCAL_SIG);
        push_u16(&mut self.data, 20);
        push_u16(&mut self.data, flags);
        push_u16(&mut self.data, method);
        push_u16(&mut self.data, 0);
        push_u16(&mut self.data, 0);
        push_u32(&mut self.data, crc32);
        push_u32(&mut self.data, data.len() as u32);
        push_u32(&mut self.data, payload.len() as u32);
        push_u16(&mut self.data, name.len() as u16);
        push_u16(&mut self.data, 0);
        self.data.extend_from_slice(name.as_bytes());
        self.data.extend_from_slice(data);

        push_u32(&mut self.central, CENTRAL_SIG);
        push_u16(&mut self.central, 20);
        push_u16(&mut self.central, 20);
        push_u16(&mut self.central, flags);
        push_u16(&mut self.central, method);
        push_u16(&mut self.central, 0);
        push_u16(&mut self.central, 0);
        push_u32(&mut self.central, crc32);
        push_u32(&mut self.central, data.len() as u32);
        push_u32(&mut self.central, payload.len() as u32);
        push_u16(&mut self.central, name.len() as u16);
        push_u16(&mut self.central, 0);
        push_u16(&mut self.central, 0);
        push_u16(&mut self.central, 0);
        push_u16(&mut self.central, 0);
        push_u32(&mut self.central, 0);
        push_u32(&mut self.central, header_offset);
        self.central.extend_from_slice(name.as_bytes());

        self.count += 1;
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = self.data;
        let cd_offset = out.len() as u32;
        out.extend_from_slice(&self.central);
        push_u32(&mut out, EOCD_SIG);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, self.count);
        push_u16(&mut out, self.count);
        push_u32(&mut out, self.central.len() as u32);
        push_u32(&mut out, cd_offset);
        push_u16(&mut out, 0);
        out
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        ArchiveBuilder::new()
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Wrap one score document in an archive with its container manifest,
/// the layout `.mxl` and `.mscz` share
pub fn wrap_score(score_path: &str, text: &str) -> Vec<u8> {
    let manifest = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <container>\n  <rootfiles>\n    <rootfile full-path=\"{score_path}\"/>\n  \
         </rootfiles>\n</container>\n"
    );
    let mut builder = ArchiveBuilder::new();
    builder.add_stored("META-INF/container.xml", manifest.as_bytes());
    builder.add_deflated(score_path, text.as_bytes());
    builder.finish()
}
