//! On-disk frame encoding of one extent.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic "XTNT"
//! 4       4     record_count
//! 8       4     fixed_size          coded bytes before compression
//! 12      4     variable_size
//! 16      4     fixed_stored        bytes on disk
//! 20      4     variable_stored
//! 24      1     fixed_codec         0 = stored raw
//! 25      1     variable_codec
//! 26      2     type_name_len
//! 28      4     header_crc          crc32 of bytes 0..28
//! 32      n     type_name
//! ..      fs    fixed stored bytes
//! ..      vs    variable stored bytes
//! ..      4     fixed_stored_crc
//! ..      4     variable_stored_crc
//! ..      4     content_crc         crc32 of name ++ fixed coded ++ variable coded
//! ```
//!
//! The stored checksums are verified before anything is decompressed, so
//! a damaged frame is rejected without running a codec over it.

mod transform;

use std::sync::Arc;

use crate::codec::{self, Codec, CompressionConfig};
use crate::error::{ExtentError, Result};
use crate::extent::{read_u32, Extent};
use crate::schema::{ExtentSchema, TypeLibrary};

// ── Constants ───────────────────────────────────────────────────────

pub const FRAME_MAGIC: [u8; 4] = *b"XTNT";

/// Fixed-size part of the frame header, before the type name.
pub const FRAME_PREFIX_SIZE: usize = 32;

/// Three trailing checksums.
pub const FRAME_SUFFIX_SIZE: usize = 12;

// ── FrameHeader ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub record_count: u32,
    pub fixed_size: u32,
    pub variable_size: u32,
    pub fixed_stored: u32,
    pub variable_stored: u32,
    pub fixed_codec: Codec,
    pub variable_codec: Codec,
    pub type_name_len: u16,
    pub header_crc: u32,
}

impl FrameHeader {
    /// Parse and verify the 32-byte prefix.
    ///
    /// Fewer than 32 bytes is `Truncated`; a bad magic, checksum or codec
    /// id is `CorruptData`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_PREFIX_SIZE {
            return Err(ExtentError::Truncated(format!(
                "frame header needs {} bytes, {} available",
                FRAME_PREFIX_SIZE,
                bytes.len()
            )));
        }
        if bytes[0..4] != FRAME_MAGIC {
            return Err(ExtentError::CorruptData(format!(
                "bad frame magic {:02x?}",
                &bytes[0..4]
            )));
        }
        let header_crc = read_u32(bytes, 28);
        let actual = codec::checksum(&bytes[0..28]);
        if header_crc != actual {
            return Err(ExtentError::CorruptData(format!(
                "frame header checksum mismatch: stored {:08x}, computed {:08x}",
                header_crc, actual
            )));
        }
        Ok(Self {
            record_count: read_u32(bytes, 4),
            fixed_size: read_u32(bytes, 8),
            variable_size: read_u32(bytes, 12),
            fixed_stored: read_u32(bytes, 16),
            variable_stored: read_u32(bytes, 20),
            fixed_codec: Codec::from_u8(bytes[24])?,
            variable_codec: Codec::from_u8(bytes[25])?,
            type_name_len: u16::from_le_bytes([bytes[26], bytes[27]]),
            header_crc,
        })
    }

    /// Append the prefix (computing its checksum) to `out`.
    fn write_into(&mut self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&self.record_count.to_le_bytes());
        out.extend_from_slice(&self.fixed_size.to_le_bytes());
        out.extend_from_slice(&self.variable_size.to_le_bytes());
        out.extend_from_slice(&self.fixed_stored.to_le_bytes());
        out.extend_from_slice(&self.variable_stored.to_le_bytes());
        out.push(self.fixed_codec as u8);
        out.push(self.variable_codec as u8);
        out.extend_from_slice(&self.type_name_len.to_le_bytes());
        self.header_crc = codec::checksum(&out[start..start + 28]);
        out.extend_from_slice(&self.header_crc.to_le_bytes());
    }

    /// Total bytes of the frame this header starts.
    pub fn frame_len(&self) -> usize {
        FRAME_PREFIX_SIZE
            + self.type_name_len as usize
            + self.fixed_stored as usize
            + self.variable_stored as usize
            + FRAME_SUFFIX_SIZE
    }
}

fn to_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ExtentError::Usage(format!("{} of {} bytes exceeds the frame limit", what, len)))
}

// ── Pack ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PackedFrame {
    pub header: FrameHeader,
    pub bytes: Vec<u8>,
}

pub fn pack(extent: &Extent, config: &CompressionConfig) -> Result<PackedFrame> {
    let (fixed, variable) = transform::encode(extent);
    let name = extent.type_name().as_bytes();

    let (fixed_codec, fixed_stored) = codec::compress_best(&fixed, &config.fixed, config.level)?;
    let (variable_codec, variable_stored) =
        codec::compress_best(&variable, &config.variable, config.level)?;

    let mut content = crc32fast::Hasher::new();
    content.update(name);
    content.update(&fixed);
    content.update(&variable);
    let content_crc = content.finalize();

    let mut header = FrameHeader {
        record_count: to_u32(extent.row_count(), "record count")?,
        fixed_size: to_u32(fixed.len(), "fixed buffer")?,
        variable_size: to_u32(variable.len(), "variable buffer")?,
        fixed_stored: to_u32(fixed_stored.len(), "fixed buffer")?,
        variable_stored: to_u32(variable_stored.len(), "variable buffer")?,
        fixed_codec,
        variable_codec,
        type_name_len: u16::try_from(name.len())
            .map_err(|_| ExtentError::Usage("type name too long".into()))?,
        header_crc: 0,
    };

    let mut bytes = Vec::with_capacity(header.frame_len());
    header.write_into(&mut bytes);
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&fixed_stored);
    bytes.extend_from_slice(&variable_stored);
    bytes.extend_from_slice(&codec::checksum(&fixed_stored).to_le_bytes());
    bytes.extend_from_slice(&codec::checksum(&variable_stored).to_le_bytes());
    bytes.extend_from_slice(&content_crc.to_le_bytes());

    tracing::debug!(
        type_name = extent.type_name(),
        rows = extent.row_count(),
        raw = fixed.len() + variable.len(),
        packed = bytes.len(),
        fixed_codec = fixed_codec.as_str(),
        variable_codec = variable_codec.as_str(),
        "packed extent"
    );
    Ok(PackedFrame { header, bytes })
}

// ── Unpack ──────────────────────────────────────────────────────────

/// Decode the frame at the start of `bytes`, resolving its type name in
/// `library`. Trailing bytes after the frame are ignored.
pub fn unpack(bytes: &[u8], library: &TypeLibrary) -> Result<Extent> {
    unpack_with(bytes, |name| {
        library
            .get(name)
            .cloned()
            .ok_or_else(|| ExtentError::UnknownType(name.to_string()))
    })
}

pub fn unpack_with<F>(bytes: &[u8], resolve: F) -> Result<Extent>
where
    F: FnOnce(&str) -> Result<Arc<ExtentSchema>>,
{
    let header = FrameHeader::from_bytes(bytes)?;
    let total = header.frame_len();
    if bytes.len() < total {
        return Err(ExtentError::Truncated(format!(
            "frame declares {} bytes, {} available",
            total,
            bytes.len()
        )));
    }

    let name_end = FRAME_PREFIX_SIZE + header.type_name_len as usize;
    let fixed_end = name_end + header.fixed_stored as usize;
    let variable_end = fixed_end + header.variable_stored as usize;
    let name = &bytes[FRAME_PREFIX_SIZE..name_end];
    let fixed_stored = &bytes[name_end..fixed_end];
    let variable_stored = &bytes[fixed_end..variable_end];

    for (what, stored, at) in [
        ("fixed", fixed_stored, variable_end),
        ("variable", variable_stored, variable_end + 4),
    ] {
        let expected = read_u32(bytes, at);
        if codec::checksum(stored) != expected {
            return Err(ExtentError::CorruptData(format!(
                "{} buffer checksum mismatch",
                what
            )));
        }
    }

    let mut fixed = codec::decompress(fixed_stored, header.fixed_codec, header.fixed_size as usize)?;
    let variable = codec::decompress(
        variable_stored,
        header.variable_codec,
        header.variable_size as usize,
    )?;

    let mut content = crc32fast::Hasher::new();
    content.update(name);
    content.update(&fixed);
    content.update(&variable);
    if content.finalize() != read_u32(bytes, variable_end + 8) {
        return Err(ExtentError::CorruptData("frame content checksum mismatch".into()));
    }

    let name = std::str::from_utf8(name)
        .map_err(|_| ExtentError::CorruptData("type name is not UTF-8".into()))?;
    let schema = resolve(name)?;
    let expected_fixed = header.record_count as usize * schema.row_size();
    if fixed.len() != expected_fixed {
        return Err(ExtentError::CorruptData(format!(
            "'{}' frame holds {} fixed bytes for {} records of {} bytes",
            name,
            fixed.len(),
            header.record_count,
            schema.row_size()
        )));
    }

    transform::decode(&schema, &mut fixed);
    Extent::from_parts(schema, fixed, variable)
}

// ── Tests ───────────────────────────────────────────────────────────
