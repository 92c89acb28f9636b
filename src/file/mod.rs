//! Extent file container.
//!
//! ```text
//! [file header 32B][type library block][frame]...[index frame][trailer 32B]
//! ```
//!
//! File header:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic "EXDB"
//! 4       4     check u32 0x12345678   (reads byte-swapped on a foreign-endian file)
//! 8       2     version
//! 10      2     reserved
//! 12      8     check i64 0x123456789ABCDEF0
//! 20      8     check f64 pi
//! 28      4     crc32 of bytes 0..28
//! ```
//!
//! Type library block: `[u32 len][schema text]...`, a `u32::MAX`
//! sentinel, then the crc32 of everything before it in the block.
//!
//! Trailer:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic "XEND"
//! 4       4     index frame size
//! 8       4     !index frame size
//! 12      4     chained crc32 over every data frame's header crc
//! 16      8     index frame offset
//! 24      4     reserved
//! 28      4     crc32 of bytes 0..28
//! ```

mod recover;
mod sink;
mod source;

pub use recover::{recover, RecoverConfig, RecoveryReport};
pub use sink::{FileSink, SinkStats, WriteCallback};
pub use source::FileSource;

use std::sync::Arc;

use serde::Serialize;

use crate::codec::{self, Codec};
use crate::error::{ExtentError, Result};
use crate::extent::{
    read_u32, read_u64, ByteField, Extent, ExtentSeries, Int32Field, Int64Field, Variable32Field,
};
use crate::frame::FrameHeader;
use crate::schema::{ExtentSchema, TypeLibrary, TypeRegistry};

// ── Constants ───────────────────────────────────────────────────────

pub const FILE_MAGIC: [u8; 4] = *b"EXDB";
pub const FILE_VERSION: u16 = 1;
pub const FILE_HEADER_SIZE: usize = 32;

pub const TRAILER_MAGIC: [u8; 4] = *b"XEND";
pub const TRAILER_SIZE: usize = 32;

const CHECK_U32: u32 = 0x1234_5678;
const CHECK_I64: i64 = 0x1234_5678_9ABC_DEF0;
const CHECK_F64: f64 = std::f64::consts::PI;

const LIBRARY_SENTINEL: u32 = u32::MAX;

// ── File header ─────────────────────────────────────────────────────

pub(crate) fn encode_file_header() -> [u8; FILE_HEADER_SIZE] {
    let mut out = [0u8; FILE_HEADER_SIZE];
    out[0..4].copy_from_slice(&FILE_MAGIC);
    out[4..8].copy_from_slice(&CHECK_U32.to_le_bytes());
    out[8..10].copy_from_slice(&FILE_VERSION.to_le_bytes());
    out[12..20].copy_from_slice(&CHECK_I64.to_le_bytes());
    out[20..28].copy_from_slice(&CHECK_F64.to_le_bytes());
    let crc = codec::checksum(&out[0..28]);
    out[28..32].copy_from_slice(&crc.to_le_bytes());
    out
}

pub(crate) fn check_file_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < FILE_HEADER_SIZE {
        return Err(ExtentError::InvalidFormat(format!(
            "file is {} bytes, shorter than its header",
            bytes.len()
        )));
    }
    if bytes[0..4] != FILE_MAGIC {
        return Err(ExtentError::InvalidFormat("not an extent file (bad magic)".into()));
    }
    let check = read_u32(bytes, 4);
    if check == CHECK_U32.swap_bytes() {
        return Err(ExtentError::InvalidFormat(
            "file was written with the opposite byte order".into(),
        ));
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version != FILE_VERSION {
        return Err(ExtentError::InvalidFormat(format!(
            "unsupported file version {}",
            version
        )));
    }
    if check != CHECK_U32
        || read_u64(bytes, 12) as i64 != CHECK_I64
        || f64::from_bits(read_u64(bytes, 20)) != CHECK_F64
        || read_u32(bytes, 28) != codec::checksum(&bytes[0..28])
    {
        return Err(ExtentError::InvalidFormat("corrupt file header".into()));
    }
    Ok(())
}

// ── Type library block ──────────────────────────────────────────────

pub(crate) fn encode_type_library<'a, I>(schemas: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Arc<ExtentSchema>>,
{
    let mut out = Vec::new();
    for schema in schemas {
        let text = schema.text().as_bytes();
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.extend_from_slice(text);
    }
    out.extend_from_slice(&LIBRARY_SENTINEL.to_le_bytes());
    let crc = codec::checksum(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Parse the type library block at the start of `bytes`. Returns the
/// library (always holding the index type) and the block length.
pub(crate) fn decode_type_library(
    bytes: &[u8],
    registry: &TypeRegistry,
) -> Result<(TypeLibrary, usize)> {
    let short = || ExtentError::Truncated("type library block is incomplete".into());
    let mut pos = 0usize;
    let mut texts = Vec::new();
    loop {
        if pos + 4 > bytes.len() {
            return Err(short());
        }
        let len = read_u32(bytes, pos);
        pos += 4;
        if len == LIBRARY_SENTINEL {
            break;
        }
        let end = pos + len as usize;
        if end > bytes.len() {
            return Err(short());
        }
        texts.push(&bytes[pos..end]);
        pos = end;
    }
    if pos + 4 > bytes.len() {
        return Err(short());
    }
    if read_u32(bytes, pos) != codec::checksum(&bytes[..pos]) {
        return Err(ExtentError::CorruptData("type library checksum mismatch".into()));
    }

    let mut library = TypeLibrary::new();
    library.add(Arc::clone(registry.index_schema()))?;
    for text in texts {
        let text = std::str::from_utf8(text)
            .map_err(|_| ExtentError::CorruptData("schema text is not UTF-8".into()))?;
        library.add(registry.register(text)?)?;
    }
    Ok((library, pos + 4))
}

// ── Trailer ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Trailer {
    pub index_size: u32,
    pub chained_checksum: u32,
    pub index_offset: u64,
}

impl Trailer {
    pub(crate) fn to_bytes(self) -> [u8; TRAILER_SIZE] {
        let mut out = [0u8; TRAILER_SIZE];
        out[0..4].copy_from_slice(&TRAILER_MAGIC);
        out[4..8].copy_from_slice(&self.index_size.to_le_bytes());
        out[8..12].copy_from_slice(&(!self.index_size).to_le_bytes());
        out[12..16].copy_from_slice(&self.chained_checksum.to_le_bytes());
        out[16..24].copy_from_slice(&self.index_offset.to_le_bytes());
        let crc = codec::checksum(&out[0..28]);
        out[28..32].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// True when `bytes` starts with the trailer magic; an unclosed file
    /// ends in frame data instead.
    pub(crate) fn is_present(bytes: &[u8]) -> bool {
        bytes.len() >= TRAILER_SIZE && bytes[0..4] == TRAILER_MAGIC
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TRAILER_SIZE || bytes[0..4] != TRAILER_MAGIC {
            return Err(ExtentError::CorruptTrailer("end-of-file marker missing".into()));
        }
        if read_u32(bytes, 28) != codec::checksum(&bytes[0..28]) {
            return Err(ExtentError::CorruptTrailer("trailer checksum mismatch".into()));
        }
        let index_size = read_u32(bytes, 4);
        if read_u32(bytes, 8) != !index_size {
            return Err(ExtentError::CorruptTrailer("trailer size check mismatch".into()));
        }
        Ok(Self {
            index_size,
            chained_checksum: read_u32(bytes, 12),
            index_offset: read_u64(bytes, 16),
        })
    }

    /// Check that the trailer describes a file of `file_len` bytes whose
    /// data starts at `data_start`.
    pub(crate) fn check_bounds(&self, data_start: u64, file_len: u64) -> Result<()> {
        let end = self.index_offset + self.index_size as u64 + TRAILER_SIZE as u64;
        if self.index_offset < data_start || end != file_len {
            return Err(ExtentError::CorruptTrailer(format!(
                "index at {} (+{}) does not fit a {}-byte file",
                self.index_offset, self.index_size, file_len
            )));
        }
        Ok(())
    }
}

// ── Index ───────────────────────────────────────────────────────────

/// One row of the trailing index extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub offset: u64,
    pub frame_size: u32,
    pub records: u32,
    pub type_name: String,
    pub fixed_codec: Codec,
    pub fixed_stored: u32,
    pub variable_codec: Codec,
    pub variable_stored: u32,
}

impl IndexEntry {
    pub(crate) fn from_frame(offset: u64, type_name: &str, header: &FrameHeader) -> Self {
        Self {
            offset,
            frame_size: header.frame_len() as u32,
            records: header.record_count,
            type_name: type_name.to_string(),
            fixed_codec: header.fixed_codec,
            fixed_stored: header.fixed_stored,
            variable_codec: header.variable_codec,
            variable_stored: header.variable_stored,
        }
    }
}

struct IndexFields {
    offset: Int64Field,
    frame_size: Int32Field,
    records: Int32Field,
    extent_type: Variable32Field,
    fixed_codec: ByteField,
    fixed_stored: Int32Field,
    variable_codec: ByteField,
    variable_stored: Int32Field,
}

impl IndexFields {
    fn bind(schema: &Arc<ExtentSchema>) -> Result<Self> {
        Ok(Self {
            offset: Int64Field::bound(schema, "offset")?,
            frame_size: Int32Field::bound(schema, "frame_size")?,
            records: Int32Field::bound(schema, "records")?,
            extent_type: Variable32Field::bound(schema, "extenttype")?,
            fixed_codec: ByteField::bound(schema, "fixed_codec")?,
            fixed_stored: Int32Field::bound(schema, "fixed_stored_size")?,
            variable_codec: ByteField::bound(schema, "variable_codec")?,
            variable_stored: Int32Field::bound(schema, "variable_stored_size")?,
        })
    }
}

pub(crate) fn build_index_extent(schema: &Arc<ExtentSchema>, entries: &[IndexEntry]) -> Result<Extent> {
    let fields = IndexFields::bind(schema)?;
    let mut series = ExtentSeries::for_schema(Arc::clone(schema));
    for entry in entries {
        series.new_row();
        fields.offset.set(&mut series, entry.offset as i64);
        fields.frame_size.set(&mut series, entry.frame_size as i32);
        fields.records.set(&mut series, entry.records as i32);
        fields.extent_type.set(&mut series, entry.type_name.as_bytes());
        fields.fixed_codec.set(&mut series, entry.fixed_codec as u8);
        fields.fixed_stored.set(&mut series, entry.fixed_stored as i32);
        fields.variable_codec.set(&mut series, entry.variable_codec as u8);
        fields.variable_stored.set(&mut series, entry.variable_stored as i32);
    }
    series
        .take_extent()
        .ok_or_else(|| ExtentError::Usage("index series lost its extent".into()))
}

pub fn read_index_entries(extent: &Extent) -> Result<Vec<IndexEntry>> {
    let fields = IndexFields::bind(extent.schema())?;
    let mut series = ExtentSeries::with_extent(extent.clone());
    let mut entries = Vec::with_capacity(extent.row_count());
    while series.more() {
        let type_name = std::str::from_utf8(fields.extent_type.get(&series))
            .map_err(|_| ExtentError::CorruptData("index type name is not UTF-8".into()))?;
        entries.push(IndexEntry {
            offset: fields.offset.get(&series) as u64,
            frame_size: fields.frame_size.get(&series) as u32,
            records: fields.records.get(&series) as u32,
            type_name: type_name.to_string(),
            fixed_codec: Codec::from_u8(fields.fixed_codec.get(&series))?,
            fixed_stored: fields.fixed_stored.get(&series) as u32,
            variable_codec: Codec::from_u8(fields.variable_codec.get(&series))?,
            variable_stored: fields.variable_stored.get(&series) as u32,
        });
        series.next_row();
    }
    Ok(entries)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_checks() {
        let header = encode_file_header();
        check_file_header(&header).unwrap();

        let mut swapped = header;
        swapped[4..8].copy_from_slice(&CHECK_U32.to_be_bytes());
        let err = check_file_header(&swapped).unwrap_err();
        assert!(matches!(err, ExtentError::InvalidFormat(ref m) if m.contains("byte order")));

        let mut damaged = header;
        damaged[22] ^= 1;
        assert!(check_file_header(&damaged).is_err());
        assert!(check_file_header(&header[..20]).is_err());
        assert!(check_file_header(b"PK\x03\x04 definitely not ours, padding...").is_err());
    }

    #[test]
    fn test_type_library_block() {
        let registry = TypeRegistry::new();
        let a = registry
            .register("<ExtentType name=\"A\"><field type=\"byte\" name=\"x\"/></ExtentType>")
            .unwrap();
        let block = encode_type_library([&a]);
        let (library, used) = decode_type_library(&block, &registry).unwrap();
        assert_eq!(used, block.len());
        assert!(library.contains(&a));
        assert!(library.get(crate::schema::INDEX_TYPE_NAME).is_some());

        assert!(matches!(
            decode_type_library(&block[..block.len() - 2], &registry),
            Err(ExtentError::Truncated(_))
        ));
        let mut damaged = block.clone();
        damaged[10] ^= 0x20;
        assert!(matches!(
            decode_type_library(&damaged, &registry),
            Err(ExtentError::CorruptData(_))
        ));
    }

    #[test]
    fn test_trailer_roundtrip_and_damage() {
        let trailer = Trailer {
            index_size: 120,
            chained_checksum: 0xDEAD_BEEF,
            index_offset: 4096,
        };
        let bytes = trailer.to_bytes();
        assert!(Trailer::is_present(&bytes));
        assert_eq!(Trailer::from_bytes(&bytes).unwrap(), trailer);
        trailer.check_bounds(64, 4096 + 120 + 32).unwrap();
        assert!(trailer.check_bounds(64, 9999).is_err());

        for i in 4..TRAILER_SIZE {
            let mut damaged = bytes;
            damaged[i] ^= 0x01;
            assert!(matches!(
                Trailer::from_bytes(&damaged),
                Err(ExtentError::CorruptTrailer(_))
            ));
        }
    }

    #[test]
    fn test_index_extent_entries() {
        let registry = TypeRegistry::new();
        let entries: Vec<IndexEntry> = (0..5u32)
            .map(|i| IndexEntry {
                offset: 100 + i as u64 * 50,
                frame_size: 50,
                records: i,
                type_name: if i % 2 == 0 { "A".into() } else { "B".into() },
                fixed_codec: Codec::Lz4,
                fixed_stored: 10,
                variable_codec: Codec::None,
                variable_stored: 4,
            })
            .collect();
        let extent = build_index_extent(registry.index_schema(), &entries).unwrap();
        assert_eq!(read_index_entries(&extent).unwrap(), entries);
    }
}
