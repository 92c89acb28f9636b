//! Offline salvage of damaged extent files.
//!
//! Walks the frames of a memory-mapped input and copies every frame that
//! decodes into a fresh file. A corrupt frame whose header is intact is
//! skipped by its recorded length; past a damaged header the walk scans for
//! the next frame magic. A truncated frame ends the walk.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use super::{check_file_header, decode_type_library, FileSink, Trailer, FILE_HEADER_SIZE, TRAILER_SIZE};
use crate::codec::CompressionConfig;
use crate::config::SinkConfig;
use crate::error::{ExtentError, Result};
use crate::frame::{self, FrameHeader, FRAME_MAGIC};
use crate::schema::{ExtentSchema, TypeRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverConfig {
    /// Corrupt frames tolerated in a row before giving up.
    pub max_consecutive_failures: usize,
    pub compression: CompressionConfig,
}

impl Default for RecoverConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 16,
            compression: CompressionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub extents_recovered: u64,
    pub rows_recovered: u64,
    /// Contiguous damaged spans that were skipped.
    pub corrupt_regions: u64,
    pub bytes_skipped: u64,
    /// The input ended inside a frame.
    pub truncated_tail: bool,
}

pub fn recover(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    registry: &TypeRegistry,
    config: &RecoverConfig,
) -> Result<RecoveryReport> {
    let input = input.as_ref();
    let file = File::open(input)?;
    // SAFETY: the map is read-only and dropped before this function
    // returns. Concurrent truncation of the input by another process is
    // outside the recovery contract.
    let map = unsafe { Mmap::map(&file)? };
    #[cfg(unix)]
    let _ = map.advise(memmap2::Advice::Sequential);
    let bytes = &map[..];

    check_file_header(bytes)?;
    let (library, library_len) = decode_type_library(&bytes[FILE_HEADER_SIZE..], registry)?;
    let data_start = FILE_HEADER_SIZE + library_len;
    let end = clean_end(bytes, data_start);

    let mut sink = FileSink::create(
        output,
        registry,
        SinkConfig {
            compression: config.compression.clone(),
            sync_on_close: true,
        },
    )?;
    let schemas: Vec<Arc<ExtentSchema>> = library
        .schemas()
        .filter(|s| !s.is_internal())
        .cloned()
        .collect();
    sink.write_type_library(&schemas)?;

    let mut report = RecoveryReport::default();
    let mut consecutive = 0usize;
    let mut pos = data_start;

    while pos < end {
        let slice = &bytes[pos..end];
        let decoded = FrameHeader::from_bytes(slice)
            .and_then(|header| frame::unpack(slice, &library).map(|extent| (header, extent)));
        match decoded {
            Ok((header, extent)) => {
                consecutive = 0;
                pos += header.frame_len();
                if extent.schema().is_internal() {
                    continue;
                }
                report.extents_recovered += 1;
                report.rows_recovered += extent.row_count() as u64;
                sink.write_extent(&extent)?;
            }
            Err(ExtentError::Truncated(reason)) => {
                tracing::warn!(offset = pos, %reason, "input ends inside a frame");
                report.truncated_tail = true;
                report.bytes_skipped += (end - pos) as u64;
                break;
            }
            Err(e @ (ExtentError::CorruptData(_) | ExtentError::UnknownType(_))) => {
                consecutive += 1;
                if consecutive == 1 {
                    report.corrupt_regions += 1;
                }
                if consecutive > config.max_consecutive_failures {
                    return Err(ExtentError::CorruptData(format!(
                        "giving up after {} consecutive corrupt frames near offset {}",
                        consecutive, pos
                    )));
                }
                // A frame whose header checks out has a trustworthy length;
                // only a damaged header needs a scan for the next magic.
                let framed = FrameHeader::from_bytes(slice)
                    .ok()
                    .map(|header| pos + header.frame_len())
                    .filter(|&next| next > pos && next <= end);
                let next = framed.unwrap_or_else(|| {
                    bytes[pos + 1..end]
                        .windows(FRAME_MAGIC.len())
                        .position(|w| w == FRAME_MAGIC)
                        .map_or(end, |i| pos + 1 + i)
                });
                tracing::warn!(
                    offset = pos,
                    skipped = next - pos,
                    error = %e,
                    "skipping corrupt region"
                );
                report.bytes_skipped += (next - pos) as u64;
                pos = next;
            }
            Err(e) => return Err(e),
        }
    }

    sink.close()?;
    tracing::info!(
        input = %input.display(),
        extents = report.extents_recovered,
        rows = report.rows_recovered,
        corrupt_regions = report.corrupt_regions,
        bytes_skipped = report.bytes_skipped,
        truncated = report.truncated_tail,
        "recovery finished"
    );
    Ok(report)
}

/// Where data frames stop: the index offset when the trailer checks out,
/// otherwise the end of the input.
fn clean_end(bytes: &[u8], data_start: usize) -> usize {
    if bytes.len() < data_start + TRAILER_SIZE {
        return bytes.len();
    }
    let tail = &bytes[bytes.len() - TRAILER_SIZE..];
    match Trailer::from_bytes(tail) {
        Ok(trailer) if trailer.check_bounds(data_start as u64, bytes.len() as u64).is_ok() => {
            trailer.index_offset as usize
        }
        _ => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_end_without_trailer() {
        let bytes = vec![0u8; 200];
        assert_eq!(clean_end(&bytes, 64), 200);
        assert_eq!(clean_end(&bytes[..70], 64), 70);
    }

    #[test]
    fn test_clean_end_with_trailer() {
        let mut bytes = vec![0u8; 100];
        let trailer = Trailer {
            index_size: 20,
            chained_checksum: 0,
            index_offset: 80,
        };
        bytes.extend_from_slice(&trailer.to_bytes());
        assert_eq!(clean_end(&bytes, 40), 80);
    }

    #[test]
    fn test_config_defaults() {
        let config = RecoverConfig::default();
        assert_eq!(config.max_consecutive_failures, 16);
        let json = serde_json::to_string(&config).unwrap();
        let back: RecoverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
