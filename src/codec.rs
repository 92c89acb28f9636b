//! Compression codecs and checksums.
//!
//! Each frame buffer records the codec that produced it (one byte on
//! disk). `compress_best` tries every enabled codec and keeps the smallest
//! result; data that no codec shrinks is stored raw under [`Codec::None`].

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{ExtentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Lz4 = 1,
    Gzip = 2,
    Zstd = 3,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::Lz4, Codec::Gzip, Codec::Zstd];

    pub fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Lz4),
            2 => Ok(Codec::Gzip),
            3 => Ok(Codec::Zstd),
            other => Err(ExtentError::CorruptData(format!(
                "unknown compression codec id {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Lz4 => "lz4",
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Codecs tried for each of the two frame buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub fixed: Vec<Codec>,
    pub variable: Vec<Codec>,
    /// 0-9; mapped onto each codec's own range.
    pub level: u32,
}

impl CompressionConfig {
    pub fn none() -> Self {
        Self {
            fixed: Vec::new(),
            variable: Vec::new(),
            level: 0,
        }
    }

    pub fn only(codec: Codec) -> Self {
        let modes = if codec == Codec::None {
            Vec::new()
        } else {
            vec![codec]
        };
        Self {
            fixed: modes.clone(),
            variable: modes,
            level: 6,
        }
    }

    pub fn all() -> Self {
        Self {
            fixed: Codec::ALL.to_vec(),
            variable: Codec::ALL.to_vec(),
            level: 6,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            fixed: vec![Codec::Lz4, Codec::Gzip],
            variable: vec![Codec::Lz4, Codec::Gzip],
            level: 6,
        }
    }
}

// ── Compress / decompress ───────────────────────────────────────────

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

pub fn compress(bytes: &[u8], codec: Codec, level: u32) -> Result<Vec<u8>> {
    let level = level.min(9);
    match codec {
        Codec::None => Ok(bytes.to_vec()),
        Codec::Lz4 => Ok(lz4_flex::compress(bytes)),
        Codec::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(
                Vec::with_capacity(bytes.len() / 2),
                flate2::Compression::new(level),
            );
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        Codec::Zstd => {
            // zstd levels run 1..=22; keep the generic 0-9 scale monotonic
            let zstd_level = (level as i32 * 2).max(1);
            zstd::bulk::compress(bytes, zstd_level)
                .map_err(|e| ExtentError::Compression(format!("zstd: {}", e)))
        }
    }
}

/// Decompress and check that the output has exactly `expected_len` bytes.
pub fn decompress(bytes: &[u8], codec: Codec, expected_len: usize) -> Result<Vec<u8>> {
    let out = match codec {
        Codec::None => bytes.to_vec(),
        Codec::Lz4 => lz4_flex::decompress(bytes, expected_len)
            .map_err(|e| ExtentError::CorruptData(format!("lz4: {}", e)))?,
        Codec::Gzip => {
            let mut out = Vec::with_capacity(expected_len);
            flate2::read::GzDecoder::new(bytes)
                .take(expected_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| ExtentError::CorruptData(format!("gzip: {}", e)))?;
            out
        }
        Codec::Zstd => zstd::bulk::decompress(bytes, expected_len)
            .map_err(|e| ExtentError::CorruptData(format!("zstd: {}", e)))?,
    };
    if out.len() != expected_len {
        return Err(ExtentError::CorruptData(format!(
            "{} produced {} bytes, header declares {}",
            codec.as_str(),
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

/// Try each candidate and keep the smallest output. Falls back to the raw
/// bytes under [`Codec::None`] when nothing is smaller than the input.
pub fn compress_best(bytes: &[u8], candidates: &[Codec], level: u32) -> Result<(Codec, Vec<u8>)> {
    let mut best: Option<(Codec, Vec<u8>)> = None;
    for &codec in candidates.iter().filter(|c| **c != Codec::None) {
        let packed = compress(bytes, codec, level)?;
        let smaller = match &best {
            Some((_, current)) => packed.len() < current.len(),
            None => packed.len() < bytes.len(),
        };
        if smaller {
            best = Some((codec, packed));
        }
    }
    Ok(best.unwrap_or_else(|| (Codec::None, bytes.to_vec())))
}

// ── Tests ───────────────────────────────────────────────────────────
