//! Append-only extent file writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use super::{build_index_extent, encode_file_header, encode_type_library, IndexEntry, Trailer};
use crate::config::SinkConfig;
use crate::error::{ExtentError, Result};
use crate::extent::Extent;
use crate::frame::{self, PackedFrame};
use crate::schema::{ExtentSchema, TypeLibrary, TypeRegistry};

/// Called after each data frame is written with its file offset and type.
pub type WriteCallback = Box<dyn FnMut(u64, &str) + Send>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub extents: u64,
    pub rows: u64,
    /// Fixed plus variable bytes before packing.
    pub raw_bytes: u64,
    /// Data frame bytes on disk.
    pub packed_bytes: u64,
    pub file_bytes: u64,
}

/// Writes one extent file.
///
/// Call [`write_type_library`](Self::write_type_library) once, then any
/// number of extent writes, then [`close`](Self::close). Dropping an open
/// sink closes it and logs any failure.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    config: SinkConfig,
    index_schema: Arc<ExtentSchema>,
    library: Option<TypeLibrary>,
    position: u64,
    entries: Vec<IndexEntry>,
    chain: crc32fast::Hasher,
    callback: Option<WriteCallback>,
    stats: SinkStats,
}

impl FileSink {
    /// Create (or truncate) `path` and write the file header.
    pub fn create(path: impl AsRef<Path>, registry: &TypeRegistry, config: SinkConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        let header = encode_file_header();
        writer.write_all(&header)?;
        tracing::debug!(path = %path.display(), "created extent file");
        Ok(Self {
            path,
            writer: Some(writer),
            config,
            index_schema: Arc::clone(registry.index_schema()),
            library: None,
            position: header.len() as u64,
            entries: Vec::new(),
            chain: crc32fast::Hasher::new(),
            callback: None,
            stats: SinkStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_write_callback(&mut self, callback: WriteCallback) {
        self.callback = Some(callback);
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Record every schema that extents in this file may use. Internal
    /// types are always available and are not written.
    pub fn write_type_library(&mut self, schemas: &[Arc<ExtentSchema>]) -> Result<()> {
        if self.library.is_some() {
            return Err(ExtentError::Usage("type library already written".into()));
        }
        let mut library = TypeLibrary::new();
        library.add(Arc::clone(&self.index_schema))?;
        let mut user = Vec::with_capacity(schemas.len());
        for schema in schemas {
            if schema.is_internal() || library.contains(schema) {
                continue;
            }
            library.add(Arc::clone(schema))?;
            user.push(schema);
        }
        let block = encode_type_library(user);
        self.write_bytes(&block)?;
        tracing::debug!(types = library.len() - 1, bytes = block.len(), "wrote type library");
        self.library = Some(library);
        Ok(())
    }

    /// Pack and append one extent; returns its frame offset.
    pub fn write_extent(&mut self, extent: &Extent) -> Result<u64> {
        self.check_type(extent)?;
        let packed = frame::pack(extent, &self.config.compression)?;
        self.write_frame(extent, packed)
    }

    /// Pack a batch in parallel and append the frames in order.
    pub fn write_extents(&mut self, extents: &[Extent]) -> Result<Vec<u64>> {
        for extent in extents {
            self.check_type(extent)?;
        }
        let compression = &self.config.compression;
        let packed: Vec<PackedFrame> = extents
            .par_iter()
            .map(|extent| frame::pack(extent, compression))
            .collect::<Result<_>>()?;
        extents
            .iter()
            .zip(packed)
            .map(|(extent, frame)| self.write_frame(extent, frame))
            .collect()
    }

    /// Write the index frame and trailer, flush, and return the totals.
    pub fn close(mut self) -> Result<SinkStats> {
        self.finish()?;
        Ok(self.stats.clone())
    }

    fn check_type(&self, extent: &Extent) -> Result<()> {
        let library = self.library.as_ref().ok_or_else(|| {
            ExtentError::Usage("extent written before the type library".into())
        })?;
        if extent.schema().is_internal() || !library.contains(extent.schema()) {
            return Err(ExtentError::Usage(format!(
                "extent type '{}' is not in this file's type library",
                extent.type_name()
            )));
        }
        Ok(())
    }

    fn write_frame(&mut self, extent: &Extent, packed: PackedFrame) -> Result<u64> {
        let offset = self.position;
        self.write_bytes(&packed.bytes)?;
        self.chain.update(&packed.header.header_crc.to_le_bytes());
        self.entries
            .push(IndexEntry::from_frame(offset, extent.type_name(), &packed.header));

        self.stats.extents += 1;
        self.stats.rows += extent.row_count() as u64;
        self.stats.raw_bytes += extent.size_bytes() as u64;
        self.stats.packed_bytes += packed.bytes.len() as u64;

        if let Some(callback) = self.callback.as_mut() {
            callback(offset, extent.type_name());
        }
        Ok(offset)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ExtentError::Usage("sink is closed".into()))?;
        writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        if self.library.is_none() {
            self.write_type_library(&[])?;
        }

        let index = build_index_extent(&self.index_schema, &self.entries)?;
        let packed = frame::pack(&index, &self.config.compression)?;
        let trailer = Trailer {
            index_size: packed.bytes.len() as u32,
            chained_checksum: self.chain.clone().finalize(),
            index_offset: self.position,
        };
        self.write_bytes(&packed.bytes)?;
        self.write_bytes(&trailer.to_bytes())?;

        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if self.config.sync_on_close {
                writer.get_ref().sync_all()?;
            }
        }
        self.stats.file_bytes = self.position;
        tracing::info!(
            path = %self.path.display(),
            extents = self.stats.extents,
            rows = self.stats.rows,
            bytes = self.stats.file_bytes,
            "closed extent file"
        );
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.writer.is_none() {
            return;
        }
        tracing::warn!(path = %self.path.display(), "extent sink dropped without close");
        if let Err(e) = self.finish() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to close extent sink");
        }
    }
}
