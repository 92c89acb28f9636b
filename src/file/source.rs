//! Extent file reader: sequential frames, offset-addressed random access
//! and the trailing index.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{
    check_file_header, decode_type_library, read_index_entries, IndexEntry, Trailer,
    FILE_HEADER_SIZE, TRAILER_SIZE,
};
use crate::error::{ExtentError, Result};
use crate::extent::Extent;
use crate::frame::{self, FrameHeader, FRAME_PREFIX_SIZE};
use crate::schema::{TypeLibrary, TypeRegistry, INDEX_TYPE_NAME};

const LIBRARY_READ_SIZE: usize = 64 * 1024;

pub struct FileSource {
    path: PathBuf,
    file: File,
    library: TypeLibrary,
    data_start: u64,
    /// Frames end here: the index offset of a closed file, else its length.
    data_end: u64,
    file_len: u64,
    modified: Option<SystemTime>,
    trailer: Option<Trailer>,
    position: u64,
}

impl FileSource {
    /// Open and validate the header, type library and, when present, the
    /// trailer.
    pub fn open(path: impl AsRef<Path>, registry: &TypeRegistry) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        advise_sequential(&file);
        let meta = file.metadata()?;
        let file_len = meta.len();

        check_file_header(&read_up_to(&file, 0, FILE_HEADER_SIZE)?)?;

        let mut want = LIBRARY_READ_SIZE;
        let (library, library_len) = loop {
            let bytes = read_up_to(&file, FILE_HEADER_SIZE as u64, want)?;
            match decode_type_library(&bytes, registry) {
                Ok(decoded) => break decoded,
                Err(ExtentError::Truncated(_)) if bytes.len() == want => want *= 4,
                Err(e) => return Err(e),
            }
        };
        let data_start = (FILE_HEADER_SIZE + library_len) as u64;

        let trailer = read_trailer(&file, data_start, file_len)?;
        if trailer.is_none() {
            tracing::warn!(path = %path.display(), "extent file was not cleanly closed");
        }
        tracing::debug!(
            path = %path.display(),
            types = library.len(),
            bytes = file_len,
            closed = trailer.is_some(),
            "opened extent file"
        );

        Ok(Self {
            path,
            file,
            library,
            data_start,
            data_end: trailer.map_or(file_len, |t| t.index_offset),
            file_len,
            modified: meta.modified().ok(),
            trailer,
            position: data_start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn library(&self) -> &TypeLibrary {
        &self.library
    }

    pub fn is_cleanly_closed(&self) -> bool {
        self.trailer.is_some()
    }

    pub fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }

    /// Offset of the first data frame.
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Offset the next [`get_extent`](Self::get_extent) reads from.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next data frame in file order. `None` at the end of data.
    pub fn get_extent(&mut self) -> Result<Option<Extent>> {
        while self.position < self.data_end {
            let (extent, next) = self.read_extent_at(self.position)?;
            self.position = next;
            // an unclosed file can end with an index frame but no trailer
            if extent.schema().is_internal() {
                continue;
            }
            return Ok(Some(extent));
        }
        Ok(None)
    }

    /// Unpack exactly the frame at `offset`; returns it and the offset of
    /// the frame after it.
    pub fn read_extent_at(&self, offset: u64) -> Result<(Extent, u64)> {
        let mut bytes = read_up_to(&self.file, offset, FRAME_PREFIX_SIZE)?;
        let header = FrameHeader::from_bytes(&bytes)?;
        let len = header.frame_len();
        bytes.extend(read_up_to(
            &self.file,
            offset + FRAME_PREFIX_SIZE as u64,
            len - FRAME_PREFIX_SIZE,
        )?);
        let extent = frame::unpack(&bytes, &self.library)?;
        Ok((extent, offset + len as u64))
    }

    /// The trailing index extent, or `None` for a file without one.
    pub fn read_index_extent(&self) -> Result<Option<Extent>> {
        let Some(trailer) = self.trailer else {
            return Ok(None);
        };
        let (index, _) = self.read_extent_at(trailer.index_offset)?;
        if index.type_name() != INDEX_TYPE_NAME {
            return Err(ExtentError::CorruptTrailer(format!(
                "trailer points at a '{}' frame",
                index.type_name()
            )));
        }
        Ok(Some(index))
    }

    pub fn index_entries(&self) -> Result<Option<Vec<IndexEntry>>> {
        match self.read_index_extent()? {
            Some(index) => Ok(Some(read_index_entries(&index)?)),
            None => Ok(None),
        }
    }

    /// Revalidate after the file may have changed on disk.
    ///
    /// Returns `false` when the modification time is unchanged. Otherwise
    /// the file is reopened and its trailer re-read; a changed file
    /// without a valid trailer is `CorruptTrailer`. The read position is
    /// kept.
    ///
    /// The header and type library are not re-read: the file is assumed
    /// to have grown by appending, so the type library is assumed
    /// unchanged. A file rewritten with a different library needs a fresh
    /// [`open`](Self::open).
    pub fn reopen(&mut self) -> Result<bool> {
        let modified = std::fs::metadata(&self.path)?.modified().ok();
        if modified.is_some() && modified == self.modified {
            return Ok(false);
        }

        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let trailer = read_trailer(&file, self.data_start, file_len)
            .map_err(|e| match e {
                ExtentError::CorruptTrailer(_) => e,
                other => ExtentError::CorruptTrailer(other.to_string()),
            })?
            .ok_or_else(|| {
                ExtentError::CorruptTrailer("file changed and has no end-of-file marker".into())
            })?;

        tracing::debug!(path = %self.path.display(), bytes = file_len, "revalidated extent file");
        advise_sequential(&file);
        self.file = file;
        self.file_len = file_len;
        self.data_end = trailer.index_offset;
        self.trailer = Some(trailer);
        self.modified = modified;
        Ok(true)
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }
}

/// Validate the tail of the file. `None` when the file does not end in a
/// trailer; a trailer that is present but inconsistent is an error.
fn read_trailer(file: &File, data_start: u64, file_len: u64) -> Result<Option<Trailer>> {
    if file_len < data_start + TRAILER_SIZE as u64 {
        return Ok(None);
    }
    let tail = read_up_to(file, file_len - TRAILER_SIZE as u64, TRAILER_SIZE)?;
    if !Trailer::is_present(&tail) {
        return Ok(None);
    }
    let trailer = Trailer::from_bytes(&tail)?;
    trailer.check_bounds(data_start, file_len)?;

    let prefix = read_up_to(file, trailer.index_offset, FRAME_PREFIX_SIZE)?;
    let header = FrameHeader::from_bytes(&prefix)
        .map_err(|e| ExtentError::CorruptTrailer(format!("index frame: {}", e)))?;
    if header.frame_len() != trailer.index_size as usize {
        return Err(ExtentError::CorruptTrailer(format!(
            "index frame is {} bytes, trailer says {}",
            header.frame_len(),
            trailer.index_size
        )));
    }
    Ok(Some(trailer))
}

/// Read up to `len` bytes at `offset`; shorter only at end of file.
fn read_up_to(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut reader = file;
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(target_os = "linux")]
fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    // The advice is a read-ahead hint and never changes file contents.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_file: &File) {}
