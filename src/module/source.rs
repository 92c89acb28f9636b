use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use super::{ExtentModule, StageState};
use crate::error::Result;
use crate::extent::Extent;
use crate::file::FileSource;
use crate::schema::TypeRegistry;

/// Every data extent of a list of files, in file order.
pub struct FileSourceModule {
    registry: Arc<TypeRegistry>,
    files: VecDeque<PathBuf>,
    current: Option<FileSource>,
    state: StageState,
}

impl FileSourceModule {
    pub fn new<I, P>(registry: Arc<TypeRegistry>, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            registry,
            files: files.into_iter().map(Into::into).collect(),
            current: None,
            state: StageState::Unstarted,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    fn next_extent(&mut self) -> Result<Option<Extent>> {
        loop {
            if let Some(source) = self.current.as_mut() {
                if let Some(extent) = source.get_extent()? {
                    return Ok(Some(extent));
                }
                self.current = None;
            }
            match self.files.pop_front() {
                Some(path) => self.current = Some(FileSource::open(&path, &self.registry)?),
                None => return Ok(None),
            }
        }
    }
}

impl ExtentModule for FileSourceModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        if self.state == StageState::Exhausted {
            return Ok(None);
        }
        let next = self.next_extent();
        self.state.observe(&next);
        if self.state == StageState::Exhausted {
            self.current = None;
            self.files.clear();
        }
        next
    }
}
