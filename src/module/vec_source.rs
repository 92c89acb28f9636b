use std::collections::VecDeque;

use super::{ExtentModule, StageState};
use crate::error::Result;
use crate::extent::Extent;

/// Source stage over extents already in memory.
#[derive(Debug, Default)]
pub struct VecModule {
    extents: VecDeque<Extent>,
    state: StageState,
}

impl VecModule {
    pub fn new(extents: Vec<Extent>) -> Self {
        Self {
            extents: extents.into(),
            state: StageState::Unstarted,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        self.extents.len()
    }
}

impl FromIterator<Extent> for VecModule {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl ExtentModule for VecModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let next = Ok(self.extents.pop_front());
        self.state.observe(&next);
        next
    }
}
