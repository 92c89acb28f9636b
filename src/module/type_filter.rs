//! Type-name filtering driven by the trailing index.
//!
//! For each file the index is read first and only frames whose type
//! matches are fetched and decompressed. A file without an index is
//! scanned frame by frame instead.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::{ExtentModule, StageState};
use crate::error::{ExtentError, Result};
use crate::extent::Extent;
use crate::file::FileSource;
use crate::schema::TypeRegistry;

#[derive(Clone)]
pub enum TypePredicate {
    Exact(String),
    Prefix(String),
    Regex(regex_lite::Regex),
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl TypePredicate {
    pub fn regex(pattern: &str) -> Result<Self> {
        regex_lite::Regex::new(pattern)
            .map(TypePredicate::Regex)
            .map_err(|e| ExtentError::Usage(format!("bad type pattern '{}': {}", pattern, e)))
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        TypePredicate::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            TypePredicate::Exact(name) => type_name == name,
            TypePredicate::Prefix(prefix) => type_name.starts_with(prefix.as_str()),
            TypePredicate::Regex(re) => re.is_match(type_name),
            TypePredicate::Custom(f) => f(type_name),
        }
    }
}

impl fmt::Debug for TypePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypePredicate::Exact(name) => write!(f, "Exact({:?})", name),
            TypePredicate::Prefix(prefix) => write!(f, "Prefix({:?})", prefix),
            TypePredicate::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
            TypePredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

enum Plan {
    /// Offsets of matching frames, from the index.
    Indexed(VecDeque<u64>),
    Scan,
}

pub struct TypeFilterModule {
    registry: Arc<TypeRegistry>,
    predicate: TypePredicate,
    files: VecDeque<PathBuf>,
    current: Option<(FileSource, Plan)>,
    state: StageState,
    skipped_frames: u64,
}

impl TypeFilterModule {
    pub fn new<I, P>(registry: Arc<TypeRegistry>, files: I, predicate: TypePredicate) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            registry,
            predicate,
            files: files.into_iter().map(Into::into).collect(),
            current: None,
            state: StageState::Unstarted,
            skipped_frames: 0,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Frames passed over without being decompressed.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    fn open_next(&mut self) -> Result<bool> {
        while let Some(path) = self.files.pop_front() {
            let source = FileSource::open(&path, &self.registry)?;
            if !source
                .library()
                .schemas()
                .any(|s| !s.is_internal() && self.predicate.matches(s.name()))
            {
                tracing::debug!(path = %path.display(), "no matching types in file");
                continue;
            }
            let plan = match source.index_entries()? {
                Some(entries) => {
                    let total = entries.len();
                    let offsets: VecDeque<u64> = entries
                        .into_iter()
                        .filter(|e| self.predicate.matches(&e.type_name))
                        .map(|e| e.offset)
                        .collect();
                    self.skipped_frames += (total - offsets.len()) as u64;
                    Plan::Indexed(offsets)
                }
                None => {
                    tracing::warn!(path = %path.display(), "file has no index; scanning every frame");
                    Plan::Scan
                }
            };
            self.current = Some((source, plan));
            return Ok(true);
        }
        Ok(false)
    }

    fn next_extent(&mut self) -> Result<Option<Extent>> {
        loop {
            if let Some((source, plan)) = self.current.as_mut() {
                match plan {
                    Plan::Indexed(offsets) => {
                        if let Some(offset) = offsets.pop_front() {
                            return Ok(Some(source.read_extent_at(offset)?.0));
                        }
                    }
                    Plan::Scan => {
                        while let Some(extent) = source.get_extent()? {
                            if self.predicate.matches(extent.type_name()) {
                                return Ok(Some(extent));
                            }
                        }
                    }
                }
                self.current = None;
            }
            if !self.open_next()? {
                return Ok(None);
            }
        }
    }
}

impl ExtentModule for TypeFilterModule {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(TypePredicate::Exact("A::B".into()).matches("A::B"));
        assert!(!TypePredicate::Exact("A::B".into()).matches("A::BC"));
        assert!(TypePredicate::Prefix("Trace::".into()).matches("Trace::NFS"));
        let re = TypePredicate::regex("^Trace::(NFS|IO)$").unwrap();
        assert!(re.matches("Trace::IO"));
        assert!(!re.matches("Trace::IOX"));
        assert!(TypePredicate::custom(|n| n.len() == 3).matches("abc"));
        assert!(matches!(TypePredicate::regex("("), Err(ExtentError::Usage(_))));
    }
}
