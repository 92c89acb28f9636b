//! External-merge sort of rows by one field.
//!
//! Upstream extents are buffered until `memory_limit` bytes, sorted with
//! a stable parallel sort and, when the input does not fit, spilled as a
//! run of frames to a temporary directory. Output is a merge over every
//! run (a single in-memory run when nothing spilled), cut into extents
//! of about `extent_size_limit` bytes.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;

use super::{AbortHandle, ExtentModule, StageState};
use crate::codec::{Codec, CompressionConfig};
use crate::config::PipelineConfig;
use crate::error::{ExtentError, Result};
use crate::extent::{Extent, FieldValue, GeneralField};
use crate::frame::{self, FrameHeader, FRAME_PREFIX_SIZE};
use crate::schema::ExtentSchema;

/// Orders two values of the sort field.
pub type RowComparator =
    Arc<dyn for<'a> Fn(&FieldValue<'a>, &FieldValue<'a>) -> Ordering + Send + Sync>;

/// Target size of each frame in a spill file.
const SPILL_CHUNK_BYTES: usize = 1 << 20;

pub struct SortModule {
    upstream: Box<dyn ExtentModule>,
    field: GeneralField,
    compare: RowComparator,
    memory_limit: usize,
    extent_size_limit: usize,
    compress_temp: bool,
    state: StageState,
    abort: AbortHandle,
    merger: Option<Merger>,
    temp_dir: Option<tempfile::TempDir>,
    spilled_runs: usize,
}

impl SortModule {
    /// Sort by `field` in [`FieldValue::natural_cmp`] order.
    pub fn new(upstream: Box<dyn ExtentModule>, field: &str, config: &PipelineConfig) -> Self {
        let abort = AbortHandle::new();
        if let Some(upstream_abort) = upstream.abort_handle() {
            abort.link(upstream_abort);
        }
        Self {
            upstream,
            field: GeneralField::new(field),
            compare: Arc::new(|a: &FieldValue<'_>, b: &FieldValue<'_>| a.natural_cmp(b)),
            memory_limit: config.sort_memory_limit,
            extent_size_limit: config.sort_extent_size_limit,
            compress_temp: config.sort_compress_temp,
            state: StageState::Unstarted,
            abort,
            merger: None,
            temp_dir: None,
            spilled_runs: 0,
        }
    }

    pub fn with_comparator<F>(mut self, compare: F) -> Self
    where
        F: for<'a> Fn(&FieldValue<'a>, &FieldValue<'a>) -> Ordering + Send + Sync + 'static,
    {
        self.compare = Arc::new(compare);
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_extent_size_limit(mut self, bytes: usize) -> Self {
        self.extent_size_limit = bytes;
        self
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Runs written to temporary storage so far.
    pub fn spilled_runs(&self) -> usize {
        self.spilled_runs
    }

    /// Drain upstream into sorted runs and set up the merge.
    fn load(&mut self) -> Result<Option<Merger>> {
        let mut schema: Option<Arc<ExtentSchema>> = None;
        let mut batch: Vec<Extent> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut runs: Vec<RunSource> = Vec::new();

        while let Some(extent) = self.upstream.get_extent()? {
            if self.abort.is_aborted() {
                return Ok(None);
            }
            match &schema {
                None => {
                    self.field.bind(extent.schema())?;
                    schema = Some(Arc::clone(extent.schema()));
                }
                Some(s) if !Arc::ptr_eq(s, extent.schema()) => {
                    return Err(ExtentError::Schema(format!(
                        "sort input mixes types '{}' and '{}'",
                        s.name(),
                        extent.type_name()
                    )));
                }
                Some(_) => {}
            }
            if extent.is_empty() {
                continue;
            }
            batch_bytes += extent.size_bytes();
            batch.push(extent);
            if batch_bytes >= self.memory_limit {
                let run = self.sort_batch(&batch);
                runs.push(self.spill(&run)?);
                batch.clear();
                batch_bytes = 0;
            }
        }

        let Some(schema) = schema else {
            return Ok(None);
        };
        if !batch.is_empty() {
            let run = self.sort_batch(&batch);
            if runs.is_empty() {
                runs.push(RunSource::Memory(VecDeque::from([run])));
            } else {
                runs.push(self.spill(&run)?);
            }
        }
        tracing::debug!(runs = runs.len(), spilled = self.spilled_runs, "sort input loaded");
        Merger::new(schema, runs).map(Some)
    }

    fn sort_batch(&self, batch: &[Extent]) -> Extent {
        let field = &self.field;
        let mut keys: Vec<(FieldValue<'_>, usize, usize)> = batch
            .iter()
            .enumerate()
            .flat_map(|(e, extent)| {
                (0..extent.row_count()).map(move |row| (field.get_at(extent, row), e, row))
            })
            .collect();
        let compare = &self.compare;
        keys.par_sort_by(|a, b| compare(&a.0, &b.0));

        let mut out = Extent::new(Arc::clone(batch[0].schema()));
        for (_, e, row) in keys {
            out.copy_row_from(&batch[e], row);
        }
        out
    }

    fn spill(&mut self, run: &Extent) -> Result<RunSource> {
        if self.temp_dir.is_none() {
            self.temp_dir = Some(tempfile::Builder::new().prefix("extentdb-sort").tempdir()?);
        }
        let dir = self
            .temp_dir
            .as_ref()
            .ok_or_else(|| ExtentError::Usage("sort spill directory missing".into()))?;
        let path = dir.path().join(format!("run-{:05}.frames", self.spilled_runs));
        let compression = if self.compress_temp {
            CompressionConfig::only(Codec::Lz4)
        } else {
            CompressionConfig::none()
        };

        let mut writer = BufWriter::new(File::create(&path)?);
        let mut chunks = 0usize;
        for chunk in split_rows(run, SPILL_CHUNK_BYTES) {
            writer.write_all(&frame::pack(&chunk, &compression)?.bytes)?;
            chunks += 1;
        }
        writer.flush()?;
        self.spilled_runs += 1;
        tracing::debug!(path = %path.display(), rows = run.row_count(), "spilled sort run");

        Ok(RunSource::Spilled {
            reader: BufReader::new(File::open(&path)?),
            remaining: chunks,
            path,
        })
    }
}

/// Copy `extent` into pieces of about `limit` bytes each.
fn split_rows(extent: &Extent, limit: usize) -> Vec<Extent> {
    if limit == 0 || extent.size_bytes() <= limit {
        return vec![extent.clone()];
    }
    let mut pieces = Vec::new();
    let mut current = Extent::new(Arc::clone(extent.schema()));
    for row in 0..extent.row_count() {
        current.copy_row_from(extent, row);
        if current.size_bytes() >= limit {
            pieces.push(std::mem::replace(
                &mut current,
                Extent::new(Arc::clone(extent.schema())),
            ));
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

// ── Merge ───────────────────────────────────────────────────────────

enum RunSource {
    Memory(VecDeque<Extent>),
    Spilled {
        reader: BufReader<File>,
        remaining: usize,
        path: PathBuf,
    },
}

impl RunSource {
    fn next(&mut self, schema: &Arc<ExtentSchema>) -> Result<Option<Extent>> {
        match self {
            RunSource::Memory(extents) => Ok(extents.pop_front()),
            RunSource::Spilled {
                reader,
                remaining,
                path,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let mut bytes = vec![0u8; FRAME_PREFIX_SIZE];
                reader.read_exact(&mut bytes)?;
                let len = FrameHeader::from_bytes(&bytes)?.frame_len();
                bytes.resize(len, 0);
                reader.read_exact(&mut bytes[FRAME_PREFIX_SIZE..])?;
                *remaining -= 1;
                let extent = frame::unpack_with(&bytes, |name| {
                    if name == schema.name() {
                        Ok(Arc::clone(schema))
                    } else {
                        Err(ExtentError::UnknownType(format!(
                            "{} in sort run {}",
                            name,
                            path.display()
                        )))
                    }
                })?;
                Ok(Some(extent))
            }
        }
    }
}

struct RunCursor {
    source: RunSource,
    current: Option<Extent>,
    row: usize,
}

impl RunCursor {
    fn new(mut source: RunSource, schema: &Arc<ExtentSchema>) -> Result<Self> {
        let current = next_non_empty(&mut source, schema)?;
        Ok(Self {
            source,
            current,
            row: 0,
        })
    }

    fn advance(&mut self, schema: &Arc<ExtentSchema>) -> Result<()> {
        self.row += 1;
        let exhausted = self
            .current
            .as_ref()
            .is_some_and(|extent| self.row >= extent.row_count());
        if exhausted {
            self.current = next_non_empty(&mut self.source, schema)?;
            self.row = 0;
        }
        Ok(())
    }
}

fn next_non_empty(source: &mut RunSource, schema: &Arc<ExtentSchema>) -> Result<Option<Extent>> {
    while let Some(extent) = source.next(schema)? {
        if !extent.is_empty() {
            return Ok(Some(extent));
        }
    }
    Ok(None)
}

struct Merger {
    schema: Arc<ExtentSchema>,
    cursors: Vec<RunCursor>,
}

impl Merger {
    fn new(schema: Arc<ExtentSchema>, runs: Vec<RunSource>) -> Result<Self> {
        let cursors = runs
            .into_iter()
            .map(|run| RunCursor::new(run, &schema))
            .collect::<Result<_>>()?;
        Ok(Self { schema, cursors })
    }

    /// Index of the run whose head sorts first; ties go to the lower run.
    fn min_run(&self, field: &GeneralField, compare: &RowComparator) -> Option<usize> {
        let mut best: Option<(usize, FieldValue<'_>)> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(extent) = cursor.current.as_ref() else {
                continue;
            };
            let value = field.get_at(extent, cursor.row);
            let better = match &best {
                None => true,
                Some((_, current)) => compare(&value, current) == Ordering::Less,
            };
            if better {
                best = Some((i, value));
            }
        }
        best.map(|(i, _)| i)
    }

    fn next_extent(
        &mut self,
        field: &GeneralField,
        compare: &RowComparator,
        size_limit: usize,
        abort: &AbortHandle,
    ) -> Result<Option<Extent>> {
        let mut out = Extent::new(Arc::clone(&self.schema));
        while let Some(i) = self.min_run(field, compare) {
            if abort.is_aborted() {
                return Ok(None);
            }
            let cursor = &mut self.cursors[i];
            if let Some(extent) = cursor.current.as_ref() {
                out.copy_row_from(extent, cursor.row);
            }
            cursor.advance(&self.schema)?;
            if size_limit > 0 && out.size_bytes() >= size_limit {
                break;
            }
        }
        Ok((!out.is_empty()).then_some(out))
    }
}

impl ExtentModule for SortModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        if self.state == StageState::Exhausted {
            return Ok(None);
        }
        if self.abort.is_aborted() {
            self.state = StageState::Exhausted;
            return Ok(None);
        }
        if self.state == StageState::Unstarted {
            self.state = StageState::Active;
            match self.load() {
                Ok(merger) => self.merger = merger,
                Err(e) => {
                    self.state = StageState::Exhausted;
                    return Err(e);
                }
            }
        }
        let next = match self.merger.as_mut() {
            Some(merger) => merger.next_extent(
                &self.field,
                &self.compare,
                self.extent_size_limit,
                &self.abort,
            ),
            None => Ok(None),
        };
        self.state.observe(&next);
        if self.state == StageState::Exhausted {
            self.merger = None;
            self.temp_dir = None;
        }
        next
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        Some(self.abort.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{ExtentSeries, Int32Field, Variable32Field};
    use crate::module::{collect_extents, VecModule};
    use crate::schema::TypeRegistry;

    const TEXT: &str = r#"<ExtentType name="Sort">
  <field type="int32" name="key" />
  <field type="int32" name="seq" />
  <field type="variable32" name="tag" />
</ExtentType>"#;

    fn input(schema: &Arc<ExtentSchema>, extents: i32, rows: i32) -> Vec<Extent> {
        let key = Int32Field::bound(schema, "key").unwrap();
        let seq = Int32Field::bound(schema, "seq").unwrap();
        let tag = Variable32Field::bound(schema, "tag").unwrap();
        (0..extents)
            .map(|e| {
                let mut s = ExtentSeries::for_schema(Arc::clone(schema));
                for i in 0..rows {
                    let n = e * rows + i;
                    s.new_row();
                    key.set(&mut s, (n * 7919) % 97);
                    seq.set(&mut s, n);
                    tag.set(&mut s, format!("t{}", n));
                }
                s.take_extent().unwrap()
            })
            .collect()
    }

    fn rows(schema: &Arc<ExtentSchema>, extents: &[Extent]) -> Vec<(i32, i32, String)> {
        let key = Int32Field::bound(schema, "key").unwrap();
        let seq = Int32Field::bound(schema, "seq").unwrap();
        let tag = Variable32Field::bound(schema, "tag").unwrap();
        let mut out = Vec::new();
        for extent in extents {
            let mut s = ExtentSeries::with_extent(extent.clone());
            while s.more() {
                out.push((key.get(&s), seq.get(&s), tag.get_str(&s).unwrap().to_string()));
                s.next_row();
            }
        }
        out
    }

    fn check_sorted(spill: bool) {
        let schema = TypeRegistry::new().register(TEXT).unwrap();
        let extents = input(&schema, 8, 60);
        let mut expected = rows(&schema, &extents);
        expected.sort_by_key(|r| r.0);

        let config = PipelineConfig::default();
        let mut sort = SortModule::new(Box::new(VecModule::new(extents)), "key", &config)
            .with_extent_size_limit(1000);
        if spill {
            sort = sort.with_memory_limit(2000);
        }
        let out = collect_extents(&mut sort).unwrap();
        assert_eq!(sort.spilled_runs() > 0, spill);
        assert!(out.len() > 1);
        // stable: equal keys keep input order
        assert_eq!(rows(&schema, &out), expected);
    }

    #[test]
    fn test_in_memory_sort() {
        check_sorted(false);
    }

    #[test]
    fn test_spilling_sort() {
        check_sorted(true);
    }

    #[test]
    fn test_custom_comparator_descending() {
        let schema = TypeRegistry::new().register(TEXT).unwrap();
        let mut sort = SortModule::new(
            Box::new(VecModule::new(input(&schema, 3, 20))),
            "seq",
            &PipelineConfig::default(),
        )
        .with_comparator(|a: &FieldValue<'_>, b: &FieldValue<'_>| b.natural_cmp(a));
        let out = rows(&schema, &collect_extents(&mut sort).unwrap());
        let seqs: Vec<i32> = out.iter().map(|r| r.1).collect();
        assert_eq!(seqs, (0..60).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input_and_mixed_types() {
        let registry = TypeRegistry::new();
        let mut sort = SortModule::new(Box::new(VecModule::new(vec![])), "key", &PipelineConfig::default());
        assert!(sort.get_extent().unwrap().is_none());
        assert_eq!(sort.state(), StageState::Exhausted);

        let a = registry.register(TEXT).unwrap();
        let b = registry
            .register(&TEXT.replace("name=\"Sort\"", "name=\"Sort2\""))
            .unwrap();
        let mut mixed = input(&a, 1, 3);
        mixed.extend(input(&b, 1, 3));
        let mut sort = SortModule::new(Box::new(VecModule::new(mixed)), "key", &PipelineConfig::default());
        assert!(matches!(sort.get_extent(), Err(ExtentError::Schema(_))));
        assert!(sort.get_extent().unwrap().is_none());
    }

    #[test]
    fn test_split_rows() {
        let schema = TypeRegistry::new().register(TEXT).unwrap();
        let extent = input(&schema, 1, 100).remove(0);
        let pieces = split_rows(&extent, 500);
        assert!(pieces.len() > 1);
        assert_eq!(pieces.iter().map(Extent::row_count).sum::<usize>(), 100);
    }
}
