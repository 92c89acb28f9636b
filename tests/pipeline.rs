//! Integration test: pipeline stages over in-memory and on-disk inputs.
//!
//! Validates that:
//! - Prefetch yields exactly the upstream sequence
//! - Parallel filtering keeps the same rows as serial filtering
//! - Sorting is ordered, stable and lossless with and without spills
//! - Type filtering uses the index to skip unwanted frames

use std::sync::Arc;

use extentdb::config::{PipelineConfig, SinkConfig};
use extentdb::interfaces::{aggregate_field, ExpressionEvaluator, RowExpression};
use extentdb::module::{
    collect_extents, FileSourceModule, ParallelFilterModule, PrefetchBufferModule,
    RecordFilterModule, SequenceModule, SortModule, TypeFilterModule, TypePredicate, VecModule,
};
use extentdb::{
    Extent, ExtentError, ExtentModule, ExtentSchema, ExtentSeries, FieldValue, FileSink,
    Int32Field, Int64Field, Result, TypeRegistry, Variable32Field,
};
use proptest::prelude::*;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const EVENT: &str = r#"<ExtentType name="Test::Event">
  <field type="int32" name="key" />
  <field type="int64" name="seq" pack_relative="seq" />
  <field type="variable32" name="tag" />
</ExtentType>"#;

const OTHER: &str = r#"<ExtentType name="Test::Other"><field type="int64" name="v"/></ExtentType>"#;

fn events(schema: &Arc<ExtentSchema>, keys: &[Vec<i32>]) -> Vec<Extent> {
    let key = Int32Field::bound(schema, "key").unwrap();
    let seq = Int64Field::bound(schema, "seq").unwrap();
    let tag = Variable32Field::bound(schema, "tag").unwrap();
    let mut n = 0i64;
    keys.iter()
        .map(|chunk| {
            let mut s = ExtentSeries::for_schema(Arc::clone(schema));
            for &k in chunk {
                s.new_row();
                key.set(&mut s, k);
                seq.set(&mut s, n);
                tag.set(&mut s, format!("e{}", n));
                n += 1;
            }
            s.take_extent().unwrap_or_else(|| Extent::new(Arc::clone(schema)))
        })
        .collect()
}

fn rows(extents: &[Extent]) -> Vec<(i32, i64, String)> {
    let mut out = Vec::new();
    for extent in extents {
        let key = Int32Field::bound(extent.schema(), "key").unwrap();
        let seq = Int64Field::bound(extent.schema(), "seq").unwrap();
        let tag = Variable32Field::bound(extent.schema(), "tag").unwrap();
        let mut s = ExtentSeries::with_extent(extent.clone());
        while s.more() {
            out.push((key.get(&s), seq.get(&s), tag.get_str(&s).unwrap_or_default().to_string()));
            s.next_row();
        }
    }
    out
}

fn key_chunks() -> impl Strategy<Value = Vec<Vec<i32>>> {
    proptest::collection::vec(proptest::collection::vec(-50i32..50, 0..40), 0..12)
}

/// Compiles `<field> > <n>` for int32 / int64 fields.
struct GreaterThan;

struct CompiledGreaterThan {
    field: Int32Field,
    bound: i32,
}

impl RowExpression for CompiledGreaterThan {
    fn matches(&self, series: &ExtentSeries) -> bool {
        self.field.get(series) > self.bound
    }
}

impl ExpressionEvaluator for GreaterThan {
    fn compile(&self, schema: &Arc<ExtentSchema>, text: &str) -> Result<Box<dyn RowExpression>> {
        let (name, bound) = text
            .split_once('>')
            .ok_or_else(|| ExtentError::Usage(format!("cannot parse '{}'", text)))?;
        let bound = bound
            .trim()
            .parse()
            .map_err(|_| ExtentError::Usage(format!("bad bound in '{}'", text)))?;
        Ok(Box::new(CompiledGreaterThan {
            field: Int32Field::bound(schema, name.trim())?,
            bound,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests: stage equivalences
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prefetch_is_transparent(chunks in key_chunks(), budget in 0usize..4096) {
        let schema = TypeRegistry::new().register(EVENT).unwrap();
        let input = events(&schema, &chunks);
        let mut prefetch = PrefetchBufferModule::new(Box::new(VecModule::new(input.clone())), budget);
        prop_assert_eq!(collect_extents(&mut prefetch).unwrap(), input);
    }

    #[test]
    fn parallel_filter_matches_record_filter(chunks in key_chunks(), threads in 1usize..6) {
        let schema = TypeRegistry::new().register(EVENT).unwrap();
        let input = events(&schema, &chunks);
        let keep = |v: &FieldValue<'_>| v.as_i64().is_some_and(|k| k % 3 == 0);

        let mut serial = RecordFilterModule::new(Box::new(VecModule::new(input.clone())), "key", keep);
        let mut expected = rows(&collect_extents(&mut serial).unwrap());
        let mut parallel =
            ParallelFilterModule::row_filter(Box::new(VecModule::new(input)), threads, 512, "key", keep);
        let mut got = rows(&collect_extents(&mut parallel).unwrap());
        expected.sort();
        got.sort();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn sort_is_ordered_stable_and_lossless(chunks in key_chunks(), limit in prop_oneof![Just(0usize), 1usize..2048, Just(1usize << 30)]) {
        let schema = TypeRegistry::new().register(EVENT).unwrap();
        let input = events(&schema, &chunks);
        let mut expected = rows(&input);
        // stable sort by key is the reference
        expected.sort_by_key(|r| r.0);

        let mut sort = SortModule::new(Box::new(VecModule::new(input)), "key", &PipelineConfig::default())
            .with_memory_limit(limit)
            .with_extent_size_limit(256);
        let out = collect_extents(&mut sort).unwrap();
        prop_assert!(out.iter().all(|e| !e.is_empty()));
        prop_assert_eq!(rows(&out), expected);
    }
}

#[test]
fn sequence_of_stages_composes() {
    let schema = TypeRegistry::new().register(EVENT).unwrap();
    let keys: Vec<Vec<i32>> = (0..10).map(|e| (0..30).map(|i| (e * 31 + i * 17) % 40).collect()).collect();
    let input = events(&schema, &keys);
    let config = PipelineConfig::default();

    let mut chain = SequenceModule::new(VecModule::new(input.clone()))
        .then(|up| PrefetchBufferModule::new(up, 1024))
        .then(|up| RecordFilterModule::with_expression(up, Arc::new(GreaterThan), "key > 20"))
        .then(|up| SortModule::new(up, "key", &config).with_extent_size_limit(0));
    assert_eq!(chain.stage_count(), 4);
    let out = collect_extents(&mut chain).unwrap();
    assert_eq!(out.len(), 1);

    let got = rows(&out);
    let mut expected: Vec<_> = rows(&input).into_iter().filter(|r| r.0 > 20).collect();
    expected.sort_by_key(|r| r.0);
    assert_eq!(got, expected);
}

#[test]
fn bad_expression_is_reported() {
    let schema = TypeRegistry::new().register(EVENT).unwrap();
    let input = events(&schema, &[vec![1, 2, 3]]);
    let mut filter =
        RecordFilterModule::with_expression(Box::new(VecModule::new(input)), Arc::new(GreaterThan), "key ~ 2");
    assert!(matches!(filter.get_extent(), Err(ExtentError::Usage(_))));
    assert!(filter.get_extent().unwrap().is_none());
}

#[test]
fn aggregate_over_file_pipeline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agg.ext");
    let registry = Arc::new(TypeRegistry::new());
    let schema = registry.register(EVENT).unwrap();

    let mut sink = FileSink::create(&path, &registry, SinkConfig::default()).unwrap();
    sink.write_type_library(&[Arc::clone(&schema)]).unwrap();
    sink.write_extents(&events(&schema, &[vec![1, 2, 3], vec![4, 5]])).unwrap();
    sink.close().unwrap();

    let mut source = FileSourceModule::new(Arc::clone(&registry), [&path]);
    let mut values: Vec<f64> = Vec::new();
    assert_eq!(aggregate_field(&mut source, "key", &mut values).unwrap(), 5);
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
}

// ---------------------------------------------------------------------------
// Tests: type filtering
// ---------------------------------------------------------------------------

#[test]
fn type_filter_skips_frames_through_index() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(TypeRegistry::new());
    let event = registry.register(EVENT).unwrap();
    let other = registry.register(OTHER).unwrap();
    let v = Int64Field::bound(&other, "v").unwrap();

    let mut paths = Vec::new();
    for f in 0..2 {
        let path = dir.path().join(format!("t{}.ext", f));
        let mut sink = FileSink::create(&path, &registry, SinkConfig::default()).unwrap();
        sink.write_type_library(&[Arc::clone(&event), Arc::clone(&other)]).unwrap();
        for i in 0..6 {
            if i % 2 == 0 {
                sink.write_extent(&events(&event, &[vec![i; 4]])[0]).unwrap();
            } else {
                let mut s = ExtentSeries::for_schema(Arc::clone(&other));
                s.new_row();
                v.set(&mut s, i as i64);
                sink.write_extent(&s.take_extent().unwrap()).unwrap();
            }
        }
        sink.close().unwrap();
        paths.push(path);
    }

    let mut filter = TypeFilterModule::new(
        Arc::clone(&registry),
        paths.clone(),
        TypePredicate::Exact("Test::Other".into()),
    );
    let out = collect_extents(&mut filter).unwrap();
    assert_eq!(out.len(), 6);
    assert!(out.iter().all(|e| Arc::ptr_eq(e.schema(), &other)));
    assert_eq!(filter.skipped_frames(), 6);

    let mut by_prefix = TypeFilterModule::new(
        Arc::clone(&registry),
        paths.clone(),
        TypePredicate::Prefix("Test::".into()),
    );
    assert_eq!(collect_extents(&mut by_prefix).unwrap().len(), 12);

    let mut none = TypeFilterModule::new(registry, paths, TypePredicate::regex("^Nope$").unwrap());
    assert!(collect_extents(&mut none).unwrap().is_empty());
}

#[test]
fn abort_stops_threaded_chain() {
    let schema = TypeRegistry::new().register(EVENT).unwrap();
    let keys: Vec<Vec<i32>> = (0..200).map(|_| vec![1; 50]).collect();
    let mut chain: Box<dyn ExtentModule> = SequenceModule::new(VecModule::new(events(&schema, &keys)))
        .then(|up| PrefetchBufferModule::new(up, 256))
        .then(|up| ParallelFilterModule::row_filter(up, 3, 256, "key", |_| true))
        .into_inner();
    assert!(chain.get_extent().unwrap().is_some());
    chain.abort_handle().unwrap().abort();
    assert!(chain.get_extent().unwrap().is_none());
}
