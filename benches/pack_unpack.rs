//! Frame pack / unpack throughput.
//!
//! Packs and unpacks a trace-like extent under each codec and reports
//! bytes/sec over the in-memory extent size.
//!
//! Run: cargo bench --bench pack_unpack

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use extentdb::codec::{Codec, CompressionConfig};
use extentdb::frame;
use extentdb::{
    DoubleField, Extent, ExtentSeries, Int32Field, Int64Field, TypeLibrary, TypeRegistry,
    Variable32Field,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TRACE: &str = r#"<ExtentType name="Bench::Trace" namespace="bench" version="1.0">
  <field type="int64" name="time" pack_relative="time" />
  <field type="int32" name="client" />
  <field type="int64" name="bytes" />
  <field type="double" name="latency" pack_scale="1e-6" opt_nullable="yes" />
  <field type="variable32" name="path" pack_unique="yes" />
</ExtentType>"#;

fn make_extent(rows: usize) -> (Extent, TypeLibrary) {
    let schema = TypeRegistry::new().register(TRACE).unwrap();
    let time = Int64Field::bound(&schema, "time").unwrap();
    let client = Int32Field::bound(&schema, "client").unwrap();
    let bytes = Int64Field::bound(&schema, "bytes").unwrap();
    let latency = DoubleField::bound(&schema, "latency").unwrap();
    let path = Variable32Field::bound(&schema, "path").unwrap();

    let mut s = ExtentSeries::for_schema(Arc::clone(&schema));
    for i in 0..rows {
        s.new_row();
        time.set(&mut s, 1_600_000_000_000 + (i as i64) * 37);
        client.set(&mut s, (i % 64) as i32);
        bytes.set(&mut s, ((i * 4099) % 65536) as i64);
        if i % 50 == 0 {
            latency.set_null(&mut s, true);
        } else {
            latency.set(&mut s, (i % 997) as f64 * 1e-6);
        }
        path.set(&mut s, format!("/export/home/user{}/file{}", i % 32, i % 256));
    }
    let mut library = TypeLibrary::new();
    library.add(schema).unwrap();
    (s.take_extent().unwrap(), library)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_pack(c: &mut Criterion) {
    let (extent, _) = make_extent(16_384);
    let mut group = c.benchmark_group("pack");
    group.throughput(Throughput::Bytes(extent.size_bytes() as u64));
    for codec in [Codec::None, Codec::Lz4, Codec::Gzip, Codec::Zstd] {
        let config = CompressionConfig::only(codec);
        group.bench_with_input(BenchmarkId::from_parameter(codec.as_str()), &config, |b, config| {
            b.iter(|| black_box(frame::pack(&extent, config).unwrap()));
        });
    }
    group.finish();
}

fn bench_unpack(c: &mut Criterion) {
    let (extent, library) = make_extent(16_384);
    let mut group = c.benchmark_group("unpack");
    group.throughput(Throughput::Bytes(extent.size_bytes() as u64));
    for codec in [Codec::None, Codec::Lz4, Codec::Gzip, Codec::Zstd] {
        let packed = frame::pack(&extent, &CompressionConfig::only(codec)).unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(codec.as_str()),
            &packed.bytes,
            |b, bytes| {
                b.iter(|| black_box(frame::unpack(bytes, &library).unwrap()));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pack, bench_unpack);
criterion_main!(benches);
