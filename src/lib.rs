//! ExtentDB - self-describing columnar extent files.
//!
//! Rows of one type are batched into extents, packed column-aware with
//! per-field transforms, compressed, checksummed and appended to a file
//! that carries its own type library and an index of every frame.
//! Analyses read files back through a pull-based pipeline of modules.
//!
//! ```text
//! schema   - XML type definitions, row layout, registry
//! extent   - in-memory rows, series cursor, typed field accessors
//! codec    - lz4 / gzip / zstd and checksums
//! frame    - pack / unpack of one extent
//! file     - sink, source, index, recovery
//! module   - pipeline stages (filter, prefetch, parallel, sort)
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod extent;
pub mod file;
pub mod frame;
pub mod interfaces;
pub mod module;
pub mod resource;
pub mod schema;

pub use codec::{Codec, CompressionConfig};
pub use config::{PipelineConfig, SinkConfig};
pub use error::{ExtentError, Result};
pub use extent::{
    BoolField, ByteField, DoubleField, Extent, ExtentSeries, FieldValue, GeneralField, Int32Field,
    Int64Field, TypeCompat, Variable32Field,
};
pub use file::{recover, FileSink, FileSource, RecoverConfig, RecoveryReport, SinkStats};
pub use module::{collect_extents, AbortHandle, ExtentModule};
pub use resource::{ResourceManager, SystemResources, TuningProfile};
pub use schema::{ExtentSchema, FieldType, TypeLibrary, TypeRegistry};
