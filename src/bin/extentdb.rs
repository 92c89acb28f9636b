//! extentdb - command-line tools for extent files.
//!
//! Usage:
//!   extentdb text <files..> [--type MATCH] [--fields a,b] [--output P]
//!   extentdb select <input> <output> --type MATCH --fields a,b
//!   extentdb recover <input> <output> [--max-failures N]
//!   extentdb index <file>
//!
//! Logging goes to standard error and is controlled by `RUST_LOG`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use extentdb::config::{PipelineConfig, SinkConfig};
use extentdb::file::{recover, FileSink, FileSource, RecoverConfig};
use extentdb::module::{
    ExtentModule, FileSourceModule, PrefetchBufferModule, SequenceModule, TypeFilterModule,
    TypePredicate,
};
use extentdb::resource::ResourceManager;
use extentdb::{Extent, ExtentSeries, GeneralField, TypeRegistry};

#[derive(Parser)]
#[command(name = "extentdb")]
#[command(about = "Inspect, convert and salvage extent files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print rows as tab-separated text
    Text {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Only extents whose type name matches this regex
        #[arg(long = "type")]
        type_match: Option<String>,
        /// Comma-separated fields to print (default: all)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Write to a file instead of standard output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Copy a subset of one type's fields into a new file
    Select {
        input: PathBuf,
        output: PathBuf,
        /// Type name, unique prefix or unique substring
        #[arg(long = "type")]
        type_match: String,
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
    },
    /// Salvage every intact extent of a damaged file
    Recover {
        input: PathBuf,
        output: PathBuf,
        /// Corrupt frames tolerated in a row before giving up
        #[arg(long)]
        max_failures: Option<usize>,
    },
    /// Print the frame index as JSON lines
    Index { file: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("extentdb: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let registry = Arc::new(TypeRegistry::new());
    match cli.command {
        Command::Text {
            files,
            type_match,
            fields,
            output,
        } => text(registry, files, type_match, fields, output),
        Command::Select {
            input,
            output,
            type_match,
            fields,
        } => select(&registry, &input, &output, &type_match, &fields),
        Command::Recover {
            input,
            output,
            max_failures,
        } => {
            let mut config = RecoverConfig::default();
            if let Some(n) = max_failures {
                config.max_consecutive_failures = n;
            }
            let report = recover(&input, &output, &registry, &config)
                .with_context(|| format!("recovering {}", input.display()))?;
            eprintln!(
                "recovered {} extents ({} rows), skipped {} bytes in {} corrupt regions{}",
                report.extents_recovered,
                report.rows_recovered,
                report.bytes_skipped,
                report.corrupt_regions,
                if report.truncated_tail { ", input truncated" } else { "" }
            );
            Ok(())
        }
        Command::Index { file } => index(&registry, &file),
    }
}

// ── text ────────────────────────────────────────────────────────────

fn text(
    registry: Arc<TypeRegistry>,
    files: Vec<PathBuf>,
    type_match: Option<String>,
    fields: Vec<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = PipelineConfig::from_tuning(&ResourceManager::auto_tune());
    let source: Box<dyn ExtentModule> = match type_match {
        Some(pattern) => Box::new(TypeFilterModule::new(
            registry,
            files,
            TypePredicate::regex(&pattern)?,
        )),
        None => Box::new(FileSourceModule::new(registry, files)),
    };
    let mut pipeline = SequenceModule::new(source)
        .then(|up| PrefetchBufferModule::new(up, config.prefetch_max_bytes));

    let out: Box<dyn Write> = match &output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(out);
    while let Some(extent) = pipeline.get_extent()? {
        write_extent_text(&mut out, &extent, &fields)?;
    }
    out.flush()?;
    Ok(())
}

fn write_extent_text(out: &mut impl Write, extent: &Extent, fields: &[String]) -> Result<()> {
    let names: Vec<&str> = if fields.is_empty() {
        extent.schema().fields().iter().map(|f| f.name.as_str()).collect()
    } else {
        fields.iter().map(String::as_str).collect()
    };
    let accessors = names
        .iter()
        .map(|name| GeneralField::bound(extent.schema(), name))
        .collect::<extentdb::Result<Vec<_>>>()?;

    writeln!(out, "# extent type {} ({} rows)", extent.type_name(), extent.row_count())?;
    writeln!(out, "{}", names.join("\t"))?;
    for row in 0..extent.row_count() {
        for (i, field) in accessors.iter().enumerate() {
            if i > 0 {
                out.write_all(b"\t")?;
            }
            write!(out, "{}", field.get_at(extent, row))?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}

// ── select ──────────────────────────────────────────────────────────

fn select(
    registry: &Arc<TypeRegistry>,
    input: &Path,
    output: &Path,
    type_match: &str,
    fields: &[String],
) -> Result<()> {
    let source = FileSource::open(input, registry)
        .with_context(|| format!("opening {}", input.display()))?;
    let from = Arc::clone(source.library().get_match(type_match)?);
    drop(source);

    let names: Vec<&str> = fields.iter().map(String::as_str).collect();
    let to = registry.register(&from.select_fields(&names, from.name())?)?;

    let mut readers = Vec::with_capacity(names.len());
    let mut writers = Vec::with_capacity(names.len());
    for name in &names {
        readers.push(GeneralField::bound(&from, name)?);
        writers.push(GeneralField::bound(&to, name)?);
    }

    let mut sink = FileSink::create(output, registry, SinkConfig::default())
        .with_context(|| format!("creating {}", output.display()))?;
    sink.write_type_library(&[Arc::clone(&to)])?;

    let mut module = TypeFilterModule::new(
        Arc::clone(registry),
        [input.to_path_buf()],
        TypePredicate::Exact(from.name().to_string()),
    );
    while let Some(extent) = module.get_extent()? {
        if !Arc::ptr_eq(extent.schema(), &from) {
            bail!("type '{}' changed while reading {}", from.name(), input.display());
        }
        let mut series = ExtentSeries::for_schema(Arc::clone(&to));
        for row in 0..extent.row_count() {
            series.new_row();
            for (reader, writer) in readers.iter().zip(&writers) {
                writer.set(&mut series, &reader.get_at(&extent, row))?;
            }
        }
        if let Some(selected) = series.take_extent() {
            sink.write_extent(&selected)?;
        }
    }
    let stats = sink.close()?;
    eprintln!("wrote {} extents ({} rows) to {}", stats.extents, stats.rows, output.display());
    Ok(())
}

// ── index ───────────────────────────────────────────────────────────

fn index(registry: &TypeRegistry, file: &Path) -> Result<()> {
    let source =
        FileSource::open(file, registry).with_context(|| format!("opening {}", file.display()))?;
    let Some(entries) = source.index_entries()? else {
        bail!("{} has no index (not closed cleanly?)", file.display());
    };
    let mut out = BufWriter::new(io::stdout().lock());
    for entry in entries {
        writeln!(out, "{}", serde_json::to_string(&entry)?)?;
    }
    out.flush()?;
    Ok(())
}
