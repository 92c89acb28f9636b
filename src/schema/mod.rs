//! Extent type schemas.
//!
//! A schema is an ordered table of typed fields with byte offsets inside a
//! fixed-size row. Schemas are built from their text form and never change
//! afterwards; extents compare them by identity (`Arc::ptr_eq`), so text
//! must always be resolved through a [`TypeRegistry`].
//!
//! Example row layout for `bool, byte, int32, variable32, int64, double`
//! under `small_to_big_sep_var32` with `original` padding:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     bool bits (bit 0)
//! 1       1     byte
//! 2       2     padding
//! 4       4     int32
//! 8       4     variable32 (offset into the variable buffer)
//! 12      4     padding
//! 16      8     int64
//! 24      8     double
//! ```

mod layout;
mod parse;
mod registry;

pub use registry::{TypeLibrary, TypeRegistry};

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::{ExtentError, Result};

// ── Constants ───────────────────────────────────────────────────────

/// Longest accepted type or field name.
pub const MAX_NAME_LEN: usize = 255;

/// Prefix reserved for types the engine itself writes.
pub const INTERNAL_TYPE_PREFIX: &str = "extentdb::";

/// Name of the trailing index extent type.
pub const INDEX_TYPE_NAME: &str = "extentdb::ExtentIndex";

/// Schema of the trailing index extent, one row per data frame.
pub const INDEX_SCHEMA_TEXT: &str = r#"<ExtentType name="extentdb::ExtentIndex" namespace="extentdb" version="1.0">
  <field type="int64" name="offset" pack_relative="offset" />
  <field type="int32" name="frame_size" />
  <field type="int32" name="records" />
  <field type="variable32" name="extenttype" pack_unique="yes" />
  <field type="byte" name="fixed_codec" />
  <field type="int32" name="fixed_stored_size" />
  <field type="byte" name="variable_codec" />
  <field type="int32" name="variable_stored_size" />
</ExtentType>
"#;

// ── Field types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FieldType {
    Bool,
    Byte,
    Int32,
    Int64,
    Double,
    Variable32,
}

impl FieldType {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "bool" => Some(FieldType::Bool),
            "byte" => Some(FieldType::Byte),
            "int32" => Some(FieldType::Int32),
            "int64" => Some(FieldType::Int64),
            "double" => Some(FieldType::Double),
            "variable32" => Some(FieldType::Variable32),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Byte => "byte",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Double => "double",
            FieldType::Variable32 => "variable32",
        }
    }

    /// Bytes occupied in the fixed row. Bools share bit bytes and report 0.
    pub fn fixed_size(self) -> usize {
        match self {
            FieldType::Bool => 0,
            FieldType::Byte => 1,
            FieldType::Int32 | FieldType::Variable32 => 4,
            FieldType::Int64 | FieldType::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrdering {
    #[default]
    SmallToBig,
    BigToSmall,
    Declaration,
}

impl FieldOrdering {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "small_to_big_sep_var32" => Some(FieldOrdering::SmallToBig),
            "big_to_small_sep_var32" => Some(FieldOrdering::BigToSmall),
            "declaration" => Some(FieldOrdering::Declaration),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldOrdering::SmallToBig => "small_to_big_sep_var32",
            FieldOrdering::BigToSmall => "big_to_small_sep_var32",
            FieldOrdering::Declaration => "declaration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadRecord {
    /// Record size rounded up to 8 bytes.
    #[default]
    Original,
    /// Record size rounded up to the largest fixed field.
    MaxColumnSize,
    /// Natural field alignment only.
    None,
}

impl PadRecord {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "original" => Some(PadRecord::Original),
            "max_column_size" => Some(PadRecord::MaxColumnSize),
            "none" => Some(PadRecord::None),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PadRecord::Original => "original",
            PadRecord::MaxColumnSize => "max_column_size",
            PadRecord::None => "none",
        }
    }
}

/// Delta encoding applied at pack time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relative {
    /// Delta from the same field in the previous non-null row.
    SelfPrevious,
    /// Delta from another (earlier) field of the same row, by column index.
    Field(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullBit {
    pub offset: usize,
    pub mask: u8,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    /// Declaration index.
    pub column: usize,
    pub offset: usize,
    /// Bit within the byte at `offset`; bool fields only.
    pub bit_mask: u8,
    pub null_bit: Option<NullBit>,
    pub unique: bool,
    pub scale: Option<f64>,
    pub double_base: f64,
    pub relative: Option<Relative>,
}

impl FieldInfo {
    pub fn is_nullable(&self) -> bool {
        self.null_bit.is_some()
    }
}

// ── ExtentSchema ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ExtentSchema {
    name: String,
    namespace: String,
    version: (u32, u32),
    text: String,
    ordering: FieldOrdering,
    pad_record: PadRecord,
    fields: Vec<FieldInfo>,
    by_name: HashMap<String, usize>,
    row_size: usize,
    fingerprint: blake3::Hash,
}

impl ExtentSchema {
    /// Parse schema text and compute its layout.
    ///
    /// Prefer [`TypeRegistry::register`], which preserves identity for
    /// repeated registrations of the same text.
    pub fn from_text(text: &str) -> Result<Self> {
        let decl = parse::parse_schema(text)?;
        let (fields, row_size) = layout::compute_layout(&decl);
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        tracing::debug!(
            type_name = %decl.name,
            fields = fields.len(),
            row_size,
            "computed extent layout"
        );

        Ok(Self {
            name: decl.name,
            namespace: decl.namespace,
            version: decl.version,
            text: text.to_string(),
            ordering: decl.ordering,
            pad_record: decl.pad_record,
            fields,
            by_name,
            row_size,
            fingerprint: blake3::hash(text.as_bytes()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    /// The exact text this schema was registered from.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn ordering(&self) -> FieldOrdering {
        self.ordering
    }

    pub fn pad_record(&self) -> PadRecord {
        self.pad_record
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn is_internal(&self) -> bool {
        self.name.starts_with(INTERNAL_TYPE_PREFIX)
    }

    pub fn variable_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::Variable32)
    }

    pub fn fingerprint(&self) -> &blake3::Hash {
        &self.fingerprint
    }

    /// Render schema text for a subset of this schema's fields.
    ///
    /// Field-relative packing against a field that is not selected is
    /// dropped; every other option is carried over.
    pub fn select_fields(&self, names: &[&str], new_name: &str) -> Result<String> {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let idx = self.field_index(name).ok_or_else(|| {
                ExtentError::Schema(format!("type '{}' has no field '{}'", self.name, name))
            })?;
            selected.push(idx);
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "<ExtentType name=\"{}\" namespace=\"{}\" version=\"{}.{}\" pack_field_ordering=\"{}\" pack_pad_record=\"{}\">",
            parse::escape(new_name),
            parse::escape(&self.namespace),
            self.version.0,
            self.version.1,
            self.ordering.as_str(),
            self.pad_record.as_str(),
        );
        for &idx in &selected {
            let f = &self.fields[idx];
            let _ = write!(
                out,
                "  <field type=\"{}\" name=\"{}\"",
                f.field_type.as_str(),
                parse::escape(&f.name)
            );
            if f.is_nullable() {
                out.push_str(" opt_nullable=\"yes\"");
            }
            if f.unique {
                out.push_str(" pack_unique=\"yes\"");
            }
            if let Some(scale) = f.scale {
                let _ = write!(out, " pack_scale=\"{}\"", scale);
            }
            if f.double_base != 0.0 {
                let _ = write!(out, " opt_doublebase=\"{}\"", f.double_base);
            }
            match f.relative {
                Some(Relative::SelfPrevious) => {
                    let _ = write!(out, " pack_relative=\"{}\"", parse::escape(&f.name));
                }
                Some(Relative::Field(base)) if selected.contains(&base) => {
                    let _ = write!(
                        out,
                        " pack_relative=\"{}\"",
                        parse::escape(&self.fields[base].name)
                    );
                }
                _ => {}
            }
            out.push_str(" />\n");
        }
        out.push_str("</ExtentType>\n");
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
