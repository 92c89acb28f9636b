//! In-memory extents.
//!
//! An extent is a batch of rows sharing one schema: a fixed buffer of
//! `row_count * row_size` bytes and a variable buffer holding the payload
//! of every variable32 field. Rows reference variable values by offset.
//!
//! Variable buffer layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     zero (offset 0 is the empty value)
//! o       4     value length n        (payload at o + 4 is 8-byte aligned)
//! o+4     n     value bytes
//! ..      pad   zero bytes up to the next entry
//! ```
//!
//! Buffers are reference counted and copied on write, so cloning an
//! extent to hand it between pipeline stages is cheap.

mod field;
mod general;
mod series;

pub use field::{
    BoolField, ByteField, DoubleField, FixedField, FixedValue, Int32Field, Int64Field,
    Variable32Field,
};
pub use general::{FieldValue, GeneralField};
pub use series::{ExtentSeries, TypeCompat};

use std::sync::Arc;

use crate::error::{ExtentError, Result};
use crate::schema::{ExtentSchema, FieldInfo, FieldType};

/// Leading zero bytes of every variable buffer.
pub const VARIABLE_PREFIX: usize = 4;

/// Alignment of variable value payloads.
pub const VARIABLE_ALIGN: usize = 8;

// ── Raw little-endian access ────────────────────────────────────────

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Append one value entry to a variable buffer, returning its offset.
pub(crate) fn push_variable(buffer: &mut Vec<u8>, value: &[u8]) -> u32 {
    if value.is_empty() {
        return 0;
    }
    let offset = buffer.len();
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.extend_from_slice(value);
    let entry = (4 + value.len()).div_ceil(VARIABLE_ALIGN) * VARIABLE_ALIGN;
    buffer.resize(offset + entry, 0);
    u32::try_from(offset).expect("variable buffer exceeds 4 GiB")
}

/// Value stored at `offset`, or `None` if the entry is out of bounds.
pub(crate) fn variable_at(buffer: &[u8], offset: u32) -> Option<&[u8]> {
    if offset == 0 {
        return Some(&[]);
    }
    let start = offset as usize;
    if start % VARIABLE_ALIGN != VARIABLE_PREFIX || start + 4 > buffer.len() {
        return None;
    }
    let len = read_u32(buffer, start) as usize;
    buffer.get(start + 4..start + 4 + len)
}

// ── Extent ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Extent {
    schema: Arc<ExtentSchema>,
    fixed: Arc<Vec<u8>>,
    variable: Arc<Vec<u8>>,
}

impl Extent {
    pub fn new(schema: Arc<ExtentSchema>) -> Self {
        Self {
            schema,
            fixed: Arc::new(Vec::new()),
            variable: Arc::new(vec![0u8; VARIABLE_PREFIX]),
        }
    }

    /// Build an extent from decoded buffers, checking that the fixed
    /// buffer holds whole rows and every variable offset is in bounds.
    pub(crate) fn from_parts(
        schema: Arc<ExtentSchema>,
        fixed: Vec<u8>,
        variable: Vec<u8>,
    ) -> Result<Self> {
        let row_size = schema.row_size();
        if fixed.len() % row_size != 0 {
            return Err(ExtentError::CorruptData(format!(
                "fixed buffer of {} bytes is not a multiple of the {}-byte row of '{}'",
                fixed.len(),
                row_size,
                schema.name()
            )));
        }
        if variable.len() < VARIABLE_PREFIX
            || variable[..VARIABLE_PREFIX] != [0u8; VARIABLE_PREFIX]
            || variable.len() % VARIABLE_ALIGN != VARIABLE_PREFIX
        {
            return Err(ExtentError::CorruptData(format!(
                "malformed variable buffer of {} bytes",
                variable.len()
            )));
        }
        for (row, bytes) in fixed.chunks_exact(row_size).enumerate() {
            for field in schema.variable_fields() {
                let offset = read_u32(bytes, field.offset);
                if variable_at(&variable, offset).is_none() {
                    return Err(ExtentError::CorruptData(format!(
                        "row {} field '{}' references variable offset {} outside {} bytes",
                        row,
                        field.name,
                        offset,
                        variable.len()
                    )));
                }
            }
        }
        Ok(Self {
            schema,
            fixed: Arc::new(fixed),
            variable: Arc::new(variable),
        })
    }

    pub fn schema(&self) -> &Arc<ExtentSchema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    pub fn row_count(&self) -> usize {
        self.fixed.len() / self.schema.row_size()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty()
    }

    /// In-memory footprint of both buffers.
    pub fn size_bytes(&self) -> usize {
        self.fixed.len() + self.variable.len()
    }

    pub fn fixed_data(&self) -> &[u8] {
        &self.fixed
    }

    pub fn variable_data(&self) -> &[u8] {
        &self.variable
    }

    pub fn same_schema(&self, other: &Extent) -> bool {
        Arc::ptr_eq(&self.schema, &other.schema)
    }

    /// Append one zero-initialized row and return its index.
    pub fn append_row(&mut self) -> usize {
        let row = self.row_count();
        let row_size = self.schema.row_size();
        let fixed = Arc::make_mut(&mut self.fixed);
        fixed.resize(fixed.len() + row_size, 0);
        row
    }

    /// Append `count` zero-initialized rows.
    pub fn create_rows(&mut self, count: usize) {
        let row_size = self.schema.row_size();
        let fixed = Arc::make_mut(&mut self.fixed);
        fixed.resize(fixed.len() + count * row_size, 0);
    }

    pub fn clear(&mut self) {
        self.fixed = Arc::new(Vec::new());
        self.variable = Arc::new(vec![0u8; VARIABLE_PREFIX]);
    }

    pub(crate) fn row_bytes(&self, row: usize) -> &[u8] {
        let size = self.schema.row_size();
        &self.fixed[row * size..(row + 1) * size]
    }

    pub(crate) fn row_bytes_mut(&mut self, row: usize) -> &mut [u8] {
        let size = self.schema.row_size();
        &mut Arc::make_mut(&mut self.fixed)[row * size..(row + 1) * size]
    }

    /// Variable value referenced by `offset`.
    ///
    /// # Panics
    /// If `offset` does not reference an entry of this extent.
    pub(crate) fn variable_value(&self, offset: u32) -> &[u8] {
        variable_at(&self.variable, offset).unwrap_or_else(|| {
            panic!(
                "variable offset {} is outside the {}-byte buffer of '{}'",
                offset,
                self.variable.len(),
                self.schema.name()
            )
        })
    }

    pub(crate) fn append_variable(&mut self, value: &[u8]) -> u32 {
        push_variable(Arc::make_mut(&mut self.variable), value)
    }

    /// Append a copy of `src`'s row (including its variable values).
    ///
    /// # Panics
    /// If `src` has a different schema identity.
    pub fn copy_row_from(&mut self, src: &Extent, row: usize) -> usize {
        assert!(
            self.same_schema(src),
            "cannot copy a '{}' row into a '{}' extent",
            src.type_name(),
            self.type_name()
        );
        let dest = self.append_row();
        let row_size = self.schema.row_size();
        let schema = Arc::clone(&self.schema);
        Arc::make_mut(&mut self.fixed)[dest * row_size..(dest + 1) * row_size]
            .copy_from_slice(src.row_bytes(row));
        for field in schema.variable_fields() {
            let value = src.variable_value(read_u32(src.row_bytes(row), field.offset));
            let offset = self.append_variable(value);
            write_u32(self.row_bytes_mut(dest), field.offset, offset);
        }
        dest
    }

    /// Copy into a fresh extent, dropping variable bytes no row references.
    pub fn compact(&self) -> Extent {
        let mut out = Extent::new(Arc::clone(&self.schema));
        for row in 0..self.row_count() {
            out.copy_row_from(self, row);
        }
        out
    }

    pub(crate) fn is_null_at(&self, row: usize, field: &FieldInfo) -> bool {
        field
            .null_bit
            .is_some_and(|bit| self.row_bytes(row)[bit.offset] & bit.mask != 0)
    }

    /// Field-by-field comparison of two rows of the same schema; null
    /// fields compare by null state only, variable fields by content.
    pub fn row_eq(&self, row: usize, other: &Extent, other_row: usize) -> bool {
        if !self.same_schema(other) {
            return false;
        }
        let a = self.row_bytes(row);
        let b = other.row_bytes(other_row);
        self.schema.fields().iter().all(|field| {
            let null_a = self.is_null_at(row, field);
            if null_a != other.is_null_at(other_row, field) {
                return false;
            }
            if null_a {
                return true;
            }
            let at = field.offset;
            match field.field_type {
                FieldType::Bool => (a[at] & field.bit_mask) == (b[at] & field.bit_mask),
                FieldType::Variable32 => {
                    self.variable_value(read_u32(a, at)) == other.variable_value(read_u32(b, at))
                }
                t => a[at..at + t.fixed_size()] == b[at..at + t.fixed_size()],
            }
        })
    }
}

impl PartialEq for Extent {
    fn eq(&self, other: &Self) -> bool {
        self.same_schema(other)
            && self.row_count() == other.row_count()
            && (0..self.row_count()).all(|row| self.row_eq(row, other, row))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
