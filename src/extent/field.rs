//! Typed field accessors.
//!
//! A field starts unbound (name only) and is bound to a schema with
//! [`bind`](Int64Field::bind). Every access checks that the cursor is on a
//! row and that the field is bound to the schema of the extent the series
//! holds. A [`TypeCompat::Loose`] series also accepts other schemas that
//! carry a field of the same name and type; the field is looked up there by
//! name. Violations panic with the field name.

use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{read_u32, write_u32, Extent, ExtentSeries, TypeCompat};
use crate::error::{ExtentError, Result};
use crate::schema::{ExtentSchema, FieldInfo, FieldType};

// ── Binding ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum BindState {
    Unbound,
    Bound {
        schema: Arc<ExtentSchema>,
        info: FieldInfo,
    },
}

/// Name plus resolution state; shared by every accessor type.
#[derive(Debug, Clone)]
pub(crate) struct FieldBinding {
    name: String,
    state: BindState,
}

impl FieldBinding {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: BindState::Unbound,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_bound(&self) -> bool {
        matches!(self.state, BindState::Bound { .. })
    }

    pub(crate) fn info(&self) -> Option<&FieldInfo> {
        match &self.state {
            BindState::Bound { info, .. } => Some(info),
            BindState::Unbound => None,
        }
    }

    /// Resolve against `schema`; `expected = None` accepts any type.
    pub(crate) fn bind(
        &mut self,
        schema: &Arc<ExtentSchema>,
        expected: Option<FieldType>,
    ) -> Result<()> {
        if let BindState::Bound { schema: bound, .. } = &self.state {
            if Arc::ptr_eq(bound, schema) {
                return Ok(());
            }
        }
        let info = schema.field(&self.name).ok_or_else(|| {
            ExtentError::Schema(format!(
                "type '{}' has no field '{}'",
                schema.name(),
                self.name
            ))
        })?;
        if let Some(expected) = expected {
            if info.field_type != expected {
                return Err(ExtentError::Schema(format!(
                    "field '{}' of type '{}' is {}, not {}",
                    self.name,
                    schema.name(),
                    info.field_type.as_str(),
                    expected.as_str()
                )));
            }
        }
        self.state = BindState::Bound {
            schema: Arc::clone(schema),
            info: info.clone(),
        };
        Ok(())
    }

    /// Layout of this field within `extent`.
    ///
    /// # Panics
    /// If the field is unbound, or `extent` has a different schema and
    /// `compat` is `Exact`. Under `Loose`, a different schema must carry a
    /// field of the same name and type.
    pub(crate) fn check<'a>(&'a self, extent: &'a Extent, compat: TypeCompat) -> &'a FieldInfo {
        match &self.state {
            BindState::Unbound => panic!("field '{}' used before binding", self.name),
            BindState::Bound { schema, info } if Arc::ptr_eq(schema, extent.schema()) => info,
            BindState::Bound { schema, info } => {
                assert!(
                    compat == TypeCompat::Loose,
                    "field '{}' is bound to type '{}' but the series holds '{}'",
                    self.name,
                    schema.name(),
                    extent.type_name()
                );
                match extent.schema().field(&self.name) {
                    Some(other) if other.field_type == info.field_type => other,
                    Some(other) => panic!(
                        "field '{}' is {} in type '{}' but {} in '{}'",
                        self.name,
                        info.field_type.as_str(),
                        schema.name(),
                        other.field_type.as_str(),
                        extent.type_name()
                    ),
                    None => panic!(
                        "field '{}' is missing from type '{}'",
                        self.name,
                        extent.type_name()
                    ),
                }
            }
        }
    }

    pub(crate) fn resolve<'a, 's: 'a>(
        &'a self,
        series: &'s ExtentSeries,
    ) -> (&'a FieldInfo, &'s Extent, usize) {
        let compat = series.compat();
        let (extent, row) = series.current().unwrap_or_else(|| {
            panic!("field '{}': series cursor is not on a row", self.name)
        });
        (self.check(extent, compat), extent, row)
    }

    /// Like [`resolve`](Self::resolve); a loose rebind hands back a copy of
    /// the other schema's layout so the extent can be borrowed mutably.
    pub(crate) fn resolve_mut<'a, 's>(
        &'a self,
        series: &'s mut ExtentSeries,
    ) -> (Cow<'a, FieldInfo>, &'s mut Extent, usize) {
        let compat = series.compat();
        let name = &self.name;
        let (extent, row) = series
            .current_mut()
            .unwrap_or_else(|| panic!("field '{}': series cursor is not on a row", name));
        let info = match &self.state {
            BindState::Bound { schema, info } if Arc::ptr_eq(schema, extent.schema()) => {
                Cow::Borrowed(info)
            }
            _ => Cow::Owned(self.check(extent, compat).clone()),
        };
        (info, extent, row)
    }

    pub(crate) fn is_null(&self, series: &ExtentSeries) -> bool {
        let (info, extent, row) = self.resolve(series);
        extent.is_null_at(row, info)
    }

    pub(crate) fn set_null(&self, series: &mut ExtentSeries, null: bool) {
        let (info, extent, row) = self.resolve_mut(series);
        let bit = info
            .null_bit
            .unwrap_or_else(|| panic!("field '{}' is not nullable", info.name));
        let bytes = extent.row_bytes_mut(row);
        if null {
            bytes[bit.offset] |= bit.mask;
        } else {
            bytes[bit.offset] &= !bit.mask;
        }
    }

    /// Clear the null bit (if any) as part of a value write.
    fn mark_present(info: &FieldInfo, row: &mut [u8]) {
        if let Some(bit) = info.null_bit {
            row[bit.offset] &= !bit.mask;
        }
    }
}

macro_rules! binding_api {
    ($ty:expr) => {
        pub fn name(&self) -> &str {
            self.binding.name()
        }

        pub fn is_bound(&self) -> bool {
            self.binding.is_bound()
        }

        /// Resolve against `schema`. Rebinding to the schema already bound
        /// is a no-op.
        pub fn bind(&mut self, schema: &Arc<ExtentSchema>) -> Result<()> {
            self.binding.bind(schema, Some($ty))
        }

        pub fn is_null(&self, series: &ExtentSeries) -> bool {
            self.binding.is_null(series)
        }

        /// # Panics
        /// If the field is not nullable.
        pub fn set_null(&self, series: &mut ExtentSeries, null: bool) {
            self.binding.set_null(series, null)
        }
    };
}

// ── Fixed-width integers ────────────────────────────────────────────

pub trait FixedValue: Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const FIELD_TYPE: FieldType;
    const SIZE: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut [u8]);
}

impl FixedValue for u8 {
    const FIELD_TYPE: FieldType = FieldType::Byte;
    const SIZE: usize = 1;
    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }
    fn write(self, out: &mut [u8]) {
        out[0] = self;
    }
}

impl FixedValue for i32 {
    const FIELD_TYPE: FieldType = FieldType::Int32;
    const SIZE: usize = 4;
    fn read(bytes: &[u8]) -> Self {
        read_u32(bytes, 0) as i32
    }
    fn write(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }
}

impl FixedValue for i64 {
    const FIELD_TYPE: FieldType = FieldType::Int64;
    const SIZE: usize = 8;
    fn read(bytes: &[u8]) -> Self {
        super::read_u64(bytes, 0) as i64
    }
    fn write(self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct FixedField<T: FixedValue> {
    binding: FieldBinding,
    _marker: PhantomData<T>,
}

pub type ByteField = FixedField<u8>;
pub type Int32Field = FixedField<i32>;
pub type Int64Field = FixedField<i64>;

impl<T: FixedValue> FixedField<T> {
    pub fn new(name: &str) -> Self {
        Self {
            binding: FieldBinding::new(name),
            _marker: PhantomData,
        }
    }

    /// Construct and bind in one step.
    pub fn bound(schema: &Arc<ExtentSchema>, name: &str) -> Result<Self> {
        let mut field = Self::new(name);
        field.bind(schema)?;
        Ok(field)
    }

    binding_api!(T::FIELD_TYPE);

    /// Stored value; zero when the field is null.
    pub fn get(&self, series: &ExtentSeries) -> T {
        let (info, extent, row) = self.binding.resolve(series);
        if extent.is_null_at(row, info) {
            return T::default();
        }
        T::read(&extent.row_bytes(row)[info.offset..info.offset + T::SIZE])
    }

    pub fn get_opt(&self, series: &ExtentSeries) -> Option<T> {
        (!self.is_null(series)).then(|| self.get(series))
    }

    pub fn set(&self, series: &mut ExtentSeries, value: T) {
        let (info, extent, row) = self.binding.resolve_mut(series);
        let bytes = extent.row_bytes_mut(row);
        value.write(&mut bytes[info.offset..info.offset + T::SIZE]);
        FieldBinding::mark_present(&info, bytes);
    }
}

// ── Bool ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BoolField {
    binding: FieldBinding,
}

impl BoolField {
    pub fn new(name: &str) -> Self {
        Self {
            binding: FieldBinding::new(name),
        }
    }

    pub fn bound(schema: &Arc<ExtentSchema>, name: &str) -> Result<Self> {
        let mut field = Self::new(name);
        field.bind(schema)?;
        Ok(field)
    }

    binding_api!(FieldType::Bool);

    pub fn get(&self, series: &ExtentSeries) -> bool {
        let (info, extent, row) = self.binding.resolve(series);
        !extent.is_null_at(row, info) && extent.row_bytes(row)[info.offset] & info.bit_mask != 0
    }

    pub fn get_opt(&self, series: &ExtentSeries) -> Option<bool> {
        (!self.is_null(series)).then(|| self.get(series))
    }

    pub fn set(&self, series: &mut ExtentSeries, value: bool) {
        let (info, extent, row) = self.binding.resolve_mut(series);
        let bytes = extent.row_bytes_mut(row);
        if value {
            bytes[info.offset] |= info.bit_mask;
        } else {
            bytes[info.offset] &= !info.bit_mask;
        }
        FieldBinding::mark_present(&info, bytes);
    }
}

// ── Double ──────────────────────────────────────────────────────────

/// Double accessor. Applies the field's `opt_doublebase`: the row stores
/// `value - base`.
#[derive(Debug, Clone)]
pub struct DoubleField {
    binding: FieldBinding,
}

impl DoubleField {
    pub fn new(name: &str) -> Self {
        Self {
            binding: FieldBinding::new(name),
        }
    }

    pub fn bound(schema: &Arc<ExtentSchema>, name: &str) -> Result<Self> {
        let mut field = Self::new(name);
        field.bind(schema)?;
        Ok(field)
    }

    binding_api!(FieldType::Double);

    /// Stored value plus base; zero when the field is null.
    pub fn get(&self, series: &ExtentSeries) -> f64 {
        let (info, extent, row) = self.binding.resolve(series);
        if extent.is_null_at(row, info) {
            return 0.0;
        }
        let raw = f64::from_bits(super::read_u64(extent.row_bytes(row), info.offset));
        raw + info.double_base
    }

    pub fn get_opt(&self, series: &ExtentSeries) -> Option<f64> {
        (!self.is_null(series)).then(|| self.get(series))
    }

    pub fn set(&self, series: &mut ExtentSeries, value: f64) {
        let (info, extent, row) = self.binding.resolve_mut(series);
        let bytes = extent.row_bytes_mut(row);
        super::write_u64(bytes, info.offset, (value - info.double_base).to_bits());
        FieldBinding::mark_present(&info, bytes);
    }
}

// ── Variable32 ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Variable32Field {
    binding: FieldBinding,
}

impl Variable32Field {
    pub fn new(name: &str) -> Self {
        Self {
            binding: FieldBinding::new(name),
        }
    }

    pub fn bound(schema: &Arc<ExtentSchema>, name: &str) -> Result<Self> {
        let mut field = Self::new(name);
        field.bind(schema)?;
        Ok(field)
    }

    binding_api!(FieldType::Variable32);

    /// Raw bytes; empty when the field is null.
    pub fn get<'s>(&self, series: &'s ExtentSeries) -> &'s [u8] {
        let (info, extent, row) = self.binding.resolve(series);
        if extent.is_null_at(row, info) {
            return &[];
        }
        extent.variable_value(read_u32(extent.row_bytes(row), info.offset))
    }

    pub fn get_opt<'s>(&self, series: &'s ExtentSeries) -> Option<&'s [u8]> {
        (!self.is_null(series)).then(|| self.get(series))
    }

    /// Value as UTF-8, if it is valid UTF-8.
    pub fn get_str<'s>(&self, series: &'s ExtentSeries) -> Option<&'s str> {
        std::str::from_utf8(self.get(series)).ok()
    }

    pub fn size(&self, series: &ExtentSeries) -> usize {
        self.get(series).len()
    }

    /// Append `value` to the variable buffer and point the row at it.
    /// Bytes referenced by other rows are never touched.
    pub fn set(&self, series: &mut ExtentSeries, value: impl AsRef<[u8]>) {
        let (info, extent, row) = self.binding.resolve_mut(series);
        let offset = extent.append_variable(value.as_ref());
        let bytes = extent.row_bytes_mut(row);
        write_u32(bytes, info.offset, offset);
        FieldBinding::mark_present(&info, bytes);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
