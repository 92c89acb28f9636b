//! Type-erased field access, for stages that only learn the field type at
//! runtime (filters, sort, text output).

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::field::FieldBinding;
use super::{read_u32, read_u64, write_u32, write_u64, Extent, ExtentSeries, TypeCompat};
use crate::error::{ExtentError, Result};
use crate::schema::{ExtentSchema, FieldInfo, FieldType};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Null,
    Bool(bool),
    Byte(u8),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Bytes(&'a [u8]),
}

impl FieldValue<'_> {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view; bools count as 0 / 1.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Bool(b) => Some(b as u8 as f64),
            FieldValue::Byte(v) => Some(v as f64),
            FieldValue::Int32(v) => Some(v as f64),
            FieldValue::Int64(v) => Some(v as f64),
            FieldValue::Double(v) => Some(v),
            FieldValue::Null | FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Bool(b) => Some(b as i64),
            FieldValue::Byte(v) => Some(v as i64),
            FieldValue::Int32(v) => Some(v as i64),
            FieldValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(*b),
            _ => None,
        }
    }

    /// Total order used by the default sort: null first, then numbers
    /// (compared numerically across widths), then byte strings.
    pub fn natural_cmp(&self, other: &FieldValue<'_>) -> Ordering {
        fn rank(v: &FieldValue<'_>) -> u8 {
            match v {
                FieldValue::Null => 0,
                FieldValue::Bytes(_) => 2,
                _ => 1,
            }
        }
        match (self, other) {
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a.cmp(b),
            (FieldValue::Double(_), _) | (_, FieldValue::Double(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a.total_cmp(&b),
                    _ => rank(self).cmp(&rank(other)),
                }
            }
            _ => match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => rank(self).cmp(&rank(other)),
            },
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            FieldValue::Byte(v) => write!(f, "{}", v),
            FieldValue::Int32(v) => write!(f, "{}", v),
            FieldValue::Int64(v) => write!(f, "{}", v),
            FieldValue::Double(v) => write!(f, "{}", v),
            FieldValue::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

fn read_value<'e>(info: &FieldInfo, extent: &'e Extent, row: usize) -> FieldValue<'e> {
    if extent.is_null_at(row, info) {
        return FieldValue::Null;
    }
    let bytes = extent.row_bytes(row);
    let at = info.offset;
    match info.field_type {
        FieldType::Bool => FieldValue::Bool(bytes[at] & info.bit_mask != 0),
        FieldType::Byte => FieldValue::Byte(bytes[at]),
        FieldType::Int32 => FieldValue::Int32(read_u32(bytes, at) as i32),
        FieldType::Int64 => FieldValue::Int64(read_u64(bytes, at) as i64),
        FieldType::Double => FieldValue::Double(f64::from_bits(read_u64(bytes, at)) + info.double_base),
        FieldType::Variable32 => FieldValue::Bytes(extent.variable_value(read_u32(bytes, at))),
    }
}

/// Accessor that works for a field of any type.
#[derive(Debug, Clone)]
pub struct GeneralField {
    binding: FieldBinding,
}

impl GeneralField {
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

    pub fn name(&self) -> &str {
        self.binding.name()
    }

    pub fn bind(&mut self, schema: &Arc<ExtentSchema>) -> Result<()> {
        self.binding.bind(schema, None)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    pub fn field_type(&self) -> Option<FieldType> {
        self.binding.info().map(|i| i.field_type)
    }

    pub fn get<'s>(&self, series: &'s ExtentSeries) -> FieldValue<'s> {
        let (info, extent, row) = self.binding.resolve(series);
        read_value(info, extent, row)
    }

    /// Value at `row` of `extent`, without a series.
    ///
    /// # Panics
    /// Under the same conditions as [`get`](Self::get), or if `row` is out
    /// of range.
    pub fn get_at<'e>(&self, extent: &'e Extent, row: usize) -> FieldValue<'e> {
        let info = self.binding.check(extent, TypeCompat::Exact);
        assert!(
            row < extent.row_count(),
            "field '{}': row {} of {}",
            self.name(),
            row,
            extent.row_count()
        );
        read_value(info, extent, row)
    }

    /// Store `value`, which must match the field's type (or be `Null` for a
    /// nullable field).
    pub fn set(&self, series: &mut ExtentSeries, value: &FieldValue<'_>) -> Result<()> {
        if value.is_null() {
            let nullable = self.binding.resolve(series).0.is_nullable();
            if !nullable {
                return Err(ExtentError::Schema(format!(
                    "field '{}' is not nullable",
                    self.name()
                )));
            }
            self.binding.set_null(series, true);
            return Ok(());
        }

        let (info, extent, row) = self.binding.resolve_mut(series);
        let at = info.offset;
        match (info.field_type, *value) {
            (FieldType::Bool, FieldValue::Bool(b)) => {
                let bytes = extent.row_bytes_mut(row);
                if b {
                    bytes[at] |= info.bit_mask;
                } else {
                    bytes[at] &= !info.bit_mask;
                }
            }
            (FieldType::Byte, FieldValue::Byte(v)) => extent.row_bytes_mut(row)[at] = v,
            (FieldType::Int32, FieldValue::Int32(v)) => {
                write_u32(extent.row_bytes_mut(row), at, v as u32)
            }
            (FieldType::Int64, FieldValue::Int64(v)) => {
                write_u64(extent.row_bytes_mut(row), at, v as u64)
            }
            (FieldType::Double, FieldValue::Double(v)) => write_u64(
                extent.row_bytes_mut(row),
                at,
                (v - info.double_base).to_bits(),
            ),
            (FieldType::Variable32, FieldValue::Bytes(b)) => {
                let offset = extent.append_variable(b);
                write_u32(extent.row_bytes_mut(row), at, offset);
            }
            (ty, other) => {
                return Err(ExtentError::Schema(format!(
                    "cannot store {:?} in {} field '{}'",
                    other,
                    ty.as_str(),
                    info.name
                )))
            }
        }
        if let Some(bit) = info.null_bit {
            extent.row_bytes_mut(row)[bit.offset] &= !bit.mask;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeRegistry;

    #[test]
    fn test_general_get_set_all_types() {
        let schema = TypeRegistry::new()
            .register(
                r#"<ExtentType name="G">
  <field type="bool" name="b" />
  <field type="byte" name="y" />
  <field type="int32" name="i" />
  <field type="int64" name="l" opt_nullable="yes" />
  <field type="double" name="d" />
  <field type="variable32" name="v" />
</ExtentType>"#,
            )
            .unwrap();
        let mut series = ExtentSeries::for_schema(Arc::clone(&schema));
        series.new_row();

        let values = [
            ("b", FieldValue::Bool(true)),
            ("y", FieldValue::Byte(200)),
            ("i", FieldValue::Int32(-5)),
            ("l", FieldValue::Null),
            ("d", FieldValue::Double(2.5)),
            ("v", FieldValue::Bytes(b"hello")),
        ];
        for (name, value) in &values {
            GeneralField::bound(&schema, name)
                .unwrap()
                .set(&mut series, value)
                .unwrap();
        }
        for (name, value) in &values {
            let field = GeneralField::bound(&schema, name).unwrap();
            assert_eq!(field.get(&series), *value, "field {}", name);
        }

        let y = GeneralField::bound(&schema, "y").unwrap();
        assert!(y.set(&mut series, &FieldValue::Int64(1)).is_err());
        assert!(y.set(&mut series, &FieldValue::Null).is_err());
    }

    #[test]
    fn test_natural_order() {
        let mut values = vec![
            FieldValue::Bytes(b"b"),
            FieldValue::Double(1.5),
            FieldValue::Int32(2),
            FieldValue::Null,
            FieldValue::Int64(-3),
            FieldValue::Bytes(b"a"),
        ];
        values.sort_by(|a, b| a.natural_cmp(b));
        assert_eq!(
            values,
            vec![
                FieldValue::Null,
                FieldValue::Int64(-3),
                FieldValue::Double(1.5),
                FieldValue::Int32(2),
                FieldValue::Bytes(b"a"),
                FieldValue::Bytes(b"b"),
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(FieldValue::Bool(false).to_string(), "F");
        assert_eq!(FieldValue::Bytes(b"x y").to_string(), "x y");
        assert_eq!(FieldValue::Null.to_string(), "null");
    }
}
