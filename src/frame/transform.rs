//! Value transforms applied between the in-memory rows and the coded
//! buffers that get compressed.
//!
//! Encode, per row:
//! 1. null fields are zeroed and variable values are copied into a fresh
//!    buffer (`pack_unique` values shared);
//! 2. scaled doubles become `round(raw / scale)` as i64;
//! 3. field-relative values become deltas, in reverse declaration order;
//! 4. self-relative values become deltas from the previous non-null row.
//!
//! Decode runs steps 4, 3 and 2 in reverse. Null fields are skipped by
//! every step, so a null row never moves the self-relative base.

use std::collections::HashMap;

use crate::extent::{push_variable, read_u32, read_u64, write_u32, write_u64, Extent, VARIABLE_PREFIX};
use crate::schema::{ExtentSchema, FieldInfo, FieldType, Relative};

/// Rounding error (in scale units) above which a scaled value is reported.
const SCALE_WARN_THRESHOLD: f64 = 0.1;

fn is_null(row: &[u8], field: &FieldInfo) -> bool {
    field
        .null_bit
        .is_some_and(|bit| row[bit.offset] & bit.mask != 0)
}

fn read_int(row: &[u8], field: &FieldInfo) -> i64 {
    match field.field_type {
        FieldType::Int32 => read_u32(row, field.offset) as i32 as i64,
        _ => read_u64(row, field.offset) as i64,
    }
}

fn write_int(row: &mut [u8], field: &FieldInfo, value: i64) {
    match field.field_type {
        FieldType::Int32 => write_u32(row, field.offset, value as i32 as u32),
        _ => write_u64(row, field.offset, value as u64),
    }
}

fn zero_value(row: &mut [u8], field: &FieldInfo) {
    match field.field_type {
        FieldType::Bool => row[field.offset] &= !field.bit_mask,
        t => row[field.offset..field.offset + t.fixed_size()].fill(0),
    }
}

struct Plan<'a> {
    scaled: Vec<&'a FieldInfo>,
    /// (field, base) pairs in declaration order.
    field_relative: Vec<(&'a FieldInfo, &'a FieldInfo)>,
    self_relative: Vec<&'a FieldInfo>,
}

impl<'a> Plan<'a> {
    fn new(schema: &'a ExtentSchema) -> Self {
        let fields = schema.fields();
        let mut plan = Plan {
            scaled: Vec::new(),
            field_relative: Vec::new(),
            self_relative: Vec::new(),
        };
        for field in fields {
            if field.field_type == FieldType::Double && field.scale.is_some() {
                plan.scaled.push(field);
            }
            match field.relative {
                Some(Relative::SelfPrevious) => plan.self_relative.push(field),
                Some(Relative::Field(base)) => plan.field_relative.push((field, &fields[base])),
                None => {}
            }
        }
        plan
    }
}

/// Build the coded fixed and variable buffers for `extent`.
pub(super) fn encode(extent: &Extent) -> (Vec<u8>, Vec<u8>) {
    let schema = extent.schema();
    let plan = Plan::new(schema);
    let mut fixed = extent.fixed_data().to_vec();
    let mut variable = vec![0u8; VARIABLE_PREFIX];
    let mut unique: HashMap<&[u8], u32> = HashMap::new();
    let mut previous = vec![0i64; schema.fields().len()];
    let mut warned = vec![false; schema.fields().len()];

    for (row_index, row) in fixed.chunks_exact_mut(schema.row_size()).enumerate() {
        for field in schema.fields() {
            if is_null(row, field) {
                zero_value(row, field);
                continue;
            }
            if field.field_type == FieldType::Variable32 {
                let value = extent.variable_value(read_u32(row, field.offset));
                let offset = if field.unique && !value.is_empty() {
                    *unique
                        .entry(value)
                        .or_insert_with(|| push_variable(&mut variable, value))
                } else {
                    push_variable(&mut variable, value)
                };
                write_u32(row, field.offset, offset);
            }
        }

        for field in &plan.scaled {
            if is_null(row, field) {
                continue;
            }
            let scale = field.scale.unwrap_or(1.0);
            let scaled = f64::from_bits(read_u64(row, field.offset)) / scale;
            let rounded = scaled.round();
            if (scaled - rounded).abs() > SCALE_WARN_THRESHOLD && !warned[field.column] {
                warned[field.column] = true;
                tracing::warn!(
                    field = %field.name,
                    row = row_index,
                    value = scaled * scale,
                    scale,
                    "pack_scale rounding error above threshold"
                );
            }
            write_u64(row, field.offset, rounded as i64 as u64);
        }

        for (field, base) in plan.field_relative.iter().rev() {
            if is_null(row, field) {
                continue;
            }
            let delta = read_int(row, field).wrapping_sub(read_int(row, base));
            write_int(row, field, delta);
        }

        for field in &plan.self_relative {
            if is_null(row, field) {
                continue;
            }
            let value = read_int(row, field);
            write_int(row, field, value.wrapping_sub(previous[field.column]));
            previous[field.column] = value;
        }
    }

    (fixed, variable)
}

/// Undo the fixed-buffer transforms of [`encode`] in place.
pub(super) fn decode(schema: &ExtentSchema, fixed: &mut [u8]) {
    let plan = Plan::new(schema);
    if plan.scaled.is_empty() && plan.field_relative.is_empty() && plan.self_relative.is_empty() {
        return;
    }
    let mut previous = vec![0i64; schema.fields().len()];

    for row in fixed.chunks_exact_mut(schema.row_size()) {
        for field in &plan.self_relative {
            if is_null(row, field) {
                continue;
            }
            write_int(row, field, read_int(row, field).wrapping_add(previous[field.column]));
            previous[field.column] = read_int(row, field);
        }

        for (field, base) in &plan.field_relative {
            if is_null(row, field) {
                continue;
            }
            let value = read_int(row, field).wrapping_add(read_int(row, base));
            write_int(row, field, value);
        }

        for field in &plan.scaled {
            if is_null(row, field) {
                continue;
            }
            let scale = field.scale.unwrap_or(1.0);
            let raw = read_u64(row, field.offset) as i64 as f64 * scale;
            write_u64(row, field.offset, raw.to_bits());
        }
    }
}
