//! Fixed-row layout.
//!
//! Offsets are assigned once, here, from the parsed declarations. The
//! three orderings differ only in the order field groups are laid down:
//!
//! ```text
//! small_to_big:  bools | nulls | bytes | pad4 | int32 | var32 | pad8 | int64,double | end pad
//! big_to_small:  int64,double | int32 | var32 | bytes | bools | nulls | end pad
//! declaration:   nulls | fields as written, each aligned to its size   | end pad
//! ```

use super::parse::{RelativeDecl, SchemaDecl};
use super::{FieldInfo, FieldOrdering, FieldType, NullBit, PadRecord, Relative};

fn align(offset: usize, to: usize) -> usize {
    offset.div_ceil(to) * to
}

/// Largest natural alignment among the declared fixed fields.
fn max_alignment(decl: &SchemaDecl) -> usize {
    decl.fields
        .iter()
        .map(|f| f.field_type.fixed_size().max(1))
        .max()
        .unwrap_or(1)
}

fn end_padding(decl: &SchemaDecl, offset: usize) -> usize {
    match decl.pad_record {
        PadRecord::Original => align(offset, 8),
        PadRecord::MaxColumnSize => align(offset, max_alignment(decl)),
        PadRecord::None => offset,
    }
}

/// Compute field offsets and the record size for a parsed schema.
pub(super) fn compute_layout(decl: &SchemaDecl) -> (Vec<FieldInfo>, usize) {
    let mut fields: Vec<FieldInfo> = decl
        .fields
        .iter()
        .enumerate()
        .map(|(column, f)| FieldInfo {
            name: f.name.clone(),
            field_type: f.field_type,
            column,
            offset: 0,
            bit_mask: 0,
            null_bit: None,
            unique: f.unique,
            scale: f.scale,
            double_base: f.double_base,
            relative: f.relative.as_ref().map(|r| match r {
                RelativeDecl::SelfPrevious => Relative::SelfPrevious,
                RelativeDecl::Field(base) => Relative::Field(*base),
            }),
        })
        .collect();

    let nullable_count = decl.fields.iter().filter(|f| f.nullable).count();
    let null_bytes = nullable_count.div_ceil(8);

    let columns_of = |pred: &dyn Fn(FieldType) -> bool| -> Vec<usize> {
        decl.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| pred(f.field_type))
            .map(|(i, _)| i)
            .collect()
    };
    let bools = columns_of(&|t| t == FieldType::Bool);
    let bytes = columns_of(&|t| t == FieldType::Byte);
    let int32s = columns_of(&|t| t == FieldType::Int32);
    let var32s = columns_of(&|t| t == FieldType::Variable32);
    let eights = columns_of(&|t| matches!(t, FieldType::Int64 | FieldType::Double));
    let has_fours = !int32s.is_empty() || !var32s.is_empty();

    let mut offset = 0usize;
    let place_bools = |fields: &mut [FieldInfo], offset: &mut usize| {
        for (i, &col) in bools.iter().enumerate() {
            fields[col].offset = *offset + i / 8;
            fields[col].bit_mask = 1 << (i % 8);
        }
        *offset += bools.len().div_ceil(8);
    };
    let place_run = |fields: &mut [FieldInfo], offset: &mut usize, cols: &[usize], size: usize| {
        for &col in cols {
            fields[col].offset = *offset;
            *offset += size;
        }
    };

    let null_region;
    match decl.ordering {
        FieldOrdering::SmallToBig => {
            place_bools(&mut fields, &mut offset);
            null_region = offset;
            offset += null_bytes;
            place_run(&mut fields, &mut offset, &bytes, 1);
            if decl.pad_record == PadRecord::Original || has_fours {
                offset = align(offset, 4);
            }
            place_run(&mut fields, &mut offset, &int32s, 4);
            place_run(&mut fields, &mut offset, &var32s, 4);
            if decl.pad_record == PadRecord::Original || !eights.is_empty() {
                offset = align(offset, 8);
            }
            place_run(&mut fields, &mut offset, &eights, 8);
        }
        FieldOrdering::BigToSmall => {
            place_run(&mut fields, &mut offset, &eights, 8);
            place_run(&mut fields, &mut offset, &int32s, 4);
            place_run(&mut fields, &mut offset, &var32s, 4);
            place_run(&mut fields, &mut offset, &bytes, 1);
            place_bools(&mut fields, &mut offset);
            null_region = offset;
            offset += null_bytes;
        }
        FieldOrdering::Declaration => {
            null_region = 0;
            offset = null_bytes;
            // (byte offset, next free bit) of the bool byte being filled
            let mut bool_byte: Option<(usize, u32)> = None;
            for field in fields.iter_mut() {
                if field.field_type == FieldType::Bool {
                    let (at, bit) = match bool_byte {
                        Some((at, bit)) if bit < 8 => (at, bit),
                        _ => {
                            offset += 1;
                            (offset - 1, 0)
                        }
                    };
                    field.offset = at;
                    field.bit_mask = 1 << bit;
                    bool_byte = Some((at, bit + 1));
                } else {
                    let size = field.field_type.fixed_size();
                    offset = align(offset, size);
                    field.offset = offset;
                    offset += size;
                    bool_byte = None;
                }
            }
        }
    }

    let mut nullable_index = 0usize;
    for (field, field_decl) in fields.iter_mut().zip(&decl.fields) {
        if field_decl.nullable {
            field.null_bit = Some(NullBit {
                offset: null_region + nullable_index / 8,
                mask: 1 << (nullable_index % 8),
            });
            nullable_index += 1;
        }
    }

    let row_size = end_padding(decl, offset).max(1);
    (fields, row_size)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::schema::{ExtentSchema, FieldInfo};

    fn schema(ordering: &str, pad: &str, body: &str) -> ExtentSchema {
        let text = format!(
            "<ExtentType name=\"L\" pack_field_ordering=\"{}\" pack_pad_record=\"{}\">{}</ExtentType>",
            ordering, pad, body
        );
        ExtentSchema::from_text(&text).unwrap()
    }

    fn offsets(s: &ExtentSchema) -> Vec<usize> {
        s.fields().iter().map(|f: &FieldInfo| f.offset).collect()
    }

    const MIXED: &str = r#"
        <field type="double" name="d" />
        <field type="bool" name="b1" />
        <field type="int32" name="i" />
        <field type="byte" name="y" />
        <field type="variable32" name="v" />
        <field type="bool" name="b2" />
        <field type="int64" name="l" />
    "#;

    #[test]
    fn test_small_to_big_groups_by_size() {
        let s = schema("small_to_big_sep_var32", "original", MIXED);
        // bools at 0, byte at 1, int32 at 4, var at 8, eights at 16 / 24
        assert_eq!(offsets(&s), vec![16, 0, 4, 1, 8, 0, 24]);
        assert_eq!(s.field("b1").unwrap().bit_mask, 1);
        assert_eq!(s.field("b2").unwrap().bit_mask, 2);
        assert_eq!(s.row_size(), 32);
    }

    #[test]
    fn test_big_to_small_groups_by_size() {
        let s = schema("big_to_small_sep_var32", "original", MIXED);
        // eights 0 / 8, int32 16, var 20, byte 24, bools 25
        assert_eq!(offsets(&s), vec![0, 25, 16, 24, 20, 25, 8]);
        assert_eq!(s.row_size(), 32);
    }

    #[test]
    fn test_declaration_order_aligns_each_field() {
        let s = schema("declaration", "none", MIXED);
        // d 0, b1 8, i 12, y 16, v 20, b2 24, l 32
        assert_eq!(offsets(&s), vec![0, 8, 12, 16, 20, 24, 32]);
        assert_eq!(s.row_size(), 40);
    }

    #[test]
    fn test_adjacent_bools_share_a_byte_in_declaration_order() {
        let s = schema(
            "declaration",
            "none",
            r#"<field type="bool" name="a"/><field type="bool" name="b"/><field type="byte" name="c"/>"#,
        );
        assert_eq!(offsets(&s), vec![0, 0, 1]);
        assert_eq!(s.field("b").unwrap().bit_mask, 2);
        assert_eq!(s.row_size(), 2);
    }

    #[test]
    fn test_padding_policies() {
        let body = r#"<field type="byte" name="a"/><field type="int32" name="b"/>"#;
        assert_eq!(schema("small_to_big_sep_var32", "original", body).row_size(), 8);
        assert_eq!(schema("small_to_big_sep_var32", "max_column_size", body).row_size(), 8);
        assert_eq!(schema("big_to_small_sep_var32", "max_column_size", body).row_size(), 8);
        assert_eq!(schema("big_to_small_sep_var32", "none", body).row_size(), 5);

        let bytes_only = r#"<field type="byte" name="a"/><field type="byte" name="b"/><field type="byte" name="c"/>"#;
        assert_eq!(schema("small_to_big_sep_var32", "original", bytes_only).row_size(), 8);
        assert_eq!(schema("small_to_big_sep_var32", "max_column_size", bytes_only).row_size(), 3);
    }

    #[test]
    fn test_null_bitmask_region() {
        let body: String = (0..9)
            .map(|i| format!("<field type=\"int32\" name=\"f{}\" opt_nullable=\"yes\"/>", i))
            .collect();
        let s = schema("small_to_big_sep_var32", "original", &body);
        // 9 nullable fields -> 2 bytes of null bits at offset 0
        let f0 = s.field("f0").unwrap().null_bit.unwrap();
        let f8 = s.field("f8").unwrap().null_bit.unwrap();
        assert_eq!((f0.offset, f0.mask), (0, 1));
        assert_eq!((f8.offset, f8.mask), (1, 1));
        assert_eq!(s.field("f0").unwrap().offset, 4);
        assert_eq!(s.row_size(), 40);
    }
}
