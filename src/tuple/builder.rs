//! Tuple encoding. The inverse of [`super::view::TupleView`]; both sides
//! agree on the image layout documented in the module root.

use crate::error::Result;
use crate::tuple::{TupleDesc, Value};

/// Encodes `values` into `dst`, which must be exactly
/// [`TupleDesc::tuple_size`] bytes. Returns the bytes written.
pub fn encode_tuple(desc: &TupleDesc, values: &[Value<'_>], dst: &mut [u8]) -> Result<usize> {
    desc.check(values)?;
    let bitmap_size = desc.null_bitmap_size();
    let header_size = desc.header_size();
    let fixed_start = header_size;
    let heap_start = header_size + desc.total_fixed_size();

    // Null fixed fields keep zeroed slots; clear everything up to the
    // heap so a reused destination cannot leak stale bytes.
    dst[..heap_start].fill(0);
    let mut heap_end = 0usize;
    let mut var_slot = 0usize;

    for (id, value) in values.iter().enumerate() {
        if value.is_null() {
            dst[id / 8] |= 1 << (id % 8);
        }
        match *value {
            Value::Null => {
                // Fixed slots stay zeroed; var fields record an empty span.
            }
            Value::Int(v) => {
                let at = fixed_start + desc.fixed_offset(id);
                dst[at..at + 4].copy_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                let at = fixed_start + desc.fixed_offset(id);
                dst[at..at + 4].copy_from_slice(&v.to_le_bytes());
            }
            Value::BigInt(v) => {
                let at = fixed_start + desc.fixed_offset(id);
                dst[at..at + 8].copy_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                let at = fixed_start + desc.fixed_offset(id);
                dst[at..at + 8].copy_from_slice(&v.to_le_bytes());
            }
            Value::Text(s) => {
                dst[heap_start + heap_end..heap_start + heap_end + s.len()]
                    .copy_from_slice(s.as_bytes());
                heap_end += s.len();
            }
            Value::Blob(b) => {
                dst[heap_start + heap_end..heap_start + heap_end + b.len()].copy_from_slice(b);
                heap_end += b.len();
            }
        }
        if desc.field(id).unwrap().field_type.is_variable() {
            let at = bitmap_size + 4 * var_slot;
            dst[at..at + 4].copy_from_slice(&(heap_end as u32).to_le_bytes());
            var_slot += 1;
        }
    }
    Ok(heap_start + heap_end)
}

/// Convenience wrapper returning a freshly allocated image.
pub fn encode_tuple_vec(desc: &TupleDesc, values: &[Value<'_>]) -> Result<Vec<u8>> {
    let size = desc.tuple_size(values)?;
    let mut buf = vec![0u8; size];
    let written = encode_tuple(desc, values, &mut buf)?;
    debug_assert_eq!(written, size);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{Field, FieldType, Schema, TupleDesc, TupleView};

    fn desc() -> TupleDesc {
        TupleDesc::new(
            Schema::new(vec![
                Field::new("number", FieldType::Int),
                Field::new("text1", FieldType::Text),
                Field::new("largenumber", FieldType::BigInt),
                Field::nullable("text2", FieldType::Text),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn round_trip_recovers_every_value() {
        let desc = desc();
        let values = [
            Value::Int(-7),
            Value::Text("hello"),
            Value::BigInt(0x7FFF_FFFF_0000_0001),
            Value::Text("world!"),
        ];
        let image = encode_tuple_vec(&desc, &values).unwrap();
        let view = TupleView::new(&image, &desc);
        assert_eq!(view.get(0).unwrap(), Value::Int(-7));
        assert_eq!(view.get(1).unwrap(), Value::Text("hello"));
        assert_eq!(view.get(2).unwrap(), Value::BigInt(0x7FFF_FFFF_0000_0001));
        assert_eq!(view.get(3).unwrap(), Value::Text("world!"));
    }

    #[test]
    fn null_var_field_spans_zero_bytes() {
        let desc = desc();
        let values = [
            Value::Int(1),
            Value::Text("x"),
            Value::BigInt(2),
            Value::Null,
        ];
        let image = encode_tuple_vec(&desc, &values).unwrap();
        let view = TupleView::new(&image, &desc);
        assert!(view.is_null(3));
        assert_eq!(view.get(3).unwrap(), Value::Null);
        assert_eq!(view.get(1).unwrap(), Value::Text("x"));
    }

    #[test]
    fn float_and_blob_bits_survive() {
        let desc = TupleDesc::new(
            Schema::new(vec![
                Field::new("f", FieldType::Float),
                Field::new("d", FieldType::Double),
                Field::new("b", FieldType::Blob),
            ])
            .unwrap(),
        );
        let blob = [0u8, 255, 3, 7];
        let values = [
            Value::Float(1.5e-40),
            Value::Double(f64::MIN_POSITIVE),
            Value::Blob(&blob),
        ];
        let image = encode_tuple_vec(&desc, &values).unwrap();
        let view = TupleView::new(&image, &desc);
        assert_eq!(view.get(0).unwrap(), Value::Float(1.5e-40));
        assert_eq!(view.get(1).unwrap(), Value::Double(f64::MIN_POSITIVE));
        assert_eq!(view.get(2).unwrap(), Value::Blob(&blob));
    }
}
