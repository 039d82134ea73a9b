//! Zero-copy tuple access. All getters return references into the
//! underlying image; nothing is materialized.

use crate::error::{Result, StorageError};
use crate::tuple::{FieldType, TupleDesc, Value};

#[derive(Debug, Clone, Copy)]
pub struct TupleView<'a> {
    data: &'a [u8],
    desc: &'a TupleDesc,
}

impl<'a> TupleView<'a> {
    pub fn new(data: &'a [u8], desc: &'a TupleDesc) -> Self {
        debug_assert!(data.len() >= desc.header_size() + desc.total_fixed_size());
        TupleView { data, desc }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn is_null(&self, field_id: usize) -> bool {
        self.data[field_id / 8] & (1 << (field_id % 8)) != 0
    }

    fn fixed_at(&self, field_id: usize) -> usize {
        self.desc.header_size() + self.desc.fixed_offset(field_id)
    }

    /// Heap span `[start, end)` of a var field, relative to the image.
    fn var_bounds(&self, field_id: usize) -> (usize, usize) {
        let var_idx = self
            .desc
            .var_index(field_id)
            .expect("var_bounds on fixed field");
        let table = self.desc.null_bitmap_size();
        let heap = self.desc.header_size() + self.desc.total_fixed_size();
        let end_at = table + 4 * var_idx;
        let end = u32::from_le_bytes(self.data[end_at..end_at + 4].try_into().unwrap()) as usize;
        let start = if var_idx == 0 {
            0
        } else {
            u32::from_le_bytes(self.data[end_at - 4..end_at].try_into().unwrap()) as usize
        };
        (heap + start, heap + end)
    }

    pub fn get(&self, field_id: usize) -> Result<Value<'a>> {
        let field = self
            .desc
            .field(field_id)
            .ok_or_else(|| StorageError::InvalidArgument(format!("no field {field_id}")))?;
        if self.is_null(field_id) {
            return Ok(Value::Null);
        }
        Ok(match field.field_type {
            FieldType::Int => Value::Int(self.get_int(field_id)),
            FieldType::BigInt => Value::BigInt(self.get_bigint(field_id)),
            FieldType::Float => Value::Float(self.get_float(field_id)),
            FieldType::Double => Value::Double(self.get_double(field_id)),
            FieldType::Text => Value::Text(self.get_text(field_id)?),
            FieldType::Blob => Value::Blob(self.get_blob(field_id)),
        })
    }

    pub fn get_int(&self, field_id: usize) -> i32 {
        let at = self.fixed_at(field_id);
        i32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    pub fn get_bigint(&self, field_id: usize) -> i64 {
        let at = self.fixed_at(field_id);
        i64::from_le_bytes(self.data[at..at + 8].try_into().unwrap())
    }

    pub fn get_float(&self, field_id: usize) -> f32 {
        let at = self.fixed_at(field_id);
        f32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    pub fn get_double(&self, field_id: usize) -> f64 {
        let at = self.fixed_at(field_id);
        f64::from_le_bytes(self.data[at..at + 8].try_into().unwrap())
    }

    pub fn get_text(&self, field_id: usize) -> Result<&'a str> {
        let (start, end) = self.var_bounds(field_id);
        std::str::from_utf8(&self.data[start..end])
            .map_err(|_| StorageError::SchemaMismatch(format!("field {field_id} not utf-8")))
    }

    pub fn get_blob(&self, field_id: usize) -> &'a [u8] {
        let (start, end) = self.var_bounds(field_id);
        &self.data[start..end]
    }

    /// Materializes every field, for scan output and tests.
    pub fn values(&self) -> Result<Vec<Value<'a>>> {
        (0..self.desc.field_count()).map(|id| self.get(id)).collect()
    }
}
