//! # Scan Predicate Buffer
//!
//! Queries arrive as a little-endian, 8-byte-aligned buffer (the wire
//! format the client library and the query compiler agree on):
//!
//! ```text
//! u64 num_conjuncts
//! per conjunct (8-aligned):
//!     u16 field_id
//!     u16 num_predicates
//!     pad to 8
//!     per predicate:
//!         u8 predicate_type
//!         u8 pad
//!         pad to 4
//!         value  (by field type: INT/FLOAT 4 bytes;
//!                 BIGINT/DOUBLE padded to 8, 8 bytes;
//!                 TEXT/BLOB u32 length + bytes, padded to 4)
//! ```
//!
//! Multiple predicates on one field OR together; conjuncts AND
//! together. NULL fails every comparison.

use crate::error::{Result, StorageError};
use crate::tuple::{FieldType, TupleDesc, TupleView, Value};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equal = 0,
    NotEqual = 1,
    Less = 2,
    LessEqual = 3,
    Greater = 4,
    GreaterEqual = 5,
}

impl CmpOp {
    fn from_byte(b: u8) -> Result<CmpOp> {
        Ok(match b {
            0 => CmpOp::Equal,
            1 => CmpOp::NotEqual,
            2 => CmpOp::Less,
            3 => CmpOp::LessEqual,
            4 => CmpOp::Greater,
            5 => CmpOp::GreaterEqual,
            other => {
                return Err(StorageError::InvalidArgument(format!(
                    "unknown predicate type {other}"
                )))
            }
        })
    }

    fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Equal => ord == Equal,
            CmpOp::NotEqual => ord != Equal,
            CmpOp::Less => ord == Less,
            CmpOp::LessEqual => ord != Greater,
            CmpOp::Greater => ord == Greater,
            CmpOp::GreaterEqual => ord != Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredValue {
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub op: CmpOp,
    pub value: PredValue,
}

impl Predicate {
    /// Evaluates against a stored value. NULL never matches.
    pub fn matches(&self, stored: &Value<'_>) -> bool {
        let ord = match (stored, &self.value) {
            (Value::Int(s), PredValue::Int(q)) => s.cmp(q),
            (Value::BigInt(s), PredValue::BigInt(q)) => s.cmp(q),
            (Value::Float(s), PredValue::Float(q)) => match s.partial_cmp(q) {
                Some(ord) => ord,
                None => return false,
            },
            (Value::Double(s), PredValue::Double(q)) => match s.partial_cmp(q) {
                Some(ord) => ord,
                None => return false,
            },
            (Value::Text(s), PredValue::Bytes(q)) => s.as_bytes().cmp(q.as_slice()),
            (Value::Blob(s), PredValue::Bytes(q)) => (*s).cmp(q.as_slice()),
            _ => return false,
        };
        self.op.holds(ord)
    }
}

/// Predicates on one field, OR'd together.
#[derive(Debug, Clone)]
pub struct Conjunct {
    pub field_id: usize,
    pub predicates: Vec<Predicate>,
}

impl Conjunct {
    pub fn matches(&self, stored: &Value<'_>) -> bool {
        self.predicates.iter().any(|p| p.matches(stored))
    }
}

/// A parsed conjunctive query. An empty conjunct list matches everything.
#[derive(Debug, Clone, Default)]
pub struct ScanQuery {
    pub conjuncts: Vec<Conjunct>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn align(&mut self, to: usize) {
        self.pos = (self.pos + to - 1) & !(to - 1);
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(StorageError::InvalidArgument(
                "query buffer truncated".into(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl ScanQuery {
    /// Matches every tuple.
    pub fn all() -> ScanQuery {
        ScanQuery::default()
    }

    /// Parses and validates a predicate buffer against a table schema.
    pub fn parse(buffer: &[u8], desc: &TupleDesc) -> Result<ScanQuery> {
        let mut r = Reader {
            buf: buffer,
            pos: 0,
        };
        let num_conjuncts = r.u64()?;
        if num_conjuncts > u16::MAX as u64 {
            return Err(StorageError::InvalidArgument(format!(
                "implausible conjunct count {num_conjuncts}"
            )));
        }
        let mut conjuncts = Vec::with_capacity(num_conjuncts as usize);
        for _ in 0..num_conjuncts {
            r.align(8);
            let field_id = r.u16()? as usize;
            let num_predicates = r.u16()?;
            r.align(8);
            let field = desc.field(field_id).ok_or_else(|| {
                StorageError::InvalidArgument(format!("query references unknown field {field_id}"))
            })?;
            let field_type = field.field_type;
            let mut predicates = Vec::with_capacity(num_predicates as usize);
            for _ in 0..num_predicates {
                let op = CmpOp::from_byte(r.u8()?)?;
                r.u8()?; // pad
                r.align(4);
                let value = match field_type {
                    FieldType::Int => PredValue::Int(r.u32()? as i32),
                    FieldType::Float => PredValue::Float(f32::from_bits(r.u32()?)),
                    FieldType::BigInt => {
                        r.align(8);
                        PredValue::BigInt(r.u64()? as i64)
                    }
                    FieldType::Double => {
                        r.align(8);
                        PredValue::Double(f64::from_bits(r.u64()?))
                    }
                    FieldType::Text | FieldType::Blob => {
                        let len = r.u32()? as usize;
                        let bytes = r.take(len)?.to_vec();
                        r.align(4);
                        PredValue::Bytes(bytes)
                    }
                };
                predicates.push(Predicate { op, value });
            }
            conjuncts.push(Conjunct {
                field_id,
                predicates,
            });
        }
        Ok(ScanQuery { conjuncts })
    }

    /// Row-path evaluation over a materialized tuple.
    pub fn matches_tuple(&self, view: &TupleView<'_>) -> bool {
        self.conjuncts.iter().all(|c| {
            let stored = match view.get(c.field_id) {
                Ok(v) => v,
                Err(_) => return false,
            };
            if stored.is_null() {
                return false;
            }
            c.matches(&stored)
        })
    }
}

/// Builds predicate buffers in the wire format; the test-side mirror of
/// [`ScanQuery::parse`] and the shape a client library would emit.
pub struct ScanQueryBuilder {
    conjuncts: Vec<(u16, Vec<(CmpOp, PredValue)>)>,
}

impl ScanQueryBuilder {
    pub fn new() -> Self {
        ScanQueryBuilder {
            conjuncts: Vec::new(),
        }
    }

    pub fn conjunct(mut self, field_id: usize, op: CmpOp, value: PredValue) -> Self {
        self.conjuncts.push((field_id as u16, vec![(op, value)]));
        self
    }

    /// OR-set of predicates on one field.
    pub fn any_of(mut self, field_id: usize, predicates: Vec<(CmpOp, PredValue)>) -> Self {
        self.conjuncts.push((field_id as u16, predicates));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.conjuncts.len() as u64).to_le_bytes());
        for (field_id, predicates) in &self.conjuncts {
            while buf.len() % 8 != 0 {
                buf.push(0);
            }
            buf.extend_from_slice(&field_id.to_le_bytes());
            buf.extend_from_slice(&(predicates.len() as u16).to_le_bytes());
            while buf.len() % 8 != 0 {
                buf.push(0);
            }
            for (op, value) in predicates {
                buf.push(*op as u8);
                buf.push(0);
                while buf.len() % 4 != 0 {
                    buf.push(0);
                }
                match value {
                    PredValue::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
                    PredValue::Float(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
                    PredValue::BigInt(v) => {
                        while buf.len() % 8 != 0 {
                            buf.push(0);
                        }
                        buf.extend_from_slice(&v.to_le_bytes());
                    }
                    PredValue::Double(v) => {
                        while buf.len() % 8 != 0 {
                            buf.push(0);
                        }
                        buf.extend_from_slice(&v.to_bits().to_le_bytes());
                    }
                    PredValue::Bytes(bytes) => {
                        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                        buf.extend_from_slice(bytes);
                        while buf.len() % 4 != 0 {
                            buf.push(0);
                        }
                    }
                }
            }
        }
        buf
    }
}

impl Default for ScanQueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{encode_tuple_vec, Field, Schema};

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

    fn sample(desc: &TupleDesc, n: i32) -> Vec<u8> {
        encode_tuple_vec(
            desc,
            &[
                Value::Int(n),
                Value::Text("abc"),
                Value::BigInt(n as i64 * 10),
                Value::Null,
            ],
        )
        .unwrap()
    }

    #[test]
    fn buffer_round_trips_through_parse() {
        let desc = desc();
        let buf = ScanQueryBuilder::new()
            .conjunct(0, CmpOp::GreaterEqual, PredValue::Int(4))
            .conjunct(2, CmpOp::Less, PredValue::BigInt(100))
            .conjunct(1, CmpOp::Equal, PredValue::Bytes(b"abc".to_vec()))
            .build();
        let query = ScanQuery::parse(&buf, &desc).unwrap();
        assert_eq!(query.conjuncts.len(), 3);

        let tuple = sample(&desc, 5);
        let view = TupleView::new(&tuple, &desc);
        assert!(query.matches_tuple(&view));

        let tuple = sample(&desc, 3);
        let view = TupleView::new(&tuple, &desc);
        assert!(!query.matches_tuple(&view), "number 3 fails >= 4");
    }

    #[test]
    fn or_predicates_on_one_field() {
        let desc = desc();
        let buf = ScanQueryBuilder::new()
            .any_of(
                0,
                vec![
                    (CmpOp::Equal, PredValue::Int(1)),
                    (CmpOp::Equal, PredValue::Int(7)),
                ],
            )
            .build();
        let query = ScanQuery::parse(&buf, &desc).unwrap();
        for (n, expected) in [(1, true), (7, true), (4, false)] {
            let tuple = sample(&desc, n);
            let view = TupleView::new(&tuple, &desc);
            assert_eq!(query.matches_tuple(&view), expected, "number {n}");
        }
    }

    #[test]
    fn null_fails_all_comparisons() {
        let desc = desc();
        let buf = ScanQueryBuilder::new()
            .conjunct(3, CmpOp::Equal, PredValue::Bytes(b"x".to_vec()))
            .build();
        let query = ScanQuery::parse(&buf, &desc).unwrap();
        let tuple = sample(&desc, 1);
        let view = TupleView::new(&tuple, &desc);
        assert!(!query.matches_tuple(&view));
    }

    #[test]
    fn unknown_field_is_invalid_argument() {
        let desc = desc();
        let buf = ScanQueryBuilder::new()
            .conjunct(9, CmpOp::Equal, PredValue::Int(1))
            .build();
        assert!(matches!(
            ScanQuery::parse(&buf, &desc),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn truncated_buffer_is_invalid_argument() {
        let desc = desc();
        let buf = ScanQueryBuilder::new()
            .conjunct(0, CmpOp::Equal, PredValue::Int(1))
            .build();
        assert!(matches!(
            ScanQuery::parse(&buf[..buf.len() - 2], &desc),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(ScanQuery::parse(&buf[..4], &desc).is_err());
    }

    #[test]
    fn empty_query_matches_everything() {
        let desc = desc();
        let query = ScanQuery::parse(&0u64.to_le_bytes(), &desc).unwrap();
        let tuple = sample(&desc, 1);
        let view = TupleView::new(&tuple, &desc);
        assert!(query.matches_tuple(&view));
    }
}
