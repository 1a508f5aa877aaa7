//! Binary encoding of records against a table schema.
//!
//! A record is laid out as a big-endian 32-bit null mask (bit `i` set when
//! column `i` is null) followed by every non-null column in schema order:
//! `INT` as 4 bytes, `DOUBLE` as 8 bytes, `BOOL` as 1 byte, `CHAR_FIXED` as
//! exactly the column width (zero padded) and `CHAR_VAR` as a 4-byte length
//! followed by the bytes.
use std::cmp::Ordering;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::schema::{Column, Schema};
use crate::types::{ColumnType, Record, Value};

const NULL_MASK_SIZE: usize = 4;
const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("expected {expected} values, found {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("value for column '{column}' is not of type {expected}")]
    TypeMismatch { column: String, expected: ColumnType },
    #[error("column '{column}' does not allow null")]
    NullNotAllowed { column: String },
    #[error("value for column '{column}' is {found} bytes, the maximum is {max}")]
    ValueTooLarge {
        column: String,
        max: usize,
        found: usize,
    },
    #[error("fixed-width value for column '{column}' ends in a zero byte")]
    TrailingZero { column: String },
    #[error("buffer ended before the value was complete")]
    Truncated,
    #[error("column '{column}' holds invalid utf-8")]
    InvalidUtf8 { column: String },
    #[error("unknown column type ordinal {0}")]
    UnknownType(u8),
    #[error("a schema may have at most {max} columns, got {found}", max = crate::schema::MAX_COLUMNS)]
    TooManyColumns { found: usize },
    #[error("a schema needs at least one column")]
    NoColumns,
    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("primary key index {0} is not usable")]
    InvalidPrimaryKey(usize),
    #[error("column '{column}' has invalid size {size}")]
    InvalidSize { column: String, size: usize },
    #[error("default value of column '{column}' does not fit the column")]
    InvalidDefault { column: String },
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), RecordError> {
    if buf.remaining() < needed {
        return Err(RecordError::Truncated);
    }
    Ok(())
}

/// Checks that a value can be stored in the column, without encoding it.
pub(crate) fn check_value(column: &Column, value: &Value) -> Result<(), RecordError> {
    if value.is_null() {
        if column.nullable {
            return Ok(());
        }
        return Err(RecordError::NullNotAllowed {
            column: column.name.clone(),
        });
    }
    if !column.column_type.accepts(value) {
        return Err(RecordError::TypeMismatch {
            column: column.name.clone(),
            expected: column.column_type,
        });
    }
    if let Value::Text(s) = value {
        if s.len() > column.size {
            return Err(RecordError::ValueTooLarge {
                column: column.name.clone(),
                max: column.size,
                found: s.len(),
            });
        }
        // Padding is stripped on decode, so a trailing zero would not survive.
        if column.column_type == ColumnType::CharFixed && s.ends_with('\0') {
            return Err(RecordError::TrailingZero {
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

/// Encoded width of a non-null value.
pub(crate) fn value_width(column: &Column, value: &Value) -> usize {
    match (column.column_type, value) {
        (ColumnType::CharVar, Value::Text(s)) => LENGTH_PREFIX_SIZE + s.len(),
        (ColumnType::CharFixed, _) => column.size,
        (ty, _) => ty.fixed_width().unwrap_or(0),
    }
}

/// Writes a non-null value that already passed `check_value`.
pub(crate) fn put_value(buf: &mut impl BufMut, column: &Column, value: &Value) {
    match value {
        Value::Int(i) => buf.put_i32(*i),
        Value::Double(d) => buf.put_f64(*d),
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Text(s) => match column.column_type {
            ColumnType::CharFixed => {
                buf.put_slice(s.as_bytes());
                buf.put_bytes(0, column.size - s.len());
            }
            _ => {
                buf.put_i32(s.len() as i32);
                buf.put_slice(s.as_bytes());
            }
        },
        Value::Null => {}
    }
}

pub(crate) fn get_value(buf: &mut impl Buf, column: &Column) -> Result<Value, RecordError> {
    match column.column_type {
        ColumnType::Int => {
            ensure_remaining(buf, 4)?;
            Ok(Value::Int(buf.get_i32()))
        }
        ColumnType::Double => {
            ensure_remaining(buf, 8)?;
            Ok(Value::Double(buf.get_f64()))
        }
        ColumnType::Bool => {
            ensure_remaining(buf, 1)?;
            Ok(Value::Bool(buf.get_u8() == 1))
        }
        ColumnType::CharFixed => {
            ensure_remaining(buf, column.size)?;
            let mut raw = vec![0u8; column.size];
            buf.copy_to_slice(&mut raw);
            let end = raw.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1);
            raw.truncate(end);
            text_from_bytes(column, raw)
        }
        ColumnType::CharVar => {
            ensure_remaining(buf, LENGTH_PREFIX_SIZE)?;
            let len = buf.get_i32();
            if len < 0 {
                return Err(RecordError::Truncated);
            }
            let len = len as usize;
            ensure_remaining(buf, len)?;
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            text_from_bytes(column, raw)
        }
    }
}

fn text_from_bytes(column: &Column, raw: Vec<u8>) -> Result<Value, RecordError> {
    String::from_utf8(raw)
        .map(Value::Text)
        .map_err(|_| RecordError::InvalidUtf8 {
            column: column.name.clone(),
        })
}

/// Encodes and decodes the records of one table.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    schema: Schema,
}

impl RecordCodec {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validates arity, types, nullability and string widths.
    pub fn check(&self, record: &Record) -> Result<(), RecordError> {
        let columns = self.schema.columns();
        if record.len() != columns.len() {
            return Err(RecordError::ArityMismatch {
                expected: columns.len(),
                found: record.len(),
            });
        }
        for (column, value) in columns.iter().zip(&record.values) {
            check_value(column, value)?;
        }
        Ok(())
    }

    pub fn encoded_len(&self, record: &Record) -> Result<usize, RecordError> {
        self.check(record)?;
        Ok(self.width_of(record))
    }

    fn width_of(&self, record: &Record) -> usize {
        NULL_MASK_SIZE
            + self
                .schema
                .columns()
                .iter()
                .zip(&record.values)
                .filter(|(_, value)| !value.is_null())
                .map(|(column, value)| value_width(column, value))
                .sum::<usize>()
    }

    pub fn encode(&self, record: &Record) -> Result<Vec<u8>, RecordError> {
        self.check(record)?;
        let size = self.width_of(record);
        let mut buf = Vec::with_capacity(size);

        let mask = record
            .values
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_null())
            .fold(0u32, |mask, (i, _)| mask | (1 << i));
        buf.put_u32(mask);

        for (column, value) in self.schema.columns().iter().zip(&record.values) {
            put_value(&mut buf, column, value);
        }
        debug_assert_eq!(buf.len(), size);
        Ok(buf)
    }

    /// Decodes one record and advances `buf` past it.
    pub fn decode(&self, buf: &mut &[u8]) -> Result<Record, RecordError> {
        ensure_remaining(buf, NULL_MASK_SIZE)?;
        let mask = buf.get_u32();
        let mut values = Vec::with_capacity(self.schema.len());
        for (i, column) in self.schema.columns().iter().enumerate() {
            if mask & (1 << i) != 0 {
                if !column.nullable {
                    return Err(RecordError::NullNotAllowed {
                        column: column.name.clone(),
                    });
                }
                values.push(Value::Null);
            } else {
                values.push(get_value(buf, column)?);
            }
        }
        Ok(Record::new(values))
    }

    pub fn primary_key<'a>(&self, record: &'a Record) -> &'a Value {
        &record.values[self.schema.primary_key()]
    }

    /// Orders a record relative to a primary-key value.
    pub fn compare_key(&self, record: &Record, key: &Value) -> Ordering {
        let own = self.primary_key(record);
        own.compare(key).unwrap_or_else(|| {
            panic!("primary key types differ: {own:?} vs {key:?}");
        })
    }

    /// Orders two records by primary key. Keys of different types mean the
    /// records do not belong to the same table, which is a logic error.
    pub fn compare_records(&self, a: &Record, b: &Record) -> Ordering {
        self.compare_key(a, self.primary_key(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people_schema() -> Schema {
        Schema::new(
            vec![
                Column::int("id"),
                Column::char_fixed("code", 8),
                Column::char_var("name", 20),
                Column::double("score"),
                Column::boolean("active"),
            ],
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip_with_nulls_and_padding() {
        let codec = RecordCodec::new(people_schema());
        let record = Record::new(vec![
            Value::Int(7),
            Value::from("ab"),
            Value::Null,
            Value::Double(2.5),
            Value::Bool(true),
        ]);
        let bytes = codec.encode(&record).unwrap();
        // mask + int + fixed(8) + double + bool
        assert_eq!(bytes.len(), 4 + 4 + 8 + 8 + 1);
        assert_eq!(codec.encoded_len(&record).unwrap(), bytes.len());

        let mut slice = bytes.as_slice();
        let decoded = codec.decode(&mut slice).unwrap();
        assert_eq!(decoded, record);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_var_string_has_length_prefix() {
        let codec = RecordCodec::new(people_schema());
        let record = Record::new(vec![
            Value::Int(1),
            Value::from(""),
            Value::from("hello"),
            Value::Null,
            Value::Null,
        ]);
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(&bytes[0..4], &0b11000u32.to_be_bytes());
        assert_eq!(&bytes[16..20], &5i32.to_be_bytes());
        let decoded = codec.decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encode_rejects_bad_values() {
        let codec = RecordCodec::new(people_schema());
        let wrong_type = Record::new(vec![
            Value::from("x"),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ]);
        assert!(matches!(
            codec.encode(&wrong_type),
            Err(RecordError::TypeMismatch { .. })
        ));

        let null_key = Record::new(vec![Value::Null; 5]);
        assert!(matches!(
            codec.encode(&null_key),
            Err(RecordError::NullNotAllowed { .. })
        ));

        let too_long = Record::new(vec![
            Value::Int(1),
            Value::from("123456789"),
            Value::Null,
            Value::Null,
            Value::Null,
        ]);
        assert!(matches!(
            codec.encode(&too_long),
            Err(RecordError::ValueTooLarge { max: 8, found: 9, .. })
        ));

        let short = Record::new(vec![Value::Int(1)]);
        assert_eq!(
            codec.encode(&short),
            Err(RecordError::ArityMismatch {
                expected: 5,
                found: 1
            })
        );
    }

    #[test]
    fn test_fixed_width_rejects_trailing_zero() {
        let codec = RecordCodec::new(people_schema());
        let record = |code: &str, name: &str| {
            Record::new(vec![
                Value::Int(1),
                Value::from(code),
                Value::from(name),
                Value::Null,
                Value::Null,
            ])
        };
        assert_eq!(
            codec.encode(&record("a\0", "x")),
            Err(RecordError::TrailingZero {
                column: "code".to_string()
            })
        );
        // Inner zeros and zeros in variable-width values are kept.
        for (code, name) in [("a\0b", "x"), ("a", "x\0")] {
            let bytes = codec.encode(&record(code, name)).unwrap();
            assert_eq!(codec.decode(&mut bytes.as_slice()).unwrap(), record(code, name));
        }
    }

    #[test]
    fn test_decode_truncated() {
        let codec = RecordCodec::new(people_schema());
        let record = Record::new(vec![
            Value::Int(3),
            Value::from("abc"),
            Value::from("longer name"),
            Value::Double(1.0),
            Value::Bool(false),
        ]);
        let bytes = codec.encode(&record).unwrap();
        let mut slice = &bytes[..bytes.len() - 3];
        assert_eq!(codec.decode(&mut slice), Err(RecordError::Truncated));
    }

    #[test]
    fn test_compare_records_by_primary_key() {
        let schema = Schema::new(vec![Column::char_var("a", 4), Column::int("k")], 1).unwrap();
        let codec = RecordCodec::new(schema);
        let low = Record::new(vec![Value::from("zz"), Value::Int(-3)]);
        let high = Record::new(vec![Value::from("aa"), Value::Int(10)]);
        assert_eq!(codec.compare_records(&low, &high), Ordering::Less);
        assert_eq!(codec.compare_records(&high, &high), Ordering::Equal);
    }
}
