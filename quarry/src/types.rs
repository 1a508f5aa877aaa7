//! Column types, runtime values and records.
use std::cmp::Ordering;
use std::fmt;

/// The storage type of a column. The discriminant is the ordinal written to
/// the catalog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Int = 0,
    Double = 1,
    Bool = 2,
    CharFixed = 3,
    CharVar = 4,
}

impl ColumnType {
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(ColumnType::Int),
            1 => Some(ColumnType::Double),
            2 => Some(ColumnType::Bool),
            3 => Some(ColumnType::CharFixed),
            4 => Some(ColumnType::CharVar),
            _ => None,
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Byte width of the numeric types. Character types take their width from
    /// the column.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Int => Some(4),
            ColumnType::Double => Some(8),
            ColumnType::Bool => Some(1),
            ColumnType::CharFixed | ColumnType::CharVar => None,
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, ColumnType::CharFixed | ColumnType::CharVar)
    }

    /// Whether a non-null value can be stored in a column of this type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnType::Int, Value::Int(_))
                | (ColumnType::Double, Value::Double(_))
                | (ColumnType::Bool, Value::Bool(_))
                | (ColumnType::CharFixed, Value::Text(_))
                | (ColumnType::CharVar, Value::Text(_))
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int => "integer",
            ColumnType::Double => "double",
            ColumnType::Bool => "boolean",
            ColumnType::CharFixed => "char",
            ColumnType::CharVar => "varchar",
        };
        f.write_str(name)
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Orders two values of the same type. Nulls sort first. Returns `None`
    /// for two non-null values of different types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => Some(a.total_cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One row: values positionally aligned with the table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_ordering() {
        assert_eq!(Value::Int(1).compare(&Value::Int(2)), Some(Ordering::Less));
        assert_eq!(
            Value::Bool(true).compare(&Value::Bool(false)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::from("abc").compare(&Value::from("abd")),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Double(-0.5).compare(&Value::Double(0.25)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Int(0)), Some(Ordering::Less));
        assert_eq!(Value::Int(1).compare(&Value::from("1")), None);
    }

    #[test]
    fn test_type_ordinals() {
        for ordinal in 0..5u8 {
            let ty = ColumnType::from_ordinal(ordinal).unwrap();
            assert_eq!(ty.ordinal(), ordinal);
        }
        assert!(ColumnType::from_ordinal(5).is_none());
        assert!(ColumnType::CharVar.accepts(&Value::from("x")));
        assert!(!ColumnType::Int.accepts(&Value::Double(1.0)));
    }
}
