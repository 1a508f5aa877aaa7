//! Table schemas and their catalog encoding.
use std::collections::HashSet;

use bytes::{Buf, BufMut};

use crate::codec::{check_value, get_value, put_value, RecordError};
use crate::types::{ColumnType, Value};

/// Upper bound imposed by the 32-bit null mask.
pub const MAX_COLUMNS: usize = 32;

/// Widest character column; sizes are stored as one byte.
pub const MAX_CHAR_WIDTH: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// Byte width. Numeric types always use their natural width.
    pub size: usize,
    pub default: Value,
    pub unique: bool,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType, size: usize) -> Self {
        Self {
            name: name.into(),
            column_type,
            size: column_type.fixed_width().unwrap_or(size),
            default: Value::Null,
            unique: false,
            nullable: true,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Int, 4)
    }

    pub fn double(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Double, 8)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Bool, 1)
    }

    pub fn char_fixed(name: impl Into<String>, size: usize) -> Self {
        Self::new(name, ColumnType::CharFixed, size)
    }

    pub fn char_var(name: impl Into<String>, size: usize) -> Self {
        Self::new(name, ColumnType::CharVar, size)
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    fn validate(&self) -> Result<(), RecordError> {
        let size_ok = match self.column_type.fixed_width() {
            Some(width) => self.size == width,
            None => (1..=MAX_CHAR_WIDTH).contains(&self.size),
        };
        if !size_ok {
            return Err(RecordError::InvalidSize {
                column: self.name.clone(),
                size: self.size,
            });
        }
        if self.default.is_null() {
            return Ok(());
        }
        check_value(self, &self.default).map_err(|_| RecordError::InvalidDefault {
            column: self.name.clone(),
        })
    }
}

/// Ordered columns plus the index of the primary-key column.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<Column>,
    primary_key: usize,
}

impl Schema {
    /// Builds a base-table schema. The primary-key column is forced unique
    /// and non-null.
    pub fn new(mut columns: Vec<Column>, primary_key: usize) -> Result<Self, RecordError> {
        if let Some(pk) = columns.get_mut(primary_key) {
            pk.unique = true;
            pk.nullable = false;
        }
        Self::from_parts(columns, primary_key)
    }

    /// Builds the schema of a derived table: every column nullable, none
    /// unique, keyed on the first column.
    pub fn derived(mut columns: Vec<Column>) -> Result<Self, RecordError> {
        for column in &mut columns {
            column.unique = false;
            column.nullable = true;
        }
        Self::from_parts(columns, 0)
    }

    fn from_parts(columns: Vec<Column>, primary_key: usize) -> Result<Self, RecordError> {
        if columns.is_empty() {
            return Err(RecordError::NoColumns);
        }
        if columns.len() > MAX_COLUMNS {
            return Err(RecordError::TooManyColumns {
                found: columns.len(),
            });
        }
        if primary_key >= columns.len() {
            return Err(RecordError::InvalidPrimaryKey(primary_key));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(RecordError::DuplicateColumn(column.name.clone()));
            }
            column.validate()?;
        }
        Ok(Self {
            columns,
            primary_key,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn primary_key(&self) -> usize {
        self.primary_key
    }

    pub fn primary_key_column(&self) -> &Column {
        &self.columns[self.primary_key]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Appends a column. Added columns are nullable and not unique so that
    /// existing rows stay valid.
    pub fn with_column(&self, mut column: Column) -> Result<Schema, RecordError> {
        column.nullable = true;
        column.unique = false;
        let mut columns = self.columns.clone();
        columns.push(column);
        Self::from_parts(columns, self.primary_key)
    }

    /// Removes a non-key column, shifting the primary-key index if needed.
    pub fn without_column(&self, index: usize) -> Result<Schema, RecordError> {
        if index == self.primary_key || index >= self.columns.len() {
            return Err(RecordError::InvalidPrimaryKey(index));
        }
        let mut columns = self.columns.clone();
        columns.remove(index);
        let primary_key = if index < self.primary_key {
            self.primary_key - 1
        } else {
            self.primary_key
        };
        Self::from_parts(columns, primary_key)
    }

    /// Derived schema holding the given columns in the given order.
    pub fn project(&self, indices: &[usize]) -> Result<Schema, RecordError> {
        let columns = indices
            .iter()
            .map(|&i| {
                self.columns
                    .get(i)
                    .cloned()
                    .ok_or(RecordError::InvalidPrimaryKey(i))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::derived(columns)
    }

    /// Derived schema of a cartesian product. Columns of a side with a table
    /// name are qualified as `table.column`; a side without one keeps its
    /// names, which is how an already merged table is folded further.
    pub fn merge(
        left_name: Option<&str>,
        left: &Schema,
        right_name: Option<&str>,
        right: &Schema,
    ) -> Result<Schema, RecordError> {
        let qualify = |table: Option<&str>, column: &Column| match table {
            Some(table) => Column {
                name: format!("{table}.{}", column.name),
                ..column.clone()
            },
            None => column.clone(),
        };
        let columns = left
            .columns
            .iter()
            .map(|c| qualify(left_name, c))
            .chain(right.columns.iter().map(|c| qualify(right_name, c)))
            .collect();
        Self::derived(columns)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.columns.len() as u8);
        for column in &self.columns {
            buf.put_i32(column.name.len() as i32);
            buf.put_slice(column.name.as_bytes());
            buf.put_u8(column.column_type.ordinal());
            buf.put_u8(column.size as u8);
            buf.put_u8(u8::from(column.unique));
            buf.put_u8(u8::from(column.nullable));
            buf.put_u8(u8::from(column.default.is_null()));
            if !column.default.is_null() {
                put_value(buf, column, &column.default);
            }
        }
        buf.put_u8(self.primary_key as u8);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Schema, RecordError> {
        if !buf.has_remaining() {
            return Err(RecordError::Truncated);
        }
        let count = buf.get_u8() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(RecordError::Truncated);
            }
            let name_len = buf.get_i32();
            if name_len < 0 || buf.remaining() < name_len as usize + 5 {
                return Err(RecordError::Truncated);
            }
            let mut raw = vec![0u8; name_len as usize];
            buf.copy_to_slice(&mut raw);
            let name = String::from_utf8(raw).map_err(|_| RecordError::InvalidUtf8 {
                column: String::from("<column name>"),
            })?;
            let ordinal = buf.get_u8();
            let column_type =
                ColumnType::from_ordinal(ordinal).ok_or(RecordError::UnknownType(ordinal))?;
            let size = buf.get_u8() as usize;
            let unique = buf.get_u8() == 1;
            let nullable = buf.get_u8() == 1;
            let default_is_null = buf.get_u8() == 1;
            let mut column = Column {
                name,
                column_type,
                size,
                default: Value::Null,
                unique,
                nullable,
            };
            if !default_is_null {
                column.default = get_value(buf, &column)?;
            }
            columns.push(column);
        }
        if !buf.has_remaining() {
            return Err(RecordError::Truncated);
        }
        let primary_key = buf.get_u8() as usize;
        Self::from_parts(columns, primary_key)
    }
}
