use quarry::{ColumnType, RecordError, Value};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors of the table store.
///
/// Three tiers: structural errors mean stored data is inconsistent and the
/// caller must stop using the database; operational errors reject one
/// request and leave storage untouched; I/O errors come from the page files.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage is inconsistent: {0}")]
    Structural(String),
    #[error("stored record is unreadable: {0}")]
    Record(#[from] RecordError),

    #[error("duplicate primary key {0}")]
    DuplicateKey(Value),
    #[error("value {value} already present in unique column '{column}'")]
    UniqueViolation { column: String, value: Value },
    #[error("column '{0}' does not allow null")]
    NullViolation(String),
    #[error("value for column '{column}' is not of type {expected}")]
    TypeMismatch { column: String, expected: ColumnType },
    #[error("value for column '{0}' ends in a zero byte")]
    TrailingZero(String),
    #[error("value for column '{column}' is {found} bytes, the maximum is {max}")]
    ValueTooLarge {
        column: String,
        max: usize,
        found: usize,
    },
    #[error("expected {expected} values, found {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("record of {size} bytes does not fit in a page of {page_size} bytes")]
    RecordTooLarge { size: usize, page_size: usize },
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table exists: {0}")]
    TableExists(String),
    #[error("invalid table name {0:?}: names must be non-empty and not start with '#'")]
    InvalidName(String),
    #[error("column not found: {0}")]
    ColumnNotFound(String),
    #[error("column exists: {0}")]
    ColumnExists(String),
    #[error("a table may have at most {max} columns", max = quarry::MAX_COLUMNS)]
    TooManyColumns,
    #[error("invalid schema: {0}")]
    InvalidSchema(#[source] RecordError),
    #[error("cannot drop primary key column '{0}'")]
    PrimaryKeyColumn(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_structural(&self) -> bool {
        matches!(self, StorageError::Structural(_) | StorageError::Record(_))
    }

    pub fn is_io(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }

    /// Maps a rejected incoming record to its operational error. Plain `?`
    /// on a `RecordError` means stored data failed to decode instead.
    pub fn invalid_record(err: RecordError) -> Self {
        match err {
            RecordError::ArityMismatch { expected, found } => {
                StorageError::ArityMismatch { expected, found }
            }
            RecordError::TypeMismatch { column, expected } => {
                StorageError::TypeMismatch { column, expected }
            }
            RecordError::NullNotAllowed { column } => StorageError::NullViolation(column),
            RecordError::ValueTooLarge { column, max, found } => {
                StorageError::ValueTooLarge { column, max, found }
            }
            RecordError::TrailingZero { column } => StorageError::TrailingZero(column),
            other => StorageError::InvalidSchema(other),
        }
    }

    /// Maps a rejected schema change to its operational error.
    pub fn invalid_schema(err: RecordError) -> Self {
        match err {
            RecordError::TooManyColumns { .. } => StorageError::TooManyColumns,
            RecordError::DuplicateColumn(name) => StorageError::ColumnExists(name),
            other => StorageError::InvalidSchema(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("page size {0} is outside 64..=65536")]
    PageSize(usize),
    #[error("buffer capacity {0} is below 2")]
    BufferCapacity(usize),
    #[error(
        "{page_size}-byte pages fit only {pointers} pointers for {key_width}-byte keys, at least 3 are needed"
    )]
    BranchingFactor {
        page_size: usize,
        key_width: usize,
        pointers: usize,
    },
}
