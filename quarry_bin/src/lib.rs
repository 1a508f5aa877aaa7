//! The Quarry storage engine: catalog, sorted tables, the primary-key
//! B+ tree and the database directory that ties them together.

pub mod catalog;
pub mod config;
pub mod database;
pub mod errors;
pub mod index;
pub mod table;

pub use catalog::{Catalog, TableEntry};
pub use config::DatabaseConfig;
pub use database::Database;
pub use errors::{ConfigError, StorageError, StorageResult};
pub use index::{IndexTree, RecordLocation};
pub use table::{StorageContext, Table, TempTable};
