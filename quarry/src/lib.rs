//! Storage primitives: typed values, table schemas, the record codec, the
//! page layout, per-table page files and the LRU page buffer.

pub mod buffer_pool;

pub mod codec;

pub mod failpoint;

pub mod page;

pub mod pager;

pub mod schema;

pub mod types;

/// Identifier of a table, assigned by the catalog and never reused.
pub type TableId = u32;

/// Number of a page inside a table's file. Data and index pages draw from the
/// same counter.
pub type PageNum = u32;

pub use buffer_pool::{PageBuffer, PageGuard};
pub use codec::{RecordCodec, RecordError};
pub use page::{Page, PageKey, PageRegion};
pub use pager::Pager;
pub use schema::{Column, Schema, MAX_COLUMNS};
pub use types::{ColumnType, Record, Value};

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("QUARRY_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! quarry_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}
