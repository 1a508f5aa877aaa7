//! Opening and closing a database directory.
use std::fs;
use std::path::{Path, PathBuf};

use quarry::{quarry_debug_log, PageBuffer, Pager, Schema, TableId};

use crate::catalog::{Catalog, CATALOG_FILE};
use crate::config::DatabaseConfig;
use crate::errors::{StorageError, StorageResult};
use crate::table::{StorageContext, Table};

/// A database directory: the catalog file plus the `pages/` and `index/`
/// trees, served through one page buffer.
pub struct Database {
    root: PathBuf,
    ctx: StorageContext,
    closed: bool,
}

impl Database {
    /// Opens the directory named by `config`, creating it when missing. An
    /// existing catalog keeps the page size it was created with.
    pub fn open(config: &DatabaseConfig) -> StorageResult<Self> {
        config.validate()?;
        let root = config.path.clone();
        fs::create_dir_all(&root)?;
        let catalog_path = root.join(CATALOG_FILE);
        let catalog = if catalog_path.exists() {
            Catalog::load(&catalog_path)?
        } else {
            Catalog::new(config.page_size)
        };
        if catalog.page_size() != config.page_size {
            quarry_debug_log!(
                "[Database::open] Using stored page size {} instead of {}",
                catalog.page_size(),
                config.page_size
            );
        }
        let pager = Pager::open(&root, catalog.page_size())?;
        let buffer = PageBuffer::new(pager, config.buffer_capacity);
        quarry_debug_log!(
            "[Database::open] Opened {:?} with {} tables",
            root,
            catalog.tables().len()
        );
        Ok(Self {
            root,
            ctx: StorageContext::new(catalog, buffer, config.index_mode),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn context(&self) -> &StorageContext {
        &self.ctx
    }

    pub fn page_size(&self) -> usize {
        self.ctx.page_size()
    }

    pub fn create_table(&self, name: &str, schema: Schema) -> StorageResult<Table> {
        self.ctx.create_table(name, schema)
    }

    pub fn table(&self, name: &str) -> StorageResult<Table> {
        self.ctx.open_table(name)
    }

    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        self.table(name)?.drop()
    }

    pub fn rename_table(&self, old: &str, new: &str) -> StorageResult<()> {
        let mut catalog = self.ctx.catalog.lock();
        let id = catalog
            .table_id(old)
            .ok_or_else(|| StorageError::TableNotFound(old.to_string()))?;
        catalog.rename_table(id, new)
    }

    /// Names of all tables with their ids, in id order.
    pub fn tables(&self) -> Vec<(TableId, String)> {
        self.ctx.catalog.lock().tables()
    }

    /// Writes every cached page back and saves the catalog.
    pub fn flush(&self) -> StorageResult<()> {
        self.ctx.buffer.purge()?;
        self.ctx.catalog.lock().save(self.root.join(CATALOG_FILE))?;
        Ok(())
    }

    pub fn close(mut self) -> StorageResult<()> {
        self.closed = true;
        self.flush()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush() {
            eprintln!("[Database::drop] Failed to close {:?}: {}", self.root, e);
        }
    }
}
