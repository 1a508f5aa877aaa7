//! The catalog: table names, schemas, page lists and index roots, plus the
//! counters handing out table ids and page numbers.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use quarry::{failpoint, quarry_debug_log, PageNum, Schema, TableId};
use tempfile::NamedTempFile;

use crate::errors::{StorageError, StorageResult};

pub const CATALOG_FILE: &str = "catalog";

const NO_INDEX_ROOT: i32 = -1;

/// First character of every temporary table name.
const TEMP_PREFIX: char = '#';

#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub id: TableId,
    pub name: String,
    pub schema: Schema,
    /// Data pages in key order: every key of page `i` sorts before every key
    /// of page `i + 1`.
    pub pages: Vec<PageNum>,
    pub index_root: Option<PageNum>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    page_size: usize,
    next_table_id: TableId,
    next_page_num: PageNum,
    tables: BTreeMap<TableId, TableEntry>,
    names: HashMap<String, TableId>,
}

impl Catalog {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            next_table_id: 0,
            next_page_num: 0,
            tables: BTreeMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Creates a table. Names starting with `#` are reserved for temporary
    /// tables.
    pub fn create_table(&mut self, name: &str, schema: Schema) -> StorageResult<TableId> {
        check_name(name)?;
        self.add_table(name, schema)
    }

    fn add_table(&mut self, name: &str, schema: Schema) -> StorageResult<TableId> {
        if self.names.contains_key(name) {
            return Err(StorageError::TableExists(name.to_string()));
        }
        let id = self.next_table_id;
        self.next_table_id += 1;
        self.insert_entry(TableEntry {
            id,
            name: name.to_string(),
            schema,
            pages: Vec::new(),
            index_root: None,
        });
        quarry_debug_log!("[Catalog::create_table] Created '{}' with id {}", name, id);
        Ok(id)
    }

    /// Creates a table under a reserved name that no caller-chosen name
    /// can collide with.
    pub fn create_temp_table(&mut self, schema: Schema) -> StorageResult<TableId> {
        let name = format!("{TEMP_PREFIX}tmp{}", self.next_table_id);
        self.add_table(&name, schema)
    }

    fn insert_entry(&mut self, entry: TableEntry) {
        self.names.insert(entry.name.clone(), entry.id);
        self.tables.insert(entry.id, entry);
    }

    pub fn delete_table(&mut self, id: TableId) -> StorageResult<TableEntry> {
        let entry = self.tables.remove(&id).ok_or_else(|| not_found(id))?;
        self.names.remove(&entry.name);
        quarry_debug_log!("[Catalog::delete_table] Deleted '{}' ({})", entry.name, id);
        Ok(entry)
    }

    pub fn rename_table(&mut self, id: TableId, name: &str) -> StorageResult<()> {
        check_name(name)?;
        match self.names.get(name) {
            Some(&owner) if owner == id => return Ok(()),
            Some(_) => return Err(StorageError::TableExists(name.to_string())),
            None => {}
        }
        let entry = self.tables.get_mut(&id).ok_or_else(|| not_found(id))?;
        let old = std::mem::replace(&mut entry.name, name.to_string());
        self.names.remove(&old);
        self.names.insert(name.to_string(), id);
        Ok(())
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.names.get(name).copied()
    }

    pub fn table_name(&self, id: TableId) -> Option<&str> {
        self.tables.get(&id).map(|e| e.name.as_str())
    }

    pub fn entry(&self, id: TableId) -> StorageResult<&TableEntry> {
        self.tables.get(&id).ok_or_else(|| not_found(id))
    }

    fn entry_mut(&mut self, id: TableId) -> StorageResult<&mut TableEntry> {
        self.tables.get_mut(&id).ok_or_else(|| not_found(id))
    }

    pub fn schema(&self, id: TableId) -> StorageResult<&Schema> {
        Ok(&self.entry(id)?.schema)
    }

    pub fn pages(&self, id: TableId) -> StorageResult<&[PageNum]> {
        Ok(&self.entry(id)?.pages)
    }

    /// Id and name of every table, ordered by id.
    pub fn tables(&self) -> Vec<(TableId, String)> {
        self.tables
            .values()
            .map(|e| (e.id, e.name.clone()))
            .collect()
    }

    /// Hands out the next page number without placing it in any table.
    /// Numbers are never handed out twice, so an unused one is simply lost.
    pub fn reserve_page_num(&mut self) -> PageNum {
        let page_num = self.next_page_num;
        self.next_page_num += 1;
        page_num
    }

    /// Inserts reserved data pages into the table's page list starting at
    /// `sorting_index`, or at the end when `None`.
    pub fn link_pages(
        &mut self,
        id: TableId,
        sorting_index: Option<usize>,
        page_nums: &[PageNum],
    ) -> StorageResult<()> {
        let entry = self.tables.get_mut(&id).ok_or_else(|| not_found(id))?;
        let at = sorting_index.unwrap_or(entry.pages.len());
        if at > entry.pages.len() {
            return Err(StorageError::Structural(format!(
                "page position {at} past the end of table {id}"
            )));
        }
        entry.pages.splice(at..at, page_nums.iter().copied());
        Ok(())
    }

    pub fn index_root(&self, id: TableId) -> StorageResult<Option<PageNum>> {
        Ok(self.entry(id)?.index_root)
    }

    pub fn set_index_root(&mut self, id: TableId, root: Option<PageNum>) -> StorageResult<()> {
        self.entry_mut(id)?.index_root = root;
        Ok(())
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(self.page_size as i32);
        buf.put_i32(self.next_table_id as i32);
        buf.put_i32(self.next_page_num as i32);
        buf.put_i32(self.tables.len() as i32);
        for entry in self.tables.values() {
            buf.put_i32(entry.id as i32);
            buf.put_i32(entry.name.len() as i32);
            buf.put_slice(entry.name.as_bytes());
            entry.schema.encode(&mut buf);
            buf.put_i32(entry.pages.len() as i32);
            for &page in &entry.pages {
                buf.put_i32(page as i32);
            }
            buf.put_i32(entry.index_root.map_or(NO_INDEX_ROOT, |root| root as i32));
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> StorageResult<Catalog> {
        let page_size = read_count(&mut buf, "page size")?;
        let next_table_id = read_count(&mut buf, "table id counter")? as TableId;
        let next_page_num = read_count(&mut buf, "page counter")? as PageNum;
        let table_count = read_count(&mut buf, "table count")?;

        let mut catalog = Catalog::new(page_size);
        catalog.next_table_id = next_table_id;
        catalog.next_page_num = next_page_num;

        for _ in 0..table_count {
            let id = read_count(&mut buf, "table id")? as TableId;
            let name_len = read_count(&mut buf, "name length")?;
            if buf.remaining() < name_len {
                return Err(truncated("table name"));
            }
            let name = String::from_utf8(buf[..name_len].to_vec())
                .map_err(|_| StorageError::Structural("table name is not utf-8".into()))?;
            buf.advance(name_len);
            let schema = Schema::decode(&mut buf)?;
            let page_count = read_count(&mut buf, "page count")?;
            let mut pages = Vec::with_capacity(page_count.min(buf.remaining() / 4));
            for _ in 0..page_count {
                pages.push(read_count(&mut buf, "page number")? as PageNum);
            }
            if buf.remaining() < 4 {
                return Err(truncated("index root"));
            }
            let index_root = match buf.get_i32() {
                NO_INDEX_ROOT => None,
                root if root >= 0 => Some(root as PageNum),
                root => {
                    return Err(StorageError::Structural(format!(
                        "invalid index root {root}"
                    )))
                }
            };

            if id >= next_table_id
                || pages.iter().chain(&index_root).any(|&p| p >= next_page_num)
            {
                return Err(StorageError::Structural(format!(
                    "table '{name}' uses ids beyond the catalog counters"
                )));
            }
            if catalog.tables.contains_key(&id) || catalog.names.contains_key(&name) {
                return Err(StorageError::Structural(format!(
                    "table '{name}' ({id}) appears twice"
                )));
            }
            catalog.insert_entry(TableEntry {
                id,
                name,
                schema,
                pages,
                index_root,
            });
        }
        if buf.has_remaining() {
            return Err(StorageError::Structural(format!(
                "{} trailing bytes after catalog",
                buf.remaining()
            )));
        }
        Ok(catalog)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> StorageResult<Catalog> {
        let path = path.as_ref();
        quarry_debug_log!("[Catalog::load] Loading catalog from {:?}", path);
        let bytes = fs::read(path)?;
        Catalog::decode(&bytes)
    }

    /// Writes the catalog to a temporary file next to `path` and renames it
    /// over `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> StorageResult<()> {
        let path = path.as_ref();
        quarry_debug_log!("[Catalog::save] Saving {} tables to {:?}", self.tables.len(), path);
        failpoint::maybe_fail(failpoint::CATALOG_SAVE)?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut f = tmp.as_file();
            f.write_all(&self.encode())?;
            f.sync_all()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn check_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.starts_with(TEMP_PREFIX) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn not_found(id: TableId) -> StorageError {
    StorageError::TableNotFound(format!("#{id}"))
}

fn truncated(what: &str) -> StorageError {
    StorageError::Structural(format!("catalog truncated while reading {what}"))
}

/// Reads a non-negative big-endian `i32`.
fn read_count(buf: &mut &[u8], what: &str) -> StorageResult<usize> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    let value = buf.get_i32();
    if value < 0 {
        return Err(StorageError::Structural(format!("negative {what}: {value}")));
    }
    Ok(value as usize)
}
