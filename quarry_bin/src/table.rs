//! Tables: records kept sorted by primary key across an ordered list of
//! data pages, with an optional B+ tree from key to record location.
//!
//! Pages are never held across a call that may fetch another page, so a
//! buffer of two frames is enough for every operation here.
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use quarry::page::{PageLayout, COUNT_SIZE};
use quarry::{
    quarry_debug_log, Column, Page, PageBuffer, PageKey, PageNum, Record, RecordCodec,
    RecordError, Schema, TableId, Value,
};

use crate::catalog::Catalog;
use crate::errors::{StorageError, StorageResult};
use crate::index::{check_branching, IndexTree, RecordLocation};

pub type TableIndex = IndexTree<Arc<Mutex<Catalog>>, Arc<PageBuffer>>;

/// Shared handles every table operates through.
#[derive(Clone)]
pub struct StorageContext {
    pub catalog: Arc<Mutex<Catalog>>,
    pub buffer: Arc<PageBuffer>,
    pub index_mode: bool,
}

impl StorageContext {
    pub fn new(catalog: Catalog, buffer: PageBuffer, index_mode: bool) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(catalog)),
            buffer: Arc::new(buffer),
            index_mode,
        }
    }

    pub fn page_size(&self) -> usize {
        self.buffer.page_size()
    }

    /// Whether tables of this schema carry an index. Derived tables have a
    /// nullable nominal key and are never indexed.
    fn indexes(&self, schema: &Schema) -> bool {
        self.index_mode && !schema.primary_key_column().nullable
    }

    pub fn create_table(&self, name: &str, schema: Schema) -> StorageResult<Table> {
        if self.indexes(&schema) {
            check_branching(schema.primary_key_column(), self.page_size())?;
        }
        let id = self.catalog.lock().create_table(name, schema)?;
        Ok(Table {
            ctx: self.clone(),
            id,
        })
    }

    pub fn open_table(&self, name: &str) -> StorageResult<Table> {
        let id = self
            .catalog
            .lock()
            .table_id(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;
        Ok(Table {
            ctx: self.clone(),
            id,
        })
    }

    fn create_temp(&self, schema: Schema) -> StorageResult<TempTable> {
        if self.indexes(&schema) {
            check_branching(schema.primary_key_column(), self.page_size())?;
        }
        let id = self.catalog.lock().create_temp_table(schema)?;
        Ok(TempTable {
            table: Table {
                ctx: self.clone(),
                id,
            },
            keep: false,
        })
    }
}

/// Where the records of a page ended up after an insert into it.
///
/// Records are numbered in their combined order: the old records of the
/// page with the new one at `inserted_at`. `placement` lists the pages that
/// now hold them, in order, with how many each holds.
#[derive(Debug)]
struct Relocation {
    page: PageNum,
    inserted_at: usize,
    placement: Vec<(PageNum, usize)>,
}

impl Relocation {
    fn locate(&self, combined: usize) -> RecordLocation {
        let mut slot = combined;
        for &(page, count) in &self.placement {
            if slot < count {
                return RecordLocation::new(page, slot);
            }
            slot -= count;
        }
        // Placement always covers every combined record.
        RecordLocation::new(self.page, combined)
    }

    fn new_location(&self) -> RecordLocation {
        self.locate(self.inserted_at)
    }

    /// New location of the record that sat at `old` before the insert.
    fn move_old(&self, old: RecordLocation) -> RecordLocation {
        if old.slot < self.inserted_at {
            self.locate(old.slot)
        } else {
            self.locate(old.slot + 1)
        }
    }
}

/// The physical change of one insert, worked out before anything is written.
#[derive(Debug)]
enum InsertPlan {
    /// After the live data of an existing page.
    Append { page: PageNum, end: usize, slot: usize },
    /// Alone on a new page at the end of the list.
    Grow { page: PageNum },
    /// Shifted into its page.
    Shift {
        page: PageNum,
        offset: usize,
        end: usize,
        relocation: Relocation,
    },
    /// `segments[0]` replaces the records of `page`; the other runs go to
    /// `fresh` pages linked right after it, at list position `pos + 1`.
    Split {
        pos: usize,
        page: PageNum,
        fresh: Vec<PageNum>,
        segments: Vec<Vec<Vec<u8>>>,
        relocation: Relocation,
    },
}

impl InsertPlan {
    fn location(&self) -> RecordLocation {
        match self {
            InsertPlan::Append { page, slot, .. } => RecordLocation::new(*page, *slot),
            InsertPlan::Grow { page } => RecordLocation::new(*page, 0),
            InsertPlan::Shift { relocation, .. } | InsertPlan::Split { relocation, .. } => {
                relocation.new_location()
            }
        }
    }

    fn relocation(&self) -> Option<&Relocation> {
        match self {
            InsertPlan::Shift { relocation, .. } | InsertPlan::Split { relocation, .. } => {
                Some(relocation)
            }
            _ => None,
        }
    }
}

/// Groups encoded records, in order, into runs that each fit one page.
fn pack(records: Vec<Vec<u8>>, page_size: usize) -> Vec<Vec<Vec<u8>>> {
    let mut runs = Vec::new();
    let mut run: Vec<Vec<u8>> = Vec::new();
    let mut used = COUNT_SIZE;
    for record in records {
        if !run.is_empty() && used + record.len() > page_size {
            runs.push(std::mem::take(&mut run));
            used = COUNT_SIZE;
        }
        used += record.len();
        run.push(record);
    }
    if !run.is_empty() {
        runs.push(run);
    }
    runs
}

/// Replaces the records of `page` with `records`. Returns false, leaving the
/// page untouched, when they do not fit.
fn fill<B: AsRef<[u8]>>(page: &mut Page, records: &[B]) -> bool {
    let total: usize = records.iter().map(|r| r.as_ref().len()).sum();
    if COUNT_SIZE + total > page.size() {
        return false;
    }
    page.clear();
    let mut end = COUNT_SIZE;
    for record in records {
        let record = record.as_ref();
        page.data[end..end + record.len()].copy_from_slice(record);
        end += record.len();
    }
    page.set_record_count(records.len());
    true
}

/// A handle on one table. Cheap to clone; all state lives in the catalog
/// and the page buffer.
///
/// A handle names the table by id. `delete_matching`, `update_matching`,
/// `alter_add` and `alter_drop` rebuild the table under a new id and move
/// only the handle they ran on. Other handles to the table then fail with
/// `TableNotFound` and must be reopened with `Database::table`.
#[derive(Clone)]
pub struct Table {
    ctx: StorageContext,
    id: TableId,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("id", &self.id).finish()
    }
}

impl Table {
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> StorageResult<String> {
        let catalog = self.ctx.catalog.lock();
        Ok(catalog.entry(self.id)?.name.clone())
    }

    pub fn schema(&self) -> StorageResult<Schema> {
        Ok(self.ctx.catalog.lock().schema(self.id)?.clone())
    }

    pub fn pages(&self) -> StorageResult<Vec<PageNum>> {
        Ok(self.ctx.catalog.lock().pages(self.id)?.to_vec())
    }

    pub fn codec(&self) -> StorageResult<RecordCodec> {
        Ok(RecordCodec::new(self.schema()?))
    }

    /// Resolves column names to positions.
    pub fn column_indices(&self, names: &[&str]) -> StorageResult<Vec<usize>> {
        let schema = self.schema()?;
        names
            .iter()
            .map(|name| {
                schema
                    .column_index(name)
                    .ok_or_else(|| StorageError::ColumnNotFound(name.to_string()))
            })
            .collect()
    }

    /// The primary-key index, when this table keeps one.
    pub fn index(&self) -> StorageResult<Option<TableIndex>> {
        let schema = self.schema()?;
        self.index_for(&schema)
    }

    fn index_for(&self, schema: &Schema) -> StorageResult<Option<TableIndex>> {
        if !self.ctx.indexes(schema) {
            return Ok(None);
        }
        let index = IndexTree::new(
            self.id,
            schema.primary_key_column(),
            self.ctx.page_size(),
            self.ctx.catalog.clone(),
            self.ctx.buffer.clone(),
        )?;
        // Pages without a root: the tree was dropped after a failure, or the
        // pages were written in bulk.
        let stale = {
            let catalog = self.ctx.catalog.lock();
            let entry = catalog.entry(self.id)?;
            entry.index_root.is_none() && !entry.pages.is_empty()
        };
        if stale {
            let codec = RecordCodec::new(schema.clone());
            if let Err(e) = self.rebuild_index(&codec, &index) {
                self.invalidate_index();
                return Err(e);
            }
        }
        Ok(Some(index))
    }

    fn with_page<R>(&self, page_num: PageNum, f: impl FnOnce(&mut Page) -> R) -> StorageResult<R> {
        let guard = self.ctx.buffer.fetch(PageKey::data(self.id, page_num))?;
        let mut page = guard.write();
        Ok(f(&mut page))
    }

    fn layout(&self, codec: &RecordCodec, page_num: PageNum) -> StorageResult<PageLayout> {
        let guard = self.ctx.buffer.fetch(PageKey::data(self.id, page_num))?;
        let layout = guard.read().read_with_offsets(codec)?;
        Ok(layout)
    }

    fn read_records(&self, codec: &RecordCodec, page_num: PageNum) -> StorageResult<Vec<Record>> {
        let guard = self.ctx.buffer.fetch(PageKey::data(self.id, page_num))?;
        let records = guard.read().read(codec, None)?;
        Ok(records)
    }

    fn reserve_page(&self) -> PageNum {
        self.ctx.catalog.lock().reserve_page_num()
    }

    fn link_pages(&self, sorting_index: Option<usize>, page_nums: &[PageNum]) -> StorageResult<()> {
        self.ctx
            .catalog
            .lock()
            .link_pages(self.id, sorting_index, page_nums)
    }

    /// Calls `callback` for every record matching `predicate`, in page order.
    pub fn find_matching<P, F>(&self, mut predicate: P, mut callback: F) -> StorageResult<()>
    where
        P: FnMut(&Record) -> bool,
        F: FnMut(&Record),
    {
        let codec = self.codec()?;
        for page_num in self.pages()? {
            for record in self.read_records(&codec, page_num)? {
                if predicate(&record) {
                    callback(&record);
                }
            }
        }
        Ok(())
    }

    pub fn collect_matching<P>(&self, predicate: P) -> StorageResult<Vec<Record>>
    where
        P: FnMut(&Record) -> bool,
    {
        let mut records = Vec::new();
        self.find_matching(predicate, |r| records.push(r.clone()))?;
        Ok(records)
    }

    pub fn scan(&self) -> StorageResult<Vec<Record>> {
        self.collect_matching(|_| true)
    }

    /// Number of records, read from the page headers.
    pub fn len(&self) -> StorageResult<usize> {
        let mut total = 0;
        for page_num in self.pages()? {
            total += self.with_page(page_num, |page| page.record_count())?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Looks a record up by primary key, through the index when there is one.
    pub fn get(&self, key: &Value) -> StorageResult<Option<Record>> {
        let schema = self.schema()?;
        let pk_column = schema.primary_key_column();
        if !key.is_null() && !pk_column.column_type.accepts(key) {
            return Err(StorageError::TypeMismatch {
                column: pk_column.name.clone(),
                expected: pk_column.column_type,
            });
        }
        let codec = RecordCodec::new(schema.clone());
        if let Some(index) = self.index_for(&schema)? {
            if key.is_null() {
                return Ok(None);
            }
            let Some(loc) = index.search(key)? else {
                return Ok(None);
            };
            let mut layout = self.layout(&codec, loc.page)?;
            if loc.slot >= layout.records.len() {
                return Err(StorageError::Structural(format!(
                    "index points past page {} of table {}",
                    loc.page, self.id
                )));
            }
            return Ok(Some(layout.records.swap_remove(loc.slot)));
        }
        for page_num in self.pages()? {
            for record in self.read_records(&codec, page_num)? {
                match codec.compare_key(&record, key) {
                    Ordering::Less => continue,
                    Ordering::Equal => return Ok(Some(record)),
                    Ordering::Greater => return Ok(None),
                }
            }
        }
        Ok(None)
    }

    fn encode_checked(&self, codec: &RecordCodec, record: &Record) -> StorageResult<Vec<u8>> {
        let encoded = codec.encode(record).map_err(StorageError::invalid_record)?;
        let page_size = self.ctx.page_size();
        if encoded.len() + COUNT_SIZE > page_size {
            return Err(StorageError::RecordTooLarge {
                size: encoded.len(),
                page_size,
            });
        }
        Ok(encoded)
    }

    /// Rejects a record whose non-null value in a unique non-key column is
    /// already present.
    fn check_unique(&self, codec: &RecordCodec, record: &Record) -> StorageResult<()> {
        let schema = codec.schema();
        let checked: Vec<usize> = schema
            .columns()
            .iter()
            .enumerate()
            .filter(|&(i, c)| c.unique && i != schema.primary_key() && !record.values[i].is_null())
            .map(|(i, _)| i)
            .collect();
        if checked.is_empty() {
            return Ok(());
        }
        for page_num in self.pages()? {
            for existing in self.read_records(codec, page_num)? {
                for &i in &checked {
                    if existing.values[i].compare(&record.values[i]) == Some(Ordering::Equal) {
                        return Err(StorageError::UniqueViolation {
                            column: schema.columns()[i].name.clone(),
                            value: record.values[i].clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Inserts a record at its key position.
    ///
    /// The change is planned from reads alone, then written. Fresh pages are
    /// filled before the page they split off is rewritten and only join the
    /// page list last, so a failed fetch leaves the data pages as they were.
    /// With an index the tree is changed first; if anything fails after that
    /// the tree is dropped and rebuilt from the pages on next use.
    pub fn insert(&self, record: Record) -> StorageResult<()> {
        let schema = self.schema()?;
        let codec = RecordCodec::new(schema.clone());
        let encoded = self.encode_checked(&codec, &record)?;
        self.check_unique(&codec, &record)?;
        let Some(index) = self.index_for(&schema)? else {
            let plan = self.plan_scanned(&codec, &record, &encoded)?;
            return self.commit(&plan, &encoded);
        };
        let key = codec.primary_key(&record).clone();
        let (plan, first_old_key) = self.plan_indexed(&codec, &index, &key, &encoded)?;
        let applied = self
            .apply_to_index(&index, &plan, first_old_key.as_ref(), key)
            .and_then(|()| self.commit(&plan, &encoded));
        if applied.is_err() {
            self.invalidate_index();
        }
        applied
    }

    fn plan_scanned(
        &self,
        codec: &RecordCodec,
        record: &Record,
        encoded: &[u8],
    ) -> StorageResult<InsertPlan> {
        let pages = self.pages()?;
        for (pos, &page_num) in pages.iter().enumerate() {
            let layout = self.layout(codec, page_num)?;
            let found = layout
                .records
                .iter()
                .position(|existing| codec.compare_records(existing, record) != Ordering::Less);
            if let Some(slot) = found {
                if codec.compare_records(&layout.records[slot], record) == Ordering::Equal {
                    return Err(StorageError::DuplicateKey(codec.primary_key(record).clone()));
                }
                return self.plan_place(codec, pos, page_num, layout, slot, encoded);
            }
        }
        self.plan_append(codec, &pages, encoded)
    }

    /// Plans an insert from the index. Also returns the first key of the
    /// page the record goes into, where the pointer fix-up starts.
    fn plan_indexed(
        &self,
        codec: &RecordCodec,
        index: &TableIndex,
        key: &Value,
        encoded: &[u8],
    ) -> StorageResult<(InsertPlan, Option<Value>)> {
        let pages = self.pages()?;
        match index.seek(key)? {
            Some((found, _)) if found.compare(key) == Some(Ordering::Equal) => {
                Err(StorageError::DuplicateKey(key.clone()))
            }
            Some((successor, loc)) => {
                let pos = pages.iter().position(|&p| p == loc.page).ok_or_else(|| {
                    StorageError::Structural(format!(
                        "index points at page {} outside table {}",
                        loc.page, self.id
                    ))
                })?;
                let layout = self.layout(codec, loc.page)?;
                let consistent = layout
                    .records
                    .get(loc.slot)
                    .is_some_and(|r| codec.compare_key(r, &successor) == Ordering::Equal);
                if !consistent {
                    return Err(StorageError::Structural(format!(
                        "index entry {successor} does not match page {} slot {}",
                        loc.page, loc.slot
                    )));
                }
                let first_old_key = codec.primary_key(&layout.records[0]).clone();
                let plan = self.plan_place(codec, pos, loc.page, layout, loc.slot, encoded)?;
                Ok((plan, Some(first_old_key)))
            }
            None => Ok((self.plan_append(codec, &pages, encoded)?, None)),
        }
    }

    /// Re-points the records a planned insert moves, then adds the new key.
    fn apply_to_index(
        &self,
        index: &TableIndex,
        plan: &InsertPlan,
        first_old_key: Option<&Value>,
        key: Value,
    ) -> StorageResult<()> {
        if let (Some(relocation), Some(start)) = (plan.relocation(), first_old_key) {
            index.update(
                start,
                |l| l.page == relocation.page,
                |l| relocation.move_old(l),
            )?;
        }
        if !index.insert(key, plan.location())? {
            return Err(StorageError::Structural(format!(
                "index of table {} already holds the new key",
                self.id
            )));
        }
        Ok(())
    }

    /// Plans a record after the last live record of the table.
    fn plan_append(
        &self,
        codec: &RecordCodec,
        pages: &[PageNum],
        encoded: &[u8],
    ) -> StorageResult<InsertPlan> {
        if let Some(&last) = pages.last() {
            let guard = self.ctx.buffer.fetch(PageKey::data(self.id, last))?;
            let (end, count) = {
                let page = guard.read();
                (page.live_size(codec)?, page.record_count())
            };
            if end + encoded.len() <= self.ctx.page_size() {
                return Ok(InsertPlan::Append {
                    page: last,
                    end,
                    slot: count,
                });
            }
        }
        Ok(InsertPlan::Grow {
            page: self.reserve_page(),
        })
    }

    /// Plans an insert into page `page_num`, at list position `pos`, before
    /// `slot`. When the record does not fit, the page keeps the first
    /// `(count + 1) / 2` records and the rest move to a page right after it.
    /// A half that still cannot take the record (only possible with
    /// variable-width records) is spread over as many pages as it needs.
    fn plan_place(
        &self,
        codec: &RecordCodec,
        pos: usize,
        page_num: PageNum,
        layout: PageLayout,
        slot: usize,
        encoded: &[u8],
    ) -> StorageResult<InsertPlan> {
        let page_size = self.ctx.page_size();
        let count = layout.records.len();
        let relocation = |placement: Vec<(PageNum, usize)>| Relocation {
            page: page_num,
            inserted_at: slot,
            placement,
        };
        if layout.end + encoded.len() <= page_size {
            return Ok(InsertPlan::Shift {
                page: page_num,
                offset: layout.offsets[slot],
                end: layout.end,
                relocation: relocation(vec![(page_num, count + 1)]),
            });
        }

        let keep = (count + 1) / 2;
        let mut left = layout
            .records
            .iter()
            .map(|r| codec.encode(r))
            .collect::<Result<Vec<_>, _>>()?;
        let mut right = left.split_off(keep);
        let mut segments = Vec::new();
        if right.is_empty() || slot < keep {
            left.insert(slot, encoded.to_vec());
            segments.extend(pack(left, page_size));
            if !right.is_empty() {
                segments.push(right);
            }
        } else {
            right.insert(slot - keep, encoded.to_vec());
            segments.push(left);
            segments.extend(pack(right, page_size));
        }

        let fresh: Vec<PageNum> = (1..segments.len()).map(|_| self.reserve_page()).collect();
        let placement = std::iter::once(page_num)
            .chain(fresh.iter().copied())
            .zip(segments.iter().map(Vec::len))
            .collect();
        Ok(InsertPlan::Split {
            pos,
            page: page_num,
            fresh,
            segments,
            relocation: relocation(placement),
        })
    }

    /// Writes a planned insert.
    fn commit(&self, plan: &InsertPlan, encoded: &[u8]) -> StorageResult<()> {
        let placed = match plan {
            InsertPlan::Append { page, end, .. } => {
                self.with_page(*page, |p| p.append_encoded(*end, encoded))?
            }
            InsertPlan::Grow { page } => {
                let placed = self.with_page(*page, |p| fill(p, &[encoded]))?;
                if placed {
                    self.link_pages(None, &[*page])?;
                    quarry_debug_log!("[Table::commit] Table {} grows to page {}", self.id, page);
                }
                placed
            }
            InsertPlan::Shift {
                page, offset, end, ..
            } => self.with_page(*page, |p| p.shift_insert(*offset, *end, encoded))?,
            InsertPlan::Split {
                pos,
                page,
                fresh,
                segments,
                ..
            } => {
                let mut placed = true;
                for (&fresh_page, run) in fresh.iter().zip(&segments[1..]) {
                    placed = placed && self.with_page(fresh_page, |p| fill(p, run))?;
                }
                placed = placed && self.with_page(*page, |p| fill(p, &segments[0]))?;
                if placed {
                    self.link_pages(Some(pos + 1), fresh)?;
                    quarry_debug_log!(
                        "[Table::commit] Split page {} of table {} into pages {:?}",
                        page,
                        self.id,
                        fresh
                    );
                }
                placed
            }
        };
        if !placed {
            return Err(StorageError::Structural(format!(
                "planned insert into table {} did not fit its page",
                self.id
            )));
        }
        Ok(())
    }

    /// Adds a record after the last one without looking at keys. Derived
    /// tables are filled this way and keep the order of their source.
    /// Indexed tables take the ordered insert path instead.
    pub fn append(&self, record: Record) -> StorageResult<()> {
        let schema = self.schema()?;
        if self.ctx.indexes(&schema) {
            return self.insert(record);
        }
        let codec = RecordCodec::new(schema);
        let encoded = self.encode_checked(&codec, &record)?;
        let plan = self.plan_append(&codec, &self.pages()?, &encoded)?;
        self.commit(&plan, &encoded)
    }

    /// Appends records in bulk, filling the last page and then fresh ones.
    fn write_records(&self, codec: &RecordCodec, records: &[Record]) -> StorageResult<()> {
        let mut start = 0;
        if let Some(&last) = self.pages()?.last() {
            start += self
                .with_page(last, |page| page.write(codec, records, 0))?
                .map_err(StorageError::invalid_record)?;
        }
        while start < records.len() {
            let page_num = self.reserve_page();
            let written = self
                .with_page(page_num, |page| {
                    page.clear();
                    page.write(codec, records, start)
                })?
                .map_err(StorageError::invalid_record)?;
            if written == 0 {
                return Err(StorageError::RecordTooLarge {
                    size: codec
                        .encoded_len(&records[start])
                        .map_err(StorageError::invalid_record)?,
                    page_size: self.ctx.page_size(),
                });
            }
            self.link_pages(None, &[page_num])?;
            start += written;
        }
        Ok(())
    }

    /// Indexes every stored record. Used after a bulk rewrite.
    fn build_index(&self, codec: &RecordCodec) -> StorageResult<()> {
        self.index_for(codec.schema()).map(|_| ())
    }

    /// Builds the tree from scratch out of the data pages.
    fn rebuild_index(&self, codec: &RecordCodec, index: &TableIndex) -> StorageResult<()> {
        self.ctx.buffer.delete_index(self.id)?;
        index.create_root()?;
        let mut entries = 0;
        for page_num in self.pages()? {
            for (slot, record) in self.read_records(codec, page_num)?.into_iter().enumerate() {
                let key = codec.primary_key(&record).clone();
                if !index.insert(key.clone(), RecordLocation::new(page_num, slot))? {
                    return Err(StorageError::Structural(format!(
                        "table {} stores key {key} twice",
                        self.id
                    )));
                }
                entries += 1;
            }
        }
        quarry_debug_log!("[Table::rebuild_index] Indexed {} records of table {}", entries, self.id);
        Ok(())
    }

    /// Forgets the index root after a failed change to the tree or the pages.
    /// The next indexed operation rebuilds it.
    fn invalidate_index(&self) {
        quarry_debug_log!("[Table::invalidate_index] Dropping index of table {}", self.id);
        if let Err(e) = self.ctx.catalog.lock().set_index_root(self.id, None) {
            eprintln!(
                "[Table::invalidate_index] Failed to reset index of table {}: {}",
                self.id, e
            );
        }
    }

    /// Removes every matching record. Returns how many were removed.
    pub fn delete_matching<P>(&mut self, mut predicate: P) -> StorageResult<usize>
    where
        P: FnMut(&Record) -> bool,
    {
        let codec = self.codec()?;
        let temp = self.ctx.create_temp(codec.schema().clone())?;
        let mut removed = 0;
        for page_num in self.pages()? {
            let mut records = self.read_records(&codec, page_num)?;
            let before = records.len();
            records.retain(|r| !predicate(r));
            removed += before - records.len();
            temp.write_records(&codec, &records)?;
        }
        if removed == 0 {
            temp.drop_now()?;
            return Ok(0);
        }
        temp.build_index(&codec)?;
        self.swap(temp)?;
        Ok(removed)
    }

    /// Applies `updater` to every matching record and re-inserts all records
    /// with full constraint checks. Returns how many were updated. On error
    /// the table is left as it was.
    pub fn update_matching<P, U>(&mut self, mut predicate: P, mut updater: U) -> StorageResult<usize>
    where
        P: FnMut(&Record) -> bool,
        U: FnMut(&mut Record),
    {
        let codec = self.codec()?;
        let temp = self.ctx.create_temp(codec.schema().clone())?;
        let mut updated = 0;
        for page_num in self.pages()? {
            for mut record in self.read_records(&codec, page_num)? {
                if predicate(&record) {
                    updater(&mut record);
                    updated += 1;
                }
                temp.insert(record)?;
            }
        }
        if updated == 0 {
            temp.drop_now()?;
            return Ok(0);
        }
        self.swap(temp)?;
        Ok(updated)
    }

    /// Adds a column; existing records get its default.
    pub fn alter_add(&mut self, column: Column) -> StorageResult<()> {
        let schema = self.schema()?;
        if schema.column_index(&column.name).is_some() {
            return Err(StorageError::ColumnExists(column.name));
        }
        let default = column.default.clone();
        let new_schema = schema
            .with_column(column)
            .map_err(StorageError::invalid_schema)?;
        self.rewrite(new_schema, |mut record| {
            record.values.push(default.clone());
            record
        })
    }

    pub fn alter_drop(&mut self, name: &str) -> StorageResult<()> {
        let schema = self.schema()?;
        let index = schema
            .column_index(name)
            .ok_or_else(|| StorageError::ColumnNotFound(name.to_string()))?;
        if index == schema.primary_key() {
            return Err(StorageError::PrimaryKeyColumn(name.to_string()));
        }
        let new_schema = schema
            .without_column(index)
            .map_err(StorageError::invalid_schema)?;
        self.rewrite(new_schema, |mut record| {
            record.values.remove(index);
            record
        })
    }

    /// Copies every record, transformed, into a table of `schema` and swaps
    /// it in. Key order is unchanged so records are written in bulk.
    fn rewrite<F>(&mut self, schema: Schema, mut transform: F) -> StorageResult<()>
    where
        F: FnMut(Record) -> Record,
    {
        let old_codec = self.codec()?;
        let new_codec = RecordCodec::new(schema.clone());
        let temp = self.ctx.create_temp(schema)?;
        for page_num in self.pages()? {
            let records: Vec<Record> = self
                .read_records(&old_codec, page_num)?
                .into_iter()
                .map(&mut transform)
                .collect();
            temp.write_records(&new_codec, &records)?;
        }
        temp.build_index(&new_codec)?;
        self.swap(temp)
    }

    /// Replaces this table's storage with `temp`'s, keeping the name.
    fn swap(&mut self, temp: TempTable) -> StorageResult<()> {
        let name = self.name()?;
        self.drop_storage()?;
        let table = temp.persist(&name)?;
        quarry_debug_log!("[Table::swap] '{}' now has id {}", name, table.id);
        self.id = table.id;
        Ok(())
    }

    fn drop_storage(&self) -> StorageResult<()> {
        let (pages, index_root) = {
            let catalog = self.ctx.catalog.lock();
            let entry = catalog.entry(self.id)?;
            (entry.pages.clone(), entry.index_root)
        };
        for page_num in pages {
            self.ctx.buffer.delete_data_page(self.id, page_num)?;
        }
        if self.ctx.index_mode || index_root.is_some() {
            self.ctx.buffer.delete_index(self.id)?;
        }
        self.ctx.catalog.lock().delete_table(self.id)?;
        Ok(())
    }

    /// Deletes the table's pages, its index and its catalog entry.
    pub fn drop(self) -> StorageResult<()> {
        self.drop_storage()
    }

    /// Copies the matching records into a new derived table.
    pub fn to_filtered<P>(&self, mut predicate: P) -> StorageResult<TempTable>
    where
        P: FnMut(&Record) -> bool,
    {
        let codec = self.codec()?;
        let schema = Schema::derived(codec.schema().columns().to_vec())
            .map_err(StorageError::invalid_schema)?;
        let out = self.ctx.create_temp(schema)?;
        let out_codec = out.codec()?;
        for page_num in self.pages()? {
            let mut records = self.read_records(&codec, page_num)?;
            records.retain(|r| predicate(r));
            out.write_records(&out_codec, &records)?;
        }
        Ok(out)
    }

    /// Copies the given columns into a new derived table. Columns keep
    /// their order in this table and repeats are dropped.
    pub fn to_selected(&self, columns: &[usize]) -> StorageResult<TempTable> {
        let codec = self.codec()?;
        if let Some(&bad) = columns.iter().find(|&&i| i >= codec.schema().len()) {
            return Err(StorageError::ColumnNotFound(format!("#{bad}")));
        }
        let mut columns = columns.to_vec();
        columns.sort_unstable();
        columns.dedup();
        let schema = codec
            .schema()
            .project(&columns)
            .map_err(StorageError::invalid_schema)?;
        let out = self.ctx.create_temp(schema)?;
        let out_codec = out.codec()?;
        for page_num in self.pages()? {
            let records: Vec<Record> = self
                .read_records(&codec, page_num)?
                .into_iter()
                .map(|r| Record::new(columns.iter().map(|&i| r.values[i].clone()).collect()))
                .collect();
            out.write_records(&out_codec, &records)?;
        }
        Ok(out)
    }

    /// Cartesian product of two tables, `a` in the outer loop. Columns are
    /// named `table.column`.
    pub fn merge(a: &Table, b: &Table) -> StorageResult<TempTable> {
        Self::merge_named(a, Some(a.name()?.as_str()), b, Some(b.name()?.as_str()))
    }

    /// Product of any number of tables, folded left to right. A single table
    /// is copied.
    pub fn merge_n(tables: &[&Table]) -> StorageResult<TempTable> {
        match tables {
            [] => Err(StorageError::InvalidSchema(RecordError::NoColumns)),
            [only] => only.to_filtered(|_| true),
            [first, second, rest @ ..] => {
                let mut acc = Self::merge(first, second)?;
                for table in rest {
                    let next = Self::merge_named(&acc, None, table, Some(table.name()?.as_str()))?;
                    acc = next;
                }
                Ok(acc)
            }
        }
    }

    fn merge_named(
        a: &Table,
        a_name: Option<&str>,
        b: &Table,
        b_name: Option<&str>,
    ) -> StorageResult<TempTable> {
        let a_codec = a.codec()?;
        let b_codec = b.codec()?;
        let schema = Schema::merge(a_name, a_codec.schema(), b_name, b_codec.schema())
            .map_err(StorageError::invalid_schema)?;
        let out = a.ctx.create_temp(schema)?;
        let out_codec = out.codec()?;
        let right = b.scan()?;
        for page_num in a.pages()? {
            let mut batch = Vec::new();
            for left in a.read_records(&a_codec, page_num)? {
                for r in &right {
                    let mut values = left.values.clone();
                    values.extend(r.values.iter().cloned());
                    batch.push(Record::new(values));
                }
            }
            out.write_records(&out_codec, &batch)?;
        }
        Ok(out)
    }
}

/// A derived table that is dropped when the guard goes out of scope unless
/// it is persisted.
pub struct TempTable {
    table: Table,
    keep: bool,
}

impl TempTable {
    /// Drops the table now, reporting failures instead of logging them.
    pub fn drop_now(mut self) -> StorageResult<()> {
        self.keep = true;
        self.table.drop_storage()
    }

    /// Keeps the table under `name`.
    pub fn persist(mut self, name: &str) -> StorageResult<Table> {
        self.table
            .ctx
            .catalog
            .lock()
            .rename_table(self.table.id, name)?;
        self.keep = true;
        Ok(self.table.clone())
    }
}

impl Deref for TempTable {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.table
    }
}

impl fmt::Debug for TempTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempTable")
            .field("id", &self.table.id)
            .field("keep", &self.keep)
            .finish()
    }
}

impl Drop for TempTable {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = self.table.drop_storage() {
            eprintln!(
                "[TempTable::drop] Failed to drop table {}: {}",
                self.table.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry::Pager;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path, page_size: usize, index_mode: bool) -> StorageContext {
        let pager = Pager::open(dir, page_size).unwrap();
        StorageContext::new(Catalog::new(page_size), PageBuffer::new(pager, 4), index_mode)
    }

    #[test]
    fn test_relocation_mapping() {
        let relocation = Relocation {
            page: 7,
            inserted_at: 2,
            placement: vec![(7, 3), (9, 2)],
        };
        assert_eq!(relocation.new_location(), RecordLocation::new(7, 2));
        assert_eq!(relocation.move_old(RecordLocation::new(7, 1)), RecordLocation::new(7, 1));
        assert_eq!(relocation.move_old(RecordLocation::new(7, 2)), RecordLocation::new(9, 0));
        assert_eq!(relocation.move_old(RecordLocation::new(7, 3)), RecordLocation::new(9, 1));
    }

    #[test]
    fn test_split_keeps_first_half() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), 64, false);
        let schema = Schema::new(vec![Column::int("id"), Column::char_fixed("tag", 8)], 0).unwrap();
        let table = ctx.create_table("t", schema).unwrap();
        for id in [5, 1, 9, 3] {
            table
                .insert(Record::new(vec![Value::Int(id), Value::from("x")]))
                .unwrap();
        }
        let codec = table.codec().unwrap();
        let pages = table.pages().unwrap();
        let ids: Vec<Vec<i32>> = pages
            .iter()
            .map(|&p| {
                table
                    .read_records(&codec, p)
                    .unwrap()
                    .iter()
                    .filter_map(|r| r.values[0].as_int())
                    .collect()
            })
            .collect();
        assert_eq!(ids, vec![vec![1, 3, 5], vec![9]]);
    }

    #[test]
    fn test_spill_for_variable_width_records() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), 128, true);
        let schema = Schema::new(vec![Column::int("id"), Column::char_var("body", 100)], 0).unwrap();
        let table = ctx.create_table("t", schema).unwrap();
        // Three small records, then a large one that fits in neither half.
        for id in [1, 2, 4] {
            table
                .insert(Record::new(vec![Value::Int(id), Value::from("ab")]))
                .unwrap();
        }
        table
            .insert(Record::new(vec![Value::Int(3), Value::from("y".repeat(100))]))
            .unwrap();
        let ids: Vec<i32> = table
            .scan()
            .unwrap()
            .iter()
            .filter_map(|r| r.values[0].as_int())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        let index = table.index().unwrap().unwrap();
        for (key, loc) in index.entries().unwrap() {
            let record = table.get(&key).unwrap().unwrap();
            assert_eq!(record.values[0], key);
            let codec = table.codec().unwrap();
            let on_page = table.read_records(&codec, loc.page).unwrap();
            assert_eq!(on_page[loc.slot].values[0], key);
        }
    }

    #[test]
    fn test_pack_fills_pages_in_order() {
        let runs = pack(vec![vec![0; 40], vec![0; 40], vec![0; 100], vec![0; 10]], 128);
        let sizes: Vec<Vec<usize>> = runs
            .iter()
            .map(|run| run.iter().map(Vec::len).collect())
            .collect();
        assert_eq!(sizes, vec![vec![40, 40], vec![100, 10]]);
    }

    #[test]
    fn test_invalidated_index_is_rebuilt() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), 128, true);
        let schema = Schema::new(vec![Column::int("id"), Column::char_fixed("tag", 8)], 0).unwrap();
        let table = ctx.create_table("t", schema).unwrap();
        for id in 0..20 {
            table
                .insert(Record::new(vec![Value::Int(id), Value::from("x")]))
                .unwrap();
        }

        table.invalidate_index();
        assert_eq!(ctx.catalog.lock().index_root(table.id()).unwrap(), None);
        let record = table.get(&Value::Int(5)).unwrap().unwrap();
        assert_eq!(record.values[0], Value::Int(5));
        assert!(ctx.catalog.lock().index_root(table.id()).unwrap().is_some());
        assert_eq!(table.index().unwrap().unwrap().entries().unwrap().len(), 20);
    }
}
