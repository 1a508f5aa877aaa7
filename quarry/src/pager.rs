//! The Pager reads and writes pages in the per-table files under the
//! database directory: `pages/<table id>` for data, `index/<table id>` for
//! index nodes. A page lives at offset `page number * page size`.
use std::collections::HashMap;
use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::page::{Page, PageKey, PageRegion};
use crate::{failpoint, quarry_debug_log, TableId};

pub struct Pager {
    root: PathBuf,
    page_size: usize,
    files: HashMap<(PageRegion, TableId), File>,
}

impl Pager {
    /// Opens the page directories under `root`, creating them if missing.
    pub fn open<P: AsRef<Path>>(root: P, page_size: usize) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        quarry_debug_log!("[Pager::open] Opening page files under {:?}", root);
        for region in [PageRegion::Data, PageRegion::Index] {
            create_dir_all(root.join(region.dir_name()))?;
        }
        Ok(Self {
            root,
            page_size,
            files: HashMap::new(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file_path(&self, region: PageRegion, table_id: TableId) -> PathBuf {
        self.root.join(region.dir_name()).join(table_id.to_string())
    }

    fn file(&mut self, region: PageRegion, table_id: TableId) -> io::Result<&mut File> {
        if !self.files.contains_key(&(region, table_id)) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.file_path(region, table_id))?;
            self.files.insert((region, table_id), file);
        }
        self.files
            .get_mut(&(region, table_id))
            .ok_or_else(|| io::Error::other("page file handle vanished"))
    }

    fn offset(&self, key: PageKey) -> u64 {
        key.page_num as u64 * self.page_size as u64
    }

    /// Reads a page. A page past the end of the file is created by growing the
    /// file with zeros, so it reads back as an empty page.
    pub fn read_page(&mut self, key: PageKey) -> io::Result<Page> {
        failpoint::maybe_fail(failpoint::PAGER_READ)?;
        quarry_debug_log!("[Pager::read_page] Reading {:?}", key);
        let offset = self.offset(key);
        let page_size = self.page_size;
        let file = self.file(key.region, key.table_id)?;

        let end = offset + page_size as u64;
        if file.metadata()?.len() < end {
            quarry_debug_log!("[Pager::read_page] Extending file to {} bytes", end);
            file.set_len(end)?;
        }

        let mut data = vec![0u8; page_size].into_boxed_slice();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        Ok(Page::from_bytes(key, data))
    }

    pub fn write_page(&mut self, page: &Page) -> io::Result<()> {
        failpoint::maybe_fail(failpoint::PAGER_WRITE)?;
        quarry_debug_log!("[Pager::write_page] Writing {:?}", page.key);
        if page.size() != self.page_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "page {:?} has {} bytes, expected {}",
                    page.key,
                    page.size(),
                    self.page_size
                ),
            ));
        }
        let offset = self.offset(page.key);
        let file = self.file(page.key.region, page.key.table_id)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)
    }

    /// Overwrites a page with zeros on disk.
    pub fn zero_page(&mut self, key: PageKey) -> io::Result<()> {
        quarry_debug_log!("[Pager::zero_page] Zeroing {:?}", key);
        let empty = Page::new(key, self.page_size);
        self.write_page(&empty)
    }

    /// Closes and deletes one file of a table. A missing file is not an error.
    pub fn remove_table_file(&mut self, region: PageRegion, table_id: TableId) -> io::Result<()> {
        self.files.remove(&(region, table_id));
        let path = self.file_path(region, table_id);
        quarry_debug_log!("[Pager::remove_table_file] Removing {:?}", path);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn sync_all(&mut self) -> io::Result<()> {
        for file in self.files.values() {
            file.sync_all()?;
        }
        Ok(())
    }
}
