//! The page buffer: a fixed arena of in-memory frames caching disk pages,
//! evicted in least-recently-used order and written back on eviction.

use std::collections::HashMap;
use std::io;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::page::{Page, PageKey, PageRegion};
use crate::pager::Pager;
use crate::{quarry_debug_log, PageNum, TableId};

/// Bookkeeping of one frame. `prev`/`next` link the frame into the recency
/// list while it holds a page.
#[derive(Debug, Default, Clone)]
struct FrameMeta {
    key: Option<PageKey>,
    pin_count: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct BufferState {
    page_table: HashMap<PageKey, usize>,
    meta: Vec<FrameMeta>,
    free_list: Vec<usize>,
    /// Least recently used frame.
    head: Option<usize>,
    /// Most recently used frame.
    tail: Option<usize>,
}

impl BufferState {
    fn new(capacity: usize) -> Self {
        Self {
            page_table: HashMap::with_capacity(capacity),
            meta: vec![FrameMeta::default(); capacity],
            free_list: (0..capacity).rev().collect(),
            head: None,
            tail: None,
        }
    }

    fn unlink(&mut self, frame: usize) {
        let (prev, next) = (self.meta[frame].prev, self.meta[frame].next);
        match prev {
            Some(p) => self.meta[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.meta[n].prev = prev,
            None => self.tail = prev,
        }
        self.meta[frame].prev = None;
        self.meta[frame].next = None;
    }

    fn push_back(&mut self, frame: usize) {
        self.meta[frame].prev = self.tail;
        self.meta[frame].next = None;
        match self.tail {
            Some(t) => self.meta[t].next = Some(frame),
            None => self.head = Some(frame),
        }
        self.tail = Some(frame);
    }

    fn touch(&mut self, frame: usize) {
        if self.tail != Some(frame) {
            self.unlink(frame);
            self.push_back(frame);
        }
    }

    /// Least recently used frame that nobody has pinned.
    fn find_victim(&self) -> Option<usize> {
        let mut cursor = self.head;
        while let Some(frame) = cursor {
            if self.meta[frame].pin_count == 0 {
                return Some(frame);
            }
            cursor = self.meta[frame].next;
        }
        None
    }

    /// Forgets the page held by `frame` and returns the frame to the free list.
    fn release(&mut self, frame: usize) {
        self.unlink(frame);
        if let Some(key) = self.meta[frame].key.take() {
            self.page_table.remove(&key);
        }
        self.meta[frame].pin_count = 0;
        self.free_list.push(frame);
    }

    fn recency_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.page_table.len());
        let mut cursor = self.head;
        while let Some(frame) = cursor {
            order.push(frame);
            cursor = self.meta[frame].next;
        }
        order
    }
}

pub struct PageBuffer {
    pager: Mutex<Pager>,
    frames: Vec<RwLock<Page>>,
    state: Mutex<BufferState>,
    page_size: usize,
}

/// A pinned page. The frame cannot be evicted while the guard lives.
pub struct PageGuard<'a> {
    buffer: &'a PageBuffer,
    frame: usize,
    key: PageKey,
}

impl<'a> PageGuard<'a> {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.buffer.frames[self.frame].read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.buffer.frames[self.frame].write()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.buffer.unpin(self.frame);
    }
}

impl PageBuffer {
    pub fn new(pager: Pager, capacity: usize) -> Self {
        let page_size = pager.page_size();
        let placeholder = PageKey::data(0, 0);
        let frames = (0..capacity)
            .map(|_| RwLock::new(Page::new(placeholder, page_size)))
            .collect();
        Self {
            pager: Mutex::new(pager),
            frames,
            state: Mutex::new(BufferState::new(capacity)),
            page_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cached_pages(&self) -> usize {
        self.state.lock().page_table.len()
    }

    pub fn pinned_pages(&self) -> usize {
        self.state
            .lock()
            .meta
            .iter()
            .filter(|m| m.pin_count > 0)
            .count()
    }

    pub fn is_cached(&self, key: PageKey) -> bool {
        self.state.lock().page_table.contains_key(&key)
    }

    /// Pins `key` in a frame, reading it from disk on a miss.
    pub fn fetch(&self, key: PageKey) -> io::Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        // 1. Hit: pin and mark most recently used.
        if let Some(&frame) = state.page_table.get(&key) {
            state.meta[frame].pin_count += 1;
            state.touch(frame);
            return Ok(PageGuard {
                buffer: self,
                frame,
                key,
            });
        }

        // 2. Miss: take a free frame or evict the LRU unpinned one.
        let frame = match state.free_list.pop() {
            Some(frame) => frame,
            None => {
                let victim = state.find_victim().ok_or_else(|| {
                    eprintln!("[PageBuffer::fetch] No frame available for {:?}", key);
                    io::Error::other("all pages are pinned")
                })?;
                self.write_back(victim)?;
                state.unlink(victim);
                if let Some(old) = state.meta[victim].key.take() {
                    quarry_debug_log!("[PageBuffer::fetch] Evicted {:?}", old);
                    state.page_table.remove(&old);
                }
                victim
            }
        };

        // 3. Read the page into the frame.
        let page = match self.pager.lock().read_page(key) {
            Ok(page) => page,
            Err(e) => {
                eprintln!("[PageBuffer::fetch] Failed to read {:?}: {}", key, e);
                state.free_list.push(frame);
                return Err(e);
            }
        };
        *self.frames[frame].write() = page;

        // 4. Register it.
        state.meta[frame].key = Some(key);
        state.meta[frame].pin_count = 1;
        state.push_back(frame);
        state.page_table.insert(key, frame);
        Ok(PageGuard {
            buffer: self,
            frame,
            key,
        })
    }

    fn write_back(&self, frame: usize) -> io::Result<()> {
        let page = self.frames[frame].read();
        self.pager.lock().write_page(&page).map_err(|e| {
            eprintln!("[PageBuffer::write_back] Failed to write {:?}: {}", page.key, e);
            e
        })
    }

    fn unpin(&self, frame: usize) {
        let mut state = self.state.lock();
        let meta = &mut state.meta[frame];
        meta.pin_count = meta.pin_count.saturating_sub(1);
    }

    /// Writes every cached page back, syncs the files and empties the cache.
    pub fn purge(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.meta.iter().any(|m| m.pin_count > 0) {
            return Err(io::Error::other("cannot purge while pages are pinned"));
        }
        let order = state.recency_order();
        quarry_debug_log!("[PageBuffer::purge] Writing back {} pages", order.len());
        for frame in &order {
            self.write_back(*frame)?;
        }
        self.pager.lock().sync_all().map_err(|e| {
            eprintln!("[PageBuffer::purge] Failed to sync page files: {}", e);
            e
        })?;
        for frame in order {
            state.release(frame);
        }
        Ok(())
    }

    /// Drops a data page from the cache without writing it and zero-fills it
    /// on disk.
    pub fn delete_data_page(&self, table_id: TableId, page_num: PageNum) -> io::Result<()> {
        let key = PageKey::data(table_id, page_num);
        let mut state = self.state.lock();
        if let Some(&frame) = state.page_table.get(&key) {
            if state.meta[frame].pin_count > 0 {
                return Err(io::Error::other(format!("page {key:?} is pinned")));
            }
            state.release(frame);
        }
        drop(state);
        self.pager.lock().zero_page(key).map_err(|e| {
            eprintln!("[PageBuffer::delete_data_page] Failed to zero {:?}: {}", key, e);
            e
        })
    }

    /// Drops every cached index page of a table and removes its index file.
    pub fn delete_index(&self, table_id: TableId) -> io::Result<()> {
        let mut state = self.state.lock();
        let frames: Vec<usize> = state
            .page_table
            .iter()
            .filter(|(key, _)| key.region == PageRegion::Index && key.table_id == table_id)
            .map(|(_, &frame)| frame)
            .collect();
        if frames.iter().any(|&f| state.meta[f].pin_count > 0) {
            return Err(io::Error::other(format!(
                "index pages of table {table_id} are pinned"
            )));
        }
        for frame in frames {
            state.release(frame);
        }
        drop(state);
        self.pager
            .lock()
            .remove_table_file(PageRegion::Index, table_id)
            .map_err(|e| {
                eprintln!("[PageBuffer::delete_index] Failed to remove index of {}: {}", table_id, e);
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoint;
    use tempfile::tempdir;

    fn buffer(dir: &std::path::Path, capacity: usize) -> PageBuffer {
        PageBuffer::new(Pager::open(dir, 64).unwrap(), capacity)
    }

    fn stamp(buffer: &PageBuffer, key: PageKey, value: u8) {
        let guard = buffer.fetch(key).unwrap();
        guard.write().data[10] = value;
    }

    #[test]
    fn test_capacity_and_lru_victim() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path(), 3);
        for n in 0..3 {
            stamp(&buffer, PageKey::data(1, n), n as u8 + 1);
        }
        assert_eq!(buffer.cached_pages(), 3);

        // Touch page 0 so page 1 becomes the LRU page.
        drop(buffer.fetch(PageKey::data(1, 0)).unwrap());
        stamp(&buffer, PageKey::data(1, 3), 4);

        assert_eq!(buffer.cached_pages(), 3);
        assert!(!buffer.is_cached(PageKey::data(1, 1)));
        assert!(buffer.is_cached(PageKey::data(1, 0)));

        // The evicted page was written back.
        let page1 = buffer.fetch(PageKey::data(1, 1)).unwrap();
        assert_eq!(page1.read().data[10], 2);
        assert_eq!(buffer.cached_pages(), 3);
    }

    #[test]
    fn test_pinned_frames_are_not_evicted() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path(), 2);
        let a = buffer.fetch(PageKey::data(1, 0)).unwrap();
        let b = buffer.fetch(PageKey::data(1, 1)).unwrap();
        assert!(buffer.fetch(PageKey::data(1, 2)).is_err());
        assert_eq!(buffer.pinned_pages(), 2);
        drop(a);
        let c = buffer.fetch(PageKey::data(1, 2)).unwrap();
        assert!(buffer.is_cached(PageKey::data(1, 1)));
        assert!(!buffer.is_cached(PageKey::data(1, 0)));
        drop((b, c));
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn test_purge_persists_pages() {
        let dir = tempdir().unwrap();
        {
            let buffer = buffer(dir.path(), 4);
            stamp(&buffer, PageKey::data(2, 5), 9);
            stamp(&buffer, PageKey::index(2, 6), 7);
            buffer.purge().unwrap();
            assert_eq!(buffer.cached_pages(), 0);
        }
        let buffer = buffer(dir.path(), 4);
        assert_eq!(buffer.fetch(PageKey::data(2, 5)).unwrap().read().data[10], 9);
        assert_eq!(buffer.fetch(PageKey::index(2, 6)).unwrap().read().data[10], 7);
    }

    #[test]
    fn test_delete_pages() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path(), 4);
        stamp(&buffer, PageKey::data(1, 0), 3);
        buffer.purge().unwrap();
        stamp(&buffer, PageKey::data(1, 0), 4);
        buffer.delete_data_page(1, 0).unwrap();
        assert!(!buffer.is_cached(PageKey::data(1, 0)));
        assert_eq!(buffer.fetch(PageKey::data(1, 0)).unwrap().read().data[10], 0);

        stamp(&buffer, PageKey::index(1, 1), 5);
        stamp(&buffer, PageKey::index(1, 2), 5);
        buffer.delete_index(1).unwrap();
        assert_eq!(buffer.cached_pages(), 1);
    }

    #[test]
    fn test_failed_write_back_keeps_victim() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path(), 1);
        stamp(&buffer, PageKey::data(1, 0), 8);
        {
            let _fail = failpoint::scoped(failpoint::PAGER_WRITE);
            assert!(buffer.fetch(PageKey::data(1, 1)).is_err());
        }
        assert!(buffer.is_cached(PageKey::data(1, 0)));
        assert_eq!(buffer.fetch(PageKey::data(1, 0)).unwrap().read().data[10], 8);
    }

    #[test]
    fn test_failed_read_frees_frame() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path(), 2);
        {
            let _fail = failpoint::scoped(failpoint::PAGER_READ);
            assert!(buffer.fetch(PageKey::data(1, 0)).is_err());
        }
        assert_eq!(buffer.cached_pages(), 0);
        stamp(&buffer, PageKey::data(1, 0), 1);
        stamp(&buffer, PageKey::data(1, 1), 1);
        assert_eq!(buffer.cached_pages(), 2);
    }
}
