//! B+ tree over a table's primary key, one node per index page.
//!
//! Node layout: `[u8 isLeaf][i32 keyCount][keys][i32 pointerCount][pointers]`
//! with each pointer stored as `(i32 page, i32 slot)`. A null pointer is
//! `(-1, -1)` and a node pointer is `(page, -1)`. Integer, double and bool
//! keys take their record-codec width; string keys are `[i32 len][bytes]`.
//!
//! Every node holds `keys.len() + 1` pointers. In an internal node pointer
//! `i` leads to the keys `k` with `keys[i - 1] <= k < keys[i]`. In a leaf
//! pointer `i` locates the record of `keys[i]` and the last pointer links to
//! the next leaf.
use std::cmp::Ordering;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use quarry::{quarry_debug_log, Column, ColumnType, PageBuffer, PageKey, PageNum, TableId, Value};

use crate::catalog::Catalog;
use crate::errors::{ConfigError, StorageError, StorageResult};

const NULL_POINTER: (i32, i32) = (-1, -1);
const NODE_SLOT: i32 = -1;
/// `isLeaf` byte, key count and pointer count.
const NODE_HEADER_SIZE: usize = 9;
const POINTER_SIZE: usize = 8;

/// Position of a record: data page number and slot within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordLocation {
    pub page: PageNum,
    pub slot: usize,
}

impl RecordLocation {
    pub fn new(page: PageNum, slot: usize) -> Self {
        Self { page, slot }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPointer {
    Null,
    Node(PageNum),
    Record(RecordLocation),
}

impl IndexPointer {
    fn encode(self, buf: &mut impl BufMut) {
        let (page, slot) = match self {
            IndexPointer::Null => NULL_POINTER,
            IndexPointer::Node(page) => (page as i32, NODE_SLOT),
            IndexPointer::Record(loc) => (loc.page as i32, loc.slot as i32),
        };
        buf.put_i32(page);
        buf.put_i32(slot);
    }

    fn decode(buf: &mut impl Buf) -> StorageResult<Self> {
        if buf.remaining() < POINTER_SIZE {
            return Err(corrupt("pointer truncated"));
        }
        match (buf.get_i32(), buf.get_i32()) {
            NULL_POINTER => Ok(IndexPointer::Null),
            (page, NODE_SLOT) if page >= 0 => Ok(IndexPointer::Node(page as PageNum)),
            (page, slot) if page >= 0 && slot >= 0 => Ok(IndexPointer::Record(
                RecordLocation::new(page as PageNum, slot as usize),
            )),
            (page, slot) => Err(corrupt(&format!("invalid pointer ({page}, {slot})"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    pub kind: NodeKind,
    pub keys: Vec<Value>,
    pub pointers: Vec<IndexPointer>,
}

impl IndexNode {
    /// A leaf with no keys and no successor.
    pub fn empty_leaf() -> Self {
        Self {
            kind: NodeKind::Leaf,
            keys: Vec::new(),
            pointers: vec![IndexPointer::Null],
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    fn child(&self, index: usize) -> StorageResult<PageNum> {
        match self.pointers.get(index) {
            Some(IndexPointer::Node(page)) => Ok(*page),
            other => Err(corrupt(&format!("internal node pointer {index} is {other:?}"))),
        }
    }

    fn record(&self, index: usize) -> StorageResult<RecordLocation> {
        match self.pointers.get(index) {
            Some(IndexPointer::Record(loc)) => Ok(*loc),
            other => Err(corrupt(&format!("leaf pointer {index} is {other:?}"))),
        }
    }

    fn next_leaf(&self) -> Option<PageNum> {
        match self.pointers.last() {
            Some(IndexPointer::Node(page)) => Some(*page),
            _ => None,
        }
    }

    pub fn encode(&self, key_type: ColumnType) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(u8::from(self.is_leaf()));
        buf.put_i32(self.keys.len() as i32);
        for key in &self.keys {
            encode_key(&mut buf, key_type, key);
        }
        buf.put_i32(self.pointers.len() as i32);
        for pointer in &self.pointers {
            pointer.encode(&mut buf);
        }
        buf
    }

    pub fn decode(mut buf: &[u8], key_type: ColumnType) -> StorageResult<IndexNode> {
        if buf.remaining() < 5 {
            return Err(corrupt("node header truncated"));
        }
        let kind = match buf.get_u8() {
            1 => NodeKind::Leaf,
            0 => NodeKind::Internal,
            other => return Err(corrupt(&format!("invalid node kind {other}"))),
        };
        let key_count = read_len(&mut buf)?;
        let mut keys = Vec::with_capacity(key_count.min(buf.remaining()));
        for _ in 0..key_count {
            keys.push(decode_key(&mut buf, key_type)?);
        }
        let pointer_count = read_len(&mut buf)?;
        if pointer_count != key_count + 1 {
            return Err(corrupt(&format!(
                "node has {key_count} keys and {pointer_count} pointers"
            )));
        }
        let pointers = (0..pointer_count)
            .map(|_| IndexPointer::decode(&mut buf))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(IndexNode {
            kind,
            keys,
            pointers,
        })
    }
}

fn corrupt(message: &str) -> StorageError {
    StorageError::Structural(format!("index: {message}"))
}

fn read_len(buf: &mut &[u8]) -> StorageResult<usize> {
    if buf.remaining() < 4 {
        return Err(corrupt("length truncated"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Err(corrupt(&format!("negative length {len}")));
    }
    Ok(len as usize)
}

fn encode_key(buf: &mut impl BufMut, key_type: ColumnType, key: &Value) {
    match (key_type, key) {
        (ColumnType::Int, Value::Int(i)) => buf.put_i32(*i),
        (ColumnType::Double, Value::Double(d)) => buf.put_f64(*d),
        (ColumnType::Bool, Value::Bool(b)) => buf.put_u8(u8::from(*b)),
        (_, Value::Text(s)) => {
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        // Keys are checked against the key type before they reach a node.
        _ => debug_assert!(false, "key {key:?} does not match {key_type}"),
    }
}

fn decode_key(buf: &mut &[u8], key_type: ColumnType) -> StorageResult<Value> {
    let needed = key_type.fixed_width().unwrap_or(4);
    if buf.remaining() < needed {
        return Err(corrupt("key truncated"));
    }
    Ok(match key_type {
        ColumnType::Int => Value::Int(buf.get_i32()),
        ColumnType::Double => Value::Double(buf.get_f64()),
        ColumnType::Bool => Value::Bool(buf.get_u8() == 1),
        ColumnType::CharFixed | ColumnType::CharVar => {
            let len = read_len(buf)?;
            if buf.remaining() < len {
                return Err(corrupt("string key truncated"));
            }
            let text = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| corrupt("string key is not utf-8"))?;
            buf.advance(len);
            Value::Text(text)
        }
    })
}

/// Where the tree keeps its root and gets fresh page numbers from.
pub trait IndexCatalog {
    fn index_root(&self, table_id: TableId) -> StorageResult<Option<PageNum>>;
    fn set_index_root(&self, table_id: TableId, root: Option<PageNum>) -> StorageResult<()>;
    fn allocate_index_page(&self) -> StorageResult<PageNum>;
}

/// Storage for serialized nodes.
pub trait IndexPages {
    fn load_node(&self, table_id: TableId, page: PageNum) -> StorageResult<Vec<u8>>;
    fn store_node(&self, table_id: TableId, page: PageNum, bytes: &[u8]) -> StorageResult<()>;
    fn drop_index(&self, table_id: TableId) -> StorageResult<()>;
}

impl IndexCatalog for Arc<Mutex<Catalog>> {
    fn index_root(&self, table_id: TableId) -> StorageResult<Option<PageNum>> {
        self.lock().index_root(table_id)
    }

    fn set_index_root(&self, table_id: TableId, root: Option<PageNum>) -> StorageResult<()> {
        self.lock().set_index_root(table_id, root)
    }

    fn allocate_index_page(&self) -> StorageResult<PageNum> {
        Ok(self.lock().reserve_page_num())
    }
}

impl IndexPages for Arc<PageBuffer> {
    fn load_node(&self, table_id: TableId, page: PageNum) -> StorageResult<Vec<u8>> {
        let guard = self.fetch(PageKey::index(table_id, page))?;
        let bytes = guard.read().data.to_vec();
        Ok(bytes)
    }

    fn store_node(&self, table_id: TableId, page: PageNum, bytes: &[u8]) -> StorageResult<()> {
        let guard = self.fetch(PageKey::index(table_id, page))?;
        let mut page = guard.write();
        if bytes.len() > page.size() {
            return Err(corrupt(&format!(
                "node of {} bytes exceeds the page size",
                bytes.len()
            )));
        }
        page.clear();
        page.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn drop_index(&self, table_id: TableId) -> StorageResult<()> {
        Ok(self.delete_index(table_id)?)
    }
}

/// Most pointers a node can hold on a page for keys of `key_width` bytes.
pub fn max_pointers(page_size: usize, key_width: usize) -> usize {
    (page_size.saturating_sub(NODE_HEADER_SIZE) + key_width) / (key_width + POINTER_SIZE)
}

/// Encoded width of the widest key of a column.
pub fn key_width(column: &Column) -> usize {
    match column.column_type.fixed_width() {
        Some(width) => width,
        None => column.size + 4,
    }
}

/// Branching factor for a key column, rejecting pages too small to hold
/// three pointers.
pub fn check_branching(key_column: &Column, page_size: usize) -> StorageResult<usize> {
    let key_width = key_width(key_column);
    let pointers = max_pointers(page_size, key_width);
    if pointers < 3 {
        return Err(ConfigError::BranchingFactor {
            page_size,
            key_width,
            pointers,
        }
        .into());
    }
    Ok(pointers)
}

pub struct IndexTree<C, P> {
    table_id: TableId,
    key_column: Column,
    max_pointers: usize,
    catalog: C,
    pages: P,
}

impl<C: IndexCatalog, P: IndexPages> IndexTree<C, P> {
    pub fn new(
        table_id: TableId,
        key_column: &Column,
        page_size: usize,
        catalog: C,
        pages: P,
    ) -> StorageResult<Self> {
        let max_pointers = check_branching(key_column, page_size)?;
        Ok(Self {
            table_id,
            key_column: key_column.clone(),
            max_pointers,
            catalog,
            pages,
        })
    }

    pub fn max_pointers(&self) -> usize {
        self.max_pointers
    }

    fn check_key(&self, key: &Value) -> StorageResult<()> {
        if key.is_null() {
            return Err(StorageError::NullViolation(self.key_column.name.clone()));
        }
        if !self.key_column.column_type.accepts(key) {
            return Err(StorageError::TypeMismatch {
                column: self.key_column.name.clone(),
                expected: self.key_column.column_type,
            });
        }
        Ok(())
    }

    fn load(&self, page: PageNum) -> StorageResult<IndexNode> {
        let bytes = self.pages.load_node(self.table_id, page)?;
        IndexNode::decode(&bytes, self.key_column.column_type)
    }

    fn store(&self, page: PageNum, node: &IndexNode) -> StorageResult<()> {
        let bytes = node.encode(self.key_column.column_type);
        self.pages.store_node(self.table_id, page, &bytes)
    }

    /// Index of the child to follow for `key`: the number of separators
    /// that are `<= key`.
    fn child_index(node: &IndexNode, key: &Value) -> usize {
        node.keys.partition_point(|k| order(k, key) != Ordering::Greater)
    }

    /// Leaf that would hold `key`, with its page number.
    fn find_leaf(&self, key: &Value) -> StorageResult<Option<(PageNum, IndexNode)>> {
        let Some(mut page) = self.catalog.index_root(self.table_id)? else {
            return Ok(None);
        };
        loop {
            let node = self.load(page)?;
            if node.is_leaf() {
                return Ok(Some((page, node)));
            }
            page = node.child(Self::child_index(&node, key))?;
        }
    }

    pub fn search(&self, key: &Value) -> StorageResult<Option<RecordLocation>> {
        self.check_key(key)?;
        let Some((_, leaf)) = self.find_leaf(key)? else {
            return Ok(None);
        };
        match leaf.keys.binary_search_by(|k| order(k, key)) {
            Ok(i) => Ok(Some(leaf.record(i)?)),
            Err(_) => Ok(None),
        }
    }

    /// First entry whose key is `>= key`.
    pub fn seek(&self, key: &Value) -> StorageResult<Option<(Value, RecordLocation)>> {
        self.check_key(key)?;
        let Some((_, mut leaf)) = self.find_leaf(key)? else {
            return Ok(None);
        };
        let mut i = leaf.keys.partition_point(|k| order(k, key) == Ordering::Less);
        loop {
            if i < leaf.keys.len() {
                return Ok(Some((leaf.keys[i].clone(), leaf.record(i)?)));
            }
            match leaf.next_leaf() {
                Some(next) => {
                    leaf = self.load(next)?;
                    i = 0;
                }
                None => return Ok(None),
            }
        }
    }

    /// The root page, stored as an empty leaf when the tree has none yet.
    pub fn create_root(&self) -> StorageResult<PageNum> {
        if let Some(root) = self.catalog.index_root(self.table_id)? {
            return Ok(root);
        }
        let root = self.catalog.allocate_index_page()?;
        self.store(root, &IndexNode::empty_leaf())?;
        self.catalog.set_index_root(self.table_id, Some(root))?;
        quarry_debug_log!("[IndexTree::create_root] Created root {} for table {}", root, self.table_id);
        Ok(root)
    }

    /// Adds `key`. Returns false, changing nothing, when the key exists.
    pub fn insert(&self, key: Value, location: RecordLocation) -> StorageResult<bool> {
        self.check_key(&key)?;
        let root = self.create_root()?;

        // Descend, remembering the internal nodes and the child taken.
        let mut path: Vec<(PageNum, IndexNode, usize)> = Vec::new();
        let mut page = root;
        let mut node = self.load(page)?;
        while !node.is_leaf() {
            let i = Self::child_index(&node, &key);
            let child = node.child(i)?;
            path.push((page, node, i));
            page = child;
            node = self.load(page)?;
        }

        let pos = match node.keys.binary_search_by(|k| order(k, &key)) {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        node.keys.insert(pos, key);
        node.pointers.insert(pos, IndexPointer::Record(location));

        // Split upwards while nodes overflow.
        loop {
            if node.pointers.len() <= self.max_pointers {
                self.store(page, &node)?;
                return Ok(true);
            }
            let right_page = self.catalog.allocate_index_page()?;
            let (separator, right) = split(&mut node, right_page);
            self.store(page, &node)?;
            self.store(right_page, &right)?;
            quarry_debug_log!(
                "[IndexTree::insert] Split node {} into {} at {}",
                page,
                right_page,
                separator
            );

            match path.pop() {
                Some((parent_page, mut parent, i)) => {
                    parent.keys.insert(i, separator);
                    parent.pointers.insert(i + 1, IndexPointer::Node(right_page));
                    page = parent_page;
                    node = parent;
                }
                None => {
                    let new_root = self.catalog.allocate_index_page()?;
                    let root_node = IndexNode {
                        kind: NodeKind::Internal,
                        keys: vec![separator],
                        pointers: vec![IndexPointer::Node(page), IndexPointer::Node(right_page)],
                    };
                    self.store(new_root, &root_node)?;
                    self.catalog.set_index_root(self.table_id, Some(new_root))?;
                    return Ok(true);
                }
            }
        }
    }

    /// Walks the leaves from the one holding `start_key` to the end and
    /// rewrites every record pointer at or after `start_key` that matches
    /// `predicate`. Returns the number of rewritten pointers.
    pub fn update<F, T>(&self, start_key: &Value, predicate: F, mut transform: T) -> StorageResult<usize>
    where
        F: Fn(RecordLocation) -> bool,
        T: FnMut(RecordLocation) -> RecordLocation,
    {
        self.check_key(start_key)?;
        let Some((mut page, mut leaf)) = self.find_leaf(start_key)? else {
            return Ok(0);
        };
        let mut start = leaf
            .keys
            .partition_point(|k| order(k, start_key) == Ordering::Less);
        let mut updated = 0;
        loop {
            let mut changed = false;
            for i in start..leaf.keys.len() {
                let loc = leaf.record(i)?;
                if predicate(loc) {
                    let moved = transform(loc);
                    leaf.pointers[i] = IndexPointer::Record(moved);
                    changed |= moved != loc;
                    updated += 1;
                }
            }
            if changed {
                self.store(page, &leaf)?;
            }
            match leaf.next_leaf() {
                Some(next) => {
                    page = next;
                    leaf = self.load(page)?;
                    start = 0;
                }
                None => return Ok(updated),
            }
        }
    }

    /// Every entry in key order.
    pub fn entries(&self) -> StorageResult<Vec<(Value, RecordLocation)>> {
        let Some(mut page) = self.catalog.index_root(self.table_id)? else {
            return Ok(Vec::new());
        };
        let mut node = self.load(page)?;
        while !node.is_leaf() {
            page = node.child(0)?;
            node = self.load(page)?;
        }
        let mut entries = Vec::new();
        loop {
            for (i, key) in node.keys.iter().enumerate() {
                entries.push((key.clone(), node.record(i)?));
            }
            match node.next_leaf() {
                Some(next) => node = self.load(next)?,
                None => return Ok(entries),
            }
        }
    }

    /// Number of levels, zero for an index that was never written.
    pub fn height(&self) -> StorageResult<usize> {
        let Some(mut page) = self.catalog.index_root(self.table_id)? else {
            return Ok(0);
        };
        let mut height = 1;
        loop {
            let node = self.load(page)?;
            if node.is_leaf() {
                return Ok(height);
            }
            page = node.child(0)?;
            height += 1;
        }
    }

    /// Deletes the index file and forgets the root.
    pub fn drop(&self) -> StorageResult<()> {
        self.pages.drop_index(self.table_id)?;
        self.catalog.set_index_root(self.table_id, None)
    }
}

/// Splits an overflowing node in place, keeping the left half. Returns the
/// separator for the parent and the right half, which will live at
/// `right_page`.
fn split(node: &mut IndexNode, right_page: PageNum) -> (Value, IndexNode) {
    match node.kind {
        NodeKind::Leaf => {
            let half = node.keys.len() / 2;
            let right_keys = node.keys.split_off(half);
            // Record pointers of the right keys plus the old next-leaf link.
            let right_pointers = node.pointers.split_off(half);
            node.pointers.push(IndexPointer::Node(right_page));
            let separator = right_keys[0].clone();
            let right = IndexNode {
                kind: NodeKind::Leaf,
                keys: right_keys,
                pointers: right_pointers,
            };
            (separator, right)
        }
        NodeKind::Internal => {
            let mid = node.keys.len() / 2;
            let mut right_keys = node.keys.split_off(mid);
            let separator = right_keys.remove(0);
            let right_pointers = node.pointers.split_off(mid + 1);
            let right = IndexNode {
                kind: NodeKind::Internal,
                keys: right_keys,
                pointers: right_pointers,
            };
            (separator, right)
        }
    }
}

/// Orders two keys already checked to share the key type.
fn order(a: &Value, b: &Value) -> Ordering {
    a.compare(b).unwrap_or(Ordering::Equal)
}
