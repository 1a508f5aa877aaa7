#![allow(dead_code)]

use quarry::{Column, PageKey, Record, Schema, Value};
use quarry_bin::{Database, DatabaseConfig, Table};
use tempfile::{tempdir, TempDir};

/// A database in a temporary directory that lives as long as the value.
pub struct TestDb {
    pub db: Database,
    pub dir: TempDir,
}

pub fn open_db(page_size: usize, index_mode: bool) -> TestDb {
    let dir = tempdir().unwrap();
    let config = DatabaseConfig::new(dir.path().join("db"))
        .with_page_size(page_size)
        .with_buffer_capacity(4)
        .with_index(index_mode);
    let db = Database::open(&config).unwrap();
    TestDb { db, dir }
}

/// `id INT` primary key plus `tag CHAR_FIXED(8)`: 16 encoded bytes.
pub fn tagged_schema() -> Schema {
    Schema::new(vec![Column::int("id"), Column::char_fixed("tag", 8)], 0).unwrap()
}

pub fn tagged(id: i32) -> Record {
    Record::new(vec![Value::Int(id), Value::from(format!("t{id}"))])
}

pub fn ids(records: &[Record]) -> Vec<i32> {
    records.iter().filter_map(|r| r.values[0].as_int()).collect()
}

/// Integer keys of every data page, in page-list order.
pub fn page_keys(db: &Database, table: &Table) -> Vec<Vec<i32>> {
    let codec = table.codec().unwrap();
    table
        .pages()
        .unwrap()
        .into_iter()
        .map(|page_num| {
            let guard = db
                .context()
                .buffer
                .fetch(PageKey::data(table.id(), page_num))
                .unwrap();
            let records = guard.read().read(&codec, None).unwrap();
            ids(&records)
        })
        .collect()
}

pub fn assert_sorted(keys: &[i32]) {
    assert!(
        keys.windows(2).all(|w| w[0] < w[1]),
        "keys out of order: {keys:?}"
    );
}

/// Checks that every index entry names the slot that holds its key.
pub fn assert_index_agrees(db: &Database, table: &Table) {
    let index = table.index().unwrap().expect("index mode is on");
    let pages = table.pages().unwrap();
    let contents = page_keys(db, table);
    let entries = index.entries().unwrap();
    assert_eq!(entries.len(), contents.iter().map(Vec::len).sum::<usize>());
    for (key, loc) in entries {
        let pos = pages
            .iter()
            .position(|&p| p == loc.page)
            .expect("index points outside the table");
        assert_eq!(Value::Int(contents[pos][loc.slot]), key);
    }
}
