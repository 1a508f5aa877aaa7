//! The `quarry` inspection tool.
//!
//! Opens a database from the environment, or from the JSON config file
//! given as the only argument, and prints its tables.

use quarry_bin::{Database, DatabaseConfig, StorageResult};

fn main() {
    if let Err(e) = run() {
        eprintln!("quarry: {e}");
        std::process::exit(1);
    }
}

fn run() -> StorageResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => DatabaseConfig::load(path)?,
        None => DatabaseConfig::from_env()?,
    };
    let db = Database::open(&config)?;
    println!(
        "{} (page size {}, index {})",
        db.path().display(),
        db.page_size(),
        if config.index_mode { "on" } else { "off" }
    );
    let catalog = db.context().catalog.lock().clone();
    for (id, name) in catalog.tables() {
        let entry = catalog.entry(id)?;
        let columns: Vec<String> = entry
            .schema
            .columns()
            .iter()
            .map(|c| format!("{} {}", c.name, c.column_type))
            .collect();
        let index_root = entry
            .index_root
            .map_or_else(|| "-".to_string(), |root| root.to_string());
        println!(
            "{id:>4}  {name}  ({})  pages {:?}  index root {index_root}",
            columns.join(", "),
            entry.pages
        );
    }
    db.close()
}
