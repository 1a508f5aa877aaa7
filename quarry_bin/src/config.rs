//! Database configuration: defaults, environment overrides and JSON files.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const MIN_PAGE_SIZE: usize = 64;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const MIN_BUFFER_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the catalog and the page files.
    pub path: PathBuf,
    /// Page size for a new database. An existing catalog keeps its own.
    pub page_size: usize,
    /// Number of frames in the page buffer.
    pub buffer_capacity: usize,
    /// Maintain a B+ tree over each table's primary key.
    pub index_mode: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quarry.db"),
            page_size: 4096,
            buffer_capacity: 64,
            index_mode: false,
        }
    }
}

impl DatabaseConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_index(mut self, index_mode: bool) -> Self {
        self.index_mode = index_mode;
        self
    }

    /// Defaults overridden by `QUARRY_DB_PATH`, `QUARRY_PAGE_SIZE`,
    /// `QUARRY_BUFFER_SIZE` and `QUARRY_INDEX`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("QUARRY_DB_PATH") {
            config.path = PathBuf::from(path);
        }
        if let Some(page_size) = env_number("QUARRY_PAGE_SIZE")? {
            config.page_size = page_size;
        }
        if let Some(capacity) = env_number("QUARRY_BUFFER_SIZE")? {
            config.buffer_capacity = capacity;
        }
        if let Ok(raw) = std::env::var("QUARRY_INDEX") {
            config.index_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "QUARRY_INDEX",
                        value: raw,
                    })
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: DatabaseConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(ConfigError::BufferCapacity(self.buffer_capacity));
        }
        Ok(())
    }
}

fn env_number(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(None),
    }
}
