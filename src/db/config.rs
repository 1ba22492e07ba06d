use std::path::PathBuf;

use crate::codec::ErrorHandling;

/// How a 128-bit node id is split across key columns. Chosen at
/// construction and immutable for the lifetime of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageModel {
    /// One 16-byte key column.
    BinaryKeys,
    /// Two 64-bit key columns (high, low).
    SplitLong,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Opaque driver identifier, logged at init.
    pub driver: String,
    /// Database location; `:memory:` is accepted.
    pub url: String,
    pub user: String,
    pub password: String,
    /// Workspace home: string-index files and the filesystem blob root
    /// live here.
    pub home: PathBuf,
    /// Selects the embedded DDL resource `<schema>.ddl`.
    pub schema: String,
    /// Prepended to every table name; uppercased and sanitized at init.
    pub schema_object_prefix: String,
    pub storage_model: StorageModel,
    /// Binary values at or above this size are externalized to the blob
    /// store.
    pub min_blob_size: usize,
    /// `true` selects the filesystem blob store, `false` the database one.
    pub external_blobs: bool,
    pub consistency_check: bool,
    pub consistency_fix: bool,
    pub error_handling: ErrorHandling,
    /// Consumed by the bundle cache layered above this engine.
    pub bundle_cache_size: usize,
}

impl Config {
    pub fn new(home: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            driver: "sqlite3".into(),
            url: url.into(),
            user: String::new(),
            password: String::new(),
            home: home.into(),
            schema: "sqlite".into(),
            schema_object_prefix: String::new(),
            storage_model: StorageModel::BinaryKeys,
            min_blob_size: 0x1000,
            external_blobs: false,
            consistency_check: false,
            consistency_fix: false,
            error_handling: ErrorHandling::default(),
            bundle_cache_size: 8,
        }
    }

    pub fn split_long(mut self) -> Self {
        self.storage_model = StorageModel::SplitLong;
        self.schema = "sqlite-split".into();
        self
    }
}
