//! Configuration structures for Kestrel.

use crate::error::{KestrelError, Result};
use crate::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which buffer pool implementation backs a storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoolKind {
    /// Bounded pool with LRU eviction.
    #[default]
    Fixed,
    /// Dense, growable pool that never evicts. Suited to bulk loads whose
    /// working set fits in memory.
    Growable,
}

/// Storage configuration for a single storage file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the storage file.
    pub path: PathBuf,
    /// Page size in bytes. Must match the size the file was created with.
    pub page_size: usize,
    /// Buffer pool size in number of pages (initial size for a growable pool).
    pub buffer_pool_pages: usize,
    /// Buffer pool implementation.
    pub pool_kind: PoolKind,
    /// Issue fsync when flushing.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./kestrel.db"),
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_pages: 4096, // 16 MB with 4 KB pages
            pool_kind: PoolKind::Fixed,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.buffer_pool_pages < 2 {
            return Err(KestrelError::InvalidParameter {
                name: "buffer_pool_pages".to_string(),
                value: self.buffer_pool_pages.to_string(),
            });
        }
        Ok(())
    }
}

/// Per-index configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Reject (or overwrite) equal keys instead of storing duplicates.
    pub unique: bool,
    /// Caps the number of items per page below the page capacity.
    /// Must be at least 3 so that the underflow threshold (max / 3) is non-zero.
    pub max_items: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            unique: true,
            max_items: None,
        }
    }
}

impl IndexConfig {
    /// Configuration for an index that allows duplicate keys.
    pub fn non_unique() -> Self {
        Self {
            unique: false,
            ..Default::default()
        }
    }

    /// Returns a copy with the per-page item cap set.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }
}
