//! Bitmask index.
//!
//! Maps a 64-bit attribute mask to entry ids. Selection finds every entry
//! whose mask has all `required` bits set and none of the `excluded` bits.
//! Any such mask is numerically at least `required`, so the scan runs from
//! the largest mask down to `required` and filters the rest.

use super::codec::U64Codec;
use super::cursor::{Cursor, Direction};
use super::index::BTreeIndex;
use crate::storage::PageStore;
use kestrel_common::{IndexConfig, KestrelError, PageId, Result};
use std::sync::Arc;

/// A non-unique index over 64-bit masks.
#[derive(Debug)]
pub struct BitmaskIndex {
    index: BTreeIndex<U64Codec>,
}

impl BitmaskIndex {
    /// Creates an empty bitmask index.
    pub fn create(store: Arc<dyn PageStore>, max_items: Option<usize>) -> Result<Self> {
        let config = IndexConfig {
            unique: false,
            max_items,
        };
        Ok(Self {
            index: BTreeIndex::create(store, U64Codec, config)?,
        })
    }

    /// Opens a bitmask index from its descriptor page.
    pub fn open(store: Arc<dyn PageStore>, meta_page: PageId) -> Result<Self> {
        let index = BTreeIndex::open(store, U64Codec, meta_page)?;
        if index.is_unique() {
            return Err(KestrelError::InvalidParameter {
                name: "meta_page".to_string(),
                value: format!("{} (unique index)", meta_page),
            });
        }
        Ok(Self { index })
    }

    /// Returns the underlying B-tree.
    pub fn index(&self) -> &BTreeIndex<U64Codec> {
        &self.index
    }

    /// Adds `entry_id` under `mask`.
    pub fn insert(&self, mask: u64, entry_id: u64) -> Result<()> {
        self.index.insert(&mask, entry_id)
    }

    /// Removes `entry_id` from under `mask`.
    pub fn remove(&self, mask: u64, entry_id: u64) -> Result<()> {
        self.index.remove(&mask, Some(entry_id)).map(|_| ())
    }

    /// Returns a cursor over entries whose mask contains every bit of
    /// `required` and no bit of `excluded`, largest mask first.
    pub fn select(&self, required: u64, excluded: u64) -> Result<Cursor<'_, U64Codec>> {
        let cursor = self.index.cursor(required.., Direction::Descending)?;
        Ok(cursor.with_filter(move |mask: &u64, _| {
            mask & required == required && mask & excluded == 0
        }))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
