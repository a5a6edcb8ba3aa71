//! Storage engine for Kestrel.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - Storage files with a header page and a page free list
//! - On-page B-tree indexes with pluggable key codecs
//! - Range cursors that fail fast on concurrent modification
//! - Bitmask and prefix lookups layered on the same tree

pub mod btree;
mod disk;
mod storage;

pub use btree::{
    BTreeIndex, BitmaskIndex, BytesCodec, CompoundCodec, Cursor, Direction, FieldType, FieldValue,
    I64Codec, IndexEntry, KeyCodec, NodeOutcome, SetOutcome, U64Codec,
};
pub use disk::DiskManager;
pub use storage::{PageStore, Storage, FORMAT_VERSION, ROOT_SLOTS, STORAGE_MAGIC};
