//! On-page B-tree indexes.
//!
//! ## Layers
//!
//! - [`page`]: node layout inside one page plus the split, rebalance and
//!   merge algorithms. Works on byte buffers only.
//! - [`index`]: [`BTreeIndex`], the tree itself. Fetches nodes through the
//!   page cache, propagates splits and underflows, keeps the descriptor page.
//! - [`cursor`]: bounded range cursors in either direction.
//! - [`codec`]: key encodings and comparators.
//! - [`bitmask`]: attribute-mask index built on a `u64` tree.
//!
//! ## Usage
//!
//! ```ignore
//! let storage: Arc<dyn PageStore> = Arc::new(Storage::open(config)?);
//! let index = BTreeIndex::create(storage, U64Codec, IndexConfig::default())?;
//! index.insert(&42, 7)?;
//! assert_eq!(index.find(&42)?, 7);
//! for entry in index.cursor(10..50, Direction::Ascending)? {
//!     let entry = entry?;
//! }
//! ```

pub mod bitmask;
pub mod codec;
pub mod cursor;
pub mod index;
pub mod page;

pub use bitmask::BitmaskIndex;
pub use codec::{
    prefix_successor, BytesCodec, CompoundCodec, FieldType, FieldValue, I64Codec, KeyCodec,
    U64Codec,
};
pub use cursor::{Cursor, Direction, IndexEntry};
pub use index::{BTreeIndex, NodeOutcome, SetOutcome, INDEX_MAGIC};
pub use page::{Node, NodeKind, NodeLayout};
