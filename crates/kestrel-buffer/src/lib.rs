//! Page caching for Kestrel.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with LRU eviction
//! - Growable pool for bulk loads that never evicts
//! - Pin counting for concurrent access
//! - Dirty page tracking with sorted write-back
//!
//! Both pools implement [`PageCache`], which is all the index layer sees.

mod cache;
mod file;
mod frame;
mod growable;
mod page_table;
mod pool;
mod replacer;

pub use cache::{BufferPoolStats, FetchMode, PageCache, PinnedPage};
pub use file::{MemoryPageFile, PageFile};
pub use frame::{BufferFrame, FrameId};
pub use growable::GrowablePool;
pub use page_table::PageTable;
pub use pool::{BufferPool, BufferPoolConfig};
pub use replacer::{FrameList, LruReplacer, Replacer};
