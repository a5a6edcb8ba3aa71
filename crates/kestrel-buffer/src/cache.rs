//! The page cache interface shared by the fixed and growable pools.

use crate::frame::{BufferFrame, FrameId};
use kestrel_common::{PageId, Result};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// How a page is going to be used by the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Load the page; leave it clean.
    Read,
    /// Load the page and mark it dirty.
    Write,
    /// Mark the page dirty and zero-fill it without reading the file.
    /// For freshly allocated pages whose old content is meaningless.
    Fresh,
}

impl FetchMode {
    /// Returns true if the fetch marks the page dirty.
    #[inline]
    pub fn is_write(&self) -> bool {
        !matches!(self, FetchMode::Read)
    }
}

/// Statistics about a page cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
    /// Fetches served from memory.
    pub hits: u64,
    /// Fetches that had to assign a frame.
    pub misses: u64,
    /// Pages evicted to make room.
    pub evictions: u64,
}

/// A cache of fixed-size pages over a backing file.
///
/// Every page handed out is pinned and must be released exactly once;
/// [`PinnedPage`] does this on drop.
pub trait PageCache: Send + Sync {
    /// Returns the size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Fetches and pins the page at `page_id`.
    fn fetch(&self, page_id: PageId, mode: FetchMode) -> Result<PinnedPage<'_>>;

    /// Fetches a page for reading.
    fn fetch_for_read(&self, page_id: PageId) -> Result<PinnedPage<'_>> {
        self.fetch(page_id, FetchMode::Read)
    }

    /// Fetches a page for writing.
    fn fetch_for_write(&self, page_id: PageId) -> Result<PinnedPage<'_>> {
        self.fetch(page_id, FetchMode::Write)
    }

    /// Releases a page, reporting any protocol violation.
    fn release(&self, page: PinnedPage<'_>) -> Result<()> {
        page.release()
    }

    /// Marks a page fetched for reading as dirty.
    fn mark_dirty(&self, page: &PinnedPage<'_>) -> Result<()> {
        page.mark_dirty()
    }

    /// Drops one pin on the frame. Called by [`PinnedPage`].
    fn release_frame(&self, frame: &BufferFrame) -> Result<()>;

    /// Marks a pinned frame dirty. Called by [`PinnedPage`].
    fn mark_frame_dirty(&self, frame: &BufferFrame) -> Result<()>;

    /// Writes every dirty page back and syncs the file.
    ///
    /// Returns the number of pages written.
    fn flush(&self) -> Result<usize>;

    /// Drops a page from the cache without writing it back.
    ///
    /// Used when a page is freed. Returns false if the page was not cached.
    fn discard(&self, page_id: PageId) -> Result<bool>;

    /// Returns statistics about the cache.
    fn stats(&self) -> BufferPoolStats;
}

/// A pinned page.
///
/// Holds one pin on its frame, so the frame keeps this page for the lifetime
/// of the handle. Dropping the handle releases the pin.
pub struct PinnedPage<'a> {
    cache: &'a dyn PageCache,
    pub(crate) frame: Arc<BufferFrame>,
    page_id: PageId,
    released: bool,
}

impl<'a> PinnedPage<'a> {
    /// Wraps a frame the cache has just pinned for `page_id`.
    pub fn new(cache: &'a dyn PageCache, frame: Arc<BufferFrame>, page_id: PageId) -> Self {
        Self {
            cache,
            frame,
            page_id,
            released: false,
        }
    }

    /// Returns the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the frame holding the page.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame.frame_id()
    }

    /// Returns the frame's current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    /// Returns true if the page is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Returns the page data.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.read_data()
    }

    /// Marks the page dirty and returns mutable access to its data.
    ///
    /// The mark is made while holding the frame latch. A flush clears dirty
    /// flags before taking that latch to write the bytes, so it either writes
    /// the bytes after this guard is dropped or leaves the page dirty again.
    pub fn data_mut(&self) -> Result<RwLockWriteGuard<'_, Box<[u8]>>> {
        let data = self.frame.write_data();
        self.mark_dirty()?;
        Ok(data)
    }

    /// Marks the page as dirty.
    pub fn mark_dirty(&self) -> Result<()> {
        if self.frame.is_dirty() {
            return Ok(());
        }
        self.cache.mark_frame_dirty(&self.frame)
    }

    /// Releases the pin now, reporting a protocol violation if there is one.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.cache.release_frame(&self.frame)
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.cache.release_frame(&self.frame) {
            tracing::error!(page = %self.page_id, error = %e, "failed to release page");
        }
    }
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page_id", &self.page_id)
            .field("frame", &self.frame)
            .finish()
    }
}
