//! Buffer frame management.

use crate::cache::FetchMode;
use crate::file::PageFile;
use kestrel_common::{PageId, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Sentinel value indicating no page is loaded in the frame.
const NO_PAGE: u64 = u64::MAX;

/// Unique identifier for a frame in a buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in a buffer pool holding a single page.
///
/// Pin count, dirty and raw flags are only changed while the owning pool's
/// latch is held; they are atomics so that pinned holders can inspect them
/// without taking that latch. The page bytes sit behind a per-frame latch
/// under which loads and write-backs run.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// Offset of the page currently stored in this frame (NO_PAGE = none).
    page_id: AtomicU64,
    /// Page data buffer.
    data: RwLock<Box<[u8]>>,
    /// Number of holders currently pinning this page.
    pin_count: AtomicU32,
    /// Whether the page differs from its on-disk copy.
    is_dirty: AtomicBool,
    /// Whether the frame was assigned a page whose bytes are not loaded yet.
    is_raw: AtomicBool,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(NO_PAGE),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            is_raw: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.page_id.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageId::from_offset(packed))
        }
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub(crate) fn set_page_id(&self, page_id: Option<PageId>) {
        let packed = page_id.map(|p| p.offset()).unwrap_or(NO_PAGE);
        self.page_id.store(packed, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count and returns the new pin count.
    ///
    /// Returns None, leaving the count untouched, if the frame was not pinned.
    #[inline]
    pub(crate) fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns true if the frame's bytes have not been loaded yet.
    #[inline]
    pub fn is_raw(&self) -> bool {
        self.is_raw.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_raw(&self, raw: bool) {
        self.is_raw.store(raw, Ordering::Release);
    }

    /// Reads the page data.
    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Writes to the page data.
    #[inline]
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Brings the frame's bytes in line with `mode`.
    ///
    /// A raw frame is read from `file` (short reads are zero-filled); a
    /// `Fresh` fetch zero-fills without reading. Runs under the frame latch
    /// so concurrent fetchers of the same page wait for a single load.
    pub(crate) fn load(&self, file: &dyn PageFile, mode: FetchMode) -> Result<()> {
        if mode != FetchMode::Fresh && !self.is_raw() {
            return Ok(());
        }
        let mut data = self.data.write();
        if mode == FetchMode::Fresh {
            data.fill(0);
            self.set_raw(false);
            return Ok(());
        }
        if !self.is_raw() {
            return Ok(());
        }
        let offset = self
            .page_id()
            .map(|p| p.offset())
            .unwrap_or_default();
        let n = file.read_at(offset, &mut data)?;
        data[n..].fill(0);
        self.set_raw(false);
        Ok(())
    }

    /// Writes the frame's bytes back to `file`.
    pub(crate) fn write_back(&self, file: &dyn PageFile) -> Result<()> {
        let offset = self
            .page_id()
            .map(|p| p.offset())
            .unwrap_or_default();
        let data = self.data.read();
        file.write_at(offset, &data)
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .field("is_raw", &self.is_raw())
            .finish()
    }
}
