//! Growable buffer pool for working sets that fit in memory.

use crate::cache::{BufferPoolStats, FetchMode, PageCache, PinnedPage};
use crate::file::PageFile;
use crate::frame::{BufferFrame, FrameId};
use bit_vec::BitVec;
use kestrel_common::page::validate_page_size;
use kestrel_common::{KestrelError, PageId, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Slots allocated on first use.
const MIN_SLOTS: usize = 16;

/// Buffer pool that keeps every page it has ever fetched.
///
/// Frames live in a dense array indexed by page number (the frame id equals
/// the page number) that grows geometrically on out-of-range access. Dirty
/// pages are tracked in a bitmap. Nothing is ever evicted, so this pool is
/// only appropriate for bulk loads whose working set fits in memory.
pub struct GrowablePool {
    page_size: usize,
    file: Arc<dyn PageFile>,
    frames: RwLock<Vec<Option<Arc<BufferFrame>>>>,
    /// One bit per slot, set iff the frame's dirty flag is set.
    dirty: Mutex<BitVec>,
    flush_lock: Mutex<()>,
    poisoned: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GrowablePool {
    /// Creates a pool with room for `initial_pages` pages before growing.
    pub fn new(page_size: usize, initial_pages: usize, file: Arc<dyn PageFile>) -> Result<Self> {
        validate_page_size(page_size)?;
        let slots = initial_pages.max(MIN_SLOTS);
        Ok(Self {
            page_size,
            file,
            frames: RwLock::new(vec![None; slots]),
            dirty: Mutex::new(BitVec::from_elem(slots, false)),
            flush_lock: Mutex::new(()),
            poisoned: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Returns the number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.frames.read().len()
    }

    /// Returns the number of pages held.
    pub fn page_count(&self) -> usize {
        self.frames.read().iter().filter(|s| s.is_some()).count()
    }

    /// Returns true if a failed flush made the pool unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(KestrelError::PoolPoisoned);
        }
        Ok(())
    }

    fn slot_of(&self, page_id: PageId) -> Result<usize> {
        let page_num = page_id.page_num(self.page_size);
        if page_num >= u32::MAX as u64 {
            return Err(KestrelError::InvalidParameter {
                name: "page_id".to_string(),
                value: page_id.to_string(),
            });
        }
        Ok(page_num as usize)
    }

    /// Returns the frame for `slot` pinned, creating it (and growing the
    /// array) on first access. The boolean is true for a hit.
    ///
    /// The pin is taken under the `frames` latch so `discard` never drops a
    /// frame that is being handed out.
    fn pin_frame(&self, slot: usize, page_id: PageId) -> (Arc<BufferFrame>, bool) {
        if let Some(Some(frame)) = self.frames.read().get(slot) {
            frame.pin();
            return (Arc::clone(frame), true);
        }

        let mut frames = self.frames.write();
        if slot >= frames.len() {
            let new_len = (frames.len() * 2).max(slot + 1).max(MIN_SLOTS);
            let old_len = frames.len();
            frames.resize(new_len, None);
            self.dirty.lock().grow(new_len - old_len, false);
            tracing::debug!(from = old_len, to = new_len, "grew page array");
        }
        if let Some(frame) = &frames[slot] {
            frame.pin();
            return (Arc::clone(frame), true);
        }
        let frame = Arc::new(BufferFrame::new(FrameId(slot as u32), self.page_size));
        frame.set_page_id(Some(page_id));
        frame.set_raw(true);
        frame.pin();
        frames[slot] = Some(Arc::clone(&frame));
        (frame, false)
    }

    fn set_dirty(&self, frame: &BufferFrame) {
        let mut dirty = self.dirty.lock();
        if !frame.is_dirty() {
            frame.set_dirty(true);
            dirty.set(frame.frame_id().index(), true);
        }
    }
}

impl PageCache for GrowablePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch(&self, page_id: PageId, mode: FetchMode) -> Result<PinnedPage<'_>> {
        self.check_usable()?;
        page_id.check_aligned(self.page_size)?;
        let slot = self.slot_of(page_id)?;

        let (frame, hit) = self.pin_frame(slot, page_id);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(page = %page_id, "page miss");
        }

        if let Err(e) = frame.load(self.file.as_ref(), mode) {
            frame.unpin();
            return Err(e);
        }
        if mode.is_write() {
            self.set_dirty(&frame);
        }
        Ok(PinnedPage::new(self, frame, page_id))
    }

    fn release_frame(&self, frame: &BufferFrame) -> Result<()> {
        match frame.unpin() {
            Some(_) => Ok(()),
            None => Err(KestrelError::InvariantViolation(format!(
                "release of unpinned page {:?}",
                frame.page_id()
            ))),
        }
    }

    fn mark_frame_dirty(&self, frame: &BufferFrame) -> Result<()> {
        if !frame.is_pinned() {
            return Err(KestrelError::InvariantViolation(format!(
                "mark dirty of unpinned page {:?}",
                frame.page_id()
            )));
        }
        self.set_dirty(frame);
        Ok(())
    }

    fn flush(&self) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        self.check_usable()?;

        // Bit order is page order, so the batch is already sorted by offset.
        let batch: Vec<Arc<BufferFrame>> = {
            let frames = self.frames.read();
            let mut dirty = self.dirty.lock();
            let slots: Vec<usize> = dirty
                .iter()
                .enumerate()
                .filter_map(|(i, bit)| bit.then_some(i))
                .collect();
            let mut batch = Vec::with_capacity(slots.len());
            for slot in slots {
                dirty.set(slot, false);
                if let Some(frame) = &frames[slot] {
                    frame.set_dirty(false);
                    frame.pin();
                    batch.push(Arc::clone(frame));
                }
            }
            batch
        };

        let mut written = 0;
        let mut failure = None;
        for frame in &batch {
            if let Err(e) = frame.write_back(self.file.as_ref()) {
                failure = Some(e);
                break;
            }
            written += 1;
        }
        for (i, frame) in batch.iter().enumerate() {
            if i >= written {
                self.set_dirty(frame);
            }
            frame.unpin();
        }

        let result = match failure {
            Some(e) => Err(e),
            None => self.file.sync(),
        };
        if let Err(e) = result {
            self.poisoned.store(true, Ordering::Release);
            tracing::error!(written, pending = batch.len() - written, error = %e, "flush failed, growable pool poisoned");
            return Err(e);
        }

        tracing::debug!(pages = written, "flushed dirty pages");
        Ok(written)
    }

    fn discard(&self, page_id: PageId) -> Result<bool> {
        let slot = self.slot_of(page_id)?;
        let mut frames = self.frames.write();
        let Some(Some(frame)) = frames.get(slot) else {
            return Ok(false);
        };
        if frame.is_pinned() {
            tracing::trace!(page = %page_id, "discard skipped, page pinned");
            return Ok(false);
        }
        frame.set_dirty(false);
        self.dirty.lock().set(slot, false);
        frames[slot] = None;
        Ok(true)
    }

    fn stats(&self) -> BufferPoolStats {
        let frames = self.frames.read();
        let used_frames = frames.iter().filter(|s| s.is_some()).count();
        let pinned_frames = frames
            .iter()
            .flatten()
            .filter(|f| f.is_pinned())
            .count();
        let dirty_frames = self.dirty.lock().iter().filter(|b| *b).count();

        BufferPoolStats {
            total_frames: frames.len(),
            free_frames: frames.len() - used_frames,
            used_frames,
            pinned_frames,
            dirty_frames,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,
        }
    }
}

impl std::fmt::Debug for GrowablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowablePool")
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
