//! Fixed-capacity buffer pool manager.

use crate::cache::{BufferPoolStats, FetchMode, PageCache, PinnedPage};
use crate::file::PageFile;
use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{FrameList, LruReplacer, Replacer};
use kestrel_common::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use kestrel_common::{KestrelError, PageId, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Size of every page in bytes.
    pub page_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Bookkeeping guarded by the pool latch.
struct PoolState {
    /// Page offset to frame mapping.
    page_table: PageTable,
    /// Unpinned frames holding a page.
    replacer: LruReplacer,
    /// Frames whose dirty flag is set.
    dirty: FrameList,
    /// Frames holding no page.
    free_list: Vec<FrameId>,
}

impl PoolState {
    fn set_dirty(&mut self, frame: &BufferFrame) {
        if !frame.is_dirty() {
            frame.set_dirty(true);
            self.dirty.push_front(frame.frame_id());
        }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Chained hash table from page offset to frame
/// - Free frame list, then LRU eviction of unpinned frames
/// - Pin counting for concurrent access
/// - Intrusive dirty list written back by `flush` or on eviction
///
/// One latch guards all bookkeeping and is never held across file I/O.
/// Page bytes are read and written under the frame's own latch.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Backing file.
    file: Arc<dyn PageFile>,
    /// Array of buffer frames.
    frames: Vec<Arc<BufferFrame>>,
    /// Page table, replacer, dirty list and free list.
    state: Mutex<PoolState>,
    /// Serializes flushes.
    flush_lock: Mutex<()>,
    /// Set when a flush failed part way.
    poisoned: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    /// Creates a new buffer pool over `file`.
    pub fn new(config: BufferPoolConfig, file: Arc<dyn PageFile>) -> Result<Self> {
        validate_page_size(config.page_size)?;
        if config.num_frames == 0 || config.num_frames >= u32::MAX as usize {
            return Err(KestrelError::InvalidParameter {
                name: "num_frames".to_string(),
                value: config.num_frames.to_string(),
            });
        }
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Arc::new(BufferFrame::new(FrameId(i as u32), config.page_size)))
            .collect();

        // All frames start in the free list, popped from the back in id order.
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        let state = PoolState {
            page_table: PageTable::new(num_frames, config.page_size),
            replacer: LruReplacer::new(num_frames),
            dirty: FrameList::new(num_frames),
            free_list,
        };

        Ok(Self {
            config,
            file,
            frames,
            state: Mutex::new(state),
            flush_lock: Mutex::new(()),
            poisoned: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized(page_size: usize, file: Arc<dyn PageFile>) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / page_size.max(1)).clamp(1_000, u32::MAX as usize - 1);

        Self::new(
            BufferPoolConfig {
                num_frames,
                page_size,
            },
            file,
        )
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.get(page_id).is_some()
    }

    /// Returns true if the page is cached and dirty.
    pub fn is_page_dirty(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        state
            .page_table
            .get(page_id)
            .map(|fid| state.dirty.contains(fid))
            .unwrap_or(false)
    }

    /// Returns true if a failed flush made the pool unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Returns the backing file.
    pub fn file(&self) -> &Arc<dyn PageFile> {
        &self.file
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(KestrelError::PoolPoisoned);
        }
        Ok(())
    }

    /// Obtains a frame for a new page, from the free list or by evicting the
    /// least recently unpinned frame.
    ///
    /// A dirty victim is written back with the latch released. The victim
    /// stays pinned meanwhile, so a concurrent fetch of that page still hits
    /// it; in that case the frame is left alone and another victim is tried.
    fn allocate_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<FrameId> {
        loop {
            if let Some(frame_id) = state.free_list.pop() {
                return Ok(frame_id);
            }

            let Some(victim) = state.replacer.victim() else {
                return Err(KestrelError::InvariantViolation(format!(
                    "buffer pool exhausted: all {} frames are pinned",
                    self.config.num_frames
                )));
            };
            let frame = &self.frames[victim.index()];

            if frame.is_dirty() {
                frame.pin();
                frame.set_dirty(false);
                state.dirty.remove(victim);

                let written = MutexGuard::unlocked(state, || frame.write_back(self.file.as_ref()));

                let remaining = frame.unpin().unwrap_or(0);
                if let Err(e) = written {
                    state.set_dirty(frame);
                    if remaining == 0 {
                        state.replacer.unpinned(victim);
                    }
                    tracing::error!(frame = %victim, page = ?frame.page_id(), error = %e, "failed to write back evicted page");
                    return Err(e);
                }
                if remaining > 0 {
                    continue;
                }
                if frame.is_dirty() {
                    state.replacer.unpinned(victim);
                    continue;
                }
            }

            if let Some(old_page) = frame.page_id() {
                state.page_table.remove(old_page);
                tracing::debug!(frame = %victim, page = %old_page, "evicted page");
            }
            frame.set_page_id(None);
            frame.set_raw(false);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(victim);
        }
    }

    /// Drops the pin taken by a fetch whose load failed.
    ///
    /// A frame that never got its bytes goes back to the free list.
    fn abandon_load(&self, frame: &BufferFrame) {
        let mut state = self.state.lock();
        if frame.unpin() != Some(0) {
            return;
        }
        let frame_id = frame.frame_id();
        if frame.is_raw() {
            if let Some(page_id) = frame.page_id() {
                state.page_table.remove(page_id);
            }
            state.dirty.remove(frame_id);
            frame.set_dirty(false);
            frame.set_raw(false);
            frame.set_page_id(None);
            state.free_list.push(frame_id);
        } else {
            state.replacer.unpinned(frame_id);
        }
    }

    /// Flushes and then drops every unpinned page from the pool.
    ///
    /// Returns the number of pages dropped.
    pub fn clear(&self) -> Result<usize> {
        self.flush()?;
        let mut state = self.state.lock();
        let mut dropped = 0;
        for frame in &self.frames {
            let Some(page_id) = frame.page_id() else {
                continue;
            };
            if frame.is_pinned() || frame.is_dirty() {
                continue;
            }
            let frame_id = frame.frame_id();
            state.page_table.remove(page_id);
            state.replacer.pinned(frame_id);
            frame.set_page_id(None);
            frame.set_raw(false);
            state.free_list.push(frame_id);
            dropped += 1;
        }
        Ok(dropped)
    }
}

impl PageCache for BufferPool {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn fetch(&self, page_id: PageId, mode: FetchMode) -> Result<PinnedPage<'_>> {
        self.check_usable()?;
        page_id.check_aligned(self.config.page_size)?;

        let mut state = self.state.lock();
        let frame = match state.page_table.get(page_id) {
            Some(frame_id) => {
                let frame = &self.frames[frame_id.index()];
                if frame.pin() == 0 {
                    state.replacer.pinned(frame_id);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                frame
            }
            None => {
                let frame_id = self.allocate_frame(&mut state)?;
                let frame = &self.frames[frame_id.index()];
                frame.set_page_id(Some(page_id));
                frame.set_raw(true);
                frame.pin();
                state.page_table.insert(page_id, frame_id);
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(page = %page_id, frame = %frame_id, "page miss");
                frame
            }
        };
        drop(state);

        if let Err(e) = frame.load(self.file.as_ref(), mode) {
            self.abandon_load(frame);
            return Err(e);
        }
        if mode.is_write() {
            self.state.lock().set_dirty(frame);
        }
        Ok(PinnedPage::new(self, Arc::clone(frame), page_id))
    }

    fn release_frame(&self, frame: &BufferFrame) -> Result<()> {
        let mut state = self.state.lock();
        match frame.unpin() {
            None => Err(KestrelError::InvariantViolation(format!(
                "release of unpinned page {:?} in {}",
                frame.page_id(),
                frame.frame_id()
            ))),
            Some(0) => {
                state.replacer.unpinned(frame.frame_id());
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    fn mark_frame_dirty(&self, frame: &BufferFrame) -> Result<()> {
        let mut state = self.state.lock();
        if !frame.is_pinned() {
            return Err(KestrelError::InvariantViolation(format!(
                "mark dirty of unpinned page {:?}",
                frame.page_id()
            )));
        }
        state.set_dirty(frame);
        Ok(())
    }

    fn flush(&self) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        self.check_usable()?;

        // Snapshot the dirty list, pinning each page so it stays put while
        // its bytes are written without the latch.
        let mut batch: Vec<(PageId, Arc<BufferFrame>)> = {
            let mut state = self.state.lock();
            let dirty: Vec<FrameId> = state.dirty.iter().collect();
            let mut batch = Vec::with_capacity(dirty.len());
            for frame_id in dirty {
                let frame = &self.frames[frame_id.index()];
                state.dirty.remove(frame_id);
                frame.set_dirty(false);
                let Some(page_id) = frame.page_id() else {
                    continue;
                };
                if frame.pin() == 0 {
                    state.replacer.pinned(frame_id);
                }
                batch.push((page_id, Arc::clone(frame)));
            }
            batch
        };
        batch.sort_unstable_by_key(|(page_id, _)| *page_id);

        let mut written = 0;
        let mut failure = None;
        for (_, frame) in &batch {
            if let Err(e) = frame.write_back(self.file.as_ref()) {
                failure = Some(e);
                break;
            }
            written += 1;
        }

        {
            let mut state = self.state.lock();
            for (i, (_, frame)) in batch.iter().enumerate() {
                if i >= written {
                    state.set_dirty(frame);
                }
                if frame.unpin() == Some(0) {
                    state.replacer.unpinned(frame.frame_id());
                }
            }
        }

        let result = match failure {
            Some(e) => Err(e),
            None => self.file.sync(),
        };
        if let Err(e) = result {
            self.poisoned.store(true, Ordering::Release);
            tracing::error!(written, pending = batch.len() - written, error = %e, "flush failed, buffer pool poisoned");
            return Err(e);
        }

        tracing::debug!(pages = written, "flushed dirty pages");
        Ok(written)
    }

    fn discard(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(frame_id) = state.page_table.get(page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.index()];
        if frame.is_pinned() {
            // Still in use (for example by a flush); the next fresh fetch
            // overwrites it anyway.
            tracing::trace!(page = %page_id, "discard skipped, page pinned");
            return Ok(false);
        }
        state.page_table.remove(page_id);
        state.replacer.pinned(frame_id);
        state.dirty.remove(frame_id);
        frame.set_dirty(false);
        frame.set_raw(false);
        frame.set_page_id(None);
        state.free_list.push(frame_id);
        Ok(true)
    }

    fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let pinned_frames = self.frames.iter().filter(|f| f.is_pinned()).count();

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            dirty_frames: state.dirty.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
