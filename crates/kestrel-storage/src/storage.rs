//! Storage file: page cache, header page and page allocator.
//!
//! Page 0 of every storage file is the header:
//! ```text
//! 0   magic            8 bytes  "KESTREL\0"
//! 8   page_size        u32
//! 12  format_version   u32
//! 16  file_end         u64      offset one past the last allocated page
//! 24  free_head        u64      first page of the free list (0 = empty)
//! 32  free_count       u64
//! 40  root slots       16 x u64 application-defined page ids
//! ```
//! All integers are little-endian. Freed pages form a singly linked list
//! through their first 8 bytes.

use crate::disk::DiskManager;
use kestrel_buffer::{
    BufferPool, BufferPoolConfig, BufferPoolStats, FetchMode, GrowablePool, PageCache, PageFile,
};
use kestrel_common::{KestrelError, PageId, PoolKind, Result, StorageConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Magic bytes at the start of a storage file.
pub const STORAGE_MAGIC: [u8; 8] = *b"KESTREL\0";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Number of root slots in the header.
pub const ROOT_SLOTS: usize = 16;

const HEADER_LEN: usize = 40 + ROOT_SLOTS * 8;

/// Page allocation on top of a page cache.
///
/// This is the seam between the index layer and the storage file: indexes
/// fetch pages through [`cache`](PageStore::cache) and never touch the file.
pub trait PageStore: Send + Sync {
    /// Returns the page cache.
    fn cache(&self) -> &dyn PageCache;

    /// Allocates a page. Its content is undefined; fetch it with
    /// [`FetchMode::Fresh`] to start from zeros.
    fn allocate_page(&self) -> Result<PageId>;

    /// Returns a page to the free list.
    fn free_page(&self, page_id: PageId) -> Result<()>;
}

/// In-memory copy of the header page.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StorageHeader {
    page_size: u32,
    file_end: u64,
    free_head: u64,
    free_count: u64,
    roots: [u64; ROOT_SLOTS],
}

impl StorageHeader {
    fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            file_end: page_size as u64,
            free_head: 0,
            free_count: 0,
            roots: [0; ROOT_SLOTS],
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&STORAGE_MAGIC);
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[16..24].copy_from_slice(&self.file_end.to_le_bytes());
        buf[24..32].copy_from_slice(&self.free_head.to_le_bytes());
        buf[32..40].copy_from_slice(&self.free_count.to_le_bytes());
        for (i, root) in self.roots.iter().enumerate() {
            let off = 40 + i * 8;
            buf[off..off + 8].copy_from_slice(&root.to_le_bytes());
        }
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        let corrupted = |reason: String| KestrelError::PageCorrupted { page_id: 0, reason };
        if buf[0..8] != STORAGE_MAGIC {
            return Err(corrupted("bad storage magic".to_string()));
        }
        let version = read_u32(buf, 12);
        if version != FORMAT_VERSION {
            return Err(corrupted(format!("unsupported format version {}", version)));
        }
        let mut roots = [0u64; ROOT_SLOTS];
        for (i, root) in roots.iter_mut().enumerate() {
            *root = read_u64(buf, 40 + i * 8);
        }
        Ok(Self {
            page_size: read_u32(buf, 8),
            file_end: read_u64(buf, 16),
            free_head: read_u64(buf, 24),
            free_count: read_u64(buf, 32),
            roots,
        })
    }
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// An open storage file.
///
/// Owns the page cache for the file. Pages are allocated by extending the
/// file or by reusing freed pages. Dropping the storage flushes it.
pub struct Storage {
    config: StorageConfig,
    cache: Arc<dyn PageCache>,
    header: Mutex<StorageHeader>,
    closed: AtomicBool,
}

impl Storage {
    /// Opens or creates the storage file at `config.path`.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let file = DiskManager::open(&config.path, config.fsync_enabled)?;
        Self::open_with_file(config, Arc::new(file))
    }

    /// Opens storage over an arbitrary page file, such as an in-memory one.
    ///
    /// `config.path` is ignored.
    pub fn open_with_file(config: StorageConfig, file: Arc<dyn PageFile>) -> Result<Self> {
        config.validate()?;
        let page_size = config.page_size;

        let existing = if file.is_empty()? {
            None
        } else {
            let mut buf = [0u8; HEADER_LEN];
            let n = file.read_at(0, &mut buf)?;
            if n < HEADER_LEN {
                return Err(KestrelError::PageCorrupted {
                    page_id: 0,
                    reason: format!("header truncated to {} bytes", n),
                });
            }
            let header = StorageHeader::read_from(&buf)?;
            if header.page_size as usize != page_size {
                return Err(KestrelError::PageSizeMismatch {
                    expected: page_size,
                    actual: header.page_size as usize,
                });
            }
            Some(header)
        };

        let cache: Arc<dyn PageCache> = match config.pool_kind {
            PoolKind::Fixed => Arc::new(BufferPool::new(
                BufferPoolConfig {
                    num_frames: config.buffer_pool_pages,
                    page_size,
                },
                file,
            )?),
            PoolKind::Growable => Arc::new(GrowablePool::new(
                page_size,
                config.buffer_pool_pages,
                file,
            )?),
        };

        let created = existing.is_none();
        let header = existing.unwrap_or_else(|| StorageHeader::new(page_size));
        let storage = Self {
            config,
            cache,
            header: Mutex::new(header),
            closed: AtomicBool::new(false),
        };
        if created {
            let header = storage.header.lock();
            storage.write_header(&header, FetchMode::Fresh)?;
        }

        tracing::debug!(
            path = %storage.config.path.display(),
            page_size,
            created,
            "storage opened"
        );
        Ok(storage)
    }

    fn write_header(&self, header: &StorageHeader, mode: FetchMode) -> Result<()> {
        let page = self.cache.fetch(PageId::NULL, mode)?;
        header.write_to(&mut page.data_mut()?);
        page.release()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns a shared handle to the page cache.
    pub fn cache_handle(&self) -> Arc<dyn PageCache> {
        Arc::clone(&self.cache)
    }

    /// Returns the number of pages on the free list.
    pub fn free_count(&self) -> u64 {
        self.header.lock().free_count
    }

    /// Returns the offset one past the last allocated page.
    pub fn file_end(&self) -> u64 {
        self.header.lock().file_end
    }

    /// Returns the page id stored in root slot `slot`.
    pub fn root(&self, slot: usize) -> Result<PageId> {
        Self::check_slot(slot)?;
        Ok(PageId::from_offset(self.header.lock().roots[slot]))
    }

    /// Stores `page_id` in root slot `slot`.
    pub fn set_root(&self, slot: usize, page_id: PageId) -> Result<()> {
        Self::check_slot(slot)?;
        let mut header = self.header.lock();
        let previous = header.roots[slot];
        header.roots[slot] = page_id.offset();
        if let Err(e) = self.write_header(&header, FetchMode::Write) {
            header.roots[slot] = previous;
            return Err(e);
        }
        Ok(())
    }

    fn check_slot(slot: usize) -> Result<()> {
        if slot >= ROOT_SLOTS {
            return Err(KestrelError::InvalidParameter {
                name: "root slot".to_string(),
                value: slot.to_string(),
            });
        }
        Ok(())
    }

    /// Writes all dirty pages back and syncs the file.
    pub fn flush(&self) -> Result<usize> {
        self.cache.flush()
    }

    /// Returns page cache statistics.
    pub fn stats(&self) -> BufferPoolStats {
        self.cache.stats()
    }

    /// Flushes and closes the storage.
    pub fn close(self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.cache.flush()?;
        tracing::debug!(path = %self.config.path.display(), "storage closed");
        Ok(())
    }
}

impl PageStore for Storage {
    fn cache(&self) -> &dyn PageCache {
        self.cache.as_ref()
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut header = self.header.lock();
        let previous = header.clone();

        let page_id = if header.free_head != 0 {
            let page_id = PageId::from_offset(header.free_head);
            let page = self.cache.fetch_for_read(page_id)?;
            let next = read_u64(&page.data(), 0);
            page.release()?;
            header.free_head = next;
            header.free_count = header.free_count.saturating_sub(1);
            page_id
        } else {
            let page_id = PageId::from_offset(header.file_end);
            header.file_end += self.config.page_size as u64;
            page_id
        };

        if let Err(e) = self.write_header(&header, FetchMode::Write) {
            *header = previous;
            return Err(e);
        }
        tracing::trace!(page = %page_id, "page allocated");
        Ok(page_id)
    }

    fn free_page(&self, page_id: PageId) -> Result<()> {
        page_id.check_aligned(self.config.page_size)?;
        let mut header = self.header.lock();
        if page_id.is_null() || page_id.offset() >= header.file_end {
            return Err(KestrelError::InvalidParameter {
                name: "page_id".to_string(),
                value: page_id.to_string(),
            });
        }

        let page = self.cache.fetch(page_id, FetchMode::Fresh)?;
        page.data_mut()?[0..8].copy_from_slice(&header.free_head.to_le_bytes());
        page.release()?;

        let previous = header.clone();
        header.free_head = page_id.offset();
        header.free_count += 1;
        if let Err(e) = self.write_header(&header, FetchMode::Write) {
            *header = previous;
            return Err(e);
        }
        tracing::trace!(page = %page_id, "page freed");
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.cache.flush() {
            tracing::warn!(path = %self.config.path.display(), error = %e, "flush on drop failed");
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("config", &self.config)
            .field("header", &*self.header.lock())
            .finish()
    }
}
