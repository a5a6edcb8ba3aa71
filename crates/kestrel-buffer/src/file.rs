//! Backing file abstraction for the buffer pools.

use kestrel_common::{KestrelError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Positional I/O over the file that backs a buffer pool.
///
/// Implementations must be safe to call from several threads; the pools
/// never hold their own latch while calling into the file.
pub trait PageFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read, which is short (possibly 0) when the
    /// read runs past the end of the file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Makes previous writes durable.
    fn sync(&self) -> Result<()>;

    /// Returns the current file length in bytes.
    fn len(&self) -> Result<u64>;

    /// Returns true if the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory page file.
///
/// Used for tests and throwaway indexes. Write failures can be injected to
/// exercise the pool's error paths.
#[derive(Debug, Default)]
pub struct MemoryPageFile {
    data: Mutex<Vec<u8>>,
    syncs: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryPageFile {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed `sync` calls.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }

    /// Number of completed `write_at` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Makes every following write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Returns a copy of the bytes at `offset..offset + len`, zero-padded past EOF.
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let end = (offset as usize + len).min(data.len());
        out[..end - start].copy_from_slice(&data[start..end]);
        out
    }
}

impl PageFile for MemoryPageFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(KestrelError::IoError(format!(
                "injected write failure at offset {}",
                offset
            )));
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
