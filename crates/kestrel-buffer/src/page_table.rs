//! Chained hash table mapping page offsets to buffer frames.

use crate::frame::FrameId;
use kestrel_common::PageId;

/// Sentinel for an empty bucket or the end of a chain.
const NIL: u32 = u32::MAX;

/// Page table of a fixed-capacity buffer pool.
///
/// Has one bucket per frame (bucket = page number mod N). Each frame holds at
/// most one page, so chains are threaded through a per-frame `next` array and
/// no allocation happens after construction. Not synchronized: the pool keeps
/// it behind its latch.
pub struct PageTable {
    /// First frame of each chain.
    buckets: Vec<u32>,
    /// Next frame in the same chain, per frame.
    next: Vec<u32>,
    /// Page held by each chained frame.
    keys: Vec<Option<PageId>>,
    /// Page size used to turn offsets into page numbers.
    page_size: usize,
    /// Number of mapped pages.
    len: usize,
}

impl PageTable {
    /// Creates a table for `num_frames` frames.
    pub fn new(num_frames: usize, page_size: usize) -> Self {
        Self {
            buckets: vec![NIL; num_frames.max(1)],
            next: vec![NIL; num_frames],
            keys: vec![None; num_frames],
            page_size,
            len: 0,
        }
    }

    #[inline]
    fn bucket(&self, page_id: PageId) -> usize {
        (page_id.page_num(self.page_size) % self.buckets.len() as u64) as usize
    }

    /// Looks up the frame holding `page_id`.
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        let mut cur = self.buckets[self.bucket(page_id)];
        while cur != NIL {
            if self.keys[cur as usize] == Some(page_id) {
                return Some(FrameId(cur));
            }
            cur = self.next[cur as usize];
        }
        None
    }

    /// Maps `page_id` to `frame_id`, pushing the frame at the head of its chain.
    ///
    /// The frame must not already be chained.
    pub fn insert(&mut self, page_id: PageId, frame_id: FrameId) {
        debug_assert!(self.keys[frame_id.index()].is_none());
        let b = self.bucket(page_id);
        self.next[frame_id.index()] = self.buckets[b];
        self.keys[frame_id.index()] = Some(page_id);
        self.buckets[b] = frame_id.0;
        self.len += 1;
    }

    /// Removes the mapping for `page_id`, returning the frame that held it.
    pub fn remove(&mut self, page_id: PageId) -> Option<FrameId> {
        let b = self.bucket(page_id);
        let mut prev = NIL;
        let mut cur = self.buckets[b];
        while cur != NIL {
            if self.keys[cur as usize] == Some(page_id) {
                let after = self.next[cur as usize];
                if prev == NIL {
                    self.buckets[b] = after;
                } else {
                    self.next[prev as usize] = after;
                }
                self.next[cur as usize] = NIL;
                self.keys[cur as usize] = None;
                self.len -= 1;
                return Some(FrameId(cur));
            }
            prev = cur;
            cur = self.next[cur as usize];
        }
        None
    }

    /// Returns the number of mapped pages.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no page is mapped.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the length of the chain `page_id` hashes to.
    pub fn chain_len(&self, page_id: PageId) -> usize {
        let mut n = 0;
        let mut cur = self.buckets[self.bucket(page_id)];
        while cur != NIL {
            n += 1;
            cur = self.next[cur as usize];
        }
        n
    }
}
