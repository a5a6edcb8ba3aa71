//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;

const NIL: u32 = u32::MAX;

/// Intrusive doubly-linked list over frame ids.
///
/// Links live in per-frame arrays, so membership tests, unlinking and
/// relinking are O(1) and never allocate. Used for the LRU list and the
/// dirty list of the fixed pool.
#[derive(Debug, Clone)]
pub struct FrameList {
    prev: Vec<u32>,
    next: Vec<u32>,
    linked: Vec<bool>,
    head: u32,
    tail: u32,
    len: usize,
}

impl FrameList {
    /// Creates an empty list able to hold `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            prev: vec![NIL; num_frames],
            next: vec![NIL; num_frames],
            linked: vec![false; num_frames],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Returns true if the frame is in the list.
    #[inline]
    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.linked
            .get(frame_id.index())
            .copied()
            .unwrap_or(false)
    }

    /// Links the frame at the front. Returns false if it was already linked.
    pub fn push_front(&mut self, frame_id: FrameId) -> bool {
        let idx = frame_id.index();
        if idx >= self.linked.len() || self.linked[idx] {
            return false;
        }
        self.prev[idx] = NIL;
        self.next[idx] = self.head;
        if self.head != NIL {
            self.prev[self.head as usize] = frame_id.0;
        } else {
            self.tail = frame_id.0;
        }
        self.head = frame_id.0;
        self.linked[idx] = true;
        self.len += 1;
        true
    }

    /// Unlinks the frame. Returns false if it was not linked.
    pub fn remove(&mut self, frame_id: FrameId) -> bool {
        let idx = frame_id.index();
        if !self.contains(frame_id) {
            return false;
        }
        let (p, n) = (self.prev[idx], self.next[idx]);
        if p != NIL {
            self.next[p as usize] = n;
        } else {
            self.head = n;
        }
        if n != NIL {
            self.prev[n as usize] = p;
        } else {
            self.tail = p;
        }
        self.prev[idx] = NIL;
        self.next[idx] = NIL;
        self.linked[idx] = false;
        self.len -= 1;
        true
    }

    /// Unlinks and returns the frame at the back.
    pub fn pop_back(&mut self) -> Option<FrameId> {
        if self.tail == NIL {
            return None;
        }
        let frame_id = FrameId(self.tail);
        self.remove(frame_id);
        Some(frame_id)
    }

    /// Iterates from front to back.
    pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let frame_id = FrameId(cur);
            cur = self.next[cur as usize];
            Some(frame_id)
        })
    }

    /// Returns the number of linked frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no frame is linked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Trait for page replacement algorithms.
///
/// Calls are made with the pool latch held, hence `&mut self`.
pub trait Replacer: Send {
    /// Records that the frame's pin count dropped to 0.
    fn unpinned(&mut self, frame_id: FrameId);

    /// Records that the frame was pinned from pin count 0, or is being
    /// repurposed. Frames not tracked are ignored.
    fn pinned(&mut self, frame_id: FrameId);

    /// Selects and untracks a victim frame for eviction.
    ///
    /// Returns None if no frames are evictable.
    fn victim(&mut self) -> Option<FrameId>;

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Least-recently-unpinned replacement.
///
/// Frames are linked at the front when their last pin is released and
/// victims are taken from the back.
pub struct LruReplacer {
    list: FrameList,
}

impl LruReplacer {
    /// Creates a new LRU replacer for the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            list: FrameList::new(num_frames),
        }
    }

    /// Returns true if the frame is currently evictable.
    pub fn is_evictable(&self, frame_id: FrameId) -> bool {
        self.list.contains(frame_id)
    }
}

impl Replacer for LruReplacer {
    fn unpinned(&mut self, frame_id: FrameId) {
        self.list.push_front(frame_id);
    }

    fn pinned(&mut self, frame_id: FrameId) {
        self.list.remove(frame_id);
    }

    fn victim(&mut self) -> Option<FrameId> {
        self.list.pop_back()
    }

    fn size(&self) -> usize {
        self.list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_list_push_pop_order() {
        let mut list = FrameList::new(4);
        assert!(list.is_empty());

        assert!(list.push_front(FrameId(0)));
        assert!(list.push_front(FrameId(1)));
        assert!(list.push_front(FrameId(2)));
        assert!(!list.push_front(FrameId(1)));
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![FrameId(2), FrameId(1), FrameId(0)]);

        assert_eq!(list.pop_back(), Some(FrameId(0)));
        assert_eq!(list.pop_back(), Some(FrameId(1)));
        assert_eq!(list.pop_back(), Some(FrameId(2)));
        assert_eq!(list.pop_back(), None);
    }

    #[test]
    fn test_frame_list_remove() {
        let mut list = FrameList::new(4);
        for i in 0..4 {
            list.push_front(FrameId(i));
        }

        assert!(list.remove(FrameId(2)));
        assert!(!list.remove(FrameId(2)));
        assert!(!list.contains(FrameId(2)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![FrameId(3), FrameId(1), FrameId(0)]);

        assert!(list.remove(FrameId(3)));
        assert!(list.remove(FrameId(0)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![FrameId(1)]);
        assert_eq!(list.pop_back(), Some(FrameId(1)));
        assert!(list.is_empty());
    }

    #[test]
    fn test_frame_list_out_of_range() {
        let mut list = FrameList::new(2);
        assert!(!list.push_front(FrameId(5)));
        assert!(!list.contains(FrameId(5)));
        assert!(!list.remove(FrameId(5)));
    }

    #[test]
    fn test_lru_replacer_evict_empty() {
        let mut replacer = LruReplacer::new(10);
        assert!(replacer.victim().is_none());
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_replacer_evicts_least_recent() {
        let mut replacer = LruReplacer::new(10);

        replacer.unpinned(FrameId(0));
        replacer.unpinned(FrameId(1));
        replacer.unpinned(FrameId(2));
        assert_eq!(replacer.size(), 3);

        // Frame 0 is used again, so frame 1 becomes the oldest.
        replacer.pinned(FrameId(0));
        replacer.unpinned(FrameId(0));

        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert_eq!(replacer.victim(), Some(FrameId(0)));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_lru_replacer_pinned_frames_not_evicted() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpinned(FrameId(0));
        replacer.unpinned(FrameId(1));

        replacer.pinned(FrameId(0));
        assert!(!replacer.is_evictable(FrameId(0)));
        assert!(replacer.is_evictable(FrameId(1)));

        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_lru_replacer_pinned_untracked_is_noop() {
        let mut replacer = LruReplacer::new(4);
        replacer.pinned(FrameId(3));
        assert_eq!(replacer.size(), 0);
    }
}
