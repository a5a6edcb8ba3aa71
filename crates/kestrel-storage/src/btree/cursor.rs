//! Range cursors over a B-tree index.
//!
//! A cursor keeps a stack of `(page, slot)` positions from the root to the
//! current leaf. It holds no pins between steps: every step takes the tree
//! latch in shared mode, checks the modification stamp and re-fetches the
//! pages it needs. Once the index has been modified the cursor yields a single
//! [`KestrelError::ConcurrentModification`] and then ends.

use super::codec::KeyCodec;
use super::index::{BTreeIndex, TreeMeta};
use super::page::{Node, NodeKind};
use kestrel_common::{KestrelError, PageId, Result};
use std::cmp::Ordering;
use std::ops::Bound;

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// One index entry yielded by a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry<K> {
    pub key: K,
    pub entry_id: u64,
}

/// Position machine shared by cursors and the index's own lookups.
///
/// Bounds are encoded keys and apply to the key part of a slot only, so a
/// bound equal to a duplicated key covers all of its entries.
pub(crate) struct Scan<'a, C: KeyCodec> {
    index: &'a BTreeIndex<C>,
    direction: Direction,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    stack: Vec<(PageId, usize)>,
    started: bool,
    done: bool,
}

impl<'a, C: KeyCodec> Scan<'a, C> {
    pub(crate) fn new(
        index: &'a BTreeIndex<C>,
        direction: Direction,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> Self {
        Self {
            index,
            direction,
            lower,
            upper,
            stack: Vec::new(),
            started: false,
            done: false,
        }
    }

    fn cmp(&self, slot_key: &[u8], bound: &[u8]) -> Ordering {
        self.index.codec.compare(slot_key, bound)
    }

    /// True for slots that sort before the starting position.
    fn is_before(&self, slot: &[u8]) -> bool {
        let key = self.index.layout.slot_key(slot);
        match self.direction {
            Direction::Ascending => match &self.lower {
                Bound::Included(b) => self.cmp(key, b) == Ordering::Less,
                Bound::Excluded(b) => self.cmp(key, b) != Ordering::Greater,
                Bound::Unbounded => false,
            },
            Direction::Descending => match &self.upper {
                Bound::Included(b) => self.cmp(key, b) != Ordering::Greater,
                Bound::Excluded(b) => self.cmp(key, b) == Ordering::Less,
                Bound::Unbounded => true,
            },
        }
    }

    /// True once a key lies past the far end of the range.
    fn is_past_end(&self, key: &[u8]) -> bool {
        match self.direction {
            Direction::Ascending => match &self.upper {
                Bound::Included(b) => self.cmp(key, b) == Ordering::Greater,
                Bound::Excluded(b) => self.cmp(key, b) != Ordering::Less,
                Bound::Unbounded => false,
            },
            Direction::Descending => match &self.lower {
                Bound::Included(b) => self.cmp(key, b) == Ordering::Less,
                Bound::Excluded(b) => self.cmp(key, b) != Ordering::Greater,
                Bound::Unbounded => false,
            },
        }
    }

    /// Descends from the root to the starting leaf position.
    fn seek(&mut self, tree: &TreeMeta) -> Result<()> {
        let mut page_id = tree.root;
        loop {
            let page = self.index.cache().fetch_for_read(page_id)?;
            let data = page.data();
            let node = Node::new(&data[..], self.index.layout);
            let kind = node.checked_kind(page_id)?;
            let pos = node.partition_point(|s| self.is_before(s));
            match kind {
                NodeKind::Leaf => {
                    self.stack.push((page_id, pos));
                    return Ok(());
                }
                NodeKind::Internal => {
                    self.stack.push((page_id, pos));
                    page_id = node.child(pos);
                }
            }
        }
    }

    /// Moves to the first (or last) slot of the neighbouring leaf.
    ///
    /// Returns false when there is none.
    fn next_leaf(&mut self) -> Result<bool> {
        self.stack.pop();
        while let Some((page_id, idx)) = self.stack.pop() {
            let page = self.index.cache().fetch_for_read(page_id)?;
            let data = page.data();
            let node = Node::new(&data[..], self.index.layout);
            node.check(page_id, NodeKind::Internal)?;
            let next = match self.direction {
                Direction::Ascending => (idx < node.count()).then_some(idx + 1),
                Direction::Descending => idx.checked_sub(1),
            };
            let Some(child_idx) = next else {
                continue;
            };
            self.stack.push((page_id, child_idx));
            let child = node.child(child_idx);
            drop(data);
            page.release()?;
            self.descend_edge(child)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Follows the leftmost (ascending) or rightmost (descending) chain down
    /// to a leaf.
    fn descend_edge(&mut self, mut page_id: PageId) -> Result<()> {
        loop {
            let page = self.index.cache().fetch_for_read(page_id)?;
            let data = page.data();
            let node = Node::new(&data[..], self.index.layout);
            let kind = node.checked_kind(page_id)?;
            let pos = match self.direction {
                Direction::Ascending => 0,
                Direction::Descending => node.count(),
            };
            self.stack.push((page_id, pos));
            if kind == NodeKind::Leaf {
                return Ok(());
            }
            page_id = node.child(pos);
        }
    }

    /// Returns the next slot in range as (encoded key, entry id).
    pub(crate) fn next_raw(&mut self, tree: &TreeMeta) -> Result<Option<(Vec<u8>, u64)>> {
        if self.done {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            if tree.root.is_null() {
                self.done = true;
                return Ok(None);
            }
            self.seek(tree)?;
        }

        loop {
            let Some(&(leaf, pos)) = self.stack.last() else {
                self.done = true;
                return Ok(None);
            };
            let item = {
                let page = self.index.cache().fetch_for_read(leaf)?;
                let data = page.data();
                let node = Node::new(&data[..], self.index.layout);
                node.check(leaf, NodeKind::Leaf)?;
                let idx = match self.direction {
                    Direction::Ascending => (pos < node.count()).then_some(pos),
                    Direction::Descending => pos.checked_sub(1),
                };
                idx.map(|i| (i, node.key(i).to_vec(), node.value(i)))
            };

            let Some((idx, key, value)) = item else {
                if !self.next_leaf()? {
                    self.done = true;
                    return Ok(None);
                }
                continue;
            };
            if self.is_past_end(&key) {
                self.done = true;
                return Ok(None);
            }
            if let Some(top) = self.stack.last_mut() {
                top.1 = match self.direction {
                    Direction::Ascending => idx + 1,
                    Direction::Descending => idx,
                };
            }
            return Ok(Some((key, value)));
        }
    }
}

/// A cursor over a key range of a [`BTreeIndex`].
///
/// Yields entries in key order (then entry-id order for duplicates) in the
/// chosen direction.
pub struct Cursor<'a, C: KeyCodec> {
    scan: Scan<'a, C>,
    filter: Option<Box<dyn Fn(&C::Key, u64) -> bool + 'a>>,
    stamp: u64,
    done: bool,
}

impl<'a, C: KeyCodec> Cursor<'a, C> {
    pub(crate) fn new(scan: Scan<'a, C>, stamp: u64) -> Self {
        Self {
            scan,
            filter: None,
            stamp,
            done: false,
        }
    }

    /// Only yields entries for which `filter` returns true.
    pub fn with_filter(mut self, filter: impl Fn(&C::Key, u64) -> bool + 'a) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Returns the scan direction.
    pub fn direction(&self) -> Direction {
        self.scan.direction
    }

    fn step(&mut self) -> Result<Option<IndexEntry<C::Key>>> {
        let index = self.scan.index;
        let tree = index.tree.read();
        let actual = index.modification_stamp();
        if actual != self.stamp {
            return Err(KestrelError::ConcurrentModification {
                expected: self.stamp,
                actual,
            });
        }

        while let Some((raw, entry_id)) = self.scan.next_raw(&tree)? {
            let key = index.codec.decode(&raw)?;
            if let Some(filter) = &self.filter {
                if !filter(&key, entry_id) {
                    continue;
                }
            }
            return Ok(Some(IndexEntry { key, entry_id }));
        }
        Ok(None)
    }
}

impl<C: KeyCodec> Iterator for Cursor<'_, C> {
    type Item = Result<IndexEntry<C::Key>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<C: KeyCodec> std::fmt::Debug for Cursor<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("direction", &self.scan.direction)
            .field("stack", &self.scan.stack)
            .field("stamp", &self.stamp)
            .field("done", &self.done)
            .finish()
    }
}
