//! Disk-based B-tree index over the page cache.
//!
//! Every node is one page (see [`super::page`]). Keys are encoded by a
//! [`KeyCodec`] and ordered by its comparator; in indexes that allow
//! duplicates the entry id is part of the slot and breaks ties.
//!
//! Writers take the tree latch exclusively, readers and cursor steps take it
//! shared. Pages are pinned only for the duration of a single node operation;
//! a parent is released before its child is visited and fetched again when a
//! split or underflow has to be applied to it.
//!
//! The tree's root, height and element count live in a descriptor page so an
//! index can be reopened:
//! ```text
//! 0   magic       8 bytes "KIDXMETA"
//! 8   root        u64
//! 16  height      u32
//! 20  flags       u32     bit 0: unique
//! 24  count       u64
//! 32  max_items   u32
//! 36  key_width   u32
//! ```

use super::codec::{prefix_successor, BytesCodec, KeyCodec};
use super::cursor::{Cursor, Direction, IndexEntry, Scan};
use super::page::{
    rebalance_or_merge, split_internal, split_leaf, Node, NodeKind, NodeLayout, Rebalance,
};
use crate::storage::PageStore;
use kestrel_buffer::{FetchMode, PageCache};
use kestrel_common::{IndexConfig, KestrelError, PageId, Result};
use parking_lot::RwLock;
use std::cmp::Ordering as CmpOrdering;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Magic bytes of an index descriptor page.
pub const INDEX_MAGIC: [u8; 8] = *b"KIDXMETA";

const FLAG_UNIQUE: u32 = 1;

/// Result of a node-level insert or remove, reported to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Applied; nothing for the parent to do.
    Done,
    /// An existing entry was overwritten; carries the previous entry id.
    Overwrite(u64),
    /// The node split. The parent must insert `separator` with `right` as
    /// the child to its right.
    Overflow { separator: Vec<u8>, right: PageId },
    /// The node fell below the minimum item count.
    Underflow,
    /// The key was not present.
    NotFound,
}

/// Result of [`BTreeIndex::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    /// The key existed; carries the entry id it mapped to before.
    Replaced(u64),
}

/// Root, height and element count of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeMeta {
    pub(crate) root: PageId,
    pub(crate) height: u32,
    pub(crate) count: u64,
}

impl TreeMeta {
    const EMPTY: TreeMeta = TreeMeta {
        root: PageId::NULL,
        height: 0,
        count: 0,
    };
}

/// A B-tree index mapping encoded keys to 64-bit entry ids.
pub struct BTreeIndex<C: KeyCodec> {
    store: Arc<dyn PageStore>,
    pub(crate) codec: C,
    pub(crate) layout: NodeLayout,
    meta_page: PageId,
    pub(crate) tree: RwLock<TreeMeta>,
    stamp: AtomicU64,
}

impl<C: KeyCodec> BTreeIndex<C> {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates an empty index, allocating its descriptor page.
    pub fn create(store: Arc<dyn PageStore>, codec: C, config: IndexConfig) -> Result<Self> {
        let layout = NodeLayout::new(
            store.cache().page_size(),
            codec.max_encoded_len(),
            config.unique,
            config.max_items,
        )?;
        let meta_page = store.allocate_page()?;
        let index = Self {
            store,
            codec,
            layout,
            meta_page,
            tree: RwLock::new(TreeMeta::EMPTY),
            stamp: AtomicU64::new(0),
        };
        index.write_meta(&TreeMeta::EMPTY, FetchMode::Fresh)?;
        tracing::debug!(
            meta = %meta_page,
            unique = layout.unique,
            max_items = layout.max_items,
            key_width = layout.key_width,
            "index created"
        );
        Ok(index)
    }

    /// Opens an index from its descriptor page.
    pub fn open(store: Arc<dyn PageStore>, codec: C, meta_page: PageId) -> Result<Self> {
        let (tree, unique, max_items, key_width) = {
            let page = store.cache().fetch_for_read(meta_page)?;
            let data = page.data();
            if data[0..8] != INDEX_MAGIC {
                return Err(KestrelError::PageCorrupted {
                    page_id: meta_page.offset(),
                    reason: "bad index magic".to_string(),
                });
            }
            let tree = TreeMeta {
                root: PageId::from_offset(read_u64(&data, 8)),
                height: read_u32(&data, 16),
                count: read_u64(&data, 24),
            };
            let flags = read_u32(&data, 20);
            (
                tree,
                flags & FLAG_UNIQUE != 0,
                read_u32(&data, 32) as usize,
                read_u32(&data, 36) as usize,
            )
        };

        if key_width != codec.max_encoded_len() {
            return Err(KestrelError::KeyEncoding(format!(
                "index stores keys of up to {} bytes, codec produces up to {}",
                key_width,
                codec.max_encoded_len()
            )));
        }
        let layout = NodeLayout::new(
            store.cache().page_size(),
            key_width,
            unique,
            Some(max_items),
        )?;
        if layout.max_items != max_items {
            return Err(KestrelError::PageCorrupted {
                page_id: meta_page.offset(),
                reason: format!("max items {} does not fit the page", max_items),
            });
        }

        tracing::debug!(meta = %meta_page, root = %tree.root, height = tree.height, count = tree.count, "index opened");
        Ok(Self {
            store,
            codec,
            layout,
            meta_page,
            tree: RwLock::new(tree),
            stamp: AtomicU64::new(0),
        })
    }

    fn write_meta(&self, tree: &TreeMeta, mode: FetchMode) -> Result<()> {
        let page = self.cache().fetch(self.meta_page, mode)?;
        {
            let mut data = page.data_mut()?;
            data[0..8].copy_from_slice(&INDEX_MAGIC);
            data[8..16].copy_from_slice(&tree.root.offset().to_le_bytes());
            data[16..20].copy_from_slice(&tree.height.to_le_bytes());
            let flags = if self.layout.unique { FLAG_UNIQUE } else { 0 };
            data[20..24].copy_from_slice(&flags.to_le_bytes());
            data[24..32].copy_from_slice(&tree.count.to_le_bytes());
            data[32..36].copy_from_slice(&(self.layout.max_items as u32).to_le_bytes());
            data[36..40].copy_from_slice(&(self.layout.key_width as u32).to_le_bytes());
        }
        page.release()
    }

    /// Persists `tree` and publishes the change to cursors.
    fn commit(&self, current: &mut TreeMeta, next: TreeMeta) -> Result<()> {
        self.write_meta(&next, FetchMode::Write)?;
        *current = next;
        self.stamp.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn cache(&self) -> &dyn PageCache {
        self.store.cache()
    }

    /// Returns the descriptor page of the index.
    pub fn meta_page(&self) -> PageId {
        self.meta_page
    }

    /// Returns the key codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Returns the node geometry.
    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// Returns true if equal keys are rejected.
    pub fn is_unique(&self) -> bool {
        self.layout.unique
    }

    /// Returns the number of entries.
    pub fn len(&self) -> u64 {
        self.tree.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the tree height (0 for an empty tree, 1 for a single leaf).
    pub fn height(&self) -> u32 {
        self.tree.read().height
    }

    /// Returns the root page, or `PageId::NULL` for an empty tree.
    pub fn root(&self) -> PageId {
        self.tree.read().root
    }

    /// Returns the modification stamp. It changes after every successful
    /// insert, replace, remove or clear.
    pub fn modification_stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    // =========================================================================
    // Slot comparison
    // =========================================================================

    /// Orders a slot against `key` (and `entry`, when duplicates are allowed
    /// and the entry is known).
    fn cmp_slot(&self, slot: &[u8], key: &[u8], entry: Option<u64>) -> CmpOrdering {
        let ord = self.codec.compare(self.layout.slot_key(slot), key);
        match (ord, entry, self.layout.slot_entry(slot)) {
            (CmpOrdering::Equal, Some(e), Some(se)) => se.cmp(&e),
            _ => ord,
        }
    }

    /// Index of the child covering `key`: the number of separators <= key.
    fn route(&self, node: &Node<&[u8]>, key: &[u8], entry: Option<u64>) -> usize {
        node.partition_point(|s| self.cmp_slot(s, key, entry) != CmpOrdering::Greater)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns the entry id stored under `key`.
    ///
    /// In an index with duplicates this is the smallest entry id.
    pub fn find(&self, key: &C::Key) -> Result<u64> {
        let key = self.codec.encode_to_vec(key)?;
        let tree = self.tree.read();
        self.find_locked(&tree, &key)?
            .ok_or(KestrelError::KeyNotFound { key })
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &C::Key) -> Result<bool> {
        let key = self.codec.encode_to_vec(key)?;
        let tree = self.tree.read();
        Ok(self.find_locked(&tree, &key)?.is_some())
    }

    /// Returns every entry id stored under `key`, in ascending order.
    pub fn find_all(&self, key: &C::Key) -> Result<Vec<u64>> {
        let key = self.codec.encode_to_vec(key)?;
        let tree = self.tree.read();
        let mut scan = Scan::new(
            self,
            Direction::Ascending,
            Bound::Included(key.clone()),
            Bound::Included(key),
        );
        let mut ids = Vec::new();
        while let Some((_, id)) = scan.next_raw(&tree)? {
            ids.push(id);
        }
        Ok(ids)
    }

    fn find_locked(&self, tree: &TreeMeta, key: &[u8]) -> Result<Option<u64>> {
        if tree.root.is_null() {
            return Ok(None);
        }
        if !self.layout.unique {
            let mut scan = Scan::new(
                self,
                Direction::Ascending,
                Bound::Included(key.to_vec()),
                Bound::Included(key.to_vec()),
            );
            return Ok(scan.next_raw(tree)?.map(|(_, id)| id));
        }

        let mut page_id = tree.root;
        for level in (1..=tree.height).rev() {
            let page = self.cache().fetch_for_read(page_id)?;
            let data = page.data();
            let node = Node::new(&data[..], self.layout);
            if level > 1 {
                node.check(page_id, NodeKind::Internal)?;
                page_id = node.child(self.route(&node, key, None));
            } else {
                node.check(page_id, NodeKind::Leaf)?;
                return Ok(node
                    .search(|s| self.cmp_slot(s, key, None))
                    .ok()
                    .map(|i| node.value(i)));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts `key -> entry_id`.
    ///
    /// Fails with `DuplicateKey` if a unique index already holds `key`, or if
    /// an index with duplicates already holds this exact pair.
    pub fn insert(&self, key: &C::Key, entry_id: u64) -> Result<()> {
        match self.upsert(key, entry_id, false)? {
            SetOutcome::Inserted => Ok(()),
            SetOutcome::Replaced(_) => Err(KestrelError::Internal(
                "insert replaced an existing entry".to_string(),
            )),
        }
    }

    /// Inserts `key -> entry_id`, replacing the entry id of an existing key.
    pub fn set(&self, key: &C::Key, entry_id: u64) -> Result<SetOutcome> {
        self.upsert(key, entry_id, true)
    }

    fn upsert(&self, key: &C::Key, entry_id: u64, replace: bool) -> Result<SetOutcome> {
        let key = self.codec.encode_to_vec(key)?;
        let slot = self.layout.make_slot(&key, entry_id)?;
        let entry = (!self.layout.unique).then_some(entry_id);

        let mut tree = self.tree.write();
        let mut next = *tree;

        if tree.root.is_null() {
            let root = self.store.allocate_page()?;
            let page = self.cache().fetch(root, FetchMode::Fresh)?;
            {
                let mut data = page.data_mut()?;
                let mut node = Node::new(&mut data[..], self.layout);
                node.init(NodeKind::Leaf);
                node.insert_leaf(0, &slot, entry_id);
            }
            page.release()?;
            next.root = root;
            next.height = 1;
            next.count = 1;
            tracing::debug!(root = %root, "tree root created");
            self.commit(&mut tree, next)?;
            return Ok(SetOutcome::Inserted);
        }

        let outcome =
            self.insert_rec(tree.root, tree.height, &key, entry, &slot, entry_id, replace)?;
        let result = match outcome {
            NodeOutcome::Done => {
                next.count += 1;
                SetOutcome::Inserted
            }
            NodeOutcome::Overwrite(old) => SetOutcome::Replaced(old),
            NodeOutcome::Overflow { separator, right } => {
                let root = self.store.allocate_page()?;
                let page = self.cache().fetch(root, FetchMode::Fresh)?;
                {
                    let mut data = page.data_mut()?;
                    let mut node = Node::new(&mut data[..], self.layout);
                    node.init(NodeKind::Internal);
                    node.set_value(0, tree.root.offset());
                    node.insert_separator(0, &separator, right);
                }
                page.release()?;
                next.root = root;
                next.height += 1;
                next.count += 1;
                tracing::debug!(root = %root, height = next.height, "tree grew a level");
                SetOutcome::Inserted
            }
            NodeOutcome::Underflow | NodeOutcome::NotFound => {
                return Err(KestrelError::Internal(format!(
                    "unexpected insert outcome {:?}",
                    outcome
                )));
            }
        };
        self.commit(&mut tree, next)?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_rec(
        &self,
        page_id: PageId,
        height: u32,
        key: &[u8],
        entry: Option<u64>,
        slot: &[u8],
        value: u64,
        replace: bool,
    ) -> Result<NodeOutcome> {
        let page = self.cache().fetch_for_read(page_id)?;

        if height > 1 {
            let (child_idx, child) = {
                let data = page.data();
                let node = Node::new(&data[..], self.layout);
                node.check(page_id, NodeKind::Internal)?;
                let idx = self.route(&node, key, entry);
                (idx, node.child(idx))
            };
            page.release()?;

            let outcome = self.insert_rec(child, height - 1, key, entry, slot, value, replace)?;
            let NodeOutcome::Overflow { separator, right } = outcome else {
                return Ok(outcome);
            };

            let page = self.cache().fetch_for_write(page_id)?;
            let full = Node::new(&page.data()[..], self.layout).count() >= self.layout.max_items;
            if !full {
                let mut data = page.data_mut()?;
                Node::new(&mut data[..], self.layout).insert_separator(child_idx, &separator, right);
                return Ok(NodeOutcome::Done);
            }

            let new_page = self.store.allocate_page()?;
            let sibling = self.cache().fetch(new_page, FetchMode::Fresh)?;
            let promoted = {
                let mut left = page.data_mut()?;
                let mut right_data = sibling.data_mut()?;
                split_internal(
                    &mut Node::new(&mut left[..], self.layout),
                    &mut Node::new(&mut right_data[..], self.layout),
                    child_idx,
                    &separator,
                    right,
                )
            };
            tracing::debug!(left = %page_id, right = %new_page, "internal node split");
            return Ok(NodeOutcome::Overflow {
                separator: promoted,
                right: new_page,
            });
        }

        let (found, full) = {
            let data = page.data();
            let node = Node::new(&data[..], self.layout);
            node.check(page_id, NodeKind::Leaf)?;
            let found = node.search(|s| self.cmp_slot(s, key, entry));
            (found.map(|i| (i, node.value(i))), node.count() >= self.layout.max_items)
        };

        match found {
            Ok((i, old)) => {
                if !replace {
                    return Err(KestrelError::DuplicateKey { key: key.to_vec() });
                }
                if old != value {
                    let mut data = page.data_mut()?;
                    Node::new(&mut data[..], self.layout).set_value(i, value);
                }
                Ok(NodeOutcome::Overwrite(old))
            }
            Err(pos) if !full => {
                let mut data = page.data_mut()?;
                Node::new(&mut data[..], self.layout).insert_leaf(pos, slot, value);
                Ok(NodeOutcome::Done)
            }
            Err(pos) => {
                let new_page = self.store.allocate_page()?;
                let sibling = self.cache().fetch(new_page, FetchMode::Fresh)?;
                let separator = {
                    let mut left = page.data_mut()?;
                    let mut right_data = sibling.data_mut()?;
                    split_leaf(
                        &mut Node::new(&mut left[..], self.layout),
                        &mut Node::new(&mut right_data[..], self.layout),
                        pos,
                        slot,
                        value,
                    )
                };
                tracing::debug!(left = %page_id, right = %new_page, "leaf split");
                Ok(NodeOutcome::Overflow {
                    separator,
                    right: new_page,
                })
            }
        }
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes `key` and returns the entry id it mapped to.
    ///
    /// With duplicates, `entry_id` selects which entry goes; `None` removes
    /// the one with the smallest entry id. Unique indexes ignore `entry_id`
    /// unless it is given, in which case it must match.
    pub fn remove(&self, key: &C::Key, entry_id: Option<u64>) -> Result<u64> {
        let key = self.codec.encode_to_vec(key)?;
        let mut tree = self.tree.write();

        let not_found = || KestrelError::KeyNotFound { key: key.clone() };
        let target = match (self.layout.unique, entry_id) {
            (false, Some(id)) => id,
            _ => {
                let found = self.find_locked(&tree, &key)?.ok_or_else(not_found)?;
                if entry_id.is_some_and(|id| id != found) {
                    return Err(not_found());
                }
                found
            }
        };
        if tree.root.is_null() {
            return Err(not_found());
        }

        let entry = (!self.layout.unique).then_some(target);
        let mut next = *tree;
        match self.remove_rec(tree.root, tree.height, &key, entry)? {
            NodeOutcome::NotFound => return Err(not_found()),
            NodeOutcome::Done | NodeOutcome::Underflow => {}
            other => {
                return Err(KestrelError::Internal(format!(
                    "unexpected remove outcome {:?}",
                    other
                )));
            }
        }
        next.count = next.count.saturating_sub(1);
        self.collapse_root(&mut next)?;
        self.commit(&mut tree, next)?;
        Ok(target)
    }

    fn remove_rec(
        &self,
        page_id: PageId,
        height: u32,
        key: &[u8],
        entry: Option<u64>,
    ) -> Result<NodeOutcome> {
        let page = self.cache().fetch_for_read(page_id)?;

        if height > 1 {
            let (child_idx, child) = {
                let data = page.data();
                let node = Node::new(&data[..], self.layout);
                node.check(page_id, NodeKind::Internal)?;
                let idx = self.route(&node, key, entry);
                (idx, node.child(idx))
            };
            page.release()?;

            match self.remove_rec(child, height - 1, key, entry)? {
                NodeOutcome::Underflow => {
                    self.handle_underflow(page_id, child_idx)?;
                    let page = self.cache().fetch_for_read(page_id)?;
                    let count = Node::new(&page.data()[..], self.layout).count();
                    Ok(if count < self.layout.min_items {
                        NodeOutcome::Underflow
                    } else {
                        NodeOutcome::Done
                    })
                }
                other => Ok(other),
            }
        } else {
            let pos = {
                let data = page.data();
                let node = Node::new(&data[..], self.layout);
                node.check(page_id, NodeKind::Leaf)?;
                node.search(|s| self.cmp_slot(s, key, entry))
            };
            let Ok(pos) = pos else {
                return Ok(NodeOutcome::NotFound);
            };
            let mut data = page.data_mut()?;
            let mut node = Node::new(&mut data[..], self.layout);
            node.remove_leaf(pos);
            Ok(if node.count() < self.layout.min_items {
                NodeOutcome::Underflow
            } else {
                NodeOutcome::Done
            })
        }
    }

    /// Repairs an underflow of child `child_idx` of `parent_id` by borrowing
    /// from or merging with its next sibling (previous, for the last child).
    fn handle_underflow(&self, parent_id: PageId, child_idx: usize) -> Result<()> {
        let parent = self.cache().fetch_for_read(parent_id)?;
        let (a, left_id, right_id) = {
            let data = parent.data();
            let node = Node::new(&data[..], self.layout);
            node.check(parent_id, NodeKind::Internal)?;
            let n = node.count();
            if n == 0 {
                // Single child, no sibling; the root collapse handles it.
                return Ok(());
            }
            let a = if child_idx < n { child_idx } else { child_idx - 1 };
            (a, node.child(a), node.child(a + 1))
        };

        let left = self.cache().fetch_for_read(left_id)?;
        let right = self.cache().fetch_for_read(right_id)?;
        let result = {
            let mut p = parent.data_mut()?;
            let mut l = left.data_mut()?;
            let mut r = right.data_mut()?;
            rebalance_or_merge(
                &mut Node::new(&mut p[..], self.layout),
                a,
                &mut Node::new(&mut l[..], self.layout),
                &mut Node::new(&mut r[..], self.layout),
            )
        };
        right.release()?;
        left.release()?;
        parent.release()?;

        match result {
            Rebalance::Redistributed { moved } => {
                tracing::debug!(left = %left_id, right = %right_id, moved, "nodes rebalanced");
            }
            Rebalance::Merged => {
                self.store.free_page(right_id)?;
                tracing::debug!(left = %left_id, freed = %right_id, "nodes merged");
            }
        }
        Ok(())
    }

    /// Shrinks the tree after a remove: an empty leaf root is freed, an
    /// internal root with a single child is replaced by that child.
    fn collapse_root(&self, tree: &mut TreeMeta) -> Result<()> {
        let (kind, count, only_child) = {
            let page = self.cache().fetch_for_read(tree.root)?;
            let data = page.data();
            let node = Node::new(&data[..], self.layout);
            let kind = node.checked_kind(tree.root)?;
            (kind, node.count(), node.child(0))
        };
        if count > 0 {
            return Ok(());
        }

        let old_root = tree.root;
        match kind {
            NodeKind::Leaf => {
                *tree = TreeMeta {
                    count: tree.count,
                    ..TreeMeta::EMPTY
                };
                tracing::debug!(root = %old_root, "tree emptied");
            }
            NodeKind::Internal => {
                tree.root = only_child;
                tree.height -= 1;
                tracing::debug!(root = %only_child, height = tree.height, "tree lost a level");
            }
        }
        self.store.free_page(old_root)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Opens a cursor over the keys in `range`.
    pub fn cursor<R>(&self, range: R, direction: Direction) -> Result<Cursor<'_, C>>
    where
        R: RangeBounds<C::Key>,
    {
        let lower = self.encode_bound(range.start_bound())?;
        let upper = self.encode_bound(range.end_bound())?;
        Ok(self.raw_cursor(lower, upper, direction))
    }

    pub(crate) fn raw_cursor(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        direction: Direction,
    ) -> Cursor<'_, C> {
        // Stamp read under the latch so it matches the tree the scan sees.
        let stamp = {
            let _tree = self.tree.read();
            self.modification_stamp()
        };
        Cursor::new(Scan::new(self, direction, lower, upper), stamp)
    }

    fn encode_bound(&self, bound: Bound<&C::Key>) -> Result<Bound<Vec<u8>>> {
        Ok(match bound {
            Bound::Included(k) => Bound::Included(self.codec.encode_to_vec(k)?),
            Bound::Excluded(k) => Bound::Excluded(self.codec.encode_to_vec(k)?),
            Bound::Unbounded => Bound::Unbounded,
        })
    }

    /// Iterates over all entries in ascending order.
    pub fn iter(&self) -> Cursor<'_, C> {
        self.raw_cursor(Bound::Unbounded, Bound::Unbounded, Direction::Ascending)
    }

    /// Collects all entries in ascending order.
    pub fn entries(&self) -> Result<Vec<IndexEntry<C::Key>>> {
        self.iter().collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes every entry, freeing all tree pages.
    pub fn clear(&self) -> Result<()> {
        let mut tree = self.tree.write();
        if !tree.root.is_null() {
            let freed = self.free_subtree(tree.root, tree.height)?;
            tracing::debug!(freed, "index cleared");
        }
        self.commit(&mut tree, TreeMeta::EMPTY)
    }

    /// Clears the index and frees its descriptor page.
    pub fn deallocate(self) -> Result<()> {
        self.clear()?;
        self.store.free_page(self.meta_page)
    }

    fn free_subtree(&self, page_id: PageId, height: u32) -> Result<usize> {
        let mut freed = 0;
        if height > 1 {
            let children: Vec<PageId> = {
                let page = self.cache().fetch_for_read(page_id)?;
                let data = page.data();
                let node = Node::new(&data[..], self.layout);
                node.check(page_id, NodeKind::Internal)?;
                (0..=node.count()).map(|i| node.child(i)).collect()
            };
            for child in children {
                freed += self.free_subtree(child, height - 1)?;
            }
        }
        self.store.free_page(page_id)?;
        Ok(freed + 1)
    }

    /// Checks the structural invariants of the whole tree: node kinds, item
    /// counts, key order within and across nodes, uniform leaf depth and the
    /// element count.
    pub fn verify(&self) -> Result<()> {
        let tree = self.tree.read();
        if tree.root.is_null() {
            if tree.height != 0 || tree.count != 0 {
                return Err(violation(format!(
                    "empty tree with height {} and count {}",
                    tree.height, tree.count
                )));
            }
            return Ok(());
        }
        if tree.height == 0 {
            return Err(violation("non-empty tree with height 0".to_string()));
        }

        let count = self.verify_node(tree.root, tree.height, true, None, None)?;
        if count != tree.count {
            return Err(violation(format!(
                "tree holds {} entries, descriptor says {}",
                count, tree.count
            )));
        }
        Ok(())
    }

    /// Verifies the subtree at `page_id` whose slots must lie in
    /// `[lower, upper)`. Returns the number of entries below it.
    fn verify_node(
        &self,
        page_id: PageId,
        height: u32,
        is_root: bool,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<u64> {
        let page = self.cache().fetch_for_read(page_id)?;
        let data = page.data();
        let node = Node::new(&data[..], self.layout);
        let expected = if height > 1 {
            NodeKind::Internal
        } else {
            NodeKind::Leaf
        };
        node.check(page_id, expected)?;

        let n = node.count();
        // A root holds at least one key; an empty tree has no root page.
        let min = if is_root { 1 } else { self.layout.min_items };
        if n < min {
            return Err(violation(format!(
                "node {} holds {} keys, minimum is {}",
                page_id, n, min
            )));
        }

        let order = |a: &[u8], b: &[u8]| {
            let key_ord = self.codec.compare(self.layout.slot_key(a), self.layout.slot_key(b));
            key_ord.then(self.layout.slot_entry(a).cmp(&self.layout.slot_entry(b)))
        };
        for i in 0..n {
            let slot = node.slot(i);
            if i > 0 && order(node.slot(i - 1), slot) != CmpOrdering::Less {
                return Err(violation(format!("keys out of order in node {}", page_id)));
            }
            if lower.is_some_and(|lo| order(slot, lo) == CmpOrdering::Less)
                || upper.is_some_and(|hi| order(slot, hi) != CmpOrdering::Less)
            {
                return Err(violation(format!(
                    "key {} of node {} outside its parent's range",
                    i, page_id
                )));
            }
        }

        if height == 1 {
            return Ok(n as u64);
        }

        let slots: Vec<Vec<u8>> = (0..n).map(|i| node.slot(i).to_vec()).collect();
        let children: Vec<PageId> = (0..=n).map(|i| node.child(i)).collect();
        drop(data);
        page.release()?;

        let mut total = 0;
        for (i, child) in children.into_iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(slots[i - 1].as_slice()) };
            let hi = if i == n { upper } else { Some(slots[i].as_slice()) };
            total += self.verify_node(child, height - 1, false, lo, hi)?;
        }
        Ok(total)
    }
}

impl BTreeIndex<BytesCodec> {
    /// Opens a cursor over the keys that start with `prefix`.
    pub fn prefix_cursor(&self, prefix: &[u8], direction: Direction) -> Result<Cursor<'_, BytesCodec>> {
        if prefix.len() > self.codec.max_len() {
            return Err(KestrelError::KeyTooLarge {
                size: prefix.len(),
                max: self.codec.max_len(),
            });
        }
        let upper = match prefix_successor(prefix) {
            Some(succ) => Bound::Excluded(succ),
            None => Bound::Unbounded,
        };
        Ok(self.raw_cursor(Bound::Included(prefix.to_vec()), upper, direction))
    }
}

fn violation(msg: String) -> KestrelError {
    KestrelError::InvariantViolation(msg)
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

impl<C: KeyCodec> std::fmt::Debug for BTreeIndex<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndex")
            .field("meta_page", &self.meta_page)
            .field("layout", &self.layout)
            .field("tree", &*self.tree.read())
            .field("stamp", &self.modification_stamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::codec::{CompoundCodec, FieldType, FieldValue, U64Codec};
    use crate::storage::Storage;
    use bytes::Bytes;
    use kestrel_buffer::MemoryPageFile;
    use kestrel_common::StorageConfig;

    const PAGE: usize = 512;

    fn create_test_storage(pool_pages: usize) -> Arc<Storage> {
        let config = StorageConfig {
            page_size: PAGE,
            buffer_pool_pages: pool_pages,
            fsync_enabled: false,
            ..Default::default()
        };
        Arc::new(Storage::open_with_file(config, Arc::new(MemoryPageFile::new())).unwrap())
    }

    fn create_test_index(config: IndexConfig) -> (BTreeIndex<U64Codec>, Arc<Storage>) {
        let storage = create_test_storage(16);
        let index = BTreeIndex::create(storage.clone(), U64Codec, config).unwrap();
        (index, storage)
    }

    fn collect(cursor: Cursor<'_, U64Codec>) -> Vec<u64> {
        cursor.map(|e| e.unwrap().key).collect()
    }

    #[test]
    fn test_empty_index() {
        let (index, _storage) = create_test_index(IndexConfig::default());
        assert_eq!(index.len(), 0);
        assert!(index.is_empty());
        assert_eq!(index.height(), 0);
        assert!(index.root().is_null());
        assert!(matches!(
            index.find(&1),
            Err(KestrelError::KeyNotFound { .. })
        ));
        assert!(!index.contains(&1).unwrap());
        assert!(index.iter().next().is_none());
        index.verify().unwrap();
    }

    #[test]
    fn test_insert_and_find() {
        let (index, _storage) = create_test_index(IndexConfig::default());
        for k in [50u64, 10, 40, 20, 30] {
            index.insert(&k, k * 10).unwrap();
        }
        assert_eq!(index.len(), 5);
        assert_eq!(index.height(), 1);
        for k in [10u64, 20, 30, 40, 50] {
            assert_eq!(index.find(&k).unwrap(), k * 10);
        }
        assert!(index.find(&15).is_err());
        assert_eq!(collect(index.iter()), vec![10, 20, 30, 40, 50]);
        index.verify().unwrap();
    }

    #[test]
    fn test_insert_duplicate_unique() {
        let (index, _storage) = create_test_index(IndexConfig::default());
        index.insert(&7, 1).unwrap();
        let stamp = index.modification_stamp();

        let err = index.insert(&7, 2).unwrap_err();
        assert!(matches!(err, KestrelError::DuplicateKey { .. }));
        assert_eq!(index.find(&7).unwrap(), 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.modification_stamp(), stamp);
    }

    #[test]
    fn test_set_replaces() {
        let (index, _storage) = create_test_index(IndexConfig::default());
        assert_eq!(index.set(&7, 1).unwrap(), SetOutcome::Inserted);
        assert_eq!(index.set(&7, 2).unwrap(), SetOutcome::Replaced(1));
        assert_eq!(index.find(&7).unwrap(), 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_unique() {
        let (index, _storage) = create_test_index(IndexConfig::default());
        index.insert(&1, 100).unwrap();
        index.insert(&2, 200).unwrap();

        assert!(matches!(
            index.remove(&2, Some(999)),
            Err(KestrelError::KeyNotFound { .. })
        ));
        assert_eq!(index.remove(&2, None).unwrap(), 200);
        assert!(matches!(
            index.remove(&2, None),
            Err(KestrelError::KeyNotFound { .. })
        ));
        assert_eq!(index.remove(&1, Some(100)).unwrap(), 100);
        assert!(index.is_empty());
        assert_eq!(index.height(), 0);
        assert!(index.root().is_null());
        index.verify().unwrap();
    }

    #[test]
    fn test_splits_grow_height() {
        let (index, storage) = create_test_index(IndexConfig::default().with_max_items(4));
        for k in 0..200u64 {
            index.insert(&(k * 7 % 200), k).unwrap();
            if k % 25 == 0 {
                index.verify().unwrap();
            }
        }
        assert_eq!(index.len(), 200);
        assert!(index.height() >= 4);
        index.verify().unwrap();
        assert_eq!(collect(index.iter()), (0..200).collect::<Vec<_>>());
        assert_eq!(storage.stats().pinned_frames, 0);
    }

    #[test]
    fn test_remove_all_frees_tree_pages() {
        let (index, storage) = create_test_index(IndexConfig::default().with_max_items(4));
        for k in 0..100u64 {
            index.insert(&k, k).unwrap();
        }
        for k in (0..100u64).rev().step_by(2) {
            index.remove(&k, None).unwrap();
        }
        index.verify().unwrap();
        for k in (0..100u64).step_by(2) {
            index.remove(&k, None).unwrap();
            index.verify().unwrap();
        }

        assert!(index.is_empty());
        assert_eq!(index.height(), 0);
        // Everything but the header and the descriptor page is free.
        let pages = storage.file_end() / PAGE as u64;
        assert_eq!(storage.free_count(), pages - 2);
    }

    #[test]
    fn test_non_unique_duplicates() {
        let (index, _storage) =
            create_test_index(IndexConfig::non_unique().with_max_items(4));
        for id in [9u64, 3, 7, 1, 5] {
            index.insert(&42, id).unwrap();
        }
        index.insert(&41, 100).unwrap();
        index.insert(&43, 200).unwrap();

        assert_eq!(index.find_all(&42).unwrap(), vec![1, 3, 5, 7, 9]);
        assert_eq!(index.find(&42).unwrap(), 1);
        assert!(matches!(
            index.insert(&42, 7),
            Err(KestrelError::DuplicateKey { .. })
        ));

        assert_eq!(index.remove(&42, Some(5)).unwrap(), 5);
        assert_eq!(index.remove(&42, None).unwrap(), 1);
        assert_eq!(index.find_all(&42).unwrap(), vec![3, 7, 9]);
        assert!(index.remove(&42, Some(5)).is_err());
        assert_eq!(index.len(), 5);
        index.verify().unwrap();
    }

    #[test]
    fn test_cursor_bounds() {
        let (index, _storage) = create_test_index(IndexConfig::default().with_max_items(4));
        for k in 0..40u64 {
            index.insert(&k, k).unwrap();
        }

        let asc = |r: (Bound<u64>, Bound<u64>)| {
            collect(index.cursor(r, Direction::Ascending).unwrap())
        };
        let desc = |r: (Bound<u64>, Bound<u64>)| {
            collect(index.cursor(r, Direction::Descending).unwrap())
        };

        assert_eq!(asc((Bound::Included(10), Bound::Excluded(15))), vec![10, 11, 12, 13, 14]);
        assert_eq!(asc((Bound::Excluded(10), Bound::Included(13))), vec![11, 12, 13]);
        assert_eq!(asc((Bound::Included(37), Bound::Unbounded)), vec![37, 38, 39]);
        assert_eq!(desc((Bound::Unbounded, Bound::Included(2))), vec![2, 1, 0]);
        assert_eq!(desc((Bound::Excluded(30), Bound::Excluded(34))), vec![33, 32, 31]);
        assert_eq!(desc((Bound::Included(36), Bound::Unbounded)), vec![39, 38, 37, 36]);
        assert!(asc((Bound::Included(50), Bound::Unbounded)).is_empty());
        assert!(desc((Bound::Unbounded, Bound::Excluded(0))).is_empty());

        let all_desc = collect(index.cursor(.., Direction::Descending).unwrap());
        assert_eq!(all_desc, (0..40).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_bounds_between_keys() {
        let (index, _storage) = create_test_index(IndexConfig::default().with_max_items(4));
        for k in (0..100u64).step_by(10) {
            index.insert(&k, k).unwrap();
        }
        let asc = collect(index.cursor(15..45, Direction::Ascending).unwrap());
        assert_eq!(asc, vec![20, 30, 40]);
        let desc = collect(index.cursor(15..=45, Direction::Descending).unwrap());
        assert_eq!(desc, vec![40, 30, 20]);
    }

    #[test]
    fn test_cursor_fail_fast() {
        let (index, _storage) = create_test_index(IndexConfig::default());
        for k in 0..10u64 {
            index.insert(&k, k).unwrap();
        }

        let mut cursor = index.iter();
        assert_eq!(cursor.next().unwrap().unwrap().key, 0);
        index.insert(&100, 100).unwrap();
        assert!(matches!(
            cursor.next(),
            Some(Err(KestrelError::ConcurrentModification { .. }))
        ));
        assert!(cursor.next().is_none());

        // A failed write does not invalidate cursors.
        let mut cursor = index.iter();
        assert!(index.insert(&5, 0).is_err());
        assert_eq!(cursor.next().unwrap().unwrap().key, 0);
    }

    #[test]
    fn test_cursor_filter() {
        let (index, _storage) = create_test_index(IndexConfig::default().with_max_items(4));
        for k in 0..30u64 {
            index.insert(&k, k * 2).unwrap();
        }
        let odd: Vec<u64> = index
            .iter()
            .with_filter(|k, _| k % 2 == 1)
            .map(|e| e.unwrap().entry_id)
            .collect();
        assert_eq!(odd, (0..30).filter(|k| k % 2 == 1).map(|k| k * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_clear_and_deallocate() {
        let (index, storage) = create_test_index(IndexConfig::default().with_max_items(4));
        for k in 0..50u64 {
            index.insert(&k, k).unwrap();
        }
        index.clear().unwrap();
        assert!(index.is_empty());
        assert!(index.root().is_null());
        index.verify().unwrap();

        let pages = storage.file_end() / PAGE as u64;
        assert_eq!(storage.free_count(), pages - 2);

        index.insert(&1, 1).unwrap();
        index.deallocate().unwrap();
        assert_eq!(storage.free_count(), pages - 1);
    }

    #[test]
    fn test_reopen_from_descriptor() {
        let storage = create_test_storage(16);
        let meta = {
            let index = BTreeIndex::create(
                storage.clone(),
                U64Codec,
                IndexConfig::non_unique().with_max_items(5),
            )
            .unwrap();
            for k in 0..60u64 {
                index.insert(&(k % 20), k).unwrap();
            }
            index.meta_page()
        };

        let index = BTreeIndex::open(storage.clone(), U64Codec, meta).unwrap();
        assert!(!index.is_unique());
        assert_eq!(index.layout().max_items, 5);
        assert_eq!(index.len(), 60);
        assert_eq!(index.find_all(&3).unwrap(), vec![3, 23, 43]);
        index.verify().unwrap();
    }

    #[test]
    fn test_open_rejects_bad_descriptor() {
        let storage = create_test_storage(16);
        let page = storage.allocate_page().unwrap();
        storage.cache().fetch(page, FetchMode::Fresh).unwrap().release().unwrap();
        let err = BTreeIndex::open(storage.clone(), U64Codec, page).unwrap_err();
        assert!(matches!(err, KestrelError::PageCorrupted { .. }));

        let index = BTreeIndex::create(storage.clone(), U64Codec, IndexConfig::default()).unwrap();
        let err = BTreeIndex::open(storage.clone(), BytesCodec::new(32), index.meta_page())
            .unwrap_err();
        assert!(matches!(err, KestrelError::KeyEncoding(_)));
    }

    #[test]
    fn test_key_too_large() {
        let storage = create_test_storage(16);
        let index =
            BTreeIndex::create(storage, BytesCodec::new(8), IndexConfig::default()).unwrap();
        let err = index.insert(&Bytes::from_static(b"0123456789"), 1).unwrap_err();
        assert!(matches!(err, KestrelError::KeyTooLarge { size: 10, max: 8 }));
        assert!(index.is_empty());
    }

    #[test]
    fn test_prefix_cursor() {
        let storage = create_test_storage(16);
        let index = BTreeIndex::create(
            storage,
            BytesCodec::new(16),
            IndexConfig::default().with_max_items(4),
        )
        .unwrap();
        let words = ["apple", "apricot", "banana", "app", "ap", "b", "apz", "aq"];
        for (i, w) in words.iter().enumerate() {
            index.insert(&Bytes::copy_from_slice(w.as_bytes()), i as u64).unwrap();
        }

        let scan = |prefix: &str, dir| -> Vec<String> {
            index
                .prefix_cursor(prefix.as_bytes(), dir)
                .unwrap()
                .map(|e| String::from_utf8(e.unwrap().key.to_vec()).unwrap())
                .collect()
        };
        assert_eq!(scan("ap", Direction::Ascending), vec!["ap", "app", "apple", "apricot", "apz"]);
        assert_eq!(scan("app", Direction::Descending), vec!["apple", "app"]);
        assert_eq!(scan("c", Direction::Ascending), Vec::<String>::new());
        assert_eq!(scan("", Direction::Ascending).len(), words.len());
    }

    #[test]
    fn test_compound_keys() {
        let storage = create_test_storage(16);
        let codec = CompoundCodec::new(vec![FieldType::String { max_len: 12 }, FieldType::I32]);
        let index =
            BTreeIndex::create(storage, codec, IndexConfig::default().with_max_items(4)).unwrap();
        let key = |name: &str, n: i32| vec![FieldValue::String(name.to_string()), FieldValue::I32(n)];

        let mut id = 0;
        for name in ["carol", "alice", "bob"] {
            for n in [3, -1, 2] {
                index.insert(&key(name, n), id).unwrap();
                id += 1;
            }
        }
        index.verify().unwrap();

        // A partial key is a lower bound for every key that extends it.
        let from_bob = vec![FieldValue::String("bob".to_string())];
        let until_carol = vec![FieldValue::String("carol".to_string())];
        let bobs: Vec<Vec<FieldValue>> = index
            .cursor(from_bob..until_carol, Direction::Ascending)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(bobs, vec![key("bob", -1), key("bob", 2), key("bob", 3)]);
        assert_eq!(index.find(&key("alice", 2)).unwrap(), 5);
    }

    #[test]
    fn test_concurrent_readers() {
        let (index, _storage) = create_test_index(IndexConfig::default().with_max_items(8));
        for k in 0..300u64 {
            index.insert(&k, k + 1).unwrap();
        }
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let index = &index;
                s.spawn(move || {
                    for k in (t..300).step_by(4) {
                        assert_eq!(index.find(&k).unwrap(), k + 1);
                    }
                    assert_eq!(index.iter().count(), 300);
                });
            }
        });
    }
}
