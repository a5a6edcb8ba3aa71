//! B-tree node layout over a single page.
//!
//! Page layout:
//! ```text
//! +-----------------------------+ 0
//! | count: u16 | kind: u8 | pad | 4 (HEADER_SIZE)
//! +-----------------------------+
//! | key slot 0                  |
//! | key slot 1                  |  <- grows forward
//! | ...                         |
//! +-----------------------------+
//! |         free space          |
//! +-----------------------------+
//! | ...                         |
//! | value 1: u64                |  <- grows backward
//! | value 0: u64                |
//! +-----------------------------+ page_size
//! ```
//!
//! A key slot is `[len: u16][key bytes, zero padded to the key width]`,
//! followed by the entry id (`u64`) in indexes that allow duplicates, so equal
//! keys are ordered by entry id. Leaves store one value (the entry id) per
//! slot. Internal nodes store `count + 1` child page offsets; child `i` holds
//! the keys in `[slot[i - 1], slot[i])`.

use kestrel_common::{KestrelError, PageId, Result};

/// Node header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Size of one value (entry id or child page offset).
pub const VALUE_SIZE: usize = 8;

/// Size of the key length prefix in a slot.
const LEN_SIZE: usize = 2;

/// Size of the entry id suffix in slots of non-unique indexes.
const ENTRY_ID_SIZE: usize = 8;

/// Node type stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Leaf = 1,
    Internal = 2,
}

impl NodeKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeKind::Leaf),
            2 => Some(NodeKind::Internal),
            _ => None,
        }
    }
}

/// Geometry of the nodes of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    /// Page size in bytes.
    pub page_size: usize,
    /// Maximum encoded key length.
    pub key_width: usize,
    /// Whether slots carry an entry id.
    pub unique: bool,
    /// Bytes per key slot.
    pub slot_width: usize,
    /// Maximum number of keys per node.
    pub max_items: usize,
    /// Underflow threshold for non-root nodes.
    pub min_items: usize,
}

impl NodeLayout {
    /// Smallest allowed `max_items`; keeps the underflow threshold above 0.
    pub const MIN_MAX_ITEMS: usize = 3;

    /// Computes the layout, capping the item count at `max_items` if given.
    pub fn new(
        page_size: usize,
        key_width: usize,
        unique: bool,
        max_items: Option<usize>,
    ) -> Result<Self> {
        let slot_width = LEN_SIZE + key_width + if unique { 0 } else { ENTRY_ID_SIZE };
        let capacity = Self::capacity_for(page_size, slot_width).min(u16::MAX as usize);
        if capacity < Self::MIN_MAX_ITEMS {
            return Err(KestrelError::KeyTooLarge {
                size: key_width,
                max: (page_size - HEADER_SIZE - VALUE_SIZE) / Self::MIN_MAX_ITEMS
                    - VALUE_SIZE
                    - (slot_width - key_width),
            });
        }

        let max_items = match max_items {
            Some(m) if m < Self::MIN_MAX_ITEMS => {
                return Err(KestrelError::InvalidParameter {
                    name: "max_items".to_string(),
                    value: m.to_string(),
                });
            }
            Some(m) => m.min(capacity),
            None => capacity,
        };

        Ok(Self {
            page_size,
            key_width,
            unique,
            slot_width,
            max_items,
            min_items: max_items / 3,
        })
    }

    /// Number of slots that fit in a buffer of `len` bytes, leaving room for
    /// the extra child value of an internal node.
    #[inline]
    pub fn capacity_for(len: usize, slot_width: usize) -> usize {
        len.saturating_sub(HEADER_SIZE + VALUE_SIZE) / (slot_width + VALUE_SIZE)
    }

    /// Builds an empty key slot carrying `key` (and `entry_id` if the index
    /// allows duplicates).
    pub fn make_slot(&self, key: &[u8], entry_id: u64) -> Result<Vec<u8>> {
        if key.len() > self.key_width {
            return Err(KestrelError::KeyTooLarge {
                size: key.len(),
                max: self.key_width,
            });
        }
        let mut slot = vec![0u8; self.slot_width];
        slot[..LEN_SIZE].copy_from_slice(&(key.len() as u16).to_le_bytes());
        slot[LEN_SIZE..LEN_SIZE + key.len()].copy_from_slice(key);
        if !self.unique {
            slot[LEN_SIZE + self.key_width..].copy_from_slice(&entry_id.to_le_bytes());
        }
        Ok(slot)
    }

    /// Returns the key bytes of a slot.
    #[inline]
    pub fn slot_key<'s>(&self, slot: &'s [u8]) -> &'s [u8] {
        let len = u16::from_le_bytes([slot[0], slot[1]]) as usize;
        &slot[LEN_SIZE..LEN_SIZE + len.min(self.key_width)]
    }

    /// Returns the entry id of a slot, or None in unique indexes.
    #[inline]
    pub fn slot_entry(&self, slot: &[u8]) -> Option<u64> {
        if self.unique {
            return None;
        }
        let off = LEN_SIZE + self.key_width;
        let mut buf = [0u8; ENTRY_ID_SIZE];
        buf.copy_from_slice(&slot[off..off + ENTRY_ID_SIZE]);
        Some(u64::from_le_bytes(buf))
    }
}

/// A view of a page buffer as a B-tree node.
pub struct Node<B> {
    buf: B,
    layout: NodeLayout,
}

impl<B: AsRef<[u8]>> Node<B> {
    /// Wraps a page buffer.
    pub fn new(buf: B, layout: NodeLayout) -> Self {
        Self { buf, layout }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Returns the number of keys.
    #[inline]
    pub fn count(&self) -> usize {
        let b = self.bytes();
        u16::from_le_bytes([b[0], b[1]]) as usize
    }

    /// Returns the node kind, or None for an uninitialized page.
    #[inline]
    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_u8(self.bytes()[2])
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.kind() == Some(NodeKind::Leaf)
    }

    /// Checks the node is of the expected kind and within capacity.
    pub fn check(&self, page_id: PageId, expected: NodeKind) -> Result<()> {
        let kind = self.checked_kind(page_id)?;
        if kind != expected {
            return Err(KestrelError::PageCorrupted {
                page_id: page_id.offset(),
                reason: format!("expected {:?} node, found {:?}", expected, kind),
            });
        }
        Ok(())
    }

    /// Returns the node kind, failing on uninitialized or overfull pages.
    pub fn checked_kind(&self, page_id: PageId) -> Result<NodeKind> {
        let Some(kind) = self.kind() else {
            return Err(KestrelError::PageCorrupted {
                page_id: page_id.offset(),
                reason: format!("unknown node kind {}", self.bytes()[2]),
            });
        };
        if self.count() > self.layout.max_items {
            return Err(KestrelError::PageCorrupted {
                page_id: page_id.offset(),
                reason: format!(
                    "{} keys exceed the capacity of {}",
                    self.count(),
                    self.layout.max_items
                ),
            });
        }
        Ok(kind)
    }

    /// Returns the number of values (`count` for leaves, `count + 1` otherwise).
    #[inline]
    pub fn value_count(&self) -> usize {
        if self.is_leaf() {
            self.count()
        } else {
            self.count() + 1
        }
    }

    #[inline]
    fn slot_off(&self, i: usize) -> usize {
        HEADER_SIZE + i * self.layout.slot_width
    }

    #[inline]
    fn value_off(&self, i: usize) -> usize {
        self.bytes().len() - (i + 1) * VALUE_SIZE
    }

    /// Returns key slot `i`.
    #[inline]
    pub fn slot(&self, i: usize) -> &[u8] {
        let off = self.slot_off(i);
        &self.bytes()[off..off + self.layout.slot_width]
    }

    /// Returns the key bytes of slot `i`.
    #[inline]
    pub fn key(&self, i: usize) -> &[u8] {
        self.layout.slot_key(self.slot(i))
    }

    /// Returns value `i`.
    #[inline]
    pub fn value(&self, i: usize) -> u64 {
        let off = self.value_off(i);
        let mut buf = [0u8; VALUE_SIZE];
        buf.copy_from_slice(&self.bytes()[off..off + VALUE_SIZE]);
        u64::from_le_bytes(buf)
    }

    /// Returns child `i` of an internal node.
    #[inline]
    pub fn child(&self, i: usize) -> PageId {
        PageId::from_offset(self.value(i))
    }

    /// Returns the number of leading slots for which `pred` holds.
    ///
    /// `pred` must be true for a prefix of the slots and false afterwards.
    pub fn partition_point(&self, mut pred: impl FnMut(&[u8]) -> bool) -> usize {
        let (mut lo, mut hi) = (0, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.slot(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Binary searches the slots. `cmp` orders a slot relative to the probe.
    pub fn search(
        &self,
        mut cmp: impl FnMut(&[u8]) -> std::cmp::Ordering,
    ) -> std::result::Result<usize, usize> {
        let pos = self.partition_point(|s| cmp(s) == std::cmp::Ordering::Less);
        if pos < self.count() && cmp(self.slot(pos)) == std::cmp::Ordering::Equal {
            Ok(pos)
        } else {
            Err(pos)
        }
    }

    /// Copies out all slots (flattened) and values.
    pub fn read_all(&self) -> (Vec<u8>, Vec<u64>) {
        let n = self.count();
        let slots = self.bytes()[self.slot_off(0)..self.slot_off(n)].to_vec();
        let values = (0..self.value_count()).map(|i| self.value(i)).collect();
        (slots, values)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Node<B> {
    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn set_count(&mut self, count: usize) {
        self.bytes_mut()[..2].copy_from_slice(&(count as u16).to_le_bytes());
    }

    /// Formats the page as an empty node.
    pub fn init(&mut self, kind: NodeKind) {
        let b = self.bytes_mut();
        b.fill(0);
        b[2] = kind as u8;
    }

    /// Overwrites value `i`.
    pub fn set_value(&mut self, i: usize, value: u64) {
        let off = self.value_off(i);
        self.bytes_mut()[off..off + VALUE_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrites key slot `i`.
    pub fn set_slot(&mut self, i: usize, slot: &[u8]) {
        let off = self.slot_off(i);
        let width = self.layout.slot_width;
        self.bytes_mut()[off..off + width].copy_from_slice(slot);
    }

    /// Opens a gap at slot `i`.
    fn shift_slots_right(&mut self, i: usize) {
        let n = self.count();
        let (from, to, dst) = (self.slot_off(i), self.slot_off(n), self.slot_off(i + 1));
        self.bytes_mut().copy_within(from..to, dst);
    }

    /// Closes the gap at slot `i`.
    fn shift_slots_left(&mut self, i: usize) {
        let n = self.count();
        let (from, to, dst) = (self.slot_off(i + 1), self.slot_off(n), self.slot_off(i));
        self.bytes_mut().copy_within(from..to, dst);
    }

    /// Opens a gap at value `j`, given `nv` values in use.
    fn shift_values(&mut self, j: usize, nv: usize) {
        let len = self.bytes().len();
        let (from, to) = (len - nv * VALUE_SIZE, len - j * VALUE_SIZE);
        self.bytes_mut()
            .copy_within(from..to, len - (nv + 1) * VALUE_SIZE);
    }

    /// Closes the gap at value `j`, given `nv` values in use.
    fn unshift_values(&mut self, j: usize, nv: usize) {
        let len = self.bytes().len();
        let (from, to) = (len - nv * VALUE_SIZE, len - (j + 1) * VALUE_SIZE);
        self.bytes_mut()
            .copy_within(from..to, len - (nv - 1) * VALUE_SIZE);
    }

    /// Inserts a slot and its entry id at position `i` of a leaf.
    pub fn insert_leaf(&mut self, i: usize, slot: &[u8], value: u64) {
        let n = self.count();
        self.shift_slots_right(i);
        self.shift_values(i, n);
        self.set_slot(i, slot);
        self.set_value(i, value);
        self.set_count(n + 1);
    }

    /// Removes slot `i` of a leaf.
    pub fn remove_leaf(&mut self, i: usize) {
        let n = self.count();
        self.shift_slots_left(i);
        self.unshift_values(i, n);
        self.set_count(n - 1);
    }

    /// Inserts separator `slot` at position `i` of an internal node, with
    /// `right` becoming child `i + 1`.
    pub fn insert_separator(&mut self, i: usize, slot: &[u8], right: PageId) {
        let n = self.count();
        self.shift_slots_right(i);
        self.shift_values(i + 1, n + 1);
        self.set_slot(i, slot);
        self.set_value(i + 1, right.offset());
        self.set_count(n + 1);
    }

    /// Removes separator `i` and child `i + 1` of an internal node.
    pub fn remove_separator(&mut self, i: usize) {
        let n = self.count();
        self.shift_slots_left(i);
        self.unshift_values(i + 1, n + 1);
        self.set_count(n - 1);
    }

    /// Rewrites the whole node.
    pub fn write_all(&mut self, kind: NodeKind, slots: &[u8], values: &[u64]) {
        let n = slots.len() / self.layout.slot_width;
        self.init(kind);
        let off = self.slot_off(0);
        self.bytes_mut()[off..off + slots.len()].copy_from_slice(slots);
        for (i, v) in values.iter().enumerate() {
            self.set_value(i, *v);
        }
        self.set_count(n);
    }
}

/// Flattened slots and values of one or more nodes, used while splitting and
/// merging.
struct Items {
    slot_width: usize,
    slots: Vec<u8>,
    values: Vec<u64>,
}

impl Items {
    fn of<B: AsRef<[u8]>>(node: &Node<B>) -> Self {
        let (slots, values) = node.read_all();
        Self {
            slot_width: node.layout.slot_width,
            slots,
            values,
        }
    }

    fn len(&self) -> usize {
        self.slots.len() / self.slot_width
    }

    fn slot(&self, i: usize) -> &[u8] {
        &self.slots[i * self.slot_width..(i + 1) * self.slot_width]
    }

    fn slots(&self, range: std::ops::Range<usize>) -> &[u8] {
        &self.slots[range.start * self.slot_width..range.end * self.slot_width]
    }

    fn insert_slot(&mut self, i: usize, slot: &[u8]) {
        let off = i * self.slot_width;
        self.slots.splice(off..off, slot.iter().copied());
    }

    fn push_slot(&mut self, slot: &[u8]) {
        self.slots.extend_from_slice(slot);
    }

    fn append(&mut self, other: Items) {
        self.slots.extend_from_slice(&other.slots);
        self.values.extend_from_slice(&other.values);
    }
}

/// Number of items the left node keeps when `total` items are split.
///
/// The right node receives `ceil(total / 2)`.
#[inline]
pub fn split_point(total: usize) -> usize {
    total - total.div_ceil(2)
}

/// Splits a full leaf while inserting `slot` at position `pos`.
///
/// `left` keeps the lower items, `right` (an empty page) gets the upper
/// `ceil((max + 1) / 2)`. Returns the separator: the first slot of `right`.
pub fn split_leaf<L, R>(
    left: &mut Node<L>,
    right: &mut Node<R>,
    pos: usize,
    slot: &[u8],
    value: u64,
) -> Vec<u8>
where
    L: AsRef<[u8]> + AsMut<[u8]>,
    R: AsRef<[u8]> + AsMut<[u8]>,
{
    let mut items = Items::of(left);
    items.insert_slot(pos, slot);
    items.values.insert(pos, value);

    let total = items.len();
    let l = split_point(total);
    left.write_all(NodeKind::Leaf, items.slots(0..l), &items.values[..l]);
    right.write_all(NodeKind::Leaf, items.slots(l..total), &items.values[l..]);
    items.slot(l).to_vec()
}

/// Splits a full internal node while inserting separator `slot` at `pos`
/// with child `child` to its right.
///
/// The middle key is promoted and kept by neither half. Returns it.
pub fn split_internal<L, R>(
    left: &mut Node<L>,
    right: &mut Node<R>,
    pos: usize,
    slot: &[u8],
    child: PageId,
) -> Vec<u8>
where
    L: AsRef<[u8]> + AsMut<[u8]>,
    R: AsRef<[u8]> + AsMut<[u8]>,
{
    let mut items = Items::of(left);
    items.insert_slot(pos, slot);
    items.values.insert(pos + 1, child.offset());

    let total = items.len();
    let l = split_point(total);
    left.write_all(NodeKind::Internal, items.slots(0..l), &items.values[..=l]);
    right.write_all(
        NodeKind::Internal,
        items.slots(l + 1..total),
        &items.values[l + 1..],
    );
    items.slot(l).to_vec()
}

/// What [`rebalance_or_merge`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebalance {
    /// Items were redistributed; both pages stay.
    Redistributed {
        /// Items that crossed the separator.
        moved: usize,
    },
    /// `right` was merged into `left` and dropped from the parent; its page
    /// must be freed.
    Merged,
}

/// Fixes an underflow between children `a` and `a + 1` of `parent`.
///
/// If the two nodes hold more than a page's worth of items they are
/// redistributed: the larger side hands over `larger - floor(total / 2)`
/// items and the parent separator is rewritten. Otherwise everything moves
/// into `left`, and separator `a` and child `a + 1` leave the parent. For
/// internal nodes the parent separator takes part as one extra item.
pub fn rebalance_or_merge<P, L, R>(
    parent: &mut Node<P>,
    a: usize,
    left: &mut Node<L>,
    right: &mut Node<R>,
) -> Rebalance
where
    P: AsRef<[u8]> + AsMut<[u8]>,
    L: AsRef<[u8]> + AsMut<[u8]>,
    R: AsRef<[u8]> + AsMut<[u8]>,
{
    let max = left.layout.max_items;
    let leaf = left.is_leaf();
    let kind = if leaf { NodeKind::Leaf } else { NodeKind::Internal };
    let (ln, rn) = (left.count(), right.count());

    let mut items = Items::of(left);
    if !leaf {
        items.push_slot(parent.slot(a));
    }
    items.append(Items::of(right));

    // Separator counts as an item on the internal level.
    let combined = if leaf { ln + rn } else { ln + rn + 1 };
    if combined <= max {
        left.write_all(kind, &items.slots, &items.values);
        parent.remove_separator(a);
        return Rebalance::Merged;
    }

    let total = ln + rn;
    let new_ln = if rn >= ln {
        total.div_ceil(2)
    } else {
        total / 2
    };
    let moved = new_ln.abs_diff(ln);

    if leaf {
        left.write_all(kind, items.slots(0..new_ln), &items.values[..new_ln]);
        right.write_all(kind, items.slots(new_ln..total), &items.values[new_ln..]);
        parent.set_slot(a, items.slot(new_ln));
    } else {
        let end = items.len();
        left.write_all(kind, items.slots(0..new_ln), &items.values[..=new_ln]);
        right.write_all(
            kind,
            items.slots(new_ln + 1..end),
            &items.values[new_ln + 1..],
        );
        parent.set_slot(a, items.slot(new_ln));
    }
    Rebalance::Redistributed { moved }
}
