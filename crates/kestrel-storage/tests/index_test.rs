//! Index engine integration tests.
//!
//! End-to-end checks of the paged B-tree over the buffer pool:
//! - Split and merge shapes with a small per-page cap
//! - Page accounting when the tree shrinks
//! - Pin discipline and dirty write-back through the pool
//! - Randomized workloads checked against `BTreeMap`
//! - Persistence across reopen, in memory and on disk

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tempfile::tempdir;

use kestrel_buffer::{FetchMode, MemoryPageFile, PageCache};
use kestrel_common::{IndexConfig, KestrelError, PageId, PoolKind, StorageConfig};
use kestrel_storage::btree::{Node, NodeKind};
use kestrel_storage::{BTreeIndex, Direction, PageStore, Storage, U64Codec};
use parking_lot::Mutex;

const PAGE: usize = 512;

// =============================================================================
// Test Infrastructure
// =============================================================================

fn test_config(pool_pages: usize) -> StorageConfig {
    StorageConfig {
        page_size: PAGE,
        buffer_pool_pages: pool_pages,
        fsync_enabled: false,
        ..Default::default()
    }
}

/// Page store wrapper that records allocations and frees.
struct CountingStore {
    inner: Storage,
    allocated: AtomicUsize,
    freed: Mutex<Vec<PageId>>,
}

impl CountingStore {
    fn new(pool_pages: usize) -> Arc<Self> {
        let inner =
            Storage::open_with_file(test_config(pool_pages), Arc::new(MemoryPageFile::new()))
                .unwrap();
        Arc::new(Self {
            inner,
            allocated: AtomicUsize::new(0),
            freed: Mutex::new(Vec::new()),
        })
    }

    fn take_freed(&self) -> Vec<PageId> {
        std::mem::take(&mut *self.freed.lock())
    }
}

impl PageStore for CountingStore {
    fn cache(&self) -> &dyn PageCache {
        self.inner.cache()
    }

    fn allocate_page(&self) -> kestrel_common::Result<PageId> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.inner.allocate_page()
    }

    fn free_page(&self, page_id: PageId) -> kestrel_common::Result<()> {
        self.freed.lock().push(page_id);
        self.inner.free_page(page_id)
    }
}

/// Reads the kind, keys and children of a node.
fn read_node(
    store: &CountingStore,
    index: &BTreeIndex<U64Codec>,
    page_id: PageId,
) -> (NodeKind, Vec<u64>, Vec<PageId>) {
    let page = store.cache().fetch_for_read(page_id).unwrap();
    let data = page.data();
    let node = Node::new(&data[..], *index.layout());
    let kind = node.kind().unwrap();
    let keys = (0..node.count())
        .map(|i| u64::from_be_bytes(node.key(i).try_into().unwrap()))
        .collect();
    let children = match kind {
        NodeKind::Internal => (0..=node.count()).map(|i| node.child(i)).collect(),
        NodeKind::Leaf => Vec::new(),
    };
    (kind, keys, children)
}

fn keys_of(index: &BTreeIndex<U64Codec>) -> Vec<u64> {
    index.iter().map(|e| e.unwrap().key).collect()
}

// =============================================================================
// Split / Merge Shapes
// =============================================================================

#[test]
fn test_split_shape_max_four() {
    let store = CountingStore::new(16);
    let index = BTreeIndex::create(
        store.clone(),
        U64Codec,
        IndexConfig::default().with_max_items(4),
    )
    .unwrap();
    assert_eq!(index.layout().max_items, 4);
    assert_eq!(index.layout().min_items, 1);

    for k in [10u64, 20, 30, 40] {
        index.insert(&k, k).unwrap();
    }
    assert_eq!(index.height(), 1);

    index.insert(&50, 50).unwrap();
    assert_eq!(index.height(), 2);

    let (kind, seps, children) = read_node(&store, &index, index.root());
    assert_eq!(kind, NodeKind::Internal);
    assert_eq!(seps, vec![30]);
    assert_eq!(children.len(), 2);

    let (lk, left, _) = read_node(&store, &index, children[0]);
    let (rk, right, _) = read_node(&store, &index, children[1]);
    assert_eq!((lk, rk), (NodeKind::Leaf, NodeKind::Leaf));
    assert_eq!(left, vec![10, 20]);
    assert_eq!(right, vec![30, 40, 50]);
    index.verify().unwrap();
}

#[test]
fn test_underflow_collapse_frees_exact_pages() {
    let store = CountingStore::new(16);
    let index = BTreeIndex::create(
        store.clone(),
        U64Codec,
        IndexConfig::default().with_max_items(4),
    )
    .unwrap();
    for k in [10u64, 20, 30, 40, 50] {
        index.insert(&k, k).unwrap();
    }
    let old_root = index.root();
    let (_, _, children) = read_node(&store, &index, old_root);
    assert!(store.take_freed().is_empty());

    // Left leaf keeps one key: still at the minimum.
    index.remove(&10, None).unwrap();
    assert!(store.take_freed().is_empty());
    assert_eq!(index.height(), 2);

    // Left leaf empties: merge with the right sibling, root collapses.
    index.remove(&20, None).unwrap();
    let mut freed = store.take_freed();
    freed.sort();
    let mut expected = vec![children[1], old_root];
    expected.sort();
    assert_eq!(freed, expected);

    assert_eq!(index.height(), 1);
    assert_eq!(index.root(), children[0]);
    assert_eq!(keys_of(&index), vec![30, 40, 50]);

    // Emptying the root leaf frees it and empties the tree.
    for k in [30u64, 40, 50] {
        index.remove(&k, None).unwrap();
    }
    assert_eq!(store.take_freed(), vec![children[0]]);
    assert!(index.root().is_null());
    assert_eq!(index.height(), 0);
    index.verify().unwrap();
}

#[test]
fn test_rebalance_frees_nothing() {
    let store = CountingStore::new(16);
    let index = BTreeIndex::create(
        store.clone(),
        U64Codec,
        IndexConfig::default().with_max_items(6),
    )
    .unwrap();
    assert_eq!(index.layout().min_items, 2);

    // Left {10, 20, 30}, right {40, 50, 60, 70}; then fill the right leaf.
    for k in [10u64, 20, 30, 40, 50, 60, 70, 80, 90] {
        index.insert(&k, k).unwrap();
    }
    index.remove(&10, None).unwrap();
    index.remove(&20, None).unwrap();

    // 1 + 6 > 6: three items move left, no page is freed.
    assert!(store.take_freed().is_empty());
    let (_, seps, children) = read_node(&store, &index, index.root());
    assert_eq!(seps, vec![70]);
    assert_eq!(read_node(&store, &index, children[0]).1, vec![30, 40, 50, 60]);
    assert_eq!(read_node(&store, &index, children[1]).1, vec![70, 80, 90]);
    index.verify().unwrap();
}

#[test]
fn test_split_merge_inverse() {
    let store = CountingStore::new(32);
    let index = BTreeIndex::create(
        store.clone(),
        U64Codec,
        IndexConfig::default().with_max_items(4),
    )
    .unwrap();

    for k in 0..500u64 {
        index.insert(&k, k).unwrap();
    }
    let allocated = store.allocated.load(Ordering::Relaxed);
    for k in 0..500u64 {
        assert_eq!(index.remove(&k, None).unwrap(), k);
    }

    // Every tree page allocated (all but the descriptor) came back.
    assert_eq!(store.take_freed().len(), allocated - 1);
    assert!(index.is_empty());
    index.verify().unwrap();
}

// =============================================================================
// Buffer Pool Interaction
// =============================================================================

#[test]
fn test_pin_discipline() {
    let storage = Storage::open_with_file(test_config(8), Arc::new(MemoryPageFile::new())).unwrap();
    let page_id = storage.allocate_page().unwrap();

    let cache = storage.cache();
    let a = cache.fetch(page_id, FetchMode::Fresh).unwrap();
    let b = cache.fetch_for_read(page_id).unwrap();
    assert_eq!(a.frame_id(), b.frame_id());
    assert_eq!(a.pin_count(), 2);
    assert_eq!(storage.stats().pinned_frames, 1);

    cache.release(a).unwrap();
    assert_eq!(b.pin_count(), 1);
    cache.release(b).unwrap();
    assert_eq!(storage.stats().pinned_frames, 0);

    // The frame is evictable now: touching more pages than frames succeeds.
    for _ in 0..16 {
        let p = storage.allocate_page().unwrap();
        cache.fetch(p, FetchMode::Fresh).unwrap().release().unwrap();
    }
    assert!(storage.stats().evictions > 0);
}

#[test]
fn test_index_operations_leave_nothing_pinned() {
    let storage = Arc::new(
        Storage::open_with_file(test_config(8), Arc::new(MemoryPageFile::new())).unwrap(),
    );
    let index = BTreeIndex::create(
        storage.clone(),
        U64Codec,
        IndexConfig::default().with_max_items(6),
    )
    .unwrap();

    for k in 0..300u64 {
        index.insert(&k, k).unwrap();
    }
    assert_eq!(storage.stats().pinned_frames, 0);

    let _ = index.cursor(100..200, Direction::Descending).unwrap().count();
    for k in (0..300u64).step_by(3) {
        index.remove(&k, None).unwrap();
    }
    assert!(index.find(&3).is_err());
    assert_eq!(storage.stats().pinned_frames, 0);
    index.verify().unwrap();
}

#[test]
fn test_dirty_write_back_and_reopen() {
    let file = Arc::new(MemoryPageFile::new());
    let meta = {
        let storage =
            Arc::new(Storage::open_with_file(test_config(8), file.clone()).unwrap());
        let index = BTreeIndex::create(
            storage.clone(),
            U64Codec,
            IndexConfig::non_unique().with_max_items(8),
        )
        .unwrap();
        for k in 0..400u64 {
            index.insert(&(k % 50), k).unwrap();
        }
        storage.set_root(0, index.meta_page()).unwrap();

        let written = storage.flush().unwrap();
        assert!(written > 0);
        assert_eq!(storage.stats().dirty_frames, 0);
        index.meta_page()
    };

    let storage = Arc::new(Storage::open_with_file(test_config(8), file).unwrap());
    assert_eq!(storage.root(0).unwrap(), meta);
    let index = BTreeIndex::open(storage.clone(), U64Codec, meta).unwrap();
    assert_eq!(index.len(), 400);
    assert_eq!(index.find_all(&7).unwrap(), (0..8).map(|i| 7 + i * 50).collect::<Vec<_>>());
    index.verify().unwrap();
}

#[test]
fn test_growable_pool_backed_index() {
    let config = StorageConfig {
        pool_kind: PoolKind::Growable,
        buffer_pool_pages: 4,
        ..test_config(4)
    };
    let storage = Arc::new(Storage::open_with_file(config, Arc::new(MemoryPageFile::new())).unwrap());
    let index = BTreeIndex::create(storage.clone(), U64Codec, IndexConfig::default()).unwrap();

    let start = Instant::now();
    for k in 0..5_000u64 {
        index.insert(&k.wrapping_mul(0x9E37_79B9_7F4A_7C15), k).unwrap();
    }
    println!("growable pool: 5000 inserts in {:?}", start.elapsed());

    assert_eq!(index.len(), 5_000);
    assert_eq!(storage.stats().evictions, 0);
    index.verify().unwrap();
}

// =============================================================================
// Randomized Workloads
// =============================================================================

#[test]
fn test_random_unique_against_btreemap() {
    let storage = Arc::new(
        Storage::open_with_file(test_config(12), Arc::new(MemoryPageFile::new())).unwrap(),
    );
    let index = BTreeIndex::create(
        storage.clone(),
        U64Codec,
        IndexConfig::default().with_max_items(5),
    )
    .unwrap();
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    for step in 0..4_000 {
        let key = rng.gen_range(0..600u64);
        let id = rng.gen::<u64>();
        if rng.gen_bool(0.6) {
            let result = index.insert(&key, id);
            if model.contains_key(&key) {
                assert!(matches!(result, Err(KestrelError::DuplicateKey { .. })));
            } else {
                result.unwrap();
                model.insert(key, id);
            }
        } else {
            match model.remove(&key) {
                Some(expected) => assert_eq!(index.remove(&key, None).unwrap(), expected),
                None => assert!(matches!(
                    index.remove(&key, None),
                    Err(KestrelError::KeyNotFound { .. })
                )),
            }
        }
        if step % 500 == 0 {
            index.verify().unwrap();
        }
    }

    index.verify().unwrap();
    assert_eq!(index.len(), model.len() as u64);
    let entries: Vec<(u64, u64)> = index
        .iter()
        .map(|e| e.map(|e| (e.key, e.entry_id)))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries, model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>());

    for _ in 0..50 {
        let a = rng.gen_range(0..600u64);
        let b = rng.gen_range(a..=600u64);
        let expected: Vec<u64> = model.range(a..b).map(|(k, _)| *k).collect();
        let asc: Vec<u64> = index
            .cursor(a..b, Direction::Ascending)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(asc, expected);

        let desc: Vec<u64> = index
            .cursor(a..b, Direction::Descending)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(desc, expected.into_iter().rev().collect::<Vec<_>>());
    }
    assert_eq!(storage.stats().pinned_frames, 0);
}

#[test]
fn test_random_duplicates_against_model() {
    let storage = Arc::new(
        Storage::open_with_file(test_config(12), Arc::new(MemoryPageFile::new())).unwrap(),
    );
    let index = BTreeIndex::create(
        storage,
        U64Codec,
        IndexConfig::non_unique().with_max_items(4),
    )
    .unwrap();
    let mut model: BTreeSet<(u64, u64)> = BTreeSet::new();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..3_000 {
        let key = rng.gen_range(0..40u64);
        let id = rng.gen_range(0..100u64);
        if rng.gen_bool(0.55) {
            let result = index.insert(&key, id);
            if model.insert((key, id)) {
                result.unwrap();
            } else {
                assert!(matches!(result, Err(KestrelError::DuplicateKey { .. })));
            }
        } else if model.remove(&(key, id)) {
            assert_eq!(index.remove(&key, Some(id)).unwrap(), id);
        } else {
            assert!(index.remove(&key, Some(id)).is_err());
        }
    }

    index.verify().unwrap();
    for key in 0..40u64 {
        let expected: Vec<u64> = model
            .range((key, 0)..=(key, u64::MAX))
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(index.find_all(&key).unwrap(), expected);
    }
}

// =============================================================================
// Fail-Fast Iteration
// =============================================================================

#[test]
fn test_cursor_fails_after_remove() {
    let storage = Arc::new(
        Storage::open_with_file(test_config(16), Arc::new(MemoryPageFile::new())).unwrap(),
    );
    let index = BTreeIndex::create(storage, U64Codec, IndexConfig::default()).unwrap();
    for k in 0..20u64 {
        index.insert(&k, k).unwrap();
    }

    let mut cursor = index.cursor(.., Direction::Descending).unwrap();
    assert_eq!(cursor.next().unwrap().unwrap().key, 19);
    assert_eq!(cursor.next().unwrap().unwrap().key, 18);

    index.remove(&5, None).unwrap();
    match cursor.next() {
        Some(Err(KestrelError::ConcurrentModification { expected, actual })) => {
            assert!(actual > expected)
        }
        other => panic!("expected concurrent modification, got {:?}", other),
    }
    assert!(cursor.next().is_none());
    assert!(cursor.next().is_none());
}

// =============================================================================
// On-Disk Persistence
// =============================================================================

#[test]
fn test_on_disk_reopen() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        path: dir.path().join("index.kdb"),
        ..test_config(16)
    };

    let meta = {
        let storage = Arc::new(Storage::open(config.clone()).unwrap());
        let index = BTreeIndex::create(storage.clone(), U64Codec, IndexConfig::default()).unwrap();
        for k in 0..1_000u64 {
            index.insert(&(k * 3), k).unwrap();
        }
        for k in (0..1_000u64).step_by(2) {
            index.remove(&(k * 3), None).unwrap();
        }
        storage.set_root(2, index.meta_page()).unwrap();
        index.meta_page()
        // Storage is flushed when the last handle drops.
    };

    let storage = Arc::new(Storage::open(config).unwrap());
    let meta_page = storage.root(2).unwrap();
    assert_eq!(meta_page, meta);
    let index = BTreeIndex::open(storage.clone(), U64Codec, meta_page).unwrap();
    assert_eq!(index.len(), 500);
    assert_eq!(index.find(&3).unwrap(), 1);
    assert!(index.find(&0).is_err());
    index.verify().unwrap();
}
