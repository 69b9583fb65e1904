//! Key-order index
//!
//! A probabilistic multi-level ordered list over arena-allocated nodes,
//! keyed by encoded internal keys. One writer, externally serialized; any
//! number of readers proceed without locks.
//!
//! Invariants:
//! - Nodes are never freed until the list (and its arena) is dropped.
//! - A node's entry pointer and billed size are immutable once the node is
//!   published; only links change afterwards.
//! - The level-0 splice that makes a node reader-visible is a release
//!   store; readers load links with acquire, so they always observe a fully
//!   initialized node.
//! - `max_height` is read relaxed: a stale low value just skips empty upper
//!   levels, a fresh value races only against nil head links.
//!
//! After `rewrite_level0` the upper levels are stale; the list is switched
//! into level-0-only mode and every descent starts at the bottom.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::arena::Arena;
use super::comparator::{InternalKeyComparator, KeyComparator};
use super::entry;
use super::fifo::FifoOverlay;

/// Maximum node height
pub(crate) const MAX_HEIGHT: usize = 12;

/// A node is promoted one level with probability 1/BRANCHING
const BRANCHING: u32 = 4;

/// Fixed seed for the height draw, so list shapes reproduce across runs
const HEIGHT_RNG_SEED: u64 = 0xdead_beef;

/// An index node: fixed header plus a tower of `height` level links.
///
/// The tower is laid out inline past the header (the declared array holds
/// only level 0); allocation reserves `height - 1` extra slots. Nodes are
/// plain old data: nothing here runs a destructor, so dropping the arena
/// reclaims everything.
#[repr(C)]
pub(crate) struct Node {
    /// Encoded entry record in the arena
    entry: *const u8,
    /// Entry bytes plus this node's header and tower
    billed_size: usize,
    /// Insertion-order links (writer-only, see the overlay)
    fifo_prev: AtomicPtr<Node>,
    fifo_next: AtomicPtr<Node>,
    /// Level links; `tower[0]` is the bottom level. Do not index past 0
    /// except through `level()`.
    tower: [AtomicPtr<Node>; 1],
}

impl Node {
    pub(crate) fn entry(&self) -> *const u8 {
        self.entry
    }

    pub(crate) fn billed_size(&self) -> usize {
        self.billed_size
    }

    /// Internal key of this node's entry.
    ///
    /// # Safety
    /// The node must carry an entry (the head does not); the caller chooses
    /// a lifetime no longer than the owning arena's.
    pub(crate) unsafe fn key<'a>(&self) -> &'a [u8] {
        debug_assert!(!self.entry.is_null());
        entry::length_prefixed_slice(self.entry)
    }

    /// # Safety
    /// `n` must be below the height this node was allocated with.
    unsafe fn level(&self, n: usize) -> &AtomicPtr<Node> {
        debug_assert!(n < MAX_HEIGHT);
        &*self.tower.as_ptr().add(n)
    }

    pub(crate) unsafe fn next(&self, n: usize) -> *mut Node {
        self.level(n).load(Acquire)
    }

    pub(crate) unsafe fn set_next(&self, n: usize, x: *mut Node) {
        self.level(n).store(x, Release)
    }

    pub(crate) unsafe fn next_relaxed(&self, n: usize) -> *mut Node {
        self.level(n).load(Relaxed)
    }

    pub(crate) unsafe fn set_next_relaxed(&self, n: usize, x: *mut Node) {
        self.level(n).store(x, Relaxed)
    }

    // Insertion-order links. Only the single writer touches these; relaxed
    // atomics keep the type Sync without pretending the overlay supports
    // concurrent readers (it does not).

    pub(crate) fn fifo_next(&self) -> *mut Node {
        self.fifo_next.load(Relaxed)
    }

    pub(crate) fn set_fifo_next(&self, x: *mut Node) {
        self.fifo_next.store(x, Relaxed)
    }

    pub(crate) fn fifo_prev(&self) -> *mut Node {
        self.fifo_prev.load(Relaxed)
    }

    pub(crate) fn set_fifo_prev(&self, x: *mut Node) {
        self.fifo_prev.store(x, Relaxed)
    }
}

/// Single-writer, multi-reader skiplist with the FIFO overlay threaded
/// through its nodes.
pub(crate) struct SkipList<C: KeyComparator> {
    cmp: InternalKeyComparator<C>,
    arena: Arc<Arena>,
    /// Sentinel of maximal height; never carries an entry
    head: *mut Node,
    /// Height of the tallest published node
    max_height: AtomicUsize,
    /// Set after a level-0 rewrite: upper levels are stale, descend at 0
    level0_only: AtomicBool,
    /// Height draw; only the writer takes this lock
    rng: Mutex<SmallRng>,
    fifo: FifoOverlay,
}

// SAFETY: all reader-visible links are atomics published with release
// stores; the raw head pointer targets arena memory owned by this value.
// Mutation is restricted to a single externally-serialized writer.
unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub(crate) fn new(user_cmp: C, arena: Arc<Arena>, hot_threshold_bytes: usize) -> Self {
        let head = unsafe { Self::alloc_node(&arena, ptr::null(), MAX_HEIGHT, 0) };
        Self {
            cmp: InternalKeyComparator::new(user_cmp),
            arena,
            head,
            max_height: AtomicUsize::new(1),
            level0_only: AtomicBool::new(false),
            rng: Mutex::new(SmallRng::seed_from_u64(HEIGHT_RNG_SEED)),
            fifo: FifoOverlay::new(hot_threshold_bytes),
        }
    }

    pub(crate) fn comparator(&self) -> &InternalKeyComparator<C> {
        &self.cmp
    }

    pub(crate) fn fifo(&self) -> &FifoOverlay {
        &self.fifo
    }

    pub(crate) fn iter(&self) -> ListIter<'_, C> {
        ListIter {
            list: self,
            node: ptr::null_mut(),
        }
    }

    // -------------------------------------------------------------------------
    // Mutation (writer only)
    // -------------------------------------------------------------------------

    /// Insert the encoded entry at `buf` (`encoded_len` bytes).
    ///
    /// Requires that no equal internal key is present, guaranteed by
    /// unique sequence numbers upstream.
    pub(crate) fn insert(&self, buf: *const u8, encoded_len: usize) {
        unsafe {
            let key = entry::length_prefixed_slice(buf);
            let mut prev = [ptr::null_mut(); MAX_HEIGHT];
            let found = self.find_ge(key, Some(&mut prev));
            debug_assert!(
                found.is_null() || self.cmp.compare((*found).key(), key) != Ordering::Equal,
                "duplicate internal key inserted"
            );

            let height = self.random_height();
            let current = self.max_height.load(Relaxed);
            if height > current {
                for slot in prev.iter_mut().take(height).skip(current) {
                    *slot = self.head;
                }
                // Racy readers see either the old nil head links (and drop
                // a level) or the links published below.
                self.max_height.store(height, Relaxed);
            }

            let node = Self::alloc_node(&self.arena, buf, height, encoded_len);
            for (i, &p) in prev.iter().enumerate().take(height) {
                // Relaxed init of the node's own link suffices; the release
                // store into prev publishes the fully built node.
                (*node).set_next_relaxed(i, (*p).next_relaxed(i));
                (*p).set_next(i, node);
            }

            self.fifo.insert(node);
        }
    }

    /// Unlink a superseded node from every level and hand it to the
    /// overlay's retirement list. The node's own links are left intact so
    /// readers already past it keep a valid path forward.
    pub(crate) fn retire(&self, node: *mut Node, from_hot: bool) {
        unsafe {
            let key = (*node).key();
            let mut prev = [ptr::null_mut(); MAX_HEIGHT];
            let found = self.find_ge(key, Some(&mut prev));
            debug_assert_eq!(found, node, "retired node must still be linked");

            let height = self.max_height.load(Relaxed);
            for (i, &p) in prev.iter().enumerate().take(height) {
                if (*p).next_relaxed(i) == node {
                    (*p).set_next(i, (*node).next_relaxed(i));
                }
            }

            self.fifo.retire(node, from_hot);
        }
    }

    /// Reseat the level-0 head link onto `node`. Upper levels are left
    /// stale; callers must follow up with [`restrict_to_level0`].
    pub(crate) fn set_head(&self, node: *mut Node) {
        unsafe { (*self.head).set_next(0, node) }
    }

    /// Sweep level 0 in key order and relink it so that only entries
    /// satisfying `keep` remain, and of consecutive entries sharing a user
    /// key only the first (the newest) survives.
    pub(crate) fn rewrite_level0(&self, keep: impl Fn(&[u8]) -> bool) {
        unsafe {
            let mut tail = self.head;
            let mut last_kept: Option<&[u8]> = None;
            let mut x = (*self.head).next_relaxed(0);
            while !x.is_null() {
                let next = (*x).next_relaxed(0);
                let key = (*x).key();
                let (user_key, _) = entry::split_internal_key(key);
                let duplicate = last_kept
                    .map_or(false, |prev| self.cmp.user.compare(prev, user_key) == Ordering::Equal);
                if keep(key) && !duplicate {
                    (*tail).set_next(0, x);
                    tail = x;
                    last_kept = Some(user_key);
                }
                x = next;
            }
            (*tail).set_next(0, ptr::null_mut());
        }
    }

    /// Force every subsequent descent to traverse level 0 only.
    pub(crate) fn restrict_to_level0(&self) {
        self.level0_only.store(true, Relaxed);
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// True iff an entry with exactly this internal key is present.
    #[allow(dead_code)]
    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        let x = self.find_ge(key, None);
        unsafe { !x.is_null() && self.cmp.compare((*x).key(), key) == Ordering::Equal }
    }

    /// Earliest node at or after `key`; null if none. When `prev` is given,
    /// fills it with the predecessor at every level of the descent.
    pub(crate) fn find_ge(&self, key: &[u8], mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>) -> *mut Node {
        unsafe {
            let mut x = self.head;
            let mut level = self.effective_max_height() - 1;
            loop {
                let next = (*x).next(level);
                if self.key_is_after_node(key, next) {
                    x = next;
                } else {
                    if let Some(prev) = prev.as_mut() {
                        prev[level] = x;
                    }
                    if level == 0 {
                        return next;
                    }
                    level -= 1;
                }
            }
        }
    }

    /// Latest node strictly before `key`; the head sentinel if none.
    fn find_lt(&self, key: &[u8]) -> *mut Node {
        unsafe {
            let mut x = self.head;
            let mut level = self.effective_max_height() - 1;
            loop {
                let next = (*x).next(level);
                if next.is_null() || self.cmp.compare((*next).key(), key) != Ordering::Less {
                    if level == 0 {
                        return x;
                    }
                    level -= 1;
                } else {
                    x = next;
                }
            }
        }
    }

    /// Last node in the list; the head sentinel if empty.
    fn find_last(&self) -> *mut Node {
        unsafe {
            let mut x = self.head;
            let mut level = self.effective_max_height() - 1;
            loop {
                let next = (*x).next(level);
                if next.is_null() {
                    if level == 0 {
                        return x;
                    }
                    level -= 1;
                } else {
                    x = next;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn effective_max_height(&self) -> usize {
        if self.level0_only.load(Relaxed) {
            1
        } else {
            self.max_height.load(Relaxed)
        }
    }

    unsafe fn key_is_after_node(&self, key: &[u8], n: *mut Node) -> bool {
        // A null node sorts after every key.
        !n.is_null() && self.cmp.compare((*n).key(), key) == Ordering::Less
    }

    fn random_height(&self) -> usize {
        let mut rng = self.rng.lock();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    unsafe fn alloc_node(arena: &Arena, entry: *const u8, height: usize, entry_len: usize) -> *mut Node {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let node_bytes =
            std::mem::size_of::<Node>() + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let node = arena.allocate_aligned(node_bytes) as *mut Node;
        (*node).entry = entry;
        (*node).billed_size = entry_len + node_bytes;
        (*node).fifo_prev = AtomicPtr::new(ptr::null_mut());
        (*node).fifo_next = AtomicPtr::new(ptr::null_mut());
        for i in 0..height {
            (*node).set_next_relaxed(i, ptr::null_mut());
        }
        node
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Forward iterator over the key-order index. Snapshots nothing; each read
/// reflects the links visible at that moment.
pub(crate) struct ListIter<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: KeyComparator> ListIter<'a, C> {
    pub(crate) fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub(crate) fn node(&self) -> *mut Node {
        self.node
    }

    pub(crate) fn entry(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).entry() }
    }

    /// Internal key at the current position.
    pub(crate) fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { (*self.node).key() }
    }

    /// Position at the earliest entry with internal key >= `target`.
    pub(crate) fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_ge(target, None);
    }

    pub(crate) fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub(crate) fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }

    pub(crate) fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Step back by searching for the last node before the current key;
    /// level 0 carries no backward links.
    pub(crate) fn prev(&mut self) {
        debug_assert!(self.valid());
        let node = self.list.find_lt(self.key());
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::comparator::BytewiseComparator;
    use crate::memtable::entry::{encode_entry_into, encoded_entry_len, split_internal_key, unpack_tag};
    use crate::memtable::OpType;

    fn make_list(hot_threshold: usize) -> SkipList<BytewiseComparator> {
        SkipList::new(BytewiseComparator, Arc::new(Arena::new(4096)), hot_threshold)
    }

    fn add(list: &SkipList<BytewiseComparator>, seq: u64, key: &[u8], value: &[u8]) {
        let len = encoded_entry_len(key.len(), value.len());
        let buf = list.arena.allocate(len);
        unsafe {
            let out = std::slice::from_raw_parts_mut(buf, len);
            encode_entry_into(out, seq, OpType::Put, key, value);
        }
        list.insert(buf, len);
    }

    fn collect_user_keys(list: &SkipList<BytewiseComparator>) -> Vec<Vec<u8>> {
        let mut iter = list.iter();
        let mut keys = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            keys.push(split_internal_key(iter.key()).0.to_vec());
            iter.next();
        }
        keys
    }

    #[test]
    fn test_insert_orders_by_user_key() {
        let list = make_list(1 << 20);
        add(&list, 100, b"cherry", b"3");
        add(&list, 101, b"apple", b"1");
        add(&list, 102, b"banana", b"2");

        assert_eq!(
            collect_user_keys(&list),
            vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]
        );
    }

    #[test]
    fn test_same_user_key_orders_newest_first() {
        let list = make_list(1 << 20);
        add(&list, 100, b"k", b"old");
        // Retire nothing here: drive the list directly, so both versions stay.
        add(&list, 200, b"k", b"new");

        let mut iter = list.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(unpack_tag(split_internal_key(iter.key()).1).0, 200);
        iter.next();
        assert!(iter.valid());
        assert_eq!(unpack_tag(split_internal_key(iter.key()).1).0, 100);
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_contains_exact_internal_key() {
        let list = make_list(1 << 20);
        add(&list, 100, b"k1", b"v1");

        let mut probe = b"k1".to_vec();
        probe.extend_from_slice(&crate::memtable::entry::pack_tag(100, OpType::Put).to_le_bytes());
        assert!(list.contains(&probe));

        let mut missing = b"k1".to_vec();
        missing.extend_from_slice(&crate::memtable::entry::pack_tag(101, OpType::Put).to_le_bytes());
        assert!(!list.contains(&missing));
    }

    #[test]
    fn test_seek_lands_on_first_ge() {
        let list = make_list(1 << 20);
        for (seq, key) in [(100u64, b"b"), (101, b"d"), (102, b"f")] {
            add(&list, seq, key, b"v");
        }

        let mut iter = list.iter();
        let mut target = b"c".to_vec();
        target.extend_from_slice(&crate::memtable::entry::pack_tag(u64::MAX >> 8, OpType::Put).to_le_bytes());
        iter.seek(&target);
        assert!(iter.valid());
        assert_eq!(split_internal_key(iter.key()).0, b"d");
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let list = make_list(1 << 20);
        add(&list, 100, b"a", b"1");
        add(&list, 101, b"b", b"2");
        add(&list, 102, b"c", b"3");

        let mut iter = list.iter();
        iter.seek_to_last();
        assert_eq!(split_internal_key(iter.key()).0, b"c");
        iter.prev();
        assert_eq!(split_internal_key(iter.key()).0, b"b");
        iter.prev();
        assert_eq!(split_internal_key(iter.key()).0, b"a");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_concurrent_readers_see_sorted_prefix() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let list = StdArc::new(make_list(1 << 20));
        for i in 0..512u64 {
            let key = format!("key{:04}", i * 7919 % 512);
            add(&list, 100 + i, key.as_bytes(), b"v");
        }

        let mut handles = vec![];
        for _ in 0..4 {
            let list = StdArc::clone(&list);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let keys = collect_user_keys(&list);
                    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
