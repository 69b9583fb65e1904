//! MemTable façade
//!
//! Ties the pieces together: encodes entries into the arena, drives the
//! key-order index and the FIFO overlay, detects superseded versions,
//! answers point lookups, and performs the hot/cold separation that ends a
//! table's write life.
//!
//! ## Lifecycle
//! **Active** → (first `separate` ) → **Separated** → (last `release`) →
//! dropped. A separated table rejects writes; the embedder swaps in a fresh
//! table built from `extract_hot`.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicIsize};
use std::sync::Arc;

use crate::config::MemTableConfig;
use crate::error::{EmberError, Result};

use super::arena::Arena;
use super::comparator::{compare_sequence, BytewiseComparator, InternalKeyComparator, KeyComparator};
use super::entry::{self, LookupKey};
use super::skiplist::{ListIter, Node, SkipList};
use super::{LookupResult, OpType, ParsedEntry};

/// The in-memory write buffer.
///
/// One writer at a time (externally serialized); any number of concurrent
/// readers through [`get`](MemTable::get) and the key-order iterator.
/// Overlay-facing calls (`fifo_iter`, `extract_hot`, `separate`) must run
/// while writes are quiesced.
pub struct MemTable<C: KeyComparator = BytewiseComparator> {
    arena: Arc<Arena>,
    list: SkipList<C>,
    refs: AtomicIsize,
    separated: AtomicBool,
    separate_had_cold: AtomicBool,
}

impl MemTable<BytewiseComparator> {
    /// New table with the default bytewise comparator.
    pub fn new(hot_threshold_bytes: usize) -> Self {
        Self::with_config(
            MemTableConfig::builder()
                .hot_threshold_bytes(hot_threshold_bytes)
                .build(),
        )
    }

    pub fn with_config(config: MemTableConfig) -> Self {
        Self::with_comparator(BytewiseComparator, config)
    }
}

impl<C: KeyComparator> MemTable<C> {
    pub fn with_comparator(user_cmp: C, config: MemTableConfig) -> Self {
        let arena = Arc::new(Arena::new(config.arena_block_size));
        let list = SkipList::new(user_cmp, Arc::clone(&arena), config.hot_threshold_bytes);
        Self {
            arena,
            list,
            refs: AtomicIsize::new(0),
            separated: AtomicBool::new(false),
            separate_had_cold: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Apply a sequenced mutation.
    ///
    /// Sequence numbers must be unique and monotonically increasing across
    /// calls. Rejected once the table is separated.
    pub fn add(&self, sequence: u64, op: OpType, user_key: &[u8], value: &[u8]) -> Result<()> {
        if self.separated.load(Acquire) {
            return Err(EmberError::Separated);
        }

        let encoded_len = entry::encoded_entry_len(user_key.len(), value.len());
        let buf = self.arena.allocate(encoded_len);
        unsafe {
            let out = std::slice::from_raw_parts_mut(buf, encoded_len);
            entry::encode_entry_into(out, sequence, op, user_key, value);
        }

        self.list.insert(buf, encoded_len);
        self.retire_superseded(buf, user_key);
        Ok(())
    }

    /// A just-inserted entry sorts immediately before the prior version of
    /// its user key (newest first within a key), so only the level-0
    /// successor can supersede. Route its retirement hot or cold by
    /// comparing sequence against the oldest-hot sentinel.
    fn retire_superseded(&self, buf: *const u8, user_key: &[u8]) {
        let mut iter = self.list.iter();
        iter.seek(unsafe { entry::length_prefixed_slice(buf) });
        debug_assert!(iter.valid(), "freshly inserted entry must be reachable");
        iter.next();
        if !iter.valid() {
            return;
        }

        let succ_key = iter.key();
        let (succ_user, _) = entry::split_internal_key(succ_key);
        if self.cmp().user.compare(succ_user, user_key) != Ordering::Equal {
            return;
        }

        let from_hot = match self.oldest_hot_key() {
            // No hot segment: every position is cold.
            None => false,
            Some(hot_key) => compare_sequence(succ_key, hot_key) != Ordering::Greater,
        };
        tracing::trace!(from_hot, "retiring superseded version");
        self.list.retire(iter.node(), from_hot);
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Look up `user_key` at `snapshot`: the newest version with sequence
    /// at or below the snapshot decides the outcome.
    pub fn get(&self, user_key: &[u8], snapshot: u64) -> LookupResult {
        let lookup = LookupKey::new(user_key, snapshot);
        let mut iter = self.list.iter();
        iter.seek(lookup.internal_key());
        if !iter.valid() {
            return LookupResult::NotFound;
        }

        let (found_user, tag) = entry::split_internal_key(iter.key());
        if self.cmp().user.compare(found_user, lookup.user_key()) != Ordering::Equal {
            return LookupResult::NotFound;
        }
        match OpType::from_tag(tag) {
            OpType::Put => LookupResult::Found(unsafe { entry::value_of(iter.entry()) }.to_vec()),
            OpType::Delete => LookupResult::Deleted,
        }
    }

    /// Iterator in internal-key order (user key ascending, newest first).
    pub fn iter(&self) -> MemTableIter<'_, C> {
        MemTableIter {
            inner: self.list.iter(),
        }
    }

    /// Iterator in insertion order over the overlay chain. Must not run
    /// concurrently with a writer.
    pub fn fifo_iter(&self) -> FifoIter<'_, C> {
        FifoIter {
            list: &self.list,
            node: ptr::null_mut(),
        }
    }

    // -------------------------------------------------------------------------
    // Flush support
    // -------------------------------------------------------------------------

    /// Decode every entry of the hot segment, oldest to newest, into `out`.
    ///
    /// Duplicate user keys are preserved in insertion order; re-inserting
    /// them in order into a fresh table keeps the newest by virtue of its
    /// higher sequence.
    pub fn extract_hot(&self, out: &mut Vec<ParsedEntry>) {
        let mut iter = self.fifo_iter();
        iter.seek_to_oldest_hot();
        let before = out.len();
        while iter.valid() {
            out.push(ParsedEntry {
                user_key: iter.user_key().to_vec(),
                sequence: iter.sequence(),
                op: iter.op(),
                value: iter.value().to_vec(),
            });
            iter.next();
        }
        tracing::debug!(entries = out.len() - before, "extracted hot working set");
    }

    /// Partition the table: reshape the key-order index to hold only the
    /// cold survivors (newest version per user key) and report whether any
    /// cold data remained to flush.
    ///
    /// The first call decides; repeated calls are no-ops returning the
    /// cached outcome. After a call the table rejects writes.
    pub fn separate(&self) -> bool {
        if self.separated.load(Acquire) {
            return self.separate_had_cold.load(Relaxed);
        }

        let had_cold = self.run_separation();

        self.separate_had_cold.store(had_cold, Relaxed);
        self.separated.store(true, Release);
        had_cold
    }

    fn run_separation(&self) -> bool {
        let hot_key = match self.oldest_hot_key() {
            None => {
                // No hot segment: the whole buffer is cold. Collapse the
                // index to the newest version per user key.
                self.list.rewrite_level0(|_| true);
                self.list.restrict_to_level0();
                tracing::debug!("separated with empty hot segment");
                return true;
            }
            Some(key) => key,
        };

        // Scan key order for the first entry older than the oldest-hot
        // sentinel; versions of one user key are adjacent, so skip by key.
        let mut iter = self.list.iter();
        iter.seek_to_first();
        let first_cold = loop {
            if !iter.valid() {
                return false;
            }
            if compare_sequence(iter.key(), hot_key) == Ordering::Greater {
                break iter.node();
            }
            if !skip_to_next_user_key(&mut iter, self.cmp()) {
                return false;
            }
        };

        self.list.set_head(first_cold);
        self.list
            .rewrite_level0(|key| compare_sequence(key, hot_key) == Ordering::Greater);
        // The rewrite touched level 0 only; upper levels are stale now.
        self.list.restrict_to_level0();
        tracing::debug!(
            hot_bytes = self.hot_memory_usage(),
            cold_bytes = self.cold_memory_usage(),
            "separated cold survivors into the index"
        );
        true
    }

    /// Total bytes the arena has handed out.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    pub fn hot_memory_usage(&self) -> usize {
        self.list.fifo().hot_memory_usage()
    }

    pub fn cold_memory_usage(&self) -> usize {
        self.list.fifo().cold_memory_usage()
    }

    pub fn retired_memory_usage(&self) -> usize {
        self.list.fifo().retired_memory_usage()
    }

    pub fn is_separated(&self) -> bool {
        self.separated.load(Acquire)
    }

    // -------------------------------------------------------------------------
    // Lifetime
    // -------------------------------------------------------------------------

    /// Take a reference on the table.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Relaxed);
    }

    /// Drop a reference. Returns true when this released the last one and
    /// the caller should drop the table.
    #[must_use = "true means the last reference is gone; drop the table"]
    pub fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, AcqRel);
        debug_assert!(prev > 0, "release without matching retain");
        prev == 1
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn cmp(&self) -> &InternalKeyComparator<C> {
        self.list.comparator()
    }

    fn oldest_hot_key(&self) -> Option<&[u8]> {
        let hot = self.list.fifo().oldest_hot();
        if hot.is_null() {
            None
        } else {
            Some(unsafe { (*hot).key() })
        }
    }
}

impl<C: KeyComparator> Drop for MemTable<C> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.refs.load(Relaxed),
            0,
            "memtable dropped with live references"
        );
    }
}

/// Advance past every remaining version of the current user key. Returns
/// false when the list is exhausted.
fn skip_to_next_user_key<C: KeyComparator>(
    iter: &mut ListIter<'_, C>,
    cmp: &InternalKeyComparator<C>,
) -> bool {
    debug_assert!(iter.valid());
    let (current_user, _) = entry::split_internal_key(iter.key());
    loop {
        iter.next();
        if !iter.valid() {
            return false;
        }
        let (user, _) = entry::split_internal_key(iter.key());
        if cmp.user.compare(user, current_user) != Ordering::Equal {
            return true;
        }
    }
}

// =============================================================================
// Iterators
// =============================================================================

/// Read-only view in internal-key order. Borrowed slices stay valid until
/// the table is dropped; positions reflect links as currently published.
pub struct MemTableIter<'a, C: KeyComparator = BytewiseComparator> {
    inner: ListIter<'a, C>,
}

impl<'a, C: KeyComparator> MemTableIter<'a, C> {
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    /// Position at the earliest entry for `user_key` visible at `sequence`.
    pub fn seek(&mut self, user_key: &[u8], sequence: u64) {
        let lookup = LookupKey::new(user_key, sequence);
        self.inner.seek(lookup.internal_key());
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    pub fn next(&mut self) {
        self.inner.next();
    }

    pub fn prev(&mut self) {
        self.inner.prev();
    }

    /// The internal key (`user_key || tag`) at the current position.
    pub fn key(&self) -> &'a [u8] {
        self.inner.key()
    }

    pub fn user_key(&self) -> &'a [u8] {
        entry::split_internal_key(self.inner.key()).0
    }

    pub fn sequence(&self) -> u64 {
        entry::unpack_tag(entry::split_internal_key(self.inner.key()).1).0
    }

    pub fn op(&self) -> OpType {
        OpType::from_tag(entry::split_internal_key(self.inner.key()).1)
    }

    pub fn value(&self) -> &'a [u8] {
        unsafe { entry::value_of(self.inner.entry()) }
    }
}

/// Read-only view in insertion order, over the overlay chain. Single
/// threaded with respect to the writer.
pub struct FifoIter<'a, C: KeyComparator = BytewiseComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: KeyComparator> FifoIter<'a, C> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Position at the oldest live node (front of the cold prefix when one
    /// exists, else the oldest hot node).
    pub fn seek_to_first(&mut self) {
        let fifo = self.list.fifo();
        let cold = fifo.oldest_cold();
        self.node = if cold.is_null() { fifo.oldest_hot() } else { cold };
    }

    pub fn seek_to_last(&mut self) {
        self.node = self.list.fifo().newest();
    }

    /// Position at the hot/cold boundary; invalid if the hot segment is
    /// empty.
    pub fn seek_to_oldest_hot(&mut self) {
        self.node = self.list.fifo().oldest_hot();
    }

    /// Key-order seek (shared descent with the index), kept for parity with
    /// the key-order iterator.
    pub fn seek(&mut self, user_key: &[u8], sequence: u64) {
        let lookup = LookupKey::new(user_key, sequence);
        self.node = self.list.find_ge(lookup.internal_key(), None);
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).fifo_next() };
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).fifo_prev() };
    }

    /// The internal key at the current position.
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { (*self.node).key() }
    }

    pub fn user_key(&self) -> &'a [u8] {
        entry::split_internal_key(self.key()).0
    }

    pub fn sequence(&self) -> u64 {
        entry::unpack_tag(entry::split_internal_key(self.key()).1).0
    }

    pub fn op(&self) -> OpType {
        OpType::from_tag(entry::split_internal_key(self.key()).1)
    }

    pub fn value(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { entry::value_of((*self.node).entry()) }
    }
}

// =============================================================================
// Tests (internal invariants that need crate visibility)
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Sum of billed sizes over the live overlay chain.
    fn live_bytes(table: &MemTable) -> usize {
        let fifo = table.list.fifo();
        let mut node = if fifo.oldest_cold().is_null() {
            fifo.oldest_hot()
        } else {
            fifo.oldest_cold()
        };
        let mut total = 0;
        while !node.is_null() {
            unsafe {
                total += (*node).billed_size();
                node = (*node).fifo_next();
            }
        }
        total
    }

    /// Sum of billed sizes over the retirement list.
    fn retired_bytes_by_walk(table: &MemTable) -> usize {
        let mut node = table.list.fifo().retired_head();
        let mut total = 0;
        while !node.is_null() {
            unsafe {
                total += (*node).billed_size();
                node = (*node).fifo_next();
            }
        }
        total
    }

    #[test]
    fn test_counters_match_chain_walks() {
        let table = MemTable::new(300);
        for pass in 0..3u64 {
            for i in 0..20u64 {
                let key = format!("k{}", i);
                let value = format!("v{}-{}", i, pass);
                table
                    .add(100 + pass * 20 + i, OpType::Put, key.as_bytes(), value.as_bytes())
                    .unwrap();

                // Region counters always equal a fresh walk of each list.
                assert_eq!(
                    table.hot_memory_usage() + table.cold_memory_usage(),
                    live_bytes(&table)
                );
                assert_eq!(table.retired_memory_usage(), retired_bytes_by_walk(&table));
            }
        }
        // Every byte ever billed is in exactly one bucket.
        assert_eq!(
            table.hot_memory_usage() + table.cold_memory_usage() + table.retired_memory_usage(),
            live_bytes(&table) + retired_bytes_by_walk(&table)
        );
    }

    #[test]
    fn test_hot_usage_bounded_by_threshold() {
        let threshold = 300;
        let table = MemTable::new(threshold);
        for i in 0..200u64 {
            let key = format!("key{:03}", i % 37);
            table.add(100 + i, OpType::Put, key.as_bytes(), b"value").unwrap();
            assert!(table.hot_memory_usage() <= threshold);
        }
    }

    #[test]
    fn test_supersede_leaves_single_live_version() {
        let table = MemTable::new(1 << 20);
        table.add(100, OpType::Put, b"k", b"v1").unwrap();
        table.add(101, OpType::Put, b"k", b"v2").unwrap();
        table.add(102, OpType::Put, b"k", b"v3").unwrap();

        let mut iter = table.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.user_key(), b"k");
        assert_eq!(iter.sequence(), 102);
        assert_eq!(iter.value(), b"v3");
        iter.next();
        assert!(!iter.valid(), "superseded versions must leave the index");

        assert!(table.retired_memory_usage() > 0);
    }

    #[test]
    fn test_oversized_entry_classified_cold() {
        let table = MemTable::new(100);
        let big = vec![0xEE; 400];
        table.add(100, OpType::Put, b"huge", &big).unwrap();

        assert_eq!(table.hot_memory_usage(), 0);
        assert!(table.cold_memory_usage() > 400);
        assert!(table.list.fifo().oldest_hot().is_null());
        assert!(!table.list.fifo().oldest_cold().is_null());
    }

    #[test]
    fn test_oversized_entry_drains_hot_segment() {
        let table = MemTable::new(300);
        table.add(100, OpType::Put, b"a", b"small").unwrap();
        table.add(101, OpType::Put, b"b", b"small").unwrap();
        assert!(table.hot_memory_usage() > 0);

        let big = vec![0xEE; 400];
        table.add(102, OpType::Put, b"huge", &big).unwrap();

        // Pre-check drained the hot suffix; the oversized node landed cold.
        assert_eq!(table.hot_memory_usage(), 0);
        assert!(table.list.fifo().oldest_hot().is_null());
    }

    #[test]
    fn test_hot_segment_reopens_after_drain() {
        let table = MemTable::new(300);
        let big = vec![0xEE; 400];
        table.add(100, OpType::Put, b"huge", &big).unwrap();
        assert!(table.list.fifo().oldest_hot().is_null());

        table.add(101, OpType::Put, b"tiny", b"v").unwrap();
        let hot = table.list.fifo().oldest_hot();
        assert!(!hot.is_null());
        assert_eq!(unsafe { entry::split_internal_key((*hot).key()).0 }, b"tiny");
    }

    #[test]
    fn test_retire_superseded_oldest_hot_advances_boundary() {
        let table = MemTable::new(1 << 20);
        table.add(100, OpType::Put, b"a", b"v1").unwrap();
        table.add(101, OpType::Put, b"b", b"v").unwrap();
        // "a" is the oldest hot node; superseding it must advance the
        // boundary to "b" and bill the retirement against the hot region.
        table.add(102, OpType::Put, b"a", b"v2").unwrap();

        let hot = table.list.fifo().oldest_hot();
        assert!(!hot.is_null());
        assert_eq!(unsafe { entry::split_internal_key((*hot).key()).0 }, b"b");
        assert_eq!(
            table.hot_memory_usage() + table.cold_memory_usage(),
            live_bytes(&table)
        );
    }
}
