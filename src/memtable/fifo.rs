//! FIFO insertion-order overlay
//!
//! A doubly-linked chain threaded through the index nodes in insertion
//! order, split into a cold prefix and a hot suffix:
//!
//! ```text
//!  oldest_cold ──▶ ... cold ... ──▶ oldest_hot ──▶ ... hot ... ──▶ newest
//!  └── unbounded, flushed later ──┘ └── bounded by hot_threshold_bytes ──┘
//! ```
//!
//! Only `hot_bytes` is capacity-bounded; appending a node that would
//! overflow it rolls the boundary forward, demoting the oldest hot nodes.
//! Superseded nodes leave the chain for the retirement list and keep their
//! memory (readers may still be parked on them).
//!
//! The overlay is writer-only state: it offers no reader/writer
//! concurrency, and the embedder schedules extraction and separation while
//! writes are quiesced.

use std::ptr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use super::skiplist::Node;

pub(crate) struct FifoOverlay {
    /// Front of the chain whenever a cold prefix exists
    oldest_cold: AtomicPtr<Node>,
    /// Boundary: first node of the hot suffix; null means no hot segment
    oldest_hot: AtomicPtr<Node>,
    /// Tail of the chain
    newest: AtomicPtr<Node>,
    hot_bytes: AtomicUsize,
    cold_bytes: AtomicUsize,
    /// Singly-linked through the vacated forward link; never traversed by
    /// readers, kept for accounting and debugging
    retired_head: AtomicPtr<Node>,
    retired_bytes: AtomicUsize,
    hot_threshold: usize,
}

impl FifoOverlay {
    pub(crate) fn new(hot_threshold: usize) -> Self {
        Self {
            oldest_cold: AtomicPtr::new(ptr::null_mut()),
            oldest_hot: AtomicPtr::new(ptr::null_mut()),
            newest: AtomicPtr::new(ptr::null_mut()),
            hot_bytes: AtomicUsize::new(0),
            cold_bytes: AtomicUsize::new(0),
            retired_head: AtomicPtr::new(ptr::null_mut()),
            retired_bytes: AtomicUsize::new(0),
            hot_threshold,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub(crate) fn oldest_cold(&self) -> *mut Node {
        self.oldest_cold.load(Relaxed)
    }

    pub(crate) fn oldest_hot(&self) -> *mut Node {
        self.oldest_hot.load(Relaxed)
    }

    pub(crate) fn newest(&self) -> *mut Node {
        self.newest.load(Relaxed)
    }

    pub(crate) fn hot_memory_usage(&self) -> usize {
        self.hot_bytes.load(Relaxed)
    }

    pub(crate) fn cold_memory_usage(&self) -> usize {
        self.cold_bytes.load(Relaxed)
    }

    pub(crate) fn retired_memory_usage(&self) -> usize {
        self.retired_bytes.load(Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn retired_head(&self) -> *mut Node {
        self.retired_head.load(Relaxed)
    }

    // -------------------------------------------------------------------------
    // Mutation (writer only)
    // -------------------------------------------------------------------------

    /// Append a freshly published node to the tail and account its bytes,
    /// demoting hot nodes first if the suffix would overflow.
    ///
    /// # Safety
    /// `node` must be a node of the owning list, not yet in the chain; the
    /// caller is the single writer.
    pub(crate) unsafe fn insert(&self, node: *mut Node) {
        let size = (*node).billed_size();
        self.rebalance_for(size);

        let tail = self.newest();
        if tail.is_null() {
            (*node).set_fifo_prev(ptr::null_mut());
        } else {
            (*node).set_fifo_prev(tail);
            (*tail).set_fifo_next(node);
        }
        self.newest.store(node, Relaxed);

        if self.oldest_hot().is_null() && size > self.hot_threshold {
            // The pre-check left the hot segment empty and the node alone
            // exceeds the budget: it lands cold.
            self.cold_bytes.fetch_add(size, Relaxed);
            if self.oldest_cold().is_null() {
                self.oldest_cold.store(node, Relaxed);
            }
        } else {
            self.hot_bytes.fetch_add(size, Relaxed);
            if self.oldest_hot().is_null() {
                self.oldest_hot.store(node, Relaxed);
            }
        }
    }

    /// Roll the hot→cold boundary forward until a node of `incoming` bytes
    /// fits in the hot suffix, or the suffix is empty.
    fn rebalance_for(&self, incoming: usize) {
        unsafe {
            while !self.oldest_hot().is_null()
                && self.hot_bytes.load(Relaxed) + incoming > self.hot_threshold
            {
                let demoted = self.oldest_hot();
                let size = (*demoted).billed_size();
                self.hot_bytes.fetch_sub(size, Relaxed);
                self.cold_bytes.fetch_add(size, Relaxed);
                if self.oldest_cold().is_null() {
                    // No cold prefix yet, so the demoted node was the
                    // chain's front; it seeds one.
                    self.oldest_cold.store(demoted, Relaxed);
                }
                self.oldest_hot.store((*demoted).fifo_next(), Relaxed);
            }
        }
    }

    /// Unlink a superseded node from the chain, subtract its bytes from the
    /// region the caller observed it in, and prepend it to the retirement
    /// list. Memory stays allocated.
    ///
    /// # Safety
    /// `node` must currently be in the chain; the caller is the single
    /// writer.
    pub(crate) unsafe fn retire(&self, node: *mut Node, from_hot: bool) {
        let prev = (*node).fifo_prev();
        let next = (*node).fifo_next();
        if !prev.is_null() {
            (*prev).set_fifo_next(next);
        }
        if !next.is_null() {
            (*next).set_fifo_prev(prev);
        }

        if self.oldest_cold() == node {
            self.oldest_cold.store(next, Relaxed);
        }
        if self.oldest_hot() == node {
            self.oldest_hot.store(next, Relaxed);
        }
        if self.newest() == node {
            self.newest.store(prev, Relaxed);
        }

        let size = (*node).billed_size();
        if from_hot {
            self.hot_bytes.fetch_sub(size, Relaxed);
        } else {
            self.cold_bytes.fetch_sub(size, Relaxed);
        }

        (*node).set_fifo_prev(ptr::null_mut());
        (*node).set_fifo_next(self.retired_head.load(Relaxed));
        self.retired_head.store(node, Relaxed);
        self.retired_bytes.fetch_add(size, Relaxed);
    }
}
