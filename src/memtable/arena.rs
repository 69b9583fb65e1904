//! Arena allocator
//!
//! Bump allocation over a sequence of blocks. Allocations are never freed
//! individually; the whole arena drops with the MemTable that owns it, which
//! is what lets readers chase stale node links without ever touching freed
//! memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Alignment of [`Arena::allocate_aligned`] results (pointer-sized).
const ALIGN: usize = std::mem::size_of::<usize>();

/// Block bump allocator.
///
/// Requests larger than a quarter block get a dedicated block so the bump
/// block's remaining space is not wasted. Blocks are held as `Box<[u64]>`,
/// which keeps every block start pointer-aligned and keeps block payloads
/// stable while the block list grows.
pub(crate) struct Arena {
    state: Mutex<ArenaState>,
    /// Cumulative bytes handed out
    usage: AtomicUsize,
    block_size: usize,
}

struct ArenaState {
    blocks: Vec<Box<[u64]>>,
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
}

// SAFETY: the raw bump pointer aliases memory owned by `blocks`; moving the
// state between threads moves ownership of both together.
unsafe impl Send for ArenaState {}

impl Arena {
    pub(crate) fn new(block_size: usize) -> Self {
        assert!(block_size >= 64, "arena blocks must hold at least one node");
        Self {
            state: Mutex::new(ArenaState {
                blocks: Vec::new(),
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
            }),
            usage: AtomicUsize::new(0),
            block_size,
        }
    }

    /// Allocate `n` bytes with no alignment guarantee.
    pub(crate) fn allocate(&self, n: usize) -> *mut u8 {
        debug_assert!(n > 0);
        let mut state = self.state.lock();
        let ptr = if n <= state.alloc_remaining {
            let ptr = state.alloc_ptr;
            state.alloc_ptr = unsafe { ptr.add(n) };
            state.alloc_remaining -= n;
            ptr
        } else {
            Self::allocate_fallback(&mut state, self.block_size, n)
        };
        self.usage.fetch_add(n, Ordering::Relaxed);
        ptr
    }

    /// Allocate `n` bytes aligned to the pointer size.
    pub(crate) fn allocate_aligned(&self, n: usize) -> *mut u8 {
        debug_assert!(n > 0);
        let mut state = self.state.lock();
        let misalign = (state.alloc_ptr as usize) & (ALIGN - 1);
        let slop = if misalign == 0 { 0 } else { ALIGN - misalign };
        let ptr = if n + slop <= state.alloc_remaining {
            let ptr = unsafe { state.alloc_ptr.add(slop) };
            state.alloc_ptr = unsafe { ptr.add(n) };
            state.alloc_remaining -= n + slop;
            ptr
        } else {
            // Fresh blocks start on a u64 boundary.
            Self::allocate_fallback(&mut state, self.block_size, n)
        };
        debug_assert_eq!(ptr as usize & (ALIGN - 1), 0);
        self.usage.fetch_add(n, Ordering::Relaxed);
        ptr
    }

    /// Cumulative bytes handed out so far.
    pub(crate) fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(state: &mut ArenaState, block_size: usize, n: usize) -> *mut u8 {
        if n > block_size / 4 {
            // Dedicated block; the current bump block keeps its remainder.
            return Self::new_block(state, n);
        }
        let ptr = Self::new_block(state, block_size);
        state.alloc_ptr = unsafe { ptr.add(n) };
        state.alloc_remaining = block_size - n;
        ptr
    }

    fn new_block(state: &mut ArenaState, bytes: usize) -> *mut u8 {
        let words = bytes.div_ceil(std::mem::size_of::<u64>());
        let mut block = vec![0u64; words].into_boxed_slice();
        let ptr = block.as_mut_ptr() as *mut u8;
        state.blocks.push(block);
        ptr
    }
}

// =============================================================================
// Tests
// =============================================================================
