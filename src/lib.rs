//! # EmberKV
//!
//! The in-memory write buffer of a log-structured key-value store, with:
//! - Arena-backed skiplist index (single writer, lock-free readers)
//! - FIFO insertion-order overlay for hot/cold classification
//! - Capacity-driven demotion from the hot suffix to the cold prefix
//! - `separate()` partitioning: hot survivors out, cold survivors retained
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MemTable (façade)                       │
//! │       add / get / iterators / extract_hot / separate        │
//! └─────────┬──────────────────────────────────┬────────────────┘
//!           │                                  │
//!           ▼                                  ▼
//!   ┌──────────────┐                   ┌──────────────┐
//!   │   SkipList   │── shared nodes ──▶│ FIFO overlay │
//!   │ (key order)  │◀── shared nodes ──│ (insert order│
//!   └──────┬───────┘                   │  + hot/cold) │
//!          │                           └──────┬───────┘
//!          ▼                                  ▼
//!   ┌─────────────────────────────────────────────┐
//!   │                    Arena                    │
//!   │     (bump blocks, never freed piecemeal)    │
//!   └─────────────────────────────────────────────┘
//! ```
//!
//! Writes are externally serialized by the embedder; readers proceed without
//! locks and observe a consistent view through release-published node links.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod memtable;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{EmberError, Result};
pub use config::MemTableConfig;
pub use memtable::{
    BytewiseComparator, FifoIter, KeyComparator, LookupResult, MemTable, MemTableIter, OpType,
    ParsedEntry, MAX_SEQUENCE,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
