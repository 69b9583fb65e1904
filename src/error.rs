//! Error types for EmberKV
//!
//! The core surfaces very few failures: lookups report absence through
//! [`LookupResult`](crate::memtable::LookupResult), and precondition
//! breaches (duplicate internal keys, refcount underflow) abort in debug
//! builds rather than returning.

use thiserror::Error;

/// Result type alias using EmberError
pub type Result<T> = std::result::Result<T, EmberError>;

/// Unified error type for EmberKV operations
#[derive(Debug, Error)]
pub enum EmberError {
    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("memtable already separated; writes are rejected")]
    Separated,

    // -------------------------------------------------------------------------
    // Invariant Errors
    // -------------------------------------------------------------------------
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
