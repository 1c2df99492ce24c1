//! Low-level primitives the chunk store is built on.
//!
//! Includes the byte-store substrate and the concurrency helpers used by
//! background workers.

/// Concurrency primitives and background workers.
///
/// Shared shutdown signalling and cancellable periodic tasks.
pub mod concurrency;

/// Key-value byte stores.
///
/// Scoped read/write transactions over opaque blobs, in memory or in SQLite.
pub mod kv;
