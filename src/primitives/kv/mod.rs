//! Byte-store substrate.
//!
//! Every durable structure in the crate is encoded onto a [`KvStore`]: a map
//! from string keys to opaque blobs accessed through scoped transactions.
//! Reads observe the last committed state. Writers on one store serialize;
//! a write transaction dropped without [`KvWrite::commit`] leaves no trace.

mod mem;
mod sqlite;

use std::sync::Arc;

use crate::types::Result;

pub use mem::{MemKv, MemKvProvider};
pub use sqlite::{SqliteKv, SqliteKvProvider};

/// Read access to a byte store.
pub trait KvRead {
    /// Returns true when `key` has a value.
    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Write access to a byte store. Staged changes are visible to this
/// transaction's own reads.
pub trait KvWrite: KvRead {
    /// Stages a put.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Stages a delete.
    fn del(&mut self, key: &str) -> Result<()>;

    /// Atomically applies every staged change.
    fn commit(&mut self) -> Result<()>;
}

/// A byte store with scoped transactions.
pub trait KvStore: Send + Sync {
    /// Opens a read transaction over the last committed state.
    fn read(&self) -> Result<Box<dyn KvRead + '_>>;

    /// Opens a write transaction, waiting for any other writer to finish.
    fn write(&self) -> Result<Box<dyn KvWrite + '_>>;

    /// Closes the store. Later transactions fail with `Closed`.
    fn close(&self) -> Result<()>;

    /// Whether [`KvStore::close`] was called.
    fn closed(&self) -> bool;
}

/// Opens and drops named byte stores.
pub trait KvProvider: Send + Sync {
    /// Opens (creating if needed) the store called `name`.
    fn open(&self, name: &str) -> Result<Arc<dyn KvStore>>;

    /// Permanently deletes the store called `name`.
    fn drop_store(&self, name: &str) -> Result<()>;
}
