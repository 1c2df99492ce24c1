use bytes::Bytes;

use super::Chunk;
use crate::types::{Hash, PenumbraError, Result};

/// Read side of a chunk store transaction.
pub trait DagRead {
    /// Loads a chunk, or `None` when it is not stored.
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>>;

    /// True when the chunk is stored.
    fn has_chunk(&self, hash: &Hash) -> Result<bool> {
        Ok(self.get_chunk(hash)?.is_some())
    }

    /// Loads a chunk that must exist.
    fn must_get_chunk(&self, hash: &Hash) -> Result<Chunk> {
        self.get_chunk(hash)?
            .ok_or(PenumbraError::MissingChunk(*hash))
    }

    /// Current target of a named head.
    fn get_head(&self, name: &str) -> Result<Option<Hash>>;

    /// Current target of a named head that must exist.
    fn must_get_head(&self, name: &str) -> Result<Hash> {
        self.get_head(name)?
            .ok_or_else(|| PenumbraError::MissingHead(name.to_string()))
    }
}

/// Write side of a chunk store transaction.
///
/// Nothing is visible outside the transaction until [`DagWrite::commit`];
/// dropping the transaction discards every staged chunk and head change.
pub trait DagWrite: DagRead {
    /// Hashes `data` and `refs` with the store's hasher. Does not stage it.
    fn create_chunk(&self, data: Bytes, refs: Vec<Hash>) -> Chunk;

    /// Stages a chunk.
    fn put_chunk(&mut self, chunk: Chunk) -> Result<()>;

    /// Stages a head update.
    fn set_head(&mut self, name: &str, hash: Hash) -> Result<()>;

    /// Stages a head removal.
    fn remove_head(&mut self, name: &str) -> Result<()>;

    /// Applies every staged change atomically and collects chunks no
    /// longer reachable from any head.
    fn commit(&mut self) -> Result<()>;

    /// This transaction viewed as a reader.
    fn as_read(&self) -> &dyn DagRead;
}

/// A chunk store.
pub trait Store: Send + Sync {
    /// Opens a read transaction.
    fn read(&self) -> Result<Box<dyn DagRead + '_>>;

    /// Opens a write transaction; writers on one store run one at a time.
    fn write(&self) -> Result<Box<dyn DagWrite + '_>>;

    /// Closes the store.
    fn close(&self) -> Result<()>;

    /// Whether the store was closed.
    fn closed(&self) -> bool;
}

/// Runs `f` inside a read transaction.
pub fn with_read<S, R, F>(store: &S, f: F) -> Result<R>
where
    S: Store + ?Sized,
    F: FnOnce(&dyn DagRead) -> Result<R>,
{
    let read = store.read()?;
    f(&*read)
}

/// Runs `f` inside a write transaction. `f` must call `commit` itself;
/// returning without committing (including on error) discards the writes.
pub fn with_write<S, R, F>(store: &S, f: F) -> Result<R>
where
    S: Store + ?Sized,
    F: FnOnce(&mut dyn DagWrite) -> Result<R>,
{
    let mut write = store.write()?;
    f(&mut *write)
}
