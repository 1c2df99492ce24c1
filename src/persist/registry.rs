//! Registry maps stored wholesale as one chunk under a dedicated head.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::primitives::concurrency::Shutdown;
use crate::storage::dag::{encode, DagRead, DagWrite, Store};
use crate::types::{Hash, Result};

/// A map kept under its own head whose entries pin commit chains.
pub(crate) trait RegistryMap: Default + Serialize + DeserializeOwned {
    /// Head the map chunk hangs from.
    const HEAD: &'static str;

    /// Hashes the map keeps alive.
    fn refs(&self) -> Vec<Hash>;
}

/// Decodes the map under its head, or the empty map when the head is unset.
pub(crate) fn read_map<M: RegistryMap>(dag: &dyn DagRead) -> Result<M> {
    match dag.get_head(M::HEAD)? {
        Some(hash) => dag.must_get_chunk(&hash)?.decode(),
        None => Ok(M::default()),
    }
}

/// Stages `map` as a new chunk and points its head at it.
pub(crate) fn write_map<M: RegistryMap>(dag: &mut dyn DagWrite, map: &M) -> Result<Hash> {
    let mut refs = map.refs();
    refs.sort_unstable();
    refs.dedup();
    let chunk = dag.create_chunk(encode(map)?, refs);
    let hash = chunk.hash();
    dag.put_chunk(chunk)?;
    dag.set_head(M::HEAD, hash)?;
    Ok(hash)
}

/// Applies `transform` with optimistic concurrency.
///
/// The map is read in one transaction and transformed outside of any lock.
/// The result is written only if the head still points where it did; when
/// another writer got there first the whole cycle repeats on the fresh map.
/// `transform` returning `None` means no change. A triggered `guard` aborts
/// with `Cancelled` right before the commit, leaving the map untouched.
pub(crate) fn update_map<M, F>(store: &dyn Store, guard: Option<&Shutdown>, mut transform: F) -> Result<M>
where
    M: RegistryMap,
    F: FnMut(&M) -> Result<Option<M>>,
{
    loop {
        let (head, current) = {
            let read = store.read()?;
            (read.get_head(M::HEAD)?, read_map::<M>(&*read)?)
        };
        let Some(next) = transform(&current)? else {
            return Ok(current);
        };
        let mut write = store.write()?;
        if write.get_head(M::HEAD)? != head {
            debug!(head = M::HEAD, "persist.registry.retry");
            continue;
        }
        write_map(&mut *write, &next)?;
        if let Some(guard) = guard {
            guard.check()?;
        }
        write.commit()?;
        return Ok(next);
    }
}
