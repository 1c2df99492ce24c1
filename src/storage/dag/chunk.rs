use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{ChunkHasher, Hash, Result};

/// Immutable, content-addressed node of the graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    hash: Hash,
    data: Bytes,
    refs: Arc<[Hash]>,
}

impl Chunk {
    /// Assembles a chunk whose hash was already computed.
    pub fn new(hash: Hash, data: Bytes, refs: impl Into<Arc<[Hash]>>) -> Self {
        Self {
            hash,
            data,
            refs: refs.into(),
        }
    }

    /// Hashes `data` and `refs` with `hasher` and wraps the result.
    pub fn create(hasher: &ChunkHasher, data: Bytes, refs: Vec<Hash>) -> Self {
        let hash = hasher.hash(&data, &refs);
        Self::new(hash, data, refs)
    }

    /// Identity of the chunk.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Encoded payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Hashes of the chunks this one keeps alive.
    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }

    /// Approximate memory footprint, used for cache accounting.
    pub fn size(&self) -> usize {
        self.data.len() + self.refs.len() * std::mem::size_of::<Hash>()
    }

    /// Decodes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Encodes a payload as chunk data.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}
