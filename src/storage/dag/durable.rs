use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use super::gc::{compute_ref_count_updates, HeadChange, RefCountSource};
use super::metrics::{DagMetrics, NoopMetrics};
use super::{Chunk, DagRead, DagWrite, Store};
use crate::primitives::kv::{KvRead, KvStore, KvWrite};
use crate::types::checksum::chunk_crc32;
use crate::types::hash::HASH_LEN;
use crate::types::{ChunkHasher, Hash, PenumbraError, Result};

fn data_key(hash: &Hash) -> String {
    format!("c/{hash}/d")
}

fn meta_key(hash: &Hash) -> String {
    format!("c/{hash}/m")
}

fn ref_count_key(hash: &Hash) -> String {
    format!("c/{hash}/r")
}

fn head_key(name: &str) -> String {
    format!("h/{name}")
}

fn decode_hash(bytes: &[u8]) -> Result<Hash> {
    let raw: [u8; HASH_LEN] = bytes
        .try_into()
        .map_err(|_| PenumbraError::Corruption("hash has wrong length"))?;
    Ok(Hash::from_bytes(raw))
}

fn decode_refs(bytes: &[u8]) -> Result<Vec<Hash>> {
    if bytes.len() % HASH_LEN != 0 {
        return Err(PenumbraError::Corruption("chunk refs have wrong length"));
    }
    bytes.chunks_exact(HASH_LEN).map(decode_hash).collect()
}

fn encode_refs(refs: &[Hash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(refs.len() * HASH_LEN);
    for r in refs {
        out.extend_from_slice(r.as_bytes());
    }
    out
}

fn load_chunk<K: KvRead + ?Sized>(kv: &K, hash: &Hash) -> Result<Option<Chunk>> {
    let Some(raw) = kv.get(&data_key(hash))? else {
        return Ok(None);
    };
    if raw.len() < 4 {
        return Err(PenumbraError::Corruption("chunk data truncated"));
    }
    let refs = match kv.get(&meta_key(hash))? {
        Some(bytes) => decode_refs(&bytes)?,
        None => Vec::new(),
    };
    let (crc, payload) = raw.split_at(4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if chunk_crc32(hash, &refs, payload) != expected {
        return Err(PenumbraError::Corruption("chunk checksum mismatch"));
    }
    Ok(Some(Chunk::new(*hash, Bytes::copy_from_slice(payload), refs)))
}

fn load_head<K: KvRead + ?Sized>(kv: &K, name: &str) -> Result<Option<Hash>> {
    kv.get(&head_key(name))?
        .map(|bytes| decode_hash(&bytes))
        .transpose()
}

fn load_ref_count<K: KvRead + ?Sized>(kv: &K, hash: &Hash) -> Result<usize> {
    match kv.get(&ref_count_key(hash))? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| PenumbraError::Corruption("ref count has wrong length"))?;
            Ok(u64::from_le_bytes(raw) as usize)
        }
        None => Ok(0),
    }
}

/// Durable chunk store encoded onto a [`KvStore`].
///
/// Keys: `c/<hash>/d` holds a crc32 and the payload, `c/<hash>/m` the refs,
/// `c/<hash>/r` the reference count, and `h/<name>` each head.
pub struct DagStore {
    kv: Arc<dyn KvStore>,
    hasher: ChunkHasher,
    metrics: Arc<dyn DagMetrics>,
}

impl DagStore {
    /// Content-hashing store over `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_hasher(kv, ChunkHasher::Content)
    }

    /// Store using a specific hasher.
    pub fn with_hasher(kv: Arc<dyn KvStore>, hasher: ChunkHasher) -> Self {
        Self {
            kv,
            hasher,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Attaches a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn DagMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The hasher new chunks are named with.
    pub fn hasher(&self) -> &ChunkHasher {
        &self.hasher
    }

    /// Persisted reference count of a chunk. Zero when absent.
    pub fn ref_count(&self, hash: &Hash) -> Result<usize> {
        let kv = self.kv.read()?;
        load_ref_count(&*kv, hash)
    }
}

struct DagStoreRead<'a> {
    kv: Box<dyn KvRead + 'a>,
    metrics: &'a dyn DagMetrics,
}

impl DagRead for DagStoreRead<'_> {
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        self.metrics.chunk_read(false);
        load_chunk(&*self.kv, hash)
    }

    fn has_chunk(&self, hash: &Hash) -> Result<bool> {
        self.kv.has(&data_key(hash))
    }

    fn get_head(&self, name: &str) -> Result<Option<Hash>> {
        load_head(&*self.kv, name)
    }
}

struct DagStoreWrite<'a> {
    kv: Box<dyn KvWrite + 'a>,
    hasher: &'a ChunkHasher,
    metrics: &'a dyn DagMetrics,
    put_chunks: FxHashMap<Hash, Chunk>,
    heads: FxHashMap<String, HeadChange>,
}

impl DagStoreWrite<'_> {
    fn stage_head(&mut self, name: &str, new: Option<Hash>) -> Result<()> {
        let old = match self.heads.get(name) {
            Some(change) => change.old,
            None => load_head(&*self.kv, name)?,
        };
        self.heads.insert(name.to_string(), HeadChange { old, new });
        Ok(())
    }
}

struct KvRefCounts<'a, K: ?Sized> {
    kv: &'a K,
    put_chunks: &'a FxHashMap<Hash, Chunk>,
}

impl<K: KvRead + ?Sized> RefCountSource for KvRefCounts<'_, K> {
    fn ref_count(&self, hash: &Hash) -> Result<Option<usize>> {
        load_ref_count(self.kv, hash).map(Some)
    }

    fn refs(&self, hash: &Hash) -> Result<Vec<Hash>> {
        if let Some(chunk) = self.put_chunks.get(hash) {
            return Ok(chunk.refs().to_vec());
        }
        if !self.kv.has(&data_key(hash))? {
            return Err(PenumbraError::MissingChunk(*hash));
        }
        match self.kv.get(&meta_key(hash))? {
            Some(bytes) => decode_refs(&bytes),
            None => Ok(Vec::new()),
        }
    }
}

impl DagRead for DagStoreWrite<'_> {
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        if let Some(chunk) = self.put_chunks.get(hash) {
            return Ok(Some(chunk.clone()));
        }
        self.metrics.chunk_read(false);
        load_chunk(&*self.kv, hash)
    }

    fn has_chunk(&self, hash: &Hash) -> Result<bool> {
        Ok(self.put_chunks.contains_key(hash) || self.kv.has(&data_key(hash))?)
    }

    fn get_head(&self, name: &str) -> Result<Option<Hash>> {
        match self.heads.get(name) {
            Some(change) => Ok(change.new),
            None => load_head(&*self.kv, name),
        }
    }
}

impl DagWrite for DagStoreWrite<'_> {
    fn create_chunk(&self, data: Bytes, refs: Vec<Hash>) -> Chunk {
        Chunk::create(self.hasher, data, refs)
    }

    fn put_chunk(&mut self, chunk: Chunk) -> Result<()> {
        self.put_chunks.insert(chunk.hash(), chunk);
        Ok(())
    }

    fn set_head(&mut self, name: &str, hash: Hash) -> Result<()> {
        self.stage_head(name, Some(hash))
    }

    fn remove_head(&mut self, name: &str) -> Result<()> {
        self.stage_head(name, None)
    }

    fn commit(&mut self) -> Result<()> {
        let counts = compute_ref_count_updates(
            self.heads.values(),
            self.put_chunks.keys(),
            &KvRefCounts {
                kv: &*self.kv,
                put_chunks: &self.put_chunks,
            },
        )?;

        let mut written = 0u64;
        let mut deleted = 0u64;
        for (hash, count) in &counts {
            let staged = self.put_chunks.get(hash);
            if *count == 0 {
                if staged.is_none() {
                    self.kv.del(&data_key(hash))?;
                    self.kv.del(&meta_key(hash))?;
                    self.kv.del(&ref_count_key(hash))?;
                    deleted += 1;
                }
                continue;
            }
            if let Some(chunk) = staged {
                if !self.kv.has(&data_key(hash))? {
                    let crc = chunk_crc32(hash, chunk.refs(), chunk.data());
                    let mut raw = Vec::with_capacity(4 + chunk.data().len());
                    raw.extend_from_slice(&crc.to_le_bytes());
                    raw.extend_from_slice(chunk.data());
                    self.kv.put(&data_key(hash), &raw)?;
                    if !chunk.refs().is_empty() {
                        self.kv.put(&meta_key(hash), &encode_refs(chunk.refs()))?;
                    }
                    written += 1;
                }
            }
            self.kv
                .put(&ref_count_key(hash), &(*count as u64).to_le_bytes())?;
        }

        for (name, change) in &self.heads {
            match change.new {
                Some(hash) => self.kv.put(&head_key(name), hash.as_bytes())?,
                None => self.kv.del(&head_key(name))?,
            }
        }
        self.kv.commit()?;
        trace!(written, deleted, heads = self.heads.len(), "dag.commit");
        self.metrics.chunks_written(written);
        self.metrics.chunks_deleted(deleted);
        self.put_chunks.clear();
        self.heads.clear();
        Ok(())
    }

    fn as_read(&self) -> &dyn DagRead {
        self
    }
}

impl Store for DagStore {
    fn read(&self) -> Result<Box<dyn DagRead + '_>> {
        Ok(Box::new(DagStoreRead {
            kv: self.kv.read()?,
            metrics: &*self.metrics,
        }))
    }

    fn write(&self) -> Result<Box<dyn DagWrite + '_>> {
        Ok(Box::new(DagStoreWrite {
            kv: self.kv.write()?,
            hasher: &self.hasher,
            metrics: &*self.metrics,
            put_chunks: FxHashMap::default(),
            heads: FxHashMap::default(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.kv.close()
    }

    fn closed(&self) -> bool {
        self.kv.closed()
    }
}
