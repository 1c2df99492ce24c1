use std::cell::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use super::gc::{compute_ref_count_updates, HeadChange, RefCountSource};
use super::metrics::{DagMetrics, NoopMetrics};
use super::{Chunk, DagRead, DagWrite, Store};
use crate::types::{ChunkHasher, Hash, PenumbraError, Result};

/// Default byte budget of the source chunk cache.
pub const DEFAULT_LAZY_CACHE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Clone, Default)]
struct LazyState {
    heads: FxHashMap<String, Hash>,
    mem_only: FxHashMap<Hash, Chunk>,
    ref_counts: FxHashMap<Hash, usize>,
}

struct SourceCache {
    entries: LruCache<Hash, Chunk>,
    size: usize,
    limit: usize,
}

impl SourceCache {
    fn new(limit: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            size: 0,
            limit,
        }
    }

    fn get(&mut self, hash: &Hash) -> Option<Chunk> {
        self.entries.get(hash).cloned()
    }

    fn put(&mut self, chunk: Chunk) {
        let size = chunk.size();
        if size > self.limit {
            return;
        }
        if let Some(old) = self.entries.put(chunk.hash(), chunk) {
            self.size -= old.size();
        }
        self.size += size;
        while self.size > self.limit {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.size -= evicted.size(),
                None => break,
            }
        }
    }
}

/// Working store: a memory-resident view over a source [`Store`].
///
/// Heads live only in memory. Chunks written here are "mem-only" and are
/// reference counted against this store's heads; they never reach the
/// source until the persist step copies them and calls
/// [`LazyStore::chunks_persisted`]. Source chunks are read through a
/// byte-bounded LRU, so eviction only costs a re-fetch.
pub struct LazyStore {
    source: Arc<dyn Store>,
    hasher: ChunkHasher,
    state: RwLock<Arc<LazyState>>,
    writer: Mutex<()>,
    cache: Mutex<SourceCache>,
    metrics: Arc<dyn DagMetrics>,
    closed: AtomicBool,
}

impl LazyStore {
    /// Working store over `source` with a cache of `cache_limit` bytes.
    pub fn new(source: Arc<dyn Store>, cache_limit: usize, hasher: ChunkHasher) -> Self {
        Self {
            source,
            hasher,
            state: RwLock::new(Arc::default()),
            writer: Mutex::new(()),
            cache: Mutex::new(SourceCache::new(cache_limit)),
            metrics: Arc::new(NoopMetrics),
            closed: AtomicBool::new(false),
        }
    }

    /// Attaches a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn DagMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The durable store behind this one.
    pub fn source(&self) -> &Arc<dyn Store> {
        &self.source
    }

    /// Number of chunks that exist only in memory.
    pub fn mem_only_len(&self) -> usize {
        self.state.read().mem_only.len()
    }

    /// True when `hash` is a mem-only chunk.
    pub fn is_mem_only(&self, hash: &Hash) -> bool {
        self.state.read().mem_only.contains_key(hash)
    }

    /// Bytes currently held by the source cache.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().size
    }

    /// True when a read of `hash` would not touch the source.
    pub fn is_cached(&self, hash: &Hash) -> bool {
        self.is_mem_only(hash) || self.cache.lock().entries.contains(hash)
    }

    /// Seeds the source cache with chunks known to be durable.
    pub fn cache_chunks(&self, chunks: impl IntoIterator<Item = Chunk>) {
        let mut cache = self.cache.lock();
        for chunk in chunks {
            cache.put(chunk);
        }
    }

    /// Mem-only chunks reachable from `root`, stopping at the first chunk
    /// that is already durable.
    pub fn gather_mem_only(&self, root: Hash) -> Result<Vec<Chunk>> {
        let state = Arc::clone(&self.state.read());
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            if let Some(chunk) = state.mem_only.get(&hash) {
                stack.extend_from_slice(chunk.refs());
                out.push(chunk.clone());
            }
        }
        Ok(out)
    }

    /// Durable chunks reachable from `root` that this store has not cached,
    /// up to roughly `limit` bytes.
    pub fn gather_not_cached(
        &self,
        source: &dyn DagRead,
        root: Hash,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        let mut size = 0usize;
        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            if size >= limit {
                break;
            }
            if hash.is_empty() || !seen.insert(hash) || self.is_cached(&hash) {
                continue;
            }
            let Some(chunk) = source.get_chunk(&hash)? else {
                continue;
            };
            size += chunk.size();
            stack.extend_from_slice(chunk.refs());
            out.push(chunk);
        }
        Ok(out)
    }

    /// Moves chunks the persist step copied to the source out of the
    /// mem-only set and into the cache. Waits for an open write, whose ref
    /// counts were taken against the mem-only set it started with.
    pub fn chunks_persisted(&self, hashes: &[Hash]) {
        let _writer = self.writer.lock();
        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut *guard);
        let mut cache = self.cache.lock();
        let mut moved = 0usize;
        for hash in hashes {
            if let Some(chunk) = state.mem_only.remove(hash) {
                state.ref_counts.remove(hash);
                cache.put(chunk);
                moved += 1;
            }
        }
        trace!(moved, "dag.lazy.chunks_persisted");
    }

    #[cfg(test)]
    pub(crate) fn tracked_ref_counts(&self) -> usize {
        self.state.read().ref_counts.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            return Err(PenumbraError::Closed);
        }
        Ok(())
    }

    fn read_through<'a>(
        &'a self,
        source: &OnceCell<Box<dyn DagRead + 'a>>,
        hash: &Hash,
    ) -> Result<Option<Chunk>> {
        if let Some(chunk) = self.cache.lock().get(hash) {
            self.metrics.chunk_read(true);
            return Ok(Some(chunk));
        }
        if source.get().is_none() {
            let opened = self.source.read()?;
            let _ = source.set(opened);
        }
        let reader = source
            .get()
            .ok_or(PenumbraError::Corruption("source read unavailable"))?;
        self.metrics.chunk_read(false);
        let chunk = reader.get_chunk(hash)?;
        if let Some(chunk) = &chunk {
            self.cache.lock().put(chunk.clone());
        }
        Ok(chunk)
    }
}

struct LazyRead<'a> {
    store: &'a LazyStore,
    state: Arc<LazyState>,
    source: OnceCell<Box<dyn DagRead + 'a>>,
}

impl DagRead for LazyRead<'_> {
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        if let Some(chunk) = self.state.mem_only.get(hash) {
            self.store.metrics.chunk_read(true);
            return Ok(Some(chunk.clone()));
        }
        self.store.read_through(&self.source, hash)
    }

    fn get_head(&self, name: &str) -> Result<Option<Hash>> {
        Ok(self.state.heads.get(name).copied())
    }
}

struct LazyWrite<'a> {
    store: &'a LazyStore,
    _guard: MutexGuard<'a, ()>,
    state: Arc<LazyState>,
    pending: FxHashMap<Hash, Chunk>,
    heads: FxHashMap<String, HeadChange>,
    source: OnceCell<Box<dyn DagRead + 'a>>,
}

struct MemOnlyRefCounts<'a> {
    state: &'a LazyState,
    pending: &'a FxHashMap<Hash, Chunk>,
}

impl RefCountSource for MemOnlyRefCounts<'_> {
    fn ref_count(&self, hash: &Hash) -> Result<Option<usize>> {
        if self.pending.contains_key(hash) || self.state.mem_only.contains_key(hash) {
            return Ok(Some(self.state.ref_counts.get(hash).copied().unwrap_or(0)));
        }
        Ok(None)
    }

    fn refs(&self, hash: &Hash) -> Result<Vec<Hash>> {
        let chunk = self
            .pending
            .get(hash)
            .or_else(|| self.state.mem_only.get(hash))
            .ok_or(PenumbraError::MissingChunk(*hash))?;
        Ok(chunk.refs().to_vec())
    }
}

impl DagRead for LazyWrite<'_> {
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        if let Some(chunk) = self
            .pending
            .get(hash)
            .or_else(|| self.state.mem_only.get(hash))
        {
            return Ok(Some(chunk.clone()));
        }
        self.store.read_through(&self.source, hash)
    }

    fn get_head(&self, name: &str) -> Result<Option<Hash>> {
        match self.heads.get(name) {
            Some(change) => Ok(change.new),
            None => Ok(self.state.heads.get(name).copied()),
        }
    }
}

impl DagWrite for LazyWrite<'_> {
    fn create_chunk(&self, data: Bytes, refs: Vec<Hash>) -> Chunk {
        Chunk::create(&self.store.hasher, data, refs)
    }

    fn put_chunk(&mut self, chunk: Chunk) -> Result<()> {
        self.pending.insert(chunk.hash(), chunk);
        Ok(())
    }

    fn set_head(&mut self, name: &str, hash: Hash) -> Result<()> {
        let old = self.get_head(name)?;
        let old = self.heads.get(name).map_or(old, |change| change.old);
        self.heads.insert(
            name.to_string(),
            HeadChange {
                old,
                new: Some(hash),
            },
        );
        Ok(())
    }

    fn remove_head(&mut self, name: &str) -> Result<()> {
        let old = self.get_head(name)?;
        let old = self.heads.get(name).map_or(old, |change| change.old);
        self.heads
            .insert(name.to_string(), HeadChange { old, new: None });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let counts = compute_ref_count_updates(
            self.heads.values(),
            self.pending.keys(),
            &MemOnlyRefCounts {
                state: &self.state,
                pending: &self.pending,
            },
        )?;

        // Drop our pin first so make_mut only copies when a reader holds one.
        self.state = Arc::default();
        let mut guard = self.store.state.write();
        let state = Arc::make_mut(&mut *guard);
        let mut written = 0u64;
        let mut deleted = 0u64;
        for (hash, count) in counts {
            if count == 0 {
                if state.mem_only.remove(&hash).is_some() {
                    deleted += 1;
                }
                state.ref_counts.remove(&hash);
                continue;
            }
            if let Some(chunk) = self.pending.remove(&hash) {
                state.mem_only.insert(hash, chunk);
                written += 1;
            }
            // Counts are only tracked while the chunk is memory-only.
            if state.mem_only.contains_key(&hash) {
                state.ref_counts.insert(hash, count);
            } else {
                state.ref_counts.remove(&hash);
            }
        }
        for (name, change) in self.heads.drain() {
            match change.new {
                Some(hash) => {
                    state.heads.insert(name, hash);
                }
                None => {
                    state.heads.remove(&name);
                }
            }
        }
        self.pending.clear();
        self.state = Arc::clone(&guard);
        trace!(written, deleted, "dag.lazy.commit");
        self.store.metrics.chunks_written(written);
        self.store.metrics.chunks_deleted(deleted);
        Ok(())
    }

    fn as_read(&self) -> &dyn DagRead {
        self
    }
}

impl Store for LazyStore {
    fn read(&self) -> Result<Box<dyn DagRead + '_>> {
        self.ensure_open()?;
        Ok(Box::new(LazyRead {
            store: self,
            state: Arc::clone(&self.state.read()),
            source: OnceCell::new(),
        }))
    }

    fn write(&self) -> Result<Box<dyn DagWrite + '_>> {
        self.ensure_open()?;
        let guard = self.writer.lock();
        Ok(Box::new(LazyWrite {
            store: self,
            _guard: guard,
            state: Arc::clone(&self.state.read()),
            pending: FxHashMap::default(),
            heads: FxHashMap::default(),
            source: OnceCell::new(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
