use std::sync::atomic::{AtomicU64, Ordering};

/// Observes chunk traffic in a store.
pub trait DagMetrics: Send + Sync {
    /// A chunk read was answered from memory (`true`) or had to fall through.
    fn chunk_read(&self, cached: bool);

    /// Chunks written by a commit.
    fn chunks_written(&self, count: u64);

    /// Chunks deleted by reference-count collection.
    fn chunks_deleted(&self, count: u64);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl DagMetrics for NoopMetrics {
    fn chunk_read(&self, _cached: bool) {}
    fn chunks_written(&self, _count: u64) {}
    fn chunks_deleted(&self, _count: u64) {}
}

/// Atomic counters, safe to share between threads.
#[derive(Default)]
pub struct CounterMetrics {
    /// Reads served from memory.
    pub cache_hits: AtomicU64,
    /// Reads that went to the backing store.
    pub cache_misses: AtomicU64,
    /// Chunks written.
    pub chunks_written: AtomicU64,
    /// Chunks collected.
    pub chunks_deleted: AtomicU64,
}

impl CounterMetrics {
    /// Current values as `(hits, misses, written, deleted)`.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.chunks_written.load(Ordering::Relaxed),
            self.chunks_deleted.load(Ordering::Relaxed),
        )
    }
}

impl DagMetrics for CounterMetrics {
    fn chunk_read(&self, cached: bool) {
        if cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn chunks_written(&self, count: u64) {
        self.chunks_written.fetch_add(count, Ordering::Relaxed);
    }

    fn chunks_deleted(&self, count: u64) {
        self.chunks_deleted.fetch_add(count, Ordering::Relaxed);
    }
}
