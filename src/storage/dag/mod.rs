//! Content-addressed chunk store.
//!
//! Chunks are immutable `{hash, data, refs}` nodes; heads are named mutable
//! pointers into the graph. [`DagStore`] persists both onto a byte store and
//! collects chunks by reference count when a write commits. [`LazyStore`]
//! is the memory-resident working copy layered over a durable store.

mod chunk;
mod durable;
mod gc;
mod lazy;
mod metrics;
mod store;

pub use chunk::{encode, Chunk};
pub use durable::DagStore;
pub use gc::HeadChange;
pub use lazy::{LazyStore, DEFAULT_LAZY_CACHE_BYTES};
pub use metrics::{CounterMetrics, DagMetrics, NoopMetrics};
pub use store::{with_read, with_write, DagRead, DagWrite, Store};
