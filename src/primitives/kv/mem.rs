use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;

use super::{KvProvider, KvRead, KvStore, KvWrite};
use crate::types::{PenumbraError, Result};

type Entries = FxHashMap<String, Vec<u8>>;

#[derive(Default)]
struct Shared {
    data: RwLock<Arc<Entries>>,
    writer: Mutex<()>,
}

/// Process-local byte store.
///
/// Read transactions pin the committed map by reference count, so a commit
/// that races a reader copies the map instead of mutating what the reader sees.
/// Handles opened from one [`MemKvProvider`] share data but close independently.
pub struct MemKv {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemKv {
    /// Creates an empty, unshared store.
    pub fn new() -> Self {
        Self::from_shared(Arc::new(Shared::default()))
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.shared.data.read().len()
    }

    /// True when nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            return Err(PenumbraError::Closed);
        }
        Ok(())
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

struct MemRead {
    snapshot: Arc<Entries>,
}

impl KvRead for MemRead {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }
}

struct MemWrite<'a> {
    shared: &'a Shared,
    _guard: MutexGuard<'a, ()>,
    base: Arc<Entries>,
    pending: FxHashMap<String, Option<Vec<u8>>>,
}

impl KvRead for MemWrite<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.base.get(key).cloned()),
        }
    }
}

impl KvWrite for MemWrite<'_> {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.pending.insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<()> {
        self.pending.insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        // Release our own pin so make_mut only copies when a reader holds one.
        self.base = Arc::default();
        let mut data = self.shared.data.write();
        let map = Arc::make_mut(&mut *data);
        for (key, value) in self.pending.drain() {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        self.base = Arc::clone(&data);
        Ok(())
    }
}

impl KvStore for MemKv {
    fn read(&self) -> Result<Box<dyn KvRead + '_>> {
        self.ensure_open()?;
        Ok(Box::new(MemRead {
            snapshot: Arc::clone(&self.shared.data.read()),
        }))
    }

    fn write(&self) -> Result<Box<dyn KvWrite + '_>> {
        self.ensure_open()?;
        let guard = self.shared.writer.lock();
        Ok(Box::new(MemWrite {
            shared: &self.shared,
            _guard: guard,
            base: Arc::clone(&self.shared.data.read()),
            pending: FxHashMap::default(),
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

/// Hands out [`MemKv`] handles by name; handles with the same name share data.
#[derive(Default)]
pub struct MemKvProvider {
    stores: Mutex<FxHashMap<String, Arc<Shared>>>,
}

impl MemKvProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the stores currently held.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl KvProvider for MemKvProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn KvStore>> {
        let shared = Arc::clone(self.stores.lock().entry(name.to_string()).or_default());
        Ok(Arc::new(MemKv::from_shared(shared)))
    }

    fn drop_store(&self, name: &str) -> Result<()> {
        self.stores.lock().remove(name);
        Ok(())
    }
}
