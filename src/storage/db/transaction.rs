use serde_json::Value;

use super::scan::{ScanItem, ScanOptions};
use super::write::Write;
use crate::types::{ClientId, PenumbraError, Result};

/// What a mutator sees: reads and writes against the commit being built.
pub struct WriteTransaction<'t, 'a> {
    write: &'t mut Write<'a>,
    client_id: ClientId,
    mutation_id: u64,
}

impl<'t, 'a> WriteTransaction<'t, 'a> {
    pub(crate) fn new(write: &'t mut Write<'a>) -> Result<Self> {
        let client_id = write
            .client_id()
            .cloned()
            .ok_or(PenumbraError::Invalid("mutators run on local writes only"))?;
        let mutation_id = write.mutation_id()?;
        Ok(Self {
            write,
            client_id,
            mutation_id,
        })
    }

    /// Client running the mutation.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Mutation id the resulting commit carries.
    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.write.get(key)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> Result<bool> {
        self.write.has(key)
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> Result<bool> {
        self.write.is_empty()
    }

    /// Stores `value` under `key`.
    pub fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.write.put(key, value)
    }

    /// Removes `key`, returning whether it was present.
    pub fn del(&mut self, key: &str) -> Result<bool> {
        self.write.del(key)
    }

    /// Prefix or index scan, seeing this mutation's own writes.
    pub fn scan(&self, opts: &ScanOptions) -> Result<Vec<ScanItem>> {
        self.write.scan(opts)
    }
}
