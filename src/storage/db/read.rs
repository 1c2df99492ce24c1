use std::collections::BTreeMap;

use serde_json::Value;

use super::commit::{read_commit, Commit, IndexDefinition, Whence};
use super::scan::{self, ScanItem, ScanOptions};
use crate::storage::btree::BTreeRead;
use crate::storage::dag::DagRead;
use crate::types::{PenumbraError, Result};

/// Read-only view of the state at one commit.
pub struct Read<'a> {
    commit: Commit,
    map: BTreeRead<'a>,
    indexes: BTreeMap<String, (IndexDefinition, BTreeRead<'a>)>,
}

impl<'a> Read<'a> {
    /// View of `commit`.
    pub fn new(dag: &'a dyn DagRead, commit: Commit) -> Self {
        let map = BTreeRead::new(dag, commit.value_hash());
        let indexes = commit
            .indexes()
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    (r.definition.clone(), BTreeRead::new(dag, r.value_hash)),
                )
            })
            .collect();
        Self {
            commit,
            map,
            indexes,
        }
    }

    /// View of the commit `whence` resolves to.
    pub fn from_whence(dag: &'a dyn DagRead, whence: &Whence) -> Result<Self> {
        Ok(Self::new(dag, read_commit(whence, dag)?))
    }

    /// Commit the view reads.
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// Main map.
    pub fn map(&self) -> &BTreeRead<'a> {
        &self.map
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.map.get(key)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> Result<bool> {
        self.map.has(key)
    }

    /// Whether the main map is empty.
    pub fn is_empty(&self) -> Result<bool> {
        self.map.is_empty()
    }

    /// Definition of the named index.
    pub fn index_definition(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.get(name).map(|(d, _)| d)
    }

    /// Scans the main map or, with `index_name`, a secondary index.
    pub fn scan(&self, opts: &ScanOptions) -> Result<Vec<ScanItem>> {
        let map = match &opts.index_name {
            None => &self.map,
            Some(name) => {
                &self
                    .indexes
                    .get(name)
                    .ok_or_else(|| PenumbraError::InvalidArgument(format!("unknown index {name}")))?
                    .1
            }
        };
        scan::collect(map.scan(&scan::start_key(opts)?)?, opts)
    }
}
