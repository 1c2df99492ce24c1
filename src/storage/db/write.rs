use serde_json::Value;
use tracing::debug;

use super::commit::{
    base_snapshot, commit_from_hash, Commit, CommitData, IndexChangeMeta, IndexDefinition,
    IndexDefinitions, IndexRecord, LocalMeta, Meta, SnapshotMeta,
};
use super::diff::{diff_commits, DiffsMap};
use super::index::{covers, index_value, IndexOperation, IndexWrite};
use super::scan::{self, ScanItem, ScanOptions};
use crate::storage::btree::{BTreeOptions, BTreeWrite};
use crate::storage::dag::{DagRead, DagWrite};
use crate::types::{ClientId, Hash, MutationIds, PenumbraError, Result};

/// Identity of a mutator invocation recorded on a local commit.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationInfo {
    /// Client running the mutation.
    pub client_id: ClientId,
    /// Registered mutator name.
    pub mutator_name: String,
    /// Mutator arguments.
    pub mutator_args: Value,
    /// Hash of the first incarnation of this mutation when replaying it.
    pub original_hash: Option<Hash>,
    /// Wall clock time of the original invocation, in milliseconds.
    pub timestamp: u64,
}

/// A pending commit: edits to the main map and its indexes on top of a
/// basis, staged in a chunk store write transaction.
pub struct Write<'a> {
    dag: &'a mut dyn DagWrite,
    map: BTreeWrite,
    indexes: Vec<IndexWrite>,
    basis: Option<Commit>,
    meta: Meta,
    opts: BTreeOptions,
}

/// Builds a fresh index over every entry of `source` the definition covers.
fn build_index(
    dag: &dyn DagRead,
    source: &BTreeWrite,
    definition: &IndexDefinition,
    opts: BTreeOptions,
) -> Result<BTreeWrite> {
    let mut map = BTreeWrite::new(Hash::EMPTY, opts);
    let view = source.read(dag);
    for entry in view.scan(&definition.prefix)? {
        let (key, value) = entry?;
        if !key.starts_with(&definition.prefix) {
            break;
        }
        index_value(dag, &mut map, IndexOperation::Add, &key, &value, definition)?;
    }
    Ok(map)
}

fn index_writes(commit: &Commit, opts: BTreeOptions) -> Vec<IndexWrite> {
    commit
        .indexes()
        .iter()
        .map(|r| IndexWrite {
            name: r.name.clone(),
            definition: r.definition.clone(),
            map: BTreeWrite::new(r.value_hash, opts),
        })
        .collect()
}

impl<'a> Write<'a> {
    /// Starts a local mutation on top of `basis_hash`.
    pub fn new_local(
        dag: &'a mut dyn DagWrite,
        basis_hash: Hash,
        mutation: MutationInfo,
        opts: BTreeOptions,
    ) -> Result<Self> {
        let basis = commit_from_hash(&basis_hash, dag.as_read())?;
        let mutation_id = basis.next_mutation_id(&mutation.client_id, dag.as_read())?;
        let base_snapshot_hash = base_snapshot(&basis, dag.as_read())?.hash();
        let meta = Meta::Local(LocalMeta {
            basis_hash,
            base_snapshot_hash,
            mutation_id,
            mutator_name: mutation.mutator_name,
            mutator_args: mutation.mutator_args,
            original_hash: mutation.original_hash,
            timestamp: mutation.timestamp,
            client_id: mutation.client_id,
        });
        Ok(Self::with_basis(dag, basis, meta, opts))
    }

    /// Starts a snapshot on top of `basis_hash`, keeping the basis indexes.
    pub fn new_snapshot(
        dag: &'a mut dyn DagWrite,
        basis_hash: Hash,
        last_mutation_ids: MutationIds,
        cookie: Value,
        opts: BTreeOptions,
    ) -> Result<Self> {
        let basis = commit_from_hash(&basis_hash, dag.as_read())?;
        let meta = Meta::Snapshot(SnapshotMeta {
            basis_hash: Some(basis_hash),
            last_mutation_ids,
            cookie,
        });
        Ok(Self::with_basis(dag, basis, meta, opts))
    }

    /// Starts an index change on top of `basis_hash`. Only
    /// [`create_index`](Self::create_index) and
    /// [`drop_index`](Self::drop_index) are allowed on it.
    pub fn new_index_change(
        dag: &'a mut dyn DagWrite,
        basis_hash: Hash,
        opts: BTreeOptions,
    ) -> Result<Self> {
        let basis = commit_from_hash(&basis_hash, dag.as_read())?;
        let meta = Meta::IndexChange(IndexChangeMeta { basis_hash });
        Ok(Self::with_basis(dag, basis, meta, opts))
    }

    /// Starts the first snapshot of a branch: no basis, null cookie, an
    /// empty map and one empty index per definition.
    pub fn new_genesis(
        dag: &'a mut dyn DagWrite,
        indexes: &IndexDefinitions,
        opts: BTreeOptions,
    ) -> Self {
        let indexes = indexes
            .iter()
            .map(|(name, definition)| IndexWrite {
                name: name.clone(),
                definition: definition.clone(),
                map: BTreeWrite::new(Hash::EMPTY, opts),
            })
            .collect();
        Self {
            dag,
            map: BTreeWrite::new(Hash::EMPTY, opts),
            indexes,
            basis: None,
            meta: Meta::Snapshot(SnapshotMeta {
                basis_hash: None,
                last_mutation_ids: MutationIds::new(),
                cookie: Value::Null,
            }),
            opts,
        }
    }

    /// Starts a new branch snapshot from an existing one: same map and
    /// cookie, no acknowledged mutations. Indexes whose definition already
    /// exists on `snapshot` are reused, the rest are built from the map.
    pub fn new_fork(
        dag: &'a mut dyn DagWrite,
        snapshot: &Commit,
        indexes: &IndexDefinitions,
        opts: BTreeOptions,
    ) -> Result<Self> {
        let meta = snapshot
            .as_snapshot()
            .ok_or(PenumbraError::Invalid("branches fork from snapshots"))?;
        let map = BTreeWrite::new(snapshot.value_hash(), opts);
        let mut index_writes = Vec::with_capacity(indexes.len());
        for (name, definition) in indexes {
            let existing = snapshot
                .indexes()
                .iter()
                .find(|r| &r.definition == definition);
            let index = match existing {
                Some(record) => BTreeWrite::new(record.value_hash, opts),
                None => build_index(dag.as_read(), &map, definition, opts)?,
            };
            index_writes.push(IndexWrite {
                name: name.clone(),
                definition: definition.clone(),
                map: index,
            });
        }
        Ok(Self {
            dag,
            map,
            indexes: index_writes,
            basis: None,
            meta: Meta::Snapshot(SnapshotMeta {
                basis_hash: meta.basis_hash,
                last_mutation_ids: MutationIds::new(),
                cookie: meta.cookie.clone(),
            }),
            opts,
        })
    }

    fn with_basis(dag: &'a mut dyn DagWrite, basis: Commit, meta: Meta, opts: BTreeOptions) -> Self {
        Self {
            map: BTreeWrite::new(basis.value_hash(), opts),
            indexes: index_writes(&basis, opts),
            dag,
            basis: Some(basis),
            meta,
            opts,
        }
    }

    /// Commit this write builds on.
    pub fn basis(&self) -> Option<&Commit> {
        self.basis.as_ref()
    }

    /// Meta the new commit will carry.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The underlying chunk store transaction.
    pub fn dag(&self) -> &dyn DagRead {
        self.dag.as_read()
    }

    /// Client of a local write.
    pub fn client_id(&self) -> Option<&ClientId> {
        match &self.meta {
            Meta::Local(m) => Some(&m.client_id),
            _ => None,
        }
    }

    /// Mutation id of a local write.
    pub fn mutation_id(&self) -> Result<u64> {
        match &self.meta {
            Meta::Local(m) => Ok(m.mutation_id),
            _ => Err(PenumbraError::Invalid("only local writes carry a mutation id")),
        }
    }

    fn ensure_data_write(&self) -> Result<()> {
        match self.meta {
            Meta::IndexChange(_) => Err(PenumbraError::Invalid("index changes cannot modify data")),
            _ => Ok(()),
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.map.get(self.dag.as_read(), key)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> Result<bool> {
        self.map.has(self.dag.as_read(), key)
    }

    /// Whether the main map is empty.
    pub fn is_empty(&self) -> Result<bool> {
        self.map.is_empty(self.dag.as_read())
    }

    /// Scans the main map or, with `index_name`, a secondary index, seeing
    /// this write's own edits.
    pub fn scan(&self, opts: &ScanOptions) -> Result<Vec<ScanItem>> {
        let dag = self.dag.as_read();
        let map = match &opts.index_name {
            None => &self.map,
            Some(name) => {
                &self
                    .indexes
                    .iter()
                    .find(|i| &i.name == name)
                    .ok_or_else(|| PenumbraError::InvalidArgument(format!("unknown index {name}")))?
                    .map
            }
        };
        let view = map.read(dag);
        scan::collect(view.scan(&scan::start_key(opts)?)?, opts)
    }

    /// Stores `value` under `key`, keeping every covering index in step.
    pub fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.ensure_data_write()?;
        let dag = self.dag.as_read();
        let old = if self.indexes.iter().any(|i| covers(&i.definition, key)) {
            self.map.get(dag, key)?
        } else {
            None
        };
        for index in self.indexes.iter_mut().filter(|i| covers(&i.definition, key)) {
            if let Some(old) = &old {
                index_value(dag, &mut index.map, IndexOperation::Remove, key, old, &index.definition)?;
            }
            index_value(dag, &mut index.map, IndexOperation::Add, key, &value, &index.definition)?;
        }
        self.map.put(dag, key, value)
    }

    /// Removes `key`, returning whether it was present.
    pub fn del(&mut self, key: &str) -> Result<bool> {
        self.ensure_data_write()?;
        let dag = self.dag.as_read();
        if self.indexes.iter().any(|i| covers(&i.definition, key)) {
            if let Some(old) = self.map.get(dag, key)? {
                for index in self.indexes.iter_mut().filter(|i| covers(&i.definition, key)) {
                    index_value(dag, &mut index.map, IndexOperation::Remove, key, &old, &index.definition)?;
                }
            }
        }
        self.map.del(dag, key)
    }

    /// Removes every entry from the map and its indexes.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_data_write()?;
        self.map.clear();
        for index in &mut self.indexes {
            index.map.clear();
        }
        Ok(())
    }

    /// Adds an index built from the current map. Re-creating an index with
    /// the same definition is a no-op.
    pub fn create_index(&mut self, name: &str, definition: IndexDefinition) -> Result<()> {
        if !matches!(self.meta, Meta::IndexChange(_)) {
            return Err(PenumbraError::Invalid("indexes change through index change writes"));
        }
        if let Some(existing) = self.indexes.iter().find(|i| i.name == name) {
            if existing.definition == definition {
                return Ok(());
            }
            return Err(PenumbraError::InvalidArgument(format!(
                "index {name} exists with a different definition"
            )));
        }
        let map = build_index(self.dag.as_read(), &self.map, &definition, self.opts)?;
        debug!(index = name, "db.index.created");
        let at = self.indexes.partition_point(|i| i.name.as_str() < name);
        self.indexes.insert(
            at,
            IndexWrite {
                name: name.to_string(),
                definition,
                map,
            },
        );
        Ok(())
    }

    /// Removes an index.
    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        if !matches!(self.meta, Meta::IndexChange(_)) {
            return Err(PenumbraError::Invalid("indexes change through index change writes"));
        }
        let before = self.indexes.len();
        self.indexes.retain(|i| i.name != name);
        if self.indexes.len() == before {
            return Err(PenumbraError::InvalidArgument(format!("no index named {name}")));
        }
        Ok(())
    }

    /// Flushes the maps and stages the new commit chunk without moving any
    /// head or committing the transaction.
    pub fn put_commit(&mut self) -> Result<Commit> {
        let value_hash = self.map.flush(&mut *self.dag)?;
        let mut indexes = Vec::with_capacity(self.indexes.len());
        for index in &mut self.indexes {
            indexes.push(IndexRecord {
                name: index.name.clone(),
                definition: index.definition.clone(),
                value_hash: index.map.flush(&mut *self.dag)?,
            });
        }
        if let (Meta::IndexChange(_), Some(basis)) = (&self.meta, &self.basis) {
            if basis.value_hash() != value_hash {
                return Err(PenumbraError::Corruption("index change modified the value map"));
            }
        }
        let commit = Commit::create(
            &*self.dag,
            CommitData {
                meta: self.meta.clone(),
                value_hash,
                indexes,
            },
        )?;
        self.dag.put_chunk(commit.chunk().clone())?;
        Ok(commit)
    }

    /// Stages the commit, points `head` at it and commits the transaction.
    pub fn commit(mut self, head: &str) -> Result<Hash> {
        let commit = self.put_commit()?;
        self.dag.set_head(head, commit.hash())?;
        self.dag.commit()?;
        Ok(commit.hash())
    }

    /// Like [`commit`](Self::commit), also returning what changed relative
    /// to the basis.
    pub fn commit_with_diffs(mut self, head: &str) -> Result<(Hash, DiffsMap)> {
        let commit = self.put_commit()?;
        let diffs = diff_commits(self.basis.as_ref(), &commit, self.dag.as_read())?;
        self.dag.set_head(head, commit.hash())?;
        self.dag.commit()?;
        Ok((commit.hash(), diffs))
    }
}
