use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::storage::dag::{encode, Chunk, DagRead, DagWrite};
use crate::types::{ClientId, Hash, MutationIds, PenumbraError, Result};

/// Working-copy main chain.
pub const DEFAULT_HEAD_NAME: &str = "default";
/// Scratch chain built while a pull is in flight.
pub const SYNC_HEAD_NAME: &str = "sync";
/// Scratch chain built while a refresh is in flight.
pub const REFRESH_HEAD_NAME: &str = "refresh";

/// Where to start reading the commit graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Whence {
    /// The commit a named head points at.
    Head(String),
    /// An explicit commit hash.
    Hash(Hash),
}

/// Base-of-chain marker written by sync or branch genesis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// Previous snapshot. Not a ref: older snapshots may be collected.
    pub basis_hash: Option<Hash>,
    /// Last mutation the server applied, per client.
    pub last_mutation_ids: MutationIds,
    /// Server-opaque sync position.
    pub cookie: Value,
}

/// A mutation applied locally and not yet folded into a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMeta {
    /// Commit this mutation was applied on.
    pub basis_hash: Hash,
    /// Snapshot at the bottom of the chain, kept for quick lookup.
    pub base_snapshot_hash: Hash,
    /// Per-client sequence number of this mutation.
    pub mutation_id: u64,
    /// Name of the mutator that produced the commit.
    pub mutator_name: String,
    /// Arguments the mutator was invoked with.
    pub mutator_args: Value,
    /// Hash of the commit before any rebase, `None` on the original.
    pub original_hash: Option<Hash>,
    /// Wall clock time of the original invocation, in milliseconds.
    pub timestamp: u64,
    /// Client that ran the mutation.
    pub client_id: ClientId,
}

/// Index definitions changed without touching data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexChangeMeta {
    /// Commit the index change was applied on.
    pub basis_hash: Hash,
}

/// Commit variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Meta {
    /// See [`SnapshotMeta`].
    Snapshot(SnapshotMeta),
    /// See [`LocalMeta`].
    Local(LocalMeta),
    /// See [`IndexChangeMeta`].
    IndexChange(IndexChangeMeta),
}

impl Meta {
    /// Previous commit in the chain. Snapshots may have none.
    pub fn basis_hash(&self) -> Option<Hash> {
        match self {
            Meta::Snapshot(m) => m.basis_hash,
            Meta::Local(m) => Some(m.basis_hash),
            Meta::IndexChange(m) => Some(m.basis_hash),
        }
    }
}

/// Secondary index over the main map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Only primary keys with this prefix are indexed.
    #[serde(default)]
    pub prefix: String,
    /// Location of the secondary key inside each value.
    pub json_pointer: String,
    /// Silently skip values without a usable secondary key.
    #[serde(default)]
    pub allow_empty: bool,
}

impl IndexDefinition {
    /// Definition indexing every key by `json_pointer`.
    pub fn new(json_pointer: impl Into<String>) -> Self {
        Self {
            json_pointer: json_pointer.into(),
            ..Self::default()
        }
    }

    /// Restricts the index to primary keys starting with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Allows values without a secondary key.
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }
}

/// Index definitions keyed by index name.
pub type IndexDefinitions = BTreeMap<String, IndexDefinition>;

/// One index as stored on a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    /// Index name.
    pub name: String,
    /// Index definition.
    pub definition: IndexDefinition,
    /// Root of the index map.
    pub value_hash: Hash,
}

/// Chunk payload of a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitData {
    /// Variant specific fields.
    pub meta: Meta,
    /// Root of the main map.
    pub value_hash: Hash,
    /// Secondary indexes, sorted by name.
    pub indexes: Vec<IndexRecord>,
}

impl CommitData {
    /// Chunks this commit keeps alive: the maps and, except for snapshots,
    /// the basis.
    pub fn refs(&self) -> Vec<Hash> {
        let mut refs: SmallVec<[Hash; 4]> = SmallVec::new();
        refs.push(self.value_hash);
        match &self.meta {
            Meta::Local(m) => refs.push(m.basis_hash),
            Meta::IndexChange(m) => refs.push(m.basis_hash),
            Meta::Snapshot(_) => {}
        }
        for index in &self.indexes {
            refs.push(index.value_hash);
        }
        let mut out: Vec<Hash> = Vec::with_capacity(refs.len());
        for hash in refs {
            if !out.contains(&hash) {
                out.push(hash);
            }
        }
        out
    }
}

/// A decoded commit together with its chunk.
#[derive(Clone, Debug)]
pub struct Commit {
    chunk: Chunk,
    data: Arc<CommitData>,
}

impl Commit {
    /// Decodes a commit chunk.
    pub fn from_chunk(chunk: Chunk) -> Result<Commit> {
        let data: CommitData = chunk.decode()?;
        Ok(Commit {
            chunk,
            data: Arc::new(data),
        })
    }

    /// Encodes `data` into a new chunk hashed by `dag`. Does not stage it.
    pub fn create(dag: &dyn DagWrite, data: CommitData) -> Result<Commit> {
        let chunk = dag.create_chunk(encode(&data)?, data.refs());
        Ok(Commit {
            chunk,
            data: Arc::new(data),
        })
    }

    /// Commit identity.
    pub fn hash(&self) -> Hash {
        self.chunk.hash()
    }

    /// Underlying chunk.
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Decoded payload.
    pub fn data(&self) -> &CommitData {
        &self.data
    }

    /// Variant specific fields.
    pub fn meta(&self) -> &Meta {
        &self.data.meta
    }

    /// Root of the main map.
    pub fn value_hash(&self) -> Hash {
        self.data.value_hash
    }

    /// Secondary indexes.
    pub fn indexes(&self) -> &[IndexRecord] {
        &self.data.indexes
    }

    /// Index definitions, keyed by name.
    pub fn index_definitions(&self) -> IndexDefinitions {
        self.data
            .indexes
            .iter()
            .map(|r| (r.name.clone(), r.definition.clone()))
            .collect()
    }

    /// Previous commit in the chain.
    pub fn basis_hash(&self) -> Option<Hash> {
        self.data.meta.basis_hash()
    }

    /// Local meta, if this is a local commit.
    pub fn as_local(&self) -> Option<&LocalMeta> {
        match &self.data.meta {
            Meta::Local(m) => Some(m),
            _ => None,
        }
    }

    /// Snapshot meta, if this is a snapshot.
    pub fn as_snapshot(&self) -> Option<&SnapshotMeta> {
        match &self.data.meta {
            Meta::Snapshot(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this is a local commit.
    pub fn is_local(&self) -> bool {
        self.as_local().is_some()
    }

    /// Whether this is a snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.as_snapshot().is_some()
    }

    /// Last mutation id of `client` as of this commit.
    pub fn mutation_id(&self, client: &ClientId, dag: &dyn DagRead) -> Result<u64> {
        let mut commit = self.clone();
        loop {
            let basis = match commit.meta() {
                Meta::Snapshot(m) => return Ok(m.last_mutation_ids.get(client).copied().unwrap_or(0)),
                Meta::Local(m) if &m.client_id == client => return Ok(m.mutation_id),
                Meta::Local(m) => m.basis_hash,
                Meta::IndexChange(m) => m.basis_hash,
            };
            commit = commit_from_hash(&basis, dag)?;
        }
    }

    /// Mutation id a new local commit of `client` on top of this one gets.
    pub fn next_mutation_id(&self, client: &ClientId, dag: &dyn DagRead) -> Result<u64> {
        Ok(self.mutation_id(client, dag)? + 1)
    }
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

/// Loads the commit stored under `hash`.
pub fn commit_from_hash(hash: &Hash, dag: &dyn DagRead) -> Result<Commit> {
    Commit::from_chunk(dag.must_get_chunk(hash)?)
}

/// Loads the commit a head points at.
pub fn commit_from_head(name: &str, dag: &dyn DagRead) -> Result<Commit> {
    commit_from_hash(&dag.must_get_head(name)?, dag)
}

/// Resolves `whence` to a commit.
pub fn read_commit(whence: &Whence, dag: &dyn DagRead) -> Result<Commit> {
    match whence {
        Whence::Head(name) => commit_from_head(name, dag),
        Whence::Hash(hash) => commit_from_hash(hash, dag),
    }
}

/// Snapshot at the bottom of the chain ending at `commit`.
pub fn base_snapshot(commit: &Commit, dag: &dyn DagRead) -> Result<Commit> {
    let mut commit = commit.clone();
    loop {
        let next = match commit.meta() {
            Meta::Snapshot(_) => return Ok(commit),
            Meta::Local(m) => m.base_snapshot_hash,
            Meta::IndexChange(m) => m.basis_hash,
        };
        commit = commit_from_hash(&next, dag)?;
    }
}

/// [`base_snapshot`] of the commit stored under `hash`.
pub fn base_snapshot_from_hash(hash: &Hash, dag: &dyn DagRead) -> Result<Commit> {
    base_snapshot(&commit_from_hash(hash, dag)?, dag)
}

/// Every commit from `hash` back to its base snapshot, both included,
/// head first.
pub fn chain(hash: &Hash, dag: &dyn DagRead) -> Result<Vec<Commit>> {
    let mut commit = commit_from_hash(hash, dag)?;
    let mut commits = Vec::new();
    while !commit.is_snapshot() {
        let basis = commit
            .basis_hash()
            .ok_or(PenumbraError::Corruption("non-snapshot commit without basis"))?;
        commits.push(commit);
        commit = commit_from_hash(&basis, dag)?;
    }
    commits.push(commit);
    Ok(commits)
}

/// Local commits between `hash` and its base snapshot, head first.
pub fn local_mutations(hash: &Hash, dag: &dyn DagRead) -> Result<Vec<Commit>> {
    Ok(chain(hash, dag)?
        .into_iter()
        .filter(Commit::is_local)
        .collect())
}

/// Local commits of the clients in `limits` whose mutation id is above the
/// client's limit, head first. Walking stops at the base snapshot or once
/// every client has reached its limit.
pub fn local_mutations_greater_than(
    commit: &Commit,
    limits: &MutationIds,
    dag: &dyn DagRead,
) -> Result<Vec<Commit>> {
    let mut remaining = limits.clone();
    let mut commits = Vec::new();
    let mut commit = commit.clone();
    while !commit.is_snapshot() && !remaining.is_empty() {
        if let Some(meta) = commit.as_local() {
            if let Some(limit) = remaining.get(&meta.client_id).copied() {
                if meta.mutation_id <= limit {
                    remaining.remove(&meta.client_id);
                } else {
                    commits.push(commit.clone());
                }
            }
        }
        let basis = commit
            .basis_hash()
            .ok_or(PenumbraError::Corruption("non-snapshot commit without basis"))?;
        commit = commit_from_hash(&basis, dag)?;
    }
    Ok(commits)
}

/// Orders two cookies. `null` sorts first; numbers and strings compare by
/// value, falling back to string order when either side is a string;
/// objects compare by their `order` field.
pub fn compare_cookies(a: &Value, b: &Value) -> Result<Ordering> {
    if a == b {
        return Ok(Ordering::Equal);
    }
    match (a, b) {
        (Value::Null, _) => return Ok(Ordering::Less),
        (_, Value::Null) => return Ok(Ordering::Greater),
        _ => {}
    }
    let (a, b) = (cookie_order(a)?, cookie_order(b)?);
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return Ok(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Ok(x.cmp(&y));
            }
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal))
        }
        (a, b) => Ok(cookie_string(a).cmp(&cookie_string(b))),
    }
}

fn cookie_order(cookie: &Value) -> Result<&Value> {
    let value = match cookie {
        Value::Object(map) => map.get("order").unwrap_or(&Value::Null),
        other => other,
    };
    match value {
        Value::Number(_) | Value::String(_) => Ok(value),
        _ => Err(PenumbraError::InvalidArgument(format!(
            "unsupported cookie {cookie}"
        ))),
    }
}

fn cookie_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
