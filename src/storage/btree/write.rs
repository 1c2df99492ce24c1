use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;

use super::node::{
    data_entry_size, found_at, internal_entry_size, lower_bound, Entry, Node, NODE_HEADER_SIZE,
};
use super::read::{self, NodeCache, NodeSource, Scan};
use super::BTreeOptions;
use crate::storage::dag::{DagRead, DagWrite};
use crate::types::{Hash, PenumbraError, Result};

/// Copy-on-write editor over one version of an ordered map.
///
/// Edited nodes live in memory under temporary hashes until [`flush`]
/// writes them as chunks. Subtrees the edits never touched keep their
/// original hashes, so the flushed tree shares them with its basis.
///
/// The editor does not own a chunk store; every call takes the
/// transaction it should read through, which lets several maps be edited
/// inside one write transaction.
///
/// [`flush`]: BTreeWrite::flush
pub struct BTreeWrite {
    root: Hash,
    modified: FxHashMap<Hash, Arc<Node>>,
    cache: NodeCache,
    opts: BTreeOptions,
    next_temp: u64,
}

struct WriteNodes<'t> {
    tree: &'t BTreeWrite,
    dag: &'t dyn DagRead,
}

impl NodeSource for WriteNodes<'_> {
    fn node(&self, hash: &Hash) -> Result<Arc<Node>> {
        self.tree.load(self.dag, hash)
    }
}

/// A read view over a [`BTreeWrite`], including its unflushed edits.
pub struct WriteView<'t> {
    nodes: WriteNodes<'t>,
}

impl WriteView<'_> {
    /// Ordered entries starting at the first key `>= from_key`.
    pub fn scan(&self, from_key: &str) -> Result<Scan<'_>> {
        Scan::new(&self.nodes, self.nodes.tree.root, from_key)
    }
}

impl BTreeWrite {
    /// Starts editing the map rooted at `root`.
    pub fn new(root: Hash, opts: BTreeOptions) -> Self {
        Self {
            root,
            modified: FxHashMap::default(),
            cache: NodeCache::new(),
            opts,
            next_temp: 0,
        }
    }

    /// Current root. Temporary until the tree is flushed.
    pub fn root(&self) -> Hash {
        self.root
    }

    fn load(&self, dag: &dyn DagRead, hash: &Hash) -> Result<Arc<Node>> {
        if let Some(node) = self.modified.get(hash) {
            return Ok(Arc::clone(node));
        }
        self.cache.load(dag, hash)
    }

    /// Loads a node for editing. Temporary nodes are unlinked first, so the
    /// returned copy is usually the only one and is taken without cloning.
    fn take(&mut self, dag: &dyn DagRead, hash: &Hash) -> Result<Node> {
        let node = self.load(dag, hash)?;
        if hash.is_temp() {
            self.modified.remove(hash);
        }
        Ok(Arc::unwrap_or_clone(node))
    }

    fn stage(&mut self, node: Node) -> Hash {
        self.next_temp += 1;
        let hash = Hash::temp(self.next_temp);
        self.modified.insert(hash, Arc::new(node));
        hash
    }

    fn stage_entry(&mut self, node: Node) -> Result<Entry<Hash>> {
        let key = node
            .max_key()
            .ok_or(PenumbraError::Corruption("staging an empty btree child"))?
            .to_string();
        let size = internal_entry_size(&key);
        Ok(Entry {
            key,
            value: self.stage(node),
            size,
        })
    }

    /// Value stored under `key`, including unflushed edits.
    pub fn get(&self, dag: &dyn DagRead, key: &str) -> Result<Option<Value>> {
        read::get(&WriteNodes { tree: self, dag }, self.root, key)
    }

    /// Whether `key` is present.
    pub fn has(&self, dag: &dyn DagRead, key: &str) -> Result<bool> {
        Ok(self.get(dag, key)?.is_some())
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self, dag: &dyn DagRead) -> Result<bool> {
        Ok(self.load(dag, &self.root)?.is_empty())
    }

    /// A read view for scanning, borrowing the editor and the transaction.
    pub fn read<'t>(&'t self, dag: &'t dyn DagRead) -> WriteView<'t> {
        WriteView {
            nodes: WriteNodes { tree: self, dag },
        }
    }

    /// Inserts or replaces `key`.
    pub fn put(&mut self, dag: &dyn DagRead, key: &str, value: Value) -> Result<()> {
        let size = data_entry_size(key, &value)?;
        let root = self.root;
        let node = self.set(dag, &root, key, value, size)?;
        if node.byte_size() > self.opts.max_size {
            let level = node.level();
            let parts = node.partition(self.min_payload(), self.max_payload());
            trace!(level, parts = parts.len(), "btree.root.split");
            let mut entries = Vec::with_capacity(parts.len());
            for part in parts {
                entries.push(self.stage_entry(part)?);
            }
            self.root = self.stage(Node::Internal {
                level: level + 1,
                entries,
            });
        } else {
            self.root = self.stage(node);
        }
        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    pub fn del(&mut self, dag: &dyn DagRead, key: &str) -> Result<bool> {
        let root = self.root;
        let Some(mut node) = self.remove(dag, &root, key)? else {
            return Ok(false);
        };
        while let Node::Internal { entries, .. } = &node {
            if entries.len() != 1 {
                break;
            }
            let only = entries[0].value;
            node = self.take(dag, &only)?;
        }
        self.root = if node.is_empty() {
            Hash::EMPTY
        } else {
            self.stage(node)
        };
        Ok(true)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.modified.clear();
        self.root = Hash::EMPTY;
    }

    /// Writes every edited node into `dag` and returns the new root.
    /// The empty map is written as an empty leaf chunk.
    pub fn flush(&mut self, dag: &mut dyn DagWrite) -> Result<Hash> {
        if self.root.is_empty() {
            let chunk = dag.create_chunk(Node::empty().encode()?, Vec::new());
            let hash = chunk.hash();
            dag.put_chunk(chunk)?;
            self.root = hash;
            return Ok(hash);
        }
        let root = self.root;
        let mut written = 0usize;
        let hash = self.gather(dag, root, &mut written)?;
        self.modified.clear();
        self.root = hash;
        trace!(root = %hash, chunks = written, "btree.flush");
        Ok(hash)
    }

    fn gather(&mut self, dag: &mut dyn DagWrite, hash: Hash, written: &mut usize) -> Result<Hash> {
        let Some(node) = self.modified.remove(&hash) else {
            return Ok(hash);
        };
        let mut node = Arc::unwrap_or_clone(node);
        if let Node::Internal { entries, .. } = &mut node {
            for entry in entries.iter_mut() {
                entry.value = self.gather(dag, entry.value, written)?;
            }
        }
        let chunk = dag.create_chunk(node.encode()?, node.refs());
        let flushed = chunk.hash();
        dag.put_chunk(chunk)?;
        self.cache.insert(flushed, Arc::new(node));
        *written += 1;
        Ok(flushed)
    }

    fn min_payload(&self) -> usize {
        self.opts.min_size.saturating_sub(NODE_HEADER_SIZE)
    }

    fn max_payload(&self) -> usize {
        self.opts.max_size.saturating_sub(NODE_HEADER_SIZE)
    }

    fn set(
        &mut self,
        dag: &dyn DagRead,
        hash: &Hash,
        key: &str,
        value: Value,
        size: usize,
    ) -> Result<Node> {
        let mut node = self.take(dag, hash)?;
        match &mut node {
            Node::Data(entries) => {
                let i = lower_bound(entries, key);
                let entry = Entry {
                    key: key.to_string(),
                    value,
                    size,
                };
                if found_at(entries, i, key) {
                    entries[i] = entry;
                } else {
                    entries.insert(i, entry);
                }
            }
            Node::Internal { entries, .. } => {
                if entries.is_empty() {
                    return Err(PenumbraError::Corruption("internal btree node without children"));
                }
                let i = lower_bound(entries, key).min(entries.len() - 1);
                let child_hash = entries[i].value;
                let child = self.set(dag, &child_hash, key, value, size)?;
                let child_size = child.byte_size();
                if child_size > self.opts.max_size || child_size < self.opts.min_size {
                    self.merge_and_partition(dag, entries, i, child)?;
                } else {
                    entries[i] = self.stage_entry(child)?;
                }
            }
        }
        Ok(node)
    }

    /// Returns `None` when `key` is absent, leaving the tree untouched.
    fn remove(&mut self, dag: &dyn DagRead, hash: &Hash, key: &str) -> Result<Option<Node>> {
        let node = self.load(dag, hash)?;
        let (i, child_hash) = match &*node {
            Node::Data(entries) => {
                let i = lower_bound(entries, key);
                if !found_at(entries, i, key) {
                    return Ok(None);
                }
                (i, None)
            }
            Node::Internal { entries, .. } => {
                let i = lower_bound(entries, key);
                match entries.get(i) {
                    Some(e) => (i, Some(e.value)),
                    None => return Ok(None),
                }
            }
        };
        drop(node);

        let child = match child_hash {
            Some(child_hash) => match self.remove(dag, &child_hash, key)? {
                Some(child) => Some(child),
                None => return Ok(None),
            },
            None => None,
        };
        let mut node = self.take(dag, hash)?;
        match (&mut node, child) {
            (Node::Data(entries), _) => {
                entries.remove(i);
            }
            (Node::Internal { entries, .. }, Some(child)) => {
                if child.is_empty() {
                    entries.remove(i);
                } else if child.byte_size() > self.opts.min_size {
                    entries[i] = self.stage_entry(child)?;
                } else {
                    self.merge_and_partition(dag, entries, i, child)?;
                }
            }
            (Node::Internal { .. }, None) => {}
        }
        Ok(Some(node))
    }

    /// Merges the edited child at `i` with a neighbour (the previous one when
    /// there is one) and splices the re-partitioned result back in.
    fn merge_and_partition(
        &mut self,
        dag: &dyn DagRead,
        entries: &mut Vec<Entry<Hash>>,
        i: usize,
        child: Node,
    ) -> Result<()> {
        let (start, remove, merged) = if i > 0 {
            let sibling = entries[i - 1].value;
            let sibling = self.take(dag, &sibling)?;
            (i - 1, 2, sibling.append(child)?)
        } else if i + 1 < entries.len() {
            let sibling = entries[i + 1].value;
            let sibling = self.take(dag, &sibling)?;
            (i, 2, child.append(sibling)?)
        } else {
            (i, 1, child)
        };
        let parts = merged.partition(self.min_payload(), self.max_payload());
        let mut replacement = Vec::with_capacity(parts.len());
        for part in parts {
            replacement.push(self.stage_entry(part)?);
        }
        entries.splice(start..start + remove, replacement);
        Ok(())
    }
}
