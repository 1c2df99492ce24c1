use std::cell::RefCell;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use super::node::{found_at, lower_bound, Entry, Node};
use super::DiffOperation;
use crate::storage::dag::DagRead;
use crate::types::{Hash, PenumbraError, Result};

/// Resolves node hashes for the read algorithms shared by readers and writers.
pub(crate) trait NodeSource {
    fn node(&self, hash: &Hash) -> Result<Arc<Node>>;
}

/// Decoded nodes loaded from a chunk store, memoized for the life of a reader.
pub(crate) struct NodeCache {
    nodes: RefCell<FxHashMap<Hash, Arc<Node>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self {
            nodes: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn load(&self, dag: &dyn DagRead, hash: &Hash) -> Result<Arc<Node>> {
        if hash.is_empty() {
            return Ok(Arc::new(Node::empty()));
        }
        if hash.is_temp() {
            return Err(PenumbraError::Corruption("unflushed btree node escaped its writer"));
        }
        if let Some(node) = self.nodes.borrow().get(hash) {
            return Ok(Arc::clone(node));
        }
        let chunk = dag.must_get_chunk(hash)?;
        let node = Arc::new(Node::decode(chunk.data())?);
        self.nodes.borrow_mut().insert(*hash, Arc::clone(&node));
        Ok(node)
    }

    pub fn insert(&self, hash: Hash, node: Arc<Node>) {
        self.nodes.borrow_mut().insert(hash, node);
    }
}

/// Read-only view of one version of an ordered map.
///
/// A reader is bound to a single root hash; lookups against it keep
/// returning that version regardless of later writes to the store.
pub struct BTreeRead<'a> {
    dag: &'a dyn DagRead,
    root: Hash,
    cache: NodeCache,
}

impl<'a> BTreeRead<'a> {
    /// Opens the map rooted at `root`. `Hash::EMPTY` is the empty map.
    pub fn new(dag: &'a dyn DagRead, root: Hash) -> Self {
        Self {
            dag,
            root,
            cache: NodeCache::new(),
        }
    }

    /// Root hash this reader is bound to.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        get(self, self.root, key)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.node(&self.root)?.is_empty())
    }

    /// Ordered entries starting at the first key `>= from_key`.
    pub fn scan(&self, from_key: &str) -> Result<Scan<'_>> {
        Scan::new(self, self.root, from_key)
    }

    /// Every entry in key order.
    pub fn entries(&self) -> Result<Scan<'_>> {
        self.scan("")
    }

    /// Every key in order.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.entries()?.map(|e| e.map(|(k, _)| k)).collect()
    }
}

impl NodeSource for BTreeRead<'_> {
    fn node(&self, hash: &Hash) -> Result<Arc<Node>> {
        self.cache.load(self.dag, hash)
    }
}

pub(crate) fn find_leaf<S: NodeSource + ?Sized>(
    source: &S,
    root: Hash,
    key: &str,
) -> Result<Arc<Node>> {
    let mut node = source.node(&root)?;
    loop {
        let child = match &*node {
            Node::Data(_) => return Ok(node),
            Node::Internal { entries, .. } => {
                if entries.is_empty() {
                    return Ok(Arc::new(Node::empty()));
                }
                let i = lower_bound(entries, key).min(entries.len() - 1);
                entries[i].value
            }
        };
        node = source.node(&child)?;
    }
}

pub(crate) fn get<S: NodeSource + ?Sized>(
    source: &S,
    root: Hash,
    key: &str,
) -> Result<Option<Value>> {
    let leaf = find_leaf(source, root, key)?;
    match &*leaf {
        Node::Data(entries) => {
            let i = lower_bound(entries, key);
            Ok(found_at(entries, i, key).then(|| entries[i].value.clone()))
        }
        Node::Internal { .. } => Ok(None),
    }
}

struct Frame {
    node: Arc<Node>,
    pos: usize,
}

/// Lazy in-order iterator over a map's entries.
///
/// Nodes are loaded one at a time as the walk reaches them; dropping the
/// iterator early leaves the rest of the tree untouched. Start a new scan
/// from the last seen key to resume.
pub struct Scan<'t> {
    source: &'t dyn NodeSource,
    stack: Vec<Frame>,
}

impl<'t> Scan<'t> {
    pub(crate) fn new(source: &'t dyn NodeSource, root: Hash, from_key: &str) -> Result<Self> {
        let mut stack = Vec::new();
        let mut node = source.node(&root)?;
        loop {
            let pos = match &*node {
                Node::Data(entries) => lower_bound(entries, from_key),
                Node::Internal { entries, .. } => lower_bound(entries, from_key),
            };
            let child = match &*node {
                Node::Internal { entries, .. } => entries.get(pos).map(|e| e.value),
                Node::Data(_) => None,
            };
            match child {
                Some(child) => {
                    stack.push(Frame {
                        node,
                        pos: pos + 1,
                    });
                    node = source.node(&child)?;
                }
                None => {
                    stack.push(Frame { node, pos });
                    break;
                }
            }
        }
        Ok(Self { source, stack })
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<(String, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let child = match &*frame.node {
                Node::Data(entries) => match entries.get(frame.pos) {
                    Some(e) => {
                        frame.pos += 1;
                        return Some(Ok((e.key.clone(), e.value.clone())));
                    }
                    None => None,
                },
                Node::Internal { entries, .. } => entries.get(frame.pos).map(|e| e.value),
            };
            match child {
                Some(hash) => {
                    frame.pos += 1;
                    match self.source.node(&hash) {
                        Ok(node) => self.stack.push(Frame { node, pos: 0 }),
                        Err(err) => {
                            self.stack.clear();
                            return Some(Err(err));
                        }
                    }
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// Structural diff of two maps, in key order.
///
/// Both sides are walked level by level. Children whose hash appears on
/// both sides hold the same entries and are skipped without being loaded.
pub fn diff(old: &BTreeRead<'_>, new: &BTreeRead<'_>) -> Result<Vec<DiffOperation>> {
    diff_roots(old, old.root, new, new.root)
}

pub(crate) fn diff_roots(
    old_source: &dyn NodeSource,
    old_root: Hash,
    new_source: &dyn NodeSource,
    new_root: Hash,
) -> Result<Vec<DiffOperation>> {
    let mut out = Vec::new();
    if old_root == new_root {
        return Ok(out);
    }
    let mut old = old_source.node(&old_root)?;
    let mut new = new_source.node(&new_root)?;
    loop {
        if old.level() > new.level() {
            old = Arc::new(expand(old_source, &old, &FxHashSet::default())?);
            continue;
        }
        if new.level() > old.level() {
            new = Arc::new(expand(new_source, &new, &FxHashSet::default())?);
            continue;
        }
        match (&*old, &*new) {
            (Node::Data(a), Node::Data(b)) => {
                diff_entries(a, b, &mut out);
                return Ok(out);
            }
            (Node::Internal { entries: a, .. }, Node::Internal { entries: b, .. }) => {
                let old_hashes: FxHashSet<Hash> = a.iter().map(|e| e.value).collect();
                let shared: FxHashSet<Hash> = b
                    .iter()
                    .map(|e| e.value)
                    .filter(|h| old_hashes.contains(h))
                    .collect();
                let next_old = expand(old_source, &old, &shared)?;
                let next_new = expand(new_source, &new, &shared)?;
                old = Arc::new(next_old);
                new = Arc::new(next_new);
            }
            _ => return Err(PenumbraError::Corruption("btree node level mismatch")),
        }
    }
}

/// Concatenates the children of an internal node one level down, leaving
/// out the ones listed in `skip`.
fn expand(source: &dyn NodeSource, node: &Node, skip: &FxHashSet<Hash>) -> Result<Node> {
    let (level, entries) = match node {
        Node::Internal { level, entries } => (*level, entries),
        Node::Data(_) => return Err(PenumbraError::Corruption("expanding a leaf")),
    };
    let mut out = if level == 1 {
        Node::Data(Vec::new())
    } else {
        Node::Internal {
            level: level - 1,
            entries: Vec::new(),
        }
    };
    for entry in entries.iter().filter(|e| !skip.contains(&e.value)) {
        let child = source.node(&entry.value)?;
        out = out.append(Arc::unwrap_or_clone(child))?;
    }
    Ok(out)
}

fn diff_entries(old: &[Entry<Value>], new: &[Entry<Value>], out: &mut Vec<DiffOperation>) {
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        let (a, b) = (&old[i], &new[j]);
        match a.key.as_bytes().cmp(b.key.as_bytes()) {
            std::cmp::Ordering::Equal => {
                if a.value != b.value {
                    out.push(DiffOperation::Change {
                        key: a.key.clone(),
                        old_value: a.value.clone(),
                        new_value: b.value.clone(),
                    });
                }
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                out.push(DiffOperation::Del {
                    key: a.key.clone(),
                    old_value: a.value.clone(),
                });
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(DiffOperation::Add {
                    key: b.key.clone(),
                    new_value: b.value.clone(),
                });
                j += 1;
            }
        }
    }
    out.extend(old[i..].iter().map(|a| DiffOperation::Del {
        key: a.key.clone(),
        old_value: a.value.clone(),
    }));
    out.extend(new[j..].iter().map(|b| DiffOperation::Add {
        key: b.key.clone(),
        new_value: b.value.clone(),
    }));
}

/// Every entry of `map` as an add (or, when `as_del`, a delete) operation.
pub fn all_entries_as_diff(map: &BTreeRead<'_>, as_del: bool) -> Result<Vec<DiffOperation>> {
    map.entries()?
        .map(|entry| {
            let (key, value) = entry?;
            Ok(if as_del {
                DiffOperation::Del {
                    key,
                    old_value: value,
                }
            } else {
                DiffOperation::Add {
                    key,
                    new_value: value,
                }
            })
        })
        .collect()
}
