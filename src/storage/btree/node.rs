use std::cmp::Ordering;

use bytes::Bytes;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::dag::encode;
use crate::types::{Hash, PenumbraError, Result};

/// Fixed overhead charged to every node when sizing it.
pub const NODE_HEADER_SIZE: usize = 11;

/// Bytes charged per entry on top of its key and encoded value.
const ENTRY_OVERHEAD: usize = 4;

/// One sorted slot of a node. Leaves hold values, internal nodes hold the
/// hash of a child together with that child's largest key.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Entry<V> {
    pub key: String,
    pub value: V,
    pub size: usize,
}

impl<V: Serialize> Serialize for Entry<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.key, &self.value, self.size).serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Entry<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (key, value, size) = <(String, V, usize)>::deserialize(deserializer)?;
        Ok(Entry { key, value, size })
    }
}

/// Size charged for a leaf entry.
pub(crate) fn data_entry_size(key: &str, value: &Value) -> Result<usize> {
    Ok(key.len() + serde_json::to_vec(value)?.len() + ENTRY_OVERHEAD)
}

/// Size charged for an internal entry. Hashes encode as quoted hex.
pub(crate) fn internal_entry_size(key: &str) -> usize {
    key.len() + 2 * crate::types::hash::HASH_LEN + 2 + ENTRY_OVERHEAD
}

/// A decoded B-tree node.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Node {
    Data(Vec<Entry<Value>>),
    Internal { level: u8, entries: Vec<Entry<Hash>> },
}

impl Node {
    pub fn empty() -> Node {
        Node::Data(Vec::new())
    }

    pub fn level(&self) -> u8 {
        match self {
            Node::Data(_) => 0,
            Node::Internal { level, .. } => *level,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Data(entries) => entries.len(),
            Node::Internal { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_key(&self) -> Option<&str> {
        match self {
            Node::Data(entries) => entries.last().map(|e| e.key.as_str()),
            Node::Internal { entries, .. } => entries.last().map(|e| e.key.as_str()),
        }
    }

    /// Header plus the size of every entry.
    pub fn byte_size(&self) -> usize {
        let entries: usize = match self {
            Node::Data(entries) => entries.iter().map(|e| e.size).sum(),
            Node::Internal { entries, .. } => entries.iter().map(|e| e.size).sum(),
        };
        NODE_HEADER_SIZE + entries
    }

    /// Concatenates the entries of two sibling nodes.
    pub fn append(self, other: Node) -> Result<Node> {
        match (self, other) {
            (Node::Data(mut a), Node::Data(b)) => {
                a.extend(b);
                Ok(Node::Data(a))
            }
            (
                Node::Internal {
                    level,
                    entries: mut a,
                },
                Node::Internal {
                    level: other_level,
                    entries: b,
                },
            ) if level == other_level => {
                a.extend(b);
                Ok(Node::Internal { level, entries: a })
            }
            _ => Err(PenumbraError::Corruption("btree siblings at different levels")),
        }
    }

    /// Splits the node's entries into nodes of the same level sized between
    /// `min` and `max` (node header excluded).
    pub fn partition(self, min: usize, max: usize) -> Vec<Node> {
        match self {
            Node::Data(entries) => partition(entries, min, max)
                .into_iter()
                .map(Node::Data)
                .collect(),
            Node::Internal { level, entries } => partition(entries, min, max)
                .into_iter()
                .map(|entries| Node::Internal { level, entries })
                .collect(),
        }
    }

    /// Child hashes of an internal node.
    pub fn refs(&self) -> Vec<Hash> {
        match self {
            Node::Data(_) => Vec::new(),
            Node::Internal { entries, .. } => entries.iter().map(|e| e.value).collect(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Node::Data(entries) => encode(&(0u8, entries)),
            Node::Internal { level, entries } => encode(&(*level, entries)),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Node> {
        let (level, entries): (u8, Vec<Entry<Value>>) = serde_json::from_slice(data)?;
        if level == 0 {
            return Ok(Node::Data(entries));
        }
        let entries = entries
            .into_iter()
            .map(|e| {
                let hash = match e.value {
                    Value::String(s) => Hash::parse(&s)?,
                    _ => return Err(PenumbraError::Corruption("internal btree entry without hash")),
                };
                Ok(Entry {
                    key: e.key,
                    value: hash,
                    size: e.size,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Node::Internal { level, entries })
    }
}

/// Index of the first entry whose key is `>= key`, comparing UTF-8 bytes.
pub(crate) fn lower_bound<V>(entries: &[Entry<V>], key: &str) -> usize {
    entries.partition_point(|e| e.key.as_bytes().cmp(key.as_bytes()) == Ordering::Less)
}

/// True when `entries[i]` holds exactly `key`.
pub(crate) fn found_at<V>(entries: &[Entry<V>], i: usize, key: &str) -> bool {
    entries.get(i).is_some_and(|e| e.key == key)
}

/// Greedy partitioning: close a group as soon as it reaches `min`, give
/// entries of at least `max` their own group, and fold a small tail into
/// the last group when the result still fits in `max`.
pub(crate) fn partition<V>(entries: Vec<Entry<V>>, min: usize, max: usize) -> Vec<Vec<Entry<V>>> {
    let mut partitions: Vec<Vec<Entry<V>>> = Vec::new();
    let mut last_size = 0usize;
    let mut sum = 0usize;
    let mut accum: Vec<Entry<V>> = Vec::new();
    for entry in entries {
        let size = entry.size;
        if size >= max {
            if !accum.is_empty() {
                partitions.push(std::mem::take(&mut accum));
            }
            partitions.push(vec![entry]);
            last_size = size;
            sum = 0;
        } else if sum + size >= min {
            accum.push(entry);
            partitions.push(std::mem::take(&mut accum));
            last_size = sum + size;
            sum = 0;
        } else {
            sum += size;
            accum.push(entry);
        }
    }

    if !accum.is_empty() {
        match partitions.last_mut() {
            Some(last) if sum + last_size <= max => last.extend(accum),
            _ => partitions.push(accum),
        }
    }
    partitions
}
