#![forbid(unsafe_code)]

//! Persistent ordered map stored as a tree of chunks.
//!
//! Keys are strings compared by their UTF-8 bytes; values are JSON. Every
//! node is one chunk, so a root hash names an immutable version of the map
//! and edits share every untouched subtree with the version they started
//! from.

/// Node layout, sizing and partitioning.
mod node;
/// Readers, scans and structural diff.
mod read;
/// Copy-on-write editor.
mod write;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use node::NODE_HEADER_SIZE;
pub use read::{all_entries_as_diff, diff, BTreeRead, Scan};
pub use write::{BTreeWrite, WriteView};

/// Node size thresholds in bytes, header included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BTreeOptions {
    /// Nodes smaller than this are merged with a sibling.
    pub min_size: usize,
    /// Nodes larger than this are split.
    pub max_size: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            min_size: 8 * 1024,
            max_size: 16 * 1024,
        }
    }
}

impl BTreeOptions {
    /// Sets both thresholds.
    pub fn with_sizes(min_size: usize, max_size: usize) -> Self {
        Self { min_size, max_size }
    }
}

/// One change between two versions of a map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DiffOperation {
    /// `key` is new.
    Add {
        /// Affected key.
        key: String,
        /// Value after the change.
        #[serde(rename = "newValue")]
        new_value: Value,
    },
    /// `key` was removed.
    Del {
        /// Affected key.
        key: String,
        /// Value before the change.
        #[serde(rename = "oldValue")]
        old_value: Value,
    },
    /// `key` holds a different value.
    Change {
        /// Affected key.
        key: String,
        /// Value before the change.
        #[serde(rename = "oldValue")]
        old_value: Value,
        /// Value after the change.
        #[serde(rename = "newValue")]
        new_value: Value,
    },
}

impl DiffOperation {
    /// Key the operation applies to.
    pub fn key(&self) -> &str {
        match self {
            DiffOperation::Add { key, .. }
            | DiffOperation::Del { key, .. }
            | DiffOperation::Change { key, .. } => key,
        }
    }

    /// Value after the operation, `None` for deletes.
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            DiffOperation::Add { new_value, .. } | DiffOperation::Change { new_value, .. } => {
                Some(new_value)
            }
            DiffOperation::Del { .. } => None,
        }
    }
}
