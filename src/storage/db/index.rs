use serde_json::Value;
use tracing::debug;

use super::commit::IndexDefinition;
use crate::storage::btree::BTreeWrite;
use crate::storage::dag::DagRead;
use crate::types::{PenumbraError, Result};

const KEY_VERSION: char = '\u{0}';
const KEY_SEPARATOR: char = '\u{0}';

/// Encodes a `(secondary, primary)` pair as an index map key. Secondary keys
/// must not contain NUL so the pair decodes unambiguously.
pub fn encode_index_key(secondary: &str, primary: &str) -> Result<String> {
    if secondary.contains(KEY_SEPARATOR) {
        return Err(PenumbraError::Invalid("secondary index key contains NUL"));
    }
    let mut key = String::with_capacity(secondary.len() + primary.len() + 2);
    key.push(KEY_VERSION);
    key.push_str(secondary);
    key.push(KEY_SEPARATOR);
    key.push_str(primary);
    Ok(key)
}

/// Start key for scanning an index from `secondary` (and, when given,
/// from `primary` within it).
pub fn encode_index_scan_key(secondary: &str, primary: Option<&str>) -> Result<String> {
    let key = encode_index_key(secondary, primary.unwrap_or(""))?;
    Ok(match primary {
        Some(_) => key,
        None => key[..key.len() - KEY_SEPARATOR.len_utf8()].to_string(),
    })
}

/// Splits an index map key into `(secondary, primary)`.
pub fn decode_index_key(key: &str) -> Result<(&str, &str)> {
    let rest = key
        .strip_prefix(KEY_VERSION)
        .ok_or(PenumbraError::Corruption("index key with unknown version"))?;
    rest.split_once(KEY_SEPARATOR)
        .ok_or(PenumbraError::Corruption("index key without separator"))
}

/// Secondary keys `value` contributes: the string at the pointer, or every
/// string of the array at the pointer.
pub(crate) fn secondary_keys(value: &Value, json_pointer: &str) -> Option<Vec<String>> {
    match value.pointer(json_pointer)? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

/// Whether an index covers `key`.
pub(crate) fn covers(definition: &IndexDefinition, key: &str) -> bool {
    definition.prefix.is_empty() || key.starts_with(&definition.prefix)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IndexOperation {
    Add,
    Remove,
}

/// Adds or removes the index entries of one primary entry. Values without a
/// usable secondary key are left out of the index.
pub(crate) fn index_value(
    dag: &dyn DagRead,
    map: &mut BTreeWrite,
    op: IndexOperation,
    primary: &str,
    value: &Value,
    definition: &IndexDefinition,
) -> Result<()> {
    let Some(secondaries) = secondary_keys(value, &definition.json_pointer) else {
        if !definition.allow_empty {
            debug!(key = primary, pointer = %definition.json_pointer, "db.index.skip_value");
        }
        return Ok(());
    };
    for secondary in secondaries {
        let key = match encode_index_key(&secondary, primary) {
            Ok(key) => key,
            Err(err) => {
                debug!(key = primary, error = %err, "db.index.skip_value");
                continue;
            }
        };
        match op {
            IndexOperation::Add => map.put(dag, &key, value.clone())?,
            IndexOperation::Remove => {
                map.del(dag, &key)?;
            }
        }
    }
    Ok(())
}

/// One secondary index being edited by a write.
pub(crate) struct IndexWrite {
    pub name: String,
    pub definition: IndexDefinition,
    pub map: BTreeWrite,
}
