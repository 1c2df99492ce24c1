use std::collections::BTreeMap;

use super::commit::Commit;
use crate::storage::btree::{all_entries_as_diff, diff, BTreeRead, DiffOperation};
use crate::storage::dag::DagRead;
use crate::types::Result;

/// Name under which the main map's diff is reported.
pub const MAIN_MAP: &str = "";

/// Changes per map: [`MAIN_MAP`] for the main map, index names otherwise.
/// Maps without changes are left out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffsMap(BTreeMap<String, Vec<DiffOperation>>);

impl DiffsMap {
    /// An empty set of changes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the changes of one map, dropping empty ones.
    pub fn insert(&mut self, name: impl Into<String>, ops: Vec<DiffOperation>) {
        if !ops.is_empty() {
            self.0.insert(name.into(), ops);
        }
    }

    /// Changes to the named map.
    pub fn get(&self, name: &str) -> Option<&[DiffOperation]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Changes to the main map.
    pub fn main(&self) -> &[DiffOperation] {
        self.get(MAIN_MAP).unwrap_or(&[])
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(map name, changes)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[DiffOperation])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Diffs the main map and every index between two commits. Indexes that
/// exist on one side only show up as all adds or all deletes.
pub fn diff_commits(old: Option<&Commit>, new: &Commit, dag: &dyn DagRead) -> Result<DiffsMap> {
    let mut out = DiffsMap::new();
    let new_map = BTreeRead::new(dag, new.value_hash());
    let main = match old {
        Some(old) => diff(&BTreeRead::new(dag, old.value_hash()), &new_map)?,
        None => Vec::new(),
    };
    out.insert(MAIN_MAP, main);

    let old_indexes = old.map(Commit::indexes).unwrap_or(&[]);
    for record in new.indexes() {
        let new_index = BTreeRead::new(dag, record.value_hash);
        let ops = match old_indexes.iter().find(|r| r.name == record.name) {
            Some(old) => diff(&BTreeRead::new(dag, old.value_hash), &new_index)?,
            None => all_entries_as_diff(&new_index, false)?,
        };
        out.insert(record.name.clone(), ops);
    }
    for record in old_indexes {
        if !new.indexes().iter().any(|r| r.name == record.name) {
            let ops = all_entries_as_diff(&BTreeRead::new(dag, record.value_hash), true)?;
            out.insert(record.name.clone(), ops);
        }
    }
    Ok(out)
}
