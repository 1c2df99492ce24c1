use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::registry::{read_map, update_map, write_map, RegistryMap};
use crate::storage::dag::{DagRead, DagWrite, Store};
use crate::storage::db::IndexDefinitions;
use crate::types::{BranchId, Hash, MutationIds, PenumbraError, Result};

/// Head under which the branch map lives.
pub const BRANCHES_HEAD_NAME: &str = "branches";

/// A synchronized unit of state shared by one or more clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Durable head commit of the branch.
    pub head_hash: Hash,
    /// Mutators every client on the branch registers.
    pub mutator_names: BTreeSet<String>,
    /// Index definitions every client on the branch uses.
    pub index_definitions: IndexDefinitions,
    /// Last mutation id per client reflected in the branch chain.
    pub mutation_ids: MutationIds,
    /// Last mutation id per client the server has acknowledged.
    pub last_server_ackd_mutation_ids: MutationIds,
    /// Set once the server no longer knows the branch's clients.
    #[serde(default)]
    pub disabled: bool,
}

impl Branch {
    /// Whether some client has mutations the server has not acknowledged.
    pub fn has_pending_mutations(&self) -> bool {
        self.mutation_ids.iter().any(|(client, id)| {
            match self.last_server_ackd_mutation_ids.get(client) {
                Some(ackd) => ackd < id,
                None => *id != 0,
            }
        })
    }
}

/// Branches by id.
pub type BranchMap = BTreeMap<BranchId, Branch>;

impl RegistryMap for BranchMap {
    const HEAD: &'static str = BRANCHES_HEAD_NAME;

    fn refs(&self) -> Vec<Hash> {
        self.values().map(|b| b.head_hash).collect()
    }
}

/// Every branch.
pub fn get_branches(dag: &dyn DagRead) -> Result<BranchMap> {
    read_map(dag)
}

/// One branch, if present.
pub fn get_branch(id: &BranchId, dag: &dyn DagRead) -> Result<Option<Branch>> {
    Ok(get_branches(dag)?.remove(id))
}

/// One branch that must be present.
pub fn must_get_branch(id: &BranchId, dag: &dyn DagRead) -> Result<Branch> {
    get_branch(id, dag)?.ok_or_else(|| PenumbraError::BranchStateNotFound { id: id.clone() })
}

/// Replaces the whole branch map.
///
/// The mutator set and index definitions of a branch are fixed at creation;
/// a map changing either for an existing id is rejected.
pub fn set_branches(branches: &BranchMap, dag: &mut dyn DagWrite) -> Result<Hash> {
    let current = get_branches(dag.as_read())?;
    for (id, branch) in branches {
        if let Some(old) = current.get(id) {
            validate_change(id, old, branch)?;
        }
    }
    write_map(dag, branches)
}

/// Inserts or replaces one branch.
pub fn set_branch(id: &BranchId, branch: Branch, dag: &mut dyn DagWrite) -> Result<Hash> {
    let mut branches = get_branches(dag.as_read())?;
    if let Some(old) = branches.get(id) {
        validate_change(id, old, &branch)?;
    }
    branches.insert(id.clone(), branch);
    write_map(dag, &branches)
}

/// Removes one branch.
pub fn delete_branch(id: &BranchId, dag: &mut dyn DagWrite) -> Result<Hash> {
    let mut branches = get_branches(dag.as_read())?;
    branches.remove(id);
    write_map(dag, &branches)
}

/// Marks a branch as disabled. Missing branches are ignored.
pub fn disable_branch(id: &BranchId, dag: &mut dyn DagWrite) -> Result<()> {
    let Some(mut branch) = get_branch(id, dag.as_read())? else {
        return Ok(());
    };
    if !branch.disabled {
        branch.disabled = true;
        set_branch(id, branch, dag)?;
        info!(branch = %id, "persist.branch.disabled");
    }
    Ok(())
}

/// Optimistic read-modify-write of the branch map.
pub fn update_branches<F>(store: &dyn Store, transform: F) -> Result<BranchMap>
where
    F: FnMut(&BranchMap) -> Result<Option<BranchMap>>,
{
    update_map(store, None, transform)
}

fn validate_change(id: &BranchId, old: &Branch, new: &Branch) -> Result<()> {
    if old.mutator_names != new.mutator_names {
        return Err(PenumbraError::InvalidArgument(format!(
            "mutator names of branch {id} cannot change"
        )));
    }
    if old.index_definitions != new.index_definitions {
        return Err(PenumbraError::InvalidArgument(format!(
            "index definitions of branch {id} cannot change"
        )));
    }
    Ok(())
}
