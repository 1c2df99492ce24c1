use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use super::commit::Commit;
use super::transaction::WriteTransaction;
use super::write::{MutationInfo, Write};
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::DagWrite;
use crate::types::{ClientId, Hash, PenumbraError, Result};

/// An application mutation: reads and writes through the transaction,
/// driven only by its arguments so it can be replayed on any basis.
pub type Mutator = Arc<dyn Fn(&mut WriteTransaction<'_, '_>, &Value) -> Result<()> + Send + Sync>;

/// Mutators by name.
pub type Mutators = BTreeMap<String, Mutator>;

/// Replays a local commit on top of `basis` and leaves the result in a
/// pending write.
///
/// The new commit keeps the mutation id, arguments and timestamp of the
/// original and points `original_hash` at the first incarnation of the
/// mutation. A mutator missing from `mutators` replays as a no-op.
fn rebase_mutation<'a>(
    commit: &Commit,
    dag: &'a mut dyn DagWrite,
    basis: Hash,
    mutators: &Mutators,
    client_id: &ClientId,
    opts: BTreeOptions,
) -> Result<Write<'a>> {
    let meta = commit
        .as_local()
        .ok_or(PenumbraError::Invalid("only local commits can be rebased"))?;
    if &meta.client_id != client_id {
        return Err(PenumbraError::InvalidArgument(format!(
            "commit {} belongs to client {}, not {}",
            commit.hash(),
            meta.client_id,
            client_id
        )));
    }
    let mutation = MutationInfo {
        client_id: client_id.clone(),
        mutator_name: meta.mutator_name.clone(),
        mutator_args: meta.mutator_args.clone(),
        original_hash: Some(meta.original_hash.unwrap_or_else(|| commit.hash())),
        timestamp: meta.timestamp,
    };
    let mut write = Write::new_local(dag, basis, mutation, opts)?;
    let expected = write.mutation_id()?;
    if expected != meta.mutation_id {
        return Err(PenumbraError::InconsistentMutation {
            expected,
            actual: meta.mutation_id,
        });
    }

    match mutators.get(&meta.mutator_name) {
        Some(mutator) => {
            let mut tx = WriteTransaction::new(&mut write)?;
            mutator(&mut tx, &meta.mutator_args)?;
        }
        None => warn!(
            mutator = %meta.mutator_name,
            mutation_id = meta.mutation_id,
            client = %client_id,
            "db.rebase.unknown_mutator"
        ),
    }
    trace!(from = %commit.hash(), basis = %basis, "db.rebase");
    Ok(write)
}

/// Replays `commit` onto `basis` and stages the new commit without moving
/// any head.
pub fn rebase_mutation_and_put_commit(
    commit: &Commit,
    dag: &mut dyn DagWrite,
    basis: Hash,
    mutators: &Mutators,
    client_id: &ClientId,
    opts: BTreeOptions,
) -> Result<Commit> {
    let mut write = rebase_mutation(commit, dag, basis, mutators, client_id, opts)?;
    write.put_commit()
}

/// Replays `commit` onto `basis`, points `head` at the result and commits.
pub fn rebase_mutation_and_commit(
    commit: &Commit,
    dag: &mut dyn DagWrite,
    basis: Hash,
    head: &str,
    mutators: &Mutators,
    client_id: &ClientId,
    opts: BTreeOptions,
) -> Result<Hash> {
    rebase_mutation(commit, dag, basis, mutators, client_id, opts)?.commit(head)
}
