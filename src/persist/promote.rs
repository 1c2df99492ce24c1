//! Promotion of the working store into the durable store.

use std::cmp::Ordering;

use tracing::{debug, info};

use super::branches::{must_get_branch, set_branch, BRANCHES_HEAD_NAME};
use super::clients::{must_get_client, set_client};
use super::ensure_open;
use crate::primitives::concurrency::Shutdown;
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::{with_read, with_write, DagWrite, LazyStore, Store};
use crate::storage::db::{
    base_snapshot, commit_from_hash, commit_from_head, compare_cookies, local_mutations,
    local_mutations_greater_than, rebase_mutation_and_put_commit, Commit, Mutators,
    DEFAULT_HEAD_NAME,
};
use crate::types::{now_ms, ClientId, Hash, MutationIds, PenumbraError, Result};

/// Everything read up front, before the durable write.
struct Observed {
    branches_head: Option<Hash>,
    perdag_snapshot: Commit,
    memdag_snapshot: Commit,
    mutations: Vec<Commit>,
}

enum Outcome {
    Done,
    Retry,
}

/// Copies the client's working state into its durable branch.
///
/// When the working store holds a newer snapshot than the branch, the
/// snapshot's chunks are written durably and the branch's own pending
/// mutations are replayed on top of it. Local mutations of this client the
/// branch has not seen yet are then replayed onto the branch head. The
/// working store is never modified except that promoted chunks stop being
/// memory-only.
///
/// If another writer moves the branch map between the initial read and the
/// durable write, the whole reconciliation starts over.
pub fn persist(
    client_id: &ClientId,
    memdag: &LazyStore,
    perdag: &dyn Store,
    mutators: &Mutators,
    opts: BTreeOptions,
    shutdown: &Shutdown,
) -> Result<()> {
    loop {
        match persist_once(client_id, memdag, perdag, mutators, opts, shutdown)? {
            Outcome::Done => return Ok(()),
            Outcome::Retry => debug!(client = %client_id, "persist.retry"),
        }
    }
}

fn persist_once(
    client_id: &ClientId,
    memdag: &LazyStore,
    perdag: &dyn Store,
    mutators: &Mutators,
    opts: BTreeOptions,
    shutdown: &Shutdown,
) -> Result<Outcome> {
    ensure_open(shutdown)?;
    let (branches_head, perdag_lmid, perdag_snapshot) = with_read(perdag, |r| {
        let client = must_get_client(client_id, r)?;
        let branch = must_get_branch(&client.branch_id, r)?;
        let head = commit_from_hash(&branch.head_hash, r)?;
        Ok((
            r.get_head(BRANCHES_HEAD_NAME)?,
            head.mutation_id(client_id, r)?,
            base_snapshot(&head, r)?,
        ))
    })?;

    let (mutations, memdag_snapshot) = with_read(memdag, |r| {
        let head = commit_from_head(DEFAULT_HEAD_NAME, r)?;
        let limits: MutationIds = [(client_id.clone(), perdag_lmid)].into_iter().collect();
        Ok((
            local_mutations_greater_than(&head, &limits, r)?,
            base_snapshot(&head, r)?,
        ))
    })?;
    let observed = Observed {
        branches_head,
        perdag_snapshot,
        memdag_snapshot,
        mutations,
    };
    ensure_open(shutdown)?;

    let newer = newer_snapshot(&observed.memdag_snapshot, &observed.perdag_snapshot)?;
    if !newer && observed.mutations.is_empty() {
        debug!(client = %client_id, "persist.noop");
        return Ok(Outcome::Done);
    }

    let gathered = if newer {
        memdag.gather_mem_only(observed.memdag_snapshot.hash())?
    } else {
        Vec::new()
    };

    let outcome = with_write(perdag, |w| {
        if w.get_head(BRANCHES_HEAD_NAME)? != observed.branches_head {
            return Ok(Outcome::Retry);
        }
        let client = must_get_client(client_id, w.as_read())?;
        let mut branch = must_get_branch(&client.branch_id, w.as_read())?;
        for chunk in &gathered {
            w.put_chunk(chunk.clone())?;
        }

        let mut head = branch.head_hash;
        let latest_snapshot = base_snapshot(&commit_from_hash(&head, w.as_read())?, w.as_read())?;
        if newer && newer_snapshot(&observed.memdag_snapshot, &latest_snapshot)? {
            let snapshot_meta = observed
                .memdag_snapshot
                .as_snapshot()
                .ok_or(PenumbraError::Corruption("base snapshot is not a snapshot"))?;
            let pending = local_mutations(&branch.head_hash, w.as_read())?;
            branch.last_server_ackd_mutation_ids = snapshot_meta.last_mutation_ids.clone();
            branch.mutation_ids = snapshot_meta.last_mutation_ids.clone();
            head = observed.memdag_snapshot.hash();
            head = rebase_onto(&pending, head, w, mutators, &mut branch.mutation_ids, opts)?;
        }
        head = rebase_onto(&observed.mutations, head, w, mutators, &mut branch.mutation_ids, opts)?;

        branch.head_hash = head;
        set_branch(&client.branch_id, branch, w)?;
        // The client's head keeps pinning the chain its working store is based on.
        let mut client = client;
        client.heartbeat_timestamp_ms = now_ms();
        set_client(client_id, client, w)?;

        ensure_open(shutdown)?;
        w.commit()?;
        info!(
            client = %client_id,
            head = %head,
            mutations = observed.mutations.len(),
            snapshot = newer,
            "persist.committed"
        );
        Ok(Outcome::Done)
    })?;

    if matches!(outcome, Outcome::Done) && !gathered.is_empty() {
        let persisted = with_read(perdag, |r| {
            let mut hashes = Vec::with_capacity(gathered.len());
            for chunk in &gathered {
                if r.has_chunk(&chunk.hash())? {
                    hashes.push(chunk.hash());
                }
            }
            Ok(hashes)
        })?;
        memdag.chunks_persisted(&persisted);
    }
    Ok(outcome)
}

/// Whether `a` is based on a strictly newer server snapshot than `b`.
pub(crate) fn newer_snapshot(a: &Commit, b: &Commit) -> Result<bool> {
    let (Some(a), Some(b)) = (a.as_snapshot(), b.as_snapshot()) else {
        return Err(PenumbraError::Corruption("base snapshot is not a snapshot"));
    };
    Ok(compare_cookies(&a.cookie, &b.cookie)? == Ordering::Greater)
}

/// Replays `mutations` (head first, as the chain walkers return them)
/// oldest first onto `basis`, skipping those the basis already reflects.
/// Returns the new head and records replayed ids in `mutation_ids`.
pub(crate) fn rebase_onto(
    mutations: &[Commit],
    mut basis: Hash,
    dag: &mut dyn DagWrite,
    mutators: &Mutators,
    mutation_ids: &mut MutationIds,
    opts: BTreeOptions,
) -> Result<Hash> {
    for commit in mutations.iter().rev() {
        let meta = commit
            .as_local()
            .ok_or(PenumbraError::Invalid("only local commits can be rebased"))?;
        let reflected = commit_from_hash(&basis, dag.as_read())?.mutation_id(&meta.client_id, dag.as_read())?;
        if meta.mutation_id <= reflected {
            continue;
        }
        mutation_ids.insert(meta.client_id.clone(), meta.mutation_id);
        basis = rebase_mutation_and_put_commit(commit, dag, basis, mutators, &meta.client_id, opts)?.hash();
        debug!(client = %meta.client_id, mutation_id = meta.mutation_id, "persist.rebase");
    }
    Ok(basis)
}
