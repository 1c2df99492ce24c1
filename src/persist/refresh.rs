//! Pulling durable branch progress back into the working store.

use std::time::Duration;

use tracing::{debug, info};

use super::clients::{must_get_branch_for_client, must_get_client, set_client};
use super::ensure_open;
use super::promote::newer_snapshot;
use crate::primitives::concurrency::Shutdown;
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::{with_read, with_write, Chunk, LazyStore, Store};
use crate::storage::db::{
    base_snapshot, commit_from_hash, commit_from_head, diff_commits, local_mutations_greater_than,
    rebase_mutation_and_put_commit, Commit, DiffsMap, Mutators, DEFAULT_HEAD_NAME,
};
use crate::types::{ClientId, Hash, MutationIds, PenumbraError, Result};

/// Upper bound on durable chunks copied into the working cache per refresh.
pub const REFRESH_GATHER_LIMIT: usize = 5 * 1024 * 1024;

/// Durable head a refresh has pinned, with the chunks to cache for it.
struct Pinned {
    head: Commit,
    lmid: u64,
    chunks: Vec<Chunk>,
}

/// Tuning for [`refresh`].
#[derive(Clone, Copy, Debug)]
pub struct RefreshOptions {
    /// B-tree node sizes used when replaying mutations.
    pub btree: BTreeOptions,
    /// Pause between pinning the durable head and swapping it in.
    pub settle: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            btree: BTreeOptions::default(),
            settle: Duration::from_millis(300),
        }
    }
}

/// Replaces the working main head with the durable branch head plus this
/// working store's local mutations the branch has not seen yet.
///
/// Returns the new head and what changed, or `None` when the working store
/// is already ahead of (or level with) the branch. The durable head stays
/// pinned through the client's `temp_refresh_hash` while it is copied in.
pub fn refresh(
    client_id: &ClientId,
    memdag: &LazyStore,
    perdag: &dyn Store,
    mutators: &Mutators,
    opts: RefreshOptions,
    shutdown: &Shutdown,
) -> Result<Option<(Hash, DiffsMap)>> {
    ensure_open(shutdown)?;
    let memdag_snapshot = with_read(memdag, |r| base_snapshot(&commit_from_head(DEFAULT_HEAD_NAME, r)?, r))?;

    let pinned = with_write(perdag, |w| {
        let (_, branch) = must_get_branch_for_client(client_id, w.as_read())?;
        let head = commit_from_hash(&branch.head_hash, w.as_read())?;
        let lmid = head.mutation_id(client_id, w.as_read())?;
        let snapshot = base_snapshot(&head, w.as_read())?;
        if should_abort(&memdag_snapshot, &snapshot, &head)? {
            return Ok(None);
        }
        let chunks = memdag.gather_not_cached(w.as_read(), head.hash(), REFRESH_GATHER_LIMIT)?;
        let mut client = must_get_client(client_id, w.as_read())?;
        client.temp_refresh_hash = Some(head.hash());
        set_client(client_id, client, w)?;
        w.commit()?;
        Ok(Some(Pinned { head, lmid, chunks }))
    })?;

    let Some(pinned) = pinned else {
        unpin(client_id, perdag, None)?;
        return Ok(None);
    };
    let pinned_hash = pinned.head.hash();
    let result = swap_in(client_id, memdag, pinned, mutators, opts, shutdown);
    // The pin is dropped whether or not the swap went through.
    let adopted = matches!(result, Ok(Some(_))).then_some(pinned_hash);
    let unpinned = unpin(client_id, perdag, adopted);
    let result = result?;
    unpinned?;
    Ok(result)
}

/// Waits out the settle time, then rebases the working store's pending
/// mutations onto the pinned durable head and makes that the main head.
fn swap_in(
    client_id: &ClientId,
    memdag: &LazyStore,
    pinned: Pinned,
    mutators: &Mutators,
    opts: RefreshOptions,
    shutdown: &Shutdown,
) -> Result<Option<(Hash, DiffsMap)>> {
    if shutdown.wait_timeout(opts.settle) {
        return Err(PenumbraError::Closed);
    }
    let Pinned {
        head: perdag_head,
        lmid: perdag_lmid,
        chunks,
    } = pinned;
    memdag.cache_chunks(chunks);
    with_write(memdag, |w| {
        let head = commit_from_head(DEFAULT_HEAD_NAME, w.as_read())?;
        let snapshot = base_snapshot(&head, w.as_read())?;
        let perdag_snapshot = base_snapshot(&perdag_head, w.as_read())?;
        if should_abort(&snapshot, &perdag_snapshot, &perdag_head)? {
            debug!(client = %client_id, "persist.refresh.superseded");
            return Ok(None);
        }
        let limits: MutationIds = [(client_id.clone(), perdag_lmid)].into_iter().collect();
        let pending = local_mutations_greater_than(&head, &limits, w.as_read())?;
        let mut new_head = perdag_head.hash();
        for commit in pending.iter().rev() {
            let Some(meta) = commit.as_local() else {
                continue;
            };
            new_head = rebase_mutation_and_put_commit(commit, w, new_head, mutators, &meta.client_id, opts.btree)?.hash();
        }
        let new_commit = commit_from_hash(&new_head, w.as_read())?;
        let diffs = diff_commits(Some(&head), &new_commit, w.as_read())?;
        w.set_head(DEFAULT_HEAD_NAME, new_head)?;
        ensure_open(shutdown)?;
        w.commit()?;
        info!(client = %client_id, head = %new_head, replayed = pending.len(), "persist.refresh");
        Ok(Some((new_head, diffs)))
    })
}

/// Clears the client's refresh pin, moving its head to `adopted` when the
/// working store now builds on that commit.
fn unpin(client_id: &ClientId, perdag: &dyn Store, adopted: Option<Hash>) -> Result<()> {
    with_write(perdag, |w| {
        let mut client = must_get_client(client_id, w.as_read())?;
        if let Some(head) = adopted {
            client.head_hash = head;
        }
        client.temp_refresh_hash = None;
        set_client(client_id, client, w)?;
        w.commit()
    })
}

/// The working store wins when its snapshot is newer, or level with a
/// durable head that carries no mutations on top of its snapshot.
fn should_abort(memdag_snapshot: &Commit, perdag_snapshot: &Commit, perdag_head: &Commit) -> Result<bool> {
    if newer_snapshot(memdag_snapshot, perdag_snapshot)? {
        return Ok(true);
    }
    let level = !newer_snapshot(perdag_snapshot, memdag_snapshot)?;
    Ok(level && perdag_head.hash() == perdag_snapshot.hash())
}
