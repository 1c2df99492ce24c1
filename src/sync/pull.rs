//! Pull: fetch server state into a sync branch, replay pending local
//! mutations on it and swap it in as the new main head.

use std::cmp::Ordering;

use serde_json::Value;
use tracing::{debug, info};

use super::auth::Auth;
use super::patch::apply_patch;
use super::protocol::{HttpRequestInfo, PullRequest, PullResponse, PullResponseOk, Puller, PULL_VERSION};
use crate::persist::ensure_open;
use crate::primitives::concurrency::Shutdown;
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::{with_read, with_write, Store};
use crate::storage::db::{
    base_snapshot, commit_from_hash, commit_from_head, compare_cookies, diff_commits,
    local_mutations, rebase_mutation_and_commit, Commit, DiffsMap, Mutators, Write,
    DEFAULT_HEAD_NAME, SYNC_HEAD_NAME,
};
use crate::types::ids::random_id;
use crate::types::{BranchId, ClientId, Hash, MutationIds, PenumbraError, Result};

/// Everything a pull needs besides the store.
#[derive(Clone, Copy)]
pub struct PullContext<'a> {
    /// Installation id sent with the request.
    pub profile_id: &'a str,
    /// Branch being synced.
    pub branch_id: &'a BranchId,
    /// Client performing the pull.
    pub client_id: &'a ClientId,
    /// Application schema version.
    pub schema_version: &'a str,
    /// Transport.
    pub puller: &'a dyn Puller,
    /// Token and renewal.
    pub auth: &'a Auth,
    /// Node sizes for the snapshot and replayed commits.
    pub opts: BTreeOptions,
    /// Aborts the pull between steps.
    pub shutdown: &'a Shutdown,
}

/// Result of [`begin_pull`].
#[derive(Clone, Debug)]
pub struct BeginPullResponse {
    /// Transport-level outcome.
    pub http_request_info: HttpRequestInfo,
    /// Sync-level response, absent when the transport failed.
    pub pull_response: Option<PullResponse>,
    /// Head of the staged sync branch, [`Hash::EMPTY`] when none was staged.
    pub sync_head: Hash,
}

/// Result of [`handle_pull_response`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlePullResponse {
    /// Main moved to a different base snapshot while the request was out.
    CookieMismatch,
    /// The response changes nothing.
    NoOp,
    /// A sync branch was staged.
    Applied {
        /// Its head.
        sync_head: Hash,
    },
}

/// Sends a pull for the main head's base snapshot and, if
/// `create_sync_branch` is set, stages the response as a sync branch.
pub fn begin_pull(ctx: &PullContext<'_>, store: &dyn Store, create_sync_branch: bool) -> Result<BeginPullResponse> {
    ensure_open(ctx.shutdown)?;
    let (cookie, is_new_branch) = with_read(store, |r| {
        let snapshot = base_snapshot(&commit_from_head(DEFAULT_HEAD_NAME, r)?, r)?;
        let meta = snapshot
            .as_snapshot()
            .ok_or(PenumbraError::Corruption("base snapshot is not a snapshot"))?;
        Ok((meta.cookie.clone(), meta.last_mutation_ids.is_empty()))
    })?;

    let request = PullRequest {
        profile_id: ctx.profile_id.to_string(),
        branch_id: ctx.branch_id.clone(),
        cookie: cookie.clone(),
        is_new_branch,
        pull_version: PULL_VERSION,
        schema_version: ctx.schema_version.to_string(),
    };
    let request_id = format!("{}-{}", ctx.client_id, random_id());
    debug!(branch = %ctx.branch_id, request = %request_id, "sync.pull.begin");
    let (response, http_request_info) = ctx.auth.with_reauth("pull", |token| {
        let result = ctx.puller.pull(&request, token, &request_id)?;
        Ok((result.response, result.http_request_info))
    })?;

    let mut begin = BeginPullResponse {
        http_request_info,
        pull_response: response,
        sync_head: Hash::EMPTY,
    };
    let Some(PullResponse::Ok(ok)) = begin.pull_response.as_ref() else {
        return Ok(begin);
    };
    if !create_sync_branch {
        return Ok(begin);
    }
    ensure_open(ctx.shutdown)?;
    if let HandlePullResponse::Applied { sync_head } = handle_pull_response(store, &cookie, ok, ctx.opts)? {
        begin.sync_head = sync_head;
    }
    Ok(begin)
}

/// Stages `response` as a snapshot on top of main's base snapshot and
/// points the sync head at it.
///
/// Nothing is written when main's base cookie is no longer
/// `expected_base_cookie` or when the response carries no change. A
/// response that moves a cookie or a client's last mutation id backwards
/// is rejected.
pub fn handle_pull_response(
    store: &dyn Store,
    expected_base_cookie: &Value,
    response: &PullResponseOk,
    opts: BTreeOptions,
) -> Result<HandlePullResponse> {
    with_write(store, |w| {
        let main = commit_from_head(DEFAULT_HEAD_NAME, w.as_read())?;
        let snapshot = base_snapshot(&main, w.as_read())?;
        let meta = snapshot
            .as_snapshot()
            .ok_or(PenumbraError::Corruption("base snapshot is not a snapshot"))?;
        if compare_cookies(expected_base_cookie, &meta.cookie)? != Ordering::Equal {
            debug!("sync.pull.cookie_mismatch");
            return Ok(HandlePullResponse::CookieMismatch);
        }

        for (client, id) in &response.last_mutation_id_changes {
            let base = meta.last_mutation_ids.get(client).copied().unwrap_or(0);
            if *id < base {
                return Err(PenumbraError::InvalidArgument(format!(
                    "received last mutation id {id} for {client} is below the snapshot's {base}"
                )));
            }
        }
        let cookie_order = compare_cookies(&response.cookie, &meta.cookie)?;
        if cookie_order == Ordering::Less {
            return Err(PenumbraError::InvalidArgument(
                "received cookie is older than the snapshot's".to_string(),
            ));
        }
        let lmids_unchanged = response
            .last_mutation_id_changes
            .iter()
            .all(|(client, id)| meta.last_mutation_ids.get(client) == Some(id));
        if response.patch.is_empty() && cookie_order == Ordering::Equal && lmids_unchanged {
            debug!("sync.pull.noop");
            return Ok(HandlePullResponse::NoOp);
        }

        let mut lmids: MutationIds = meta.last_mutation_ids.clone();
        lmids.extend(response.last_mutation_id_changes.iter().map(|(c, id)| (c.clone(), *id)));
        let mut write = Write::new_snapshot(w, snapshot.hash(), lmids, response.cookie.clone(), opts)?;
        apply_patch(&mut write, &response.patch)?;
        let sync_head = write.commit(SYNC_HEAD_NAME)?;
        debug!(sync_head = %sync_head, ops = response.patch.len(), "sync.pull.staged");
        Ok(HandlePullResponse::Applied { sync_head })
    })
}

/// Result of [`maybe_end_pull`].
#[derive(Clone, Debug)]
pub struct MaybeEndPull {
    /// Current sync head, or the new main head once the pull ended.
    pub sync_head: Hash,
    /// Local commits still to replay onto the sync head, oldest first.
    /// Empty once the pull ended.
    pub replay_mutations: Vec<Commit>,
    /// Changes main went through. Empty until the pull ended.
    pub diffs: DiffsMap,
}

/// Swaps the sync branch in as main if no local mutation is left to replay.
///
/// Fails with `OverlappingSyncs` when another sync moved main's base
/// snapshot since this one began.
pub fn maybe_end_pull(store: &dyn Store, expected_sync_head: Hash) -> Result<MaybeEndPull> {
    with_write(store, |w| {
        let sync_head = w.must_get_head(SYNC_HEAD_NAME)?;
        if sync_head != expected_sync_head {
            return Err(PenumbraError::InvalidArgument(format!(
                "sync head moved from {expected_sync_head} to {sync_head}"
            )));
        }
        let sync = commit_from_hash(&sync_head, w.as_read())?;
        let sync_snapshot = base_snapshot(&sync, w.as_read())?;
        let main = commit_from_head(DEFAULT_HEAD_NAME, w.as_read())?;
        let main_snapshot = base_snapshot(&main, w.as_read())?;
        if sync_snapshot.basis_hash() != Some(main_snapshot.hash()) {
            info!(sync = %sync_snapshot.hash(), main = %main_snapshot.hash(), "sync.pull.overlapping");
            return Err(PenumbraError::OverlappingSyncs);
        }

        let mut replay = Vec::new();
        for commit in local_mutations(&main.hash(), w.as_read())?.into_iter().rev() {
            let Some(meta) = commit.as_local() else {
                continue;
            };
            if meta.mutation_id > sync.mutation_id(&meta.client_id, w.as_read())? {
                replay.push(commit);
            }
        }
        if !replay.is_empty() {
            return Ok(MaybeEndPull {
                sync_head,
                replay_mutations: replay,
                diffs: DiffsMap::new(),
            });
        }

        let diffs = diff_commits(Some(&main), &sync, w.as_read())?;
        w.set_head(DEFAULT_HEAD_NAME, sync_head)?;
        w.remove_head(SYNC_HEAD_NAME)?;
        w.commit()?;
        Ok(MaybeEndPull {
            sync_head,
            replay_mutations: Vec::new(),
            diffs,
        })
    })
}

/// What a full pull did.
#[derive(Clone, Debug)]
pub struct PullOutcome {
    /// Transport-level outcome.
    pub http_request_info: HttpRequestInfo,
    /// Sync-level response, absent when the transport failed.
    pub response: Option<PullResponse>,
    /// New main head and the changes, when the pull moved main.
    pub applied: Option<(Hash, DiffsMap)>,
}

/// Runs a pull to completion: begin, replay until nothing is left, end.
pub fn pull(ctx: &PullContext<'_>, store: &dyn Store, mutators: &Mutators) -> Result<PullOutcome> {
    let begin = begin_pull(ctx, store, true)?;
    let mut outcome = PullOutcome {
        http_request_info: begin.http_request_info,
        response: begin.pull_response,
        applied: None,
    };
    if begin.sync_head.is_empty() {
        return Ok(outcome);
    }

    let mut sync_head = begin.sync_head;
    loop {
        ensure_open(ctx.shutdown)?;
        let end = maybe_end_pull(store, sync_head)?;
        if end.replay_mutations.is_empty() {
            info!(head = %end.sync_head, changed = !end.diffs.is_empty(), "sync.pull.ended");
            outcome.applied = Some((end.sync_head, end.diffs));
            return Ok(outcome);
        }
        debug!(count = end.replay_mutations.len(), "sync.pull.replay");
        for commit in &end.replay_mutations {
            ensure_open(ctx.shutdown)?;
            let Some(meta) = commit.as_local() else {
                continue;
            };
            sync_head = with_write(store, |w| {
                rebase_mutation_and_commit(commit, w, sync_head, SYNC_HEAD_NAME, mutators, &meta.client_id, ctx.opts)
            })?;
        }
    }
}
