//! Recovery of mutations left behind by clients that stopped before the
//! server acknowledged them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::auth::Auth;
use super::protocol::{PullResponse, PushResponse, Puller, Pusher};
use super::pull::{begin_pull, PullContext};
use super::push::{push, PushContext};
use crate::persist::{
    disable_branch, ensure_open, get_branch, get_branches, set_branch, Branch, DatabaseRegistry,
    FORMAT_VERSION,
};
use crate::primitives::concurrency::Shutdown;
use crate::primitives::kv::KvProvider;
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::{with_read, with_write, DagStore, LazyStore, Store};
use crate::storage::db::DEFAULT_HEAD_NAME;
use crate::types::{BranchId, ChunkHasher, ClientId, Result};

/// Cache size of the working store built for each recovered branch.
pub const RECOVERY_CACHE_BYTES: usize = 10 * 1024 * 1024;

/// Everything recovery needs besides the stores.
#[derive(Clone, Copy)]
pub struct RecoveryContext<'a> {
    /// Installation id sent with requests.
    pub profile_id: &'a str,
    /// Application schema version of the store being recovered.
    pub schema_version: &'a str,
    /// Branch of the running client; never recovered here.
    pub own_branch: Option<&'a BranchId>,
    /// Pull transport.
    pub puller: &'a dyn Puller,
    /// Push transport.
    pub pusher: &'a dyn Pusher,
    /// Token and renewal.
    pub auth: &'a Auth,
    /// Node sizes.
    pub opts: BTreeOptions,
    /// Stops recovery between branches.
    pub shutdown: &'a Shutdown,
}

/// Outcome for one branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BranchRecovery {
    /// The server acknowledged mutations; `last_server_ackd_mutation_ids` moved.
    Recovered,
    /// The server answered but acknowledged nothing new.
    Unchanged,
    /// The server no longer knows the branch; it was disabled.
    Disabled,
    /// Push or pull failed at the transport level.
    Failed,
}

/// Pushes and confirms pending mutations of every other branch in
/// `perdag`. A failure on one branch is logged and the others still run.
/// Returns the per-branch outcomes.
pub fn recover_mutations(perdag: &Arc<dyn Store>, ctx: &RecoveryContext<'_>) -> Result<Vec<(BranchId, BranchRecovery)>> {
    let branches = with_read(&**perdag, |r| get_branches(r))?;
    let mut outcomes = Vec::new();
    for (branch_id, branch) in branches {
        ensure_open(ctx.shutdown)?;
        if Some(&branch_id) == ctx.own_branch || branch.disabled {
            continue;
        }
        let Some(client_id) = unacknowledged_client(&branch) else {
            continue;
        };
        match recover_branch(perdag, &branch_id, &branch, &client_id, ctx) {
            Ok(outcome) => {
                debug!(branch = %branch_id, ?outcome, "sync.recovery.branch");
                outcomes.push((branch_id, outcome));
            }
            Err(err) => {
                warn!(branch = %branch_id, error = %err, "sync.recovery.failed");
                outcomes.push((branch_id, BranchRecovery::Failed));
            }
        }
    }
    Ok(outcomes)
}

/// Runs [`recover_mutations`] over every other registered store of the
/// same application and layout version. Returns outcomes per store name.
pub fn recover_mutations_in_databases(
    registry: &DatabaseRegistry,
    provider: &dyn KvProvider,
    app_name: &str,
    current: &str,
    ctx: &RecoveryContext<'_>,
) -> Result<Vec<(String, Vec<(BranchId, BranchRecovery)>)>> {
    let mut all = Vec::new();
    for record in registry.get_databases()?.into_values() {
        ensure_open(ctx.shutdown)?;
        if record.name == current || record.app_name != app_name || record.format_version != FORMAT_VERSION {
            continue;
        }
        let store: Arc<dyn Store> = Arc::new(DagStore::new(provider.open(&record.name)?));
        let sibling = RecoveryContext {
            schema_version: &record.schema_version,
            own_branch: None,
            ..*ctx
        };
        match recover_mutations(&store, &sibling) {
            Ok(outcomes) => all.push((record.name.clone(), outcomes)),
            Err(err) => warn!(database = %record.name, error = %err, "sync.recovery.database_failed"),
        }
    }
    Ok(all)
}

fn unacknowledged_client(branch: &Branch) -> Option<ClientId> {
    branch
        .mutation_ids
        .iter()
        .find(|(client, id)| match branch.last_server_ackd_mutation_ids.get(*client) {
            Some(ackd) => ackd < id,
            None => **id != 0,
        })
        .map(|(client, _)| client.clone())
}

fn recover_branch(
    perdag: &Arc<dyn Store>,
    branch_id: &BranchId,
    branch: &Branch,
    client_id: &ClientId,
    ctx: &RecoveryContext<'_>,
) -> Result<BranchRecovery> {
    let lazy = LazyStore::new(Arc::clone(perdag), RECOVERY_CACHE_BYTES, ChunkHasher::Content);
    let outcome = recover_from(&lazy, perdag, branch_id, branch, client_id, ctx);
    lazy.close()?;
    outcome
}

fn recover_from(
    lazy: &LazyStore,
    perdag: &Arc<dyn Store>,
    branch_id: &BranchId,
    branch: &Branch,
    client_id: &ClientId,
    ctx: &RecoveryContext<'_>,
) -> Result<BranchRecovery> {
    with_write(lazy, |w| {
        w.set_head(DEFAULT_HEAD_NAME, branch.head_hash)?;
        w.commit()
    })?;

    let push_ctx = PushContext {
        profile_id: ctx.profile_id,
        branch_id,
        schema_version: ctx.schema_version,
        pusher: ctx.pusher,
        auth: ctx.auth,
    };
    let Some(pushed) = push(&push_ctx, lazy)? else {
        return Ok(BranchRecovery::Unchanged);
    };
    if let Some(PushResponse::ClientStateNotFound | PushResponse::VersionNotSupported { .. }) = pushed.response {
        info!(branch = %branch_id, "sync.recovery.push_rejected");
        disable(perdag, branch_id)?;
        return Ok(BranchRecovery::Disabled);
    }
    if !pushed.http_request_info.is_ok() {
        debug!(branch = %branch_id, status = pushed.http_request_info.http_status_code, "sync.recovery.push_failed");
        return Ok(BranchRecovery::Failed);
    }

    let pull_ctx = PullContext {
        profile_id: ctx.profile_id,
        branch_id,
        client_id,
        schema_version: ctx.schema_version,
        puller: ctx.puller,
        auth: ctx.auth,
        opts: ctx.opts,
        shutdown: ctx.shutdown,
    };
    let pulled = begin_pull(&pull_ctx, lazy, false)?;
    let response = match pulled.pull_response {
        Some(response) if pulled.http_request_info.is_ok() => response,
        _ => {
            debug!(branch = %branch_id, status = pulled.http_request_info.http_status_code, "sync.recovery.pull_failed");
            return Ok(BranchRecovery::Failed);
        }
    };

    ensure_open(ctx.shutdown)?;
    let changes = match response {
        PullResponse::Ok(ok) => ok.last_mutation_id_changes,
        PullResponse::ClientStateNotFound | PullResponse::VersionNotSupported { .. } => {
            info!(branch = %branch_id, "sync.recovery.pull_rejected");
            disable(perdag, branch_id)?;
            return Ok(BranchRecovery::Disabled);
        }
    };
    with_write(&**perdag, |w| {
        let Some(mut current) = get_branch(branch_id, w.as_read())? else {
            return Ok(BranchRecovery::Unchanged);
        };
        let mut updated = false;
        for (client, id) in changes {
            let ackd = current.last_server_ackd_mutation_ids.get(&client).copied().unwrap_or(0);
            if ackd < id {
                current.last_server_ackd_mutation_ids.insert(client, id);
                updated = true;
            }
        }
        if !updated {
            return Ok(BranchRecovery::Unchanged);
        }
        set_branch(branch_id, current, w)?;
        w.commit()?;
        info!(branch = %branch_id, "sync.recovery.recovered");
        Ok(BranchRecovery::Recovered)
    })
}

fn disable(perdag: &Arc<dyn Store>, branch_id: &BranchId) -> Result<()> {
    with_write(&**perdag, |w| {
        disable_branch(branch_id, w)?;
        w.commit()
    })
}
