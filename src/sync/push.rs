use tracing::debug;

use super::auth::Auth;
use super::protocol::{PushMutation, PushRequest, Pusher, PusherResult, PUSH_VERSION};
use crate::storage::dag::{with_read, Store};
use crate::storage::db::{local_mutations, DEFAULT_HEAD_NAME};
use crate::types::ids::random_id;
use crate::types::{BranchId, Result};

/// Everything a push needs besides the store.
#[derive(Clone, Copy)]
pub struct PushContext<'a> {
    /// Installation id sent with the request.
    pub profile_id: &'a str,
    /// Branch the mutations belong to.
    pub branch_id: &'a BranchId,
    /// Application schema version.
    pub schema_version: &'a str,
    /// Transport.
    pub pusher: &'a dyn Pusher,
    /// Token and renewal.
    pub auth: &'a Auth,
}

/// Local commits on main, oldest first, as push records.
pub fn pending_mutations(store: &dyn Store) -> Result<Vec<PushMutation>> {
    with_read(store, |r| {
        let head = r.must_get_head(DEFAULT_HEAD_NAME)?;
        Ok(local_mutations(&head, r)?
            .iter()
            .rev()
            .filter_map(|c| c.as_local())
            .map(|m| PushMutation {
                client_id: m.client_id.clone(),
                id: m.mutation_id,
                name: m.mutator_name.clone(),
                args: m.mutator_args.clone(),
                timestamp: m.timestamp,
            })
            .collect())
    })
}

/// Sends every pending local mutation. Returns `None` when there is
/// nothing to send.
pub fn push(ctx: &PushContext<'_>, store: &dyn Store) -> Result<Option<PusherResult>> {
    let mutations = pending_mutations(store)?;
    if mutations.is_empty() {
        return Ok(None);
    }
    let request = PushRequest {
        profile_id: ctx.profile_id.to_string(),
        branch_id: ctx.branch_id.clone(),
        mutations,
        push_version: PUSH_VERSION,
        schema_version: ctx.schema_version.to_string(),
    };
    let request_id = format!("{}-{}", ctx.branch_id, random_id());
    debug!(branch = %ctx.branch_id, count = request.mutations.len(), request = %request_id, "sync.push");
    let (result, _) = ctx.auth.with_reauth("push", |token| {
        let result = ctx.pusher.push(&request, token, &request_id)?;
        let info = result.http_request_info.clone();
        Ok((result, info))
    })?;
    Ok(Some(result))
}
