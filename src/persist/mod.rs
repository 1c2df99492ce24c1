//! Durable bookkeeping shared by every client of one store.
//!
//! The client and branch registries live as single chunks under the
//! `clients` and `branches` heads. [`persist`] promotes a client's working
//! store into its branch, [`refresh`] brings branch progress made by other
//! clients back, and the GC and heartbeat workers keep the registries
//! bounded. [`DatabaseRegistry`] tracks the stores themselves so idle ones
//! can be dropped and abandoned mutations in sibling stores recovered.
#![forbid(unsafe_code)]

mod branches;
mod clients;
mod databases;
mod gc;
mod heartbeat;
mod promote;
mod refresh;
mod registry;

pub use branches::{
    delete_branch, disable_branch, get_branch, get_branches, must_get_branch, set_branch,
    set_branches, update_branches, Branch, BranchMap, BRANCHES_HEAD_NAME,
};
pub use clients::{
    assert_has_client_state, find_matching_client, get_branch_for_client, get_client, get_clients,
    init_client, must_get_branch_for_client, must_get_client, set_client, set_clients,
    update_clients, Client, ClientMap, FindMatchingClient, InitClient, CLIENTS_HEAD_NAME,
};
pub use databases::{
    collect_databases, database_name, start_collect_databases, CollectLimits, DatabaseMap,
    DatabaseRecord, DatabaseRegistry, BRANCH_DATABASE_MAX_AGE, COLLECT_DELAY, COLLECT_INTERVAL,
    DATABASES_STORE_NAME, DATABASE_MAX_AGE, FORMAT_VERSION,
};
pub use gc::{gc_branches, gc_clients, start_branch_gc, start_client_gc, CLIENT_MAX_INACTIVE, GC_INTERVAL};
pub use heartbeat::{start_heartbeats, write_heartbeat, HEARTBEAT_INTERVAL};
pub use promote::persist;
pub use refresh::{refresh, RefreshOptions, REFRESH_GATHER_LIMIT};

use crate::primitives::concurrency::Shutdown;
use crate::types::{PenumbraError, Result};

/// Fails with `Closed` once the owning replica started closing.
pub(crate) fn ensure_open(shutdown: &Shutdown) -> Result<()> {
    if shutdown.is_triggered() {
        return Err(PenumbraError::Closed);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
