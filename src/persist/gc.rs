//! Collection of inactive clients and orphaned branches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use super::branches::{get_branches, set_branches, BranchMap};
use super::clients::{get_clients, update_clients, ClientMap};
use crate::primitives::concurrency::{spawn_interval, IntervalSchedule, Shutdown};
use crate::storage::dag::{with_write, Store};
use crate::types::{now_ms, ClientId, Result};

/// Clients silent for longer than this are collected.
pub const CLIENT_MAX_INACTIVE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How often client and branch GC run.
pub const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Removes every client other than `own` whose last heartbeat is more than
/// `max_inactive` before `now`. Returns the surviving map.
pub fn gc_clients(
    store: &dyn Store,
    own: &ClientId,
    now: u64,
    max_inactive: Duration,
    shutdown: &Shutdown,
) -> Result<ClientMap> {
    let max_inactive = max_inactive.as_millis() as u64;
    let mut collected = 0usize;
    let clients = update_clients(store, Some(shutdown), |clients| {
        let live: ClientMap = clients
            .iter()
            .filter(|(id, c)| *id == own || now.saturating_sub(c.heartbeat_timestamp_ms) <= max_inactive)
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        collected = clients.len() - live.len();
        Ok((collected > 0).then_some(live))
    })?;
    if collected > 0 {
        info!(collected, remaining = clients.len(), "gc.clients.collected");
    }
    Ok(clients)
}

/// Removes branches no client belongs to, unless they still hold mutations
/// the server has not acknowledged. Returns the surviving map.
///
/// Runs in one write so a client joining concurrently is either seen here
/// or joins after the branch is gone.
pub fn gc_branches(store: &dyn Store, shutdown: &Shutdown) -> Result<BranchMap> {
    with_write(store, |w| {
        let clients = get_clients(w.as_read())?;
        let branches = get_branches(w.as_read())?;
        let referenced: BTreeSet<_> = clients.values().map(|c| &c.branch_id).collect();
        let live: BranchMap = branches
            .iter()
            .filter(|(id, b)| referenced.contains(id) || b.has_pending_mutations())
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect();
        let collected = branches.len() - live.len();
        if collected == 0 {
            return Ok(branches);
        }
        set_branches(&live, w)?;
        shutdown.check()?;
        w.commit()?;
        info!(collected, remaining = live.len(), "gc.branches.collected");
        Ok(live)
    })
}

/// Runs [`gc_clients`] on `schedule` until `shutdown` fires.
pub fn start_client_gc(
    store: Arc<dyn Store>,
    own: ClientId,
    max_inactive: Duration,
    schedule: IntervalSchedule,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>> {
    spawn_interval("client-gc", schedule, shutdown, move |shutdown| {
        gc_clients(&*store, &own, now_ms(), max_inactive, shutdown).map(|_| ())
    })
}

/// Runs [`gc_branches`] on `schedule` until `shutdown` fires.
pub fn start_branch_gc(
    store: Arc<dyn Store>,
    schedule: IntervalSchedule,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>> {
    spawn_interval("branch-gc", schedule, shutdown, move |shutdown| {
        gc_branches(&*store, shutdown).map(|_| ())
    })
}
