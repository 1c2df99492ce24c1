use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::trace;

use super::clients::{update_clients, ClientMap};
use crate::primitives::concurrency::{spawn_interval, IntervalSchedule, Shutdown};
use crate::storage::dag::Store;
use crate::types::{now_ms, ClientId, PenumbraError, Result};

/// How often a live client refreshes its heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Stamps the client's heartbeat with `now`.
///
/// Fails with `ClientStateNotFound` when the client was collected.
pub fn write_heartbeat(store: &dyn Store, client_id: &ClientId, now: u64) -> Result<ClientMap> {
    let clients = update_clients(store, None, |clients| {
        let mut clients = clients.clone();
        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| PenumbraError::ClientStateNotFound {
                id: client_id.clone(),
            })?;
        client.heartbeat_timestamp_ms = now;
        Ok(Some(clients))
    })?;
    trace!(client = %client_id, now, "persist.heartbeat");
    Ok(clients)
}

/// Writes a heartbeat on every tick until `shutdown` fires.
///
/// `on_client_state_not_found` runs when the client turns out to have been
/// collected; the worker stops afterwards.
pub fn start_heartbeats(
    store: Arc<dyn Store>,
    client_id: ClientId,
    interval: Duration,
    shutdown: Shutdown,
    on_client_state_not_found: Arc<dyn Fn() + Send + Sync>,
) -> Result<JoinHandle<()>> {
    spawn_interval(
        "heartbeat",
        IntervalSchedule::every(interval),
        shutdown,
        move |_| match write_heartbeat(&*store, &client_id, now_ms()) {
            Err(err) if err.is_client_state_not_found() => {
                on_client_state_not_found();
                Err(PenumbraError::Cancelled)
            }
            other => other.map(|_| ()),
        },
    )
}
