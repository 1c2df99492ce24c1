use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::options::{AdminGcOptions, AdminOpenOptions};
use crate::admin::util::{open_registry, open_store};
use crate::admin::Result;
use crate::persist::{collect_databases, gc_branches, gc_clients, get_branches, get_clients};
use crate::primitives::concurrency::Shutdown;
use crate::storage::dag::{with_read, Store};
use crate::types::{now_ms, ClientId};

/// Outcome of an offline GC pass over one store.
#[derive(Clone, Debug, Serialize)]
pub struct GcReport {
    /// Store that was collected.
    pub database: String,
    /// Registered clients before the pass.
    pub clients_before: usize,
    /// Registered clients after the pass.
    pub clients_after: usize,
    /// Registered branches before the pass.
    pub branches_before: usize,
    /// Registered branches after the pass.
    pub branches_after: usize,
    /// Stores dropped from the data directory, when requested.
    pub dropped_databases: Vec<String>,
}

/// Runs client GC then branch GC on store `name`, the same passes a live
/// replica runs in the background. No client is exempt, so the store should
/// not be open elsewhere.
pub fn gc(data_dir: &Path, name: &str, opts: &AdminOpenOptions, gc_opts: &AdminGcOptions) -> Result<GcReport> {
    let handle = open_store(data_dir, name, opts)?;
    let store = &*handle.store;
    let shutdown = Shutdown::new();
    let now = now_ms();
    let (clients_before, branches_before) =
        with_read(store, |r| Ok((get_clients(r)?.len(), get_branches(r)?.len())))?;

    let nobody = ClientId::from("");
    let clients_after = gc_clients(store, &nobody, now, gc_opts.client_max_inactive, &shutdown)?.len();
    let branches_after = gc_branches(store, &shutdown)?.len();
    store.close()?;

    let mut dropped_databases = Vec::new();
    if gc_opts.collect_databases {
        if let Some(registry) = open_registry(data_dir, opts)? {
            dropped_databases = collect_databases(&registry, &handle.provider, now, gc_opts.collect_limits)?;
            registry.close()?;
        }
    }
    info!(
        database = name,
        clients = clients_before.saturating_sub(clients_after),
        branches = branches_before.saturating_sub(branches_after),
        databases = dropped_databases.len(),
        "admin.gc.finished"
    );
    Ok(GcReport {
        database: name.to_string(),
        clients_before,
        clients_after,
        branches_before,
        branches_after,
        dropped_databases,
    })
}
