use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use super::{BackgroundOptions, ReplicaInner};
use crate::persist::{start_branch_gc, start_client_gc, start_collect_databases, start_heartbeats};
use crate::primitives::concurrency::{spawn_interval, IntervalSchedule, Shutdown};
use crate::types::{PenumbraError, Result};

/// Starts every background process of `inner`. All of them stop when the
/// replica's shutdown signal fires.
pub(super) fn start(inner: &Arc<ReplicaInner>, opts: &BackgroundOptions) -> Result<Vec<JoinHandle<()>>> {
    let shutdown = inner.shutdown.clone();
    let mut handles = Vec::new();

    let weak = Arc::downgrade(inner);
    handles.push(start_heartbeats(
        Arc::clone(&inner.perdag),
        inner.client_id.clone(),
        opts.heartbeat_interval,
        shutdown.clone(),
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire_client_state_not_found();
            }
        }),
    )?);
    handles.push(start_client_gc(
        Arc::clone(&inner.perdag),
        inner.client_id.clone(),
        opts.client_max_inactive,
        IntervalSchedule::every(opts.client_gc_interval),
        shutdown.clone(),
    )?);
    handles.push(start_branch_gc(
        Arc::clone(&inner.perdag),
        IntervalSchedule::every(opts.branch_gc_interval),
        shutdown.clone(),
    )?);
    handles.push(start_collect_databases(
        inner.registry.clone(),
        Arc::clone(&inner.provider),
        opts.collect_limits,
        IntervalSchedule::delayed(opts.collect_delay, opts.collect_interval),
        shutdown.clone(),
    )?);

    handles.push(spawn_interval(
        "persist",
        IntervalSchedule::every(opts.persist_interval),
        shutdown.clone(),
        with_inner(inner, |inner| inner.persist()),
    )?);
    handles.push(spawn_interval(
        "refresh",
        IntervalSchedule::every(opts.refresh_interval),
        shutdown.clone(),
        with_inner(inner, |inner| inner.refresh().map(|_| ())),
    )?);
    if inner.can_recover() {
        handles.push(spawn_interval(
            "mutation-recovery",
            IntervalSchedule::delayed(Duration::ZERO, opts.recovery_interval),
            shutdown,
            with_inner(inner, |inner| inner.recover_mutations().map(|_| ())),
        )?);
    }
    debug!(workers = handles.len(), client = %inner.client_id, "replica.background.started");
    Ok(handles)
}

/// Adapts a replica operation into an interval task holding only a weak
/// reference, so a dropped replica ends its workers.
fn with_inner<F>(inner: &Arc<ReplicaInner>, task: F) -> impl FnMut(&Shutdown) -> Result<()> + Send + 'static
where
    F: Fn(&ReplicaInner) -> Result<()> + Send + 'static,
{
    let weak: Weak<ReplicaInner> = Arc::downgrade(inner);
    move |_| match weak.upgrade() {
        Some(inner) => task(&inner),
        None => Err(PenumbraError::Closed),
    }
}
