#![allow(missing_docs)]

mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use penumbra::persist::{get_branches, get_clients};
use penumbra::primitives::kv::{KvProvider, MemKvProvider};
use penumbra::replica::BackgroundOptions;
use penumbra::storage::dag::with_read;
use penumbra::{PenumbraError, Replica, Result};
use serde_json::json;

use support::{get, options, put, TestServer};

const TICK: Duration = Duration::from_millis(20);

fn fast() -> BackgroundOptions {
    BackgroundOptions {
        heartbeat_interval: TICK,
        client_gc_interval: TICK,
        branch_gc_interval: TICK,
        recovery_interval: TICK,
        persist_interval: TICK,
        refresh_interval: TICK,
        ..BackgroundOptions::default()
    }
}

fn wait_until<F>(mut condition: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition()? {
            return Ok(());
        }
        thread::sleep(TICK);
    }
    Err(PenumbraError::Invalid("condition not reached in time"))
}

#[test]
fn persist_and_refresh_run_on_their_own() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let a = Replica::open(options("bg").background(fast()), provider.clone())?;
    let b = Replica::open(options("bg").background(fast()), provider)?;
    put(&a, "shared", json!("via workers"))?;
    wait_until(|| Ok(get(&b, "shared")?.is_some()))?;
    assert_eq!(get(&b, "shared")?, Some(json!("via workers")));
    a.close()?;
    b.close()
}

#[test]
fn heartbeats_advance_the_client_timestamp() -> Result<()> {
    let replica = Replica::open(options("bg").background(fast()), Arc::new(MemKvProvider::new()))?;
    let id = replica.client_id().clone();
    let stamp = |replica: &Replica| -> Result<u64> {
        let clients = with_read(&**replica.durable_store(), |r| get_clients(r))?;
        Ok(clients.get(&id).map(|c| c.heartbeat_timestamp_ms).unwrap_or(0))
    };
    let first = stamp(&replica)?;
    wait_until(|| Ok(stamp(&replica)? > first))?;
    replica.close()
}

#[test]
fn idle_clients_and_their_branches_are_collected() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let idle = Replica::open(options("bg").mutator("extra", |_, _| Ok(())), provider.clone())?;
    let idle_branch = idle.branch_id().clone();
    idle.close()?;

    let opts = BackgroundOptions {
        client_max_inactive: Duration::from_millis(1),
        ..fast()
    };
    let live = Replica::open(options("bg").background(opts), provider)?;
    assert_ne!(live.branch_id(), &idle_branch);
    wait_until(|| {
        let (clients, branches) =
            with_read(&**live.durable_store(), |r| Ok((get_clients(r)?, get_branches(r)?)))?;
        Ok(clients.len() == 1 && !branches.contains_key(&idle_branch))
    })?;
    let clients = with_read(&**live.durable_store(), |r| get_clients(r))?;
    assert!(clients.contains_key(live.client_id()));
    live.close()
}

#[test]
fn recovery_runs_in_the_background() -> Result<()> {
    let provider: Arc<dyn KvProvider> = Arc::new(MemKvProvider::new());
    let server = TestServer::new();
    let abandoned = Replica::open(options("bg"), Arc::clone(&provider))?;
    put(&abandoned, "orphan", json!(1))?;
    abandoned.persist()?;
    abandoned.close()?;

    let opts = options("bg")
        .mutator("extra", |_, _| Ok(()))
        .puller(server.clone())
        .pusher(server.clone())
        .background(fast());
    let rescuer = Replica::open(opts, provider)?;
    wait_until(|| Ok(server.value("orphan").is_some()))?;
    rescuer.close()?;
    assert!(rescuer.closed());
    Ok(())
}

#[test]
fn dropping_a_replica_stops_its_workers() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let replica = Replica::open(options("bg").background(fast()), provider.clone())?;
    let id = replica.client_id().clone();
    drop(replica);
    thread::sleep(TICK * 3);

    let observer = Replica::open(options("bg"), provider)?;
    let stamp = |observer: &Replica| -> Result<u64> {
        let clients = with_read(&**observer.durable_store(), |r| get_clients(r))?;
        Ok(clients.get(&id).map(|c| c.heartbeat_timestamp_ms).unwrap_or(0))
    };
    let before = stamp(&observer)?;
    thread::sleep(TICK * 5);
    assert_eq!(stamp(&observer)?, before);
    observer.close()
}
