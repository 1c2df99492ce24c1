#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use penumbra::persist::{collect_databases, CollectLimits, DatabaseRegistry};
use penumbra::primitives::kv::{KvProvider, SqliteKvProvider};
use penumbra::storage::dag::{with_read, with_write, DagStore, Store};
use penumbra::types::now_ms;
use penumbra::{Replica, Result};
use serde_json::json;
use tempfile::tempdir;

use support::{get, options, put};

#[test]
fn persisted_state_survives_reopening() -> Result<()> {
    let dir = tempdir()?;
    let provider = Arc::new(SqliteKvProvider::new(dir.path()));
    let first = Replica::open(options("files"), provider.clone())?;
    put(&first, "doc", json!({"body": "hello"}))?;
    first.persist()?;
    let branch = first.branch_id().clone();
    first.close()?;
    assert!(provider.path_for(first.database_name())?.exists());

    let provider = Arc::new(SqliteKvProvider::new(dir.path()));
    let second = Replica::open(options("files"), provider)?;
    assert_eq!(second.branch_id(), &branch);
    assert_eq!(get(&second, "doc")?, Some(json!({"body": "hello"})));
    second.close()
}

#[test]
fn uncommitted_writes_are_discarded() -> Result<()> {
    let dir = tempdir()?;
    let provider = SqliteKvProvider::new(dir.path());
    let store = DagStore::new(provider.open("scratch")?);
    with_write(&store, |w| {
        let chunk = w.create_chunk(bytes::Bytes::from_static(b"payload"), Vec::new());
        w.put_chunk(chunk.clone())?;
        w.set_head("scratch", chunk.hash())
    })?;
    assert_eq!(with_read(&store, |r| r.get_head("scratch"))?, None);

    let hash = with_write(&store, |w| {
        let chunk = w.create_chunk(bytes::Bytes::from_static(b"payload"), Vec::new());
        w.put_chunk(chunk.clone())?;
        w.set_head("scratch", chunk.hash())?;
        w.commit()?;
        Ok(chunk.hash())
    })?;
    store.close()?;

    let reopened = DagStore::new(provider.open("scratch")?);
    let chunk = with_read(&reopened, |r| r.must_get_chunk(&hash))?;
    assert_eq!(chunk.data().as_ref(), b"payload");
    assert_eq!(with_read(&reopened, |r| r.get_head("scratch"))?, Some(hash));
    reopened.close()
}

#[test]
fn idle_stores_are_dropped_from_disk() -> Result<()> {
    let dir = tempdir()?;
    let provider = Arc::new(SqliteKvProvider::new(dir.path()));
    let replica = Replica::open(options("files"), provider.clone())?;
    let name = replica.database_name().to_string();
    replica.close()?;

    let registry = DatabaseRegistry::open(&*provider)?;
    let far_future = now_ms() + 365 * 24 * 60 * 60 * 1000;
    let dropped = collect_databases(&registry, &*provider, far_future, CollectLimits::default())?;
    assert_eq!(dropped, vec![name.clone()]);
    assert!(registry.get_databases()?.is_empty());
    assert!(!provider.path_for(&name)?.exists());
    registry.close()
}
