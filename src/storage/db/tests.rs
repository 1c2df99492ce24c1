use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use super::*;
use crate::primitives::kv::MemKv;
use crate::storage::btree::{BTreeOptions, DiffOperation};
use crate::storage::dag::{with_read, with_write, DagStore, Store};
use crate::types::{ClientId, Hash, MutationIds, PenumbraError, Result};

fn opts() -> BTreeOptions {
    BTreeOptions::with_sizes(200, 400)
}

fn mem_store() -> DagStore {
    DagStore::new(Arc::new(MemKv::new()))
}

fn mutator<F>(f: F) -> Mutator
where
    F: Fn(&mut WriteTransaction<'_, '_>, &Value) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn test_mutators() -> Mutators {
    let mut mutators = Mutators::new();
    mutators.insert(
        "put".to_string(),
        mutator(|tx, args| {
            let key = args["key"].as_str().unwrap_or_default().to_string();
            tx.put(&key, args["value"].clone())
        }),
    );
    mutators.insert(
        "del".to_string(),
        mutator(|tx, args| {
            tx.del(args["key"].as_str().unwrap_or_default())?;
            Ok(())
        }),
    );
    mutators.insert(
        "incr".to_string(),
        mutator(|tx, args| {
            let current = tx.get("counter")?.and_then(|v| v.as_i64()).unwrap_or(0);
            tx.put("counter", json!(current + args.as_i64().unwrap_or(1)))
        }),
    );
    mutators
}

fn genesis(store: &dyn Store, indexes: &IndexDefinitions) -> Result<Hash> {
    with_write(store, |w| {
        Write::new_genesis(w, indexes, opts()).commit(DEFAULT_HEAD_NAME)
    })
}

fn mutate(store: &dyn Store, client: &str, name: &str, args: Value) -> Result<Hash> {
    let mutators = test_mutators();
    with_write(store, |w| {
        let basis = w.must_get_head(DEFAULT_HEAD_NAME)?;
        let mut write = Write::new_local(
            w,
            basis,
            MutationInfo {
                client_id: ClientId::from(client),
                mutator_name: name.to_string(),
                mutator_args: args.clone(),
                original_hash: None,
                timestamp: 42,
            },
            opts(),
        )?;
        if let Some(m) = mutators.get(name) {
            let mut tx = WriteTransaction::new(&mut write)?;
            m(&mut tx, &args)?;
        }
        write.commit(DEFAULT_HEAD_NAME)
    })
}

fn snapshot_on(
    store: &dyn Store,
    basis: Hash,
    head: &str,
    lmids: MutationIds,
    cookie: Value,
    data: &[(&str, Value)],
) -> Result<Hash> {
    with_write(store, |w| {
        let mut write = Write::new_snapshot(w, basis, lmids, cookie, opts())?;
        for (k, v) in data {
            write.put(k, v.clone())?;
        }
        write.commit(head)
    })
}

fn get_at(store: &dyn Store, hash: Hash, key: &str) -> Result<Option<Value>> {
    with_read(store, |r| Read::from_whence(r, &Whence::Hash(hash))?.get(key))
}

#[test]
fn local_commits_chain_back_to_their_snapshot() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &IndexDefinitions::new())?;
    let m1 = mutate(&store, "a", "put", json!({"key": "k", "value": 1}))?;
    let m2 = mutate(&store, "b", "incr", json!(5))?;
    let m3 = mutate(&store, "a", "incr", json!(2))?;

    with_read(&store, |r| {
        let head = commit_from_head(DEFAULT_HEAD_NAME, r)?;
        assert_eq!(head.hash(), m3);
        let hashes: Vec<Hash> = chain(&m3, r)?.iter().map(Commit::hash).collect();
        assert_eq!(hashes, vec![m3, m2, m1, g]);
        assert_eq!(base_snapshot(&head, r)?.hash(), g);
        assert_eq!(local_mutations(&m3, r)?.len(), 3);

        let a = ClientId::from("a");
        let b = ClientId::from("b");
        assert_eq!(head.mutation_id(&a, r)?, 2);
        assert_eq!(head.mutation_id(&b, r)?, 1);
        assert_eq!(head.next_mutation_id(&ClientId::from("c"), r)?, 1);

        let local = head.as_local().ok_or(PenumbraError::Invalid("expected local"))?;
        assert_eq!(local.basis_hash, m2);
        assert_eq!(local.base_snapshot_hash, g);
        assert_eq!(local.original_hash, None);

        let mut limits = MutationIds::new();
        limits.insert(a.clone(), 1);
        let newer: Vec<Hash> = local_mutations_greater_than(&head, &limits, r)?
            .iter()
            .map(Commit::hash)
            .collect();
        assert_eq!(newer, vec![m3]);
        Ok(())
    })?;
    assert_eq!(get_at(&store, m3, "counter")?, Some(json!(7)));
    assert_eq!(get_at(&store, m1, "counter")?, None);
    assert_eq!(get_at(&store, m1, "k")?, Some(json!(1)));
    Ok(())
}

#[test]
fn commit_refs_keep_the_basis_but_not_the_previous_snapshot() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &IndexDefinitions::new())?;
    let m1 = mutate(&store, "a", "put", json!({"key": "k", "value": 1}))?;
    let s = snapshot_on(&store, g, "other", MutationIds::new(), json!(1), &[])?;
    with_read(&store, |r| {
        let local = commit_from_hash(&m1, r)?;
        assert!(local.chunk().refs().contains(&g));
        let snap = commit_from_hash(&s, r)?;
        assert_eq!(snap.basis_hash(), Some(g));
        assert!(!snap.chunk().refs().contains(&g));
        Ok(())
    })
}

#[test]
fn cookies_order_like_the_server_expects() -> Result<()> {
    assert_eq!(compare_cookies(&Value::Null, &json!(1))?, Ordering::Less);
    assert_eq!(compare_cookies(&json!(1), &Value::Null)?, Ordering::Greater);
    assert_eq!(compare_cookies(&Value::Null, &Value::Null)?, Ordering::Equal);
    assert_eq!(compare_cookies(&json!(1), &json!(2))?, Ordering::Less);
    assert_eq!(compare_cookies(&json!(10), &json!(9))?, Ordering::Greater);
    assert_eq!(compare_cookies(&json!("1"), &json!("2"))?, Ordering::Less);
    assert_eq!(compare_cookies(&json!("10"), &json!("9"))?, Ordering::Less);
    assert_eq!(compare_cookies(&json!(10), &json!("9"))?, Ordering::Less);
    assert_eq!(
        compare_cookies(&json!({"order": 3}), &json!({"order": 2}))?,
        Ordering::Greater
    );
    assert_eq!(compare_cookies(&json!({"order": 2}), &json!(2))?, Ordering::Equal);
    assert!(compare_cookies(&json!(true), &json!(1)).is_err());
    Ok(())
}

fn by_name() -> IndexDefinitions {
    let mut defs = IndexDefinitions::new();
    defs.insert(
        "by_name".to_string(),
        IndexDefinition::new("/name").with_prefix("u/"),
    );
    defs
}

fn index_scan(store: &dyn Store, name: &str) -> Result<Vec<(String, String)>> {
    with_read(store, |r| {
        let read = Read::from_whence(r, &Whence::Head(DEFAULT_HEAD_NAME.to_string()))?;
        Ok(read
            .scan(&ScanOptions::index(name))?
            .into_iter()
            .map(|item| (item.secondary_key.unwrap_or_default(), item.key))
            .collect())
    })
}

#[test]
fn indexes_follow_puts_and_deletes() -> Result<()> {
    let store = mem_store();
    genesis(&store, &by_name())?;
    mutate(&store, "a", "put", json!({"key": "u/1", "value": {"name": "bob"}}))?;
    mutate(&store, "a", "put", json!({"key": "u/2", "value": {"name": "al"}}))?;
    mutate(&store, "a", "put", json!({"key": "x/1", "value": {"name": "zed"}}))?;
    mutate(&store, "a", "put", json!({"key": "u/3", "value": {"other": 1}}))?;
    assert_eq!(
        index_scan(&store, "by_name")?,
        vec![
            ("al".to_string(), "u/2".to_string()),
            ("bob".to_string(), "u/1".to_string()),
        ]
    );

    mutate(&store, "a", "put", json!({"key": "u/1", "value": {"name": "cy"}}))?;
    mutate(&store, "a", "del", json!({"key": "u/2"}))?;
    assert_eq!(
        index_scan(&store, "by_name")?,
        vec![("cy".to_string(), "u/1".to_string())]
    );

    let err = index_scan(&store, "missing");
    assert!(matches!(err, Err(PenumbraError::InvalidArgument(_))));
    Ok(())
}

#[test]
fn index_changes_build_indexes_without_touching_data() -> Result<()> {
    let store = mem_store();
    genesis(&store, &IndexDefinitions::new())?;
    mutate(&store, "a", "put", json!({"key": "u/1", "value": {"name": "bob"}}))?;
    mutate(&store, "a", "put", json!({"key": "u/2", "value": {"name": "al"}}))?;

    let change = with_write(&store, |w| {
        let basis = w.must_get_head(DEFAULT_HEAD_NAME)?;
        let mut write = Write::new_index_change(w, basis, opts())?;
        assert!(write.put("u/9", json!(1)).is_err());
        write.create_index("by_name", IndexDefinition::new("/name").with_prefix("u/"))?;
        write.create_index("by_name", IndexDefinition::new("/name").with_prefix("u/"))?;
        assert!(write
            .create_index("by_name", IndexDefinition::new("/other"))
            .is_err());
        write.commit(DEFAULT_HEAD_NAME)
    })?;
    assert_eq!(
        index_scan(&store, "by_name")?,
        vec![
            ("al".to_string(), "u/2".to_string()),
            ("bob".to_string(), "u/1".to_string()),
        ]
    );

    let m3 = mutate(&store, "a", "incr", json!(1))?;
    with_read(&store, |r| {
        let head = commit_from_hash(&m3, r)?;
        assert_eq!(head.as_local().map(|m| m.mutation_id), Some(3));
        assert_eq!(head.basis_hash(), Some(change));
        let change = commit_from_hash(&change, r)?;
        assert_eq!(change.index_definitions().len(), 1);
        assert_eq!(change.mutation_id(&ClientId::from("a"), r)?, 2);
        Ok(())
    })?;

    with_write(&store, |w| {
        let basis = w.must_get_head(DEFAULT_HEAD_NAME)?;
        let mut write = Write::new_index_change(w, basis, opts())?;
        write.drop_index("by_name")?;
        assert!(write.drop_index("by_name").is_err());
        write.commit(DEFAULT_HEAD_NAME)
    })?;
    assert!(index_scan(&store, "by_name").is_err());
    Ok(())
}

#[test]
fn scans_apply_prefix_start_and_limit() -> Result<()> {
    let store = mem_store();
    genesis(&store, &IndexDefinitions::new())?;
    for key in ["a/1", "a/2", "a/3", "a/4", "b/1"] {
        mutate(&store, "a", "put", json!({"key": key, "value": key}))?;
    }
    with_read(&store, |r| {
        let read = Read::from_whence(r, &Whence::Head(DEFAULT_HEAD_NAME.to_string()))?;
        let keys = |opts: ScanOptions| -> Result<Vec<String>> {
            Ok(read.scan(&opts)?.into_iter().map(|i| i.key).collect())
        };
        assert_eq!(keys(ScanOptions::prefix("a/"))?, vec!["a/1", "a/2", "a/3", "a/4"]);
        assert_eq!(keys(ScanOptions::prefix("a/").start("a/2", true).limit(1))?, vec!["a/3"]);
        assert_eq!(keys(ScanOptions::prefix("a/").start("a/2", false).limit(2))?, vec!["a/2", "a/3"]);
        assert_eq!(keys(ScanOptions::prefix("b/"))?, vec!["b/1"]);
        assert!(keys(ScanOptions::prefix("c/"))?.is_empty());
        Ok(())
    })
}

#[test]
fn commit_diffs_cover_the_main_map_and_indexes() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &by_name())?;
    let m1 = mutate(&store, "a", "put", json!({"key": "u/1", "value": {"name": "bob"}}))?;
    with_read(&store, |r| {
        let old = commit_from_hash(&g, r)?;
        let new = commit_from_hash(&m1, r)?;
        let diffs = diff_commits(Some(&old), &new, r)?;
        assert_eq!(
            diffs.main(),
            &[DiffOperation::Add {
                key: "u/1".to_string(),
                new_value: json!({"name": "bob"}),
            }]
        );
        let index = diffs.get("by_name").unwrap_or(&[]);
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].key(), encode_index_key("bob", "u/1")?);

        assert!(diff_commits(Some(&new), &new, r)?.is_empty());
        Ok(())
    })
}

#[test]
fn rebase_replays_onto_a_new_basis() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &IndexDefinitions::new())?;
    let m1 = mutate(&store, "a", "incr", json!(3))?;
    let s2 = snapshot_on(&store, g, "other", MutationIds::new(), json!(1), &[("counter", json!(10))])?;
    let mutators = test_mutators();
    let a = ClientId::from("a");

    let rebased = with_write(&store, |w| {
        let commit = commit_from_hash(&m1, w.as_read())?;
        rebase_mutation_and_commit(&commit, w, s2, "other", &mutators, &a, opts())
    })?;
    assert_eq!(get_at(&store, rebased, "counter")?, Some(json!(13)));
    with_read(&store, |r| {
        let commit = commit_from_hash(&rebased, r)?;
        let meta = commit.as_local().ok_or(PenumbraError::Invalid("expected local"))?;
        assert_eq!(meta.basis_hash, s2);
        assert_eq!(meta.mutation_id, 1);
        assert_eq!(meta.timestamp, 42);
        assert_eq!(meta.original_hash, Some(m1));
        Ok(())
    })?;

    let again = with_write(&store, |w| {
        let commit = commit_from_hash(&rebased, w.as_read())?;
        rebase_mutation_and_commit(&commit, w, g, "again", &mutators, &a, opts())
    })?;
    with_read(&store, |r| {
        let meta = commit_from_hash(&again, r)?;
        assert_eq!(meta.as_local().and_then(|m| m.original_hash), Some(m1));
        Ok(())
    })?;
    assert_eq!(get_at(&store, again, "counter")?, Some(json!(3)));
    Ok(())
}

#[test]
fn rebase_is_deterministic() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &by_name())?;
    let m1 = mutate(&store, "a", "put", json!({"key": "u/1", "value": {"name": "x"}}))?;
    let s2 = snapshot_on(&store, g, "other", MutationIds::new(), json!(1), &[("u/0", json!({"name": "y"}))])?;
    let mutators = test_mutators();
    let a = ClientId::from("a");
    with_write(&store, |w| {
        let commit = commit_from_hash(&m1, w.as_read())?;
        let first = rebase_mutation_and_put_commit(&commit, w, s2, &mutators, &a, opts())?;
        let second = rebase_mutation_and_put_commit(&commit, w, s2, &mutators, &a, opts())?;
        assert_eq!(first.value_hash(), second.value_hash());
        assert_eq!(first.indexes(), second.indexes());
        assert_eq!(first.hash(), second.hash());
        Ok(())
    })
}

#[test]
fn rebase_with_a_missing_mutator_is_a_no_op() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &IndexDefinitions::new())?;
    let m1 = mutate(&store, "a", "put", json!({"key": "k", "value": 1}))?;
    let rebased = with_write(&store, |w| {
        let commit = commit_from_hash(&m1, w.as_read())?;
        rebase_mutation_and_commit(&commit, w, g, "other", &Mutators::new(), &ClientId::from("a"), opts())
    })?;
    assert_ne!(rebased, m1);
    assert_eq!(get_at(&store, rebased, "k")?, None);
    with_read(&store, |r| {
        let commit = commit_from_hash(&rebased, r)?;
        let genesis = commit_from_hash(&g, r)?;
        assert_eq!(commit.value_hash(), genesis.value_hash());
        assert_eq!(commit.as_local().map(|m| m.mutation_id), Some(1));
        Ok(())
    })
}

#[test]
fn rebase_rejects_mismatched_clients_and_mutation_ids() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &IndexDefinitions::new())?;
    let m1 = mutate(&store, "a", "incr", json!(1))?;
    let mut acked = MutationIds::new();
    acked.insert(ClientId::from("a"), 1);
    let s2 = snapshot_on(&store, g, "other", acked, json!(2), &[])?;
    let mutators = test_mutators();

    with_write(&store, |w| {
        let commit = commit_from_hash(&m1, w.as_read())?;
        let wrong_client =
            rebase_mutation_and_put_commit(&commit, w, g, &mutators, &ClientId::from("b"), opts());
        assert!(matches!(wrong_client, Err(PenumbraError::InvalidArgument(_))));

        let replayed =
            rebase_mutation_and_put_commit(&commit, w, s2, &mutators, &ClientId::from("a"), opts());
        assert!(matches!(
            replayed,
            Err(PenumbraError::InconsistentMutation { expected: 2, actual: 1 })
        ));

        let snapshot = commit_from_hash(&g, w.as_read())?;
        let not_local =
            rebase_mutation_and_put_commit(&snapshot, w, g, &mutators, &ClientId::from("a"), opts());
        assert!(not_local.is_err());
        Ok(())
    })
}

#[test]
fn dropped_writes_leave_no_trace() -> Result<()> {
    let store = mem_store();
    let g = genesis(&store, &IndexDefinitions::new())?;
    with_write(&store, |w| {
        let mut write = Write::new_snapshot(w, g, MutationIds::new(), json!(5), opts())?;
        write.put("k", json!(1))?;
        assert_eq!(write.get("k")?, Some(json!(1)));
        let commit = write.put_commit()?;
        assert!(commit.is_snapshot());
        Ok(())
    })?;
    with_read(&store, |r| {
        assert_eq!(r.must_get_head(DEFAULT_HEAD_NAME)?, g);
        Ok(())
    })
}
