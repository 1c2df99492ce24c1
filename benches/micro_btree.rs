//! Micro benchmarks for the chunked copy-on-write map.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;

use penumbra::primitives::kv::MemKv;
use penumbra::storage::btree::{diff, BTreeOptions, BTreeRead, BTreeWrite};
use penumbra::storage::dag::{with_read, with_write, DagStore};
use penumbra::types::Hash;

const INSERT_COUNT: u64 = 8_192;
const LOOKUP_SAMPLES: usize = 1_024;
const SCAN_WIDTH: usize = 256;

fn key(i: u64) -> String {
    format!("item/{i:08}")
}

struct FreshTree {
    store: DagStore,
    root: Hash,
}

impl FreshTree {
    fn new() -> Self {
        Self {
            store: DagStore::new(Arc::new(MemKv::new())),
            root: Hash::EMPTY,
        }
    }

    fn with_keys(keys: impl Iterator<Item = u64>) -> Self {
        let mut tree = Self::new();
        tree.apply(keys);
        tree
    }

    fn apply(&mut self, keys: impl Iterator<Item = u64>) {
        let base = self.root;
        let root = with_write(&self.store, |w| {
            let mut tree = BTreeWrite::new(base, BTreeOptions::default());
            for i in keys {
                tree.put(w.as_read(), &key(i), json!({"n": i, "label": "bench"}))?;
            }
            let root = tree.flush(w)?;
            w.set_head("bench", root)?;
            w.commit()?;
            Ok(root)
        })
        .expect("apply keys");
        self.root = root;
    }
}

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.apply(0..INSERT_COUNT);
                black_box(tree.root);
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.apply(random_keys.iter().copied());
                black_box(tree.root);
            },
            BatchSize::SmallInput,
        );
    });

    let loaded = FreshTree::with_keys(0..INSERT_COUNT);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let samples: Vec<String> = (0..LOOKUP_SAMPLES)
        .map(|_| key(rng.gen_range(0..INSERT_COUNT)))
        .collect();
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function("point_get", |b| {
        b.iter(|| {
            with_read(&loaded.store, |r| {
                let map = BTreeRead::new(r, loaded.root);
                for k in &samples {
                    black_box(map.get(k)?);
                }
                Ok(())
            })
            .expect("point get");
        });
    });

    group.throughput(Throughput::Elements(SCAN_WIDTH as u64));
    group.bench_function("scan_window", |b| {
        b.iter(|| {
            with_read(&loaded.store, |r| {
                let map = BTreeRead::new(r, loaded.root);
                for entry in map.scan(&key(INSERT_COUNT / 2))?.take(SCAN_WIDTH) {
                    black_box(entry?);
                }
                Ok(())
            })
            .expect("scan window");
        });
    });

    let mut edited = FreshTree::with_keys(0..INSERT_COUNT);
    let edited_base = edited.root;
    edited.apply([INSERT_COUNT / 3, INSERT_COUNT + 1].into_iter());
    group.throughput(Throughput::Elements(1));
    group.bench_function("diff_two_edits", |b| {
        b.iter(|| {
            with_read(&edited.store, |r| {
                let old = BTreeRead::new(r, edited_base);
                let new = BTreeRead::new(r, edited.root);
                black_box(diff(&old, &new)?);
                Ok(())
            })
            .expect("diff");
        });
    });

    group.finish();
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
