use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;

use datatree::{entry_to_bytes, Entry, Tree, TreeConfig};

const N: i64 = 2_000;
const VAL_SIZE: usize = 100;

fn bench_cfg() -> TreeConfig {
    TreeConfig {
        segment_size: 1 << 26,
        buffer_size: 1 << 20,
    }
}

fn entry_with_serial(sn: i64) -> Entry {
    Entry {
        key: format!("key{sn:08}").into_bytes(),
        value: vec![b'x'; VAL_SIZE],
        next_key: format!("key{:08}", sn + 1).into_bytes(),
        height: 1,
        last_height: 0,
        serial_num: sn,
    }
}

fn entry_serialize(c: &mut Criterion) {
    let entry = entry_with_serial(42);
    let dlist: Vec<i64> = (0..16).collect();
    c.bench_function("entry_serialize_2k", |b| {
        b.iter(|| {
            for _ in 0..N {
                criterion::black_box(entry_to_bytes(&entry, &dlist));
            }
        });
    });
}

fn tree_append_2k(c: &mut Criterion) {
    c.bench_function("tree_append_2k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let tree = Tree::new_empty(bench_cfg(), dir.path()).unwrap();
                (dir, tree)
            },
            |(_dir, mut tree)| {
                for sn in 0..N {
                    tree.append_entry(&entry_with_serial(sn)).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn tree_end_block_after_2k(c: &mut Criterion) {
    c.bench_function("tree_end_block_after_2k_appends", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let mut tree = Tree::new_empty(bench_cfg(), dir.path()).unwrap();
                for sn in 0..N {
                    tree.append_entry(&entry_with_serial(sn)).unwrap();
                }
                (dir, tree)
            },
            |(_dir, mut tree)| {
                criterion::black_box(tree.end_block().unwrap());
            },
            BatchSize::SmallInput,
        );
    });
}

fn tree_deactivate_and_sync(c: &mut Criterion) {
    c.bench_function("tree_deactivate_1k_and_end_block", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let mut tree = Tree::new_empty(bench_cfg(), dir.path()).unwrap();
                for sn in 0..N {
                    tree.append_entry(&entry_with_serial(sn)).unwrap();
                }
                tree.end_block().unwrap();
                (dir, tree)
            },
            |(_dir, mut tree)| {
                for sn in (0..N).step_by(2) {
                    tree.deactivate_entry(sn);
                }
                tree.append_entry(&entry_with_serial(N)).unwrap();
                criterion::black_box(tree.end_block().unwrap());
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    entry_serialize,
    tree_append_2k,
    tree_end_block_after_2k,
    tree_deactivate_and_sync,
);

criterion_main!(benches);
