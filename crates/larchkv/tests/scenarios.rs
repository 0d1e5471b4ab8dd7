//! End-to-end scenarios exercising the whole store: crash recovery,
//! reaping, pruning, and the durability of magic-laden payloads.

use larchkv::{Hash32, Store, StoreConfig};

use datatree::{DEACT_LIST_MAX_LEN, MAGIC};
use tempfile::tempdir;

fn test_cfg() -> StoreConfig {
    StoreConfig {
        segment_size: 1 << 22,
        write_buffer_size: 4096,
        ..StoreConfig::default()
    }
}

#[test]
fn reopen_after_clean_close_preserves_everything() {
    let dir = tempdir().unwrap();
    let root;
    {
        let mut store = Store::open(dir.path(), test_cfg()).unwrap();
        store.begin_block(1);
        store.set(b"k1", b"v1");
        store.set(b"k2", b"v2");
        root = store.end_block().unwrap();
        store.close().unwrap();
    }
    // A clean close leaves sidecars behind, so this open skips the replay.
    let mut store = Store::open(dir.path(), test_cfg()).unwrap();
    assert_eq!(store.root_hash(), root);
    assert_eq!(store.get(b"k1").unwrap().unwrap(), b"v1");
    store.begin_block(2);
    store.set(b"k3", b"v3");
    store.end_block().unwrap();
    store.check_next_key_chain().unwrap();
    store.close().unwrap();
}

#[test]
fn reopen_after_crash_recovers_everything() {
    let dir = tempdir().unwrap();
    let root;
    {
        let mut store = Store::open(dir.path(), test_cfg()).unwrap();
        store.begin_block(1);
        for i in 0..500u32 {
            store.set(format!("key{i:04}").as_bytes(), format!("val{i}").as_bytes());
        }
        store.end_block().unwrap();
        store.begin_block(2);
        for i in 0..250u32 {
            store.delete(format!("key{:04}", i * 2).as_bytes());
        }
        root = store.end_block().unwrap();
        // Crash: drop without close; sidecars never written, the
        // running flag stays set.
    }
    let mut store = Store::open(dir.path(), test_cfg()).unwrap();
    assert_eq!(store.root_hash(), root);
    assert_eq!(store.get(b"key0000").unwrap(), None);
    assert_eq!(store.get(b"key0001").unwrap().unwrap(), b"val1");
    store.check_next_key_chain().unwrap();
    store.close().unwrap();
}

#[test]
fn magic_bytes_in_values_survive_storage_and_recovery() {
    let dir = tempdir().unwrap();
    let magic_value: Vec<u8> = MAGIC
        .iter()
        .chain(MAGIC.iter())
        .chain(MAGIC.iter())
        .copied()
        .collect();
    {
        let mut store = Store::open(dir.path(), test_cfg()).unwrap();
        store.begin_block(1);
        store.set(b"magic", &magic_value);
        store.set("ILOVEYOU-key".as_bytes(), b"plain");
        store.end_block().unwrap();
        assert_eq!(store.get(b"magic").unwrap().unwrap(), magic_value);
        // Crash so the reopen has to replay the frames.
    }
    let store = Store::open(dir.path(), test_cfg()).unwrap();
    assert_eq!(store.get(b"magic").unwrap().unwrap(), magic_value);
    assert_eq!(
        store.get("ILOVEYOU-key".as_bytes()).unwrap().unwrap(),
        b"plain"
    );
    store.close().unwrap();
}

#[test]
fn reaping_compacts_without_losing_keys() {
    let dir = tempdir().unwrap();
    let cfg = StoreConfig {
        start_reap_threshold: 10,
        ..test_cfg()
    };
    let mut store = Store::open(dir.path(), cfg).unwrap();

    store.begin_block(1);
    for i in 0..3000u32 {
        store.set(format!("key{i:05}").as_bytes(), format!("val{i}").as_bytes());
    }
    store.end_block().unwrap();

    store.begin_block(2);
    for i in 0..2500u32 {
        store.delete(format!("key{i:05}").as_bytes());
    }
    store.end_block().unwrap();

    // The churn above must have triggered reaping.
    assert!(store.oldest_active_twig_id() > 0);
    store.check_next_key_chain().unwrap();
    for i in 2500..3000u32 {
        let key = format!("key{i:05}");
        assert_eq!(
            store.get(key.as_bytes()).unwrap().unwrap(),
            format!("val{i}").as_bytes(),
            "key {key} lost in reap"
        );
    }
    for i in 0..2500u32 {
        assert_eq!(store.get(format!("key{i:05}").as_bytes()).unwrap(), None);
    }
    store.close().unwrap();
}

#[test]
fn prune_then_crash_then_recover() {
    let dir = tempdir().unwrap();
    let cfg = StoreConfig {
        start_reap_threshold: 10,
        ..test_cfg()
    };
    let root;
    {
        let mut store = Store::open(dir.path(), cfg.clone()).unwrap();
        store.begin_block(1);
        for i in 0..3000u32 {
            store.set(format!("key{i:05}").as_bytes(), format!("val{i}").as_bytes());
        }
        store.end_block().unwrap();
        store.begin_block(2);
        for i in 0..2500u32 {
            store.delete(format!("key{i:05}").as_bytes());
        }
        store.end_block().unwrap();
        assert!(
            store.oldest_active_twig_id() >= 4,
            "churn was not enough to retire four twigs"
        );

        store.prune_before_height(100).unwrap();
        assert!(store.last_pruned_twig() >= 3);

        store.begin_block(3);
        store.set(b"after-prune", b"still-works");
        root = store.end_block().unwrap();
        // Crash: the running flag stays set, sidecars never written.
    }
    let mut store = Store::open(dir.path(), cfg).unwrap();
    assert_eq!(store.root_hash(), root);
    assert_eq!(store.get(b"after-prune").unwrap().unwrap(), b"still-works");
    assert_eq!(store.get(b"key02600").unwrap().unwrap(), b"val2600");
    store.check_next_key_chain().unwrap();
    store.check_hash_consistency().unwrap();
    store.close().unwrap();
}

#[test]
fn recovery_is_deterministic_across_many_blocks() {
    let run_blocks = |store: &mut Store| -> Vec<Hash32> {
        let mut roots = Vec::new();
        for block in 0..5i64 {
            store.begin_block(block);
            for i in 0..200u32 {
                let key = format!("k{:03}", (i * 7 + block as u32 * 13) % 500);
                if (i + block as u32) % 5 == 0 {
                    store.delete(key.as_bytes());
                } else {
                    store.set(key.as_bytes(), format!("v{block}-{i}").as_bytes());
                }
            }
            roots.push(store.end_block().unwrap());
        }
        roots
    };

    let dir1 = tempdir().unwrap();
    let mut reference = Store::open(dir1.path(), test_cfg()).unwrap();
    let reference_roots = run_blocks(&mut reference);
    reference.close().unwrap();

    // Same sequence, crashing and recovering after the last block.
    let dir2 = tempdir().unwrap();
    let crashed_roots;
    {
        let mut store = Store::open(dir2.path(), test_cfg()).unwrap();
        crashed_roots = run_blocks(&mut store);
    }
    let store = Store::open(dir2.path(), test_cfg()).unwrap();
    assert_eq!(crashed_roots, reference_roots);
    assert_eq!(store.root_hash(), *reference_roots.last().unwrap());
    store.close().unwrap();
}

#[test]
fn mass_deactivation_is_flushed_by_dummy_entries() {
    let dir = tempdir().unwrap();
    let mut store = Store::open(dir.path(), test_cfg()).unwrap();
    store.begin_block(1);
    for i in 0..11_000u32 {
        store.set(format!("key{i:05}").as_bytes(), b"x");
    }
    store.end_block().unwrap();

    // Collect live serials for ten thousand keys.
    let serials: Vec<i64> = (0..10_000u32)
        .map(|i| {
            store
                .get_entry(format!("key{i:05}").as_bytes())
                .unwrap()
                .unwrap()
                .serial_num
        })
        .collect();

    let size_before = store.entry_file_size();
    store.begin_block(2);
    for &sn in &serials {
        store.deactivate_entry(sn).unwrap();
    }
    store.end_block().unwrap();
    let size_after = store.entry_file_size();

    // Every deactivation landed in the bit vectors.
    for &sn in &serials {
        assert!(!store.is_entry_active(sn));
    }
    // The list was flushed by roughly 10k / 1k dummy frames, each well
    // under the frame-size cap (a dummy frame carries ~1000 serials,
    // about 8 KiB).
    let grown = size_after - size_before;
    let frames = grown / (DEACT_LIST_MAX_LEN as u64 * 8);
    assert!((8..=14).contains(&frames), "unexpected growth: {grown}");
    store.close().unwrap();
}

#[test]
fn roots_chain_across_close_and_crash_boundaries() {
    // The same three blocks, committed across a clean close and a crash,
    // end at the same root as one uninterrupted run.
    let apply = |store: &mut Store, block: i64| {
        store.begin_block(block);
        for i in 0..50u32 {
            store.set(
                format!("b{block}-k{i:02}").as_bytes(),
                format!("{i}").as_bytes(),
            );
        }
        store.end_block().unwrap()
    };

    let dir1 = tempdir().unwrap();
    let mut reference = Store::open(dir1.path(), test_cfg()).unwrap();
    let mut expected = [0u8; 32];
    for block in 1..=3 {
        expected = apply(&mut reference, block);
    }
    reference.close().unwrap();

    let dir2 = tempdir().unwrap();
    let mut store = Store::open(dir2.path(), test_cfg()).unwrap();
    apply(&mut store, 1);
    store.close().unwrap(); // clean boundary
    let mut store = Store::open(dir2.path(), test_cfg()).unwrap();
    apply(&mut store, 2);
    drop(store); // crash boundary
    let mut store = Store::open(dir2.path(), test_cfg()).unwrap();
    let last = apply(&mut store, 3);
    assert_eq!(last, expected);
    store.close().unwrap();
}
