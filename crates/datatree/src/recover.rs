//! Crash recovery: rebuilding the tree by replaying the entry file.
//!
//! After a dirty shutdown the sidecar dumps cannot be trusted, but the entry
//! file plus the last committed metadata can reproduce everything: every
//! frame carries its own deactivation list, so a single forward scan from
//! the oldest active twig's first entry rebuilds active bits, leaf trees,
//! and twig roots. The upper tree is reattached through the edge nodes
//! committed by the last prune.

use std::path::Path;

use tracing::info;

use crate::dump::EdgeNode;
use crate::entry::Entry;
use crate::entryfile::EntryFile;
use crate::tree::{Tree, TreeConfig, ENTRIES_DIR, TWIG_MT_DIR};
use crate::twig::{null_mt_for_twig, null_twig};
use crate::twigmtfile::TwigMtFile;
use crate::{Hash32, TreeError, TWIG_MASK, TWIG_MT_SIZE, TWIG_SHIFT};

impl Tree {
    /// Rebuilds a tree after a crash.
    ///
    /// `entry_file_size` and `twig_mt_file_size` are the sizes committed by
    /// the last completed block; anything beyond them is torn tail and is
    /// truncated away. `edge_nodes` is the blob persisted by the last prune
    /// (empty if nothing was ever pruned). After recovery an immediate
    /// [`Tree::end_block`] with no mutations reproduces the committed root.
    #[allow(clippy::too_many_arguments)]
    pub fn recover(
        cfg: TreeConfig,
        dir: impl AsRef<Path>,
        edge_nodes: &[EdgeNode],
        last_pruned_twig: i64,
        oldest_active_twig_id: i64,
        youngest_twig_id: i64,
        entry_file_size: u64,
        twig_mt_file_size: u64,
    ) -> Result<Self, TreeError> {
        debug_assert!(last_pruned_twig < oldest_active_twig_id);
        let dir = dir.as_ref().to_path_buf();
        let mut entry_file =
            EntryFile::open(cfg.segment_size, cfg.buffer_size, dir.join(ENTRIES_DIR))?;
        let mut twig_mt_file =
            TwigMtFile::open(cfg.segment_size, cfg.buffer_size, dir.join(TWIG_MT_DIR))?;
        entry_file.truncate(entry_file_size)?;
        twig_mt_file.truncate(twig_mt_file_size)?;

        let mut tree = Tree {
            dir,
            cfg,
            entry_file,
            twig_mt_file,
            active_twigs: Default::default(),
            upper_nodes: Default::default(),
            youngest_twig_id,
            mt4yt: Box::new(*null_mt_for_twig()),
            mt4yt_change_start: -1,
            mt4yt_change_end: -1,
            touched_chunks: Default::default(),
            deactivated_serials: Vec::new(),
            twigs_to_evict: Vec::new(),
            evicted_roots: Default::default(),
        };
        tree.active_twigs
            .insert(oldest_active_twig_id, null_twig().clone());

        tree.replay_entries(oldest_active_twig_id)?;
        tree.sync_youngest_mt();
        let twig_ids = tree.sync_active_bits_mt();
        let _ = twig_ids;

        for node in edge_nodes {
            tree.upper_nodes.insert(node.pos, node.hash);
        }
        let all_twigs: Vec<i64> = (oldest_active_twig_id..=tree.youngest_twig_id).collect();
        tree.sync_upper_nodes(&all_twigs)?;

        info!(
            oldest_active_twig_id,
            youngest = tree.youngest_twig_id,
            entry_file_size,
            "recovered tree from entry file"
        );
        Ok(tree)
    }

    /// Scans every frame from the oldest active twig's first entry to the
    /// end of the entry file, replaying its effects.
    fn replay_entries(&mut self, oldest_active_twig_id: i64) -> Result<(), TreeError> {
        let start = if (oldest_active_twig_id + 1) as u64 * TWIG_MT_SIZE
            <= self.twig_mt_file.size()
        {
            // The oldest active twig is sealed, so its record is on disk.
            self.twig_mt_file.first_entry_pos(oldest_active_twig_id)?
        } else {
            // Only possible for a store that never sealed a twig.
            assert_eq!(
                oldest_active_twig_id, 0,
                "unsealed oldest twig {oldest_active_twig_id} has no recorded first entry"
            );
            0
        };

        let size = self.entry_file.size();
        let mut off = start;
        while off < size {
            let (entry, deactivated, next, leaf_hash) = self.entry_file.read_frame(off)?;
            self.replay_one(off, &entry, &deactivated, leaf_hash, oldest_active_twig_id)?;
            off = next;
        }
        Ok(())
    }

    fn replay_one(
        &mut self,
        off: u64,
        entry: &Entry,
        deactivated: &[i64],
        leaf_hash: Hash32,
        oldest_active_twig_id: i64,
    ) -> Result<(), TreeError> {
        for &sn in deactivated {
            if sn >> TWIG_SHIFT >= oldest_active_twig_id {
                let twig = self
                    .active_twigs
                    .get_mut(&(sn >> TWIG_SHIFT))
                    .unwrap_or_else(|| {
                        panic!("replayed deactivation {sn} targets a missing twig")
                    });
                twig.clear_bit((sn & TWIG_MASK) as usize);
                self.touched_chunks.insert(sn >> 9);
            }
        }

        let sn = entry.serial_num;
        let twig_id = sn >> TWIG_SHIFT;
        let pos = (sn & TWIG_MASK) as i32;
        self.youngest_twig_id = twig_id;
        {
            let twig = self
                .active_twigs
                .get_mut(&twig_id)
                .unwrap_or_else(|| panic!("replayed entry {sn} targets a missing twig {twig_id}"));
            twig.set_bit(pos as usize);
            if pos == 0 {
                twig.first_entry_pos = off;
            }
        }
        self.touched_chunks.insert(sn >> 9);

        if self.mt4yt_change_start == -1 {
            self.mt4yt_change_start = pos;
        }
        self.mt4yt_change_end = pos;
        self.mt4yt[2048 + pos as usize] = leaf_hash;
        if pos as i64 == TWIG_MASK {
            self.sync_youngest_mt();
            // Twig-MT records beyond the committed size were lost with the
            // torn tail; rewrite them. Records at or below it survived.
            if (twig_id + 1) as u64 * TWIG_MT_SIZE > self.twig_mt_file.size() {
                let first_entry_pos = self.first_entry_pos_of(twig_id);
                self.twig_mt_file
                    .append_twig(&self.mt4yt[1..], first_entry_pos)?;
            }
            self.youngest_twig_id = twig_id + 1;
            self.active_twigs
                .insert(self.youngest_twig_id, null_twig().clone());
            *self.mt4yt = *null_mt_for_twig();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeConfig;
    use tempfile::tempdir;

    fn small_cfg() -> TreeConfig {
        TreeConfig {
            segment_size: 1 << 22,
            buffer_size: 4096,
        }
    }

    fn entry_with_serial(sn: i64) -> Entry {
        Entry {
            key: sn.to_le_bytes().to_vec(),
            value: format!("value-{sn}").into_bytes(),
            next_key: (sn + 1).to_le_bytes().to_vec(),
            height: 1,
            last_height: 0,
            serial_num: sn,
        }
    }

    /// Runs `mutate`, commits, then recovers from the files alone and
    /// checks the recovered root matches.
    fn commit_crash_recover(mutate: impl Fn(&mut Tree, &mut i64)) {
        let dir = tempdir().unwrap();
        let mut tree = Tree::new_empty(small_cfg(), dir.path()).unwrap();
        let mut next_sn = 0i64;
        mutate(&mut tree, &mut next_sn);
        let root = tree.end_block().unwrap();
        let entry_file_size = tree.entry_file_size();
        let twig_mt_file_size = tree.twig_mt_file_size();
        let youngest = tree.youngest_twig_id();
        drop(tree); // crash: no sidecar sync

        let mut recovered = Tree::recover(
            small_cfg(),
            dir.path(),
            &[],
            -1,
            0,
            youngest,
            entry_file_size,
            twig_mt_file_size,
        )
        .unwrap();
        assert_eq!(recovered.end_block().unwrap(), root);
    }

    #[test]
    fn recover_single_partial_twig() {
        commit_crash_recover(|tree, next_sn| {
            for _ in 0..10 {
                tree.append_entry(&entry_with_serial(*next_sn)).unwrap();
                *next_sn += 1;
            }
            tree.deactivate_entry(4);
            tree.append_entry(&entry_with_serial(*next_sn)).unwrap();
            *next_sn += 1;
        });
    }

    #[test]
    fn recover_across_sealed_twigs() {
        commit_crash_recover(|tree, next_sn| {
            for _ in 0..5000 {
                tree.append_entry(&entry_with_serial(*next_sn)).unwrap();
                *next_sn += 1;
            }
            for sn in (0..4000).step_by(7) {
                tree.deactivate_entry(sn);
            }
            tree.append_entry(&entry_with_serial(*next_sn)).unwrap();
            *next_sn += 1;
        });
    }

    #[test]
    fn recover_exactly_sealed_boundary() {
        commit_crash_recover(|tree, next_sn| {
            for _ in 0..2048 {
                tree.append_entry(&entry_with_serial(*next_sn)).unwrap();
                *next_sn += 1;
            }
        });
    }

    #[test]
    fn recovery_truncates_uncommitted_tail() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::new_empty(small_cfg(), dir.path()).unwrap();
        for sn in 0..100 {
            tree.append_entry(&entry_with_serial(sn)).unwrap();
        }
        let root = tree.end_block().unwrap();
        let entry_file_size = tree.entry_file_size();
        let twig_mt_file_size = tree.twig_mt_file_size();

        // Uncommitted appends after the last end_block: torn tail.
        for sn in 100..150 {
            tree.append_entry(&entry_with_serial(sn)).unwrap();
        }
        // Make sure the tail bytes actually reached the files.
        tree.entry_file.sync().unwrap();
        drop(tree);

        let mut recovered = Tree::recover(
            small_cfg(),
            dir.path(),
            &[],
            -1,
            0,
            0,
            entry_file_size,
            twig_mt_file_size,
        )
        .unwrap();
        assert_eq!(recovered.entry_file_size(), entry_file_size);
        assert_eq!(recovered.end_block().unwrap(), root);
        assert!(recovered.get_active_bit(99));
    }

    #[test]
    fn prune_is_root_invariant_and_survives_crash_recovery() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::new_empty(small_cfg(), dir.path()).unwrap();
        let mut next_sn = 0i64;
        // Nine full twigs.
        for _ in 0..9 * crate::LEAF_COUNT_IN_TWIG {
            tree.append_entry(&entry_with_serial(next_sn)).unwrap();
            next_sn += 1;
        }
        tree.end_block().unwrap();

        // Reap twigs 0..8: rewrite every live entry under a fresh serial,
        // then evict the emptied twig.
        let mut oldest = 0i64;
        for twig_id in 0..8 {
            let survivors = tree.active_entries_in_twig(twig_id).unwrap();
            for mut e in survivors {
                tree.deactivate_entry(e.serial_num);
                e.serial_num = next_sn;
                next_sn += 1;
                tree.append_entry(&e).unwrap();
            }
            tree.evict_twig(twig_id);
            oldest = twig_id + 1;
        }
        let root_before = tree.end_block().unwrap();

        let blob = tree.prune_twigs(0, 8).unwrap();
        assert!(!blob.is_empty());
        // Pruning discards only data whose hashes live on as edge nodes.
        let root_after = tree.end_block().unwrap();
        assert_eq!(root_before, root_after);

        let entry_file_size = tree.entry_file_size();
        let twig_mt_file_size = tree.twig_mt_file_size();
        let youngest = tree.youngest_twig_id();
        drop(tree); // crash without a sidecar dump

        let edge_nodes = crate::bytes_to_edge_nodes(&blob).unwrap();
        let mut recovered = Tree::recover(
            small_cfg(),
            dir.path(),
            &edge_nodes,
            7,
            oldest,
            youngest,
            entry_file_size,
            twig_mt_file_size,
        )
        .unwrap();
        assert_eq!(recovered.end_block().unwrap(), root_before);
        recovered.check_hash_consistency().unwrap();

        // The recovered tree keeps working past the pruned region.
        recovered
            .append_entry(&entry_with_serial(next_sn))
            .unwrap();
        assert_ne!(recovered.end_block().unwrap(), root_before);
    }

    #[test]
    fn recovered_tree_keeps_accepting_appends() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::new_empty(small_cfg(), dir.path()).unwrap();
        for sn in 0..300 {
            tree.append_entry(&entry_with_serial(sn)).unwrap();
        }
        tree.end_block().unwrap();
        let sizes = (tree.entry_file_size(), tree.twig_mt_file_size());
        drop(tree);

        let mut recovered =
            Tree::recover(small_cfg(), dir.path(), &[], -1, 0, 0, sizes.0, sizes.1).unwrap();
        for sn in 300..400 {
            recovered
                .append_entry(&entry_with_serial(sn))
                .unwrap();
        }
        let r1 = recovered.end_block().unwrap();

        // The same full sequence applied in one go gives the same root.
        let dir2 = tempdir().unwrap();
        let mut fresh = Tree::new_empty(small_cfg(), dir2.path()).unwrap();
        for sn in 0..300 {
            fresh.append_entry(&entry_with_serial(sn)).unwrap();
        }
        fresh.end_block().unwrap();
        for sn in 300..400 {
            fresh.append_entry(&entry_with_serial(sn)).unwrap();
        }
        assert_eq!(fresh.end_block().unwrap(), r1);
    }
}
