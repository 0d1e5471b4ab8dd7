//! The block write driver.
//!
//! A block goes: `begin_block(height)` → any number of `set`/`delete` →
//! `end_block()`. Mutations are buffered, then applied in key order at
//! block end. Every applied mutation maintains the `next_key` chain: each
//! live entry names its successor key, so inserting or deleting a key also
//! rewrites its predecessor. Two guard entries bracket the key space so a
//! predecessor always exists.
//!
//! After the mutations, the reap loop rewrites the oldest twig's survivors
//! under fresh serials while the log stays too sparse, the tree computes
//! the new root, and the metadata transaction commits. Only then is the
//! block durable.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use datatree::{
    bytes_to_edge_nodes, Entry, Hash32, Tree, TreeConfig, DEACT_LIST_MAX_LEN,
    LEAF_COUNT_IN_TWIG, MIN_PRUNE_COUNT, TWIG_SHIFT,
};
use indextree::{IndexTree, MemIndexTree};
use metadb::{FileMetaDb, MetaDb};

const META_FILE: &str = "meta.dat";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Segment size of both backing logs.
    pub segment_size: u64,
    /// Write-buffer size of both backing logs.
    pub write_buffer_size: usize,
    /// Reap while `kept_entries > ratio * active_count`.
    pub kept_to_active_ratio: i64,
    /// No reaping below this many active entries.
    pub start_reap_threshold: i64,
    /// Guard key below every user key.
    pub start_guard: Vec<u8>,
    /// Guard key above every user key.
    pub end_guard: Vec<u8>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            segment_size: 1 << 30,
            write_buffer_size: hpfile::DEFAULT_BUFFER_SIZE,
            kept_to_active_ratio: 2,
            start_reap_threshold: 10_000,
            start_guard: Vec::new(),
            end_guard: vec![0xFF; 255],
        }
    }
}

enum PendingOp {
    Put(Vec<u8>),
    Delete,
}

pub struct Store {
    cfg: StoreConfig,
    meta: Box<dyn MetaDb>,
    idx: Box<dyn IndexTree>,
    tree: Tree,
    root_hash: Hash32,
    pending: BTreeMap<Vec<u8>, PendingOp>,
    in_block: bool,
}

impl Store {
    /// Opens a store under `dir`, creating it on first use.
    ///
    /// A fresh directory is bootstrapped with one fully deactivated twig of
    /// dummy entries plus the two guard entries, and committed as height -1.
    /// If the previous run crashed (the running flag is still set in the
    /// metadata), the sidecar dumps are discarded and the tree is rebuilt by
    /// replaying the entry file; otherwise the sidecars are loaded directly.
    pub fn open(dir: impl AsRef<Path>, cfg: StoreConfig) -> Result<Store> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let meta = FileMetaDb::open(dir.join(META_FILE))?;
        let tree_cfg = TreeConfig {
            segment_size: cfg.segment_size,
            buffer_size: cfg.write_buffer_size,
        };

        if meta.is_fresh() {
            // No committed metadata: anything already in the data dirs is
            // debris from an interrupted bootstrap.
            let _ = std::fs::remove_dir_all(dir.join(datatree::ENTRIES_DIR));
            let _ = std::fs::remove_dir_all(dir.join(datatree::TWIG_MT_DIR));
            let tree = Tree::new_empty(tree_cfg, dir)?;
            let mut store = Store {
                cfg,
                meta: Box::new(meta),
                idx: Box::new(MemIndexTree::new()),
                tree,
                root_hash: [0; 32],
                pending: BTreeMap::new(),
                in_block: false,
            };
            store.bootstrap().context("bootstrapping a fresh store")?;
            info!("created fresh store");
            return Ok(store);
        }

        let tree = if meta.is_running() {
            warn!("unclean shutdown detected, replaying the entry file");
            let edge_nodes = bytes_to_edge_nodes(meta.edge_nodes())?;
            Tree::recover(
                tree_cfg,
                dir,
                &edge_nodes,
                meta.last_pruned_twig(),
                meta.oldest_active_twig_id(),
                meta.max_serial() >> TWIG_SHIFT,
                meta.entry_file_size(),
                meta.twig_mt_file_size(),
            )?
        } else {
            Tree::load(tree_cfg, dir)?
        };

        let mut store = Store {
            cfg,
            meta: Box::new(meta),
            idx: Box::new(MemIndexTree::new()),
            tree,
            root_hash: [0; 32],
            pending: BTreeMap::new(),
            in_block: false,
        };
        store.rebuild_index()?;
        store.root_hash = store.tree.end_block()?;
        store.meta.set_is_running(true);
        store.meta.commit()?;
        Ok(store)
    }

    /// Burns one full twig of deactivated dummy entries (so pruning always
    /// has a complete unit to start from) and installs the guard entries.
    fn bootstrap(&mut self) -> Result<()> {
        self.meta.set_curr_height(-1);
        self.idx.begin_write(-1);
        for _ in 0..LEAF_COUNT_IN_TWIG {
            let sn = self.meta.max_serial();
            self.meta.incr_max_serial();
            self.tree.append_entry(&Entry::dummy(sn))?;
            self.tree.deactivate_entry(sn);
        }

        let start_guard = Entry {
            key: self.cfg.start_guard.clone(),
            value: Vec::new(),
            next_key: self.cfg.end_guard.clone(),
            height: -1,
            last_height: -1,
            serial_num: self.meta.max_serial(),
        };
        self.meta.incr_max_serial();
        let pos = self.tree.append_entry(&start_guard)?;
        self.idx.set(&self.cfg.start_guard, pos);

        let end_guard = Entry {
            key: self.cfg.end_guard.clone(),
            value: Vec::new(),
            next_key: self.cfg.end_guard.clone(),
            height: -1,
            last_height: -1,
            serial_num: self.meta.max_serial(),
        };
        self.meta.incr_max_serial();
        let pos = self.tree.append_entry(&end_guard)?;
        self.idx.set(&self.cfg.end_guard, pos);
        self.idx.end_write();

        self.root_hash = self.tree.end_block()?;
        self.meta.set_entry_file_size(self.tree.entry_file_size());
        self.meta.set_twig_mt_file_size(self.tree.twig_mt_file_size());
        self.meta.set_is_running(true);
        self.meta.commit()?;
        Ok(())
    }

    /// Rebuilds the in-memory key index by scanning live entries.
    fn rebuild_index(&mut self) -> Result<()> {
        let oldest = self.meta.oldest_active_twig_id();
        self.idx.begin_write(self.meta.curr_height());
        let mut pairs = Vec::new();
        self.tree
            .scan_live_entries(oldest, |key, off| pairs.push((key.to_vec(), off)))?;
        for (key, off) in pairs {
            self.idx.set(&key, off);
        }
        self.idx.end_write();
        info!(keys = self.idx.len(), "rebuilt key index");
        Ok(())
    }

    pub fn root_hash(&self) -> Hash32 {
        self.root_hash
    }

    pub fn height(&self) -> i64 {
        self.meta.curr_height()
    }

    pub fn active_entry_count(&self) -> i64 {
        self.meta.active_entry_count()
    }

    pub fn oldest_active_twig_id(&self) -> i64 {
        self.meta.oldest_active_twig_id()
    }

    pub fn last_pruned_twig(&self) -> i64 {
        self.meta.last_pruned_twig()
    }

    pub fn entry_file_size(&self) -> u64 {
        self.tree.entry_file_size()
    }

    /// Whether the entry appended under `sn` is still live.
    pub fn is_entry_active(&self, sn: i64) -> bool {
        self.tree.get_active_bit(sn)
    }

    /// Recomputes every reachable hash in the tree and compares it with the
    /// stored value. Expensive; meant for tests and debugging.
    pub fn check_hash_consistency(&mut self) -> Result<()> {
        Ok(self.tree.check_hash_consistency()?)
    }

    fn assert_user_key(&self, key: &[u8]) {
        assert!(
            key > self.cfg.start_guard.as_slice() && key < self.cfg.end_guard.as_slice(),
            "key must lie strictly between the guard keys"
        );
    }

    /// Starts a block. All reads remain valid during a block; the mutations
    /// become visible (and durable) at `end_block`.
    pub fn begin_block(&mut self, height: i64) {
        assert!(!self.in_block, "begin_block inside an open block");
        self.in_block = true;
        self.meta.set_curr_height(height);
        self.idx.begin_write(height);
        self.pending.clear();
    }

    /// Buffers a put; the last op per key in a block wins.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        assert!(self.in_block, "set outside a block");
        self.assert_user_key(key);
        self.pending
            .insert(key.to_vec(), PendingOp::Put(value.to_vec()));
    }

    /// Buffers a delete. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) {
        assert!(self.in_block, "delete outside a block");
        self.assert_user_key(key);
        self.pending.insert(key.to_vec(), PendingOp::Delete);
    }

    /// Applies the buffered mutations in key order, runs compaction if the
    /// log got too sparse, computes the new root, and commits the metadata
    /// transaction. Returns the root hash of this block.
    pub fn end_block(&mut self) -> Result<Hash32> {
        assert!(self.in_block, "end_block outside a block");
        // apply buffered ops in key order
        let ops = std::mem::take(&mut self.pending);
        for (key, op) in ops {
            match op {
                PendingOp::Put(value) => self.apply_put(key, value)?,
                PendingOp::Delete => self.apply_delete(key)?,
            }
        }
        // compact if the log carries too many dead entries
        self.reap_if_needed()?;

        // compute the root and make the block durable
        let root = self.tree.end_block()?;
        self.root_hash = root;
        self.meta.set_entry_file_size(self.tree.entry_file_size());
        self.meta.set_twig_mt_file_size(self.tree.twig_mt_file_size());
        self.meta.commit()?;
        self.idx.end_write();
        self.in_block = false;
        Ok(root)
    }

    fn apply_put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let height = self.meta.curr_height();
        if let Some(off) = self.idx.get(&key) {
            // overwrite: the old entry dies, the new one keeps the linkage
            let mut entry = self.tree.read_entry(off)?;
            self.deactivate_entry(entry.serial_num)?;
            entry.value = value;
            entry.last_height = entry.height;
            entry.height = height;
            let pos = self.append_new_entry(entry)?;
            self.idx.set(&key, pos);
        } else {
            // insert: splice into the chain through the predecessor
            let (prev_key, prev_off) = self.predecessor_of(&key)?;
            let mut prev = self.tree.read_entry(prev_off)?;
            // the new entry inherits the predecessor's successor
            let entry = Entry {
                key: key.clone(),
                value,
                next_key: prev.next_key.clone(),
                height,
                last_height: 0,
                serial_num: 0,
            };
            // rewrite the predecessor to point at the new key
            self.deactivate_entry(prev.serial_num)?;
            prev.next_key = key.clone();
            prev.last_height = prev.height;
            prev.height = height;
            let prev_pos = self.append_new_entry(prev)?;
            self.idx.set(&prev_key, prev_pos);
            let pos = self.append_new_entry(entry)?;
            self.idx.set(&key, pos);
        }
        Ok(())
    }

    fn apply_delete(&mut self, key: Vec<u8>) -> Result<()> {
        let Some(off) = self.idx.get(&key) else {
            return Ok(()); // deleting an absent key is a no-op
        };
        let entry = self.tree.read_entry(off)?;
        let (prev_key, prev_off) = self.predecessor_of(&key)?;
        let mut prev = self.tree.read_entry(prev_off)?;

        // both the entry and its predecessor's old version die
        self.deactivate_entry(entry.serial_num)?;
        self.deactivate_entry(prev.serial_num)?;
        // the predecessor adopts the deleted key's successor
        prev.next_key = entry.next_key;
        prev.last_height = prev.height;
        prev.height = self.meta.curr_height();
        let prev_pos = self.append_new_entry(prev)?;
        self.idx.set(&prev_key, prev_pos);
        self.idx.delete(&key);
        Ok(())
    }

    /// The greatest indexed key strictly below `key`.
    fn predecessor_of(&self, key: &[u8]) -> Result<(Vec<u8>, u64)> {
        match self.idx.iter_range_rev(&self.cfg.start_guard, key).next() {
            Some(pair) => Ok(pair),
            None => bail!("no predecessor for key; start guard missing"),
        }
    }

    /// Deactivates a serial, appending a dummy entry to flush the
    /// deactivation list whenever it outgrows its soft cap. This is the
    /// only deactivation path; the cap keeps any single frame bounded.
    pub fn deactivate_entry(&mut self, sn: i64) -> Result<()> {
        let pending = self.tree.deactivate_entry(sn);
        self.meta.decr_active_entry_count();
        if pending > DEACT_LIST_MAX_LEN {
            // The dummy entry exists only to carry the oversized list into
            // a durable frame; it dies immediately.
            let dummy_sn = self.meta.max_serial();
            self.meta.incr_max_serial();
            self.tree.append_entry(&Entry::dummy(dummy_sn))?;
            self.tree.deactivate_entry(dummy_sn);
        }
        Ok(())
    }

    /// Appends an entry under the next serial number.
    fn append_new_entry(&mut self, mut entry: Entry) -> Result<u64> {
        entry.serial_num = self.meta.max_serial();
        self.meta.incr_max_serial();
        let pos = self.tree.append_entry(&entry)?;
        self.meta.incr_active_entry_count();
        Ok(pos)
    }

    fn kept_entries(&self) -> i64 {
        self.meta.max_serial() - self.meta.oldest_active_twig_id() * LEAF_COUNT_IN_TWIG
    }

    /// While the log keeps too many dead entries around, rewrite the oldest
    /// twig's survivors to the head of the log and evict the twig.
    fn reap_if_needed(&mut self) -> Result<()> {
        while self.kept_entries()
            > self.cfg.kept_to_active_ratio * self.meta.active_entry_count()
            && self.meta.active_entry_count() > self.cfg.start_reap_threshold
            && self.meta.oldest_active_twig_id() < self.tree.youngest_twig_id()
        {
            let twig_id = self.meta.oldest_active_twig_id();
            let survivors = self.tree.active_entries_in_twig(twig_id)?;
            info!(twig_id, survivors = survivors.len(), "reaping twig");
            for entry in survivors {
                // rewrite each survivor under a fresh serial at the head
                let key = entry.key.clone();
                self.deactivate_entry(entry.serial_num)?;
                let pos = self.append_new_entry(entry)?;
                self.idx.set(&key, pos);
            }
            // the twig is now empty; drop it from the active set
            self.tree.evict_twig(twig_id);
            self.meta.incr_oldest_active_twig_id();
        }
        Ok(())
    }

    /// Prunes every complete, even-aligned run of reaped twigs whose entries
    /// were all written before `height`, persisting the edge nodes that keep
    /// the surviving tree recoverable. Call between blocks.
    pub fn prune_before_height(&mut self, height: i64) -> Result<()> {
        assert!(!self.in_block, "prune_before_height inside a block");
        let start = self.meta.last_pruned_twig() + 1;
        // walk right while twigs are evicted and finished before `height`;
        // the next twig's first-write height bounds this twig's last write
        let mut end = start;
        while self.tree.twig_can_be_pruned(end)
            && self
                .meta
                .twig_height(end + 1)
                .is_some_and(|h| h < height)
        {
            end += 1;
        }
        let end = end & !1; // prune_twigs wants an even boundary
        if end - start >= MIN_PRUNE_COUNT {
            let blob = self.tree.prune_twigs(start, end)?;
            // the edge nodes are the recovery anchor; persist them now
            self.meta.set_edge_nodes(blob);
            for twig_id in start..end {
                self.meta.delete_twig_height(twig_id);
            }
            self.meta.set_last_pruned_twig(end - 1);
            self.meta.commit()?;
            info!(start, end, "pruned twigs");
        }
        Ok(())
    }

    /// The value stored under `key`, if live.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(off) = self.idx.get(key) else {
            return Ok(None);
        };
        Ok(Some(self.tree.read_entry(off)?.value))
    }

    /// The full entry stored under `key`, if live.
    pub fn get_entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        let Some(off) = self.idx.get(key) else {
            return Ok(None);
        };
        Ok(Some(self.tree.read_entry(off)?))
    }

    /// Live `(key, value)` pairs in `[start, end)`, ascending.
    pub fn iter_range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a {
        self.idx
            .iter_range(start, end)
            .map(move |(key, off)| Ok((key, self.tree.read_entry(off)?.value)))
    }

    /// Live `(key, value)` pairs in `[start, end)`, descending.
    pub fn iter_range_rev<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a {
        self.idx
            .iter_range_rev(start, end)
            .map(move |(key, off)| Ok((key, self.tree.read_entry(off)?.value)))
    }

    /// Verifies that walking the index backwards reproduces the `next_key`
    /// chain stored in the entries.
    pub fn check_next_key_chain(&self) -> Result<()> {
        let mut next_key = self.cfg.end_guard.clone();
        for (key, off) in self
            .idx
            .iter_range_rev(&self.cfg.start_guard, &self.cfg.end_guard)
        {
            let entry = self.tree.read_entry(off)?;
            if entry.next_key != next_key {
                bail!(
                    "broken next_key chain at {:?}: entry says {:?}, index says {:?}",
                    key,
                    entry.next_key,
                    next_key
                );
            }
            next_key = key;
        }
        Ok(())
    }

    /// Syncs the sidecar dumps and clears the running flag, so the next
    /// open can skip the entry-file replay.
    pub fn close(self) -> Result<()> {
        assert!(!self.in_block, "close inside a block");
        let Store {
            mut meta, mut tree, ..
        } = self;
        tree.sync()?;
        meta.set_entry_file_size(tree.entry_file_size());
        meta.set_twig_mt_file_size(tree.twig_mt_file_size());
        meta.set_is_running(false);
        meta.commit()?;
        tree.close()?;
        Ok(())
    }
}
