// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::{Cache, CacheEnv},
    config::{LsmOpts, MAX_RANGE_SIZE, MIN_RANGE_SIZE},
    heap::Heap,
    ids::Ids,
    mem::Mem,
    range::{needs_coalesce, Range, RangeHeapItem, RangeTree},
    run::Run,
    stats::LsmStats,
    stmt::{apply_upsert, Lsn, Statement, StmtKind, UPSERT_THRESHOLD},
    vylog::{LogRecord, VyLog},
    IndexId, IteratorType, LsmId, SpaceId, UserKey,
};
use std::sync::{
    atomic::{
        AtomicBool, AtomicI64, AtomicU64, AtomicUsize,
        Ordering::{AcqRel, Acquire},
    },
    Arc, Mutex, MutexGuard, RwLock,
};

/// Callback scheduling a background squash of a long UPSERT chain.
pub type SquashCallback = Arc<dyn Fn(&Arc<Lsm>, &UserKey) + Send + Sync>;

/// Where a new slice lands in a range's stack.
pub enum SlicePos<'a> {
    /// Newest position; used by dump.
    Front,

    /// Oldest position; used by compaction when it consumed everything.
    Back,

    /// Right before the given surviving slice; used by compaction.
    Before(&'a Arc<crate::run::RunSlice>),
}

/// The in-memory levels of an LSM tree.
pub(crate) struct MemLevel {
    pub active: Arc<Mem>,

    /// Sealed levels, newest first.
    pub sealed: Vec<Arc<Mem>>,
}

/// One index's LSM tree
///
/// Wires the active in-memory level, the sealed levels, the range tree with
/// its run slices, the tuple cache and the statistics. Structural changes
/// bump `mem_list_version` / `range_tree_version`; iterators snapshot both
/// and restart when they observe a change after a suspension point.
pub struct Lsm {
    pub(crate) id: LsmId,
    pub(crate) space_id: SpaceId,
    pub(crate) index_id: IndexId,

    /// Replication group, carried through to the metadata log.
    pub(crate) group_id: u32,

    pub(crate) opts: LsmOpts,

    mem: RwLock<MemLevel>,
    mem_list_version: AtomicU64,

    ranges: RwLock<RangeTree>,
    range_tree_version: AtomicU64,

    runs: Mutex<Vec<Arc<Run>>>,

    pub(crate) cache: Arc<Cache>,
    pub(crate) stats: LsmStats,

    /// Ranges ordered by descending compaction priority.
    range_heap: Mutex<Heap<RangeHeapItem>>,

    /// Max LSN the on-disk state covers.
    dump_lsn: AtomicI64,

    pub(crate) is_dropped: AtomicBool,
    pub(crate) is_dumping: AtomicBool,

    /// Tuple format epoch; a mismatch with the active level forces rotation.
    schema_version: AtomicU64,

    squash_cb: Mutex<Option<SquashCallback>>,

    /// Scheduler heap slots.
    pub(crate) dump_pos: AtomicUsize,
    pub(crate) compaction_pos: AtomicUsize,

    ids: Arc<Ids>,
    generation: Arc<AtomicU64>,
}

impl Lsm {
    pub(crate) fn new(
        id: LsmId,
        space_id: SpaceId,
        index_id: IndexId,
        opts: LsmOpts,
        cache_env: &Arc<CacheEnv>,
        ids: Arc<Ids>,
        generation: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let active = Mem::new(ids.next_mem(), generation.load(Acquire), 0);

        Arc::new(Self {
            id,
            space_id,
            index_id,
            group_id: 0,
            opts,
            mem: RwLock::new(MemLevel {
                active,
                sealed: Vec::new(),
            }),
            mem_list_version: AtomicU64::new(0),
            ranges: RwLock::new(RangeTree::default()),
            range_tree_version: AtomicU64::new(0),
            runs: Mutex::new(Vec::new()),
            cache: cache_env.new_cache(),
            stats: LsmStats::default(),
            range_heap: Mutex::new(Heap::default()),
            dump_lsn: AtomicI64::new(-1),
            is_dropped: AtomicBool::new(false),
            is_dumping: AtomicBool::new(false),
            schema_version: AtomicU64::new(0),
            squash_cb: Mutex::new(None),
            dump_pos: AtomicUsize::new(crate::heap::HEAP_STRAY),
            compaction_pos: AtomicUsize::new(crate::heap::HEAP_STRAY),
            ids,
            generation,
        })
    }

    #[must_use]
    pub fn id(&self) -> LsmId {
        self.id
    }

    #[must_use]
    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    #[must_use]
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    /// Returns `true` for the primary index of its space.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.index_id == 0
    }

    #[must_use]
    pub fn mem_list_version(&self) -> u64 {
        self.mem_list_version.load(Acquire)
    }

    #[must_use]
    pub fn range_tree_version(&self) -> u64 {
        self.range_tree_version.load(Acquire)
    }

    #[must_use]
    pub fn dump_lsn(&self) -> Lsn {
        self.dump_lsn.load(Acquire)
    }

    pub(crate) fn set_dump_lsn(&self, lsn: Lsn) {
        self.dump_lsn.fetch_max(lsn, AcqRel);
    }

    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.is_dropped.load(Acquire)
    }

    /// Installs the UPSERT squash scheduler.
    #[allow(clippy::expect_used)]
    pub fn set_squash_callback(&self, cb: SquashCallback) {
        *self.squash_cb.lock().expect("lock is poisoned") = cb.into();
    }

    #[allow(clippy::expect_used)]
    fn mem_read(&self) -> std::sync::RwLockReadGuard<'_, MemLevel> {
        self.mem.read().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn mem_write(&self) -> std::sync::RwLockWriteGuard<'_, MemLevel> {
        self.mem.write().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn ranges_read(&self) -> std::sync::RwLockReadGuard<'_, RangeTree> {
        self.ranges.read().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn ranges_write(&self) -> std::sync::RwLockWriteGuard<'_, RangeTree> {
        self.ranges.write().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn range_heap(&self) -> MutexGuard<'_, Heap<RangeHeapItem>> {
        self.range_heap.lock().expect("lock is poisoned")
    }

    /// Snapshot of the in-memory levels: `(active, sealed newest first)`.
    #[must_use]
    pub fn mem_snapshot(&self) -> (Arc<Mem>, Vec<Arc<Mem>>) {
        let guard = self.mem_read();
        (guard.active.clone(), guard.sealed.clone())
    }

    /// Runs currently linked into the tree.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn runs(&self) -> Vec<Arc<Run>> {
        self.runs.lock().expect("lock is poisoned").clone()
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn run_count(&self) -> usize {
        self.runs.lock().expect("lock is poisoned").len()
    }

    /// Number of ranges.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges_read().len()
    }

    /// Total run slices across all ranges.
    #[must_use]
    pub fn total_slice_count(&self) -> usize {
        self.ranges_read().iter().map(|r| r.slice_count()).sum()
    }

    // --- Write path ---------------------------------------------------

    /// Rotates the active level if its generation or format lags, then pins
    /// it for an imminent write. The caller unpins on commit or rollback.
    pub(crate) fn begin_write(&self) -> Arc<Mem> {
        self.rotate_mem_if_required();
        let guard = self.mem_read();
        guard.active.pin();
        guard.active.clone()
    }

    /// Inserts a prepared statement into the given in-memory level.
    ///
    /// The level must be the one returned by [`Lsm::begin_write`]; a format
    /// mismatch means a concurrent DDL slipped in between.
    pub(crate) fn set(&self, mem: &Arc<Mem>, stmt: Statement) -> crate::Result<()> {
        if mem.schema_version != self.schema_version.load(Acquire) {
            return Err(crate::Error::InvalidMetaLog(
                "tuple format changed under a prepared write".into(),
            ));
        }

        // The statement is visible to latest-state readers the moment it
        // lands in the tree; a stale cache entry must not outlive that.
        self.cache.on_write(&stmt.key);

        if stmt.kind == StmtKind::Upsert {
            mem.insert_upsert(stmt);
        } else {
            mem.insert(stmt);
        }

        self.stats.mem_writes.fetch_add(1, AcqRel);
        Ok(())
    }

    /// Finalizes a prepared statement: renumbers it to the commit LSN,
    /// invalidates the cache and gives UPSERTs a chance to squash.
    pub(crate) fn commit_stmt(self: &Arc<Self>, mem: &Arc<Mem>, stmt: &Statement, lsn: Lsn) {
        mem.erase(&stmt.key, stmt.lsn);
        let committed = stmt.with_lsn(lsn);

        self.cache.on_write(&committed.key);

        if committed.kind == StmtKind::Upsert {
            mem.insert(committed.clone());
            self.commit_upsert(mem, committed);
        } else {
            mem.insert(committed);
        }
    }

    /// Erases a prepared statement; the write never happened.
    pub(crate) fn rollback_stmt(&self, mem: &Arc<Mem>, stmt: &Statement) {
        mem.erase(&stmt.key, stmt.lsn);
        self.cache.on_write(&stmt.key);
    }

    /// UPSERT squash on commit.
    ///
    /// When the active level is the sole source for the key and the chain is
    /// fresh, the UPSERT is applied against its immediate predecessor right
    /// away, turning it into a REPLACE. A chain that crossed the threshold
    /// is handed to the squash callback instead. Both are optimizations;
    /// skipping them is always correct.
    #[allow(clippy::expect_used)]
    fn commit_upsert(self: &Arc<Self>, mem: &Arc<Mem>, stmt: Statement) {
        debug_assert_eq!(StmtKind::Upsert, stmt.kind);

        let sole_source = {
            let guard = self.mem_read();
            guard.sealed.is_empty() && self.run_count() == 0
        };

        if sole_source && stmt.n_upserts == 0 {
            let older = mem.older_lsn(&stmt.key, stmt.lsn);
            let applied = apply_upsert(&stmt, older.as_ref());
            if applied.kind.is_terminal() && applied.lsn == stmt.lsn {
                mem.insert(applied);
                self.stats.upsert_squashed.fetch_add(1, AcqRel);
            }
            return;
        }

        if stmt.n_upserts >= UPSERT_THRESHOLD.saturating_sub(1) {
            let cb = self.squash_cb.lock().expect("lock is poisoned").clone();
            if let Some(cb) = cb {
                cb(self, &stmt.key);
            }
        }
    }

    // --- In-memory level lifecycle ------------------------------------

    /// Seals the active level and starts a fresh one.
    pub fn rotate_mem(&self) {
        let mut guard = self.mem_write();
        let fresh = Mem::new(
            self.ids.next_mem(),
            self.generation.load(Acquire),
            self.schema_version.load(Acquire),
        );
        let old = std::mem::replace(&mut guard.active, fresh);
        if old.is_empty() {
            // An empty level has nothing to dump.
            drop(guard);
        } else {
            guard.sealed.insert(0, old);
            drop(guard);
        }
        self.mem_list_version.fetch_add(1, AcqRel);
        log::trace!("lsm {}: rotated active mem", self.id);
    }

    /// Rotates if the active level belongs to an old generation or format.
    pub(crate) fn rotate_mem_if_required(&self) {
        let (generation, schema) = {
            let guard = self.mem_read();
            (guard.active.generation, guard.active.schema_version)
        };
        if generation != self.generation.load(Acquire)
            || schema != self.schema_version.load(Acquire)
        {
            self.rotate_mem();
        }
    }

    /// Unlinks a dumped sealed level.
    pub fn delete_mem(&self, mem: &Arc<Mem>) {
        let mut guard = self.mem_write();
        guard.sealed.retain(|m| !Arc::ptr_eq(m, mem));
        drop(guard);
        self.mem_list_version.fetch_add(1, AcqRel);
    }

    /// Smallest generation among levels still holding data, or none.
    #[must_use]
    pub fn min_mem_generation(&self) -> Option<u64> {
        let guard = self.mem_read();
        let mut min = None;
        if !guard.active.is_empty() {
            min = Some(guard.active.generation);
        }
        for mem in &guard.sealed {
            min = Some(min.map_or(mem.generation, |m: u64| m.min(mem.generation)));
        }
        min
    }

    /// Returns `true` while any in-memory level is pinned by a writer.
    #[must_use]
    pub fn is_mem_pinned(&self) -> bool {
        let guard = self.mem_read();
        guard.active.is_pinned() || guard.sealed.iter().any(|m| m.is_pinned())
    }

    // --- Runs and ranges ----------------------------------------------

    #[allow(clippy::expect_used)]
    pub fn add_run(&self, run: Arc<Run>) {
        self.runs.lock().expect("lock is poisoned").push(run);
    }

    #[allow(clippy::expect_used)]
    pub fn remove_run(&self, run: &Arc<Run>) {
        self.runs
            .lock()
            .expect("lock is poisoned")
            .retain(|r| !Arc::ptr_eq(r, run));
    }

    pub fn add_range(&self, range: Arc<Range>) {
        self.stats
            .slices_per_range
            .observe(range.slice_count() as u64);
        self.ranges_write().insert(range.clone());
        self.range_heap().insert(RangeHeapItem(range), range_less);
        self.range_tree_version.fetch_add(1, AcqRel);
    }

    pub fn remove_range(&self, range: &Arc<Range>) {
        self.stats
            .slices_per_range
            .unobserve(range.slice_count() as u64);
        self.ranges_write().remove(range);
        self.range_heap()
            .remove(&RangeHeapItem(range.clone()), range_less);
        self.range_tree_version.fetch_add(1, AcqRel);
    }

    /// Attaches a slice to a range, keeping the histogram and heap current.
    pub fn add_slice_to_range(
        &self,
        range: &Arc<Range>,
        slice: Arc<crate::run::RunSlice>,
        pos: SlicePos<'_>,
    ) {
        self.stats
            .slices_per_range
            .unobserve(range.slice_count() as u64);
        match pos {
            SlicePos::Front => range.add_slice(slice),
            SlicePos::Back => range.add_slice_back(slice),
            SlicePos::Before(next) => range.add_slice_before(slice, next),
        }
        self.stats
            .slices_per_range
            .observe(range.slice_count() as u64);
        self.update_range_priority(range);
    }

    pub fn remove_slice_from_range(
        &self,
        range: &Arc<Range>,
        slice: &Arc<crate::run::RunSlice>,
    ) {
        self.stats
            .slices_per_range
            .unobserve(range.slice_count() as u64);
        range.remove_slice(slice);
        self.stats
            .slices_per_range
            .observe(range.slice_count() as u64);
    }

    /// Recomputes a range's priority and repositions it in the heap.
    pub fn update_range_priority(&self, range: &Arc<Range>) {
        range.update_compaction_priority(&self.opts);
        self.range_heap()
            .update(&RangeHeapItem(range.clone()), range_less);
    }

    /// The range a scan of `itype` from `key` starts in.
    #[must_use]
    pub fn find_range(&self, itype: IteratorType, key: &UserKey) -> Option<Arc<Range>> {
        self.ranges_read().find(itype, key).cloned()
    }

    /// The neighbor of `range` in scan direction.
    #[must_use]
    pub fn next_range(&self, range: &Arc<Range>, reverse: bool) -> Option<Arc<Range>> {
        self.ranges_read().next_in_direction(range, reverse).cloned()
    }

    /// Ranges intersecting `[min_key, max_key]`; dump completion scatters
    /// the new run's slices over these.
    #[must_use]
    pub fn find_range_intersection(&self, min_key: &UserKey, max_key: &UserKey) -> Vec<Arc<Range>> {
        self.ranges_read().intersecting(min_key, max_key)
    }

    /// Priority of the most compaction-worthy range.
    #[must_use]
    pub fn compaction_priority(&self) -> usize {
        self.range_heap()
            .top()
            .map_or(0, |item| item.0.compaction_priority())
    }

    /// Marks every range for compaction and reorders the heap.
    pub fn force_compaction(&self) {
        {
            let ranges = self.ranges_read();
            for range in ranges.iter() {
                range.lock().needs_compaction = true;
                range.update_compaction_priority(&self.opts);
            }
        }
        self.range_heap().update_all(range_less);
        log::info!("lsm {}: forced compaction of {} ranges", self.id, self.range_count());
    }

    /// Target range size; adaptive unless configured.
    #[must_use]
    pub fn range_size(&self) -> u64 {
        if self.opts.range_size > 0 {
            return self.opts.range_size;
        }

        // Aim for at least as many ranges as dumps-per-compaction (times
        // four, for smoothing) so each dump compacts about the same amount.
        let dumps = self.stats.slices_per_range.percentile_bound(0.5).max(1);
        let range_count = 4 * dumps;

        let last_level_bytes: u64 = {
            let ranges = self.ranges_read();
            ranges
                .iter()
                .filter_map(|r| r.slices().last().map(|s| s.bytes()))
                .sum()
        };

        (last_level_bytes / range_count).clamp(MIN_RANGE_SIZE, MAX_RANGE_SIZE)
    }

    // --- Split / coalesce ---------------------------------------------

    /// Splits `range` in two if the split test passes. Logs the swap, cuts
    /// every slice into both halves and replaces the range.
    pub fn split_range(&self, vylog: &VyLog, range: &Arc<Range>) -> crate::Result<bool> {
        let Some(split_key) = range.needs_split(self.range_size()) else {
            return Ok(false);
        };

        let bounds = [range.begin().cloned(), Some(split_key.clone()), range.end().cloned()];

        let mut parts = Vec::with_capacity(2);
        let mut tx = Vec::new();

        tx.push(LogRecord::DeleteRange {
            range_id: range.id(),
        });

        for i in 0..2 {
            let part = Range::new(
                self.ids.next_range(),
                bounds.get(i).cloned().flatten(),
                bounds.get(i + 1).cloned().flatten(),
            );

            tx.push(LogRecord::InsertRange {
                lsm_id: self.id,
                range_id: part.id(),
                begin: part.begin().cloned(),
                end: part.end().cloned(),
            });

            // Cutting walks the source stack top down, so the in-memory
            // stack stays newest-first; the log records go out oldest-first
            // because replay rebuilds the stack in reverse.
            let mut cuts = Vec::new();
            for slice in range.slices() {
                if let Some(cut) =
                    slice.cut(self.ids.next_slice(), part.begin(), part.end())
                {
                    cuts.push(cut);
                }
            }
            for cut in cuts.iter().rev() {
                tx.push(LogRecord::InsertSlice {
                    range_id: part.id(),
                    run_id: cut.run().id(),
                    slice_id: cut.id(),
                    begin: cut.begin().cloned(),
                    end: cut.end().cloned(),
                });
            }
            part.lock().slices = cuts;

            {
                let mut inner = part.lock();
                inner.n_compactions = range.lock().n_compactions;
            }
            part.update_dumps_per_compaction();
            parts.push(part);
        }

        vylog.commit(tx)?;

        self.remove_range(range);
        for slice in range.slices() {
            slice.retire();
        }
        for part in parts {
            part.update_compaction_priority(&self.opts);
            self.add_range(part);
        }

        log::info!("lsm {}: split {range:?} at {split_key:?}", self.id);
        Ok(true)
    }

    /// Coalesces `range` with small neighbors if the test passes.
    pub fn coalesce_range(&self, vylog: &VyLog, range: &Arc<Range>) -> crate::Result<bool> {
        let range_size = self.range_size();

        let Some(victims) = ({
            let ranges = self.ranges_read();
            needs_coalesce(&ranges, range, range_size)
        }) else {
            return Ok(false);
        };

        #[allow(clippy::expect_used)]
        let first = victims.first().expect("coalesce has at least two ranges");
        #[allow(clippy::expect_used)]
        let last = victims.last().expect("coalesce has at least two ranges");

        let result = Range::new(
            self.ids.next_range(),
            first.begin().cloned(),
            last.end().cloned(),
        );

        let mut tx = Vec::new();
        for victim in &victims {
            tx.push(LogRecord::DeleteRange {
                range_id: victim.id(),
            });
        }
        tx.push(LogRecord::InsertRange {
            lsm_id: self.id,
            range_id: result.id(),
            begin: result.begin().cloned(),
            end: result.end().cloned(),
        });

        // Moving a slice between ranges keeps its identity; the metadata
        // log only needs to re-home it. Records go out oldest-first because
        // replay rebuilds the stack in reverse.
        {
            let mut inner = result.lock();
            for victim in &victims {
                for slice in victim.slices() {
                    inner.slices.push(slice);
                }
            }
            for slice in inner.slices.iter().rev() {
                tx.push(LogRecord::InsertSlice {
                    range_id: result.id(),
                    run_id: slice.run().id(),
                    slice_id: slice.id(),
                    begin: slice.begin().cloned(),
                    end: slice.end().cloned(),
                });
            }
        }

        vylog.commit(tx)?;

        for victim in &victims {
            self.remove_range(victim);
        }
        result.update_dumps_per_compaction();
        result.update_compaction_priority(&self.opts);
        self.add_range(result.clone());

        log::info!(
            "lsm {}: coalesced {} ranges into {result:?}",
            self.id,
            victims.len(),
        );
        Ok(true)
    }
}

/// Heap order: highest compaction priority on top.
pub(crate) fn range_less(a: &RangeHeapItem, b: &RangeHeapItem) -> bool {
    a.0.compaction_priority() > b.0.compaction_priority()
}
