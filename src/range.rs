// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    config::LsmOpts,
    heap::{HeapPos, HEAP_STRAY},
    run::RunSlice,
    IteratorType, RangeId, UserKey,
};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering::AcqRel, Ordering::Acquire, Ordering::Relaxed},
    Arc, Mutex, MutexGuard,
};

/// Seeds below a tenth of the range admit one extra run per level, smearing
/// compaction across ranges instead of firing them all at once.
const SEED_BONUS_THRESHOLD: u32 = u32::MAX / 10;

/// Key-space partition of an LSM tree: the half-open interval `[begin, end)`
///
/// Owns a stack of run slices, newest first. Ranges of one tree tile the key
/// space exactly; the leftmost begins at -inf, the rightmost ends at +inf.
pub struct Range {
    pub(crate) id: RangeId,

    /// Lower bound, inclusive; `None` is -inf
    begin: Option<UserKey>,

    /// Upper bound, exclusive; `None` is +inf
    end: Option<UserKey>,

    inner: Mutex<RangeInner>,

    /// Bumped whenever the slice stack changes; iterators snapshot it.
    version: AtomicU64,

    /// Slot in the LSM's compaction heap.
    heap_pos: AtomicUsize,
}

pub(crate) struct RangeInner {
    /// Newest slice first.
    pub slices: Vec<Arc<RunSlice>>,

    /// Number of slices worth compacting, from the newest downwards.
    pub compaction_priority: usize,

    /// Rows and bytes the pending compaction would read.
    pub queue_rows: u64,
    pub queue_bytes: u64,

    /// Forces whole-range compaction regardless of the level ladder.
    pub needs_compaction: bool,

    /// Completed compactions of this range.
    pub n_compactions: u32,

    /// Dump count of the oldest slice's run at attach time. An accounting
    /// value for observability; may drift after forced compaction.
    pub dumps_per_compaction: u32,

    /// Set while a task of the scheduler works on this range.
    pub is_scheduled: bool,
}

impl Range {
    #[must_use]
    pub fn new(id: RangeId, begin: Option<UserKey>, end: Option<UserKey>) -> Arc<Self> {
        Arc::new(Self {
            id,
            begin,
            end,
            inner: Mutex::new(RangeInner {
                slices: Vec::new(),
                compaction_priority: 0,
                queue_rows: 0,
                queue_bytes: 0,
                needs_compaction: false,
                n_compactions: 0,
                dumps_per_compaction: 0,
                is_scheduled: false,
            }),
            version: AtomicU64::new(0),
            heap_pos: AtomicUsize::new(HEAP_STRAY),
        })
    }

    #[must_use]
    pub fn id(&self) -> RangeId {
        self.id
    }

    #[must_use]
    pub fn begin(&self) -> Option<&UserKey> {
        self.begin.as_ref()
    }

    #[must_use]
    pub fn end(&self) -> Option<&UserKey> {
        self.end.as_ref()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Acquire)
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, RangeInner> {
        self.inner.lock().expect("lock is poisoned")
    }

    /// Returns `true` if `key` lies in `[begin, end)`.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(begin) = &self.begin {
            if key < &**begin {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= &**end {
                return false;
            }
        }
        true
    }

    /// Snapshot of the slice stack, newest first.
    #[must_use]
    pub fn slices(&self) -> Vec<Arc<RunSlice>> {
        self.lock().slices.clone()
    }

    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.lock().slices.len()
    }

    /// Total bytes across all slices.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.lock().slices.iter().map(|s| s.bytes()).sum()
    }

    #[must_use]
    pub fn compaction_priority(&self) -> usize {
        self.lock().compaction_priority
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.lock().is_scheduled
    }

    /// Adds a slice on top of the stack (the newest position).
    pub fn add_slice(&self, slice: Arc<RunSlice>) {
        self.lock().slices.insert(0, slice);
        self.version.fetch_add(1, AcqRel);
    }

    /// Adds a slice right before `next` in the stack; used by compaction to
    /// put the output run at the position of the consumed inputs.
    pub fn add_slice_before(&self, slice: Arc<RunSlice>, next: &Arc<RunSlice>) {
        let mut inner = self.lock();
        let pos = inner
            .slices
            .iter()
            .position(|s| Arc::ptr_eq(s, next))
            .unwrap_or(inner.slices.len());
        inner.slices.insert(pos, slice);
        drop(inner);
        self.version.fetch_add(1, AcqRel);
    }

    /// Adds a slice at the bottom of the stack (the oldest position).
    pub fn add_slice_back(&self, slice: Arc<RunSlice>) {
        self.lock().slices.push(slice);
        self.version.fetch_add(1, AcqRel);
    }

    pub fn remove_slice(&self, slice: &Arc<RunSlice>) {
        let mut inner = self.lock();
        inner.slices.retain(|s| !Arc::ptr_eq(s, slice));
        drop(inner);
        self.version.fetch_add(1, AcqRel);
    }

    /// Recomputes how many slices, from the newest downwards, are worth
    /// compacting.
    ///
    /// Slices are grouped into levels: the target size of each level is
    /// `run_size_ratio` times the previous one, anchored so that the oldest
    /// slice lands slightly below its level's target. A level holding more
    /// than `run_count_per_level` runs triggers compaction of itself and all
    /// newer levels. More than one run in the last level always triggers, to
    /// bound space amplification.
    pub fn update_compaction_priority(&self, opts: &LsmOpts) {
        debug_assert!(opts.run_count_per_level > 0);
        debug_assert!(opts.run_size_ratio > 1.0);

        let mut inner = self.lock();

        inner.compaction_priority = 0;
        inner.queue_rows = 0;
        inner.queue_bytes = 0;

        if inner.slices.len() <= 1 {
            // Nothing to compact.
            inner.needs_compaction = false;
            return;
        }

        if inner.needs_compaction {
            inner.compaction_priority = inner.slices.len();
            inner.queue_rows = inner.slices.iter().map(|s| s.row_count()).sum();
            inner.queue_bytes = inner.slices.iter().map(|s| s.bytes()).sum();
            return;
        }

        // Anchor the level ladder: divide the oldest slice's size by the
        // ratio (rounding up) until it drops below the newest slice's size.
        // Rounding up keeps the last level's target slightly above the
        // oldest run, not below, which matters for space amplification.
        #[allow(clippy::expect_used)]
        let oldest = inner.slices.last().expect("checked above");
        #[allow(clippy::expect_used)]
        let newest = inner.slices.first().expect("checked above");

        let newest_size = newest.bytes().max(1);
        let mut size = oldest.bytes().max(1);
        let mut target_run_size;
        loop {
            target_run_size = size;

            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            {
                size = ((size as f64) / opts.run_size_ratio).ceil() as u64;
            }
            size = size.max(1);
            if size <= newest_size {
                break;
            }
        }

        let mut total_rows = 0u64;
        let mut total_bytes = 0u64;
        let mut total_run_count = 0usize;
        let mut level_run_count = 0usize;
        let mut est_new_run_size = 0u64;

        let mut priority = 0usize;
        let mut queue_rows = 0u64;
        let mut queue_bytes = 0u64;

        for slice in &inner.slices {
            let size = slice.bytes();
            level_run_count += 1;
            total_run_count += 1;
            total_rows += slice.row_count();
            total_bytes += slice.bytes();

            while size > target_run_size {
                // The run overflows this level; push it down, switching to
                // the next level of the ladder.
                level_run_count = 1;

                // If an upper-level compaction is already scheduled and its
                // estimated output lands here, count it right away to avoid
                // a cascading second compaction.
                if est_new_run_size > target_run_size {
                    level_run_count += 1;
                }

                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss
                )]
                {
                    target_run_size = ((target_run_size as f64) * opts.run_size_ratio) as u64;
                }
            }

            let mut max_run_count = opts.run_count_per_level;
            if slice.seed < SEED_BONUS_THRESHOLD {
                max_run_count += 1;
            }

            if level_run_count > max_run_count {
                priority = total_run_count;
                queue_rows = total_rows;
                queue_bytes = total_bytes;
                est_new_run_size = total_bytes;
            }
        }

        if level_run_count > 1 {
            // Never keep more than one run at the last level.
            priority = total_run_count;
            queue_rows = total_rows;
            queue_bytes = total_bytes;
        }

        inner.compaction_priority = priority;
        inner.queue_rows = queue_rows;
        inner.queue_bytes = queue_bytes;
    }

    /// Inherits the dump count of the oldest slice's run.
    pub fn update_dumps_per_compaction(&self) {
        let mut inner = self.lock();
        inner.dumps_per_compaction = inner
            .slices
            .last()
            .map_or(0, |s| s.run().info().dump_count);
    }

    /// Decides whether the range should split in two, returning the split
    /// key.
    ///
    /// Only ranges that were compacted at least once are considered (their
    /// sizing is stable), only when the oldest slice outgrew the target
    /// range size by a third, and only when the median page key actually
    /// divides the slice.
    #[must_use]
    pub fn needs_split(&self, range_size: u64) -> Option<UserKey> {
        let inner = self.lock();

        if inner.n_compactions < 1 {
            return None;
        }

        let slice = inner.slices.last()?;

        if slice.bytes() < range_size * 4 / 3 {
            return None;
        }

        let (first_page, last_page) = slice.page_range()?;
        let mid_page = first_page + (last_page - first_page) / 2;

        let run = slice.run();
        let mid_key = run.page_info(mid_page)?.min_key.clone();
        let first_key = &run.page_info(first_page)?.min_key;

        // A split producing an empty half is pointless.
        if mid_key == *first_key {
            return None;
        }

        if let Some(begin) = slice.begin() {
            if mid_key <= *begin {
                return None;
            }
        }
        if let Some(end) = slice.end() {
            if mid_key >= *end {
                return None;
            }
        }

        Some(mid_key)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, AcqRel);
    }
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Range#{}({:?}..{:?})", self.id, self.begin, self.end)
    }
}

/// Wrapper giving a range its slot in the per-LSM compaction heap.
#[derive(Clone)]
pub struct RangeHeapItem(pub Arc<Range>);

impl HeapPos for RangeHeapItem {
    fn heap_pos(&self) -> usize {
        self.0.heap_pos.load(Relaxed)
    }

    fn set_heap_pos(&self, pos: usize) {
        self.0.heap_pos.store(pos, Relaxed);
    }
}

/// Begin bound usable as a tree key; -inf orders below every key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BeginBound(pub Option<UserKey>);

impl Ord for BeginBound {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (&self.0, &other.0) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for BeginBound {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The ranges of one LSM tree, ordered by begin key
#[derive(Default)]
pub(crate) struct RangeTree {
    pub tree: BTreeMap<BeginBound, Arc<Range>>,
}

impl RangeTree {
    pub fn insert(&mut self, range: Arc<Range>) {
        self.tree
            .insert(BeginBound(range.begin().cloned()), range);
    }

    pub fn remove(&mut self, range: &Arc<Range>) {
        self.tree.remove(&BeginBound(range.begin().cloned()));
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn first(&self) -> Option<&Arc<Range>> {
        self.tree.values().next()
    }

    pub fn last(&self) -> Option<&Arc<Range>> {
        self.tree.values().next_back()
    }

    /// The first range a scan of `itype` from `key` could find a match in.
    ///
    /// An empty key selects the extreme range of the scan direction. A key
    /// that is a strict prefix of a range's begin orders below it bytewise,
    /// which lands the scan on the preceding range, as a partial-key match
    /// could be found there first.
    pub fn find(&self, itype: IteratorType, key: &UserKey) -> Option<&Arc<Range>> {
        if key.is_empty() {
            return if itype.is_reverse() {
                self.last()
            } else {
                self.first()
            };
        }

        // Last range with begin <= key; the leftmost range has begin -inf,
        // so this exists whenever the tree is non-empty.
        self.tree
            .range(..=BeginBound(Some(key.clone())))
            .next_back()
            .map(|(_, r)| r)
    }

    /// The neighbor of `range` in scan direction.
    pub fn next_in_direction(&self, range: &Arc<Range>, reverse: bool) -> Option<&Arc<Range>> {
        let bound = BeginBound(range.begin().cloned());
        if reverse {
            self.tree.range(..bound).next_back().map(|(_, r)| r)
        } else {
            self.tree
                .range((
                    std::ops::Bound::Excluded(bound),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .map(|(_, r)| r)
        }
    }

    /// All ranges intersecting `[min_key, max_key]`, used to scatter a new
    /// run over the ranges it overlaps.
    pub fn intersecting(&self, min_key: &UserKey, max_key: &UserKey) -> Vec<Arc<Range>> {
        self.tree
            .values()
            .filter(|r| {
                let above_min = r.end().is_none_or(|end| *min_key < *end);
                let below_max = r.begin().is_none_or(|begin| *max_key >= *begin);
                above_min && below_max
            })
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Range>> {
        self.tree.values()
    }
}

/// Decides whether `range` and some neighbors should be merged back into
/// one, returning the ranges to coalesce in key order.
///
/// Ranges are aggregated as long as the total stays below half the target
/// range size; scheduled neighbors act as walls.
#[must_use]
pub(crate) fn needs_coalesce(
    tree: &RangeTree,
    range: &Arc<Range>,
    range_size: u64,
) -> Option<Vec<Arc<Range>>> {
    debug_assert!(!range.is_scheduled());

    let max_size = range_size / 2;
    let mut total = range.bytes();

    let mut result = std::collections::VecDeque::new();
    result.push_back(range.clone());

    let mut it = range.clone();
    while let Some(next) = tree.next_in_direction(&it, false) {
        if next.is_scheduled() || total + next.bytes() > max_size {
            break;
        }
        total += next.bytes();
        result.push_back(next.clone());
        it = next.clone();
    }

    let mut it = range.clone();
    while let Some(prev) = tree.next_in_direction(&it, true) {
        if prev.is_scheduled() || total + prev.bytes() > max_size {
            break;
        }
        total += prev.bytes();
        result.push_front(prev.clone());
        it = prev.clone();
    }

    if result.len() > 1 {
        Some(result.into())
    } else {
        None
    }
}
