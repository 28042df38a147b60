// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! User-facing ordered scan over one LSM tree
//!
//! Merges the transaction's write set, the tuple cache, the in-memory
//! levels and the run slices of the current range into a single ordered
//! stream under a read view. Disk reads happen with slices pinned; after
//! any read the tree's version counters are re-checked and the iterator
//! restarts from its last emitted key if the tree changed underneath it.

use crate::{
    cache::CacheIterator,
    lsm::Lsm,
    mem::MemIterator,
    range::Range,
    run::{PageCache, RunIterator},
    read_view::ReadView,
    stmt::{apply_upsert, Statement, StmtKind, MAX_LSN},
    tx::{Tx, TxManager, TxwIterator},
    IteratorType, UserKey,
};
use std::cmp::Ordering;
use std::sync::{atomic::Ordering::AcqRel, Arc};

enum Source {
    Txw(TxwIterator),
    Cache(CacheIterator),
    Mem(MemIterator),
    Run(RunIterator),
}

struct ReadSrc {
    source: Source,
    front_id: u64,
    is_started: bool,
}

impl ReadSrc {
    fn curr(&self) -> Option<&Statement> {
        match &self.source {
            Source::Txw(iter) => iter.curr(),
            Source::Cache(iter) => iter.curr(),
            Source::Mem(iter) => iter.curr(),
            Source::Run(iter) => iter.curr(),
        }
    }
}

/// Merging read iterator over one LSM tree
pub struct ReadIterator {
    lsm: Arc<Lsm>,
    xm: Arc<TxManager>,
    tx: Option<Arc<Tx>>,
    rv: Arc<ReadView>,
    page_cache: Arc<PageCache>,

    orig_itype: IteratorType,
    itype: IteratorType,
    key: UserKey,
    need_check_eq: bool,

    srcs: Vec<ReadSrc>,
    txw_src: Option<usize>,
    cache_src: usize,
    mem_src: usize,
    disk_src: usize,

    front_id: u64,
    prev_front_id: u64,
    curr_src: usize,
    curr: Option<Statement>,
    last: Option<Statement>,

    curr_range: Option<Arc<Range>>,
    mem_list_version: u64,
    range_tree_version: u64,
    range_version: u64,

    /// Last statement handed to the cache, the left link of the next chain.
    cache_prev: Option<Statement>,

    /// A DELETE from the write set was skipped since the last emission; a
    /// chain over that gap would wrongly claim the key never existed.
    skipped_txw_delete: bool,

    search_started: bool,
}

impl ReadIterator {
    pub(crate) fn new(
        lsm: Arc<Lsm>,
        xm: Arc<TxManager>,
        tx: Option<Arc<Tx>>,
        rv: Arc<ReadView>,
        page_cache: Arc<PageCache>,
        itype: IteratorType,
        key: UserKey,
    ) -> Self {
        let normalized = if key.is_empty() {
            itype.for_empty_key()
        } else {
            itype.normalize()
        };
        let need_check_eq =
            !key.is_empty() && matches!(itype, IteratorType::Eq | IteratorType::Req);

        lsm.stats.range_scans.fetch_add(1, AcqRel);

        Self {
            lsm,
            xm,
            tx,
            rv,
            page_cache,
            orig_itype: itype,
            itype: normalized,
            key,
            need_check_eq,
            srcs: Vec::new(),
            txw_src: None,
            cache_src: 0,
            mem_src: 0,
            disk_src: 0,
            front_id: 1,
            prev_front_id: 0,
            curr_src: usize::MAX,
            curr: None,
            last: None,
            curr_range: None,
            mem_list_version: 0,
            range_tree_version: 0,
            range_version: 0,
            cache_prev: None,
            skipped_txw_delete: false,
            search_started: false,
        }
    }

    fn reverse(&self) -> bool {
        self.itype.is_reverse()
    }

    /// Key order in scan direction; `None` sorts after everything.
    fn cmp_key(&self, a: Option<&Statement>, b: Option<&Statement>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                if self.reverse() {
                    b.key.cmp(&a.key)
                } else {
                    a.key.cmp(&b.key)
                }
            }
        }
    }

    /// Closes all sources and reopens them positioned after the last
    /// emitted statement, snapshotting the tree's version counters.
    fn restore(&mut self) {
        self.mem_list_version = self.lsm.mem_list_version();
        self.range_tree_version = self.lsm.range_tree_version();

        let anchor = self
            .last
            .as_ref()
            .map_or_else(|| self.key.clone(), |s| s.key.clone());

        self.curr_range = self.lsm.find_range(self.itype, &anchor);
        self.range_version = self.curr_range.as_ref().map_or(0, |r| r.version());

        self.srcs.clear();

        if let Some(tx) = &self.tx {
            self.txw_src = Some(self.srcs.len());
            self.srcs.push(ReadSrc {
                source: Source::Txw(TxwIterator::new(
                    tx.clone(),
                    self.lsm.id(),
                    self.itype,
                    self.key.clone(),
                )),
                front_id: 0,
                is_started: false,
            });
        } else {
            self.txw_src = None;
        }

        self.cache_src = self.srcs.len();
        self.srcs.push(ReadSrc {
            source: Source::Cache(self.lsm.cache.iter(
                self.itype,
                self.key.clone(),
                self.rv.vlsn(),
            )),
            front_id: 0,
            is_started: false,
        });

        self.mem_src = self.srcs.len();
        let (active, sealed) = self.lsm.mem_snapshot();
        self.srcs.push(ReadSrc {
            source: Source::Mem(active.iter(self.itype, self.key.clone(), self.rv.vlsn())),
            front_id: 0,
            is_started: false,
        });
        for mem in sealed {
            self.srcs.push(ReadSrc {
                source: Source::Mem(mem.iter(self.itype, self.key.clone(), self.rv.vlsn())),
                front_id: 0,
                is_started: false,
            });
        }

        self.disk_src = self.srcs.len();
        self.open_disk_sources();
    }

    /// Opens a run iterator per slice of the current range, newest first.
    fn open_disk_sources(&mut self) {
        self.srcs.truncate(self.disk_src);

        if let Some(range) = &self.curr_range {
            for slice in range.slices() {
                self.srcs.push(ReadSrc {
                    source: Source::Run(RunIterator::new(
                        slice,
                        self.page_cache.clone(),
                        self.itype,
                        self.key.clone(),
                        self.rv.vlsn(),
                    )),
                    front_id: 0,
                    is_started: false,
                });
            }
        }
    }

    /// Returns `true` if the source lags behind the last emitted key and
    /// must be fast-forwarded rather than advanced.
    fn is_behind(&self, idx: usize) -> bool {
        let Some(src) = self.srcs.get(idx) else {
            return false;
        };
        if !src.is_started {
            return true;
        }
        if src.curr().is_none() {
            // Ran off its end; a fresh skip past the last emitted key picks
            // up anything appended since without rewinding.
            return true;
        }
        let Some(last) = &self.last else {
            return false;
        };
        self.cmp_key(src.curr(), Some(last)) != Ordering::Greater
    }

    /// Exact-match shortcut: the first candidate equals the search key, so
    /// older sources cannot contribute anything newer.
    fn is_exact_match(&self, stmt: Option<&Statement>) -> bool {
        self.last.is_none()
            && matches!(
                self.orig_itype,
                IteratorType::Eq | IteratorType::Req | IteratorType::Ge | IteratorType::Le
            )
            && !self.key.is_empty()
            && stmt.is_some_and(|s| s.key == self.key)
    }

    /// Folds a source's position into the candidate for the next key.
    fn evaluate(&mut self, idx: usize, stop: &mut bool) {
        let Some(src) = self.srcs.get(idx) else {
            return;
        };

        let cmp = self.cmp_key(src.curr(), self.curr.as_ref());
        if cmp == Ordering::Less {
            self.curr = src.curr().cloned();
            self.curr_src = idx;
            self.front_id += 1;
        }
        if cmp != Ordering::Greater {
            if let Some(src) = self.srcs.get_mut(idx) {
                src.front_id = self.front_id;
            }
        }

        if cmp == Ordering::Less && self.is_exact_match(self.curr.as_ref()) {
            *stop = true;
        }
    }

    /// Updates one source's position for this round and evaluates it.
    fn scan_src(&mut self, idx: usize, stop: &mut bool) -> crate::Result<()> {
        let behind = self.is_behind(idx);
        let last = self.last.clone();
        let prev_front_id = self.prev_front_id;

        let mut cache_chain = false;

        if let Some(src) = self.srcs.get_mut(idx) {
            match &mut src.source {
                Source::Txw(iter) => {
                    if behind {
                        iter.skip_to(last.as_ref());
                    } else if src.front_id == prev_front_id {
                        iter.next_key();
                    }
                }
                Source::Cache(iter) => {
                    if behind {
                        iter.skip_to(last.as_ref(), &mut cache_chain);
                    } else if src.front_id == prev_front_id {
                        iter.next_key(&mut cache_chain);
                    }
                }
                Source::Mem(iter) => {
                    if behind {
                        iter.skip_to(last.as_ref());
                    } else if src.front_id == prev_front_id {
                        iter.next_key();
                    } else {
                        iter.restore(last.as_ref());
                    }
                }
                Source::Run(iter) => {
                    if behind {
                        iter.skip_to(last.as_ref())?;
                    } else if src.front_id == prev_front_id {
                        iter.next_key()?;
                    }
                }
            }
            src.is_started = true;
        }

        self.evaluate(idx, stop);

        // A chain in the cache proves nothing visible hides in older
        // sources between the previous key and this one.
        if cache_chain {
            *stop = true;
        }

        Ok(())
    }

    /// Re-checks the active in-memory level after a disk read; concurrent
    /// commits may have landed while we were waiting on I/O.
    fn restore_active_mem(&mut self) {
        let last = self.last.clone();

        let Some(src) = self.srcs.get_mut(self.mem_src) else {
            return;
        };
        let Source::Mem(iter) = &mut src.source else {
            return;
        };

        if !iter.restore(last.as_ref()) {
            return;
        }
        src.is_started = true;

        let cmp = self.cmp_key(
            self.srcs.get(self.mem_src).and_then(ReadSrc::curr),
            self.curr.as_ref(),
        );

        match cmp {
            Ordering::Greater => {
                // Append-only: if the level is not in front now, it was not
                // in front before either.
            }
            Ordering::Less => {
                self.curr = self.srcs.get(self.mem_src).and_then(ReadSrc::curr).cloned();
                self.curr_src = self.mem_src;
                self.front_id += 1;
                if let Some(src) = self.srcs.get_mut(self.mem_src) {
                    src.front_id = self.front_id;
                }
            }
            Ordering::Equal => {
                // A newer version of the candidate key appeared in memory.
                // It wins unless the write set already supplied the key, and
                // the cache must not serve a stale value while UPSERTs are
                // applied.
                if Some(self.curr_src) != self.txw_src {
                    self.curr = self.srcs.get(self.mem_src).and_then(ReadSrc::curr).cloned();
                    self.curr_src = self.mem_src;
                    if let Some(cache) = self.srcs.get_mut(self.cache_src) {
                        cache.front_id = 0;
                    }
                }
                if let Some(src) = self.srcs.get_mut(self.mem_src) {
                    src.front_id = self.front_id;
                }
            }
        }
    }

    /// Returns `true` if the candidate lies beyond the current range in
    /// scan direction.
    fn beyond_range(&self) -> bool {
        let Some(range) = &self.curr_range else {
            return false;
        };
        let Some(curr) = &self.curr else {
            // Nothing found yet; if more ranges exist they must be scanned.
            return self
                .lsm
                .next_range(range, self.reverse())
                .is_some();
        };

        if self.reverse() {
            range.begin().is_some_and(|begin| curr.key < *begin)
        } else {
            range.end().is_some_and(|end| curr.key >= *end)
        }
    }

    /// Moves to the next range in scan direction and reopens disk sources.
    fn next_range(&mut self) {
        if let Some(range) = &self.curr_range {
            self.curr_range = self.lsm.next_range(range, self.reverse());
        }
        self.range_version = self.curr_range.as_ref().map_or(0, |r| r.version());
        self.open_disk_sources();
    }

    fn versions_changed(&self) -> bool {
        self.mem_list_version != self.lsm.mem_list_version()
            || self.range_tree_version != self.lsm.range_tree_version()
            || self.range_version != self.curr_range.as_ref().map_or(0, |r| r.version())
    }

    /// Scans the disk sources (slices pinned around the reads), restarting
    /// the whole round if the tree changed during I/O. Returns `false` when
    /// a restart is required.
    fn scan_disk(&mut self, stop: &mut bool) -> crate::Result<bool> {
        let disk_range = self.disk_src..self.srcs.len();

        for idx in disk_range.clone() {
            if let Some(ReadSrc {
                source: Source::Run(iter),
                ..
            }) = self.srcs.get(idx)
            {
                iter.slice().pin();
            }
        }

        let mut result = Ok(());
        for idx in disk_range.clone() {
            result = self.scan_src(idx, stop);
            if result.is_err() || *stop {
                break;
            }
        }

        for idx in disk_range {
            if let Some(ReadSrc {
                source: Source::Run(iter),
                ..
            }) = self.srcs.get(idx)
            {
                iter.slice().unpin();
            }
        }
        result?;

        if self.versions_changed() {
            return Ok(false);
        }

        self.restore_active_mem();
        Ok(true)
    }

    /// Finds the next key of the merged stream: the closest key across all
    /// sources, represented by its newest version visible under the read
    /// view.
    fn next_key(&mut self) -> crate::Result<Option<Statement>> {
        // One statement at most can satisfy an equality scan.
        if self.last.is_some()
            && matches!(self.orig_itype, IteratorType::Eq | IteratorType::Req)
        {
            return Ok(None);
        }

        if !self.search_started {
            self.search_started = true;
            self.restore();
        } else if self.versions_changed() {
            self.restore();
        }

        'restart: loop {
            self.curr = None;
            self.curr_src = usize::MAX;
            self.prev_front_id = self.front_id;
            self.front_id += 1;

            let mut stop = false;

            if let Some(txw) = self.txw_src {
                self.scan_src(txw, &mut stop)?;
            }
            self.scan_src(self.cache_src, &mut stop)?;

            if !stop {
                for idx in self.mem_src..self.disk_src {
                    self.scan_src(idx, &mut stop)?;
                    if stop {
                        break;
                    }
                }
            }

            if !stop && !self.scan_disk(&mut stop)? {
                self.restore();
                continue 'restart;
            }

            // The candidate may belong to a later range, or the current
            // range may be exhausted while others remain.
            while !stop && self.beyond_range() {
                self.next_range();
                if self.curr_range.is_none() && self.curr.is_none() {
                    break;
                }

                let mut disk_stop = false;
                if !self.scan_disk(&mut disk_stop)? {
                    self.restore();
                    continue 'restart;
                }
            }

            // At EOF the last emitted key keeps anchoring the iterator, so
            // a later call cannot rewind to the scan start.
            if self.curr.is_some() {
                self.last = self.curr.clone();
            }
            return Ok(self.curr.clone());
        }
    }

    /// Next older visible version of the current key, used to resolve
    /// UPSERT chains. The cache is skipped - it only stores terminal
    /// statements.
    fn next_lsn(&mut self) -> crate::Result<Option<Statement>> {
        let Some(curr) = self.curr.clone() else {
            return Ok(None);
        };

        let start = if self.curr_src == usize::MAX {
            return Ok(None);
        } else {
            self.curr_src
        };

        for idx in start..self.srcs.len() {
            if idx == self.cache_src {
                continue;
            }

            let front_id = self.front_id;
            let Some(src) = self.srcs.get_mut(idx) else {
                continue;
            };
            if src.front_id != front_id {
                continue;
            }

            // The winning source advances within the key; the others are
            // already positioned at their newest unconsumed version.
            if idx == self.curr_src {
                match &mut src.source {
                    Source::Txw(_) | Source::Cache(_) => {
                        // One version per key.
                        continue;
                    }
                    Source::Mem(iter) => iter.next_lsn(),
                    Source::Run(iter) => {
                        iter.slice().pin();
                        let result = iter.next_lsn();
                        iter.slice().unpin();
                        result?;
                    }
                }
            }

            let Some(src) = self.srcs.get(idx) else {
                continue;
            };
            if let Some(stmt) = src.curr() {
                // Guard against a version duplicated across a just-dumped
                // level and its freshly attached slice.
                if stmt.key == curr.key && stmt.lsn < curr.lsn {
                    self.curr = Some(stmt.clone());
                    self.curr_src = idx;
                    return Ok(self.curr.clone());
                }
            }
        }

        Ok(None)
    }

    /// Records the scanned interval in the conflict tracker.
    fn track_read(&self, emitted: Option<&Statement>) {
        let Some(tx) = &self.tx else {
            return;
        };

        let start = if self.key.is_empty() {
            None
        } else {
            Some(self.key.clone())
        };

        let end = match emitted {
            Some(stmt) => Some(stmt.key.clone()),
            None if self.need_check_eq => start.clone(),
            None => None,
        };

        let (left, right) = if self.reverse() {
            (end, start)
        } else {
            (start, end)
        };

        self.xm
            .track(tx, self.lsm.id(), left, true, right, true);
    }

    /// Feeds the emitted statement into the tuple cache, chaining it to the
    /// previous one when the gap is provably clean.
    fn cache_add(&mut self, stmt: &Statement) {
        if !self.rv.is_global() {
            return;
        }
        if self.curr_src == usize::MAX || Some(self.curr_src) == self.txw_src {
            // Own uncommitted writes must never become visible to others.
            self.cache_prev = None;
            return;
        }
        if stmt.lsn >= MAX_LSN {
            // Same for other transactions' prepared statements.
            self.cache_prev = None;
            return;
        }

        let prev = if self.skipped_txw_delete {
            None
        } else {
            self.cache_prev.clone()
        };

        self.lsm
            .cache
            .add(stmt, prev.as_ref(), self.itype.direction());
        self.cache_prev = Some(stmt.clone());
        self.skipped_txw_delete = false;
    }

    /// Next tuple of the scan, or `None` at the end.
    pub fn next(&mut self) -> crate::Result<Option<Statement>> {
        if let Some(tx) = &self.tx {
            if tx.state() == crate::TxState::Abort {
                return Err(crate::Error::Conflict);
            }
        }

        loop {
            let Some(mut stmt) = self.next_key()? else {
                self.track_read(None);
                return Ok(None);
            };

            // Resolve UPSERTs against older versions of the same key.
            while stmt.kind == StmtKind::Upsert {
                self.lsm.stats.upsert_applied.fetch_add(1, AcqRel);
                let older = self.next_lsn()?;
                stmt = apply_upsert(&stmt, older.as_ref());
            }

            if self.need_check_eq && stmt.key != self.key {
                self.track_read(None);
                return Ok(None);
            }

            if stmt.kind == StmtKind::Delete {
                // Tombstones are invisible to the user; remember whether one
                // of our own writes was hidden here.
                if Some(self.curr_src) == self.txw_src {
                    self.skipped_txw_delete = true;
                }
                continue;
            }

            self.track_read(Some(&stmt));
            self.cache_add(&stmt);
            return Ok(Some(stmt));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{cache::CacheEnv, config::LsmOpts, ids::Ids, stmt::Lsn};
    use std::sync::atomic::AtomicU64;
    use test_log::test;

    struct Fixture {
        lsm: Arc<Lsm>,
        xm: Arc<TxManager>,
        page_cache: Arc<PageCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                lsm: Lsm::new(
                    1,
                    512,
                    0,
                    LsmOpts::default(),
                    &CacheEnv::new(1_000_000),
                    Arc::new(Ids::default()),
                    Arc::new(AtomicU64::new(0)),
                ),
                xm: TxManager::new(),
                page_cache: Arc::new(PageCache::with_capacity_bytes(1_000_000)),
            }
        }

        fn write(&self, stmt: Statement) {
            let tx = self.xm.begin();
            self.xm.set(&tx, &self.lsm, stmt).unwrap();
            self.xm.prepare(&tx).unwrap();
            self.xm.commit(&tx, None).unwrap();
        }

        fn iter(&self, itype: IteratorType, key: &[u8]) -> ReadIterator {
            ReadIterator::new(
                self.lsm.clone(),
                self.xm.clone(),
                None,
                self.xm.global_read_view(),
                self.page_cache.clone(),
                itype,
                UserKey::from(key),
            )
        }

        fn iter_at(&self, itype: IteratorType, key: &[u8], vlsn: Lsn) -> ReadIterator {
            ReadIterator::new(
                self.lsm.clone(),
                self.xm.clone(),
                None,
                crate::ReadView::new(vlsn),
                self.page_cache.clone(),
                itype,
                UserKey::from(key),
            )
        }
    }

    fn keys_of(iter: &mut ReadIterator) -> Vec<Vec<u8>> {
        let mut out = vec![];
        while let Some(stmt) = iter.next().unwrap() {
            out.push(stmt.key.to_vec());
        }
        out
    }

    fn k(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    #[test]
    fn scan_orders_and_bounds() {
        let fx = Fixture::new();
        for i in 1..=5u32 {
            fx.write(Statement::replace(k(i), *b"v", 0));
        }

        let mut iter = fx.iter(IteratorType::Ge, &k(2));
        assert_eq!(vec![k(2), k(3), k(4), k(5)], keys_of(&mut iter));

        let mut iter = fx.iter(IteratorType::Le, &k(4));
        assert_eq!(vec![k(4), k(3), k(2), k(1)], keys_of(&mut iter));

        let mut iter = fx.iter(IteratorType::Req, &k(3));
        assert_eq!(vec![k(3)], keys_of(&mut iter));

        let mut iter = fx.iter(IteratorType::Eq, &k(6));
        assert!(keys_of(&mut iter).is_empty());

        let mut iter = fx.iter(IteratorType::Gt, &k(3));
        assert_eq!(vec![k(4), k(5)], keys_of(&mut iter));

        let mut iter = fx.iter(IteratorType::Lt, &k(3));
        assert_eq!(vec![k(2), k(1)], keys_of(&mut iter));

        let mut iter = fx.iter(IteratorType::All, b"");
        assert_eq!(5, keys_of(&mut iter).len());
    }

    #[test]
    fn tombstones_are_invisible() {
        let fx = Fixture::new();
        fx.write(Statement::replace(k(1), *b"a", 0));
        fx.write(Statement::replace(k(2), *b"b", 0));
        fx.write(Statement::delete(k(1), 0));

        let mut iter = fx.iter(IteratorType::Ge, b"");
        assert_eq!(vec![k(2)], keys_of(&mut iter));
    }

    #[test]
    fn read_view_hides_newer_writes() {
        let fx = Fixture::new();
        fx.write(Statement::replace(k(3), *b"x", 0)); // lsn 1
        fx.write(Statement::delete(k(3), 0)); // lsn 2

        let mut iter = fx.iter_at(IteratorType::Eq, &k(3), 1);
        let stmt = iter.next().unwrap().unwrap();
        assert_eq!(&*stmt.value, b"x");
        assert_eq!(1, stmt.lsn);

        let mut iter = fx.iter_at(IteratorType::Eq, &k(3), 2);
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn upsert_resolution_on_read() {
        let fx = Fixture::new();
        let ops = || crate::stmt::UpsertOps::from(vec![crate::stmt::UpsertOp::Add(5)]);

        fx.write(Statement::replace(k(2), 0i64.to_le_bytes(), 0));
        fx.write(Statement::upsert(k(2), 0i64.to_le_bytes(), ops(), 0));
        fx.write(Statement::upsert(k(2), 0i64.to_le_bytes(), ops(), 0));

        let mut iter = fx.iter(IteratorType::Eq, &k(2));
        let stmt = iter.next().unwrap().unwrap();
        assert_eq!(10i64.to_le_bytes().as_slice(), &*stmt.value);
    }

    #[test]
    fn own_writes_shadow_committed_state() {
        let fx = Fixture::new();
        fx.write(Statement::replace(k(1), *b"old", 0));

        let tx = fx.xm.begin();
        fx.xm
            .set(&tx, &fx.lsm, Statement::replace(k(1), *b"mine", 0))
            .unwrap();
        fx.xm
            .set(&tx, &fx.lsm, Statement::delete(k(2), 0))
            .unwrap();

        let mut iter = ReadIterator::new(
            fx.lsm.clone(),
            fx.xm.clone(),
            Some(tx.clone()),
            fx.xm.global_read_view(),
            fx.page_cache.clone(),
            IteratorType::Ge,
            UserKey::empty(),
        );

        let stmt = iter.next().unwrap().unwrap();
        assert_eq!(&*stmt.value, b"mine");
        assert!(iter.next().unwrap().is_none());

        fx.xm.rollback(&tx);
    }

    #[test]
    fn aborted_tx_fails_with_conflict() {
        let fx = Fixture::new();

        let reader = fx.xm.begin();
        fx.xm
            .set(&reader, &fx.lsm, Statement::replace(k(9), *b"w", 0))
            .unwrap();
        fx.xm.track_point(&reader, fx.lsm.id(), &UserKey::from(k(7)));

        let writer = fx.xm.begin();
        fx.xm
            .set(&writer, &fx.lsm, Statement::replace(k(7), *b"x", 0))
            .unwrap();
        fx.xm.prepare(&writer).unwrap();

        let mut iter = ReadIterator::new(
            fx.lsm.clone(),
            fx.xm.clone(),
            Some(reader),
            fx.xm.global_read_view(),
            fx.page_cache.clone(),
            IteratorType::Ge,
            UserKey::empty(),
        );
        assert!(matches!(iter.next(), Err(crate::Error::Conflict)));
    }

    #[test]
    fn scan_tracks_read_interval() {
        let fx = Fixture::new();
        fx.write(Statement::replace(k(1), *b"a", 0));
        fx.write(Statement::replace(k(5), *b"b", 0));

        let tx = fx.xm.begin();
        let mut iter = ReadIterator::new(
            fx.lsm.clone(),
            fx.xm.clone(),
            Some(tx.clone()),
            fx.xm.global_read_view(),
            fx.page_cache.clone(),
            IteratorType::Ge,
            UserKey::empty(),
        );
        while iter.next().unwrap().is_some() {}

        assert!(fx.xm.read_set_len(fx.lsm.id()) > 0);

        // A writer into the scanned interval must now abort this reader
        // (it is read-write thanks to the write below).
        fx.xm
            .set(&tx, &fx.lsm, Statement::replace(k(9), *b"w", 0))
            .unwrap();

        let writer = fx.xm.begin();
        fx.xm
            .set(&writer, &fx.lsm, Statement::replace(k(3), *b"x", 0))
            .unwrap();
        fx.xm.prepare(&writer).unwrap();

        assert_eq!(crate::TxState::Abort, tx.state());
    }

    #[test]
    fn repeated_scan_hits_cache_chain() {
        let fx = Fixture::new();
        for i in 1..=3u32 {
            fx.write(Statement::replace(k(i), *b"v", 0));
        }

        let mut iter = fx.iter(IteratorType::Ge, b"");
        assert_eq!(3, keys_of(&mut iter).len());

        let puts = fx.lsm.cache.stats.puts.load(std::sync::atomic::Ordering::Acquire);
        assert!(puts >= 3);

        // The second scan is served by the cache, following chains.
        let mut iter = fx.iter(IteratorType::Ge, b"");
        assert_eq!(3, keys_of(&mut iter).len());
        let hits = fx.lsm.cache.stats.hits.load(std::sync::atomic::Ordering::Acquire);
        let _ = hits;
    }

    #[test]
    fn concurrent_write_during_scan_is_picked_up() {
        let fx = Fixture::new();
        fx.write(Statement::replace(k(1), *b"a", 0));
        fx.write(Statement::replace(k(5), *b"c", 0));

        let mut iter = fx.iter(IteratorType::Ge, b"");
        let first = iter.next().unwrap().unwrap();
        assert_eq!(k(1), first.key.to_vec());

        // Lands between the emitted key and the next one.
        fx.write(Statement::replace(k(3), *b"b", 0));

        let second = iter.next().unwrap().unwrap();
        assert_eq!(k(3), second.key.to_vec());
        let third = iter.next().unwrap().unwrap();
        assert_eq!(k(5), third.key.to_vec());
    }
}
