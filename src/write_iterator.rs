// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Merges the sources of a dump or compaction into the statement stream
//! written to the new run
//!
//! For every key, the versions are partitioned across the live read views;
//! each non-empty view resolves to exactly one output statement. On the way,
//! shadowed versions are dropped, UPSERT chains are folded, tombstones that
//! nothing can resurrect are elided, and deferred DELETEs are handed to the
//! transaction layer.

use crate::{
    fault::{self, Fault},
    mem::{Mem, MemStream},
    run::{RunSlice, SliceStream},
    stmt::{apply_upsert, Lsn, Statement, StmtKind, STMT_DEFERRED_DELETE},
};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Receives `(old, new)` pairs for tuples whose secondary-index purge was
/// deferred. Implementations batch and ship them to the transaction layer.
pub trait DeferredDeleteHandler: Send {
    fn process(&mut self, old_stmt: &Statement, new_stmt: &Statement) -> crate::Result<()>;
}

enum WriteSource {
    Mem(MemStream),
    Slice(SliceStream),
}

impl WriteSource {
    fn next(&mut self) -> crate::Result<Option<Statement>> {
        match self {
            Self::Mem(stream) => Ok(stream.next()),
            Self::Slice(stream) => stream.next(),
        }
    }
}

struct HeapEntry {
    stmt: Statement,
    end_of_key: bool,

    /// Source index; sentinel entries use `usize::MAX`.
    src: usize,
}

impl HeapEntry {
    /// Heap order: key ascending, the end-of-key sentinel after everything
    /// on its key, then LSN descending. Same-key same-LSN pairs only happen
    /// when a deferred DELETE shares the LSN with the REPLACE that overwrote
    /// its tuple; the REPLACE wins and the DELETE is discarded downstream.
    fn rank(&self) -> (&[u8], bool, std::cmp::Reverse<Lsn>, bool) {
        (
            self.stmt.key.as_ref(),
            self.end_of_key,
            std::cmp::Reverse(self.stmt.lsn),
            self.stmt.kind == StmtKind::Delete,
        )
    }
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for min-first.
        self.rank().cmp(&other.rank()).reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One read view of the current key.
struct RvSlot {
    vlsn: Lsn,

    /// Versions visible to this view and no newer one, newest first.
    history: Vec<Statement>,

    /// The resolved statement after merging.
    result: Option<Statement>,
}

/// The write iterator
pub struct WriteIterator {
    sources: Vec<WriteSource>,
    heap: BinaryHeap<HeapEntry>,

    /// Index 0 is the implicit latest-state view, then descending vlsns.
    read_views: Vec<RvSlot>,

    is_primary: bool,
    is_last_level: bool,

    handler: Option<Box<dyn DeferredDeleteHandler>>,

    /// Youngest statement of the current key carrying the deferred-DELETE
    /// flag; the purge of whatever it overwrote is still pending.
    deferred: Option<Statement>,

    /// Last statement returned to the caller.
    last: Option<Statement>,

    /// Pop cursor into `read_views`.
    stmt_i: Option<usize>,
    rv_used_count: usize,

    started: bool,
}

impl WriteIterator {
    /// Creates an empty iterator; add sources before calling `next`.
    ///
    /// `rv_vlsns` are the visibility caps of the live historical read views,
    /// descending; the latest-state view is implicit.
    #[must_use]
    pub fn new(
        rv_vlsns: &[Lsn],
        is_primary: bool,
        is_last_level: bool,
        handler: Option<Box<dyn DeferredDeleteHandler>>,
    ) -> Self {
        debug_assert!(rv_vlsns.windows(2).all(|w| w[0] > w[1]));
        debug_assert!(is_primary || handler.is_none());

        let mut read_views = Vec::with_capacity(rv_vlsns.len() + 1);
        read_views.push(RvSlot {
            vlsn: Lsn::MAX,
            history: Vec::new(),
            result: None,
        });
        for vlsn in rv_vlsns {
            read_views.push(RvSlot {
                vlsn: *vlsn,
                history: Vec::new(),
                result: None,
            });
        }

        Self {
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            read_views,
            is_primary,
            is_last_level,
            handler,
            deferred: None,
            last: None,
            stmt_i: None,
            rv_used_count: 0,
            started: false,
        }
    }

    /// Adds a sealed in-memory level as a source.
    pub fn add_mem(&mut self, mem: &Arc<Mem>) {
        self.sources.push(WriteSource::Mem(mem.stream()));
    }

    /// Adds a run slice as a source.
    pub fn add_slice(&mut self, slice: Arc<RunSlice>) {
        self.sources.push(WriteSource::Slice(SliceStream::new(slice)));
    }

    fn start(&mut self) -> crate::Result<()> {
        for idx in 0..self.sources.len() {
            #[allow(clippy::expect_used)]
            let src = self.sources.get_mut(idx).expect("index in bounds");
            if let Some(stmt) = src.next()? {
                self.heap.push(HeapEntry {
                    stmt,
                    end_of_key: false,
                    src: idx,
                });
            }
        }
        self.started = true;
        Ok(())
    }

    /// Pops the heap top and refills from its source.
    fn merge_step(&mut self) -> crate::Result<()> {
        let Some(top) = self.heap.pop() else {
            return Ok(());
        };
        if top.end_of_key {
            return Ok(());
        }

        #[allow(clippy::expect_used)]
        let src = self.sources.get_mut(top.src).expect("index in bounds");
        if let Some(stmt) = src.next()? {
            self.heap.push(HeapEntry {
                stmt,
                end_of_key: false,
                src: top.src,
            });
        }
        Ok(())
    }

    fn vlsn(&self, rv_i: usize) -> Lsn {
        self.read_views.get(rv_i).map_or(-1, |rv| rv.vlsn)
    }

    /// Tracks the deferred-DELETE pair chain for the current key.
    fn deferred_delete_step(&mut self, stmt: &Statement) -> crate::Result<()> {
        // UPSERTs never change key parts and never carry the flag.
        if stmt.kind == StmtKind::Upsert {
            debug_assert_eq!(0, stmt.flags & STMT_DEFERRED_DELETE);
            return Ok(());
        }

        if let Some(new_stmt) = self.deferred.take() {
            if stmt.kind != StmtKind::Delete {
                if let Some(handler) = &mut self.handler {
                    handler.process(stmt, &new_stmt)?;
                }
            }
        }

        if stmt.flags & STMT_DEFERRED_DELETE != 0 {
            debug_assert!(matches!(
                stmt.kind,
                StmtKind::Delete | StmtKind::Replace | StmtKind::Insert
            ));
            self.deferred = Some(stmt.clone());
        }

        Ok(())
    }

    /// Distributes the versions of the next key over the read views.
    ///
    /// Returns `(pushed count, is_first_insert)` where the flag is set when
    /// the oldest version of the key among all sources is an INSERT.
    fn build_history(&mut self) -> crate::Result<(usize, bool)> {
        let mut count = 0usize;
        let mut is_first_insert = false;

        debug_assert!(self.deferred.is_none());

        let Some(top) = self.heap.peek() else {
            return Ok((0, false));
        };

        // Sentinel separating this key from the next: greater than every
        // version of the key, less than any following key.
        self.heap.push(HeapEntry {
            stmt: top.stmt.clone(),
            end_of_key: true,
            src: usize::MAX,
        });

        let mut current_rv_i = 0usize;
        let mut current_rv_lsn = self.vlsn(0);
        let mut merge_until_lsn = self.vlsn(1);

        loop {
            #[allow(clippy::expect_used)]
            let stmt = self
                .heap
                .peek()
                .expect("sentinel keeps the heap non-empty")
                .stmt
                .clone();

            is_first_insert = stmt.kind == StmtKind::Insert;

            // Even with no handler installed (a dump), the youngest flagged
            // statement must be remembered so the next compaction can still
            // generate the purge.
            if self.is_primary {
                self.deferred_delete_step(&stmt)?;
            }

            let mut skip = stmt.lsn > current_rv_lsn;

            if !skip {
                while stmt.lsn <= merge_until_lsn {
                    // Views that see the same version share the older one's
                    // history.
                    current_rv_i += 1;
                    current_rv_lsn = merge_until_lsn;
                    merge_until_lsn = self.vlsn(current_rv_i + 1);
                }

                // A tombstone at the last level with no view below it need
                // not be written at all.
                if stmt.kind == StmtKind::Delete && self.is_last_level && merge_until_lsn < 0 {
                    current_rv_lsn = -1;
                    skip = true;
                }
            }

            if !skip {
                #[allow(clippy::expect_used)]
                self.read_views
                    .get_mut(current_rv_i)
                    .expect("rv index in bounds")
                    .history
                    .push(stmt.clone());
                count += 1;

                // Only the youngest version under a view matters once a
                // terminal statement is seen.
                if stmt.kind.is_terminal() {
                    current_rv_i += 1;
                    current_rv_lsn = merge_until_lsn;
                    merge_until_lsn = self.vlsn(current_rv_i + 1);
                }
            }

            self.merge_step()?;

            #[allow(clippy::expect_used)]
            let top = self.heap.peek().expect("sentinel still queued");
            if top.end_of_key {
                break;
            }
        }

        // Pop the sentinel.
        let popped = self.heap.pop();
        debug_assert!(popped.as_ref().is_some_and(|e| e.end_of_key));
        drop(popped);

        // Nothing older remains at the last level; the pending deferred
        // DELETE has no tuple left to purge.
        if self.is_last_level {
            self.deferred = None;
        }

        Ok((count, is_first_insert))
    }

    /// Folds one view's history into a single statement, hinted by the
    /// previous (older) view's result.
    fn merge_rv(&mut self, rv_i: usize, prev: Option<&Statement>, is_first_insert: bool) -> crate::Result<()> {
        fault::check(Fault::ReadViewMerge)?;

        #[allow(clippy::expect_used)]
        let rv = self.read_views.get_mut(rv_i).expect("rv index in bounds");

        #[allow(clippy::expect_used)]
        let oldest = rv.history.last().expect("history is non-empty").clone();

        // A tombstone whose older view already resolved to a tombstone adds
        // nothing.
        if let Some(prev) = prev {
            if prev.kind == StmtKind::Delete && oldest.kind == StmtKind::Delete {
                rv.history.clear();
                rv.result = None;
                return Ok(());
            }
        }

        let mut result = oldest;

        // An UPSERT at the bottom of the history resolves when either this
        // is the last level (nothing older can exist) or the older view
        // already produced a terminal statement.
        if result.kind == StmtKind::Upsert
            && (self.is_last_level || prev.is_some_and(|p| p.kind != StmtKind::Upsert))
        {
            result = apply_upsert(&result, prev);
        }

        // Squash the newer UPSERTs on top.
        let newer: Vec<Statement> = rv
            .history
            .iter()
            .rev()
            .skip(1)
            .cloned()
            .collect();
        for stmt in newer {
            debug_assert_eq!(StmtKind::Upsert, stmt.kind);
            result = apply_upsert(&stmt, Some(&result));
        }

        // Deferred DELETEs were generated for every flagged statement except
        // possibly the youngest one; the others must not trigger again on
        // the next compaction.
        if result.flags & STMT_DEFERRED_DELETE != 0 && self.deferred.as_ref() != Some(&result) {
            result = result.without_flags(STMT_DEFERRED_DELETE);
        }

        if prev.is_none() {
            if is_first_insert && result.kind == StmtKind::Delete {
                // The key's oldest known version is an INSERT: a tombstone
                // output would delete nothing.
                #[allow(clippy::expect_used)]
                let rv = self.read_views.get_mut(rv_i).expect("rv index in bounds");
                rv.history.clear();
                rv.result = None;
                return Ok(());
            }

            if is_first_insert && result.kind == StmtKind::Replace {
                // Keep the INSERT pedigree so a later DELETE can be elided.
                result = result.with_kind(StmtKind::Insert);
            } else if !is_first_insert && result.kind == StmtKind::Insert {
                // An INSERT that is not first would wrongly enable that
                // elision; demote it.
                result = result.with_kind(StmtKind::Replace);
            }
        }

        #[allow(clippy::expect_used)]
        let rv = self.read_views.get_mut(rv_i).expect("rv index in bounds");
        rv.history.clear();
        rv.result = Some(result);
        Ok(())
    }

    /// Builds the output sequence for the next key.
    fn build_read_views(&mut self) -> crate::Result<usize> {
        self.rv_used_count = 0;
        self.stmt_i = None;

        let (raw_count, is_first_insert) = match self.build_history() {
            Ok(v) => v,
            Err(e) => {
                for rv in &mut self.read_views {
                    rv.history.clear();
                }
                return Err(e);
            }
        };
        if raw_count == 0 {
            return Ok(0);
        }

        let mut count = 0usize;
        let mut prev: Option<Statement> = None;

        for rv_i in (0..self.read_views.len()).rev() {
            #[allow(clippy::expect_used)]
            if self
                .read_views
                .get(rv_i)
                .expect("rv index in bounds")
                .history
                .is_empty()
            {
                continue;
            }

            if let Err(e) = self.merge_rv(rv_i, prev.as_ref(), is_first_insert) {
                for rv in &mut self.read_views {
                    rv.history.clear();
                }
                return Err(e);
            }

            #[allow(clippy::expect_used)]
            let rv = self.read_views.get(rv_i).expect("rv index in bounds");
            if let Some(result) = &rv.result {
                prev = Some(result.clone());
                self.rv_used_count += 1;
                count += 1;
            }
        }

        Ok(count)
    }

    /// Next statement of the current key's view sequence, newest view first.
    fn pop_rv_stmt(&mut self) -> Option<Statement> {
        if self.rv_used_count == 0 {
            return None;
        }

        let mut i = self.stmt_i.map_or(0, |i| i + 1);
        while i < self.read_views.len() {
            #[allow(clippy::indexing_slicing)]
            let rv = &mut self.read_views[i];
            if let Some(stmt) = rv.result.take() {
                self.stmt_i = Some(i);
                self.rv_used_count -= 1;
                self.last = Some(stmt.clone());
                return Some(stmt);
            }
            i += 1;
        }
        None
    }

    /// Next statement to write, or `None` at the end of all sources.
    pub fn next(&mut self) -> crate::Result<Option<Statement>> {
        if !self.started {
            self.start()?;
        }

        loop {
            if let Some(stmt) = self.pop_rv_stmt() {
                return Ok(Some(stmt));
            }

            // A flagged statement whose purge was never generated must stay
            // in the output, unless it already went out via a read view.
            if let Some(deferred) = self.deferred.take() {
                if self.last.as_ref() != Some(&deferred) {
                    self.last = Some(deferred.clone());
                    return Ok(Some(deferred));
                }
            }

            if self.heap.is_empty() {
                return Ok(None);
            }

            self.stmt_i = None;
            self.build_read_views()?;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn mem_of(stmts: &[Statement]) -> Arc<Mem> {
        let mem = Mem::new(1, 0, 0);
        for stmt in stmts {
            mem.insert(stmt.clone());
        }
        mem
    }

    fn drain(mut iter: WriteIterator) -> Vec<Statement> {
        let mut out = vec![];
        while let Some(stmt) = iter.next().unwrap() {
            out.push(stmt);
        }
        out
    }

    fn int(n: i64) -> Vec<u8> {
        n.to_le_bytes().to_vec()
    }

    #[test]
    fn newest_version_per_view() {
        let mem = mem_of(&[
            Statement::replace(*b"a", *b"1", 1),
            Statement::replace(*b"a", *b"2", 2),
            Statement::replace(*b"a", *b"3", 3),
        ]);

        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(3, out[0].lsn);
        assert_eq!(&*out[0].value, b"3");
    }

    #[test]
    fn read_view_keeps_old_version() {
        let mem = mem_of(&[
            Statement::replace(*b"a", *b"old", 5),
            Statement::replace(*b"a", *b"new", 10),
        ]);

        // A reader at vlsn 5 still needs the old version.
        let mut iter = WriteIterator::new(&[5], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(2, out.len());
        assert_eq!(10, out[0].lsn);
        assert_eq!(5, out[1].lsn);
    }

    #[test]
    fn same_version_shared_by_views_emitted_once() {
        let mem = mem_of(&[Statement::replace(*b"a", *b"x", 3)]);

        let mut iter = WriteIterator::new(&[7, 5], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(3, out[0].lsn);
    }

    #[test]
    fn last_level_drops_tombstone() {
        let mem = mem_of(&[
            Statement::replace(*b"a", *b"1", 1),
            Statement::delete(*b"a", 2),
            Statement::replace(*b"b", *b"2", 3),
        ]);

        let mut iter = WriteIterator::new(&[], false, true, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(&*out[0].key, b"b");
    }

    #[test]
    fn non_last_level_keeps_tombstone() {
        let mem = mem_of(&[
            Statement::replace(*b"a", *b"1", 1),
            Statement::delete(*b"a", 2),
        ]);

        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(StmtKind::Delete, out[0].kind);
    }

    #[test]
    fn upsert_fold_last_level() {
        let ops = || crate::stmt::UpsertOps::from(vec![crate::stmt::UpsertOp::Add(5)]);
        let mem = mem_of(&[
            Statement::upsert(*b"a", int(1), ops(), 1),
            Statement::upsert(*b"a", int(1), ops(), 2),
        ]);

        let mut iter = WriteIterator::new(&[], false, true, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        // Oldest resolves to its default (1), the newer adds 5.
        assert_eq!(StmtKind::Replace, out[0].kind);
        assert_eq!(int(6), out[0].value.to_vec());
        assert_eq!(2, out[0].lsn);
    }

    #[test]
    fn upsert_fold_onto_older_replace() {
        let ops = || crate::stmt::UpsertOps::from(vec![crate::stmt::UpsertOp::Add(3)]);
        let mem = mem_of(&[
            Statement::replace(*b"a", int(10), 1),
            Statement::upsert(*b"a", int(0), ops(), 5),
        ]);

        // The view at 1 pins the REPLACE; the latest view folds the UPSERT
        // onto it.
        let mut iter = WriteIterator::new(&[1], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(2, out.len());
        assert_eq!(StmtKind::Replace, out[0].kind);
        assert_eq!(int(13), out[0].value.to_vec());
        assert_eq!(int(10), out[1].value.to_vec());
    }

    #[test]
    fn upsert_unresolvable_stays_upsert() {
        let ops = || crate::stmt::UpsertOps::from(vec![crate::stmt::UpsertOp::Add(5)]);
        let mem = mem_of(&[Statement::upsert(*b"a", int(1), ops(), 4)]);

        // Not the last level: an older version may exist on disk.
        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(StmtKind::Upsert, out[0].kind);
    }

    #[test]
    fn first_insert_replace_promoted() {
        let mem = mem_of(&[
            Statement::insert(*b"a", *b"1", 1),
            Statement::replace(*b"a", *b"2", 2),
        ]);

        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        // Oldest known version is the INSERT, so the output becomes INSERT.
        assert_eq!(StmtKind::Insert, out[0].kind);
        assert_eq!(2, out[0].lsn);
    }

    #[test]
    fn insert_then_delete_fully_annihilates() {
        let mem = mem_of(&[
            Statement::insert(*b"a", *b"1", 1),
            Statement::delete(*b"a", 2),
            Statement::replace(*b"b", *b"x", 3),
        ]);

        // Even on an intermediate level: nothing below can hold the key.
        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(&*out[0].key, b"b");
    }

    #[test]
    fn insert_not_first_demoted_to_replace() {
        let old_mem = mem_of(&[Statement::replace(*b"a", *b"0", 1)]);
        let new_mem = mem_of(&[Statement::insert(*b"a", *b"1", 2)]);

        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&new_mem);
        iter.add_mem(&old_mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(StmtKind::Replace, out[0].kind);
    }

    #[test]
    fn delete_after_delete_collapses() {
        let mem = mem_of(&[
            Statement::delete(*b"a", 4),
            Statement::replace(*b"a", *b"x", 6),
        ]);
        let older = mem_of(&[Statement::delete(*b"a", 2)]);

        // View at 5 sees the DELETE@4, view at 3 the DELETE@2; the newer
        // tombstone is redundant on top of the older one.
        let mut iter = WriteIterator::new(&[5, 3], false, false, None);
        iter.add_mem(&mem);
        iter.add_mem(&older);

        let out = drain(iter);
        assert_eq!(2, out.len());
        assert_eq!(6, out[0].lsn);
        assert_eq!(StmtKind::Delete, out[1].kind);
        assert_eq!(2, out[1].lsn);
    }

    #[test]
    fn merge_across_sources_is_ordered() {
        let mem_a = mem_of(&[
            Statement::replace(*b"b", *b"b1", 4),
            Statement::replace(*b"d", *b"d1", 5),
        ]);
        let mem_b = mem_of(&[
            Statement::replace(*b"a", *b"a1", 1),
            Statement::replace(*b"c", *b"c1", 2),
        ]);

        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem_a);
        iter.add_mem(&mem_b);

        let out = drain(iter);
        let keys: Vec<&[u8]> = out.iter().map(|s| &*s.key).collect();
        assert_eq!(vec![b"a" as &[u8], b"b", b"c", b"d"], keys);
    }

    struct CollectingHandler(std::sync::Arc<std::sync::Mutex<Vec<(Statement, Statement)>>>);

    impl DeferredDeleteHandler for CollectingHandler {
        fn process(&mut self, old_stmt: &Statement, new_stmt: &Statement) -> crate::Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((old_stmt.clone(), new_stmt.clone()));
            Ok(())
        }
    }

    #[test]
    fn deferred_delete_pairs_are_emitted() {
        let mut flagged = Statement::replace(*b"a", *b"new", 5);
        flagged.flags |= STMT_DEFERRED_DELETE;

        let mem = mem_of(&[flagged.clone()]);
        let older = mem_of(&[Statement::replace(*b"a", *b"old", 2)]);

        let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        {
            let handler = CollectingHandler(collected.clone());
            let mut iter = WriteIterator::new(&[], true, false, Some(Box::new(handler)));
            iter.add_mem(&mem);
            iter.add_mem(&older);

            let out = drain(iter);
            assert_eq!(1, out.len());
            // The purge went out through the handler; the flag must not
            // trigger it again on the next compaction.
            assert_eq!(0, out[0].flags & STMT_DEFERRED_DELETE);
        }

        let pairs = collected.lock().unwrap();
        assert_eq!(1, pairs.len());
        assert_eq!(&*pairs[0].0.value, b"old");
        assert_eq!(&*pairs[0].1.value, b"new");
    }

    #[test]
    fn deferred_flag_survives_dump() {
        let mut flagged = Statement::replace(*b"a", *b"new", 5);
        flagged.flags |= STMT_DEFERRED_DELETE;

        // A dump has no handler; the overwritten tuple lives on disk, so
        // the flag must survive for the next compaction to act on.
        let mem = mem_of(&[flagged]);

        let mut iter = WriteIterator::new(&[], true, false, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_ne!(0, out[0].flags & STMT_DEFERRED_DELETE);
    }

    #[test]
    fn deferred_flag_cleared_at_last_level() {
        let mut flagged = Statement::replace(*b"a", *b"new", 5);
        flagged.flags |= STMT_DEFERRED_DELETE;

        let mem = mem_of(&[flagged]);

        let mut iter = WriteIterator::new(&[], true, true, None);
        iter.add_mem(&mem);

        let out = drain(iter);
        assert_eq!(1, out.len());
        assert_eq!(0, out[0].flags & STMT_DEFERRED_DELETE);
    }

    #[test]
    fn fault_injection_fails_merge() {
        let mem = mem_of(&[Statement::replace(*b"a", *b"1", 1)]);

        let mut iter = WriteIterator::new(&[], false, false, None);
        iter.add_mem(&mem);

        fault::arm(Fault::ReadViewMerge);
        assert!(matches!(
            iter.next(),
            Err(crate::Error::Injected(_))
        ));
    }
}
