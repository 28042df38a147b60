// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub(crate) mod read_set;

use crate::{
    lsm::Lsm,
    mem::Mem,
    read_view::ReadView,
    stats::TxStats,
    stmt::{apply_upsert, Lsn, Statement, StmtKind, MAX_LSN, STMT_DEFERRED_DELETE},
    Error, HashMap, IteratorType, LsmId, TxId, UserKey,
};
use read_set::{LsmReadSet, ReadInterval};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering::AcqRel},
    Arc, Mutex, MutexGuard, Weak,
};

/// Transaction state
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxState {
    /// Accepting reads and writes
    Ready,

    /// Prepared; awaiting the WAL verdict
    Commit,

    /// Aborted by a conflicting writer or by rollback
    Abort,
}

/// One write of a transaction to one LSM key
pub(crate) struct TxWrite {
    pub lsm: Arc<Lsm>,
    pub stmt: Statement,

    /// In-memory level the prepared statement landed in.
    pub mem: Option<Arc<Mem>>,

    /// The statement as inserted on prepare (normalized type, prepared LSN).
    pub prepared: Option<Statement>,

    /// A later write of the same transaction shadows this one.
    pub is_overwritten: bool,

    /// No committed version of the key existed when the transaction first
    /// wrote it; enables INSERT/REPLACE normalization on prepare.
    pub is_first_insert: bool,

    /// The write changes nothing and may be skipped.
    pub is_nop: bool,
}

struct TrackedInterval {
    lsm_id: LsmId,
    interval: ReadInterval,
}

pub(crate) struct TxInner {
    pub state: TxState,
    pub rv: Arc<ReadView>,

    /// Writes in submission order.
    pub log: Vec<TxWrite>,

    /// Newest write per `(lsm, key)`, as an index into the log.
    pub write_set: BTreeMap<(LsmId, UserKey), usize>,

    intervals: Vec<TrackedInterval>,

    pub psn: i64,
}

/// A transaction of the storage core
///
/// Holds a write set ordered by `(lsm, key)`, an ordered log of writes, a
/// read view and the set of read intervals feeding conflict tracking. All
/// lifecycle transitions go through the [`TxManager`].
pub struct Tx {
    id: TxId,
    pub(crate) inner: Mutex<TxInner>,
}

impl Tx {
    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, TxInner> {
        self.inner.lock().expect("lock is poisoned")
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TxState {
        self.lock().state
    }

    /// Visibility of this transaction's reads.
    #[must_use]
    pub fn read_view(&self) -> Arc<ReadView> {
        self.lock().rv.clone()
    }

    /// Returns `true` if the transaction has no writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.lock().log.is_empty()
    }

    /// Newest write of this transaction for `key` in `lsm`, if any.
    #[must_use]
    pub(crate) fn own_write(&self, lsm_id: LsmId, key: &UserKey) -> Option<Statement> {
        let inner = self.lock();
        let idx = *inner.write_set.get(&(lsm_id, key.clone()))?;
        inner.log.get(idx).map(|w| w.stmt.clone())
    }
}

struct Xm {
    lsn: Lsn,
    psn: i64,

    global_rv: Arc<ReadView>,
    committed_rv: Arc<ReadView>,

    /// Historical read views, oldest first.
    read_views: Vec<Arc<ReadView>>,

    /// Prepared transactions in prepare order.
    prepared: Vec<(i64, Weak<Tx>)>,

    txs: HashMap<TxId, Weak<Tx>>,

    read_sets: HashMap<LsmId, LsmReadSet>,
}

/// The transaction manager
///
/// Owns the global LSN and psn counters, the registry of read views, the
/// prepared list and the per-LSM read sets used for conflict propagation.
pub struct TxManager {
    inner: Mutex<Xm>,
    next_tx_id: AtomicU64,
    pub(crate) stats: TxStats,
}

impl TxManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Xm {
                lsn: 0,
                psn: 0,
                global_rv: ReadView::new(Lsn::MAX),
                committed_rv: ReadView::new(MAX_LSN - 1),
                read_views: Vec::new(),
                prepared: Vec::new(),
                txs: HashMap::default(),
                read_sets: HashMap::default(),
            }),
            next_tx_id: AtomicU64::new(0),
            stats: TxStats::default(),
        })
    }

    #[allow(clippy::expect_used)]
    fn xm(&self) -> MutexGuard<'_, Xm> {
        self.inner.lock().expect("lock is poisoned")
    }

    /// Last committed LSN.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.xm().lsn
    }

    /// Fast-forwards the LSN after recovery.
    pub fn recover_lsn(&self, lsn: Lsn) {
        let mut xm = self.xm();
        xm.lsn = xm.lsn.max(lsn);
    }

    /// The read view seeing the latest state, prepared writes included.
    #[must_use]
    pub fn global_read_view(&self) -> Arc<ReadView> {
        self.xm().global_rv.clone()
    }

    /// The read view seeing only committed writes.
    #[must_use]
    pub fn committed_read_view(&self) -> Arc<ReadView> {
        self.xm().committed_rv.clone()
    }

    /// Opens a transaction at the latest state.
    #[must_use]
    pub fn begin(self: &Arc<Self>) -> Arc<Tx> {
        let id = self.next_tx_id.fetch_add(1, AcqRel) + 1;
        let mut xm = self.xm();

        let tx = Arc::new(Tx {
            id,
            inner: Mutex::new(TxInner {
                state: TxState::Ready,
                rv: xm.global_rv.clone(),
                log: Vec::new(),
                write_set: BTreeMap::new(),
                intervals: Vec::new(),
                psn: 0,
            }),
        });

        xm.txs.insert(id, Arc::downgrade(&tx));
        tx
    }

    /// Buffers one write in the transaction.
    ///
    /// A write to a key the transaction already wrote shadows the older
    /// write; an UPSERT on top of an earlier write is applied right away.
    pub fn set(&self, tx: &Arc<Tx>, lsm: &Arc<Lsm>, stmt: Statement) -> crate::Result<()> {
        let _xm = self.xm();
        let mut inner = tx.lock();

        match inner.state {
            TxState::Ready => {}
            _ => return Err(Error::Conflict),
        }

        let key = (lsm.id(), stmt.key.clone());
        let prev_idx = inner.write_set.get(&key).copied();

        let (stmt, is_first_insert) = match prev_idx {
            Some(idx) => {
                let prev = inner
                    .log
                    .get_mut(idx)
                    .ok_or_else(|| Error::InvalidMetaLog("write set out of sync".into()))?;
                prev.is_overwritten = true;

                let stmt = if stmt.kind == StmtKind::Upsert {
                    // Collapse the UPSERT into the shadowed write so the
                    // write set keeps one statement per key.
                    apply_upsert(&stmt, Some(&prev.stmt))
                } else {
                    stmt
                };

                (stmt, prev.is_first_insert)
            }
            None => {
                let is_first_insert = stmt.kind == StmtKind::Insert;
                (stmt, is_first_insert)
            }
        };

        let idx = inner.log.len();
        inner.log.push(TxWrite {
            lsm: lsm.clone(),
            stmt,
            mem: None,
            prepared: None,
            is_overwritten: false,
            is_first_insert,
            is_nop: false,
        });
        inner.write_set.insert(key, idx);

        Ok(())
    }

    /// Records that `tx` read the interval `[left, right]` of `lsm`.
    ///
    /// Intervals of one transaction are kept disjoint: an interval already
    /// covering the new one absorbs it, anything intersecting is merged.
    pub fn track(
        &self,
        tx: &Arc<Tx>,
        lsm_id: LsmId,
        left: Option<UserKey>,
        left_inclusive: bool,
        right: Option<UserKey>,
        right_inclusive: bool,
    ) {
        let mut xm = self.xm();
        let mut inner = tx.lock();

        if !inner.rv.is_global() || inner.state != TxState::Ready {
            return;
        }

        let mut merged = ReadInterval {
            tx_id: tx.id,
            left,
            left_inclusive,
            right,
            right_inclusive,
        };

        for tracked in &inner.intervals {
            if tracked.lsm_id == lsm_id && tracked.interval.contains(&merged) {
                return;
            }
        }

        let read_set = xm.read_sets.entry(lsm_id).or_default();

        let mut keep = Vec::with_capacity(inner.intervals.len() + 1);
        for tracked in inner.intervals.drain(..) {
            if tracked.lsm_id == lsm_id && tracked.interval.intersects(&merged) {
                merged.merge(&tracked.interval);
                read_set.remove(
                    tracked.interval.left.as_ref(),
                    tracked.interval.left_inclusive,
                    tx.id,
                );
            } else {
                keep.push(tracked);
            }
        }

        read_set.insert(merged.clone());
        keep.push(TrackedInterval {
            lsm_id,
            interval: merged,
        });
        inner.intervals = keep;
    }

    /// Records a full-key point read. Skipped when the transaction wrote the
    /// key itself - reading your own write is serializable by construction.
    pub fn track_point(&self, tx: &Arc<Tx>, lsm_id: LsmId, key: &UserKey) {
        {
            let inner = tx.lock();
            if !inner.rv.is_global() || inner.state != TxState::Ready {
                return;
            }
            if inner.write_set.contains_key(&(lsm_id, key.clone())) {
                return;
            }
        }
        self.track(
            tx,
            lsm_id,
            Some(key.clone()),
            true,
            Some(key.clone()),
            true,
        );
    }

    /// Demotes a read-only reader to a historical view, or aborts it if it
    /// has writes of its own.
    fn send_to_read_view(xm: &mut Xm, stats: &TxStats, reader: &Arc<Tx>) {
        let mut inner = reader.lock();
        if inner.state != TxState::Ready || !inner.rv.is_global() {
            return;
        }

        if !inner.log.is_empty() {
            inner.state = TxState::Abort;
            stats.conflicts.fetch_add(1, AcqRel);
            return;
        }

        // The view must exclude the writer that is preparing right now but
        // keep everything prepared before it.
        let vlsn = xm
            .prepared
            .iter()
            .rev()
            .find(|(_, weak)| weak.strong_count() > 0)
            .map_or(xm.lsn, |(psn, _)| MAX_LSN + *psn);

        if let Some(last) = xm.read_views.last() {
            if last.vlsn() == vlsn {
                inner.rv = last.clone();
                stats.read_view_demotions.fetch_add(1, AcqRel);
                return;
            }
        }

        let rv = ReadView::new(vlsn);
        xm.read_views.push(rv.clone());
        inner.rv = rv;
        stats.read_view_demotions.fetch_add(1, AcqRel);
    }

    /// Aborts every READY transaction whose read set intersects `key`.
    fn abort_readers(xm: &mut Xm, stats: &TxStats, self_id: TxId, lsm_id: LsmId, key: &UserKey) {
        let readers = xm
            .read_sets
            .get(&lsm_id)
            .map(|set| set.stab(key))
            .unwrap_or_default();

        for reader_id in readers {
            if reader_id == self_id {
                continue;
            }
            let Some(reader) = xm.txs.get(&reader_id).and_then(Weak::upgrade) else {
                continue;
            };
            let mut inner = reader.lock();
            if inner.state == TxState::Ready {
                inner.state = TxState::Abort;
                stats.conflicts.fetch_add(1, AcqRel);
            }
        }
    }

    /// Prepares the transaction: resolves conflicts with concurrent readers
    /// and moves the write set into the active in-memory levels under a
    /// provisional LSN.
    pub fn prepare(&self, tx: &Arc<Tx>) -> crate::Result<()> {
        let mut xm = self.xm();

        {
            let inner = tx.lock();
            match inner.state {
                TxState::Ready => {}
                _ => return Err(Error::Conflict),
            }
        }

        if tx.is_read_only() {
            tx.lock().state = TxState::Commit;
            return Ok(());
        }

        // Readers intersecting our writes either move to a historical view
        // (read-only) or abort (read-write).
        let written: Vec<(LsmId, UserKey)> = {
            let inner = tx.lock();
            inner
                .log
                .iter()
                .filter(|w| !w.is_overwritten && !w.is_nop)
                .map(|w| (w.lsm.id(), w.stmt.key.clone()))
                .collect()
        };

        for (lsm_id, key) in &written {
            let readers = xm
                .read_sets
                .get(lsm_id)
                .map(|set| set.stab(key))
                .unwrap_or_default();

            for reader_id in readers {
                if reader_id == tx.id {
                    continue;
                }
                let Some(reader) = xm.txs.get(&reader_id).and_then(Weak::upgrade) else {
                    continue;
                };
                Self::send_to_read_view(&mut xm, &self.stats, &reader);
            }
        }

        xm.psn += 1;
        let psn = xm.psn;

        let mut inner = tx.lock();
        inner.state = TxState::Commit;
        inner.psn = psn;

        let prepared_lsn = MAX_LSN + psn;

        for idx in 0..inner.log.len() {
            #[allow(clippy::expect_used)]
            let (skip, lsm, mut stmt, is_first_insert) = {
                let w = inner.log.get(idx).expect("index in bounds");
                (
                    w.is_overwritten || w.is_nop,
                    w.lsm.clone(),
                    w.stmt.clone(),
                    w.is_first_insert,
                )
            };
            if skip {
                continue;
            }

            // INSERT + DELETE of a key nobody else saw annihilate.
            if is_first_insert && stmt.kind == StmtKind::Delete {
                continue;
            }

            if is_first_insert && stmt.kind == StmtKind::Replace {
                // No committed version below us: the REPLACE is an INSERT,
                // and there is nothing a deferred DELETE could purge.
                stmt = stmt.with_kind(StmtKind::Insert);
                stmt = stmt.without_flags(STMT_DEFERRED_DELETE);
            } else if !is_first_insert && stmt.kind == StmtKind::Insert {
                // INSERT over an existing key degrades to REPLACE.
                stmt = stmt.with_kind(StmtKind::Replace);
            }

            stmt.lsn = prepared_lsn;

            let mem = lsm.begin_write();
            if let Err(e) = lsm.set(&mem, stmt.clone()) {
                mem.unpin();
                return Err(e);
            }

            #[allow(clippy::expect_used)]
            let w = inner.log.get_mut(idx).expect("index in bounds");
            w.mem = Some(mem);
            w.prepared = Some(stmt);
        }
        drop(inner);

        xm.prepared.push((psn, Arc::downgrade(tx)));
        Ok(())
    }

    /// Commits a prepared transaction, renumbering its statements to the
    /// final LSN. `wal_lsn` is the LSN assigned by the log; when absent the
    /// manager advances its own counter.
    pub fn commit(&self, tx: &Arc<Tx>, wal_lsn: Option<Lsn>) -> crate::Result<()> {
        let mut xm = self.xm();

        {
            let inner = tx.lock();
            if inner.state != TxState::Commit {
                return Err(Error::Conflict);
            }
        }

        let lsn = wal_lsn.unwrap_or(xm.lsn + 1);
        debug_assert!(lsn > xm.lsn || wal_lsn.is_some());
        xm.lsn = xm.lsn.max(lsn);

        let mut inner = tx.lock();
        let psn = inner.psn;

        for w in &inner.log {
            if let (Some(mem), Some(prepared)) = (&w.mem, &w.prepared) {
                w.lsm.commit_stmt(mem, prepared, lsn);
                mem.unpin();
            }
        }
        inner.log.clear();
        inner.write_set.clear();

        // Views pinned at our psn now see exactly up to this commit.
        for rv in &xm.read_views {
            if rv.vlsn() == MAX_LSN + psn {
                rv.set_vlsn(lsn);
            }
        }

        Self::cleanup(&mut xm, tx, &mut inner);
        drop(inner);

        self.stats.commits.fetch_add(1, AcqRel);
        Ok(())
    }

    /// Rolls a transaction back. After prepare this reverses the in-memory
    /// insertions and aborts readers that may have seen them.
    pub fn rollback(&self, tx: &Arc<Tx>) {
        let mut xm = self.xm();
        let mut inner = tx.lock();

        if inner.state == TxState::Commit {
            for w in &inner.log {
                if let (Some(mem), Some(prepared)) = (&w.mem, &w.prepared) {
                    w.lsm.rollback_stmt(mem, prepared);
                    mem.unpin();
                }
            }

            let written: Vec<(LsmId, UserKey)> = inner
                .log
                .iter()
                .filter(|w| w.prepared.is_some())
                .map(|w| (w.lsm.id(), w.stmt.key.clone()))
                .collect();
            drop(inner);

            for (lsm_id, key) in &written {
                Self::abort_readers(&mut xm, &self.stats, tx.id, *lsm_id, key);
            }

            inner = tx.lock();
        }

        inner.state = TxState::Abort;
        inner.log.clear();
        inner.write_set.clear();

        Self::cleanup(&mut xm, tx, &mut inner);
        drop(inner);

        self.stats.rollbacks.fetch_add(1, AcqRel);
    }

    /// Drops the transaction's read intervals, its registry entry, its spot
    /// in the prepared list and any read views nobody references anymore.
    fn cleanup(xm: &mut Xm, tx: &Arc<Tx>, inner: &mut TxInner) {
        for tracked in inner.intervals.drain(..) {
            if let Some(set) = xm.read_sets.get_mut(&tracked.lsm_id) {
                set.remove(
                    tracked.interval.left.as_ref(),
                    tracked.interval.left_inclusive,
                    tx.id,
                );
            }
        }

        xm.prepared
            .retain(|(_, weak)| weak.upgrade().is_some_and(|t| t.id != tx.id));
        xm.txs.remove(&tx.id);

        xm.read_views.retain(|rv| Arc::strong_count(rv) > 1);
    }

    /// Visibility caps of all live historical read views, descending.
    /// The write iterator adds the implicit latest-state view itself.
    #[must_use]
    pub fn read_views(&self) -> Vec<Lsn> {
        let xm = self.xm();
        let mut vlsns: Vec<Lsn> = xm
            .read_views
            .iter()
            .filter(|rv| Arc::strong_count(rv) > 1)
            .map(|rv| rv.vlsn())
            .collect();
        vlsns.sort_unstable_by(|a, b| b.cmp(a));
        vlsns.dedup();
        vlsns
    }

    /// Number of read intervals tracked for an LSM (observability).
    #[must_use]
    pub fn read_set_len(&self, lsm_id: LsmId) -> usize {
        self.xm().read_sets.get(&lsm_id).map_or(0, LsmReadSet::len)
    }

    /// Drops the read set of a dropped LSM.
    pub fn forget_lsm(&self, lsm_id: LsmId) {
        self.xm().read_sets.remove(&lsm_id);
    }
}

/// Merge-source iterator over one transaction's write set
///
/// Reads its own writes at top priority. The write set may grow while the
/// iterator is open; every step re-seeks under the transaction lock.
pub struct TxwIterator {
    tx: Arc<Tx>,
    lsm_id: LsmId,
    itype: IteratorType,
    key: UserKey,
    curr: Option<Statement>,
}

impl TxwIterator {
    #[must_use]
    pub fn new(tx: Arc<Tx>, lsm_id: LsmId, itype: IteratorType, key: UserKey) -> Self {
        let itype = if key.is_empty() {
            itype.for_empty_key()
        } else {
            itype.normalize()
        };
        Self {
            tx,
            lsm_id,
            itype,
            key,
            curr: None,
        }
    }

    #[must_use]
    pub fn curr(&self) -> Option<&Statement> {
        self.curr.as_ref()
    }

    fn reverse(&self) -> bool {
        self.itype.is_reverse()
    }

    /// Positions at the first written key beyond `last` in scan order.
    pub fn skip_to(&mut self, last: Option<&Statement>) {
        use std::ops::Bound::{Excluded, Included, Unbounded};

        let inner = self.tx.lock();

        let range: Box<dyn Iterator<Item = (&(LsmId, UserKey), &usize)> + '_> =
            match (last, self.reverse()) {
                (None, false) => {
                    let start = if self.key.is_empty() {
                        Included((self.lsm_id, UserKey::empty()))
                    } else if self.itype == IteratorType::Gt {
                        Excluded((self.lsm_id, self.key.clone()))
                    } else {
                        Included((self.lsm_id, self.key.clone()))
                    };
                    Box::new(inner.write_set.range((start, Unbounded)))
                }
                (Some(last), false) => Box::new(inner.write_set.range((
                    Excluded((self.lsm_id, last.key.clone())),
                    Unbounded,
                ))),
                (None, true) => {
                    let end = if self.key.is_empty() {
                        Unbounded
                    } else if self.itype == IteratorType::Lt {
                        Excluded((self.lsm_id, self.key.clone()))
                    } else {
                        Included((self.lsm_id, self.key.clone()))
                    };
                    Box::new(
                        inner
                            .write_set
                            .range((Included((self.lsm_id, UserKey::empty())), end))
                            .rev(),
                    )
                }
                (Some(last), true) => Box::new(
                    inner
                        .write_set
                        .range((
                            Included((self.lsm_id, UserKey::empty())),
                            Excluded((self.lsm_id, last.key.clone())),
                        ))
                        .rev(),
                ),
            };

        self.curr = None;
        for ((lsm_id, _), idx) in range {
            if *lsm_id != self.lsm_id {
                break;
            }
            if let Some(w) = inner.log.get(*idx) {
                if w.is_nop {
                    continue;
                }
                self.curr = Some(w.stmt.clone());
                break;
            }
        }
    }

    /// Advances to the next written key.
    pub fn next_key(&mut self) {
        let curr = self.curr.take();
        self.skip_to(curr.as_ref());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{cache::CacheEnv, config::LsmOpts, ids::Ids};
    use test_log::test;

    fn test_lsm() -> Arc<Lsm> {
        Lsm::new(
            1,
            512,
            0,
            LsmOpts::default(),
            &CacheEnv::new(1_000_000),
            Arc::new(Ids::default()),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[test]
    fn tx_set_overwrite_within_tx() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::replace(*b"k", *b"1", 0)).unwrap();
        xm.set(&tx, &lsm, Statement::replace(*b"k", *b"2", 0)).unwrap();

        let inner = tx.lock();
        assert_eq!(2, inner.log.len());
        assert!(inner.log.first().unwrap().is_overwritten);
        assert_eq!(1, inner.write_set.len());
    }

    #[test]
    fn tx_upsert_collapses_onto_prior_write() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::replace(*b"k", 10i64.to_le_bytes(), 0))
            .unwrap();
        xm.set(
            &tx,
            &lsm,
            Statement::upsert(
                *b"k",
                0i64.to_le_bytes(),
                vec![crate::stmt::UpsertOp::Add(5)].into(),
                0,
            ),
        )
        .unwrap();

        let stmt = tx.own_write(lsm.id(), &UserKey::from(*b"k")).unwrap();
        assert_eq!(StmtKind::Replace, stmt.kind);
        assert_eq!(15i64.to_le_bytes().as_slice(), &*stmt.value);
    }

    #[test]
    fn prepare_commit_lands_in_mem() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::replace(*b"k", *b"v", 0)).unwrap();
        xm.prepare(&tx).unwrap();

        let (active, _) = lsm.mem_snapshot();
        assert!(active.is_pinned());

        // Prepared statements order above every committed LSN.
        let stmt = active
            .newest_visible(&UserKey::from(*b"k"), Lsn::MAX)
            .unwrap();
        assert!(stmt.lsn > MAX_LSN);

        xm.commit(&tx, None).unwrap();
        assert!(!active.is_pinned());

        let stmt = active
            .newest_visible(&UserKey::from(*b"k"), Lsn::MAX)
            .unwrap();
        assert_eq!(1, stmt.lsn);
        assert_eq!(1, xm.lsn());
    }

    #[test]
    fn first_insert_plus_delete_annihilate() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::insert(*b"k", *b"v", 0)).unwrap();
        xm.set(&tx, &lsm, Statement::delete(*b"k", 0)).unwrap();
        xm.prepare(&tx).unwrap();
        xm.commit(&tx, None).unwrap();

        let (active, _) = lsm.mem_snapshot();
        assert!(active.is_empty());
    }

    #[test]
    fn replace_of_new_key_becomes_insert() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::insert(*b"k", *b"1", 0)).unwrap();
        xm.set(&tx, &lsm, Statement::replace(*b"k", *b"2", 0)).unwrap();
        xm.prepare(&tx).unwrap();
        xm.commit(&tx, None).unwrap();

        let (active, _) = lsm.mem_snapshot();
        let stmt = active
            .newest_visible(&UserKey::from(*b"k"), Lsn::MAX)
            .unwrap();
        assert_eq!(StmtKind::Insert, stmt.kind);
        assert_eq!(&*stmt.value, b"2");
    }

    #[test]
    fn conflicting_reader_is_aborted() {
        let xm = TxManager::new();
        let lsm = test_lsm();

        // tx_a reads k and writes elsewhere (read-write).
        let tx_a = xm.begin();
        xm.set(&tx_a, &lsm, Statement::replace(*b"other", *b"x", 0))
            .unwrap();
        xm.track_point(&tx_a, lsm.id(), &UserKey::from(*b"k"));

        // tx_b writes k and prepares.
        let tx_b = xm.begin();
        xm.set(&tx_b, &lsm, Statement::replace(*b"k", *b"y", 0)).unwrap();
        xm.prepare(&tx_b).unwrap();

        assert_eq!(TxState::Abort, tx_a.state());
        assert!(matches!(
            xm.set(&tx_a, &lsm, Statement::replace(*b"z", *b"z", 0)),
            Err(Error::Conflict)
        ));

        xm.commit(&tx_b, None).unwrap();
    }

    #[test]
    fn read_only_reader_is_demoted() {
        let xm = TxManager::new();
        let lsm = test_lsm();

        let reader = xm.begin();
        xm.track_point(&reader, lsm.id(), &UserKey::from(*b"k"));
        assert!(reader.read_view().is_global());

        let writer = xm.begin();
        xm.set(&writer, &lsm, Statement::replace(*b"k", *b"y", 0)).unwrap();
        xm.prepare(&writer).unwrap();

        // Still READY, but now pinned to a historical view.
        assert_eq!(TxState::Ready, reader.state());
        assert!(!reader.read_view().is_global());
        let demoted_vlsn = reader.read_view().vlsn();
        assert_eq!(xm.lsn(), demoted_vlsn);

        // On commit the view must stay at the pre-writer state.
        xm.commit(&writer, None).unwrap();
        assert_eq!(demoted_vlsn, reader.read_view().vlsn());
    }

    #[test]
    fn rollback_after_prepare_reverses_mem() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::replace(*b"k", *b"v", 0)).unwrap();
        xm.prepare(&tx).unwrap();

        let (active, _) = lsm.mem_snapshot();
        assert!(!active.is_empty());

        xm.rollback(&tx);
        assert!(active.is_empty());
        assert!(!active.is_pinned());
    }

    #[test]
    fn rollback_after_prepare_aborts_readers_of_dirty_keys() {
        let xm = TxManager::new();
        let lsm = test_lsm();

        let reader = xm.begin();
        xm.track_point(&reader, lsm.id(), &UserKey::from(*b"k"));

        let writer = xm.begin();
        xm.set(&writer, &lsm, Statement::replace(*b"k", *b"v", 0)).unwrap();
        xm.prepare(&writer).unwrap();

        // The reader was demoted (read-only), still READY.
        assert_eq!(TxState::Ready, reader.state());

        xm.rollback(&writer);
        assert_eq!(TxState::Abort, reader.state());
    }

    #[test]
    fn track_merges_intervals() {
        let xm = TxManager::new();
        let tx = xm.begin();

        xm.track(
            &tx,
            1,
            Some(UserKey::from(*b"a")),
            true,
            Some(UserKey::from(*b"c")),
            true,
        );
        xm.track(
            &tx,
            1,
            Some(UserKey::from(*b"b")),
            true,
            Some(UserKey::from(*b"f")),
            true,
        );
        assert_eq!(1, xm.read_set_len(1));

        // Disjoint interval stays separate.
        xm.track(
            &tx,
            1,
            Some(UserKey::from(*b"x")),
            true,
            Some(UserKey::from(*b"z")),
            true,
        );
        assert_eq!(2, xm.read_set_len(1));

        // Contained interval is absorbed.
        xm.track(
            &tx,
            1,
            Some(UserKey::from(*b"b")),
            true,
            Some(UserKey::from(*b"d")),
            true,
        );
        assert_eq!(2, xm.read_set_len(1));

        xm.rollback(&tx);
        assert_eq!(0, xm.read_set_len(1));
    }

    #[test]
    fn txw_iterator_scans_own_writes() {
        let xm = TxManager::new();
        let lsm = test_lsm();
        let tx = xm.begin();

        xm.set(&tx, &lsm, Statement::replace(*b"a", *b"1", 0)).unwrap();
        xm.set(&tx, &lsm, Statement::replace(*b"c", *b"3", 0)).unwrap();
        xm.set(&tx, &lsm, Statement::replace(*b"b", *b"2", 0)).unwrap();

        let mut iter = TxwIterator::new(
            tx.clone(),
            lsm.id(),
            IteratorType::Ge,
            UserKey::empty(),
        );
        iter.skip_to(None);

        let mut keys = vec![];
        while let Some(stmt) = iter.curr().cloned() {
            keys.push(stmt.key.clone());
            iter.next_key();
        }
        assert_eq!(
            vec![
                UserKey::from(*b"a"),
                UserKey::from(*b"b"),
                UserKey::from(*b"c")
            ],
            keys
        );
    }

    #[test]
    fn read_views_for_write_iterator() {
        let xm = TxManager::new();
        let lsm = test_lsm();

        // Commit something so the demoted view has a real vlsn.
        let tx = xm.begin();
        xm.set(&tx, &lsm, Statement::replace(*b"a", *b"1", 0)).unwrap();
        xm.prepare(&tx).unwrap();
        xm.commit(&tx, None).unwrap();

        let reader = xm.begin();
        xm.track_point(&reader, lsm.id(), &UserKey::from(*b"a"));

        let writer = xm.begin();
        xm.set(&writer, &lsm, Statement::replace(*b"a", *b"2", 0)).unwrap();
        xm.prepare(&writer).unwrap();
        xm.commit(&writer, None).unwrap();

        let views = xm.read_views();
        assert_eq!(vec![1], views);
        drop(reader);
    }
}
