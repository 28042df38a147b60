// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    pin::PinCount,
    stmt::{Lsn, Statement, StmtKind, MAX_LSN},
    IteratorType, MemId, UserKey,
};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::{
    atomic::{
        AtomicI64, AtomicU64,
        Ordering::{AcqRel, Acquire},
    },
    Arc,
};

/// Entry key of the in-memory tree: key ascending, then LSN descending, so
/// the newest version of a key comes first.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemKey {
    pub key: UserKey,
    pub lsn: Lsn,
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.key, std::cmp::Reverse(self.lsn)).cmp(&(&other.key, std::cmp::Reverse(other.lsn)))
    }
}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// In-memory level of an LSM tree
///
/// An ordered multi-version map of statements, append-only while active,
/// sealed on rotation and destroyed after a successful dump. Writers may
/// insert concurrently with readers; every write bumps `version` so open
/// iterators can detect that they must re-seek.
pub struct Mem {
    pub(crate) id: MemId,

    /// Tags the allocation epoch; the scheduler dumps all levels whose
    /// generation lags the current one.
    pub(crate) generation: u64,

    /// Tuple format epoch the level was created under.
    pub(crate) schema_version: u64,

    tree: SkipMap<MemKey, Statement>,

    /// Bumped on every insert and erase.
    version: AtomicU64,

    count: AtomicU64,
    used_bytes: AtomicU64,

    /// Max committed LSN ever stored; what a dump of this level covers.
    dump_lsn: AtomicI64,

    pub(crate) pins: PinCount,
}

impl Mem {
    #[must_use]
    pub fn new(id: MemId, generation: u64, schema_version: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            generation,
            schema_version,
            tree: SkipMap::new(),
            version: AtomicU64::new(0),
            count: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            dump_lsn: AtomicI64::new(-1),
            pins: PinCount::default(),
        })
    }

    #[must_use]
    pub fn id(&self) -> MemId {
        self.id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Acquire) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate size of buffered statements in bytes.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Acquire)
    }

    /// Max committed LSN stored, or -1 if none.
    #[must_use]
    pub fn dump_lsn(&self) -> Lsn {
        self.dump_lsn.load(Acquire)
    }

    /// Places a statement in the tree.
    ///
    /// An entry with identical key and LSN is overwritten; this is how a
    /// prepared statement is replaced by its committed version.
    pub fn insert(&self, stmt: Statement) {
        let footprint = stmt.footprint();
        let lsn = stmt.lsn;
        let key = MemKey {
            key: stmt.key.clone(),
            lsn,
        };

        self.tree.insert(key, stmt);

        self.count.fetch_add(1, AcqRel);
        self.used_bytes.fetch_add(footprint, AcqRel);
        if lsn < MAX_LSN {
            self.dump_lsn.fetch_max(lsn, AcqRel);
        }
        self.version.fetch_add(1, AcqRel);
    }

    /// Like [`Mem::insert`] but counts the UPSERT chain under the key.
    ///
    /// Returns the statement's position in the chain so the caller can
    /// decide whether the squash threshold was reached.
    pub fn insert_upsert(&self, mut stmt: Statement) -> u8 {
        debug_assert_eq!(StmtKind::Upsert, stmt.kind);

        let n_upserts = match self.older_lsn(&stmt.key, stmt.lsn) {
            Some(older) if older.kind == StmtKind::Upsert => older.n_upserts.saturating_add(1),
            _ => 0,
        };
        stmt.n_upserts = n_upserts;
        self.insert(stmt);
        n_upserts
    }

    /// Erases a statement; the reverse of [`Mem::insert`], used by rollback.
    pub fn erase(&self, key: &UserKey, lsn: Lsn) {
        let mem_key = MemKey {
            key: key.clone(),
            lsn,
        };
        if let Some(entry) = self.tree.remove(&mem_key) {
            self.count.fetch_sub(1, AcqRel);
            self.used_bytes
                .fetch_sub(entry.value().footprint(), AcqRel);
            self.version.fetch_add(1, AcqRel);
        }
    }

    /// Next key-equal statement with a strictly smaller LSN, or none.
    #[must_use]
    pub fn older_lsn(&self, key: &UserKey, lsn: Lsn) -> Option<Statement> {
        let from = MemKey {
            key: key.clone(),
            lsn,
        };
        let entry = self.tree.range((Excluded(from), Unbounded)).next()?;
        if entry.key().key == *key {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// Newest version of `key` with `lsn <= vlsn`, or none.
    #[must_use]
    pub fn newest_visible(&self, key: &UserKey, vlsn: Lsn) -> Option<Statement> {
        let from = MemKey {
            key: key.clone(),
            lsn: vlsn,
        };
        let entry = self.tree.range(from..).next()?;
        if entry.key().key == *key {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// Opens a merge-source iterator.
    #[must_use]
    pub fn iter(self: &Arc<Self>, itype: IteratorType, key: UserKey, vlsn: Lsn) -> MemIterator {
        MemIterator::new(self.clone(), itype, key, vlsn)
    }

    /// Opens a linear stream over every statement, oldest key first.
    /// Input of the write iterator; the level must be sealed.
    #[must_use]
    pub fn stream(self: &Arc<Self>) -> MemStream {
        MemStream {
            mem: self.clone(),
            pos: None,
        }
    }

    pub fn pin(&self) {
        self.pins.pin();
    }

    pub fn unpin(&self) {
        self.pins.unpin();
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pins.is_pinned()
    }

    /// Blocks until no writer holds the level pinned. Called before dumping.
    pub fn wait_pinned(&self) {
        self.pins.wait_unpinned();
    }
}

/// Linear statement stream over a sealed in-memory level
pub struct MemStream {
    mem: Arc<Mem>,
    pos: Option<MemKey>,
}

impl Iterator for MemStream {
    type Item = Statement;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match &self.pos {
            None => self.mem.tree.iter().next()?,
            Some(pos) => self
                .mem
                .tree
                .range((Excluded(pos.clone()), Unbounded))
                .next()?,
        };
        self.pos = Some(entry.key().clone());
        Some(entry.value().clone())
    }
}

/// Merge-source iterator over one in-memory level
///
/// Yields, per key in the direction of the iterator type, the newest version
/// visible under the read view. Invalidated by any concurrent write: the
/// version is snapshotted on every positioning step, and [`MemIterator::restore`]
/// re-seeks past the last emitted statement when it changed.
pub struct MemIterator {
    mem: Arc<Mem>,
    itype: IteratorType,
    key: UserKey,
    vlsn: Lsn,
    version: u64,
    curr: Option<Statement>,
}

impl MemIterator {
    fn new(mem: Arc<Mem>, itype: IteratorType, key: UserKey, vlsn: Lsn) -> Self {
        let itype = if key.is_empty() {
            itype.for_empty_key()
        } else {
            itype.normalize()
        };
        let version = mem.version();
        Self {
            mem,
            itype,
            key,
            vlsn,
            version,
            curr: None,
        }
    }

    /// Statement the iterator is at.
    #[must_use]
    pub fn curr(&self) -> Option<&Statement> {
        self.curr.as_ref()
    }

    fn reverse(&self) -> bool {
        self.itype.is_reverse()
    }

    /// Newest visible version of the key the entry at `anchor` belongs to;
    /// walks forward over invisible versions, bails to the next key if the
    /// whole version chain is invisible.
    fn newest_visible_from(&self, anchor: MemKey) -> Option<Statement> {
        let mut start = anchor;
        loop {
            let visible_anchor = MemKey {
                key: start.key.clone(),
                lsn: self.vlsn,
            };
            if let Some(entry) = self.mem.tree.range(visible_anchor..).next() {
                if entry.key().key == start.key {
                    return Some(entry.value().clone());
                }
                if self.reverse() {
                    // All versions invisible; step to the preceding key.
                    let upper = MemKey {
                        key: start.key.clone(),
                        lsn: Lsn::MAX,
                    };
                    let prev = self.mem.tree.range(..upper).next_back()?;
                    start = prev.key().clone();
                } else {
                    start = entry.key().clone();
                }
            } else {
                if self.reverse() {
                    let upper = MemKey {
                        key: start.key.clone(),
                        lsn: Lsn::MAX,
                    };
                    let prev = self.mem.tree.range(..upper).next_back()?;
                    start = prev.key().clone();
                    continue;
                }
                return None;
            }
        }
    }

    /// Positions at the first key in scan order, honoring the search key.
    fn seek_start(&mut self) -> Option<Statement> {
        if self.reverse() {
            let anchor = match self.itype {
                IteratorType::Le | IteratorType::Req => {
                    // Last entry with key <= search key.
                    let bound = MemKey {
                        key: self.key.clone(),
                        lsn: Lsn::MIN,
                    };
                    if self.key.is_empty() {
                        self.mem.tree.iter().next_back()
                    } else {
                        self.mem.tree.range(..=bound).next_back()
                    }
                }
                _ => {
                    debug_assert_eq!(IteratorType::Lt, self.itype);
                    let bound = MemKey {
                        key: self.key.clone(),
                        lsn: Lsn::MAX,
                    };
                    self.mem.tree.range(..bound).next_back()
                }
            }?
            .key()
            .clone();
            self.newest_visible_from(anchor)
        } else {
            let anchor = match self.itype {
                IteratorType::Gt => {
                    let bound = MemKey {
                        key: self.key.clone(),
                        lsn: Lsn::MIN,
                    };
                    self.mem.tree.range((Excluded(bound), Unbounded)).next()
                }
                _ => {
                    let bound = MemKey {
                        key: self.key.clone(),
                        lsn: Lsn::MAX,
                    };
                    self.mem.tree.range((Included(bound), Unbounded)).next()
                }
            }?
            .key()
            .clone();
            self.newest_visible_from(anchor)
        }
    }

    /// Positions at the first key beyond `last` in scan order (or at the
    /// start when `last` is none).
    pub fn skip_to(&mut self, last: Option<&Statement>) {
        self.version = self.mem.version();
        self.curr = match last {
            None => self.seek_start(),
            Some(last) => {
                let anchor = if self.reverse() {
                    self.mem
                        .tree
                        .range(
                            ..MemKey {
                                key: last.key.clone(),
                                lsn: Lsn::MAX,
                            },
                        )
                        .next_back()
                        .map(|e| e.key().clone())
                } else {
                    self.mem
                        .tree
                        .range((
                            Excluded(MemKey {
                                key: last.key.clone(),
                                lsn: Lsn::MIN,
                            }),
                            Unbounded,
                        ))
                        .next()
                        .map(|e| e.key().clone())
                };
                anchor.and_then(|a| self.newest_visible_from(a))
            }
        };
    }

    /// Advances to the next distinct key.
    pub fn next_key(&mut self) {
        let Some(curr) = self.curr.take() else {
            return;
        };
        self.version = self.mem.version();
        let anchor = if self.reverse() {
            self.mem
                .tree
                .range(
                    ..MemKey {
                        key: curr.key.clone(),
                        lsn: Lsn::MAX,
                    },
                )
                .next_back()
                .map(|e| e.key().clone())
        } else {
            self.mem
                .tree
                .range((
                    Excluded(MemKey {
                        key: curr.key.clone(),
                        lsn: Lsn::MIN,
                    }),
                    Unbounded,
                ))
                .next()
                .map(|e| e.key().clone())
        };
        self.curr = anchor.and_then(|a| self.newest_visible_from(a));
    }

    /// Advances to the next older visible version of the current key.
    pub fn next_lsn(&mut self) {
        let Some(curr) = self.curr.take() else {
            return;
        };
        self.version = self.mem.version();
        self.curr = self.mem.older_lsn(&curr.key, curr.lsn);
    }

    /// Re-seeks past `last` if the level changed since the last positioning
    /// step. Returns `true` if the position may have changed.
    pub fn restore(&mut self, last: Option<&Statement>) -> bool {
        if self.version == self.mem.version() {
            return false;
        }
        self.skip_to(last);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn mem_with(entries: &[(&[u8], &[u8], Lsn)]) -> Arc<Mem> {
        let mem = Mem::new(1, 0, 0);
        for (k, v, lsn) in entries {
            mem.insert(Statement::replace(*k, *v, *lsn));
        }
        mem
    }

    #[test]
    fn mem_ordering_newest_first() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"a", b"2", 2), (b"a", b"3", 3)]);
        let versions: Vec<Lsn> = mem.stream().map(|s| s.lsn).collect();
        assert_eq!(vec![3, 2, 1], versions);
    }

    #[test]
    fn mem_overwrite_same_lsn() {
        let mem = mem_with(&[(b"a", b"1", 1)]);
        mem.insert(Statement::replace(*b"a", *b"2", 1));
        let got = mem.newest_visible(&UserKey::from(*b"a"), Lsn::MAX).unwrap();
        assert_eq!(&*got.value, b"2");
    }

    #[test]
    fn mem_older_lsn() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"a", b"2", 2), (b"b", b"x", 5)]);
        let key = UserKey::from(*b"a");
        assert_eq!(1, mem.older_lsn(&key, 2).unwrap().lsn);
        assert!(mem.older_lsn(&key, 1).is_none());
    }

    #[test]
    fn mem_newest_visible_respects_vlsn() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"a", b"2", 2), (b"a", b"3", 3)]);
        let key = UserKey::from(*b"a");
        assert_eq!(3, mem.newest_visible(&key, Lsn::MAX).unwrap().lsn);
        assert_eq!(2, mem.newest_visible(&key, 2).unwrap().lsn);
        assert!(mem.newest_visible(&key, 0).is_none());
    }

    #[test]
    fn mem_erase_reverses_insert() {
        let mem = mem_with(&[(b"a", b"1", 1)]);
        assert_eq!(1, mem.len());
        mem.erase(&UserKey::from(*b"a"), 1);
        assert!(mem.is_empty());
        assert_eq!(0, mem.used_bytes());
    }

    #[test]
    fn mem_dump_lsn_ignores_prepared() {
        let mem = mem_with(&[(b"a", b"1", 9)]);
        mem.insert(Statement::replace(*b"b", *b"2", MAX_LSN + 5));
        assert_eq!(9, mem.dump_lsn());
    }

    #[test]
    fn mem_iterator_ge_scan() {
        let mem = mem_with(&[
            (b"a", b"1", 1),
            (b"b", b"2", 2),
            (b"b", b"20", 4),
            (b"c", b"3", 3),
        ]);

        let mut iter = mem.iter(IteratorType::Ge, UserKey::from(*b"b"), Lsn::MAX);
        iter.skip_to(None);
        assert_eq!(4, iter.curr().unwrap().lsn);
        iter.next_key();
        assert_eq!(&*iter.curr().unwrap().key, b"c");
        iter.next_key();
        assert!(iter.curr().is_none());
    }

    #[test]
    fn mem_iterator_le_scan() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"b", b"2", 2), (b"c", b"3", 3)]);

        let mut iter = mem.iter(IteratorType::Le, UserKey::from(*b"b"), Lsn::MAX);
        iter.skip_to(None);
        assert_eq!(&*iter.curr().unwrap().key, b"b");
        iter.next_key();
        assert_eq!(&*iter.curr().unwrap().key, b"a");
        iter.next_key();
        assert!(iter.curr().is_none());
    }

    #[test]
    fn mem_iterator_skips_invisible_versions() {
        let mem = mem_with(&[(b"a", b"1", 10), (b"b", b"2", 2)]);

        let mut iter = mem.iter(IteratorType::Ge, UserKey::empty(), 5);
        iter.skip_to(None);
        // All of "a" is invisible at vlsn 5.
        assert_eq!(&*iter.curr().unwrap().key, b"b");
    }

    #[test]
    fn mem_iterator_next_lsn() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"a", b"2", 2), (b"a", b"3", 3)]);

        let mut iter = mem.iter(IteratorType::Ge, UserKey::empty(), Lsn::MAX);
        iter.skip_to(None);
        assert_eq!(3, iter.curr().unwrap().lsn);
        iter.next_lsn();
        assert_eq!(2, iter.curr().unwrap().lsn);
        iter.next_lsn();
        assert_eq!(1, iter.curr().unwrap().lsn);
        iter.next_lsn();
        assert!(iter.curr().is_none());
    }

    #[test]
    fn mem_iterator_restore_after_write() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"c", b"3", 3)]);

        let mut iter = mem.iter(IteratorType::Ge, UserKey::empty(), Lsn::MAX);
        iter.skip_to(None);
        let last = iter.curr().cloned();
        assert_eq!(&*last.as_ref().unwrap().key, b"a");

        assert!(!iter.restore(last.as_ref()));

        // A concurrent insert between "a" and "c" must be picked up.
        mem.insert(Statement::replace(*b"b", *b"2", 5));
        assert!(iter.restore(last.as_ref()));
        assert_eq!(&*iter.curr().unwrap().key, b"b");
    }

    #[test]
    fn mem_upsert_chain_counter() {
        let mem = Mem::new(1, 0, 0);
        let ops = crate::stmt::UpsertOps::from(vec![crate::stmt::UpsertOp::Add(1)]);

        let n0 = mem.insert_upsert(Statement::upsert(*b"k", 0i64.to_le_bytes(), ops.clone(), 1));
        let n1 = mem.insert_upsert(Statement::upsert(*b"k", 0i64.to_le_bytes(), ops.clone(), 2));
        let n2 = mem.insert_upsert(Statement::upsert(*b"k", 0i64.to_le_bytes(), ops, 3));

        assert_eq!(0, n0);
        assert_eq!(1, n1);
        assert_eq!(2, n2);
    }
}
