// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Full-key point lookup
//!
//! The fast path for lookups whose key carries all comparison parts: scan
//! the sources in priority order, accumulating the key's history until a
//! terminal statement, then fold UPSERTs into the result. Slices are pinned
//! around disk reads; if the in-memory level list changed during one, the
//! whole scan restarts.

use crate::{
    lsm::Lsm,
    read_view::ReadView,
    run::{PageCache, RunIterator},
    stmt::{apply_upsert, Statement, StmtKind},
    tx::{Tx, TxManager},
    IteratorType, UserKey,
};
use std::sync::{atomic::Ordering::AcqRel, Arc};

/// Looks up the newest visible tuple for a full key.
///
/// Returns `None` when the key does not exist under the read view, either
/// because nothing was ever written or because a tombstone is the newest
/// visible version.
pub(crate) fn point_lookup(
    lsm: &Arc<Lsm>,
    xm: &Arc<TxManager>,
    tx: Option<&Arc<Tx>>,
    rv: &Arc<ReadView>,
    page_cache: &Arc<PageCache>,
    key: &UserKey,
) -> crate::Result<Option<Statement>> {
    if let Some(tx) = tx {
        if tx.state() == crate::TxState::Abort {
            return Err(crate::Error::Conflict);
        }
        xm.track_point(tx, lsm.id(), key);
    }

    lsm.stats.lookups.fetch_add(1, AcqRel);

    let vlsn = rv.vlsn();
    let mut restarts = 0u32;

    'restart: loop {
        // Newest first; scanning stops once a terminal statement is found.
        let mut history: Vec<Statement> = Vec::new();
        let mut complete = false;

        // 1. The transaction's own write.
        if let Some(tx) = tx {
            if let Some(stmt) = tx.own_write(lsm.id(), key) {
                complete = stmt.kind.is_terminal();
                history.push(stmt);
            }
        }

        // 2. The tuple cache; it only stores terminal statements.
        if !complete {
            if let Some(stmt) = lsm.cache.get(key, vlsn) {
                debug_assert!(stmt.kind.is_terminal());
                history.push(stmt);
                complete = true;
            }
        }

        // 3. In-memory levels, newest first.
        let mem_list_version = lsm.mem_list_version();
        if !complete {
            let (active, sealed) = lsm.mem_snapshot();
            for mem in std::iter::once(active).chain(sealed) {
                let mut bound = vlsn;
                while let Some(stmt) = mem.newest_visible(key, bound) {
                    bound = stmt.lsn - 1;
                    complete = stmt.kind.is_terminal();
                    history.push(stmt);
                    if complete {
                        break;
                    }
                }
                if complete {
                    break;
                }
            }
        }

        // 4. Run slices of the range containing the key, newest first.
        if !complete {
            if let Some(range) = lsm.find_range(IteratorType::Eq, key) {
                for slice in range.slices() {
                    slice.pin();

                    let result = (|| -> crate::Result<bool> {
                        let mut iter = RunIterator::new(
                            slice.clone(),
                            page_cache.clone(),
                            IteratorType::Eq,
                            key.clone(),
                            vlsn,
                        );
                        iter.skip_to(None)?;

                        let mut complete = false;
                        while let Some(stmt) = iter.curr().cloned() {
                            if stmt.key != *key {
                                break;
                            }
                            complete = stmt.kind.is_terminal();
                            history.push(stmt);
                            if complete {
                                break;
                            }
                            iter.next_lsn()?;
                        }
                        Ok(complete)
                    })();

                    slice.unpin();

                    // The disk read may have suspended us; sealed levels
                    // collected meanwhile could hold versions this scan
                    // never saw.
                    if lsm.mem_list_version() != mem_list_version {
                        restarts += 1;
                        if restarts > 3 {
                            log::warn!(
                                "point lookup of lsm {} keeps restarting ({restarts} times)",
                                lsm.id(),
                            );
                        }
                        continue 'restart;
                    }

                    if result? {
                        complete = true;
                        break;
                    }
                }
            }
        }

        // Fold the history, oldest first.
        let mut curr: Option<Statement> = None;
        for stmt in history.iter().rev() {
            curr = Some(match stmt.kind {
                StmtKind::Upsert => {
                    lsm.stats.upsert_applied.fetch_add(1, AcqRel);
                    apply_upsert(stmt, curr.as_ref())
                }
                _ => stmt.clone(),
            });
        }

        let result = curr.filter(|stmt| stmt.kind != StmtKind::Delete);

        // Feed the cache from latest-state lookups, except with our own
        // uncommitted write.
        if let Some(stmt) = &result {
            let own = tx.is_some_and(|tx| tx.own_write(lsm.id(), key).is_some());
            if rv.is_global() && !own && stmt.lsn < crate::stmt::MAX_LSN {
                lsm.cache.add(stmt, None, 1);
            }
        }

        return Ok(result);
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

        fn get(&self, key: &[u8], vlsn: Lsn) -> Option<Statement> {
            let rv = crate::ReadView::new(vlsn);
            point_lookup(
                &self.lsm,
                &self.xm,
                None,
                &rv,
                &self.page_cache,
                &UserKey::from(key),
            )
            .unwrap()
        }
    }

    #[test]
    fn point_read_and_cache_hit() {
        let fx = Fixture::new();
        fx.write(Statement::replace(*b"k", *b"a", 0));

        let stmt = fx.get(b"k", Lsn::MAX).unwrap();
        assert_eq!(&*stmt.value, b"a");
        assert_eq!(1, stmt.lsn);

        // Second lookup must be served by the cache.
        let stmt = fx.get(b"k", Lsn::MAX).unwrap();
        assert_eq!(&*stmt.value, b"a");

        let hits = fx
            .lsm
            .cache
            .stats
            .hits
            .load(std::sync::atomic::Ordering::Acquire);
        assert!(hits >= 1);
    }

    #[test]
    fn delete_hides_key() {
        let fx = Fixture::new();
        fx.write(Statement::replace(*b"k", *b"x", 0)); // lsn 1
        fx.write(Statement::delete(*b"k", 0)); // lsn 2

        assert!(fx.get(b"k", Lsn::MAX).is_none());

        // At vlsn 1 the old value is still visible.
        let stmt = fx.get(b"k", 1).unwrap();
        assert_eq!(&*stmt.value, b"x");
    }

    #[test]
    fn upsert_chain_is_applied() {
        let fx = Fixture::new();
        let ops = || crate::stmt::UpsertOps::from(vec![crate::stmt::UpsertOp::Add(7)]);

        fx.write(Statement::upsert(*b"k", 1i64.to_le_bytes(), ops(), 0));
        fx.write(Statement::upsert(*b"k", 1i64.to_le_bytes(), ops(), 0));

        let stmt = fx.get(b"k", Lsn::MAX).unwrap();
        assert_eq!(8i64.to_le_bytes().as_slice(), &*stmt.value);
    }

    #[test]
    fn own_write_wins() {
        let fx = Fixture::new();
        fx.write(Statement::replace(*b"k", *b"committed", 0));

        let tx = fx.xm.begin();
        fx.xm
            .set(&tx, &fx.lsm, Statement::replace(*b"k", *b"mine", 0))
            .unwrap();

        let rv = fx.xm.global_read_view();
        let stmt = point_lookup(
            &fx.lsm,
            &fx.xm,
            Some(&tx),
            &rv,
            &fx.page_cache,
            &UserKey::from(*b"k"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(&*stmt.value, b"mine");

        fx.xm.rollback(&tx);
    }

    #[test]
    fn missing_key() {
        let fx = Fixture::new();
        assert!(fx.get(b"nope", Lsn::MAX).is_none());
    }
}
