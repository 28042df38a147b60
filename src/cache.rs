// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    stats::CacheStats,
    stmt::{Lsn, Statement},
    HashMap, IteratorType, UserKey,
};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{
    atomic::{AtomicU64, Ordering::AcqRel},
    Arc, Mutex, Weak,
};

/// The entry is chained to its left tree neighbor: no visible statement
/// with a key strictly between the two exists anywhere in the index.
pub const CACHE_LEFT_LINKED: u8 = 1 << 0;

/// The entry is chained to its right tree neighbor.
pub const CACHE_RIGHT_LINKED: u8 = 1 << 1;

struct CacheEntry {
    stmt: Statement,
    flags: u8,
}

impl CacheEntry {
    fn footprint(key: &UserKey, stmt: &Statement) -> u64 {
        key.len() as u64 + stmt.footprint()
    }
}

/// Common environment of all tuple caches: one LRU list and one byte quota
///
/// Entries across caches share the quota; inserting anywhere may evict the
/// globally least recently used entry.
pub struct CacheEnv {
    quota: u64,
    next_id: AtomicU64,
    inner: Mutex<CacheEnvInner>,
}

struct CacheEnvInner {
    used: u64,

    /// `(cache id, key)`, oldest in front. Entries may be stale; they are
    /// skipped when popped.
    lru: VecDeque<(u64, UserKey)>,

    caches: HashMap<u64, Weak<Cache>>,
}

impl CacheEnv {
    #[must_use]
    pub fn new(quota: u64) -> Arc<Self> {
        Arc::new(Self {
            quota,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(CacheEnvInner {
                used: 0,
                lru: VecDeque::new(),
                caches: HashMap::default(),
            }),
        })
    }

    /// Creates a cache bound to this environment.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_cache(self: &Arc<Self>) -> Arc<Cache> {
        let id = self.next_id.fetch_add(1, AcqRel);
        let cache = Arc::new(Cache {
            id,
            env: self.clone(),
            tree: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            stats: CacheStats::default(),
        });

        self.inner
            .lock()
            .expect("lock is poisoned")
            .caches
            .insert(id, Arc::downgrade(&cache));

        cache
    }

    /// Bytes currently held across all caches.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn used(&self) -> u64 {
        self.inner.lock().expect("lock is poisoned").used
    }

    #[allow(clippy::expect_used)]
    fn on_insert(&self, cache_id: u64, key: &UserKey, bytes: u64) {
        {
            let mut inner = self.inner.lock().expect("lock is poisoned");
            inner.used += bytes;
            inner.lru.retain(|(id, k)| *id != cache_id || k != key);
            inner.lru.push_back((cache_id, key.clone()));
        }
        self.evict();
    }

    #[allow(clippy::expect_used)]
    fn on_remove(&self, bytes: u64) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.used = inner.used.saturating_sub(bytes);
    }

    #[allow(clippy::expect_used)]
    fn touch(&self, cache_id: u64, key: &UserKey) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.lru.retain(|(id, k)| *id != cache_id || k != key);
        inner.lru.push_back((cache_id, key.clone()));
    }

    /// Pops least-recently-used entries until the quota holds.
    #[allow(clippy::expect_used)]
    fn evict(&self) {
        loop {
            let victim = {
                let mut inner = self.inner.lock().expect("lock is poisoned");
                if inner.used <= self.quota {
                    return;
                }
                let Some((cache_id, key)) = inner.lru.pop_front() else {
                    return;
                };
                inner.caches.get(&cache_id).cloned().map(|w| (w, key))
            };

            if let Some((weak, key)) = victim {
                if let Some(cache) = weak.upgrade() {
                    cache.evict_entry(&key);
                }
            }
        }
    }
}

/// Tuple cache of one LSM tree
///
/// A key-ordered tree of terminal statements recently returned to readers.
/// Adjacent entries may be chained, which lets the read iterator skip all
/// older sources for the interval between them.
pub struct Cache {
    id: u64,
    env: Arc<CacheEnv>,
    tree: Mutex<BTreeMap<UserKey, CacheEntry>>,
    version: AtomicU64,
    pub(crate) stats: CacheStats,
}

impl Cache {
    /// Looks up the terminal statement cached for `key`, visible under
    /// `vlsn`.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn get(&self, key: &UserKey, vlsn: Lsn) -> Option<Statement> {
        let tree = self.tree.lock().expect("lock is poisoned");
        let entry = tree.get(key);

        match entry {
            Some(entry) if entry.stmt.lsn <= vlsn => {
                let stmt = entry.stmt.clone();
                drop(tree);
                self.stats.hits.fetch_add(1, AcqRel);
                self.env.touch(self.id, key);
                Some(stmt)
            }
            _ => {
                drop(tree);
                self.stats.misses.fetch_add(1, AcqRel);
                None
            }
        }
    }

    /// Caches a statement a reader observed at the latest state, chaining it
    /// to the previously emitted statement when the two are tree neighbors.
    ///
    /// Must only be fed from reads at `vlsn = infinity`; historical reads
    /// would plant false chains.
    #[allow(clippy::expect_used)]
    pub fn add(&self, stmt: &Statement, prev: Option<&Statement>, direction: i8) {
        debug_assert!(!stmt.is_tombstone());

        let bytes = CacheEntry::footprint(&stmt.key, stmt);

        {
            let mut tree = self.tree.lock().expect("lock is poisoned");

            let old_bytes = tree
                .get(&stmt.key)
                .map(|e| CacheEntry::footprint(&stmt.key, &e.stmt));

            let flags = tree.get(&stmt.key).map_or(0, |e| e.flags);
            tree.insert(
                stmt.key.clone(),
                CacheEntry {
                    stmt: stmt.clone(),
                    flags,
                },
            );

            if let Some(old) = old_bytes {
                drop(tree);
                self.env.on_remove(old);
            } else {
                drop(tree);
            }
        }

        self.version.fetch_add(1, AcqRel);
        self.stats.puts.fetch_add(1, AcqRel);
        self.env.on_insert(self.id, &stmt.key, bytes);

        if let Some(prev) = prev {
            self.link(prev, stmt, direction);
        }
    }

    /// Chains `prev` and `curr` if they are adjacent in the tree.
    #[allow(clippy::expect_used)]
    fn link(&self, prev: &Statement, curr: &Statement, direction: i8) {
        let (left, right) = if direction > 0 {
            (&prev.key, &curr.key)
        } else {
            (&curr.key, &prev.key)
        };

        if left >= right {
            return;
        }

        let mut tree = self.tree.lock().expect("lock is poisoned");

        // Only link when nothing sits between the two.
        let successor = tree
            .range::<UserKey, _>((Excluded(left), Unbounded))
            .next()
            .map(|(k, _)| k.clone());
        if successor.as_ref() != Some(right) {
            return;
        }

        if let Some(entry) = tree.get_mut(left) {
            entry.flags |= CACHE_RIGHT_LINKED;
        }
        if let Some(entry) = tree.get_mut(right) {
            entry.flags |= CACHE_LEFT_LINKED;
        }
    }

    /// Invalidates the entry for a written key and breaks the chains that
    /// spanned it.
    #[allow(clippy::expect_used)]
    pub fn on_write(&self, key: &UserKey) {
        let removed = {
            let mut tree = self.tree.lock().expect("lock is poisoned");

            let left = tree
                .range::<UserKey, _>(..key)
                .next_back()
                .map(|(k, _)| k.clone());
            let right = tree
                .range::<UserKey, _>((Excluded(key), Unbounded))
                .next()
                .map(|(k, _)| k.clone());

            if let Some(left) = left {
                if let Some(entry) = tree.get_mut(&left) {
                    entry.flags &= !CACHE_RIGHT_LINKED;
                }
            }
            if let Some(right) = right {
                if let Some(entry) = tree.get_mut(&right) {
                    entry.flags &= !CACHE_LEFT_LINKED;
                }
            }

            tree.remove(key)
                .map(|e| CacheEntry::footprint(key, &e.stmt))
        };

        if let Some(bytes) = removed {
            self.stats.invalidated.fetch_add(1, AcqRel);
            self.env.on_remove(bytes);
        }
        self.version.fetch_add(1, AcqRel);
    }

    /// Drops one entry on behalf of the LRU. Unlike [`Cache::on_write`] the
    /// neighbors stay chained to each other only if they were chained to the
    /// victim on both sides; anything else would falsely widen a chain, so
    /// we simply unchain.
    #[allow(clippy::expect_used)]
    fn evict_entry(&self, key: &UserKey) {
        let removed = {
            let mut tree = self.tree.lock().expect("lock is poisoned");

            let left = tree
                .range::<UserKey, _>(..key)
                .next_back()
                .map(|(k, _)| k.clone());
            let right = tree
                .range::<UserKey, _>((Excluded(key), Unbounded))
                .next()
                .map(|(k, _)| k.clone());

            if let Some(left) = left {
                if let Some(entry) = tree.get_mut(&left) {
                    entry.flags &= !CACHE_RIGHT_LINKED;
                }
            }
            if let Some(right) = right {
                if let Some(entry) = tree.get_mut(&right) {
                    entry.flags &= !CACHE_LEFT_LINKED;
                }
            }

            tree.remove(key)
                .map(|e| CacheEntry::footprint(key, &e.stmt))
        };

        if let Some(bytes) = removed {
            self.stats.evicted.fetch_add(1, AcqRel);
            self.env.on_remove(bytes);
            self.version.fetch_add(1, AcqRel);
        }
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    fn len(&self) -> usize {
        self.tree.lock().expect("lock is poisoned").len()
    }

    /// Opens a merge-source iterator over the cache.
    #[must_use]
    pub fn iter(
        self: &Arc<Self>,
        itype: IteratorType,
        key: UserKey,
        vlsn: Lsn,
    ) -> CacheIterator {
        let itype = if key.is_empty() {
            itype.for_empty_key()
        } else {
            itype.normalize()
        };
        CacheIterator {
            cache: self.clone(),
            itype,
            key,
            vlsn,
            curr: None,
        }
    }
}

/// Merge-source iterator over a tuple cache
///
/// Besides statements, reports whether the step crossed a chain: if it did,
/// no older source holds anything between the previous and the current key
/// and the read iterator can stop scanning them.
pub struct CacheIterator {
    cache: Arc<Cache>,
    itype: IteratorType,
    key: UserKey,
    vlsn: Lsn,
    curr: Option<Statement>,
}

impl CacheIterator {
    #[must_use]
    pub fn curr(&self) -> Option<&Statement> {
        self.curr.as_ref()
    }

    fn reverse(&self) -> bool {
        self.itype.is_reverse()
    }

    fn chain_flag(&self) -> u8 {
        if self.reverse() {
            CACHE_RIGHT_LINKED
        } else {
            CACHE_LEFT_LINKED
        }
    }

    /// Positions at the first usable entry beyond `last` in scan order.
    /// `stop` is set when the entry is chained to `last`'s entry.
    #[allow(clippy::expect_used)]
    pub fn skip_to(&mut self, last: Option<&Statement>, stop: &mut bool) {
        let tree = self.cache.tree.lock().expect("lock is poisoned");

        let mut anchor: Option<UserKey> = last.map(|l| l.key.clone());
        let mut first_step = true;

        self.curr = None;

        loop {
            let found = match (&anchor, self.reverse()) {
                (None, false) => match self.itype {
                    IteratorType::Gt => tree
                        .range::<UserKey, _>((Excluded(&self.key), Unbounded))
                        .next(),
                    _ if self.key.is_empty() => tree.iter().next(),
                    _ => tree.range::<UserKey, _>(&self.key..).next(),
                },
                (None, true) => {
                    if self.key.is_empty() {
                        tree.iter().next_back()
                    } else if self.itype == IteratorType::Lt {
                        tree.range::<UserKey, _>(..&self.key).next_back()
                    } else {
                        tree.range::<UserKey, _>(..=&self.key).next_back()
                    }
                }
                (Some(from), false) => tree
                    .range::<UserKey, _>((Excluded(from), Unbounded))
                    .next(),
                (Some(from), true) => tree.range::<UserKey, _>(..from).next_back(),
            };

            let Some((found_key, entry)) = found else {
                return;
            };

            // A chain is only trustworthy when we know the previous emitted
            // key is the tree neighbor on the scan side, and only for
            // readers of the latest state.
            if first_step
                && self.vlsn == Lsn::MAX
                && entry.flags & self.chain_flag() != 0
                && last.is_some()
            {
                let neighbor = if self.reverse() {
                    tree.range::<UserKey, _>((Excluded(found_key), Unbounded))
                        .next()
                        .map(|(k, _)| k)
                } else {
                    tree.range::<UserKey, _>(..found_key).next_back().map(|(k, _)| k)
                };
                if neighbor == last.map(|l| &l.key) {
                    *stop = true;
                }
            }

            if entry.stmt.lsn <= self.vlsn {
                self.curr = Some(entry.stmt.clone());
                return;
            }

            // Entry not visible under the read view; it cannot be used, and
            // neither can any chain through it.
            *stop = false;
            first_step = false;
            anchor = Some(found_key.clone());
        }
    }

    /// Advances to the next entry; `stop` is set when the step followed a
    /// chain.
    pub fn next_key(&mut self, stop: &mut bool) {
        let curr = self.curr.take();
        self.skip_to(curr.as_ref(), stop);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn stmt(key: &[u8], lsn: Lsn) -> Statement {
        Statement::replace(key, *b"v", lsn)
    }

    #[test]
    fn cache_get_put() {
        let env = CacheEnv::new(1_000_000);
        let cache = env.new_cache();

        let s = stmt(b"a", 5);
        cache.add(&s, None, 1);

        assert_eq!(Some(s.clone()), cache.get(&s.key, Lsn::MAX));

        // Not visible at an older read view
        assert_eq!(None, cache.get(&s.key, 3));
    }

    #[test]
    fn cache_on_write_invalidates() {
        let env = CacheEnv::new(1_000_000);
        let cache = env.new_cache();

        let s = stmt(b"a", 5);
        cache.add(&s, None, 1);
        cache.on_write(&s.key);
        assert_eq!(None, cache.get(&s.key, Lsn::MAX));
    }

    #[test]
    fn cache_chain_stops_iterator() {
        let env = CacheEnv::new(1_000_000);
        let cache = env.new_cache();

        let a = stmt(b"a", 1);
        let b = stmt(b"b", 2);
        cache.add(&a, None, 1);
        cache.add(&b, Some(&a), 1);

        let mut iter = cache.iter(IteratorType::Ge, UserKey::empty(), Lsn::MAX);
        let mut stop = false;
        iter.skip_to(None, &mut stop);
        assert!(!stop);
        assert_eq!(&*iter.curr().unwrap().key, b"a");

        let mut stop = false;
        iter.next_key(&mut stop);
        assert!(stop, "adjacent chained entries must stop the scan");
        assert_eq!(&*iter.curr().unwrap().key, b"b");
    }

    #[test]
    fn cache_write_between_breaks_chain() {
        let env = CacheEnv::new(1_000_000);
        let cache = env.new_cache();

        let a = stmt(b"a", 1);
        let c = stmt(b"c", 2);
        cache.add(&a, None, 1);
        cache.add(&c, Some(&a), 1);

        // Writing "b" must unchain (a, c).
        cache.on_write(&UserKey::from(*b"b"));

        let mut iter = cache.iter(IteratorType::Ge, UserKey::empty(), Lsn::MAX);
        let mut stop = false;
        iter.skip_to(None, &mut stop);
        let mut stop = false;
        iter.next_key(&mut stop);
        assert!(!stop);
    }

    #[test]
    fn cache_no_chain_when_not_adjacent() {
        let env = CacheEnv::new(1_000_000);
        let cache = env.new_cache();

        let a = stmt(b"a", 1);
        let b = stmt(b"b", 2);
        let c = stmt(b"c", 3);
        cache.add(&a, None, 1);
        cache.add(&b, None, 1);

        // (a, c) are not neighbors - no chain may be planted.
        cache.add(&c, Some(&a), 1);

        let mut iter = cache.iter(IteratorType::Ge, UserKey::from(*b"b"), Lsn::MAX);
        let mut stop = false;
        iter.skip_to(None, &mut stop);
        assert_eq!(&*iter.curr().unwrap().key, b"b");
        let mut stop = false;
        iter.next_key(&mut stop);
        assert!(!stop);
    }

    #[test]
    fn cache_quota_evicts_lru() {
        let env = CacheEnv::new(400);
        let cache = env.new_cache();

        for i in 0u32..32 {
            cache.add(&stmt(&i.to_be_bytes(), 1), None, 1);
        }

        assert!(env.used() <= 400);
        assert!(cache.len() < 32);

        // The newest entry must have survived.
        assert!(cache.get(&UserKey::from(31u32.to_be_bytes()), Lsn::MAX).is_some());
    }

    #[test]
    fn cache_reverse_chain() {
        let env = CacheEnv::new(1_000_000);
        let cache = env.new_cache();

        let a = stmt(b"a", 1);
        let b = stmt(b"b", 2);
        cache.add(&b, None, -1);
        cache.add(&a, Some(&b), -1);

        let mut iter = cache.iter(IteratorType::Le, UserKey::from(*b"z"), Lsn::MAX);
        let mut stop = false;
        iter.skip_to(None, &mut stop);
        assert_eq!(&*iter.curr().unwrap().key, b"b");

        let mut stop = false;
        iter.next_key(&mut stop);
        assert!(stop);
        assert_eq!(&*iter.curr().unwrap().key, b"a");
    }
}
