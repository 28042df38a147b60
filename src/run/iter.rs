// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Page, PageCache, RunSlice};
use crate::{
    stmt::{Lsn, Statement},
    IteratorType, UserKey,
};
use std::sync::Arc;

/// Reads pages of one slice, keeping the two most recently touched pages
/// decoded locally and optionally going through the shared page cache.
struct PageReader {
    slice: Arc<RunSlice>,
    cache: Option<Arc<PageCache>>,
    recent: [Option<(u32, Arc<Page>)>; 2],
}

impl PageReader {
    fn new(slice: Arc<RunSlice>, cache: Option<Arc<PageCache>>) -> Self {
        Self {
            slice,
            cache,
            recent: [None, None],
        }
    }

    fn page(&mut self, page_no: u32) -> crate::Result<Arc<Page>> {
        for slot in &self.recent {
            if let Some((no, page)) = slot {
                if *no == page_no {
                    return Ok(page.clone());
                }
            }
        }

        let run = self.slice.run();

        let page = if let Some(cache) = &self.cache {
            if let Some(page) = cache.get(run.id(), page_no) {
                page
            } else {
                let page = Arc::new(run.read_page(page_no)?);
                cache.insert(run.id(), page_no, page.clone());
                page
            }
        } else {
            Arc::new(run.read_page(page_no)?)
        };

        self.recent.swap(0, 1);
        self.recent[0] = Some((page_no, page.clone()));
        Ok(page)
    }

    fn rows_in(&self, page_no: u32) -> u32 {
        self.slice
            .run()
            .page_info(page_no)
            .map_or(0, |p| p.row_count)
    }

    fn span(&self) -> Option<(u32, u32)> {
        self.slice.page_range()
    }

    fn next_pos(&self, (page_no, row_no): (u32, u32)) -> Option<(u32, u32)> {
        let (_, last) = self.span()?;
        if row_no + 1 < self.rows_in(page_no) {
            return Some((page_no, row_no + 1));
        }
        if page_no < last {
            return Some((page_no + 1, 0));
        }
        None
    }

    fn prev_pos(&self, (page_no, row_no): (u32, u32)) -> Option<(u32, u32)> {
        let (first, _) = self.span()?;
        if row_no > 0 {
            return Some((page_no, row_no - 1));
        }
        if page_no > first {
            let prev = page_no - 1;
            return Some((prev, self.rows_in(prev).saturating_sub(1)));
        }
        None
    }

    fn row(&mut self, (page_no, row_no): (u32, u32)) -> crate::Result<Statement> {
        self.page(page_no)?.row(row_no)
    }

    fn last_pos(&self) -> Option<(u32, u32)> {
        let (_, last) = self.span()?;
        Some((last, self.rows_in(last).saturating_sub(1)))
    }

    /// First row with `key >= bound` (or `> bound` when strict), scanning the
    /// page min-key array first, then binary-searching within the page.
    fn search_first_ge(
        &mut self,
        bound: &[u8],
        strict: bool,
    ) -> crate::Result<Option<(u32, u32)>> {
        let Some((first, last)) = self.span() else {
            return Ok(None);
        };

        let pages = &self.slice.run().info().pages;

        #[allow(clippy::indexing_slicing)]
        let in_span = &pages[first as usize..=last as usize];

        // Last page whose min key is <= bound may hold the first match;
        // everything after starts beyond the bound.
        let rel = in_span
            .partition_point(|p| *p.min_key <= *bound)
            .saturating_sub(1);

        #[allow(clippy::cast_possible_truncation)]
        let page_no = first + rel as u32;

        let page = self.page(page_no)?;

        let mut lo = 0u32;
        let mut hi = page.row_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let key = page.row_key(mid)?;
            let before = if strict {
                *key <= *bound
            } else {
                *key < *bound
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo < page.row_count() {
            return Ok(Some((page_no, lo)));
        }

        // Ran off the page; the next page's first row is the answer.
        if page_no < last {
            return Ok(Some((page_no + 1, 0)));
        }
        Ok(None)
    }

    /// Last row with `key <= bound` (`< bound` when not inclusive).
    fn search_last_le(
        &mut self,
        bound: &[u8],
        inclusive: bool,
    ) -> crate::Result<Option<(u32, u32)>> {
        match self.search_first_ge(bound, inclusive)? {
            Some(pos) => Ok(self.prev_pos(pos)),
            None => Ok(self.last_pos()),
        }
    }
}

/// Merge-source iterator over one run slice
///
/// Yields, per key in the direction of the iterator type, the newest version
/// visible under the read view, bounded by the slice. Page reads hit the
/// disk; the caller pins the slice around any step that may do so.
pub struct RunIterator {
    reader: PageReader,
    itype: IteratorType,
    key: UserKey,
    vlsn: Lsn,
    curr: Option<Statement>,
    pos: Option<(u32, u32)>,
    bloom_miss: bool,
}

impl RunIterator {
    #[must_use]
    pub fn new(
        slice: Arc<RunSlice>,
        cache: Arc<PageCache>,
        itype: IteratorType,
        key: UserKey,
        vlsn: Lsn,
    ) -> Self {
        let itype = if key.is_empty() {
            itype.for_empty_key()
        } else {
            itype.normalize()
        };

        // A full-key equality lookup can skip the disk entirely if the
        // bloom filter rules the key out.
        let bloom_miss = itype == IteratorType::Eq
            && slice
                .run()
                .info()
                .bloom
                .as_ref()
                .is_some_and(|bloom| !bloom.contains(&key));

        Self {
            reader: PageReader::new(slice, Some(cache)),
            itype,
            key,
            vlsn,
            curr: None,
            pos: None,
            bloom_miss,
        }
    }

    #[must_use]
    pub fn curr(&self) -> Option<&Statement> {
        self.curr.as_ref()
    }

    #[must_use]
    pub fn slice(&self) -> &Arc<RunSlice> {
        &self.reader.slice
    }

    fn reverse(&self) -> bool {
        self.itype.is_reverse()
    }

    /// Walks forward to the first visible row, which in `(key asc, lsn
    /// desc)` order is the newest visible version of the first qualifying
    /// key. Stops at the slice's end bound.
    fn settle_forward(&mut self, mut pos: (u32, u32)) -> crate::Result<()> {
        loop {
            let stmt = self.reader.row(pos)?;

            if let Some(end) = self.reader.slice.end() {
                if stmt.key >= *end {
                    self.curr = None;
                    self.pos = None;
                    return Ok(());
                }
            }

            if stmt.lsn <= self.vlsn {
                self.curr = Some(stmt);
                self.pos = Some(pos);
                return Ok(());
            }

            match self.reader.next_pos(pos) {
                Some(next) => pos = next,
                None => {
                    self.curr = None;
                    self.pos = None;
                    return Ok(());
                }
            }
        }
    }

    /// Positions at the newest visible version of the key at `pos`, walking
    /// to preceding keys while the current one is entirely invisible. Stops
    /// at the slice's begin bound.
    fn settle_backward(&mut self, mut pos: (u32, u32)) -> crate::Result<()> {
        loop {
            let anchor = self.reader.row(pos)?;

            if let Some(begin) = self.reader.slice.begin() {
                if anchor.key < *begin {
                    self.curr = None;
                    self.pos = None;
                    return Ok(());
                }
            }

            // First row of the anchor's key: its newest stored version.
            let Some(mut head) = self.reader.search_first_ge(&anchor.key, false)? else {
                self.curr = None;
                self.pos = None;
                return Ok(());
            };

            loop {
                let stmt = self.reader.row(head)?;
                if stmt.key != anchor.key {
                    break;
                }
                if stmt.lsn <= self.vlsn {
                    self.curr = Some(stmt);
                    self.pos = Some(head);
                    return Ok(());
                }
                match self.reader.next_pos(head) {
                    Some(next) => head = next,
                    None => break,
                }
            }

            // Entire key invisible; step to the preceding key.
            let Some(first_of_key) = self.reader.search_first_ge(&anchor.key, false)? else {
                break;
            };
            match self.reader.prev_pos(first_of_key) {
                Some(prev) => pos = prev,
                None => break,
            }
        }

        self.curr = None;
        self.pos = None;
        Ok(())
    }

    /// Positions at the first key beyond `last` in scan order (or at the
    /// start when `last` is none).
    pub fn skip_to(&mut self, last: Option<&Statement>) -> crate::Result<()> {
        self.curr = None;
        self.pos = None;

        if self.bloom_miss || self.reader.span().is_none() {
            return Ok(());
        }

        if self.reverse() {
            // Upper bound: strictly before `last`, otherwise the search key
            // (inclusive for LE, exclusive for LT), clamped by slice end.
            let (bound, inclusive) = match last {
                Some(last) => (last.key.clone(), false),
                None if self.key.is_empty() => match self.reader.slice.end() {
                    Some(end) => (end.clone(), false),
                    None => {
                        if let Some(pos) = self.reader.last_pos() {
                            return self.settle_backward(pos);
                        }
                        return Ok(());
                    }
                },
                None => (self.key.clone(), self.itype != IteratorType::Lt),
            };

            let (bound, inclusive) = match self.reader.slice.end() {
                Some(end) if *end <= bound => (end.clone(), false),
                _ => (bound, inclusive),
            };

            match self.reader.search_last_le(&bound, inclusive)? {
                Some(pos) => self.settle_backward(pos),
                None => Ok(()),
            }
        } else {
            let (bound, strict) = match last {
                Some(last) => (last.key.clone(), true),
                None if self.key.is_empty() => match self.reader.slice.begin() {
                    Some(begin) => (begin.clone(), false),
                    None => return self.settle_forward((self.reader.span().map_or(0, |s| s.0), 0)),
                },
                None => (self.key.clone(), self.itype == IteratorType::Gt),
            };

            // Clamp by slice begin (inclusive).
            let (bound, strict) = match self.reader.slice.begin() {
                Some(begin) if *begin > bound => (begin.clone(), false),
                _ => (bound, strict),
            };

            match self.reader.search_first_ge(&bound, strict)? {
                Some(pos) => self.settle_forward(pos),
                None => Ok(()),
            }
        }
    }

    /// Advances to the next distinct key.
    pub fn next_key(&mut self) -> crate::Result<()> {
        let Some(curr) = self.curr.take() else {
            return Ok(());
        };
        self.skip_to(Some(&curr))
    }

    /// Advances to the next older visible version of the current key.
    pub fn next_lsn(&mut self) -> crate::Result<()> {
        let (Some(curr), Some(pos)) = (self.curr.take(), self.pos.take()) else {
            return Ok(());
        };

        if let Some(next) = self.reader.next_pos(pos) {
            let stmt = self.reader.row(next)?;
            if stmt.key == curr.key {
                debug_assert!(stmt.lsn < curr.lsn);
                self.curr = Some(stmt);
                self.pos = Some(next);
            }
        }
        Ok(())
    }
}

/// Linear statement stream over a slice, oldest key first, all versions
///
/// Input of the write iterator. Bypasses the shared page cache: compaction
/// touches every page exactly once.
pub struct SliceStream {
    reader: PageReader,
    pos: Option<(u32, u32)>,
    started: bool,
}

impl SliceStream {
    #[must_use]
    pub fn new(slice: Arc<RunSlice>) -> Self {
        Self {
            reader: PageReader::new(slice, None),
            pos: None,
            started: false,
        }
    }

    /// Next statement, or `None` past the slice's end.
    pub fn next(&mut self) -> crate::Result<Option<Statement>> {
        let pos = if self.started {
            match self.pos {
                Some(pos) => self.reader.next_pos(pos),
                None => None,
            }
        } else {
            self.started = true;
            match self.reader.slice.begin().cloned() {
                Some(begin) => self.reader.search_first_ge(&begin, false)?,
                None => self.reader.span().map(|(first, _)| (first, 0)),
            }
        };

        self.pos = pos;

        let Some(pos) = pos else {
            return Ok(None);
        };

        let stmt = self.reader.row(pos)?;

        if let Some(end) = self.reader.slice.end() {
            if stmt.key >= *end {
                self.pos = None;
                return Ok(None);
            }
        }

        Ok(Some(stmt))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::run::{CompressionType, Run, RunWriter};
    use crate::stmt::StmtKind;
    use test_log::test;

    fn key(i: u32) -> UserKey {
        UserKey::from(i.to_be_bytes())
    }

    /// Keys 0, 2, 4, ..., 2n with two versions each (lsn 10+i and 1+i).
    fn test_run(dir: &std::path::Path, n: u32) -> Arc<Run> {
        let data = dir.join("7.run");
        let index = dir.join("7.index");

        let mut writer = RunWriter::new(
            7,
            data.clone(),
            index.clone(),
            CompressionType::Lz4,
            128,
            Some(0.01),
        )
        .unwrap();

        for i in 0..n {
            let k = key(i * 2);
            writer
                .push(&Statement::replace(&*k, *b"new", i64::from(100 + i)))
                .unwrap();
            writer
                .push(&Statement::replace(&*k, *b"old", i64::from(1 + i)))
                .unwrap();
        }

        let info = writer.finish(0, 1).unwrap().unwrap();
        Run::new(7, info, data, index)
    }

    fn cache() -> Arc<PageCache> {
        Arc::new(PageCache::with_capacity_bytes(1_000_000))
    }

    #[test]
    fn run_iterator_ge() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 50);
        let slice = RunSlice::new(1, run, None, None);

        let mut iter = RunIterator::new(slice, cache(), IteratorType::Ge, key(10), Lsn::MAX);
        iter.skip_to(None).unwrap();

        // Newest version of key 10
        let stmt = iter.curr().unwrap();
        assert_eq!(key(10), stmt.key);
        assert_eq!(&*stmt.value, b"new");

        iter.next_key().unwrap();
        assert_eq!(key(12), iter.curr().unwrap().key);
    }

    #[test]
    fn run_iterator_le_scans_backward() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 50);
        let slice = RunSlice::new(1, run, None, None);

        let mut iter = RunIterator::new(slice, cache(), IteratorType::Le, key(11), Lsn::MAX);
        iter.skip_to(None).unwrap();

        // 11 does not exist; the last key <= 11 is 10.
        assert_eq!(key(10), iter.curr().unwrap().key);
        iter.next_key().unwrap();
        assert_eq!(key(8), iter.curr().unwrap().key);
    }

    #[test]
    fn run_iterator_respects_vlsn() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 10);
        let slice = RunSlice::new(1, run, None, None);

        // At vlsn 5, only the old versions of the first few keys exist.
        let mut iter = RunIterator::new(slice, cache(), IteratorType::Ge, UserKey::empty(), 5);
        iter.skip_to(None).unwrap();

        let stmt = iter.curr().unwrap();
        assert_eq!(key(0), stmt.key);
        assert_eq!(&*stmt.value, b"old");
    }

    #[test]
    fn run_iterator_next_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 10);
        let slice = RunSlice::new(1, run, None, None);

        let mut iter = RunIterator::new(slice, cache(), IteratorType::Eq, key(4), Lsn::MAX);
        iter.skip_to(None).unwrap();
        assert_eq!(&*iter.curr().unwrap().value, b"new");

        iter.next_lsn().unwrap();
        assert_eq!(&*iter.curr().unwrap().value, b"old");

        iter.next_lsn().unwrap();
        assert!(iter.curr().is_none());
    }

    #[test]
    fn run_iterator_bloom_miss() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 50);
        let slice = RunSlice::new(1, run, None, None);

        // Odd keys were never written.
        let mut iter = RunIterator::new(slice, cache(), IteratorType::Eq, key(11), Lsn::MAX);
        iter.skip_to(None).unwrap();
        assert!(iter.curr().is_none());
    }

    #[test]
    fn run_iterator_slice_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 50);
        let slice = RunSlice::new(1, run, Some(key(10)), Some(key(20)));

        let mut iter = RunIterator::new(
            slice,
            cache(),
            IteratorType::Ge,
            UserKey::empty(),
            Lsn::MAX,
        );
        iter.skip_to(None).unwrap();

        let mut seen = vec![];
        while let Some(stmt) = iter.curr().cloned() {
            seen.push(stmt.key.clone());
            iter.next_key().unwrap();
        }

        assert_eq!(vec![key(10), key(12), key(14), key(16), key(18)], seen);
    }

    #[test]
    fn slice_stream_yields_all_versions() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 5);
        let slice = RunSlice::new(1, run, None, None);

        let mut stream = SliceStream::new(slice);
        let mut count = 0;
        let mut kinds = vec![];
        while let Some(stmt) = stream.next().unwrap() {
            count += 1;
            kinds.push(stmt.kind);
        }

        assert_eq!(10, count);
        assert!(kinds.iter().all(|k| *k == StmtKind::Replace));
    }
}
