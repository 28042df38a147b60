// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Run;
use crate::{pin::PinCount, SliceId, UserKey};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering::AcqRel},
    Arc,
};
use xxhash_rust::xxh3::xxh3_64;

/// A view on a half-open key sub-range `[begin, end)` of a run
///
/// Belongs to exactly one range of an LSM tree. Holds a reference to its
/// run; the run's live-slice count drops when the slice is retired, and a
/// run with no live slices left is unused and can be dropped.
///
/// A slice may be pinned by an iterator reading from disk independently of
/// ownership; retiring waits until the pin count drains.
pub struct RunSlice {
    pub(crate) id: SliceId,
    run: Arc<Run>,

    /// Lower bound, inclusive; `None` is -inf
    begin: Option<UserKey>,

    /// Upper bound, exclusive; `None` is +inf
    end: Option<UserKey>,

    /// Page span `[first_page, last_page]`, `None` when provably empty
    pages: Option<(u32, u32)>,

    row_count: u64,
    bytes: u64,

    /// Pseudo-random value fixed at creation; smears compaction priority
    /// across ranges so they do not all compact at once.
    pub(crate) seed: u32,

    pub(crate) pins: PinCount,
    retired: AtomicBool,
}

/// Number of live (attached, not retired) slices per run.
pub(crate) struct SliceCount(pub AtomicUsize);

impl RunSlice {
    #[must_use]
    pub fn new(
        id: SliceId,
        run: Arc<Run>,
        begin: Option<UserKey>,
        end: Option<UserKey>,
    ) -> Arc<Self> {
        let pages = Self::page_span(&run, begin.as_ref(), end.as_ref());

        let (row_count, bytes) = match pages {
            None => (0, 0),
            Some((first, last)) => {
                let span = run
                    .info()
                    .pages
                    .get(first as usize..=last as usize)
                    .unwrap_or(&[]);
                (
                    span.iter().map(|p| u64::from(p.row_count)).sum(),
                    span.iter().map(|p| u64::from(p.size)).sum(),
                )
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let seed = xxh3_64(&id.to_be_bytes()) as u32;

        run.live_slices.0.fetch_add(1, AcqRel);

        Arc::new(Self {
            id,
            run,
            begin,
            end,
            pages,
            row_count,
            bytes,
            seed,
            pins: PinCount::default(),
            retired: AtomicBool::new(false),
        })
    }

    /// Pages of the run that may hold keys of `[begin, end)`.
    fn page_span(run: &Run, begin: Option<&UserKey>, end: Option<&UserKey>) -> Option<(u32, u32)> {
        let pages = &run.info().pages;
        if pages.is_empty() {
            return None;
        }

        let first = match begin {
            None => 0,
            Some(begin) => pages
                .partition_point(|p| p.min_key <= *begin)
                .saturating_sub(1),
        };

        let last = match end {
            None => pages.len() - 1,
            Some(end) => {
                let idx = pages.partition_point(|p| p.min_key < *end);
                if idx == 0 {
                    return None;
                }
                idx - 1
            }
        };

        if first > last {
            return None;
        }

        #[allow(clippy::cast_possible_truncation)]
        Some((first as u32, last as u32))
    }

    #[must_use]
    pub fn id(&self) -> SliceId {
        self.id
    }

    #[must_use]
    pub fn run(&self) -> &Arc<Run> {
        &self.run
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
    pub fn page_range(&self) -> Option<(u32, u32)> {
        self.pages
    }

    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Estimated on-disk bytes covered by the slice.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_none()
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

    pub fn wait_pinned(&self) {
        self.pins.wait_unpinned();
    }

    /// Detaches the slice from its run's live set. Idempotent; readers still
    /// holding the slice keep the underlying run data alive until they are
    /// done, but the run no longer counts the slice as referencing it.
    pub fn retire(&self) {
        if !self.retired.swap(true, AcqRel) {
            self.run.live_slices.0.fetch_sub(1, AcqRel);
        }
    }

    /// Produces a new slice bounded by the intersection of this slice's
    /// bounds and `[lo, hi)`, or `None` if the intersection is empty.
    /// Does not touch the underlying run.
    #[must_use]
    pub fn cut(
        &self,
        id: SliceId,
        lo: Option<&UserKey>,
        hi: Option<&UserKey>,
    ) -> Option<Arc<Self>> {
        let begin = match (self.begin.as_ref(), lo) {
            (Some(a), Some(b)) => Some(a.max(b).clone()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        let end = match (self.end.as_ref(), hi) {
            (Some(a), Some(b)) => Some(a.min(b).clone()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        if let (Some(begin), Some(end)) = (&begin, &end) {
            if begin >= end {
                return None;
            }
        }

        Some(Self::new(id, self.run.clone(), begin, end))
    }
}

impl Drop for RunSlice {
    fn drop(&mut self) {
        self.retire();
    }
}

impl std::fmt::Debug for RunSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Slice#{}(run={}, {:?}..{:?})",
            self.id,
            self.run.id(),
            self.begin,
            self.end,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::run::{CompressionType, RunWriter};
    use crate::stmt::Statement;

    use test_log::test;

    fn test_run(dir: &std::path::Path, keys: std::ops::Range<u32>) -> Arc<Run> {
        let data = dir.join("9.run");
        let index = dir.join("9.index");

        let mut writer = RunWriter::new(
            9,
            data.clone(),
            index.clone(),
            CompressionType::None,
            64,
            None,
        )
        .unwrap();

        for i in keys {
            writer
                .push(&Statement::replace(i.to_be_bytes(), *b"v", i64::from(i) + 1))
                .unwrap();
        }

        let info = writer.finish(0, 1).unwrap().unwrap();
        Run::new(9, info, data, index)
    }

    fn key(i: u32) -> UserKey {
        UserKey::from(i.to_be_bytes())
    }

    #[test]
    fn slice_covers_whole_run() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 0..100);
        let slice = RunSlice::new(1, run.clone(), None, None);

        assert_eq!(100, slice.row_count());
        assert!(!slice.is_empty());
        assert_eq!(1, run.live_slice_count());
    }

    #[test]
    fn slice_bounded_span() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 0..100);

        let slice = RunSlice::new(1, run, Some(key(30)), Some(key(60)));
        assert!(!slice.is_empty());
        assert!(slice.row_count() < 100);
        assert!(slice.row_count() >= 30);
    }

    #[test]
    fn slice_cut_intersection() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 0..100);
        let slice = RunSlice::new(1, run, Some(key(10)), Some(key(90)));

        let cut = slice.cut(2, Some(&key(50)), None).unwrap();
        assert_eq!(Some(&key(50)), cut.begin());
        assert_eq!(Some(&key(90)), cut.end());

        // Empty intersection
        assert!(slice.cut(3, Some(&key(90)), Some(&key(95))).is_none());
    }

    #[test]
    fn slice_retire_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let run = test_run(dir.path(), 0..10);
        let slice = RunSlice::new(1, run.clone(), None, None);
        let other = RunSlice::new(2, run.clone(), None, None);

        assert_eq!(2, run.live_slice_count());
        slice.retire();
        slice.retire();
        assert_eq!(1, run.live_slice_count());

        drop(other);
        assert_eq!(0, run.live_slice_count());
    }
}
