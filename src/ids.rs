// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicI64, Ordering::AcqRel};

/// Monotonic id sources of one environment
///
/// Recovery seeds them past the highest id seen in the metadata log.
#[derive(Default)]
pub(crate) struct Ids {
    lsm: AtomicI64,
    mem: AtomicI64,
    range: AtomicI64,
    run: AtomicI64,
    slice: AtomicI64,
}

impl Ids {
    pub fn next_lsm(&self) -> i64 {
        self.lsm.fetch_add(1, AcqRel) + 1
    }

    pub fn next_mem(&self) -> i64 {
        self.mem.fetch_add(1, AcqRel) + 1
    }

    pub fn next_range(&self) -> i64 {
        self.range.fetch_add(1, AcqRel) + 1
    }

    pub fn next_run(&self) -> i64 {
        self.run.fetch_add(1, AcqRel) + 1
    }

    pub fn next_slice(&self) -> i64 {
        self.slice.fetch_add(1, AcqRel) + 1
    }

    /// Fast-forwards all sources past ids observed during recovery.
    pub fn observe(&self, lsm: i64, range: i64, run: i64, slice: i64) {
        self.lsm.fetch_max(lsm, AcqRel);
        self.range.fetch_max(range, AcqRel);
        self.run.fetch_max(run, AcqRel);
        self.slice.fetch_max(slice, AcqRel);
    }
}
