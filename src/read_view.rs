// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::stmt::Lsn;
use std::sync::{
    atomic::{AtomicI64, Ordering::Acquire, Ordering::Release},
    Arc,
};

/// MVCC visibility cap
///
/// A statement is visible under a read view iff `lsn <= vlsn`. The global
/// read view has `vlsn = i64::MAX` and represents the latest state including
/// prepared-but-uncommitted writes of other transactions.
///
/// Read views are shared through `Arc`; a view created for a prepared psn
/// carries `MAX_LSN + psn` until the writer commits and fixes it to the
/// final commit LSN. Liveness is the strong count - the transaction manager
/// prunes views nobody references anymore.
#[derive(Debug)]
pub struct ReadView {
    vlsn: AtomicI64,
}

impl ReadView {
    /// Creates a read view capped at `vlsn`.
    #[must_use]
    pub fn new(vlsn: Lsn) -> Arc<Self> {
        Arc::new(Self {
            vlsn: AtomicI64::new(vlsn),
        })
    }

    /// The visibility cap.
    #[must_use]
    pub fn vlsn(&self) -> Lsn {
        self.vlsn.load(Acquire)
    }

    /// Returns `true` if this view sees the latest state.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.vlsn() == Lsn::MAX
    }

    /// Returns `true` if `lsn` is visible under this view.
    #[must_use]
    pub fn sees(&self, lsn: Lsn) -> bool {
        lsn <= self.vlsn()
    }

    /// Pins the view to its final position once the writer that demoted
    /// readers onto it commits.
    pub(crate) fn set_vlsn(&self, vlsn: Lsn) {
        self.vlsn.store(vlsn, Release);
    }
}
