// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Declared fault-injection points
//!
//! Tests arm a point; the next time the code path passes it, the point
//! disarms itself and the operation fails with [`Error::Injected`]. Used to
//! exercise rollback and retry paths without touching production logic.

use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering::AcqRel, Ordering::Release};

/// Injection points known to the core.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Fails a dump task during execution
    MemDump,

    /// Fails a compaction task during execution
    CompactionExecute,

    /// Fails the run writer on the next row
    RunWrite,

    /// Forces the scheduler into its error backoff
    SchedTimeout,

    /// Fails the write iterator while merging a read view
    ReadViewMerge,
}

const FAULT_COUNT: usize = 5;

static ARMED: [AtomicBool; FAULT_COUNT] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

fn slot(fault: Fault) -> &'static AtomicBool {
    let idx = match fault {
        Fault::MemDump => 0,
        Fault::CompactionExecute => 1,
        Fault::RunWrite => 2,
        Fault::SchedTimeout => 3,
        Fault::ReadViewMerge => 4,
    };

    #[allow(clippy::indexing_slicing)]
    &ARMED[idx]
}

/// Arms an injection point. The next [`check`] fires and disarms it.
pub fn arm(fault: Fault) {
    slot(fault).store(true, Release);
}

/// Returns an error if the point is armed, disarming it.
pub fn check(fault: Fault) -> crate::Result<()> {
    if slot(fault).swap(false, AcqRel) {
        log::info!("firing injected fault {fault:?}");
        return Err(Error::Injected(match fault {
            Fault::MemDump => "mem-dump",
            Fault::CompactionExecute => "compaction-execute",
            Fault::RunWrite => "run-write",
            Fault::SchedTimeout => "sched-timeout",
            Fault::ReadViewMerge => "read-view-merge",
        }));
    }
    Ok(())
}
