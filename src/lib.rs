// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A disk-based, write-optimized LSM-tree indexing core with MVCC read views.
//!
//! Each index is a [`Lsm`]: an active in-memory level, a list of sealed
//! in-memory levels, and a set of on-disk runs partitioned into key ranges,
//! each range holding a stack of run slices. Reads merge a transaction's
//! write set, a per-index tuple cache, the in-memory levels and the run
//! slices of one range into a single ordered stream under a read view.
//!
//! Writes are buffered in transactions and moved into the active in-memory
//! level on prepare. A background [`scheduler`](crate::scheduler) turns
//! sealed in-memory levels into runs (dump) and merges run slices of a range
//! into new runs (compaction), both driven through a write iterator that
//! resolves UPSERTs and drops shadowed versions per read view.
//!
//! ```
//! use vinyl::Config;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let env = Config::new(folder).open()?;
//! let lsm = env.create_lsm(512, 0)?;
//!
//! let tx = env.begin();
//! env.tx_replace(&tx, &lsm, "my_key", "my_value")?;
//! env.prepare(&tx)?;
//! env.commit(&tx)?;
//!
//! let item = env.get(&lsm, None, "my_key")?;
//! assert_eq!(Some("my_value".as_bytes().into()), item.map(|s| s.value));
//! #
//! # Ok::<(), vinyl::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod bytes;
mod cache;
mod coding;
mod config;
mod env;
mod error;

#[doc(hidden)]
pub mod fault;

mod heap;
mod ids;
mod iterator_type;
mod lsm;
mod mem;
mod pin;
mod point_lookup;
mod range;
mod read_iterator;
mod read_view;

#[doc(hidden)]
pub mod run;

pub mod scheduler;

mod stats;
mod stmt;
mod tx;
mod vylog;

#[doc(hidden)]
pub mod write_iterator;

/// Hash map that does not hash to improve performance
pub type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;

/// Hash set that does not hash to improve performance
pub type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

/// Monotonically growing identifier of an LSM tree (one per index).
pub type LsmId = i64;

/// Identifier of a key range of an LSM tree.
pub type RangeId = i64;

/// Identifier of an on-disk run.
pub type RunId = i64;

/// Identifier of a run slice.
pub type SliceId = i64;

/// Identifier of an in-memory level.
pub type MemId = i64;

/// Identifier of a transaction.
pub type TxId = u64;

/// Identifier of a space (a collection of indexes sharing tuples).
pub type SpaceId = u32;

/// Identifier of an index within a space. 0 is the primary index.
pub type IndexId = u32;

#[doc(hidden)]
pub use {
    mem::Mem,
    range::Range,
    run::{Run, RunSlice},
    vylog::LogRecord,
    write_iterator::{DeferredDeleteHandler, WriteIterator},
};

pub use {
    bytes::{Bytes, UserKey, UserValue},
    cache::CacheEnv,
    config::Config,
    env::Env,
    error::{Error, Result},
    iterator_type::IteratorType,
    lsm::Lsm,
    read_iterator::ReadIterator,
    read_view::ReadView,
    stmt::{Lsn, Statement, StmtKind, UpsertOp, UpsertOps, MAX_LSN, STMT_DEFERRED_DELETE},
    tx::{Tx, TxManager, TxState},
};
