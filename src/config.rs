// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{run::CompressionType, stmt::Statement};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Smallest adaptive range size (128 MiB).
pub const MIN_RANGE_SIZE: u64 = 128 * 1_024 * 1_024;

/// Largest adaptive range size (2 GiB).
pub const MAX_RANGE_SIZE: u64 = 2 * 1_024 * 1_024 * 1_024;

/// Callback invoked when a dump round completes and in-memory quota can be
/// released; receives the number of bytes freed.
pub type DumpQuotaCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Sink for deferred DELETEs produced by primary-index compaction; receives
/// `(old statement, overwriting statement)` pairs.
pub type DeferredDeleteSink = Arc<dyn Fn(&Statement, &Statement) + Send + Sync>;

/// Per-index shape options, derived from the environment configuration
#[derive(Clone, Debug)]
pub struct LsmOpts {
    /// Max runs per level of a range before compaction triggers
    pub run_count_per_level: usize,

    /// Size ratio between consecutive levels of a range
    pub run_size_ratio: f64,

    /// Target range size in bytes; 0 selects it adaptively
    pub range_size: u64,

    /// Run page size in bytes
    pub page_size: u32,

    /// Bloom filter false-positive rate; `None` disables the filter
    pub bloom_fpr: Option<f32>,

    /// Page compression codec
    pub compression: CompressionType,
}

impl Default for LsmOpts {
    fn default() -> Self {
        Self {
            run_count_per_level: 2,
            run_size_ratio: 3.5,
            range_size: 0,
            page_size: 8 * 1_024,
            bloom_fpr: Some(0.05),
            compression: CompressionType::Lz4,
        }
    }
}

/// Environment configuration builder
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// let env = vinyl::Config::new(folder)
///     .write_threads(4)
///     .cache_quota(64 * 1_024 * 1_024)
///     .open()?;
/// # Ok::<(), vinyl::Error>(())
/// ```
pub struct Config {
    /// Base directory holding run files and the metadata log
    pub(crate) path: PathBuf,

    /// Total writer threads, split 1/4 dump : 3/4 compaction
    pub(crate) write_threads: usize,

    pub(crate) lsm: LsmOpts,

    /// Byte quota of the common tuple cache
    pub(crate) cache_quota: u64,

    /// Byte quota of the shared decoded-page cache
    pub(crate) page_cache_quota: u64,

    /// Scheduler backoff bounds after a failed task
    pub(crate) timeout_min: Duration,
    pub(crate) timeout_max: Duration,

    /// Tasks running longer than this are logged
    pub(crate) too_long_threshold: Duration,

    pub(crate) dump_quota_cb: Option<DumpQuotaCallback>,

    pub(crate) deferred_delete_sink: Option<DeferredDeleteSink>,
}

impl Config {
    /// Creates a configuration rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            write_threads: 4,
            lsm: LsmOpts::default(),
            cache_quota: 128 * 1_024 * 1_024,
            page_cache_quota: 64 * 1_024 * 1_024,
            timeout_min: Duration::from_secs(1),
            timeout_max: Duration::from_secs(60),
            too_long_threshold: Duration::from_secs(60),
            dump_quota_cb: None,
            deferred_delete_sink: None,
        }
    }

    /// Sets the number of writer threads (at least 2: one dump worker, one
    /// compaction worker).
    #[must_use]
    pub fn write_threads(mut self, n: usize) -> Self {
        self.write_threads = n.max(2);
        self
    }

    /// Sets the target range size; 0 selects it adaptively between 128 MiB
    /// and 2 GiB.
    #[must_use]
    pub fn range_size(mut self, bytes: u64) -> Self {
        self.lsm.range_size = bytes;
        self
    }

    /// Sets the max number of runs per range level.
    #[must_use]
    pub fn run_count_per_level(mut self, n: usize) -> Self {
        self.lsm.run_count_per_level = n.max(1);
        self
    }

    /// Sets the size ratio between range levels.
    #[must_use]
    pub fn run_size_ratio(mut self, ratio: f64) -> Self {
        self.lsm.run_size_ratio = ratio.max(1.001);
        self
    }

    /// Sets the bloom filter false-positive rate; `None` disables filters.
    #[must_use]
    pub fn bloom_fpr(mut self, fpr: Option<f32>) -> Self {
        self.lsm.bloom_fpr = fpr;
        self
    }

    /// Sets the run page size.
    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.lsm.page_size = bytes.max(512);
        self
    }

    /// Sets the page compression codec.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.lsm.compression = compression;
        self
    }

    /// Sets the tuple cache quota in bytes.
    #[must_use]
    pub fn cache_quota(mut self, bytes: u64) -> Self {
        self.cache_quota = bytes;
        self
    }

    /// Sets the decoded-page cache quota in bytes.
    #[must_use]
    pub fn page_cache_quota(mut self, bytes: u64) -> Self {
        self.page_cache_quota = bytes;
        self
    }

    /// Sets the scheduler backoff bounds.
    #[must_use]
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.timeout_min = min;
        self.timeout_max = max.max(min);
        self
    }

    /// Sets the slow-task warning threshold.
    #[must_use]
    pub fn too_long_threshold(mut self, threshold: Duration) -> Self {
        self.too_long_threshold = threshold;
        self
    }

    /// Installs the dump-quota release callback.
    #[must_use]
    pub fn dump_quota_callback(mut self, cb: DumpQuotaCallback) -> Self {
        self.dump_quota_cb = Some(cb);
        self
    }

    /// Installs the deferred DELETE sink consumed by primary-index
    /// compaction.
    #[must_use]
    pub fn deferred_delete_sink(mut self, sink: DeferredDeleteSink) -> Self {
        self.deferred_delete_sink = Some(sink);
        self
    }

    /// Number of dump workers: a quarter of the writer threads, at least 1.
    #[must_use]
    pub fn dump_threads(&self) -> usize {
        (self.write_threads / 4).max(1)
    }

    /// Number of compaction workers: the remaining writer threads.
    #[must_use]
    pub fn compaction_threads(&self) -> usize {
        (self.write_threads - self.dump_threads()).max(1)
    }

    /// Opens (or recovers) an environment with this configuration.
    pub fn open(self) -> crate::Result<crate::Env> {
        crate::Env::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn thread_split() {
        let config = Config::new(".").write_threads(8);
        assert_eq!(2, config.dump_threads());
        assert_eq!(6, config.compaction_threads());

        let config = Config::new(".").write_threads(2);
        assert_eq!(1, config.dump_threads());
        assert_eq!(1, config.compaction_threads());
    }
}
