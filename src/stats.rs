// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Relaxed},
};

/// Logarithmic histogram with power-of-two buckets
///
/// Bucket `i` counts observations in `[2^i, 2^(i+1))`; bucket 0 also takes 0.
pub struct Histogram {
    buckets: [AtomicU64; 32],
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Histogram {
    pub fn observe(&self, value: u64) {
        let idx = (64 - value.leading_zeros() as usize).saturating_sub(1).min(31);

        #[allow(clippy::indexing_slicing)]
        self.buckets[idx].fetch_add(1, Relaxed);
    }

    pub fn unobserve(&self, value: u64) {
        let idx = (64 - value.leading_zeros() as usize).saturating_sub(1).min(31);

        #[allow(clippy::indexing_slicing)]
        self.buckets[idx].fetch_sub(1, Relaxed);
    }

    /// Smallest upper bucket bound that covers `quantile` of observations.
    #[must_use]
    pub fn percentile_bound(&self, quantile: f64) -> u64 {
        let counts: Vec<u64> = self.buckets.iter().map(|b| b.load(Acquire)).collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target = (total as f64 * quantile).ceil() as u64;

        let mut seen = 0;
        for (idx, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                return 1 << (idx + 1);
            }
        }
        u64::MAX
    }
}

/// Counters of one LSM tree, exposed for the scheduler and observability
#[derive(Default)]
pub struct LsmStats {
    /// Point lookups served
    pub lookups: AtomicU64,

    /// Range scans opened
    pub range_scans: AtomicU64,

    /// Statements written into the active in-memory level
    pub mem_writes: AtomicU64,

    /// Completed dumps
    pub dump_count: AtomicU64,

    /// Rows written by dumps
    pub dumped_rows: AtomicU64,

    /// Bytes written by dumps
    pub dumped_bytes: AtomicU64,

    /// Completed compactions
    pub compaction_count: AtomicU64,

    /// Rows read by compactions
    pub compaction_in_rows: AtomicU64,

    /// Rows written by compactions
    pub compaction_out_rows: AtomicU64,

    /// Distribution of slice counts across ranges
    pub slices_per_range: Histogram,

    /// UPSERTs squashed into the in-memory level on commit
    pub upsert_squashed: AtomicU64,

    /// UPSERTs applied on the read path
    pub upsert_applied: AtomicU64,
}

/// Counters of one tuple cache
#[derive(Default)]
pub struct CacheStats {
    pub puts: AtomicU64,

    pub hits: AtomicU64,

    pub misses: AtomicU64,

    /// Entries invalidated by writes
    pub invalidated: AtomicU64,

    /// Entries dropped by LRU eviction
    pub evicted: AtomicU64,
}

/// Counters of the transaction manager
#[derive(Default)]
pub struct TxStats {
    pub commits: AtomicU64,

    pub rollbacks: AtomicU64,

    pub conflicts: AtomicU64,

    /// Read-only transactions demoted to a historical read view
    pub read_view_demotions: AtomicU64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn histogram_percentile() {
        let h = Histogram::default();
        for _ in 0..90 {
            h.observe(1);
        }
        for _ in 0..10 {
            h.observe(100);
        }

        assert_eq!(2, h.percentile_bound(0.5));
        assert!(h.percentile_bound(0.99) >= 128);
    }

    #[test]
    fn histogram_unobserve() {
        let h = Histogram::default();
        h.observe(5);
        h.observe(5);
        h.unobserve(5);
        assert_eq!(8, h.percentile_bound(1.0));
    }

    #[test]
    fn histogram_empty() {
        let h = Histogram::default();
        assert_eq!(0, h.percentile_bound(0.5));
    }
}
