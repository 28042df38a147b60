// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Page;
use crate::RunId;
use quick_cache::{sync::Cache as QuickCache, Weighter};
use std::sync::Arc;

#[derive(Clone)]
struct PageWeighter;

impl Weighter<(RunId, u32), Arc<Page>> for PageWeighter {
    fn weight(&self, _: &(RunId, u32), page: &Arc<Page>) -> u64 {
        page.weight()
    }
}

/// Shared cache of decoded run pages, keyed by `(run id, page number)`
///
/// Run iterators additionally keep their two most recently touched pages
/// pinned locally; this cache serves re-reads across iterators.
pub struct PageCache {
    data: QuickCache<(RunId, u32), Arc<Page>, PageWeighter, rustc_hash::FxBuildHasher>,
    capacity: u64,
}

impl PageCache {
    /// Creates a page cache with roughly `bytes` of capacity.
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        // NOTE: Nothing we can do if it fails
        #[allow(clippy::expect_used)]
        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let data = QuickCache::with_options(
            opts,
            PageWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data,
            capacity: bytes,
        }
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    /// Returns the cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn get(&self, run_id: RunId, page_no: u32) -> Option<Arc<Page>> {
        self.data.get(&(run_id, page_no))
    }

    pub fn insert(&self, run_id: RunId, page_no: u32, page: Arc<Page>) {
        self.data.insert((run_id, page_no), page);
    }

    /// Drops all pages of a run, called when its files are removed.
    pub fn remove_run(&self, run_id: RunId, page_count: u32) {
        for page_no in 0..page_count {
            self.data.remove(&(run_id, page_no));
        }
    }
}
