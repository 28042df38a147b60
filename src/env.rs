// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::CacheEnv,
    config::Config,
    ids::Ids,
    lsm::Lsm,
    range::Range,
    read_iterator::ReadIterator,
    run::{PageCache, Run, RunSlice},
    scheduler::Scheduler,
    stmt::{Statement, UpsertOps},
    tx::{Tx, TxManager},
    vylog::{LogRecord, Recovery, RunState, VyLog},
    Bytes, HashMap, IndexId, IteratorType, LsmId, SpaceId, UserKey, UserValue,
};
use std::sync::{atomic::AtomicU64, Arc, Mutex};

/// The storage environment
///
/// Owns the metadata log, the transaction manager, the caches, the id
/// sources, the scheduler and every live LSM tree. Opening an environment
/// replays the metadata log and rebuilds the trees exactly as they were.
pub struct Env {
    config: Arc<Config>,
    vylog: Arc<VyLog>,
    xm: Arc<TxManager>,
    cache_env: Arc<CacheEnv>,
    page_cache: Arc<PageCache>,
    scheduler: Scheduler,
    ids: Arc<Ids>,
    generation: Arc<AtomicU64>,
    lsms: Mutex<HashMap<LsmId, Arc<Lsm>>>,

    /// Serializes metadata transitions with checkpoint log rotation.
    meta_lock: Arc<Mutex<()>>,
}

impl Env {
    /// Opens (or recovers) the environment.
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.path)?;

        let vylog = Arc::new(VyLog::open(&config.path)?);
        let xm = TxManager::new();
        let cache_env = CacheEnv::new(config.cache_quota);
        let page_cache = Arc::new(PageCache::with_capacity_bytes(config.page_cache_quota));
        let ids = Arc::new(Ids::default());
        let generation = Arc::new(AtomicU64::new(1));
        let meta_lock = Arc::new(Mutex::new(()));

        let scheduler = Scheduler::start(
            config.clone(),
            vylog.clone(),
            xm.clone(),
            ids.clone(),
            page_cache.clone(),
            generation.clone(),
            meta_lock.clone(),
        );

        let env = Self {
            config,
            vylog,
            xm,
            cache_env,
            page_cache,
            scheduler,
            ids,
            generation,
            lsms: Mutex::new(HashMap::default()),
            meta_lock,
        };

        env.recover()?;
        Ok(env)
    }

    /// Rebuilds every LSM tree from the metadata log.
    #[allow(clippy::expect_used, clippy::too_many_lines)]
    fn recover(&self) -> crate::Result<()> {
        let records = VyLog::replay(&self.config.path)?;
        if records.is_empty() {
            return Ok(());
        }

        let recovery = Recovery::from_records(records)?;
        self.ids.observe(
            recovery.max_lsm_id,
            recovery.max_range_id,
            recovery.max_run_id,
            recovery.max_slice_id,
        );

        let mut max_dump_lsn = -1;

        for record in recovery.lsms.values() {
            if record.create_lsn.is_none() || record.drop_lsn.is_some() {
                // Unfinished or dropped tree: only its files need cleaning.
                for (run_id, _) in &record.runs {
                    self.discard_run_files(record.space_id, record.index_id, *run_id);
                }
                continue;
            }

            Recovery::validate_lsm(record)?;

            let lsm = Lsm::new(
                record.lsm_id,
                record.space_id,
                record.index_id,
                self.config.lsm.clone(),
                &self.cache_env,
                self.ids.clone(),
                self.generation.clone(),
            );

            // Load created runs, clean up everything else.
            let mut runs: HashMap<crate::RunId, Arc<Run>> = HashMap::default();
            for (run_id, state) in &record.runs {
                match state {
                    RunState::Created { .. } => {
                        let run = Run::open(
                            &self.config.path,
                            record.space_id,
                            record.index_id,
                            *run_id,
                        )?;
                        runs.insert(*run_id, run);
                    }
                    RunState::Prepared | RunState::Dropped { .. } => {
                        self.discard_run_files(record.space_id, record.index_id, *run_id);
                    }
                }
            }

            for range_record in record.ranges.values() {
                let range = Range::new(
                    range_record.range_id,
                    range_record.begin.clone(),
                    range_record.end.clone(),
                );

                // The stack is the reverse of log order: the newest slice
                // was inserted last.
                {
                    let mut inner = range.lock();
                    for slice_record in range_record.slices.iter().rev() {
                        let run = runs.get(&slice_record.run_id).ok_or_else(|| {
                            crate::Error::InvalidMetaLog(format!(
                                "slice {} references unloaded run {}",
                                slice_record.slice_id, slice_record.run_id
                            ))
                        })?;
                        inner.slices.push(RunSlice::new(
                            slice_record.slice_id,
                            run.clone(),
                            slice_record.begin.clone(),
                            slice_record.end.clone(),
                        ));
                    }
                }

                range.update_dumps_per_compaction();
                range.update_compaction_priority(&self.config.lsm);
                lsm.add_range(range);
            }

            // Runs only the recovery context still references are unused.
            for (run_id, run) in &runs {
                if run.live_slice_count() == 0 {
                    log::info!("dropping unreferenced run {run_id} of lsm {}", record.lsm_id);
                    self.vylog.append(LogRecord::DropRun {
                        run_id: *run_id,
                        gc_lsn: 0,
                    })?;
                    run.remove_files()?;
                } else {
                    lsm.add_run(run.clone());
                }
            }

            lsm.set_dump_lsn(record.dump_lsn);
            max_dump_lsn = max_dump_lsn.max(record.dump_lsn);

            log::info!(
                "recovered lsm {} ({}/{}): {} ranges, {} runs",
                record.lsm_id,
                record.space_id,
                record.index_id,
                lsm.range_count(),
                lsm.run_count(),
            );

            self.scheduler.add_lsm(&lsm);
            self.lsms
                .lock()
                .expect("lock is poisoned")
                .insert(record.lsm_id, lsm);
        }

        if max_dump_lsn >= 0 {
            self.xm.recover_lsn(max_dump_lsn);
        }

        Ok(())
    }

    fn discard_run_files(&self, space_id: SpaceId, index_id: IndexId, run_id: crate::RunId) {
        for path in [
            Run::data_path(&self.config.path, space_id, index_id, run_id),
            Run::index_path(&self.config.path, space_id, index_id, run_id),
        ] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove {}: {e}", path.display());
                }
            }
        }
    }

    /// Creates a new LSM tree for `(space_id, index_id)`. Index 0 is the
    /// primary index of its space.
    #[allow(clippy::expect_used)]
    pub fn create_lsm(&self, space_id: SpaceId, index_id: IndexId) -> crate::Result<Arc<Lsm>> {
        let lsm = Lsm::new(
            self.ids.next_lsm(),
            space_id,
            index_id,
            self.config.lsm.clone(),
            &self.cache_env,
            self.ids.clone(),
            self.generation.clone(),
        );

        let range = Range::new(self.ids.next_range(), None, None);

        self.vylog.commit(vec![
            LogRecord::PrepareLsm {
                lsm_id: lsm.id(),
                space_id,
                index_id,
                group_id: 0,
                key_def: Bytes::empty(),
            },
            LogRecord::CreateLsm {
                lsm_id: lsm.id(),
                space_id,
                index_id,
                create_lsn: self.xm.lsn(),
            },
            LogRecord::InsertRange {
                lsm_id: lsm.id(),
                range_id: range.id(),
                begin: None,
                end: None,
            },
        ])?;

        lsm.add_range(range);

        self.lsms
            .lock()
            .expect("lock is poisoned")
            .insert(lsm.id(), lsm.clone());
        self.scheduler.add_lsm(&lsm);

        log::info!("created lsm {} ({space_id}/{index_id})", lsm.id());
        Ok(lsm)
    }

    /// Drops an LSM tree. In-flight tasks discard their results; files are
    /// garbage collected on the next restart.
    #[allow(clippy::expect_used)]
    pub fn drop_lsm(&self, lsm: &Arc<Lsm>) -> crate::Result<()> {
        lsm.is_dropped
            .store(true, std::sync::atomic::Ordering::Release);

        self.vylog.append(LogRecord::DropLsm {
            lsm_id: lsm.id(),
            drop_lsn: self.xm.lsn(),
        })?;

        self.scheduler.remove_lsm(lsm);
        self.xm.forget_lsm(lsm.id());
        self.lsms
            .lock()
            .expect("lock is poisoned")
            .remove(&lsm.id());

        log::info!("dropped lsm {}", lsm.id());
        Ok(())
    }

    /// Looks up a live LSM tree by identity.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn lsm(&self, space_id: SpaceId, index_id: IndexId) -> Option<Arc<Lsm>> {
        self.lsms
            .lock()
            .expect("lock is poisoned")
            .values()
            .find(|lsm| lsm.space_id() == space_id && lsm.index_id() == index_id)
            .cloned()
    }

    /// The transaction manager.
    #[must_use]
    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.xm
    }

    // --- Transactions -------------------------------------------------

    /// Opens a transaction at the latest state.
    #[must_use]
    pub fn begin(&self) -> Arc<Tx> {
        self.xm.begin()
    }

    /// Buffers an INSERT (the key must not exist).
    pub fn tx_insert<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        tx: &Arc<Tx>,
        lsm: &Arc<Lsm>,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        self.xm.set(tx, lsm, Statement::insert(key, value, 0))
    }

    /// Buffers a REPLACE.
    pub fn tx_replace<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        tx: &Arc<Tx>,
        lsm: &Arc<Lsm>,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        self.xm.set(tx, lsm, Statement::replace(key, value, 0))
    }

    /// Buffers a DELETE.
    pub fn tx_delete<K: Into<UserKey>>(
        &self,
        tx: &Arc<Tx>,
        lsm: &Arc<Lsm>,
        key: K,
    ) -> crate::Result<()> {
        self.xm.set(tx, lsm, Statement::delete(key, 0))
    }

    /// Buffers an UPSERT.
    pub fn tx_upsert<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        tx: &Arc<Tx>,
        lsm: &Arc<Lsm>,
        key: K,
        value: V,
        ops: UpsertOps,
    ) -> crate::Result<()> {
        self.xm.set(tx, lsm, Statement::upsert(key, value, ops, 0))
    }

    /// Prepares a transaction, making its writes visible to latest-state
    /// readers under a provisional LSN.
    pub fn prepare(&self, tx: &Arc<Tx>) -> crate::Result<()> {
        self.xm.prepare(tx)
    }

    /// Commits a prepared transaction.
    pub fn commit(&self, tx: &Arc<Tx>) -> crate::Result<()> {
        self.xm.commit(tx, None)
    }

    /// Rolls a transaction back.
    pub fn rollback(&self, tx: &Arc<Tx>) {
        self.xm.rollback(tx);
    }

    // --- Reads --------------------------------------------------------

    /// Point lookup of a full key under the transaction's read view (or the
    /// latest state without a transaction).
    pub fn get<K: Into<UserKey>>(
        &self,
        lsm: &Arc<Lsm>,
        tx: Option<&Arc<Tx>>,
        key: K,
    ) -> crate::Result<Option<Statement>> {
        let rv = tx.map_or_else(|| self.xm.global_read_view(), |tx| tx.read_view());
        crate::point_lookup::point_lookup(lsm, &self.xm, tx, &rv, &self.page_cache, &key.into())
    }

    /// Opens an ordered scan.
    pub fn iterator<K: Into<UserKey>>(
        &self,
        lsm: &Arc<Lsm>,
        tx: Option<&Arc<Tx>>,
        itype: IteratorType,
        key: K,
    ) -> ReadIterator {
        let rv = tx.map_or_else(|| self.xm.global_read_view(), |tx| tx.read_view());
        ReadIterator::new(
            lsm.clone(),
            self.xm.clone(),
            tx.cloned(),
            rv,
            self.page_cache.clone(),
            itype,
            key.into(),
        )
    }

    // --- Maintenance --------------------------------------------------

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Requests a dump of everything currently buffered in memory.
    pub fn trigger_dump(&self) {
        self.scheduler.trigger_dump();
    }

    /// Marks every range of the tree for compaction.
    pub fn force_compaction(&self, lsm: &Arc<Lsm>) {
        lsm.force_compaction();
        self.scheduler.update_compaction_priority(lsm);
    }

    /// Runs a full checkpoint: dumps everything, waits for the round and
    /// compacts the metadata log down to a snapshot of the live state.
    #[allow(clippy::expect_used)]
    pub fn checkpoint(&self) -> crate::Result<()> {
        self.scheduler.begin_checkpoint();
        self.scheduler.wait_checkpoint();

        let result = {
            // Hold the metadata transitions still between reading the live
            // state and swapping the log file.
            let _meta = self.meta_lock.lock().expect("lock is poisoned");
            let snapshot = self.metadata_snapshot();
            self.vylog.rotate(snapshot)
        };

        self.scheduler.end_checkpoint();
        result
    }

    /// Serializes the live state as a fresh record stream.
    #[allow(clippy::expect_used)]
    fn metadata_snapshot(&self) -> Vec<LogRecord> {
        let mut records = Vec::new();

        let lsms: Vec<Arc<Lsm>> = self
            .lsms
            .lock()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect();

        for lsm in lsms {
            records.push(LogRecord::PrepareLsm {
                lsm_id: lsm.id(),
                space_id: lsm.space_id(),
                index_id: lsm.index_id(),
                group_id: lsm.group_id,
                key_def: Bytes::empty(),
            });
            records.push(LogRecord::CreateLsm {
                lsm_id: lsm.id(),
                space_id: lsm.space_id(),
                index_id: lsm.index_id(),
                create_lsn: 0,
            });

            for run in lsm.runs() {
                records.push(LogRecord::CreateRun {
                    lsm_id: lsm.id(),
                    run_id: run.id(),
                    dump_lsn: run.info().dump_lsn,
                    dump_count: run.info().dump_count,
                });
            }

            let ranges = lsm.ranges_read();
            for range in ranges.iter() {
                records.push(LogRecord::InsertRange {
                    lsm_id: lsm.id(),
                    range_id: range.id(),
                    begin: range.begin().cloned(),
                    end: range.end().cloned(),
                });
                // Oldest first, so replay rebuilds the stack newest-first.
                for slice in range.slices().iter().rev() {
                    records.push(LogRecord::InsertSlice {
                        range_id: range.id(),
                        run_id: slice.run().id(),
                        slice_id: slice.id(),
                        begin: slice.begin().cloned(),
                        end: slice.end().cloned(),
                    });
                }
            }

            records.push(LogRecord::DumpLsm {
                lsm_id: lsm.id(),
                dump_lsn: lsm.dump_lsn(),
            });
        }

        records
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
