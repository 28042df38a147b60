// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background dump and compaction scheduling
//!
//! Two worker pools (a quarter of the writer threads dump, the rest
//! compact) execute one task at a time. The scheduler thread picks the LSM
//! tree with the oldest in-memory data for dumping and the tree whose range
//! heap promises the biggest read-amplification win for compaction, builds
//! the task, and applies the result to the tree when the worker reports
//! back. Failures unwind the prepared run and put the scheduler into
//! exponential backoff.

mod deferred;

pub use deferred::DeferredDeleteBatcher;

use crate::{
    config::Config,
    fault::{self, Fault},
    heap::{Heap, HeapPos},
    ids::Ids,
    lsm::{range_less, Lsm, SlicePos},
    mem::Mem,
    range::{Range, RangeHeapItem},
    run::{PageCache, Run, RunInfo, RunSlice, RunWriter},
    stmt::Lsn,
    tx::TxManager,
    vylog::{LogRecord, VyLog},
    write_iterator::WriteIterator,
    RunId,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::{
    atomic::{
        AtomicBool, AtomicU64,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    Arc, Condvar, Mutex,
};
use std::time::{Duration, Instant};

/// Statements between cooperative cancellation checks in a worker.
const YIELD_INTERVAL: usize = 1_000;

#[derive(Clone)]
struct DumpHeapItem(Arc<Lsm>);

impl HeapPos for DumpHeapItem {
    fn heap_pos(&self) -> usize {
        self.0.dump_pos.load(Relaxed)
    }

    fn set_heap_pos(&self, pos: usize) {
        self.0.dump_pos.store(pos, Relaxed);
    }
}

/// Generation an LSM would dump: that of its oldest level holding data.
fn lsm_generation(lsm: &Arc<Lsm>) -> u64 {
    lsm.min_mem_generation().unwrap_or(u64::MAX)
}

/// Dump order: trees already dumping or pinned sink; then oldest
/// generation first; then secondary indexes before the primary of the same
/// space, so recovery never sees a primary ahead of its secondaries.
fn dump_less(a: &DumpHeapItem, b: &DumpHeapItem) -> bool {
    let a_dumping = a.0.is_dumping.load(Acquire);
    let b_dumping = b.0.is_dumping.load(Acquire);
    if a_dumping != b_dumping {
        return !a_dumping;
    }

    let a_pinned = a.0.is_mem_pinned();
    let b_pinned = b.0.is_mem_pinned();
    if a_pinned != b_pinned {
        return !a_pinned;
    }

    let a_gen = lsm_generation(&a.0);
    let b_gen = lsm_generation(&b.0);
    if a_gen != b_gen {
        return a_gen < b_gen;
    }

    a.0.index_id() > b.0.index_id()
}

#[derive(Clone)]
struct CompactionHeapItem(Arc<Lsm>);

impl HeapPos for CompactionHeapItem {
    fn heap_pos(&self) -> usize {
        self.0.compaction_pos.load(Relaxed)
    }

    fn set_heap_pos(&self, pos: usize) {
        self.0.compaction_pos.store(pos, Relaxed);
    }
}

fn compaction_less(a: &CompactionHeapItem, b: &CompactionHeapItem) -> bool {
    a.0.compaction_priority() > b.0.compaction_priority()
}

struct DumpTask {
    lsm: Arc<Lsm>,
    mems: Vec<Arc<Mem>>,
    run_id: RunId,
    dump_lsn: Lsn,
    rv_vlsns: Vec<Lsn>,
    is_last_level: bool,

    /// Bytes of in-memory data this dump releases.
    mem_bytes: u64,
}

struct CompactionTask {
    lsm: Arc<Lsm>,
    range: Arc<Range>,
    slices: Vec<Arc<RunSlice>>,
    run_id: RunId,
    dump_lsn: Lsn,
    dump_count: u32,
    rv_vlsns: Vec<Lsn>,
    is_last_level: bool,
}

enum Task {
    Dump(DumpTask),
    Compaction(CompactionTask),
}

impl Task {
    fn lsm(&self) -> &Arc<Lsm> {
        match self {
            Self::Dump(task) => &task.lsm,
            Self::Compaction(task) => &task.lsm,
        }
    }

    fn run_id(&self) -> RunId {
        match self {
            Self::Dump(task) => task.run_id,
            Self::Compaction(task) => task.run_id,
        }
    }
}

struct Completion {
    task: Task,
    result: crate::Result<Option<RunInfo>>,
    elapsed: Duration,
}

struct SchedState {
    idle_dump: usize,
    idle_compaction: usize,
    dump_tasks: usize,

    /// Backoff window after a failed task.
    timeout: Duration,
    throttled_until: Option<Instant>,

    checkpoint_in_progress: bool,

    /// A dump was requested while a checkpoint held the gate closed.
    dump_pending: bool,

    /// Bytes of in-memory data released since the round started.
    released_bytes: u64,
}

pub(crate) struct SchedulerInner {
    base: PathBuf,
    config: Arc<Config>,
    vylog: Arc<VyLog>,
    xm: Arc<TxManager>,
    ids: Arc<Ids>,
    page_cache: Arc<PageCache>,

    generation: Arc<AtomicU64>,
    dump_generation: AtomicU64,

    dump_heap: Mutex<Heap<DumpHeapItem>>,
    compaction_heap: Mutex<Heap<CompactionHeapItem>>,

    state: Mutex<SchedState>,
    wakeup: Condvar,
    dump_complete: Condvar,

    dump_tx: Mutex<Option<Sender<Task>>>,
    compaction_tx: Mutex<Option<Sender<Task>>>,
    completion_tx: Sender<Completion>,

    deferred_tx: Option<Sender<Vec<(crate::Statement, crate::Statement)>>>,

    /// Serializes metadata transitions (task completion vs. log rotation).
    meta_lock: Arc<Mutex<()>>,

    stopped: AtomicBool,
}

/// The dump/compaction scheduler of one environment
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn start(
        config: Arc<Config>,
        vylog: Arc<VyLog>,
        xm: Arc<TxManager>,
        ids: Arc<Ids>,
        page_cache: Arc<PageCache>,
        generation: Arc<AtomicU64>,
        meta_lock: Arc<Mutex<()>>,
    ) -> Self {
        let (dump_tx, dump_rx) = unbounded::<Task>();
        let (compaction_tx, compaction_rx) = unbounded::<Task>();
        let (completion_tx, completion_rx) = unbounded::<Completion>();

        let (deferred_tx, deferred_rx) = if config.deferred_delete_sink.is_some() {
            let (tx, rx) = bounded(deferred::MAX_BATCHES_IN_FLIGHT);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let inner = Arc::new(SchedulerInner {
            base: config.path.clone(),
            vylog,
            xm,
            ids,
            page_cache,
            generation,
            dump_generation: AtomicU64::new(0),
            dump_heap: Mutex::new(Heap::default()),
            compaction_heap: Mutex::new(Heap::default()),
            state: Mutex::new(SchedState {
                idle_dump: config.dump_threads(),
                idle_compaction: config.compaction_threads(),
                dump_tasks: 0,
                timeout: config.timeout_min,
                throttled_until: None,
                checkpoint_in_progress: false,
                dump_pending: false,
                released_bytes: 0,
            }),
            wakeup: Condvar::new(),
            dump_complete: Condvar::new(),
            dump_tx: Mutex::new(Some(dump_tx)),
            compaction_tx: Mutex::new(Some(compaction_tx)),
            completion_tx,
            deferred_tx,
            meta_lock,
            stopped: AtomicBool::new(false),
            config,
        });

        let mut threads = Vec::new();

        for i in 0..inner.config.dump_threads() {
            threads.push(spawn_worker(
                format!("vinyl-dump-{i}"),
                inner.clone(),
                dump_rx.clone(),
            ));
        }
        for i in 0..inner.config.compaction_threads() {
            threads.push(spawn_worker(
                format!("vinyl-compaction-{i}"),
                inner.clone(),
                compaction_rx.clone(),
            ));
        }

        if let (Some(rx), Some(sink)) = (deferred_rx, inner.config.deferred_delete_sink.clone()) {
            threads.push(deferred::spawn_consumer(rx, sink));
        }

        {
            let inner = inner.clone();
            #[allow(clippy::expect_used)]
            let handle = std::thread::Builder::new()
                .name("vinyl-scheduler".into())
                .spawn(move || scheduler_loop(&inner, &completion_rx))
                .expect("failed to spawn scheduler thread");
            threads.push(handle);
        }

        log::info!(
            "scheduler started: {} dump workers, {} compaction workers",
            inner.config.dump_threads(),
            inner.config.compaction_threads(),
        );

        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// Registers an LSM tree with both heaps.
    pub(crate) fn add_lsm(&self, lsm: &Arc<Lsm>) {
        #[allow(clippy::expect_used)]
        self.inner
            .dump_heap
            .lock()
            .expect("lock is poisoned")
            .insert(DumpHeapItem(lsm.clone()), dump_less);

        #[allow(clippy::expect_used)]
        self.inner
            .compaction_heap
            .lock()
            .expect("lock is poisoned")
            .insert(CompactionHeapItem(lsm.clone()), compaction_less);

        self.wake();
    }

    /// Unregisters a dropped LSM tree.
    pub(crate) fn remove_lsm(&self, lsm: &Arc<Lsm>) {
        #[allow(clippy::expect_used)]
        self.inner
            .dump_heap
            .lock()
            .expect("lock is poisoned")
            .remove(&DumpHeapItem(lsm.clone()), dump_less);

        #[allow(clippy::expect_used)]
        self.inner
            .compaction_heap
            .lock()
            .expect("lock is poisoned")
            .remove(&CompactionHeapItem(lsm.clone()), compaction_less);
    }

    fn wake(&self) {
        self.inner.wakeup.notify_all();
    }

    /// Requests a dump of everything currently in memory. Deferred while a
    /// checkpoint holds the gate.
    pub fn trigger_dump(&self) {
        #[allow(clippy::expect_used)]
        let mut state = self.inner.state.lock().expect("lock is poisoned");
        if state.checkpoint_in_progress {
            state.dump_pending = true;
        } else {
            self.inner.generation.fetch_add(1, AcqRel);
        }
        drop(state);
        self.wake();
    }

    /// Starts a checkpoint: everything currently buffered must reach disk.
    pub fn begin_checkpoint(&self) {
        #[allow(clippy::expect_used)]
        let mut state = self.inner.state.lock().expect("lock is poisoned");
        state.checkpoint_in_progress = true;
        drop(state);

        self.inner.generation.fetch_add(1, AcqRel);
        self.wake();
        log::info!(
            "checkpoint started, generation {}",
            self.inner.generation.load(Acquire),
        );
    }

    /// Blocks until the dump round started by [`Scheduler::begin_checkpoint`]
    /// is complete.
    #[allow(clippy::expect_used)]
    pub fn wait_checkpoint(&self) {
        let mut state = self.inner.state.lock().expect("lock is poisoned");
        loop {
            if self.inner.stopped.load(Acquire) {
                return;
            }
            if self.inner.dump_generation.load(Acquire) >= self.inner.generation.load(Acquire) {
                return;
            }
            let (guard, _) = self
                .inner
                .dump_complete
                .wait_timeout(state, Duration::from_millis(100))
                .expect("lock is poisoned");
            state = guard;
        }
    }

    /// Releases the checkpoint gate.
    pub fn end_checkpoint(&self) {
        #[allow(clippy::expect_used)]
        let mut state = self.inner.state.lock().expect("lock is poisoned");
        state.checkpoint_in_progress = false;
        if state.dump_pending {
            state.dump_pending = false;
            self.inner.generation.fetch_add(1, AcqRel);
        }
        drop(state);
        self.wake();
        log::info!("checkpoint finished");
    }

    /// Re-evaluates an LSM's position in the compaction heap after its
    /// range priorities changed.
    pub(crate) fn update_compaction_priority(&self, lsm: &Arc<Lsm>) {
        #[allow(clippy::expect_used)]
        self.inner
            .compaction_heap
            .lock()
            .expect("lock is poisoned")
            .update(&CompactionHeapItem(lsm.clone()), compaction_less);
        self.wake();
    }

    /// Stops the workers and joins every thread.
    pub(crate) fn shutdown(&self) {
        self.inner.stopped.store(true, Release);
        *self
            .inner
            .dump_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        *self
            .inner
            .compaction_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.wake();

        #[allow(clippy::expect_used)]
        let mut threads = self.threads.lock().expect("lock is poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        log::info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    name: String,
    inner: Arc<SchedulerInner>,
    rx: Receiver<Task>,
) -> std::thread::JoinHandle<()> {
    #[allow(clippy::expect_used)]
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            while let Ok(task) = rx.recv() {
                let start = Instant::now();
                let result = execute(&inner, &task);
                let completion = Completion {
                    task,
                    result,
                    elapsed: start.elapsed(),
                };
                if inner.completion_tx.send(completion).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn worker thread")
}

/// Runs the write iterator of a task to completion, producing the new run's
/// metadata. Checks for cancellation between batches of statements.
fn execute(inner: &SchedulerInner, task: &Task) -> crate::Result<Option<RunInfo>> {
    let lsm = task.lsm();

    let mut iter;
    let dump_lsn;
    let dump_count;

    match task {
        Task::Dump(task) => {
            fault::check(Fault::MemDump)?;

            iter = WriteIterator::new(&task.rv_vlsns, lsm.is_primary(), task.is_last_level, None);
            for mem in &task.mems {
                iter.add_mem(mem);
            }
            dump_lsn = task.dump_lsn;
            dump_count = 1;
        }
        Task::Compaction(task) => {
            fault::check(Fault::CompactionExecute)?;

            let handler = match (&inner.deferred_tx, lsm.is_primary()) {
                (Some(tx), true) => Some(DeferredDeleteBatcher::boxed(tx.clone())),
                _ => None,
            };

            iter = WriteIterator::new(
                &task.rv_vlsns,
                lsm.is_primary(),
                task.is_last_level,
                handler,
            );
            for slice in &task.slices {
                iter.add_slice(slice.clone());
            }
            dump_lsn = task.dump_lsn;
            dump_count = task.dump_count;
        }
    }

    let mut writer = RunWriter::new(
        task.run_id(),
        Run::data_path(&inner.base, lsm.space_id(), lsm.index_id(), task.run_id()),
        Run::index_path(&inner.base, lsm.space_id(), lsm.index_id(), task.run_id()),
        inner.config.lsm.compression,
        inner.config.lsm.page_size,
        inner.config.lsm.bloom_fpr,
    )?;

    let mut processed = 0usize;
    while let Some(stmt) = iter.next()? {
        writer.push(&stmt)?;

        processed += 1;
        if processed % YIELD_INTERVAL == 0 && inner.stopped.load(Acquire) {
            log::debug!("task for run {} cancelled", task.run_id());
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "scheduler shutdown",
            )));
        }
    }

    writer.finish(dump_lsn, dump_count)
}

fn scheduler_loop(inner: &Arc<SchedulerInner>, completion_rx: &Receiver<Completion>) {
    loop {
        if inner.stopped.load(Acquire) {
            break;
        }

        inner.dispatch();

        match completion_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(completion) => inner.complete(completion),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Drain completions from workers that were mid-task at shutdown.
    while let Ok(completion) = completion_rx.try_recv() {
        inner.complete(completion);
    }
}

impl SchedulerInner {
    #[allow(clippy::expect_used)]
    fn dispatch(&self) {
        {
            let state = self.state.lock().expect("lock is poisoned");
            if let Some(until) = state.throttled_until {
                if Instant::now() < until {
                    return;
                }
            }
        }

        loop {
            let idle = {
                let state = self.state.lock().expect("lock is poisoned");
                state.idle_dump
            };
            if idle == 0 {
                break;
            }
            let Some(task) = self.schedule_dump() else {
                break;
            };

            let mut state = self.state.lock().expect("lock is poisoned");
            state.idle_dump -= 1;
            state.dump_tasks += 1;
            drop(state);

            let sender = self.dump_tx.lock().expect("lock is poisoned").clone();
            if let Some(sender) = sender {
                if sender.send(Task::Dump(task)).is_err() {
                    break;
                }
            }
        }

        loop {
            let idle = {
                let state = self.state.lock().expect("lock is poisoned");
                state.idle_compaction
            };
            if idle == 0 {
                break;
            }
            let Some(task) = self.schedule_compaction() else {
                break;
            };

            let mut state = self.state.lock().expect("lock is poisoned");
            state.idle_compaction -= 1;
            drop(state);

            let sender = self.compaction_tx.lock().expect("lock is poisoned").clone();
            if let Some(sender) = sender {
                if sender.send(Task::Compaction(task)).is_err() {
                    break;
                }
            }
        }
    }

    /// Picks the next dump task, or advances the dump round when the
    /// current one is drained.
    #[allow(clippy::expect_used)]
    fn schedule_dump(&self) -> Option<DumpTask> {
        let generation = self.generation.load(Acquire);
        if self.dump_generation.load(Acquire) >= generation {
            return None;
        }

        let lsm = {
            let heap = self.dump_heap.lock().expect("lock is poisoned");
            heap.top().map(|item| item.0.clone())
        };

        let Some(lsm) = lsm else {
            self.try_advance_dump_round();
            return None;
        };

        if lsm.is_dumping.load(Acquire) || lsm.is_mem_pinned() {
            // The heap order reads live state; re-sink the blocked tree so
            // a dumpable one can surface on the next pass.
            self.dump_heap
                .lock()
                .expect("lock is poisoned")
                .update(&DumpHeapItem(lsm), dump_less);
            return None;
        }

        if lsm_generation(&lsm) >= generation {
            // The oldest data anywhere is current; the round is done.
            self.dump_heap
                .lock()
                .expect("lock is poisoned")
                .update(&DumpHeapItem(lsm), dump_less);
            self.try_advance_dump_round();
            return None;
        }

        lsm.rotate_mem_if_required();

        let (_, sealed) = lsm.mem_snapshot();
        let mems: Vec<Arc<Mem>> = sealed
            .into_iter()
            .filter(|mem| mem.generation() < generation)
            .collect();
        if mems.is_empty() {
            return None;
        }
        if mems.iter().any(|mem| mem.is_pinned()) {
            return None;
        }

        let dump_lsn = mems.iter().map(|m| m.dump_lsn()).max().unwrap_or(-1);
        if dump_lsn < 0 {
            // Nothing committed in these levels; just discard them.
            for mem in &mems {
                lsm.delete_mem(mem);
            }
            return None;
        }

        let run_id = self.ids.next_run();
        let prepared = {
            let _meta = self.meta_lock.lock().expect("lock is poisoned");
            self.vylog.append(LogRecord::PrepareRun {
                lsm_id: lsm.id(),
                run_id,
            })
        };
        if let Err(e) = prepared {
            log::error!("failed to log run preparation: {e}");
            self.backoff();
            return None;
        }

        let mem_bytes = mems.iter().map(|m| m.used_bytes()).sum();

        lsm.is_dumping.store(true, Release);
        self.dump_heap
            .lock()
            .expect("lock is poisoned")
            .update(&DumpHeapItem(lsm.clone()), dump_less);

        log::debug!(
            "scheduling dump of lsm {} ({} levels, dump_lsn {dump_lsn})",
            lsm.id(),
            mems.len(),
        );

        Some(DumpTask {
            is_last_level: lsm.run_count() == 0,
            rv_vlsns: self.xm.read_views(),
            lsm,
            mems,
            run_id,
            dump_lsn,
            mem_bytes,
        })
    }

    /// Picks the next compaction task.
    #[allow(clippy::expect_used)]
    fn schedule_compaction(&self) -> Option<CompactionTask> {
        let lsm = {
            let heap = self.compaction_heap.lock().expect("lock is poisoned");
            heap.top().map(|item| item.0.clone())
        }?;

        if lsm.compaction_priority() == 0 || lsm.is_dropped() {
            self.compaction_heap
                .lock()
                .expect("lock is poisoned")
                .update(&CompactionHeapItem(lsm), compaction_less);
            return None;
        }

        let range = {
            let heap = lsm.range_heap();
            heap.top().map(|item| item.0.clone())
        }?;

        let (slices, is_last_level) = {
            let inner = range.lock();
            if inner.is_scheduled || inner.compaction_priority == 0 {
                return None;
            }
            let n = inner.compaction_priority.min(inner.slices.len());
            (
                inner.slices.iter().take(n).cloned().collect::<Vec<_>>(),
                n == inner.slices.len(),
            )
        };
        if slices.len() < 2 {
            // A single slice cannot shrink; stale priority.
            lsm.update_range_priority(&range);
            return None;
        }

        let run_id = self.ids.next_run();
        let prepared = {
            let _meta = self.meta_lock.lock().expect("lock is poisoned");
            self.vylog.append(LogRecord::PrepareRun {
                lsm_id: lsm.id(),
                run_id,
            })
        };
        if let Err(e) = prepared {
            log::error!("failed to log run preparation: {e}");
            self.backoff();
            return None;
        }

        range.lock().is_scheduled = true;
        lsm.range_heap()
            .remove(&RangeHeapItem(range.clone()), range_less);
        self.compaction_heap
            .lock()
            .expect("lock is poisoned")
            .update(&CompactionHeapItem(lsm.clone()), compaction_less);

        for slice in &slices {
            slice.pin();
        }

        // Each input run contributes once to the output's dump pedigree.
        let mut seen = crate::HashSet::default();
        let mut dump_count = 0;
        let mut dump_lsn = -1;
        for slice in &slices {
            let run = slice.run();
            if seen.insert(run.id()) {
                dump_count += run.info().dump_count;
                dump_lsn = dump_lsn.max(run.info().dump_lsn);
            }
        }

        log::debug!(
            "scheduling compaction of {range:?} ({} slices)",
            slices.len(),
        );

        Some(CompactionTask {
            rv_vlsns: self.xm.read_views(),
            lsm,
            range,
            slices,
            run_id,
            dump_lsn,
            dump_count,
            is_last_level,
        })
    }

    #[allow(clippy::expect_used)]
    fn complete(&self, completion: Completion) {
        let Completion {
            task,
            result,
            elapsed,
        } = completion;

        if elapsed > self.config.too_long_threshold {
            log::warn!(
                "task for run {} took {elapsed:?} (threshold {:?})",
                task.run_id(),
                self.config.too_long_threshold,
            );
        }

        // The worker is done with the sources either way.
        if let Task::Compaction(compaction) = &task {
            for slice in &compaction.slices {
                slice.unpin();
            }
        }

        let outcome = {
            // No metadata-log rotation may interleave with the swap.
            #[allow(clippy::expect_used)]
            let _meta = self.meta_lock.lock().expect("lock is poisoned");

            match result {
                Ok(info) => match &task {
                    Task::Dump(dump) => self.complete_dump(dump, info),
                    Task::Compaction(compaction) => self.complete_compaction(compaction, info),
                },
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                let mut state = self.state.lock().expect("lock is poisoned");
                state.timeout = self.config.timeout_min;
                state.throttled_until = None;
            }
            Err(e) => {
                log::error!("task for run {} failed: {e}", task.run_id());
                self.abort_task(&task);
                self.backoff();
            }
        }

        {
            let mut state = self.state.lock().expect("lock is poisoned");
            match &task {
                Task::Dump(_) => {
                    state.idle_dump += 1;
                    state.dump_tasks -= 1;
                }
                Task::Compaction(_) => state.idle_compaction += 1,
            }
        }

        if matches!(task, Task::Dump(_)) {
            self.try_advance_dump_round();
        }
    }

    /// Applies a finished dump: scatters slices of the new run over the
    /// intersecting ranges, retires the dumped levels and logs everything as
    /// one metadata transaction.
    #[allow(clippy::expect_used)]
    fn complete_dump(&self, task: &DumpTask, info: Option<RunInfo>) -> crate::Result<()> {
        let lsm = &task.lsm;

        let result = (|| -> crate::Result<()> {
            let Some(info) = info else {
                // All data was optimized away; drop the prepared run.
                self.vylog.commit(vec![
                    LogRecord::DropRun {
                        run_id: task.run_id,
                        gc_lsn: 0,
                    },
                    LogRecord::DumpLsm {
                        lsm_id: lsm.id(),
                        dump_lsn: task.dump_lsn,
                    },
                ])?;
                return Ok(());
            };

            let run = Run::new(
                task.run_id,
                info,
                Run::data_path(&self.base, lsm.space_id(), lsm.index_id(), task.run_id),
                Run::index_path(&self.base, lsm.space_id(), lsm.index_id(), task.run_id),
            );

            let ranges =
                lsm.find_range_intersection(&run.info().min_key, &run.info().max_key);
            debug_assert!(!ranges.is_empty());

            let mut records = vec![LogRecord::CreateRun {
                lsm_id: lsm.id(),
                run_id: run.id(),
                dump_lsn: task.dump_lsn,
                dump_count: 1,
            }];

            let mut slices = Vec::with_capacity(ranges.len());
            for range in &ranges {
                let slice = RunSlice::new(
                    self.ids.next_slice(),
                    run.clone(),
                    range.begin().cloned(),
                    range.end().cloned(),
                );
                records.push(LogRecord::InsertSlice {
                    range_id: range.id(),
                    run_id: run.id(),
                    slice_id: slice.id(),
                    begin: slice.begin().cloned(),
                    end: slice.end().cloned(),
                });
                slices.push(slice);
            }
            records.push(LogRecord::DumpLsm {
                lsm_id: lsm.id(),
                dump_lsn: task.dump_lsn,
            });

            self.vylog.commit(records)?;

            lsm.add_run(run.clone());
            for (range, slice) in ranges.iter().zip(slices) {
                lsm.add_slice_to_range(range, slice, SlicePos::Front);
            }

            lsm.stats.dump_count.fetch_add(1, AcqRel);
            lsm.stats
                .dumped_rows
                .fetch_add(run.info().row_count, AcqRel);
            lsm.stats
                .dumped_bytes
                .fetch_add(run.info().size_bytes(), AcqRel);

            log::info!(
                "dumped lsm {}: run {} ({} rows) over {} ranges",
                lsm.id(),
                run.id(),
                run.info().row_count,
                ranges.len(),
            );
            Ok(())
        })();

        if result.is_ok() {
            for mem in &task.mems {
                lsm.delete_mem(mem);
            }
            lsm.set_dump_lsn(task.dump_lsn);

            let mut state = self.state.lock().expect("lock is poisoned");
            state.released_bytes += task.mem_bytes;
        }

        lsm.is_dumping.store(false, Release);
        self.dump_heap
            .lock()
            .expect("lock is poisoned")
            .update(&DumpHeapItem(lsm.clone()), dump_less);
        self.compaction_heap
            .lock()
            .expect("lock is poisoned")
            .update(&CompactionHeapItem(lsm.clone()), compaction_less);

        result
    }

    /// Applies a finished compaction: swaps the consumed slices for the new
    /// one, drops runs nothing references anymore and re-evaluates the
    /// range.
    #[allow(clippy::expect_used, clippy::too_many_lines)]
    fn complete_compaction(
        &self,
        task: &CompactionTask,
        info: Option<RunInfo>,
    ) -> crate::Result<()> {
        let lsm = &task.lsm;
        let range = &task.range;

        if lsm.is_dropped() {
            self.vylog.append(LogRecord::DropRun {
                run_id: task.run_id,
                gc_lsn: 0,
            })?;
            self.discard_run_files(lsm, task.run_id);
            range.lock().is_scheduled = false;
            return Ok(());
        }

        // Runs all of whose live slices are consumed here become unused.
        let mut consumed_per_run: crate::HashMap<RunId, usize> = crate::HashMap::default();
        for slice in &task.slices {
            *consumed_per_run.entry(slice.run().id()).or_insert(0) += 1;
        }
        let unused_runs: Vec<Arc<Run>> = {
            let mut seen = crate::HashSet::default();
            task.slices
                .iter()
                .map(|slice| slice.run())
                .filter(|run| seen.insert(run.id()))
                .filter(|run| {
                    consumed_per_run
                        .get(&run.id())
                        .is_some_and(|n| *n == run.live_slice_count())
                })
                .cloned()
                .collect()
        };

        let mut records = Vec::new();
        for slice in &task.slices {
            records.push(LogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
        }
        for run in &unused_runs {
            records.push(LogRecord::DropRun {
                run_id: run.id(),
                gc_lsn: self.xm.lsn(),
            });
        }

        let new_run = match info {
            Some(info) => Some(Run::new(
                task.run_id,
                info,
                Run::data_path(&self.base, lsm.space_id(), lsm.index_id(), task.run_id),
                Run::index_path(&self.base, lsm.space_id(), lsm.index_id(), task.run_id),
            )),
            None => {
                // Everything was optimized away.
                records.push(LogRecord::DropRun {
                    run_id: task.run_id,
                    gc_lsn: 0,
                });
                None
            }
        };

        let new_slice = new_run.as_ref().map(|run| {
            let slice = RunSlice::new(
                self.ids.next_slice(),
                run.clone(),
                range.begin().cloned(),
                range.end().cloned(),
            );
            records.push(LogRecord::CreateRun {
                lsm_id: lsm.id(),
                run_id: run.id(),
                dump_lsn: task.dump_lsn,
                dump_count: task.dump_count,
            });
            records.push(LogRecord::InsertSlice {
                range_id: range.id(),
                run_id: run.id(),
                slice_id: slice.id(),
                begin: slice.begin().cloned(),
                end: slice.end().cloned(),
            });
            slice
        });

        self.vylog.commit(records)?;

        // The new slice goes where the consumed ones were: right before the
        // oldest surviving slice. Dumps completed during the compaction may
        // have prepended fresh slices meanwhile.
        if let Some(new_slice) = new_slice {
            let survivor = {
                let current = range.slices();
                let last_consumed = task.slices.last();
                let idx = last_consumed.and_then(|needle| {
                    current.iter().position(|s| Arc::ptr_eq(s, needle))
                });
                idx.and_then(|i| current.get(i + 1).cloned())
            };

            match &survivor {
                Some(next) => lsm.add_slice_to_range(range, new_slice, SlicePos::Before(next)),
                None => lsm.add_slice_to_range(range, new_slice, SlicePos::Back),
            }
        }

        if let Some(run) = &new_run {
            lsm.add_run(run.clone());
            lsm.stats
                .compaction_out_rows
                .fetch_add(run.info().row_count, AcqRel);
        }

        for slice in &task.slices {
            slice.wait_pinned();
            lsm.remove_slice_from_range(range, slice);
            slice.retire();
            lsm.stats
                .compaction_in_rows
                .fetch_add(slice.row_count(), AcqRel);
        }

        // The swap is committed; failures from here on must not unwind it.
        for run in &unused_runs {
            lsm.remove_run(run);
            self.page_cache.remove_run(run.id(), run.info().page_count());
            if let Err(e) = run.remove_files() {
                log::warn!("failed to remove files of run {}: {e}", run.id());
            }
        }

        {
            let mut inner = range.lock();
            inner.n_compactions += 1;
            inner.needs_compaction = false;
            inner.is_scheduled = false;
        }
        range.update_dumps_per_compaction();
        lsm.update_range_priority(range);
        lsm.range_heap()
            .insert(RangeHeapItem(range.clone()), range_less);
        lsm.stats.compaction_count.fetch_add(1, AcqRel);

        // The range may now be oversized or undersized.
        match lsm.split_range(&self.vylog, range) {
            Ok(false) => {
                if let Err(e) = lsm.coalesce_range(&self.vylog, range) {
                    log::error!("failed to coalesce {range:?}: {e}");
                }
            }
            Ok(true) => {}
            Err(e) => log::error!("failed to split {range:?}: {e}"),
        }

        self.compaction_heap
            .lock()
            .expect("lock is poisoned")
            .update(&CompactionHeapItem(lsm.clone()), compaction_less);

        log::info!(
            "compacted {range:?}: {} slices into run {}",
            task.slices.len(),
            task.run_id,
        );
        Ok(())
    }

    /// Unwinds a failed task: the prepared run is dropped so garbage
    /// collection can delete whatever the worker managed to write.
    fn abort_task(&self, task: &Task) {
        let lsm = task.lsm();

        if let Err(e) = self.vylog.append(LogRecord::DropRun {
            run_id: task.run_id(),
            gc_lsn: 0,
        }) {
            log::error!("failed to log run drop after abort: {e}");
        }
        self.discard_run_files(lsm, task.run_id());

        match task {
            Task::Dump(task) => {
                task.lsm.is_dumping.store(false, Release);

                #[allow(clippy::expect_used)]
                self.dump_heap
                    .lock()
                    .expect("lock is poisoned")
                    .update(&DumpHeapItem(task.lsm.clone()), dump_less);
            }
            Task::Compaction(task) => {
                task.range.lock().is_scheduled = false;
                task.lsm.update_range_priority(&task.range);

                let item = RangeHeapItem(task.range.clone());
                let mut heap = task.lsm.range_heap();
                if item.heap_pos() == crate::heap::HEAP_STRAY {
                    heap.insert(item, range_less);
                } else {
                    heap.update(&item, range_less);
                }
            }
        }
    }

    fn discard_run_files(&self, lsm: &Arc<Lsm>, run_id: RunId) {
        for path in [
            Run::data_path(&self.base, lsm.space_id(), lsm.index_id(), run_id),
            Run::index_path(&self.base, lsm.space_id(), lsm.index_id(), run_id),
        ] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove {}: {e}", path.display());
                }
            }
        }
    }

    /// Exponential backoff between the configured bounds.
    #[allow(clippy::expect_used)]
    fn backoff(&self) {
        if fault::check(Fault::SchedTimeout).is_err() {
            log::info!("scheduler timeout injected");
        }

        let mut state = self.state.lock().expect("lock is poisoned");
        state.throttled_until = Some(Instant::now() + state.timeout);
        log::warn!("scheduler throttled for {:?}", state.timeout);
        state.timeout = (state.timeout * 2).min(self.config.timeout_max);
    }

    /// Once no dump task is in flight and every tree's oldest data belongs
    /// to the current generation, the round is over: release the memory
    /// quota and wake checkpoint waiters.
    #[allow(clippy::expect_used)]
    fn try_advance_dump_round(&self) {
        {
            let state = self.state.lock().expect("lock is poisoned");
            if state.dump_tasks > 0 {
                return;
            }
        }

        let generation = self.generation.load(Acquire);
        let min_generation = {
            let heap = self.dump_heap.lock().expect("lock is poisoned");
            heap.iter()
                .filter_map(|item| item.0.min_mem_generation())
                .min()
                .unwrap_or(generation)
        };

        let new_dump_generation = min_generation.min(generation);
        if new_dump_generation <= self.dump_generation.load(Acquire) {
            return;
        }

        self.dump_generation
            .store(new_dump_generation, Release);

        let released = {
            let mut state = self.state.lock().expect("lock is poisoned");
            std::mem::take(&mut state.released_bytes)
        };

        if let Some(cb) = &self.config.dump_quota_cb {
            cb(released);
        }

        self.dump_complete.notify_all();
        log::debug!(
            "dump round complete, generation {new_dump_generation} ({released} bytes released)",
        );
    }
}
