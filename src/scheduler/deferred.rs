// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Deferred DELETE routing
//!
//! Primary-index compaction discovers tuples whose deletion from secondary
//! indexes was deferred. The pairs are batched in the worker and shipped to
//! the transaction layer over a bounded channel - a full channel blocks the
//! worker, throttling compaction when the consumer falls behind.

use crate::{write_iterator::DeferredDeleteHandler, Statement};
use crossbeam_channel::Sender;
use std::sync::Arc;

/// Pairs per batch.
const BATCH_SIZE: usize = 64;

/// Batches in flight before compaction workers block.
pub(crate) const MAX_BATCHES_IN_FLIGHT: usize = 16;

/// Sink callback invoked with every `(old, new)` pair.
pub(crate) type Sink = Arc<dyn Fn(&Statement, &Statement) + Send + Sync>;

/// Buffers deferred DELETE pairs and ships them batch-wise
pub struct DeferredDeleteBatcher {
    tx: Sender<Vec<(Statement, Statement)>>,
    buf: Vec<(Statement, Statement)>,
}

impl DeferredDeleteBatcher {
    pub(crate) fn boxed(
        tx: Sender<Vec<(Statement, Statement)>>,
    ) -> Box<dyn DeferredDeleteHandler> {
        Box::new(Self {
            tx,
            buf: Vec::with_capacity(BATCH_SIZE),
        })
    }

    fn flush(&mut self) -> crate::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.buf, Vec::with_capacity(BATCH_SIZE));
        self.tx.send(batch).map_err(|_| {
            crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "deferred DELETE consumer is gone",
            ))
        })
    }
}

impl DeferredDeleteHandler for DeferredDeleteBatcher {
    fn process(&mut self, old_stmt: &Statement, new_stmt: &Statement) -> crate::Result<()> {
        self.buf.push((old_stmt.clone(), new_stmt.clone()));
        if self.buf.len() >= BATCH_SIZE {
            self.flush()?;
        }
        Ok(())
    }
}

impl Drop for DeferredDeleteBatcher {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("dropping buffered deferred DELETE pairs: {e}");
        }
    }
}

/// Spawns the consumer thread feeding the sink on the receiving side.
pub(crate) fn spawn_consumer(
    rx: crossbeam_channel::Receiver<Vec<(Statement, Statement)>>,
    sink: Sink,
) -> std::thread::JoinHandle<()> {
    #[allow(clippy::expect_used)]
    std::thread::Builder::new()
        .name("vinyl-deferred-delete".into())
        .spawn(move || {
            while let Ok(batch) = rx.recv() {
                for (old_stmt, new_stmt) in &batch {
                    sink(old_stmt, new_stmt);
                }
            }
        })
        .expect("failed to spawn deferred DELETE consumer")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use test_log::test;

    #[test]
    fn batcher_flushes_on_drop() {
        let (tx, rx) = bounded(4);

        {
            let mut handler = DeferredDeleteBatcher::boxed(tx);
            handler
                .process(
                    &Statement::replace(*b"k", *b"old", 1),
                    &Statement::replace(*b"k", *b"new", 2),
                )
                .unwrap();
        }

        let batch = rx.recv().unwrap();
        assert_eq!(1, batch.len());
        assert_eq!(&*batch[0].0.value, b"old");
    }

    #[test]
    fn batcher_flushes_full_batches() {
        let (tx, rx) = bounded(4);
        let mut handler = DeferredDeleteBatcher::boxed(tx);

        for i in 0..BATCH_SIZE {
            handler
                .process(
                    &Statement::replace(*b"k", (i as u64).to_be_bytes(), 1),
                    &Statement::replace(*b"k", *b"new", 2),
                )
                .unwrap();
        }

        let batch = rx.recv().unwrap();
        assert_eq!(BATCH_SIZE, batch.len());
    }
}
