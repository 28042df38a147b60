// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Condvar, Mutex};

/// Pin counter with a wait primitive
///
/// Pinning is orthogonal to shared ownership: an iterator pins a run slice or
/// an in-memory level around a disk read so that the artifact is not retired
/// underneath it, while a deleter may wait for the count to drain without
/// holding a reference of its own.
#[derive(Default)]
pub struct PinCount {
    count: Mutex<usize>,
    unpinned: Condvar,
}

impl PinCount {
    #[allow(clippy::expect_used)]
    pub fn pin(&self) {
        *self.count.lock().expect("lock is poisoned") += 1;
    }

    #[allow(clippy::expect_used)]
    pub fn unpin(&self) {
        let mut count = self.count.lock().expect("lock is poisoned");
        debug_assert!(*count > 0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.unpinned.notify_all();
        }
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn is_pinned(&self) -> bool {
        *self.count.lock().expect("lock is poisoned") > 0
    }

    /// Blocks until the count drops to zero.
    #[allow(clippy::expect_used)]
    pub fn wait_unpinned(&self) {
        let mut count = self.count.lock().expect("lock is poisoned");
        while *count > 0 {
            count = self.unpinned.wait(count).expect("lock is poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn pin_unpin() {
        let pins = PinCount::default();
        assert!(!pins.is_pinned());
        pins.pin();
        pins.pin();
        assert!(pins.is_pinned());
        pins.unpin();
        assert!(pins.is_pinned());
        pins.unpin();
        assert!(!pins.is_pinned());
        pins.wait_unpinned();
    }

    #[test]
    fn wait_unpinned_wakes() {
        use std::sync::Arc;

        let pins = Arc::new(PinCount::default());
        pins.pin();

        let thread = {
            let pins = pins.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                pins.unpin();
            })
        };

        pins.wait_unpinned();

        #[allow(clippy::unwrap_used)]
        thread.join().unwrap();
    }
}
