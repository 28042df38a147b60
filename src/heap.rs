// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Slot of an item that is not in a heap.
pub const HEAP_STRAY: usize = usize::MAX;

/// Items store their own slot so the heap can update or remove them in
/// O(log n) without a search.
pub trait HeapPos {
    fn heap_pos(&self) -> usize;
    fn set_heap_pos(&self, pos: usize);
}

/// Binary min-heap with in-place slot tracking
///
/// The comparator is passed to every operation instead of being baked into
/// the item's `Ord`, because heap order commonly reads external state (a
/// range's current compaction priority, an LSM's generation) that changes
/// between operations. After such a change the owner calls [`Heap::update`]
/// for one item or [`Heap::update_all`] to reheapify everything.
pub struct Heap<T: HeapPos + Clone> {
    data: Vec<T>,
}

impl<T: HeapPos + Clone> Default for Heap<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

impl<T: HeapPos + Clone> Heap<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The top item (least by `less`), if any.
    #[must_use]
    pub fn top(&self) -> Option<&T> {
        self.data.first()
    }

    /// All items in heap order (not sorted).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn insert(&mut self, item: T, less: impl Fn(&T, &T) -> bool) {
        debug_assert_eq!(HEAP_STRAY, item.heap_pos());
        let pos = self.data.len();
        item.set_heap_pos(pos);
        self.data.push(item);
        self.sift_up(pos, &less);
    }

    /// Removes the given item using its stored slot. No-op for strays.
    pub fn remove(&mut self, item: &T, less: impl Fn(&T, &T) -> bool) {
        let pos = item.heap_pos();
        if pos == HEAP_STRAY {
            return;
        }
        debug_assert!(pos < self.data.len());

        item.set_heap_pos(HEAP_STRAY);
        let last = self.data.len() - 1;
        if pos != last {
            self.data.swap(pos, last);
            self.data.truncate(last);
            if let Some(moved) = self.data.get(pos) {
                moved.set_heap_pos(pos);
                self.sift_down(pos, &less);
                self.sift_up(pos, &less);
            }
        } else {
            self.data.truncate(last);
        }
    }

    /// Restores the heap property around one item whose key changed.
    pub fn update(&mut self, item: &T, less: impl Fn(&T, &T) -> bool) {
        let pos = item.heap_pos();
        if pos == HEAP_STRAY {
            return;
        }
        self.sift_down(pos, &less);
        self.sift_up(pos, &less);
    }

    /// Reheapifies after a bulk key change (e.g. a policy switch).
    pub fn update_all(&mut self, less: impl Fn(&T, &T) -> bool) {
        for pos in (0..self.data.len() / 2).rev() {
            self.sift_down(pos, &less);
        }
    }

    fn sift_up(&mut self, mut pos: usize, less: &impl Fn(&T, &T) -> bool) {
        while pos > 0 {
            let parent = (pos - 1) / 2;

            let Some(child_item) = self.data.get(pos) else {
                return;
            };
            let Some(parent_item) = self.data.get(parent) else {
                return;
            };
            if !less(child_item, parent_item) {
                return;
            }

            self.data.swap(pos, parent);
            if let Some(item) = self.data.get(pos) {
                item.set_heap_pos(pos);
            }
            if let Some(item) = self.data.get(parent) {
                item.set_heap_pos(parent);
            }
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize, less: &impl Fn(&T, &T) -> bool) {
        loop {
            let mut least = pos;

            for child in [2 * pos + 1, 2 * pos + 2] {
                if let (Some(a), Some(b)) = (self.data.get(child), self.data.get(least)) {
                    if less(a, b) {
                        least = child;
                    }
                }
            }

            if least == pos {
                return;
            }

            self.data.swap(pos, least);
            if let Some(item) = self.data.get(pos) {
                item.set_heap_pos(pos);
            }
            if let Some(item) = self.data.get(least) {
                item.set_heap_pos(least);
            }
            pos = least;
        }
    }

    #[cfg(test)]
    fn validate(&self, less: &impl Fn(&T, &T) -> bool) {
        for pos in 1..self.data.len() {
            let parent = (pos - 1) / 2;
            assert!(
                !less(&self.data[pos], &self.data[parent]),
                "heap property violated at slot {pos}"
            );
            assert_eq!(pos, self.data[pos].heap_pos());
        }
    }
}
