//! Fixed-capacity, array-backed indexed min-heaps.
//!
//! Each slot is addressed by an integer id in `[0, capacity)`. The heap keeps
//! a position index per id, so a value can be changed in place with
//! [`IndexedMinHeap::update`] instead of popping and re-pushing. The k-way merge
//! uses one id per input sequence and advances the winning sequence with
//! [`IndexedMinHeap::update_head`].
//!
//! Two variants are exported:
//! - [`LongMinHeap`]: bare `i64` priorities
//! - [`FeatureMinHeap`]: [`SortableFeature`] values, for merging sorted chunks
//!
//! Equal values are ordered by a tie-breaker over ids (ascending id unless a
//! different comparator is installed), which keeps merge output deterministic.
//!
//! The heaps are plain single-threaded data structures; share them across
//! threads only by moving them.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

use crate::sortable::SortableFeature;

const NOT_PRESENT: usize = usize::MAX;

/// Usage errors raised by the heaps. None of these are recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("id {id} out of range for heap with capacity {capacity}")]
    OutOfRange { id: usize, capacity: usize },

    #[error("id {0} is already in the heap")]
    AlreadyPresent(usize),

    #[error("id {0} is not in the heap")]
    NotPresent(usize),

    #[error("heap is empty")]
    Empty,
}

/// Comparator over ids used when two values compare equal.
pub type TieBreaker = Box<dyn Fn(usize, usize) -> Ordering + Send>;

/// Min-heap of ids keyed by `i64` priorities.
pub type LongMinHeap = IndexedMinHeap<i64>;

/// Min-heap of ids keyed by the current head feature of each input.
pub type FeatureMinHeap = IndexedMinHeap<SortableFeature>;

/// Binary min-heap over ids `0..capacity`, each holding one value.
pub struct IndexedMinHeap<V> {
    /// Ids in heap order
    heap: Vec<usize>,
    /// id -> index into `heap`, or `NOT_PRESENT`
    positions: Vec<usize>,
    /// id -> current value
    values: Vec<Option<V>>,
    tie_breaker: TieBreaker,
}

impl<V: Ord> IndexedMinHeap<V> {
    /// Create an empty heap that accepts ids in `[0, capacity)`.
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            positions: vec![NOT_PRESENT; capacity],
            values: (0..capacity).map(|_| None).collect(),
            tie_breaker: Box::new(|a: usize, b: usize| a.cmp(&b)),
        }
    }

    /// Replace the comparator used to order ids whose values are equal.
    pub fn with_tie_breaker<F>(mut self, tie_breaker: F) -> Self
    where
        F: Fn(usize, usize) -> Ordering + Send + 'static,
    {
        self.tie_breaker = Box::new(tie_breaker);
        self
    }

    pub fn capacity(&self) -> usize {
        self.positions.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        id < self.capacity() && self.positions[id] != NOT_PRESENT
    }

    /// Insert `id` with `value`.
    ///
    /// Fails if `id` is out of range or already present.
    pub fn push(&mut self, id: usize, value: V) -> Result<(), HeapError> {
        self.check_range(id)?;
        if self.positions[id] != NOT_PRESENT {
            return Err(HeapError::AlreadyPresent(id));
        }
        let index = self.heap.len();
        self.heap.push(id);
        self.positions[id] = index;
        self.values[id] = Some(value);
        self.sift_up(index);
        Ok(())
    }

    /// Id holding the minimum value.
    pub fn peek_id(&self) -> Option<usize> {
        self.heap.first().copied()
    }

    /// The minimum value.
    pub fn peek_value(&self) -> Option<&V> {
        self.heap.first().and_then(|&id| self.values[id].as_ref())
    }

    /// Remove the minimum and return its id.
    pub fn poll(&mut self) -> Result<usize, HeapError> {
        self.poll_entry().map(|(id, _)| id)
    }

    /// Remove the minimum and return its id together with its value.
    pub fn poll_entry(&mut self) -> Result<(usize, V), HeapError> {
        if self.heap.is_empty() {
            return Err(HeapError::Empty);
        }
        let id = self.heap.swap_remove(0);
        if let Some(&moved) = self.heap.first() {
            self.positions[moved] = 0;
            self.sift_down(0);
        }
        self.positions[id] = NOT_PRESENT;
        let value = self.values[id].take().ok_or(HeapError::NotPresent(id))?;
        Ok((id, value))
    }

    /// Change the value of an id already in the heap, moving it up or down.
    pub fn update(&mut self, id: usize, value: V) -> Result<(), HeapError> {
        self.check_range(id)?;
        let index = self.positions[id];
        if index == NOT_PRESENT {
            return Err(HeapError::NotPresent(id));
        }
        self.values[id] = Some(value);
        self.sift_up(index);
        self.sift_down(self.positions[id]);
        Ok(())
    }

    /// Replace the minimum's value and restore heap order from the root.
    ///
    /// Returns the value that was replaced.
    pub fn update_head(&mut self, value: V) -> Result<V, HeapError> {
        let id = self.peek_id().ok_or(HeapError::Empty)?;
        let previous = self.values[id].replace(value);
        self.sift_down(0);
        previous.ok_or(HeapError::NotPresent(id))
    }

    /// Remove every id.
    pub fn clear(&mut self) {
        for id in self.heap.drain(..) {
            self.positions[id] = NOT_PRESENT;
            self.values[id] = None;
        }
    }

    fn check_range(&self, id: usize) -> Result<(), HeapError> {
        if id >= self.capacity() {
            return Err(HeapError::OutOfRange {
                id,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Compare the entries at two heap indices.
    fn less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.heap[i], self.heap[j]);
        self.values[a]
            .cmp(&self.values[b])
            .then_with(|| (self.tie_breaker)(a, b))
            == Ordering::Less
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.positions[self.heap[i]] = i;
        self.positions[self.heap[j]] = j;
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for IndexedMinHeap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedMinHeap")
            .field("capacity", &self.positions.len())
            .field("len", &self.heap.len())
            .field("head", &self.heap.first())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(heap: &mut LongMinHeap) -> Vec<usize> {
        let mut out = Vec::new();
        while !heap.is_empty() {
            out.push(heap.poll().unwrap());
        }
        out
    }

    // -------------------------------------------------------------------------
    // Push / poll contract
    // -------------------------------------------------------------------------

    #[test]
    fn test_descending_pushes_poll_ascending() {
        let mut heap = LongMinHeap::new(100);
        for id in (1..=99).rev() {
            heap.push(id, id as i64).unwrap();
        }
        assert_eq!(heap.len(), 99);
        assert_eq!(drain(&mut heap), (1..=99).collect::<Vec<_>>());
    }

    #[test]
    fn test_push_duplicate_id_fails() {
        let mut heap = LongMinHeap::new(4);
        heap.push(1, 10).unwrap();
        assert_eq!(heap.push(1, 20), Err(HeapError::AlreadyPresent(1)));

        // After polling the id may be pushed again
        assert_eq!(heap.poll(), Ok(1));
        heap.push(1, 20).unwrap();
        assert!(heap.contains(1));
    }

    #[test]
    fn test_push_out_of_range_fails() {
        let mut heap = LongMinHeap::new(4);
        assert_eq!(
            heap.push(4, 0),
            Err(HeapError::OutOfRange { id: 4, capacity: 4 })
        );
        assert!(matches!(
            heap.push(usize::MAX, 0),
            Err(HeapError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_poll_empty_fails() {
        let mut heap = LongMinHeap::new(2);
        assert_eq!(heap.poll(), Err(HeapError::Empty));
        assert_eq!(heap.update_head(3), Err(HeapError::Empty));
        assert!(heap.peek_id().is_none());
        assert!(heap.peek_value().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut heap = LongMinHeap::new(3);
        heap.push(0, 5).unwrap();
        heap.push(2, -1).unwrap();
        assert_eq!(heap.peek_id(), Some(2));
        assert_eq!(heap.peek_value(), Some(&-1));
        assert_eq!(heap.len(), 2);
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    #[test]
    fn test_update_increase_and_decrease() {
        let mut heap = LongMinHeap::new(5);
        for id in 0..5 {
            heap.push(id, id as i64 * 10).unwrap();
        }
        heap.update(0, 100).unwrap();
        assert_eq!(heap.peek_id(), Some(1));
        heap.update(4, -5).unwrap();
        assert_eq!(heap.peek_id(), Some(4));
        assert_eq!(drain(&mut heap), vec![4, 1, 2, 3, 0]);
    }

    #[test]
    fn test_update_missing_id_fails() {
        let mut heap = LongMinHeap::new(3);
        assert_eq!(heap.update(1, 0), Err(HeapError::NotPresent(1)));
        assert!(matches!(heap.update(9, 0), Err(HeapError::OutOfRange { .. })));
    }

    #[test]
    fn test_update_head_returns_previous_and_reorders() {
        let mut heap = LongMinHeap::new(3);
        heap.push(0, 1).unwrap();
        heap.push(1, 2).unwrap();
        heap.push(2, 3).unwrap();

        assert_eq!(heap.update_head(10), Ok(1));
        assert_eq!(heap.peek_id(), Some(1));
        assert_eq!(drain(&mut heap), vec![1, 2, 0]);
    }

    #[test]
    fn test_clear() {
        let mut heap = LongMinHeap::new(3);
        heap.push(0, 1).unwrap();
        heap.push(2, 1).unwrap();
        heap.clear();
        assert!(heap.is_empty());
        assert!(!heap.contains(0));
        heap.push(0, 7).unwrap();
        assert_eq!(heap.poll(), Ok(0));
    }

    // -------------------------------------------------------------------------
    // Tie breaking
    // -------------------------------------------------------------------------

    #[test]
    fn test_equal_values_poll_by_ascending_id() {
        let mut heap = LongMinHeap::new(10);
        for id in [7, 3, 9, 0, 5] {
            heap.push(id, 42).unwrap();
        }
        assert_eq!(drain(&mut heap), vec![0, 3, 5, 7, 9]);
    }

    #[test]
    fn test_custom_tie_breaker() {
        let mut heap = LongMinHeap::new(10).with_tie_breaker(|a, b| b.cmp(&a));
        for id in [7, 3, 9, 0, 5] {
            heap.push(id, 42).unwrap();
        }
        heap.push(1, 41).unwrap();
        assert_eq!(drain(&mut heap), vec![1, 9, 7, 5, 3, 0]);
    }

    #[test]
    fn test_feature_heap_orders_by_key_then_bytes() {
        let mut heap = FeatureMinHeap::new(3);
        heap.push(0, SortableFeature::new(2, vec![0])).unwrap();
        heap.push(1, SortableFeature::new(1, vec![9])).unwrap();
        heap.push(2, SortableFeature::new(1, vec![3])).unwrap();

        let (id, value) = heap.poll_entry().unwrap();
        assert_eq!(id, 2);
        assert_eq!(value, SortableFeature::new(1, vec![3]));
        assert_eq!(heap.poll(), Ok(1));
        assert_eq!(heap.poll(), Ok(0));
    }

    proptest! {
        #[test]
        fn prop_poll_order_matches_sorted(values in proptest::collection::vec(-1000i64..1000, 0..64)) {
            let mut heap = LongMinHeap::new(values.len());
            for (id, v) in values.iter().enumerate() {
                heap.push(id, *v).unwrap();
            }
            let mut expected: Vec<(i64, usize)> =
                values.iter().enumerate().map(|(id, v)| (*v, id)).collect();
            expected.sort();
            let polled = drain(&mut heap);
            prop_assert_eq!(polled, expected.into_iter().map(|(_, id)| id).collect::<Vec<_>>());
        }
    }
}
