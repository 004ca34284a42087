//! K-way merge of independently sorted sequences.
//!
//! Both merges keep exactly one heap slot per input, holding that input's
//! current head. After the minimum is emitted, the same input is advanced and
//! the new head replaces the old one in place ([`IndexedMinHeap::update_head`]);
//! exhausted inputs are polled out of the heap. Ties between inputs go to the
//! lower input index, so the merge is stable.
//!
//! - [`merge_sorted`] takes plain iterators.
//! - [`merge_pull`] takes fallible "give me the next element" functions, for
//!   inputs where advancing means disk reads or waiting on another thread.

use crate::heap::{HeapError, IndexedMinHeap};

/// Merge already-sorted iterators into one sorted iterator.
///
/// # Example
///
/// ```
/// use tilestream_core::merge::merge_sorted;
///
/// let merged: Vec<i64> = merge_sorted(vec![
///     vec![1, 4, 7].into_iter(),
///     vec![2, 5].into_iter(),
///     vec![3, 6, 9].into_iter(),
/// ])
/// .collect();
/// assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 9]);
/// ```
pub fn merge_sorted<I>(sources: Vec<I>) -> MergeIter<I>
where
    I: Iterator,
    I::Item: Ord,
{
    let mut sources = sources;
    let mut heap = IndexedMinHeap::new(sources.len());
    for (id, source) in sources.iter_mut().enumerate() {
        if let Some(first) = source.next() {
            let pushed = heap.push(id, first);
            debug_assert!(pushed.is_ok());
        }
    }
    MergeIter { sources, heap }
}

/// Iterator returned by [`merge_sorted`].
pub struct MergeIter<I: Iterator> {
    sources: Vec<I>,
    heap: IndexedMinHeap<I::Item>,
}

impl<I> Iterator for MergeIter<I>
where
    I: Iterator,
    I::Item: Ord,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.heap.peek_id()?;
        match self.sources[id].next() {
            Some(next) => self.heap.update_head(next).ok(),
            None => self.heap.poll_entry().ok().map(|(_, value)| value),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let mut lower = self.heap.len();
        let mut upper = Some(self.heap.len());
        for source in &self.sources {
            let (lo, hi) = source.size_hint();
            lower = lower.saturating_add(lo);
            upper = upper.zip(hi).and_then(|(a, b)| a.checked_add(b));
        }
        (lower, upper)
    }
}

/// Merge sorted inputs that are advanced by calling a function.
///
/// Each source returns `Ok(Some(v))` for its next element, `Ok(None)` once
/// exhausted, or an error. The first element of every source is pulled here,
/// so construction itself can fail. Heap misuse surfaces through the
/// sources' error type.
pub fn merge_pull<V, E, F>(sources: Vec<F>) -> Result<PullMerge<V, F>, E>
where
    V: Ord,
    E: From<HeapError>,
    F: FnMut() -> Result<Option<V>, E>,
{
    let mut sources = sources;
    let mut heap = IndexedMinHeap::new(sources.len());
    for (id, source) in sources.iter_mut().enumerate() {
        if let Some(first) = source()? {
            heap.push(id, first)?;
        }
    }
    Ok(PullMerge { sources, heap })
}

/// Iterator returned by [`merge_pull`]. Ends after yielding the first error.
pub struct PullMerge<V, F> {
    sources: Vec<F>,
    heap: IndexedMinHeap<V>,
}

impl<V, E, F> Iterator for PullMerge<V, F>
where
    V: Ord,
    E: From<HeapError>,
    F: FnMut() -> Result<Option<V>, E>,
{
    type Item = Result<V, E>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.heap.peek_id()?;
        match (self.sources[id])() {
            Ok(Some(next)) => Some(self.heap.update_head(next).map_err(E::from)),
            Ok(None) => Some(
                self.heap
                    .poll_entry()
                    .map(|(_, value)| value)
                    .map_err(E::from),
            ),
            Err(e) => {
                self.heap.clear();
                Some(Err(e))
            }
        }
    }
}
