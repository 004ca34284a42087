//! The unit of data moved through the external sort.

use std::cmp::Ordering;
use std::mem::size_of;

/// A packed sort key plus an opaque payload.
///
/// Ordered by `key` first, then by the payload bytes, so the total order is
/// deterministic even when many entries share a key. Whether two entries
/// describe the *same* feature is a different question, answered on the decoded
/// payload (see [`crate::feature::TileFeature::has_same_contents`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortableFeature {
    pub key: i64,
    pub value: Vec<u8>,
}

impl SortableFeature {
    pub fn new(key: i64, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// Approximate heap + inline footprint, used for chunk byte budgets.
    pub fn estimated_size(&self) -> usize {
        size_of::<Self>() + self.value.len()
    }

    /// Length of the framed on-disk form: key, payload length, payload.
    pub fn encoded_len(&self) -> usize {
        size_of::<i64>() + size_of::<u32>() + self.value.len()
    }
}

impl PartialOrd for SortableFeature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortableFeature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.value.cmp(&other.value))
    }
}
