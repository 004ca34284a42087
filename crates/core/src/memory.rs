//! Byte-budget helpers for chunk accumulation.

use crate::sortable::SortableFeature;

/// Entries accumulated by one producer before they become a chunk.
///
/// Full when either the entry count or the estimated byte size reaches its
/// limit, whichever comes first.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    entries: Vec<SortableFeature>,
    bytes: usize,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: SortableFeature) {
        self.bytes += entry.estimated_size();
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated bytes held by the buffered entries.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_full(&self, max_entries: usize, max_bytes: usize) -> bool {
        self.entries.len() >= max_entries || self.bytes >= max_bytes
    }

    /// Hand the buffered entries over and reset the buffer.
    pub fn take(&mut self) -> Vec<SortableFeature> {
        self.bytes = 0;
        std::mem::take(&mut self.entries)
    }
}

/// Format bytes as human-readable string (KB, MB, GB).
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
