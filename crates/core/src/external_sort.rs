//! Disk-spilling parallel external sort of [`SortableFeature`] entries.
//!
//! # How It Works
//!
//! 1. Producers call [`ExternalSorter::add`] or write through their own
//!    [`SorterWriter`]. Entries accumulate in a buffer; whenever a buffer
//!    reaches the entry or byte threshold it is written to the run's temp
//!    directory as an unsorted run (or kept in RAM in memory mode).
//! 2. [`ExternalSorter::sort`] consumes the sorter. Every run is loaded,
//!    sorted and written back as a chunk on a rayon pool of `workers` threads.
//! 3. [`SortedFeatures::iter`] k-way merges the chunks. With more chunks than
//!    `merge_fan_in`, groups of chunks are merged on background threads that
//!    feed bounded channels, and a final merge reads from those channels.
//!
//! The output is the same total order whatever the worker count, chunk size
//! or compression. If nothing ever had to be spilled, all chunks stay in RAM.
//!
//! # Example
//!
//! ```
//! use tilestream_core::external_sort::{ExternalSorter, SortConfig};
//! use tilestream_core::sortable::SortableFeature;
//!
//! let sorter = ExternalSorter::new(SortConfig::default().with_in_memory(true))?;
//! sorter.add(SortableFeature::new(2, b"b".to_vec()))?;
//! sorter.add(SortableFeature::new(1, b"a".to_vec()))?;
//!
//! let sorted = sorter.sort()?.to_vec()?;
//! assert_eq!(sorted[0].key, 1);
//! # Ok::<(), tilestream_core::Error>(())
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use tempfile::TempDir;

use crate::chunk::Chunk;
use crate::compression::Compression;
use crate::memory::{format_bytes, ChunkBuffer};
use crate::merge::{merge_pull, PullMerge};
use crate::sortable::SortableFeature;
use crate::{Error, Result};

/// Entries per message sent from a background merge to the final merge.
const MERGE_BATCH_SIZE: usize = 4096;

/// Batches buffered per background merge before it blocks.
const MERGE_CHANNEL_CAPACITY: usize = 4;

/// A fallible "next entry" function, one per merge input.
type Source = Box<dyn FnMut() -> Result<Option<SortableFeature>> + Send>;

/// Configuration for an external sort run.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Threads used to sort chunks
    pub workers: usize,
    /// Maximum entries per chunk
    pub chunk_max_entries: usize,
    /// Maximum estimated bytes per chunk
    pub chunk_max_bytes: usize,
    /// Codec for chunk files
    pub compression: Compression,
    /// Parent directory for the run's temp directory (system default if None)
    pub temp_dir: Option<PathBuf>,
    /// Never touch disk; every chunk stays in RAM
    pub in_memory: bool,
    /// Maximum inputs of a single merge before merging in two levels
    pub merge_fan_in: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            chunk_max_entries: 2_000_000,
            chunk_max_bytes: 256 * 1024 * 1024,
            compression: Compression::None,
            temp_dir: None,
            in_memory: false,
            merge_fan_in: 64,
        }
    }
}

impl SortConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_chunk_max_entries(mut self, entries: usize) -> Self {
        self.chunk_max_entries = entries;
        self
    }

    pub fn with_chunk_max_bytes(mut self, bytes: usize) -> Self {
        self.chunk_max_bytes = bytes;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn with_merge_fan_in(mut self, fan_in: usize) -> Self {
        self.merge_fan_in = fan_in;
        self
    }

    /// Reject settings the sorter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if self.chunk_max_entries == 0 || self.chunk_max_bytes == 0 {
            return Err(Error::InvalidConfig(
                "chunk limits must be greater than zero".into(),
            ));
        }
        if self.merge_fan_in < 2 {
            return Err(Error::InvalidConfig(
                "merge fan-in must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// Statistics of a completed sort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortStats {
    pub entries: u64,
    pub chunks: usize,
    /// Bytes of chunk files on disk, after compression
    pub bytes_spilled: u64,
    /// True when no chunk was written to disk
    pub in_memory: bool,
}

/// Accepting side of an external sort.
///
/// Shared between producer threads by reference; [`sort`](Self::sort) takes
/// it by value, so every [`SorterWriter`] must be dropped first.
pub struct ExternalSorter {
    config: SortConfig,
    temp_dir: Option<TempDir>,
    /// Runs produced so far, unsorted
    runs: Mutex<Vec<Chunk>>,
    /// Buffer behind [`ExternalSorter::add`]
    shared: Mutex<ChunkBuffer>,
    next_run: AtomicUsize,
    entries: AtomicU64,
}

impl ExternalSorter {
    /// Create a sorter, making its private temp directory unless running in
    /// memory.
    pub fn new(config: SortConfig) -> Result<Self> {
        config.validate()?;
        let temp_dir = if config.in_memory {
            None
        } else {
            let mut builder = tempfile::Builder::new();
            builder.prefix("tilestream-sort-");
            let dir = match &config.temp_dir {
                Some(parent) => builder.tempdir_in(parent)?,
                None => builder.tempdir()?,
            };
            log::debug!("Sort spill directory: {}", dir.path().display());
            Some(dir)
        };

        Ok(Self {
            config,
            temp_dir,
            runs: Mutex::new(Vec::new()),
            shared: Mutex::new(ChunkBuffer::new()),
            next_run: AtomicUsize::new(0),
            entries: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Entries added so far.
    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add one entry through the shared buffer. Safe to call from many threads.
    pub fn add(&self, entry: SortableFeature) -> Result<()> {
        self.entries.fetch_add(1, Ordering::Relaxed);
        let full = {
            let mut buffer = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(entry);
            self.is_full(&buffer).then(|| buffer.take())
        };
        match full {
            Some(entries) => self.spill_run(entries),
            None => Ok(()),
        }
    }

    /// A producer handle with its own buffer, for contention-free ingestion.
    pub fn writer(&self) -> SorterWriter<'_> {
        SorterWriter {
            sorter: self,
            buffer: ChunkBuffer::new(),
        }
    }

    fn is_full(&self, buffer: &ChunkBuffer) -> bool {
        buffer.is_full(self.config.chunk_max_entries, self.config.chunk_max_bytes)
    }

    /// Hand a full buffer over as an unsorted run.
    fn spill_run(&self, entries: Vec<SortableFeature>) -> Result<()> {
        let run = match &self.temp_dir {
            None => Chunk::in_memory(entries),
            Some(dir) => {
                let index = self.next_run.fetch_add(1, Ordering::Relaxed);
                let path = dir.path().join(format!("run_{index:06}.bin"));
                log::debug!("Spilling run {} ({} entries)", index, entries.len());
                Chunk::spill(&entries, path, Compression::None)?
            }
        };
        self.push_run(run);
        Ok(())
    }

    fn push_run(&self, run: Chunk) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(run);
    }

    /// Sort every run in parallel and return the readable output.
    pub fn sort(self) -> Result<SortedFeatures> {
        let ExternalSorter {
            config,
            temp_dir,
            runs,
            shared,
            entries,
            ..
        } = self;

        let mut runs = runs.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut residual = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !residual.is_empty() {
            runs.push(Chunk::in_memory(residual.take()));
        }
        let entries = entries.into_inner();

        // Everything fit in the buffers: skip the disk entirely.
        let temp_dir = temp_dir.filter(|_| runs.iter().any(Chunk::is_on_disk));
        let spill_dir = temp_dir.as_ref().map(|dir| dir.path().to_path_buf());

        log::info!(
            "Sorting {} entries in {} chunks using {} workers",
            entries,
            runs.len(),
            config.workers
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("sort-worker-{i}"))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to start sort workers: {e}")))?;

        let compression = config.compression;
        let chunks = pool.install(|| {
            runs.into_par_iter()
                .enumerate()
                .map(|(index, run)| sort_chunk(index, run, spill_dir.as_deref(), compression))
                .collect::<Result<Vec<_>>>()
        })?;

        let stats = SortStats {
            entries,
            chunks: chunks.len(),
            bytes_spilled: chunks.iter().map(Chunk::disk_bytes).sum(),
            in_memory: temp_dir.is_none(),
        };
        if stats.in_memory {
            log::info!("Sorted {} entries in memory", stats.entries);
        } else {
            log::info!(
                "Sorted {} entries into {} chunks ({} on disk, {})",
                stats.entries,
                stats.chunks,
                format_bytes(stats.bytes_spilled),
                compression.name()
            );
        }

        Ok(SortedFeatures {
            chunks,
            temp_dir,
            merge_fan_in: config.merge_fan_in,
            stats,
        })
    }
}

fn sort_chunk(
    index: usize,
    run: Chunk,
    spill_dir: Option<&Path>,
    compression: Compression,
) -> Result<Chunk> {
    let mut entries = run.load()?;
    entries.sort_unstable();
    match spill_dir {
        None => Ok(Chunk::in_memory(entries)),
        Some(dir) => Chunk::spill(
            &entries,
            dir.join(format!("chunk_{index:06}.bin")),
            compression,
        ),
    }
}

/// Per-producer buffered handle onto an [`ExternalSorter`].
///
/// Full buffers are spilled as they fill. Whatever is left when the handle
/// is dropped is handed to the sorter in memory.
pub struct SorterWriter<'a> {
    sorter: &'a ExternalSorter,
    buffer: ChunkBuffer,
}

impl SorterWriter<'_> {
    pub fn add(&mut self, entry: SortableFeature) -> Result<()> {
        self.sorter.entries.fetch_add(1, Ordering::Relaxed);
        self.buffer.push(entry);
        if self.sorter.is_full(&self.buffer) {
            self.sorter.spill_run(self.buffer.take())?;
        }
        Ok(())
    }
}

impl Drop for SorterWriter<'_> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            self.sorter.push_run(Chunk::in_memory(self.buffer.take()));
        }
    }
}

/// Readable side of an external sort: sorted chunks waiting to be merged.
pub struct SortedFeatures {
    chunks: Vec<Chunk>,
    temp_dir: Option<TempDir>,
    merge_fan_in: usize,
    stats: SortStats,
}

impl SortedFeatures {
    pub fn stats(&self) -> &SortStats {
        &self.stats
    }

    pub fn len(&self) -> u64 {
        self.stats.entries
    }

    pub fn is_empty(&self) -> bool {
        self.stats.entries == 0
    }

    /// Directory holding chunk files, if any were written.
    pub fn spill_dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Stream all entries in sorted order.
    pub fn iter(self) -> Result<SortedIter> {
        let SortedFeatures {
            chunks,
            temp_dir,
            merge_fan_in,
            ..
        } = self;

        if chunks.len() <= merge_fan_in {
            let sources = chunks
                .into_iter()
                .map(chunk_source)
                .collect::<Result<Vec<_>>>()?;
            return Ok(SortedIter {
                merge: Some(merge_pull(sources)?),
                workers: Vec::new(),
                _temp_dir: temp_dir,
            });
        }

        let group_size = chunks.len().div_ceil(merge_fan_in);
        log::debug!(
            "Merging {} chunks in groups of {}",
            chunks.len(),
            group_size
        );

        let mut chunks = chunks.into_iter().peekable();
        let mut sources = Vec::new();
        let mut workers = Vec::new();
        let mut group_index = 0;
        while chunks.peek().is_some() {
            let group = chunks
                .by_ref()
                .take(group_size)
                .map(chunk_source)
                .collect::<Result<Vec<_>>>()?;
            let (tx, rx) = bounded(MERGE_CHANNEL_CAPACITY);
            let handle = thread::Builder::new()
                .name(format!("sort-merge-{group_index}"))
                .spawn(move || merge_group(group, tx))?;
            workers.push(handle);
            sources.push(channel_source(rx));
            group_index += 1;
        }

        Ok(SortedIter {
            merge: Some(merge_pull(sources)?),
            workers,
            _temp_dir: temp_dir,
        })
    }

    /// Collect all entries in sorted order.
    pub fn to_vec(self) -> Result<Vec<SortableFeature>> {
        self.iter()?.collect()
    }
}

fn chunk_source(chunk: Chunk) -> Result<Source> {
    let mut reader = chunk.into_reader()?;
    Ok(Box::new(move || reader.next_entry()))
}

fn channel_source(rx: Receiver<Result<Vec<SortableFeature>>>) -> Source {
    let mut batch = Vec::new().into_iter();
    Box::new(move || loop {
        if let Some(entry) = batch.next() {
            return Ok(Some(entry));
        }
        match rx.recv() {
            Ok(Ok(next)) => batch = next.into_iter(),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(None),
        }
    })
}

/// Merge one group of chunks and forward the result in batches.
///
/// Returns early once the receiving side has gone away.
fn merge_group(sources: Vec<Source>, tx: Sender<Result<Vec<SortableFeature>>>) {
    let merge = match merge_pull(sources) {
        Ok(merge) => merge,
        Err(e) => {
            let _ = tx.send(Err(e));
            return;
        }
    };

    let mut batch = Vec::with_capacity(MERGE_BATCH_SIZE);
    for entry in merge {
        match entry {
            Ok(entry) => {
                batch.push(entry);
                if batch.len() >= MERGE_BATCH_SIZE {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(MERGE_BATCH_SIZE));
                    if tx.send(Ok(full)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
    if !batch.is_empty() {
        let _ = tx.send(Ok(batch));
    }
}

/// Sorted stream over the output of an external sort.
///
/// Owns the spill directory; it is removed when the iterator is dropped,
/// whether or not it was read to the end.
pub struct SortedIter {
    merge: Option<PullMerge<SortableFeature, Source>>,
    workers: Vec<JoinHandle<()>>,
    _temp_dir: Option<TempDir>,
}

impl SortedIter {
    fn join_workers(&mut self) -> Result<()> {
        let mut result = Ok(());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                result = Err(Error::Io(io::Error::other("sort merge worker panicked")));
            }
        }
        result
    }
}

impl Iterator for SortedIter {
    type Item = Result<SortableFeature>;

    fn next(&mut self) -> Option<Self::Item> {
        let merge = self.merge.as_mut()?;
        match merge.next() {
            Some(item) => Some(item),
            None => {
                self.merge = None;
                self.join_workers().err().map(Err)
            }
        }
    }
}

impl Drop for SortedIter {
    fn drop(&mut self) {
        // Closing the receivers unblocks the background merges.
        self.merge = None;
        let _ = self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Deterministic pseudo-random entries with plenty of duplicate keys.
    fn entries(count: usize, seed: u64) -> Vec<SortableFeature> {
        let mut state = seed;
        (0..count)
            .map(|i| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let key = ((state >> 33) % 500) as i64 - 250;
                SortableFeature::new(key, vec![(i % 3) as u8, (state >> 56) as u8])
            })
            .collect()
    }

    fn sorted(mut entries: Vec<SortableFeature>) -> Vec<SortableFeature> {
        entries.sort();
        entries
    }

    fn run(config: SortConfig, input: &[SortableFeature]) -> Vec<SortableFeature> {
        let sorter = ExternalSorter::new(config).unwrap();
        for entry in input {
            sorter.add(entry.clone()).unwrap();
        }
        sorter.sort().unwrap().to_vec().unwrap()
    }

    // -------------------------------------------------------------------------
    // Basic behavior
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_sorter() {
        let sorter = ExternalSorter::new(SortConfig::default()).unwrap();
        assert!(sorter.is_empty());
        let output = sorter.sort().unwrap();
        assert!(output.is_empty());
        assert_eq!(output.stats().chunks, 0);
        assert!(output.to_vec().unwrap().is_empty());
    }

    #[test]
    fn test_sorts_reversed_input_across_chunks() {
        let input: Vec<_> = (0..1000)
            .rev()
            .map(|i| SortableFeature::new(i, vec![i as u8]))
            .collect();
        let output = run(
            SortConfig::default().with_chunk_max_entries(100),
            &input,
        );
        assert_eq!(output.len(), 1000);
        for (i, entry) in output.iter().enumerate() {
            assert_eq!(entry.key, i as i64, "entry {} out of place", i);
        }
    }

    #[test]
    fn test_equal_keys_ordered_by_payload() {
        let input = vec![
            SortableFeature::new(5, vec![3]),
            SortableFeature::new(5, vec![1]),
            SortableFeature::new(5, vec![2]),
        ];
        let output = run(SortConfig::default().with_chunk_max_entries(1), &input);
        let payloads: Vec<u8> = output.iter().map(|e| e.value[0]).collect();
        assert_eq!(payloads, vec![1, 2, 3]);
    }

    #[test]
    fn test_output_independent_of_workers_and_chunk_size() {
        let input = entries(2000, 7);
        let expected = sorted(input.clone());
        for workers in [1, 2, 4] {
            for chunk_entries in [1, 7, 100, 10_000] {
                let config = SortConfig::default()
                    .with_workers(workers)
                    .with_chunk_max_entries(chunk_entries);
                assert_eq!(
                    run(config, &input),
                    expected,
                    "workers={} chunk_entries={}",
                    workers,
                    chunk_entries
                );
            }
        }
    }

    #[test]
    fn test_byte_threshold_splits_chunks() {
        let input = entries(500, 3);
        let sorter =
            ExternalSorter::new(SortConfig::default().with_chunk_max_bytes(2048)).unwrap();
        for entry in &input {
            sorter.add(entry.clone()).unwrap();
        }
        let output = sorter.sort().unwrap();
        assert!(output.stats().chunks > 1);
        assert_eq!(output.to_vec().unwrap(), sorted(input));
    }

    #[test]
    fn test_every_compression_sorts_identically() {
        let input = entries(1500, 11);
        let expected = sorted(input.clone());
        for compression in [
            Compression::None,
            Compression::Gzip,
            Compression::Zstd,
            Compression::Brotli,
        ] {
            let config = SortConfig::default()
                .with_chunk_max_entries(200)
                .with_compression(compression);
            assert_eq!(run(config, &input), expected, "{}", compression.name());
        }
    }

    #[test]
    fn test_two_level_merge() {
        let input = entries(3000, 5);
        let sorter = ExternalSorter::new(
            SortConfig::default()
                .with_chunk_max_entries(50)
                .with_merge_fan_in(4),
        )
        .unwrap();
        for entry in &input {
            sorter.add(entry.clone()).unwrap();
        }
        let output = sorter.sort().unwrap();
        assert_eq!(output.stats().chunks, 60);
        assert_eq!(output.to_vec().unwrap(), sorted(input));
    }

    #[test]
    fn test_two_level_merge_reports_truncated_chunk() {
        let sorter = ExternalSorter::new(
            SortConfig::default()
                .with_chunk_max_entries(50)
                .with_compression(Compression::None)
                .with_merge_fan_in(2),
        )
        .unwrap();
        for entry in entries(3000, 13) {
            sorter.add(entry).unwrap();
        }
        let output = sorter.sort().unwrap();
        assert_eq!(output.stats().chunks, 60);

        let broken = output.spill_dir().unwrap().join("chunk_000007.bin");
        let bytes = std::fs::read(&broken).unwrap();
        std::fs::write(&broken, &bytes[..bytes.len() / 2]).unwrap();

        let err = match output.iter() {
            Ok(mut iter) => iter
                .find_map(|entry| entry.err())
                .expect("truncated chunk should fail the merge"),
            Err(e) => e,
        };
        match err {
            Error::Spill { path, .. } => assert_eq!(path, broken),
            other => panic!("expected spill error, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------------
    // Storage modes and cleanup
    // -------------------------------------------------------------------------

    #[test]
    fn test_memory_mode_never_spills() {
        let input = entries(1000, 9);
        let sorter = ExternalSorter::new(
            SortConfig::default()
                .with_in_memory(true)
                .with_chunk_max_entries(64),
        )
        .unwrap();
        for entry in &input {
            sorter.add(entry.clone()).unwrap();
        }
        let output = sorter.sort().unwrap();
        assert!(output.stats().in_memory);
        assert_eq!(output.stats().bytes_spilled, 0);
        assert!(output.spill_dir().is_none());
        assert_eq!(output.to_vec().unwrap(), sorted(input));
    }

    #[test]
    fn test_small_input_stays_in_memory() {
        let input = entries(100, 1);
        let sorter = ExternalSorter::new(SortConfig::default()).unwrap();
        for entry in &input {
            sorter.add(entry.clone()).unwrap();
        }
        let output = sorter.sort().unwrap();
        assert!(output.stats().in_memory);
        assert_eq!(output.stats().entries, 100);
    }

    #[test]
    fn test_spilled_sort_reports_disk_usage() {
        let sorter =
            ExternalSorter::new(SortConfig::default().with_chunk_max_entries(10)).unwrap();
        for entry in entries(100, 2) {
            sorter.add(entry).unwrap();
        }
        let output = sorter.sort().unwrap();
        let stats = output.stats().clone();
        assert!(!stats.in_memory);
        assert_eq!(stats.chunks, 10);
        assert!(stats.bytes_spilled > 0);
    }

    #[test]
    fn test_temp_dir_removed_on_drop() {
        let parent = tempfile::TempDir::new().unwrap();
        let sorter = ExternalSorter::new(
            SortConfig::default()
                .with_temp_dir(parent.path())
                .with_chunk_max_entries(10),
        )
        .unwrap();
        for entry in entries(200, 4) {
            sorter.add(entry).unwrap();
        }
        let output = sorter.sort().unwrap();
        let spill_dir = output.spill_dir().unwrap().to_path_buf();
        assert!(spill_dir.starts_with(parent.path()));
        assert!(spill_dir.exists());

        // Abandon the stream part way through.
        let mut iter = output.iter().unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(spill_dir.exists());
        drop(iter);
        assert!(!spill_dir.exists());
    }

    #[test]
    fn test_temp_dir_removed_when_sorter_dropped_unsorted() {
        let parent = tempfile::TempDir::new().unwrap();
        let sorter = ExternalSorter::new(
            SortConfig::default()
                .with_temp_dir(parent.path())
                .with_chunk_max_entries(5),
        )
        .unwrap();
        for entry in entries(50, 6) {
            sorter.add(entry).unwrap();
        }
        drop(sorter);
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    // -------------------------------------------------------------------------
    // Concurrent producers
    // -------------------------------------------------------------------------

    #[test]
    fn test_concurrent_writers() {
        let sorter =
            ExternalSorter::new(SortConfig::default().with_chunk_max_entries(64)).unwrap();
        let inputs: Vec<_> = (0..4).map(|seed| entries(500, seed)).collect();

        thread::scope(|scope| {
            for input in &inputs {
                let sorter = &sorter;
                scope.spawn(move || {
                    let mut writer = sorter.writer();
                    for entry in input {
                        writer.add(entry.clone()).unwrap();
                    }
                });
            }
        });

        assert_eq!(sorter.len(), 2000);
        let output = sorter.sort().unwrap().to_vec().unwrap();
        assert_eq!(output, sorted(inputs.concat()));
    }

    #[test]
    fn test_concurrent_shared_add() {
        let sorter =
            ExternalSorter::new(SortConfig::default().with_chunk_max_entries(33)).unwrap();
        let inputs: Vec<_> = (10..13).map(|seed| entries(300, seed)).collect();

        thread::scope(|scope| {
            for input in &inputs {
                let sorter = &sorter;
                scope.spawn(move || {
                    for entry in input {
                        sorter.add(entry.clone()).unwrap();
                    }
                });
            }
        });

        let output = sorter.sort().unwrap().to_vec().unwrap();
        assert_eq!(output, sorted(inputs.concat()));
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    #[test]
    fn test_invalid_config_rejected() {
        for config in [
            SortConfig::default().with_workers(0),
            SortConfig::default().with_chunk_max_entries(0),
            SortConfig::default().with_chunk_max_bytes(0),
            SortConfig::default().with_merge_fan_in(1),
        ] {
            assert!(matches!(
                ExternalSorter::new(config),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sort_matches_std_sort(
            keys in proptest::collection::vec(any::<i64>(), 0..300),
            chunk_entries in 1usize..50,
            workers in 1usize..4,
        ) {
            let input: Vec<_> = keys
                .iter()
                .map(|&k| SortableFeature::new(k, k.to_le_bytes()[..2].to_vec()))
                .collect();
            let config = SortConfig::default()
                .with_in_memory(true)
                .with_workers(workers)
                .with_chunk_max_entries(chunk_entries)
                .with_merge_fan_in(3);
            prop_assert_eq!(run(config, &input), sorted(input));
        }
    }
}
