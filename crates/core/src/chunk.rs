//! Sorted runs of entries and their backing stores.
//!
//! A chunk is either kept in RAM or written to a private temp file. On disk,
//! entries are framed as
//!
//! ```text
//! [ key: i64 LE ][ len: u32 LE ][ payload: len bytes ]
//! ```
//!
//! and the whole stream is optionally passed through a [`Compression`] codec.
//! Both backing stores expose the same forward-only [`ChunkReader`], so the
//! merge does not care where a chunk lives.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::compression::{Compression, SpillReader};
use crate::sortable::SortableFeature;
use crate::{Error, Result};

/// Buffer size for chunk file reads and writes.
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Where a chunk's entries live.
#[derive(Debug)]
pub enum ChunkStore {
    Memory(Vec<SortableFeature>),
    Disk {
        path: PathBuf,
        compression: Compression,
    },
}

/// An immutable run of entries, sorted unless it is still an ingestion run.
#[derive(Debug)]
pub struct Chunk {
    store: ChunkStore,
    entries: usize,
    /// Bytes occupied on disk (0 for in-memory chunks)
    disk_bytes: u64,
}

impl Chunk {
    /// Keep entries in RAM.
    pub fn in_memory(entries: Vec<SortableFeature>) -> Self {
        Self {
            entries: entries.len(),
            store: ChunkStore::Memory(entries),
            disk_bytes: 0,
        }
    }

    /// Write entries to `path` through `compression` and drop them from memory.
    pub fn spill(
        entries: &[SortableFeature],
        path: PathBuf,
        compression: Compression,
    ) -> Result<Self> {
        let disk_bytes = write_entries(&path, entries, compression).map_err(|source| {
            Error::Spill {
                path: path.clone(),
                source,
            }
        })?;
        Ok(Self {
            store: ChunkStore::Disk { path, compression },
            entries: entries.len(),
            disk_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.store, ChunkStore::Disk { .. })
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    /// Load every entry back into memory.
    ///
    /// For disk chunks the file is deleted afterwards, since its contents are
    /// now owned by the caller.
    pub fn load(self) -> Result<Vec<SortableFeature>> {
        match self.store {
            ChunkStore::Memory(entries) => Ok(entries),
            ChunkStore::Disk { path, compression } => {
                let mut reader = ChunkReader::open_disk(path.clone(), compression, self.entries)?;
                let mut entries = Vec::with_capacity(self.entries);
                while let Some(entry) = reader.next_entry()? {
                    entries.push(entry);
                }
                drop(reader);
                fs::remove_file(&path).map_err(|source| Error::Spill { path, source })?;
                Ok(entries)
            }
        }
    }

    /// Open a forward-only reader over the chunk.
    pub fn into_reader(self) -> Result<ChunkReader> {
        match self.store {
            ChunkStore::Memory(entries) => Ok(ChunkReader::Memory(entries.into_iter())),
            ChunkStore::Disk { path, compression } => {
                ChunkReader::open_disk(path, compression, self.entries)
            }
        }
    }
}

/// Forward-only iterator over a chunk's entries.
pub enum ChunkReader {
    Memory(std::vec::IntoIter<SortableFeature>),
    Disk {
        reader: SpillReader<BufReader<File>>,
        path: PathBuf,
        remaining: usize,
    },
}

impl ChunkReader {
    fn open_disk(path: PathBuf, compression: Compression, entries: usize) -> Result<Self> {
        let file = File::open(&path).map_err(|source| Error::Spill {
            path: path.clone(),
            source,
        })?;
        let reader = compression
            .reader(BufReader::with_capacity(IO_BUFFER_SIZE, file))
            .map_err(|source| Error::Spill {
                path: path.clone(),
                source,
            })?;
        Ok(ChunkReader::Disk {
            reader,
            path,
            remaining: entries,
        })
    }

    /// Next entry, or `None` once the chunk is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<SortableFeature>> {
        match self {
            ChunkReader::Memory(iter) => Ok(iter.next()),
            ChunkReader::Disk {
                reader,
                path,
                remaining,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let entry = read_entry(reader).map_err(|source| Error::Spill {
                    path: path.clone(),
                    source,
                })?;
                *remaining -= 1;
                Ok(Some(entry))
            }
        }
    }
}

/// Write framed entries to a new file, returning the file size.
fn write_entries(path: &Path, entries: &[SortableFeature], compression: Compression) -> io::Result<u64> {
    let file = File::create(path)?;
    let mut writer = compression.writer(BufWriter::with_capacity(IO_BUFFER_SIZE, file))?;
    for entry in entries {
        write_entry(&mut writer, entry)?;
    }
    let mut buffered = writer.finish()?;
    buffered.flush()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    Ok(file.metadata()?.len())
}

fn write_entry<W: Write>(writer: &mut W, entry: &SortableFeature) -> io::Result<()> {
    let len = u32::try_from(entry.value.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds chunk framing limit", entry.value.len()),
        )
    })?;
    writer.write_all(&entry.key.to_le_bytes())?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&entry.value)
}

fn read_entry<R: Read>(reader: &mut R) -> io::Result<SortableFeature> {
    let mut key = [0u8; 8];
    reader.read_exact(&mut key)?;
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    // Grow with the bytes actually present, not the length on disk.
    let mut value = Vec::new();
    let read = reader.by_ref().take(len as u64).read_to_end(&mut value)?;
    if read != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("payload truncated: expected {len} bytes, found {read}"),
        ));
    }
    Ok(SortableFeature::new(i64::from_le_bytes(key), value))
}
