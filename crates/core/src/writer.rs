//! Handing grouped tiles to a pool of writer threads.
//!
//! Grouping is sequential (a tile is only complete once the next one starts),
//! but tiles are independent once flushed. [`write_tiles`] drives the tile
//! stream on the calling thread and passes each finished tile over a bounded
//! channel to `threads` writer threads, so tile N+1 is being assembled while
//! tile N is encoded.
//!
//! The first error, from either side, stops the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use xxhash_rust::xxh3::Xxh3;

use crate::feature::AttrValue;
use crate::feature_group::TileFeatures;
use crate::{Error, Result};

/// Tiles buffered per writer thread.
const QUEUE_DEPTH_PER_THREAD: usize = 4;

/// Consumer of finished tiles: encodes and persists them.
///
/// Called concurrently from several writer threads; tiles may arrive out of
/// order.
pub trait TileWriter: Sync {
    fn write_tile(&self, tile: &TileFeatures) -> Result<()>;
}

/// Statistics of a [`write_tiles`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub tiles: u64,
    pub features: u64,
    /// Tiles whose contents equal the tile before them (dedup candidates)
    pub repeated_tiles: u64,
}

/// Group-to-writer hand-off. Returns once every tile is written.
pub fn write_tiles<I, W>(tiles: I, writer: &W, threads: usize) -> Result<WriteStats>
where
    I: IntoIterator<Item = Result<TileFeatures>>,
    W: TileWriter + ?Sized,
{
    let threads = threads.max(1);
    let failed = AtomicBool::new(false);
    let (tx, rx) = bounded::<TileFeatures>(threads * QUEUE_DEPTH_PER_THREAD);

    let (produced, written) = thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let rx = rx.clone();
                let failed = &failed;
                scope.spawn(move || -> Result<()> {
                    for tile in rx.iter() {
                        if failed.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = writer.write_tile(&tile) {
                            failed.store(true, Ordering::Relaxed);
                            return Err(e);
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        drop(rx);

        let produced = feed(tiles, tx, &failed);
        if produced.is_err() {
            failed.store(true, Ordering::Relaxed);
        }

        let mut written = Ok(());
        for worker in workers {
            let result = worker
                .join()
                .unwrap_or_else(|_| Err(Error::Writer("tile writer thread panicked".into())));
            if written.is_ok() {
                written = result;
            }
        }
        (produced, written)
    });

    written?;
    let stats = produced?;
    log::info!(
        "Wrote {} tiles ({} features, {} repeated)",
        stats.tiles,
        stats.features,
        stats.repeated_tiles
    );
    Ok(stats)
}

/// Pull tiles and send them to the writers, stopping early once a writer fails.
fn feed<I>(tiles: I, tx: Sender<TileFeatures>, failed: &AtomicBool) -> Result<WriteStats>
where
    I: IntoIterator<Item = Result<TileFeatures>>,
{
    let mut stats = WriteStats::default();
    let mut previous = None;
    for tile in tiles {
        if failed.load(Ordering::Relaxed) {
            break;
        }
        let tile = tile?;
        let hash = content_hash(&tile);
        if previous == Some(hash) {
            stats.repeated_tiles += 1;
        }
        previous = Some(hash);
        stats.tiles += 1;
        stats.features += tile.feature_count() as u64;
        if tx.send(tile).is_err() {
            break;
        }
    }
    Ok(stats)
}

/// XXH3 hash over a tile's layers and features, ignoring its coordinate and
/// each feature's sort key and group.
pub fn content_hash(tile: &TileFeatures) -> u64 {
    let mut hasher = Xxh3::new();
    for layer in &tile.layers {
        hasher.update(layer.name.as_bytes());
        hasher.update(&(layer.features.len() as u64).to_le_bytes());
        for feature in &layer.features {
            hasher.update(&feature.id.to_le_bytes());
            hasher.update(&(feature.geometry.len() as u64).to_le_bytes());
            hasher.update(&feature.geometry);
            for (name, value) in &feature.attrs {
                hasher.update(name.as_bytes());
                hash_attr(&mut hasher, value);
            }
        }
    }
    hasher.digest()
}

fn hash_attr(hasher: &mut Xxh3, value: &AttrValue) {
    match value {
        AttrValue::String(s) => {
            hasher.update(&[0]);
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        AttrValue::Int(v) => {
            hasher.update(&[1]);
            hasher.update(&v.to_le_bytes());
        }
        AttrValue::UInt(v) => {
            hasher.update(&[2]);
            hasher.update(&v.to_le_bytes());
        }
        AttrValue::Float(v) => {
            hasher.update(&[3]);
            hasher.update(&v.to_bits().to_le_bytes());
        }
        AttrValue::Bool(v) => {
            hasher.update(&[4, *v as u8]);
        }
    }
}
