//! Core library for collecting rendered map features and regrouping them
//! into tiles.
//!
//! Features arrive from many producer threads in no particular order. Each is
//! packed into a [`SortableFeature`] whose 64-bit key orders it by tile,
//! layer, draw order and group flag; an external sort that spills to disk
//! brings the stream into key order; and a single pass over the merged stream
//! cuts it back into per-tile, per-layer batches while enforcing group limits.
//!
//! # Examples
//!
//! ```no_run
//! use geo::{point, Geometry};
//! use tilestream_core::{FeatureGroup, GroupConfig, RenderedFeature, TileCoord};
//!
//! let group = FeatureGroup::new(GroupConfig::default())?;
//! let feature = RenderedFeature::new(
//!     TileCoord::new(0, 0, 0),
//!     "places",
//!     1,
//!     Geometry::Point(point!(x: 0.0, y: 0.0)),
//! )
//! .with_group(1, 10);
//! group.accept(&feature)?;
//!
//! for tile in group.prepare()?.tiles()? {
//!     let tile = tile?;
//!     println!("{}: {} features", tile.coord, tile.feature_count());
//! }
//! # Ok::<(), tilestream_core::Error>(())
//! ```

use std::path::PathBuf;

use thiserror::Error;

pub mod chunk;
pub mod compression;
pub mod external_sort;
pub mod feature;
pub mod feature_group;
pub mod heap;
pub mod layer;
pub mod memory;
pub mod merge;
pub mod sort_key;
pub mod sortable;
pub mod tile;
pub mod writer;

pub use compression::Compression;
pub use external_sort::{ExternalSorter, SortConfig, SortStats, SortedFeatures};
pub use feature::{AttrValue, GroupInfo, PayloadError, RenderedFeature, TileFeature};
pub use feature_group::{FeatureGroup, GroupConfig, LayerFeatures, TileFeatures};
pub use heap::{FeatureMinHeap, HeapError, LongMinHeap};
pub use sortable::SortableFeature;
pub use tile::TileCoord;
pub use writer::{write_tiles, TileWriter, WriteStats};

/// Errors that can occur while collecting, sorting or grouping features
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to access sort chunk {}: {source}", .path.display())]
    Spill {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt feature in tile {tile}: {reason}")]
    CorruptFeature { tile: TileCoord, reason: String },

    #[error("Feature payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Too many layers: cannot add {name:?}, at most {max} are supported")]
    TooManyLayers { name: String, max: usize },

    #[error("Tile writer failed: {0}")]
    Writer(String),

    #[error("Heap misuse: {0}")]
    Heap(#[from] HeapError),

    #[error("Invalid tile coordinate {0}")]
    InvalidTile(TileCoord),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
