//! Collecting rendered features and regrouping them into tiles.
//!
//! # Pipeline
//!
//! 1. [`FeatureGroup::accept`] (or a per-thread [`FeatureWriter`]) packs each
//!    [`RenderedFeature`] into a [`SortableFeature`]: tile, layer, draw order
//!    and group flag go into the key, everything else into the payload.
//! 2. [`FeatureGroup::prepare`] runs the external sort.
//! 3. [`PreparedFeatures::tiles`] walks the sorted stream once. Consecutive
//!    entries with the same tile form a [`TileFeatures`]; within it, runs of
//!    the same layer form a [`LayerFeatures`].
//!
//! # Group limits
//!
//! Entries with a group are counted per tile, layer and group id. Since the
//! stream is ordered by draw order within a layer, the members that survive
//! a limit of `n` are the `n` with the lowest draw order. Each survivor gets a
//! 1-based rank attribute unless it already has one.
//!
//! # Example
//!
//! ```
//! use geo::{point, Geometry};
//! use tilestream_core::feature::RenderedFeature;
//! use tilestream_core::feature_group::{FeatureGroup, GroupConfig};
//! use tilestream_core::external_sort::SortConfig;
//! use tilestream_core::tile::TileCoord;
//!
//! let config = GroupConfig::default().with_sort(SortConfig::default().with_in_memory(true));
//! let group = FeatureGroup::new(config)?;
//! let tile = TileCoord::new(0, 0, 0);
//! for (id, order) in [(1, 5), (2, -5)] {
//!     let geom = Geometry::Point(point!(x: 0.0, y: 0.0));
//!     group.accept(&RenderedFeature::new(tile, "poi", id, geom).with_sort_key(order))?;
//! }
//!
//! let tiles: Vec<_> = group.prepare()?.tiles()?.collect::<Result<_, _>>()?;
//! let ids: Vec<u64> = tiles[0].layers[0].features.iter().map(|f| f.id).collect();
//! assert_eq!(ids, vec![2, 1]);
//! # Ok::<(), tilestream_core::Error>(())
//! ```

use std::collections::HashMap;

use geo::Geometry;

use crate::external_sort::{ExternalSorter, SortConfig, SortStats, SortedFeatures, SortedIter, SorterWriter};
use crate::feature::{
    decode_payload, encode_payload, geometry_to_wkb, AttrValue, RenderedFeature, TileFeature,
};
use crate::layer::{LayerRegistry, LayerStats};
use crate::sort_key::{decode_key, encode_key, KeyParts};
use crate::sortable::SortableFeature;
use crate::tile::TileCoord;
use crate::{Error, Result};

/// Per-layer post-processing hook: `(layer name, zoom, features)` to the
/// layer's final feature list.
///
/// If the hook fails, the failure is logged and the layer keeps its
/// unprocessed features.
pub type PostProcess = Box<dyn Fn(&str, u8, Vec<TileFeature>) -> Result<Vec<TileFeature>> + Send + Sync>;

/// Configuration for collecting and grouping features.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub sort: SortConfig,
    /// Attribute stamped with a survivor's 1-based rank within its group
    pub rank_attribute: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            sort: SortConfig::default(),
            rank_attribute: "rank".to_string(),
        }
    }
}

impl GroupConfig {
    pub fn with_sort(mut self, sort: SortConfig) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_rank_attribute(mut self, name: impl Into<String>) -> Self {
        self.rank_attribute = name.into();
        self
    }
}

/// Collects rendered features from any number of threads.
pub struct FeatureGroup {
    sorter: ExternalSorter,
    layers: LayerRegistry,
    rank_attribute: String,
    post_process: Option<PostProcess>,
}

impl FeatureGroup {
    pub fn new(config: GroupConfig) -> Result<Self> {
        Ok(Self {
            sorter: ExternalSorter::new(config.sort)?,
            layers: LayerRegistry::new(),
            rank_attribute: config.rank_attribute,
            post_process: None,
        })
    }

    /// Install the per-layer hook run on every flushed layer.
    pub fn with_post_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, u8, Vec<TileFeature>) -> Result<Vec<TileFeature>> + Send + Sync + 'static,
    {
        self.post_process = Some(Box::new(hook));
        self
    }

    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }

    /// Features accepted so far.
    pub fn len(&self) -> u64 {
        self.sorter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorter.is_empty()
    }

    /// Pack a rendered feature into a sort entry.
    pub fn encode(&self, feature: &RenderedFeature) -> Result<SortableFeature> {
        if !feature.tile.is_valid() {
            return Err(Error::InvalidTile(feature.tile));
        }
        let layer = self.layers.id_for(&feature.layer)?;
        let key = encode_key(
            feature.tile.encoded(),
            layer,
            feature.sort_key,
            feature.group.is_some(),
        );
        let geometry = geometry_to_wkb(&feature.geometry)?;
        let value = encode_payload(feature.id, &geometry, &feature.attrs, feature.group)?;
        Ok(SortableFeature::new(key, value))
    }

    /// Add one feature through the shared buffer.
    pub fn accept(&self, feature: &RenderedFeature) -> Result<()> {
        self.sorter.add(self.encode(feature)?)
    }

    /// A buffered per-producer handle. Must be dropped before [`prepare`](Self::prepare).
    pub fn writer(&self) -> FeatureWriter<'_> {
        FeatureWriter {
            group: self,
            inner: self.sorter.writer(),
        }
    }

    /// Sort everything accepted so far.
    pub fn prepare(self) -> Result<PreparedFeatures> {
        let sorted = self.sorter.sort()?;
        Ok(PreparedFeatures {
            sorted,
            layers: self.layers.into_names(),
            rank_attribute: self.rank_attribute,
            post_process: self.post_process,
        })
    }
}

/// Per-thread producer handle onto a [`FeatureGroup`].
pub struct FeatureWriter<'a> {
    group: &'a FeatureGroup,
    inner: SorterWriter<'a>,
}

impl FeatureWriter<'_> {
    pub fn accept(&mut self, feature: &RenderedFeature) -> Result<()> {
        let entry = self.group.encode(feature)?;
        self.inner.add(entry)
    }
}

/// Sorted features waiting to be grouped into tiles.
pub struct PreparedFeatures {
    sorted: SortedFeatures,
    layers: Vec<String>,
    rank_attribute: String,
    post_process: Option<PostProcess>,
}

impl PreparedFeatures {
    pub fn sort_stats(&self) -> &SortStats {
        self.sorted.stats()
    }

    pub fn layer_names(&self) -> &[String] {
        &self.layers
    }

    /// Stream of grouped tiles in tile id order.
    pub fn tiles(self) -> Result<TileIter> {
        let layer_stats = vec![LayerStats::default(); self.layers.len()];
        Ok(TileIter {
            entries: self.sorted.iter()?,
            pending: None,
            layers: self.layers,
            rank_attribute: self.rank_attribute,
            post_process: self.post_process,
            layer_stats,
            tiles: 0,
            done: false,
        })
    }
}

/// All surviving features of one layer in one tile, in output order.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerFeatures {
    pub name: String,
    pub features: Vec<TileFeature>,
}

impl LayerFeatures {
    /// Decoded geometries of the layer's features.
    ///
    /// A feature whose geometry cannot be decoded is logged and left out.
    pub fn geometries(&self) -> Vec<(&TileFeature, Geometry)> {
        self.features
            .iter()
            .filter_map(|feature| match feature.geometry() {
                Ok(geometry) => Some((feature, geometry)),
                Err(e) => {
                    log::warn!(
                        "Dropping feature {} in layer {}: {}",
                        feature.id,
                        self.name,
                        e
                    );
                    None
                }
            })
            .collect()
    }
}

/// One output tile: its coordinate and its non-empty layers in layer id order.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFeatures {
    pub coord: TileCoord,
    pub layers: Vec<LayerFeatures>,
}

impl TileFeatures {
    pub fn new(coord: TileCoord) -> Self {
        Self {
            coord,
            layers: Vec::new(),
        }
    }

    pub fn tile_id(&self) -> u32 {
        self.coord.encoded()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.layers.iter().map(|l| l.features.len()).sum()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerFeatures> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Same tile with pairwise same-contents features in every layer.
    pub fn has_same_contents(&self, other: &TileFeatures) -> bool {
        self.coord == other.coord
            && self.layers.len() == other.layers.len()
            && self.layers.iter().zip(&other.layers).all(|(a, b)| {
                a.name == b.name
                    && a.features.len() == b.features.len()
                    && a.features
                        .iter()
                        .zip(&b.features)
                        .all(|(fa, fb)| fa.has_same_contents(fb))
            })
    }
}

/// Features of the layer currently being accumulated.
struct LayerAccumulator {
    id: u8,
    features: Vec<TileFeature>,
    /// Survivors so far per group id
    group_counts: HashMap<i64, u64>,
    dropped: u64,
}

impl LayerAccumulator {
    fn new(id: u8) -> Self {
        Self {
            id,
            features: Vec::new(),
            group_counts: HashMap::new(),
            dropped: 0,
        }
    }
}

/// Iterator over grouped tiles, created by [`PreparedFeatures::tiles`].
///
/// Yields tiles in ascending tile id. The first error ends the stream.
pub struct TileIter {
    entries: SortedIter,
    /// First entry of the next tile, read while finishing the previous one
    pending: Option<SortableFeature>,
    layers: Vec<String>,
    rank_attribute: String,
    post_process: Option<PostProcess>,
    layer_stats: Vec<LayerStats>,
    tiles: u64,
    done: bool,
}

impl TileIter {
    /// Statistics per layer name for the tiles emitted so far.
    pub fn layer_stats(&self) -> impl Iterator<Item = (&str, &LayerStats)> {
        self.layers
            .iter()
            .map(String::as_str)
            .zip(self.layer_stats.iter())
    }

    /// Tiles emitted so far.
    pub fn tiles_emitted(&self) -> u64 {
        self.tiles
    }

    fn next_entry(&mut self) -> Result<Option<SortableFeature>> {
        if let Some(entry) = self.pending.take() {
            return Ok(Some(entry));
        }
        self.entries.next().transpose()
    }

    /// Assemble the next tile that has at least one feature.
    fn next_tile(&mut self) -> Result<Option<TileFeatures>> {
        while let Some(first) = self.next_entry()? {
            let tile_id = decode_key(first.key).tile;
            let coord = TileCoord::decode(tile_id);
            if !coord.is_valid() || coord.encoded() != tile_id {
                return Err(Error::CorruptFeature {
                    tile: coord,
                    reason: format!("tile id {} is out of range", tile_id),
                });
            }

            let mut tile = TileFeatures::new(coord);
            let mut layer: Option<LayerAccumulator> = None;
            let mut next = Some(first);
            while let Some(entry) = next {
                let parts = decode_key(entry.key);
                if parts.tile != tile_id {
                    self.pending = Some(entry);
                    break;
                }
                if layer.as_ref().map(|l| l.id) != Some(parts.layer) {
                    if let Some(finished) = layer.take() {
                        self.flush_layer(&mut tile, finished)?;
                    }
                }
                let acc = layer.get_or_insert_with(|| LayerAccumulator::new(parts.layer));
                self.add_entry(acc, coord, parts, &entry)?;
                next = self.entries.next().transpose()?;
            }
            if let Some(finished) = layer {
                self.flush_layer(&mut tile, finished)?;
            }

            if tile.is_empty() {
                log::debug!("Tile {} has no surviving features", coord);
                continue;
            }
            self.tiles += 1;
            return Ok(Some(tile));
        }
        Ok(None)
    }

    fn add_entry(
        &self,
        acc: &mut LayerAccumulator,
        coord: TileCoord,
        parts: KeyParts,
        entry: &SortableFeature,
    ) -> Result<()> {
        let payload = decode_payload(&entry.value).map_err(|e| Error::CorruptFeature {
            tile: coord,
            reason: e.to_string(),
        })?;
        let mut attrs = payload.attrs;

        match (parts.has_group, payload.group) {
            (true, Some(group)) => {
                let limit = u64::try_from(group.limit).unwrap_or(0);
                let count = acc.group_counts.entry(group.id).or_insert(0);
                if *count >= limit {
                    acc.dropped += 1;
                    return Ok(());
                }
                *count += 1;
                let rank = *count as i64;
                attrs
                    .entry(self.rank_attribute.clone())
                    .or_insert(AttrValue::Int(rank));
            }
            (false, None) => {}
            _ => {
                return Err(Error::CorruptFeature {
                    tile: coord,
                    reason: format!(
                        "feature {} group flag does not match its payload",
                        payload.id
                    ),
                })
            }
        }

        acc.features.push(TileFeature {
            id: payload.id,
            sort_key: parts.sort_key,
            geometry: payload.geometry,
            attrs,
            group: payload.group,
        });
        Ok(())
    }

    fn flush_layer(&mut self, tile: &mut TileFeatures, acc: LayerAccumulator) -> Result<()> {
        let name = self
            .layers
            .get(acc.id as usize)
            .cloned()
            .ok_or_else(|| Error::CorruptFeature {
                tile: tile.coord,
                reason: format!("unknown layer id {}", acc.id),
            })?;

        let features = match &self.post_process {
            Some(hook) => match hook(&name, tile.coord.z, acc.features.clone()) {
                Ok(processed) => processed,
                Err(e) => {
                    log::warn!(
                        "Post-processing layer {} of tile {} failed, keeping {} unprocessed features: {}",
                        name,
                        tile.coord,
                        acc.features.len(),
                        e
                    );
                    acc.features
                }
            },
            None => acc.features,
        };

        let stats = &mut self.layer_stats[acc.id as usize];
        stats.dropped += acc.dropped;
        stats.record(tile.coord.z, features.len());

        if !features.is_empty() {
            tile.layers.push(LayerFeatures { name, features });
        }
        Ok(())
    }
}

impl Iterator for TileIter {
    type Item = Result<TileFeatures>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_tile() {
            Ok(Some(tile)) => Some(Ok(tile)),
            Ok(None) => {
                self.done = true;
                log::debug!("Grouped {} tiles", self.tiles);
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
