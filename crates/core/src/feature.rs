//! Rendered features and the payload bytes they travel as through the sort.
//!
//! The packed key only carries tile, layer, draw order and a group flag.
//! Everything else a feature needs downstream is serialized into the entry's
//! value: feature id, WKB geometry, attributes and the optional group
//! descriptor, as a MessagePack array.
//!
//! # Examples
//!
//! ```
//! use geo::{point, Geometry};
//! use tilestream_core::feature::{decode_payload, encode_payload, geometry_to_wkb};
//!
//! let wkb = geometry_to_wkb(&Geometry::Point(point!(x: 1.5, y: 2.5))).unwrap();
//! let bytes = encode_payload(7, &wkb, &Default::default(), None).unwrap();
//! let payload = decode_payload(&bytes).unwrap();
//! assert_eq!(payload.id, 7);
//! assert_eq!(payload.geometry, wkb);
//! ```

use std::collections::BTreeMap;

use geo::Geometry;
use geozero::wkb::Wkb;
use geozero::{CoordDimensions, ToGeo, ToWkb};
use serde::{Deserialize, Serialize};

use crate::sort_key::{extract_layer, extract_tile};
use crate::sortable::SortableFeature;
use crate::tile::TileCoord;

/// Errors encoding or decoding a feature payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("WKB encode error: {0}")]
    GeometryEncode(String),

    #[error("WKB decode error: {0}")]
    GeometryDecode(String),

    #[error("Payload serialization error: {0}")]
    Serialize(String),

    #[error("Payload deserialization error: {0}")]
    Deserialize(String),
}

pub type Result<T> = std::result::Result<T, PayloadError>;

/// Attribute value attached to a feature.
///
/// Matches the value types a vector tile can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        AttrValue::UInt(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Attributes keyed by name. Ordered so that encoding is deterministic.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Caps how many features sharing `id` survive in one tile and layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: i64,
    pub limit: i32,
}

impl GroupInfo {
    pub fn new(id: i64, limit: i32) -> Self {
        Self { id, limit }
    }
}

/// A feature as produced by a renderer, before it enters the sort.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFeature {
    pub tile: TileCoord,
    pub layer: String,
    pub id: u64,
    /// Draw order within the tile and layer; lower draws first
    pub sort_key: i32,
    pub geometry: Geometry,
    pub attrs: Attrs,
    pub group: Option<GroupInfo>,
}

impl RenderedFeature {
    pub fn new(tile: TileCoord, layer: impl Into<String>, id: u64, geometry: Geometry) -> Self {
        Self {
            tile,
            layer: layer.into(),
            id,
            sort_key: 0,
            geometry,
            attrs: Attrs::new(),
            group: None,
        }
    }

    pub fn with_sort_key(mut self, sort_key: i32) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_group(mut self, id: i64, limit: i32) -> Self {
        self.group = Some(GroupInfo::new(id, limit));
        self
    }
}

/// A decoded feature that survived grouping, ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFeature {
    pub id: u64,
    pub sort_key: i32,
    /// WKB-encoded geometry
    pub geometry: Vec<u8>,
    pub attrs: Attrs,
    pub group: Option<GroupInfo>,
}

impl TileFeature {
    /// Decode the WKB geometry.
    pub fn geometry(&self) -> Result<Geometry> {
        wkb_to_geometry(&self.geometry)
    }

    /// Same logical feature: equal id, geometry and attributes.
    ///
    /// Sort key and group are rendering metadata and are ignored.
    pub fn has_same_contents(&self, other: &TileFeature) -> bool {
        self.id == other.id && self.geometry == other.geometry && self.attrs == other.attrs
    }
}

/// Decoded value bytes of a sort entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub id: u64,
    pub geometry: Vec<u8>,
    pub attrs: Attrs,
    pub group: Option<GroupInfo>,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    id: u64,
    geometry: &'a [u8],
    attrs: &'a Attrs,
    group: Option<GroupInfo>,
}

/// Serialize a feature's payload to MessagePack bytes.
pub fn encode_payload(
    id: u64,
    geometry: &[u8],
    attrs: &Attrs,
    group: Option<GroupInfo>,
) -> Result<Vec<u8>> {
    rmp_serde::to_vec(&PayloadRef {
        id,
        geometry,
        attrs,
        group,
    })
    .map_err(|e| PayloadError::Serialize(e.to_string()))
}

/// Deserialize payload bytes written by [`encode_payload`].
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    rmp_serde::from_slice(bytes).map_err(|e| PayloadError::Deserialize(e.to_string()))
}

/// Serialize a geometry to WKB bytes (XY only).
pub fn geometry_to_wkb(geom: &Geometry) -> Result<Vec<u8>> {
    geom.to_wkb(CoordDimensions::xy())
        .map_err(|e| PayloadError::GeometryEncode(e.to_string()))
}

/// Deserialize WKB bytes back to a geometry.
pub fn wkb_to_geometry(wkb: &[u8]) -> Result<Geometry> {
    Wkb(wkb.to_vec())
        .to_geo()
        .map_err(|e| PayloadError::GeometryDecode(e.to_string()))
}

/// Whether two sort entries carry the same logical feature.
///
/// Compares decoded tile, layer, feature id, geometry and attributes. Entries
/// rendered with different sort keys or groups still match.
pub fn has_same_contents(a: &SortableFeature, b: &SortableFeature) -> Result<bool> {
    if extract_tile(a.key) != extract_tile(b.key) || extract_layer(a.key) != extract_layer(b.key) {
        return Ok(false);
    }
    let a = decode_payload(&a.value)?;
    let b = decode_payload(&b.value)?;
    Ok(a.id == b.id && a.geometry == b.geometry && a.attrs == b.attrs)
}
