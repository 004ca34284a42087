//! Layer names and their compact ids.
//!
//! The packed sort key has eight bits for the layer, so layer names are
//! mapped to ids `0..=255` in order of first use. Producers register layers
//! concurrently; once the sort starts the registry is frozen into the plain
//! id → name table the grouping stage reads.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::{Error, Result};

/// Number of distinct layers a packed key can address.
pub const MAX_LAYERS: usize = 256;

#[derive(Debug, Default)]
struct Table {
    names: Vec<String>,
    ids: HashMap<String, u8>,
}

/// Thread-safe layer name → id assignment.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    table: RwLock<Table>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, assigning the next free one on first use.
    pub fn id_for(&self, name: &str) -> Result<u8> {
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(&id) = table.ids.get(name) {
                return Ok(id);
            }
        }

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        // Another producer may have registered it between the two locks.
        if let Some(&id) = table.ids.get(name) {
            return Ok(id);
        }
        let id = u8::try_from(table.names.len()).map_err(|_| Error::TooManyLayers {
            name: name.to_string(),
            max: MAX_LAYERS,
        })?;
        table.names.push(name.to_string());
        table.ids.insert(name.to_string(), id);
        log::debug!("Registered layer {:?} as {}", name, id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze into the id-indexed name table.
    pub fn into_names(self) -> Vec<String> {
        self.table
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .names
    }
}

/// Per-layer output statistics, for archive metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStats {
    /// Features emitted
    pub features: u64,
    /// Tiles containing the layer
    pub tiles: u64,
    /// Features removed by group limits
    pub dropped: u64,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
}

impl LayerStats {
    /// Account for one flushed layer of `features` features at zoom `z`.
    pub fn record(&mut self, z: u8, features: usize) {
        if features == 0 {
            return;
        }
        self.features += features as u64;
        self.tiles += 1;
        self.min_zoom = Some(self.min_zoom.map_or(z, |m| m.min(z)));
        self.max_zoom = Some(self.max_zoom.map_or(z, |m| m.max(z)));
    }
}
