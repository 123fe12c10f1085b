//! Deterministic cell names and GUIDs.
//!
//! A cell's identity depends only on where it sits (grid, cell size,
//! coordinate) and what it belongs to (data layers, content bundle), so
//! regenerating the same world always yields the same names.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spatialhash_common::{ContentBundleId, Fnv1a, GridCellCoord};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Order-independent hash of a set of data layer names. `0` means "no data
/// layers".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DataLayersId(pub u32);

impl DataLayersId {
    pub fn new(data_layers: &BTreeSet<String>) -> Self {
        if data_layers.is_empty() {
            return Self(0);
        }
        // BTreeSet iterates sorted, which makes the hash order independent.
        let mut h = Fnv1a::new();
        for name in data_layers {
            h.mix_str(name);
        }
        Self(h.finish_u32().max(1))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// `L{level}_X{x}_Y{y}`
pub fn cell_coord_string(coord: &GridCellCoord) -> String {
    format!("L{}_X{}_Y{}", coord.level, coord.x, coord.y)
}

/// Human readable, unique-per-grid cell name.
pub fn cell_name_string(
    grid_name: &str,
    coord: &GridCellCoord,
    data_layers: DataLayersId,
    content_bundle: Option<ContentBundleId>,
) -> String {
    let mut name = format!("{grid_name}_{}", cell_coord_string(coord));
    if !data_layers.is_empty() {
        name.push_str(&format!("_DL{:X}", data_layers.0));
    }
    if let Some(bundle) = content_bundle {
        name.push_str(&format!("_CB{bundle}"));
    }
    name
}

/// Stable GUID built from the cell's identity fields.
pub fn cell_guid(
    grid_name: &str,
    cell_size: i64,
    coord: &GridCellCoord,
    data_layers: DataLayersId,
    content_bundle: Option<ContentBundleId>,
) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update((grid_name.len() as u64).to_le_bytes());
    hasher.update(grid_name.as_bytes());
    hasher.update(cell_size.to_le_bytes());
    hasher.update(coord.x.to_le_bytes());
    hasher.update(coord.y.to_le_bytes());
    hasher.update(coord.level.to_le_bytes());
    hasher.update(data_layers.0.to_le_bytes());
    if let Some(bundle) = content_bundle {
        hasher.update(bundle.0.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}
