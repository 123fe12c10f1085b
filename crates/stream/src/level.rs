//! Sparse per-level cell storage.

use spatialhash_common::GridCellCoord;
use spatialhash_kernel::CellHandle;
use std::collections::HashMap;

/// Pack the 2D part of `coord` into a single key. Only coordinates that fit
/// in `i32` are representable.
pub fn pack_cell_key(coord: &GridCellCoord) -> Option<i64> {
    let x = i32::try_from(coord.x).ok()?;
    let y = i32::try_from(coord.y).ok()?;
    Some(((y as i64) << 32) | (x as u32 as i64))
}

pub fn unpack_cell_key(key: i64, level: i32) -> GridCellCoord {
    GridCellCoord::new((key as i32) as i64, key >> 32, level)
}

/// Every runtime cell sharing one grid cell (one per content layer).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StreamingGridLayerCell {
    pub grid_cells: Vec<CellHandle>,
}

/// One level of a streaming grid: dense layer cells plus a sparse key index.
/// Missing keys are empty cells.
#[derive(Debug, Default)]
pub struct StreamingGridLevel {
    pub layer_cells: Vec<StreamingGridLayerCell>,
    pub layer_cells_mapping: HashMap<i64, usize>,
}

impl StreamingGridLevel {
    pub fn layer_cell(&self, key: i64) -> Option<&StreamingGridLayerCell> {
        self.layer_cells_mapping
            .get(&key)
            .map(|&index| &self.layer_cells[index])
    }

    pub fn layer_cell_mut(&mut self, key: i64) -> Option<&mut StreamingGridLayerCell> {
        let index = *self.layer_cells_mapping.get(&key)?;
        self.layer_cells.get_mut(index)
    }

    /// Layer cell at `key`, created when missing.
    pub fn layer_cell_mut_or_insert(&mut self, key: i64) -> &mut StreamingGridLayerCell {
        let index = *self.layer_cells_mapping.entry(key).or_insert_with(|| {
            self.layer_cells.push(StreamingGridLayerCell::default());
            self.layer_cells.len() - 1
        });
        &mut self.layer_cells[index]
    }

    /// Drop the layer cell at `key`, keeping the mapping consistent with the
    /// swapped-in last element.
    pub fn remove_layer_cell(&mut self, key: i64) -> Option<StreamingGridLayerCell> {
        let index = self.layer_cells_mapping.remove(&key)?;
        let last = self.layer_cells.len() - 1;
        if index != last {
            if let Some(moved) = self.layer_cells_mapping.values_mut().find(|v| **v == last) {
                *moved = index;
            }
        }
        Some(self.layer_cells.swap_remove(index))
    }

    pub fn cell_count(&self) -> usize {
        self.layer_cells.iter().map(|l| l.grid_cells.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layer_cells.is_empty()
    }

    /// `(key, layer cell)` pairs sorted by key, for output that must not
    /// depend on hash-map order.
    pub fn sorted_entries(&self) -> Vec<(i64, &StreamingGridLayerCell)> {
        let mut entries: Vec<_> = self
            .layer_cells_mapping
            .iter()
            .map(|(&key, &index)| (key, &self.layer_cells[index]))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }
}
