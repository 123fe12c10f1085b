use spatialhash_kernel::CellHandle;
use std::collections::BTreeMap;

/// Per-cell summary of the sources that selected it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSourceInfo {
    /// Smallest squared XY distance from a source shape center to the cell.
    pub min_square_distance: f64,
    /// Best (lowest) priority among the selecting sources.
    pub priority: u8,
    /// Any selecting source blocks on slow loading.
    pub block_on_slow_loading: bool,
    pub source_count: u32,
}

/// A set of cells produced by a streaming query, keyed by handle so iteration
/// order never depends on how the cells were found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingSourceCells {
    cells: BTreeMap<CellHandle, CellSourceInfo>,
}

impl StreamingSourceCells {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cell seen by one source, merging with earlier sightings.
    pub fn add(
        &mut self,
        cell: CellHandle,
        square_distance: f64,
        priority: u8,
        block_on_slow_loading: bool,
    ) {
        self.cells
            .entry(cell)
            .and_modify(|info| {
                info.min_square_distance = info.min_square_distance.min(square_distance);
                info.priority = info.priority.min(priority);
                info.block_on_slow_loading |= block_on_slow_loading;
                info.source_count += 1;
            })
            .or_insert(CellSourceInfo {
                min_square_distance: square_distance,
                priority,
                block_on_slow_loading,
                source_count: 1,
            });
    }

    /// Add a cell that is not tied to any source.
    pub fn add_unsourced(&mut self, cell: CellHandle) {
        self.cells.entry(cell).or_insert(CellSourceInfo {
            min_square_distance: 0.0,
            priority: u8::MAX,
            block_on_slow_loading: false,
            source_count: 0,
        });
    }

    pub fn contains(&self, cell: CellHandle) -> bool {
        self.cells.contains_key(&cell)
    }

    pub fn info(&self, cell: CellHandle) -> Option<&CellSourceInfo> {
        self.cells.get(&cell)
    }

    pub fn remove(&mut self, cell: CellHandle) -> Option<CellSourceInfo> {
        self.cells.remove(&cell)
    }

    /// Fold `other` into `self`, keeping the best values per cell.
    pub fn merge(&mut self, other: &StreamingSourceCells) {
        for (cell, info) in other.iter() {
            self.cells
                .entry(cell)
                .and_modify(|mine| {
                    mine.min_square_distance = mine.min_square_distance.min(info.min_square_distance);
                    mine.priority = mine.priority.min(info.priority);
                    mine.block_on_slow_loading |= info.block_on_slow_loading;
                    mine.source_count += info.source_count;
                })
                .or_insert(*info);
        }
    }

    /// Drop every cell present in `other`.
    pub fn remove_all(&mut self, other: &StreamingSourceCells) {
        self.cells.retain(|cell, _| !other.contains(*cell));
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Handles in ascending order.
    pub fn handles(&self) -> impl Iterator<Item = CellHandle> + '_ {
        self.cells.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellHandle, &CellSourceInfo)> {
        self.cells.iter().map(|(h, i)| (*h, i))
    }
}
