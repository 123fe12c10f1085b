use spatialhash_common::{Box2, GridCellCoord, SphericalSector};
use spatialhash_kernel::CellHandle;
use std::collections::HashMap;
use std::rc::Rc;

use crate::grid_helper::GridLevel;

/// Identity of one "shape against level geometry" enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CandidateKey {
    level: i32,
    cell_size: i64,
    coord_range: Option<(i64, i64)>,
    level_origin: [u64; 2],
    center: [u64; 2],
    radius: u64,
    axis: [u64; 2],
    angle: u64,
}

impl CandidateKey {
    fn new(level: &GridLevel, shape: &SphericalSector) -> Self {
        Self {
            level: level.level,
            cell_size: level.cell_size,
            coord_range: level.coord_range,
            level_origin: [level.origin.x.to_bits(), level.origin.y.to_bits()],
            center: [shape.center.x.to_bits(), shape.center.y.to_bits()],
            radius: shape.radius.to_bits(),
            axis: [shape.axis.x.to_bits(), shape.axis.y.to_bits()],
            angle: shape.angle.to_bits(),
        }
    }
}

/// Scratch state for one batch of single-source queries.
///
/// Grids with identical level geometry queried with the same shape share the
/// candidate enumeration, and every returned cell records its smallest
/// distance to a query shape. Owned by the caller for the duration of one
/// batch; `!Send` on purpose through `Rc`.
#[derive(Debug, Default)]
pub struct QueryCache {
    candidates: HashMap<CandidateKey, Rc<[GridCellCoord]>>,
    cell_min_square_distance: HashMap<CellHandle, f64>,
    hits: usize,
    misses: usize,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn candidates(
        &mut self,
        level: &GridLevel,
        shape: &SphericalSector,
        compute: impl FnOnce() -> Vec<GridCellCoord>,
    ) -> Rc<[GridCellCoord]> {
        let key = CandidateKey::new(level, shape);
        if let Some(found) = self.candidates.get(&key) {
            self.hits += 1;
            return Rc::clone(found);
        }
        self.misses += 1;
        let computed: Rc<[GridCellCoord]> = compute().into();
        self.candidates.insert(key, Rc::clone(&computed));
        computed
    }

    /// Record that `cell` (with footprint `bounds`) was returned for `shape`.
    pub fn add_cell_info(&mut self, cell: CellHandle, shape: &SphericalSector, bounds: &Box2) {
        let d = bounds.square_distance_to_point(shape.center_2d());
        self.cell_min_square_distance
            .entry(cell)
            .and_modify(|v| *v = v.min(d))
            .or_insert(d);
    }

    pub fn cell_min_square_distance(&self, cell: CellHandle) -> Option<f64> {
        self.cell_min_square_distance.get(&cell).copied()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}
