//! Multi-level square grid over the XY plane.
//!
//! Level `L` has cells of size `cell_size << L`. With aligned levels every
//! level shares the grid origin, so a level `L + 1` cell covers exactly the
//! 2x2 level `L` cells below it and parent/child conversion is an arithmetic
//! shift. Non-aligned levels shift every level but the top by half a cell.

use glam::{DVec2, DVec3};
use spatialhash_common::{Box2, Box3, GridCellCoord, SphericalSector};

use crate::error::GridError;

/// Levels beyond this would overflow `cell_size << level` for any sane cell size.
const MAX_GRID_LEVELS: i32 = 40;

/// Geometry of one grid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
    pub level: i32,
    pub cell_size: i64,
    /// World position of the corner of cell `(0, 0)`.
    pub origin: DVec2,
    /// Inclusive coordinate range covering the world bounds, `None` when the
    /// grid was built without bounds.
    pub coord_range: Option<(i64, i64)>,
}

impl GridLevel {
    /// Cells per side covered by the world bounds.
    pub fn grid_size(&self) -> i64 {
        self.coord_range.map_or(1, |(lo, hi)| hi - lo + 1)
    }
}

#[derive(Debug, Clone)]
pub struct SquareGridHelper {
    world_bounds: Box3,
    origin: DVec3,
    cell_size: i64,
    use_aligned_grid_levels: bool,
    snap_non_aligned_grid_levels_to_lower_levels: bool,
    levels: Vec<GridLevel>,
}

impl SquareGridHelper {
    /// Build the level stack so that the top level covers `world_bounds`.
    pub fn new(
        world_bounds: Box3,
        origin: DVec3,
        cell_size: i64,
        use_aligned_grid_levels: bool,
        snap_non_aligned_grid_levels_to_lower_levels: bool,
    ) -> Result<Self, GridError> {
        if cell_size <= 0 {
            return Err(GridError::NonPositiveCellSize(cell_size));
        }

        let extent = if world_bounds.is_valid() {
            let b = world_bounds.to_2d();
            b.corners()
                .iter()
                .map(|c| (*c - origin.truncate()).abs().max_element())
                .fold(0.0f64, f64::max)
        } else {
            0.0
        };

        let mut level_count = 1;
        let mut top_cell_size = cell_size as f64;
        while top_cell_size < extent && level_count < MAX_GRID_LEVELS {
            top_cell_size *= 2.0;
            level_count += 1;
        }

        let mut helper = Self {
            world_bounds,
            origin,
            cell_size,
            use_aligned_grid_levels,
            snap_non_aligned_grid_levels_to_lower_levels,
            levels: Vec::with_capacity(level_count as usize),
        };
        for level in 0..level_count {
            let mut geometry = helper.level_geometry_for(level, level_count - 1);
            if extent > 0.0 {
                let size = geometry.cell_size as f64;
                let lo = ((origin.x - extent - geometry.origin.x) / size).floor() as i64;
                // The far edge of the bounds belongs to the last cell, not the next one.
                let hi = ((origin.x + extent - geometry.origin.x) / size).ceil() as i64 - 1;
                geometry.coord_range = Some((lo, hi.max(lo)));
            }
            helper.levels.push(geometry);
        }
        Ok(helper)
    }

    fn level_geometry_for(&self, level: i32, top_level: i32) -> GridLevel {
        let level = level.clamp(0, MAX_GRID_LEVELS);
        let cell_size = self.cell_size << level;
        let shift = if self.use_aligned_grid_levels || level >= top_level {
            0.0
        } else {
            let half = cell_size as f64 * 0.5;
            if self.snap_non_aligned_grid_levels_to_lower_levels {
                let base = self.cell_size as f64;
                (half / base).floor() * base
            } else {
                half
            }
        };
        GridLevel {
            level,
            cell_size,
            origin: self.origin.truncate() - DVec2::splat(shift),
            coord_range: None,
        }
    }

    fn coord_of(&self, geometry: &GridLevel, p: DVec2) -> GridCellCoord {
        let rel = (p - geometry.origin) / geometry.cell_size as f64;
        GridCellCoord::new(rel.x.floor() as i64, rel.y.floor() as i64, geometry.level)
    }

    /// Geometry of `level`. Levels past the built stack (possible for
    /// injected content) follow the same progression.
    pub fn level(&self, level: i32) -> GridLevel {
        match usize::try_from(level).ok().and_then(|l| self.levels.get(l)) {
            Some(geometry) => *geometry,
            None => self.level_geometry_for(level, self.top_level()),
        }
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn level_count(&self) -> i32 {
        self.levels.len() as i32
    }

    pub fn top_level(&self) -> i32 {
        self.level_count() - 1
    }

    pub fn cell_size(&self, level: i32) -> i64 {
        self.cell_size << level.clamp(0, MAX_GRID_LEVELS)
    }

    pub fn base_cell_size(&self) -> i64 {
        self.cell_size
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn world_bounds(&self) -> Box3 {
        self.world_bounds
    }

    pub fn use_aligned_grid_levels(&self) -> bool {
        self.use_aligned_grid_levels
    }

    /// Cell containing `position` at `level`.
    pub fn get_cell_coords(&self, position: DVec3, level: i32) -> GridCellCoord {
        self.coord_of(&self.level(level), position.truncate())
    }

    pub fn get_cell_bounds(&self, coord: &GridCellCoord) -> Box2 {
        let geometry = self.level(coord.level);
        let size = geometry.cell_size as f64;
        let min = geometry.origin + DVec2::new(coord.x as f64, coord.y as f64) * size;
        Box2::new(min, min + DVec2::splat(size))
    }

    /// Whether `coord` falls inside the world bounds the helper was built for.
    /// Always true for a helper built without bounds.
    pub fn is_valid_coords(&self, coord: &GridCellCoord) -> bool {
        match self.level(coord.level).coord_range {
            Some((lo, hi)) => (lo..=hi).contains(&coord.x) && (lo..=hi).contains(&coord.y),
            None => true,
        }
    }

    /// Calls `f` for every cell of `level` whose closed bounds touch `region`,
    /// row by row. Levels built for world bounds only yield cells inside them.
    pub fn for_each_intersecting_cell(
        &self,
        region: &Box2,
        level: i32,
        mut f: impl FnMut(GridCellCoord),
    ) {
        if !region.is_valid() {
            return;
        }
        let geometry = self.level(level);
        let size = geometry.cell_size as f64;
        let rel_min = (region.min - geometry.origin) / size;
        let rel_max = (region.max - geometry.origin) / size;
        // A region starting exactly on an edge also touches the cell before it.
        let (mut min_x, mut min_y) = (
            (rel_min.x.ceil() as i64).saturating_sub(1),
            (rel_min.y.ceil() as i64).saturating_sub(1),
        );
        let (mut max_x, mut max_y) = (rel_max.x.floor() as i64, rel_max.y.floor() as i64);
        if let Some((lo, hi)) = geometry.coord_range {
            (min_x, min_y) = (min_x.max(lo), min_y.max(lo));
            (max_x, max_y) = (max_x.min(hi), max_y.min(hi));
        }
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                f(GridCellCoord::new(x, y, geometry.level));
            }
        }
    }

    /// Like [`Self::for_each_intersecting_cell`] but keeps only the cells the
    /// shape itself touches, not just its bounding box.
    pub fn for_each_intersecting_cell_shape(
        &self,
        shape: &SphericalSector,
        level: i32,
        mut f: impl FnMut(GridCellCoord),
    ) {
        if !shape.is_valid() {
            return;
        }
        self.for_each_intersecting_cell(&shape.bounds_2d(), level, |coord| {
            if shape.intersects_box_2d(&self.get_cell_bounds(&coord)) {
                f(coord);
            }
        });
    }

    /// Cell one level up that contains `coord`.
    pub fn parent_coord(&self, coord: &GridCellCoord) -> GridCellCoord {
        if self.use_aligned_grid_levels {
            GridCellCoord::new(coord.x >> 1, coord.y >> 1, coord.level + 1)
        } else {
            let center = self.get_cell_bounds(coord).center();
            self.coord_of(&self.level(coord.level + 1), center)
        }
    }

    /// The four cells one level down covered by `coord`. Only meaningful for
    /// aligned levels.
    pub fn child_coords(&self, coord: &GridCellCoord) -> Option<[GridCellCoord; 4]> {
        if !self.use_aligned_grid_levels || coord.level == 0 {
            return None;
        }
        let (x, y, level) = (coord.x * 2, coord.y * 2, coord.level - 1);
        Some([
            GridCellCoord::new(x, y, level),
            GridCellCoord::new(x + 1, y, level),
            GridCellCoord::new(x, y + 1, level),
            GridCellCoord::new(x + 1, y + 1, level),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(half: f64) -> Box3 {
        Box3::new(DVec3::new(-half, -half, -100.0), DVec3::new(half, half, 100.0))
    }

    #[test]
    fn no_bounds_gives_single_level() {
        let helper = SquareGridHelper::new(Box3::EMPTY, DVec3::ZERO, 100, true, true).unwrap();
        assert_eq!(helper.level_count(), 1);
        assert!(helper.is_valid_coords(&GridCellCoord::new(1_000, -1_000, 0)));
    }

    #[test]
    fn level_count_covers_bounds() {
        // 800 extent with 100 cells: 100, 200, 400, 800
        let helper = SquareGridHelper::new(bounds(800.0), DVec3::ZERO, 100, true, true).unwrap();
        assert_eq!(helper.level_count(), 4);
        assert_eq!(helper.cell_size(3), 800);
        assert_eq!(helper.levels()[3].grid_size(), 2);
        assert_eq!(helper.levels()[0].grid_size(), 16);
    }

    #[test]
    fn position_to_cell_basic() {
        let helper = SquareGridHelper::new(Box3::EMPTY, DVec3::ZERO, 100, true, true).unwrap();
        assert_eq!(
            helper.get_cell_coords(DVec3::new(250.0, 350.0, 0.0), 0),
            GridCellCoord::new(2, 3, 0)
        );
        assert_eq!(
            helper.get_cell_coords(DVec3::new(-1.0, -100.0, 0.0), 0),
            GridCellCoord::new(-1, -1, 0)
        );
    }

    #[test]
    fn origin_is_subtracted() {
        let helper = SquareGridHelper::new(Box3::EMPTY, DVec3::new(50.0, 50.0, 0.0), 100, true, true).unwrap();
        assert_eq!(
            helper.get_cell_coords(DVec3::new(149.0, 49.0, 0.0), 0),
            GridCellCoord::new(0, -1, 0)
        );
    }

    #[test]
    fn touching_region_is_inclusive() {
        let helper = SquareGridHelper::new(Box3::EMPTY, DVec3::ZERO, 100, true, true).unwrap();
        let region = Box2::new(DVec2::new(100.0, 10.0), DVec2::new(200.0, 20.0));
        let mut seen = Vec::new();
        helper.for_each_intersecting_cell(&region, 0, |c| seen.push((c.x, c.y)));
        assert_eq!(seen, vec![(0, 0), (1, 0), (2, 0)]);
    }

    #[test]
    fn aligned_parent_is_shift() {
        let helper = SquareGridHelper::new(bounds(1000.0), DVec3::ZERO, 100, true, true).unwrap();
        let child = GridCellCoord::new(-3, 5, 0);
        let parent = helper.parent_coord(&child);
        assert_eq!(parent, GridCellCoord::new(-2, 2, 1));
        let children = helper.child_coords(&parent).unwrap();
        assert!(children.contains(&child));
        let pb = helper.get_cell_bounds(&parent);
        for c in children {
            let cb = helper.get_cell_bounds(&c);
            assert!(pb.contains_point(cb.min) && pb.contains_point(cb.max));
        }
    }

    #[test]
    fn non_aligned_levels_are_shifted() {
        let helper = SquareGridHelper::new(bounds(1000.0), DVec3::ZERO, 100, false, false).unwrap();
        assert_eq!(helper.level(0).origin, DVec2::splat(-50.0));
        assert_eq!(helper.level(1).origin, DVec2::splat(-100.0));
        assert_eq!(helper.level(helper.top_level()).origin, DVec2::ZERO);
        assert!(helper.child_coords(&GridCellCoord::new(0, 0, 1)).is_none());

        let child = GridCellCoord::new(0, 0, 0);
        let parent = helper.parent_coord(&child);
        let center = helper.get_cell_bounds(&child).center();
        assert!(helper.get_cell_bounds(&parent).contains_point(center));
    }

    #[test]
    fn snapped_non_aligned_levels_land_on_base_edges() {
        let helper = SquareGridHelper::new(bounds(1000.0), DVec3::ZERO, 100, false, true).unwrap();
        assert_eq!(helper.level(0).origin, DVec2::ZERO);
        for level in 1..helper.level_count() {
            let o = helper.level(level).origin;
            assert_eq!(o.x % 100.0, 0.0);
        }
    }

    #[test]
    fn shape_enumeration_is_subset_of_box() {
        let helper = SquareGridHelper::new(Box3::EMPTY, DVec3::ZERO, 100, true, true).unwrap();
        let shape = SphericalSector::sphere(DVec3::ZERO, 250.0);
        let mut boxed = 0;
        let mut precise = 0;
        helper.for_each_intersecting_cell(&shape.bounds_2d(), 0, |_| boxed += 1);
        helper.for_each_intersecting_cell_shape(&shape, 0, |_| precise += 1);
        assert!(precise < boxed);
        assert!(precise > 0);
    }

    #[test]
    fn non_positive_cell_size_is_an_error() {
        for cell_size in [0, -100] {
            let err = SquareGridHelper::new(bounds(1000.0), DVec3::ZERO, cell_size, true, true);
            assert_eq!(err.unwrap_err(), GridError::NonPositiveCellSize(cell_size));
        }
    }

    #[test]
    fn huge_region_is_clamped_to_world_bounds() {
        let helper = SquareGridHelper::new(bounds(1000.0), DVec3::ZERO, 100, true, true).unwrap();
        let region = Box2::new(DVec2::splat(-1.0e6), DVec2::splat(1.0e6));
        for level in 0..helper.level_count() {
            let side = helper.level(level).grid_size();
            let mut seen = Vec::new();
            helper.for_each_intersecting_cell(&region, level, |c| seen.push(c));
            assert_eq!(seen.len() as i64, side * side);
            assert!(seen.iter().all(|c| helper.is_valid_coords(c)));
        }
    }

    #[test]
    fn region_outside_world_bounds_yields_nothing() {
        let helper = SquareGridHelper::new(bounds(1000.0), DVec3::ZERO, 100, true, true).unwrap();
        let region = Box2::new(DVec2::splat(5000.0), DVec2::splat(5100.0));
        let mut seen = 0;
        helper.for_each_intersecting_cell(&region, 0, |_| seen += 1);
        assert_eq!(seen, 0);

        // Partly outside: only the in-bounds corner remains.
        let region = Box2::new(DVec2::splat(950.0), DVec2::splat(5000.0));
        let mut corner = Vec::new();
        helper.for_each_intersecting_cell(&region, 0, |c| corner.push((c.x, c.y)));
        assert_eq!(corner, vec![(9, 9)]);
    }
}
