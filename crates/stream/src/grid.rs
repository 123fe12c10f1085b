//! One named streaming grid: a stack of sparse levels and the queries that
//! turn streaming sources into cell sets.

use glam::DVec3;
use spatialhash_common::{
    Box3, Fnv1a, GridCellCoord, LinearColor, SphericalSector, StreamingTargetState,
};
use spatialhash_kernel::{CellArena, CellHandle, RuntimeCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::cells::StreamingSourceCells;
use crate::config::{RuntimeGridDefinition, SpatialHashSettings};
use crate::dump::HierarchicalLog;
use crate::error::GridError;
use crate::grid_helper::SquareGridHelper;
use crate::level::{StreamingGridLayerCell, StreamingGridLevel, pack_cell_key, unpack_cell_key};
use crate::query_cache::QueryCache;
use crate::source::{StreamingQuerySource, StreamingSource};

/// A multi-level square grid of cell handles.
///
/// Static content comes from generation; content injected from external
/// streaming objects lives in a separate level stack so that removing it can
/// never touch generated cells.
#[derive(Debug)]
pub struct StreamingGrid {
    pub(crate) grid_name: String,
    pub(crate) origin: DVec3,
    pub(crate) cell_size: i64,
    pub(crate) loading_range: f64,
    pub(crate) load_margin: f64,
    pub(crate) block_on_slow_streaming: bool,
    pub(crate) debug_color: LinearColor,
    pub(crate) world_bounds: Box3,
    pub(crate) client_only_visible: bool,
    pub(crate) hlod_layer: Option<String>,
    pub(crate) priority: i32,
    pub(crate) grid_index: usize,
    pub(crate) settings: SpatialHashSettings,
    pub(crate) helper: SquareGridHelper,
    pub(crate) grid_levels: Vec<StreamingGridLevel>,
    pub(crate) injected_grid_levels: Vec<StreamingGridLevel>,
    loading_range_override: Option<f64>,
}

impl StreamingGrid {
    /// Empty grid with enough levels for the top one to cover `world_bounds`.
    pub fn new(
        definition: &RuntimeGridDefinition,
        world_bounds: Box3,
        settings: SpatialHashSettings,
    ) -> Result<Self, GridError> {
        if definition.cell_size <= 0 {
            return Err(GridError::InvalidCellSize {
                grid: definition.name.clone(),
                cell_size: definition.cell_size,
            });
        }
        let origin = definition.origin.extend(0.0);
        let helper = SquareGridHelper::new(
            world_bounds,
            origin,
            definition.cell_size,
            settings.use_aligned_grid_levels,
            settings.snap_non_aligned_grid_levels_to_lower_levels,
        )?;
        let grid_levels = (0..helper.level_count())
            .map(|_| StreamingGridLevel::default())
            .collect();
        Ok(Self {
            grid_name: definition.name.clone(),
            origin,
            cell_size: definition.cell_size,
            loading_range: definition.loading_range,
            load_margin: definition.load_margin,
            block_on_slow_streaming: definition.block_on_slow_streaming,
            debug_color: definition.debug_color(),
            world_bounds,
            client_only_visible: definition.client_only_visible,
            hlod_layer: definition.hlod_layer.clone(),
            priority: definition.priority,
            grid_index: 0,
            settings,
            helper,
            grid_levels,
            injected_grid_levels: Vec::new(),
            loading_range_override: None,
        })
    }

    /// Same geometry and properties as `other`, without any content.
    pub fn empty_like(other: &StreamingGrid) -> Self {
        Self {
            grid_name: other.grid_name.clone(),
            origin: other.origin,
            cell_size: other.cell_size,
            loading_range: other.loading_range,
            load_margin: other.load_margin,
            block_on_slow_streaming: other.block_on_slow_streaming,
            debug_color: other.debug_color,
            world_bounds: other.world_bounds,
            client_only_visible: other.client_only_visible,
            hlod_layer: other.hlod_layer.clone(),
            priority: other.priority,
            grid_index: other.grid_index,
            settings: other.settings,
            helper: other.helper.clone(),
            grid_levels: (0..other.grid_levels.len())
                .map(|_| StreamingGridLevel::default())
                .collect(),
            injected_grid_levels: Vec::new(),
            loading_range_override: other.loading_range_override,
        }
    }

    pub fn name(&self) -> &str {
        &self.grid_name
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// Level 0 cell size.
    pub fn cell_size(&self) -> i64 {
        self.cell_size
    }

    pub fn get_cell_size(&self, level: i32) -> i64 {
        self.helper.cell_size(level)
    }

    /// Effective loading range, honoring any runtime override.
    pub fn get_loading_range(&self) -> f64 {
        self.loading_range_override.unwrap_or(self.loading_range)
    }

    pub fn set_loading_range_override(&mut self, range: Option<f64>) {
        if let Some(range) = range {
            if range.is_nan() || range <= 0.0 {
                tracing::warn!(grid = %self.grid_name, range, "ignoring non-positive loading range override");
                return;
            }
        }
        self.loading_range_override = range;
    }

    pub fn load_margin(&self) -> f64 {
        self.load_margin
    }

    pub fn block_on_slow_streaming(&self) -> bool {
        self.block_on_slow_streaming
    }

    pub fn debug_color(&self) -> LinearColor {
        self.debug_color
    }

    pub fn world_bounds(&self) -> Box3 {
        self.world_bounds
    }

    pub fn client_only_visible(&self) -> bool {
        self.client_only_visible
    }

    pub fn hlod_layer(&self) -> Option<&str> {
        self.hlod_layer.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn grid_index(&self) -> usize {
        self.grid_index
    }

    pub fn settings(&self) -> SpatialHashSettings {
        self.settings
    }

    pub fn grid_helper(&self) -> &SquareGridHelper {
        &self.helper
    }

    /// Number of levels holding storage, static or injected.
    pub fn level_count(&self) -> i32 {
        self.grid_levels.len().max(self.injected_grid_levels.len()) as i32
    }

    pub fn cell_count(&self) -> usize {
        self.grid_levels.iter().map(StreamingGridLevel::cell_count).sum()
    }

    pub fn injected_cell_count(&self) -> usize {
        self.injected_grid_levels
            .iter()
            .map(StreamingGridLevel::cell_count)
            .sum()
    }

    pub fn has_content(&self) -> bool {
        self.cell_count() + self.injected_cell_count() > 0
    }

    /// Register `cell` at `coord`. Fails without touching the grid when the
    /// level does not exist or the coordinate cannot be keyed.
    pub fn insert_grid_cell(
        &mut self,
        cell: CellHandle,
        coord: GridCellCoord,
    ) -> Result<(), GridError> {
        let level_count = self.grid_levels.len() as i32;
        if coord.level < 0 || coord.level >= level_count {
            let err = GridError::InvalidLevel {
                grid: self.grid_name.clone(),
                level: coord.level,
                level_count,
            };
            tracing::error!(%err, %cell, "cannot insert cell");
            return Err(err);
        }
        let Some(key) = pack_cell_key(&coord) else {
            let err = GridError::CoordOutOfRange {
                grid: self.grid_name.clone(),
                coord,
            };
            tracing::error!(%err, %cell, "cannot insert cell");
            return Err(err);
        };
        if !self.helper.is_valid_coords(&coord) {
            tracing::warn!(grid = %self.grid_name, %cell, ?coord, "cell outside world bounds, unreachable by spatial queries");
        }
        self.grid_levels[coord.level as usize]
            .layer_cell_mut_or_insert(key)
            .grid_cells
            .push(cell);
        tracing::trace!(grid = %self.grid_name, %cell, ?coord, "inserted cell");
        Ok(())
    }

    /// Static then injected storage, level by level.
    fn all_levels(&self) -> impl Iterator<Item = &StreamingGridLevel> {
        self.grid_levels.iter().chain(&self.injected_grid_levels)
    }

    fn level_is_empty(&self, level: i32) -> bool {
        let index = level as usize;
        self.grid_levels.get(index).is_none_or(StreamingGridLevel::is_empty)
            && self
                .injected_grid_levels
                .get(index)
                .is_none_or(StreamingGridLevel::is_empty)
    }

    fn populated_levels(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.level_count()).filter(|&level| !self.level_is_empty(level))
    }

    fn layer_cells_at(
        &self,
        coord: GridCellCoord,
    ) -> impl Iterator<Item = &StreamingGridLayerCell> + '_ {
        let level = usize::try_from(coord.level).ok();
        let key = pack_cell_key(&coord);
        [&self.grid_levels, &self.injected_grid_levels]
            .into_iter()
            .filter_map(move |levels| levels.get(level?)?.layer_cell(key?))
    }

    /// Every cell registered at `coord`, static first.
    pub fn runtime_cells_at(&self, coord: GridCellCoord) -> impl Iterator<Item = CellHandle> + '_ {
        self.layer_cells_at(coord)
            .flat_map(|layer| layer.grid_cells.iter().copied())
    }

    pub fn for_each_layer_cell(
        &self,
        coord: GridCellCoord,
        mut f: impl FnMut(&StreamingGridLayerCell),
    ) {
        for layer in self.layer_cells_at(coord) {
            f(layer);
        }
    }

    /// Visit every cell of the grid until `f` returns `false`. Returns whether
    /// the iteration ran to completion.
    pub fn for_each_runtime_cell(&self, mut f: impl FnMut(CellHandle) -> bool) -> bool {
        for level in self.all_levels() {
            for layer in &level.layer_cells {
                for &cell in &layer.grid_cells {
                    if !f(cell) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn intersecting_coords(&self, shape: &SphericalSector, level: i32) -> Vec<GridCellCoord> {
        let mut coords = Vec::new();
        self.helper
            .for_each_intersecting_cell_shape(shape, level, |coord| coords.push(coord));
        coords
    }

    /// Cells selected by a single query source.
    ///
    /// Spatial queries return spatially loaded cells touched by the query
    /// shapes; non-spatial queries return every cell. Both pass through the
    /// data layer filter.
    pub fn get_cells_for_query(
        &self,
        arena: &CellArena,
        query: &StreamingQuerySource,
        out_cells: &mut BTreeSet<CellHandle>,
        enable_z_culling: bool,
        mut cache: Option<&mut QueryCache>,
    ) {
        if !query.targets_grid(&self.grid_name) {
            return;
        }

        if !query.spatial_query {
            for level in self.all_levels() {
                for layer in &level.layer_cells {
                    for &handle in &layer.grid_cells {
                        if arena.get(handle).is_some_and(|cell| should_add_cell(cell, query)) {
                            out_cells.insert(handle);
                        }
                    }
                }
            }
            return;
        }

        let mut shapes = Vec::new();
        query.for_each_shape(self.get_loading_range(), true, |shape| shapes.push(shape));
        for shape in &shapes {
            for level in self.populated_levels() {
                let coords: Rc<[GridCellCoord]> = match cache.as_deref_mut() {
                    Some(cache) => cache.candidates(&self.helper.level(level), shape, || {
                        self.intersecting_coords(shape, level)
                    }),
                    None => Rc::from(self.intersecting_coords(shape, level)),
                };
                for coord in coords.iter() {
                    let bounds = self.helper.get_cell_bounds(coord);
                    for handle in self.runtime_cells_at(*coord) {
                        let Some(cell) = arena.get(handle) else {
                            continue;
                        };
                        if !cell.spatially_loaded
                            || (enable_z_culling && !passes_z_culling(cell, shape))
                            || !should_add_cell(cell, query)
                        {
                            continue;
                        }
                        out_cells.insert(handle);
                        if let Some(cache) = cache.as_deref_mut() {
                            cache.add_cell_info(handle, shape, &bounds);
                        }
                    }
                }
            }
        }
    }

    /// Cells requested by `sources`, split into cells to activate and cells
    /// to only load. A cell present in both ends up in activate only.
    ///
    /// An activating source activates the cells its shapes touch and loads
    /// the cells within the grid's load margin beyond them. A loading source
    /// only loads.
    pub fn get_cells(
        &self,
        arena: &CellArena,
        sources: &[StreamingSource],
        out_activate: &mut StreamingSourceCells,
        out_load: &mut StreamingSourceCells,
        enable_z_culling: bool,
    ) {
        let _span = tracing::trace_span!("grid_get_cells", grid = %self.grid_name).entered();
        let mut activate = StreamingSourceCells::new();
        let mut load = StreamingSourceCells::new();
        let loading_range = self.get_loading_range();

        for source in sources.iter().filter(|s| s.targets_grid(&self.grid_name)) {
            let activates = source.target_state == StreamingTargetState::Activated;
            let mut shapes = Vec::new();
            source.for_each_shape(loading_range, true, |shape| shapes.push(shape));

            for shape in &shapes {
                let load_shape = shape.with_radius(shape.radius + self.load_margin);
                for level in self.populated_levels() {
                    self.helper
                        .for_each_intersecting_cell_shape(&load_shape, level, |coord| {
                            let bounds = self.helper.get_cell_bounds(&coord);
                            let square_distance = bounds.square_distance_to_point(shape.center_2d());
                            let in_activation_range = activates && shape.intersects_box_2d(&bounds);
                            for handle in self.runtime_cells_at(coord) {
                                let Some(cell) = arena.get(handle) else {
                                    continue;
                                };
                                if !cell.spatially_loaded
                                    || (enable_z_culling && !passes_z_culling(cell, &load_shape))
                                {
                                    continue;
                                }
                                let target = if in_activation_range
                                    && (!enable_z_culling || passes_z_culling(cell, shape))
                                {
                                    &mut activate
                                } else {
                                    &mut load
                                };
                                target.add(
                                    handle,
                                    square_distance,
                                    source.priority,
                                    source.block_on_slow_loading,
                                );
                            }
                        });
                }
            }
        }

        load.remove_all(&activate);
        tracing::trace!(
            activate = activate.len(),
            load = load.len(),
            "grid cells gathered"
        );
        out_activate.merge(&activate);
        out_load.merge(&load);
        out_load.remove_all(out_activate);
    }

    /// Cells streamed regardless of sources, by their own target state.
    pub fn get_non_spatially_loaded_cells(
        &self,
        arena: &CellArena,
        out_activate: &mut StreamingSourceCells,
        out_load: &mut StreamingSourceCells,
    ) {
        for level in self.all_levels() {
            for layer in &level.layer_cells {
                for &handle in &layer.grid_cells {
                    let Some(cell) = arena.get(handle) else {
                        continue;
                    };
                    if cell.spatially_loaded {
                        continue;
                    }
                    match cell.non_spatial_target {
                        StreamingTargetState::Activated => out_activate.add_unsourced(handle),
                        StreamingTargetState::Loaded => out_load.add_unsourced(handle),
                    }
                }
            }
        }
    }

    /// External content must share this grid's geometry for its cell keys to
    /// mean the same thing.
    pub(crate) fn check_external_grid(&self, external: &StreamingGrid) -> Result<(), GridError> {
        if external.cell_size != self.cell_size {
            return Err(GridError::CellSizeMismatch {
                grid: self.grid_name.clone(),
                expected: self.cell_size,
                external: external.cell_size,
            });
        }
        if external.origin != self.origin {
            return Err(GridError::OriginMismatch {
                grid: self.grid_name.clone(),
                expected: self.origin.to_array(),
                external: external.origin.to_array(),
            });
        }
        Ok(())
    }

    pub fn inject_external_streaming_object_grid(
        &mut self,
        external: &StreamingGrid,
    ) -> Result<(), GridError> {
        if let Err(err) = self.check_external_grid(external) {
            tracing::error!(%err, "cannot inject external grid");
            return Err(err);
        }
        let needed = external
            .grid_levels
            .iter()
            .rposition(|level| !level.is_empty())
            .map_or(0, |last| last + 1);
        if self.injected_grid_levels.len() < needed {
            self.injected_grid_levels
                .resize_with(needed, StreamingGridLevel::default);
        }

        let mut injected = 0;
        for (target, source) in self.injected_grid_levels.iter_mut().zip(&external.grid_levels) {
            for (key, layer) in source.sorted_entries() {
                if layer.grid_cells.is_empty() {
                    continue;
                }
                target
                    .layer_cell_mut_or_insert(key)
                    .grid_cells
                    .extend_from_slice(&layer.grid_cells);
                injected += layer.grid_cells.len();
            }
        }
        tracing::debug!(grid = %self.grid_name, cells = injected, "injected external grid");
        Ok(())
    }

    /// Move injected content into static storage so it survives being moved
    /// out with the grid. Returns the number of cells moved.
    pub(crate) fn absorb_injected_content(&mut self) -> usize {
        let injected = std::mem::take(&mut self.injected_grid_levels);
        if self.grid_levels.len() < injected.len() {
            self.grid_levels
                .resize_with(injected.len(), StreamingGridLevel::default);
        }
        let mut moved = 0;
        for (target, source) in self.grid_levels.iter_mut().zip(&injected) {
            for (key, layer) in source.sorted_entries() {
                target
                    .layer_cell_mut_or_insert(key)
                    .grid_cells
                    .extend_from_slice(&layer.grid_cells);
                moved += layer.grid_cells.len();
            }
        }
        moved
    }

    /// Whether every cell of `external` is currently injected here.
    pub fn can_remove_external_streaming_object_grid(&self, external: &StreamingGrid) -> bool {
        if self.check_external_grid(external).is_err() {
            return false;
        }
        external
            .grid_levels
            .iter()
            .enumerate()
            .all(|(level, source)| {
                source.sorted_entries().into_iter().all(|(key, layer)| {
                    if layer.grid_cells.is_empty() {
                        return true;
                    }
                    self.injected_grid_levels
                        .get(level)
                        .and_then(|target| target.layer_cell(key))
                        .is_some_and(|present| contains_all(&present.grid_cells, &layer.grid_cells))
                })
            })
    }

    /// Undo [`Self::inject_external_streaming_object_grid`]. Nothing is
    /// removed unless all of `external`'s cells are found.
    pub fn remove_external_streaming_object_grid(&mut self, external: &StreamingGrid) -> bool {
        if !self.can_remove_external_streaming_object_grid(external) {
            tracing::warn!(grid = %self.grid_name, "external grid content not found, nothing removed");
            return false;
        }

        let mut removed = 0;
        for (target, source) in self.injected_grid_levels.iter_mut().zip(&external.grid_levels) {
            for (key, layer) in source.sorted_entries() {
                let Some(present) = target.layer_cell_mut(key) else {
                    continue;
                };
                for handle in &layer.grid_cells {
                    if let Some(pos) = present.grid_cells.iter().position(|h| h == handle) {
                        present.grid_cells.remove(pos);
                        removed += 1;
                    }
                }
                if present.grid_cells.is_empty() {
                    target.remove_layer_cell(key);
                }
            }
        }
        while self
            .injected_grid_levels
            .last()
            .is_some_and(StreamingGridLevel::is_empty)
        {
            self.injected_grid_levels.pop();
        }
        tracing::debug!(grid = %self.grid_name, cells = removed, "removed external grid");
        true
    }

    /// Contribution of this grid to the hash-wide streaming hash.
    pub fn streaming_hash(&self) -> u64 {
        let mut hasher = Fnv1a::new();
        hasher.mix_str(&self.grid_name);
        hasher.mix_i64(self.cell_size);
        hasher.mix_f64(self.get_loading_range());
        hasher.mix_f64(self.load_margin);
        hasher.mix_bool(self.settings.use_aligned_grid_levels);
        hasher.mix_bool(self.settings.snap_non_aligned_grid_levels_to_lower_levels);
        hasher.mix_u64(self.cell_count() as u64);
        hasher.mix_u64(self.injected_cell_count() as u64);
        hasher.mix_bool(self.client_only_visible);
        hasher.finish()
    }

    pub fn dump_state_log(&self, arena: &CellArena, log: &mut HierarchicalLog) {
        let title = format!(
            "Grid {} (index {}, cell size {}, loading range {}, load margin {}, {} levels)",
            self.grid_name,
            self.grid_index,
            self.cell_size,
            self.get_loading_range(),
            self.load_margin,
            self.level_count(),
        );
        log.scope(title, |log| {
            dump_levels(log, arena, "Level", &self.grid_levels);
            dump_levels(log, arena, "Injected level", &self.injected_grid_levels);
        });
    }
}

fn dump_levels(
    log: &mut HierarchicalLog,
    arena: &CellArena,
    label: &str,
    levels: &[StreamingGridLevel],
) {
    for (level, storage) in levels.iter().enumerate() {
        if storage.is_empty() {
            continue;
        }
        let title = format!(
            "{label} {level}: {} grid cells, {} runtime cells",
            storage.layer_cells.len(),
            storage.cell_count()
        );
        log.scope(title, |log| {
            for (key, layer) in storage.sorted_entries() {
                let coord = unpack_cell_key(key, level as i32);
                for handle in &layer.grid_cells {
                    match arena.get(*handle) {
                        Some(cell) => log.line(format!(
                            "({}, {}) {} {}{}",
                            coord.x,
                            coord.y,
                            handle,
                            cell.name(),
                            if cell.spatially_loaded { "" } else { " [non-spatial]" }
                        )),
                        None => log.line(format!("({}, {}) {} <stale>", coord.x, coord.y, handle)),
                    }
                }
            }
        });
    }
}

/// Cells with no valid content bounds are never culled.
fn passes_z_culling(cell: &RuntimeCell, shape: &SphericalSector) -> bool {
    if !cell.content_bounds.is_valid() {
        return true;
    }
    let (z_min, z_max) = shape.z_range();
    cell.content_bounds.overlaps_z(z_min, z_max)
}

fn should_add_cell(cell: &RuntimeCell, query: &StreamingQuerySource) -> bool {
    if cell.has_data_layers() {
        cell.has_any_data_layer(&query.data_layers)
    } else {
        !query.data_layers_only
    }
}

/// Multiset inclusion of `needles` in `haystack`.
fn contains_all(haystack: &[CellHandle], needles: &[CellHandle]) -> bool {
    let mut counts: BTreeMap<CellHandle, usize> = BTreeMap::new();
    for handle in haystack {
        *counts.entry(*handle).or_default() += 1;
    }
    needles.iter().all(|handle| match counts.get_mut(handle) {
        Some(count) if *count > 0 => {
            *count -= 1;
            true
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(half: f64) -> Box3 {
        Box3::new(DVec3::new(-half, -half, -100.0), DVec3::new(half, half, 100.0))
    }

    fn grid(name: &str, cell_size: i64, loading_range: f64, load_margin: f64) -> StreamingGrid {
        let definition = RuntimeGridDefinition {
            load_margin,
            ..RuntimeGridDefinition::new(name, cell_size, loading_range)
        };
        StreamingGrid::new(&definition, world(1000.0), SpatialHashSettings::default()).unwrap()
    }

    fn place(grid: &mut StreamingGrid, arena: &mut CellArena, cell: RuntimeCell) -> CellHandle {
        let coord = cell.coord();
        let handle = arena.insert(cell);
        grid.insert_grid_cell(handle, coord).unwrap();
        handle
    }

    fn spatial(grid: &StreamingGrid, x: i64, y: i64, level: i32) -> RuntimeCell {
        RuntimeCell::new(grid.name(), grid.cell_size(), GridCellCoord::new(x, y, level))
    }

    fn split(
        grid: &StreamingGrid,
        arena: &CellArena,
        sources: &[StreamingSource],
        z_culling: bool,
    ) -> (Vec<CellHandle>, Vec<CellHandle>) {
        let mut activate = StreamingSourceCells::new();
        let mut load = StreamingSourceCells::new();
        grid.get_cells(arena, sources, &mut activate, &mut load, z_culling);
        (activate.handles().collect(), load.handles().collect())
    }

    #[test]
    fn level_count_covers_world() {
        let g = grid("G", 100, 150.0, 0.0);
        // 100 << 4 = 1600 >= 1000
        assert_eq!(g.level_count(), 5);
        assert_eq!(g.get_cell_size(4), 1600);
    }

    #[test]
    fn invalid_cell_size_is_an_error() {
        let definition = RuntimeGridDefinition::new("G", 0, 100.0);
        let err = StreamingGrid::new(&definition, world(10.0), SpatialHashSettings::default());
        assert!(matches!(err, Err(GridError::InvalidCellSize { .. })));
    }

    #[test]
    fn insert_rejects_bad_level_and_wide_coords() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let h = arena.insert(spatial(&g, 0, 0, 0));
        for level in [-1, 5, 99] {
            let err = g.insert_grid_cell(h, GridCellCoord::new(0, 0, level));
            assert!(matches!(err, Err(GridError::InvalidLevel { .. })));
        }
        let err = g.insert_grid_cell(h, GridCellCoord::new(i64::MAX, 0, 0));
        assert!(matches!(err, Err(GridError::CoordOutOfRange { .. })));
        assert_eq!(g.cell_count(), 0);
    }

    #[test]
    fn activate_and_load_split_by_margin() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 100.0);
        let near = { let cell = spatial(&g, 0, 0, 0); place(&mut g, &mut arena, cell) };
        // x in 300..400: 250 from the source, inside range + margin only.
        let margin = { let cell = spatial(&g, 3, 0, 0); place(&mut g, &mut arena, cell) };
        let far = { let cell = spatial(&g, 5, 0, 0); place(&mut g, &mut arena, cell) };
        let coarse = { let cell = spatial(&g, 0, 0, 1); place(&mut g, &mut arena, cell) };

        let source = StreamingSource::new("player", DVec3::new(50.0, 50.0, 0.0));
        let (activate, load) = split(&g, &arena, &[source.clone()], false);
        assert_eq!(activate, vec![near, coarse]);
        assert_eq!(load, vec![margin]);
        assert!(!activate.contains(&far) && !load.contains(&far));

        let loader = source.with_target_state(StreamingTargetState::Loaded);
        let (activate, load) = split(&g, &arena, &[loader], false);
        assert!(activate.is_empty());
        assert_eq!(load, vec![near, margin, coarse]);
    }

    #[test]
    fn activate_wins_over_load_across_sources() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let h = { let cell = spatial(&g, 0, 0, 0); place(&mut g, &mut arena, cell) };
        let sources = [
            StreamingSource::new("a", DVec3::new(50.0, 50.0, 0.0))
                .with_target_state(StreamingTargetState::Loaded),
            StreamingSource::new("b", DVec3::new(60.0, 60.0, 0.0)),
        ];
        let (activate, load) = split(&g, &arena, &sources, false);
        assert_eq!(activate, vec![h]);
        assert!(load.is_empty());
    }

    #[test]
    fn target_grids_restrict_sources() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        { let cell = spatial(&g, 0, 0, 0); place(&mut g, &mut arena, cell) };
        let source = StreamingSource::new("p", DVec3::ZERO).with_target_grids(["Other"]);
        let (activate, load) = split(&g, &arena, &[source], false);
        assert!(activate.is_empty() && load.is_empty());
    }

    #[test]
    fn z_culling_skips_cells_out_of_vertical_range() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let high_cell = spatial(&g, 0, 0, 0).with_content_bounds(Box3::new(
            DVec3::new(0.0, 0.0, 1000.0),
            DVec3::new(100.0, 100.0, 1100.0),
        ));
        let high = place(&mut g, &mut arena, high_cell);
        let unbounded = { let cell = spatial(&g, 1, 0, 0); place(&mut g, &mut arena, cell) };
        let source = StreamingSource::new("p", DVec3::new(50.0, 50.0, 0.0));

        let (activate, _) = split(&g, &arena, &[source.clone()], true);
        assert_eq!(activate, vec![unbounded]);
        let (activate, _) = split(&g, &arena, &[source], false);
        assert_eq!(activate, vec![high, unbounded]);
    }

    #[test]
    fn non_spatial_cells_follow_their_target() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let top = g.level_count() - 1;
        let always = place(
            &mut g,
            &mut arena,
            RuntimeCell::non_spatial("G", 100, GridCellCoord::new(0, 0, top)),
        );
        let preload = place(
            &mut g,
            &mut arena,
            RuntimeCell::non_spatial("G", 100, GridCellCoord::new(0, 0, top))
                .with_non_spatial_target(StreamingTargetState::Loaded),
        );

        let source = StreamingSource::new("p", DVec3::ZERO);
        let (activate, load) = split(&g, &arena, &[source], false);
        assert!(activate.is_empty() && load.is_empty());

        let mut activate = StreamingSourceCells::new();
        let mut load = StreamingSourceCells::new();
        g.get_non_spatially_loaded_cells(&arena, &mut activate, &mut load);
        assert_eq!(activate.handles().collect::<Vec<_>>(), vec![always]);
        assert_eq!(load.handles().collect::<Vec<_>>(), vec![preload]);
    }

    #[test]
    fn query_filters_by_data_layers() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let layered = { let cell = spatial(&g, 0, 0, 0).with_data_layers(["A"]); place(&mut g, &mut arena, cell) };
        let plain = { let cell = spatial(&g, 0, 0, 0); place(&mut g, &mut arena, cell) };

        let run = |query: &StreamingQuerySource| {
            let mut out = BTreeSet::new();
            g.get_cells_for_query(&arena, query, &mut out, false, None);
            out.into_iter().collect::<Vec<_>>()
        };

        let mut query = StreamingQuerySource::at(DVec3::new(50.0, 50.0, 0.0));
        query.data_layers.insert("A".into());
        assert_eq!(run(&query), vec![layered, plain]);

        query.data_layers_only = true;
        assert_eq!(run(&query), vec![layered]);

        let query = StreamingQuerySource::at(DVec3::new(50.0, 50.0, 0.0));
        assert_eq!(run(&query), vec![plain]);
    }

    #[test]
    fn non_spatial_query_returns_everything() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let near = { let cell = spatial(&g, 0, 0, 0); place(&mut g, &mut arena, cell) };
        let far = { let cell = spatial(&g, 9, 9, 0); place(&mut g, &mut arena, cell) };
        let query = StreamingQuerySource {
            spatial_query: false,
            ..StreamingQuerySource::at(DVec3::ZERO).with_radius(1.0)
        };
        let mut out = BTreeSet::new();
        g.get_cells_for_query(&arena, &query, &mut out, false, None);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![near, far]);
    }

    #[test]
    fn query_cache_is_shared_between_identical_grids() {
        let mut arena = CellArena::new();
        let mut a = grid("A", 100, 150.0, 0.0);
        let mut b = grid("B", 100, 150.0, 0.0);
        let ha = { let cell = spatial(&a, 0, 0, 0); place(&mut a, &mut arena, cell) };
        let hb = { let cell = spatial(&b, 0, 0, 0); place(&mut b, &mut arena, cell) };

        let query = StreamingQuerySource::at(DVec3::new(50.0, 50.0, 0.0)).with_radius(10.0);
        let mut cache = QueryCache::new();
        let mut out = BTreeSet::new();
        a.get_cells_for_query(&arena, &query, &mut out, false, Some(&mut cache));
        b.get_cells_for_query(&arena, &query, &mut out, false, Some(&mut cache));
        assert_eq!(out.len(), 2);
        assert!(cache.hits() >= 1);
        assert_eq!(cache.cell_min_square_distance(ha), Some(0.0));
        assert_eq!(cache.cell_min_square_distance(hb), Some(0.0));
    }

    #[test]
    fn shared_query_cache_keeps_levels_apart() {
        let mut arena = CellArena::new();
        // A's level 1 and B's level 0 both have 200 wide cells on the same origin.
        let mut a = grid("A", 100, 150.0, 0.0);
        let mut b = grid("B", 200, 150.0, 0.0);
        let ha = { let cell = spatial(&a, 2, 0, 1); place(&mut a, &mut arena, cell) };
        let hb = { let cell = spatial(&b, 2, 0, 0); place(&mut b, &mut arena, cell) };

        let query = StreamingQuerySource::at(DVec3::new(500.0, 50.0, 0.0)).with_radius(10.0);
        let mut alone = BTreeSet::new();
        b.get_cells_for_query(&arena, &query, &mut alone, false, None);
        assert_eq!(alone.into_iter().collect::<Vec<_>>(), vec![hb]);

        let mut cache = QueryCache::new();
        let mut from_a = BTreeSet::new();
        let mut from_b = BTreeSet::new();
        a.get_cells_for_query(&arena, &query, &mut from_a, false, Some(&mut cache));
        b.get_cells_for_query(&arena, &query, &mut from_b, false, Some(&mut cache));
        assert_eq!(from_a.into_iter().collect::<Vec<_>>(), vec![ha]);
        assert_eq!(from_b.into_iter().collect::<Vec<_>>(), vec![hb]);
    }

    #[test]
    fn inject_then_remove_restores_grid() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let own = { let cell = spatial(&g, 0, 0, 0); place(&mut g, &mut arena, cell) };

        let mut external = grid("G", 100, 150.0, 0.0);
        let injected = { let cell = spatial(&external, 0, 0, 0); place(&mut external, &mut arena, cell) };
        let coarse = { let cell = spatial(&external, 1, 1, 2); place(&mut external, &mut arena, cell) };

        g.inject_external_streaming_object_grid(&external).unwrap();
        assert_eq!(g.injected_cell_count(), 2);
        assert_eq!(
            g.runtime_cells_at(GridCellCoord::new(0, 0, 0)).collect::<Vec<_>>(),
            vec![own, injected]
        );
        let hash_with_content = g.streaming_hash();

        assert!(g.remove_external_streaming_object_grid(&external));
        assert_eq!(g.injected_cell_count(), 0);
        assert!(g.injected_grid_levels.is_empty());
        assert_ne!(g.streaming_hash(), hash_with_content);
        assert!(g.runtime_cells_at(GridCellCoord::new(1, 1, 2)).all(|h| h != coarse));

        // Already removed.
        assert!(!g.remove_external_streaming_object_grid(&external));
        assert_eq!(g.cell_count(), 1);
    }

    #[test]
    fn inject_rejects_mismatched_geometry() {
        let mut g = grid("G", 100, 150.0, 0.0);
        let other = grid("G", 200, 150.0, 0.0);
        assert!(matches!(
            g.inject_external_streaming_object_grid(&other),
            Err(GridError::CellSizeMismatch { .. })
        ));
        assert!(!g.remove_external_streaming_object_grid(&other));
    }

    #[test]
    fn for_each_runtime_cell_can_stop_early() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        for x in 0..4 {
            { let cell = spatial(&g, x, 0, 0); place(&mut g, &mut arena, cell) };
        }
        let mut seen = 0;
        let completed = g.for_each_runtime_cell(|_| {
            seen += 1;
            seen < 2
        });
        assert!(!completed);
        assert_eq!(seen, 2);
        assert!(g.for_each_runtime_cell(|_| true));
    }

    #[test]
    fn loading_range_override_changes_hash() {
        let mut g = grid("G", 100, 150.0, 0.0);
        let before = g.streaming_hash();
        g.set_loading_range_override(Some(300.0));
        assert_eq!(g.get_loading_range(), 300.0);
        assert_ne!(g.streaming_hash(), before);
        g.set_loading_range_override(Some(-1.0));
        assert_eq!(g.get_loading_range(), 300.0);
        g.set_loading_range_override(Some(f64::NAN));
        assert_eq!(g.get_loading_range(), 300.0);
        g.set_loading_range_override(None);
        assert_eq!(g.streaming_hash(), before);
    }

    #[test]
    fn dump_lists_cells() {
        let mut arena = CellArena::new();
        let mut g = grid("G", 100, 150.0, 0.0);
        let h = { let cell = spatial(&g, 2, -1, 0); place(&mut g, &mut arena, cell) };
        let mut log = HierarchicalLog::new();
        g.dump_state_log(&arena, &mut log);
        let text = log.into_string();
        assert!(text.starts_with("Grid G"));
        assert!(text.contains("Level 0: 1 grid cells, 1 runtime cells"));
        assert!(text.contains(&format!("(2, -1) {h} G_L0_X2_Y-1")));
    }
}
