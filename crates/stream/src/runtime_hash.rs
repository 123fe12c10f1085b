//! The runtime spatial hash: owns every streaming grid of a world and answers
//! streaming queries across them.

use glam::{DAffine3, DVec2};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spatialhash_common::{Box2, Box3, ContentBundleId, GridCellCoord, StreamingTargetState};
use spatialhash_kernel::{CellArena, CellHandle};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::cells::StreamingSourceCells;
use crate::config::{SpatialHashConfig, SpatialHashSettings};
use crate::draw::{
    CellStreamingStatus, DebugDrawList2D, DebugDrawList3D, DebugDrawSettings, Draw2DContext,
    Draw3DContext, fit_region_to_screen,
};
use crate::dump::HierarchicalLog;
use crate::error::{ConfigError, HashError};
use crate::grid::StreamingGrid;
use crate::query_cache::QueryCache;
use crate::source::{StreamingQuerySource, StreamingSource};

/// Hash shared between threads. Readers hold the read guard for a whole query.
pub type SharedSpatialHash = Arc<RwLock<RuntimeSpatialHash>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMode {
    #[default]
    Standalone,
    Client,
    ListenServer,
    DedicatedServer,
}

/// Runtime facts that decide which grids stream at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingContext {
    pub net_mode: NetMode,
    pub hlods_enabled: bool,
}

impl Default for StreamingContext {
    fn default() -> Self {
        Self {
            net_mode: NetMode::Standalone,
            hlods_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamingPerformance {
    #[default]
    Good,
    Slow,
    Critical,
}

/// Where generation put one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellPlacement {
    pub grid_name: String,
    pub coord: GridCellCoord,
    pub cell: CellHandle,
}

impl CellPlacement {
    pub fn new(grid_name: impl Into<String>, coord: GridCellCoord, cell: CellHandle) -> Self {
        Self {
            grid_name: grid_name.into(),
            coord,
            cell,
        }
    }
}

/// Grids generated for a content bundle, injected into and removed from a
/// running hash as a unit.
#[derive(Debug)]
pub struct ExternalStreamingObject {
    id: ContentBundleId,
    pub streaming_grids: Vec<StreamingGrid>,
}

impl ExternalStreamingObject {
    pub fn new(id: ContentBundleId) -> Self {
        Self {
            id,
            streaming_grids: Vec::new(),
        }
    }

    pub fn with_grid(mut self, grid: StreamingGrid) -> Self {
        self.streaming_grids.push(grid);
        self
    }

    pub fn id(&self) -> ContentBundleId {
        self.id
    }

    pub fn cell_count(&self) -> usize {
        self.streaming_grids.iter().map(StreamingGrid::cell_count).sum()
    }

    pub fn dump_state_log(&self, arena: &CellArena, log: &mut HierarchicalLog) {
        log.scope(format!("External streaming object {}", self.id), |log| {
            for grid in &self.streaming_grids {
                grid.dump_state_log(arena, log);
            }
        });
    }
}

/// What a streaming policy needs from a runtime hash.
pub trait RuntimeHash {
    /// Every cell of every streamed grid, until `f` returns `false`.
    fn for_each_streaming_cells(&self, f: &mut dyn FnMut(CellHandle) -> bool);

    /// Cells selected by a single query source, until `f` returns `false`.
    fn for_each_streaming_cells_query(
        &self,
        arena: &CellArena,
        query: &StreamingQuerySource,
        f: &mut dyn FnMut(CellHandle) -> bool,
        cache: Option<&mut QueryCache>,
    );

    /// Cells wanted by `sources` together with the state they should reach,
    /// until `f` returns `false`. Non-spatially loaded cells are included.
    fn for_each_streaming_cells_sources(
        &self,
        arena: &CellArena,
        sources: &[StreamingSource],
        f: &mut dyn FnMut(CellHandle, StreamingTargetState) -> bool,
    );

    /// Changes whenever a streaming update could produce different results.
    fn compute_update_streaming_hash(&self) -> u32;

    fn inject_external_streaming_object(&mut self, object: &ExternalStreamingObject) -> bool;

    fn remove_external_streaming_object(&mut self, object: &ExternalStreamingObject) -> bool;
}

#[derive(Debug)]
struct NameCache {
    dirty: bool,
    grids: HashMap<String, usize>,
}

/// Owner of every [`StreamingGrid`] of a world.
#[derive(Debug)]
pub struct RuntimeSpatialHash {
    config: SpatialHashConfig,
    settings: SpatialHashSettings,
    context: StreamingContext,
    world_bounds: Box3,
    streaming_grids: Vec<StreamingGrid>,
    /// Injected objects by id, with the names of the grids they brought in.
    injected_objects: BTreeMap<ContentBundleId, Vec<String>>,
    name_cache: RwLock<NameCache>,
}

impl Default for RuntimeSpatialHash {
    fn default() -> Self {
        Self::with_config(SpatialHashConfig::default())
    }
}

impl RuntimeSpatialHash {
    fn with_config(config: SpatialHashConfig) -> Self {
        let settings = SpatialHashSettings::from_config(&config);
        Self {
            config,
            settings,
            context: StreamingContext::default(),
            world_bounds: Box3::EMPTY,
            streaming_grids: Vec::new(),
            injected_objects: BTreeMap::new(),
            name_cache: RwLock::new(NameCache {
                dirty: true,
                grids: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: SpatialHashConfig) -> Result<Self, ConfigError> {
        if let Err(err) = config.validate() {
            tracing::error!(%err, "rejecting spatial hash configuration");
            return Err(err);
        }
        Ok(Self::with_config(config))
    }

    pub fn into_shared(self) -> SharedSpatialHash {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &SpatialHashConfig {
        &self.config
    }

    pub fn settings(&self) -> SpatialHashSettings {
        self.settings
    }

    pub fn context(&self) -> StreamingContext {
        self.context
    }

    pub fn set_context(&mut self, context: StreamingContext) {
        tracing::debug!(?context, "streaming context changed");
        self.context = context;
    }

    pub fn world_bounds(&self) -> Box3 {
        self.world_bounds
    }

    fn mark_dirty(&mut self) {
        self.name_cache.get_mut().dirty = true;
    }

    fn find_grid_index(&self, name: &str) -> Option<usize> {
        {
            let cache = self.name_cache.read();
            if !cache.dirty {
                return cache.grids.get(name).copied();
            }
        }
        let mut cache = self.name_cache.write();
        if cache.dirty {
            cache.grids = self
                .streaming_grids
                .iter()
                .enumerate()
                .map(|(index, grid)| (grid.name().to_string(), index))
                .collect();
            cache.dirty = false;
            tracing::trace!(grids = cache.grids.len(), "rebuilt grid name cache");
        }
        cache.grids.get(name).copied()
    }

    pub fn get_streaming_grid_by_name(&self, name: &str) -> Option<&StreamingGrid> {
        self.find_grid_index(name)
            .map(|index| &self.streaming_grids[index])
    }

    /// Whether `name` is one of the configured grid definitions.
    pub fn is_valid_grid(&self, name: &str) -> bool {
        self.config.grids.iter().any(|grid| grid.name == name)
    }

    pub fn get_num_grids(&self) -> usize {
        self.streaming_grids.len()
    }

    pub fn streaming_grids(&self) -> &[StreamingGrid] {
        &self.streaming_grids
    }

    pub fn for_each_streaming_grid(&self, mut f: impl FnMut(&StreamingGrid)) {
        for grid in &self.streaming_grids {
            f(grid);
        }
    }

    fn is_grid_streamed(&self, grid: &StreamingGrid) -> bool {
        if grid.client_only_visible() && self.context.net_mode == NetMode::DedicatedServer {
            return false;
        }
        self.context.hlods_enabled || grid.hlod_layer().is_none()
    }

    /// Grids that take part in streaming under the current context.
    pub fn get_filtered_streaming_grids(&self) -> Vec<&StreamingGrid> {
        self.streaming_grids
            .iter()
            .filter(|grid| self.is_grid_streamed(grid))
            .collect()
    }

    pub fn has_streaming_content(&self) -> bool {
        self.streaming_grids.iter().any(StreamingGrid::has_content)
    }

    fn build_grids(
        &self,
        world_bounds: Box3,
        placements: &[CellPlacement],
    ) -> Result<Vec<StreamingGrid>, HashError> {
        let mut grids = self
            .config
            .grids
            .iter()
            .map(|definition| StreamingGrid::new(definition, world_bounds, self.settings))
            .collect::<Result<Vec<_>, _>>()?;
        grids.sort_by_key(StreamingGrid::priority);
        for (index, grid) in grids.iter_mut().enumerate() {
            grid.grid_index = index;
        }
        for placement in placements {
            let Some(grid) = grids.iter_mut().find(|g| g.name() == placement.grid_name) else {
                tracing::error!(grid = %placement.grid_name, cell = %placement.cell, "placement targets unknown grid");
                return Err(HashError::UnknownGrid(placement.grid_name.clone()));
            };
            grid.insert_grid_cell(placement.cell, placement.coord)?;
        }
        Ok(grids)
    }

    /// Replace all content with one grid per configured definition, filled
    /// from `placements`. On error nothing changes.
    pub fn generate_streaming(
        &mut self,
        world_bounds: Box3,
        placements: &[CellPlacement],
    ) -> Result<usize, HashError> {
        let _span = tracing::info_span!("generate_streaming", placements = placements.len()).entered();
        let grids = self.build_grids(world_bounds, placements)?;
        self.streaming_grids = grids;
        self.world_bounds = world_bounds;
        self.injected_objects.clear();
        self.mark_dirty();
        tracing::info!(
            grids = self.streaming_grids.len(),
            cells = placements.len(),
            "generated streaming grids"
        );
        Ok(placements.len())
    }

    /// Build an external object for a content bundle, with grids shaped like
    /// this hash's so that it can be injected later.
    pub fn create_external_streaming_object(
        &self,
        id: ContentBundleId,
        placements: &[CellPlacement],
    ) -> Result<ExternalStreamingObject, HashError> {
        let mut grids = self.build_grids(self.world_bounds, placements)?;
        grids.retain(StreamingGrid::has_content);
        Ok(ExternalStreamingObject {
            id,
            streaming_grids: grids,
        })
    }

    pub fn add_streaming_grid(&mut self, mut grid: StreamingGrid) -> Result<(), HashError> {
        if self.find_grid_index(grid.name()).is_some() {
            tracing::error!(grid = %grid.name(), "grid already exists");
            return Err(HashError::DuplicateGrid(grid.name().to_string()));
        }
        grid.grid_index = self.streaming_grids.len();
        tracing::debug!(grid = %grid.name(), index = grid.grid_index, "added streaming grid");
        self.streaming_grids.push(grid);
        self.mark_dirty();
        Ok(())
    }

    pub fn flush_streaming_content(&mut self) {
        tracing::debug!(grids = self.streaming_grids.len(), "flushing streaming content");
        self.streaming_grids.clear();
        self.injected_objects.clear();
        self.mark_dirty();
    }

    /// Move every grid into a new external object, leaving the hash empty.
    pub fn store_streaming_content_to_external_streaming_object(
        &mut self,
        id: ContentBundleId,
    ) -> ExternalStreamingObject {
        let mut streaming_grids = std::mem::take(&mut self.streaming_grids);
        let absorbed: usize = streaming_grids
            .iter_mut()
            .map(StreamingGrid::absorb_injected_content)
            .sum();
        if !self.injected_objects.is_empty() {
            tracing::warn!(
                objects = self.injected_objects.len(),
                cells = absorbed,
                "storing content while external objects are injected; their content is stored too"
            );
        }
        self.injected_objects.clear();
        self.mark_dirty();
        ExternalStreamingObject {
            id,
            streaming_grids,
        }
    }

    pub fn set_loading_range_override(&mut self, grid_name: &str, range: Option<f64>) -> bool {
        let Some(index) = self.find_grid_index(grid_name) else {
            return false;
        };
        self.streaming_grids[index].set_loading_range_override(range);
        true
    }

    pub fn is_injected(&self, id: ContentBundleId) -> bool {
        self.injected_objects.contains_key(&id)
    }

    /// Cells wanted by `sources`, including non-spatially loaded ones, as
    /// disjoint activate and load sets.
    pub fn get_streaming_cells(
        &self,
        arena: &CellArena,
        sources: &[StreamingSource],
    ) -> (StreamingSourceCells, StreamingSourceCells) {
        let mut activate = StreamingSourceCells::new();
        let mut load = StreamingSourceCells::new();
        for grid in self.get_filtered_streaming_grids() {
            grid.get_cells(arena, sources, &mut activate, &mut load, self.config.enable_z_culling);
            grid.get_non_spatially_loaded_cells(arena, &mut activate, &mut load);
        }
        load.remove_all(&activate);
        (activate, load)
    }

    /// Cells streamed regardless of sources.
    pub fn get_non_spatially_loaded_cells(
        &self,
        arena: &CellArena,
    ) -> (StreamingSourceCells, StreamingSourceCells) {
        let mut activate = StreamingSourceCells::new();
        let mut load = StreamingSourceCells::new();
        for grid in self.get_filtered_streaming_grids() {
            grid.get_non_spatially_loaded_cells(arena, &mut activate, &mut load);
        }
        load.remove_all(&activate);
        (activate, load)
    }

    /// How urgently `cell` is needed, given its closest source distance.
    pub fn get_streaming_performance_for_cell(
        &self,
        arena: &CellArena,
        cell: CellHandle,
        min_square_distance: f64,
    ) -> StreamingPerformance {
        let Some(grid) = arena
            .get(cell)
            .and_then(|record| self.get_streaming_grid_by_name(record.grid_name()))
        else {
            return StreamingPerformance::Good;
        };
        if !grid.block_on_slow_streaming() {
            return StreamingPerformance::Good;
        }
        let ratio = min_square_distance.max(0.0).sqrt() / grid.get_loading_range();
        let critical = self.config.block_on_slow_streaming_ratio;
        if ratio < critical {
            StreamingPerformance::Critical
        } else if ratio < critical * self.config.block_on_slow_streaming_warning_factor {
            StreamingPerformance::Slow
        } else {
            StreamingPerformance::Good
        }
    }

    /// Draw every streamed grid side by side into `canvas`, each showing the
    /// world `region`.
    pub fn draw_2d(
        &self,
        arena: &CellArena,
        canvas: &Box2,
        region: &Box2,
        cell_status: &dyn Fn(CellHandle) -> CellStreamingStatus,
        sources: &[StreamingSource],
        settings: &DebugDrawSettings,
    ) -> DebugDrawList2D {
        let mut out = DebugDrawList2D::default();
        let grids = self.get_filtered_streaming_grids();
        if grids.is_empty() || !canvas.is_valid() {
            return out;
        }
        let width = canvas.size().x / grids.len() as f64;
        for (i, grid) in grids.into_iter().enumerate() {
            let min = DVec2::new(canvas.min.x + width * i as f64, canvas.min.y);
            let screen_bounds = Box2::new(min, DVec2::new(min.x + width, canvas.max.y));
            let to_screen = fit_region_to_screen(region, &screen_bounds);
            let ctx = Draw2DContext {
                arena,
                region: *region,
                screen_bounds,
                world_to_screen: &to_screen,
                cell_status,
                sources,
                settings,
            };
            grid.draw_2d(&ctx, &mut out);
        }
        out
    }

    pub fn draw_3d(
        &self,
        arena: &CellArena,
        transform: DAffine3,
        cell_status: &dyn Fn(CellHandle) -> CellStreamingStatus,
        sources: &[StreamingSource],
        settings: &DebugDrawSettings,
    ) -> DebugDrawList3D {
        let mut out = DebugDrawList3D::default();
        let ctx = Draw3DContext {
            arena,
            transform,
            cell_status,
            sources,
            settings,
        };
        for grid in self.get_filtered_streaming_grids() {
            grid.draw_3d(&ctx, &mut out);
        }
        out
    }

    pub fn dump_state_log(&self, arena: &CellArena) -> String {
        let mut log = HierarchicalLog::new();
        log.push_scope("Runtime spatial hash");
        log.line(format!(
            "Settings: aligned levels {}, snap non-aligned levels {}, z culling {}",
            self.settings.use_aligned_grid_levels,
            self.settings.snap_non_aligned_grid_levels_to_lower_levels,
            self.config.enable_z_culling,
        ));
        log.line(format!(
            "Context: {:?}, HLODs {}",
            self.context.net_mode,
            if self.context.hlods_enabled { "enabled" } else { "disabled" }
        ));
        log.line(format!("Update hash: {:08x}", self.compute_update_streaming_hash()));
        for grid in &self.streaming_grids {
            grid.dump_state_log(arena, &mut log);
        }
        if !self.injected_objects.is_empty() {
            log.scope("External streaming objects", |log| {
                for (id, adopted) in &self.injected_objects {
                    if adopted.is_empty() {
                        log.line(id);
                    } else {
                        log.line(format!("{id} (adopted grids: {})", adopted.join(", ")));
                    }
                }
            });
        }
        log.pop_scope();
        log.into_string()
    }

    fn validate_injection(&self, object: &ExternalStreamingObject) -> bool {
        let mut adopted: HashMap<&str, &StreamingGrid> = HashMap::new();
        for external in &object.streaming_grids {
            let reference = match self.find_grid_index(external.name()) {
                Some(index) => &self.streaming_grids[index],
                None => *adopted.entry(external.name()).or_insert(external),
            };
            if let Err(err) = reference.check_external_grid(external) {
                tracing::error!(%err, object = %object.id, "cannot inject external streaming object");
                return false;
            }
        }
        true
    }
}

impl RuntimeHash for RuntimeSpatialHash {
    fn for_each_streaming_cells(&self, f: &mut dyn FnMut(CellHandle) -> bool) {
        for grid in self.get_filtered_streaming_grids() {
            if !grid.for_each_runtime_cell(&mut *f) {
                return;
            }
        }
    }

    fn for_each_streaming_cells_query(
        &self,
        arena: &CellArena,
        query: &StreamingQuerySource,
        f: &mut dyn FnMut(CellHandle) -> bool,
        mut cache: Option<&mut QueryCache>,
    ) {
        for grid in self.get_filtered_streaming_grids() {
            let mut cells = BTreeSet::new();
            grid.get_cells_for_query(
                arena,
                query,
                &mut cells,
                self.config.enable_z_culling,
                cache.as_deref_mut(),
            );
            for cell in cells {
                if !f(cell) {
                    return;
                }
            }
        }
    }

    fn for_each_streaming_cells_sources(
        &self,
        arena: &CellArena,
        sources: &[StreamingSource],
        f: &mut dyn FnMut(CellHandle, StreamingTargetState) -> bool,
    ) {
        let _span = tracing::info_span!("streaming_cells_sources", sources = sources.len()).entered();
        for grid in self.get_filtered_streaming_grids() {
            let mut activate = StreamingSourceCells::new();
            let mut load = StreamingSourceCells::new();
            grid.get_cells(arena, sources, &mut activate, &mut load, self.config.enable_z_culling);
            grid.get_non_spatially_loaded_cells(arena, &mut activate, &mut load);
            load.remove_all(&activate);
            tracing::trace!(grid = %grid.name(), activate = activate.len(), load = load.len(), "grid streaming cells");

            for cell in activate.handles() {
                if !f(cell, StreamingTargetState::Activated) {
                    return;
                }
            }
            for cell in load.handles() {
                if !f(cell, StreamingTargetState::Loaded) {
                    return;
                }
            }
        }
    }

    fn compute_update_streaming_hash(&self) -> u32 {
        let sum = self
            .streaming_grids
            .iter()
            .fold(0u64, |acc, grid| acc.wrapping_add(grid.streaming_hash()));
        (sum ^ (sum >> 32)) as u32
    }

    fn inject_external_streaming_object(&mut self, object: &ExternalStreamingObject) -> bool {
        if self.injected_objects.contains_key(&object.id) {
            tracing::warn!(object = %object.id, "external streaming object already injected");
            return false;
        }
        if !self.validate_injection(object) {
            return false;
        }

        let mut adopted = Vec::new();
        for external in &object.streaming_grids {
            let index = match self.find_grid_index(external.name()) {
                Some(index) => index,
                None => {
                    let mut grid = StreamingGrid::empty_like(external);
                    grid.grid_index = self.streaming_grids.len();
                    self.streaming_grids.push(grid);
                    self.mark_dirty();
                    adopted.push(external.name().to_string());
                    self.streaming_grids.len() - 1
                }
            };
            if let Err(err) = self.streaming_grids[index].inject_external_streaming_object_grid(external) {
                tracing::error!(%err, object = %object.id, "injection failed after validation");
            }
        }
        tracing::debug!(
            object = %object.id,
            grids = object.streaming_grids.len(),
            adopted = adopted.len(),
            "injected external streaming object"
        );
        self.injected_objects.insert(object.id, adopted);
        true
    }

    fn remove_external_streaming_object(&mut self, object: &ExternalStreamingObject) -> bool {
        if !self.injected_objects.contains_key(&object.id) {
            tracing::warn!(object = %object.id, "external streaming object was never injected");
            return false;
        }
        let mut targets = Vec::with_capacity(object.streaming_grids.len());
        for external in &object.streaming_grids {
            let target = self
                .find_grid_index(external.name())
                .filter(|&index| {
                    self.streaming_grids[index].can_remove_external_streaming_object_grid(external)
                });
            let Some(index) = target else {
                tracing::warn!(object = %object.id, grid = %external.name(), "injected content not found, nothing removed");
                return false;
            };
            targets.push(index);
        }

        for (external, index) in object.streaming_grids.iter().zip(targets) {
            self.streaming_grids[index].remove_external_streaming_object_grid(external);
        }
        if let Some(adopted) = self.injected_objects.remove(&object.id) {
            let before = self.streaming_grids.len();
            self.streaming_grids
                .retain(|grid| grid.has_content() || !adopted.iter().any(|name| name == grid.name()));
            if self.streaming_grids.len() != before {
                for (index, grid) in self.streaming_grids.iter_mut().enumerate() {
                    grid.grid_index = index;
                }
                self.mark_dirty();
            }
        }
        tracing::debug!(object = %object.id, "removed external streaming object");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeGridDefinition;
    use glam::DVec3;
    use spatialhash_kernel::RuntimeCell;

    fn world() -> Box3 {
        Box3::new(DVec3::new(-1000.0, -1000.0, -100.0), DVec3::new(1000.0, 1000.0, 100.0))
    }

    fn config() -> SpatialHashConfig {
        let mut hlod = RuntimeGridDefinition::new("HLOD0", 100, 1000.0);
        hlod.hlod_layer = Some("HLOD0".into());
        let mut client = RuntimeGridDefinition::new("Client", 100, 150.0);
        client.client_only_visible = true;
        SpatialHashConfig {
            grids: vec![RuntimeGridDefinition::new("Default", 100, 150.0), hlod, client],
            ..Default::default()
        }
    }

    fn generated(arena: &mut CellArena) -> (RuntimeSpatialHash, Vec<CellHandle>) {
        let mut hash = RuntimeSpatialHash::from_config(config()).unwrap();
        let mut placements = Vec::new();
        let mut handles = Vec::new();
        for name in ["Default", "HLOD0", "Client"] {
            let coord = GridCellCoord::new(0, 0, 0);
            let cell = arena.insert(RuntimeCell::new(name, 100, coord));
            placements.push(CellPlacement::new(name, coord, cell));
            handles.push(cell);
        }
        hash.generate_streaming(world(), &placements).unwrap();
        (hash, handles)
    }

    fn sources_output(
        hash: &RuntimeSpatialHash,
        arena: &CellArena,
        sources: &[StreamingSource],
    ) -> Vec<(CellHandle, StreamingTargetState)> {
        let mut out = Vec::new();
        hash.for_each_streaming_cells_sources(arena, sources, &mut |cell, state| {
            out.push((cell, state));
            true
        });
        out
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SpatialHashConfig {
            grids: vec![RuntimeGridDefinition::new("G", -5, 100.0)],
            ..Default::default()
        };
        assert!(RuntimeSpatialHash::from_config(config).is_err());
    }

    #[test]
    fn generation_is_all_or_nothing() {
        let mut arena = CellArena::new();
        let (mut hash, _) = generated(&mut arena);
        let before = hash.dump_state_log(&arena);

        let cell = arena.insert(RuntimeCell::new("Nope", 100, GridCellCoord::default()));
        let bad = [CellPlacement::new("Nope", GridCellCoord::default(), cell)];
        assert_eq!(
            hash.generate_streaming(world(), &bad),
            Err(HashError::UnknownGrid("Nope".into()))
        );

        let cell = arena.insert(RuntimeCell::new("Default", 100, GridCellCoord::new(0, 0, 40)));
        let bad = [CellPlacement::new("Default", GridCellCoord::new(0, 0, 40), cell)];
        assert!(matches!(hash.generate_streaming(world(), &bad), Err(HashError::Grid(_))));
        assert_eq!(hash.dump_state_log(&arena), before);
    }

    #[test]
    fn grid_lookup_by_name() {
        let mut arena = CellArena::new();
        let (hash, _) = generated(&mut arena);
        assert_eq!(hash.get_num_grids(), 3);
        assert_eq!(hash.get_streaming_grid_by_name("HLOD0").map(StreamingGrid::name), Some("HLOD0"));
        assert!(hash.get_streaming_grid_by_name("Missing").is_none());
        assert!(hash.is_valid_grid("Client"));
        assert!(!hash.is_valid_grid("Missing"));
    }

    #[test]
    fn duplicate_grid_is_rejected() {
        let mut arena = CellArena::new();
        let (mut hash, _) = generated(&mut arena);
        let definition = RuntimeGridDefinition::new("Default", 100, 150.0);
        let grid = StreamingGrid::new(&definition, world(), hash.settings()).unwrap();
        assert_eq!(
            hash.add_streaming_grid(grid),
            Err(HashError::DuplicateGrid("Default".into()))
        );

        let definition = RuntimeGridDefinition::new("Extra", 100, 150.0);
        let grid = StreamingGrid::new(&definition, world(), hash.settings()).unwrap();
        hash.add_streaming_grid(grid).unwrap();
        assert_eq!(hash.get_streaming_grid_by_name("Extra").map(StreamingGrid::grid_index), Some(3));
    }

    #[test]
    fn context_filters_grids() {
        let mut arena = CellArena::new();
        let (mut hash, handles) = generated(&mut arena);
        let source = [StreamingSource::new("p", DVec3::new(50.0, 50.0, 0.0))];
        assert_eq!(sources_output(&hash, &arena, &source).len(), 3);

        hash.set_context(StreamingContext {
            net_mode: NetMode::DedicatedServer,
            hlods_enabled: false,
        });
        let names: Vec<_> = hash.get_filtered_streaming_grids().iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["Default"]);
        assert_eq!(
            sources_output(&hash, &arena, &source),
            vec![(handles[0], StreamingTargetState::Activated)]
        );
    }

    #[test]
    fn callbacks_can_stop_iteration() {
        let mut arena = CellArena::new();
        let (hash, _) = generated(&mut arena);
        let mut seen = 0;
        hash.for_each_streaming_cells(&mut |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);

        let source = [StreamingSource::new("p", DVec3::new(50.0, 50.0, 0.0))];
        let mut seen = 0;
        hash.for_each_streaming_cells_sources(&arena, &source, &mut |_, _| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);

        let query = StreamingQuerySource::at(DVec3::new(50.0, 50.0, 0.0));
        let mut seen = 0;
        hash.for_each_streaming_cells_query(&arena, &query, &mut |_| {
            seen += 1;
            seen < 2
        }, None);
        assert_eq!(seen, 2);
    }

    #[test]
    fn inject_and_remove_external_object() {
        let mut arena = CellArena::new();
        let (mut hash, _) = generated(&mut arena);
        let hash_before = hash.compute_update_streaming_hash();
        let dump_before = hash.dump_state_log(&arena);

        let coord = GridCellCoord::new(1, 0, 0);
        let matched = arena.insert(RuntimeCell::new("Default", 100, coord));
        let mut object = hash
            .create_external_streaming_object(
                ContentBundleId::new(),
                &[CellPlacement::new("Default", coord, matched)],
            )
            .unwrap();
        let standalone_definition = RuntimeGridDefinition::new("Bundle", 100, 150.0);
        let mut standalone = StreamingGrid::new(&standalone_definition, world(), hash.settings()).unwrap();
        let adopted_cell = arena.insert(RuntimeCell::new("Bundle", 100, coord));
        standalone.insert_grid_cell(adopted_cell, coord).unwrap();
        object.streaming_grids.push(standalone);

        assert!(hash.inject_external_streaming_object(&object));
        assert!(!hash.inject_external_streaming_object(&object));
        assert!(hash.is_injected(object.id()));
        assert_eq!(hash.get_num_grids(), 4);
        assert_ne!(hash.compute_update_streaming_hash(), hash_before);

        let source = [StreamingSource::new("p", DVec3::new(50.0, 50.0, 0.0))];
        let cells: Vec<_> = sources_output(&hash, &arena, &source).into_iter().map(|(c, _)| c).collect();
        assert!(cells.contains(&matched));
        assert!(cells.contains(&adopted_cell));

        assert!(hash.remove_external_streaming_object(&object));
        assert!(!hash.remove_external_streaming_object(&object));
        assert_eq!(hash.get_num_grids(), 3);
        assert!(hash.get_streaming_grid_by_name("Bundle").is_none());
        assert_eq!(hash.compute_update_streaming_hash(), hash_before);
        assert_eq!(hash.dump_state_log(&arena), dump_before);
    }

    #[test]
    fn mismatched_object_changes_nothing() {
        let mut arena = CellArena::new();
        let (mut hash, _) = generated(&mut arena);
        let dump_before = hash.dump_state_log(&arena);

        let good = hash.create_external_streaming_object(ContentBundleId::new(), &[]).unwrap();
        let mut object = ExternalStreamingObject::new(ContentBundleId::new());
        object.streaming_grids = good.streaming_grids;
        let coarse = RuntimeGridDefinition::new("Default", 200, 150.0);
        object
            .streaming_grids
            .push(StreamingGrid::new(&coarse, world(), hash.settings()).unwrap());

        assert!(!hash.inject_external_streaming_object(&object));
        assert!(!hash.is_injected(object.id()));
        assert_eq!(hash.dump_state_log(&arena), dump_before);
    }

    #[test]
    fn slow_streaming_thresholds() {
        let mut arena = CellArena::new();
        let mut definition = RuntimeGridDefinition::new("Blocking", 100, 1000.0);
        definition.block_on_slow_streaming = true;
        let config = SpatialHashConfig {
            grids: vec![definition, RuntimeGridDefinition::new("Relaxed", 100, 1000.0)],
            ..Default::default()
        };
        let mut hash = RuntimeSpatialHash::from_config(config).unwrap();
        let coord = GridCellCoord::default();
        let blocking = arena.insert(RuntimeCell::new("Blocking", 100, coord));
        let relaxed = arena.insert(RuntimeCell::new("Relaxed", 100, coord));
        hash.generate_streaming(
            world(),
            &[
                CellPlacement::new("Blocking", coord, blocking),
                CellPlacement::new("Relaxed", coord, relaxed),
            ],
        )
        .unwrap();

        let perf = |cell, d: f64| hash.get_streaming_performance_for_cell(&arena, cell, d * d);
        assert_eq!(perf(blocking, 100.0), StreamingPerformance::Critical);
        assert_eq!(perf(blocking, 300.0), StreamingPerformance::Slow);
        assert_eq!(perf(blocking, 600.0), StreamingPerformance::Good);
        assert_eq!(perf(relaxed, 0.0), StreamingPerformance::Good);
    }

    #[test]
    fn store_moves_content_out() {
        let mut arena = CellArena::new();
        let (mut hash, _) = generated(&mut arena);
        assert!(hash.has_streaming_content());
        let id = ContentBundleId::new();
        let object = hash.store_streaming_content_to_external_streaming_object(id);
        assert_eq!(object.id(), id);
        assert_eq!(object.cell_count(), 3);
        assert!(!hash.has_streaming_content());
        assert!(hash.get_streaming_grid_by_name("Default").is_none());

        assert!(hash.inject_external_streaming_object(&object));
        assert_eq!(hash.get_num_grids(), 3);
        hash.flush_streaming_content();
        assert_eq!(hash.get_num_grids(), 0);
    }

    #[test]
    fn stored_content_keeps_injected_cells() {
        let mut arena = CellArena::new();
        let (mut hash, handles) = generated(&mut arena);
        let coord = GridCellCoord::new(1, 0, 0);
        let bundle_cell = arena.insert(RuntimeCell::new("Default", 100, coord));
        let bundle = hash
            .create_external_streaming_object(
                ContentBundleId::new(),
                &[CellPlacement::new("Default", coord, bundle_cell)],
            )
            .unwrap();
        assert!(hash.inject_external_streaming_object(&bundle));

        let source = StreamingSource::new("p", DVec3::new(100.0, 50.0, 0.0));
        let default_cells = |hash: &RuntimeSpatialHash| {
            let (activate, _) = hash.get_streaming_cells(&arena, &[source.clone()]);
            activate
                .handles()
                .filter(|h| *h == handles[0] || *h == bundle_cell)
                .collect::<Vec<_>>()
        };
        let before = default_cells(&hash);
        assert_eq!(before, vec![handles[0], bundle_cell]);

        let stored = hash.store_streaming_content_to_external_streaming_object(ContentBundleId::new());
        assert_eq!(stored.cell_count(), 4);
        assert!(stored.streaming_grids.iter().all(|g| g.injected_cell_count() == 0));

        assert!(hash.inject_external_streaming_object(&stored));
        assert_eq!(default_cells(&hash), before);
        assert!(hash.remove_external_streaming_object(&stored));
        assert!(!hash.has_streaming_content());
    }

    #[test]
    fn draw_2d_splits_canvas_between_grids() {
        let mut arena = CellArena::new();
        let (hash, _) = generated(&mut arena);
        let canvas = Box2::new(DVec2::ZERO, DVec2::new(600.0, 200.0));
        let region = Box2::new(DVec2::splat(-200.0), DVec2::splat(200.0));
        let status = |_: CellHandle| CellStreamingStatus::Loaded;
        let out = hash.draw_2d(&arena, &canvas, &region, &status, &[], &DebugDrawSettings::default());
        let labels: Vec<_> = out
            .primitives
            .iter()
            .filter_map(|p| match p {
                crate::draw::DebugPrimitive2D::Text { position, text, .. } => Some((position.x, text.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec![(0.0, "Default"), (200.0, "HLOD0"), (400.0, "Client")]);
    }

    #[test]
    fn shared_hash_reads_from_threads() {
        let mut arena = CellArena::new();
        let (hash, handles) = generated(&mut arena);
        let shared = hash.into_shared();
        let arena = Arc::new(arena);
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    let hash = shared.read();
                    let source = StreamingSource::new("p", DVec3::new(50.0 + i as f64, 50.0, 0.0));
                    let (activate, _) = hash.get_streaming_cells(&arena, &[source]);
                    activate.handles().collect::<Vec<_>>()
                })
            })
            .collect();
        for thread in threads {
            assert_eq!(thread.join().unwrap(), handles);
        }

        let mut hash = shared.write();
        hash.set_context(StreamingContext {
            hlods_enabled: false,
            ..StreamingContext::default()
        });
        assert_eq!(hash.get_filtered_streaming_grids().len(), 2);
    }
}
