use serde::{Deserialize, Serialize};
use spatialhash_common::{Box3, ContentBundleId, GridCellCoord, StreamingTargetState};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::naming::{DataLayersId, cell_guid, cell_name_string};

/// One loadable unit of world content, as far as streaming is concerned.
///
/// Grids never own these; they hold [`CellHandle`](crate::CellHandle)s into a
/// [`CellArena`](crate::CellArena). The payload itself (actors, meshes, ...)
/// belongs to whoever loads the cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCell {
    name: String,
    guid: Uuid,
    grid_name: String,
    cell_size: i64,
    coord: GridCellCoord,
    data_layers: BTreeSet<String>,
    content_bundle: Option<ContentBundleId>,
    /// World-space bounds of the content. Used for Z-culling.
    pub content_bounds: Box3,
    /// `false` for cells that stream regardless of any source.
    pub spatially_loaded: bool,
    /// Target used when the cell is not spatially loaded.
    pub non_spatial_target: StreamingTargetState,
    pub client_only_visible: bool,
    pub block_on_slow_streaming: bool,
    pub priority: i32,
    pub is_hlod: bool,
}

impl RuntimeCell {
    /// A spatially loaded cell at `coord` of `grid_name`.
    pub fn new(grid_name: impl Into<String>, cell_size: i64, coord: GridCellCoord) -> Self {
        let mut cell = Self {
            name: String::new(),
            guid: Uuid::nil(),
            grid_name: grid_name.into(),
            cell_size,
            coord,
            data_layers: BTreeSet::new(),
            content_bundle: None,
            content_bounds: Box3::EMPTY,
            spatially_loaded: true,
            non_spatial_target: StreamingTargetState::Activated,
            client_only_visible: false,
            block_on_slow_streaming: false,
            priority: 0,
            is_hlod: false,
        };
        cell.refresh_identity();
        cell
    }

    /// A cell that is streamed independently of any source.
    pub fn non_spatial(grid_name: impl Into<String>, cell_size: i64, coord: GridCellCoord) -> Self {
        Self {
            spatially_loaded: false,
            ..Self::new(grid_name, cell_size, coord)
        }
    }

    pub fn with_content_bounds(mut self, bounds: Box3) -> Self {
        self.content_bounds = bounds;
        self
    }

    pub fn with_data_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_layers = layers.into_iter().map(Into::into).collect();
        self.refresh_identity();
        self
    }

    pub fn with_content_bundle(mut self, bundle: ContentBundleId) -> Self {
        self.content_bundle = Some(bundle);
        self.refresh_identity();
        self
    }

    pub fn with_non_spatial_target(mut self, target: StreamingTargetState) -> Self {
        self.non_spatial_target = target;
        self
    }

    fn refresh_identity(&mut self) {
        let dl = DataLayersId::new(&self.data_layers);
        self.name = cell_name_string(&self.grid_name, &self.coord, dl, self.content_bundle);
        self.guid = cell_guid(
            &self.grid_name,
            self.cell_size,
            &self.coord,
            dl,
            self.content_bundle,
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn grid_name(&self) -> &str {
        &self.grid_name
    }

    pub fn coord(&self) -> GridCellCoord {
        self.coord
    }

    pub fn data_layers(&self) -> &BTreeSet<String> {
        &self.data_layers
    }

    pub fn has_data_layers(&self) -> bool {
        !self.data_layers.is_empty()
    }

    pub fn has_any_data_layer(&self, layers: &BTreeSet<String>) -> bool {
        self.data_layers.iter().any(|l| layers.contains(l))
    }

    pub fn content_bundle(&self) -> Option<ContentBundleId> {
        self.content_bundle
    }
}
