//! Streaming sources: the positions (players, cameras, ...) that pull cells in.

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use spatialhash_common::{LinearColor, SphericalSector, StreamingTargetState};
use std::collections::BTreeSet;

/// One shape attached to a source, expressed in the source's local space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSourceShape {
    /// Use the target grid's loading range as radius instead of `radius`.
    pub use_grid_loading_range: bool,
    /// Multiplier applied to the grid loading range.
    pub loading_range_scale: f64,
    pub radius: f64,
    pub is_sector: bool,
    /// Full opening angle in degrees.
    pub sector_angle: f64,
    pub location: DVec3,
    pub rotation: DQuat,
}

impl Default for StreamingSourceShape {
    fn default() -> Self {
        Self {
            use_grid_loading_range: true,
            loading_range_scale: 1.0,
            radius: 10_000.0,
            is_sector: false,
            sector_angle: 360.0,
            location: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
        }
    }
}

/// Expands a source's shapes into world-space sectors for one grid.
fn for_each_shape(
    grid_loading_range: f64,
    default_radius: f64,
    project_2d: bool,
    location: DVec3,
    rotation: DQuat,
    shapes: &[StreamingSourceShape],
    mut f: impl FnMut(SphericalSector),
) {
    let emit = |shape: SphericalSector, f: &mut dyn FnMut(SphericalSector)| {
        if shape.is_valid() {
            f(if project_2d { shape.project_2d() } else { shape });
        }
    };
    if shapes.is_empty() {
        emit(SphericalSector::sphere(location, default_radius), &mut f);
        return;
    }
    for shape in shapes {
        let radius = if shape.use_grid_loading_range {
            grid_loading_range * shape.loading_range_scale
        } else {
            shape.radius
        };
        let center = location + rotation * shape.location;
        let sector = if shape.is_sector {
            let axis = (rotation * shape.rotation) * DVec3::X;
            SphericalSector::sector(center, radius, axis, shape.sector_angle)
        } else {
            SphericalSector::sphere(center, radius)
        };
        emit(sector, &mut f);
    }
}

fn targets_grid(target_grids: &Option<BTreeSet<String>>, grid_name: &str) -> bool {
    target_grids
        .as_ref()
        .is_none_or(|names| names.contains(grid_name))
}

/// A runtime streaming source, evaluated every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSource {
    pub name: String,
    pub location: DVec3,
    pub rotation: DQuat,
    pub target_state: StreamingTargetState,
    pub block_on_slow_loading: bool,
    /// Lower is more important.
    pub priority: u8,
    pub debug_color: LinearColor,
    /// Restrict the source to these grids. `None` targets every grid.
    pub target_grids: Option<BTreeSet<String>>,
    /// Empty means one sphere with the grid loading range.
    pub shapes: Vec<StreamingSourceShape>,
}

impl StreamingSource {
    pub fn new(name: impl Into<String>, location: DVec3) -> Self {
        Self {
            name: name.into(),
            location,
            rotation: DQuat::IDENTITY,
            target_state: StreamingTargetState::Activated,
            block_on_slow_loading: false,
            priority: 128,
            debug_color: LinearColor::WHITE,
            target_grids: None,
            shapes: Vec::new(),
        }
    }

    pub fn with_target_state(mut self, state: StreamingTargetState) -> Self {
        self.target_state = state;
        self
    }

    pub fn with_shape(mut self, shape: StreamingSourceShape) -> Self {
        self.shapes.push(shape);
        self
    }

    pub fn with_target_grids<I, S>(mut self, grids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_grids = Some(grids.into_iter().map(Into::into).collect());
        self
    }

    pub fn targets_grid(&self, grid_name: &str) -> bool {
        targets_grid(&self.target_grids, grid_name)
    }

    /// World-space shapes of this source against a grid with `loading_range`.
    pub fn for_each_shape(
        &self,
        loading_range: f64,
        project_2d: bool,
        f: impl FnMut(SphericalSector),
    ) {
        for_each_shape(
            loading_range,
            loading_range,
            project_2d,
            self.location,
            self.rotation,
            &self.shapes,
            f,
        );
    }
}

/// A one-off spatial or data-layer query ("what would be loaded here?").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingQuerySource {
    pub location: DVec3,
    pub rotation: DQuat,
    pub radius: f64,
    /// Use the grid loading range instead of `radius`.
    pub use_grid_loading_range: bool,
    pub shapes: Vec<StreamingSourceShape>,
    /// `false` returns every cell of the grid that passes the data layer filter.
    pub spatial_query: bool,
    pub data_layers: BTreeSet<String>,
    /// Reject cells without data layers.
    pub data_layers_only: bool,
    pub target_grids: Option<BTreeSet<String>>,
}

impl Default for StreamingQuerySource {
    fn default() -> Self {
        Self {
            location: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            radius: 0.0,
            use_grid_loading_range: true,
            shapes: Vec::new(),
            spatial_query: true,
            data_layers: BTreeSet::new(),
            data_layers_only: false,
            target_grids: None,
        }
    }
}

impl StreamingQuerySource {
    pub fn at(location: DVec3) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self.use_grid_loading_range = false;
        self
    }

    pub fn targets_grid(&self, grid_name: &str) -> bool {
        targets_grid(&self.target_grids, grid_name)
    }

    pub fn for_each_shape(
        &self,
        loading_range: f64,
        project_2d: bool,
        f: impl FnMut(SphericalSector),
    ) {
        let default_radius = if self.use_grid_loading_range {
            loading_range
        } else {
            self.radius
        };
        for_each_shape(
            loading_range,
            default_radius,
            project_2d,
            self.location,
            self.rotation,
            &self.shapes,
            f,
        );
    }
}
