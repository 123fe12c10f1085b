//! Debug drawing. Grids emit renderer-agnostic primitives; rasterizing them
//! is the caller's business.

use glam::{DAffine3, DVec2, DVec3};
use spatialhash_common::{Box2, GridCellCoord, LinearColor, SphericalSector};
use spatialhash_kernel::{CellArena, CellHandle};
use std::collections::BTreeSet;

use crate::grid::StreamingGrid;
use crate::level::StreamingGridLayerCell;
use crate::source::StreamingSource;

/// Cells narrower than this on screen are not drawn; a coarser level is used.
const MIN_CELL_SCREEN_SIZE: f64 = 8.0;
const SHAPE_SEGMENTS: usize = 32;
const FILL_ALPHA: f32 = 0.25;

/// Streaming state of a cell as seen by whoever draws it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CellStreamingStatus {
    #[default]
    Unloaded,
    Loaded,
    Activated,
}

impl CellStreamingStatus {
    pub fn color(self) -> LinearColor {
        match self {
            Self::Unloaded => LinearColor::GREY,
            Self::Loaded => LinearColor::ORANGE,
            Self::Activated => LinearColor::GREEN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebugDrawSettings {
    /// Cells with data layers are drawn only when one of them is listed here.
    /// `None` draws every cell.
    pub visible_data_layers: Option<BTreeSet<String>>,
    pub draw_sources: bool,
}

impl Default for DebugDrawSettings {
    fn default() -> Self {
        Self {
            visible_data_layers: None,
            draw_sources: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugPrimitive2D {
    Rect {
        min: DVec2,
        max: DVec2,
        color: LinearColor,
        filled: bool,
    },
    Line {
        from: DVec2,
        to: DVec2,
        color: LinearColor,
    },
    Text {
        position: DVec2,
        text: String,
        color: LinearColor,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugPrimitive3D {
    Box {
        corners: [DVec3; 8],
        color: LinearColor,
        solid: bool,
    },
    Sector {
        center: DVec3,
        radius: f64,
        axis: DVec3,
        angle: f64,
        color: LinearColor,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DebugDrawList2D {
    pub primitives: Vec<DebugPrimitive2D>,
}

impl DebugDrawList2D {
    pub fn rect(&mut self, min: DVec2, max: DVec2, color: LinearColor, filled: bool) {
        self.primitives.push(DebugPrimitive2D::Rect {
            min,
            max,
            color,
            filled,
        });
    }

    pub fn line(&mut self, from: DVec2, to: DVec2, color: LinearColor) {
        self.primitives.push(DebugPrimitive2D::Line { from, to, color });
    }

    pub fn text(&mut self, position: DVec2, text: impl Into<String>, color: LinearColor) {
        self.primitives.push(DebugPrimitive2D::Text {
            position,
            text: text.into(),
            color,
        });
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DebugDrawList3D {
    pub primitives: Vec<DebugPrimitive3D>,
}

impl DebugDrawList3D {
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}

/// Everything a grid needs to draw itself into a 2D panel.
pub struct Draw2DContext<'a> {
    pub arena: &'a CellArena,
    /// World region shown.
    pub region: Box2,
    /// Screen rectangle the grid is drawn into.
    pub screen_bounds: Box2,
    pub world_to_screen: &'a dyn Fn(DVec2) -> DVec2,
    pub cell_status: &'a dyn Fn(CellHandle) -> CellStreamingStatus,
    pub sources: &'a [StreamingSource],
    pub settings: &'a DebugDrawSettings,
}

pub struct Draw3DContext<'a> {
    pub arena: &'a CellArena,
    /// World to view transform applied to every emitted point.
    pub transform: DAffine3,
    pub cell_status: &'a dyn Fn(CellHandle) -> CellStreamingStatus,
    pub sources: &'a [StreamingSource],
    pub settings: &'a DebugDrawSettings,
}

/// Linear map of `region` into `screen`, uniformly scaled and centered.
pub fn fit_region_to_screen(region: &Box2, screen: &Box2) -> impl Fn(DVec2) -> DVec2 + use<> {
    let region_size = region.size().max(DVec2::splat(f64::EPSILON));
    let scale = (screen.size() / region_size).min_element();
    let offset = screen.center() - region.center() * scale;
    move |p| p * scale + offset
}

impl StreamingGrid {
    /// Cells of `layer_cell` that the settings allow to be drawn.
    pub fn get_filtered_cells_for_debug_draw(
        &self,
        arena: &CellArena,
        layer_cell: &StreamingGridLayerCell,
        settings: &DebugDrawSettings,
    ) -> Vec<CellHandle> {
        layer_cell
            .grid_cells
            .iter()
            .copied()
            .filter(|&handle| {
                arena.get(handle).is_some_and(|cell| {
                    match &settings.visible_data_layers {
                        Some(visible) => {
                            !cell.has_data_layers() || cell.has_any_data_layer(visible)
                        }
                        None => true,
                    }
                })
            })
            .collect()
    }

    fn best_status_at(
        &self,
        coord: GridCellCoord,
        arena: &CellArena,
        settings: &DebugDrawSettings,
        cell_status: &dyn Fn(CellHandle) -> CellStreamingStatus,
    ) -> Option<CellStreamingStatus> {
        let mut best = None;
        self.for_each_layer_cell(coord, |layer| {
            for handle in self.get_filtered_cells_for_debug_draw(arena, layer, settings) {
                best = best.max(Some(cell_status(handle)));
            }
        });
        best
    }

    /// Finest level whose cells are wide enough on screen.
    fn first_drawable_level(&self, world_to_screen: &dyn Fn(DVec2) -> DVec2) -> i32 {
        let top = self.level_count() - 1;
        (0..top)
            .find(|&level| {
                let size = self.get_cell_size(level) as f64;
                let px = (world_to_screen(DVec2::new(size, 0.0)) - world_to_screen(DVec2::ZERO))
                    .length();
                px >= MIN_CELL_SCREEN_SIZE
            })
            .unwrap_or(top.max(0))
    }

    /// Draw the cells touching `ctx.region`, coarse levels first, plus the
    /// sources targeting this grid. Returns whether any cell was drawn.
    pub fn draw_2d(&self, ctx: &Draw2DContext<'_>, out: &mut DebugDrawList2D) -> bool {
        let to_screen = ctx.world_to_screen;
        let mut drawn = false;

        let first_level = self.first_drawable_level(to_screen);
        for level in (first_level..self.level_count()).rev() {
            self.helper
                .for_each_intersecting_cell(&ctx.region, level, |coord| {
                    let Some(status) =
                        self.best_status_at(coord, ctx.arena, ctx.settings, ctx.cell_status)
                    else {
                        return;
                    };
                    let bounds = self.helper.get_cell_bounds(&coord);
                    let (min, max) = screen_rect(&bounds, to_screen);
                    if status != CellStreamingStatus::Unloaded {
                        out.rect(min, max, status.color().with_alpha(FILL_ALPHA), true);
                    }
                    out.rect(min, max, self.debug_color, false);
                    drawn = true;
                });
        }

        if ctx.settings.draw_sources {
            for source in ctx.sources.iter().filter(|s| s.targets_grid(&self.grid_name)) {
                source.for_each_shape(self.get_loading_range(), true, |shape| {
                    let outline = shape_outline_2d(&shape);
                    for pair in outline.windows(2) {
                        out.line(to_screen(pair[0]), to_screen(pair[1]), source.debug_color);
                    }
                });
            }
        }

        out.rect(ctx.screen_bounds.min, ctx.screen_bounds.max, self.debug_color, false);
        out.text(ctx.screen_bounds.min, self.grid_name.clone(), self.debug_color);
        drawn
    }

    /// Draw, in 3D, the cells touched by each source shape along with the
    /// shapes themselves. Cell boxes span the cell's content height, or the
    /// shape's when the cell has no content bounds.
    pub fn draw_3d(&self, ctx: &Draw3DContext<'_>, out: &mut DebugDrawList3D) {
        let mut visited = BTreeSet::new();
        for source in ctx.sources.iter().filter(|s| s.targets_grid(&self.grid_name)) {
            let mut shapes = Vec::new();
            source.for_each_shape(self.get_loading_range(), false, |shape| shapes.push(shape));
            for shape in &shapes {
                if ctx.settings.draw_sources {
                    out.primitives.push(DebugPrimitive3D::Sector {
                        center: ctx.transform.transform_point3(shape.center),
                        radius: shape.radius,
                        axis: ctx.transform.transform_vector3(shape.axis).normalize_or_zero(),
                        angle: shape.angle,
                        color: source.debug_color,
                    });
                }
                let flat = shape.project_2d();
                for level in 0..self.level_count() {
                    self.helper
                        .for_each_intersecting_cell_shape(&flat, level, |coord| {
                            if !visited.insert(coord) {
                                return;
                            }
                            self.draw_cell_3d(ctx, coord, shape, out);
                        });
                }
            }
        }
    }

    fn draw_cell_3d(
        &self,
        ctx: &Draw3DContext<'_>,
        coord: GridCellCoord,
        shape: &SphericalSector,
        out: &mut DebugDrawList3D,
    ) {
        let bounds = self.helper.get_cell_bounds(&coord);
        self.for_each_layer_cell(coord, |layer| {
            for handle in self.get_filtered_cells_for_debug_draw(ctx.arena, layer, ctx.settings) {
                let Some(cell) = ctx.arena.get(handle) else {
                    continue;
                };
                let (z_min, z_max) = if cell.content_bounds.is_valid() {
                    (cell.content_bounds.min.z, cell.content_bounds.max.z)
                } else {
                    shape.z_range()
                };
                let status = (ctx.cell_status)(handle);
                let color = match status {
                    CellStreamingStatus::Unloaded => self.debug_color,
                    other => other.color(),
                };
                let mut corners = [DVec3::ZERO; 8];
                for (i, corner) in corners.iter_mut().enumerate() {
                    let x = if i & 1 == 0 { bounds.min.x } else { bounds.max.x };
                    let y = if i & 2 == 0 { bounds.min.y } else { bounds.max.y };
                    let z = if i & 4 == 0 { z_min } else { z_max };
                    *corner = ctx.transform.transform_point3(DVec3::new(x, y, z));
                }
                out.primitives.push(DebugPrimitive3D::Box {
                    corners,
                    color,
                    solid: status == CellStreamingStatus::Activated,
                });
            }
        });
    }
}

fn screen_rect(bounds: &Box2, to_screen: &dyn Fn(DVec2) -> DVec2) -> (DVec2, DVec2) {
    let a = to_screen(bounds.min);
    let b = to_screen(bounds.max);
    (a.min(b), a.max(b))
}

/// Closed outline of a projected shape: a polygon for spheres, a pie slice
/// for sectors.
fn shape_outline_2d(shape: &SphericalSector) -> Vec<DVec2> {
    let center = shape.center_2d();
    if shape.is_sphere() {
        return (0..=SHAPE_SEGMENTS)
            .map(|i| {
                let a = std::f64::consts::TAU * i as f64 / SHAPE_SEGMENTS as f64;
                center + DVec2::from_angle(a) * shape.radius
            })
            .collect();
    }
    let heading = shape.axis.truncate().to_angle();
    let half = (shape.angle * 0.5).to_radians();
    let mut points = vec![center];
    points.extend((0..=SHAPE_SEGMENTS).map(|i| {
        let a = heading - half + 2.0 * half * i as f64 / SHAPE_SEGMENTS as f64;
        center + DVec2::from_angle(a) * shape.radius
    }));
    points.push(center);
    points
}
