use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cell coordinate inside one level of a streaming grid.
///
/// `x`/`y` are signed cell indices relative to the grid origin; `level` is the
/// grid level the coordinate belongs to (0 = finest). Coordinates from
/// different levels are never comparable without an explicit conversion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct GridCellCoord {
    pub x: i64,
    pub y: i64,
    pub level: i32,
}

impl GridCellCoord {
    pub fn new(x: i64, y: i64, level: i32) -> Self {
        Self { x, y, level }
    }

    /// The level-less 2D part of this coordinate.
    pub fn xy(&self) -> GridCellCoord2 {
        GridCellCoord2::new(self.x, self.y)
    }
}

/// A 2D cell coordinate without level information.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct GridCellCoord2 {
    pub x: i64,
    pub y: i64,
}

impl GridCellCoord2 {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn at_level(self, level: i32) -> GridCellCoord {
        GridCellCoord::new(self.x, self.y, level)
    }
}

/// What a streaming source wants for the cells it touches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum StreamingTargetState {
    /// Content in memory but not added to the world.
    Loaded,
    /// Content loaded and visible/ticking.
    #[default]
    Activated,
}

/// Identifier of a content bundle whose cells are injected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentBundleId(pub Uuid);

impl ContentBundleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContentBundleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContentBundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}
