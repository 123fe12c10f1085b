use spatialhash_common::GridCellCoord;

/// Errors from mutating a single streaming grid. Each one means build-time
/// and run-time data disagree; the grid is left untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("grid {grid}: cell size must be positive, got {cell_size}")]
    InvalidCellSize { grid: String, cell_size: i64 },
    #[error("grid cell size must be positive, got {0}")]
    NonPositiveCellSize(i64),
    #[error("grid {grid}: level {level} outside 0..{level_count}")]
    InvalidLevel {
        grid: String,
        level: i32,
        level_count: i32,
    },
    #[error("grid {grid}: coordinate {coord:?} cannot be packed into a cell key")]
    CoordOutOfRange { grid: String, coord: GridCellCoord },
    #[error("grid {grid}: external grid cell size {external} does not match {expected}")]
    CellSizeMismatch {
        grid: String,
        expected: i64,
        external: i64,
    },
    #[error("grid {grid}: external grid origin {external:?} does not match {expected:?}")]
    OriginMismatch {
        grid: String,
        expected: [f64; 3],
        external: [f64; 3],
    },
}

/// Errors from building or reshaping a [`RuntimeSpatialHash`](crate::RuntimeSpatialHash).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HashError {
    #[error("unknown streaming grid: {0}")]
    UnknownGrid(String),
    #[error("duplicate streaming grid: {0}")]
    DuplicateGrid(String),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Errors from loading or validating a [`SpatialHashConfig`](crate::SpatialHashConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
