//! Runtime spatial hash: answers which streaming cells a set of streaming
//! sources wants activated or loaded.
//!
//! Cells live in a per-grid pyramid of square levels; each level doubles the
//! cell size of the one below. Queries walk every level, gather the cells that
//! intersect the source shapes and split them into activate and load sets.
//!
//! # Invariants
//! - A cell reported for activation is never also reported for loading.
//! - Injecting an external streaming object and removing it again restores
//!   the grid to its previous contents and streaming hash.
//! - Query results are ordered by cell handle, independent of hash iteration.

pub mod cells;
pub mod config;
pub mod draw;
pub mod dump;
pub mod error;
pub mod grid;
pub mod grid_helper;
pub mod level;
pub mod policy;
pub mod query_cache;
pub mod runtime_hash;
pub mod source;

pub use cells::{CellSourceInfo, StreamingSourceCells};
pub use config::{ProjectDefaultOverride, RuntimeGridDefinition, SpatialHashConfig, SpatialHashSettings};
pub use draw::{
    CellStreamingStatus, DebugDrawList2D, DebugDrawList3D, DebugDrawSettings, DebugPrimitive2D,
    DebugPrimitive3D, Draw2DContext, Draw3DContext, fit_region_to_screen,
};
pub use dump::HierarchicalLog;
pub use error::{ConfigError, GridError, HashError};
pub use grid::StreamingGrid;
pub use grid_helper::{GridLevel, SquareGridHelper};
pub use level::{StreamingGridLayerCell, StreamingGridLevel, pack_cell_key, unpack_cell_key};
pub use policy::{StreamStats, StreamingPolicy, StreamingPolicyConfig, StreamingUpdate};
pub use query_cache::QueryCache;
pub use runtime_hash::{
    CellPlacement, ExternalStreamingObject, NetMode, RuntimeHash, RuntimeSpatialHash,
    SharedSpatialHash, StreamingContext, StreamingPerformance,
};
pub use source::{StreamingQuerySource, StreamingSource, StreamingSourceShape};
