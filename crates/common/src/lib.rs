//! Shared value types for the spatial hash: cell coordinates, world-space
//! bounds, streaming shapes, debug colors and stable hashing.
//!
//! # Invariants
//! - Everything here is a plain value; no type owns cell content.
//! - Hashes produced by [`hash`] are stable across runs and platforms.

pub mod bounds;
pub mod color;
pub mod hash;
pub mod shape;
pub mod types;

pub use bounds::{Box2, Box3};
pub use color::LinearColor;
pub use hash::{Fnv1a, fnv1a_64};
pub use shape::SphericalSector;
pub use types::{ContentBundleId, GridCellCoord, GridCellCoord2, StreamingTargetState};
