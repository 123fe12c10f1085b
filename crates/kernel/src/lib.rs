//! Cell kernel: the authoritative store of runtime cell records.
//!
//! # Invariants
//! - Every cell record lives in exactly one [`CellArena`] slot.
//! - Grids reference cells through [`CellHandle`]s only; a stale handle
//!   resolves to nothing instead of another cell.
//! - Cell names and GUIDs are pure functions of the cell's identity fields.

pub mod arena;
pub mod cell;
pub mod naming;

pub use arena::{CellArena, CellHandle};
pub use cell::RuntimeCell;
pub use naming::{DataLayersId, cell_coord_string, cell_guid, cell_name_string};
