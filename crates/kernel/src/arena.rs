use serde::{Deserialize, Serialize};

use crate::cell::RuntimeCell;

/// Stable reference to a [`RuntimeCell`] in a [`CellArena`].
///
/// A handle whose slot was freed and reused resolves to `None`, never to the
/// new occupant. Ordering is by slot then generation, which is what the
/// streaming outputs rely on for deterministic iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellHandle {
    index: u32,
    generation: u32,
}

impl CellHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for CellHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    generation: u32,
    cell: Option<RuntimeCell>,
}

/// Generational arena owning every runtime cell record.
///
/// Cell lifetime is managed here, independently of the grids that reference
/// the cells.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl CellArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a cell and return its handle.
    pub fn insert(&mut self, cell: RuntimeCell) -> CellHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.cell = Some(cell);
            return CellHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            cell: Some(cell),
        });
        CellHandle {
            index,
            generation: 0,
        }
    }

    /// Remove a cell. Returns the record if the handle was live.
    pub fn remove(&mut self, handle: CellHandle) -> Option<RuntimeCell> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        tracing::trace!(%handle, name = cell.name(), "cell removed from arena");
        Some(cell)
    }

    pub fn get(&self, handle: CellHandle) -> Option<&RuntimeCell> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.cell.as_ref())
    }

    pub fn get_mut(&mut self, handle: CellHandle) -> Option<&mut RuntimeCell> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.cell.as_mut())
    }

    pub fn contains(&self, handle: CellHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Live cells in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (CellHandle, &RuntimeCell)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.cell.as_ref().map(|c| {
                (
                    CellHandle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    c,
                )
            })
        })
    }
}
