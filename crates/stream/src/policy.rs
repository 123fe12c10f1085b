use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use spatialhash_common::StreamingTargetState;
use spatialhash_kernel::{CellArena, CellHandle};

use crate::runtime_hash::RuntimeHash;
use crate::source::StreamingSource;

/// Per-update budgets for the streaming policy.
#[derive(Debug, Clone)]
pub struct StreamingPolicyConfig {
    /// Maximum number of cells to load per update.
    pub load_budget: usize,
    /// Maximum number of cells to unload per update.
    pub unload_budget: usize,
}

impl Default for StreamingPolicyConfig {
    fn default() -> Self {
        Self {
            load_budget: 4,
            unload_budget: 4,
        }
    }
}

/// Cell transitions decided by one update, each list in handle order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingUpdate {
    pub to_load: Vec<CellHandle>,
    pub to_activate: Vec<CellHandle>,
    pub to_deactivate: Vec<CellHandle>,
    pub to_unload: Vec<CellHandle>,
}

impl StreamingUpdate {
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty()
            && self.to_activate.is_empty()
            && self.to_deactivate.is_empty()
            && self.to_unload.is_empty()
    }
}

/// Per-update streaming statistics for instrumentation.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub cells_loaded_this_update: usize,
    pub cells_activated_this_update: usize,
    pub cells_deactivated_this_update: usize,
    pub cells_unloaded_this_update: usize,
    pub total_loaded_cells: usize,
    pub total_activated_cells: usize,
    /// Wanted cells left for a later update by the load budget.
    pub pending_loads: usize,
    pub update_time: Duration,
}

/// Reference consumer of a [`RuntimeHash`]: tracks which cells are loaded
/// and activated and moves them toward what the sources want, within budget.
///
/// Activated cells are always a subset of loaded cells.
#[derive(Debug)]
pub struct StreamingPolicy {
    pub config: StreamingPolicyConfig,
    loaded_cells: BTreeSet<CellHandle>,
    activated_cells: BTreeSet<CellHandle>,
    last_update_hash: Option<u32>,
    stats: StreamStats,
}

impl StreamingPolicy {
    pub fn new(config: StreamingPolicyConfig) -> Self {
        Self {
            config,
            loaded_cells: BTreeSet::new(),
            activated_cells: BTreeSet::new(),
            last_update_hash: None,
            stats: StreamStats::default(),
        }
    }

    /// Ask `hash` what `sources` want and return the transitions to apply.
    pub fn update<H: RuntimeHash + ?Sized>(
        &mut self,
        hash: &H,
        arena: &CellArena,
        sources: &[StreamingSource],
    ) -> StreamingUpdate {
        let _span = tracing::info_span!("streaming_policy_update").entered();
        let update_start = Instant::now();
        self.last_update_hash = Some(hash.compute_update_streaming_hash());

        let mut want_activated = BTreeSet::new();
        let mut want_loaded = BTreeSet::new();
        hash.for_each_streaming_cells_sources(arena, sources, &mut |cell, state| {
            match state {
                StreamingTargetState::Activated => want_activated.insert(cell),
                StreamingTargetState::Loaded => want_loaded.insert(cell),
            };
            true
        });

        let to_unload: Vec<CellHandle> = self
            .loaded_cells
            .iter()
            .copied()
            .filter(|c| !want_activated.contains(c) && !want_loaded.contains(c))
            .take(self.config.unload_budget)
            .collect();

        // Activated cells first so they get the budget before plain loads.
        let missing: Vec<CellHandle> = want_activated
            .iter()
            .chain(&want_loaded)
            .copied()
            .filter(|c| !self.loaded_cells.contains(c))
            .collect();
        let to_load: Vec<CellHandle> = missing.iter().take(self.config.load_budget).copied().collect();

        let to_deactivate: Vec<CellHandle> = self
            .activated_cells
            .iter()
            .copied()
            .filter(|c| !want_activated.contains(c))
            .collect();

        for c in &to_unload {
            tracing::debug!(cell = %c, "unloading cell");
            self.loaded_cells.remove(c);
        }
        for c in &to_deactivate {
            tracing::debug!(cell = %c, "deactivating cell");
            self.activated_cells.remove(c);
        }
        for c in &to_load {
            tracing::debug!(cell = %c, "loading cell");
            self.loaded_cells.insert(*c);
        }

        let to_activate: Vec<CellHandle> = want_activated
            .iter()
            .copied()
            .filter(|c| self.loaded_cells.contains(c) && !self.activated_cells.contains(c))
            .collect();
        for c in &to_activate {
            tracing::debug!(cell = %c, "activating cell");
            self.activated_cells.insert(*c);
        }

        self.stats = StreamStats {
            cells_loaded_this_update: to_load.len(),
            cells_activated_this_update: to_activate.len(),
            cells_deactivated_this_update: to_deactivate.len(),
            cells_unloaded_this_update: to_unload.len(),
            total_loaded_cells: self.loaded_cells.len(),
            total_activated_cells: self.activated_cells.len(),
            pending_loads: missing.len() - to_load.len(),
            update_time: update_start.elapsed(),
        };

        tracing::trace!(
            loaded = to_load.len(),
            activated = to_activate.len(),
            unloaded = to_unload.len(),
            total = self.loaded_cells.len(),
            "streaming update complete"
        );

        StreamingUpdate {
            to_load,
            to_activate,
            to_deactivate,
            to_unload,
        }
    }

    pub fn loaded_cells(&self) -> &BTreeSet<CellHandle> {
        &self.loaded_cells
    }

    pub fn activated_cells(&self) -> &BTreeSet<CellHandle> {
        &self.activated_cells
    }

    pub fn is_loaded(&self, cell: CellHandle) -> bool {
        self.loaded_cells.contains(&cell)
    }

    pub fn is_activated(&self, cell: CellHandle) -> bool {
        self.activated_cells.contains(&cell)
    }

    /// Streaming hash seen by the last update, `None` before the first one.
    pub fn last_update_hash(&self) -> Option<u32> {
        self.last_update_hash
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}
