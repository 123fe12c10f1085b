use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::DVec3;
use spatialhash_common::{Box3, GridCellCoord, StreamingTargetState};
use spatialhash_kernel::{CellArena, RuntimeCell};
use spatialhash_stream::{
    CellPlacement, RuntimeHash, RuntimeSpatialHash, SpatialHashConfig, StreamingPolicy,
    StreamingPolicyConfig, StreamingSource, StreamingSourceCells,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spatialhash-cli", about = "CLI tool for spatial hash operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Spatial hash config (YAML, or JSON by extension). Defaults to a single main grid.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Demo layout size: level 0 cells per side, per grid
    #[arg(long, global = true, default_value = "16")]
    side: i64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and the resolved grid configuration
    Info,
    /// Generate the demo layout and dump every grid
    Dump,
    /// List the cells a single source wants activated or loaded
    Query {
        #[arg(long, default_value = "0")]
        x: f64,
        #[arg(long, default_value = "0")]
        y: f64,
        #[arg(long, default_value = "0")]
        z: f64,
        /// Only load cells instead of activating them
        #[arg(long)]
        load_only: bool,
        /// Restrict the source to these grids
        #[arg(long = "grid")]
        grids: Vec<String>,
    },
    /// Walk a viewer along X and run the budgeted streaming policy
    Walk {
        /// Number of updates
        #[arg(short, long, default_value = "10")]
        steps: usize,
        /// Distance moved per update
        #[arg(long, default_value = "1000")]
        stride: f64,
        #[arg(long, default_value = "8")]
        load_budget: usize,
        #[arg(long, default_value = "8")]
        unload_budget: usize,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SpatialHashConfig> {
    match path {
        Some(path) => SpatialHashConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(SpatialHashConfig::default()),
    }
}

/// Fill every configured grid with a `side` x `side` square of level 0 cells
/// starting at the grid origin, plus one always loaded cell.
fn build_demo(
    config: SpatialHashConfig,
    side: i64,
) -> anyhow::Result<(RuntimeSpatialHash, CellArena)> {
    anyhow::ensure!(side > 0, "side must be positive, got {side}");
    let mut hash = RuntimeSpatialHash::from_config(config).context("invalid config")?;
    let mut arena = CellArena::new();
    let mut placements = Vec::new();
    let mut bounds = Box3::EMPTY;

    for definition in &hash.config().grids {
        let origin = definition.origin.extend(0.0);
        let extent = (definition.cell_size * side) as f64;
        let grid_bounds = Box3::new(
            origin + DVec3::new(0.0, 0.0, -extent),
            origin + DVec3::splat(extent),
        );
        bounds = bounds.merged(&grid_bounds);

        for y in 0..side {
            for x in 0..side {
                let coord = GridCellCoord::new(x, y, 0);
                let min = origin + DVec3::new(x as f64, y as f64, 0.0) * definition.cell_size as f64;
                let content = Box3::new(min, min + DVec3::splat(definition.cell_size as f64));
                let cell = arena.insert(
                    RuntimeCell::new(&definition.name, definition.cell_size, coord)
                        .with_content_bounds(content),
                );
                placements.push(CellPlacement::new(&definition.name, coord, cell));
            }
        }
        let always = GridCellCoord::new(0, 0, 0);
        let cell = arena.insert(RuntimeCell::non_spatial(
            &definition.name,
            definition.cell_size,
            always,
        ));
        placements.push(CellPlacement::new(&definition.name, always, cell));
    }

    let cells = hash.generate_streaming(bounds, &placements)?;
    tracing::info!(cells, grids = hash.get_num_grids(), "built demo layout");
    Ok((hash, arena))
}

fn print_cells(
    label: &str,
    hash: &RuntimeSpatialHash,
    arena: &CellArena,
    cells: &StreamingSourceCells,
) {
    println!("{label}: {} cells", cells.len());
    for (handle, info) in cells.iter() {
        let Some(cell) = arena.get(handle) else {
            continue;
        };
        if info.source_count == 0 {
            println!("  {handle} {} (non-spatial)", cell.name());
            continue;
        }
        let performance =
            hash.get_streaming_performance_for_cell(arena, handle, info.min_square_distance);
        println!(
            "  {handle} {} distance={:.1} performance={performance:?}",
            cell.name(),
            info.min_square_distance.sqrt()
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("spatialhash-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "z-culling: {}, block on slow streaming ratio: {} (warning x{})",
                config.enable_z_culling,
                config.block_on_slow_streaming_ratio,
                config.block_on_slow_streaming_warning_factor
            );
            let (hash, _) = build_demo(config, cli.side)?;
            for grid in hash.streaming_grids() {
                println!(
                    "grid {}: cell_size={} loading_range={} load_margin={} levels={} cells={} hlod={}",
                    grid.name(),
                    grid.cell_size(),
                    grid.get_loading_range(),
                    grid.load_margin(),
                    grid.level_count(),
                    grid.cell_count(),
                    grid.hlod_layer().unwrap_or("-"),
                );
            }
            println!("streaming hash: {:#010x}", hash.compute_update_streaming_hash());
        }
        Commands::Dump => {
            let (hash, arena) = build_demo(config, cli.side)?;
            print!("{}", hash.dump_state_log(&arena));
        }
        Commands::Query {
            x,
            y,
            z,
            load_only,
            grids,
        } => {
            let (hash, arena) = build_demo(config, cli.side)?;
            let mut source = StreamingSource::new("query", DVec3::new(x, y, z));
            if load_only {
                source = source.with_target_state(StreamingTargetState::Loaded);
            }
            if !grids.is_empty() {
                source = source.with_target_grids(grids);
            }
            let (activate, load) = hash.get_streaming_cells(&arena, &[source]);
            print_cells("activate", &hash, &arena, &activate);
            print_cells("load", &hash, &arena, &load);
        }
        Commands::Walk {
            steps,
            stride,
            load_budget,
            unload_budget,
        } => {
            let (hash, arena) = build_demo(config, cli.side)?;
            let mut policy = StreamingPolicy::new(StreamingPolicyConfig {
                load_budget,
                unload_budget,
            });
            for step in 0..steps {
                let position = DVec3::new(step as f64 * stride, 0.0, 0.0);
                let update = policy.update(&hash, &arena, &[StreamingSource::new("viewer", position)]);
                let stats = policy.stats();
                println!(
                    "step {step} x={:.0}: +{} load, +{} activate, -{} deactivate, -{} unload \
                     (loaded={}, activated={}, pending={}, {:?})",
                    position.x,
                    update.to_load.len(),
                    update.to_activate.len(),
                    update.to_deactivate.len(),
                    update.to_unload.len(),
                    stats.total_loaded_cells,
                    stats.total_activated_cells,
                    stats.pending_loads,
                    stats.update_time,
                );
            }
        }
    }

    Ok(())
}
