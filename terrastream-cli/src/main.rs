//! Terrastream CLI - demo driver for the terrain streaming core.
//!
//! Registers a grid of tiles against a procedurally generated layer
//! source and drives repeated update passes, logging how layer data
//! streams in. Serves as both a smoke test and a reference for wiring
//! the library into a real traversal loop.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use terrastream::coord::TileKey;
use terrastream::provider::ProceduralLayerFactory;
use terrastream::tile::{Tile, TileUpdater};
use terrastream::{Terrain, TerrainConfig, Visit};

/// Environment variable overriding the worker thread count.
///
/// The core never reads the environment; that lookup belongs here in
/// the bootstrap layer.
const TASK_THREADS_ENV: &str = "TERRASTREAM_TASK_THREADS";

#[derive(Parser, Debug)]
#[command(name = "terrastream", about = "Streaming terrain tile loader demo")]
struct Args {
    /// Worker threads for the task service (default: TERRASTREAM_TASK_THREADS or 8)
    #[arg(long)]
    threads: Option<usize>,

    /// Number of color/imagery layers per tile
    #[arg(long, default_value_t = 2)]
    color_layers: usize,

    /// Level of detail of the demo tile grid
    #[arg(long, default_value_t = 10)]
    lod: u8,

    /// Tiles per side of the demo grid
    #[arg(long, default_value_t = 4)]
    grid: u32,

    /// Number of update passes to run
    #[arg(long, default_value_t = 30)]
    passes: u64,

    /// Delay between passes in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
}

/// Updater that logs regeneration activity per tile.
struct LoggingUpdater {
    key: TileKey,
}

impl TileUpdater for LoggingUpdater {
    fn rebuild_all(&mut self) {
        debug!(key = %self.key, "rebuilding tile");
    }

    fn update_incremental(&mut self, elevation_changed: bool, color_changed: bool) {
        debug!(key = %self.key, elevation_changed, color_changed, "incremental update");
    }
}

fn task_threads(args: &Args) -> usize {
    if let Some(threads) = args.threads {
        return threads;
    }
    match std::env::var(TASK_THREADS_ENV) {
        Ok(value) => match value.parse() {
            Ok(threads) => {
                info!(threads, "task threads from {}", TASK_THREADS_ENV);
                threads
            }
            Err(_) => {
                info!(%value, "ignoring unparsable {}", TASK_THREADS_ENV);
                TerrainConfig::default().task_threads
            }
        },
        Err(_) => TerrainConfig::default().task_threads,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = TerrainConfig::default().with_task_threads(task_threads(&args));
    info!(?config, "starting terrastream demo");

    let terrain = Terrain::new(Arc::new(ProceduralLayerFactory::new()), config);

    for y in 0..args.grid {
        for x in 0..args.grid {
            let key = TileKey::new(args.lod, x, y);
            let mut tile = Tile::new(key, args.color_layers, terrain.revision());
            tile.set_updater(Box::new(LoggingUpdater { key }));
            terrain.register_tile(tile);
        }
    }
    info!(tiles = terrain.tile_count(), "registered demo tile grid");

    for stamp in 1..=args.passes {
        for tile in terrain.begin_update_pass(stamp) {
            tile.lock().accept(&terrain, &Visit::Update { stamp });
        }

        let (complete, pending): (usize, usize) = terrain.list_tiles().iter().fold(
            (0, 0),
            |(complete, pending), tile| {
                let tile = tile.lock();
                if tile.pending_requests().is_empty() {
                    (complete + 1, pending)
                } else {
                    (complete, pending + tile.pending_requests().len())
                }
            },
        );
        info!(
            stamp,
            complete,
            pending,
            queued = terrain.get_or_create_task_service().queue_len(),
            "update pass"
        );

        if complete == terrain.tile_count() {
            info!(stamp, "all tiles fully streamed");
            break;
        }
        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }

    let streamed = terrain
        .list_tiles()
        .iter()
        .filter(|tile| tile.lock().elevation().is_some())
        .count();
    info!(
        streamed,
        total = terrain.tile_count(),
        "demo finished"
    );
}
