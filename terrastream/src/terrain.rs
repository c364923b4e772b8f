//! Process-wide terrain state: tile registry, revision counter, and the
//! shared task service.
//!
//! One [`Terrain`] exists per active map view and outlives all of its
//! tiles. It holds the global revision counter that is bumped whenever
//! the map's configuration changes (a layer added or removed); each
//! tile snapshots the revision it was built against and can be asked
//! whether it is still in sync.
//!
//! The registry is guarded by a single coarse lock - registration and
//! lookup are infrequent relative to per-frame traversal, so contention
//! is acceptable. The revision counter is a relaxed atomic: a missed
//! read is corrected on the next read, and the only cost of staleness
//! is a delayed resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::coord::TileKey;
use crate::provider::LayerFactory;
use crate::service::{TaskService, DEFAULT_TASK_THREADS};
use crate::tile::Tile;

/// Terrain construction parameters.
///
/// Environment lookups (e.g. `TERRASTREAM_TASK_THREADS`) belong to the
/// bootstrap layer; the core only consumes an explicit config.
#[derive(Debug, Clone)]
pub struct TerrainConfig {
    /// Worker threads for the shared task service.
    pub task_threads: usize,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            task_threads: DEFAULT_TASK_THREADS,
        }
    }
}

impl TerrainConfig {
    /// Override the worker thread count.
    pub fn with_task_threads(mut self, task_threads: usize) -> Self {
        self.task_threads = task_threads;
        self
    }
}

/// Registry of all live tiles plus the shared scheduling service.
pub struct Terrain {
    factory: Arc<dyn LayerFactory>,
    config: TerrainConfig,
    revision: AtomicU64,
    tiles: Mutex<HashMap<TileKey, Arc<Mutex<Tile>>>>,
    task_service: OnceLock<Arc<TaskService>>,
}

impl Terrain {
    /// Create a terrain with the given layer factory and config.
    ///
    /// The task service is constructed lazily on first use, not here.
    pub fn new(factory: Arc<dyn LayerFactory>, config: TerrainConfig) -> Self {
        Self {
            factory,
            config,
            revision: AtomicU64::new(0),
            tiles: Mutex::new(HashMap::new()),
            task_service: OnceLock::new(),
        }
    }

    /// Current global map revision.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    /// Bump the global revision after a map configuration change.
    ///
    /// Returns the new revision.
    pub fn bump_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The shared layer factory handed to new requests.
    pub fn layer_factory(&self) -> Arc<dyn LayerFactory> {
        Arc::clone(&self.factory)
    }

    /// The shared task service, constructed exactly once on first use
    /// with the configured thread count.
    pub fn get_or_create_task_service(&self) -> Arc<TaskService> {
        Arc::clone(self.task_service.get_or_init(|| {
            info!(
                task_threads = self.config.task_threads,
                "creating shared task service"
            );
            Arc::new(TaskService::new(self.config.task_threads))
        }))
    }

    /// Register a tile, returning its shared handle.
    ///
    /// A tile already registered under the same key is replaced (and its
    /// pending requests canceled).
    pub fn register_tile(&self, tile: Tile) -> Arc<Mutex<Tile>> {
        let key = tile.key();
        let handle = Arc::new(Mutex::new(tile));
        let previous = self.tiles.lock().insert(key, Arc::clone(&handle));
        if let Some(previous) = previous {
            debug!(%key, "replacing registered tile");
            previous.lock().cancel_pending();
        }
        handle
    }

    /// Look up a live tile by key.
    pub fn tile(&self, key: TileKey) -> Option<Arc<Mutex<Tile>>> {
        self.tiles.lock().get(&key).cloned()
    }

    /// Snapshot of all live tiles, ordered by key.
    ///
    /// The registry lock is released before the caller iterates.
    pub fn list_tiles(&self) -> Vec<Arc<Mutex<Tile>>> {
        let tiles = self.tiles.lock();
        let mut entries: Vec<_> = tiles.iter().map(|(k, v)| (*k, Arc::clone(v))).collect();
        drop(tiles);
        entries.sort_by_key(|(key, _)| *key);
        entries.into_iter().map(|(_, tile)| tile).collect()
    }

    /// Number of live tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles.lock().len()
    }

    /// Deregister a pruned tile, canceling its outstanding requests.
    ///
    /// Returns true if the key was registered.
    pub fn remove_tile(&self, key: TileKey) -> bool {
        let removed = self.tiles.lock().remove(&key);
        match removed {
            Some(tile) => {
                tile.lock().cancel_pending();
                debug!(%key, "tile deregistered");
                true
            }
            None => false,
        }
    }

    /// Start an update pass: advance the scheduling stamp and return the
    /// tile snapshot to traverse.
    ///
    /// The caller must drive all update passes from a single designated
    /// thread; the per-tile protocol relies on that serialization.
    pub fn begin_update_pass(&self, stamp: u64) -> Vec<Arc<Mutex<Tile>>> {
        self.get_or_create_task_service().set_stamp(stamp);
        self.list_tiles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{HeightFieldLayer, ImageLayer};
    use crate::provider::ProviderError;
    use crate::tile::ProgressMonitor;
    use proptest::prelude::*;

    struct NullFactory;

    impl LayerFactory for NullFactory {
        fn create_image_layer(
            &self,
            key: TileKey,
            _layer_index: usize,
            _progress: &ProgressMonitor,
        ) -> Result<ImageLayer, ProviderError> {
            Err(ProviderError::NoData(key))
        }

        fn create_height_field_layer(
            &self,
            key: TileKey,
            _progress: &ProgressMonitor,
        ) -> Result<HeightFieldLayer, ProviderError> {
            Err(ProviderError::NoData(key))
        }
    }

    fn terrain() -> Terrain {
        Terrain::new(
            Arc::new(NullFactory),
            TerrainConfig::default().with_task_threads(1),
        )
    }

    #[test]
    fn test_config_default_thread_count() {
        assert_eq!(TerrainConfig::default().task_threads, 8);
    }

    #[test]
    fn test_revision_starts_at_zero_and_counts_bumps() {
        let terrain = terrain();
        assert_eq!(terrain.revision(), 0);
        for expected in 1..=5 {
            assert_eq!(terrain.bump_revision(), expected);
            assert_eq!(terrain.revision(), expected);
        }
    }

    #[test]
    fn test_tile_sync_follows_revision() {
        let terrain = terrain();
        let tile = Tile::new(TileKey::new(2, 1, 1), 0, terrain.revision());
        assert!(tile.is_in_sync(&terrain));

        terrain.bump_revision();
        assert!(!tile.is_in_sync(&terrain));
    }

    #[test]
    fn test_register_lookup_remove() {
        let terrain = terrain();
        let key = TileKey::new(3, 4, 5);
        assert!(terrain.tile(key).is_none());

        let handle = terrain.register_tile(Tile::new(key, 1, 0));
        assert_eq!(terrain.tile_count(), 1);

        let found = terrain.tile(key).expect("registered tile");
        assert!(Arc::ptr_eq(&handle, &found));

        assert!(terrain.remove_tile(key));
        assert!(terrain.tile(key).is_none());
        assert!(!terrain.remove_tile(key));
    }

    #[test]
    fn test_list_tiles_ordered_by_key() {
        let terrain = terrain();
        for key in [
            TileKey::new(5, 9, 9),
            TileKey::new(2, 0, 0),
            TileKey::new(5, 1, 0),
        ] {
            terrain.register_tile(Tile::new(key, 0, 0));
        }

        let keys: Vec<_> = terrain
            .list_tiles()
            .iter()
            .map(|tile| tile.lock().key())
            .collect();
        assert_eq!(
            keys,
            vec![
                TileKey::new(2, 0, 0),
                TileKey::new(5, 1, 0),
                TileKey::new(5, 9, 9),
            ]
        );
    }

    #[test]
    fn test_task_service_created_once_under_race() {
        let terrain = Arc::new(terrain());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let terrain = Arc::clone(&terrain);
                std::thread::spawn(move || terrain.get_or_create_task_service())
            })
            .collect();

        let services: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for service in &services[1..] {
            assert!(Arc::ptr_eq(&services[0], service));
        }
    }

    #[test]
    fn test_begin_update_pass_sets_stamp() {
        let terrain = terrain();
        terrain.register_tile(Tile::new(TileKey::new(1, 0, 0), 0, 0));

        let tiles = terrain.begin_update_pass(17);
        assert_eq!(tiles.len(), 1);
        assert_eq!(terrain.get_or_create_task_service().stamp(), 17);
    }

    proptest! {
        #[test]
        fn prop_revision_equals_bump_count(bumps in 0usize..200) {
            let terrain = terrain();
            let mut last = terrain.revision();
            for _ in 0..bumps {
                let next = terrain.bump_revision();
                prop_assert!(next > last);
                last = next;
            }
            prop_assert_eq!(terrain.revision(), bumps as u64);
        }
    }
}
