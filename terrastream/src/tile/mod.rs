//! Live terrain tiles and the per-pass request lifecycle protocol.
//!
//! A [`Tile`] is the versioned representation of one quadtree node. It
//! owns its elevation/color layer slots and the set of pending layer
//! requests, and it reconciles completed fetches back into the slots
//! during the serialized update pass:
//!
//! 1. **Install** - on the first pass, create one request per wanted
//!    layer (elevation first, then color layers by index)
//! 2. **Restamp/enqueue** - refresh stamps on live requests; submit or
//!    resubmit idle ones to the shared task service
//! 3. **Harvest** - merge completed results into the layer slots and
//!    drop them from the pending set; reset canceled requests to idle
//!    with a fresh monitor so they retry on the next pass
//! 4. **Apply** - hand changed content to the mesh-regeneration path,
//!    whole-tile or per-layer depending on the configured mode
//! 5. **Bump** - advance the geometry revision if elevation changed
//!
//! The protocol runs only on the designated update thread; worker
//! threads never touch the tile, only the request objects it shares
//! with them. The render pass reads layer slots that harvest has
//! already fully written, so no per-tile lock is needed between the
//! two phases.

mod request;

pub use request::{
    LayerKind, LayerRequest, ProgressMonitor, RequestState, COLOR_PRIORITY_STEP,
    STALE_STAMP_DELTA,
};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::coord::TileKey;
use crate::layer::{HeightFieldLayer, ImageLayer, LayerData};
use crate::terrain::Terrain;
use crate::visit::Visit;

/// Mesh-regeneration seam consumed by the tile.
///
/// Implemented by the surrounding terrain technique; the tile calls it
/// from the update pass after merging new layer data.
pub trait TileUpdater: Send {
    /// Rebuild the tile's geometry and textures from scratch.
    fn rebuild_all(&mut self);

    /// Update only the layer classes that changed this pass.
    fn update_incremental(&mut self, elevation_changed: bool, color_changed: bool);
}

/// Updater that does nothing; the default until a technique is attached.
pub struct NoopUpdater;

impl TileUpdater for NoopUpdater {
    fn rebuild_all(&mut self) {}

    fn update_incremental(&mut self, _elevation_changed: bool, _color_changed: bool) {}
}

/// One quadtree node's live, versioned terrain state.
pub struct Tile {
    key: TileKey,
    terrain_revision: u64,
    tile_revision: u64,
    geometry_revision: u64,
    request_elevation: bool,
    requests_installed: bool,
    use_layer_requests: bool,
    per_layer_updates: bool,
    dirty: bool,
    elevation_dirty: bool,
    color_dirty: bool,
    requests: Vec<Arc<LayerRequest>>,
    elevation: Option<HeightFieldLayer>,
    colors: Vec<Option<ImageLayer>>,
    updater: Box<dyn TileUpdater>,
}

impl Tile {
    /// Create a tile for `key` with `num_color_layers` empty color
    /// slots, snapshotting the terrain revision it was built against.
    pub fn new(key: TileKey, num_color_layers: usize, terrain_revision: u64) -> Self {
        Self {
            key,
            terrain_revision,
            tile_revision: 0,
            geometry_revision: 0,
            request_elevation: true,
            requests_installed: false,
            use_layer_requests: true,
            per_layer_updates: false,
            dirty: false,
            elevation_dirty: false,
            color_dirty: false,
            requests: Vec::new(),
            elevation: None,
            colors: vec![None; num_color_layers],
            updater: Box::new(NoopUpdater),
        }
    }

    /// This tile's quadtree key.
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Terrain revision this tile was last synchronized against.
    pub fn terrain_revision(&self) -> u64 {
        self.terrain_revision
    }

    /// Record that the tile has been synchronized against `revision`.
    pub fn set_terrain_revision(&mut self, revision: u64) {
        self.terrain_revision = revision;
    }

    /// Whether the tile's snapshot matches the terrain's current
    /// revision. Out-of-sync content is potentially outdated pending
    /// resync; the resync policy itself is the caller's concern.
    pub fn is_in_sync(&self, terrain: &Terrain) -> bool {
        self.terrain_revision == terrain.revision()
    }

    /// Local content revision; increases whenever layer data merges.
    pub fn tile_revision(&self) -> u64 {
        self.tile_revision
    }

    /// Geometry revision; increases whenever elevation-driven geometry
    /// is rebuilt (signals LOD morphing and other shape consumers).
    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }

    /// Whether the tile wants elevation data at all.
    pub fn set_elevation_hint(&mut self, wanted: bool) {
        self.request_elevation = wanted;
    }

    /// Enable or disable background layer requests for this tile.
    pub fn set_use_layer_requests(&mut self, enabled: bool) {
        self.use_layer_requests = enabled;
    }

    /// Switch between whole-tile rebuilds (false, the default) and
    /// per-layer incremental updates (true).
    pub fn set_per_layer_updates(&mut self, enabled: bool) {
        self.per_layer_updates = enabled;
    }

    /// Attach the mesh-regeneration path.
    pub fn set_updater(&mut self, updater: Box<dyn TileUpdater>) {
        self.updater = updater;
    }

    /// The merged elevation layer, if any has arrived.
    pub fn elevation(&self) -> Option<&HeightFieldLayer> {
        self.elevation.as_ref()
    }

    /// The merged color layer at `index`, if any has arrived.
    pub fn color_layer(&self, index: usize) -> Option<&ImageLayer> {
        self.colors.get(index).and_then(|slot| slot.as_ref())
    }

    /// Number of configured color layer slots.
    pub fn num_color_layers(&self) -> usize {
        self.colors.len()
    }

    /// The in-flight/pending request set.
    pub fn pending_requests(&self) -> &[Arc<LayerRequest>] {
        &self.requests
    }

    /// Scene-visitor dispatch: update visits run the request protocol
    /// (when layer requests are enabled); every other visit kind passes
    /// through untouched.
    pub fn accept(&mut self, terrain: &Terrain, visit: &Visit) {
        match visit {
            Visit::Update { stamp } if self.use_layer_requests => {
                self.on_update_pass(terrain, *stamp);
            }
            _ => {}
        }
    }

    /// Run one update pass for this tile.
    ///
    /// Must be invoked once per logical frame from the single designated
    /// update thread.
    pub fn on_update_pass(&mut self, terrain: &Terrain, stamp: u64) {
        self.install_requests(terrain, stamp);
        self.stamp_and_enqueue(terrain, stamp);
        self.harvest_completed();
        self.apply_content();

        if self.elevation_dirty {
            self.geometry_revision += 1;
        }
        self.elevation_dirty = false;
        self.color_dirty = false;
    }

    /// Cancel all outstanding requests (tile pruned or replaced).
    ///
    /// Sets the sticky abort flag so workers already running a fetch
    /// stop at their next poll; results that arrive anyway are dropped
    /// unobserved.
    pub fn cancel_pending(&mut self) {
        for request in &self.requests {
            if request.state() == RequestState::InProgress {
                debug!(key = %self.key, kind = ?request.kind(), "cancelling in-flight request");
            }
            request.cancel();
        }
    }

    /// Install one request per wanted layer. Runs at most once per tile
    /// lifetime; a flag guards re-entry.
    fn install_requests(&mut self, terrain: &Terrain, stamp: u64) {
        if self.requests_installed {
            return;
        }

        let factory = terrain.layer_factory();
        let scheduler = terrain.get_or_create_task_service().scheduler_stamp();

        if self.request_elevation && self.elevation.is_none() {
            self.requests.push(LayerRequest::elevation(
                self.key,
                Arc::clone(&factory),
                Arc::clone(&scheduler),
                stamp,
            ));
        }
        for index in 0..self.colors.len() {
            self.requests.push(LayerRequest::color(
                self.key,
                index,
                Arc::clone(&factory),
                Arc::clone(&scheduler),
                stamp,
            ));
        }

        debug!(key = %self.key, count = self.requests.len(), "installed layer requests");
        self.requests_installed = true;
    }

    /// Refresh stamps and (re)submit idle requests to the service.
    ///
    /// An idle request is one the service has either never run or has
    /// abandoned as stale, so it goes back on the queue. An in-progress
    /// request just gets its cancellation clock reset. Completed and
    /// canceled requests are left for harvest.
    fn stamp_and_enqueue(&mut self, terrain: &Terrain, stamp: u64) {
        if self.requests.is_empty() {
            return;
        }
        let service = terrain.get_or_create_task_service();
        for request in &self.requests {
            match request.state() {
                RequestState::Idle => {
                    request.set_stamp(stamp);
                    service.add(Arc::clone(request));
                }
                RequestState::InProgress => request.set_stamp(stamp),
                RequestState::Completed | RequestState::Canceled => {}
            }
        }
    }

    /// Merge completed results and recycle canceled requests.
    fn harvest_completed(&mut self) {
        let mut i = 0;
        while i < self.requests.len() {
            match self.requests[i].state() {
                RequestState::Completed => {
                    let request = self.requests.remove(i);
                    // An empty slot means the fetch genuinely failed;
                    // nothing to merge this pass, and no retry.
                    if let Some(data) = request.take_result() {
                        self.merge(request.kind(), data);
                    }
                }
                RequestState::Canceled => {
                    // Retry on the next pass with a fresh monitor.
                    self.requests[i].reset_to_idle();
                    i += 1;
                }
                RequestState::Idle | RequestState::InProgress => i += 1,
            }
        }
    }

    fn merge(&mut self, kind: LayerKind, data: LayerData) {
        match (kind, data) {
            (LayerKind::Elevation, LayerData::HeightField(height_field)) => {
                debug!(key = %self.key, "merging elevation layer");
                self.elevation = Some(height_field);
                if self.per_layer_updates {
                    self.elevation_dirty = true;
                } else {
                    self.dirty = true;
                    self.elevation_dirty = true;
                }
                self.tile_revision += 1;
            }
            (LayerKind::Color { index }, LayerData::Image(image)) => {
                let Some(slot) = self.colors.get_mut(index) else {
                    warn!(key = %self.key, index, "color result for unconfigured slot");
                    return;
                };
                debug!(key = %self.key, index, "merging color layer");
                *slot = Some(image);
                if self.per_layer_updates {
                    self.color_dirty = true;
                } else {
                    self.dirty = true;
                    self.color_dirty = true;
                }
                self.tile_revision += 1;
            }
            (kind, _) => {
                warn!(key = %self.key, ?kind, "mismatched layer payload dropped");
            }
        }
    }

    /// Hand changed content to the regeneration path.
    fn apply_content(&mut self) {
        if self.dirty {
            // Whole tile dirty: rebuild everything via the normal path.
            self.updater.rebuild_all();
            self.dirty = false;
        } else if self.elevation_dirty || self.color_dirty {
            // Only parts changed: update piecemeal.
            self.updater
                .update_incremental(self.elevation_dirty, self.color_dirty);
        }
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        if self.requests_installed {
            self.cancel_pending();
        }
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("key", &self.key)
            .field("terrain_revision", &self.terrain_revision)
            .field("tile_revision", &self.tile_revision)
            .field("geometry_revision", &self.geometry_revision)
            .field("pending", &self.requests.len())
            .finish()
    }
}
