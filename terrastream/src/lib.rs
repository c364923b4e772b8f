//! Terrastream - versioned, asynchronous terrain tile streaming.
//!
//! This library manages the background loading of terrain tile data
//! (elevation and imagery layers) for a streaming 3D terrain renderer.
//! Tiles stay on screen while their layers are fetched and re-fetched
//! at varying levels of detail; all reconciliation happens on a single
//! serialized update pass so the renderer never observes a torn tile.
//!
//! # Architecture
//!
//! ```text
//! update thread                      worker pool (TaskService)
//! ─────────────                      ─────────────────────────
//! Terrain::begin_update_pass(stamp)
//!   └─ per tile: Tile::accept ──► install / restamp / enqueue ──► queue
//!                               ◄─ harvest completed results ◄── LayerRequest::run
//!                                  merge into layer slots          (LayerFactory fetch,
//!                                  rebuild / incremental update     ProgressMonitor polls)
//! ```
//!
//! A [`Terrain`](terrain::Terrain) carries a global revision counter
//! bumped on every map configuration change; each [`Tile`](tile::Tile)
//! snapshots the revision it was built against and reports whether it
//! is still in sync. Stale in-flight work is reclaimed by the stamp
//! mechanism: requests not restamped for more than
//! [`STALE_STAMP_DELTA`](tile::STALE_STAMP_DELTA) scheduling passes
//! cancel themselves cooperatively and are retried on a later pass.

pub mod coord;
pub mod layer;
pub mod provider;
pub mod service;
pub mod terrain;
pub mod tile;
pub mod visit;

pub use coord::TileKey;
pub use layer::{HeightFieldLayer, ImageLayer, LayerData};
pub use provider::{LayerFactory, ProviderError};
pub use service::TaskService;
pub use terrain::{Terrain, TerrainConfig};
pub use tile::{LayerKind, LayerRequest, ProgressMonitor, RequestState, Tile, TileUpdater};
pub use visit::Visit;
