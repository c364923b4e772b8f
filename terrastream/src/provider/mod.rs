//! Layer data providers.
//!
//! A [`LayerFactory`] is the fetch seam of the system: given a tile key
//! it produces the elevation heightfield or one indexed color layer.
//! Factories run on task-service worker threads and may block on I/O;
//! they must poll the supplied [`ProgressMonitor`] and return promptly
//! with [`ProviderError::Cancelled`] once it signals abort.
//!
//! Two implementations are provided:
//!
//! - [`WebLayerFactory`] - fetches imagery and Terrarium-encoded
//!   elevation from URL templates over HTTP, retrying transient
//!   server failures in place
//! - [`ProceduralLayerFactory`] - deterministic synthetic data for
//!   offline runs and tests

mod http;
mod procedural;
mod web;

pub use http::{HttpClient, HttpError, ReqwestClient};
pub use procedural::ProceduralLayerFactory;
pub use web::{UrlTemplate, WebLayerFactory};

#[cfg(test)]
pub use http::tests::MockHttpClient;

use crate::coord::TileKey;
use crate::layer::{HeightFieldLayer, ImageLayer};
use crate::tile::ProgressMonitor;

/// Errors produced while fetching or decoding layer data.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The progress monitor signalled abort; the fetch stopped early.
    #[error("fetch cancelled")]
    Cancelled,

    /// HTTP transport or status failure.
    #[error("http error: {0}")]
    Http(String),

    /// Payload could not be decoded into layer data.
    #[error("decode error: {0}")]
    Decode(String),

    /// The provider has no data for this key/layer.
    #[error("no data for tile {0}")]
    NoData(TileKey),
}

/// Creates layer data for tile keys.
///
/// Implementations are shared across all tiles of a terrain and across
/// all worker threads, so they must be internally synchronized (or
/// stateless, as both built-in factories are).
pub trait LayerFactory: Send + Sync + 'static {
    /// Fetch the color layer `layer_index` for `key`.
    fn create_image_layer(
        &self,
        key: TileKey,
        layer_index: usize,
        progress: &ProgressMonitor,
    ) -> Result<ImageLayer, ProviderError>;

    /// Fetch the elevation heightfield for `key`.
    fn create_height_field_layer(
        &self,
        key: TileKey,
        progress: &ProgressMonitor,
    ) -> Result<HeightFieldLayer, ProviderError>;
}
