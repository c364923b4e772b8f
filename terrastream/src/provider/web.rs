//! Web tile source: fetches layer data from URL-template tile servers.
//!
//! Imagery layers are any raster format the `image` crate can sniff
//! (PNG/JPEG in practice). Elevation uses the Terrarium RGB encoding:
//! `height = r * 256 + g + b / 256 - 32768` meters per pixel.

use bytes::Bytes;
use tracing::debug;

use super::{HttpClient, LayerFactory, ProviderError};
use crate::coord::TileKey;
use crate::layer::{HeightFieldLayer, ImageLayer};
use crate::tile::ProgressMonitor;

/// Terrarium elevation offset (sea level sits at r=128, g=0, b=0).
const TERRARIUM_OFFSET: f32 = 32768.0;

/// Default number of extra attempts after a transient fetch failure.
const DEFAULT_FETCH_RETRIES: usize = 2;

/// A tile URL pattern with `{lod}`, `{x}` and `{y}` placeholders.
///
/// # Example
///
/// ```
/// use terrastream::coord::TileKey;
/// use terrastream::provider::UrlTemplate;
///
/// let template = UrlTemplate::new("https://tiles.example.com/{lod}/{x}/{y}.png");
/// let url = template.resolve(TileKey::new(3, 5, 2));
/// assert_eq!(url, "https://tiles.example.com/3/5/2.png");
/// ```
#[derive(Debug, Clone)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    /// Wrap a template string.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Substitute the key's coordinates into the template.
    pub fn resolve(&self, key: TileKey) -> String {
        self.0
            .replace("{lod}", &key.level_of_detail().to_string())
            .replace("{x}", &key.x().to_string())
            .replace("{y}", &key.y().to_string())
    }
}

/// Layer factory backed by HTTP tile servers.
///
/// One URL template per color layer index, plus an optional elevation
/// template. The HTTP client is injected so tests run against a mock.
/// Transient server failures (5xx, throttling, dropped connections) are
/// retried in place a bounded number of times; definitive statuses are
/// not.
pub struct WebLayerFactory<C: HttpClient> {
    client: C,
    imagery: Vec<UrlTemplate>,
    elevation: Option<UrlTemplate>,
    retries: usize,
}

impl<C: HttpClient> WebLayerFactory<C> {
    /// Create a factory with no layers configured.
    pub fn new(client: C) -> Self {
        Self {
            client,
            imagery: Vec::new(),
            elevation: None,
            retries: DEFAULT_FETCH_RETRIES,
        }
    }

    /// Append an imagery layer source (its index is the current count).
    pub fn with_imagery_layer(mut self, template: UrlTemplate) -> Self {
        self.imagery.push(template);
        self
    }

    /// Set the Terrarium elevation source.
    pub fn with_elevation(mut self, template: UrlTemplate) -> Self {
        self.elevation = Some(template);
        self
    }

    /// Override how many extra attempts a transient failure gets.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Number of configured imagery layers.
    pub fn num_imagery_layers(&self) -> usize {
        self.imagery.len()
    }

    /// Fetch one tile, retrying transient failures up to the configured
    /// bound. The monitor is polled between attempts so a stale request
    /// never burns its remaining retries.
    fn fetch(
        &self,
        template: &UrlTemplate,
        key: TileKey,
        progress: &ProgressMonitor,
    ) -> Result<Bytes, ProviderError> {
        let url = template.resolve(key);
        let mut attempt = 0;
        loop {
            if progress.should_abort() {
                return Err(ProviderError::Cancelled);
            }
            match self.client.fetch(&url) {
                Ok(bytes) => {
                    debug!(%key, %url, bytes = bytes.len(), "fetched tile");
                    return Ok(bytes);
                }
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    debug!(%key, %url, attempt, error = %err, "retrying tile fetch");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl<C: HttpClient + Send + Sync + 'static> LayerFactory for WebLayerFactory<C> {
    fn create_image_layer(
        &self,
        key: TileKey,
        layer_index: usize,
        progress: &ProgressMonitor,
    ) -> Result<ImageLayer, ProviderError> {
        let template = self
            .imagery
            .get(layer_index)
            .ok_or(ProviderError::NoData(key))?;

        let bytes = self.fetch(template, key, progress)?;
        if progress.should_abort() {
            return Err(ProviderError::Cancelled);
        }

        let image = image::load_from_memory(&bytes)
            .map_err(|e| ProviderError::Decode(format!("imagery for {}: {}", key, e)))?;
        Ok(ImageLayer::new(image.to_rgba8()))
    }

    fn create_height_field_layer(
        &self,
        key: TileKey,
        progress: &ProgressMonitor,
    ) -> Result<HeightFieldLayer, ProviderError> {
        let template = self.elevation.as_ref().ok_or(ProviderError::NoData(key))?;

        let bytes = self.fetch(template, key, progress)?;
        if progress.should_abort() {
            return Err(ProviderError::Cancelled);
        }

        decode_terrarium(key, &bytes)
    }
}

/// Decode a Terrarium-encoded elevation raster into a heightfield.
fn decode_terrarium(key: TileKey, bytes: &[u8]) -> Result<HeightFieldLayer, ProviderError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| ProviderError::Decode(format!("elevation for {}: {}", key, e)))?
        .to_rgba8();

    let heights = image
        .pixels()
        .map(|p| {
            let [r, g, b, _] = p.0;
            r as f32 * 256.0 + g as f32 + b as f32 / 256.0 - TERRARIUM_OFFSET
        })
        .collect();

    Ok(HeightFieldLayer::new(image.width(), image.height(), heights))
}
