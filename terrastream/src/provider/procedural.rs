//! Procedural layer source for offline runs and demos.
//!
//! Generates deterministic synthetic terrain: a smooth sinusoidal
//! heightfield and flat-shaded imagery whose color is derived from the
//! tile key and layer index. Useful wherever real tile servers are
//! unavailable - the CLI demo and the integration tests both use it.

use super::{LayerFactory, ProviderError};
use crate::coord::TileKey;
use crate::layer::{HeightFieldLayer, ImageLayer};
use crate::tile::ProgressMonitor;

/// Default heightfield grid size in samples per side.
const DEFAULT_GRID_SIZE: u32 = 33;

/// Default imagery size in pixels per side.
const DEFAULT_IMAGE_SIZE: u32 = 256;

/// Deterministic synthetic layer factory.
#[derive(Debug, Clone)]
pub struct ProceduralLayerFactory {
    grid_size: u32,
    image_size: u32,
}

impl ProceduralLayerFactory {
    /// Factory with default grid and image sizes.
    pub fn new() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }

    /// Override the heightfield grid size (samples per side).
    pub fn with_grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = grid_size.max(2);
        self
    }

    /// Override the imagery size (pixels per side).
    pub fn with_image_size(mut self, image_size: u32) -> Self {
        self.image_size = image_size.max(1);
        self
    }
}

impl Default for ProceduralLayerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerFactory for ProceduralLayerFactory {
    fn create_image_layer(
        &self,
        key: TileKey,
        layer_index: usize,
        progress: &ProgressMonitor,
    ) -> Result<ImageLayer, ProviderError> {
        if progress.should_abort() {
            return Err(ProviderError::Cancelled);
        }

        // Flat shade keyed to the tile address so neighbors differ.
        let r = (key.x().wrapping_mul(37) % 200) as u8 + 30;
        let g = (key.y().wrapping_mul(57) % 200) as u8 + 30;
        let b = ((key.level_of_detail() as u32 + layer_index as u32 * 40) % 200) as u8 + 30;

        let mut image = image::RgbaImage::new(self.image_size, self.image_size);
        for (row, pixel_row) in image.enumerate_rows_mut() {
            if row % 64 == 0 && progress.should_abort() {
                return Err(ProviderError::Cancelled);
            }
            for (_, _, pixel) in pixel_row {
                *pixel = image::Rgba([r, g, b, 255]);
            }
        }
        Ok(ImageLayer::new(image))
    }

    fn create_height_field_layer(
        &self,
        key: TileKey,
        progress: &ProgressMonitor,
    ) -> Result<HeightFieldLayer, ProviderError> {
        if progress.should_abort() {
            return Err(ProviderError::Cancelled);
        }

        let size = self.grid_size;
        let span = 1.0 / (1u64 << key.level_of_detail().min(62)) as f64;
        let origin_x = key.x() as f64 * span;
        let origin_y = key.y() as f64 * span;

        let mut heights = Vec::with_capacity((size * size) as usize);
        for row in 0..size {
            if progress.should_abort() {
                return Err(ProviderError::Cancelled);
            }
            let v = origin_y + span * row as f64 / (size - 1) as f64;
            for col in 0..size {
                let u = origin_x + span * col as f64 / (size - 1) as f64;
                let height = 500.0
                    * ((u * 12.0 * std::f64::consts::PI).sin()
                        * (v * 12.0 * std::f64::consts::PI).cos());
                heights.push(height as f32);
            }
        }
        Ok(HeightFieldLayer::new(size, size, heights))
    }
}
