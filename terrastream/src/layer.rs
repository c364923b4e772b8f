//! Layer payload types produced by fetches and merged into tiles.
//!
//! A tile carries one elevation heightfield plus an ordered list of
//! color/imagery layers. These types are plain data: the fetch side
//! builds them, the update pass moves them into the tile's slots.

use image::RgbaImage;

/// Regular grid of elevation samples in meters.
///
/// Samples are stored row-major, row 0 first. `sample` is bounds
/// checked so merge code can probe without panicking.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightFieldLayer {
    width: u32,
    height: u32,
    heights: Vec<f32>,
}

impl HeightFieldLayer {
    /// Build a heightfield from row-major samples.
    ///
    /// # Panics
    ///
    /// Panics if `heights.len() != width * height`.
    pub fn new(width: u32, height: u32, heights: Vec<f32>) -> Self {
        assert_eq!(
            heights.len(),
            (width as usize) * (height as usize),
            "heightfield sample count must match dimensions"
        );
        Self {
            width,
            height,
            heights,
        }
    }

    /// Samples per row.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of rows.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Elevation in meters at the given column and row, or `None` if
    /// out of bounds.
    pub fn sample(&self, col: u32, row: u32) -> Option<f32> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.heights
            .get(row as usize * self.width as usize + col as usize)
            .copied()
    }

    /// All samples in row-major order.
    pub fn samples(&self) -> &[f32] {
        &self.heights
    }
}

/// A single color/imagery layer: a decoded RGBA raster.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLayer {
    image: RgbaImage,
}

impl ImageLayer {
    /// Wrap a decoded RGBA image.
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The underlying raster.
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Consume the layer, yielding the raster.
    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// Result payload of a completed layer fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerData {
    /// Elevation grid for the tile.
    HeightField(HeightFieldLayer),
    /// One imagery layer for the tile.
    Image(ImageLayer),
}

impl LayerData {
    /// Extract the heightfield, or `None` if this is imagery.
    pub fn into_height_field(self) -> Option<HeightFieldLayer> {
        match self {
            LayerData::HeightField(layer) => Some(layer),
            LayerData::Image(_) => None,
        }
    }

    /// Extract the image layer, or `None` if this is elevation.
    pub fn into_image(self) -> Option<ImageLayer> {
        match self {
            LayerData::Image(layer) => Some(layer),
            LayerData::HeightField(_) => None,
        }
    }
}
