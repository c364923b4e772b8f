//! Quadtree tile addressing.
//!
//! Provides the `TileKey` type that identifies a single quadtree node:
//! a level of detail plus an (x, y) position within that level's grid.
//! The level of detail doubles as the scheduling priority metric for
//! layer fetches (coarser tiles are serviced first).

use std::fmt;

/// Address of one quadtree node in the terrain tile grid.
///
/// At level of detail `lod` the grid is `2^lod` tiles on each side.
/// `x` increases eastward and `y` increases southward, matching the
/// usual slippy-map convention.
///
/// # Example
///
/// ```
/// use terrastream::coord::TileKey;
///
/// let key = TileKey::new(12, 2048, 1361);
/// assert_eq!(key.level_of_detail(), 12);
/// assert_eq!(key.x(), 2048);
/// assert_eq!(key.y(), 1361);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    lod: u8,
    x: u32,
    y: u32,
}

/// Quadrant of a parent tile, used when subdividing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    NorthWest,
    NorthEast,
    SouthWest,
    SouthEast,
}

impl TileKey {
    /// Create a new tile key.
    ///
    /// # Arguments
    ///
    /// * `lod` - Level of detail (0 = whole-world tile)
    /// * `x` - Column within the level's grid
    /// * `y` - Row within the level's grid
    pub fn new(lod: u8, x: u32, y: u32) -> Self {
        Self { lod, x, y }
    }

    /// The root key covering the entire extent.
    pub fn root() -> Self {
        Self::new(0, 0, 0)
    }

    /// Level of detail of this key.
    ///
    /// This is the ordering metric used as the base scheduling priority:
    /// lower values are serviced before higher ones.
    pub fn level_of_detail(&self) -> u8 {
        self.lod
    }

    /// Column within the level's grid.
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Row within the level's grid.
    pub fn y(&self) -> u32 {
        self.y
    }

    /// Key of the child tile in the given quadrant, one level deeper.
    ///
    /// Returns `None` if this key is already at the maximum level or
    /// the child coordinate does not fit in `u32`.
    pub fn child(&self, quadrant: Quadrant) -> Option<TileKey> {
        if self.lod == u8::MAX {
            return None;
        }
        let (dx, dy) = match quadrant {
            Quadrant::NorthWest => (0, 0),
            Quadrant::NorthEast => (1, 0),
            Quadrant::SouthWest => (0, 1),
            Quadrant::SouthEast => (1, 1),
        };
        let x = self.x.checked_mul(2)?.checked_add(dx)?;
        let y = self.y.checked_mul(2)?.checked_add(dy)?;
        Some(TileKey::new(self.lod + 1, x, y))
    }

    /// Key of the parent tile, one level coarser.
    ///
    /// Returns `None` for the root key.
    pub fn parent(&self) -> Option<TileKey> {
        if self.lod == 0 {
            return None;
        }
        Some(TileKey::new(self.lod - 1, self.x / 2, self.y / 2))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}/{}/{}", self.lod, self.x, self.y)
    }
}
