//! Scene-traversal visit types.
//!
//! The surrounding traversal framework announces each visit to a tile
//! via [`Tile::accept`](crate::tile::Tile::accept). Only update visits
//! drive the request lifecycle protocol; cull and event visits pass
//! through the tile untouched so draw-phase traversals never mutate
//! request state.

/// One traversal visit delivered to a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// The serialized per-frame update pass; carries the pass stamp.
    Update {
        /// Logical frame stamp for this pass.
        stamp: u64,
    },
    /// Visibility/culling traversal (render thread).
    Cull,
    /// Input/event traversal.
    Event,
}

impl Visit {
    /// Whether this visit runs the update protocol.
    pub fn is_update(&self) -> bool {
        matches!(self, Visit::Update { .. })
    }
}
