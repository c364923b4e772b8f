//! Priority queue for layer request scheduling.
//!
//! Requests are ordered by ascending priority value (lower is serviced
//! first), then by enqueue order (FIFO within the same priority). With
//! the priority formula `lod + 0.1 * color_index` this means:
//!
//! 1. Coarser tiles are serviced before finer ones
//! 2. Within one tile, elevation precedes color layers
//! 3. Lower color indices precede higher ones
//!
//! The queue tolerates duplicate entries for the same request (a tile
//! resubmits idle requests every pass): whichever entry is popped first
//! claims the request, and later entries are skipped by the worker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::tile::LayerRequest;

/// Global sequence counter for FIFO ordering within priority levels.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a unique sequence number for queue ordering.
fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A request waiting to be serviced, with scheduling metadata.
struct QueuedRequest {
    request: Arc<LayerRequest>,
    priority: f32,
    sequence: u64,
}

impl QueuedRequest {
    fn new(request: Arc<LayerRequest>) -> Self {
        let priority = request.priority();
        Self {
            request,
            priority,
            sequence: next_sequence(),
        }
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so both comparisons are reversed:
        // lower priority value first, then lower sequence (older) first.
        match other.priority.total_cmp(&self.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Priority queue of pending layer requests.
///
/// Not thread-safe; the task service wraps it in a mutex.
pub(crate) struct RequestQueue {
    heap: BinaryHeap<QueuedRequest>,
}

impl RequestQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Adds a request to the queue.
    pub fn push(&mut self, request: Arc<LayerRequest>) {
        self.heap.push(QueuedRequest::new(request));
    }

    /// Removes and returns the most urgent request.
    pub fn pop(&mut self) -> Option<Arc<LayerRequest>> {
        self.heap.pop().map(|q| q.request)
    }

    /// Number of queued entries (duplicates included).
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes all queued entries.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::TileKey;
    use crate::layer::{HeightFieldLayer, ImageLayer};
    use crate::provider::{LayerFactory, ProviderError};
    use crate::service::SchedulerStamp;
    use crate::tile::ProgressMonitor;

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

    fn elevation(lod: u8) -> Arc<LayerRequest> {
        LayerRequest::elevation(
            TileKey::new(lod, 0, 0),
            Arc::new(NullFactory),
            Arc::new(SchedulerStamp::new()),
            1,
        )
    }

    fn color(lod: u8, index: usize) -> Arc<LayerRequest> {
        LayerRequest::color(
            TileKey::new(lod, 0, 0),
            index,
            Arc::new(NullFactory),
            Arc::new(SchedulerStamp::new()),
            1,
        )
    }

    #[test]
    fn test_lower_priority_value_pops_first() {
        let mut queue = RequestQueue::new();
        queue.push(elevation(9));
        queue.push(elevation(3));
        queue.push(elevation(6));

        assert_eq!(queue.pop().unwrap().key().level_of_detail(), 3);
        assert_eq!(queue.pop().unwrap().key().level_of_detail(), 6);
        assert_eq!(queue.pop().unwrap().key().level_of_detail(), 9);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_elevation_precedes_color_for_same_key() {
        let mut queue = RequestQueue::new();
        queue.push(color(5, 1));
        queue.push(color(5, 0));
        queue.push(elevation(5));

        assert_eq!(queue.pop().unwrap().kind(), crate::tile::LayerKind::Elevation);
        assert_eq!(
            queue.pop().unwrap().kind(),
            crate::tile::LayerKind::Color { index: 0 }
        );
        assert_eq!(
            queue.pop().unwrap().kind(),
            crate::tile::LayerKind::Color { index: 1 }
        );
    }

    #[test]
    fn test_fifo_within_equal_priority() {
        let mut queue = RequestQueue::new();
        let first = elevation(7);
        let second = elevation(7);
        let third = elevation(7);
        queue.push(Arc::clone(&first));
        queue.push(Arc::clone(&second));
        queue.push(Arc::clone(&third));

        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &first));
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &second));
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &third));
    }

    #[test]
    fn test_coarser_tile_color_precedes_finer_elevation() {
        // lod 4 color 2 -> 4.2, lod 5 elevation -> 5.0
        let mut queue = RequestQueue::new();
        queue.push(elevation(5));
        queue.push(color(4, 2));

        assert_eq!(queue.pop().unwrap().key().level_of_detail(), 4);
        assert_eq!(queue.pop().unwrap().key().level_of_detail(), 5);
    }

    #[test]
    fn test_len_and_clear() {
        let mut queue = RequestQueue::new();
        assert!(queue.is_empty());

        queue.push(elevation(1));
        queue.push(elevation(2));
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_entries_allowed() {
        let mut queue = RequestQueue::new();
        let request = elevation(3);
        queue.push(Arc::clone(&request));
        queue.push(Arc::clone(&request));

        assert_eq!(queue.len(), 2);
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &request));
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &request));
    }
}
