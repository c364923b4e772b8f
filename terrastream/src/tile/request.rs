//! Layer fetch requests and staleness-driven cancellation.
//!
//! A [`LayerRequest`] is one unit of asynchronous work: fetch the
//! elevation layer or one indexed color layer for a single tile key.
//! The owning tile keeps the request in its pending set; a clone of the
//! `Arc` is handed to the task service, whose worker drives the fetch.
//!
//! Results never touch the tile from the worker thread. The worker
//! writes into the request's one-shot result slot and publishes the
//! state change; the tile consumes the slot on a later update pass.
//!
//! # Cancellation
//!
//! Cancellation is cooperative and poll-based. Each in-flight request
//! carries a [`ProgressMonitor`] which compares the scheduler's global
//! stamp against the stamp last set on the request. If the request has
//! not been restamped for more than [`STALE_STAMP_DELTA`] scheduling
//! passes, the owning tile has stopped servicing it (pruned or out of
//! view) and the monitor tells the fetch to abort. A monitor that has
//! reported abort once keeps reporting it forever.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::coord::TileKey;
use crate::layer::LayerData;
use crate::provider::{LayerFactory, ProviderError};
use crate::service::SchedulerStamp;

/// How many scheduling passes a request's stamp may lag behind the
/// scheduler stamp before the monitor declares it stale.
pub const STALE_STAMP_DELTA: u64 = 2;

/// Priority offset applied per color layer index, so that elevation
/// (no offset) is serviced first and lower color indices precede
/// higher ones. Lower priority values are serviced earlier.
pub const COLOR_PRIORITY_STEP: f32 = 0.1;

/// Which layer a request fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// The tile's elevation heightfield.
    Elevation,
    /// One indexed color (imagery) layer.
    Color {
        /// Index into the tile's color layer slots.
        index: usize,
    },
}

/// Lifecycle state of a layer request.
///
/// `Idle -> InProgress -> Completed | Canceled`; a canceled request is
/// reset to `Idle` by the owning tile and requeued. `Completed` is
/// terminal and its result is consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Waiting to be (re)submitted or sitting in the service queue.
    Idle = 0,
    /// A worker thread is running the fetch.
    InProgress = 1,
    /// Fetch finished; the result slot may hold data to merge.
    Completed = 2,
    /// Fetch aborted due to staleness or explicit cancellation.
    Canceled = 3,
}

impl RequestState {
    fn from_u8(raw: u8) -> RequestState {
        match raw {
            0 => RequestState::Idle,
            1 => RequestState::InProgress,
            2 => RequestState::Completed,
            _ => RequestState::Canceled,
        }
    }
}

/// Cancellation-polling callback attached to an in-flight request.
///
/// Sticky: the first `true` returned by [`should_abort`] is cached and
/// returned for every subsequent call, regardless of later conditions.
/// A request that gets requeued receives a fresh monitor.
///
/// [`should_abort`]: ProgressMonitor::should_abort
pub struct ProgressMonitor {
    canceled: AtomicBool,
    request_stamp: Arc<AtomicU64>,
    scheduler: Arc<SchedulerStamp>,
}

impl ProgressMonitor {
    fn new(request_stamp: Arc<AtomicU64>, scheduler: Arc<SchedulerStamp>) -> Self {
        Self {
            canceled: AtomicBool::new(false),
            request_stamp,
            scheduler,
        }
    }

    /// A monitor driven only by explicit [`cancel`](Self::cancel).
    ///
    /// Use this when invoking a [`LayerFactory`] outside the request
    /// pipeline; it never trips the staleness check.
    pub fn standalone() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)), Arc::new(SchedulerStamp::new()))
    }

    /// Whether the fetch should abort.
    ///
    /// Declares cancellation once the scheduler stamp has advanced more
    /// than [`STALE_STAMP_DELTA`] ticks past the request stamp.
    pub fn should_abort(&self) -> bool {
        if self.canceled.load(Ordering::Acquire) {
            return true;
        }
        let lag = self
            .scheduler
            .current()
            .saturating_sub(self.request_stamp.load(Ordering::Relaxed));
        let canceled = lag > STALE_STAMP_DELTA;
        if canceled {
            self.canceled.store(true, Ordering::Release);
        }
        canceled
    }

    /// Explicitly mark the monitor canceled (tile destruction path).
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Whether cancellation has already been signalled.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// One asynchronous layer fetch for one tile key.
///
/// Owned by the tile's pending set; shared with the task service queue
/// and the worker executing it. All cross-thread communication goes
/// through the atomic state/stamp fields and the one-shot result slot.
pub struct LayerRequest {
    key: TileKey,
    kind: LayerKind,
    priority: f32,
    factory: Arc<dyn LayerFactory>,
    scheduler: Arc<SchedulerStamp>,
    state: AtomicU8,
    stamp: Arc<AtomicU64>,
    result: Mutex<Option<LayerData>>,
    monitor: Mutex<Arc<ProgressMonitor>>,
}

impl LayerRequest {
    /// Create an elevation request with `priority = level_of_detail`.
    pub fn elevation(
        key: TileKey,
        factory: Arc<dyn LayerFactory>,
        scheduler: Arc<SchedulerStamp>,
        stamp: u64,
    ) -> Arc<Self> {
        let priority = key.level_of_detail() as f32;
        Self::new(key, LayerKind::Elevation, priority, factory, scheduler, stamp)
    }

    /// Create a color request with
    /// `priority = level_of_detail + 0.1 * index`.
    pub fn color(
        key: TileKey,
        index: usize,
        factory: Arc<dyn LayerFactory>,
        scheduler: Arc<SchedulerStamp>,
        stamp: u64,
    ) -> Arc<Self> {
        let priority = key.level_of_detail() as f32 + COLOR_PRIORITY_STEP * index as f32;
        Self::new(
            key,
            LayerKind::Color { index },
            priority,
            factory,
            scheduler,
            stamp,
        )
    }

    fn new(
        key: TileKey,
        kind: LayerKind,
        priority: f32,
        factory: Arc<dyn LayerFactory>,
        scheduler: Arc<SchedulerStamp>,
        stamp: u64,
    ) -> Arc<Self> {
        let request_stamp = Arc::new(AtomicU64::new(stamp));
        let monitor = Arc::new(ProgressMonitor::new(
            Arc::clone(&request_stamp),
            Arc::clone(&scheduler),
        ));
        Arc::new(Self {
            key,
            kind,
            priority,
            factory,
            scheduler,
            state: AtomicU8::new(RequestState::Idle as u8),
            stamp: request_stamp,
            result: Mutex::new(None),
            monitor: Mutex::new(monitor),
        })
    }

    /// The tile key this request fetches data for.
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Which layer this request fetches.
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Scheduling priority; lower values are serviced first.
    pub fn priority(&self) -> f32 {
        self.priority
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the request is waiting to be serviced.
    pub fn is_idle(&self) -> bool {
        self.state() == RequestState::Idle
    }

    /// Whether the fetch has finished.
    pub fn is_completed(&self) -> bool {
        self.state() == RequestState::Completed
    }

    /// Whether the fetch was aborted.
    pub fn is_canceled(&self) -> bool {
        self.state() == RequestState::Canceled
    }

    /// Freshness stamp last set by the owning tile.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Relaxed)
    }

    /// Refresh the freshness stamp (resets the cancellation clock).
    pub fn set_stamp(&self, stamp: u64) {
        self.stamp.store(stamp, Ordering::Relaxed);
    }

    /// The currently attached progress monitor.
    pub fn monitor(&self) -> Arc<ProgressMonitor> {
        Arc::clone(&self.monitor.lock())
    }

    /// Reset a canceled request to `Idle` and attach a fresh monitor so
    /// it can be requeued on the next pass.
    ///
    /// No-op unless the request is currently `Canceled`.
    pub fn reset_to_idle(&self) {
        if self
            .state
            .compare_exchange(
                RequestState::Canceled as u8,
                RequestState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            *self.monitor.lock() = Arc::new(ProgressMonitor::new(
                Arc::clone(&self.stamp),
                Arc::clone(&self.scheduler),
            ));
        }
    }

    /// Cancel the request (tile destruction path).
    ///
    /// Sets the sticky abort flag on the attached monitor so a worker
    /// already running the fetch stops at its next poll, and moves an
    /// idle or in-progress request to `Canceled`. A completed request
    /// stays completed.
    pub fn cancel(&self) {
        self.monitor.lock().cancel();
        let _ = self.state.compare_exchange(
            RequestState::Idle as u8,
            RequestState::Canceled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            RequestState::InProgress as u8,
            RequestState::Canceled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Consume the fetched layer data. One-shot: returns `None` on any
    /// call after the first, and on requests that completed empty.
    pub fn take_result(&self) -> Option<LayerData> {
        self.result.lock().take()
    }

    /// Execute the fetch on a worker thread.
    ///
    /// Claims the request (`Idle -> InProgress`); a request canceled
    /// while still queued, or already claimed via a duplicate queue
    /// entry, is skipped. On normal completion the result slot is
    /// populated and the state becomes `Completed`; a fetch failure
    /// also completes, just with nothing to merge (no implicit retry).
    pub(crate) fn run(&self) {
        if self
            .state
            .compare_exchange(
                RequestState::Idle as u8,
                RequestState::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let monitor = self.monitor();
        if monitor.should_abort() {
            self.state
                .store(RequestState::Canceled as u8, Ordering::Release);
            return;
        }

        let outcome = match self.kind {
            LayerKind::Elevation => self
                .factory
                .create_height_field_layer(self.key, &monitor)
                .map(LayerData::HeightField),
            LayerKind::Color { index } => self
                .factory
                .create_image_layer(self.key, index, &monitor)
                .map(LayerData::Image),
        };

        match outcome {
            Ok(data) => {
                *self.result.lock() = Some(data);
                // An explicit cancel that raced the fetch wins; drop the
                // result rather than resurrect a canceled request.
                if self
                    .state
                    .compare_exchange(
                        RequestState::InProgress as u8,
                        RequestState::Completed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    *self.result.lock() = None;
                }
            }
            Err(ProviderError::Cancelled) => {
                self.state
                    .store(RequestState::Canceled as u8, Ordering::Release);
            }
            Err(err) => {
                warn!(key = %self.key, kind = ?self.kind, error = %err, "layer fetch failed");
                let _ = self.state.compare_exchange(
                    RequestState::InProgress as u8,
                    RequestState::Completed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }
}

impl std::fmt::Debug for LayerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRequest")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("stamp", &self.stamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{HeightFieldLayer, ImageLayer};
    use image::RgbaImage;

    /// Factory returning fixed data, an error, or `Cancelled`.
    struct FixedFactory {
        fail: Option<ProviderError>,
    }

    impl FixedFactory {
        fn ok() -> Arc<Self> {
            Arc::new(Self { fail: None })
        }

        fn failing(err: ProviderError) -> Arc<Self> {
            Arc::new(Self { fail: Some(err) })
        }
    }

    impl LayerFactory for FixedFactory {
        fn create_image_layer(
            &self,
            _key: TileKey,
            _layer_index: usize,
            _progress: &ProgressMonitor,
        ) -> Result<ImageLayer, ProviderError> {
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(ImageLayer::new(RgbaImage::new(2, 2))),
            }
        }

        fn create_height_field_layer(
            &self,
            _key: TileKey,
            _progress: &ProgressMonitor,
        ) -> Result<HeightFieldLayer, ProviderError> {
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(HeightFieldLayer::new(2, 2, vec![1.0; 4])),
            }
        }
    }

    fn scheduler() -> Arc<SchedulerStamp> {
        Arc::new(SchedulerStamp::new())
    }

    #[test]
    fn test_priority_formula() {
        let key = TileKey::new(10, 0, 0);
        let sched = scheduler();
        let factory: Arc<dyn LayerFactory> = FixedFactory::ok();

        let elev = LayerRequest::elevation(key, Arc::clone(&factory), Arc::clone(&sched), 1);
        assert_eq!(elev.priority(), 10.0);

        for index in 0..3 {
            let color =
                LayerRequest::color(key, index, Arc::clone(&factory), Arc::clone(&sched), 1);
            let expected = 10.0 + 0.1 * index as f32;
            assert!((color.priority() - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_starts_idle_with_stamp() {
        let request =
            LayerRequest::elevation(TileKey::new(4, 1, 1), FixedFactory::ok(), scheduler(), 7);
        assert!(request.is_idle());
        assert_eq!(request.stamp(), 7);
        assert!(request.take_result().is_none());
    }

    #[test]
    fn test_run_completes_with_result() {
        let request =
            LayerRequest::elevation(TileKey::new(4, 1, 1), FixedFactory::ok(), scheduler(), 1);
        request.run();
        assert!(request.is_completed());

        let data = request.take_result().expect("result populated");
        assert!(matches!(data, LayerData::HeightField(_)));
        // One-shot slot.
        assert!(request.take_result().is_none());
    }

    #[test]
    fn test_run_fetch_failure_completes_empty() {
        let request = LayerRequest::color(
            TileKey::new(4, 1, 1),
            0,
            FixedFactory::failing(ProviderError::Http("boom".into())),
            scheduler(),
            1,
        );
        request.run();
        assert!(request.is_completed());
        assert!(request.take_result().is_none());
    }

    #[test]
    fn test_run_cancelled_fetch_is_canceled() {
        let request = LayerRequest::color(
            TileKey::new(4, 1, 1),
            0,
            FixedFactory::failing(ProviderError::Cancelled),
            scheduler(),
            1,
        );
        request.run();
        assert!(request.is_canceled());
        assert!(request.take_result().is_none());
    }

    #[test]
    fn test_canceled_while_queued_never_invokes_factory() {
        let request =
            LayerRequest::elevation(TileKey::new(4, 1, 1), FixedFactory::ok(), scheduler(), 1);
        request.cancel();
        assert!(request.is_canceled());

        request.run();
        assert!(request.is_canceled());
        assert!(request.take_result().is_none());
    }

    #[test]
    fn test_monitor_staleness_threshold() {
        let sched = scheduler();
        let request = LayerRequest::elevation(
            TileKey::new(4, 1, 1),
            FixedFactory::ok(),
            Arc::clone(&sched),
            1,
        );
        let monitor = request.monitor();

        // Lag of exactly STALE_STAMP_DELTA is still fresh.
        sched.set(1 + STALE_STAMP_DELTA);
        assert!(!monitor.should_abort());

        // One more tick and the request has expired.
        sched.set(2 + STALE_STAMP_DELTA);
        assert!(monitor.should_abort());
    }

    #[test]
    fn test_monitor_is_sticky() {
        let sched = scheduler();
        let request = LayerRequest::elevation(
            TileKey::new(4, 1, 1),
            FixedFactory::ok(),
            Arc::clone(&sched),
            1,
        );
        let monitor = request.monitor();

        sched.set(10);
        assert!(monitor.should_abort());

        // Restamping the request does not un-cancel the monitor.
        request.set_stamp(10);
        assert!(monitor.should_abort());
    }

    #[test]
    fn test_restamp_keeps_monitor_fresh() {
        let sched = scheduler();
        let request = LayerRequest::elevation(
            TileKey::new(4, 1, 1),
            FixedFactory::ok(),
            Arc::clone(&sched),
            1,
        );
        let monitor = request.monitor();

        for stamp in 2..20 {
            sched.set(stamp);
            request.set_stamp(stamp);
            assert!(!monitor.should_abort());
        }
    }

    #[test]
    fn test_reset_to_idle_attaches_fresh_monitor() {
        let request =
            LayerRequest::elevation(TileKey::new(4, 1, 1), FixedFactory::ok(), scheduler(), 1);
        let stale_monitor = request.monitor();
        request.cancel();
        assert!(stale_monitor.is_canceled());

        request.reset_to_idle();
        assert!(request.is_idle());

        let fresh_monitor = request.monitor();
        assert!(!Arc::ptr_eq(&stale_monitor, &fresh_monitor));
        assert!(!fresh_monitor.is_canceled());
    }

    #[test]
    fn test_reset_to_idle_ignores_non_canceled() {
        let request =
            LayerRequest::elevation(TileKey::new(4, 1, 1), FixedFactory::ok(), scheduler(), 1);
        request.run();
        assert!(request.is_completed());

        request.reset_to_idle();
        assert!(request.is_completed());
    }

    #[test]
    fn test_cancel_does_not_disturb_completed() {
        let request =
            LayerRequest::elevation(TileKey::new(4, 1, 1), FixedFactory::ok(), scheduler(), 1);
        request.run();
        request.cancel();
        assert!(request.is_completed());
        assert!(request.take_result().is_some());
    }

    #[test]
    fn test_standalone_monitor() {
        let monitor = ProgressMonitor::standalone();
        assert!(!monitor.should_abort());
        monitor.cancel();
        assert!(monitor.should_abort());
    }
}
