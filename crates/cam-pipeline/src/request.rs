//! Request admission and pacing.
//!
//! [`RequestTracker::submit`] validates a caller request, waits for a pacing permit and
//! splits the request into work for the two coordination tasks:
//!
//! ```text
//!                    ┌──────────────► waiting list ──► intake task (preview / vision frames)
//!   submit ─► pacing ┤                    │ source frame number (watch)
//!                    └──────────────► capture list ──► capture task (reprocessing frame)
//! ```
//!
//! The permit travels with the request's dispatcher record and is released when the
//! request retires.

use cam_core::{
    CamError, CamResult, ControlMetadata, FrameNumber, RejectReason, RequestKey, SessionConfig,
    StageId, StreamId, StreamSet,
};
use cam_pool::Buffer;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::dispatcher::ResultDispatcher;
use crate::factory::Target;
use crate::graph::StageOverrides;
use crate::selector::CaptureSelector;

//==============================================================================
// Requests
//==============================================================================

/// A caller capture request.
#[derive(Debug)]
pub struct Request {
    /// Caller-chosen key, unique among outstanding requests
    pub key: RequestKey,
    /// Controls; `None` repeats the last accepted settings
    pub settings: Option<ControlMetadata>,
    /// Output streams
    pub outputs: Vec<StreamId>,
    /// Caller-provided reprocessing input
    pub input: Option<(StreamId, Buffer)>,
    /// Per-request stage toggles
    pub overrides: StageOverrides,
}

impl Request {
    /// Request `key` without settings or outputs.
    #[must_use]
    pub fn new(key: u64) -> Self {
        Self {
            key: RequestKey(key),
            settings: None,
            outputs: Vec::new(),
            input: None,
            overrides: StageOverrides::new(),
        }
    }

    /// Sets the controls.
    #[must_use]
    pub fn with_settings(mut self, settings: ControlMetadata) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Adds an output stream.
    #[must_use]
    pub fn with_output(mut self, stream: StreamId) -> Self {
        self.outputs.push(stream);
        self
    }

    /// Attaches a reprocessing input.
    #[must_use]
    pub fn with_input(mut self, stream: StreamId, buffer: Buffer) -> Self {
        self.input = Some((stream, buffer));
        self
    }

    /// Forces a stage on or off for this request's frames.
    #[must_use]
    pub fn with_override(mut self, stage: StageId, enabled: bool) -> Self {
        self.overrides.set(stage, enabled);
        self
    }
}

/// Admitted request waiting for its streaming frames.
#[derive(Debug)]
pub struct PendingRequest {
    /// Request
    pub key: RequestKey,
    /// Resolved controls
    pub control: Arc<ControlMetadata>,
    /// Non-stalling outputs
    pub targets: Vec<Target>,
    /// Stage toggles
    pub overrides: StageOverrides,
    /// Consecutive frames to build (linked internal frames after the first)
    pub frames: u32,
    /// Keep raw output for the capture task
    pub retain_raw: bool,
    /// Publishes the first frame number to the capture task
    pub source: Option<watch::Sender<Option<FrameNumber>>>,
}

/// Admitted request waiting for its reprocessing frame.
#[derive(Debug)]
pub struct CaptureJob {
    /// Request
    pub key: RequestKey,
    /// Resolved controls
    pub control: Arc<ControlMetadata>,
    /// Stalling outputs
    pub targets: Vec<Target>,
    /// Stage toggles
    pub overrides: StageOverrides,
    /// Caller input, used instead of retained raw data
    pub input: Option<Buffer>,
    /// Raw frames to gather
    pub accumulation: u32,
    /// First streaming frame of the request, once built
    pub source: Option<watch::Receiver<Option<FrameNumber>>>,
}

impl CaptureJob {
    /// Streams this job produces.
    #[must_use]
    pub fn streams(&self) -> Vec<StreamId> {
        self.targets.iter().map(|t| t.stream).collect()
    }
}

/// Admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TrackerStats {
    /// Requests accepted
    pub accepted: u64,
    /// Requests rejected
    pub rejected: u64,
    /// Requests waiting for streaming frames
    pub waiting: usize,
    /// Requests waiting for a reprocessing frame
    pub capture: usize,
    /// Free pacing permits
    pub permits: usize,
}

#[derive(Default)]
struct Lists {
    waiting: VecDeque<PendingRequest>,
    capture: VecDeque<CaptureJob>,
    baseline: Option<ControlMetadata>,
    draining: bool,
    accepted: u64,
    rejected: u64,
}

//==============================================================================
// Tracker
//==============================================================================

/// Admission, pacing and the two request lists.
pub struct RequestTracker {
    streams: StreamSet,
    capture_path: bool,
    threshold: usize,
    submit_timeout: Duration,
    max_exposure_ns: u64,
    max_accumulation: u32,
    dispatcher: Arc<ResultDispatcher>,
    selector: Arc<CaptureSelector>,
    lists: Mutex<Lists>,
    pacing: Mutex<Arc<Semaphore>>,
    request_ready: Notify,
    capture_ready: Notify,
}

impl RequestTracker {
    /// Tracker for `streams`. `capture_path` tells whether stalling outputs go through the
    /// reprocessing graph.
    #[must_use]
    pub fn new(
        config: &SessionConfig,
        streams: StreamSet,
        capture_path: bool,
        dispatcher: Arc<ResultDispatcher>,
        selector: Arc<CaptureSelector>,
    ) -> Self {
        let threshold = config.pacing_threshold();
        Self {
            streams,
            capture_path,
            threshold,
            submit_timeout: config.submit_timeout(),
            max_exposure_ns: config.selector.max_sensor_exposure_ns,
            max_accumulation: config.selector.max_accumulation_frames,
            dispatcher,
            selector,
            lists: Mutex::new(Lists::default()),
            pacing: Mutex::new(Arc::new(Semaphore::new(threshold))),
            request_ready: Notify::new(),
            capture_ready: Notify::new(),
        }
    }

    /// Configured streams.
    #[must_use]
    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    /// Outstanding requests allowed before `submit` waits.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Validates and admits `request`.
    ///
    /// Waits at most the submit timeout for a pacing permit. Rejections leave no state
    /// behind.
    pub async fn submit(&self, request: Request) -> CamResult<RequestKey> {
        let key = request.key;
        let targets = match self.validate(&request) {
            Ok(targets) => targets,
            Err(reason) => return Err(self.reject(key, reason)),
        };

        let semaphore = Arc::clone(&*self.pacing.lock());
        let permit = match tokio::time::timeout(self.submit_timeout, semaphore.acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(self.reject(key, RejectReason::Draining)),
            Err(_elapsed) => {
                warn!(request = %key, timeout_ms = self.submit_timeout.as_millis() as u64, "Pacing permit not granted in time");
                return Err(self.reject(key, RejectReason::PacingTimeout));
            }
        };

        let Request {
            settings,
            input,
            overrides,
            ..
        } = request;
        let input = input.map(|(_, buffer)| buffer);

        let mut lists = self.lists.lock();
        if lists.draining {
            drop(lists);
            return Err(self.reject(key, RejectReason::Draining));
        }
        let control = match (settings, lists.baseline.as_ref()) {
            (Some(settings), Some(baseline)) => settings.inherit(baseline),
            (Some(settings), None) => settings,
            (None, Some(baseline)) => baseline.clone(),
            (None, None) => {
                drop(lists);
                return Err(self.reject(key, RejectReason::NoSettings));
            }
        };

        let (stall, streaming): (Vec<Target>, Vec<Target>) = if self.capture_path {
            targets.into_iter().partition(|t| t.role.is_stall())
        } else {
            (Vec::new(), targets)
        };
        let capture = !stall.is_empty();
        let from_raw = capture && input.is_none();
        let build_streaming = !streaming.is_empty() || from_raw;
        let accumulation = if from_raw {
            control.accumulation_frames(self.max_exposure_ns)
        } else {
            1
        };
        if accumulation > self.max_accumulation {
            drop(lists);
            return Err(self.reject(
                key,
                RejectReason::ExposureTooLong {
                    frames: accumulation,
                    max: self.max_accumulation,
                },
            ));
        }
        let frames_expected = (if build_streaming { accumulation } else { 0 })
            .saturating_add(u32::from(capture));

        let mut streams: Vec<StreamId> = streaming.iter().map(|t| t.stream).collect();
        streams.extend(stall.iter().map(|t| t.stream));
        if let Err(e) = self
            .dispatcher
            .register(key, &streams, frames_expected, Some(permit))
        {
            drop(lists);
            return Err(match e.reject_reason() {
                Some(reason) => self.reject(key, reason),
                None => e,
            });
        }

        lists.baseline = Some(control.clone());
        let control = Arc::new(control);
        let (source_tx, source_rx) = if from_raw {
            let (tx, rx) = watch::channel(None);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        if from_raw {
            self.selector.need_increment();
        }
        if capture {
            lists.capture.push_back(CaptureJob {
                key,
                control: Arc::clone(&control),
                targets: stall,
                overrides: overrides.clone(),
                input,
                accumulation,
                source: source_rx,
            });
        }
        if build_streaming {
            lists.waiting.push_back(PendingRequest {
                key,
                control,
                targets: streaming,
                overrides,
                frames: accumulation,
                retain_raw: from_raw,
                source: source_tx,
            });
        }
        lists.accepted += 1;
        drop(lists);

        if build_streaming {
            self.request_ready.notify_one();
        }
        if capture {
            self.capture_ready.notify_one();
        }
        debug!(request = %key, frames_expected, capture, "Request accepted");
        Ok(key)
    }

    fn validate(&self, request: &Request) -> Result<Vec<Target>, RejectReason> {
        if request.outputs.is_empty() {
            return Err(RejectReason::NoOutputTargets);
        }
        let mut seen = BTreeSet::new();
        let mut targets = Vec::with_capacity(request.outputs.len());
        for stream in &request.outputs {
            if !seen.insert(*stream) {
                return Err(RejectReason::DuplicateStream(*stream));
            }
            match self.streams.get(*stream) {
                Some(config) if !config.role.is_input() => targets.push(Target {
                    stream: *stream,
                    role: config.role,
                }),
                _ => return Err(RejectReason::UnknownStream(*stream)),
            }
        }
        if let Some((stream, _)) = &request.input {
            match self.streams.get(*stream) {
                Some(config) if config.role.is_input() => {}
                _ => return Err(RejectReason::UnknownInputStream(*stream)),
            }
        }
        let lists = self.lists.lock();
        if lists.draining {
            return Err(RejectReason::Draining);
        }
        if request.settings.is_none() && lists.baseline.is_none() {
            return Err(RejectReason::NoSettings);
        }
        Ok(targets)
    }

    fn reject(&self, key: RequestKey, reason: RejectReason) -> CamError {
        self.lists.lock().rejected += 1;
        debug!(request = %key, %reason, "Request rejected");
        CamError::rejected(key, reason)
    }

    /// Waits for the oldest request needing streaming frames.
    pub async fn next_request(&self) -> PendingRequest {
        loop {
            let notified = self.request_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(pending) = self.lists.lock().waiting.pop_front() {
                return pending;
            }
            notified.await;
        }
    }

    /// Oldest waiting request, if any.
    pub fn try_next_request(&self) -> Option<PendingRequest> {
        self.lists.lock().waiting.pop_front()
    }

    /// Waits for the oldest capture job.
    pub async fn next_capture(&self) -> CaptureJob {
        loop {
            let notified = self.capture_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.lists.lock().capture.pop_front() {
                return job;
            }
            notified.await;
        }
    }

    /// Stops admission. Waiting submitters are rejected with `Draining`; queued work is
    /// handed back so its requests can be failed.
    pub fn begin_drain(&self) -> (Vec<PendingRequest>, Vec<CaptureJob>) {
        let mut lists = self.lists.lock();
        lists.draining = true;
        self.pacing.lock().close();
        let waiting: Vec<PendingRequest> = lists.waiting.drain(..).collect();
        let capture: Vec<CaptureJob> = lists.capture.drain(..).collect();
        if !waiting.is_empty() || !capture.is_empty() {
            info!(
                waiting = waiting.len(),
                capture = capture.len(),
                "Admission drained"
            );
        }
        (waiting, capture)
    }

    /// Re-opens admission with a full set of pacing permits.
    pub fn end_drain(&self) {
        let mut lists = self.lists.lock();
        *self.pacing.lock() = Arc::new(Semaphore::new(self.threshold));
        lists.draining = false;
    }

    /// Settings of the last accepted request.
    #[must_use]
    pub fn baseline(&self) -> Option<ControlMetadata> {
        self.lists.lock().baseline.clone()
    }

    /// Whether admission is stopped.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.lists.lock().draining
    }

    /// Requests waiting for streaming frames.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lists.lock().waiting.len()
    }

    /// Requests waiting for a reprocessing frame.
    #[must_use]
    pub fn capture_len(&self) -> usize {
        self.lists.lock().capture.len()
    }

    /// Free pacing permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.pacing.lock().available_permits()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        let lists = self.lists.lock();
        TrackerStats {
            accepted: lists.accepted,
            rejected: lists.rejected,
            waiting: lists.waiting.len(),
            capture: lists.capture.len(),
            permits: self.pacing.lock().available_permits(),
        }
    }
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("threshold", &self.threshold)
            .field("capture_path", &self.capture_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ChannelSink, SessionEvent};
    use cam_core::{ReprocessingMode, StreamConfig, StreamRole};
    use cam_pool::{BufferLayout, BufferPool, PoolSpec};
    use tokio::sync::mpsc;

    struct Fixture {
        tracker: Arc<RequestTracker>,
        dispatcher: Arc<ResultDispatcher>,
        selector: Arc<CaptureSelector>,
        _rx: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn fixture(config: &SessionConfig, capture_path: bool) -> Fixture {
        let streams = StreamSet::new(vec![
            StreamConfig::new(0, StreamRole::Preview, 64, 48, 4),
            StreamConfig::new(1, StreamRole::Jpeg, 64, 48, 2),
            StreamConfig::new(2, StreamRole::ZslInput, 64, 48, 2),
        ])
        .unwrap();
        let (sink, rx) = ChannelSink::new();
        let dispatcher = Arc::new(ResultDispatcher::new(Arc::new(sink)));
        let selector = Arc::new(CaptureSelector::new(ReprocessingMode::Dynamic, 2));
        let tracker = Arc::new(RequestTracker::new(
            config,
            streams,
            capture_path,
            Arc::clone(&dispatcher),
            Arc::clone(&selector),
        ));
        Fixture {
            tracker,
            dispatcher,
            selector,
            _rx: rx,
        }
    }

    fn preview(key: u64) -> Request {
        Request::new(key)
            .with_settings(ControlMetadata::new())
            .with_output(StreamId(0))
    }

    #[tokio::test]
    async fn intake_wakes_on_submit() {
        let f = fixture(&SessionConfig::default(), true);
        let mut next = tokio_test::task::spawn(f.tracker.next_request());
        tokio_test::assert_pending!(next.poll());

        f.tracker.submit(preview(1)).await.unwrap();
        assert!(next.is_woken());
        let pending = tokio_test::assert_ready!(next.poll());
        assert_eq!(pending.key, RequestKey(1));
        assert_eq!(f.tracker.waiting_len(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_requests_without_side_effects() {
        let f = fixture(&SessionConfig::default(), true);
        let cases = [
            (Request::new(1).with_settings(ControlMetadata::new()), RejectReason::NoOutputTargets),
            (Request::new(2).with_output(StreamId(0)), RejectReason::NoSettings),
            (preview(3).with_output(StreamId(0)), RejectReason::DuplicateStream(StreamId(0))),
            (preview(4).with_output(StreamId(7)), RejectReason::UnknownStream(StreamId(7))),
            (
                Request::new(5)
                    .with_settings(ControlMetadata::new())
                    .with_output(StreamId(2)),
                RejectReason::UnknownStream(StreamId(2)),
            ),
        ];
        for (request, reason) in cases {
            let err = f.tracker.submit(request).await.unwrap_err();
            assert_eq!(err.reject_reason(), Some(reason));
        }
        let pool = BufferPool::with_heap(PoolSpec::fixed("in", 1, BufferLayout::single_plane(8)))
            .unwrap();
        let bad_input = preview(6).with_input(StreamId(0), pool.try_acquire().unwrap());
        let err = f.tracker.submit(bad_input).await.unwrap_err();
        assert_eq!(
            err.reject_reason(),
            Some(RejectReason::UnknownInputStream(StreamId(0)))
        );
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(f.dispatcher.outstanding(), 0);
        assert_eq!(f.tracker.stats().rejected, 6);
        assert_eq!(f.tracker.available_permits(), f.tracker.threshold());
    }

    #[tokio::test]
    async fn preview_request_goes_to_waiting_list_only() {
        let f = fixture(&SessionConfig::default(), true);
        f.tracker.submit(preview(1)).await.unwrap();
        assert_eq!(f.tracker.waiting_len(), 1);
        assert_eq!(f.tracker.capture_len(), 0);
        assert_eq!(f.selector.need(), 0);

        let pending = f.tracker.next_request().await;
        assert_eq!(pending.key, RequestKey(1));
        assert!(!pending.retain_raw);
        assert!(pending.source.is_none());
    }

    #[tokio::test]
    async fn stall_request_splits_and_raises_need() {
        let f = fixture(&SessionConfig::default(), true);
        let request = preview(1).with_output(StreamId(1));
        f.tracker.submit(request).await.unwrap();
        assert_eq!(f.selector.need(), 1);

        let pending = f.tracker.next_request().await;
        let job = f.tracker.next_capture().await;
        assert!(pending.retain_raw);
        assert_eq!(pending.targets.len(), 1);
        assert_eq!(job.streams(), vec![StreamId(1)]);

        let mut source = job.source.unwrap();
        let publish = pending.source.unwrap();
        publish.send(Some(FrameNumber(4))).unwrap();
        source.changed().await.unwrap();
        assert_eq!(*source.borrow(), Some(FrameNumber(4)));
    }

    #[tokio::test]
    async fn stall_target_streams_inline_without_capture_path() {
        let f = fixture(&SessionConfig::default(), false);
        f.tracker.submit(preview(1).with_output(StreamId(1))).await.unwrap();
        assert_eq!(f.tracker.capture_len(), 0);
        assert_eq!(f.tracker.next_request().await.targets.len(), 2);
        assert_eq!(f.selector.need(), 0);
    }

    #[tokio::test]
    async fn input_request_skips_raw_retention() {
        let f = fixture(&SessionConfig::default(), true);
        let pool = BufferPool::with_heap(PoolSpec::fixed("in", 1, BufferLayout::single_plane(8)))
            .unwrap();
        let request = Request::new(1)
            .with_settings(ControlMetadata::new())
            .with_output(StreamId(1))
            .with_input(StreamId(2), pool.try_acquire().unwrap());
        f.tracker.submit(request).await.unwrap();
        assert_eq!(f.tracker.waiting_len(), 0);
        assert_eq!(f.selector.need(), 0);
        let job = f.tracker.next_capture().await;
        assert!(job.input.is_some());
        assert!(job.source.is_none());
    }

    #[tokio::test]
    async fn long_exposure_builds_linked_frames() {
        let mut config = SessionConfig::default();
        config.selector.max_sensor_exposure_ns = 100;
        let f = fixture(&config, true);
        let request = Request::new(1)
            .with_settings(ControlMetadata::new().with_exposure_ns(250))
            .with_output(StreamId(1));
        f.tracker.submit(request).await.unwrap();
        let pending = f.tracker.next_request().await;
        assert_eq!(pending.frames, 3);
        assert!(pending.targets.is_empty());
        assert_eq!(f.tracker.next_capture().await.accumulation, 3);
    }

    #[tokio::test]
    async fn exposure_beyond_accumulation_limit_is_rejected() {
        let mut config = SessionConfig::default();
        config.selector.max_sensor_exposure_ns = 100;
        config.selector.max_accumulation_frames = 4;
        let f = fixture(&config, true);
        let jpeg = |key: u64, exposure_ns: u64| {
            Request::new(key)
                .with_settings(ControlMetadata::new().with_exposure_ns(exposure_ns))
                .with_output(StreamId(1))
        };

        let err = f.tracker.submit(jpeg(1, u64::MAX)).await.unwrap_err();
        assert_eq!(
            err.reject_reason(),
            Some(RejectReason::ExposureTooLong {
                frames: u32::MAX,
                max: 4
            })
        );
        let err = f.tracker.submit(jpeg(2, 401)).await.unwrap_err();
        assert_eq!(
            err.reject_reason(),
            Some(RejectReason::ExposureTooLong { frames: 5, max: 4 })
        );
        assert_eq!(f.selector.need(), 0);
        assert_eq!(f.dispatcher.outstanding(), 0);
        assert_eq!(f.tracker.available_permits(), f.tracker.threshold());
        assert_eq!(f.tracker.stats().rejected, 2);
        assert!(f.tracker.baseline().is_none());

        f.tracker.submit(jpeg(3, 400)).await.unwrap();
        assert_eq!(f.tracker.next_capture().await.accumulation, 4);
    }

    #[tokio::test]
    async fn duplicate_key_counts_as_rejection() {
        let f = fixture(&SessionConfig::default(), true);
        f.tracker.submit(preview(1)).await.unwrap();
        let err = f.tracker.submit(preview(1)).await.unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::DuplicateKey));
        let stats = f.tracker.stats();
        assert_eq!((stats.accepted, stats.rejected), (1, 1));
        assert_eq!(f.tracker.waiting_len(), 1);
        assert_eq!(f.tracker.available_permits(), f.tracker.threshold() - 1);
    }

    #[tokio::test]
    async fn settings_repeat_from_baseline() {
        let f = fixture(&SessionConfig::default(), true);
        let first = Request::new(1)
            .with_settings(ControlMetadata::new().with_exposure_ns(42))
            .with_output(StreamId(0));
        f.tracker.submit(first).await.unwrap();
        f.tracker
            .submit(Request::new(2).with_output(StreamId(0)))
            .await
            .unwrap();
        let _ = f.tracker.next_request().await;
        let second = f.tracker.next_request().await;
        assert_eq!(second.control.exposure_time_ns, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_blocks_then_times_out() {
        let mut config = SessionConfig::default();
        config.pipeline_depth = 1;
        config.timeouts.submit_ms = 100;
        let f = fixture(&config, true);
        assert_eq!(f.tracker.threshold(), 1);
        f.tracker.submit(preview(1)).await.unwrap();

        let err = f.tracker.submit(preview(2)).await.unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::PacingTimeout));

        let tracker = Arc::clone(&f.tracker);
        let blocked = tokio::spawn(async move { tracker.submit(preview(3)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());
        f.dispatcher.fail_request(RequestKey(1));
        assert_eq!(blocked.await.unwrap().unwrap(), RequestKey(3));
    }

    #[tokio::test]
    async fn drain_rejects_and_hands_back_work() {
        let f = fixture(&SessionConfig::default(), true);
        f.tracker
            .submit(preview(1).with_output(StreamId(1)))
            .await
            .unwrap();
        let (waiting, capture) = f.tracker.begin_drain();
        assert_eq!((waiting.len(), capture.len()), (1, 1));
        let err = f.tracker.submit(preview(2)).await.unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::Draining));

        f.dispatcher.fail_all();
        f.tracker.end_drain();
        assert_eq!(f.tracker.available_permits(), f.tracker.threshold());
        f.tracker.submit(preview(3)).await.unwrap();
    }
}
