//! Pipeline stage workers.
//!
//! Every [`Stage`] owns one tokio task fed by a bounded queue. The worker moves the frame's
//! entity through its state machine, runs the device transform, forwards the frame to the
//! successors that became ready and reports a [`StageEvent`] to the result worker.
//!
//! # Worker loop
//!
//! ```text
//! queue ──▶ begin ──▶ [flushing?] ──yes──▶ Cancelled ─┐
//!                         │ no                       │
//!                         ▼                          ▼
//!               fences ──▶ transform ──────────▶ finish ──▶ successors
//!                                                    └──▶ StageEvent (result worker)
//! ```

use cam_core::{
    CamError, CamResult, StageError, StageErrorKind, StageId, StageIo, StageTransform,
};
use cam_pool::Fence;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::frame::Frame;
use crate::monitor::{ErrorSeverity, FatalLatch, StageMonitor};

//==============================================================================
// Messages
//==============================================================================

pub(crate) enum StageMessage {
    Process(Arc<Frame>),
    Stop,
}

/// A stage finished its entity of `frame`.
#[derive(Debug)]
pub struct StageEvent {
    /// Frame that advanced
    pub frame: Arc<Frame>,
    /// Stage that finished
    pub stage: StageId,
}

/// Messages consumed by the result worker.
#[derive(Debug)]
pub enum ResultMessage {
    /// Stage completion
    Stage(StageEvent),
    /// Acknowledged once every earlier message was handled
    Barrier(oneshot::Sender<()>),
}

//==============================================================================
// Router
//==============================================================================

/// Hands frames to stage queues and completion events to the result worker.
///
/// One router per graph; it also carries the graph's flushing flag.
pub struct StageRouter {
    senders: RwLock<HashMap<StageId, mpsc::Sender<StageMessage>>>,
    events: mpsc::Sender<ResultMessage>,
    flushing: AtomicBool,
    monitor: StageMonitor,
    fatal: Arc<FatalLatch>,
}

impl StageRouter {
    /// Creates a router emitting events on `events`.
    #[must_use]
    pub fn new(
        events: mpsc::Sender<ResultMessage>,
        monitor: StageMonitor,
        fatal: Arc<FatalLatch>,
    ) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            events,
            flushing: AtomicBool::new(false),
            monitor,
            fatal,
        }
    }

    fn register(&self, stage: StageId, tx: mpsc::Sender<StageMessage>) {
        self.senders.write().insert(stage, tx);
    }

    fn unregister(&self, stage: StageId) {
        self.senders.write().remove(&stage);
    }

    /// While set, queued frames are cancelled instead of processed.
    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::SeqCst);
    }

    /// Whether the graph is flushing.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Queues `frame` on every stage in `ready`.
    ///
    /// A stage that is not running gets its entity failed here, which may in turn make
    /// further successors ready.
    pub async fn dispatch(&self, frame: &Arc<Frame>, ready: Vec<StageId>) {
        let mut queue: VecDeque<StageId> = ready.into();
        while let Some(stage) = queue.pop_front() {
            let sender = self.senders.read().get(&stage).cloned();
            if let Some(tx) = sender {
                if tx
                    .send(StageMessage::Process(Arc::clone(frame)))
                    .await
                    .is_ok()
                {
                    continue;
                }
            }

            warn!(%stage, frame = %frame.number(), "Stage not running, failing its entity");
            let err = StageError::new(stage, StageErrorKind::NotRunning, "stage is not running");
            match frame.abort(stage, err) {
                Ok(completion) => {
                    queue.extend(completion.ready);
                    self.emit(frame, stage).await;
                }
                Err(e) => self.fatal.raise(&e),
            }
        }
    }

    /// Reports a finished entity to the result worker.
    pub async fn emit(&self, frame: &Arc<Frame>, stage: StageId) {
        let event = StageEvent {
            frame: Arc::clone(frame),
            stage,
        };
        if self.events.send(ResultMessage::Stage(event)).await.is_err() {
            debug!(%stage, frame = %frame.number(), "Result worker gone, dropping event");
        }
    }
}

impl std::fmt::Debug for StageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRouter")
            .field("stages", &self.senders.read().len())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

//==============================================================================
// Stage
//==============================================================================

/// Counters of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Stage
    pub stage: StageId,
    /// Worker running
    pub running: bool,
    /// Entities finished (any outcome)
    pub processed: u64,
    /// Entities that ended in Error, cancellations excluded
    pub failed: u64,
    /// Entities cancelled by a flush
    pub cancelled: u64,
}

struct StageWorker {
    tx: mpsc::Sender<StageMessage>,
    handle: JoinHandle<()>,
}

/// One hardware processing unit and its worker.
pub struct Stage {
    id: StageId,
    transform: Arc<dyn StageTransform>,
    queue_depth: usize,
    fence_timeout: Duration,
    worker: tokio::sync::Mutex<Option<StageWorker>>,
    processed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Stage {
    /// Creates a stopped stage.
    #[must_use]
    pub fn new(
        id: StageId,
        transform: Arc<dyn StageTransform>,
        queue_depth: usize,
        fence_timeout: Duration,
    ) -> Self {
        Self {
            id,
            transform,
            queue_depth: queue_depth.max(1),
            fence_timeout,
            worker: tokio::sync::Mutex::new(None),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Stage id.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Starts the device and the worker. No-op when already running.
    pub async fn start(self: &Arc<Self>, router: &Arc<StageRouter>) -> CamResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        self.transform.start(self.id).await?;

        let (tx, rx) = mpsc::channel(self.queue_depth);
        router.register(self.id, tx.clone());
        let handle = tokio::spawn(run_worker(Arc::clone(self), rx, Arc::clone(router)));
        *worker = Some(StageWorker { tx, handle });
        info!(stage = %self.id, depth = self.queue_depth, "Stage started");
        Ok(())
    }

    /// Stops taking frames, lets the worker drain its queue, then stops the device.
    ///
    /// No-op when not running.
    pub async fn stop(&self, router: &StageRouter) -> CamResult<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        router.unregister(self.id);
        let _ = worker.tx.send(StageMessage::Stop).await;
        drop(worker.tx);
        worker
            .handle
            .await
            .map_err(|e| CamError::Shutdown(format!("stage {} worker failed: {e}", self.id)))?;
        self.transform.stop(self.id).await?;
        info!(stage = %self.id, "Stage stopped");
        Ok(())
    }

    /// Whether the worker runs.
    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> StageStats {
        StageStats {
            stage: self.id,
            running: self.is_running().await,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    async fn wait_fences(&self, io: &StageIo) -> Result<(), StageError> {
        let fences: Vec<Fence> = io
            .outputs
            .iter()
            .filter_map(|o| o.buffer.acquire_fence().cloned())
            .collect();
        for fence in fences {
            if !fence.wait_timeout(self.fence_timeout).await {
                return Err(StageError::new(
                    self.id,
                    StageErrorKind::Timeout,
                    format!(
                        "acquire fence not signalled within {} ms",
                        self.fence_timeout.as_millis()
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn run(&self, io: &mut StageIo, router: &StageRouter) -> Result<(), StageError> {
        if router.is_flushing() {
            return Err(StageError::cancelled(self.id));
        }
        if !io.input_valid() {
            return Err(StageError::new(
                self.id,
                StageErrorKind::UpstreamFailed,
                "upstream stage failed",
            ));
        }
        self.wait_fences(io).await?;
        router.monitor.begin_work(self.id).await;
        let result = self.transform.process(io).await;
        router.monitor.heartbeat(self.id).await;
        result
    }

    async fn process_frame(&self, frame: &Arc<Frame>, router: &StageRouter) {
        let mut io = match frame.begin(self.id) {
            Ok(io) => io,
            Err(e) => {
                error!(stage = %self.id, frame = %frame.number(), error = %e, "Cannot start entity");
                router.fatal.raise(&e);
                return;
            }
        };
        debug!(stage = %self.id, frame = %frame.number(), "Processing frame");

        let result = self.run(&mut io, router).await;
        self.processed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            self.record_failure(frame, e, router).await;
        }

        match frame.finish(self.id, io, result) {
            Ok(completion) => {
                router.dispatch(frame, completion.ready).await;
                router.emit(frame, self.id).await;
            }
            Err(e) => {
                error!(stage = %self.id, frame = %frame.number(), error = %e, "Cannot finish entity");
                router.fatal.raise(&e);
            }
        }
    }

    async fn record_failure(&self, frame: &Frame, err: &StageError, router: &StageRouter) {
        let severity = match err.kind {
            StageErrorKind::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            StageErrorKind::UpstreamFailed | StageErrorKind::NotRunning => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            StageErrorKind::Transform => ErrorSeverity::Error,
            StageErrorKind::Timeout => ErrorSeverity::Error,
            StageErrorKind::Hardware => ErrorSeverity::Critical,
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(stage = %self.id, frame = %frame.number(), error = %err, "Stage transform failed");
        router
            .monitor
            .report_error(self.id, severity, err.to_string(), Some(frame.number()))
            .await;
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("queue_depth", &self.queue_depth)
            .finish_non_exhaustive()
    }
}

async fn run_worker(stage: Arc<Stage>, mut rx: mpsc::Receiver<StageMessage>, router: Arc<StageRouter>) {
    debug!(stage = %stage.id, "Stage worker running");
    while let Some(message) = rx.recv().await {
        match message {
            StageMessage::Process(frame) => stage.process_frame(&frame, &router).await,
            StageMessage::Stop => break,
        }
    }
    debug!(stage = %stage.id, "Stage worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DstSlot, FrameParams, StageEntity};
    use async_trait::async_trait;
    use cam_core::{
        CaptureIntent, ControlMetadata, EntityState, FrameNumber, FrameType, GraphKind,
        MonitorConfig, NodeRole, StreamId,
    };
    use cam_pool::{BufferLayout, BufferPool, PoolSpec};
    use tracing_test::traced_test;

    struct Passthrough;

    #[async_trait]
    impl StageTransform for Passthrough {
        async fn process(&self, io: &mut StageIo) -> Result<(), StageError> {
            io.result.sensor_timestamp_ns = Some(io.frame_number().0 * 10);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl StageTransform for Failing {
        async fn process(&self, io: &mut StageIo) -> Result<(), StageError> {
            Err(StageError::new(io.stage(), StageErrorKind::Transform, "broken"))
        }
    }

    fn router() -> (Arc<StageRouter>, mpsc::Receiver<ResultMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let router = StageRouter::new(
            tx,
            StageMonitor::new(&MonitorConfig::default()),
            Arc::new(FatalLatch::default()),
        );
        (Arc::new(router), rx)
    }

    fn frame(pool: &BufferPool) -> Arc<Frame> {
        let params = FrameParams {
            number: FrameNumber(4),
            frame_type: FrameType::Preview,
            graph: GraphKind::Preview,
            request: None,
            intent: CaptureIntent::PREVIEW,
            control: Arc::new(ControlMetadata::new()),
        };
        let sensor = StageEntity::requested(
            StageId::Sensor,
            0,
            vec![(NodeRole::Forward, StageId::Isp)],
        )
        .with_slot(
            NodeRole::Forward,
            DstSlot::requested(pool.try_acquire().unwrap(), None),
        );
        let isp = StageEntity::requested(StageId::Isp, 1, Vec::new()).with_slot(
            NodeRole::Preview,
            DstSlot::requested(pool.try_acquire().unwrap(), Some(StreamId(0))),
        );
        Arc::new(Frame::new(params, vec![sensor, isp]))
    }

    fn pool() -> BufferPool {
        BufferPool::with_heap(PoolSpec::fixed("stage-test", 4, BufferLayout::single_plane(8)))
            .unwrap()
    }

    async fn next_stage_event(rx: &mut mpsc::Receiver<ResultMessage>) -> StageEvent {
        match rx.recv().await.unwrap() {
            ResultMessage::Stage(event) => event,
            ResultMessage::Barrier(_) => panic!("unexpected barrier"),
        }
    }

    #[tokio::test]
    async fn frame_flows_through_two_stages() {
        let (router, mut rx) = router();
        let sensor = Arc::new(Stage::new(
            StageId::Sensor,
            Arc::new(Passthrough),
            4,
            Duration::from_millis(50),
        ));
        let isp = Arc::new(Stage::new(
            StageId::Isp,
            Arc::new(Passthrough),
            4,
            Duration::from_millis(50),
        ));
        sensor.start(&router).await.unwrap();
        isp.start(&router).await.unwrap();
        // idempotent
        sensor.start(&router).await.unwrap();

        let pool = pool();
        let frame = frame(&pool);
        router.dispatch(&frame, frame.ready_stages()).await;

        assert_eq!(next_stage_event(&mut rx).await.stage, StageId::Sensor);
        let last = next_stage_event(&mut rx).await;
        assert_eq!(last.stage, StageId::Isp);
        assert!(last.frame.is_complete());
        assert_eq!(last.frame.shutter_timestamp(), Some(40));

        sensor.stop(&router).await.unwrap();
        isp.stop(&router).await.unwrap();
        isp.stop(&router).await.unwrap();
        assert_eq!(sensor.stats().await.processed, 1);
        assert!(!sensor.stats().await.running);
    }

    #[tokio::test]
    #[traced_test]
    async fn transform_failure_cascades_as_upstream_failure() {
        let (router, mut rx) = router();
        let sensor = Arc::new(Stage::new(
            StageId::Sensor,
            Arc::new(Failing),
            4,
            Duration::from_millis(50),
        ));
        let isp = Arc::new(Stage::new(
            StageId::Isp,
            Arc::new(Passthrough),
            4,
            Duration::from_millis(50),
        ));
        sensor.start(&router).await.unwrap();
        isp.start(&router).await.unwrap();

        let pool = pool();
        let frame = frame(&pool);
        router.dispatch(&frame, frame.ready_stages()).await;
        next_stage_event(&mut rx).await;
        next_stage_event(&mut rx).await;

        assert!(frame.is_complete());
        assert_eq!(frame.entity_state(StageId::Sensor), Some(EntityState::Error));
        let isp_err = frame.entity_error(StageId::Isp).unwrap();
        assert_eq!(isp_err.kind, StageErrorKind::UpstreamFailed);
        assert!(logs_contain("Stage transform failed"));
        assert_eq!(sensor.stats().await.failed, 1);

        sensor.stop(&router).await.unwrap();
        isp.stop(&router).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_stage_fails_entity_without_worker() {
        let (router, mut rx) = router();
        let pool = pool();
        let frame = frame(&pool);
        router.dispatch(&frame, frame.ready_stages()).await;

        // Both entities failed inline
        next_stage_event(&mut rx).await;
        next_stage_event(&mut rx).await;
        assert!(frame.is_complete());
        assert_eq!(
            frame.entity_error(StageId::Sensor).unwrap().kind,
            StageErrorKind::NotRunning
        );
    }

    #[tokio::test]
    async fn flushing_cancels_queued_frames() {
        let (router, mut rx) = router();
        let sensor = Arc::new(Stage::new(
            StageId::Sensor,
            Arc::new(Passthrough),
            4,
            Duration::from_millis(50),
        ));
        let isp = Arc::new(Stage::new(
            StageId::Isp,
            Arc::new(Passthrough),
            4,
            Duration::from_millis(50),
        ));
        sensor.start(&router).await.unwrap();
        isp.start(&router).await.unwrap();
        router.set_flushing(true);

        let pool = pool();
        let frame = frame(&pool);
        router.dispatch(&frame, frame.ready_stages()).await;
        next_stage_event(&mut rx).await;
        next_stage_event(&mut rx).await;

        assert!(frame.is_complete());
        assert_eq!(
            frame.entity_error(StageId::Sensor).unwrap().kind,
            StageErrorKind::Cancelled
        );
        frame.release_buffers();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(sensor.stats().await.cancelled, 1);

        sensor.stop(&router).await.unwrap();
        isp.stop(&router).await.unwrap();
    }

    #[tokio::test]
    async fn unsignalled_acquire_fence_times_out() {
        let (router, mut rx) = router();
        let sensor = Arc::new(Stage::new(
            StageId::Sensor,
            Arc::new(Passthrough),
            4,
            Duration::from_millis(20),
        ));
        sensor.start(&router).await.unwrap();

        let pool = pool();
        let mut buffer = pool.try_acquire().unwrap();
        buffer.set_acquire_fence(Fence::new());
        let params = FrameParams {
            number: FrameNumber(9),
            frame_type: FrameType::Internal,
            graph: GraphKind::Preview,
            request: None,
            intent: CaptureIntent::empty(),
            control: Arc::new(ControlMetadata::new()),
        };
        let entity = StageEntity::requested(StageId::Sensor, 0, Vec::new())
            .with_slot(NodeRole::Raw, DstSlot::requested(buffer, None));
        let frame = Arc::new(Frame::new(params, vec![entity]));
        router.dispatch(&frame, frame.ready_stages()).await;
        next_stage_event(&mut rx).await;

        assert_eq!(
            frame.entity_error(StageId::Sensor).unwrap().kind,
            StageErrorKind::Timeout
        );
        sensor.stop(&router).await.unwrap();
    }
}
