//! Capture session.
//!
//! A [`Session`] owns everything one camera needs at runtime: the configured graphs, their
//! buffer pools, the in-flight lists, the capture selector, the request tracker and the
//! result dispatcher. No state lives outside it.
//!
//! # Tasks
//!
//! ```text
//!   submit_request ─► RequestTracker ─┬─► intake task ──► preview / vision graph ─┐
//!                                     └─► capture task ─► reprocessing graph ─────┤
//!                                             ▲                                   │ stage events
//!                                             │ raw buffers                       ▼
//!                                      CaptureSelector ◄──────────────────── result task
//!                                                                                 │
//!                                                            ResultDispatcher ◄───┘
//! ```
//!
//! # States
//!
//! `Open → Configured → Running → Flushing → Configured`. A protocol error latches `Error`
//! until the next `configure`.

use cam_core::{
    BufferTag, CamError, CamResult, DualMode, FrameNumber, GraphKind, NodeRole, PoolPolicy,
    RejectReason, ReprocessingMode, RequestKey, SessionConfig, SlotState, StageId, StreamSet,
    TransformProvider,
};
use cam_pool::{Allocator, BufferLayout, PoolSet, PoolSpec, PoolStats};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatcherStats, ResultDispatcher, ResultSink};
use crate::factory::{FrameFactory, FrameRequest, FrameStrategy};
use crate::graph::{GraphSpec, PipelineGraph, StageOverrides};
use crate::inflight::InFlightLists;
use crate::monitor::{FatalLatch, StageMonitor, SystemHealth};
use crate::request::{CaptureJob, PendingRequest, Request, RequestTracker, TrackerStats};
use crate::selector::{CaptureSelector, SelectorStats};
use crate::stage::{ResultMessage, StageEvent, StageRouter, StageStats};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No stream configuration
    Open,
    /// Streams configured, no request seen since
    Configured,
    /// Requests flowing
    Running,
    /// `flush` in progress
    Flushing,
    /// Protocol error; only `configure` or `close` recover
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Open => "open",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Flushing => "flushing",
            SessionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Snapshot of session counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Lifecycle state
    pub state: SessionState,
    /// Frames built since configure
    pub frames_built: u64,
    /// Required slots that could not get a buffer
    pub slot_failures: u64,
    /// Frames in flight, all graphs
    pub in_flight: usize,
    /// Admission counters
    pub requests: TrackerStats,
    /// Result counters
    pub results: DispatcherStats,
    /// Raw retention counters
    pub selector: SelectorStats,
    /// Per-stage counters, graph by graph
    pub stages: Vec<StageStats>,
    /// Per-pool counters
    pub pools: Vec<PoolStats>,
}

//==============================================================================
// Runtime
//==============================================================================

struct Workers {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Workers {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Session worker ended abnormally");
            }
        }
    }
}

/// Everything built by one `configure`.
struct Runtime {
    config: SessionConfig,
    primary: GraphKind,
    graphs: BTreeMap<GraphKind, PipelineGraph>,
    events: mpsc::Sender<ResultMessage>,
    pools: Arc<PoolSet<BufferTag>>,
    factory: FrameFactory,
    inflight: InFlightLists,
    selector: Arc<CaptureSelector>,
    dispatcher: Arc<ResultDispatcher>,
    tracker: RequestTracker,
    dual: Mutex<DualMode>,
}

impl Runtime {
    fn graph(&self, kind: GraphKind) -> CamResult<&PipelineGraph> {
        self.graphs
            .get(&kind)
            .ok_or_else(|| CamError::Configuration(format!("no {kind} graph configured")))
    }

    //--------------------------------------------------------------------------
    // Intake task
    //--------------------------------------------------------------------------

    async fn intake_once(&self) {
        let pending = if self.config.filler_frames {
            match tokio::time::timeout(self.config.frame_interval(), self.tracker.next_request())
                .await
            {
                Ok(pending) => pending,
                Err(_idle) => {
                    self.submit_filler().await;
                    return;
                }
            }
        } else {
            self.tracker.next_request().await
        };
        self.build_streaming(pending).await;
    }

    /// Builds the first frame of a request plus its linked accumulation frames.
    async fn build_streaming(&self, pending: PendingRequest) {
        let key = pending.key;
        let Ok(graph) = self.graph(self.primary) else {
            self.dispatcher.fail_request(key);
            return;
        };
        let strategy = if self.primary == GraphKind::Vision {
            FrameStrategy::Vision
        } else {
            FrameStrategy::Preview
        };
        let retain = self.graphs.contains_key(&GraphKind::Reprocessing)
            && (pending.retain_raw || self.selector.mode() == ReprocessingMode::AlwaysOn);
        let count = pending.frames.max(1);
        let first = self.factory.reserve(u64::from(count));

        for i in 0..count {
            let number = FrameNumber(first.0 + u64::from(i));
            let mut request = FrameRequest::new(Arc::clone(&pending.control))
                .linked(key)
                .number(number)
                .retain_bayer(retain)
                .overrides(pending.overrides.clone());
            let strategy = if i == 0 {
                request = request.targets(pending.targets.clone());
                strategy
            } else {
                FrameStrategy::Internal
            };
            let frame = match self.factory.build(strategy, graph, request) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(request = %key, frame = %number, error = %e, "Frame build failed, failing request");
                    self.dispatcher.fail_request(key);
                    return;
                }
            };
            if i == 0 {
                if let Some(source) = &pending.source {
                    let _ = source.send(Some(number));
                }
            }
            debug!(request = %key, frame = %number, kind = %frame.frame_type(), "Frame submitted");
            self.inflight.insert(Arc::clone(&frame));
            graph.submit(&frame).await;
        }
    }

    async fn submit_filler(&self) {
        if self.tracker.is_draining() {
            return;
        }
        let Some(graph) = self.graphs.get(&GraphKind::Preview) else {
            return;
        };
        let control = Arc::new(self.tracker.baseline().unwrap_or_default());
        let retain = self.graphs.contains_key(&GraphKind::Reprocessing)
            && self.selector.mode() == ReprocessingMode::AlwaysOn;
        let request = FrameRequest::new(control).retain_bayer(retain);
        match self.factory.build(FrameStrategy::Internal, graph, request) {
            Ok(frame) => {
                debug!(frame = %frame.number(), "Filler frame submitted");
                self.inflight.insert(Arc::clone(&frame));
                graph.submit(&frame).await;
            }
            Err(e) => warn!(error = %e, "Filler frame build failed"),
        }
    }

    //--------------------------------------------------------------------------
    // Capture task
    //--------------------------------------------------------------------------

    async fn capture_once(&self) {
        let job = self.tracker.next_capture().await;
        let key = job.key;
        let streams = job.streams();
        let from_raw = job.input.is_none();
        let outcome = self.build_capture(job).await;
        if from_raw {
            self.selector.need_decrement();
        }
        if let Err(e) = outcome {
            warn!(request = %key, error = %e, "Reprocessing frame not built");
            self.dispatcher.abandon_frame(key, &streams);
        }
    }

    async fn build_capture(&self, job: CaptureJob) -> CamResult<()> {
        let graph = self.graph(GraphKind::Reprocessing)?;
        let CaptureJob {
            key,
            control,
            targets,
            overrides,
            input,
            accumulation,
            source,
        } = job;

        let sources = match input {
            Some(buffer) => vec![buffer],
            None => {
                let mut source = source.ok_or_else(|| {
                    CamError::Protocol(format!("capture for {key} has no raw source"))
                })?;
                let target = loop {
                    let current = *source.borrow_and_update();
                    if let Some(number) = current {
                        break number;
                    }
                    source.changed().await.map_err(|_| {
                        CamError::Shutdown(format!("source frame for {key} abandoned"))
                    })?;
                };
                let budget = self
                    .config
                    .select_timeout()
                    .saturating_mul(accumulation.max(1));
                let selection = self.selector.select(target, accumulation, budget).await?;
                debug!(request = %key, frames = ?selection.frames, "Raw data selected");
                selection.buffers
            }
        };

        let request = FrameRequest::new(control)
            .linked(key)
            .targets(targets)
            .overrides(overrides)
            .sources(sources);
        let frame = self.factory.build(FrameStrategy::Reprocess, graph, request)?;
        debug!(request = %key, frame = %frame.number(), "Reprocessing frame submitted");
        self.inflight.insert(Arc::clone(&frame));
        graph.submit(&frame).await;
        Ok(())
    }

    //--------------------------------------------------------------------------
    // Result task
    //--------------------------------------------------------------------------

    fn handle_event(&self, event: StageEvent) {
        let frame = event.frame;
        let key = frame.request();

        if let (Some(key), Some(timestamp)) = (key, frame.shutter_timestamp()) {
            self.dispatcher.shutter(key, frame.number(), timestamp);
        }

        if let Some((stage, slot, buffer)) = frame.take_retained(NodeRole::Bayer) {
            match (slot, buffer) {
                (SlotState::Complete, Some(buffer)) => {
                    self.selector
                        .offer(frame.number(), buffer, frame.result_metadata());
                }
                _ => {
                    debug!(frame = %frame.number(), %stage, "Raw output failed");
                    self.selector.mark_unavailable(frame.number());
                }
            }
        }

        if let Some(key) = key {
            for partial in frame.take_partials() {
                self.dispatcher.partial(key, partial);
            }
        }
        for output in frame.take_stream_outputs() {
            match key {
                Some(key) => self
                    .dispatcher
                    .deliver(key, output.stream, output.state, output.buffer),
                None => debug!(frame = %frame.number(), stream = %output.stream, "Output without request dropped"),
            }
        }

        if frame.is_complete() && self.inflight.remove(&frame) {
            if let Some(key) = key {
                self.dispatcher.frame_done(key, &frame.result_metadata());
            }
            frame.release_buffers();
            debug!(frame = %frame.number(), stage = %event.stage, "Frame complete");
        }
    }

    /// Returns once the result task handled every event sent before this call.
    async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(ResultMessage::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    //--------------------------------------------------------------------------
    // Lifecycle
    //--------------------------------------------------------------------------

    async fn start_graphs(&self) -> CamResult<()> {
        for graph in self.graphs.values() {
            graph.set_flushing(false);
            graph.start().await?;
        }
        Ok(())
    }

    /// Stops every stage and fails back every request that has not retired yet.
    ///
    /// Coordination tasks must already be stopped.
    async fn quiesce(&self) {
        self.selector.cancel();
        for graph in self.graphs.values() {
            graph.set_flushing(true);
        }
        for graph in self.graphs.values() {
            if let Err(e) = graph.stop().await {
                warn!(graph = %graph.kind(), error = %e, "Graph stop failed");
            }
        }
        self.barrier().await;

        let drained = self.inflight.drain_all();
        let retained = self.selector.clear();
        let failed = self.dispatcher.fail_all();
        info!(
            frames = drained.len(),
            retained,
            failed,
            "Pipeline quiesced"
        );
    }

    /// Drains admission and fails the queued requests.
    fn drain_admission(&self) {
        let (waiting, capture) = self.tracker.begin_drain();
        for pending in waiting {
            self.dispatcher.fail_request(pending.key);
        }
        for job in capture {
            self.dispatcher.fail_request(job.key);
        }
    }
}

fn spawn_workers(runtime: &Arc<Runtime>) -> Workers {
    let (shutdown, _) = broadcast::channel(1);
    let mut tasks = Vec::with_capacity(2);

    let rt = Arc::clone(runtime);
    let mut stop = shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.recv() => break,
                () = rt.intake_once() => {}
            }
        }
        debug!("Intake task stopped");
    }));

    if runtime.graphs.contains_key(&GraphKind::Reprocessing) {
        let rt = Arc::clone(runtime);
        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.recv() => break,
                    () = rt.capture_once() => {}
                }
            }
            debug!("Capture task stopped");
        }));
    }
    Workers { shutdown, tasks }
}

fn spawn_results(runtime: &Arc<Runtime>, mut events: mpsc::Receiver<ResultMessage>) -> Workers {
    let (shutdown, _) = broadcast::channel(1);
    let rt = Arc::clone(runtime);
    let mut stop = shutdown.subscribe();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.recv() => break,
                message = events.recv() => match message {
                    Some(ResultMessage::Stage(event)) => rt.handle_event(event),
                    Some(ResultMessage::Barrier(ack)) => {
                        let _ = ack.send(());
                    }
                    None => break,
                },
            }
        }
        debug!("Result task stopped");
    });
    Workers {
        shutdown,
        tasks: vec![task],
    }
}

//==============================================================================
// Session
//==============================================================================

/// One camera's capture session.
pub struct Session {
    config: SessionConfig,
    provider: Arc<dyn TransformProvider>,
    allocator: Arc<dyn Allocator>,
    sink: Arc<dyn ResultSink>,
    state: Mutex<SessionState>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    op_lock: tokio::sync::Mutex<()>,
    workers: tokio::sync::Mutex<Option<Workers>>,
    results: tokio::sync::Mutex<Option<Workers>>,
    monitor: StageMonitor,
    fatal: Arc<FatalLatch>,
}

impl Session {
    /// Opens a session. Nothing runs until [`Session::configure`].
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn TransformProvider>,
        allocator: Arc<dyn Allocator>,
        sink: Arc<dyn ResultSink>,
    ) -> CamResult<Self> {
        config.validate()?;
        let monitor = StageMonitor::new(&config.monitor);
        Ok(Self {
            config,
            provider,
            allocator,
            sink,
            state: Mutex::new(SessionState::Open),
            runtime: RwLock::new(None),
            op_lock: tokio::sync::Mutex::new(()),
            workers: tokio::sync::Mutex::new(None),
            results: tokio::sync::Mutex::new(None),
            monitor,
            fatal: Arc::new(FatalLatch::default()),
        })
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state. A raised protocol error reads as [`SessionState::Error`].
    #[must_use]
    pub fn state(&self) -> SessionState {
        let mut state = self.state.lock();
        if self.fatal.is_raised() && *state != SessionState::Open {
            *state = SessionState::Error;
        }
        *state
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = %*state, to = %next, "Session state change");
            *state = next;
        }
    }

    fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.read().clone()
    }

    /// Builds graphs and pools for `streams` and starts them.
    ///
    /// A running session is flushed and torn down first. A stream set that fails to
    /// build leaves the previous configuration in place. Once the previous
    /// configuration is torn down, a failure starting the new graphs leaves the
    /// session open and unconfigured.
    pub async fn configure(&self, streams: StreamSet) -> CamResult<()> {
        let _op = self.op_lock.lock().await;
        let (runtime, events) = self.build_runtime(streams)?;

        let previous = self.runtime.write().take();
        if let Some(previous) = previous {
            info!("Reconfiguring, flushing previous configuration");
            previous.drain_admission();
            if let Some(workers) = self.workers.lock().await.take() {
                workers.stop().await;
            }
            previous.quiesce().await;
        }
        self.teardown().await;

        let runtime = Arc::new(runtime);
        self.fatal.clear();
        if let Err(e) = runtime.start_graphs().await {
            for graph in runtime.graphs.values() {
                let _ = graph.stop().await;
            }
            self.set_state(SessionState::Open);
            return Err(e);
        }
        *self.results.lock().await = Some(spawn_results(&runtime, events));
        *self.workers.lock().await = Some(spawn_workers(&runtime));
        *self.runtime.write() = Some(Arc::clone(&runtime));
        self.set_state(SessionState::Configured);
        info!(
            streams = runtime.tracker.streams().len(),
            graphs = runtime.graphs.len(),
            pools = runtime.pools.len(),
            threshold = runtime.tracker.threshold(),
            "Session configured"
        );
        Ok(())
    }

    fn build_runtime(
        &self,
        streams: StreamSet,
    ) -> CamResult<(Runtime, mpsc::Receiver<ResultMessage>)> {
        let config = &self.config;
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);

        let mut graphs = BTreeMap::new();
        for spec in GraphSpec::for_config(config) {
            let router = Arc::new(StageRouter::new(
                events_tx.clone(),
                self.monitor.clone(),
                Arc::clone(&self.fatal),
            ));
            let kind = spec.kind;
            let graph = PipelineGraph::new(
                spec,
                self.provider.as_ref(),
                router,
                config.stage_queue_depth,
                config.fence_timeout(),
            )?;
            graphs.insert(kind, graph);
        }
        let primary = if config.vision_mode {
            GraphKind::Vision
        } else {
            GraphKind::Preview
        };
        let capture_path = graphs.contains_key(&GraphKind::Reprocessing);

        let pools = Arc::new(PoolSet::new());
        self.create_stream_pools(&pools, &graphs, primary, &streams)?;
        self.create_internal_pools(&pools, &graphs, primary)?;

        let selector = Arc::new(CaptureSelector::new(
            config.reprocessing,
            config.raw_hold_capacity(),
        ));
        let dispatcher = Arc::new(ResultDispatcher::new(Arc::clone(&self.sink)));
        let tracker = RequestTracker::new(
            config,
            streams,
            capture_path,
            Arc::clone(&dispatcher),
            Arc::clone(&selector),
        );
        let runtime = Runtime {
            config: config.clone(),
            primary,
            graphs,
            events: events_tx,
            factory: FrameFactory::new(Arc::clone(&pools)),
            pools,
            inflight: InFlightLists::new(),
            selector,
            dispatcher,
            tracker,
            dual: Mutex::new(config.dual),
        };
        Ok((runtime, events_rx))
    }

    /// One fixed pool per output stream, on the node that produces it.
    fn create_stream_pools(
        &self,
        pools: &PoolSet<BufferTag>,
        graphs: &BTreeMap<GraphKind, PipelineGraph>,
        primary: GraphKind,
        streams: &StreamSet,
    ) -> CamResult<()> {
        for stream in streams.iter() {
            let kind = if stream.role.is_input() || stream.role.is_stall() {
                if graphs.contains_key(&GraphKind::Reprocessing) {
                    GraphKind::Reprocessing
                } else if stream.role.is_input() {
                    return Err(CamError::Configuration(format!(
                        "{} is an input stream but reprocessing is disabled",
                        stream.id
                    )));
                } else {
                    primary
                }
            } else {
                primary
            };
            if stream.role.is_input() {
                continue;
            }
            let node = graphs
                .get(&kind)
                .and_then(|g| g.stream_node(stream.role))
                .ok_or_else(|| {
                    CamError::Configuration(format!(
                        "{} ({}) has no producing node in the {kind} graph",
                        stream.id, stream.role
                    ))
                })?;
            let tag = BufferTag::new(node.0, node.1);
            let layout = BufferLayout::single_plane(stream.buffer_bytes());
            let spec = self.pool_spec(tag, PoolPolicy::Fixed, stream.max_buffers, layout);
            pools.create(tag, spec, Arc::clone(&self.allocator))?;
        }
        Ok(())
    }

    /// On-demand pools for inter-stage edges and retained raw output.
    fn create_internal_pools(
        &self,
        pools: &PoolSet<BufferTag>,
        graphs: &BTreeMap<GraphKind, PipelineGraph>,
        primary: GraphKind,
    ) -> CamResult<()> {
        let config = &self.config;
        let ceiling = (config.pacing_threshold() + config.selector.hold_count) * 4;
        let bytes = config.internal_buffer_bytes();
        let mut tags = Vec::new();
        for graph in graphs.values() {
            for edge in graph.edges() {
                tags.push(BufferTag::new(edge.from, edge.role));
            }
        }
        if graphs.contains_key(&GraphKind::Reprocessing) {
            if let Some(graph) = graphs.get(&primary) {
                for stage in graph.order() {
                    if graph.node_roles(*stage).contains(&NodeRole::Bayer) {
                        tags.push(BufferTag::new(*stage, NodeRole::Bayer));
                    }
                }
            }
        }
        for tag in tags {
            if pools.contains(&tag) {
                continue;
            }
            let count = if tag.role == NodeRole::Bayer {
                ceiling.max(config.raw_pool_ceiling())
            } else {
                ceiling
            };
            let spec = self.pool_spec(
                tag,
                PoolPolicy::OnDemand,
                count,
                BufferLayout::single_plane(bytes),
            );
            pools.create(tag, spec, Arc::clone(&self.allocator))?;
        }
        Ok(())
    }

    fn pool_spec(
        &self,
        tag: BufferTag,
        policy: PoolPolicy,
        count: usize,
        layout: BufferLayout,
    ) -> PoolSpec {
        let (policy, count) = match self.config.pool_override(tag.stage, tag.role) {
            Some(o) => (o.policy, o.count),
            None => (policy, count),
        };
        match policy {
            PoolPolicy::Fixed => PoolSpec::fixed(tag.to_string(), count, layout),
            PoolPolicy::OnDemand => PoolSpec::on_demand(tag.to_string(), count, layout),
        }
    }

    /// Stops everything the current runtime runs. The runtime must already be detached.
    async fn teardown(&self) {
        let workers = self.workers.lock().await.take();
        let results = self.results.lock().await.take();
        if workers.is_none() && results.is_none() {
            return;
        }
        if let Some(workers) = workers {
            workers.stop().await;
        }
        if let Some(results) = results {
            results.stop().await;
        }
        info!("Previous configuration torn down");
    }

    /// Admits `request`.
    ///
    /// Waits at most the submit timeout when the pipeline is full.
    pub async fn submit_request(&self, request: Request) -> CamResult<RequestKey> {
        let key = request.key;
        match self.state() {
            SessionState::Open => {
                return Err(CamError::rejected(key, RejectReason::NotConfigured));
            }
            SessionState::Error => {
                let reason = self.fatal.reason().unwrap_or_else(|| "unknown".into());
                return Err(CamError::DeviceError(format!(
                    "session in error state: {reason}"
                )));
            }
            _ => {}
        }
        let runtime = self
            .runtime()
            .ok_or_else(|| CamError::rejected(key, RejectReason::NotConfigured))?;
        let key = runtime.tracker.submit(request).await?;
        let mut state = self.state.lock();
        if *state == SessionState::Configured {
            *state = SessionState::Running;
        }
        Ok(key)
    }

    /// Fails back everything in flight and returns to `Configured`.
    ///
    /// Every admitted request gets a terminal callback before this returns. Idempotent.
    pub async fn flush(&self) -> CamResult<()> {
        let _op = self.op_lock.lock().await;
        let Some(runtime) = self.runtime() else {
            return Ok(());
        };
        let started = std::time::Instant::now();
        self.set_state(SessionState::Flushing);

        runtime.drain_admission();
        runtime.selector.cancel();
        if let Some(workers) = self.workers.lock().await.take() {
            workers.stop().await;
        }
        runtime.quiesce().await;

        if !runtime
            .pools
            .wait_reclaimed(self.config.flush_timeout())
            .await
        {
            let held: Vec<String> = runtime
                .pools
                .stats()
                .into_iter()
                .filter(|(_, s)| s.outstanding > 0)
                .map(|(tag, s)| format!("{tag}={}", s.outstanding))
                .collect();
            warn!(pools = ?held, "Buffers still held after flush");
        }
        let trimmed = runtime.pools.trim_on_demand();

        runtime.start_graphs().await?;
        runtime.tracker.end_drain();
        *self.workers.lock().await = Some(spawn_workers(&runtime));
        self.set_state(if self.fatal.is_raised() {
            SessionState::Error
        } else {
            SessionState::Configured
        });
        info!(
            trimmed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flush complete"
        );
        Ok(())
    }

    /// Enables or disables `stage` for frames built from now on.
    pub fn set_stage_enabled(&self, stage: StageId, enabled: bool) -> CamResult<()> {
        let runtime = self.runtime().ok_or_else(|| CamError::InvalidState {
            operation: "set_stage_enabled",
            state: self.state().to_string(),
        })?;
        let graph = runtime
            .graphs
            .values()
            .find(|g| g.contains(stage))
            .ok_or_else(|| CamError::Configuration(format!("stage '{stage}' is not configured")))?;
        graph.set_enabled(stage, enabled)?;
        info!(%stage, enabled, "Stage toggled");
        Ok(())
    }

    /// Switches dual-sensor operation.
    ///
    /// A transition frame with both sensor paths and the sync stage enabled goes through
    /// the graph first; the new enable flags apply to frames built after it. Returns the
    /// transition frame's number.
    pub async fn set_dual_operation(&self, mode: DualMode) -> CamResult<FrameNumber> {
        let _op = self.op_lock.lock().await;
        let runtime = self.runtime().ok_or_else(|| CamError::InvalidState {
            operation: "set_dual_operation",
            state: self.state().to_string(),
        })?;
        if self.config.dual == DualMode::Off || mode == DualMode::Off {
            return Err(CamError::Configuration(
                "dual operation needs a dual-sensor configuration".into(),
            ));
        }
        let graph = runtime.graph(GraphKind::Preview)?;

        let all = [
            StageId::Sensor,
            StageId::Isp3a,
            StageId::SensorSecondary,
            StageId::Isp3aSecondary,
            StageId::Sync,
        ];
        let mut overrides = StageOverrides::new();
        for stage in all {
            overrides.set(stage, true);
        }
        let control = Arc::new(runtime.tracker.baseline().unwrap_or_default());
        let frame = runtime.factory.build(
            FrameStrategy::Transition,
            graph,
            FrameRequest::new(control).overrides(overrides),
        )?;
        let number = frame.number();
        runtime.inflight.insert(Arc::clone(&frame));
        graph.submit(&frame).await;

        let primary = mode != DualMode::Slave;
        let secondary = matches!(mode, DualMode::Sync | DualMode::Slave);
        graph.set_enabled(StageId::Sensor, primary)?;
        graph.set_enabled(StageId::Isp3a, primary)?;
        graph.set_enabled(StageId::SensorSecondary, secondary)?;
        graph.set_enabled(StageId::Isp3aSecondary, secondary)?;
        graph.set_enabled(StageId::Sync, mode == DualMode::Sync)?;

        let previous = std::mem::replace(&mut *runtime.dual.lock(), mode);
        info!(frame = %number, from = ?previous, to = ?mode, "Dual operation switched");
        Ok(number)
    }

    /// Current dual-sensor operation.
    #[must_use]
    pub fn dual_operation(&self) -> Option<DualMode> {
        self.runtime().map(|rt| *rt.dual.lock())
    }

    /// Overall health from stage heartbeats and recent failures.
    pub async fn health(&self) -> SystemHealth {
        if self.fatal.is_raised() {
            return SystemHealth::Critical;
        }
        self.monitor.system_health().await
    }

    /// Stage heartbeat and failure tracker.
    #[must_use]
    pub fn monitor(&self) -> &StageMonitor {
        &self.monitor
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> CamResult<SessionStats> {
        let runtime = self.runtime().ok_or_else(|| CamError::InvalidState {
            operation: "stats",
            state: self.state().to_string(),
        })?;
        let mut stages = Vec::new();
        for graph in runtime.graphs.values() {
            stages.extend(graph.stage_stats().await);
        }
        let mut pools: Vec<PoolStats> = runtime
            .pools
            .stats()
            .into_iter()
            .map(|(_, stats)| stats)
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(SessionStats {
            state: self.state(),
            frames_built: runtime.factory.built(),
            slot_failures: runtime.factory.slot_failures(),
            in_flight: runtime.inflight.total(),
            requests: runtime.tracker.stats(),
            results: runtime.dispatcher.stats(),
            selector: runtime.selector.stats(),
            stages,
            pools,
        })
    }

    /// Frames currently in flight, all graphs.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.runtime().map_or(0, |rt| rt.inflight.total())
    }

    /// Whether every pool got all of its buffers back.
    #[must_use]
    pub fn pools_reclaimed(&self) -> bool {
        self.runtime().map_or(true, |rt| rt.pools.is_fully_reclaimed())
    }

    /// Captures waiting for retained raw data.
    #[must_use]
    pub fn raw_need(&self) -> usize {
        self.runtime().map_or(0, |rt| rt.selector.need())
    }

    /// Requests waiting for a reprocessing frame.
    #[must_use]
    pub fn capture_backlog(&self) -> usize {
        self.runtime().map_or(0, |rt| rt.tracker.capture_len())
    }

    /// Flushes, stops every stage and drops the configuration.
    pub async fn close(&self) -> CamResult<()> {
        let _op = self.op_lock.lock().await;
        let runtime = self.runtime.write().take();
        let Some(runtime) = runtime else {
            self.set_state(SessionState::Open);
            return Ok(());
        };
        runtime.drain_admission();
        runtime.selector.cancel();
        if let Some(workers) = self.workers.lock().await.take() {
            workers.stop().await;
        }
        runtime.quiesce().await;
        self.teardown().await;
        self.set_state(SessionState::Open);
        if self.fatal.is_raised() {
            error!(reason = ?self.fatal.reason(), "Session closed after a protocol error");
        }
        self.fatal.clear();
        info!("Session closed");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
