//! Frame construction.
//!
//! [`FrameFactory`] turns a planned graph traversal into a [`Frame`]: it numbers the frame,
//! latches the enable flags, and acquires one buffer per destination slot from the pool
//! registered for that slot's `(stage, role)` tag.
//!
//! Required slots (stream targets and edges feeding a successor) that cannot get a buffer
//! are created already failed. Optional slots (raw retention) are skipped.

use cam_core::{
    BufferTag, CamError, CamResult, CaptureIntent, ControlMetadata, FrameNumber, FrameType,
    GraphKind, NodeRole, RequestKey, StageId, StreamId, StreamRole,
};
use cam_pool::{Buffer, PoolSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::frame::{DstSlot, Frame, FrameParams, StageEntity};
use crate::graph::{PipelineGraph, StageOverrides};

/// How a frame is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStrategy {
    /// Streaming frame linked to a request
    Preview,
    /// Preview-graph frame without stream outputs (filler, long-exposure accumulation)
    Internal,
    /// Still frame fed with retained raw buffers or a caller input
    Reprocess,
    /// Vision-graph frame
    Vision,
    /// Dual-sensor switch frame routed through the sync stage
    Transition,
}

impl FrameStrategy {
    fn frame_type(self) -> FrameType {
        match self {
            FrameStrategy::Preview => FrameType::Preview,
            FrameStrategy::Internal => FrameType::Internal,
            FrameStrategy::Reprocess => FrameType::Reprocessing,
            FrameStrategy::Vision => FrameType::Vision,
            FrameStrategy::Transition => FrameType::Transition,
        }
    }

    fn graph(self) -> GraphKind {
        match self {
            FrameStrategy::Preview | FrameStrategy::Internal | FrameStrategy::Transition => {
                GraphKind::Preview
            }
            FrameStrategy::Reprocess => GraphKind::Reprocessing,
            FrameStrategy::Vision => GraphKind::Vision,
        }
    }

    fn has_targets(self) -> bool {
        matches!(
            self,
            FrameStrategy::Preview | FrameStrategy::Reprocess | FrameStrategy::Vision
        )
    }
}

/// Stream output requested from a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Stream id
    pub stream: StreamId,
    /// Stream role, selects the producing node
    pub role: StreamRole,
}

/// Inputs of one frame build.
#[derive(Debug)]
pub struct FrameRequest {
    /// Linked request
    pub request: Option<RequestKey>,
    /// Controls to latch
    pub control: Arc<ControlMetadata>,
    /// Stream outputs
    pub targets: Vec<Target>,
    /// Per-frame stage overrides, applied last
    pub overrides: StageOverrides,
    /// Keep the sensor's Bayer output for still capture
    pub retain_bayer: bool,
    /// Root input buffers
    pub sources: Vec<Buffer>,
    /// Pre-reserved frame number
    pub number: Option<FrameNumber>,
    /// Extra intent bits
    pub intent: CaptureIntent,
}

impl FrameRequest {
    /// Build without outputs or links.
    #[must_use]
    pub fn new(control: Arc<ControlMetadata>) -> Self {
        Self {
            request: None,
            control,
            targets: Vec::new(),
            overrides: StageOverrides::new(),
            retain_bayer: false,
            sources: Vec::new(),
            number: None,
            intent: CaptureIntent::empty(),
        }
    }

    /// Links the frame to a request.
    #[must_use]
    pub fn linked(mut self, key: RequestKey) -> Self {
        self.request = Some(key);
        self
    }

    /// Sets the stream outputs.
    #[must_use]
    pub fn targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = targets;
        self
    }

    /// Sets per-frame overrides.
    #[must_use]
    pub fn overrides(mut self, overrides: StageOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Requests Bayer retention.
    #[must_use]
    pub fn retain_bayer(mut self, retain: bool) -> Self {
        self.retain_bayer = retain;
        self
    }

    /// Sets root input buffers.
    #[must_use]
    pub fn sources(mut self, sources: Vec<Buffer>) -> Self {
        self.sources = sources;
        self
    }

    /// Uses a reserved frame number.
    #[must_use]
    pub fn number(mut self, number: FrameNumber) -> Self {
        self.number = Some(number);
        self
    }

    /// Adds intent bits.
    #[must_use]
    pub fn intent(mut self, intent: CaptureIntent) -> Self {
        self.intent |= intent;
        self
    }
}

/// Builds frames against the session's pools. Numbers are shared by all graphs.
pub struct FrameFactory {
    next: AtomicU64,
    built: AtomicU64,
    slot_failures: AtomicU64,
    pools: Arc<PoolSet<BufferTag>>,
}

impl FrameFactory {
    /// Factory drawing buffers from `pools`.
    #[must_use]
    pub fn new(pools: Arc<PoolSet<BufferTag>>) -> Self {
        Self {
            next: AtomicU64::new(0),
            built: AtomicU64::new(0),
            slot_failures: AtomicU64::new(0),
            pools,
        }
    }

    /// Reserves `count` consecutive frame numbers and returns the first.
    pub fn reserve(&self, count: u64) -> FrameNumber {
        FrameNumber(self.next.fetch_add(count.max(1), Ordering::SeqCst))
    }

    /// Next frame number.
    pub fn next_number(&self) -> FrameNumber {
        self.reserve(1)
    }

    /// Frames built so far.
    #[must_use]
    pub fn built(&self) -> u64 {
        self.built.load(Ordering::Relaxed)
    }

    /// Required slots that could not get a buffer.
    #[must_use]
    pub fn slot_failures(&self) -> u64 {
        self.slot_failures.load(Ordering::Relaxed)
    }

    /// Builds a frame with `strategy` against `graph`.
    pub fn build(
        &self,
        strategy: FrameStrategy,
        graph: &PipelineGraph,
        request: FrameRequest,
    ) -> CamResult<Arc<Frame>> {
        if graph.kind() != strategy.graph() {
            return Err(CamError::Protocol(format!(
                "{strategy:?} frame cannot be built on the {} graph",
                graph.kind()
            )));
        }
        let FrameRequest {
            request: key,
            control,
            targets,
            overrides: caller_overrides,
            retain_bayer,
            mut sources,
            number,
            intent: extra_intent,
        } = request;
        let targets = if strategy.has_targets() {
            targets
        } else {
            Vec::new()
        };

        let mut nodes = Vec::with_capacity(targets.len());
        let mut overrides = StageOverrides::new();
        let mut intent = extra_intent;
        for target in &targets {
            let (stage, role) = graph.stream_node(target.role).ok_or_else(|| {
                CamError::Configuration(format!(
                    "{} graph cannot produce {} streams",
                    graph.kind(),
                    target.role
                ))
            })?;
            overrides.set(stage, true);
            nodes.push((stage, role, target.stream));
            intent |= target.role.intent();
        }
        if control.vision_enabled == Some(true) && graph.contains(StageId::Vision) {
            overrides.set(StageId::Vision, true);
        }
        overrides.merge(&caller_overrides);

        let plan = graph.plan(&overrides);
        if plan.is_enabled(StageId::Vision) {
            intent |= CaptureIntent::VISION;
        }
        if strategy == FrameStrategy::Reprocess {
            intent |= CaptureIntent::REPROCESS;
        }
        let number = number.unwrap_or_else(|| self.next_number());

        let bayer_stage = if retain_bayer {
            plan.entities
                .iter()
                .find(|e| e.enabled && e.roles.contains(&NodeRole::Bayer))
                .map(|e| e.stage)
        } else {
            None
        };

        let mut entities = Vec::with_capacity(plan.entities.len());
        for ep in &plan.entities {
            if !ep.enabled {
                entities.push(StageEntity::not_requested(ep.stage));
                continue;
            }
            let mut entity = StageEntity::requested(ep.stage, ep.preds.len(), ep.succs.clone());
            if ep.preds.is_empty() && !sources.is_empty() {
                entity = entity.with_sources(std::mem::take(&mut sources));
            }

            let mut wanted: Vec<(NodeRole, Option<StreamId>, bool)> = Vec::new();
            for (role, _) in &ep.succs {
                if !wanted.iter().any(|(r, _, _)| r == role) {
                    wanted.push((*role, None, true));
                }
            }
            for (stage, role, stream) in &nodes {
                if *stage == ep.stage {
                    wanted.push((*role, Some(*stream), true));
                }
            }
            if bayer_stage == Some(ep.stage) {
                wanted.push((NodeRole::Bayer, None, false));
            }

            for (role, stream, required) in wanted {
                let tag = BufferTag::new(ep.stage, role);
                match self.pools.try_acquire(&tag) {
                    Ok(buffer) => {
                        entity = entity.with_slot(role, DstSlot::requested(buffer, stream));
                    }
                    Err(e) if required => {
                        self.slot_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(frame = %number, %tag, error = %e, "Required output unavailable, slot marked Error");
                        entity = entity.with_slot(role, DstSlot::unavailable(stream));
                    }
                    Err(e) => {
                        warn!(frame = %number, %tag, error = %e, "Optional output unavailable, frame retains nothing");
                        entity = entity.with_slot(role, DstSlot::unavailable(stream));
                    }
                }
            }
            entities.push(entity);
        }
        if !sources.is_empty() {
            debug!(frame = %number, count = sources.len(), "Unused root inputs returned");
        }

        let frame = Frame::new(
            FrameParams {
                number,
                frame_type: strategy.frame_type(),
                graph: graph.kind(),
                request: key,
                intent,
                control,
            },
            entities,
        );
        self.built.fetch_add(1, Ordering::Relaxed);
        debug!(frame = %number, ?strategy, request = ?key, "Frame built");
        Ok(Arc::new(frame))
    }
}

impl std::fmt::Debug for FrameFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameFactory")
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("built", &self.built())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphSpec;
    use crate::monitor::{FatalLatch, StageMonitor};
    use crate::stage::StageRouter;
    use cam_core::{EntityState, MonitorConfig, SessionConfig, SlotState};
    use cam_driver_mock::MockDevice;
    use cam_pool::{BufferLayout, HeapAllocator, PoolSpec};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn graph(spec: GraphSpec) -> PipelineGraph {
        let (tx, _rx) = mpsc::channel(8);
        let router = Arc::new(StageRouter::new(
            tx,
            StageMonitor::new(&MonitorConfig::default()),
            Arc::new(FatalLatch::default()),
        ));
        PipelineGraph::new(spec, &MockDevice::new(), router, 4, Duration::from_millis(10))
            .unwrap()
    }

    fn pools(entries: &[(StageId, NodeRole, usize)]) -> Arc<PoolSet<BufferTag>> {
        let pools = PoolSet::new();
        for (stage, role, count) in entries {
            let tag = BufferTag::new(*stage, *role);
            pools
                .create(
                    tag,
                    PoolSpec::fixed(tag.to_string(), *count, BufferLayout::single_plane(32)),
                    Arc::new(HeapAllocator),
                )
                .unwrap();
        }
        Arc::new(pools)
    }

    fn preview_pools(preview_count: usize) -> Arc<PoolSet<BufferTag>> {
        pools(&[
            (StageId::Sensor, NodeRole::Forward, 4),
            (StageId::Sensor, NodeRole::Bayer, 4),
            (StageId::Isp3a, NodeRole::Forward, 4),
            (StageId::Isp, NodeRole::Forward, 4),
            (StageId::Scaler, NodeRole::Preview, preview_count),
            (StageId::Scaler, NodeRole::Downscale, 4),
        ])
    }

    fn preview_target() -> Target {
        Target {
            stream: StreamId(0),
            role: StreamRole::Preview,
        }
    }

    #[test]
    fn numbers_are_shared_and_reservable() {
        let factory = FrameFactory::new(Arc::new(PoolSet::new()));
        assert_eq!(factory.next_number(), FrameNumber(0));
        assert_eq!(factory.reserve(3), FrameNumber(1));
        assert_eq!(factory.next_number(), FrameNumber(4));
    }

    #[tokio::test]
    async fn preview_frame_gets_edge_and_stream_slots() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        let pools = preview_pools(2);
        let factory = FrameFactory::new(Arc::clone(&pools));

        let frame = factory
            .build(
                FrameStrategy::Preview,
                &g,
                FrameRequest::new(Arc::new(ControlMetadata::new()))
                    .linked(RequestKey(5))
                    .targets(vec![preview_target()])
                    .retain_bayer(true),
            )
            .unwrap();

        assert_eq!(frame.frame_type(), FrameType::Preview);
        assert_eq!(frame.request(), Some(RequestKey(5)));
        assert!(frame.intent().contains(CaptureIntent::PREVIEW));
        assert_eq!(frame.ready_stages(), vec![StageId::Sensor]);
        assert_eq!(
            frame.slot_state(StageId::Scaler, NodeRole::Preview),
            Some(SlotState::Requested)
        );
        assert_eq!(
            frame.slot_state(StageId::Sensor, NodeRole::Bayer),
            Some(SlotState::Requested)
        );
        assert_eq!(frame.entity_state(StageId::Vision), Some(EntityState::NotRequested));
        // Forward x3 + preview + bayer
        let out: usize = pools.stats().iter().map(|(_, s)| s.outstanding).sum();
        assert_eq!(out, 5);
    }

    #[tokio::test]
    async fn exhausted_required_slot_is_marked_error() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        let pools = preview_pools(1);
        let factory = FrameFactory::new(pools);
        let request = || {
            FrameRequest::new(Arc::new(ControlMetadata::new())).targets(vec![preview_target()])
        };

        let first = factory.build(FrameStrategy::Preview, &g, request()).unwrap();
        let second = factory.build(FrameStrategy::Preview, &g, request()).unwrap();
        assert_eq!(
            first.slot_state(StageId::Scaler, NodeRole::Preview),
            Some(SlotState::Requested)
        );
        assert_eq!(
            second.slot_state(StageId::Scaler, NodeRole::Preview),
            Some(SlotState::Error)
        );
        assert_eq!(factory.slot_failures(), 1);
    }

    #[tokio::test]
    async fn missing_optional_pool_marks_slot_unavailable() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        let pools = pools(&[
            (StageId::Sensor, NodeRole::Forward, 4),
            (StageId::Isp3a, NodeRole::Forward, 4),
            (StageId::Isp, NodeRole::Forward, 4),
        ]);
        let factory = FrameFactory::new(pools);
        let frame = factory
            .build(
                FrameStrategy::Internal,
                &g,
                FrameRequest::new(Arc::new(ControlMetadata::new())).retain_bayer(true),
            )
            .unwrap();
        assert_eq!(frame.frame_type(), FrameType::Internal);
        assert_eq!(
            frame.slot_state(StageId::Sensor, NodeRole::Bayer),
            Some(SlotState::Error)
        );
        assert_eq!(factory.slot_failures(), 0);
    }

    #[tokio::test]
    async fn exhausted_raw_pool_is_reported_per_frame() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        let pools = pools(&[
            (StageId::Sensor, NodeRole::Forward, 4),
            (StageId::Isp3a, NodeRole::Forward, 4),
            (StageId::Isp, NodeRole::Forward, 4),
            (StageId::Sensor, NodeRole::Bayer, 1),
        ]);
        let factory = FrameFactory::new(pools);
        let request =
            || FrameRequest::new(Arc::new(ControlMetadata::new())).retain_bayer(true);
        let first = factory
            .build(FrameStrategy::Internal, &g, request())
            .unwrap();
        let second = factory
            .build(FrameStrategy::Internal, &g, request())
            .unwrap();
        assert_eq!(
            first.slot_state(StageId::Sensor, NodeRole::Bayer),
            Some(SlotState::Requested)
        );
        assert_eq!(
            second.slot_state(StageId::Sensor, NodeRole::Bayer),
            Some(SlotState::Error)
        );
        assert!(second.take_retained(NodeRole::Bayer).is_none());
        let io = second.begin(StageId::Sensor).unwrap();
        second.finish(StageId::Sensor, io, Ok(())).unwrap();
        let (stage, state, buffer) = second.take_retained(NodeRole::Bayer).unwrap();
        assert_eq!((stage, state), (StageId::Sensor, SlotState::Error));
        assert!(buffer.is_none());
        assert_eq!(factory.slot_failures(), 0);
    }

    #[tokio::test]
    async fn reprocess_frame_takes_sources_and_enables_jpeg() {
        let g = graph(GraphSpec::reprocessing());
        let pools = pools(&[
            (StageId::ReprocIsp, NodeRole::Forward, 2),
            (StageId::ReprocScaler, NodeRole::Forward, 2),
            (StageId::ReprocJpeg, NodeRole::Jpeg, 2),
            (StageId::Sensor, NodeRole::Bayer, 2),
        ]);
        let raw = pools
            .try_acquire(&BufferTag::new(StageId::Sensor, NodeRole::Bayer))
            .unwrap();
        let factory = FrameFactory::new(Arc::clone(&pools));
        let frame = factory
            .build(
                FrameStrategy::Reprocess,
                &g,
                FrameRequest::new(Arc::new(ControlMetadata::new()))
                    .targets(vec![Target {
                        stream: StreamId(2),
                        role: StreamRole::Jpeg,
                    }])
                    .sources(vec![raw]),
            )
            .unwrap();
        assert!(frame.intent().contains(CaptureIntent::REPROCESS | CaptureIntent::STALL));
        assert_eq!(frame.entity_state(StageId::ReprocJpeg), Some(EntityState::Requested));
        let io = frame.begin(StageId::ReprocIsp).unwrap();
        assert_eq!(io.inputs.len(), 1);
    }

    #[tokio::test]
    async fn wrong_graph_is_a_protocol_error() {
        let g = graph(GraphSpec::reprocessing());
        let factory = FrameFactory::new(Arc::new(PoolSet::new()));
        let err = factory
            .build(
                FrameStrategy::Preview,
                &g,
                FrameRequest::new(Arc::new(ControlMetadata::new())),
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn vision_toggle_enables_vision_stage() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        let factory = FrameFactory::new(preview_pools(2));
        let frame = factory
            .build(
                FrameStrategy::Preview,
                &g,
                FrameRequest::new(Arc::new(ControlMetadata::new().with_vision(true)))
                    .targets(vec![preview_target()]),
            )
            .unwrap();
        assert!(frame.intent().contains(CaptureIntent::VISION));
        assert_eq!(frame.entity_state(StageId::Vision), Some(EntityState::Requested));
        assert_eq!(
            frame.slot_state(StageId::Scaler, NodeRole::Downscale),
            Some(SlotState::Requested)
        );
    }
}
