//! Pipeline graphs.
//!
//! A [`GraphSpec`] is the static topology of one [`GraphKind`], decided once per
//! configuration from the [`SessionConfig`]. A [`PipelineGraph`] instantiates it: one
//! [`Stage`] per node, latched enable flags, and start / stop in dependency order.
//!
//! # Preview topology
//!
//! ```text
//! Sensor ─▶ Isp3a ──────────────┐
//!                               ├─▶ (Sync) ─▶ Isp ─▶ Scaler ─┬─▶ streams
//! (SensorSecondary ─▶ Isp3aSecondary) ┘                      ├─Downscale─▶ Vision
//!                                                           └─Forward──▶ Jpeg   (no reprocessing)
//! ```
//!
//! # Reprocessing topology
//!
//! ```text
//! ReprocIsp ─▶ ReprocScaler ─▶ ReprocJpeg
//! ```
//!
//! Disabled stages are bypassed along their Forward edges when a frame is planned.

use cam_core::{
    CamError, CamResult, DualMode, GraphKind, NodeRole, ReprocessingMode, SessionConfig, StageId,
    StreamRole, TransformProvider,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::frame::Frame;
use crate::stage::{Stage, StageRouter, StageStats};

//==============================================================================
// Static topology
//==============================================================================

/// One node of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Stage
    pub id: StageId,
    /// Output nodes; the first is the primary role
    pub roles: Vec<NodeRole>,
    /// Enable flag when the graph is built
    pub enabled: bool,
}

impl StageSpec {
    fn new(id: StageId, roles: &[NodeRole], enabled: bool) -> Self {
        Self {
            id,
            roles: roles.to_vec(),
            enabled,
        }
    }
}

/// Directed edge: `from`'s `role` output feeds `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Producer
    pub from: StageId,
    /// Producer output node
    pub role: NodeRole,
    /// Consumer
    pub to: StageId,
}

impl Edge {
    const fn new(from: StageId, role: NodeRole, to: StageId) -> Self {
        Self { from, role, to }
    }
}

/// Static topology of one graph kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSpec {
    /// Graph kind
    pub kind: GraphKind,
    /// Nodes
    pub stages: Vec<StageSpec>,
    /// Edges
    pub edges: Vec<Edge>,
    /// Which node produces each stream role
    pub streams: Vec<(StreamRole, StageId, NodeRole)>,
}

impl GraphSpec {
    /// Streaming graph. Carries the secondary sensor path when `dual` is not Off and an
    /// inline JPEG stage when reprocessing is None.
    #[must_use]
    pub fn preview(config: &SessionConfig) -> Self {
        use NodeRole::*;
        let dual = config.dual;
        let inline_stall = config.reprocessing == ReprocessingMode::None;
        let primary_on = dual != DualMode::Slave;
        let secondary_on = matches!(dual, DualMode::Sync | DualMode::Slave);

        let mut stages = vec![
            StageSpec::new(StageId::Sensor, &[Forward, Raw, Bayer], primary_on),
            StageSpec::new(StageId::Isp3a, &[Forward], primary_on),
        ];
        let mut edges = vec![Edge::new(StageId::Sensor, Forward, StageId::Isp3a)];

        if dual == DualMode::Off {
            edges.push(Edge::new(StageId::Isp3a, Forward, StageId::Isp));
        } else {
            stages.extend([
                StageSpec::new(StageId::SensorSecondary, &[Forward, Bayer], secondary_on),
                StageSpec::new(StageId::Isp3aSecondary, &[Forward], secondary_on),
                StageSpec::new(StageId::Sync, &[Forward], dual == DualMode::Sync),
            ]);
            edges.extend([
                Edge::new(StageId::SensorSecondary, Forward, StageId::Isp3aSecondary),
                Edge::new(StageId::Isp3a, Forward, StageId::Sync),
                Edge::new(StageId::Isp3aSecondary, Forward, StageId::Sync),
                Edge::new(StageId::Sync, Forward, StageId::Isp),
            ]);
        }

        let mut scaler_roles = vec![Preview, Video, Callback, Downscale];
        if inline_stall {
            scaler_roles.extend([YuvStall, Forward]);
        }
        stages.extend([
            StageSpec::new(StageId::Isp, &[Forward], true),
            StageSpec::new(StageId::Scaler, &scaler_roles, true),
            StageSpec::new(StageId::Vision, &[Stats], false),
        ]);
        edges.extend([
            Edge::new(StageId::Isp, Forward, StageId::Scaler),
            Edge::new(StageId::Scaler, Downscale, StageId::Vision),
        ]);

        let mut streams = vec![
            (StreamRole::Preview, StageId::Scaler, Preview),
            (StreamRole::Video, StageId::Scaler, Video),
            (StreamRole::Callback, StageId::Scaler, Callback),
            (StreamRole::Raw, StageId::Sensor, Raw),
        ];
        if inline_stall {
            stages.push(StageSpec::new(StageId::Jpeg, &[Jpeg], false));
            edges.push(Edge::new(StageId::Scaler, Forward, StageId::Jpeg));
            streams.extend([
                (StreamRole::YuvStall, StageId::Scaler, YuvStall),
                (StreamRole::Jpeg, StageId::Jpeg, Jpeg),
            ]);
        }

        Self {
            kind: GraphKind::Preview,
            stages,
            edges,
            streams,
        }
    }

    /// Still-capture graph fed with retained raw buffers or a caller input buffer.
    #[must_use]
    pub fn reprocessing() -> Self {
        use NodeRole::*;
        Self {
            kind: GraphKind::Reprocessing,
            stages: vec![
                StageSpec::new(StageId::ReprocIsp, &[Forward], true),
                StageSpec::new(StageId::ReprocScaler, &[Forward, YuvStall], true),
                StageSpec::new(StageId::ReprocJpeg, &[Jpeg], false),
            ],
            edges: vec![
                Edge::new(StageId::ReprocIsp, Forward, StageId::ReprocScaler),
                Edge::new(StageId::ReprocScaler, Forward, StageId::ReprocJpeg),
            ],
            streams: vec![
                (StreamRole::YuvStall, StageId::ReprocScaler, YuvStall),
                (StreamRole::Jpeg, StageId::ReprocJpeg, Jpeg),
            ],
        }
    }

    /// Sensor straight into the vision stage.
    #[must_use]
    pub fn vision() -> Self {
        use NodeRole::*;
        Self {
            kind: GraphKind::Vision,
            stages: vec![
                StageSpec::new(StageId::Sensor, &[Forward, Raw], true),
                StageSpec::new(StageId::Vision, &[Stats, Preview], true),
            ],
            edges: vec![Edge::new(StageId::Sensor, Forward, StageId::Vision)],
            streams: vec![
                (StreamRole::Preview, StageId::Vision, Preview),
                (StreamRole::Raw, StageId::Sensor, Raw),
            ],
        }
    }

    /// Graphs selected by `config`.
    #[must_use]
    pub fn for_config(config: &SessionConfig) -> Vec<GraphSpec> {
        if config.vision_mode {
            return vec![GraphSpec::vision()];
        }
        let mut specs = vec![GraphSpec::preview(config)];
        if config.reprocessing != ReprocessingMode::None {
            specs.push(GraphSpec::reprocessing());
        }
        specs
    }

    fn stage(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Checks edges and stream nodes and returns the stages in dependency order.
    pub fn validate(&self) -> CamResult<Vec<StageId>> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id) {
                return Err(CamError::Configuration(format!(
                    "{} graph lists stage '{}' twice",
                    self.kind, stage.id
                )));
            }
        }
        for edge in &self.edges {
            let from = self.stage(edge.from).ok_or_else(|| {
                CamError::Configuration(format!("edge from unknown stage '{}'", edge.from))
            })?;
            if self.stage(edge.to).is_none() {
                return Err(CamError::Configuration(format!(
                    "edge to unknown stage '{}'",
                    edge.to
                )));
            }
            if !from.roles.contains(&edge.role) {
                return Err(CamError::Configuration(format!(
                    "stage '{}' has no '{}' output",
                    edge.from, edge.role
                )));
            }
        }
        for (stream, stage, role) in &self.streams {
            let valid = self.stage(*stage).is_some_and(|s| s.roles.contains(role));
            if !valid {
                return Err(CamError::Configuration(format!(
                    "stream role {stream} mapped to missing node {stage}:{role}"
                )));
            }
        }

        // Kahn's algorithm, keeping declaration order among ready nodes
        let mut indegree: BTreeMap<StageId, usize> =
            self.stages.iter().map(|s| (s.id, 0)).collect();
        for edge in &self.edges {
            *indegree.entry(edge.to).or_insert(0) += 1;
        }
        let mut ready: VecDeque<StageId> = self
            .stages
            .iter()
            .filter(|s| indegree.get(&s.id) == Some(&0))
            .map(|s| s.id)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.from == id) {
                if let Some(count) = indegree.get_mut(&edge.to) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(edge.to);
                    }
                }
            }
        }
        if order.len() != self.stages.len() {
            return Err(CamError::Configuration(format!(
                "{} graph contains a cycle",
                self.kind
            )));
        }
        Ok(order)
    }
}

//==============================================================================
// Per-frame plan
//==============================================================================

/// Per-frame enable overrides, applied on top of the graph's latched flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOverrides(BTreeMap<StageId, bool>);

impl StageOverrides {
    /// No overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces `stage` on or off for one frame.
    pub fn set(&mut self, stage: StageId, enabled: bool) {
        self.0.insert(stage, enabled);
    }

    /// Builder form of [`StageOverrides::set`].
    #[must_use]
    pub fn with(mut self, stage: StageId, enabled: bool) -> Self {
        self.set(stage, enabled);
        self
    }

    /// Override for `stage`, if any.
    #[must_use]
    pub fn get(&self, stage: StageId) -> Option<bool> {
        self.0.get(&stage).copied()
    }

    /// Adds every override of `other`, replacing existing ones.
    pub fn merge(&mut self, other: &StageOverrides) {
        self.0.extend(other.0.iter().map(|(k, v)| (*k, *v)));
    }

    /// Whether no override is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Effective wiring of one stage for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPlan {
    /// Stage
    pub stage: StageId,
    /// Enabled for this frame
    pub enabled: bool,
    /// Enabled predecessors
    pub preds: Vec<StageId>,
    /// Outgoing edges after bypass
    pub succs: Vec<(NodeRole, StageId)>,
    /// Output nodes of the stage
    pub roles: Vec<NodeRole>,
}

/// Effective wiring of a whole frame, in dependency order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    /// Graph the plan belongs to
    pub kind: GraphKind,
    /// One entry per stage
    pub entities: Vec<EntityPlan>,
}

impl FramePlan {
    /// Plan entry of `stage`.
    #[must_use]
    pub fn entity(&self, stage: StageId) -> Option<&EntityPlan> {
        self.entities.iter().find(|e| e.stage == stage)
    }

    /// Whether `stage` runs for this frame.
    #[must_use]
    pub fn is_enabled(&self, stage: StageId) -> bool {
        self.entity(stage).is_some_and(|e| e.enabled)
    }
}

//==============================================================================
// Runtime graph
//==============================================================================

/// Instantiated graph with its stage workers.
pub struct PipelineGraph {
    spec: GraphSpec,
    order: Vec<StageId>,
    stages: HashMap<StageId, Arc<Stage>>,
    enabled: HashMap<StageId, AtomicBool>,
    router: Arc<StageRouter>,
    running: tokio::sync::Mutex<bool>,
}

impl PipelineGraph {
    /// Validates `spec` and creates one stopped stage per node.
    pub fn new(
        spec: GraphSpec,
        provider: &dyn TransformProvider,
        router: Arc<StageRouter>,
        queue_depth: usize,
        fence_timeout: Duration,
    ) -> CamResult<Self> {
        let order = spec.validate()?;
        let stages = spec
            .stages
            .iter()
            .map(|s| {
                let stage = Stage::new(
                    s.id,
                    provider.transform_for(s.id),
                    queue_depth,
                    fence_timeout,
                );
                (s.id, Arc::new(stage))
            })
            .collect();
        let enabled = spec
            .stages
            .iter()
            .map(|s| (s.id, AtomicBool::new(s.enabled)))
            .collect();
        info!(graph = %spec.kind, stages = spec.stages.len(), "Pipeline graph built");
        Ok(Self {
            spec,
            order,
            stages,
            enabled,
            router,
            running: tokio::sync::Mutex::new(false),
        })
    }

    /// Graph kind.
    #[must_use]
    pub fn kind(&self) -> GraphKind {
        self.spec.kind
    }

    /// Static topology.
    #[must_use]
    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    /// Stages in dependency order.
    #[must_use]
    pub fn order(&self) -> &[StageId] {
        &self.order
    }

    /// Whether the graph contains `stage`.
    #[must_use]
    pub fn contains(&self, stage: StageId) -> bool {
        self.stages.contains_key(&stage)
    }

    /// Latches a stage flag for frames built from now on.
    pub fn set_enabled(&self, stage: StageId, enabled: bool) -> CamResult<()> {
        let flag = self.enabled.get(&stage).ok_or_else(|| {
            CamError::Configuration(format!("{} graph has no stage '{stage}'", self.spec.kind))
        })?;
        flag.store(enabled, Ordering::SeqCst);
        info!(graph = %self.spec.kind, %stage, enabled, "Stage enable flag changed");
        Ok(())
    }

    /// Current flag of `stage`.
    #[must_use]
    pub fn is_enabled(&self, stage: StageId) -> bool {
        self.enabled
            .get(&stage)
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Output nodes of `stage`.
    #[must_use]
    pub fn node_roles(&self, stage: StageId) -> &[NodeRole] {
        self.spec
            .stage(stage)
            .map(|s| s.roles.as_slice())
            .unwrap_or(&[])
    }

    /// Primary output role of `stage`.
    #[must_use]
    pub fn node_role_for(&self, stage: StageId) -> Option<NodeRole> {
        self.node_roles(stage).first().copied()
    }

    /// Node producing streams of `role`.
    #[must_use]
    pub fn stream_node(&self, role: StreamRole) -> Option<(StageId, NodeRole)> {
        self.spec
            .streams
            .iter()
            .find(|(r, _, _)| *r == role)
            .map(|(_, stage, node)| (*stage, *node))
    }

    /// Every edge of the static topology.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.spec.edges
    }

    /// Wiring for one frame: latched flags, then `overrides`, then bypass of disabled
    /// stages along Forward edges.
    #[must_use]
    pub fn plan(&self, overrides: &StageOverrides) -> FramePlan {
        let enabled: HashMap<StageId, bool> = self
            .order
            .iter()
            .map(|s| (*s, overrides.get(*s).unwrap_or_else(|| self.is_enabled(*s))))
            .collect();
        let is_on = |s: StageId| enabled.get(&s).copied().unwrap_or(false);

        let mut succs: HashMap<StageId, Vec<(NodeRole, StageId)>> = HashMap::new();
        for stage in self.order.iter().copied().filter(|s| is_on(*s)) {
            let mut out = Vec::new();
            for edge in self.spec.edges.iter().filter(|e| e.from == stage) {
                self.resolve(edge.role, edge.to, &is_on, &mut out);
            }
            out.dedup();
            succs.insert(stage, out);
        }

        let entities = self
            .order
            .iter()
            .map(|stage| {
                let on = is_on(*stage);
                let preds = if on {
                    self.order
                        .iter()
                        .filter(|p| {
                            succs
                                .get(p)
                                .is_some_and(|out| out.iter().any(|(_, to)| to == stage))
                        })
                        .copied()
                        .collect()
                } else {
                    Vec::new()
                };
                EntityPlan {
                    stage: *stage,
                    enabled: on,
                    preds,
                    succs: succs.get(stage).cloned().unwrap_or_default(),
                    roles: self.node_roles(*stage).to_vec(),
                }
            })
            .collect();

        FramePlan {
            kind: self.spec.kind,
            entities,
        }
    }

    /// Enabled consumers reached from an edge ending at `to`.
    fn resolve(
        &self,
        role: NodeRole,
        to: StageId,
        is_on: &dyn Fn(StageId) -> bool,
        out: &mut Vec<(NodeRole, StageId)>,
    ) {
        if is_on(to) {
            out.push((role, to));
            return;
        }
        if role != NodeRole::Forward {
            return;
        }
        for edge in self
            .spec
            .edges
            .iter()
            .filter(|e| e.from == to && e.role == NodeRole::Forward)
        {
            self.resolve(role, edge.to, is_on, out);
        }
    }

    /// Starts every stage in dependency order. Idempotent.
    pub async fn start(&self) -> CamResult<()> {
        let mut running = self.running.lock().await;
        if *running {
            return Ok(());
        }
        for id in &self.order {
            if let Some(stage) = self.stages.get(id) {
                stage.start(&self.router).await?;
            }
        }
        *running = true;
        info!(graph = %self.spec.kind, "Pipeline graph started");
        Ok(())
    }

    /// Stops every stage in dependency order, draining their queues. Idempotent.
    ///
    /// Every stage is stopped even if one fails; the first failure is returned.
    pub async fn stop(&self) -> CamResult<()> {
        let mut running = self.running.lock().await;
        if !*running {
            return Ok(());
        }
        let mut first_error = None;
        for id in &self.order {
            if let Some(stage) = self.stages.get(id) {
                if let Err(e) = stage.stop(&self.router).await {
                    warn!(graph = %self.spec.kind, stage = %id, error = %e, "Stage stop failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        *running = false;
        info!(graph = %self.spec.kind, "Pipeline graph stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Whether the graph is started.
    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Pushes `frame` into its root stages.
    pub async fn submit(&self, frame: &Arc<Frame>) {
        let roots = frame.ready_stages();
        self.router.dispatch(frame, roots).await;
    }

    /// While set, stages cancel queued frames.
    pub fn set_flushing(&self, flushing: bool) {
        self.router.set_flushing(flushing);
    }

    /// Counters of every stage, in dependency order.
    pub async fn stage_stats(&self) -> Vec<StageStats> {
        let mut stats = Vec::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(stage) = self.stages.get(id) {
                stats.push(stage.stats().await);
            }
        }
        stats
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("kind", &self.spec.kind)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{FatalLatch, StageMonitor};
    use cam_driver_mock::MockDevice;
    use cam_core::MonitorConfig;
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

    #[test]
    fn preview_order_is_topological() {
        let spec = GraphSpec::preview(&SessionConfig::default());
        let order = spec.validate().unwrap();
        let pos = |s: StageId| order.iter().position(|x| *x == s).unwrap();
        assert!(pos(StageId::Sensor) < pos(StageId::Isp3a));
        assert!(pos(StageId::Isp3a) < pos(StageId::Isp));
        assert!(pos(StageId::Isp) < pos(StageId::Scaler));
        assert!(pos(StageId::Scaler) < pos(StageId::Vision));
        assert!(!order.contains(&StageId::Jpeg));
    }

    #[test]
    fn selection_follows_config() {
        let mut config = SessionConfig::default();
        let kinds: Vec<_> = GraphSpec::for_config(&config).iter().map(|g| g.kind).collect();
        assert_eq!(kinds, vec![GraphKind::Preview, GraphKind::Reprocessing]);

        config.reprocessing = ReprocessingMode::None;
        let specs = GraphSpec::for_config(&config);
        assert_eq!(specs.len(), 1);
        assert!(specs[0].stage(StageId::Jpeg).is_some());

        config.vision_mode = true;
        let kinds: Vec<_> = GraphSpec::for_config(&config).iter().map(|g| g.kind).collect();
        assert_eq!(kinds, vec![GraphKind::Vision]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut spec = GraphSpec::reprocessing();
        spec.edges
            .push(Edge::new(StageId::ReprocScaler, NodeRole::Forward, StageId::ReprocIsp));
        assert!(matches!(spec.validate(), Err(CamError::Configuration(_))));
    }

    #[test]
    fn unknown_edge_role_is_rejected() {
        let mut spec = GraphSpec::vision();
        spec.edges
            .push(Edge::new(StageId::Sensor, NodeRole::Jpeg, StageId::Vision));
        assert!(spec.validate().is_err());
    }

    #[tokio::test]
    async fn node_queries() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        assert_eq!(g.node_role_for(StageId::Sensor), Some(NodeRole::Forward));
        assert_eq!(g.node_role_for(StageId::Vision), Some(NodeRole::Stats));
        assert_eq!(
            g.stream_node(StreamRole::Preview),
            Some((StageId::Scaler, NodeRole::Preview))
        );
        assert_eq!(g.stream_node(StreamRole::Jpeg), None);
        assert!(g.set_enabled(StageId::ReprocJpeg, true).is_err());
    }

    #[tokio::test]
    async fn disabled_stage_is_bypassed() {
        let g = graph(GraphSpec::preview(&SessionConfig::default()));
        g.set_enabled(StageId::Isp3a, false).unwrap();
        let plan = g.plan(&StageOverrides::new());

        let sensor = plan.entity(StageId::Sensor).unwrap();
        assert_eq!(sensor.succs, vec![(NodeRole::Forward, StageId::Isp)]);
        assert!(!plan.is_enabled(StageId::Isp3a));
        assert_eq!(plan.entity(StageId::Isp).unwrap().preds, vec![StageId::Sensor]);
        // Vision off by default: Downscale edge has no consumer
        assert_eq!(
            plan.entity(StageId::Scaler).unwrap().succs,
            Vec::<(NodeRole, StageId)>::new()
        );

        let plan = g.plan(&StageOverrides::new().with(StageId::Vision, true));
        assert_eq!(
            plan.entity(StageId::Scaler).unwrap().succs,
            vec![(NodeRole::Downscale, StageId::Vision)]
        );
    }

    #[tokio::test]
    async fn dual_modes_route_through_sync() {
        let config = SessionConfig {
            dual: DualMode::Sync,
            ..SessionConfig::default()
        };
        let g = graph(GraphSpec::preview(&config));
        let plan = g.plan(&StageOverrides::new());
        let mut sync_preds = plan.entity(StageId::Sync).unwrap().preds.clone();
        sync_preds.sort();
        assert_eq!(sync_preds, vec![StageId::Isp3a, StageId::Isp3aSecondary]);

        let config = SessionConfig {
            dual: DualMode::Master,
            ..SessionConfig::default()
        };
        let g = graph(GraphSpec::preview(&config));
        let plan = g.plan(&StageOverrides::new());
        assert!(!plan.is_enabled(StageId::SensorSecondary));
        assert_eq!(
            plan.entity(StageId::Isp3a).unwrap().succs,
            vec![(NodeRole::Forward, StageId::Isp)]
        );

        let config = SessionConfig {
            dual: DualMode::Slave,
            ..SessionConfig::default()
        };
        let g = graph(GraphSpec::preview(&config));
        let plan = g.plan(&StageOverrides::new());
        assert!(!plan.is_enabled(StageId::Sensor));
        assert_eq!(plan.entity(StageId::Isp).unwrap().preds, vec![StageId::Isp3aSecondary]);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let device = MockDevice::new();
        let (tx, _rx) = mpsc::channel(8);
        let router = Arc::new(StageRouter::new(
            tx,
            StageMonitor::new(&MonitorConfig::default()),
            Arc::new(FatalLatch::default()),
        ));
        let g = PipelineGraph::new(
            GraphSpec::reprocessing(),
            &device,
            router,
            4,
            Duration::from_millis(10),
        )
        .unwrap();

        g.start().await.unwrap();
        g.start().await.unwrap();
        assert!(g.is_running().await);
        assert!(device.is_started(StageId::ReprocJpeg));

        g.stop().await.unwrap();
        g.stop().await.unwrap();
        assert!(!g.is_running().await);
        assert!(!device.is_started(StageId::ReprocIsp));
        assert!(g.stage_stats().await.iter().all(|s| !s.running));
    }
}
