//! Frame: one traversal of a pipeline graph.
//!
//! A [`Frame`] carries one [`StageEntity`] per stage of the graph it was built against.
//! Entity state, slot buffers and the completion flag all sit behind one frame-local lock,
//! so concurrent stage workers and the result worker always observe a consistent frame.
//!
//! # Entity lifecycle
//!
//! ```text
//! NotRequested                       (stage disabled when the frame was built)
//! Requested ──begin──▶ Processing ──finish──▶ Complete | Error
//!     │                                         ▲
//!     └──────────── abort / force_complete ─────┘
//! ```
//!
//! # Buffer flow
//!
//! ```text
//! pool ──▶ DstSlot ──finish──▶ successor sources ──next finish──▶ dropped (back to pool)
//!                       └──▶ stream delivery / raw retention (taken by the result worker)
//! ```

use cam_core::{
    CamError, CamResult, CaptureIntent, ControlMetadata, EntityState, FrameNumber, FrameType,
    GraphKind, NodeRole, OutputSlot, RequestKey, ResultMetadata, SlotState, StageError, StageId,
    StageIo, StreamId,
};
use cam_pool::Buffer;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

//==============================================================================
// Slots and entities
//==============================================================================

/// One destination of a stage entity.
#[derive(Debug)]
pub struct DstSlot {
    state: SlotState,
    buffer: Option<Buffer>,
    stream: Option<StreamId>,
    taken: bool,
}

impl DstSlot {
    /// Slot holding a freshly acquired buffer.
    #[must_use]
    pub fn requested(buffer: Buffer, stream: Option<StreamId>) -> Self {
        Self {
            state: SlotState::Requested,
            buffer: Some(buffer),
            stream,
            taken: false,
        }
    }

    /// Slot whose buffer could not be acquired. Already terminal.
    #[must_use]
    pub fn unavailable(stream: Option<StreamId>) -> Self {
        Self {
            state: SlotState::Error,
            buffer: None,
            stream,
            taken: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Stream this slot is delivered to, if any.
    #[must_use]
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Whether a buffer is still held by the slot.
    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }
}

/// Per-(frame, stage) record.
#[derive(Debug)]
pub struct StageEntity {
    stage: StageId,
    state: EntityState,
    pending_inputs: usize,
    sources: Vec<Buffer>,
    input_valid: bool,
    slots: BTreeMap<NodeRole, DstSlot>,
    succs: Vec<(NodeRole, StageId)>,
    error: Option<StageError>,
}

impl StageEntity {
    /// Entity of a stage that is disabled for this frame.
    #[must_use]
    pub fn not_requested(stage: StageId) -> Self {
        Self {
            stage,
            state: EntityState::NotRequested,
            pending_inputs: 0,
            sources: Vec::new(),
            input_valid: true,
            slots: BTreeMap::new(),
            succs: Vec::new(),
            error: None,
        }
    }

    /// Enabled entity waiting for `inputs` predecessors and feeding `succs`.
    #[must_use]
    pub fn requested(stage: StageId, inputs: usize, succs: Vec<(NodeRole, StageId)>) -> Self {
        Self {
            stage,
            state: EntityState::Requested,
            pending_inputs: inputs,
            sources: Vec::new(),
            input_valid: true,
            slots: BTreeMap::new(),
            succs,
            error: None,
        }
    }

    /// Root input buffers (selected raw frames or a caller input).
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<Buffer>) -> Self {
        self.sources = sources;
        self
    }

    /// Adds a destination slot.
    #[must_use]
    pub fn with_slot(mut self, role: NodeRole, slot: DstSlot) -> Self {
        self.slots.insert(role, slot);
        self
    }

    /// Stage this entity belongs to.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EntityState {
        self.state
    }

    fn is_enabled(&self) -> bool {
        self.state != EntityState::NotRequested
    }

    fn is_ready(&self) -> bool {
        self.state == EntityState::Requested && self.pending_inputs == 0
    }

    /// Marks every remaining slot as failed and drops the buffers it still holds.
    fn fail(&mut self, error: StageError) {
        self.state = EntityState::Error;
        self.sources.clear();
        for slot in self.slots.values_mut() {
            if slot.state == SlotState::Requested {
                slot.state = SlotState::Error;
                slot.buffer = None;
            }
        }
        self.error = Some(error);
    }
}

//==============================================================================
// Frame
//==============================================================================

/// Identity and latched attributes of a frame.
#[derive(Debug, Clone)]
pub struct FrameParams {
    /// Session-wide sequence number
    pub number: FrameNumber,
    /// Kind of traversal
    pub frame_type: FrameType,
    /// Graph the frame was built against
    pub graph: GraphKind,
    /// Linked request, if any
    pub request: Option<RequestKey>,
    /// Requested outputs and behaviours
    pub intent: CaptureIntent,
    /// Controls in effect when the frame was created
    pub control: Arc<ControlMetadata>,
}

/// What finishing one entity changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StageCompletion {
    /// Successor stages whose inputs are now all present
    pub ready: Vec<StageId>,
    /// True for exactly one caller: the one whose finish completed the frame
    pub frame_complete: bool,
}

/// Stream output taken from a frame for delivery.
#[derive(Debug)]
pub struct StreamOutput {
    /// Target stream
    pub stream: StreamId,
    /// Final slot state
    pub state: SlotState,
    /// Buffer, present only when the slot completed
    pub buffer: Option<Buffer>,
}

struct FrameInner {
    entities: BTreeMap<StageId, StageEntity>,
    result: ResultMetadata,
    partials: Vec<ResultMetadata>,
    complete: bool,
    removed: bool,
}

impl FrameInner {
    fn all_terminal(&self) -> bool {
        self.entities
            .values()
            .filter(|e| e.is_enabled())
            .all(|e| e.state.is_terminal())
    }

    /// Flips the completion flag. Returns true only on the transition.
    fn update_complete(&mut self) -> bool {
        if !self.complete && self.all_terminal() {
            self.complete = true;
            return true;
        }
        false
    }
}

/// One traversal of a graph.
pub struct Frame {
    params: FrameParams,
    created_at: Instant,
    inner: Mutex<FrameInner>,
}

impl Frame {
    /// Builds a frame from its entities.
    #[must_use]
    pub fn new(params: FrameParams, entities: Vec<StageEntity>) -> Self {
        let mut inner = FrameInner {
            entities: entities.into_iter().map(|e| (e.stage, e)).collect(),
            result: ResultMetadata::default(),
            partials: Vec::new(),
            complete: false,
            removed: false,
        };
        inner.update_complete();
        Self {
            params,
            created_at: Instant::now(),
            inner: Mutex::new(inner),
        }
    }

    /// Sequence number.
    #[must_use]
    pub fn number(&self) -> FrameNumber {
        self.params.number
    }

    /// Frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.params.frame_type
    }

    /// Graph this frame belongs to.
    #[must_use]
    pub fn graph(&self) -> GraphKind {
        self.params.graph
    }

    /// Linked request.
    #[must_use]
    pub fn request(&self) -> Option<RequestKey> {
        self.params.request
    }

    /// Capture intent.
    #[must_use]
    pub fn intent(&self) -> CaptureIntent {
        self.params.intent
    }

    /// Controls latched at creation.
    #[must_use]
    pub fn control(&self) -> &Arc<ControlMetadata> {
        &self.params.control
    }

    /// Time since the frame was built.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Enabled stages whose inputs are all present and that have not started.
    #[must_use]
    pub fn ready_stages(&self) -> Vec<StageId> {
        self.inner
            .lock()
            .entities
            .values()
            .filter(|e| e.is_ready())
            .map(|e| e.stage)
            .collect()
    }

    /// Stages enabled for this frame.
    #[must_use]
    pub fn enabled_stages(&self) -> Vec<StageId> {
        self.inner
            .lock()
            .entities
            .values()
            .filter(|e| e.is_enabled())
            .map(|e| e.stage)
            .collect()
    }

    /// State of one entity.
    #[must_use]
    pub fn entity_state(&self, stage: StageId) -> Option<EntityState> {
        self.inner.lock().entities.get(&stage).map(|e| e.state)
    }

    /// State of one destination slot.
    #[must_use]
    pub fn slot_state(&self, stage: StageId, role: NodeRole) -> Option<SlotState> {
        self.inner
            .lock()
            .entities
            .get(&stage)
            .and_then(|e| e.slots.get(&role))
            .map(DstSlot::state)
    }

    /// Error recorded for a failed entity.
    #[must_use]
    pub fn entity_error(&self, stage: StageId) -> Option<StageError> {
        self.inner
            .lock()
            .entities
            .get(&stage)
            .and_then(|e| e.error.clone())
    }

    /// Whether every enabled entity is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    fn transition_error(&self, stage: StageId, from: EntityState, to: EntityState) -> CamError {
        CamError::EntityTransition {
            frame: self.params.number,
            stage,
            from,
            to,
        }
    }

    /// Moves an entity Requested → Processing and hands its buffers to the worker.
    pub fn begin(&self, stage: StageId) -> CamResult<StageIo> {
        let mut inner = self.inner.lock();
        let entity = inner.entities.get_mut(&stage).ok_or_else(|| {
            self.transition_error(stage, EntityState::NotRequested, EntityState::Processing)
        })?;
        if !entity.is_ready() {
            return Err(self.transition_error(stage, entity.state, EntityState::Processing));
        }
        entity.state = EntityState::Processing;

        let inputs = std::mem::take(&mut entity.sources);
        let outputs = entity
            .slots
            .iter_mut()
            .filter(|(_, slot)| slot.state == SlotState::Requested)
            .filter_map(|(role, slot)| slot.buffer.take().map(|b| OutputSlot::new(*role, b)))
            .collect();
        trace!(frame = %self.params.number, %stage, "Entity processing");

        Ok(StageIo::new(
            self.params.number,
            stage,
            Arc::clone(&self.params.control),
            inputs,
            entity.input_valid,
            outputs,
        ))
    }

    /// Moves an entity Processing → Complete | Error and forwards its edge buffers.
    ///
    /// A failed transform or a failed output slot makes the matching successor inputs
    /// invalid. Input buffers are returned to their pools here.
    pub fn finish(
        &self,
        stage: StageId,
        io: StageIo,
        result: Result<(), StageError>,
    ) -> CamResult<StageCompletion> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let target = if result.is_ok() {
            EntityState::Complete
        } else {
            EntityState::Error
        };
        let entity = inner
            .entities
            .get_mut(&stage)
            .ok_or_else(|| self.transition_error(stage, EntityState::NotRequested, target))?;
        if entity.state != EntityState::Processing {
            return Err(self.transition_error(stage, entity.state, target));
        }

        let (inputs, outputs, metadata, partial) = io.into_parts();
        drop(inputs);

        let failed = result.is_err();
        for output in outputs {
            if let Some(slot) = entity.slots.get_mut(&output.role) {
                if failed || output.failed {
                    slot.state = SlotState::Error;
                } else {
                    slot.state = SlotState::Complete;
                    slot.buffer = Some(output.buffer);
                }
            }
        }
        for slot in entity.slots.values_mut() {
            if slot.state == SlotState::Requested {
                slot.state = SlotState::Error;
            }
        }
        entity.state = target;
        entity.error = result.err();

        let mut handoff = Vec::with_capacity(entity.succs.len());
        for (role, succ) in entity.succs.clone() {
            let buffer = match entity.slots.get_mut(&role) {
                Some(slot) if slot.state == SlotState::Complete && !slot.taken => {
                    slot.taken = true;
                    slot.buffer.take()
                }
                _ => None,
            };
            let valid = target == EntityState::Complete
                && entity
                    .slots
                    .get(&role)
                    .map_or(true, |s| s.state == SlotState::Complete);
            handoff.push((succ, buffer, valid));
        }

        inner.result.merge(&metadata);
        if let Some(partial) = partial {
            inner.partials.push(partial);
        }

        let mut completion = StageCompletion::default();
        for (succ, buffer, valid) in handoff {
            let Some(next) = inner.entities.get_mut(&succ) else {
                continue;
            };
            if next.state != EntityState::Requested {
                continue;
            }
            if let Some(buffer) = buffer {
                next.sources.push(buffer);
            }
            next.input_valid &= valid;
            next.pending_inputs = next.pending_inputs.saturating_sub(1);
            if next.pending_inputs == 0 && !completion.ready.contains(&succ) {
                completion.ready.push(succ);
            }
        }

        completion.frame_complete = inner.update_complete();
        trace!(
            frame = %self.params.number,
            %stage,
            state = %target,
            complete = completion.frame_complete,
            "Entity finished"
        );
        Ok(completion)
    }

    /// Fails a ready entity that cannot be dispatched to its worker.
    pub fn abort(&self, stage: StageId, error: StageError) -> CamResult<StageCompletion> {
        let io = self.begin(stage)?;
        self.finish(stage, io, Err(error))
    }

    /// Fails every entity that has not reached a terminal state.
    ///
    /// Used once no worker can touch the frame any more. Returns true when this call
    /// completed the frame.
    pub fn force_complete(&self) -> bool {
        let mut inner = self.inner.lock();
        for entity in inner.entities.values_mut() {
            if entity.is_enabled() && !entity.state.is_terminal() {
                let stage = entity.stage;
                entity.fail(StageError::cancelled(stage));
            }
        }
        inner.update_complete()
    }

    /// Result metadata merged from every finished stage.
    #[must_use]
    pub fn result_metadata(&self) -> ResultMetadata {
        self.inner.lock().result.clone()
    }

    /// Sensor timestamp, once a sensor-side stage published it.
    #[must_use]
    pub fn shutter_timestamp(&self) -> Option<u64> {
        self.inner.lock().result.sensor_timestamp_ns
    }

    /// Partial results not yet taken.
    #[must_use]
    pub fn take_partials(&self) -> Vec<ResultMetadata> {
        std::mem::take(&mut self.inner.lock().partials)
    }

    /// Stream outputs of terminal entities that were not taken before.
    #[must_use]
    pub fn take_stream_outputs(&self) -> Vec<StreamOutput> {
        let mut inner = self.inner.lock();
        let mut outputs = Vec::new();
        for entity in inner.entities.values_mut() {
            if !entity.state.is_terminal() {
                continue;
            }
            for slot in entity.slots.values_mut() {
                let Some(stream) = slot.stream else {
                    continue;
                };
                if slot.taken || !slot.state.is_terminal() {
                    continue;
                }
                slot.taken = true;
                outputs.push(StreamOutput {
                    stream,
                    state: slot.state,
                    buffer: slot.buffer.take(),
                });
            }
        }
        outputs
    }

    /// Takes the output for `role` from the first terminal entity that has one.
    ///
    /// Returns the slot state and, when it completed, the buffer.
    #[must_use]
    pub fn take_retained(&self, role: NodeRole) -> Option<(StageId, SlotState, Option<Buffer>)> {
        let mut inner = self.inner.lock();
        inner.entities.values_mut().find_map(|entity| {
            if !entity.state.is_terminal() {
                return None;
            }
            let stage = entity.stage;
            let slot = entity.slots.get_mut(&role)?;
            if slot.taken {
                return None;
            }
            slot.taken = true;
            Some((stage, slot.state, slot.buffer.take()))
        })
    }

    /// Marks a completed frame as removed from its in-flight list.
    ///
    /// Succeeds exactly once, and only after completion.
    pub fn mark_removed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.complete && !inner.removed {
            inner.removed = true;
            return true;
        }
        false
    }

    /// Returns every buffer the frame still holds to its pool. Returns how many were held.
    pub fn release_buffers(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for entity in inner.entities.values_mut() {
            released += entity.sources.len();
            entity.sources.clear();
            for slot in entity.slots.values_mut() {
                if slot.buffer.take().is_some() {
                    released += 1;
                }
                slot.taken = true;
            }
        }
        released
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("number", &self.params.number)
            .field("type", &self.params.frame_type)
            .field("graph", &self.params.graph)
            .field("request", &self.params.request)
            .field("complete", &self.is_complete())
            .finish()
    }
}
