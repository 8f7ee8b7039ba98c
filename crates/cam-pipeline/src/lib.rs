//! `cam-pipeline`
//!
//! Turns capture requests into frames, runs them through a DAG of hardware stages and
//! reports results back in request order.
//!
//! ## Architecture
//!
//! ```text
//!   Session ─┬─ RequestTracker   admission, pacing permits, waiting / capture lists
//!            ├─ FrameFactory     frame construction strategies, buffer slots
//!            ├─ PipelineGraph(s) preview / reprocessing / vision, one task per Stage
//!            ├─ InFlightLists    frames per graph kind, removed exactly once
//!            ├─ CaptureSelector  raw buffer retention for still capture
//!            └─ ResultDispatcher shutter order, partials, buffers, final metadata
//! ```
//!
//! ## Key Types
//!
//! - [`Session`]: configure / submit_request / flush surface
//! - [`Frame`]: one traversal of a graph with its per-stage entities
//! - [`ResultSink`]: callback surface, [`ChannelSink`] forwards to a channel
//! - [`StageMonitor`]: heartbeats and failure history of the stage workers

pub mod dispatcher;
pub mod factory;
pub mod frame;
pub mod graph;
pub mod inflight;
pub mod monitor;
pub mod request;
pub mod selector;
pub mod session;
pub mod stage;

pub use dispatcher::{
    BufferStatus, CaptureResult, ChannelSink, DispatcherStats, ErrorCode, Notify,
    ResultDispatcher, ResultSink, SessionEvent, StreamBuffer,
};
pub use factory::{FrameFactory, FrameRequest, FrameStrategy, Target};
pub use frame::{DstSlot, Frame, FrameParams, StageCompletion, StageEntity, StreamOutput};
pub use graph::{Edge, EntityPlan, FramePlan, GraphSpec, PipelineGraph, StageOverrides, StageSpec};
pub use inflight::InFlightLists;
pub use monitor::{
    ErrorSeverity, FatalLatch, StageFault, StageHealth, StageMonitor, SystemHealth,
};
pub use request::{CaptureJob, PendingRequest, Request, RequestTracker, TrackerStats};
pub use selector::{CaptureSelector, Selection, SelectorStats};
pub use session::{Session, SessionState, SessionStats};
pub use stage::{ResultMessage, Stage, StageEvent, StageRouter, StageStats};
