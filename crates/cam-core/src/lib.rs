//! `cam-core`
//!
//! Shared vocabulary of the capture pipeline: identifiers, state enums, metadata, the
//! session configuration, the error taxonomy, and the device transform trait that stage
//! workers drive.
//!
//! ## Key Types
//!
//! - [`StageId`], [`NodeRole`], [`BufferTag`]: address stages and their outputs
//! - [`EntityState`], [`SlotState`]: per-(frame, stage) state machine
//! - [`SessionConfig`]: layered configuration loaded with `figment`
//! - [`CamError`]: error type with admission / stage / resource / fatal categories
//! - [`StageTransform`]: seam to the device-specific work

pub mod config;
pub mod error;
pub mod metadata;
pub mod stream;
pub mod transform;
pub mod types;

pub use config::{
    DualMode, MonitorConfig, PoolOverride, PoolPolicy, ReprocessingMode, SelectorConfig,
    SessionConfig, TimeoutConfig,
};
pub use error::{CamError, CamResult, RejectReason, StageError, StageErrorKind};
pub use metadata::{ControlMetadata, ResultMetadata};
pub use stream::{StreamConfig, StreamSet};
pub use transform::{OutputSlot, StageIo, StageTransform, TransformProvider};
pub use types::{
    BufferTag, CaptureIntent, EntityState, FrameNumber, FrameType, GraphKind, NodeRole,
    RequestKey, SlotState, StageId, StreamId, StreamRole,
};
