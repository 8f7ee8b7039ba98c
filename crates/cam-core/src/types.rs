//! Identifiers and state enums shared by every pipeline component.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

//==============================================================================
// Identities
//==============================================================================

/// Monotonically increasing frame sequence number, shared by every graph of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameNumber(pub u64);

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied request sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey(pub u64);

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-assigned stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

//==============================================================================
// Stages and nodes
//==============================================================================

/// One hardware processing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Sensor readout (bayer capture)
    Sensor,
    /// Demosaic and 3A statistics
    Isp3a,
    /// Main image signal processor
    Isp,
    /// Scaler / format converter, fans out to the output streams
    Scaler,
    /// Vision / feature detection side stage
    Vision,
    /// Inline JPEG encoder when no reprocessing graph exists
    Jpeg,
    /// Secondary sensor of a dual-sensor module
    SensorSecondary,
    /// 3A stage of the secondary path
    Isp3aSecondary,
    /// Dual-path synchronisation / fusion
    Sync,
    /// ISP pass of the still reprocessing graph
    ReprocIsp,
    /// Scaler pass of the still reprocessing graph
    ReprocScaler,
    /// Encoder of the still reprocessing graph
    ReprocJpeg,
}

impl StageId {
    /// Every stage, in a stable order.
    pub const ALL: [StageId; 12] = [
        StageId::Sensor,
        StageId::Isp3a,
        StageId::Isp,
        StageId::Scaler,
        StageId::Vision,
        StageId::Jpeg,
        StageId::SensorSecondary,
        StageId::Isp3aSecondary,
        StageId::Sync,
        StageId::ReprocIsp,
        StageId::ReprocScaler,
        StageId::ReprocJpeg,
    ];

    /// Short lowercase name used in logs and pool tags.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Sensor => "sensor",
            StageId::Isp3a => "isp3a",
            StageId::Isp => "isp",
            StageId::Scaler => "scaler",
            StageId::Vision => "vision",
            StageId::Jpeg => "jpeg",
            StageId::SensorSecondary => "sensor_secondary",
            StageId::Isp3aSecondary => "isp3a_secondary",
            StageId::Sync => "sync",
            StageId::ReprocIsp => "reproc_isp",
            StageId::ReprocScaler => "reproc_scaler",
            StageId::ReprocJpeg => "reproc_jpeg",
        }
    }

    /// Stages that stamp sensor timing into the frame result.
    #[must_use]
    pub fn produces_shutter(self) -> bool {
        matches!(
            self,
            StageId::Sensor | StageId::SensorSecondary | StageId::ReprocIsp
        )
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses one physical output of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Main output consumed by the next stage
    Forward,
    /// Raw output delivered to a RAW stream
    Raw,
    /// Raw output retained for still reprocessing
    Bayer,
    /// Preview stream output
    Preview,
    /// Video stream output
    Video,
    /// YUV callback stream output
    Callback,
    /// Downscaled copy for the vision stage
    Downscale,
    /// Statistics / detection output
    Stats,
    /// Full-size YUV for a stall stream
    YuvStall,
    /// Encoded JPEG
    Jpeg,
}

impl NodeRole {
    /// Short lowercase name used in logs and pool tags.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Forward => "forward",
            NodeRole::Raw => "raw",
            NodeRole::Bayer => "bayer",
            NodeRole::Preview => "preview",
            NodeRole::Video => "video",
            NodeRole::Callback => "callback",
            NodeRole::Downscale => "downscale",
            NodeRole::Stats => "stats",
            NodeRole::YuvStall => "yuv_stall",
            NodeRole::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a buffer pool: which stage output the buffers belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferTag {
    /// Producing stage
    pub stage: StageId,
    /// Output node of that stage
    pub role: NodeRole,
}

impl BufferTag {
    /// Creates a tag.
    #[must_use]
    pub const fn new(stage: StageId, role: NodeRole) -> Self {
        Self { stage, role }
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.role)
    }
}

//==============================================================================
// Streams
//==============================================================================

/// What a configured stream is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    /// Viewfinder output
    Preview,
    /// Recording output
    Video,
    /// Non-stalling YUV for the application
    Callback,
    /// Unprocessed sensor output
    Raw,
    /// Still JPEG (stalling)
    Jpeg,
    /// Full-size still YUV (stalling)
    YuvStall,
    /// Caller-provided input buffer for reprocessing
    ZslInput,
}

impl StreamRole {
    /// Outputs that need the still-capture path.
    #[must_use]
    pub fn is_stall(self) -> bool {
        matches!(self, StreamRole::Jpeg | StreamRole::YuvStall)
    }

    /// Input streams carry buffers from the caller into the pipeline.
    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(self, StreamRole::ZslInput)
    }

    /// Intent bit implied by requesting this stream.
    #[must_use]
    pub fn intent(self) -> CaptureIntent {
        match self {
            StreamRole::Preview => CaptureIntent::PREVIEW,
            StreamRole::Video => CaptureIntent::VIDEO,
            StreamRole::Callback => CaptureIntent::CALLBACK,
            StreamRole::Raw => CaptureIntent::RAW,
            StreamRole::Jpeg | StreamRole::YuvStall => CaptureIntent::STALL,
            StreamRole::ZslInput => CaptureIntent::REPROCESS,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamRole::Preview => "preview",
            StreamRole::Video => "video",
            StreamRole::Callback => "callback",
            StreamRole::Raw => "raw",
            StreamRole::Jpeg => "jpeg",
            StreamRole::YuvStall => "yuv_stall",
            StreamRole::ZslInput => "zsl_input",
        };
        f.write_str(label)
    }
}

bitflags! {
    /// Outputs and behaviours requested for one frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CaptureIntent: u32 {
        /// Preview output
        const PREVIEW = 1 << 0;
        /// Video output
        const VIDEO = 1 << 1;
        /// YUV callback output
        const CALLBACK = 1 << 2;
        /// Raw sensor output
        const RAW = 1 << 3;
        /// Stalling still output (JPEG / full-size YUV)
        const STALL = 1 << 4;
        /// Reprocessing from a caller input buffer
        const REPROCESS = 1 << 5;
        /// Vision stage requested
        const VISION = 1 << 6;
        /// Multi-frame long exposure accumulation
        const LONG_EXPOSURE = 1 << 7;
    }
}

//==============================================================================
// Graphs and frames
//==============================================================================

/// Named pipeline topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    /// Streaming graph (sensor to scaler, optional secondary path)
    Preview,
    /// Still-capture graph fed with retained raw buffers
    Reprocessing,
    /// Sensor plus vision stage only
    Vision,
}

impl fmt::Display for GraphKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GraphKind::Preview => "preview",
            GraphKind::Reprocessing => "reprocessing",
            GraphKind::Vision => "vision",
        };
        f.write_str(label)
    }
}

/// Why a frame exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Streaming frame for a caller request
    Preview,
    /// Still frame built from retained raw data or a caller input
    Reprocessing,
    /// Vision-graph frame for a caller request
    Vision,
    /// Pacing filler or linked frame without outputs of its own
    Internal,
    /// Dual-path switch frame routed through the sync stage
    Transition,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FrameType::Preview => "preview",
            FrameType::Reprocessing => "reprocessing",
            FrameType::Vision => "vision",
            FrameType::Internal => "internal",
            FrameType::Transition => "transition",
        };
        f.write_str(label)
    }
}

/// State of one (frame, stage) entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Stage disabled for this frame
    NotRequested,
    /// Waiting for the stage worker
    Requested,
    /// Transform running
    Processing,
    /// Finished successfully
    Complete,
    /// Finished with a failure
    Error,
}

impl EntityState {
    /// Complete and Error are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, EntityState::Complete | EntityState::Error)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityState::NotRequested => "not_requested",
            EntityState::Requested => "requested",
            EntityState::Processing => "processing",
            EntityState::Complete => "complete",
            EntityState::Error => "error",
        };
        f.write_str(label)
    }
}

/// State of one destination slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Waiting for the stage
    Requested,
    /// Holds valid data
    Complete,
    /// Data invalid, buffer goes back to its pool
    Error,
}

impl SlotState {
    /// Complete and Error are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, SlotState::Requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_display() {
        let tag = BufferTag::new(StageId::Isp3aSecondary, NodeRole::Forward);
        assert_eq!(tag.to_string(), "isp3a_secondary:forward");
    }

    #[test]
    fn stall_roles_set_stall_intent() {
        for role in [StreamRole::Jpeg, StreamRole::YuvStall] {
            assert!(role.is_stall());
            assert!(role.intent().contains(CaptureIntent::STALL));
        }
        assert!(!StreamRole::Preview.is_stall());
        assert!(StreamRole::ZslInput.is_input());
    }

    #[test]
    fn terminal_states() {
        assert!(EntityState::Complete.is_terminal());
        assert!(EntityState::Error.is_terminal());
        assert!(!EntityState::Processing.is_terminal());
        assert!(!SlotState::Requested.is_terminal());
    }

    #[test]
    fn stage_names_are_unique() {
        let mut names: Vec<_> = StageId::ALL.iter().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), StageId::ALL.len());
    }
}
