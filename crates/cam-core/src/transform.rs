//! Device transform seam.
//!
//! The pipeline never touches pixels. Each stage hands a [`StageIo`] to a
//! [`StageTransform`] supplied by the platform (or the mock driver in tests) and only looks
//! at which outputs the transform marked as failed.

use async_trait::async_trait;
use cam_pool::Buffer;
use std::sync::Arc;

use crate::error::StageError;
use crate::metadata::{ControlMetadata, ResultMetadata};
use crate::types::{FrameNumber, NodeRole, StageId};

/// One destination buffer handed to a transform.
#[derive(Debug)]
pub struct OutputSlot {
    /// Node the buffer belongs to
    pub role: NodeRole,
    /// Destination buffer
    pub buffer: Buffer,
    /// Set when the transform could not produce valid data for this node
    pub failed: bool,
}

impl OutputSlot {
    /// Wraps a destination buffer.
    #[must_use]
    pub fn new(role: NodeRole, buffer: Buffer) -> Self {
        Self {
            role,
            buffer,
            failed: false,
        }
    }
}

/// Buffers and metadata for one stage run on one frame.
#[derive(Debug)]
pub struct StageIo {
    frame_number: FrameNumber,
    stage: StageId,
    control: Arc<ControlMetadata>,
    input_valid: bool,
    /// Source buffers, one per upstream edge (or the selected raw frames for a reprocessing root)
    pub inputs: Vec<Buffer>,
    /// Destination buffers
    pub outputs: Vec<OutputSlot>,
    /// Metadata produced by this stage, merged into the frame result
    pub result: ResultMetadata,
    /// Early metadata to deliver as a partial result
    pub partial: Option<ResultMetadata>,
}

impl StageIo {
    /// Assembles the work unit for one stage.
    #[must_use]
    pub fn new(
        frame_number: FrameNumber,
        stage: StageId,
        control: Arc<ControlMetadata>,
        inputs: Vec<Buffer>,
        input_valid: bool,
        outputs: Vec<OutputSlot>,
    ) -> Self {
        Self {
            frame_number,
            stage,
            control,
            input_valid,
            inputs,
            outputs,
            result: ResultMetadata::default(),
            partial: None,
        }
    }

    /// Frame being processed.
    #[must_use]
    pub fn frame_number(&self) -> FrameNumber {
        self.frame_number
    }

    /// Stage running the transform.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Controls latched when the frame was created.
    #[must_use]
    pub fn control(&self) -> &ControlMetadata {
        &self.control
    }

    /// False when an upstream stage failed and inputs hold no valid data.
    #[must_use]
    pub fn input_valid(&self) -> bool {
        self.input_valid
    }

    /// Whether a destination for `role` is present.
    #[must_use]
    pub fn has_output(&self, role: NodeRole) -> bool {
        self.outputs.iter().any(|o| o.role == role)
    }

    /// Destination buffer for `role`.
    pub fn output_mut(&mut self, role: NodeRole) -> Option<&mut Buffer> {
        self.outputs
            .iter_mut()
            .find(|o| o.role == role)
            .map(|o| &mut o.buffer)
    }

    /// Marks the destination for `role` as failed. Returns `false` if there is none.
    pub fn fail_output(&mut self, role: NodeRole) -> bool {
        match self.outputs.iter_mut().find(|o| o.role == role) {
            Some(slot) => {
                slot.failed = true;
                true
            }
            None => false,
        }
    }

    /// Marks every destination as failed.
    pub fn fail_all_outputs(&mut self) {
        for slot in &mut self.outputs {
            slot.failed = true;
        }
    }

    /// Roles of all destinations.
    pub fn roles(&self) -> impl Iterator<Item = NodeRole> + '_ {
        self.outputs.iter().map(|o| o.role)
    }

    /// Splits the work unit back into its parts.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Vec<Buffer>,
        Vec<OutputSlot>,
        ResultMetadata,
        Option<ResultMetadata>,
    ) {
        (self.inputs, self.outputs, self.result, self.partial)
    }
}

/// Device operation behind one pipeline stage.
///
/// Implementations must be cheap to share; one instance serves every frame of its stage.
#[async_trait]
pub trait StageTransform: Send + Sync {
    /// Prepares the device. Called when the owning graph starts.
    async fn start(&self, _stage: StageId) -> Result<(), StageError> {
        Ok(())
    }

    /// Runs the device on one frame. Returning an error fails every destination.
    async fn process(&self, io: &mut StageIo) -> Result<(), StageError>;

    /// Releases the device. Called when the owning graph stops.
    async fn stop(&self, _stage: StageId) -> Result<(), StageError> {
        Ok(())
    }
}

/// Supplies the transform for every stage a graph contains.
pub trait TransformProvider: Send + Sync {
    /// Transform for `stage`.
    fn transform_for(&self, stage: StageId) -> Arc<dyn StageTransform>;
}
