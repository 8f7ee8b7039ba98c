//! In-flight frame lists, one per graph kind.

use cam_core::{FrameNumber, GraphKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::frame::Frame;

type FrameList = Mutex<BTreeMap<FrameNumber, Arc<Frame>>>;

/// Frames built and not yet retired.
///
/// Each list has its own lock, held only for insert / remove / scan.
#[derive(Default)]
pub struct InFlightLists {
    preview: FrameList,
    reprocessing: FrameList,
    vision: FrameList,
}

impl InFlightLists {
    /// Empty lists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, kind: GraphKind) -> &FrameList {
        match kind {
            GraphKind::Preview => &self.preview,
            GraphKind::Reprocessing => &self.reprocessing,
            GraphKind::Vision => &self.vision,
        }
    }

    /// Tracks a new frame.
    pub fn insert(&self, frame: Arc<Frame>) {
        self.list(frame.graph()).lock().insert(frame.number(), frame);
    }

    /// Removes a completed frame. Succeeds once per frame, never for an incomplete one.
    pub fn remove(&self, frame: &Frame) -> bool {
        if !frame.mark_removed() {
            return false;
        }
        self.list(frame.graph()).lock().remove(&frame.number());
        true
    }

    /// Frames tracked for one graph.
    #[must_use]
    pub fn len(&self, kind: GraphKind) -> usize {
        self.list(kind).lock().len()
    }

    /// Frames tracked across all graphs.
    #[must_use]
    pub fn total(&self) -> usize {
        [GraphKind::Preview, GraphKind::Reprocessing, GraphKind::Vision]
            .iter()
            .map(|k| self.len(*k))
            .sum()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Oldest tracked frame number of one graph.
    #[must_use]
    pub fn oldest(&self, kind: GraphKind) -> Option<FrameNumber> {
        self.list(kind).lock().keys().next().copied()
    }

    /// Empties every list, cancelling whatever did not complete and returning all buffers.
    ///
    /// Callers must make sure no stage worker can still touch these frames.
    pub fn drain_all(&self) -> Vec<Arc<Frame>> {
        let mut drained = Vec::new();
        for kind in [GraphKind::Preview, GraphKind::Reprocessing, GraphKind::Vision] {
            let frames = std::mem::take(&mut *self.list(kind).lock());
            drained.extend(frames.into_values());
        }
        for frame in &drained {
            frame.force_complete();
            frame.mark_removed();
            let released = frame.release_buffers();
            debug!(frame = %frame.number(), released, "Drained in-flight frame");
        }
        drained
    }
}

impl std::fmt::Debug for InFlightLists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightLists")
            .field("preview", &self.len(GraphKind::Preview))
            .field("reprocessing", &self.len(GraphKind::Reprocessing))
            .field("vision", &self.len(GraphKind::Vision))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameParams, StageEntity};
    use cam_core::{CaptureIntent, ControlMetadata, FrameType, StageError, StageId};

    fn frame(number: u64, graph: GraphKind) -> Arc<Frame> {
        let params = FrameParams {
            number: FrameNumber(number),
            frame_type: FrameType::Preview,
            graph,
            request: None,
            intent: CaptureIntent::empty(),
            control: Arc::new(ControlMetadata::new()),
        };
        Arc::new(Frame::new(
            params,
            vec![StageEntity::requested(StageId::Sensor, 0, Vec::new())],
        ))
    }

    #[test]
    fn remove_happens_once_after_completion() {
        let lists = InFlightLists::new();
        let f = frame(3, GraphKind::Preview);
        lists.insert(Arc::clone(&f));
        assert_eq!(lists.len(GraphKind::Preview), 1);

        assert!(!lists.remove(&f));
        f.abort(StageId::Sensor, StageError::cancelled(StageId::Sensor))
            .unwrap();
        assert!(lists.remove(&f));
        assert!(!lists.remove(&f));
        assert!(lists.is_empty());
    }

    #[test]
    fn lists_are_per_graph() {
        let lists = InFlightLists::new();
        lists.insert(frame(5, GraphKind::Preview));
        lists.insert(frame(2, GraphKind::Preview));
        lists.insert(frame(4, GraphKind::Reprocessing));
        assert_eq!(lists.len(GraphKind::Preview), 2);
        assert_eq!(lists.len(GraphKind::Reprocessing), 1);
        assert_eq!(lists.oldest(GraphKind::Preview), Some(FrameNumber(2)));
        assert_eq!(lists.total(), 3);
    }

    #[test]
    fn drain_cancels_incomplete_frames() {
        let lists = InFlightLists::new();
        lists.insert(frame(1, GraphKind::Vision));
        let drained = lists.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].is_complete());
        assert_eq!(
            drained[0].entity_state(StageId::Sensor),
            Some(cam_core::EntityState::Error)
        );
        assert!(lists.is_empty());
        assert!(lists.drain_all().is_empty());
    }
}
