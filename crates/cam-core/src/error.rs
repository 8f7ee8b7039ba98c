//! Error types for the capture pipeline.
//!
//! ## Error Hierarchy
//!
//! - **Admission** (`Rejected`, `Configuration`, `InvalidState`): returned synchronously from
//!   `configure`/`submit_request`, nothing was mutated.
//! - **Stage** (`Stage`): a transform failed. These never escape the pipeline; they are
//!   absorbed into per-slot error tags and surface to the caller as error-tagged buffers.
//! - **Resource** (`Pool`): a buffer pool ran dry. Optional outputs are skipped, required
//!   outputs are marked as failed slots.
//! - **Fatal** (`Protocol`, `EntityTransition`): an internal invariant broke. The session
//!   enters its error state and rejects requests with `DeviceError` until reconfigured.

use crate::types::{EntityState, FrameNumber, RequestKey, StageId, StreamId};
use cam_pool::PoolError;
use thiserror::Error;

// =============================================================================
// Stage Errors
// =============================================================================

/// Category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    /// Device transform reported a failure
    Transform,
    /// Device did not finish in time
    Timeout,
    /// Hardware fault
    Hardware,
    /// Input from the previous stage was missing or invalid
    UpstreamFailed,
    /// Work cancelled by a flush
    Cancelled,
    /// Stage was not running when work arrived
    NotRunning,
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StageErrorKind::Transform => "transform",
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Hardware => "hardware",
            StageErrorKind::UpstreamFailed => "upstream",
            StageErrorKind::Cancelled => "cancelled",
            StageErrorKind::NotRunning => "not_running",
        };
        write!(f, "{}", label)
    }
}

/// Failure of one stage on one frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Stage '{stage}' {kind} error: {message}")]
pub struct StageError {
    /// Stage that failed
    pub stage: StageId,
    /// Failure category
    pub kind: StageErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl StageError {
    /// Creates a stage error.
    pub fn new(stage: StageId, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Work dropped because the pipeline is flushing.
    pub fn cancelled(stage: StageId) -> Self {
        Self::new(stage, StageErrorKind::Cancelled, "flush in progress")
    }
}

// =============================================================================
// Admission
// =============================================================================

/// Why a request was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No control settings and no earlier request to inherit from
    NoSettings,
    /// Request names no output stream
    NoOutputTargets,
    /// Output stream is not part of the configured stream set
    UnknownStream(StreamId),
    /// Input buffer names a stream that is not a configured input stream
    UnknownInputStream(StreamId),
    /// Same output stream listed twice
    DuplicateStream(StreamId),
    /// Key already in flight
    DuplicateKey,
    /// Exposure needs more accumulated sensor frames than configured
    ExposureTooLong {
        /// Frames the exposure would need
        frames: u32,
        /// Configured maximum
        max: u32,
    },
    /// A flush is in progress
    Draining,
    /// Bounded pacing wait expired
    PacingTimeout,
    /// `configure` has not run
    NotConfigured,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NoSettings => write!(f, "no settings and no baseline to inherit"),
            RejectReason::NoOutputTargets => write!(f, "no output targets"),
            RejectReason::UnknownStream(id) => write!(f, "unregistered output {}", id),
            RejectReason::UnknownInputStream(id) => write!(f, "unregistered input {}", id),
            RejectReason::DuplicateStream(id) => write!(f, "{} requested twice", id),
            RejectReason::DuplicateKey => write!(f, "request key already in flight"),
            RejectReason::ExposureTooLong { frames, max } => {
                write!(f, "exposure needs {frames} accumulated frames, at most {max} allowed")
            }
            RejectReason::Draining => write!(f, "flush in progress"),
            RejectReason::PacingTimeout => write!(f, "pipeline full, pacing wait expired"),
            RejectReason::NotConfigured => write!(f, "session not configured"),
        }
    }
}

// =============================================================================
// Session Errors
// =============================================================================

/// Convenience alias for results using the pipeline error type.
pub type CamResult<T> = std::result::Result<T, CamError>;

/// Primary error type for the capture pipeline.
#[derive(Error, Debug)]
pub enum CamError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is not usable (invalid values, impossible stream set).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Request refused at admission. Nothing was queued.
    #[error("Request {request} rejected: {reason}")]
    Rejected {
        /// Rejected request
        request: RequestKey,
        /// Reason
        reason: RejectReason,
    },

    /// Operation not allowed in the current session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Current state
        state: String,
    },

    /// A stage failed.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A buffer pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Entity state machine violation (double completion, completion without start).
    #[error("Frame {frame}: stage '{stage}' cannot move from {from} to {to}")]
    EntityTransition {
        /// Frame
        frame: FrameNumber,
        /// Stage
        stage: StageId,
        /// Current state
        from: EntityState,
        /// Attempted state
        to: EntityState,
    },

    /// Internal invariant violated. Escalates the session to its error state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session is in its error state until reconfigured.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Teardown of workers or stages failed.
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl CamError {
    /// Shorthand for an admission rejection.
    #[must_use]
    pub fn rejected(request: RequestKey, reason: RejectReason) -> Self {
        CamError::Rejected { request, reason }
    }

    /// Errors that must push the session into its error state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CamError::Protocol(_) | CamError::EntityTransition { .. }
        )
    }

    /// Rejection reason, if this is an admission rejection.
    #[must_use]
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            CamError::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_display() {
        let err = StageError::new(StageId::Scaler, StageErrorKind::Transform, "bad format");
        assert_eq!(
            err.to_string(),
            "Stage 'scaler' transform error: bad format"
        );
        assert_eq!(StageError::cancelled(StageId::Isp).kind, StageErrorKind::Cancelled);
    }

    #[test]
    fn fatal_classification() {
        assert!(CamError::Protocol("missing request".into()).is_fatal());
        assert!(CamError::EntityTransition {
            frame: FrameNumber(3),
            stage: StageId::Isp,
            from: EntityState::Complete,
            to: EntityState::Complete,
        }
        .is_fatal());
        assert!(!CamError::rejected(RequestKey(1), RejectReason::Draining).is_fatal());
    }

    #[test]
    fn reject_reason_roundtrip() {
        let err = CamError::rejected(RequestKey(9), RejectReason::NoOutputTargets);
        assert_eq!(err.reject_reason(), Some(RejectReason::NoOutputTargets));
        assert_eq!(err.to_string(), "Request 9 rejected: no output targets");
    }

    #[test]
    fn pool_error_converts() {
        let err: CamError = PoolError::UnknownPool("isp:forward".into()).into();
        assert!(matches!(err, CamError::Pool(_)));
    }
}
