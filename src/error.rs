//! Pipeline error taxonomy
//!
//! Validation-time errors are returned to the submitter. Worker-time errors
//! are absorbed by the commit worker and only surface through logs, frame
//! history, and the error carried by a retire fence.

use thiserror::Error;

use crate::arbiter::ChannelId;
use crate::buffer::BufferHandle;
use crate::power::PowerState;

/// Identifier of one output pipeline.
pub type PipelineId = u32;

/// Errors produced by the frame-commit pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("channel {channel} is already bound by pipeline {owner}")]
    ResourceConflict { channel: ChannelId, owner: PipelineId },

    #[error("failed to import buffer {handle:?}: {reason}")]
    ImportFailed { handle: BufferHandle, reason: String },

    #[error("acquire fence for window {window} did not signal in time")]
    AcquireTimeout { window: usize },

    #[error("shadow register latch was not confirmed on pipeline {pipeline}")]
    LatchTimeout { pipeline: PipelineId },

    #[error("writeback frame on pipeline {pipeline} did not complete in time")]
    FrameDoneTimeout { pipeline: PipelineId },

    #[error("buffer for window {window} holds {actual} bytes, geometry needs {required}")]
    ResourceMismatch {
        window: usize,
        required: u64,
        actual: u64,
    },

    #[error("window {window} is invalid: {reason}")]
    InvalidWindow { window: usize, reason: String },

    #[error("frame carries {count} windows, pipeline supports {max}")]
    TooManyWindows { count: usize, max: usize },

    #[error("channel {channel} does not support {feature}")]
    UnsupportedFeature {
        channel: ChannelId,
        feature: &'static str,
    },

    #[error("bandwidth estimator failed: {0}")]
    Estimator(String),

    #[error("shadow update still pending on pipeline {pipeline}")]
    ShadowUpdateBusy { pipeline: PipelineId },

    #[error("pipeline {pipeline} is in a fatal state and must be re-initialized")]
    PipelineFatal { pipeline: PipelineId },

    #[error("operation not permitted in power state {state:?}")]
    PowerState { state: PowerState },

    #[error("cannot enter hibernation: {0}")]
    HiberRefused(&'static str),

    #[error("unsupported refresh rate {0} Hz")]
    InvalidRefreshRate(u32),

    #[error("unknown pipeline {0}")]
    UnknownPipeline(PipelineId),

    #[error("completion signal dropped before being signaled")]
    Abandoned,

    #[error("pipeline {pipeline} worker has shut down")]
    WorkerGone { pipeline: PipelineId },

    #[error("hardware error: {0}")]
    Hardware(String),
}

impl PipelineError {
    /// Errors that leave the pipeline unusable until re-initialized
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::LatchTimeout { .. }
                | PipelineError::FrameDoneTimeout { .. }
                | PipelineError::Estimator(_)
                | PipelineError::PipelineFatal { .. }
        )
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
