//! Error types for pipeline assembly and execution

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while assembling or driving the pipeline.
///
/// Saturation is deliberately absent: overflow is clamped locally and counted
/// (see [`crate::fixed::SaturationCounter`]), never raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Channel or shape mismatch between consecutive layers
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Description of the mismatch
        reason: String,
    },

    /// A feature map exceeded a fixed-capacity buffer
    #[error("Resource exhausted in {stage}: capacity {capacity} samples")]
    ResourceExhaustion {
        /// Stage owning the buffer
        stage: String,
        /// Buffer capacity in samples
        capacity: usize,
    },

    /// Frame marker missing, duplicated or misplaced
    #[error("Frame marker error in {stage}: {reason}")]
    FrameMarker {
        /// Stage that observed the violation
        stage: String,
        /// Description of the violation
        reason: String,
    },

    /// Operation not permitted in the current sequencer state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Weight set missing, malformed or inconsistent with the configuration
    #[error("Weight error: {reason}")]
    Weights {
        /// Reason for failure
        reason: String,
    },
}

impl PipelineError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_exhaustion(stage: impl Into<String>, capacity: usize) -> Self {
        Self::ResourceExhaustion {
            stage: stage.into(),
            capacity,
        }
    }

    /// Create a frame marker error
    pub fn frame_marker(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FrameMarker {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a weight error
    pub fn weights(reason: impl Into<String>) -> Self {
        Self::Weights {
            reason: reason.into(),
        }
    }

    /// True for errors that abort the current frame.
    ///
    /// Every variant is structural; the distinction exists for callers that
    /// pattern-match on the error domain.
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::ResourceExhaustion { .. } | Self::FrameMarker { .. }
        )
    }
}
