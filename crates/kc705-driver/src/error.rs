//! Error types for KC705 driver operations

use kc705_pipeline::PipelineError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for KC705 operations
pub type Result<T> = std::result::Result<T, Kc705Error>;

/// Errors that can occur during KC705 operations
#[derive(Debug, Error)]
pub enum Kc705Error {
    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No KC705 boards detected on the system
    #[error("No KC705 devices detected")]
    NoDevicesFound,

    /// Device index out of range
    #[error("Device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available devices
        count: usize,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Data transfer failed
    #[error("Transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure
        reason: String,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid parameter: {reason}")]
    InvalidParam {
        /// What was wrong
        reason: String,
    },

    /// Device is in an invalid state
    #[error("Device in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// DONE was not observed within the wait bound
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// The device raised its ERROR status bit
    #[error("Hardware error: {reason}")]
    HardwareError {
        /// Reason for failure
        reason: String,
    },

    /// `STATUS.LINK_UP` is clear
    #[error("PCIe link down ({address})")]
    LinkDown {
        /// PCIe address of the board
        address: String,
    },

    /// Error raised by the inference pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl Kc705Error {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a transfer failed error
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::HardwareError {
            reason: reason.into(),
        }
    }

    /// Create a link down error
    pub fn link_down(address: impl Into<String>) -> Self {
        Self::LinkDown {
            address: address.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
