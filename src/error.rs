use thiserror::Error;

use crate::capture::device::DeviceConfig;

/// Capture subsystem error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture device attached")]
    DeviceNotAttached,

    #[error("Device call {operation} failed: {reason}")]
    DeviceFailure {
        operation: &'static str,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Already streaming {current}, cannot switch to {requested}")]
    AlreadyStreamingConflict {
        current: DeviceConfig,
        requested: DeviceConfig,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Wrap a backend failure for the named device call
    pub fn device_failure(operation: &'static str, reason: impl ToString) -> Self {
        Self::DeviceFailure {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Device call name for `DeviceFailure`, if any
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::DeviceFailure { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;
