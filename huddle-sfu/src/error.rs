//! Error types for the SFU

use serde::Serialize;
use thiserror::Error;

use crate::inspector::FailureReason;

/// SFU error types
#[derive(Debug, Error)]
pub enum SfuError {
    #[error("Peer not ready: {0}")]
    NotReady(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already in state: {0}")]
    AlreadyInState(String),

    #[error("Invalid bitstream: {0}")]
    InvalidBitstream(String),

    #[error("Inspector process failed: {reason}")]
    ProcessFailure { reason: FailureReason },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Room full: {0}")]
    RoomFull(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SfuError {
    /// Stable error code reported to signaling clients
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotReady(_) => "NotReady",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyInState(_) => "AlreadyInState",
            Self::InvalidBitstream(_) => "InvalidBitstream",
            Self::ProcessFailure { .. } => "ProcessFailure",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::RoomFull(_) => "RoomFull",
            Self::Timeout(_) => "Timeout",
            Self::Engine(_) | Self::Signaling(_) | Self::Io(_) | Self::Serialization(_) => {
                "Internal"
            }
        }
    }

    /// Wire form of this error inside an acknowledgement
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Error slot of a signaling acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, SfuError>;
