//! Error types for each stage of the pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Failures of a [`FrameSource`](crate::capture::FrameSource)
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("capture device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    #[error("device rejected configuration: {0}")]
    UnsupportedConfig(String),

    #[error("frame capture failed: {0}")]
    CaptureFailed(String),

    #[error("capture source is closed")]
    Closed,

    #[error("device rejected {property}={value}: {reason}")]
    PropertyRejected {
        property: String,
        value: i32,
        reason: String,
    },

    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("frame cannot be processed: {0}")]
    InvalidFrame(String),

    #[error("inference backend failed: {0}")]
    Backend(String),
}

/// Failures of a recording sink
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to open sink at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("failed to write frame: {0}")]
    Write(String),

    #[error("failed to finalize recording: {0}")]
    Finalize(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("recording controller has been shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("failed to read camera profiles {path}: {source}")]
    ProfileIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid camera profiles {path}: {source}")]
    ProfileParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("camera model {0:?} not found in profiles")]
    UnknownModel(String),
}
