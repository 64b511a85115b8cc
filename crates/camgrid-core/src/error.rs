use thiserror::Error;

use crate::types::DeviceId;

/// Failure reported by a video backend. Always recoverable from the
/// worker's point of view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Failed to read frame: {0}")]
    Read(String),

    #[error("Backend is not open")]
    NotOpen,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by the command API of the capture core.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Unknown slot: {0}")]
    UnknownSlot(usize),

    #[error("Device {0} is cooling down after repeated failures")]
    DeviceCoolingDown(DeviceId),

    #[error("Device {0} is already assigned to another slot")]
    DeviceBusy(DeviceId),

    #[error("Failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;
