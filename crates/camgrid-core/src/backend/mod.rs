//! Video backends.
//!
//! A backend owns one exclusive device handle and exposes a blocking
//! `open`/`read`/`close` cycle. Two variants exist:
//! - accelerated: GStreamer `v4l2src` pipeline with MJPEG decode (feature `accelerated`)
//! - generic: nokhwa native capture (feature `native`)
//!
//! Backends are created on the capture thread and never leave it; several
//! platform camera handles are not `Send`.

#[cfg(feature = "accelerated")]
pub mod accelerated;
#[cfg(feature = "native")]
pub mod generic;

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::config::CaptureConfig;
use crate::error::{BackendError, BackendResult};
use crate::frame::Frame;
use crate::types::DeviceId;

/// Which capture path produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Accelerated,
    Generic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Accelerated => f.write_str("accelerated"),
            BackendKind::Generic => f.write_str("generic"),
        }
    }
}

/// Parameters for opening a device.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub device: DeviceId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub use_avdec: bool,
    pub read_timeout: Duration,
}

impl OpenRequest {
    pub fn new(device: DeviceId, config: &CaptureConfig, fps: u32) -> Self {
        Self {
            device,
            width: config.width,
            height: config.height,
            fps,
            use_avdec: config.use_avdec,
            read_timeout: config.read_timeout,
        }
    }
}

/// One camera handle.
pub trait VideoBackend {
    fn kind(&self) -> BackendKind;

    fn open(&mut self, request: &OpenRequest) -> BackendResult<()>;

    /// Block until the next frame is decoded or the read fails.
    fn read(&mut self) -> BackendResult<Frame>;

    /// Release the device. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Ask the device for a new capture rate. Best effort; backends that
    /// cannot switch report it and the worker paces reads instead.
    fn set_frame_rate(&mut self, fps: u32) -> BackendResult<()> {
        Err(BackendError::Unavailable(format!("cannot switch to {fps} fps")))
    }
}

/// Creates backends on the capture thread.
pub trait BackendFactory: Send + Sync {
    /// `None` when no accelerated path is available in this build.
    fn accelerated(&self) -> Option<Box<dyn VideoBackend>>;

    fn generic(&self) -> Box<dyn VideoBackend>;
}

/// Backends compiled into this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackends;

impl BackendFactory for SystemBackends {
    fn accelerated(&self) -> Option<Box<dyn VideoBackend>> {
        #[cfg(feature = "accelerated")]
        {
            Some(Box::new(accelerated::GstBackend::new()))
        }
        #[cfg(not(feature = "accelerated"))]
        {
            None
        }
    }

    fn generic(&self) -> Box<dyn VideoBackend> {
        #[cfg(feature = "native")]
        {
            Box::new(generic::NokhwaBackend::new())
        }
        #[cfg(not(feature = "native"))]
        {
            Box::new(UnavailableBackend)
        }
    }
}

/// Stand-in generic path for builds without native capture.
#[cfg(not(feature = "native"))]
struct UnavailableBackend;

#[cfg(not(feature = "native"))]
impl VideoBackend for UnavailableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn open(&mut self, _request: &OpenRequest) -> BackendResult<()> {
        Err(BackendError::Unavailable(
            "built without native capture support".into(),
        ))
    }

    fn read(&mut self) -> BackendResult<Frame> {
        Err(BackendError::NotOpen)
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }
}

/// Open a device, trying the accelerated pipeline first when allowed and
/// falling back to the generic path.
pub fn open_preferred(
    factory: &dyn BackendFactory,
    request: &OpenRequest,
    prefer_accelerated: bool,
) -> BackendResult<Box<dyn VideoBackend>> {
    let mut accelerated_error = None;

    if prefer_accelerated {
        if let Some(mut backend) = factory.accelerated() {
            match backend.open(request) {
                Ok(()) => return Ok(backend),
                Err(e) => {
                    debug!(device = %request.device, "Accelerated open failed, falling back: {e}");
                    backend.close();
                    accelerated_error = Some(e);
                }
            }
        }
    }

    let mut backend = factory.generic();
    match backend.open(request) {
        Ok(()) => Ok(backend),
        Err(e) => {
            backend.close();
            Err(match accelerated_error {
                Some(first) => BackendError::Open(format!("{first}; fallback: {e}")),
                None => e,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFactory;

    fn request() -> OpenRequest {
        OpenRequest::new(DeviceId::Index(0), &CaptureConfig::default(), 20)
    }

    #[test]
    fn test_prefers_accelerated() {
        let factory = ScriptedFactory::with_accelerated(true, true);
        let backend = open_preferred(&factory, &request(), true).unwrap();
        assert_eq!(backend.kind(), BackendKind::Accelerated);
        assert_eq!(factory.generic_counters().open_attempts(), 0);
    }

    #[test]
    fn test_falls_back_to_generic() {
        let factory = ScriptedFactory::with_accelerated(false, true);
        let backend = open_preferred(&factory, &request(), true).unwrap();
        assert_eq!(backend.kind(), BackendKind::Generic);
        assert_eq!(factory.accelerated_counters().open_attempts(), 1);
    }

    #[test]
    fn test_accelerated_disabled_by_config() {
        let factory = ScriptedFactory::with_accelerated(true, true);
        let backend = open_preferred(&factory, &request(), false).unwrap();
        assert_eq!(backend.kind(), BackendKind::Generic);
        assert_eq!(factory.accelerated_counters().open_attempts(), 0);
    }

    #[test]
    fn test_both_paths_fail() {
        let factory = ScriptedFactory::with_accelerated(false, false);
        let err = open_preferred(&factory, &request(), true).err().unwrap();
        assert!(matches!(err, BackendError::Open(msg) if msg.contains("fallback")));
        assert_eq!(factory.generic_counters().live_handles(), 0);
        assert_eq!(factory.accelerated_counters().live_handles(), 0);
    }
}
