//! Generic capture path using nokhwa.

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use tracing::{debug, info};

use super::{BackendKind, OpenRequest, VideoBackend};
use crate::error::{BackendError, BackendResult};
use crate::frame::{Frame, PixelFormat};
use crate::types::DeviceId;

/// Native camera handle. `Camera` is not `Send`, so this lives and dies on
/// the capture thread that created it.
pub struct NokhwaBackend {
    camera: Option<Camera>,
    device: Option<DeviceId>,
}

impl Default for NokhwaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NokhwaBackend {
    pub fn new() -> Self {
        Self {
            camera: None,
            device: None,
        }
    }
}

fn camera_index(device: &DeviceId) -> CameraIndex {
    match device {
        DeviceId::Index(n) => CameraIndex::Index(*n),
        DeviceId::Path(path) => CameraIndex::String(path.clone()),
    }
}

impl VideoBackend for NokhwaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn open(&mut self, request: &OpenRequest) -> BackendResult<()> {
        self.close();

        // Request RGB output at the target resolution; most cameras offer MJPEG
        let target_format = CameraFormat::new(
            Resolution::new(request.width, request.height),
            FrameFormat::MJPEG,
            request.fps,
        );
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(target_format));

        debug!(device = %request.device, "Opening camera");
        let mut camera = Camera::new(camera_index(&request.device), requested)
            .map_err(|e| BackendError::Open(format!("{}: {e}", request.device)))?;

        camera
            .open_stream()
            .map_err(|e| {
                BackendError::Open(format!("{}: failed to start stream: {e}", request.device))
            })?;

        let resolution = camera.resolution();
        info!(
            device = %request.device,
            "Opened {}x{} @ {} fps",
            resolution.width(),
            resolution.height(),
            camera.frame_rate()
        );

        self.camera = Some(camera);
        self.device = Some(request.device.clone());
        Ok(())
    }

    fn read(&mut self) -> BackendResult<Frame> {
        let camera = self.camera.as_mut().ok_or(BackendError::NotOpen)?;

        let buffer = camera
            .frame()
            .map_err(|e| BackendError::Read(e.to_string()))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| BackendError::Read(format!("decode: {e}")))?;

        let (width, height) = (image.width(), image.height());
        Ok(Frame::new(image.into_raw(), width, height, PixelFormat::Rgb24))
    }

    fn close(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                debug!("Failed to stop camera stream cleanly: {e}");
            }
            if let Some(device) = self.device.take() {
                debug!(device = %device, "Camera closed");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.camera.is_some()
    }

    fn set_frame_rate(&mut self, fps: u32) -> BackendResult<()> {
        let camera = self.camera.as_mut().ok_or(BackendError::NotOpen)?;
        camera
            .set_frame_rate(fps)
            .map_err(|e| BackendError::Unavailable(format!("cannot change frame rate: {e}")))
    }
}

impl Drop for NokhwaBackend {
    fn drop(&mut self) {
        self.close();
    }
}
