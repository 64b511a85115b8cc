//! Accelerated capture path: a GStreamer pipeline decoding MJPEG off the
//! camera into packed BGR, pulled from an appsink that keeps only the newest
//! buffer.
//!
//! v4l2src -> capsfilter(image/jpeg) -> jpegdec|avdec_mjpeg -> videoconvert
//!   -> capsfilter(video/x-raw,BGR) -> appsink(max-buffers=1, drop)

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info};

use super::{BackendKind, OpenRequest, VideoBackend};
use crate::error::{BackendError, BackendResult};
use crate::frame::{Frame, PixelFormat};

struct Pipeline {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

pub struct GstBackend {
    active: Option<Pipeline>,
    read_timeout: gst::ClockTime,
}

impl Default for GstBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GstBackend {
    pub fn new() -> Self {
        Self {
            active: None,
            read_timeout: gst::ClockTime::from_seconds(2),
        }
    }
}

/// Decoder element for camera MJPEG.
pub fn decoder_name(use_avdec: bool) -> &'static str {
    if use_avdec {
        "avdec_mjpeg"
    } else {
        "jpegdec"
    }
}

fn make(name: &str) -> BackendResult<gst::Element> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| BackendError::Unavailable(format!("missing element {name}: {e}")))
}

fn build_pipeline(request: &OpenRequest) -> BackendResult<Pipeline> {
    let pipeline = gst::Pipeline::new();

    let source = gst::ElementFactory::make("v4l2src")
        .property("device", request.device.node_path().to_string_lossy().to_string())
        .build()
        .map_err(|e| BackendError::Unavailable(format!("missing element v4l2src: {e}")))?;

    let jpeg_caps = gst::Caps::builder("image/jpeg")
        .field("width", request.width as i32)
        .field("height", request.height as i32)
        .field("framerate", gst::Fraction::new(request.fps as i32, 1))
        .build();
    let jpeg_filter = gst::ElementFactory::make("capsfilter")
        .property("caps", jpeg_caps)
        .build()
        .map_err(|e| BackendError::Unavailable(format!("missing element capsfilter: {e}")))?;

    let decoder = make(decoder_name(request.use_avdec))?;
    let convert = make("videoconvert")?;

    let raw_caps = gst::Caps::builder("video/x-raw").field("format", "BGR").build();
    let raw_filter = gst::ElementFactory::make("capsfilter")
        .property("caps", raw_caps)
        .build()
        .map_err(|e| BackendError::Unavailable(format!("missing element capsfilter: {e}")))?;

    let appsink = gst_app::AppSink::builder()
        .name("sink")
        .max_buffers(1)
        .drop(true)
        .sync(false)
        .build();

    let elements = [
        &source,
        &jpeg_filter,
        &decoder,
        &convert,
        &raw_filter,
        appsink.upcast_ref(),
    ];
    pipeline
        .add_many(elements)
        .map_err(|e| BackendError::Open(format!("failed to add elements: {e}")))?;
    gst::Element::link_many(elements)
        .map_err(|e| BackendError::Open(format!("failed to link pipeline: {e}")))?;

    Ok(Pipeline { pipeline, appsink })
}

/// Copy `height` rows of `row_bytes` out of a buffer laid out with `stride`
/// bytes per row. The last row may be unpadded.
fn compact_rows(data: &[u8], row_bytes: usize, stride: usize, height: usize) -> Option<Vec<u8>> {
    if height == 0 || row_bytes == 0 || stride < row_bytes {
        return None;
    }
    let needed = stride * (height - 1) + row_bytes;
    if data.len() < needed {
        return None;
    }
    if stride == row_bytes {
        return Some(data[..needed].to_vec());
    }
    let mut out = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        out.extend_from_slice(&data[start..start + row_bytes]);
    }
    Some(out)
}

impl VideoBackend for GstBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerated
    }

    fn open(&mut self, request: &OpenRequest) -> BackendResult<()> {
        self.close();
        gst::init().map_err(|e| BackendError::Unavailable(format!("GStreamer init failed: {e}")))?;

        let built = build_pipeline(request)?;
        self.read_timeout = gst::ClockTime::from_mseconds(request.read_timeout.as_millis() as u64);

        if let Err(e) = built.pipeline.set_state(gst::State::Playing) {
            let _ = built.pipeline.set_state(gst::State::Null);
            return Err(BackendError::Open(format!("{}: {e}", request.device)));
        }

        // A busy or missing node only fails once the source negotiates
        let (result, _, _) = built.pipeline.state(self.read_timeout);
        if let Err(e) = result {
            let _ = built.pipeline.set_state(gst::State::Null);
            return Err(BackendError::Open(format!(
                "{}: pipeline did not start: {e}",
                request.device
            )));
        }

        info!(
            device = %request.device,
            decoder = decoder_name(request.use_avdec),
            "Pipeline playing at {}x{} @ {} fps",
            request.width,
            request.height,
            request.fps
        );
        self.active = Some(built);
        Ok(())
    }

    fn read(&mut self) -> BackendResult<Frame> {
        let active = self.active.as_ref().ok_or(BackendError::NotOpen)?;

        let sample = active
            .appsink
            .try_pull_sample(self.read_timeout)
            .ok_or_else(|| {
                if active.appsink.is_eos() {
                    BackendError::Read("end of stream".into())
                } else {
                    BackendError::Read("timed out waiting for frame".into())
                }
            })?;

        let caps = sample
            .caps()
            .ok_or_else(|| BackendError::Read("sample without caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| BackendError::Read(format!("unusable caps: {e}")))?;
        let (width, height) = (info.width(), info.height());
        let stride = usize::try_from(info.stride()[0])
            .map_err(|_| BackendError::Read("negative stride".into()))?;
        let offset = info.offset()[0];

        let buffer = sample
            .buffer()
            .ok_or_else(|| BackendError::Read("sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| BackendError::Read(format!("unmappable buffer: {e}")))?;

        let data = map
            .as_slice()
            .get(offset..)
            .and_then(|plane| compact_rows(plane, width as usize * 3, stride, height as usize))
            .ok_or_else(|| BackendError::Read("short frame buffer".into()))?;
        Ok(Frame::new(data, width, height, PixelFormat::Bgr24))
    }

    fn close(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.pipeline.set_state(gst::State::Null) {
                debug!("Failed to stop pipeline cleanly: {e}");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// The source caps are fixed once the pipeline plays; the worker paces
    /// reads to the new rate instead.
    fn set_frame_rate(&mut self, fps: u32) -> BackendResult<()> {
        Err(BackendError::Unavailable(format!(
            "pipeline rate is fixed at open, cannot switch to {fps} fps"
        )))
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        self.close();
    }
}
