//! Decoded frames and the single-slot hand-off between a capture thread and
//! the render loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed data.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Yuyv => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// One decoded image produced by a capture worker.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonic capture instant, used for staleness checks.
    pub captured_at: Instant,
    /// Wall-clock capture time, for display.
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Wrap a freshly captured buffer, stamping it with the current time.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
            captured_at: Instant::now(),
            timestamp: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

struct Latest {
    frame: Option<Arc<Frame>>,
    sequence: u64,
}

/// Single-writer/single-reader mailbox holding at most one frame.
///
/// `publish` overwrites whatever is there; nothing is ever queued, so memory
/// stays constant no matter how far the producer outruns the consumer. The
/// lock only guards a pointer swap, and the superseded frame is dropped
/// after it is released.
pub struct LatestFrame {
    inner: Mutex<Latest>,
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrame {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Latest {
                frame: None,
                sequence: 0,
            }),
        }
    }

    /// Fresh empty mailbox whose sequence numbers continue from this one, so
    /// a reader tracking sequences never mistakes a new frame for an old one.
    pub fn successor(&self) -> Self {
        Self {
            inner: Mutex::new(Latest {
                frame: None,
                sequence: self.sequence(),
            }),
        }
    }

    /// Replace the current frame. Returns the sequence number assigned to it.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        let (sequence, _superseded) = {
            let mut latest = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            latest.sequence += 1;
            (latest.sequence, latest.frame.replace(frame))
        };
        sequence
    }

    /// Current frame without removing it, so a slow producer can be redrawn.
    pub fn take_latest(&self) -> Option<Arc<Frame>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame
            .clone()
    }

    /// Current frame together with its publish sequence number.
    pub fn latest_with_sequence(&self) -> Option<(u64, Arc<Frame>)> {
        let latest = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        latest.frame.clone().map(|f| (latest.sequence, f))
    }

    /// Number of frames published so far.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).sequence
    }

    /// Drop the current frame, e.g. when the camera is lost.
    pub fn clear(&self) {
        let _dropped = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 12], 2, 2, PixelFormat::Rgb24)
    }

    #[test]
    fn test_empty_slot() {
        let slot = LatestFrame::new();
        assert!(slot.take_latest().is_none());
        assert_eq!(slot.sequence(), 0);
    }

    #[test]
    fn test_last_write_wins() {
        let slot = LatestFrame::new();
        for tag in 1..=50u8 {
            slot.publish(frame(tag));
        }
        let latest = slot.take_latest().unwrap();
        assert_eq!(latest.data[0], 50);
        assert_eq!(slot.sequence(), 50);
    }

    #[test]
    fn test_take_latest_does_not_consume() {
        let slot = LatestFrame::new();
        slot.publish(frame(7));
        let a = slot.take_latest().unwrap();
        let b = slot.take_latest().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_superseded_frame_is_released() {
        let slot = LatestFrame::new();
        slot.publish(frame(1));
        let first = slot.take_latest().unwrap();
        slot.publish(frame(2));
        // Only our clone keeps the first frame alive now.
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn test_clear() {
        let slot = LatestFrame::new();
        slot.publish(frame(3));
        slot.clear();
        assert!(slot.take_latest().is_none());
        assert_eq!(slot.sequence(), 1);
    }

    #[test]
    fn test_successor_continues_sequence() {
        let slot = LatestFrame::new();
        slot.publish(frame(1));
        slot.publish(frame(2));
        let next = slot.successor();
        assert!(next.take_latest().is_none());
        assert_eq!(next.publish(frame(3)), 3);
    }

    #[test]
    fn test_concurrent_publish_keeps_capture_order() {
        let slot = Arc::new(LatestFrame::new());
        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for tag in 0..=200u8 {
                    slot.publish(frame(tag));
                }
            })
        };

        let mut last_seen = 0u64;
        while !producer.is_finished() {
            if let Some((seq, _)) = slot.latest_with_sequence() {
                assert!(seq >= last_seen);
                last_seen = seq;
            }
        }
        producer.join().unwrap();

        let (seq, latest) = slot.latest_with_sequence().unwrap();
        assert_eq!(seq, 201);
        assert_eq!(latest.data[0], 200);
    }
}
