//! Render-side consumption of the latest-frame slots.
//!
//! Each tick reads every slot's newest frame without waiting on any capture
//! thread. A frame already drawn is not drawn again, and a slot without a
//! frame shows its state label instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::frame::Frame;
use crate::slot::SlotState;
use crate::types::SlotIndex;

/// Where tiles end up.
pub trait DisplaySink {
    fn present(&mut self, slot: SlotIndex, frame: &Frame);

    /// Draw a text placeholder for a slot with nothing to show.
    fn placeholder(&mut self, slot: SlotIndex, label: &str);
}

/// Per-slot frames and states, as read by the render loop.
pub trait FrameSource {
    fn slot_count(&self) -> usize;

    /// Newest frame and its publish sequence number.
    fn latest(&self, slot: SlotIndex) -> Option<(u64, Arc<Frame>)>;

    fn state(&self, slot: SlotIndex) -> SlotState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shown {
    Nothing,
    Frame(u64),
    Label(&'static str),
}

pub struct RenderLoop {
    shown: Vec<Shown>,
    presented: Vec<u32>,
    window_start: Instant,
    stats_interval: Duration,
}

impl RenderLoop {
    pub fn new(slot_count: usize, stats_interval: Duration) -> Self {
        Self {
            shown: vec![Shown::Nothing; slot_count],
            presented: vec![0; slot_count],
            window_start: Instant::now(),
            stats_interval,
        }
    }

    /// Draw one tick. Returns the number of new frames presented.
    pub fn render(&mut self, source: &dyn FrameSource, sink: &mut dyn DisplaySink) -> usize {
        let mut drawn = 0;
        for slot in 0..source.slot_count().min(self.shown.len()) {
            match source.latest(slot) {
                Some((sequence, frame)) => {
                    if self.shown[slot] != Shown::Frame(sequence) {
                        sink.present(slot, &frame);
                        self.shown[slot] = Shown::Frame(sequence);
                        self.presented[slot] += 1;
                        drawn += 1;
                    }
                }
                None => {
                    let label = source.state(slot).label();
                    if self.shown[slot] != Shown::Label(label) {
                        sink.placeholder(slot, label);
                        self.shown[slot] = Shown::Label(label);
                    }
                }
            }
        }
        drawn
    }

    /// Per-slot presented-frames-per-second since the last call, once at
    /// least half a second has passed.
    pub fn take_fps_stats(&mut self, now: Instant) -> Option<Vec<f64>> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Duration::from_millis(500) {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        let stats = self.presented.iter().map(|&n| n as f64 / secs).collect();
        self.presented.iter_mut().for_each(|n| *n = 0);
        self.window_start = now;
        Some(stats)
    }

    /// Log render rates if the stats interval has elapsed.
    pub fn log_stats_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) < self.stats_interval {
            return;
        }
        if let Some(stats) = self.take_fps_stats(now) {
            let rates: Vec<String> = stats
                .iter()
                .enumerate()
                .map(|(slot, fps)| format!("{slot}:{fps:.1}"))
                .collect();
            info!("Render FPS {}", rates.join(" "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{LatestFrame, PixelFormat};

    struct Source {
        slots: Vec<(LatestFrame, SlotState)>,
    }

    impl FrameSource for Source {
        fn slot_count(&self) -> usize {
            self.slots.len()
        }

        fn latest(&self, slot: SlotIndex) -> Option<(u64, Arc<Frame>)> {
            self.slots[slot].0.latest_with_sequence()
        }

        fn state(&self, slot: SlotIndex) -> SlotState {
            self.slots[slot].1
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: Vec<SlotIndex>,
        labels: Vec<(SlotIndex, String)>,
    }

    impl DisplaySink for Recorder {
        fn present(&mut self, slot: SlotIndex, _frame: &Frame) {
            self.frames.push(slot);
        }

        fn placeholder(&mut self, slot: SlotIndex, label: &str) {
            self.labels.push((slot, label.to_string()));
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![0; 12], 2, 2, PixelFormat::Rgb24)
    }

    #[test]
    fn test_unchanged_frame_is_not_redrawn() {
        let source = Source {
            slots: vec![(LatestFrame::new(), SlotState::Streaming)],
        };
        source.slots[0].0.publish(frame());

        let mut render = RenderLoop::new(1, Duration::from_secs(2));
        let mut sink = Recorder::default();
        assert_eq!(render.render(&source, &mut sink), 1);
        assert_eq!(render.render(&source, &mut sink), 0);

        source.slots[0].0.publish(frame());
        assert_eq!(render.render(&source, &mut sink), 1);
        assert_eq!(sink.frames, vec![0, 0]);
    }

    #[test]
    fn test_frameless_slots_show_state_label() {
        let mut source = Source {
            slots: vec![
                (LatestFrame::new(), SlotState::Empty),
                (LatestFrame::new(), SlotState::Recovering),
            ],
        };
        let mut render = RenderLoop::new(2, Duration::from_secs(2));
        let mut sink = Recorder::default();
        render.render(&source, &mut sink);
        render.render(&source, &mut sink);
        assert_eq!(
            sink.labels,
            vec![(0, "DISCONNECTED".to_string()), (1, "RECONNECTING".to_string())]
        );

        source.slots[1].1 = SlotState::Connecting;
        render.render(&source, &mut sink);
        assert_eq!(sink.labels.last(), Some(&(1, "CONNECTING".to_string())));
    }

    #[test]
    fn test_cleared_frame_falls_back_to_label() {
        let source = Source {
            slots: vec![(LatestFrame::new(), SlotState::Recovering)],
        };
        source.slots[0].0.publish(frame());
        let mut render = RenderLoop::new(1, Duration::from_secs(2));
        let mut sink = Recorder::default();
        render.render(&source, &mut sink);

        source.slots[0].0.clear();
        render.render(&source, &mut sink);
        assert_eq!(sink.labels, vec![(0, "RECONNECTING".to_string())]);
    }

    #[test]
    fn test_fps_stats_need_half_second_window() {
        let source = Source {
            slots: vec![(LatestFrame::new(), SlotState::Streaming)],
        };
        let mut render = RenderLoop::new(1, Duration::from_secs(2));
        let mut sink = Recorder::default();
        let start = render.window_start;
        for _ in 0..10 {
            source.slots[0].0.publish(frame());
            render.render(&source, &mut sink);
        }
        assert!(render.take_fps_stats(start + Duration::from_millis(100)).is_none());
        let stats = render.take_fps_stats(start + Duration::from_secs(1)).unwrap();
        assert!((stats[0] - 10.0).abs() < 1e-9);
    }
}
