//! Headless display: tiles are reported through tracing instead of drawn.

use camgrid_core::{DisplaySink, Frame, SlotIndex};
use tracing::{debug, info};

pub struct LogSink {
    sizes: Vec<Option<(u32, u32)>>,
}

impl LogSink {
    pub fn new(slot_count: usize) -> Self {
        Self {
            sizes: vec![None; slot_count],
        }
    }
}

impl DisplaySink for LogSink {
    fn present(&mut self, slot: SlotIndex, frame: &Frame) {
        let size = (frame.width, frame.height);
        if let Some(last) = self.sizes.get_mut(slot) {
            if *last != Some(size) {
                info!(slot, "Showing {}x{} {:?}", frame.width, frame.height, frame.format);
                *last = Some(size);
            }
        }
        debug!(slot, captured = %frame.timestamp.format("%H:%M:%S%.3f"), "Frame presented");
    }

    fn placeholder(&mut self, slot: SlotIndex, label: &str) {
        if let Some(last) = self.sizes.get_mut(slot) {
            *last = None;
        }
        info!(slot, "Tile shows {label}");
    }
}
