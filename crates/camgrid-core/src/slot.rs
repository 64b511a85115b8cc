//! Slot state machine.
//!
//! ```text
//!   EMPTY --assign--> CONNECTING --first frame--> STREAMING
//!                        ^   \                      |
//!                        |    `--open failed--.     | read failures
//!                        |                    v     v
//!                        `----reopened---- RECOVERING
//!   any --evict/stop--> EMPTY
//! ```
//!
//! The controller lives on the main loop. It never touches the device; it
//! derives its state from the worker's published status on each sync.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::backend::BackendKind;
use crate::discovery::SlotView;
use crate::frame::{Frame, LatestFrame};
use crate::types::{DeviceId, SlotIndex};
use crate::worker::{CaptureWorker, WorkerPhase, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Empty,
    Connecting,
    Streaming,
    Recovering,
}

impl SlotState {
    /// Text shown on a tile that has no frame to draw.
    pub fn label(self) -> &'static str {
        match self {
            SlotState::Empty => "DISCONNECTED",
            SlotState::Connecting => "CONNECTING",
            SlotState::Streaming => "LIVE",
            SlotState::Recovering => "RECONNECTING",
        }
    }

    /// Slot state implied by a worker phase. `None` for a stopped worker,
    /// which the slot no longer tracks.
    pub fn for_phase(phase: WorkerPhase) -> Option<Self> {
        match phase {
            WorkerPhase::Starting | WorkerPhase::AwaitingFrame => Some(SlotState::Connecting),
            WorkerPhase::Streaming => Some(SlotState::Streaming),
            WorkerPhase::Reopening => Some(SlotState::Recovering),
            WorkerPhase::Stopped => None,
        }
    }

    fn can_become(self, next: SlotState) -> bool {
        use SlotState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Empty) => true,
            (Empty, Connecting) => true,
            (Empty, _) => false,
            (Connecting, Streaming | Recovering) => true,
            (Streaming, Recovering) => true,
            (Recovering, Connecting | Streaming) => true,
            _ => false,
        }
    }
}

/// Serializable view of one slot for status output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotSnapshot {
    pub index: SlotIndex,
    pub state: SlotState,
    pub label: &'static str,
    pub device: Option<DeviceId>,
    pub status: String,
    pub target_fps: u32,
    pub fps: f64,
    pub backend: Option<BackendKind>,
    pub consecutive_failures: u32,
    pub reopen_count: u64,
    pub frames_delivered: u64,
    pub last_frame_age_ms: Option<u64>,
    pub parked: bool,
}

pub struct SlotController {
    index: SlotIndex,
    device: Option<DeviceId>,
    state: SlotState,
    worker: Option<CaptureWorker>,
    latest: Arc<LatestFrame>,
    target_fps: u32,
    status_text: String,
    last_status: Option<WorkerStatus>,
    seen_reopens: u64,
    last_failure_at: Option<Instant>,
    worker_lost: bool,
    parked: bool,
}

impl SlotController {
    pub fn new(index: SlotIndex, target_fps: u32) -> Self {
        Self {
            index,
            device: None,
            state: SlotState::Empty,
            worker: None,
            latest: Arc::new(LatestFrame::new()),
            target_fps,
            status_text: SlotState::Empty.label().into(),
            last_status: None,
            seen_reopens: 0,
            last_failure_at: None,
            worker_lost: false,
            parked: false,
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    pub fn latest(&self) -> Arc<LatestFrame> {
        self.latest.clone()
    }

    pub fn latest_frame(&self) -> Option<(u64, Arc<Frame>)> {
        self.latest.latest_with_sequence()
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn set_parked(&mut self, parked: bool) {
        self.parked = parked;
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// The slot holds a worker whose thread is still running or was told to stop.
    pub fn worker_alive(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.is_finished() || w.stop_requested())
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            index: self.index,
            device: self.device.clone(),
            state: self.state,
            worker_alive: self.worker.is_none() || self.worker_alive(),
            parked: self.parked,
        }
    }

    /// Bind a freshly spawned worker. The slot must be empty.
    pub(crate) fn attach(&mut self, device: DeviceId, worker: CaptureWorker) {
        assert!(
            self.worker.is_none() && self.device.is_none(),
            "slot {} already holds {:?}",
            self.index,
            self.device
        );
        worker.set_target_fps(self.target_fps);
        self.device = Some(device);
        self.worker = Some(worker);
        self.last_status = None;
        self.seen_reopens = 0;
        self.worker_lost = false;
        self.parked = false;
        self.transition(SlotState::Connecting);
        self.status_text = "starting capture".into();
    }

    /// Unbind the worker and return it, already signalled to stop. The slot
    /// is EMPTY afterwards.
    pub(crate) fn detach(&mut self) -> Option<CaptureWorker> {
        let worker = self.worker.take();
        if let Some(worker) = &worker {
            worker.signal_stop();
        }
        self.transition(SlotState::Empty);
        self.device = None;
        self.last_status = None;
        // The stopping thread may still publish into the old mailbox
        self.latest.clear();
        self.latest = Arc::new(self.latest.successor());
        self.status_text = SlotState::Empty.label().into();
        worker
    }

    pub fn set_target_fps(&mut self, fps: u32) {
        self.target_fps = fps;
        if let Some(worker) = &self.worker {
            worker.set_target_fps(fps);
        }
    }

    /// Pull the worker's latest status and advance the state machine.
    /// Returns `(from, to)` when the state changed.
    pub fn sync(&mut self) -> Option<(SlotState, SlotState)> {
        let worker = self.worker.as_ref()?;
        let status = worker.status();
        let died = worker.is_finished() && !worker.stop_requested();
        let from = self.state;

        if died {
            if !self.worker_lost {
                error!(
                    slot = self.index,
                    device = ?self.device,
                    "Capture thread exited unexpectedly"
                );
                self.worker_lost = true;
                self.last_failure_at = Some(Instant::now());
            }
            self.transition(SlotState::Recovering);
            // Nothing publishes any more, so the frame can go from here
            self.latest.clear();
            self.status_text = "capture thread exited".into();
            self.last_status = Some(status);
            return (from != self.state).then_some((from, self.state));
        }

        // A reopen may complete between two syncs; pass through RECOVERING.
        // The worker clears the frame itself before reopening, so a frame
        // already published after the reopen is kept.
        if status.reopen_count > self.seen_reopens {
            self.seen_reopens = status.reopen_count;
            self.last_failure_at = Some(Instant::now());
            if self.state == SlotState::Streaming {
                self.transition(SlotState::Recovering);
            }
        }
        if status.phase == WorkerPhase::Reopening && self.state != SlotState::Recovering {
            self.last_failure_at = Some(Instant::now());
        }

        if let Some(next) = SlotState::for_phase(status.phase) {
            self.transition(next);
        }
        self.status_text = status.reason.clone();
        self.last_status = Some(status);

        (from != self.state).then_some((from, self.state))
    }

    fn transition(&mut self, next: SlotState) {
        let from = self.state;
        if from == next {
            return;
        }
        assert!(
            from.can_become(next),
            "slot {}: illegal transition {from:?} -> {next:?}",
            self.index
        );
        self.state = next;
        info!(
            slot = self.index,
            device = ?self.device.as_ref().map(ToString::to_string),
            "{} -> {}",
            from.label(),
            next.label()
        );
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let status = self.last_status.as_ref();
        SlotSnapshot {
            index: self.index,
            state: self.state,
            label: self.state.label(),
            device: self.device.clone(),
            status: self.status_text.clone(),
            target_fps: self.target_fps,
            fps: status.map_or(0.0, |s| s.fps),
            backend: status.and_then(|s| s.backend),
            consecutive_failures: status.map_or(0, |s| s.consecutive_failures),
            reopen_count: status.map_or(0, |s| s.reopen_count),
            frames_delivered: status.map_or(0, |s| s.frames_delivered),
            last_frame_age_ms: self
                .latest
                .take_latest()
                .map(|f| f.age().as_millis() as u64),
            parked: self.parked,
        }
    }
}

impl Drop for SlotController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}
