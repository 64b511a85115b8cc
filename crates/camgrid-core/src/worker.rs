//! Capture workers.
//!
//! One dedicated OS thread per occupied slot. The thread owns its backend
//! handle exclusively: it opens, reads, reopens and finally closes it. The
//! outside world talks to the thread only through [`WorkerShared`]: a stop
//! signal, the target FPS, a status cell, and the slot's [`LatestFrame`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{self, BackendFactory, BackendKind, OpenRequest, VideoBackend};
use crate::config::CaptureConfig;
use crate::convert::downsample_frame;
use crate::discovery::DeviceRegistry;
use crate::error::{BackendError, CaptureError, CaptureResult};
use crate::frame::LatestFrame;
use crate::types::{DeviceId, SlotIndex};

/// Interruptible stop flag. Sleeps taken through [`StopSignal::wait`] end
/// as soon as a stop is requested, so backoff never delays shutdown.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns `true` if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Lifecycle phase as seen by the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// Thread spawned, first open not yet attempted.
    Starting,
    /// Backend open, no frame delivered since.
    AwaitingFrame,
    Streaming,
    /// Backend closed after failures, waiting to reopen.
    Reopening,
    Stopped,
}

/// Snapshot the worker publishes for the main loop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    pub is_open: bool,
    pub backend: Option<BackendKind>,
    pub fps: f64,
    pub consecutive_failures: u32,
    pub open_failures: u32,
    pub reopen_count: u64,
    pub frames_delivered: u64,
    pub reason: String,
    #[serde(skip)]
    pub updated_at: Instant,
}

impl WorkerStatus {
    fn starting() -> Self {
        Self {
            phase: WorkerPhase::Starting,
            is_open: false,
            backend: None,
            fps: 0.0,
            consecutive_failures: 0,
            open_failures: 0,
            reopen_count: 0,
            frames_delivered: 0,
            reason: "starting".into(),
            updated_at: Instant::now(),
        }
    }
}

/// State shared between a capture thread and its owner.
pub(crate) struct WorkerShared {
    pub stop: StopSignal,
    pub target_fps: AtomicU32,
    pub status: Mutex<WorkerStatus>,
    pub latest: Arc<LatestFrame>,
}

impl WorkerShared {
    pub fn new(target_fps: u32, latest: Arc<LatestFrame>) -> Self {
        Self {
            stop: StopSignal::new(),
            target_fps: AtomicU32::new(target_fps.max(1)),
            status: Mutex::new(WorkerStatus::starting()),
            latest,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Achieved frame rate over windows of at least one second.
struct FpsMeter {
    window_start: Instant,
    frames: u32,
    fps: f64,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }

    fn tick(&mut self) {
        self.frames += 1;
    }

    fn sample(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            self.fps = self.frames as f64 / elapsed.as_secs_f64();
            self.frames = 0;
            self.window_start = now;
        }
        self.fps
    }
}

/// Outcome of one iteration of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Opened,
    OpenFailed,
    /// Sleeping off a reconnect backoff.
    Waiting,
    Delivered,
    ReadFailed,
    /// Failure threshold exceeded; backend closed and reopened successfully.
    Reopened,
    Stopping,
}

/// Body of a capture thread, driven one [`Step`] at a time.
pub(crate) struct CaptureLoop {
    device: DeviceId,
    config: CaptureConfig,
    factory: Arc<dyn BackendFactory>,
    registry: Arc<DeviceRegistry>,
    shared: Arc<WorkerShared>,
    backend: Option<Box<dyn VideoBackend>>,
    phase: WorkerPhase,
    consecutive_failures: u32,
    open_failures: u32,
    reopen_count: u64,
    frames_delivered: u64,
    backoff: Duration,
    next_open_at: Option<Instant>,
    last_read_at: Option<Instant>,
    applied_fps: u32,
    meter: FpsMeter,
    last_report: Instant,
    reason: String,
}

impl CaptureLoop {
    pub fn new(
        device: DeviceId,
        config: CaptureConfig,
        factory: Arc<dyn BackendFactory>,
        registry: Arc<DeviceRegistry>,
        shared: Arc<WorkerShared>,
    ) -> Self {
        let backoff = config.reconnect_backoff;
        Self {
            device,
            config,
            factory,
            registry,
            shared,
            backend: None,
            phase: WorkerPhase::Starting,
            consecutive_failures: 0,
            open_failures: 0,
            reopen_count: 0,
            frames_delivered: 0,
            backoff,
            next_open_at: None,
            last_read_at: None,
            applied_fps: 0,
            meter: FpsMeter::new(),
            last_report: Instant::now(),
            reason: "starting".into(),
        }
    }

    fn target_fps(&self) -> u32 {
        self.shared.target_fps.load(Ordering::Relaxed).max(1)
    }

    pub fn run(mut self) {
        info!(device = %self.device, "Capture thread started");
        while self.step() != Step::Stopping {}
        self.close_backend();
        self.phase = WorkerPhase::Stopped;
        self.reason = "stopped".into();
        self.report();
        info!(device = %self.device, frames = self.frames_delivered, "Capture thread stopped");
    }

    pub fn step(&mut self) -> Step {
        if self.shared.stop.is_requested() {
            return Step::Stopping;
        }

        let step = if self.backend.is_none() {
            if let Some(at) = self.next_open_at {
                let now = Instant::now();
                if now < at {
                    if self.shared.stop.wait(at - now) {
                        return Step::Stopping;
                    }
                    self.report_if_due();
                    return Step::Waiting;
                }
            }
            if self.try_open() {
                Step::Opened
            } else {
                Step::OpenFailed
            }
        } else {
            self.apply_target_fps();
            if self.pace() {
                return Step::Stopping;
            }
            self.read_once()
        };

        self.report_if_due();
        step
    }

    fn try_open(&mut self) -> bool {
        let request = OpenRequest::new(self.device.clone(), &self.config, self.target_fps());
        let opened = backend::open_preferred(
            self.factory.as_ref(),
            &request,
            self.config.use_accelerated,
        );
        match opened {
            Ok(backend) => {
                let kind = backend.kind();
                info!(device = %self.device, backend = %kind, "Device opened");
                self.backend = Some(backend);
                self.phase = WorkerPhase::AwaitingFrame;
                self.open_failures = 0;
                self.consecutive_failures = 0;
                self.backoff = self.config.reconnect_backoff;
                self.next_open_at = None;
                self.last_read_at = None;
                self.applied_fps = request.fps;
                self.reason = format!("opened via {kind}, waiting for first frame");
                self.report();
                true
            }
            Err(e) => {
                self.open_failures += 1;
                let failures = self.registry.record_failure(&self.device, Instant::now());
                let wait = self.backoff;
                self.next_open_at = Some(Instant::now() + wait);
                self.backoff = self
                    .backoff
                    .mul_f64(self.config.reconnect_backoff_multiplier)
                    .min(self.config.max_reconnect_backoff);
                self.phase = WorkerPhase::Reopening;
                self.reason = format!("open failed: {e}; retrying in {:.1}s", wait.as_secs_f64());
                warn!(
                    device = %self.device,
                    failures,
                    "Open failed, retrying in {:.1}s: {e}",
                    wait.as_secs_f64()
                );
                self.report();
                false
            }
        }
    }

    fn apply_target_fps(&mut self) {
        let target = self.target_fps();
        if target == self.applied_fps {
            return;
        }
        self.applied_fps = target;
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.set_frame_rate(target) {
                debug!(device = %self.device, "Device kept its rate, pacing to {target} fps: {e}");
            }
        }
    }

    /// Sleep out the rest of the current frame interval. Returns `true` if
    /// a stop arrived meanwhile.
    fn pace(&mut self) -> bool {
        let interval = Duration::from_secs_f64(1.0 / self.applied_fps.max(1) as f64);
        if let Some(last) = self.last_read_at {
            let elapsed = last.elapsed();
            if elapsed < interval && self.shared.stop.wait(interval - elapsed) {
                return true;
            }
        }
        self.last_read_at = Some(Instant::now());
        false
    }

    fn read_once(&mut self) -> Step {
        let result = match self.backend.as_mut() {
            Some(backend) => backend.read(),
            None => return Step::Waiting,
        };

        match result {
            Ok(frame) => {
                let frame = match self.config.downsample_max_dim {
                    Some(max_dim) => downsample_frame(frame, max_dim),
                    None => frame,
                };
                self.shared.latest.publish(frame);
                self.frames_delivered += 1;
                self.consecutive_failures = 0;
                self.meter.tick();

                if self.phase != WorkerPhase::Streaming {
                    self.phase = WorkerPhase::Streaming;
                    self.registry.record_success(&self.device);
                    self.reason = "streaming".into();
                    info!(device = %self.device, "First frame received");
                    self.report();
                }
                Step::Delivered
            }
            Err(e) => {
                self.consecutive_failures += 1;
                debug!(
                    device = %self.device,
                    failures = self.consecutive_failures,
                    "Read failed: {e}"
                );
                if self.consecutive_failures > self.config.max_consecutive_failures {
                    return self.force_reopen(&e);
                }
                Step::ReadFailed
            }
        }
    }

    /// Close the handle, reset the failure counter and make exactly one
    /// immediate open attempt. A handle that never produced a frame counts
    /// as a device failure.
    fn force_reopen(&mut self, cause: &BackendError) -> Step {
        warn!(
            device = %self.device,
            failures = self.consecutive_failures,
            "Too many read failures, reopening: {cause}"
        );
        // Opened but never delivered: as bad as failing to open
        if self.phase != WorkerPhase::Streaming {
            let failures = self.registry.record_failure(&self.device, Instant::now());
            debug!(device = %self.device, failures, "No frame since open");
        }
        self.close_backend();
        // Cleared here, in order with publishes, so the slot never shows a
        // frozen frame and never loses the first frame after the reopen
        self.shared.latest.clear();
        self.consecutive_failures = 0;
        self.reopen_count += 1;
        self.phase = WorkerPhase::Reopening;
        self.reason = format!("reopening after read failures: {cause}");
        self.report();

        if self.try_open() {
            Step::Reopened
        } else {
            Step::OpenFailed
        }
    }

    fn close_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
    }

    fn report_if_due(&mut self) {
        if self.last_report.elapsed() >= self.config.status_interval {
            self.report();
        }
    }

    fn report(&mut self) {
        let now = Instant::now();
        let status = WorkerStatus {
            phase: self.phase,
            is_open: self.backend.as_ref().is_some_and(|b| b.is_open()),
            backend: self.backend.as_ref().map(|b| b.kind()),
            fps: self.meter.sample(now),
            consecutive_failures: self.consecutive_failures,
            open_failures: self.open_failures,
            reopen_count: self.reopen_count,
            frames_delivered: self.frames_delivered,
            reason: self.reason.clone(),
            updated_at: now,
        };
        *self.shared.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.last_report = now;
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        // Also runs on unwind, so a panicking thread still frees the device
        self.close_backend();
    }
}

/// Handle to a running capture thread.
pub struct CaptureWorker {
    device: DeviceId,
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn(
        slot: SlotIndex,
        device: DeviceId,
        config: CaptureConfig,
        target_fps: u32,
        factory: Arc<dyn BackendFactory>,
        registry: Arc<DeviceRegistry>,
        latest: Arc<LatestFrame>,
    ) -> CaptureResult<Self> {
        let shared = Arc::new(WorkerShared::new(target_fps, latest));

        // Backends are not Send, so the loop is built on its own thread
        let thread = {
            let device = device.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("capture-{slot}"))
                .spawn(move || CaptureLoop::new(device, config, factory, registry, shared).run())
                .map_err(CaptureError::Spawn)?
        };

        debug!(slot, device = %device, "Capture worker spawned");
        Ok(Self {
            device,
            shared,
            thread: Some(thread),
        })
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    pub fn set_target_fps(&self, fps: u32) {
        self.shared.target_fps.store(fps.max(1), Ordering::Relaxed);
    }

    /// Ask the thread to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.shared.stop.request();
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.is_requested()
    }

    /// Whether the thread has exited, for whatever reason.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal and join. The device handle is closed once this returns.
    pub fn stop(mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(device = %self.device, "Capture thread panicked");
            }
        }
    }
}

#[cfg(test)]
impl CaptureWorker {
    /// A worker whose thread only waits for a stop, leaving `shared` to be
    /// driven by the test.
    pub(crate) fn idle(device: DeviceId, shared: Arc<WorkerShared>) -> Self {
        let waiter = shared.clone();
        let thread = thread::spawn(move || while !waiter.stop.wait(Duration::from_secs(1)) {});
        Self {
            device,
            shared,
            thread: Some(thread),
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
