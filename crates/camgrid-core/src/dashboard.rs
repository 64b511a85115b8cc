//! Command surface of the capture core.
//!
//! The dashboard owns the fixed set of slots and the workers behind them,
//! and is driven from a single main loop: discovery scans, state syncs,
//! frame-rate changes and user commands all go through `&mut self`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::BackendFactory;
use crate::config::CoreConfig;
use crate::discovery::{
    DeviceEnumerator, DeviceReclaimer, DeviceRegistry, DiscoveryManager, ScanPlan,
};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::health::HealthReport;
use crate::performance::FpsTargets;
use crate::render::FrameSource;
use crate::slot::{SlotController, SlotSnapshot, SlotState};
use crate::types::{DeviceId, SlotIndex};
use crate::worker::CaptureWorker;

pub struct Dashboard {
    config: CoreConfig,
    slots: Vec<SlotController>,
    registry: Arc<DeviceRegistry>,
    factory: Arc<dyn BackendFactory>,
    discovery: DiscoveryManager,
    /// Evicted workers whose threads have not exited yet.
    retiring: Vec<CaptureWorker>,
    targets: FpsTargets,
}

impl Dashboard {
    pub fn new(
        config: CoreConfig,
        factory: Arc<dyn BackendFactory>,
        enumerator: Box<dyn DeviceEnumerator>,
        reclaimer: Box<dyn DeviceReclaimer>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let discovery = DiscoveryManager::new(
            config.discovery.clone(),
            enumerator,
            reclaimer,
            registry.clone(),
        );
        let targets = FpsTargets {
            capture: config.capture.fps,
            render: config.render.ui_fps,
        };
        let slots = (0..config.slot_count)
            .map(|index| SlotController::new(index, targets.capture))
            .collect();

        info!(
            slots = config.slot_count,
            "Dashboard ready: {}x{} @ {} fps, render {} fps",
            config.capture.width,
            config.capture.height,
            targets.capture,
            targets.render
        );

        Self {
            config,
            slots,
            registry,
            factory,
            discovery,
            retiring: Vec::new(),
            targets,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn targets(&self) -> FpsTargets {
        self.targets
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn slot(&self, slot: SlotIndex) -> CaptureResult<&SlotController> {
        self.slots.get(slot).ok_or(CaptureError::UnknownSlot(slot))
    }

    /// Bind `device` to an empty slot and start capturing. Path ids that
    /// alias a `videoN` node are stored as that node's index.
    ///
    /// # Panics
    ///
    /// If the slot already holds a device; evict it first.
    pub fn assign_device(&mut self, slot: SlotIndex, device: DeviceId) -> CaptureResult<()> {
        let controller = self.slot(slot)?;
        assert!(
            controller.device().is_none(),
            "slot {slot} is already assigned to {:?}",
            controller.device()
        );

        let device = device.canonical();
        self.registry.claim(&device, slot, Instant::now())?;
        self.slots[slot].set_parked(false);
        if let Err(e) = self.start_worker(slot, device.clone()) {
            self.registry.release(&device);
            return Err(e);
        }
        info!(slot, device = %device, "Device assigned");
        Ok(())
    }

    fn start_worker(&mut self, slot: SlotIndex, device: DeviceId) -> CaptureResult<()> {
        let worker = CaptureWorker::spawn(
            slot,
            device.clone(),
            self.config.capture.clone(),
            self.targets.capture,
            self.factory.clone(),
            self.registry.clone(),
            self.slots[slot].latest(),
        )?;
        self.slots[slot].attach(device, worker);
        Ok(())
    }

    /// Signal the slot's worker to stop and empty the slot without waiting
    /// for the thread. The device stays unassignable until the thread has
    /// released it.
    pub fn evict(&mut self, slot: SlotIndex) -> CaptureResult<()> {
        self.slot(slot)?;
        self.retire(slot);
        Ok(())
    }

    fn retire(&mut self, slot: SlotIndex) {
        if let Some(worker) = self.slots[slot].detach() {
            info!(slot, device = %worker.device(), "Slot evicted");
            self.registry.mark_releasing(worker.device());
            self.retiring.push(worker);
        }
    }

    /// Stop the slot's worker and wait until its device handle is closed.
    /// The slot is parked: discovery leaves it empty until a device is
    /// assigned to it explicitly.
    pub fn request_stop(&mut self, slot: SlotIndex) -> CaptureResult<()> {
        self.slot(slot)?;
        self.slots[slot].set_parked(true);
        if let Some(worker) = self.slots[slot].detach() {
            let device = worker.device().clone();
            self.registry.mark_releasing(&device);
            worker.stop();
            self.registry.release(&device);
            info!(slot, device = %device, "Slot stopped");
        }
        Ok(())
    }

    /// Clamp and apply new capture and render targets to every slot.
    /// Returns what was applied.
    pub fn set_target_fps(&mut self, capture: u32, render: u32) -> FpsTargets {
        let capture_floor = self.config.capture.min_fps.min(self.config.capture.fps);
        let render_floor = self.config.render.min_ui_fps.min(self.config.render.ui_fps);
        let targets = FpsTargets {
            capture: capture.clamp(capture_floor, self.config.capture.fps),
            render: render.clamp(render_floor, self.config.render.ui_fps),
        };
        if targets != self.targets {
            debug!(capture = targets.capture, render = targets.render, "Applying FPS targets");
        }
        self.targets = targets;
        for slot in &mut self.slots {
            slot.set_target_fps(targets.capture);
        }
        targets
    }

    pub fn snapshot(&self, slot: SlotIndex) -> CaptureResult<SlotSnapshot> {
        Ok(self.slot(slot)?.snapshot())
    }

    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        self.slots.iter().map(SlotController::snapshot).collect()
    }

    pub fn slot_state(&self, slot: SlotIndex) -> CaptureResult<SlotState> {
        Ok(self.slot(slot)?.state())
    }

    pub fn latest_frame(&self, slot: SlotIndex) -> Option<(u64, Arc<Frame>)> {
        self.slots.get(slot)?.latest_frame()
    }

    /// Refresh every slot from its worker and reap retired workers that
    /// have exited. Returns the state changes observed.
    pub fn sync_slots(&mut self) -> Vec<(SlotIndex, SlotState, SlotState)> {
        self.reap_retiring();
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.sync().map(|(from, to)| (slot.index(), from, to)))
            .collect()
    }

    fn reap_retiring(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) = self
            .retiring
            .drain(..)
            .partition(CaptureWorker::is_finished);
        self.retiring = pending;

        for worker in done {
            let device = worker.device().clone();
            worker.stop();
            self.registry.release(&device);
            debug!(device = %device, "Device released");
        }
    }

    /// Run one discovery scan and apply its plan.
    pub fn run_discovery(&mut self, now: Instant) -> ScanPlan {
        self.sync_slots();
        let views: Vec<_> = self.slots.iter().map(SlotController::view).collect();
        let plan = self.discovery.scan(&views, now);

        for eviction in &plan.evictions {
            warn!(
                slot = eviction.slot,
                device = %eviction.device,
                reason = ?eviction.reason,
                "Evicting device"
            );
            self.retire(eviction.slot);
        }

        for (slot, device) in &plan.assignments {
            info!(slot, device = %device, "Assigning discovered device");
            if let Err(e) = self.start_worker(*slot, device.clone()) {
                error!(slot, device = %device, "Failed to start capture: {e}");
                self.registry.release(device);
            }
        }
        plan
    }

    pub fn health(&self, now: Instant) -> HealthReport {
        let dead_workers = self
            .slots
            .iter()
            .filter(|s| s.has_worker() && !s.worker_alive())
            .count();
        HealthReport::collect(
            &self.snapshots(),
            dead_workers,
            self.registry.cooling_down(now),
            self.config.health.stale_frame_timeout,
        )
    }

    /// Stop every worker and wait for all device handles to close.
    pub fn shutdown(&mut self) {
        let mut workers: Vec<CaptureWorker> = self
            .slots
            .iter_mut()
            .filter_map(SlotController::detach)
            .collect();
        workers.append(&mut self.retiring);
        if workers.is_empty() {
            return;
        }

        info!(workers = workers.len(), "Stopping capture workers");
        // detach already signalled each one, so the joins overlap
        for worker in workers {
            let device = worker.device().clone();
            worker.stop();
            self.registry.release(&device);
        }
    }
}

impl FrameSource for Dashboard {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn latest(&self, slot: SlotIndex) -> Option<(u64, Arc<Frame>)> {
        self.latest_frame(slot)
    }

    fn state(&self, slot: SlotIndex) -> SlotState {
        self.slot_state(slot).unwrap_or(SlotState::Empty)
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DeviceOwner, EvictReason};
    use crate::testing::{wait_until, NoopReclaimer, ScriptedFactory, StaticEnumerator};
    use std::time::Duration;

    fn config(slots: usize) -> CoreConfig {
        let mut config = CoreConfig {
            slot_count: slots,
            ..CoreConfig::default()
        };
        config.capture.reconnect_backoff = Duration::from_millis(10);
        config.capture.max_reconnect_backoff = Duration::from_millis(20);
        config
    }

    fn dashboard(
        slots: usize,
        factory: Arc<ScriptedFactory>,
        enumerator: StaticEnumerator,
    ) -> Dashboard {
        with_config(config(slots), factory, enumerator)
    }

    fn with_config(
        config: CoreConfig,
        factory: Arc<ScriptedFactory>,
        enumerator: StaticEnumerator,
    ) -> Dashboard {
        Dashboard::new(
            config,
            factory,
            Box::new(enumerator),
            Box::new(NoopReclaimer::default()),
        )
    }

    fn settle(dashboard: &mut Dashboard, slot: SlotIndex, state: SlotState) -> bool {
        wait_until(Duration::from_secs(2), || {
            dashboard.sync_slots();
            dashboard.slot_state(slot).ok() == Some(state)
        })
    }

    #[test]
    fn test_unknown_slot() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(2, factory, StaticEnumerator::default());
        assert!(matches!(
            d.assign_device(5, DeviceId::Index(0)),
            Err(CaptureError::UnknownSlot(5))
        ));
        assert!(matches!(d.evict(2), Err(CaptureError::UnknownSlot(2))));
        assert!(matches!(d.request_stop(9), Err(CaptureError::UnknownSlot(9))));
        assert!(d.snapshot(3).is_err());
    }

    #[test]
    fn test_startup_scan_fills_slots_in_order() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(3, factory, StaticEnumerator::new(&[0, 1]));
        let plan = d.run_discovery(Instant::now());
        assert_eq!(plan.assignments.len(), 2);

        assert!(settle(&mut d, 0, SlotState::Streaming));
        assert!(settle(&mut d, 1, SlotState::Streaming));
        assert_eq!(d.slot_state(2).unwrap(), SlotState::Empty);
        assert_eq!(d.snapshot(1).unwrap().device, Some(DeviceId::Index(1)));
    }

    #[test]
    fn test_hotplugged_camera_fills_third_slot() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let enumerator = StaticEnumerator::new(&[0, 1]);
        let mut d = dashboard(3, factory, enumerator.clone());
        d.run_discovery(Instant::now());
        assert!(settle(&mut d, 1, SlotState::Streaming));

        enumerator.set(&[0, 1, 2]);
        let plan = d.run_discovery(Instant::now());
        assert_eq!(plan.assignments, vec![(2, DeviceId::Index(2))]);
        assert_eq!(d.slot_state(2).unwrap(), SlotState::Connecting);
        assert!(settle(&mut d, 2, SlotState::Streaming));
    }

    #[test]
    fn test_failing_device_recovers_then_cools_down() {
        let factory = Arc::new(ScriptedFactory::generic(false, true));
        let counters = factory.generic_counters();
        let mut d = dashboard(1, factory, StaticEnumerator::new(&[0]));
        d.run_discovery(Instant::now());
        assert!(settle(&mut d, 0, SlotState::Recovering));

        assert!(wait_until(Duration::from_secs(2), || {
            d.registry().failure_count(&DeviceId::Index(0)) >= 3
        }));
        let plan = d.run_discovery(Instant::now());
        assert_eq!(plan.evictions.len(), 1);
        assert!(plan.assignments.is_empty());
        assert_eq!(d.slot_state(0).unwrap(), SlotState::Empty);
        assert!(d.registry().in_cooldown(&DeviceId::Index(0), Instant::now()));
        assert_eq!(counters.opens(), 0);

        // Still cooling down on the next scan
        assert!(d.run_discovery(Instant::now()).assignments.is_empty());
    }

    #[test]
    fn test_device_that_never_delivers_is_evicted() {
        let mut config = config(1);
        config.capture.fps = 60;
        config.capture.max_consecutive_failures = 2;
        let factory = Arc::new(ScriptedFactory::generic(true, false));
        let counters = factory.generic_counters();
        let mut d = with_config(config, factory, StaticEnumerator::new(&[0, 1]));
        d.run_discovery(Instant::now());

        assert!(wait_until(Duration::from_secs(2), || {
            d.sync_slots();
            d.registry().failure_count(&DeviceId::Index(0)) >= 3
        }));
        assert!(counters.opens() >= 3);
        assert_ne!(d.slot_state(0).unwrap(), SlotState::Streaming);

        let plan = d.run_discovery(Instant::now());
        assert_eq!(plan.evictions.len(), 1);
        assert_eq!(plan.evictions[0].device, DeviceId::Index(0));
        assert!(matches!(plan.evictions[0].reason, EvictReason::RepeatedFailures(_)));
        assert!(d.registry().in_cooldown(&DeviceId::Index(0), Instant::now()));
        assert_eq!(plan.assignments, vec![(0, DeviceId::Index(1))]);
    }

    #[test]
    fn test_cooling_device_waits_for_its_retiring_worker() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let counters = factory.generic_counters();
        let mut d = dashboard(1, factory.clone(), StaticEnumerator::new(&[0]));
        let device = DeviceId::Index(0);
        let start = Instant::now();
        d.run_discovery(start);
        assert!(settle(&mut d, 0, SlotState::Streaming));

        // Park the capture thread inside a slow read
        factory.edit_generic(|s| s.read_delay = Duration::from_millis(800));
        let reads = counters.reads();
        assert!(wait_until(Duration::from_secs(1), || counters.reads() > reads));

        for _ in 0..3 {
            d.registry().record_failure(&device, start);
        }
        let plan = d.run_discovery(start);
        assert_eq!(plan.evictions.len(), 1);
        assert!(plan.assignments.is_empty());
        assert_eq!(d.registry().owner(&device), Some(DeviceOwner::Releasing));

        // Cooling down and still held by the old thread
        let during = d.run_discovery(start + Duration::from_secs(10));
        assert!(during.assignments.is_empty());
        assert!(d.registry().in_cooldown(&device, start + Duration::from_secs(10)));

        // Cooldown over, but the handle is still open
        let expired = d.run_discovery(start + Duration::from_secs(31));
        assert!(expired.assignments.is_empty());
        assert_eq!(counters.live_handles(), 1);
        assert_eq!(d.registry().owner(&device), Some(DeviceOwner::Releasing));

        assert!(wait_until(Duration::from_secs(2), || {
            d.sync_slots();
            counters.live_handles() == 0
                && d.registry().owner(&device) == Some(DeviceOwner::Unowned)
        }));
        factory.edit_generic(|s| s.read_delay = Duration::ZERO);
        let plan = d.run_discovery(start + Duration::from_secs(32));
        assert_eq!(plan.assignments, vec![(0, device)]);
    }

    #[test]
    fn test_unlisted_path_device_keeps_its_slot() {
        let factory = Arc::new(ScriptedFactory::generic(true, false));
        let mut d = dashboard(1, factory, StaticEnumerator::new(&[0]));
        let path = DeviceId::Path("/nonexistent/by-id/usb-cam".into());
        d.assign_device(0, path.clone()).unwrap();
        assert_eq!(d.slot_state(0).unwrap(), SlotState::Connecting);

        let plan = d.run_discovery(Instant::now());
        assert!(plan.is_empty());
        assert_eq!(d.snapshot(0).unwrap().device, Some(path));
    }

    #[test]
    #[cfg(unix)]
    fn test_path_alias_claims_the_indexed_device() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = dir.path().join("video3");
        let alias = dir.path().join("usb-cam-video-index0");
        std::fs::write(&node, b"").unwrap();
        std::os::unix::fs::symlink(&node, &alias).unwrap();

        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(2, factory, StaticEnumerator::default());
        d.assign_device(0, DeviceId::Path(alias.to_string_lossy().into_owned()))
            .unwrap();
        assert_eq!(d.snapshot(0).unwrap().device, Some(DeviceId::Index(3)));
        assert!(matches!(
            d.assign_device(1, DeviceId::Index(3)),
            Err(CaptureError::DeviceBusy(_))
        ));
    }

    #[test]
    fn test_request_stop_releases_handle_and_parks() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let counters = factory.generic_counters();
        let mut d = dashboard(1, factory, StaticEnumerator::new(&[0]));
        d.run_discovery(Instant::now());
        assert!(settle(&mut d, 0, SlotState::Streaming));

        d.request_stop(0).unwrap();
        assert_eq!(counters.opens(), counters.closes());
        assert_eq!(d.slot_state(0).unwrap(), SlotState::Empty);
        assert!(d.latest_frame(0).is_none());
        assert_eq!(d.registry().owner(&DeviceId::Index(0)), Some(DeviceOwner::Unowned));

        // Parked: discovery leaves it alone
        assert!(d.run_discovery(Instant::now()).assignments.is_empty());

        d.assign_device(0, DeviceId::Index(0)).unwrap();
        assert!(settle(&mut d, 0, SlotState::Streaming));
    }

    #[test]
    fn test_evict_is_fire_and_forget() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let counters = factory.generic_counters();
        let mut d = dashboard(2, factory, StaticEnumerator::default());
        d.assign_device(0, DeviceId::Index(0)).unwrap();
        assert!(settle(&mut d, 0, SlotState::Streaming));

        d.evict(0).unwrap();
        assert_eq!(d.slot_state(0).unwrap(), SlotState::Empty);
        assert_eq!(d.registry().owner(&DeviceId::Index(0)), Some(DeviceOwner::Releasing));
        assert!(matches!(
            d.assign_device(1, DeviceId::Index(0)),
            Err(CaptureError::DeviceBusy(_))
        ));

        assert!(wait_until(Duration::from_secs(2), || {
            d.sync_slots();
            counters.live_handles() == 0
                && d.registry().owner(&DeviceId::Index(0)) != Some(DeviceOwner::Releasing)
        }));
    }

    #[test]
    fn test_assign_rejects_busy_and_cooling_devices() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(2, factory, StaticEnumerator::default());
        d.assign_device(0, DeviceId::Index(3)).unwrap();
        assert!(matches!(
            d.assign_device(1, DeviceId::Index(3)),
            Err(CaptureError::DeviceBusy(_))
        ));

        let now = Instant::now();
        d.registry().start_cooldown(&DeviceId::Index(3), now + Duration::from_secs(30));
        d.request_stop(0).unwrap();
        assert!(matches!(
            d.assign_device(1, DeviceId::Index(3)),
            Err(CaptureError::DeviceCoolingDown(_))
        ));
    }

    #[test]
    #[should_panic(expected = "already assigned")]
    fn test_assign_to_occupied_slot_panics() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(1, factory, StaticEnumerator::default());
        d.assign_device(0, DeviceId::Index(0)).unwrap();
        let _ = d.assign_device(0, DeviceId::Index(1));
    }

    #[test]
    fn test_set_target_fps_clamps_and_propagates() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(2, factory, StaticEnumerator::default());
        d.assign_device(0, DeviceId::Index(0)).unwrap();

        let applied = d.set_target_fps(1, 100);
        assert_eq!(applied, FpsTargets { capture: 5, render: 15 });
        assert_eq!(d.targets(), applied);
        assert_eq!(d.snapshot(0).unwrap().target_fps, 5);
        assert_eq!(d.snapshot(1).unwrap().target_fps, 5);
    }

    #[test]
    fn test_unplug_while_connecting_empties_slot() {
        let factory = Arc::new(ScriptedFactory::generic(false, true));
        let enumerator = StaticEnumerator::new(&[0]);
        let mut d = dashboard(1, factory, enumerator.clone());
        d.run_discovery(Instant::now());

        enumerator.set(&[]);
        let plan = d.run_discovery(Instant::now());
        assert_eq!(plan.evictions.len(), 1);
        assert_eq!(d.slot_state(0).unwrap(), SlotState::Empty);
    }

    #[test]
    fn test_shutdown_closes_every_handle() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let counters = factory.generic_counters();
        let mut d = dashboard(3, factory, StaticEnumerator::new(&[0, 1, 2]));
        d.run_discovery(Instant::now());
        assert!(settle(&mut d, 2, SlotState::Streaming));

        d.shutdown();
        assert_eq!(counters.live_handles(), 0);
        assert!(d.snapshots().iter().all(|s| s.state == SlotState::Empty));
    }

    #[test]
    fn test_health_counts_streaming_slots() {
        let factory = Arc::new(ScriptedFactory::generic(true, true));
        let mut d = dashboard(2, factory, StaticEnumerator::new(&[0]));
        d.run_discovery(Instant::now());
        assert!(settle(&mut d, 0, SlotState::Streaming));

        let report = d.health(Instant::now());
        assert_eq!(report.total, 2);
        assert_eq!(report.online, 1);
        assert_eq!(report.empty, 1);
    }
}
