//! Device discovery, hot-plug and assignment.
//!
//! [`DeviceRegistry`] is the single source of truth for device ownership and
//! is shared with the capture threads, which report open failures into it.
//! [`DiscoveryManager`] runs a periodic scan on the main loop and produces a
//! [`ScanPlan`] of evictions and assignments for the dashboard to apply.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::slot::SlotState;
use crate::types::{DeviceId, SlotIndex};

/// Who holds a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "slot")]
pub enum DeviceOwner {
    Unowned,
    Slot(SlotIndex),
    /// Worker told to stop, handle not yet closed.
    Releasing,
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub last_seen: Instant,
    /// Seen in the most recent scan.
    pub present: bool,
    /// Listed by enumeration at least once. Explicitly assigned devices
    /// may never be.
    pub seen: bool,
    pub missed_scans: u32,
    /// Failed opens, and opens that never produced a frame, since the last
    /// delivered frame.
    pub failure_count: u32,
    pub cooldown_until: Option<Instant>,
    pub owner: DeviceOwner,
}

impl DeviceRecord {
    fn new(id: DeviceId, now: Instant) -> Self {
        Self {
            id,
            last_seen: now,
            present: false,
            seen: false,
            missed_scans: 0,
            failure_count: 0,
            cooldown_until: None,
            owner: DeviceOwner::Unowned,
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Known devices keyed by id, iterated in ascending id order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceId, DeviceRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one enumeration result into the registry. Returns the devices
    /// dropped because they went unseen for `forget_after` scans while no
    /// slot held them.
    pub fn observe_scan(
        &self,
        present: &[DeviceId],
        now: Instant,
        forget_after: u32,
    ) -> Vec<DeviceId> {
        let mut records = self.lock();

        for id in present {
            let record = records
                .entry(id.clone())
                .or_insert_with(|| DeviceRecord::new(id.clone(), now));
            record.present = true;
            record.seen = true;
            record.last_seen = now;
            record.missed_scans = 0;
        }

        let mut forgotten = Vec::new();
        for record in records.values_mut() {
            if record.cooldown_until.is_some_and(|until| now >= until) {
                debug!(device = %record.id, "Cooldown expired");
                record.cooldown_until = None;
            }
            if !present.contains(&record.id) {
                record.present = false;
                record.missed_scans += 1;
                if record.owner == DeviceOwner::Unowned && record.missed_scans >= forget_after {
                    forgotten.push(record.id.clone());
                }
            }
        }
        for id in &forgotten {
            records.remove(id);
        }
        forgotten
    }

    /// Present, unowned and not cooling down.
    pub fn is_assignable(&self, id: &DeviceId, now: Instant) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|r| r.present && r.owner == DeviceOwner::Unowned && !r.in_cooldown(now))
    }

    /// Atomically give `id` to `slot`. Devices not yet in the registry are
    /// added, so explicitly assigned devices need not have been scanned.
    pub fn claim(&self, id: &DeviceId, slot: SlotIndex, now: Instant) -> CaptureResult<()> {
        let mut records = self.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| DeviceRecord::new(id.clone(), now));

        if record.in_cooldown(now) {
            return Err(CaptureError::DeviceCoolingDown(id.clone()));
        }
        if record.owner != DeviceOwner::Unowned {
            return Err(CaptureError::DeviceBusy(id.clone()));
        }
        record.owner = DeviceOwner::Slot(slot);
        Ok(())
    }

    /// Claim for automatic assignment, which only takes present devices.
    pub fn try_claim(&self, id: &DeviceId, slot: SlotIndex, now: Instant) -> bool {
        if !self.is_assignable(id, now) {
            return false;
        }
        self.claim(id, slot, now).is_ok()
    }

    pub fn mark_releasing(&self, id: &DeviceId) {
        if let Some(record) = self.lock().get_mut(id) {
            record.owner = DeviceOwner::Releasing;
        }
    }

    /// The handle is closed; the device may be assigned again.
    pub fn release(&self, id: &DeviceId) {
        if let Some(record) = self.lock().get_mut(id) {
            record.owner = DeviceOwner::Unowned;
        }
    }

    pub fn start_cooldown(&self, id: &DeviceId, until: Instant) {
        if let Some(record) = self.lock().get_mut(id) {
            record.cooldown_until = Some(until);
            record.failure_count = 0;
        }
    }

    /// Count an open failure. Returns the new total. Failures reported
    /// while the device cools down are not counted.
    pub fn record_failure(&self, id: &DeviceId, now: Instant) -> u32 {
        let mut records = self.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| DeviceRecord::new(id.clone(), now));
        if !record.in_cooldown(now) {
            record.failure_count += 1;
        }
        record.failure_count
    }

    pub fn record_success(&self, id: &DeviceId) {
        if let Some(record) = self.lock().get_mut(id) {
            record.failure_count = 0;
        }
    }

    pub fn failure_count(&self, id: &DeviceId) -> u32 {
        self.lock().get(id).map_or(0, |r| r.failure_count)
    }

    /// Whether enumeration has ever listed `id`.
    pub fn was_seen(&self, id: &DeviceId) -> bool {
        self.lock().get(id).is_some_and(|r| r.seen)
    }

    pub fn owner(&self, id: &DeviceId) -> Option<DeviceOwner> {
        self.lock().get(id).map(|r| r.owner)
    }

    pub fn in_cooldown(&self, id: &DeviceId, now: Instant) -> bool {
        self.lock().get(id).is_some_and(|r| r.in_cooldown(now))
    }

    pub fn cooling_down(&self, now: Instant) -> usize {
        self.lock().values().filter(|r| r.in_cooldown(now)).count()
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.lock().values().cloned().collect()
    }
}

/// Lists the camera devices currently attached.
pub trait DeviceEnumerator: Send {
    fn enumerate(&mut self) -> Vec<DeviceId>;
}

/// Frees a device node held by another process.
pub trait DeviceReclaimer: Send {
    /// Returns `true` if any holder was signalled.
    fn reclaim(&mut self, device: &DeviceId) -> std::io::Result<bool>;
}

/// What discovery needs to know about a slot.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub index: SlotIndex,
    pub device: Option<DeviceId>,
    pub state: SlotState,
    pub worker_alive: bool,
    /// Stopped by command; excluded from automatic assignment.
    pub parked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    RepeatedFailures(u32),
    DeviceGone,
    WorkerDied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub slot: SlotIndex,
    pub device: DeviceId,
    pub reason: EvictReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPlan {
    pub evictions: Vec<Eviction>,
    pub assignments: Vec<(SlotIndex, DeviceId)>,
}

impl ScanPlan {
    pub fn is_empty(&self) -> bool {
        self.evictions.is_empty() && self.assignments.is_empty()
    }
}

pub struct DiscoveryManager {
    config: DiscoveryConfig,
    enumerator: Box<dyn DeviceEnumerator>,
    reclaimer: Box<dyn DeviceReclaimer>,
    registry: Arc<DeviceRegistry>,
    scans: u64,
    last_present: Vec<DeviceId>,
}

impl DiscoveryManager {
    pub fn new(
        config: DiscoveryConfig,
        enumerator: Box<dyn DeviceEnumerator>,
        reclaimer: Box<dyn DeviceReclaimer>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            config,
            enumerator,
            reclaimer,
            registry,
            scans: 0,
            last_present: Vec::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn scans(&self) -> u64 {
        self.scans
    }

    /// Devices seen by the most recent scan, ascending.
    pub fn present(&self) -> &[DeviceId] {
        &self.last_present
    }

    /// Enumerate devices and decide evictions and assignments.
    ///
    /// Cooldowns are started here. Ownership changes for evicted slots are
    /// left to whoever applies the plan; assigned devices are already
    /// claimed for their slot when the plan is returned.
    pub fn scan(&mut self, slots: &[SlotView], now: Instant) -> ScanPlan {
        self.scans += 1;

        let mut present = self.enumerator.enumerate();
        present.sort();
        present.dedup();

        if present != self.last_present {
            info!(
                "Devices present: [{}]",
                present.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            );
        }

        for id in self.registry.observe_scan(&present, now, self.config.forget_after_scans) {
            debug!(device = %id, "Forgot device");
        }

        let mut plan = ScanPlan::default();
        let mut free_slots = Vec::new();

        for view in slots {
            let Some(device) = &view.device else {
                if !view.parked {
                    free_slots.push(view.index);
                }
                continue;
            };

            let Some(reason) = self.eviction_reason(view, device, &present) else {
                continue;
            };

            if matches!(reason, EvictReason::RepeatedFailures(_) | EvictReason::WorkerDied) {
                self.registry
                    .start_cooldown(device, now + self.config.failed_device_cooldown);
                info!(
                    device = %device,
                    "Cooling down for {}s",
                    self.config.failed_device_cooldown.as_secs()
                );
            }
            plan.evictions.push(Eviction {
                slot: view.index,
                device: device.clone(),
                reason,
            });
            if !view.parked {
                free_slots.push(view.index);
            }
        }
        free_slots.sort_unstable();

        let mut skipped: Vec<DeviceId> = Vec::new();
        for slot in free_slots {
            let candidate = present
                .iter()
                .find(|id| !skipped.contains(id) && self.registry.is_assignable(id, now))
                .cloned();
            let Some(device) = candidate else {
                break;
            };

            if self.config.reclaim_device_holders {
                match self.reclaimer.reclaim(&device) {
                    Ok(true) => info!(device = %device, "Reclaimed device from other processes"),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            device = %device,
                            "Could not reclaim device, leaving slot {slot} empty: {e}"
                        );
                        skipped.push(device);
                        continue;
                    }
                }
            }

            if self.registry.try_claim(&device, slot, now) {
                plan.assignments.push((slot, device));
            } else {
                skipped.push(device);
            }
        }

        self.last_present = present;
        plan
    }

    fn eviction_reason(
        &self,
        view: &SlotView,
        device: &DeviceId,
        present: &[DeviceId],
    ) -> Option<EvictReason> {
        let failures = self.registry.failure_count(device);
        // Devices enumeration never listed are judged by their failures alone
        let gone = !present.contains(device) && self.registry.was_seen(device);
        if failures >= self.config.max_open_failures {
            Some(EvictReason::RepeatedFailures(failures))
        } else if !view.worker_alive {
            Some(EvictReason::WorkerDied)
        } else if gone && view.state != SlotState::Streaming {
            Some(EvictReason::DeviceGone)
        } else {
            None
        }
    }
}
