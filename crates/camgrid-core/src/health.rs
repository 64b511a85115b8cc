//! Periodic health summary across all slots.

use std::time::Duration;

use tracing::{info, warn};

use crate::slot::{SlotSnapshot, SlotState};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HealthReport {
    pub total: usize,
    /// Streaming with a frame younger than the stale timeout.
    pub online: usize,
    /// Streaming, but the newest frame is older than the stale timeout.
    pub stale: usize,
    pub recovering: usize,
    pub connecting: usize,
    pub empty: usize,
    /// Slots whose capture thread exited without being told to.
    pub dead_workers: usize,
    pub cooling_down: usize,
}

impl HealthReport {
    pub fn collect(
        snapshots: &[SlotSnapshot],
        dead_workers: usize,
        cooling_down: usize,
        stale_after: Duration,
    ) -> Self {
        let stale_ms = stale_after.as_millis() as u64;
        let mut report = HealthReport {
            total: snapshots.len(),
            dead_workers,
            cooling_down,
            ..HealthReport::default()
        };

        for snapshot in snapshots {
            match snapshot.state {
                SlotState::Empty => report.empty += 1,
                SlotState::Connecting => report.connecting += 1,
                SlotState::Recovering => report.recovering += 1,
                SlotState::Streaming => match snapshot.last_frame_age_ms {
                    Some(age) if age <= stale_ms => report.online += 1,
                    _ => report.stale += 1,
                },
            }
        }
        report
    }

    pub fn is_healthy(&self) -> bool {
        self.stale == 0 && self.dead_workers == 0 && self.recovering == 0
    }

    pub fn log(&self) {
        if self.is_healthy() {
            info!(
                online = self.online,
                connecting = self.connecting,
                empty = self.empty,
                cooling_down = self.cooling_down,
                "Health: {}/{} cameras online",
                self.online,
                self.total
            );
        } else {
            warn!(
                online = self.online,
                stale = self.stale,
                recovering = self.recovering,
                dead_workers = self.dead_workers,
                cooling_down = self.cooling_down,
                "Health: {}/{} cameras online",
                self.online,
                self.total
            );
        }
    }
}
