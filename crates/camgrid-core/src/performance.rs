//! Adaptive frame-rate control.
//!
//! Samples CPU load and temperature and walks the capture and render targets
//! down under sustained stress and back up once the machine recovers. Hold
//! counts are consecutive: a sample of the other kind resets the streak.

use tracing::info;

use crate::config::{CoreConfig, PerformanceConfig};

/// One reading of system pressure. Missing sensors read as `None` and never
/// count as stress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceSample {
    /// 1-minute load average divided by CPU count, capped at 1.0.
    pub load_ratio: Option<f64>,
    pub temp_c: Option<f64>,
}

/// Capture and render rate targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FpsTargets {
    pub capture: u32,
    pub render: u32,
}

/// Source of performance samples.
pub trait SystemProbe: Send {
    fn sample(&mut self) -> PerformanceSample;
}

pub struct PerformanceController {
    config: PerformanceConfig,
    floor: FpsTargets,
    ceiling: FpsTargets,
    current: FpsTargets,
    stress_streak: u32,
    recover_streak: u32,
}

impl PerformanceController {
    pub fn new(config: &CoreConfig) -> Self {
        let ceiling = FpsTargets {
            capture: config.capture.fps,
            render: config.render.ui_fps,
        };
        let floor = FpsTargets {
            capture: config.capture.min_fps.min(ceiling.capture),
            render: config.render.min_ui_fps.min(ceiling.render),
        };
        Self {
            config: config.performance.clone(),
            floor,
            ceiling,
            current: ceiling,
            stress_streak: 0,
            recover_streak: 0,
        }
    }

    pub fn current(&self) -> FpsTargets {
        self.current
    }

    pub fn floor(&self) -> FpsTargets {
        self.floor
    }

    pub fn ceiling(&self) -> FpsTargets {
        self.ceiling
    }

    /// Keep the controller in step with targets set by command.
    pub fn sync_targets(&mut self, targets: FpsTargets) {
        self.current = FpsTargets {
            capture: targets.capture.clamp(self.floor.capture, self.ceiling.capture),
            render: targets.render.clamp(self.floor.render, self.ceiling.render),
        };
    }

    fn over_temperature(&self, sample: &PerformanceSample) -> bool {
        sample
            .temp_c
            .is_some_and(|t| t >= self.config.cpu_temp_threshold_c)
    }

    pub fn is_stressed(&self, sample: &PerformanceSample) -> bool {
        self.over_temperature(sample)
            || sample
                .load_ratio
                .is_some_and(|l| l >= self.config.cpu_load_threshold)
    }

    /// Feed one sample. Returns the new targets when they changed.
    pub fn observe(&mut self, sample: PerformanceSample) -> Option<FpsTargets> {
        if !self.config.enabled {
            return None;
        }

        if self.config.thermal_immediate && self.over_temperature(&sample) {
            self.stress_streak = 0;
            self.recover_streak = 0;
            return self.step_down(&sample);
        }

        if self.is_stressed(&sample) {
            self.stress_streak += 1;
            self.recover_streak = 0;
            if self.stress_streak >= self.config.stress_hold_count {
                self.stress_streak = 0;
                return self.step_down(&sample);
            }
        } else {
            self.recover_streak += 1;
            self.stress_streak = 0;
            if self.recover_streak >= self.config.recover_hold_count {
                self.recover_streak = 0;
                return self.step_up(&sample);
            }
        }
        None
    }

    fn step_down(&mut self, sample: &PerformanceSample) -> Option<FpsTargets> {
        let next = FpsTargets {
            capture: self
                .current
                .capture
                .saturating_sub(self.config.fps_step)
                .max(self.floor.capture),
            render: self
                .current
                .render
                .saturating_sub(self.config.ui_fps_step)
                .max(self.floor.render),
        };
        self.apply(next, "Stress detected, lowering FPS", sample)
    }

    fn step_up(&mut self, sample: &PerformanceSample) -> Option<FpsTargets> {
        let next = FpsTargets {
            capture: (self.current.capture + self.config.fps_step).min(self.ceiling.capture),
            render: (self.current.render + self.config.ui_fps_step).min(self.ceiling.render),
        };
        self.apply(next, "System recovered, raising FPS", sample)
    }

    fn apply(
        &mut self,
        next: FpsTargets,
        message: &str,
        sample: &PerformanceSample,
    ) -> Option<FpsTargets> {
        if next == self.current {
            return None;
        }
        info!(
            load = ?sample.load_ratio,
            temp_c = ?sample.temp_c,
            "{message}: capture {} -> {}, render {} -> {}",
            self.current.capture,
            next.capture,
            self.current.render,
            next.render
        );
        self.current = next;
        Some(next)
    }
}
