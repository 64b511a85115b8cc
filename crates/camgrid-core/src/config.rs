//! Configuration consumed by the capture core.
//!
//! Values arrive pre-validated from the settings loader; nothing here clamps
//! user input. The structs are handed to each component at construction and
//! are only changed afterwards through `Dashboard::set_target_fps`.

use std::time::Duration;

pub const DEFAULT_SLOT_COUNT: usize = 3;
pub const DEFAULT_CAPTURE_WIDTH: u32 = 640;
pub const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
pub const DEFAULT_CAPTURE_FPS: u32 = 20;
pub const DEFAULT_UI_FPS: u32 = 15;
pub const DEFAULT_MIN_DYNAMIC_FPS: u32 = 5;
pub const DEFAULT_MIN_DYNAMIC_UI_FPS: u32 = 10;

/// Consecutive read failures tolerated before the backend is reopened.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// Configured capture rate, also the ceiling for dynamic adjustment.
    pub fps: u32,
    /// Floor for dynamic adjustment.
    pub min_fps: u32,
    pub max_consecutive_failures: u32,
    pub reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
    pub reconnect_backoff_multiplier: f64,
    /// Minimum cadence at which a worker refreshes its status cell.
    pub status_interval: Duration,
    /// Try the accelerated pipeline before the generic path.
    pub use_accelerated: bool,
    /// Decode MJPEG with libav instead of the stock JPEG decoder.
    pub use_avdec: bool,
    /// Longest edge of published frames; larger frames are downscaled.
    pub downsample_max_dim: Option<u32>,
    /// Upper bound on a single blocking read for backends that support it.
    pub read_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            fps: DEFAULT_CAPTURE_FPS,
            min_fps: DEFAULT_MIN_DYNAMIC_FPS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(10),
            reconnect_backoff_multiplier: 1.5,
            status_interval: Duration::from_secs(1),
            use_accelerated: true,
            use_avdec: false,
            downsample_max_dim: Some(DEFAULT_CAPTURE_WIDTH),
            read_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub rescan_interval: Duration,
    pub failed_device_cooldown: Duration,
    /// Open failures on one device before it is evicted and cooled down.
    pub max_open_failures: u32,
    /// Scans a device may go unseen before its record is dropped.
    pub forget_after_scans: u32,
    pub reclaim_device_holders: bool,
    /// Time between SIGTERM and SIGKILL when reclaiming a device node.
    pub reclaim_grace: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rescan_interval: Duration::from_secs(15),
            failed_device_cooldown: Duration::from_secs(30),
            max_open_failures: 3,
            forget_after_scans: 3,
            reclaim_device_holders: false,
            reclaim_grace: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// Load average divided by CPU count.
    pub cpu_load_threshold: f64,
    pub cpu_temp_threshold_c: f64,
    pub stress_hold_count: u32,
    pub recover_hold_count: u32,
    pub fps_step: u32,
    pub ui_fps_step: u32,
    /// Step down on the first over-temperature sample instead of waiting
    /// for the stress hold count.
    pub thermal_immediate: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(2),
            cpu_load_threshold: 0.85,
            cpu_temp_threshold_c: 70.0,
            stress_hold_count: 2,
            recover_hold_count: 3,
            fps_step: 2,
            ui_fps_step: 2,
            thermal_immediate: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Configured render rate, also the ceiling for dynamic adjustment.
    pub ui_fps: u32,
    pub min_ui_fps: u32,
    pub stats_interval: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ui_fps: DEFAULT_UI_FPS,
            min_ui_fps: DEFAULT_MIN_DYNAMIC_UI_FPS,
            stats_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub log_interval: Duration,
    pub stale_frame_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            log_interval: Duration::from_secs(30),
            stale_frame_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub slot_count: usize,
    pub capture: CaptureConfig,
    pub discovery: DiscoveryConfig,
    pub performance: PerformanceConfig,
    pub render: RenderConfig,
    pub health: HealthConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            capture: CaptureConfig::default(),
            discovery: DiscoveryConfig::default(),
            performance: PerformanceConfig::default(),
            render: RenderConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Base profile as configured, before any per-camera-count scaling.
    pub fn base_profile(&self) -> CaptureProfile {
        CaptureProfile {
            width: self.capture.width,
            height: self.capture.height,
            fps: self.capture.fps,
            ui_fps: self.render.ui_fps,
        }
    }

    /// Replace resolution and rate ceilings with a scaled profile.
    pub fn apply_profile(&mut self, profile: CaptureProfile) {
        self.capture.width = profile.width;
        self.capture.height = profile.height;
        self.capture.fps = profile.fps.max(self.capture.min_fps);
        self.render.ui_fps = profile.ui_fps.max(self.render.min_ui_fps);
        if let Some(max_dim) = self.capture.downsample_max_dim {
            self.capture.downsample_max_dim = Some(max_dim.min(profile.width.max(profile.height)));
        }
    }
}

/// Resolution and rates used for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub ui_fps: u32,
}

/// Scale a base profile down as more cameras share the machine.
///
/// One camera runs unscaled; two or three keep their resolution at 90% of
/// the rates; four or five drop to 75% on both; six or more run at half
/// resolution and 60% of the rates. Rates never go below their floors.
pub fn choose_profile(
    camera_count: usize,
    base: CaptureProfile,
    min_fps: u32,
    min_ui_fps: u32,
) -> CaptureProfile {
    let (res_scale, fps_scale) = match camera_count {
        0 | 1 => (1.0, 1.0),
        2..=3 => (1.0, 0.9),
        4..=5 => (0.75, 0.75),
        _ => (0.5, 0.6),
    };

    let scale_dim = |v: u32| ((v as f64 * res_scale) as u32).max(2) & !1;
    let scale_fps = |v: u32, floor: u32| ((v as f64 * fps_scale) as u32).max(floor);

    CaptureProfile {
        width: scale_dim(base.width),
        height: scale_dim(base.height),
        fps: scale_fps(base.fps, min_fps),
        ui_fps: scale_fps(base.ui_fps, min_ui_fps),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CaptureProfile {
        CaptureProfile {
            width: 640,
            height: 480,
            fps: 20,
            ui_fps: 15,
        }
    }

    #[test]
    fn test_single_camera_is_unscaled() {
        assert_eq!(choose_profile(1, base(), 5, 10), base());
    }

    #[test]
    fn test_three_cameras_trim_rates() {
        let p = choose_profile(3, base(), 5, 10);
        assert_eq!((p.width, p.height), (640, 480));
        assert_eq!(p.fps, 18);
        assert_eq!(p.ui_fps, 13);
    }

    #[test]
    fn test_six_cameras_halve_resolution_and_clamp_ui() {
        let p = choose_profile(6, base(), 5, 10);
        assert_eq!((p.width, p.height), (320, 240));
        assert_eq!(p.fps, 12);
        assert_eq!(p.ui_fps, 10);
    }

    #[test]
    fn test_defaults_are_consistent() {
        let config = CoreConfig::default();
        assert!(config.capture.min_fps <= config.capture.fps);
        assert!(config.render.min_ui_fps <= config.render.ui_fps);
        let load = config.performance.cpu_load_threshold;
        assert!(load > 0.0 && load <= 1.0);
        assert!((1..=8).contains(&config.slot_count));
    }

    #[test]
    fn test_apply_profile_caps_downsample() {
        let mut config = CoreConfig::default();
        config.apply_profile(choose_profile(6, config.base_profile(), 5, 10));
        assert_eq!(config.capture.width, 320);
        assert_eq!(config.capture.downsample_max_dim, Some(320));
        assert_eq!(config.render.ui_fps, 10);
    }
}
