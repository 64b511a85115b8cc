//! TOML settings file, clamped into a `CoreConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use camgrid_core::config::{
    CoreConfig, DEFAULT_CAPTURE_FPS, DEFAULT_CAPTURE_HEIGHT, DEFAULT_CAPTURE_WIDTH,
    DEFAULT_MIN_DYNAMIC_FPS, DEFAULT_MIN_DYNAMIC_UI_FPS, DEFAULT_SLOT_COUNT, DEFAULT_UI_FPS,
};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub slot_count: usize,
    pub rescan_interval_ms: u64,
    pub failed_camera_cooldown_sec: u64,
    pub max_open_failures: u32,
    pub kill_device_holders: bool,
    pub use_gstreamer: bool,
    pub use_avdec: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            rescan_interval_ms: 15_000,
            failed_camera_cooldown_sec: 30,
            max_open_failures: 3,
            kill_device_holders: false,
            use_gstreamer: true,
            use_avdec: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    pub ui_fps: u32,
    /// 0 disables downsampling.
    pub downsample_max_dim: u32,
    /// Scale resolution and rates down with the number of slots.
    pub auto_scale: bool,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            capture_width: DEFAULT_CAPTURE_WIDTH,
            capture_height: DEFAULT_CAPTURE_HEIGHT,
            capture_fps: DEFAULT_CAPTURE_FPS,
            ui_fps: DEFAULT_UI_FPS,
            downsample_max_dim: DEFAULT_CAPTURE_WIDTH,
            auto_scale: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub dynamic_fps: bool,
    pub perf_check_interval_ms: u64,
    pub min_dynamic_fps: u32,
    pub min_dynamic_ui_fps: u32,
    pub fps_step: u32,
    pub ui_fps_step: u32,
    pub cpu_load_threshold: f64,
    pub cpu_temp_threshold_c: f64,
    pub stress_hold_count: u32,
    pub recover_hold_count: u32,
    pub thermal_immediate: bool,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            dynamic_fps: true,
            perf_check_interval_ms: 2_000,
            min_dynamic_fps: DEFAULT_MIN_DYNAMIC_FPS,
            min_dynamic_ui_fps: DEFAULT_MIN_DYNAMIC_UI_FPS,
            fps_step: 2,
            ui_fps_step: 2,
            cpu_load_threshold: 0.85,
            cpu_temp_threshold_c: 70.0,
            stress_hold_count: 2,
            recover_hold_count: 3,
            thermal_immediate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub log_interval_sec: u64,
    pub stale_frame_timeout_sec: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            log_interval_sec: 30,
            stale_frame_timeout_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraSettings,
    pub profile: ProfileSettings,
    pub performance: PerformanceSettings,
    pub health: HealthSettings,
}

impl Settings {
    /// `$CAMGRID_CONFIG`, else `<config dir>/camgrid/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("CAMGRID_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|dir| dir.join("camgrid").join("config.toml")))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("Invalid settings file")
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Load from the default location. A missing file means defaults; a
    /// broken one is reported and also falls back to defaults.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            info!("No settings at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::read(&path) {
            Ok(settings) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!("{e:#}; using defaults");
                Self::default()
            }
        }
    }

    /// Clamp every value into range and build the core configuration.
    pub fn into_core_config(self) -> CoreConfig {
        let mut config = CoreConfig::default();
        let camera = &self.camera;
        let profile = &self.profile;
        let perf = &self.performance;

        config.slot_count = camera.slot_count.clamp(1, 8);

        config.capture.width = profile.capture_width.clamp(160, 3840) & !1;
        config.capture.height = profile.capture_height.clamp(120, 2160) & !1;
        config.capture.fps = profile.capture_fps.clamp(1, 60);
        config.capture.min_fps = perf.min_dynamic_fps.clamp(1, 60).min(config.capture.fps);
        config.capture.use_accelerated = camera.use_gstreamer;
        config.capture.use_avdec = camera.use_avdec;
        config.capture.downsample_max_dim = match profile.downsample_max_dim {
            0 => None,
            dim => Some(dim.max(16)),
        };

        config.render.ui_fps = profile.ui_fps.clamp(1, 60);
        config.render.min_ui_fps = perf.min_dynamic_ui_fps.clamp(1, 60).min(config.render.ui_fps);

        config.discovery.rescan_interval =
            Duration::from_millis(camera.rescan_interval_ms.clamp(500, 600_000));
        config.discovery.failed_device_cooldown =
            Duration::from_secs(camera.failed_camera_cooldown_sec.min(3_600));
        config.discovery.max_open_failures = camera.max_open_failures.clamp(1, 100);
        config.discovery.reclaim_device_holders = camera.kill_device_holders;

        config.performance.enabled = perf.dynamic_fps;
        config.performance.check_interval =
            Duration::from_millis(perf.perf_check_interval_ms.clamp(250, 60_000));
        config.performance.cpu_load_threshold = perf.cpu_load_threshold.clamp(0.1, 1.0);
        config.performance.cpu_temp_threshold_c = perf.cpu_temp_threshold_c.clamp(40.0, 100.0);
        config.performance.stress_hold_count = perf.stress_hold_count.clamp(1, 10);
        config.performance.recover_hold_count = perf.recover_hold_count.clamp(1, 10);
        config.performance.fps_step = perf.fps_step.clamp(1, 30);
        config.performance.ui_fps_step = perf.ui_fps_step.clamp(1, 30);
        config.performance.thermal_immediate = perf.thermal_immediate;

        config.health.log_interval =
            Duration::from_secs(self.health.log_interval_sec.clamp(1, 3_600));
        config.health.stale_frame_timeout =
            Duration::from_secs(self.health.stale_frame_timeout_sec.clamp(1, 600));

        if profile.auto_scale {
            let scaled = camgrid_core::choose_profile(
                config.slot_count,
                config.base_profile(),
                config.capture.min_fps,
                config.render.min_ui_fps,
            );
            config.apply_profile(scaled);
        }
        config
    }
}
