//! OS integration: V4L2 node enumeration, load and temperature probes, and
//! reclaiming device nodes from other processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::discovery::{DeviceEnumerator, DeviceReclaimer};
use crate::performance::{PerformanceSample, SystemProbe};
use crate::types::DeviceId;

/// Scans a device directory for `videoN` nodes.
pub struct VideoNodeEnumerator {
    dev_dir: PathBuf,
    /// Skip nodes that do not advertise video capture (metadata nodes etc.).
    require_capture: bool,
}

impl Default for VideoNodeEnumerator {
    fn default() -> Self {
        Self::new("/dev")
    }
}

impl VideoNodeEnumerator {
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            require_capture: true,
        }
    }

    pub fn with_capture_check(mut self, require_capture: bool) -> Self {
        self.require_capture = require_capture;
        self
    }
}

impl DeviceEnumerator for VideoNodeEnumerator {
    fn enumerate(&mut self) -> Vec<DeviceId> {
        let entries = match fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {e}", self.dev_dir.display());
                return Vec::new();
            }
        };

        let mut devices: Vec<DeviceId> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let id = DeviceId::from_node_name(name.to_str()?)?;
                if self.require_capture && query_capture_capability(&entry.path()) == Some(false) {
                    debug!(device = %id, "Skipping node without video capture");
                    return None;
                }
                Some(id)
            })
            .collect();
        devices.sort();
        devices
    }
}

/// Whether a V4L2 node can capture video. `None` when the node cannot be
/// queried, in which case callers keep it and let the open decide.
#[cfg(target_os = "linux")]
pub fn query_capture_capability(path: &Path) -> Option<bool> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    // VIDIOC_QUERYCAP ioctl number
    const VIDIOC_QUERYCAP: libc::c_ulong = 0x80685600;
    const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
    const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

    #[repr(C)]
    struct V4l2Capability {
        driver: [u8; 16],
        card: [u8; 32],
        bus_info: [u8; 32],
        version: u32,
        capabilities: u32,
        device_caps: u32,
        reserved: [u32; 3],
    }

    let file = File::open(path).ok()?;
    let fd = file.as_raw_fd();

    let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::ioctl(fd, VIDIOC_QUERYCAP, &mut cap) };
    if result != 0 {
        return None;
    }

    // device_caps describes this node; capabilities covers the whole device
    let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
        cap.device_caps
    } else {
        cap.capabilities
    };
    Some(caps & V4L2_CAP_VIDEO_CAPTURE != 0)
}

#[cfg(not(target_os = "linux"))]
pub fn query_capture_capability(_path: &Path) -> Option<bool> {
    None
}

/// Reads load average and CPU temperature from the kernel.
pub struct SysfsProbe {
    thermal_paths: Vec<PathBuf>,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self {
            thermal_paths: vec![
                PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
                PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input"),
            ],
        }
    }
}

impl SysfsProbe {
    pub fn with_thermal_paths(thermal_paths: Vec<PathBuf>) -> Self {
        Self { thermal_paths }
    }

    fn temperature(&self) -> Option<f64> {
        self.thermal_paths
            .iter()
            .find_map(|path| parse_temperature(&fs::read_to_string(path).ok()?))
    }
}

impl SystemProbe for SysfsProbe {
    fn sample(&mut self) -> PerformanceSample {
        PerformanceSample {
            load_ratio: load_ratio(),
            temp_c: self.temperature(),
        }
    }
}

/// Parse a sysfs temperature. Values above 1000 are millidegrees.
pub fn parse_temperature(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    Some(if value > 1000.0 { value / 1000.0 } else { value })
}

/// One-minute load average over CPU count, capped at 1.0.
pub fn load_ratio() -> Option<f64> {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    normalize_load(load_average()?, cpus)
}

fn normalize_load(load: f64, cpus: usize) -> Option<f64> {
    if !load.is_finite() || load < 0.0 {
        return None;
    }
    Some((load / cpus.max(1) as f64).min(1.0))
}

#[cfg(target_os = "linux")]
fn load_average() -> Option<f64> {
    let mut loads = [0.0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n >= 1).then_some(loads[0])
}

#[cfg(not(target_os = "linux"))]
fn load_average() -> Option<f64> {
    None
}

/// Terminates processes holding a device node: SIGTERM, a grace period,
/// then SIGKILL for anything still alive.
pub struct ProcessReclaimer {
    grace: Duration,
}

impl ProcessReclaimer {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    fn holders(path: &Path) -> Vec<i32> {
        let path = path.to_string_lossy();
        let mut pids = run_pid_tool("lsof", &["-t", path.as_ref()]);
        if pids.is_empty() {
            pids = run_pid_tool("fuser", &[path.as_ref()]);
        }
        let own = std::process::id() as i32;
        pids.retain(|&pid| pid != own);
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

fn run_pid_tool(tool: &str, args: &[&str]) -> Vec<i32> {
    match Command::new(tool).args(args).output() {
        // fuser prints pids on stdout and the path on stderr
        Ok(output) => parse_pid_list(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!("{tool} unavailable: {e}");
            Vec::new()
        }
    }
}

/// Extract pids from `lsof -t` or `fuser` output. `fuser` suffixes access
/// letters (`1234m`), which are stripped.
pub fn parse_pid_list(output: &str) -> Vec<i32> {
    output
        .split_whitespace()
        .filter_map(|token| {
            let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            digits.parse::<i32>().ok().filter(|pid| *pid > 0)
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn signal(pid: i32, sig: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, sig) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl DeviceReclaimer for ProcessReclaimer {
    #[cfg(target_os = "linux")]
    fn reclaim(&mut self, device: &DeviceId) -> io::Result<bool> {
        let path = device.node_path();
        let pids = Self::holders(&path);
        if pids.is_empty() {
            return Ok(false);
        }

        info!(device = %device, ?pids, "Terminating processes holding {}", path.display());
        let mut signalled = Vec::new();
        let mut last_error = None;
        for &pid in &pids {
            match signal(pid, libc::SIGTERM) {
                Ok(()) => signalled.push(pid),
                Err(e) => {
                    warn!(pid, "SIGTERM failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        if signalled.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| io::Error::other("no holder could be signalled")));
        }

        thread::sleep(self.grace);
        for pid in signalled {
            // Signal 0 only probes whether the process still exists
            if signal(pid, 0).is_ok() {
                if let Err(e) = signal(pid, libc::SIGKILL) {
                    warn!(pid, "SIGKILL failed: {e}");
                }
            }
        }
        Ok(true)
    }

    #[cfg(not(target_os = "linux"))]
    fn reclaim(&mut self, _device: &DeviceId) -> io::Result<bool> {
        Ok(false)
    }
}
