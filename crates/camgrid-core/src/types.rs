//! Identifiers shared across the capture core.

use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Position of a camera tile on the display, stable for the process lifetime.
pub type SlotIndex = usize;

/// Opaque camera identifier as resolved by OS enumeration.
///
/// Indexed devices order numerically (`video2` before `video10`) and always
/// sort ahead of path-addressed ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(untagged)]
pub enum DeviceId {
    /// `/dev/video{n}` on Linux, the platform camera index elsewhere.
    Index(u32),
    /// A device node or URL that has no numeric index.
    Path(String),
}

impl DeviceId {
    /// Filesystem node backing this device, when there is one.
    pub fn node_path(&self) -> PathBuf {
        match self {
            DeviceId::Index(n) => PathBuf::from(format!("/dev/video{n}")),
            DeviceId::Path(p) => PathBuf::from(p),
        }
    }

    /// Parse a `/dev/videoN` style name back into an indexed id.
    pub fn from_node_name(name: &str) -> Option<Self> {
        let digits = name.rsplit('/').next()?.strip_prefix("video")?;
        digits.parse().ok().map(DeviceId::Index)
    }

    /// Follow symlinks such as `/dev/v4l/by-id/...` to the `videoN` node
    /// they name, so one camera has one id. Paths that do not resolve to
    /// a video node are returned unchanged.
    pub fn canonical(self) -> Self {
        let DeviceId::Path(path) = &self else {
            return self;
        };
        if let Some(id) = Self::from_node_name(path) {
            return id;
        }
        fs::canonicalize(path)
            .ok()
            .and_then(|target| Self::from_node_name(&target.to_string_lossy()))
            .unwrap_or(self)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(n) => write!(f, "video{n}"),
            DeviceId::Path(p) => f.write_str(p),
        }
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        DeviceId::Index(index)
    }
}
