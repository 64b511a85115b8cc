pub mod backend;
pub mod config;
pub mod convert;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod health;
pub mod performance;
pub mod platform;
pub mod render;
pub mod slot;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use backend::{BackendFactory, BackendKind, OpenRequest, SystemBackends, VideoBackend};
pub use config::{choose_profile, CaptureConfig, CaptureProfile, CoreConfig};
pub use dashboard::Dashboard;
pub use discovery::{DeviceEnumerator, DeviceReclaimer, DeviceRegistry, ScanPlan};
pub use error::{BackendError, BackendResult, CaptureError, CaptureResult};
pub use frame::{Frame, LatestFrame, PixelFormat};
pub use health::HealthReport;
pub use performance::{FpsTargets, PerformanceController, PerformanceSample, SystemProbe};
pub use render::{DisplaySink, FrameSource, RenderLoop};
pub use slot::{SlotSnapshot, SlotState};
pub use types::{DeviceId, SlotIndex};
pub use worker::{CaptureWorker, WorkerPhase, WorkerStatus};
