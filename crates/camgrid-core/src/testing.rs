//! Scripted backends and discovery doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendFactory, BackendKind, OpenRequest, VideoBackend};
use crate::discovery::{DeviceEnumerator, DeviceReclaimer};
use crate::error::{BackendError, BackendResult};
use crate::frame::{Frame, PixelFormat};
use crate::types::DeviceId;

#[derive(Debug, Default)]
pub(crate) struct BackendCounters {
    open_attempts: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
}

impl BackendCounters {
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed.
    pub fn live_handles(&self) -> usize {
        self.opens() - self.closes()
    }
}

/// What the next calls on a scripted backend return. Queued outcomes are
/// consumed first, then the defaults repeat forever.
#[derive(Debug)]
pub(crate) struct Script {
    pub opens: VecDeque<bool>,
    pub open_default: bool,
    pub reads: VecDeque<bool>,
    pub read_default: bool,
    pub read_delay: Duration,
    pub frame_size: (u32, u32),
}

impl Script {
    pub fn new(open_default: bool, read_default: bool) -> Self {
        Self {
            opens: VecDeque::new(),
            open_default,
            reads: VecDeque::new(),
            read_default,
            read_delay: Duration::ZERO,
            frame_size: (4, 2),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Scripted {
    kind: BackendKind,
    pub script: Arc<Mutex<Script>>,
    pub counters: Arc<BackendCounters>,
}

impl Scripted {
    fn new(kind: BackendKind, open_default: bool, read_default: bool) -> Self {
        Self {
            kind,
            script: Arc::new(Mutex::new(Script::new(open_default, read_default))),
            counters: Arc::new(BackendCounters::default()),
        }
    }

    fn backend(&self) -> Box<dyn VideoBackend> {
        Box::new(ScriptedBackend {
            source: self.clone(),
            open: false,
        })
    }
}

pub(crate) struct ScriptedBackend {
    source: Scripted,
    open: bool,
}

impl VideoBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.source.kind
    }

    fn open(&mut self, request: &OpenRequest) -> BackendResult<()> {
        self.source.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
        let ok = {
            let mut script = self.source.script.lock().unwrap();
            let default = script.open_default;
            script.opens.pop_front().unwrap_or(default)
        };
        if !ok {
            return Err(BackendError::Open(format!("{} refused", request.device)));
        }
        self.open = true;
        self.source.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self) -> BackendResult<Frame> {
        if !self.open {
            return Err(BackendError::NotOpen);
        }
        self.source.counters.reads.fetch_add(1, Ordering::SeqCst);
        let (ok, delay, (w, h)) = {
            let mut script = self.source.script.lock().unwrap();
            let default = script.read_default;
            (
                script.reads.pop_front().unwrap_or(default),
                script.read_delay,
                script.frame_size,
            )
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if ok {
            Ok(Frame::new(vec![7; (w * h * 3) as usize], w, h, PixelFormat::Rgb24))
        } else {
            Err(BackendError::Read("scripted failure".into()))
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.source.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory handing out scripted backends that share one script per path.
pub(crate) struct ScriptedFactory {
    pub accelerated: Option<Scripted>,
    pub generic: Scripted,
}

impl ScriptedFactory {
    /// Generic path only.
    pub fn generic(open_ok: bool, read_ok: bool) -> Self {
        Self {
            accelerated: None,
            generic: Scripted::new(BackendKind::Generic, open_ok, read_ok),
        }
    }

    pub fn with_accelerated(accelerated_ok: bool, generic_ok: bool) -> Self {
        Self {
            accelerated: Some(Scripted::new(BackendKind::Accelerated, accelerated_ok, true)),
            generic: Scripted::new(BackendKind::Generic, generic_ok, true),
        }
    }

    pub fn generic_counters(&self) -> Arc<BackendCounters> {
        self.generic.counters.clone()
    }

    pub fn accelerated_counters(&self) -> Arc<BackendCounters> {
        self.accelerated
            .as_ref()
            .map(|s| s.counters.clone())
            .unwrap_or_default()
    }

    pub fn edit_generic(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.generic.script.lock().unwrap());
    }
}

impl BackendFactory for ScriptedFactory {
    fn accelerated(&self) -> Option<Box<dyn VideoBackend>> {
        self.accelerated.as_ref().map(Scripted::backend)
    }

    fn generic(&self) -> Box<dyn VideoBackend> {
        self.generic.backend()
    }
}

/// Enumerator whose device list the test edits between scans.
#[derive(Clone, Default)]
pub(crate) struct StaticEnumerator {
    pub devices: Arc<Mutex<Vec<DeviceId>>>,
}

impl StaticEnumerator {
    pub fn new(indices: &[u32]) -> Self {
        let enumerator = Self::default();
        enumerator.set(indices);
        enumerator
    }

    pub fn set(&self, indices: &[u32]) {
        *self.devices.lock().unwrap() = indices.iter().copied().map(DeviceId::Index).collect();
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&mut self) -> Vec<DeviceId> {
        self.devices.lock().unwrap().clone()
    }
}

/// Reclaimer that records what it was asked to free.
#[derive(Clone, Default)]
pub(crate) struct NoopReclaimer {
    pub calls: Arc<Mutex<Vec<DeviceId>>>,
    pub fail: bool,
}

impl DeviceReclaimer for NoopReclaimer {
    fn reclaim(&mut self, device: &DeviceId) -> std::io::Result<bool> {
        self.calls.lock().unwrap().push(device.clone());
        if self.fail {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "not permitted"))
        } else {
            Ok(false)
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
