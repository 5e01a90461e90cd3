//! Simulated camera driver.
//!
//! `StubCamera` behaves like a vendor driver from the core's point of view:
//! - buffers must be announced before the capture engine starts
//! - the capture engine owns callback threads that fill queued buffers and
//!   invoke the observer from those threads
//! - frames are only delivered between `AcquisitionStart` and `AcquisitionStop`
//! - delivered buffers are not refilled until they are queued again
//!
//! Fault injection covers the failure paths bring-up and the frame sink have
//! to survive: open failures, feature failures, rejected announcements and
//! incomplete frames.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{
    features, BufferId, CameraDriver, CameraSystem, DeliveredFrame, FeatureValue, FrameObserver,
    FrameQueue, FrameStatus,
};
use crate::error::{CaptureError, Result};
use crate::pool::{BufferArena, BufferOwner};

const MIN_DIMENSION: i64 = 8;
const MAX_FRAME_RATE: f64 = 1000.0;

/// Pixel formats the simulated sensor can be switched to.
const SENSOR_FORMATS: &[(&str, usize)] = &[("Mono8", 1), ("Mono12", 2), ("BayerRG8", 1), ("RGB8", 3)];

/// Configuration for a simulated camera.
#[derive(Clone, Debug)]
pub struct StubCameraConfig {
    pub id: String,
    pub name: String,
    /// Sensor size (maximum Width/Height).
    pub max_width: i64,
    pub max_height: i64,
    /// Number of driver threads invoking the frame callback.
    pub callback_threads: usize,
    /// Pace deliveries at the configured frame rate instead of as fast as possible.
    pub realtime: bool,
    /// Stop delivering after this many frames.
    pub frame_limit: Option<u64>,
    /// 1-based frame numbers delivered with an incomplete status.
    pub incomplete_frames: Vec<u64>,
    pub fail_open: bool,
    /// Feature whose get/set always fails.
    pub fail_feature: Option<String>,
    /// Reject announcements once this many buffers are announced.
    pub reject_announce_after: Option<usize>,
    /// Bytes appended to every image row. Non-zero exposes a `Stride` feature.
    pub row_padding: usize,
    /// Bytes after the last row counted in `PayloadSize` (chunk data).
    pub payload_trailer: usize,
    pub command_log: Option<CommandLog>,
}

impl Default for StubCameraConfig {
    fn default() -> Self {
        Self {
            id: "stub-cam-01".to_string(),
            name: "Simulated Mono Camera".to_string(),
            max_width: 1280,
            max_height: 960,
            callback_threads: 1,
            realtime: false,
            frame_limit: None,
            incomplete_frames: Vec::new(),
            fail_open: false,
            fail_feature: None,
            reject_announce_after: None,
            row_padding: 0,
            payload_trailer: 0,
            command_log: None,
        }
    }
}

/// Acquisition command observed by a simulated camera.
#[derive(Clone, Debug)]
pub struct CommandEntry {
    pub camera: String,
    pub command: String,
    pub at: Instant,
}

/// Shared, ordered record of acquisition commands across cameras.
#[derive(Clone, Debug, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<CommandEntry>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, camera: &str, command: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(CommandEntry {
                camera: camera.to_string(),
                command: command.to_string(),
                at: Instant::now(),
            });
        }
    }

    pub fn entries(&self) -> Vec<CommandEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Counters for a simulated camera.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubStats {
    pub open: bool,
    pub capture_engine: bool,
    pub acquiring: bool,
    pub announced: usize,
    pub queued: usize,
    pub delivered: u64,
    pub requeued: u64,
    pub incomplete: u64,
    pub outstanding: usize,
}

struct StubState {
    open: bool,
    features: BTreeMap<String, FeatureValue>,
    observer: Option<Arc<dyn FrameObserver>>,
    arena: Option<Arc<BufferArena>>,
    announced: Vec<BufferId>,
    queue: VecDeque<BufferId>,
    outstanding: HashSet<BufferId>,
    engine_running: bool,
    acquiring: bool,
    sequence: u64,
    delivered: u64,
    requeued: u64,
    incomplete: u64,
}

struct StubShared {
    state: Mutex<StubState>,
    wake: Condvar,
}

impl StubShared {
    fn lock(&self) -> Result<MutexGuard<'_, StubState>> {
        self.state
            .lock()
            .map_err(|_| CaptureError::driver("lock", "stub camera state poisoned"))
    }
}

impl FrameQueue for StubShared {
    fn queue_frame(&self, id: BufferId) -> Result<()> {
        let mut state = self.lock()?;
        if !state.announced.contains(&id) {
            return Err(CaptureError::driver(
                "queue frame",
                format!("buffer {} is not announced", id),
            ));
        }
        if state.queue.contains(&id) {
            return Err(CaptureError::driver(
                "queue frame",
                format!("buffer {} is already queued", id),
            ));
        }
        if let Some(arena) = &state.arena {
            let owner = arena.owner(id)?;
            if owner != BufferOwner::Driver {
                return Err(CaptureError::Ownership {
                    buffer: id,
                    expected: BufferOwner::Driver,
                    actual: owner,
                });
            }
        }
        if state.outstanding.remove(&id) {
            state.requeued += 1;
        }
        state.queue.push_back(id);
        drop(state);
        self.wake.notify_all();
        Ok(())
    }
}

/// Simulated camera.
pub struct StubCamera {
    config: Arc<StubCameraConfig>,
    shared: Arc<StubShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StubCamera {
    pub fn new(config: StubCameraConfig) -> Self {
        let width = config.max_width.min(640);
        let height = config.max_height.min(480);
        let mut features = BTreeMap::new();
        features.insert(features::WIDTH.to_string(), FeatureValue::Int(width));
        features.insert(features::HEIGHT.to_string(), FeatureValue::Int(height));
        features.insert(
            features::PIXEL_FORMAT.to_string(),
            FeatureValue::Enum("Mono8".to_string()),
        );
        features.insert(features::FRAME_RATE.to_string(), FeatureValue::Float(24.0));
        let mut state = StubState {
            open: false,
            features,
            observer: None,
            arena: None,
            announced: Vec::new(),
            queue: VecDeque::new(),
            outstanding: HashSet::new(),
            engine_running: false,
            acquiring: false,
            sequence: 0,
            delivered: 0,
            requeued: 0,
            incomplete: 0,
        };
        Self::update_payload_size(&mut state, &config);

        Self {
            config: Arc::new(config),
            shared: Arc::new(StubShared {
                state: Mutex::new(state),
                wake: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> StubStats {
        let Ok(state) = self.shared.lock() else {
            return StubStats::default();
        };
        StubStats {
            open: state.open,
            capture_engine: state.engine_running,
            acquiring: state.acquiring,
            announced: state.announced.len(),
            queued: state.queue.len(),
            delivered: state.delivered,
            requeued: state.requeued,
            incomplete: state.incomplete,
            outstanding: state.outstanding.len(),
        }
    }

    /// Block until `count` frames were delivered or the timeout expires.
    pub fn wait_for_deliveries(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let stats = self.stats();
            if stats.delivered >= count && stats.outstanding == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn check_injected_failure(&self, operation: &'static str, name: &str) -> Result<()> {
        if self.config.fail_feature.as_deref() == Some(name) {
            return Err(CaptureError::feature(
                operation,
                name,
                "simulated driver failure",
            ));
        }
        Ok(())
    }

    fn require_open(state: &StubState, operation: &'static str) -> Result<()> {
        if !state.open {
            return Err(CaptureError::driver(operation, "camera is not open"));
        }
        Ok(())
    }

    fn bytes_per_pixel(format: &str) -> Option<usize> {
        SENSOR_FORMATS
            .iter()
            .find(|(name, _)| *name == format)
            .map(|(_, bpp)| *bpp)
    }

    fn update_payload_size(state: &mut StubState, config: &StubCameraConfig) {
        let width = state
            .features
            .get(features::WIDTH)
            .and_then(FeatureValue::as_int)
            .unwrap_or(0);
        let height = state
            .features
            .get(features::HEIGHT)
            .and_then(FeatureValue::as_int)
            .unwrap_or(0);
        let bpp = state
            .features
            .get(features::PIXEL_FORMAT)
            .and_then(FeatureValue::as_enum)
            .and_then(Self::bytes_per_pixel)
            .unwrap_or(1);
        let stride = width * bpp as i64 + config.row_padding as i64;
        if config.row_padding > 0 {
            state
                .features
                .insert(features::STRIDE.to_string(), FeatureValue::Int(stride));
        }
        state.features.insert(
            features::PAYLOAD_SIZE.to_string(),
            FeatureValue::Int(stride * height + config.payload_trailer as i64),
        );
    }

    fn spawn_workers(&self) -> Result<()> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| CaptureError::driver("start capture", "worker table poisoned"))?;
        for index in 0..self.config.callback_threads.max(1) {
            let shared = self.shared.clone();
            let config = self.config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-cb{}", self.config.id, index))
                .spawn(move || run_worker(shared, config))
                .map_err(|err| CaptureError::driver("start capture", err.to_string()))?;
            workers.push(handle);
        }
        Ok(())
    }

    fn join_workers(&self) {
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                log::error!("{}: callback thread panicked", self.config.id);
            }
        }
    }
}

impl CameraDriver for StubCamera {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn open(&self) -> Result<()> {
        if self.config.fail_open {
            return Err(CaptureError::driver("open camera", "simulated open failure"));
        }
        let mut state = self.shared.lock()?;
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let running = self.shared.lock()?.engine_running;
        if running {
            self.end_capture()?;
        }
        let mut state = self.shared.lock()?;
        state.open = false;
        state.observer = None;
        Ok(())
    }

    fn feature(&self, name: &str) -> Result<FeatureValue> {
        self.check_injected_failure("get feature", name)?;
        let state = self.shared.lock()?;
        Self::require_open(&state, "get feature")?;
        state
            .features
            .get(name)
            .cloned()
            .ok_or_else(|| CaptureError::feature("get feature", name, "feature not found"))
    }

    fn feature_range(&self, name: &str) -> Result<(i64, i64)> {
        self.check_injected_failure("get feature range", name)?;
        let state = self.shared.lock()?;
        Self::require_open(&state, "get feature range")?;
        match name {
            features::WIDTH => Ok((MIN_DIMENSION, self.config.max_width)),
            features::HEIGHT => Ok((MIN_DIMENSION, self.config.max_height)),
            features::FRAME_RATE => Ok((1, MAX_FRAME_RATE as i64)),
            _ => Err(CaptureError::feature(
                "get feature range",
                name,
                "feature has no range",
            )),
        }
    }

    fn set_feature(&self, name: &str, value: FeatureValue) -> Result<()> {
        self.check_injected_failure("set feature", name)?;
        let mut state = self.shared.lock()?;
        Self::require_open(&state, "set feature")?;
        if state.engine_running {
            return Err(CaptureError::feature(
                "set feature",
                name,
                "feature is locked while capturing",
            ));
        }

        match name {
            features::WIDTH | features::HEIGHT => {
                let max = if name == features::WIDTH {
                    self.config.max_width
                } else {
                    self.config.max_height
                };
                let v = value
                    .as_int()
                    .ok_or_else(|| CaptureError::feature("set feature", name, "expected integer"))?;
                if v < MIN_DIMENSION || v > max || v % 2 != 0 {
                    return Err(CaptureError::feature(
                        "set feature",
                        name,
                        format!("{} outside {}..={} (step 2)", v, MIN_DIMENSION, max),
                    ));
                }
                state.features.insert(name.to_string(), FeatureValue::Int(v));
            }
            features::PIXEL_FORMAT => {
                let format = value
                    .as_enum()
                    .ok_or_else(|| CaptureError::feature("set feature", name, "expected enum"))?;
                if Self::bytes_per_pixel(format).is_none() {
                    return Err(CaptureError::feature(
                        "set feature",
                        name,
                        format!("sensor does not offer {}", format),
                    ));
                }
                state.features.insert(name.to_string(), value);
            }
            features::FRAME_RATE => {
                let fps = value
                    .as_float()
                    .ok_or_else(|| CaptureError::feature("set feature", name, "expected float"))?;
                if !(1.0..=MAX_FRAME_RATE).contains(&fps) {
                    return Err(CaptureError::feature(
                        "set feature",
                        name,
                        format!("{} outside 1..={}", fps, MAX_FRAME_RATE),
                    ));
                }
                state
                    .features
                    .insert(name.to_string(), FeatureValue::Float(fps));
            }
            _ => {
                return Err(CaptureError::feature(
                    "set feature",
                    name,
                    "feature not writable",
                ))
            }
        }
        Self::update_payload_size(&mut state, &self.config);
        Ok(())
    }

    fn run_command(&self, name: &str) -> Result<()> {
        self.check_injected_failure("run command", name)?;
        let mut state = self.shared.lock()?;
        Self::require_open(&state, "run command")?;
        match name {
            features::ACQUISITION_START => state.acquiring = true,
            features::ACQUISITION_STOP => state.acquiring = false,
            _ => {
                return Err(CaptureError::feature(
                    "run command",
                    name,
                    "unknown command",
                ))
            }
        }
        drop(state);
        if let Some(log) = &self.config.command_log {
            log.record(&self.config.id, name);
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn has_feature(&self, name: &str) -> bool {
        matches!(
            name,
            features::WIDTH
                | features::HEIGHT
                | features::PIXEL_FORMAT
                | features::FRAME_RATE
                | features::PAYLOAD_SIZE
                | features::ACQUISITION_START
                | features::ACQUISITION_STOP
        ) || (name == features::STRIDE && self.config.row_padding > 0)
    }

    fn register_observer(&self, observer: Arc<dyn FrameObserver>) -> Result<()> {
        let mut state = self.shared.lock()?;
        Self::require_open(&state, "register observer")?;
        state.observer = Some(observer);
        Ok(())
    }

    fn announce_frame(&self, arena: &Arc<BufferArena>, id: BufferId) -> Result<()> {
        let mut state = self.shared.lock()?;
        Self::require_open(&state, "announce frame")?;
        if state.engine_running {
            return Err(CaptureError::driver(
                "announce frame",
                "capture engine is running",
            ));
        }
        if let Some(limit) = self.config.reject_announce_after {
            if state.announced.len() >= limit {
                return Err(CaptureError::driver(
                    "announce frame",
                    "simulated out of driver resources",
                ));
            }
        }
        let payload = state
            .features
            .get(features::PAYLOAD_SIZE)
            .and_then(FeatureValue::as_int)
            .unwrap_or(0) as usize;
        if arena.buffer_size() < payload {
            return Err(CaptureError::driver(
                "announce frame",
                format!(
                    "buffer of {} bytes is smaller than payload {}",
                    arena.buffer_size(),
                    payload
                ),
            ));
        }
        match &state.arena {
            Some(current) if !Arc::ptr_eq(current, arena) => {
                return Err(CaptureError::driver(
                    "announce frame",
                    "buffers from a second pool",
                ))
            }
            Some(_) => {}
            None => state.arena = Some(arena.clone()),
        }
        if state.announced.contains(&id) {
            return Err(CaptureError::driver(
                "announce frame",
                format!("buffer {} announced twice", id),
            ));
        }
        state.announced.push(id);
        Ok(())
    }

    fn start_capture(&self) -> Result<()> {
        {
            let mut state = self.shared.lock()?;
            Self::require_open(&state, "start capture")?;
            if state.engine_running {
                return Ok(());
            }
            state.engine_running = true;
        }
        self.spawn_workers()
    }

    fn queue_frame(&self, id: BufferId) -> Result<()> {
        self.shared.queue_frame(id)
    }

    fn frame_queue(&self) -> Arc<dyn FrameQueue> {
        self.shared.clone()
    }

    fn end_capture(&self) -> Result<()> {
        {
            let mut state = self.shared.lock()?;
            state.engine_running = false;
            state.acquiring = false;
        }
        self.shared.wake.notify_all();
        self.join_workers();
        Ok(())
    }

    fn flush_queue(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.queue.clear();
        Ok(())
    }

    fn revoke_all_frames(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        if state.engine_running {
            return Err(CaptureError::driver(
                "revoke frames",
                "capture engine is still running",
            ));
        }
        state.queue.clear();
        state.announced.clear();
        state.outstanding.clear();
        state.arena = None;
        Ok(())
    }
}

impl Drop for StubCamera {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            state.engine_running = false;
            state.observer = None;
        }
        self.shared.wake.notify_all();
        self.join_workers();
    }
}

struct Delivery {
    id: BufferId,
    sequence: u64,
    status: FrameStatus,
    arena: Arc<BufferArena>,
    observer: Arc<dyn FrameObserver>,
    row_bytes: usize,
    height: usize,
    interval: Option<Duration>,
}

fn next_delivery(shared: &StubShared, config: &StubCameraConfig) -> Result<Option<Delivery>> {
    let mut state = shared.lock()?;
    loop {
        if !state.engine_running {
            return Ok(None);
        }
        let under_limit = config
            .frame_limit
            .map_or(true, |limit| state.sequence < limit);
        if state.acquiring
            && under_limit
            && !state.queue.is_empty()
            && state.observer.is_some()
            && state.arena.is_some()
        {
            break;
        }
        state = shared
            .wake
            .wait(state)
            .map_err(|_| CaptureError::driver("wait", "stub camera state poisoned"))?;
    }

    let (Some(id), Some(arena), Some(observer)) = (
        state.queue.pop_front(),
        state.arena.clone(),
        state.observer.clone(),
    ) else {
        return Ok(None);
    };
    state.sequence += 1;
    let sequence = state.sequence;
    let status = if config.incomplete_frames.contains(&sequence) {
        state.incomplete += 1;
        FrameStatus::Incomplete
    } else {
        FrameStatus::Complete
    };
    state.delivered += 1;
    state.outstanding.insert(id);

    let int_feature = |name: &str| {
        state
            .features
            .get(name)
            .and_then(FeatureValue::as_int)
            .unwrap_or(0) as usize
    };
    let width = int_feature(features::WIDTH);
    let height = int_feature(features::HEIGHT);
    let bytes_per_pixel = state
        .features
        .get(features::PIXEL_FORMAT)
        .and_then(FeatureValue::as_enum)
        .and_then(StubCamera::bytes_per_pixel)
        .unwrap_or(1);
    let interval = if config.realtime {
        state
            .features
            .get(features::FRAME_RATE)
            .and_then(FeatureValue::as_float)
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps))
    } else {
        None
    };

    Ok(Some(Delivery {
        id,
        sequence,
        status,
        arena,
        observer,
        row_bytes: width * bytes_per_pixel + config.row_padding,
        height,
        interval,
    }))
}

fn run_worker(shared: Arc<StubShared>, config: Arc<StubCameraConfig>) {
    loop {
        let delivery = match next_delivery(&shared, &config) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return,
            Err(err) => {
                log::error!("{}: callback thread stopped: {}", config.id, err);
                return;
            }
        };

        let filled = delivery
            .arena
            .with_data_mut(delivery.id, BufferOwner::Driver, |buf| {
                fill_synthetic(buf, delivery.row_bytes, delivery.height, delivery.sequence)
            });
        if let Err(err) = filled {
            log::error!("{}: filling buffer {} failed: {}", config.id, delivery.id, err);
        }

        let queue: Arc<dyn FrameQueue> = shared.clone();
        match DeliveredFrame::deliver(
            delivery.arena.clone(),
            queue,
            delivery.id,
            delivery.status,
            delivery.sequence,
        ) {
            Ok(frame) => {
                let observer = delivery.observer.clone();
                if panic::catch_unwind(AssertUnwindSafe(|| observer.frame_received(frame)))
                    .is_err()
                {
                    log::error!(
                        "{}: frame observer panicked on frame {}",
                        config.id,
                        delivery.sequence
                    );
                }
            }
            Err(err) => log::error!("{}: delivery failed: {}", config.id, err),
        }

        if let Some(interval) = delivery.interval {
            std::thread::sleep(interval);
        }
    }
}

/// Diagonal gradient that moves with the frame counter, plus mild sensor noise.
pub(crate) fn fill_synthetic(buf: &mut [u8], row_bytes: usize, rows: usize, sequence: u64) {
    let mut rng = StdRng::seed_from_u64(sequence);
    let len = (row_bytes * rows).min(buf.len());
    for (i, byte) in buf[..len].iter_mut().enumerate() {
        let x = i % row_bytes.max(1);
        let y = i / row_bytes.max(1);
        let base = (x + y + (sequence as usize) * 4) % 224;
        *byte = (base + rng.gen_range(0..32)) as u8;
    }
}

/// `stub://N` camera system.
pub struct StubSystem {
    cameras: Vec<Arc<StubCamera>>,
    started: bool,
}

impl StubSystem {
    pub fn new(count: usize) -> Self {
        let cameras = (0..count)
            .map(|index| {
                Arc::new(StubCamera::new(StubCameraConfig {
                    id: format!("stub-cam-{:02}", index + 1),
                    realtime: true,
                    ..StubCameraConfig::default()
                }))
            })
            .collect();
        Self {
            cameras,
            started: false,
        }
    }
}

impl CameraSystem for StubSystem {
    fn startup(&mut self) -> Result<()> {
        self.started = true;
        log::info!("stub camera system started ({} camera(s))", self.cameras.len());
        Ok(())
    }

    fn cameras(&self) -> Result<Vec<Arc<dyn CameraDriver>>> {
        if !self.started {
            return Err(CaptureError::driver(
                "list cameras",
                "camera system not started",
            ));
        }
        Ok(self
            .cameras
            .iter()
            .map(|camera| camera.clone() as Arc<dyn CameraDriver>)
            .collect())
    }

    fn shutdown(&mut self) {
        self.started = false;
    }
}
