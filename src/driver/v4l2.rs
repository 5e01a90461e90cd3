//! V4L2 camera adapter.
//!
//! V4L2 fills its own mmap buffers, so the adapter keeps a capture thread that
//! dequeues each kernel buffer and copies it into the next queued pool buffer
//! before handing that buffer to the observer. Kernel frames that arrive while
//! no pool buffer is queued are counted and skipped.

use ouroboros::self_referencing;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use v4l::buffer::{Flags, Type};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use super::{
    features, BufferId, CameraDriver, CameraSystem, DeliveredFrame, FeatureValue, FrameObserver,
    FrameQueue, FrameStatus,
};
use crate::error::{CaptureError, Result};
use crate::pool::{BufferArena, BufferOwner};

const KERNEL_BUFFERS: u32 = 4;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pixel format feature values and their V4L2 fourcc codes.
const FORMATS: &[(&str, &[u8; 4])] = &[
    ("Mono8", b"GREY"),
    ("Mono12", b"Y12 "),
    ("BayerRG8", b"RGGB"),
    ("RGB8", b"RGB3"),
];

fn fourcc_for(format: &str) -> Option<v4l::FourCC> {
    FORMATS
        .iter()
        .find(|(name, _)| *name == format)
        .map(|(_, code)| v4l::FourCC::new(code))
}

fn format_for(fourcc: v4l::FourCC) -> Option<&'static str> {
    FORMATS
        .iter()
        .find(|(_, code)| v4l::FourCC::new(code) == fourcc)
        .map(|(name, _)| *name)
}

fn io_error(operation: &'static str, err: io::Error) -> CaptureError {
    CaptureError::driver(operation, err.to_string())
}

#[self_referencing]
struct DeviceStream {
    device: v4l::Device,
    #[borrows(device)]
    #[not_covariant]
    stream: MmapStream<'this>,
}

#[derive(Default)]
struct QueueState {
    arena: Option<Arc<BufferArena>>,
    announced: Vec<BufferId>,
    queue: VecDeque<BufferId>,
    observer: Option<Arc<dyn FrameObserver>>,
    acquiring: bool,
    running: bool,
    sequence: u64,
    skipped: u64,
}

#[derive(Default)]
struct V4l2Shared {
    state: Mutex<QueueState>,
}

impl V4l2Shared {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| CaptureError::driver("lock", "v4l2 queue state poisoned"))
    }
}

impl FrameQueue for V4l2Shared {
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
        state.queue.push_back(id);
        Ok(())
    }
}

pub struct V4l2Camera {
    path: String,
    device: Mutex<Option<v4l::Device>>,
    frame_rate: Mutex<f64>,
    shared: Arc<V4l2Shared>,
    worker: Mutex<Option<JoinHandle<Option<v4l::Device>>>>,
}

impl V4l2Camera {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device: Mutex::new(None),
            frame_rate: Mutex::new(0.0),
            shared: Arc::new(V4l2Shared::default()),
            worker: Mutex::new(None),
        }
    }

    fn with_device<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&v4l::Device) -> Result<R>,
    ) -> Result<R> {
        let device = self
            .device
            .lock()
            .map_err(|_| CaptureError::driver(operation, "device handle poisoned"))?;
        match device.as_ref() {
            Some(device) => f(device),
            None => Err(CaptureError::driver(
                operation,
                "camera is not open or capture engine is running",
            )),
        }
    }

    fn set_format_field(&self, name: &str, value: &FeatureValue) -> Result<()> {
        self.with_device("set feature", |device| {
            let mut format = device
                .format()
                .map_err(|err| CaptureError::feature("set feature", name, err.to_string()))?;
            match name {
                features::WIDTH => format.width = int_value(name, value)? as u32,
                features::HEIGHT => format.height = int_value(name, value)? as u32,
                _ => {
                    let requested = value.as_enum().ok_or_else(|| {
                        CaptureError::feature("set feature", name, "expected enum")
                    })?;
                    format.fourcc = fourcc_for(requested).ok_or_else(|| {
                        CaptureError::feature(
                            "set feature",
                            name,
                            format!("no fourcc for {}", requested),
                        )
                    })?;
                }
            }
            let applied = device
                .set_format(&format)
                .map_err(|err| CaptureError::feature("set feature", name, err.to_string()))?;
            if applied.width != format.width
                || applied.height != format.height
                || applied.fourcc != format.fourcc
            {
                return Err(CaptureError::feature(
                    "set feature",
                    name,
                    format!(
                        "device chose {}x{} {} instead",
                        applied.width, applied.height, applied.fourcc
                    ),
                ));
            }
            Ok(())
        })
    }
}

fn int_value(name: &str, value: &FeatureValue) -> Result<i64> {
    value
        .as_int()
        .filter(|v| *v > 0)
        .ok_or_else(|| CaptureError::feature("set feature", name, "expected positive integer"))
}

impl CameraDriver for V4l2Camera {
    fn id(&self) -> &str {
        &self.path
    }

    fn name(&self) -> &str {
        "V4L2 device"
    }

    fn open(&self) -> Result<()> {
        let device = v4l::Device::with_path(&self.path).map_err(|err| io_error("open camera", err))?;
        let mut slot = self
            .device
            .lock()
            .map_err(|_| CaptureError::driver("open camera", "device handle poisoned"))?;
        *slot = Some(device);
        log::info!("v4l2: opened {}", self.path);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.end_capture()?;
        let mut slot = self
            .device
            .lock()
            .map_err(|_| CaptureError::driver("close camera", "device handle poisoned"))?;
        *slot = None;
        self.shared.lock()?.observer = None;
        Ok(())
    }

    fn feature(&self, name: &str) -> Result<FeatureValue> {
        if name == features::FRAME_RATE {
            let fps = *self
                .frame_rate
                .lock()
                .map_err(|_| CaptureError::driver("get feature", "frame rate poisoned"))?;
            return Ok(FeatureValue::Float(fps));
        }
        self.with_device("get feature", |device| {
            let format = device
                .format()
                .map_err(|err| CaptureError::feature("get feature", name, err.to_string()))?;
            match name {
                features::WIDTH => Ok(FeatureValue::Int(format.width as i64)),
                features::HEIGHT => Ok(FeatureValue::Int(format.height as i64)),
                features::PAYLOAD_SIZE => Ok(FeatureValue::Int(format.size as i64)),
                features::STRIDE => Ok(FeatureValue::Int(format.stride as i64)),
                features::PIXEL_FORMAT => format_for(format.fourcc)
                    .map(|name| FeatureValue::Enum(name.to_string()))
                    .ok_or_else(|| {
                        CaptureError::feature(
                            "get feature",
                            name,
                            format!("unmapped fourcc {}", format.fourcc),
                        )
                    }),
                _ => Err(CaptureError::feature("get feature", name, "feature not found")),
            }
        })
    }

    fn feature_range(&self, name: &str) -> Result<(i64, i64)> {
        if name != features::WIDTH && name != features::HEIGHT {
            return Err(CaptureError::feature(
                "get feature range",
                name,
                "feature has no range",
            ));
        }
        self.with_device("get feature range", |device| {
            let format = device
                .format()
                .map_err(|err| CaptureError::feature("get feature range", name, err.to_string()))?;
            let sizes = device
                .enum_framesizes(format.fourcc)
                .map_err(|err| CaptureError::feature("get feature range", name, err.to_string()))?;
            let mut range: Option<(i64, i64)> = None;
            for size in sizes {
                let (lo, hi) = match (size.size, name == features::WIDTH) {
                    (v4l::framesize::FrameSizeEnum::Discrete(d), true) => (d.width, d.width),
                    (v4l::framesize::FrameSizeEnum::Discrete(d), false) => (d.height, d.height),
                    (v4l::framesize::FrameSizeEnum::Stepwise(s), true) => (s.min_width, s.max_width),
                    (v4l::framesize::FrameSizeEnum::Stepwise(s), false) => {
                        (s.min_height, s.max_height)
                    }
                };
                range = Some(match range {
                    Some((min, max)) => (min.min(lo as i64), max.max(hi as i64)),
                    None => (lo as i64, hi as i64),
                });
            }
            range.ok_or_else(|| {
                CaptureError::feature("get feature range", name, "device reports no frame sizes")
            })
        })
    }

    fn set_feature(&self, name: &str, value: FeatureValue) -> Result<()> {
        match name {
            features::WIDTH | features::HEIGHT | features::PIXEL_FORMAT => {
                self.set_format_field(name, &value)
            }
            features::FRAME_RATE => {
                let fps = value
                    .as_float()
                    .filter(|fps| *fps > 0.0)
                    .ok_or_else(|| CaptureError::feature("set feature", name, "expected rate"))?;
                let applied = self.with_device("set feature", |device| {
                    let params = v4l::video::capture::Parameters::with_fps(fps.round() as u32);
                    let applied = device
                        .set_params(&params)
                        .map_err(|err| CaptureError::feature("set feature", name, err.to_string()))?;
                    let interval = applied.interval;
                    if interval.numerator == 0 {
                        return Ok(fps);
                    }
                    Ok(interval.denominator as f64 / interval.numerator as f64)
                })?;
                *self
                    .frame_rate
                    .lock()
                    .map_err(|_| CaptureError::driver("set feature", "frame rate poisoned"))? =
                    applied;
                Ok(())
            }
            _ => Err(CaptureError::feature(
                "set feature",
                name,
                "feature not writable",
            )),
        }
    }

    fn run_command(&self, name: &str) -> Result<()> {
        let mut state = self.shared.lock()?;
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
                | features::STRIDE
                | features::ACQUISITION_START
                | features::ACQUISITION_STOP
        )
    }

    fn register_observer(&self, observer: Arc<dyn FrameObserver>) -> Result<()> {
        self.shared.lock()?.observer = Some(observer);
        Ok(())
    }

    fn announce_frame(&self, arena: &Arc<BufferArena>, id: BufferId) -> Result<()> {
        let mut state = self.shared.lock()?;
        if state.running {
            return Err(CaptureError::driver(
                "announce frame",
                "capture engine is running",
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
        state.announced.push(id);
        Ok(())
    }

    fn start_capture(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| CaptureError::driver("start capture", "worker handle poisoned"))?;
        if worker.is_some() {
            return Ok(());
        }
        let device = self
            .device
            .lock()
            .map_err(|_| CaptureError::driver("start capture", "device handle poisoned"))?
            .take()
            .ok_or_else(|| CaptureError::driver("start capture", "camera is not open"))?;

        let mut stream = DeviceStreamTryBuilder {
            device,
            stream_builder: |device| MmapStream::with_buffers(device, Type::VideoCapture, KERNEL_BUFFERS),
        }
        .try_build()
        .map_err(|err| io_error("start capture", err))?;
        stream.with_stream_mut(|stream| stream.set_timeout(DEQUEUE_TIMEOUT));

        self.shared.lock()?.running = true;
        let shared = self.shared.clone();
        let path = self.path.clone();
        let handle = std::thread::Builder::new()
            .name(format!("v4l2-{}", path.rsplit('/').next().unwrap_or("cam")))
            .spawn(move || run_capture(stream, shared, path))
            .map_err(|err| io_error("start capture", err))?;
        *worker = Some(handle);
        Ok(())
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
            state.running = false;
            state.acquiring = false;
        }
        let handle = self
            .worker
            .lock()
            .map_err(|_| CaptureError::driver("end capture", "worker handle poisoned"))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let device = handle
            .join()
            .map_err(|_| CaptureError::driver("end capture", "capture thread panicked"))?;
        let mut slot = self
            .device
            .lock()
            .map_err(|_| CaptureError::driver("end capture", "device handle poisoned"))?;
        *slot = device;
        Ok(())
    }

    fn flush_queue(&self) -> Result<()> {
        self.shared.lock()?.queue.clear();
        Ok(())
    }

    fn revoke_all_frames(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        if state.running {
            return Err(CaptureError::driver(
                "revoke frames",
                "capture engine is still running",
            ));
        }
        state.queue.clear();
        state.announced.clear();
        state.arena = None;
        Ok(())
    }
}

fn run_capture(mut stream: DeviceStream, shared: Arc<V4l2Shared>, path: String) -> Option<v4l::Device> {
    loop {
        let target = match shared.lock() {
            Ok(mut state) => {
                if !state.running {
                    break;
                }
                if state.acquiring {
                    match (state.queue.pop_front(), state.arena.clone(), state.observer.clone()) {
                        (Some(id), Some(arena), Some(observer)) => {
                            state.sequence += 1;
                            Some((id, arena, observer, state.sequence))
                        }
                        (id, _, _) => {
                            if let Some(id) = id {
                                state.queue.push_front(id);
                            }
                            None
                        }
                    }
                } else {
                    None
                }
            }
            Err(err) => {
                log::error!("{}: capture thread stopped: {}", path, err);
                break;
            }
        };

        let dequeued = stream.with_stream_mut(|stream| -> io::Result<Option<FrameStatus>> {
            let (data, meta) = stream.next()?;
            let Some((id, arena, _, _)) = &target else {
                return Ok(None);
            };
            let status = if meta.flags.contains(Flags::ERROR) {
                FrameStatus::Invalid
            } else if (meta.bytesused as usize) < arena.buffer_size().min(data.len()) {
                FrameStatus::Incomplete
            } else {
                FrameStatus::Complete
            };
            arena
                .with_data_mut(*id, BufferOwner::Driver, |dst| {
                    let len = dst.len().min(data.len());
                    dst[..len].copy_from_slice(&data[..len]);
                })
                .map_err(io::Error::other)?;
            Ok(Some(status))
        });

        match (dequeued, target) {
            (Ok(Some(status)), Some((id, arena, observer, sequence))) => {
                let queue: Arc<dyn FrameQueue> = shared.clone();
                match DeliveredFrame::deliver(arena, queue, id, status, sequence) {
                    Ok(frame) => observer.frame_received(frame),
                    Err(err) => log::error!("{}: delivery failed: {}", path, err),
                }
            }
            (Ok(_), None) => {
                if let Ok(mut state) = shared.lock() {
                    if state.acquiring {
                        state.skipped += 1;
                        log::debug!("{}: no queued buffer, {} frame(s) skipped", path, state.skipped);
                    }
                }
            }
            (Err(err), target) => {
                if let (Some((id, ..)), Ok(mut state)) = (target, shared.lock()) {
                    state.queue.push_front(id);
                }
                if err.kind() != io::ErrorKind::TimedOut {
                    log::warn!("{}: dequeue failed: {}", path, err);
                }
            }
            (Ok(None), Some((id, ..))) => {
                if let Ok(mut state) = shared.lock() {
                    state.queue.push_front(id);
                }
            }
        }
    }

    Some(stream.into_heads().device)
}

/// `v4l2://` camera system over a fixed device list.
pub struct V4l2System {
    devices: Vec<String>,
    cameras: Vec<Arc<V4l2Camera>>,
}

impl V4l2System {
    pub fn new(devices: Vec<String>) -> Self {
        Self {
            devices,
            cameras: Vec::new(),
        }
    }
}

impl CameraSystem for V4l2System {
    fn startup(&mut self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(CaptureError::driver(
                "start camera system",
                "no v4l2 devices listed",
            ));
        }
        self.cameras = self
            .devices
            .iter()
            .map(|path| Arc::new(V4l2Camera::new(path.clone())))
            .collect();
        log::info!("v4l2 camera system started ({} device(s))", self.cameras.len());
        Ok(())
    }

    fn cameras(&self) -> Result<Vec<Arc<dyn CameraDriver>>> {
        Ok(self
            .cameras
            .iter()
            .map(|camera| camera.clone() as Arc<dyn CameraDriver>)
            .collect())
    }

    fn shutdown(&mut self) {
        self.cameras.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono8_maps_to_grey() {
        let fourcc = fourcc_for("Mono8").expect("fourcc");
        assert_eq!(fourcc, v4l::FourCC::new(b"GREY"));
        assert_eq!(format_for(fourcc), Some("Mono8"));
        assert!(fourcc_for("YUYV").is_none());
    }

    #[test]
    fn empty_device_list_fails_startup() {
        let mut system = V4l2System::new(Vec::new());
        assert!(system.startup().is_err());
    }
}
