//! Per-camera capture session.
//!
//! A session owns one opened camera together with its frame buffer pool, its
//! frame sink (and through it the output stream). Bring-up negotiates the
//! capture parameters and leaves the camera ready to stream: buffers are
//! announced and queued and the capture engine is running, so
//! `start_acquisition` is a single driver command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::convert::{PixelConverter, PixelFormat};
use crate::driver::{features, CameraDriver, FeatureValue};
use crate::encoder::{EncoderSettings, StreamEncoder, StreamSummary};
use crate::error::{CaptureError, Result};
use crate::pool::FrameBufferPool;
use crate::preview::PreviewMirror;
use crate::sink::{FrameGeometry, FrameSink, SinkStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Capturing,
    Stopped,
    Closed,
}

/// Parameters read back from the camera after negotiation.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureParams {
    pub width: usize,
    pub height: usize,
    pub pixel_format: PixelFormat,
    pub frame_rate: f64,
    pub payload_size: usize,
    /// Bytes per row in the delivered buffers.
    pub line_stride: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub camera: String,
    pub output: PathBuf,
    pub stream: Option<StreamSummary>,
    pub stats: SinkStats,
    pub fatal_error: Option<String>,
}

pub struct CameraSession {
    index: usize,
    driver: Arc<dyn CameraDriver>,
    params: CaptureParams,
    output: PathBuf,
    sink: Arc<FrameSink>,
    pool: Option<FrameBufferPool>,
    start_command: &'static str,
    stop_command: &'static str,
    drain_timeout: std::time::Duration,
    state: SessionState,
    report: Option<SessionReport>,
}

/// Resources acquired so far during bring-up, released in reverse on failure.
struct PartialSession {
    driver: Arc<dyn CameraDriver>,
    sink: Option<Arc<FrameSink>>,
    pool: Option<FrameBufferPool>,
    capturing: bool,
}

impl PartialSession {
    fn unwind(mut self, drain_timeout: std::time::Duration) {
        let id = self.driver.id().to_string();
        if self.capturing {
            if let Err(err) = self.driver.end_capture() {
                log::error!("{}: end capture during unwind failed: {}", id, err);
            }
            if let Err(err) = self.driver.flush_queue() {
                log::error!("{}: flush queue during unwind failed: {}", id, err);
            }
        }
        if let Some(mut pool) = self.pool.take() {
            if let Err(err) = pool.release(drain_timeout) {
                log::error!("{}: buffer release during unwind failed: {}", id, err);
            }
        }
        if let Some(sink) = self.sink.take() {
            if let Err(err) = sink.finish(drain_timeout) {
                log::error!("{}: finalizing stream during unwind failed: {}", id, err);
            }
        }
        if let Err(err) = self.driver.close() {
            log::error!("{}: close during unwind failed: {}", id, err);
        }
    }
}

impl CameraSession {
    /// Open and configure `driver`, create its output stream and leave it ready
    /// for `start_acquisition`.
    ///
    /// On failure everything acquired so far is released; an output file that
    /// was already created is finalized, not deleted.
    pub fn bring_up(
        driver: Arc<dyn CameraDriver>,
        index: usize,
        config: &SessionConfig,
        output: PathBuf,
        preview: Option<Arc<PreviewMirror>>,
    ) -> Result<Self> {
        log::info!(
            "camera {}: opening {} ({})",
            index + 1,
            driver.id(),
            driver.name()
        );
        driver.open()?;

        let mut partial = PartialSession {
            driver: driver.clone(),
            sink: None,
            pool: None,
            capturing: false,
        };
        match Self::configure(&mut partial, config, &output, preview) {
            Ok((params, start_command, stop_command)) => {
                let (Some(sink), Some(pool)) = (partial.sink.take(), partial.pool.take()) else {
                    partial.unwind(config.drain_timeout);
                    return Err(CaptureError::State("bring-up left no sink or pool".into()));
                };
                log::info!(
                    "camera {}: {}x{} {} @ {} fps, {} buffers of {} bytes -> {}",
                    index + 1,
                    params.width,
                    params.height,
                    params.pixel_format,
                    params.frame_rate,
                    pool.len(),
                    params.payload_size,
                    output.display()
                );
                Ok(Self {
                    index,
                    driver,
                    params,
                    output,
                    sink,
                    pool: Some(pool),
                    start_command,
                    stop_command,
                    drain_timeout: config.drain_timeout,
                    state: SessionState::Ready,
                    report: None,
                })
            }
            Err(err) => {
                log::error!("camera {}: bring-up failed: {}", index + 1, err);
                partial.unwind(config.drain_timeout);
                Err(err)
            }
        }
    }

    fn configure(
        partial: &mut PartialSession,
        config: &SessionConfig,
        output: &Path,
        preview: Option<Arc<PreviewMirror>>,
    ) -> Result<(CaptureParams, &'static str, &'static str)> {
        let driver = partial.driver.clone();

        let pixel_format = PixelFormat::from_feature(&config.pixel_format)?;
        if !PixelConverter::supports(pixel_format) {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} cannot be encoded",
                pixel_format
            )));
        }
        if preview.is_some() && !PreviewMirror::supports(pixel_format) {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} cannot be previewed",
                pixel_format
            )));
        }
        driver.set_feature(
            features::PIXEL_FORMAT,
            FeatureValue::Enum(pixel_format.feature_name().to_string()),
        )?;

        negotiate_dimension(driver.as_ref(), features::WIDTH, config.width)?;
        negotiate_dimension(driver.as_ref(), features::HEIGHT, config.height)?;
        driver.set_feature(
            features::FRAME_RATE,
            FeatureValue::Float(config.frame_rate as f64),
        )?;

        let params = read_params(driver.as_ref(), pixel_format)?;
        let geometry = FrameGeometry {
            width: params.width,
            height: params.height,
            line_stride: params.line_stride,
            format: pixel_format,
        };

        let converter = PixelConverter::new(params.width, params.height, pixel_format)?;
        let stream = StreamEncoder::open(
            output,
            EncoderSettings {
                width: params.width,
                height: params.height,
                frame_rate: params.frame_rate.round().max(1.0) as u32,
                quality: config.quality,
                preset: config.preset.clone(),
            },
            config.encoder,
        )?;
        let sink = Arc::new(FrameSink::new(
            driver.id(),
            geometry,
            converter,
            stream,
            preview,
        ));
        partial.sink = Some(sink.clone());
        driver.register_observer(sink)?;

        let pool = FrameBufferPool::allocate(driver.clone(), config.buffer_count, params.payload_size)?;
        let ids: Vec<_> = pool.arena().ids().collect();
        partial.pool = Some(pool);

        driver.start_capture()?;
        partial.capturing = true;
        for id in ids {
            driver.queue_frame(id)?;
        }

        for command in [features::ACQUISITION_START, features::ACQUISITION_STOP] {
            if !driver.has_feature(command) {
                return Err(CaptureError::feature(
                    "resolve command",
                    command,
                    "camera does not provide this command",
                ));
            }
        }

        Ok((
            params,
            features::ACQUISITION_START,
            features::ACQUISITION_STOP,
        ))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn camera_id(&self) -> &str {
        self.driver.id()
    }

    pub fn params(&self) -> &CaptureParams {
        &self.params
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == SessionState::Capturing
    }

    pub fn stats(&self) -> SinkStats {
        self.sink.stats()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.sink.fatal_error()
    }

    /// Issue the acquisition start command. No-op if already capturing.
    pub fn start_acquisition(&mut self) -> Result<()> {
        match self.state {
            SessionState::Capturing => Ok(()),
            SessionState::Ready | SessionState::Stopped => {
                self.driver.run_command(self.start_command)?;
                self.state = SessionState::Capturing;
                Ok(())
            }
            SessionState::Closed => Err(CaptureError::State(format!(
                "{}: start after shutdown",
                self.driver.id()
            ))),
        }
    }

    /// Issue the acquisition stop command. No-op unless capturing.
    pub fn stop_acquisition(&mut self) -> Result<()> {
        match self.state {
            SessionState::Capturing => {
                self.driver.run_command(self.stop_command)?;
                self.state = SessionState::Stopped;
                Ok(())
            }
            SessionState::Ready | SessionState::Stopped => Ok(()),
            SessionState::Closed => Err(CaptureError::State(format!(
                "{}: stop after shutdown",
                self.driver.id()
            ))),
        }
    }

    /// Stop, tear down capture and finalize the output stream.
    ///
    /// Every step is attempted; the first failure is returned after the rest
    /// of the teardown has run. A second call returns the same report.
    pub fn shutdown(&mut self) -> Result<SessionReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }
        let id = self.driver.id().to_string();
        let mut first_error: Option<CaptureError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(err) = result {
                log::error!("{}: {} failed: {}", id, step, err);
                first_error.get_or_insert(err);
            }
        };

        let stopped = self.stop_acquisition();
        note("stop acquisition", stopped);
        note("end capture", self.driver.end_capture());
        note("flush queue", self.driver.flush_queue());

        let busy = self.sink.drain(self.drain_timeout);
        if busy > 0 {
            log::warn!(
                "{}: {} frame callback(s) still running after {:?}",
                id,
                busy,
                self.drain_timeout
            );
        }
        if let Some(mut pool) = self.pool.take() {
            note("release buffers", pool.release(self.drain_timeout));
        }

        let stream = match self.sink.finish(self.drain_timeout) {
            Ok(summary) => summary,
            Err(err) => {
                note("finalize stream", Err(err));
                None
            }
        };
        note("close camera", self.driver.close());
        self.state = SessionState::Closed;

        let report = SessionReport {
            camera: id,
            output: self.output.clone(),
            stream,
            stats: self.sink.stats(),
            fatal_error: self.sink.fatal_error(),
        };
        self.report = Some(report.clone());
        log::info!(
            "camera {}: closed ({} frames encoded, {} dropped)",
            self.index + 1,
            report.stats.encoded,
            report.stats.dropped
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if self.report.is_none() {
            if let Err(err) = self.shutdown() {
                log::error!("{}: shutdown on drop failed: {}", self.driver.id(), err);
            }
        }
    }
}

/// Clamp the request into the feature's range, round down to even and apply it.
/// A request of 0 selects the largest even value.
fn negotiate_dimension(driver: &dyn CameraDriver, name: &str, requested: u32) -> Result<i64> {
    let (min, max) = driver.feature_range(name)?;
    let value = if requested == 0 {
        max
    } else {
        (requested as i64).clamp(min, max)
    };
    let mut value = value - value % 2;
    if value < min {
        value += 2;
    }
    if value > max || value <= 0 {
        return Err(CaptureError::feature(
            "negotiate",
            name,
            format!("no even value in {}..={}", min, max),
        ));
    }
    if requested != 0 && value != requested as i64 {
        log::warn!("{} {} adjusted to {}", name, requested, value);
    }
    driver.set_feature(name, FeatureValue::Int(value))?;
    Ok(value)
}

fn read_params(driver: &dyn CameraDriver, pixel_format: PixelFormat) -> Result<CaptureParams> {
    let int = |name: &str| -> Result<usize> {
        let value = driver.feature(name)?;
        value
            .as_int()
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .ok_or_else(|| {
                CaptureError::feature("get feature", name, format!("unexpected value {}", value))
            })
    };
    let width = int(features::WIDTH)?;
    let height = int(features::HEIGHT)?;
    let payload_size = int(features::PAYLOAD_SIZE)?;
    let frame_rate = driver
        .feature(features::FRAME_RATE)?
        .as_float()
        .ok_or_else(|| {
            CaptureError::feature("get feature", features::FRAME_RATE, "expected a number")
        })?;

    let min_stride = pixel_format.min_stride(width);
    let line_stride = if driver.has_feature(features::STRIDE) {
        int(features::STRIDE)?
    } else {
        min_stride
    };
    if line_stride < min_stride {
        return Err(CaptureError::feature(
            "get feature",
            features::STRIDE,
            format!("{} bytes is shorter than a {}-pixel row", line_stride, width),
        ));
    }

    // Anything after the last row (chunk data) is ignored.
    let min_payload = line_stride * (height - 1) + min_stride;
    if payload_size < min_payload {
        return Err(CaptureError::feature(
            "get feature",
            features::PAYLOAD_SIZE,
            format!(
                "{} bytes is too small for {}x{} {}",
                payload_size, width, height, pixel_format
            ),
        ));
    }
    Ok(CaptureParams {
        width,
        height,
        pixel_format,
        frame_rate,
        payload_size,
        line_stride,
    })
}
