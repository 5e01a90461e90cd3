//! Per-camera frame callback.
//!
//! `FrameSink` is registered with the driver as the camera's `FrameObserver`.
//! For every delivered buffer it converts the image, submits it to the stream
//! encoder, refreshes the preview mirror and hands the buffer back to the
//! driver. Errors never escape the callback: incomplete frames are dropped,
//! conversion or encoder failures stop the stream and are reported through
//! `fatal_error`. The buffer is requeued on every path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::convert::{PixelConverter, PixelFormat};
use crate::driver::{DeliveredFrame, FrameObserver};
use crate::encoder::{StreamEncoder, StreamSummary};
use crate::error::{CaptureError, Result};
use crate::preview::PreviewMirror;

/// Layout of the raw frames the driver delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: usize,
    pub height: usize,
    pub line_stride: usize,
    pub format: PixelFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub received: u64,
    pub encoded: u64,
    /// Skipped without touching the encoder (incomplete, after a failure or after finish).
    pub dropped: u64,
    /// Conversion or encoder failures.
    pub failed: u64,
}

struct Pipeline {
    converter: PixelConverter,
    stream: Option<StreamEncoder>,
}

/// Counts callbacks currently inside `frame_received`.
struct DrainBarrier {
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl DrainBarrier {
    fn enter(&self) -> InFlight<'_> {
        if let Ok(mut count) = self.in_flight.lock() {
            *count += 1;
        }
        InFlight { barrier: self }
    }

    /// Returns the number of callbacks still running when the timeout expired.
    fn wait_idle(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let Ok(mut count) = self.in_flight.lock() else {
            return 0;
        };
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.idle.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => count = guard,
                Err(_) => return 0,
            }
        }
        *count
    }
}

struct InFlight<'a> {
    barrier: &'a DrainBarrier,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut count) = self.barrier.in_flight.lock() {
            *count = count.saturating_sub(1);
        }
        self.barrier.idle.notify_all();
    }
}

pub struct FrameSink {
    camera: String,
    geometry: FrameGeometry,
    pipeline: Mutex<Pipeline>,
    preview: Option<Arc<PreviewMirror>>,
    accepting: AtomicBool,
    barrier: DrainBarrier,
    fatal: Mutex<Option<String>>,
    received: AtomicU64,
    encoded: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl FrameSink {
    pub fn new(
        camera: impl Into<String>,
        geometry: FrameGeometry,
        converter: PixelConverter,
        stream: StreamEncoder,
        preview: Option<Arc<PreviewMirror>>,
    ) -> Self {
        Self {
            camera: camera.into(),
            geometry,
            pipeline: Mutex::new(Pipeline {
                converter,
                stream: Some(stream),
            }),
            preview,
            accepting: AtomicBool::new(true),
            barrier: DrainBarrier {
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
            },
            fatal: Mutex::new(None),
            received: AtomicU64::new(0),
            encoded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            received: self.received.load(Ordering::SeqCst),
            encoded: self.encoded.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// First conversion or encoder failure, if the stream has stopped.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|fatal| fatal.clone())
    }

    /// Stop encoding. Frames delivered afterwards are requeued untouched.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Wait for running callbacks to return. Returns how many are still running.
    pub fn drain(&self, timeout: Duration) -> usize {
        self.barrier.wait_idle(timeout)
    }

    /// Stop accepting frames, wait for in-flight callbacks and finalize the stream.
    ///
    /// Returns `None` if the stream was already finalized.
    pub fn finish(&self, drain_timeout: Duration) -> Result<Option<StreamSummary>> {
        self.stop_accepting();
        let busy = self.drain(drain_timeout);
        if busy > 0 {
            log::warn!(
                "{}: {} frame callback(s) still running after {:?}",
                self.camera,
                busy,
                drain_timeout
            );
        }

        let stream = self.lock_pipeline()?.stream.take();
        match stream {
            Some(mut stream) => stream.close().map(Some),
            None => Ok(None),
        }
    }

    fn lock_pipeline(&self) -> Result<MutexGuard<'_, Pipeline>> {
        self.pipeline
            .lock()
            .map_err(|_| CaptureError::State(format!("{}: encoder lock poisoned", self.camera)))
    }

    fn record_fatal(&self, err: &CaptureError) {
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                *fatal = Some(err.to_string());
            }
        }
    }

    fn is_poisoned(&self) -> bool {
        self.fatal.lock().map(|fatal| fatal.is_some()).unwrap_or(true)
    }

    fn encode(&self, raw: &[u8]) -> Result<()> {
        let mut pipeline = self.lock_pipeline()?;
        let Pipeline { converter, stream } = &mut *pipeline;
        let stream = stream
            .as_mut()
            .ok_or_else(|| CaptureError::Encoder("stream already finalized".into()))?;
        let planar = converter.convert(raw, self.geometry.line_stride, self.geometry.format)?;
        stream.submit(planar)?;
        Ok(())
    }

    fn refresh_preview(&self, frame: &DeliveredFrame) {
        let Some(preview) = &self.preview else {
            return;
        };
        let geometry = self.geometry;
        let updated = frame.with_image(|raw| {
            preview.update(
                raw,
                geometry.width,
                geometry.height,
                geometry.line_stride,
                geometry.format,
            )
        });
        if let Err(err) = updated.and_then(|inner| inner) {
            log::warn!("{}: preview update failed: {}", self.camera, err);
        }
    }

    fn skip(&self, frame: DeliveredFrame) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
        self.requeue(frame);
    }

    fn requeue(&self, frame: DeliveredFrame) {
        let id = frame.id();
        if let Err(err) = frame.requeue() {
            log::error!("{}: requeue of buffer {} failed: {}", self.camera, id, err);
        }
    }
}

impl FrameObserver for FrameSink {
    fn frame_received(&self, frame: DeliveredFrame) {
        let _in_flight = self.barrier.enter();
        self.received.fetch_add(1, Ordering::SeqCst);

        if !self.accepting.load(Ordering::SeqCst) {
            self.skip(frame);
            return;
        }

        if !frame.status().is_complete() {
            let err = CaptureError::IncompleteFrame {
                buffer: frame.id(),
                status: frame.status(),
            };
            log::warn!("{}: dropping frame {}: {}", self.camera, frame.sequence(), err);
            self.skip(frame);
            return;
        }

        if self.is_poisoned() {
            self.skip(frame);
            return;
        }

        let encoded = frame
            .with_image(|raw| self.encode(raw))
            .and_then(|inner| inner);
        match encoded {
            Ok(()) => {
                self.encoded.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                log::error!(
                    "{}: frame {} not encoded, stopping stream: {}",
                    self.camera,
                    frame.sequence(),
                    err
                );
                self.record_fatal(&err);
            }
        }

        self.refresh_preview(&frame);
        self.requeue(frame);
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("camera", &self.camera)
            .field("geometry", &self.geometry)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::PlanarFrame;
    use crate::driver::{BufferId, FrameQueue, FrameStatus};
    use crate::encoder::{
        EncodedPacket, EncoderKind, EncoderSettings, Quality, VideoEncoder, END_OF_STREAM_MARKER,
    };
    use crate::pool::{BufferArena, BufferOwner};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingQueue {
        queued: Mutex<Vec<BufferId>>,
    }

    impl FrameQueue for RecordingQueue {
        fn queue_frame(&self, id: BufferId) -> Result<()> {
            self.queued.lock().expect("queue lock").push(id);
            Ok(())
        }
    }

    struct FailingEncoder;

    impl VideoEncoder for FailingEncoder {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn encode(&mut self, _frame: &PlanarFrame, _pts: i64) -> Result<Vec<EncodedPacket>> {
            Err(CaptureError::Encoder("device lost".into()))
        }

        fn flush(&mut self) -> Result<Option<EncodedPacket>> {
            Ok(None)
        }
    }

    /// Signals when `encode` starts, then holds the pipeline lock for a while.
    struct SlowEncoder {
        started: Arc<AtomicBool>,
        delay: Duration,
    }

    impl VideoEncoder for SlowEncoder {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn encode(&mut self, _frame: &PlanarFrame, pts: i64) -> Result<Vec<EncodedPacket>> {
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(vec![EncodedPacket {
                data: vec![0, 0, 0, 1, 0x65],
                pts,
                key: true,
            }])
        }

        fn flush(&mut self) -> Result<Option<EncodedPacket>> {
            Ok(None)
        }
    }

    struct Fixture {
        path: std::path::PathBuf,
        arena: Arc<BufferArena>,
        queue: Arc<RecordingQueue>,
        sink: FrameSink,
        preview: Arc<PreviewMirror>,
        _dir: TempDir,
    }

    const SIZE: usize = 16;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            width: SIZE,
            height: SIZE,
            frame_rate: 24,
            quality: Quality::Lossless,
            preset: "ultrafast".to_string(),
        }
    }

    fn fixture(encoder: Option<Box<dyn VideoEncoder>>) -> Result<Fixture> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sink.h264");
        let stream = match encoder {
            Some(encoder) => StreamEncoder::with_encoder(&path, settings(), encoder)?,
            None => StreamEncoder::open(&path, settings(), EncoderKind::Pcm)?,
        };
        let geometry = FrameGeometry {
            width: SIZE,
            height: SIZE,
            line_stride: SIZE,
            format: PixelFormat::Mono8,
        };
        let preview = Arc::new(PreviewMirror::new());
        let sink = FrameSink::new(
            "test-cam",
            geometry,
            PixelConverter::new(SIZE, SIZE, PixelFormat::Mono8)?,
            stream,
            Some(preview.clone()),
        );
        let arena = Arc::new(BufferArena::new(2, SIZE * SIZE));
        for id in arena.ids() {
            arena.transfer(id, BufferOwner::Pool, BufferOwner::Driver)?;
        }
        Ok(Fixture {
            path,
            arena,
            queue: Arc::new(RecordingQueue::default()),
            sink,
            preview,
            _dir: dir,
        })
    }

    impl Fixture {
        fn deliver(&self, id: usize, status: FrameStatus, sequence: u64) -> Result<()> {
            self.arena
                .with_data_mut(BufferId(id), BufferOwner::Driver, |buf| buf.fill(sequence as u8))?;
            let queue: Arc<dyn FrameQueue> = self.queue.clone();
            let frame =
                DeliveredFrame::deliver(self.arena.clone(), queue, BufferId(id), status, sequence)?;
            self.sink.frame_received(frame);
            Ok(())
        }

        fn requeued(&self) -> usize {
            self.queue.queued.lock().expect("queue lock").len()
        }
    }

    #[test]
    fn complete_frames_are_encoded_and_requeued() -> Result<()> {
        let fx = fixture(None)?;
        fx.deliver(0, FrameStatus::Complete, 1)?;
        fx.deliver(1, FrameStatus::Complete, 2)?;

        assert_eq!(fx.sink.stats().encoded, 2);
        assert_eq!(fx.requeued(), 2);
        assert_eq!(fx.arena.owner_counts()?.driver, 2);

        let preview = fx.preview.read().expect("preview frame");
        assert!(preview.data.iter().all(|v| *v == 2));

        let summary = fx.sink.finish(Duration::from_millis(100))?.expect("summary");
        assert_eq!(summary.frames, 2);
        assert!(std::fs::read(&fx.path)?.ends_with(&END_OF_STREAM_MARKER));
        Ok(())
    }

    #[test]
    fn incomplete_frames_are_dropped_but_requeued() -> Result<()> {
        let fx = fixture(None)?;
        fx.deliver(0, FrameStatus::Incomplete, 1)?;
        fx.deliver(1, FrameStatus::Complete, 2)?;

        let stats = fx.sink.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.encoded, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(fx.requeued(), 2);
        assert!(fx.sink.fatal_error().is_none());
        Ok(())
    }

    #[test]
    fn encoder_failure_poisons_stream_but_buffers_keep_cycling() -> Result<()> {
        let fx = fixture(Some(Box::new(FailingEncoder)))?;
        fx.deliver(0, FrameStatus::Complete, 1)?;
        fx.deliver(1, FrameStatus::Complete, 2)?;
        fx.deliver(0, FrameStatus::Complete, 3)?;

        let stats = fx.sink.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.encoded, 0);
        assert_eq!(fx.requeued(), 3);
        assert!(fx.sink.fatal_error().expect("fatal").contains("device lost"));
        Ok(())
    }

    #[test]
    fn frames_after_finish_are_not_encoded() -> Result<()> {
        let fx = fixture(None)?;
        fx.deliver(0, FrameStatus::Complete, 1)?;
        assert!(fx.sink.finish(Duration::from_millis(100))?.is_some());
        let len = std::fs::metadata(&fx.path)?.len();

        fx.deliver(1, FrameStatus::Complete, 2)?;
        assert_eq!(fx.sink.stats().dropped, 1);
        assert_eq!(fx.requeued(), 2);
        assert_eq!(std::fs::metadata(&fx.path)?.len(), len);
        assert!(fx.sink.finish(Duration::from_millis(100))?.is_none());
        Ok(())
    }

    #[test]
    fn finish_waits_for_callback_in_flight() -> Result<()> {
        let started = Arc::new(AtomicBool::new(false));
        let fx = fixture(Some(Box::new(SlowEncoder {
            started: started.clone(),
            delay: Duration::from_millis(300),
        })))?;

        let summary = std::thread::scope(|scope| -> Result<Option<StreamSummary>> {
            let delivery = scope.spawn(|| fx.deliver(0, FrameStatus::Complete, 1));
            while !started.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(fx.sink.drain(Duration::ZERO), 1);

            let summary = fx.sink.finish(Duration::from_secs(2))?;
            delivery
                .join()
                .map_err(|_| CaptureError::State("delivery thread panicked".into()))??;
            Ok(summary)
        })?;

        let summary = summary.expect("summary");
        assert_eq!(summary.frames, 1);
        assert!(fx.sink.fatal_error().is_none());
        assert_eq!(fx.sink.stats().encoded, 1);
        assert_eq!(fx.requeued(), 1);
        assert!(std::fs::read(&fx.path)?.ends_with(&END_OF_STREAM_MARKER));
        Ok(())
    }

    #[test]
    fn drain_with_no_callbacks_is_immediate() -> Result<()> {
        let fx = fixture(None)?;
        assert_eq!(fx.sink.drain(Duration::ZERO), 0);
        Ok(())
    }
}
