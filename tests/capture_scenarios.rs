//! End-to-end capture tests against simulated cameras.
//!
//! These tests verify that:
//! 1. A single camera records a finalized stream
//! 2. Incomplete frames are dropped without losing buffers
//! 3. Start and stop commands are issued to all cameras as two tight loops
//! 4. A bring-up failure unwinds the cameras already brought up
//! 5. Buffers have a single owner under concurrent callbacks
//! 6. Concurrent callbacks into one sink produce a complete stream
//! 7. Cameras are stopped again when recording or starting fails

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use sync_grabber::driver::stub::{CommandLog, StubCamera, StubCameraConfig};
use sync_grabber::{
    BufferOwner, CameraDriver, CaptureError, CaptureOrchestrator, DeliveredFrame, FeatureValue,
    FrameBufferPool, FrameObserver, GrabberConfig, END_OF_STREAM_MARKER,
};

const WAIT: Duration = Duration::from_secs(10);

fn config(dir: &TempDir) -> GrabberConfig {
    GrabberConfig {
        width: 64,
        height: 64,
        output_dir: dir.path().to_path_buf(),
        label: "scenario".to_string(),
        drain_timeout: Duration::from_secs(2),
        ..GrabberConfig::default()
    }
}

fn outputs(dir: &TempDir, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|index| dir.path().join(format!("camera{:02}.h264", index + 1)))
        .collect()
}

fn as_drivers(cameras: &[Arc<StubCamera>]) -> Vec<Arc<dyn CameraDriver>> {
    cameras
        .iter()
        .map(|camera| camera.clone() as Arc<dyn CameraDriver>)
        .collect()
}

#[test]
fn single_camera_records_finalized_stream() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let camera = Arc::new(StubCamera::new(StubCameraConfig {
        frame_limit: Some(10),
        ..StubCameraConfig::default()
    }));
    let paths = outputs(&dir, 1);

    let mut orchestrator =
        CaptureOrchestrator::bring_up(as_drivers(&[camera.clone()]), &config(&dir), paths.clone())?;
    orchestrator.start_all()?;
    assert!(camera.wait_for_deliveries(10, WAIT));
    orchestrator.stop_all()?;
    let reports = orchestrator.shutdown()?;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stats.encoded, 10);
    let stream = reports[0].stream.as_ref().expect("stream summary");
    assert_eq!(stream.frames, 10);

    let bytes = std::fs::read(&paths[0])?;
    assert!(!bytes.is_empty());
    assert_eq!(bytes.len() as u64, stream.bytes);
    assert_eq!(&bytes[..5], &[0x00, 0x00, 0x00, 0x01, 0x67]);
    assert!(bytes.ends_with(&END_OF_STREAM_MARKER));
    Ok(())
}

#[test]
fn incomplete_frame_is_dropped_and_requeued() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let camera = Arc::new(StubCamera::new(StubCameraConfig {
        frame_limit: Some(10),
        incomplete_frames: vec![5],
        ..StubCameraConfig::default()
    }));

    let mut orchestrator =
        CaptureOrchestrator::bring_up(as_drivers(&[camera.clone()]), &config(&dir), outputs(&dir, 1))?;
    orchestrator.record(|_| -> Result<(), CaptureError> {
        assert!(camera.wait_for_deliveries(10, WAIT));
        Ok(())
    })?;
    let reports = orchestrator.shutdown()?;

    let stats = camera.stats();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.incomplete, 1);
    assert_eq!(stats.requeued, 10);
    assert_eq!(reports[0].stats.encoded, 9);
    assert_eq!(reports[0].stats.dropped, 1);
    assert!(reports[0].fatal_error.is_none());
    Ok(())
}

#[test]
fn start_and_stop_reach_every_camera_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let log = CommandLog::new();
    let cameras: Vec<Arc<StubCamera>> = (0..2)
        .map(|index| {
            Arc::new(StubCamera::new(StubCameraConfig {
                id: format!("cam-{}", index + 1),
                realtime: true,
                command_log: Some(log.clone()),
                ..StubCameraConfig::default()
            }))
        })
        .collect();
    let cfg = GrabberConfig {
        frame_rate: 100,
        ..config(&dir)
    };

    let mut orchestrator = CaptureOrchestrator::bring_up(as_drivers(&cameras), &cfg, outputs(&dir, 2))?;
    orchestrator.start_all()?;
    assert!(orchestrator.sessions().iter().all(|s| s.is_capturing()));
    std::thread::sleep(Duration::from_millis(50));
    orchestrator.stop_all()?;
    assert!(orchestrator.sessions().iter().all(|s| !s.is_capturing()));

    let window = orchestrator.window();
    assert!(window.opened_at.is_some() && window.closed_at.is_some());
    orchestrator.shutdown()?;

    let entries = log.entries();
    let starts: Vec<_> = entries
        .iter()
        .filter(|e| e.command == "AcquisitionStart")
        .collect();
    let stops: Vec<_> = entries
        .iter()
        .filter(|e| e.command == "AcquisitionStop")
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(stops.len(), 2);
    let last_start = starts.iter().map(|e| e.at).max().expect("start");
    let first_stop = stops.iter().map(|e| e.at).min().expect("stop");
    assert!(last_start <= first_stop);
    let first_stop_index = entries
        .iter()
        .position(|e| e.command == "AcquisitionStop")
        .expect("stop entry");
    assert!(entries[..first_stop_index]
        .iter()
        .all(|e| e.command == "AcquisitionStart"));
    Ok(())
}

#[test]
fn failed_bring_up_finalizes_earlier_cameras() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cameras: Vec<Arc<StubCamera>> = (0..3)
        .map(|index| {
            Arc::new(StubCamera::new(StubCameraConfig {
                id: format!("cam-{}", index + 1),
                fail_feature: (index == 1).then(|| "AcquisitionFrameRate".to_string()),
                ..StubCameraConfig::default()
            }))
        })
        .collect();
    let paths = outputs(&dir, 3);

    let err = CaptureOrchestrator::bring_up(as_drivers(&cameras), &config(&dir), paths.clone())
        .err()
        .expect("bring-up must fail");
    assert_eq!(err.feature_name(), Some("AcquisitionFrameRate"));
    assert!(err.to_string().contains("AcquisitionFrameRate"));

    let first = std::fs::read(&paths[0])?;
    assert!(first.ends_with(&END_OF_STREAM_MARKER));
    assert!(!paths[1].exists());
    assert!(!paths[2].exists());

    for camera in &cameras {
        let stats = camera.stats();
        assert!(!stats.open);
        assert!(!stats.capture_engine);
        assert_eq!(stats.announced, 0);
    }
    Ok(())
}

#[test]
fn concurrent_callbacks_share_one_stream() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let camera = Arc::new(StubCamera::new(StubCameraConfig {
        callback_threads: 4,
        frame_limit: Some(200),
        ..StubCameraConfig::default()
    }));
    let paths = outputs(&dir, 1);

    let mut orchestrator =
        CaptureOrchestrator::bring_up(as_drivers(&[camera.clone()]), &config(&dir), paths.clone())?;
    orchestrator.record(|_| -> Result<(), CaptureError> {
        assert!(camera.wait_for_deliveries(200, WAIT));
        Ok(())
    })?;
    let reports = orchestrator.shutdown()?;

    let stats = camera.stats();
    assert_eq!(stats.delivered, 200);
    assert_eq!(stats.requeued, 200);
    let report = &reports[0];
    assert_eq!(report.stats.encoded, 200);
    assert_eq!(report.stats.dropped, 0);
    assert_eq!(report.stats.failed, 0);
    assert!(report.fatal_error.is_none());

    let stream = report.stream.as_ref().expect("stream summary");
    assert_eq!(stream.frames, 200);
    let bytes = std::fs::read(&paths[0])?;
    assert_eq!(bytes.len() as u64, stream.bytes);
    assert!(bytes.ends_with(&END_OF_STREAM_MARKER));
    Ok(())
}

fn logged_cameras(log: &CommandLog, count: usize) -> Vec<Arc<StubCamera>> {
    (0..count)
        .map(|index| {
            Arc::new(StubCamera::new(StubCameraConfig {
                id: format!("cam-{}", index + 1),
                command_log: Some(log.clone()),
                ..StubCameraConfig::default()
            }))
        })
        .collect()
}

fn commands_for(log: &CommandLog, camera: &str) -> Vec<String> {
    log.entries()
        .into_iter()
        .filter(|e| e.camera == camera)
        .map(|e| e.command)
        .collect()
}

#[test]
fn failed_recording_body_still_stops_every_camera() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let log = CommandLog::new();
    let cameras = logged_cameras(&log, 2);

    let mut orchestrator =
        CaptureOrchestrator::bring_up(as_drivers(&cameras), &config(&dir), outputs(&dir, 2))?;
    let outcome = orchestrator.record(|o| -> Result<(), CaptureError> {
        assert!(o.sessions().iter().all(|s| s.is_capturing()));
        Err(CaptureError::State("operator abort".into()))
    });
    assert!(matches!(outcome, Err(CaptureError::State(_))));
    assert!(orchestrator.sessions().iter().all(|s| !s.is_capturing()));

    for camera in ["cam-1", "cam-2"] {
        assert_eq!(
            commands_for(&log, camera),
            vec!["AcquisitionStart", "AcquisitionStop"],
            "{}",
            camera
        );
    }
    orchestrator.shutdown()?;
    Ok(())
}

#[test]
fn failed_start_stops_cameras_already_started() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let log = CommandLog::new();
    let cameras: Vec<Arc<StubCamera>> = (0..2)
        .map(|index| {
            Arc::new(StubCamera::new(StubCameraConfig {
                id: format!("cam-{}", index + 1),
                command_log: Some(log.clone()),
                fail_feature: (index == 1).then(|| "AcquisitionStart".to_string()),
                ..StubCameraConfig::default()
            }))
        })
        .collect();

    let mut orchestrator =
        CaptureOrchestrator::bring_up(as_drivers(&cameras), &config(&dir), outputs(&dir, 2))?;
    let err = orchestrator.start_all().expect_err("second camera cannot start");
    assert_eq!(err.feature_name(), Some("AcquisitionStart"));

    assert!(orchestrator.sessions().iter().all(|s| !s.is_capturing()));
    assert!(cameras.iter().all(|camera| !camera.stats().acquiring));
    assert_eq!(
        commands_for(&log, "cam-1"),
        vec!["AcquisitionStart", "AcquisitionStop"]
    );
    assert!(commands_for(&log, "cam-2").is_empty());
    assert!(orchestrator.window().opened_at.is_none());

    orchestrator.shutdown()?;
    assert!(cameras.iter().all(|camera| !camera.stats().open));
    Ok(())
}

/// Holds each buffer briefly and records which ones are in hand.
struct ExclusiveObserver {
    in_hand: Mutex<HashSet<usize>>,
    violations: Mutex<Vec<String>>,
    seen: Mutex<u64>,
}

impl FrameObserver for ExclusiveObserver {
    fn frame_received(&self, frame: DeliveredFrame) {
        let id = frame.id().0;
        if !self.in_hand.lock().expect("lock").insert(id) {
            self.violations
                .lock()
                .expect("lock")
                .push(format!("buffer {} delivered twice", id));
        }
        if frame.with_image(|data| data.len()).is_err() {
            self.violations
                .lock()
                .expect("lock")
                .push(format!("sink cannot read buffer {}", id));
        }
        std::thread::sleep(Duration::from_micros(200));
        *self.seen.lock().expect("lock") += 1;
        self.in_hand.lock().expect("lock").remove(&id);
        if id % 2 == 0 {
            let _ = frame.requeue();
        }
        // Odd buffers go back through the token's drop.
    }
}

#[test]
fn buffers_keep_a_single_owner_under_concurrent_callbacks() -> Result<(), Box<dyn std::error::Error>> {
    let camera = Arc::new(StubCamera::new(StubCameraConfig {
        callback_threads: 4,
        frame_limit: Some(300),
        ..StubCameraConfig::default()
    }));
    camera.open()?;
    let observer = Arc::new(ExclusiveObserver {
        in_hand: Mutex::new(HashSet::new()),
        violations: Mutex::new(Vec::new()),
        seen: Mutex::new(0),
    });
    camera.register_observer(observer.clone())?;

    camera.set_feature("Width", FeatureValue::Int(64))?;
    camera.set_feature("Height", FeatureValue::Int(64))?;
    let payload = camera
        .feature("PayloadSize")?
        .as_int()
        .expect("integer payload size") as usize;
    assert_eq!(payload, 64 * 64);
    let mut pool = FrameBufferPool::allocate(camera.clone(), 3, payload)?;
    camera.start_capture()?;
    for id in pool.arena().ids() {
        camera.queue_frame(id)?;
    }
    camera.run_command("AcquisitionStart")?;

    for _ in 0..50 {
        let counts = pool.arena().owner_counts()?;
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.pool, 0);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(camera.wait_for_deliveries(300, WAIT));

    camera.run_command("AcquisitionStop")?;
    camera.end_capture()?;
    camera.flush_queue()?;
    pool.release(Duration::from_secs(1))?;

    let violations = observer.violations.lock().expect("lock").clone();
    assert!(violations.is_empty(), "{:?}", violations);
    let stats = camera.stats();
    assert_eq!(stats.delivered, 300);
    assert_eq!(stats.requeued, stats.delivered);
    assert_eq!(*observer.seen.lock().expect("lock"), 300);

    let counts = pool.arena().owner_counts()?;
    assert_eq!(counts.pool, 3);
    for id in pool.arena().ids() {
        assert_eq!(pool.arena().owner(id)?, BufferOwner::Pool);
        assert!(pool
            .arena()
            .transfer(id, BufferOwner::Sink, BufferOwner::Driver)
            .is_err());
    }
    camera.close()?;
    Ok(())
}
