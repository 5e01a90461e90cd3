//! grabber - Record synchronized video from one or more cameras.
//!
//! Every camera is written to `<label>_runXX_cameraXX.h264` in the output
//! directory, using the first run number for which no camera file exists.
//! Recording ends on Ctrl-C, on ENTER in silent mode, after `--duration`, or
//! when a camera's stream fails.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use sync_grabber::{
    naming, open_camera_system, CameraSystem, CaptureOrchestrator, EncoderKind, GrabberConfig,
    PreviewFrame, Quality,
};

const PREVIEW_POLL: Duration = Duration::from_millis(30);
const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Record synchronized H.264 streams from one or more cameras",
    disable_help_flag = true
)]
struct Args {
    /// Print help (`-h` selects the height).
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Frame width; 0 selects the largest even width.
    #[arg(short = 'w', long)]
    width: Option<u32>,

    /// Frame height; 0 selects the largest even height.
    #[arg(short = 'h', long)]
    height: Option<u32>,

    /// Acquisition frame rate.
    #[arg(short = 'f', long)]
    fps: Option<u32>,

    /// Constant rate factor, 0 (or "lossless") for lossless output.
    #[arg(short = 'c', long)]
    crf: Option<String>,

    /// No preview; press ENTER to stop recording.
    #[arg(short = 's', long)]
    silent: bool,

    /// Camera system URI (stub://N or v4l2:///dev/video0,...).
    #[arg(long)]
    cameras: Option<String>,

    /// Encoder backend (pcm or ffmpeg).
    #[arg(long)]
    encoder: Option<String>,

    /// Directory for the output files.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Frame buffers per camera.
    #[arg(long)]
    buffers: Option<usize>,

    /// Stop after this many seconds.
    #[arg(long, env = "GRABBER_DURATION_SECS")]
    duration: Option<f64>,

    /// Save each camera's latest frame here once per second (JPEG with the
    /// preview-snapshot feature, PGM otherwise).
    #[arg(long, env = "GRABBER_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,

    /// Output label, the prefix of every file name.
    label: String,
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    Interrupted,
    Enter,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = build_config(&args)?;
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    let mut system = open_camera_system(&config.cameras)
        .with_context(|| format!("failed to open camera system '{}'", config.cameras))?;
    system.startup().context("camera system startup failed")?;
    let result = record(&config, system.as_ref(), &args);
    system.shutdown();
    result
}

fn build_config(args: &Args) -> Result<GrabberConfig> {
    let mut config = GrabberConfig::load()?;
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if let Some(fps) = args.fps {
        config.frame_rate = fps;
    }
    if let Some(crf) = args.crf.as_deref() {
        config.quality = crf
            .parse::<Quality>()
            .with_context(|| format!("invalid --crf '{}'", crf))?;
    }
    if let Some(cameras) = &args.cameras {
        config.cameras = cameras.clone();
    }
    if let Some(encoder) = args.encoder.as_deref() {
        config.encoder = encoder
            .parse::<EncoderKind>()
            .with_context(|| format!("invalid --encoder '{}'", encoder))?;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(buffers) = args.buffers {
        config.buffer_count = buffers;
    }
    if args.silent {
        config.preview = false;
    }
    config.label = args.label.clone();
    config.validate()?;
    Ok(config)
}

fn record(config: &GrabberConfig, system: &dyn CameraSystem, args: &Args) -> Result<()> {
    let cameras = system.cameras()?;
    if cameras.is_empty() {
        return Err(anyhow!("no cameras found at '{}'", config.cameras));
    }
    let (run, outputs) = naming::next_run_outputs(&config.output_dir, &config.label, cameras.len())?;
    log::info!("run {:02}: recording {} camera(s)", run, cameras.len());

    let mut orchestrator = CaptureOrchestrator::bring_up(cameras, config, outputs)
        .context("camera bring-up failed")?;

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(StopReason::Interrupted);
    })
    .context("error setting Ctrl-C handler")?;
    if args.silent {
        std::thread::spawn(move || {
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).is_ok() {
                let _ = tx.send(StopReason::Enter);
            }
        });
        log::info!("recording; press ENTER to stop");
    } else {
        log::info!("recording; press Ctrl-C to stop");
    }

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let outcome = orchestrator.record(|orchestrator| {
        watch(orchestrator, &rx, deadline, args)
    });
    let reports = orchestrator.shutdown();

    outcome?;
    for report in reports? {
        log::info!(
            "{}: {} frames encoded, {} dropped, {} bytes -> {}",
            report.camera,
            report.stats.encoded,
            report.stats.dropped,
            report.stream.as_ref().map_or(0, |stream| stream.bytes),
            report.output.display()
        );
    }
    Ok(())
}

/// Poll the preview mirrors until a stop condition is met.
fn watch(
    orchestrator: &CaptureOrchestrator,
    stop: &mpsc::Receiver<StopReason>,
    deadline: Option<Instant>,
    args: &Args,
) -> Result<()> {
    let mut last_stats = Instant::now();
    loop {
        match stop.recv_timeout(PREVIEW_POLL) {
            Ok(reason) => {
                log::info!("stopping recording ({:?})", reason);
                return Ok(());
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }

        orchestrator.check_health()?;

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("recording duration reached");
            return Ok(());
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            report_progress(orchestrator, args);
        }
    }
}

/// Log per-camera progress and write snapshots. Returns the number of
/// snapshots written; a failed snapshot never stops the recording.
fn report_progress(orchestrator: &CaptureOrchestrator, args: &Args) -> usize {
    let mut saved = 0;
    for (session, preview) in orchestrator.sessions().iter().zip(orchestrator.previews()) {
        let stats = session.stats();
        let Some(frame) = preview.as_ref().and_then(|preview| preview.read()) else {
            log::debug!(
                "camera {}: {} encoded, {} dropped",
                session.index() + 1,
                stats.encoded,
                stats.dropped
            );
            continue;
        };
        log::info!(
            "camera {}: {} encoded, {} dropped, frame {} mean level {:.1}",
            session.index() + 1,
            stats.encoded,
            stats.dropped,
            frame.sequence,
            frame.mean_level()
        );
        if let Some(dir) = &args.snapshot_dir {
            match save_snapshot(dir, session.index(), &frame) {
                Ok(()) => saved += 1,
                Err(err) => log::warn!("camera {}: {:#}", session.index() + 1, err),
            }
        }
    }
    saved
}

#[cfg(feature = "preview-snapshot")]
fn save_snapshot(dir: &Path, index: usize, frame: &PreviewFrame) -> Result<()> {
    let path = dir.join(format!("camera{:02}.jpg", index + 1));
    frame
        .save_jpeg(&path)
        .with_context(|| format!("failed to write snapshot {}", path.display()))
}

#[cfg(not(feature = "preview-snapshot"))]
fn save_snapshot(dir: &Path, index: usize, frame: &PreviewFrame) -> Result<()> {
    let path = dir.join(format!("camera{:02}.pgm", index + 1));
    frame
        .save_pgm(&path)
        .with_context(|| format!("failed to write snapshot {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sync_grabber::driver::stub::{StubCamera, StubCameraConfig};
    use sync_grabber::{CameraDriver, CaptureError};
    use tempfile::TempDir;

    fn recorded(dir: &TempDir) -> Result<CaptureOrchestrator> {
        let camera = Arc::new(StubCamera::new(StubCameraConfig {
            frame_limit: Some(2),
            ..StubCameraConfig::default()
        }));
        let config = GrabberConfig {
            width: 32,
            height: 16,
            output_dir: dir.path().to_path_buf(),
            ..GrabberConfig::default()
        };
        let drivers = vec![camera.clone() as Arc<dyn CameraDriver>];
        let mut orchestrator =
            CaptureOrchestrator::bring_up(drivers, &config, vec![dir.path().join("cam.h264")])?;
        orchestrator.record(|_| -> std::result::Result<(), CaptureError> {
            assert!(camera.wait_for_deliveries(2, Duration::from_secs(5)));
            Ok(())
        })?;
        Ok(orchestrator)
    }

    #[test]
    fn snapshot_failure_is_not_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        let mut orchestrator = recorded(&dir)?;

        let missing = dir.path().join("no-such-dir");
        let args = Args::try_parse_from([
            "grabber",
            "--snapshot-dir",
            missing.to_str().expect("utf-8 path"),
            "lab",
        ])?;
        assert_eq!(report_progress(&orchestrator, &args), 0);

        let args = Args::try_parse_from([
            "grabber",
            "--snapshot-dir",
            dir.path().to_str().expect("utf-8 path"),
            "lab",
        ])?;
        assert_eq!(report_progress(&orchestrator, &args), 1);
        assert!(std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with("camera01.")));

        orchestrator.shutdown()?;
        Ok(())
    }

    #[test]
    fn short_h_is_height() -> Result<()> {
        let args = Args::try_parse_from(["grabber", "-h", "240", "-w", "320", "lab"])?;
        assert_eq!((args.width, args.height), (Some(320), Some(240)));
        assert_eq!(args.label, "lab");
        Ok(())
    }
}
