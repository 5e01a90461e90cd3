//! Multi-camera capture orchestration.
//!
//! Every session is fully brought up before any camera starts acquiring, so
//! starting a recording is one tight loop of start commands. Stopping is the
//! symmetric loop. Bring-up is all-or-nothing: if one camera fails, the
//! cameras already brought up are shut down again in reverse order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::GrabberConfig;
use crate::driver::CameraDriver;
use crate::error::{CaptureError, Result};
use crate::preview::PreviewMirror;
use crate::session::{CameraSession, SessionReport};

/// Instants at which the start and stop loops completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordingWindow {
    pub opened_at: Option<Instant>,
    pub closed_at: Option<Instant>,
}

impl RecordingWindow {
    pub fn duration(&self) -> Option<Duration> {
        match (self.opened_at, self.closed_at) {
            (Some(open), Some(close)) => Some(close.saturating_duration_since(open)),
            (Some(open), None) => Some(open.elapsed()),
            _ => None,
        }
    }
}

pub struct CaptureOrchestrator {
    sessions: Vec<CameraSession>,
    previews: Vec<Option<Arc<PreviewMirror>>>,
    window: RecordingWindow,
    shut_down: bool,
}

impl CaptureOrchestrator {
    /// Bring up one session per camera, writing to the matching output path.
    pub fn bring_up(
        cameras: Vec<Arc<dyn CameraDriver>>,
        config: &GrabberConfig,
        outputs: Vec<PathBuf>,
    ) -> Result<Self> {
        if cameras.is_empty() {
            return Err(CaptureError::State("no cameras to record from".into()));
        }
        if cameras.len() != outputs.len() {
            return Err(CaptureError::State(format!(
                "{} cameras but {} output paths",
                cameras.len(),
                outputs.len()
            )));
        }

        let session_config = config.session();
        let mut sessions: Vec<CameraSession> = Vec::with_capacity(cameras.len());
        let mut previews = Vec::with_capacity(cameras.len());
        for (index, (camera, output)) in cameras.into_iter().zip(outputs).enumerate() {
            let preview = config.preview.then(|| Arc::new(PreviewMirror::new()));
            match CameraSession::bring_up(camera, index, &session_config, output, preview.clone()) {
                Ok(session) => {
                    sessions.push(session);
                    previews.push(preview);
                }
                Err(err) => {
                    while let Some(mut session) = sessions.pop() {
                        if let Err(shutdown_err) = session.shutdown() {
                            log::error!(
                                "camera {}: shutdown after failed bring-up: {}",
                                session.index() + 1,
                                shutdown_err
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        log::info!("{} camera(s) ready", sessions.len());
        Ok(Self {
            sessions,
            previews,
            window: RecordingWindow::default(),
            shut_down: false,
        })
    }

    pub fn sessions(&self) -> &[CameraSession] {
        &self.sessions
    }

    /// Preview mirror of each camera, `None` where preview is disabled.
    pub fn previews(&self) -> &[Option<Arc<PreviewMirror>>] {
        &self.previews
    }

    pub fn window(&self) -> RecordingWindow {
        self.window
    }

    /// Start acquisition on every camera, back to back.
    ///
    /// If a camera fails to start, the cameras already started are stopped
    /// again and the error is returned.
    pub fn start_all(&mut self) -> Result<()> {
        for index in 0..self.sessions.len() {
            if let Err(err) = self.sessions[index].start_acquisition() {
                for started in self.sessions[..index].iter_mut().rev() {
                    if let Err(stop_err) = started.stop_acquisition() {
                        log::error!(
                            "camera {}: stop after failed start: {}",
                            started.index() + 1,
                            stop_err
                        );
                    }
                }
                return Err(err);
            }
        }
        self.window = RecordingWindow {
            opened_at: Some(Instant::now()),
            closed_at: None,
        };
        log::info!("recording started on {} camera(s)", self.sessions.len());
        Ok(())
    }

    /// Stop acquisition on every camera, back to back. Every camera is tried;
    /// the first failure is returned.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for session in &mut self.sessions {
            if let Err(err) = session.stop_acquisition() {
                log::error!("camera {}: stop failed: {}", session.index() + 1, err);
                first_error.get_or_insert(err);
            }
        }
        self.window.closed_at = Some(Instant::now());
        if let Some(duration) = self.window.duration() {
            log::info!("recording stopped after {:.1}s", duration.as_secs_f64());
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `body` between `start_all` and `stop_all`. Cameras are stopped even
    /// when `body` fails; its error takes precedence over a stop failure.
    pub fn record<T, E>(
        &mut self,
        body: impl FnOnce(&CaptureOrchestrator) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<CaptureError>,
    {
        self.start_all()?;
        let outcome = body(self);
        let stopped = self.stop_all();
        match (outcome, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), stopped) => {
                if let Err(stop_err) = stopped {
                    log::error!("stopping after failed recording: {}", stop_err);
                }
                Err(err)
            }
        }
    }

    /// First fatal stream error across all cameras.
    pub fn check_health(&self) -> Result<()> {
        for session in &self.sessions {
            if let Some(message) = session.fatal_error() {
                return Err(CaptureError::Encoder(format!(
                    "camera {} ({}): {}",
                    session.index() + 1,
                    session.camera_id(),
                    message
                )));
            }
        }
        Ok(())
    }

    /// Tear down every session and finalize every output file.
    pub fn shutdown(&mut self) -> Result<Vec<SessionReport>> {
        self.shut_down = true;
        let mut reports = Vec::with_capacity(self.sessions.len());
        let mut first_error = None;
        for session in &mut self.sessions {
            match session.shutdown() {
                Ok(report) => reports.push(report),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}

impl Drop for CaptureOrchestrator {
    fn drop(&mut self) {
        if !self.shut_down {
            if let Err(err) = self.shutdown() {
                log::error!("capture shutdown on drop failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_duration_needs_an_open_instant() {
        assert_eq!(RecordingWindow::default().duration(), None);
        let open = Instant::now();
        let window = RecordingWindow {
            opened_at: Some(open),
            closed_at: Some(open + Duration::from_millis(250)),
        };
        assert_eq!(window.duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn mismatched_outputs_are_rejected() {
        let cameras: Vec<Arc<dyn CameraDriver>> = vec![Arc::new(
            crate::driver::stub::StubCamera::new(Default::default()),
        )];
        let result = CaptureOrchestrator::bring_up(cameras, &GrabberConfig::default(), Vec::new());
        assert!(matches!(result, Err(CaptureError::State(_))));
    }
}
