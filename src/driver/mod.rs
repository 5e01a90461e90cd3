//! Camera driver boundary.
//!
//! The capture core treats the camera SDK as an opaque capability set:
//! - feature access by name (`Width`, `Height`, `PixelFormat`, ...)
//! - buffer announcement, queueing and revocation by `BufferId`
//! - capture engine start/stop and acquisition commands
//! - an asynchronous frame callback (`FrameObserver`) invoked from driver threads
//!
//! Backends:
//! - `stub://N` simulated cameras (always available, used by tests)
//! - V4L2 devices (feature: camera-v4l2)

pub mod stub;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use std::fmt;
use std::sync::Arc;

use crate::error::{CaptureError, Result};
use crate::pool::{BufferArena, BufferOwner};

/// Index of a frame buffer inside its pool's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receive status reported by the driver with each delivered buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete,
    TooSmall,
    Invalid,
}

impl FrameStatus {
    pub fn is_complete(self) -> bool {
        self == FrameStatus::Complete
    }
}

/// Typed feature value, passed through to the driver verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Enum(String),
    Bool(bool),
}

impl FeatureValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FeatureValue::Float(v) => Some(*v),
            FeatureValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            FeatureValue::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Int(v) => write!(f, "{}", v),
            FeatureValue::Float(v) => write!(f, "{}", v),
            FeatureValue::Enum(v) => write!(f, "{}", v),
            FeatureValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Feature names used during bring-up.
pub mod features {
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const FRAME_RATE: &str = "AcquisitionFrameRate";
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    /// Bytes per image row. Optional; rows are tightly packed without it.
    pub const STRIDE: &str = "Stride";
    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
}

/// Driver-side queue that delivered buffers are returned to.
pub trait FrameQueue: Send + Sync {
    fn queue_frame(&self, id: BufferId) -> Result<()>;
}

/// Receiver of asynchronous frame callbacks.
///
/// Implementations are invoked from driver-owned threads, possibly
/// concurrently for distinct buffers of the same camera. They must not let
/// errors or panics escape.
pub trait FrameObserver: Send + Sync {
    fn frame_received(&self, frame: DeliveredFrame);
}

/// A filled buffer handed to the observer.
///
/// The token is move-only and returns the buffer to the driver exactly once:
/// explicitly through `requeue`, or on drop when the handler returns early or
/// unwinds.
///
/// ```compile_fail
/// fn duplicate(frame: sync_grabber::driver::DeliveredFrame) {
///     let copy = frame.clone();
///     drop((frame, copy));
/// }
/// ```
pub struct DeliveredFrame {
    id: BufferId,
    status: FrameStatus,
    sequence: u64,
    arena: Arc<BufferArena>,
    queue: Arc<dyn FrameQueue>,
    requeued: bool,
}

impl DeliveredFrame {
    /// Hand a buffer to the sink. The buffer must currently be driver-owned.
    pub fn deliver(
        arena: Arc<BufferArena>,
        queue: Arc<dyn FrameQueue>,
        id: BufferId,
        status: FrameStatus,
        sequence: u64,
    ) -> Result<Self> {
        arena.transfer(id, BufferOwner::Driver, BufferOwner::Sink)?;
        Ok(Self {
            id,
            status,
            sequence,
            arena,
            queue,
            requeued: false,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    /// Driver frame counter (1-based).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Run `f` over the image bytes while the sink owns the buffer.
    pub fn with_image<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.arena.with_data(self.id, BufferOwner::Sink, f)
    }

    /// Return the buffer to the driver's queue.
    pub fn requeue(mut self) -> Result<()> {
        self.requeue_inner()
    }

    fn requeue_inner(&mut self) -> Result<()> {
        if self.requeued {
            return Ok(());
        }
        self.requeued = true;
        self.arena
            .transfer(self.id, BufferOwner::Sink, BufferOwner::Driver)?;
        self.queue.queue_frame(self.id)
    }
}

impl Drop for DeliveredFrame {
    fn drop(&mut self) {
        if let Err(err) = self.requeue_inner() {
            log::error!("requeue of buffer {} failed: {}", self.id, err);
        }
    }
}

impl fmt::Debug for DeliveredFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveredFrame")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// One camera as exposed by the vendor driver.
///
/// All methods take `&self`; implementations synchronize internally because
/// the session, the observer and driver threads share the handle.
pub trait CameraDriver: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;

    fn feature(&self, name: &str) -> Result<FeatureValue>;
    /// Inclusive integer range of a feature.
    fn feature_range(&self, name: &str) -> Result<(i64, i64)>;
    fn set_feature(&self, name: &str, value: FeatureValue) -> Result<()>;
    /// Run a command feature such as `AcquisitionStart`.
    fn run_command(&self, name: &str) -> Result<()>;
    fn has_feature(&self, name: &str) -> bool;

    fn register_observer(&self, observer: Arc<dyn FrameObserver>) -> Result<()>;
    fn announce_frame(&self, arena: &Arc<BufferArena>, id: BufferId) -> Result<()>;
    fn start_capture(&self) -> Result<()>;
    fn queue_frame(&self, id: BufferId) -> Result<()>;
    /// Handle the observer uses to requeue buffers.
    fn frame_queue(&self) -> Arc<dyn FrameQueue>;
    fn end_capture(&self) -> Result<()>;
    fn flush_queue(&self) -> Result<()>;
    fn revoke_all_frames(&self) -> Result<()>;
}

/// Process-wide driver entry point: startup, discovery, shutdown.
pub trait CameraSystem {
    fn startup(&mut self) -> Result<()>;
    fn cameras(&self) -> Result<Vec<Arc<dyn CameraDriver>>>;
    fn shutdown(&mut self);
}

/// Open the camera system named by `uri`.
///
/// - `stub://N`: N simulated cameras
/// - `v4l2:///dev/video0,/dev/video1`: V4L2 devices (feature: camera-v4l2)
pub fn open_camera_system(uri: &str) -> Result<Box<dyn CameraSystem>> {
    if let Some(rest) = uri.strip_prefix("stub://") {
        let count = if rest.is_empty() {
            1
        } else {
            rest.parse::<usize>().map_err(|_| {
                CaptureError::driver("open camera system", format!("invalid stub count '{}'", rest))
            })?
        };
        return Ok(Box::new(stub::StubSystem::new(count)));
    }

    if let Some(rest) = uri.strip_prefix("v4l2://") {
        let devices: Vec<String> = rest
            .split(',')
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.to_string())
            .collect();
        #[cfg(feature = "camera-v4l2")]
        {
            return Ok(Box::new(v4l2::V4l2System::new(devices)));
        }
        #[cfg(not(feature = "camera-v4l2"))]
        {
            let _ = devices;
            return Err(CaptureError::driver(
                "open camera system",
                "v4l2 cameras require the camera-v4l2 feature",
            ));
        }
    }

    Err(CaptureError::driver(
        "open camera system",
        format!("unsupported camera uri '{}'", uri),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_uri_selects_simulated_cameras() -> Result<()> {
        let mut system = open_camera_system("stub://3")?;
        system.startup()?;
        assert_eq!(system.cameras()?.len(), 3);
        system.shutdown();
        Ok(())
    }

    #[test]
    fn unknown_uri_is_rejected() {
        assert!(open_camera_system("gige://10.0.0.1").is_err());
        assert!(open_camera_system("stub://many").is_err());
    }

    #[test]
    fn feature_value_accessors() {
        assert_eq!(FeatureValue::Int(640).as_int(), Some(640));
        assert_eq!(FeatureValue::Int(24).as_float(), Some(24.0));
        assert_eq!(FeatureValue::Enum("Mono8".into()).as_enum(), Some("Mono8"));
        assert_eq!(FeatureValue::Bool(true).as_int(), None);
    }
}
