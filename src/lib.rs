//! Synchronized multi-camera grabber
//!
//! Captures live frames from one or more cameras and streams each camera into
//! its own H.264 elementary stream file, starting and stopping all cameras as
//! close together as the driver allows.
//!
//! # Architecture
//!
//! Frames travel through a fixed pipeline per camera:
//!
//! 1. **Driver**: fills a pooled buffer and invokes the frame observer from
//!    one of its own threads.
//! 2. **FrameSink**: converts the buffer under the session lock, submits it to
//!    the encoder, mirrors it for preview and requeues it.
//! 3. **StreamEncoder**: appends packets to the output file and finalizes the
//!    stream with an end marker at teardown.
//!
//! Buffers are addressed by index (`BufferId`) inside a `BufferArena` and have
//! exactly one owner at a time: the pool, the driver or the sink.
//!
//! # Module Structure
//!
//! - `driver`: camera driver boundary, simulated cameras, V4L2 adapter
//! - `pool`: frame buffer arena and pool
//! - `convert`: pixel conversion to planar 4:2:0
//! - `encoder`: stream encoder and backends
//! - `sink`: per-camera frame callback
//! - `preview`: latest-frame mirror
//! - `session`, `orchestrator`: camera bring-up and synchronized start/stop
//! - `config`, `naming`: recording configuration and output file names

pub mod config;
pub mod convert;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod naming;
pub mod orchestrator;
pub mod pool;
pub mod preview;
pub mod session;
pub mod sink;

pub use config::{GrabberConfig, SessionConfig};
pub use convert::{PixelConverter, PixelFormat, PlanarFrame};
pub use driver::{
    open_camera_system, BufferId, CameraDriver, CameraSystem, DeliveredFrame, FeatureValue,
    FrameObserver, FrameQueue, FrameStatus,
};
pub use encoder::{
    EncodedPacket, EncoderKind, EncoderSettings, Quality, StreamEncoder, StreamSummary,
    VideoEncoder, END_OF_STREAM_MARKER,
};
pub use error::{CaptureError, Result};
pub use orchestrator::{CaptureOrchestrator, RecordingWindow};
pub use pool::{BufferArena, BufferOwner, FrameBufferPool, OwnerCounts};
pub use preview::{PreviewFrame, PreviewMirror};
pub use session::{CameraSession, CaptureParams, SessionReport, SessionState};
pub use sink::{FrameGeometry, FrameSink, SinkStats};
