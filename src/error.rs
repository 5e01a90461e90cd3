//! Error taxonomy for the capture pipeline.
//!
//! Bring-up and configuration failures are fatal and unwind the whole camera
//! set. Per-frame failures never leave the driver callback: they are logged and
//! either drop a single frame (`IncompleteFrame`) or poison the stream
//! (`Conversion`, `Encoder`).

use thiserror::Error;

use crate::driver::{BufferId, FrameStatus};
use crate::pool::BufferOwner;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Any non-success status reported by the camera driver. `feature` names
    /// the offending configuration key when there is one.
    #[error("{operation} failed{}: {reason}", feature_suffix(.feature))]
    Driver {
        operation: &'static str,
        feature: Option<String>,
        reason: String,
    },

    #[error("incomplete frame in buffer {buffer}: {status:?}")]
    IncompleteFrame { buffer: BufferId, status: FrameStatus },

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("frame buffer allocation failed: {0}")]
    Allocation(String),

    #[error("pixel conversion failed: {0}")]
    Conversion(String),

    #[error("buffer {buffer} is owned by {actual:?}, expected {expected:?}")]
    Ownership {
        buffer: BufferId,
        expected: BufferOwner,
        actual: BufferOwner,
    },

    #[error("invalid session state: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Driver failure without a configuration key.
    pub fn driver(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Driver {
            operation,
            feature: None,
            reason: reason.into(),
        }
    }

    /// Driver failure while touching the named feature.
    pub fn feature(operation: &'static str, feature: &str, reason: impl Into<String>) -> Self {
        Self::Driver {
            operation,
            feature: Some(feature.to_string()),
            reason: reason.into(),
        }
    }

    /// The configuration key involved in a driver failure, if any.
    pub fn feature_name(&self) -> Option<&str> {
        match self {
            Self::Driver { feature, .. } => feature.as_deref(),
            _ => None,
        }
    }

    /// Errors that only cost a single frame.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Self::IncompleteFrame { .. })
    }
}

fn feature_suffix(feature: &Option<String>) -> String {
    match feature {
        Some(name) => format!(" for feature \"{}\"", name),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
