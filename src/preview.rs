//! Latest-frame mirror for live preview.
//!
//! The frame sink refreshes the mirror from the driver callback thread and a
//! display loop reads it from its own thread. Readers always get a deep copy
//! of one complete frame, never a mix of two.

use std::path::Path;
use std::sync::Mutex;

use crate::convert::PixelFormat;
use crate::error::{CaptureError, Result};

/// Snapshot of the most recent frame, tightly packed (stride == width).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewFrame {
    pub width: usize,
    pub height: usize,
    /// Number of updates the mirror had seen when this frame was written.
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl PreviewFrame {
    /// Average sample value, a cheap liveness indicator for headless previews.
    pub fn mean_level(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|v| *v as u64).sum();
        sum as f64 / self.data.len() as f64
    }

    #[cfg(feature = "preview-snapshot")]
    pub fn to_image(&self) -> Option<image::GrayImage> {
        image::GrayImage::from_raw(self.width as u32, self.height as u32, self.data.clone())
    }

    /// Write the frame as a JPEG file.
    #[cfg(feature = "preview-snapshot")]
    pub fn save_jpeg(&self, path: &Path) -> Result<()> {
        let image = self.to_image().ok_or_else(|| {
            CaptureError::Conversion(format!(
                "preview buffer does not hold {}x{} samples",
                self.width, self.height
            ))
        })?;
        image
            .save_with_format(path, image::ImageFormat::Jpeg)
            .map_err(|err| CaptureError::Io(std::io::Error::other(err)))
    }

    /// Write the frame as a binary PGM file.
    pub fn save_pgm(&self, path: &Path) -> Result<()> {
        let mut bytes = format!("P5\n{} {}\n255\n", self.width, self.height).into_bytes();
        bytes.extend_from_slice(&self.data);
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

struct MirrorState {
    frame: Option<PreviewFrame>,
    updates: u64,
}

/// Holds the most recent frame of one camera.
pub struct PreviewMirror {
    state: Mutex<MirrorState>,
}

impl Default for PreviewMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewMirror {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MirrorState {
                frame: None,
                updates: 0,
            }),
        }
    }

    pub fn supports(format: PixelFormat) -> bool {
        matches!(format, PixelFormat::Mono8)
    }

    /// Replace the mirrored frame with `raw`.
    ///
    /// The previous buffer is reused when the geometry is unchanged.
    pub fn update(
        &self,
        raw: &[u8],
        width: usize,
        height: usize,
        line_stride: usize,
        format: PixelFormat,
    ) -> Result<()> {
        if !Self::supports(format) {
            return Err(CaptureError::UnsupportedFormat(format!(
                "preview cannot show {}",
                format
            )));
        }
        if width == 0 || height == 0 || line_stride < width {
            return Err(CaptureError::Conversion(format!(
                "invalid preview geometry {}x{} stride {}",
                width, height, line_stride
            )));
        }
        let required = line_stride * (height - 1) + width;
        if raw.len() < required {
            return Err(CaptureError::Conversion(format!(
                "preview frame has {} bytes, needs {}",
                raw.len(),
                required
            )));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| CaptureError::State("preview mirror lock poisoned".into()))?;
        state.updates += 1;
        let sequence = state.updates;

        let reusable = state
            .frame
            .as_ref()
            .is_some_and(|frame| frame.width == width && frame.height == height);
        if !reusable {
            state.frame = Some(PreviewFrame {
                width,
                height,
                sequence,
                data: vec![0u8; width * height],
            });
        }
        if let Some(frame) = state.frame.as_mut() {
            frame.sequence = sequence;
            for (row, dst) in frame.data.chunks_exact_mut(width).enumerate() {
                let start = row * line_stride;
                dst.copy_from_slice(&raw[start..start + width]);
            }
        }
        Ok(())
    }

    /// Copy of the latest frame, or `None` before the first update.
    pub fn read(&self) -> Option<PreviewFrame> {
        self.state.lock().ok().and_then(|state| state.frame.clone())
    }

    pub fn updates(&self) -> u64 {
        self.state.lock().map(|state| state.updates).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn read_before_update_is_empty() {
        let mirror = PreviewMirror::new();
        assert!(mirror.read().is_none());
        assert_eq!(mirror.updates(), 0);
    }

    #[test]
    fn update_packs_rows() -> Result<()> {
        let mirror = PreviewMirror::new();
        let raw = [1, 2, 9, 9, 3, 4, 9, 9];
        mirror.update(&raw, 2, 2, 4, PixelFormat::Mono8)?;
        let frame = mirror.read().expect("frame after update");
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.mean_level(), 2.5);
        Ok(())
    }

    #[test]
    fn pgm_snapshot_has_header_and_samples() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("camera01.pgm");
        let frame = PreviewFrame {
            width: 3,
            height: 2,
            sequence: 1,
            data: vec![0, 64, 128, 192, 255, 7],
        };
        frame.save_pgm(&path)?;

        let mut expected = b"P5\n3 2\n255\n".to_vec();
        expected.extend_from_slice(&frame.data);
        assert_eq!(std::fs::read(&path)?, expected);

        assert!(frame.save_pgm(&dir.path().join("missing/camera01.pgm")).is_err());
        Ok(())
    }

    #[test]
    fn non_mono_formats_are_rejected() {
        let mirror = PreviewMirror::new();
        let err = mirror.update(&[0; 12], 2, 2, 6, PixelFormat::Rgb8).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedFormat(_)));
        assert!(mirror.read().is_none());
    }

    #[test]
    fn readers_never_observe_torn_frames() -> Result<()> {
        let mirror = Arc::new(PreviewMirror::new());
        let writer = {
            let mirror = mirror.clone();
            std::thread::spawn(move || {
                for value in 0..200u8 {
                    let raw = vec![value; 64 * 64];
                    mirror
                        .update(&raw, 64, 64, 64, PixelFormat::Mono8)
                        .expect("update");
                }
            })
        };

        for _ in 0..200 {
            if let Some(frame) = mirror.read() {
                let first = frame.data[0];
                assert!(frame.data.iter().all(|v| *v == first));
            }
        }
        writer.join().expect("writer thread");
        assert_eq!(mirror.updates(), 200);
        Ok(())
    }
}
