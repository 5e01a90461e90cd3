//! Pixel format conversion from the camera's native layout to the encoder's
//! planar 4:2:0 input.
//!
//! Only single-plane 8-bit monochrome is implemented. Luma is copied row by
//! row (honouring the camera's line stride) and both chroma planes are set to
//! neutral grey, which is what the monochrome image looks like in YUV.
//! Everything else is rejected when the converter is created, so a session
//! fails at bring-up rather than on its first frame.

use std::fmt;

use crate::error::{CaptureError, Result};

const NEUTRAL_CHROMA: u8 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Mono8,
    Mono12,
    BayerRg8,
    Rgb8,
    Yuv420p,
}

impl PixelFormat {
    /// Parse the driver's `PixelFormat` feature value.
    pub fn from_feature(name: &str) -> Result<Self> {
        match name {
            "Mono8" => Ok(PixelFormat::Mono8),
            "Mono12" => Ok(PixelFormat::Mono12),
            "BayerRG8" => Ok(PixelFormat::BayerRg8),
            "RGB8" | "RGB8Packed" => Ok(PixelFormat::Rgb8),
            other => Err(CaptureError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn feature_name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::BayerRg8 => "BayerRG8",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::Yuv420p => "YUV420P",
        }
    }

    /// Minimum line stride in bytes for a single-plane format.
    pub fn min_stride(self, width: usize) -> usize {
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerRg8 | PixelFormat::Yuv420p => width,
            PixelFormat::Mono12 => width * 2,
            PixelFormat::Rgb8 => width * 3,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.feature_name())
    }
}

/// Planar Y/Cb/Cr 4:2:0 frame, the encoder's input layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanarFrame {
    pub width: usize,
    pub height: usize,
    /// Y, Cb, Cr.
    pub planes: [Vec<u8>; 3],
    pub strides: [usize; 3],
}

impl PlanarFrame {
    pub fn new(width: usize, height: usize) -> Self {
        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);
        Self {
            width,
            height,
            planes: [
                vec![0u8; width * height],
                vec![NEUTRAL_CHROMA; chroma_width * chroma_height],
                vec![NEUTRAL_CHROMA; chroma_width * chroma_height],
            ],
            strides: [width, chroma_width, chroma_width],
        }
    }

    pub fn chroma_width(&self) -> usize {
        self.strides[1]
    }

    pub fn chroma_height(&self) -> usize {
        self.height.div_ceil(2)
    }

    pub fn luma(&self) -> &[u8] {
        &self.planes[0]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ContextKey {
    width: usize,
    height: usize,
    src: PixelFormat,
    dst: PixelFormat,
}

type ConvertFn = fn(&[u8], usize, &mut PlanarFrame) -> Result<()>;

/// Conversion state for one (geometry, source, destination) combination.
struct ConversionContext {
    key: ContextKey,
    kernel: ConvertFn,
    output: PlanarFrame,
}

impl ConversionContext {
    fn new(key: ContextKey) -> Result<Self> {
        let kernel: ConvertFn = match (key.src, key.dst) {
            (PixelFormat::Mono8, PixelFormat::Yuv420p) => mono8_to_yuv420p,
            (src, dst) => {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "no conversion from {} to {}",
                    src, dst
                )))
            }
        };
        Ok(Self {
            key,
            kernel,
            output: PlanarFrame::new(key.width, key.height),
        })
    }
}

/// Converts raw camera frames into the encoder's layout, reusing a cached
/// context (and its output planes) across calls.
pub struct PixelConverter {
    width: usize,
    height: usize,
    dst: PixelFormat,
    context: Option<ConversionContext>,
    contexts_built: usize,
}

impl PixelConverter {
    /// Create a converter for `src` frames. Fails for unsupported formats.
    pub fn new(width: usize, height: usize, src: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CaptureError::Conversion(format!(
                "invalid frame size {}x{}",
                width, height
            )));
        }
        let mut converter = Self {
            width,
            height,
            dst: PixelFormat::Yuv420p,
            context: None,
            contexts_built: 0,
        };
        converter.cached_context(src)?;
        Ok(converter)
    }

    pub fn supports(src: PixelFormat) -> bool {
        matches!(src, PixelFormat::Mono8)
    }

    pub fn output_format(&self) -> PixelFormat {
        self.dst
    }

    /// Number of contexts built so far (1 while the stream parameters are stable).
    pub fn contexts_built(&self) -> usize {
        self.contexts_built
    }

    /// Convert one raw frame with the given line stride.
    pub fn convert(
        &mut self,
        raw: &[u8],
        line_stride: usize,
        src: PixelFormat,
    ) -> Result<&PlanarFrame> {
        let min_stride = src.min_stride(self.width);
        if line_stride < min_stride {
            return Err(CaptureError::Conversion(format!(
                "line stride {} is shorter than a {} row of {} bytes",
                line_stride, src, min_stride
            )));
        }
        let required = line_stride * (self.height - 1) + min_stride;
        if raw.len() < required {
            return Err(CaptureError::Conversion(format!(
                "frame has {} bytes, {}x{} {} needs {}",
                raw.len(),
                self.width,
                self.height,
                src,
                required
            )));
        }

        let context = self.cached_context(src)?;
        (context.kernel)(raw, line_stride, &mut context.output)?;
        Ok(&context.output)
    }

    fn cached_context(&mut self, src: PixelFormat) -> Result<&mut ConversionContext> {
        let key = ContextKey {
            width: self.width,
            height: self.height,
            src,
            dst: self.dst,
        };
        let stale = self.context.as_ref().map_or(true, |ctx| ctx.key != key);
        if stale {
            self.context = Some(ConversionContext::new(key)?);
            self.contexts_built += 1;
        }
        self.context
            .as_mut()
            .ok_or_else(|| CaptureError::Conversion("conversion context missing".into()))
    }
}

fn mono8_to_yuv420p(raw: &[u8], line_stride: usize, out: &mut PlanarFrame) -> Result<()> {
    let width = out.width;
    let luma_stride = out.strides[0];
    for (row, dst) in out.planes[0]
        .chunks_exact_mut(luma_stride)
        .take(out.height)
        .enumerate()
    {
        let start = row * line_stride;
        let src = raw
            .get(start..start + width)
            .ok_or_else(|| CaptureError::Conversion(format!("row {} out of bounds", row)))?;
        dst[..width].copy_from_slice(src);
    }
    out.planes[1].fill(NEUTRAL_CHROMA);
    out.planes[2].fill(NEUTRAL_CHROMA);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize, stride: usize) -> Vec<u8> {
        let mut raw = vec![0xEEu8; stride * height];
        for y in 0..height {
            for x in 0..width {
                raw[y * stride + x] = (x * 7 + y * 3) as u8;
            }
        }
        raw
    }

    #[test]
    fn mono8_copies_luma_and_neutral_chroma() -> Result<()> {
        let raw = gradient(4, 2, 4);
        let mut converter = PixelConverter::new(4, 2, PixelFormat::Mono8)?;
        let frame = converter.convert(&raw, 4, PixelFormat::Mono8)?;
        assert_eq!(frame.luma(), &raw[..]);
        assert_eq!(frame.planes[1], vec![128u8; 2]);
        assert_eq!(frame.planes[2], vec![128u8; 2]);
        Ok(())
    }

    #[test]
    fn stride_padding_is_skipped() -> Result<()> {
        let raw = gradient(6, 4, 8);
        let mut converter = PixelConverter::new(6, 4, PixelFormat::Mono8)?;
        let frame = converter.convert(&raw, 8, PixelFormat::Mono8)?;
        assert!(!frame.luma().contains(&0xEE));
        assert_eq!(&frame.luma()[6..12], &raw[8..14]);
        Ok(())
    }

    #[test]
    fn conversion_is_deterministic_with_cached_context() -> Result<()> {
        let raw = gradient(64, 64, 64);
        let mut converter = PixelConverter::new(64, 64, PixelFormat::Mono8)?;
        let first = converter.convert(&raw, 64, PixelFormat::Mono8)?.clone();
        for _ in 0..5 {
            let again = converter.convert(&raw, 64, PixelFormat::Mono8)?;
            assert_eq!(&first, again);
        }
        assert_eq!(converter.contexts_built(), 1);
        Ok(())
    }

    #[test]
    fn unsupported_formats_fail_at_construction() {
        for format in [PixelFormat::Mono12, PixelFormat::BayerRg8, PixelFormat::Rgb8] {
            let err = PixelConverter::new(8, 8, format).err();
            assert!(matches!(err, Some(CaptureError::UnsupportedFormat(_))));
        }
    }

    #[test]
    fn short_frames_are_rejected() -> Result<()> {
        let mut converter = PixelConverter::new(8, 8, PixelFormat::Mono8)?;
        assert!(converter.convert(&[0u8; 63], 8, PixelFormat::Mono8).is_err());
        assert!(converter.convert(&[0u8; 64], 4, PixelFormat::Mono8).is_err());
        Ok(())
    }

    #[test]
    fn odd_sizes_round_chroma_up() {
        let frame = PlanarFrame::new(5, 3);
        assert_eq!(frame.chroma_width(), 3);
        assert_eq!(frame.chroma_height(), 2);
        assert_eq!(frame.planes[1].len(), 6);
    }

    #[test]
    fn feature_names_round_trip() -> Result<()> {
        assert_eq!(PixelFormat::from_feature("Mono8")?, PixelFormat::Mono8);
        assert_eq!(PixelFormat::from_feature("BayerRG8")?.feature_name(), "BayerRG8");
        assert!(PixelFormat::from_feature("YCbCr411").is_err());
        Ok(())
    }
}
