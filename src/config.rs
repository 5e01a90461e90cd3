use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encoder::{EncoderKind, Quality, MAX_CRF};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAME_RATE: u32 = 24;
const DEFAULT_PRESET: &str = "ultrafast";
const DEFAULT_PIXEL_FORMAT: &str = "Mono8";
const DEFAULT_BUFFER_COUNT: usize = 3;
const DEFAULT_LABEL: &str = "capture";
const DEFAULT_CAMERAS: &str = "stub://1";
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;
const MAX_BUFFER_COUNT: usize = 64;

#[derive(Debug, Deserialize, Default)]
struct GrabberConfigFile {
    capture: Option<CaptureConfigFile>,
    encoder: Option<EncoderConfigFile>,
    output: Option<OutputConfigFile>,
    preview: Option<bool>,
    drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    cameras: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<u32>,
    pixel_format: Option<String>,
    buffer_count: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    kind: Option<EncoderKind>,
    /// 0 selects lossless.
    crf: Option<u8>,
    preset: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    label: Option<String>,
}

/// Recording configuration. Built once at startup and passed down explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct GrabberConfig {
    /// Requested width; 0 selects the largest even width the camera offers.
    pub width: u32,
    /// Requested height; 0 selects the largest even height the camera offers.
    pub height: u32,
    pub frame_rate: u32,
    pub quality: Quality,
    pub preset: String,
    pub pixel_format: String,
    pub buffer_count: usize,
    pub preview: bool,
    pub label: String,
    pub output_dir: PathBuf,
    /// Camera system URI, `stub://N` or `v4l2://dev,...`.
    pub cameras: String,
    pub encoder: EncoderKind,
    pub drain_timeout: Duration,
}

/// The part of the configuration each camera session needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub quality: Quality,
    pub preset: String,
    pub pixel_format: String,
    pub buffer_count: usize,
    pub encoder: EncoderKind,
    pub drain_timeout: Duration,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self::from_file(GrabberConfigFile::default())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        GrabberConfig::default().session()
    }
}

impl GrabberConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GRABBER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GrabberConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let encoder = file.encoder.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        Self {
            width: capture.width.unwrap_or(DEFAULT_WIDTH),
            height: capture.height.unwrap_or(DEFAULT_HEIGHT),
            frame_rate: capture.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            quality: match encoder.crf {
                Some(0) | None => Quality::Lossless,
                Some(crf) => Quality::Crf(crf),
            },
            preset: encoder.preset.unwrap_or_else(|| DEFAULT_PRESET.to_string()),
            pixel_format: capture
                .pixel_format
                .unwrap_or_else(|| DEFAULT_PIXEL_FORMAT.to_string()),
            buffer_count: capture.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT),
            preview: file.preview.unwrap_or(true),
            label: output.label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            output_dir: output.dir.unwrap_or_else(|| PathBuf::from(".")),
            cameras: capture
                .cameras
                .unwrap_or_else(|| DEFAULT_CAMERAS.to_string()),
            encoder: encoder.kind.unwrap_or(EncoderKind::Pcm),
            drain_timeout: Duration::from_millis(
                file.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(cameras) = std::env::var("GRABBER_CAMERAS") {
            if !cameras.trim().is_empty() {
                self.cameras = cameras.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("GRABBER_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(encoder) = std::env::var("GRABBER_ENCODER") {
            self.encoder = encoder
                .parse()
                .with_context(|| format!("GRABBER_ENCODER '{}'", encoder))?;
        }
        if let Ok(quality) = std::env::var("GRABBER_QUALITY") {
            self.quality = quality
                .parse()
                .with_context(|| format!("GRABBER_QUALITY '{}'", quality))?;
        }
        if let Ok(buffers) = std::env::var("GRABBER_BUFFERS") {
            self.buffer_count = buffers
                .trim()
                .parse()
                .map_err(|_| anyhow!("GRABBER_BUFFERS must be an integer buffer count"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_rate == 0 {
            return Err(anyhow!("frame rate must be greater than zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(anyhow!(
                "width and height must be even (got {}x{})",
                self.width,
                self.height
            ));
        }
        if !(1..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(anyhow!(
                "buffer count must be between 1 and {} (got {})",
                MAX_BUFFER_COUNT,
                self.buffer_count
            ));
        }
        if self.quality.crf() > MAX_CRF {
            return Err(anyhow!("crf must be between 0 and {}", MAX_CRF));
        }
        if self.preset.trim().is_empty() {
            return Err(anyhow!("encoder preset must not be empty"));
        }
        validate_label(&self.label)?;
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            quality: self.quality,
            preset: self.preset.clone(),
            pixel_format: self.pixel_format.clone(),
            buffer_count: self.buffer_count,
            encoder: self.encoder,
            drain_timeout: self.drain_timeout,
        }
    }
}

fn validate_label(label: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(anyhow!("recording label must not be empty"));
    }
    if label.contains(['/', '\\']) || label == "." || label == ".." {
        return Err(anyhow!(
            "recording label '{}' must not contain path separators",
            label
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<GrabberConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
