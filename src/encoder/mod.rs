//! Streaming video encoder bound to one output file.
//!
//! The output is a raw elementary H.264 stream (no container). Packets are
//! appended in the order the encoder emits them, and the stream is finalized
//! exactly once: buffered packets are drained and a 4-byte end marker is
//! appended.
//!
//! Backends:
//! - `pcm`: built-in lossless encoder writing I_PCM macroblocks (default)
//! - `ffmpeg`: libx264 through ffmpeg (feature: encoder-ffmpeg)

#[cfg(feature = "encoder-ffmpeg")]
pub(crate) mod ffmpeg;
pub(crate) mod pcm;

use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::convert::PlanarFrame;
use crate::error::{CaptureError, Result};

/// Appended after the last packet of every stream.
pub const END_OF_STREAM_MARKER: [u8; 4] = [0x00, 0x00, 0x01, 0xB7];

/// Highest constant rate factor accepted by the encoders.
pub const MAX_CRF: u8 = 51;

/// Rate control target. `Lossless` is the sentinel for exact reproduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality {
    Lossless,
    /// Constant rate factor, 1..=51, the higher the lossier.
    Crf(u8),
}

impl Quality {
    pub fn crf(self) -> u8 {
        match self {
            Quality::Lossless => 0,
            Quality::Crf(value) => value,
        }
    }

    pub fn from_crf(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Quality::Lossless),
            v if v <= MAX_CRF => Ok(Quality::Crf(v)),
            v => Err(CaptureError::Encoder(format!(
                "crf {} outside 0..={}",
                v, MAX_CRF
            ))),
        }
    }
}

impl FromStr for Quality {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("lossless") {
            return Ok(Quality::Lossless);
        }
        let value: u8 = s
            .parse()
            .map_err(|_| CaptureError::Encoder(format!("invalid quality '{}'", s)))?;
        Self::from_crf(value)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Lossless => f.write_str("lossless"),
            Quality::Crf(v) => write!(f, "crf {}", v),
        }
    }
}

/// Encoder implementation to use for a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Pcm,
    Ffmpeg,
}

impl FromStr for EncoderKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm" => Ok(EncoderKind::Pcm),
            "ffmpeg" | "x264" => Ok(EncoderKind::Ffmpeg),
            other => Err(CaptureError::Encoder(format!("unknown encoder '{}'", other))),
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderKind::Pcm => f.write_str("pcm"),
            EncoderKind::Ffmpeg => f.write_str("ffmpeg"),
        }
    }
}

/// Parameters fixed for the lifetime of a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSettings {
    pub width: usize,
    pub height: usize,
    /// Only affects timing metadata.
    pub frame_rate: u32,
    pub quality: Quality,
    pub preset: String,
}

impl EncoderSettings {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Encoder(format!(
                "invalid stream size {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CaptureError::Encoder(format!(
                "4:2:0 output needs even dimensions, got {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(CaptureError::Encoder("frame rate must be > 0".into()));
        }
        Ok(())
    }
}

/// One unit of compressed output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub pts: i64,
    pub key: bool,
}

/// Encoder backend seam.
pub trait VideoEncoder: Send {
    fn name(&self) -> &'static str;

    /// Encode one frame. May return no packets while the encoder buffers.
    fn encode(&mut self, frame: &PlanarFrame, pts: i64) -> Result<Vec<EncodedPacket>>;

    /// Pull one buffered packet after the end of input. `None` once drained.
    fn flush(&mut self) -> Result<Option<EncodedPacket>>;
}

/// Instantiate the backend selected by `kind`.
pub fn create_encoder(kind: EncoderKind, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>> {
    match kind {
        EncoderKind::Pcm => Ok(Box::new(pcm::PcmH264Encoder::new(settings)?)),
        #[cfg(feature = "encoder-ffmpeg")]
        EncoderKind::Ffmpeg => Ok(Box::new(ffmpeg::FfmpegEncoder::new(settings)?)),
        #[cfg(not(feature = "encoder-ffmpeg"))]
        EncoderKind::Ffmpeg => Err(CaptureError::Encoder(
            "the ffmpeg encoder requires the encoder-ffmpeg feature".into(),
        )),
    }
}

/// Totals for a finalized stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub packets: u64,
    /// Packet bytes plus the end marker.
    pub bytes: u64,
}

/// One encoder session writing to one file.
pub struct StreamEncoder {
    path: PathBuf,
    settings: EncoderSettings,
    encoder: Box<dyn VideoEncoder>,
    writer: Option<BufWriter<File>>,
    frames: u64,
    packets: u64,
    bytes: u64,
    summary: Option<StreamSummary>,
}

impl StreamEncoder {
    /// Create the output file and open an encoder of the given kind.
    pub fn open(path: &Path, settings: EncoderSettings, kind: EncoderKind) -> Result<Self> {
        settings.validate()?;
        let encoder = create_encoder(kind, &settings)?;
        Self::with_encoder(path, settings, encoder)
    }

    /// Bind an already constructed encoder to a new output file.
    pub fn with_encoder(
        path: &Path,
        settings: EncoderSettings,
        encoder: Box<dyn VideoEncoder>,
    ) -> Result<Self> {
        settings.validate()?;
        let file = File::create(path).map_err(|err| {
            CaptureError::Encoder(format!(
                "could not open output file {}: {}",
                path.display(),
                err
            ))
        })?;
        log::info!(
            "{}: {}x{} @ {} fps, {}, encoder {}",
            path.display(),
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.quality,
            encoder.name()
        );
        Ok(Self {
            path: path.to_path_buf(),
            settings,
            encoder,
            writer: Some(BufWriter::new(file)),
            frames: 0,
            packets: 0,
            bytes: 0,
            summary: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.summary.is_some()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Encode one frame and append whatever packets the encoder emits.
    /// Returns the number of packets written.
    pub fn submit(&mut self, frame: &PlanarFrame) -> Result<usize> {
        if self.summary.is_some() {
            return Err(CaptureError::Encoder(format!(
                "{} is already finalized",
                self.path.display()
            )));
        }
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(CaptureError::Encoder(format!(
                "frame is {}x{}, stream is {}x{}",
                frame.width, frame.height, self.settings.width, self.settings.height
            )));
        }

        let pts = self.frames as i64;
        let packets = self.encoder.encode(frame, pts)?;
        self.frames += 1;
        let count = packets.len();
        for packet in &packets {
            self.write_packet(packet)?;
        }
        Ok(count)
    }

    /// Drain buffered packets, append the end marker and close the file.
    ///
    /// Calling it again returns the same summary without writing anything.
    pub fn close(&mut self) -> Result<StreamSummary> {
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }

        let drained = self.drain();
        let finished = drained.and_then(|()| self.write_end_marker());

        // The stream is final either way; never write after this point.
        let summary = StreamSummary {
            path: self.path.clone(),
            frames: self.frames,
            packets: self.packets,
            bytes: self.bytes,
        };
        self.summary = Some(summary.clone());
        finished?;

        log::info!(
            "{}: finalized ({} frames, {} packets, {} bytes)",
            self.path.display(),
            summary.frames,
            summary.packets,
            summary.bytes
        );
        Ok(summary)
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(packet) = self.encoder.flush()? {
            self.write_packet(&packet)?;
        }
        Ok(())
    }

    fn write_end_marker(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| CaptureError::Encoder("output file already closed".into()))?;
        writer.write_all(&END_OF_STREAM_MARKER)?;
        self.bytes += END_OF_STREAM_MARKER.len() as u64;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|err| CaptureError::Io(err.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CaptureError::Encoder("output file already closed".into()))?;
        writer.write_all(&packet.data)?;
        self.packets += 1;
        self.bytes += packet.data.len() as u64;
        Ok(())
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        if self.summary.is_none() {
            if let Err(err) = self.close() {
                log::error!("{}: finalizing stream failed: {}", self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Holds back `delay` frames, like an encoder with lookahead.
    struct DelayedEncoder {
        delay: usize,
        pending: VecDeque<EncodedPacket>,
    }

    impl VideoEncoder for DelayedEncoder {
        fn name(&self) -> &'static str {
            "delayed"
        }

        fn encode(&mut self, frame: &PlanarFrame, pts: i64) -> Result<Vec<EncodedPacket>> {
            self.pending.push_back(EncodedPacket {
                data: vec![0xAB; 10 + frame.luma()[0] as usize],
                pts,
                key: pts == 0,
            });
            let mut out = Vec::new();
            while self.pending.len() > self.delay {
                out.extend(self.pending.pop_front());
            }
            Ok(out)
        }

        fn flush(&mut self) -> Result<Option<EncodedPacket>> {
            Ok(self.pending.pop_front())
        }
    }

    fn settings() -> EncoderSettings {
        EncoderSettings {
            width: 16,
            height: 16,
            frame_rate: 24,
            quality: Quality::Lossless,
            preset: "ultrafast".to_string(),
        }
    }

    #[test]
    fn quality_parsing_accepts_sentinel_and_crf() -> Result<()> {
        assert_eq!("0".parse::<Quality>()?, Quality::Lossless);
        assert_eq!("lossless".parse::<Quality>()?, Quality::Lossless);
        assert_eq!("23".parse::<Quality>()?, Quality::Crf(23));
        assert!("52".parse::<Quality>().is_err());
        assert!("high".parse::<Quality>().is_err());
        Ok(())
    }

    #[test]
    fn close_drains_buffered_packets_before_marker() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("delayed.h264");
        let encoder = Box::new(DelayedEncoder {
            delay: 3,
            pending: VecDeque::new(),
        });
        let mut stream = StreamEncoder::with_encoder(&path, settings(), encoder)?;

        let frame = PlanarFrame::new(16, 16);
        let mut written = 0;
        for _ in 0..5 {
            written += stream.submit(&frame)?;
        }
        assert_eq!(written, 2);

        let summary = stream.close()?;
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.packets, 5);

        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len() as u64, summary.bytes);
        assert_eq!(bytes.len(), 5 * 10 + END_OF_STREAM_MARKER.len());
        assert!(bytes.ends_with(&END_OF_STREAM_MARKER));
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_submit_after_close_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("idempotent.h264");
        let mut stream = StreamEncoder::open(&path, settings(), EncoderKind::Pcm)?;
        stream.submit(&PlanarFrame::new(16, 16))?;

        let first = stream.close()?;
        let len_after_first = std::fs::metadata(&path)?.len();
        let second = stream.close()?;
        assert_eq!(first, second);
        assert_eq!(std::fs::metadata(&path)?.len(), len_after_first);

        assert!(stream.submit(&PlanarFrame::new(16, 16)).is_err());
        assert_eq!(std::fs::metadata(&path)?.len(), len_after_first);
        Ok(())
    }

    #[test]
    fn drop_finalizes_open_stream() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dropped.h264");
        {
            let mut stream = StreamEncoder::open(&path, settings(), EncoderKind::Pcm)?;
            stream.submit(&PlanarFrame::new(16, 16))?;
        }
        let bytes = std::fs::read(&path)?;
        assert!(bytes.ends_with(&END_OF_STREAM_MARKER));
        Ok(())
    }

    #[test]
    fn geometry_is_fixed_for_the_stream() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("fixed.h264");
        let mut stream = StreamEncoder::open(&path, settings(), EncoderKind::Pcm)?;
        assert!(stream.submit(&PlanarFrame::new(32, 16)).is_err());
        assert_eq!(stream.frames(), 0);
        Ok(())
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let mut odd = settings();
        odd.width = 15;
        let result = StreamEncoder::open(&dir.path().join("odd.h264"), odd, EncoderKind::Pcm);
        assert!(matches!(result, Err(CaptureError::Encoder(_))));
    }

    #[cfg(not(feature = "encoder-ffmpeg"))]
    #[test]
    fn ffmpeg_backend_needs_feature() {
        let result = create_encoder(EncoderKind::Ffmpeg, &settings());
        assert!(result.is_err());
    }
}
