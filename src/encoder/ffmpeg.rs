//! libx264 encoder through ffmpeg.

use ffmpeg_next as ffmpeg;

use crate::convert::PlanarFrame;
use crate::error::{CaptureError, Result};

use super::{EncodedPacket, EncoderSettings, VideoEncoder};

fn encoder_error(context: &str, err: ffmpeg::Error) -> CaptureError {
    CaptureError::Encoder(format!("{}: {}", context, err))
}

pub(crate) struct FfmpegEncoder {
    encoder: ffmpeg::encoder::video::Encoder,
    frame: ffmpeg::frame::Video,
    eof_sent: bool,
}

impl FfmpegEncoder {
    pub(crate) fn new(settings: &EncoderSettings) -> Result<Self> {
        ffmpeg::init().map_err(|err| encoder_error("initialize ffmpeg", err))?;
        let codec = ffmpeg::encoder::find_by_name("libx264")
            .ok_or_else(|| CaptureError::Encoder("libx264 is not available".into()))?;

        let context = ffmpeg::codec::context::Context::new_with_codec(codec);
        let mut video = context
            .encoder()
            .video()
            .map_err(|err| encoder_error("create video encoder", err))?;
        let fps = settings.frame_rate as i32;
        video.set_width(settings.width as u32);
        video.set_height(settings.height as u32);
        video.set_format(ffmpeg::format::Pixel::YUV420P);
        video.set_time_base(ffmpeg::Rational::new(1, fps));
        video.set_frame_rate(Some(ffmpeg::Rational::new(fps, 1)));

        let mut options = ffmpeg::Dictionary::new();
        options.set("crf", &settings.quality.crf().to_string());
        options.set("preset", &settings.preset);
        let encoder = video
            .open_with(options)
            .map_err(|err| encoder_error("open libx264", err))?;

        log::debug!(
            "libx264 opened ({}x{}, crf {}, preset {})",
            settings.width,
            settings.height,
            settings.quality.crf(),
            settings.preset
        );

        Ok(Self {
            encoder,
            frame: ffmpeg::frame::Video::new(
                ffmpeg::format::Pixel::YUV420P,
                settings.width as u32,
                settings.height as u32,
            ),
            eof_sent: false,
        })
    }

    fn receive(&mut self) -> Option<EncodedPacket> {
        let mut packet = ffmpeg::Packet::empty();
        if self.encoder.receive_packet(&mut packet).is_err() {
            return None;
        }
        Some(EncodedPacket {
            data: packet.data().map(|data| data.to_vec()).unwrap_or_default(),
            pts: packet.pts().unwrap_or_default(),
            key: packet.is_key(),
        })
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "libx264"
    }

    fn encode(&mut self, frame: &PlanarFrame, pts: i64) -> Result<Vec<EncodedPacket>> {
        for plane in 0..3 {
            let rows = if plane == 0 {
                frame.height
            } else {
                frame.chroma_height()
            };
            let src_stride = frame.strides[plane];
            let dst_stride = self.frame.stride(plane);
            let dst = self.frame.data_mut(plane);
            for (row, src) in frame.planes[plane].chunks_exact(src_stride).take(rows).enumerate() {
                dst[row * dst_stride..row * dst_stride + src_stride].copy_from_slice(src);
            }
        }
        self.frame.set_pts(Some(pts));

        self.encoder
            .send_frame(&self.frame)
            .map_err(|err| encoder_error("send frame to libx264", err))?;

        let mut packets = Vec::new();
        while let Some(packet) = self.receive() {
            packets.push(packet);
        }
        Ok(packets)
    }

    fn flush(&mut self) -> Result<Option<EncodedPacket>> {
        if !self.eof_sent {
            self.encoder
                .send_eof()
                .map_err(|err| encoder_error("flush libx264", err))?;
            self.eof_sent = true;
        }
        Ok(self.receive())
    }
}
