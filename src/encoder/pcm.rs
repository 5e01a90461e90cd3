//! Built-in lossless H.264 encoder.
//!
//! Every picture is an IDR slice made of I_PCM macroblocks, so samples are
//! carried verbatim and any conforming decoder reproduces the input exactly.
//! The stream is Annex B: SPS and PPS precede the first picture, each NAL unit
//! starts with a 4-byte start code, and RBSP payloads are escaped with
//! emulation prevention bytes.

use crate::convert::PlanarFrame;
use crate::error::{CaptureError, Result};

use super::{EncodedPacket, EncoderSettings, Quality, VideoEncoder};

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const NAL_SLICE_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

const PROFILE_BASELINE: u8 = 66;
const MB_TYPE_I_PCM: u32 = 25;
/// `slice_type` 7: every slice of the picture is an I slice.
const SLICE_TYPE_I_ALL: u32 = 7;
const LOG2_MAX_FRAME_NUM: u32 = 4;

/// (level_idc, max macroblocks per frame, max macroblocks per second)
const LEVELS: &[(u8, u64, u64)] = &[
    (10, 99, 1_485),
    (11, 396, 3_000),
    (12, 396, 6_000),
    (13, 396, 11_880),
    (21, 792, 19_800),
    (22, 1_620, 20_250),
    (30, 1_620, 40_500),
    (31, 3_600, 108_000),
    (32, 5_120, 216_000),
    (40, 8_192, 245_760),
    (42, 8_704, 522_240),
    (50, 22_080, 589_824),
    (51, 36_864, 983_040),
    (52, 36_864, 2_073_600),
];

/// MSB-first bit writer producing an RBSP.
#[derive(Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.filled += 1;
        if self.filled == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    pub(crate) fn bits(&mut self, value: u32, count: u32) {
        for shift in (0..count).rev() {
            self.bit((value >> shift) & 1 == 1);
        }
    }

    /// Unsigned Exp-Golomb.
    pub(crate) fn ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros();
        for _ in 1..len {
            self.bit(false);
        }
        for shift in (0..len).rev() {
            self.bit((code >> shift) & 1 == 1);
        }
    }

    /// Signed Exp-Golomb.
    pub(crate) fn se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.ue(mapped);
    }

    pub(crate) fn is_aligned(&self) -> bool {
        self.filled == 0
    }

    pub(crate) fn align_zero(&mut self) {
        while !self.is_aligned() {
            self.bit(false);
        }
    }

    /// Append whole bytes. The writer must be byte aligned.
    pub(crate) fn bytes(&mut self, data: &[u8]) {
        debug_assert!(self.is_aligned());
        self.bytes.extend_from_slice(data);
    }

    pub(crate) fn trailing_bits(&mut self) {
        self.bit(true);
        self.align_zero();
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.align_zero();
        self.bytes
    }
}

/// Escape an RBSP so no start code prefix appears inside the NAL unit.
pub(crate) fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

fn append_nal(out: &mut Vec<u8>, ref_idc: u8, nal_type: u8, rbsp: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.push((ref_idc << 5) | nal_type);
    out.extend_from_slice(&escape_rbsp(rbsp));
}

fn level_for(mbs_per_frame: u64, frame_rate: u32) -> u8 {
    let mbs_per_second = mbs_per_frame * frame_rate as u64;
    LEVELS
        .iter()
        .find(|(_, max_fs, max_mbps)| mbs_per_frame <= *max_fs && mbs_per_second <= *max_mbps)
        .map_or(52, |(level, _, _)| *level)
}

pub(crate) struct PcmH264Encoder {
    width: usize,
    height: usize,
    mb_cols: usize,
    mb_rows: usize,
    frame_rate: u32,
    headers_sent: bool,
    idr_pic_id: u32,
}

impl PcmH264Encoder {
    pub(crate) fn new(settings: &EncoderSettings) -> Result<Self> {
        if settings.width == 0 || settings.height == 0 {
            return Err(CaptureError::Encoder(format!(
                "invalid stream size {}x{}",
                settings.width, settings.height
            )));
        }
        if let Quality::Crf(crf) = settings.quality {
            log::info!(
                "pcm encoder ignores crf {} and preset '{}'; output is lossless",
                crf,
                settings.preset
            );
        }
        Ok(Self {
            width: settings.width,
            height: settings.height,
            mb_cols: settings.width.div_ceil(16),
            mb_rows: settings.height.div_ceil(16),
            frame_rate: settings.frame_rate,
            headers_sent: false,
            idr_pic_id: 0,
        })
    }

    fn sps(&self) -> Vec<u8> {
        let mbs = (self.mb_cols * self.mb_rows) as u64;
        let mut w = BitWriter::new();
        w.bits(PROFILE_BASELINE as u32, 8);
        w.bits(0, 8);
        w.bits(level_for(mbs, self.frame_rate) as u32, 8);
        w.ue(0); // seq_parameter_set_id
        w.ue(LOG2_MAX_FRAME_NUM - 4);
        w.ue(2); // pic_order_cnt_type
        w.ue(1); // max_num_ref_frames
        w.bit(false); // gaps_in_frame_num_value_allowed_flag
        w.ue((self.mb_cols - 1) as u32);
        w.ue((self.mb_rows - 1) as u32);
        w.bit(true); // frame_mbs_only_flag
        w.bit(true); // direct_8x8_inference_flag

        let crop_right = (self.mb_cols * 16 - self.width) / 2;
        let crop_bottom = (self.mb_rows * 16 - self.height) / 2;
        let cropping = crop_right > 0 || crop_bottom > 0;
        w.bit(cropping);
        if cropping {
            w.ue(0);
            w.ue(crop_right as u32);
            w.ue(0);
            w.ue(crop_bottom as u32);
        }

        // VUI with timing information only.
        w.bit(true);
        w.bit(false); // aspect_ratio_info_present_flag
        w.bit(false); // overscan_info_present_flag
        w.bit(false); // video_signal_type_present_flag
        w.bit(false); // chroma_loc_info_present_flag
        w.bit(true); // timing_info_present_flag
        w.bits(1, 32);
        w.bits(self.frame_rate.saturating_mul(2), 32);
        w.bit(true); // fixed_frame_rate_flag
        w.bit(false); // nal_hrd_parameters_present_flag
        w.bit(false); // vcl_hrd_parameters_present_flag
        w.bit(false); // pic_struct_present_flag
        w.bit(false); // bitstream_restriction_flag

        w.trailing_bits();
        w.finish()
    }

    fn pps(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0); // pic_parameter_set_id
        w.ue(0); // seq_parameter_set_id
        w.bit(false); // entropy_coding_mode_flag (CAVLC)
        w.bit(false); // bottom_field_pic_order_in_frame_present_flag
        w.ue(0); // num_slice_groups_minus1
        w.ue(0); // num_ref_idx_l0_default_active_minus1
        w.ue(0); // num_ref_idx_l1_default_active_minus1
        w.bit(false); // weighted_pred_flag
        w.bits(0, 2); // weighted_bipred_idc
        w.se(0); // pic_init_qp_minus26
        w.se(0); // pic_init_qs_minus26
        w.se(0); // chroma_qp_index_offset
        w.bit(true); // deblocking_filter_control_present_flag
        w.bit(false); // constrained_intra_pred_flag
        w.bit(false); // redundant_pic_cnt_present_flag
        w.trailing_bits();
        w.finish()
    }

    fn idr_slice(&self, frame: &PlanarFrame) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0); // first_mb_in_slice
        w.ue(SLICE_TYPE_I_ALL);
        w.ue(0); // pic_parameter_set_id
        w.bits(0, LOG2_MAX_FRAME_NUM); // frame_num
        w.ue(self.idr_pic_id);
        w.bit(false); // no_output_of_prior_pics_flag
        w.bit(false); // long_term_reference_flag
        w.se(0); // slice_qp_delta
        w.ue(1); // disable_deblocking_filter_idc

        let mut samples = Vec::with_capacity(384);
        for mb_y in 0..self.mb_rows {
            for mb_x in 0..self.mb_cols {
                w.ue(MB_TYPE_I_PCM);
                w.align_zero();
                samples.clear();
                copy_block(&mut samples, frame, 0, mb_x * 16, mb_y * 16, 16);
                copy_block(&mut samples, frame, 1, mb_x * 8, mb_y * 8, 8);
                copy_block(&mut samples, frame, 2, mb_x * 8, mb_y * 8, 8);
                w.bytes(&samples);
            }
        }

        w.trailing_bits();
        w.finish()
    }
}

/// Copy a `size`x`size` block of one plane, replicating edge samples where the
/// block extends past the picture.
fn copy_block(out: &mut Vec<u8>, frame: &PlanarFrame, plane: usize, x0: usize, y0: usize, size: usize) {
    let (plane_width, plane_height) = if plane == 0 {
        (frame.width, frame.height)
    } else {
        (frame.chroma_width(), frame.chroma_height())
    };
    let stride = frame.strides[plane];
    let data = &frame.planes[plane];
    for y in y0..y0 + size {
        let row = y.min(plane_height - 1) * stride;
        for x in x0..x0 + size {
            out.push(data[row + x.min(plane_width - 1)]);
        }
    }
}

impl VideoEncoder for PcmH264Encoder {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn encode(&mut self, frame: &PlanarFrame, pts: i64) -> Result<Vec<EncodedPacket>> {
        if frame.width != self.width || frame.height != self.height {
            return Err(CaptureError::Encoder(format!(
                "frame is {}x{}, encoder is {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let mut data = Vec::with_capacity(self.mb_cols * self.mb_rows * 390 + 64);
        if !self.headers_sent {
            append_nal(&mut data, 3, NAL_SPS, &self.sps());
            append_nal(&mut data, 3, NAL_PPS, &self.pps());
            self.headers_sent = true;
        }
        append_nal(&mut data, 3, NAL_SLICE_IDR, &self.idr_slice(frame));
        self.idr_pic_id ^= 1;

        Ok(vec![EncodedPacket {
            data,
            pts,
            key: true,
        }])
    }

    fn flush(&mut self) -> Result<Option<EncodedPacket>> {
        Ok(None)
    }
}
