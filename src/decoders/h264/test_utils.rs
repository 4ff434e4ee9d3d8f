// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers to build synthetic H.264 streams in unit tests.

use crate::decoders::h264::nalu::NaluType;

/// Writes RBSP bits MSB first.
#[derive(Default)]
pub struct BitWriter {
    data: Vec<u8>,
    num_bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of bits written so far.
    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn write_bit(&mut self, bit: bool) {
        if self.num_bits % 8 == 0 {
            self.data.push(0);
        }

        if bit {
            let last = self.data.len() - 1;
            self.data[last] |= 0x80 >> (self.num_bits % 8);
        }

        self.num_bits += 1;
    }

    pub fn write_bits(&mut self, value: u32, num_bits: usize) {
        assert!(num_bits <= 32);
        for i in (0..num_bits).rev() {
            self.write_bit((u64::from(value) >> i) & 1 == 1);
        }
    }

    pub fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let len = 64 - code.leading_zeros() as usize;

        for _ in 0..len - 1 {
            self.write_bit(false);
        }

        for i in (0..len).rev() {
            self.write_bit((code >> i) & 1 == 1);
        }
    }

    pub fn write_se(&mut self, value: i32) {
        let value = i64::from(value);
        let code = if value > 0 { 2 * value - 1 } else { -2 * value };
        self.write_ue(u32::try_from(code).unwrap());
    }

    /// rbsp_trailing_bits(): the stop bit and zero bits up to the next byte.
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(true);
        while self.num_bits % 8 != 0 {
            self.write_bit(false);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Frames `rbsp` as an Annex B NAL unit with a 4 byte start code, inserting
/// emulation prevention bytes.
pub fn nalu_bytes(ref_idc: u8, nalu_type: NaluType, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01, (ref_idc << 5) | nalu_type as u8];

    let mut zeros = 0;
    for &byte in rbsp {
        if zeros == 2 && byte <= 3 {
            out.push(0x03);
            zeros = 0;
        }

        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }

    out
}

#[derive(Clone, Debug, Default)]
pub struct VuiRestriction {
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

#[derive(Clone, Debug)]
pub struct SpsParams {
    pub profile_idc: u32,
    pub constraint_set3_flag: bool,
    pub level_idc: u32,
    pub sps_id: u32,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub width_in_mbs: u32,
    pub height_in_map_units: u32,
    pub frame_mbs_only_flag: bool,
    /// Left, right, top and bottom cropping offsets.
    pub crop: Option<[u32; 4]>,
    pub vui: Option<VuiRestriction>,
}

impl Default for SpsParams {
    fn default() -> Self {
        Self {
            profile_idc: 77,
            constraint_set3_flag: false,
            level_idc: 30,
            sps_id: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: vec![],
            max_num_ref_frames: 1,
            gaps_in_frame_num_value_allowed_flag: false,
            width_in_mbs: 20,
            height_in_map_units: 15,
            frame_mbs_only_flag: true,
            crop: None,
            vui: None,
        }
    }
}

pub fn sps_rbsp(p: &SpsParams) -> Vec<u8> {
    let mut w = BitWriter::new();

    w.write_bits(p.profile_idc, 8);
    w.write_bits(0, 3);
    w.write_bit(p.constraint_set3_flag);
    w.write_bits(0, 4);
    w.write_bits(p.level_idc, 8);
    w.write_ue(p.sps_id);

    if [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135].contains(&p.profile_idc) {
        w.write_ue(1); // chroma_format_idc
        w.write_ue(0); // bit_depth_luma_minus8
        w.write_ue(0); // bit_depth_chroma_minus8
        w.write_bit(false); // qpprime_y_zero_transform_bypass_flag
        w.write_bit(false); // seq_scaling_matrix_present_flag
    }

    w.write_ue(p.log2_max_frame_num_minus4);
    w.write_ue(p.pic_order_cnt_type);
    match p.pic_order_cnt_type {
        0 => w.write_ue(p.log2_max_pic_order_cnt_lsb_minus4),
        1 => {
            w.write_bit(p.delta_pic_order_always_zero_flag);
            w.write_se(p.offset_for_non_ref_pic);
            w.write_se(p.offset_for_top_to_bottom_field);
            w.write_ue(p.offset_for_ref_frame.len() as u32);
            for offset in &p.offset_for_ref_frame {
                w.write_se(*offset);
            }
        }
        _ => (),
    }

    w.write_ue(p.max_num_ref_frames);
    w.write_bit(p.gaps_in_frame_num_value_allowed_flag);
    w.write_ue(p.width_in_mbs - 1);
    w.write_ue(p.height_in_map_units - 1);
    w.write_bit(p.frame_mbs_only_flag);
    if !p.frame_mbs_only_flag {
        w.write_bit(false); // mb_adaptive_frame_field_flag
    }
    w.write_bit(true); // direct_8x8_inference_flag
    match p.crop {
        Some(offsets) => {
            w.write_bit(true);
            for offset in offsets {
                w.write_ue(offset);
            }
        }
        None => w.write_bit(false),
    }

    match &p.vui {
        Some(vui) => {
            w.write_bit(true);
            w.write_bit(false); // aspect_ratio_info_present_flag
            w.write_bit(false); // overscan_info_present_flag
            w.write_bit(false); // video_signal_type_present_flag
            w.write_bit(false); // chroma_loc_info_present_flag
            w.write_bit(false); // timing_info_present_flag
            w.write_bit(false); // nal_hrd_parameters_present_flag
            w.write_bit(false); // vcl_hrd_parameters_present_flag
            w.write_bit(false); // pic_struct_present_flag
            w.write_bit(true); // bitstream_restriction_flag
            w.write_bit(true); // motion_vectors_over_pic_boundaries_flag
            w.write_ue(2); // max_bytes_per_pic_denom
            w.write_ue(1); // max_bits_per_mb_denom
            w.write_ue(16); // log2_max_mv_length_horizontal
            w.write_ue(16); // log2_max_mv_length_vertical
            w.write_ue(vui.max_num_reorder_frames);
            w.write_ue(vui.max_dec_frame_buffering);
        }
        None => w.write_bit(false),
    }

    w.write_trailing_bits();
    w.finish()
}

#[derive(Clone, Debug, Default)]
pub struct PpsParams {
    pub pps_id: u32,
    pub sps_id: u32,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
}

pub fn pps_rbsp(p: &PpsParams) -> Vec<u8> {
    let mut w = BitWriter::new();

    w.write_ue(p.pps_id);
    w.write_ue(p.sps_id);
    w.write_bit(false); // entropy_coding_mode_flag
    w.write_bit(p.bottom_field_pic_order_in_frame_present_flag);
    w.write_ue(0); // num_slice_groups_minus1
    w.write_ue(0); // num_ref_idx_l0_default_active_minus1
    w.write_ue(0); // num_ref_idx_l1_default_active_minus1
    w.write_bit(false); // weighted_pred_flag
    w.write_bits(0, 2); // weighted_bipred_idc
    w.write_se(0); // pic_init_qp_minus26
    w.write_se(0); // pic_init_qs_minus26
    w.write_se(0); // chroma_qp_index_offset
    w.write_bit(false); // deblocking_filter_control_present_flag
    w.write_bit(false); // constrained_intra_pred_flag
    w.write_bit(p.redundant_pic_cnt_present_flag);

    w.write_trailing_bits();
    w.finish()
}

/// Memory management operations as `(op, first argument, second argument)`.
/// Operation 3 takes the pic num difference and the long term frame index,
/// every other operation takes a single argument.
pub type Mmco = (u32, u32, u32);

#[derive(Clone, Debug)]
pub struct SliceParams {
    pub nal_ref_idc: u8,
    pub idr: bool,
    pub first_mb_in_slice: u32,
    pub slice_type: u32,
    pub pps_id: u32,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub mmcos: Vec<Mmco>,
    /// The value and its width in bits.
    pub slice_group_change_cycle: Option<(u32, usize)>,
}

impl SliceParams {
    pub fn idr() -> Self {
        Self {
            nal_ref_idc: 3,
            idr: true,
            first_mb_in_slice: 0,
            slice_type: 7,
            pps_id: 0,
            frame_num: 0,
            field_pic_flag: false,
            bottom_field_flag: false,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0, 0],
            redundant_pic_cnt: 0,
            no_output_of_prior_pics_flag: false,
            long_term_reference_flag: false,
            mmcos: vec![],
            slice_group_change_cycle: None,
        }
    }

    pub fn p() -> Self {
        Self {
            nal_ref_idc: 2,
            idr: false,
            slice_type: 0,
            ..Self::idr()
        }
    }

    pub fn b() -> Self {
        Self {
            nal_ref_idc: 0,
            idr: false,
            slice_type: 1,
            ..Self::idr()
        }
    }

    fn is_b(&self) -> bool {
        self.slice_type % 5 == 1
    }

    fn is_intra(&self) -> bool {
        matches!(self.slice_type % 5, 2 | 4)
    }
}

pub fn slice_rbsp(s: &SliceParams, sps: &SpsParams, pps: &PpsParams) -> Vec<u8> {
    let mut w = BitWriter::new();

    w.write_ue(s.first_mb_in_slice);
    w.write_ue(s.slice_type);
    w.write_ue(s.pps_id);
    w.write_bits(s.frame_num, sps.log2_max_frame_num_minus4 as usize + 4);

    if !sps.frame_mbs_only_flag {
        w.write_bit(s.field_pic_flag);
        if s.field_pic_flag {
            w.write_bit(s.bottom_field_flag);
        }
    }

    if s.idr {
        w.write_ue(s.idr_pic_id);
    }

    let bottom_present = pps.bottom_field_pic_order_in_frame_present_flag && !s.field_pic_flag;
    if sps.pic_order_cnt_type == 0 {
        w.write_bits(
            s.pic_order_cnt_lsb,
            sps.log2_max_pic_order_cnt_lsb_minus4 as usize + 4,
        );
        if bottom_present {
            w.write_se(s.delta_pic_order_cnt_bottom);
        }
    }

    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        w.write_se(s.delta_pic_order_cnt[0]);
        if bottom_present {
            w.write_se(s.delta_pic_order_cnt[1]);
        }
    }

    if pps.redundant_pic_cnt_present_flag {
        w.write_ue(s.redundant_pic_cnt);
    }

    if s.is_b() {
        w.write_bit(true); // direct_spatial_mv_pred_flag
    }

    if !s.is_intra() {
        w.write_bit(false); // num_ref_idx_active_override_flag
        w.write_bit(false); // ref_pic_list_modification_flag_l0
        if s.is_b() {
            w.write_bit(false); // ref_pic_list_modification_flag_l1
        }
    }

    if s.nal_ref_idc != 0 {
        if s.idr {
            w.write_bit(s.no_output_of_prior_pics_flag);
            w.write_bit(s.long_term_reference_flag);
        } else if s.mmcos.is_empty() {
            w.write_bit(false);
        } else {
            w.write_bit(true);
            for &(op, a, b) in &s.mmcos {
                w.write_ue(op);
                match op {
                    3 => {
                        w.write_ue(a);
                        w.write_ue(b);
                    }
                    5 => (),
                    _ => w.write_ue(a),
                }
            }
            w.write_ue(0);
        }
    }

    w.write_se(0); // slice_qp_delta

    if let Some((value, bits)) = s.slice_group_change_cycle {
        w.write_bits(value, bits);
    }

    // A few bits of slice data.
    w.write_bits(0b1011, 4);
    w.write_trailing_bits();
    w.finish()
}

/// The slice as a complete Annex B NAL unit.
pub fn slice_nalu(s: &SliceParams, sps: &SpsParams, pps: &PpsParams) -> Vec<u8> {
    let nalu_type = if s.idr {
        NaluType::SliceIdr
    } else {
        NaluType::Slice
    };
    nalu_bytes(s.nal_ref_idc, nalu_type, &slice_rbsp(s, sps, pps))
}

/// SPS and PPS NAL units.
pub fn headers(sps: &SpsParams, pps: &PpsParams) -> Vec<u8> {
    let mut out = nalu_bytes(3, NaluType::Sps, &sps_rbsp(sps));
    out.extend(nalu_bytes(3, NaluType::Pps, &pps_rbsp(pps)));
    out
}
