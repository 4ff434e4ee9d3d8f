// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use enumn::N;
use log::debug;
use log::warn;

use crate::decoders::h264::nalu::Nalu;
use crate::decoders::h264::nalu_reader::NaluReader;
use crate::decoders::h264::param_sets::ParameterSetStore;
use crate::decoders::h264::param_sets::MAX_PPS_COUNT;
use crate::decoders::h264::param_sets::MAX_SPS_COUNT;
use crate::decoders::h264::scaling::ScalingListType;
use crate::decoders::h264::scaling::ScalingLists;
use crate::decoders::h264::sei;
use crate::decoders::h264::sei::SeiMessage;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

/// Upper bound of the MMCO list of a single slice header.
const MAX_MMCO_COUNT: usize = 72;

/// Upper bound of the reordering commands of a single reference list.
const MAX_REF_PIC_LIST_MODIFICATIONS: usize = 32;

/// Profiles that carry chroma format, bit depth and scaling lists in the SPS.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Profiles whose `constraint_set3_flag` signals an intra-only stream.
const INTRA_PROFILES: [u8; 6] = [44, 86, 100, 110, 122, 244];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 of ITU-T H.264.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 of ITU-T H.264.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6 of ITU-T H.264.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    /// Whether this is a SP slice. See table 7-6 of ITU-T H.264.
    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether this is a SI slice. See table 7-6 of ITU-T H.264.
    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Cavlc444 = 44,
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422 = 122,
    High444 = 244,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    L1B = 9,
    L1 = 10,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs, Table A-1.
    pub fn max_dpb_mbs(&self) -> u32 {
        match self {
            Level::L1B | Level::L1 => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB schedules in the
    /// bitstream.
    pub cpb_cnt_minus1: u8,
    /// Together with `bit_rate_value_minus1` specifies the maximum input bit
    /// rate of the SchedSelIdx-th CPB.
    pub bit_rate_scale: u8,
    /// Together with `cpb_size_value_minus1` specifies the CPB size of the
    /// SchedSelIdx-th CPB.
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    /// Length in bits of the `initial_cpb_removal_delay` and
    /// `initial_cpb_removal_delay_offset` buffering period fields, minus 1.
    pub initial_cpb_removal_delay_length_minus1: u8,
    /// Length in bits of the `cpb_removal_delay` picture timing field,
    /// minus 1.
    pub cpb_removal_delay_length_minus1: u8,
    /// Length in bits of the `dpb_output_delay` picture timing field, minus 1.
    pub dpb_output_delay_length_minus1: u8,
    /// Length in bits of the `time_offset` picture timing field.
    pub time_offset_length: u8,
}

impl HrdParams {
    /// Bit rate of the `idx`-th CPB in bits per second, (E-53).
    pub fn bit_rate(&self, idx: usize) -> u64 {
        (u64::from(self.bit_rate_value_minus1[idx]) + 1) << (6 + self.bit_rate_scale)
    }

    /// Size of the `idx`-th CPB in bits, (E-54).
    pub fn cpb_size(&self, idx: usize) -> u64 {
        (u64::from(self.cpb_size_value_minus1[idx]) + 1) << (4 + self.cpb_size_scale)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Table E-1. 255 is Extended_SAR, in which case `sar_width` and
    /// `sar_height` hold the ratio.
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    /// Table E-2. Inferred to be 5 (unspecified) when absent.
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    /// Whether picture timing SEI messages carry `pic_struct`.
    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    /// Upper bound of the frames that may precede any frame in decoding
    /// order and follow it in output order. Inferred when the bitstream
    /// restriction is absent.
    pub max_num_reorder_frames: u32,
    /// Required size of the DPB in frame buffers. Inferred when the
    /// bitstream restriction is absent.
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: false,
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: false,
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: false,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            max_bytes_per_pic_denom: 2,
            max_bits_per_mb_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 0,
        }
    }
}

impl VuiParams {
    /// The sample aspect ratio from Table E-1, if known.
    pub fn sample_aspect_ratio(&self) -> Option<(u32, u32)> {
        const SAR_TABLE: [(u32, u32); 17] = [
            (0, 0),
            (1, 1),
            (12, 11),
            (10, 11),
            (16, 11),
            (40, 33),
            (24, 11),
            (20, 11),
            (32, 11),
            (80, 33),
            (18, 11),
            (15, 11),
            (64, 33),
            (160, 99),
            (4, 3),
            (3, 2),
            (2, 1),
        ];

        if !self.aspect_ratio_info_present_flag {
            return None;
        }

        let sar = match self.aspect_ratio_idc {
            255 => (u32::from(self.sar_width), u32::from(self.sar_height)),
            idc => *SAR_TABLE.get(usize::from(idc))?,
        };

        if sar.0 == 0 || sar.1 == 0 {
            None
        } else {
            Some(sar)
        }
    }

    /// The HRD parameters that govern the SEI delay fields, NAL first.
    pub fn hrd_parameters(&self) -> Option<&HrdParams> {
        if self.nal_hrd_parameters_present_flag {
            Some(&self.nal_hrd_parameters)
        } else if self.vcl_hrd_parameters_present_flag {
            Some(&self.vcl_hrd_parameters)
        } else {
            None
        }
    }
}

/// A H264 Sequence Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded video sequences as determined by the
/// content of a seq_parameter_set_id syntax element found in the picture
/// parameter set referred to by the pic_parameter_set_id syntax element found
/// in each slice header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    /// Raw `level_idc`. See `Sps::level` for the interpreted value.
    pub level_idc: u8,

    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    pub seq_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,

    pub log2_max_frame_num_minus4: u8,

    /// Selects one of the three picture order count derivations of 8.2.1.
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,

    /// Size of the sliding window of 8.2.5.3.
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,

    // Calculated
    /// Same as ChromaArrayType.
    pub chroma_array_type: u8,
    /// Same as MaxFrameNum, (7-10).
    pub max_frame_num: u32,
    /// Coded width in luma samples.
    pub width: u32,
    /// Coded frame height in luma samples.
    pub height: u32,
    /// Same as ExpectedDeltaPerPicOrderCntCycle, (7-12).
    pub expected_delta_per_pic_order_cnt_cycle: i32,
    /// MaxDpbFrames as derived from the level limits, clamped to at least
    /// `max_num_ref_frames`.
    pub max_dpb_frames: u32,
}

impl Sps {
    pub fn level(&self) -> Option<Level> {
        Level::n(self.level_idc)
    }

    pub fn profile(&self) -> Option<Profile> {
        Profile::n(self.profile_idc)
    }

    /// MaxPicOrderCntLsb, (7-11).
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn pic_width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 + 1
    }

    /// FrameHeightInMbs, (7-18).
    pub fn frame_height_in_mbs(&self) -> u32 {
        (2 - u32::from(self.frame_mbs_only_flag)) * (self.pic_height_in_map_units_minus1 + 1)
    }

    /// PicSizeInMapUnits, (7-16).
    pub fn pic_size_in_map_units(&self) -> u32 {
        self.pic_width_in_mbs() * (self.pic_height_in_map_units_minus1 + 1)
    }

    /// Whether the stream is an intra-only profile, see A.2.8 to A.2.11.
    pub fn is_intra_profile(&self) -> bool {
        self.constraint_set3_flag && INTRA_PROFILES.contains(&self.profile_idc)
    }

    /// CropUnitX and CropUnitY, Table 6-1.
    fn crop_units(&self) -> (u32, u32) {
        if self.chroma_array_type == 0 {
            (1, 2 - u32::from(self.frame_mbs_only_flag))
        } else {
            let sub_width_c = if self.chroma_format_idc > 2 { 1 } else { 2 };
            let sub_height_c = if self.chroma_format_idc > 1 { 1 } else { 2 };
            (
                sub_width_c,
                sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
            )
        }
    }

    /// Whether the cropping window leaves at least one sample in each
    /// direction, (7-19) to (7-22).
    fn cropping_fits(&self) -> bool {
        if !self.frame_cropping_flag {
            return true;
        }

        let (crop_unit_x, crop_unit_y) = self.crop_units();
        let crop_x = self
            .frame_crop_left_offset
            .checked_add(self.frame_crop_right_offset)
            .and_then(|offset| offset.checked_mul(crop_unit_x));
        let crop_y = self
            .frame_crop_top_offset
            .checked_add(self.frame_crop_bottom_offset)
            .and_then(|offset| offset.checked_mul(crop_unit_y));

        matches!((crop_x, crop_y), (Some(x), Some(y)) if x < self.width && y < self.height)
    }

    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width,
                    y: self.height,
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_units();
        let crop_left = crop_unit_x.saturating_mul(self.frame_crop_left_offset);
        let crop_right = crop_unit_x.saturating_mul(self.frame_crop_right_offset);
        let crop_top = crop_unit_y.saturating_mul(self.frame_crop_top_offset);
        let crop_bottom = crop_unit_y.saturating_mul(self.frame_crop_bottom_offset);

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width.saturating_sub(crop_right),
                y: self.height.saturating_sub(crop_bottom),
            },
        }
    }

    /// Derives MaxDpbFrames from the level limits of Table A-1. Unknown
    /// levels get the largest possible DPB.
    fn derive_max_dpb_frames(&self) -> u32 {
        let level = match self.level() {
            // A.3.1 and A.3.2: Level 1b for Baseline, Main and Extended profile
            // if level_idc == 11 and constraint_set3_flag == 1
            Some(Level::L1_1)
                if self.constraint_set3_flag && matches!(self.profile_idc, 66 | 77 | 88) =>
            {
                Some(Level::L1B)
            }
            level => level,
        };

        let frame_size_in_mbs = self.pic_width_in_mbs() * self.frame_height_in_mbs();
        let max_dpb_frames = match level {
            Some(level) => std::cmp::min(level.max_dpb_mbs() / frame_size_in_mbs, DPB_MAX_SIZE as u32),
            None => DPB_MAX_SIZE as u32,
        };

        if max_dpb_frames < self.max_num_ref_frames {
            warn!(
                "max_num_ref_frames {} exceeds the level limit of {} frames",
                self.max_num_ref_frames, max_dpb_frames
            );
            self.max_num_ref_frames
        } else {
            max_dpb_frames
        }
    }
}

/// The slice group map of a PPS, by `slice_group_map_type`. See 7.4.2.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SliceGroupMap {
    /// A single slice group.
    #[default]
    None,
    /// Type 0.
    Interleaved { run_length_minus1: Vec<u32> },
    /// Type 1. The macroblock to slice group mapping is not derived.
    Dispersed,
    /// Type 2.
    Foreground {
        top_left: Vec<u32>,
        bottom_right: Vec<u32>,
    },
    /// Types 3 (box-out), 4 (raster scan) and 5 (wipe).
    Changing {
        map_type: u8,
        change_direction_flag: bool,
        change_rate_minus1: u32,
    },
    /// Type 6.
    Explicit {
        pic_size_in_map_units_minus1: u32,
        slice_group_id: Vec<u8>,
    },
}

/// A H264 Picture Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded pictures as determined by the
/// `pic_parameter_set_id` syntax element found in each slice header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub slice_group_map_type: u8,
    pub slice_group_map: SliceGroupMap,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,
    /// Inferred to be `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,
}

impl Pps {
    /// SliceGroupChangeRate, (7-23).
    pub fn slice_group_change_rate(&self) -> Option<u32> {
        match self.slice_group_map {
            SliceGroupMap::Changing {
                change_rate_minus1, ..
            } => Some(change_rate_minus1 + 1),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
    /* if modification_of_pic_nums_idc == 4 || 5 */
    pub abs_diff_view_idx_minus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i16; 32],
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i16; 2]; 32],

    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i16; 2]; 32],

    /// Weights and offsets outside of [-128, 127]. They were clamped.
    pub num_out_of_range: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference
    /// picture marking. Values 1 to 6 are defined in table 7-9.
    pub memory_management_control_operation: u8,
    /// Used with operations 1 and 3 to compute picNumX, (8-39).
    pub difference_of_pic_nums_minus1: u32,
    /// Used with operation 2.
    pub long_term_pic_num: u32,
    /// Used with operations 3 and 6.
    pub long_term_frame_idx: u32,
    /// Used with operation 4.
    pub max_long_term_frame_idx_plus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Only present in IDR pictures. Specifies how the previously-decoded
    /// pictures in the DPB are treated.
    pub no_output_of_prior_pics_flag: bool,
    /// Only present in IDR pictures. Whether the IDR picture becomes a long
    /// term reference.
    pub long_term_reference_flag: bool,
    /// Whether `inner` holds the operations to apply instead of the sliding
    /// window.
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

impl RefPicMarking {
    /// Whether the list contains operation 5, which resets the DPB.
    pub fn has_mmco_5(&self) -> bool {
        self.adaptive_ref_pic_marking_mode_flag
            && self
                .inner
                .iter()
                .any(|m| m.memory_management_control_operation == 5)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// `nal_ref_idc` of the NAL unit that carried this slice.
    pub nal_ref_idc: u8,
    /// Whether the slice belongs to an IDR picture.
    pub idr_pic_flag: bool,

    pub first_mb_in_slice: u32,
    /// The raw `slice_type`. Values above 4 signal that all slices of the
    /// picture share the same type.
    pub slice_type_raw: u8,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub pred_weight_table: PredWeightTable,
    pub dec_ref_pic_marking: RefPicMarking,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub slice_group_change_cycle: u32,

    /// Same as `MaxPicNum`.
    pub max_pic_num: u32,
    /// Size of the slice_header() in bits, not counting the NAL unit header.
    pub header_bit_size: usize,
    /// Number of emulation prevention bytes (EPB) in this slice_header()
    pub n_emulation_prevention_bytes: usize,
}

impl SliceHeader {
    /// Whether this slice belongs to a field rather than a frame.
    pub fn is_field(&self) -> bool {
        self.field_pic_flag
    }
}

/// A parsed slice, along with the NAL unit it came from and the parameter
/// sets that were in effect when it was parsed.
#[derive(Debug)]
pub struct Slice<T> {
    pub header: SliceHeader,
    pub nalu: Nalu<T>,
    pub sps: Rc<Sps>,
    pub pps: Rc<Pps>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessUnitDelimiter {
    /// Table 7-5, the slice types that may be present in the primary coded
    /// picture.
    pub primary_pic_type: u8,
}

/// Ceil(Log2(value)), for value >= 1.
fn ceil_log2(value: u32) -> usize {
    if value <= 1 {
        0
    } else {
        (u32::BITS - (value - 1).leading_zeros()) as usize
    }
}

#[derive(Debug, Default)]
pub struct Parser {
    param_sets: ParameterSetStore,
}

impl Parser {
    pub fn param_sets(&self) -> &ParameterSetStore {
        &self.param_sets
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.param_sets.sps(sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.param_sets.pps(pps_id)
    }

    /// Forgets every parameter set.
    pub fn reset(&mut self) {
        self.param_sets.clear();
    }

    fn parse_scaling_list<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        scaling_list: &mut [u8],
    ) -> Result<ScalingListType> {
        // 7.3.2.1.1.1
        let mut last_scale = 8;
        let mut next_scale = 8;

        for j in 0..scaling_list.len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = (last_scale + delta_scale + 256) % 256;
                if j == 0 && next_scale == 0 {
                    return Ok(ScalingListType::UseDefault);
                }
            }

            scaling_list[j] = if next_scale == 0 {
                u8::try_from(last_scale)?
            } else {
                u8::try_from(next_scale)?
            };

            last_scale = i32::from(scaling_list[j]);
        }

        Ok(ScalingListType::Present)
    }

    /// Parses `num_lists` scaling list slots. Slots that are not transmitted
    /// stay `NotPresent`.
    fn parse_scaling_lists<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        lists: &mut ScalingLists,
        num_lists: usize,
    ) -> Result<()> {
        for i in 0..num_lists {
            let present = r.read_bit()?;
            if !present {
                lists.list_types[i] = ScalingListType::NotPresent;
                continue;
            }

            lists.list_types[i] = if i < 6 {
                Parser::parse_scaling_list(r, &mut lists.lists_4x4[i])?
            } else {
                Parser::parse_scaling_list(r, &mut lists.lists_8x8[i - 6])?
            };
        }

        Ok(())
    }

    pub fn parse_hrd<T: AsRef<[u8]>>(r: &mut NaluReader<T>, hrd: &mut HrdParams) -> Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    pub fn parse_vui<T: AsRef<[u8]>>(r: &mut NaluReader<T>, vui: &mut VuiParams) -> Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits_u32(32)?;
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!(
                    "num_units_in_tick == 0, which is not allowed by E.2.1"
                ));
            }

            vui.time_scale = r.read_bits_u32(32)?;
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale == 0, which is not allowed by E.2.1"));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue_max(16)?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
            vui.max_dec_frame_buffering = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        }

        Ok(())
    }

    /// Parses a SPS without publishing it.
    pub fn parse_sps_data(data: &[u8]) -> Result<Sps> {
        let mut r = NaluReader::new(data);
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        sps.level_idc = r.read_bits(8)?;
        sps.seq_parameter_set_id = r.read_ue_max(u32::try_from(MAX_SPS_COUNT)? - 1)?;

        if HIGH_PROFILES.contains(&sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                let num_lists = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                Parser::parse_scaling_lists(&mut r, &mut sps.scaling_lists, num_lists)?;
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            sps.chroma_format_idc
        };

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;
        sps.max_frame_num = 1 << (sps.log2_max_frame_num_minus4 + 4);

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(255)?;

            let mut offset_acc: i32 = 0;
            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                let offset = r.read_se()?;
                sps.offset_for_ref_frame.push(offset);

                // (7-12).
                offset_acc = offset_acc.wrapping_add(offset);
            }

            sps.expected_delta_per_pic_order_cnt_cycle = offset_acc;
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue_max(511)?;
        sps.pic_height_in_map_units_minus1 = r.read_ue_max(511)?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps.vui_parameters)?;
        }

        sps.width = sps.pic_width_in_mbs() * 16;
        sps.height = sps.frame_height_in_mbs() * 16;

        if !sps.cropping_fits() {
            return Err(anyhow!(
                "Broken Data: cropping offsets ({}, {}, {}, {}) do not fit {}x{}",
                sps.frame_crop_left_offset,
                sps.frame_crop_right_offset,
                sps.frame_crop_top_offset,
                sps.frame_crop_bottom_offset,
                sps.width,
                sps.height
            ));
        }

        sps.max_dpb_frames = sps.derive_max_dpb_frames();

        let max_dpb_frames = sps.max_dpb_frames;
        let infer_buffering = !sps.is_intra_profile();
        let poc_type = sps.pic_order_cnt_type;
        let vui = &mut sps.vui_parameters;

        if vui.max_num_reorder_frames > vui.max_dec_frame_buffering {
            warn!(
                "max_num_reorder_frames {} > max_dec_frame_buffering {}, clamping",
                vui.max_num_reorder_frames, vui.max_dec_frame_buffering
            );
            vui.max_num_reorder_frames = vui.max_dec_frame_buffering;
        }

        // E.2.1: when absent, both are inferred to be MaxDpbFrames unless the
        // stream is intra only.
        if vui.max_dec_frame_buffering == 0 && infer_buffering {
            vui.max_dec_frame_buffering = max_dpb_frames;
            if poc_type != 2 {
                vui.max_num_reorder_frames = max_dpb_frames;
            }
        }

        Ok(sps)
    }

    /// Parses a SPS and publishes it on success.
    pub fn parse_sps<T: AsRef<[u8]>>(&mut self, nalu: &Nalu<T>) -> Result<Rc<Sps>> {
        let sps = Parser::parse_sps_data(nalu.payload())?;
        debug!(
            "SPS {}: {}x{}, profile {}, level {}, poc type {}",
            sps.seq_parameter_set_id,
            sps.width,
            sps.height,
            sps.profile_idc,
            sps.level_idc,
            sps.pic_order_cnt_type
        );
        self.param_sets.insert_sps(sps)
    }

    fn parse_slice_group_map<T: AsRef<[u8]>>(r: &mut NaluReader<T>, pps: &mut Pps) -> Result<()> {
        pps.slice_group_map_type = r.read_ue_max(6)?;
        let num_slice_groups = pps.num_slice_groups_minus1 + 1;

        pps.slice_group_map = match pps.slice_group_map_type {
            0 => {
                let mut run_length_minus1 = vec![];
                for _ in 0..num_slice_groups {
                    run_length_minus1.push(r.read_ue()?);
                }
                SliceGroupMap::Interleaved { run_length_minus1 }
            }
            1 => SliceGroupMap::Dispersed,
            2 => {
                let mut top_left = vec![];
                let mut bottom_right = vec![];
                for _ in 0..pps.num_slice_groups_minus1 {
                    top_left.push(r.read_ue()?);
                    bottom_right.push(r.read_ue()?);
                }
                SliceGroupMap::Foreground {
                    top_left,
                    bottom_right,
                }
            }
            map_type @ 3..=5 => SliceGroupMap::Changing {
                map_type,
                change_direction_flag: r.read_bit()?,
                change_rate_minus1: r.read_ue()?,
            },
            _ => {
                let pic_size_in_map_units_minus1 = r.read_ue_max(512 * 512 - 1)?;
                let bits = ceil_log2(num_slice_groups);
                let mut slice_group_id = vec![];
                for _ in 0..=pic_size_in_map_units_minus1 {
                    slice_group_id.push(r.read_bits(bits)?);
                }
                SliceGroupMap::Explicit {
                    pic_size_in_map_units_minus1,
                    slice_group_id,
                }
            }
        };

        Ok(())
    }

    /// Parses a PPS without publishing it. The referenced SPS is only used to
    /// refine range checks and may be absent.
    pub fn parse_pps_data(data: &[u8], param_sets: &ParameterSetStore) -> Result<Pps> {
        let mut r = NaluReader::new(data);
        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(u32::try_from(MAX_PPS_COUNT)? - 1)?,
            seq_parameter_set_id: r.read_ue_max(u32::try_from(MAX_SPS_COUNT)? - 1)?,
            ..Default::default()
        };

        let sps = param_sets.sps(pps.seq_parameter_set_id);

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;
        pps.num_slice_groups_minus1 = r.read_ue_max(7)?;

        if pps.num_slice_groups_minus1 > 0 {
            Parser::parse_slice_group_map(&mut r, &mut pps)?;
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;
        if pps.weighted_bipred_idc > 2 {
            return Err(anyhow!(
                "Broken Data: weighted_bipred_idc {} > 2",
                pps.weighted_bipred_idc
            ));
        }

        // Use the loosest bound if the SPS is not known yet.
        let qp_bd_offset_y = i32::from(6 * sps.map_or(6, |sps| sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;

        // When second_chroma_qp_index_offset is not present, it shall be
        // inferred to be equal to chroma_qp_index_offset.
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                let chroma_format_idc = sps.map_or(1, |sps| sps.chroma_format_idc);
                let num_8x8 = if chroma_format_idc != 3 { 2 } else { 6 };
                let num_lists = 6 + num_8x8 * usize::from(pps.transform_8x8_mode_flag);
                Parser::parse_scaling_lists(&mut r, &mut pps.scaling_lists, num_lists)?;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        Ok(pps)
    }

    /// Parses a PPS and publishes it on success.
    pub fn parse_pps<T: AsRef<[u8]>>(&mut self, nalu: &Nalu<T>) -> Result<Rc<Pps>> {
        let pps = Parser::parse_pps_data(nalu.payload(), &self.param_sets)?;
        debug!(
            "PPS {} (SPS {}), slice groups {}",
            pps.pic_parameter_set_id,
            pps.seq_parameter_set_id,
            pps.num_slice_groups_minus1 + 1
        );
        self.param_sets.insert_pps(pps)
    }

    fn parse_ref_pic_list_modification<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> Result<()> {
        loop {
            let mut pic_num_mod = RefPicListModification {
                modification_of_pic_nums_idc: r.read_ue_max(5)?,
                ..Default::default()
            };

            match pic_num_mod.modification_of_pic_nums_idc {
                0 | 1 => {
                    pic_num_mod.abs_diff_pic_num_minus1 = r.read_ue()?;
                }

                2 => {
                    pic_num_mod.long_term_pic_num = r.read_ue()?;
                }

                3 => break,

                _ => {
                    pic_num_mod.abs_diff_view_idx_minus1 = r.read_ue()?;
                }
            }

            if ref_list_mods.len() == MAX_REF_PIC_LIST_MODIFICATIONS {
                return Err(anyhow!(
                    "Broken Data: more than {} reference list modifications",
                    MAX_REF_PIC_LIST_MODIFICATIONS
                ));
            }

            ref_list_mods.push(pic_num_mod);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        header: &mut SliceHeader,
    ) -> Result<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    /// Reads a weight or offset. Values out of [-128, 127] are clamped and
    /// counted so the caller can decide whether to drop the picture.
    fn read_weight<T: AsRef<[u8]>>(r: &mut NaluReader<T>, pt: &mut PredWeightTable) -> Result<i16> {
        let value: i32 = r.read_se()?;
        if !(-128..=127).contains(&value) {
            pt.num_out_of_range += 1;
        }

        Ok(value.clamp(-128, 127) as i16)
    }

    fn parse_pred_weight_table<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> Result<()> {
        let num_l0 = usize::from(header.num_ref_idx_l0_active_minus1) + 1;
        let num_l1 = usize::from(header.num_ref_idx_l1_active_minus1) + 1;
        let is_b = header.slice_type.is_b();
        let pt = &mut header.pred_weight_table;

        pt.luma_log2_weight_denom = r.read_ue_max(7)?;

        // When luma_weight_lX_flag is equal to 0, luma_weight_lX[i] shall be
        // inferred to be equal to 2 ^ luma_log2_weight_denom.
        let default_luma_weight = 1 << pt.luma_log2_weight_denom;
        pt.luma_weight_l0[..num_l0].fill(default_luma_weight);
        if is_b {
            pt.luma_weight_l1[..num_l1].fill(default_luma_weight);
        }

        if sps.chroma_array_type != 0 {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
            let default_chroma_weight = 1 << pt.chroma_log2_weight_denom;

            pt.chroma_weight_l0[..num_l0].fill([default_chroma_weight; 2]);
            if is_b {
                pt.chroma_weight_l1[..num_l1].fill([default_chroma_weight; 2]);
            }
        }

        for i in 0..num_l0 {
            if r.read_bit()? {
                pt.luma_weight_l0[i] = Parser::read_weight(r, pt)?;
                pt.luma_offset_l0[i] = Parser::read_weight(r, pt)?;
            }

            if sps.chroma_array_type != 0 && r.read_bit()? {
                for j in 0..2 {
                    pt.chroma_weight_l0[i][j] = Parser::read_weight(r, pt)?;
                    pt.chroma_offset_l0[i][j] = Parser::read_weight(r, pt)?;
                }
            }
        }

        if is_b {
            for i in 0..num_l1 {
                if r.read_bit()? {
                    pt.luma_weight_l1[i] = Parser::read_weight(r, pt)?;
                    pt.luma_offset_l1[i] = Parser::read_weight(r, pt)?;
                }

                if sps.chroma_array_type != 0 && r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l1[i][j] = Parser::read_weight(r, pt)?;
                        pt.chroma_offset_l1[i][j] = Parser::read_weight(r, pt)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking<T: AsRef<[u8]>>(
        r: &mut NaluReader<T>,
        header: &mut SliceHeader,
    ) -> Result<()> {
        let rpm = &mut header.dec_ref_pic_marking;

        if header.idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
            return Ok(());
        }

        rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        loop {
            let mut marking = RefPicMarkingInner {
                memory_management_control_operation: r.read_ue_max(6)?,
                ..Default::default()
            };

            let op = marking.memory_management_control_operation;
            if op == 0 {
                break;
            }

            if rpm.inner.len() == MAX_MMCO_COUNT {
                return Err(anyhow!(
                    "Broken Data: more than {} memory management operations",
                    MAX_MMCO_COUNT
                ));
            }

            if op == 1 || op == 3 {
                marking.difference_of_pic_nums_minus1 = r.read_ue()?;
            }

            if op == 2 {
                marking.long_term_pic_num = r.read_ue()?;
            }

            if op == 3 || op == 6 {
                marking.long_term_frame_idx = r.read_ue_max(DPB_MAX_SIZE as u32 - 1)?;
            }

            if op == 4 {
                marking.max_long_term_frame_idx_plus1 = r.read_ue_max(DPB_MAX_SIZE as u32)?;
            }

            rpm.inner.push(marking);
        }

        Ok(())
    }

    pub fn parse_slice_header<T: AsRef<[u8]>>(&self, nalu: Nalu<T>) -> Result<Slice<T>> {
        let mut r = NaluReader::new(nalu.payload());

        let mut header = SliceHeader {
            nal_ref_idc: nalu.header().ref_idc(),
            idr_pic_flag: nalu.header().idr_pic_flag(),
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        header.slice_type_raw = r.read_ue_max(9)?;
        header.slice_type = SliceType::n(header.slice_type_raw % 5)
            .with_context(|| format!("Invalid slice type {}", header.slice_type_raw))?;

        header.pic_parameter_set_id = r.read_ue_max(u32::try_from(MAX_PPS_COUNT)? - 1)?;

        let pps = Rc::clone(self.get_pps(header.pic_parameter_set_id).context(
            "Broken stream: slice references PPS that has not been successfully parsed.",
        )?);

        let sps = Rc::clone(self.get_sps(pps.seq_parameter_set_id).context(
            "Broken stream: slice's PPS references SPS that has not been successfully parsed.",
        )?);

        if header.idr_pic_flag && !(header.slice_type.is_i() || header.slice_type.is_si()) {
            return Err(anyhow!("Broken Data: IDR picture with inter slice"));
        }

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
            if header.colour_plane_id > 2 {
                return Err(anyhow!(
                    "Broken Data: colour_plane_id {} > 2",
                    header.colour_plane_id
                ));
            }
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if header.field_pic_flag {
            header.max_pic_num = 2 * sps.max_frame_num;
        } else {
            header.max_pic_num = sps.max_frame_num;
        }

        let pic_size_in_mbs = sps.pic_width_in_mbs() * sps.frame_height_in_mbs()
            / (1 + u32::from(header.field_pic_flag));
        let mbaff_frame_flag = sps.mb_adaptive_frame_field_flag && !header.field_pic_flag;
        if header.first_mb_in_slice >= pic_size_in_mbs >> u32::from(mbaff_frame_flag) {
            return Err(anyhow!(
                "Broken Data: first_mb_in_slice {} out of range",
                header.first_mb_in_slice
            ));
        }

        if header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(31)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(31)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        let max_ref_idx = if header.field_pic_flag { 31 } else { 15 };
        if header.num_ref_idx_l0_active_minus1 > max_ref_idx
            || header.num_ref_idx_l1_active_minus1 > max_ref_idx
        {
            return Err(anyhow!("Broken Data: too many active reference indices"));
        }

        Parser::parse_ref_pic_list_modifications(&mut r, &mut header)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::parse_pred_weight_table(&mut r, &sps, &mut header)?;
        }

        if header.nal_ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(&mut r, &mut header)?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.cabac_init_idc = r.read_ue_max(2)?;
        }

        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        if let Some(change_rate) = pps.slice_group_change_rate() {
            // (7-35)
            let pic_size_in_map_units = sps.pic_size_in_map_units();
            let bits = ceil_log2(pic_size_in_map_units.div_ceil(change_rate) + 1);
            header.slice_group_change_cycle = r.read_bits(bits)?;
        }

        header.header_bit_size = r.num_bits_read();
        header.n_emulation_prevention_bytes = r.num_epb();

        Ok(Slice {
            header,
            nalu,
            sps,
            pps,
        })
    }

    /// Parses all SEI messages of a SEI NAL unit. `active_sps` provides the
    /// HRD and `pic_struct` configuration that picture timing messages depend
    /// on.
    pub fn parse_sei<T: AsRef<[u8]>>(
        &self,
        nalu: &Nalu<T>,
        active_sps: Option<&Sps>,
    ) -> Result<Vec<SeiMessage>> {
        sei::parse_sei_rbsp(nalu.payload(), &self.param_sets, active_sps)
    }

    pub fn parse_aud<T: AsRef<[u8]>>(nalu: &Nalu<T>) -> Result<AccessUnitDelimiter> {
        let mut r = NaluReader::new(nalu.payload());
        Ok(AccessUnitDelimiter {
            primary_pic_type: r.read_bits(3)?,
        })
    }
}
