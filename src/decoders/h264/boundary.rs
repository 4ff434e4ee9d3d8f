// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Detection of the first VCL NAL unit of a new primary coded picture, as
//! described in 7.4.1.2.4.

use crate::decoders::h264::parser::Profile;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;

/// The slice header fields that tell pictures apart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceInfo {
    pub nal_ref_idc: u8,
    pub idr_pic_flag: bool,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub pic_order_cnt_type: u8,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub idr_pic_id: u16,
    pub first_mb_in_slice: u32,
    pub colour_plane_id: u8,
    pub profile_idc: u8,
}

impl SliceInfo {
    pub fn new(header: &SliceHeader, sps: &Sps) -> Self {
        Self {
            nal_ref_idc: header.nal_ref_idc,
            idr_pic_flag: header.idr_pic_flag,
            pic_parameter_set_id: header.pic_parameter_set_id,
            frame_num: header.frame_num,
            field_pic_flag: header.field_pic_flag,
            bottom_field_flag: header.bottom_field_flag,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb: header.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: header.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: header.delta_pic_order_cnt,
            idr_pic_id: header.idr_pic_id,
            first_mb_in_slice: header.first_mb_in_slice,
            colour_plane_id: header.colour_plane_id,
            profile_idc: sps.profile_idc,
        }
    }
}

/// Whether `next` starts a new picture given the first slice `prev` of the
/// current one. No current picture means a new one starts.
pub fn is_picture_boundary(prev: Option<&SliceInfo>, next: &SliceInfo) -> bool {
    let prev = match prev {
        Some(prev) => prev,
        None => return true,
    };

    if (prev.nal_ref_idc == 0) != (next.nal_ref_idc == 0)
        || prev.idr_pic_flag != next.idr_pic_flag
        || prev.pic_parameter_set_id != next.pic_parameter_set_id
        || prev.frame_num != next.frame_num
        || prev.field_pic_flag != next.field_pic_flag
        || prev.bottom_field_flag != next.bottom_field_flag
    {
        return true;
    }

    match next.pic_order_cnt_type {
        0 => {
            if prev.pic_order_cnt_lsb != next.pic_order_cnt_lsb
                || prev.delta_pic_order_cnt_bottom != next.delta_pic_order_cnt_bottom
            {
                return true;
            }
        }
        1 => {
            if prev.delta_pic_order_cnt != next.delta_pic_order_cnt {
                return true;
            }
        }
        _ => (),
    }

    if next.idr_pic_flag {
        if prev.idr_pic_id != next.idr_pic_id {
            return true;
        }

        // Two back-to-back IDR pictures with the same idr_pic_id. Baseline
        // allows arbitrary slice order, so only a repeated macroblock address
        // tells its pictures apart.
        if prev.colour_plane_id == next.colour_plane_id
            && next.first_mb_in_slice == prev.first_mb_in_slice
        {
            return true;
        }

        if next.first_mb_in_slice < prev.first_mb_in_slice
            && next.profile_idc != Profile::Baseline as u8
        {
            return true;
        }
    }

    false
}
