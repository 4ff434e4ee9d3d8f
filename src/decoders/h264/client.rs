// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;
use crate::decoders::h264::picture::DpbEntry;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::scaling::ScalingMatrices;
use crate::decoders::Error;

/// A parameter set that was just parsed and published.
#[derive(Clone, Copy, Debug)]
pub enum ParameterSet<'a> {
    Sps(&'a Rc<Sps>),
    Pps(&'a Rc<Pps>),
}

/// The video signal description of the VUI, Table E-2 to E-5 codes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoSignalInfo {
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

/// Stream properties announced when a coded video sequence starts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceInfo {
    pub coded_width: u32,
    pub coded_height: u32,
    /// Size after the SPS cropping window is applied.
    pub display_width: u32,
    pub display_height: u32,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    /// Whether the sequence only has frame macroblocks.
    pub progressive: bool,
    /// Frame rate as a `(numerator, denominator)` pair, when the VUI timing
    /// info gives one above 1Hz.
    pub frame_rate: Option<(u32, u32)>,
    /// Display aspect ratio, reduced.
    pub display_aspect_ratio: (u32, u32),
    pub video_signal: VideoSignalInfo,
    /// Bit rate of the first NAL HRD schedule, 0 if unknown.
    pub bit_rate: u64,
    /// Buffers needed to decode the stream: the DPB plus the current picture.
    pub min_num_decode_surfaces: u32,
    /// DPB slots needed, the current picture's one included.
    pub min_num_dpb_slots: u32,
    pub profile_idc: u8,
    pub level_idc: u8,
}

/// How a picture leaves the DPB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub pic_order_cnt: i32,
    pub timestamp: u64,
    /// Whether a frame, or a lone field, is displayed.
    pub field: Field,
    /// `pic_struct` of the picture timing SEI message, Table D-1.
    pub pic_struct: Option<u8>,
    /// Set for concealment frames inserted for gaps in frame_num.
    pub not_existing: bool,
}

/// Everything needed to decode the picture that was just assembled.
pub struct PictureInfo<'a, P> {
    pub sps: &'a Rc<Sps>,
    pub pps: &'a Rc<Pps>,
    /// Headers of the slices of the picture, in decoding order.
    pub slices: &'a [SliceHeader],
    pub scaling: &'a ScalingMatrices,
    /// The buffer to decode into, if the allocation succeeded.
    pub picture: Option<&'a P>,
    /// Slot of the picture in `dpb`, or 16 for the scratch slot.
    pub dpb_index: usize,
    pub field: Field,
    pub second_field: bool,
    pub top_field_first: bool,
    pub progressive_frame: bool,
    /// Extra fields to display: 1 repeats the first field, 2 doubles the
    /// frame and 4 triples it.
    pub repeat_first_field: u8,
    pub reference: bool,
    pub idr: bool,
    /// Whether every slice is an I or SI slice.
    pub intra: bool,
    pub frame_num: u32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    /// From the access unit delimiter that preceded the picture, if any.
    pub primary_pic_type: Option<u8>,
    pub timestamp: u64,
    /// The 16 standard DPB slots. Entries for which `is_reference()` holds
    /// are the reference pictures of this picture.
    pub dpb: &'a [DpbEntry<P>],
}

/// Trait for the users of the decoder. The decoder calls into the client to
/// obtain picture buffers, to decode and to display pictures. All calls happen
/// on the thread that drives the decoder.
pub trait DecoderClient {
    /// A handle to a picture buffer. Cloning it must add a reference to the
    /// underlying buffer, and dropping it must release that reference.
    type Picture: Clone;

    /// Called when a coded video sequence with new properties starts. Returns
    /// the number of frame buffers the client will provide, 0 rejects the
    /// sequence.
    fn init_sequence(&mut self, info: &SequenceInfo) -> u32;

    /// Returns a buffer to decode the next picture into.
    fn alloc_picture_buffer(&mut self) -> Option<Self::Picture>;

    /// Called once per frame or lone field, in output order.
    fn display_picture(&mut self, picture: &Self::Picture, info: &DisplayInfo);

    /// Called for every parameter set that was parsed successfully. Returning
    /// false only gets logged.
    fn update_picture_parameters(&mut self, set: ParameterSet<'_>) -> bool;

    /// Called once all slices of a picture are known, before the DPB is
    /// updated with it. Returning false only gets logged.
    fn begin_picture(&mut self, _info: &PictureInfo<'_, Self::Picture>) -> bool {
        true
    }

    /// Called with NAL units the decoder does not handle.
    fn unhandled_nalu(&mut self, _nalu: &[u8]) {}

    /// Called for every error met while decoding. Errors are never fatal to
    /// the decoder.
    fn report_error(&mut self, _error: &Error) {}
}
