// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;

/// Occupancy bit of the top field in `DpbEntry::state`.
pub const TOP_FIELD: u8 = 1;
/// Occupancy bit of the bottom field in `DpbEntry::state`.
pub const BOTTOM_FIELD: u8 = 2;
/// Both fields, i.e. a frame or a complementary field pair.
pub const FRAME: u8 = TOP_FIELD | BOTTOM_FIELD;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    pub fn from_header(hdr: &SliceHeader) -> Self {
        match (hdr.field_pic_flag, hdr.bottom_field_flag) {
            (false, _) => Field::Frame,
            (true, false) => Field::Top,
            (true, true) => Field::Bottom,
        }
    }

    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Option<Self> {
        match *self {
            Field::Frame => None,
            Field::Top => Some(Field::Bottom),
            Field::Bottom => Some(Field::Top),
        }
    }

    /// The `DpbEntry::state` bits covered by this field.
    pub fn state_bits(&self) -> u8 {
        match *self {
            Field::Frame => FRAME,
            Field::Top => TOP_FIELD,
            Field::Bottom => BOTTOM_FIELD,
        }
    }

    /// Whether the top field is part of this picture.
    pub fn has_top(&self) -> bool {
        !matches!(self, Field::Bottom)
    }

    /// Whether the bottom field is part of this picture.
    pub fn has_bottom(&self) -> bool {
        !matches!(self, Field::Top)
    }

    /// The field structure of an output made of the `state` bits.
    pub fn from_state(state: u8) -> Self {
        match state {
            TOP_FIELD => Field::Top,
            BOTTOM_FIELD => Field::Bottom,
            _ => Field::Frame,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    Unused,
    ShortTerm,
    LongTerm,
}

/// One frame buffer of the DPB. A buffer holds a frame, a single field, or a
/// complementary field pair.
#[derive(Clone, Debug)]
pub struct DpbEntry<P> {
    /// Which fields are present, a combination of `TOP_FIELD` and
    /// `BOTTOM_FIELD`. 0 means the buffer is empty.
    pub state: u8,
    pub top_reference: Reference,
    pub bottom_reference: Reference,
    pub top_needed_for_output: bool,
    pub bottom_needed_for_output: bool,
    /// Whether the first field was coded with a non-zero `nal_ref_idc`.
    pub reference_picture: bool,
    /// Whether the second field of a pair has been decoded into this buffer.
    pub complementary_field_pair: bool,
    /// Created by the decoding process for gaps in frame_num. Never output.
    pub not_existing: bool,

    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,

    pub frame_num: u32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,
    pub top_pic_num: i32,
    pub bottom_pic_num: i32,
    pub top_long_term_pic_num: i32,
    pub bottom_long_term_pic_num: i32,

    /// From the MVC prefix NAL unit of the picture, 0 without one.
    pub view_id: u16,
    /// View order index, breaks POC ties when bumping. The base view has
    /// index 0.
    pub vo_idx: u32,

    pub timestamp: u64,
    /// `pic_struct` of the picture timing SEI that preceded the picture.
    pub pic_struct: Option<u8>,

    pub sps: Option<Rc<Sps>>,
    pub pps: Option<Rc<Pps>>,
    /// The client's buffer. `None` for non-existing frames and failed
    /// allocations.
    pub picture: Option<P>,
}

impl<P> Default for DpbEntry<P> {
    fn default() -> Self {
        Self {
            state: 0,
            top_reference: Default::default(),
            bottom_reference: Default::default(),
            top_needed_for_output: false,
            bottom_needed_for_output: false,
            reference_picture: false,
            complementary_field_pair: false,
            not_existing: false,
            top_field_order_cnt: 0,
            bottom_field_order_cnt: 0,
            pic_order_cnt: 0,
            frame_num: 0,
            frame_num_wrap: 0,
            long_term_frame_idx: 0,
            top_pic_num: 0,
            bottom_pic_num: 0,
            top_long_term_pic_num: 0,
            bottom_long_term_pic_num: 0,
            view_id: 0,
            vo_idx: 0,
            timestamp: 0,
            pic_struct: None,
            sps: None,
            pps: None,
            picture: None,
        }
    }
}

impl<P> DpbEntry<P> {
    pub fn is_empty(&self) -> bool {
        self.state == 0
    }

    pub fn has_top(&self) -> bool {
        self.state & TOP_FIELD != 0
    }

    pub fn has_bottom(&self) -> bool {
        self.state & BOTTOM_FIELD != 0
    }

    /// Whether any field is marked as used for reference.
    pub fn is_reference(&self) -> bool {
        self.top_reference != Reference::Unused || self.bottom_reference != Reference::Unused
    }

    /// Whether any field is marked as used for short-term reference.
    pub fn is_short_term(&self) -> bool {
        self.top_reference == Reference::ShortTerm || self.bottom_reference == Reference::ShortTerm
    }

    /// Whether any field is marked as used for long-term reference.
    pub fn is_long_term(&self) -> bool {
        self.top_reference == Reference::LongTerm || self.bottom_reference == Reference::LongTerm
    }

    /// Whether both fields are short-term references.
    pub fn is_short_term_frame(&self) -> bool {
        self.top_reference == Reference::ShortTerm && self.bottom_reference == Reference::ShortTerm
    }

    /// Whether both fields of a frame are waiting for output.
    pub fn is_complete_frame_waiting(&self) -> bool {
        self.state == FRAME && self.top_needed_for_output && self.bottom_needed_for_output
    }

    pub fn set_reference(&mut self, reference: Reference) {
        self.top_reference = reference;
        self.bottom_reference = reference;
    }

    /// Marks the fields of `field` with `reference`.
    pub fn set_field_reference(&mut self, field: Field, reference: Reference) {
        if field.has_top() {
            self.top_reference = reference;
        }
        if field.has_bottom() {
            self.bottom_reference = reference;
        }
    }

    /// Marks the fields of `field` as present and needed for output.
    pub fn store_fields(&mut self, field: Field) {
        if field.has_top() {
            self.state |= TOP_FIELD;
            self.top_needed_for_output = true;
        }
        if field.has_bottom() {
            self.state |= BOTTOM_FIELD;
            self.bottom_needed_for_output = true;
        }
    }

    /// Whether the buffer can be emptied: every present field is neither
    /// referenced nor waiting for output.
    pub fn is_unused(&self) -> bool {
        (!self.has_top()
            || (!self.top_needed_for_output && self.top_reference == Reference::Unused))
            && (!self.has_bottom()
                || (!self.bottom_needed_for_output
                    && self.bottom_reference == Reference::Unused))
    }

    /// Empties the buffer, dropping the client's handle.
    pub fn release(&mut self) {
        self.state = 0;
        self.picture = None;
    }

    /// Recomputes the long term pic nums after a LongTermFrameIdx change, as
    /// seen from a picture of structure `field`.
    pub fn update_long_term_pic_nums(&mut self, field: Field) {
        let idx = self.long_term_frame_idx;
        let (top, bottom) = match field {
            // (8-30)
            Field::Frame => (idx, idx),
            // (8-33), (8-34)
            Field::Top => (2 * idx + 1, 2 * idx),
            Field::Bottom => (2 * idx, 2 * idx + 1),
        };
        self.top_long_term_pic_num = top;
        self.bottom_long_term_pic_num = bottom;
    }

    /// Derives FrameNumWrap and the pic nums as seen from the current picture,
    /// see 8.2.4.1.
    pub fn update_pic_nums(&mut self, frame_num: u32, field: Field, max_frame_num: u32) {
        // (8-28)
        self.frame_num_wrap = if self.frame_num > frame_num {
            self.frame_num as i32 - max_frame_num as i32
        } else {
            self.frame_num as i32
        };

        let wrap = self.frame_num_wrap;
        let (top, bottom) = match field {
            // (8-29)
            Field::Frame => (wrap, wrap),
            // (8-31), (8-32)
            Field::Top => (2 * wrap + 1, 2 * wrap),
            Field::Bottom => (2 * wrap, 2 * wrap + 1),
        };
        self.top_pic_num = top;
        self.bottom_pic_num = bottom;
        self.update_long_term_pic_nums(field);
    }
}
