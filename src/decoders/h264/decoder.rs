// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::rc::Rc;

use log::debug;
use log::warn;

use crate::decoders::h264::boundary::is_picture_boundary;
use crate::decoders::h264::boundary::SliceInfo;
use crate::decoders::h264::client::DecoderClient;
use crate::decoders::h264::client::DisplayInfo;
use crate::decoders::h264::client::ParameterSet;
use crate::decoders::h264::client::PictureInfo;
use crate::decoders::h264::client::SequenceInfo;
use crate::decoders::h264::client::VideoSignalInfo;
use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::dpb::OutputPicture;
use crate::decoders::h264::dpb::CURRENT_SLOT;
use crate::decoders::h264::dpb::MAX_DPB_SIZE;
use crate::decoders::h264::nalu::Nalu;
use crate::decoders::h264::nalu::NaluHeaderExtension;
use crate::decoders::h264::nalu::NaluType;
use crate::decoders::h264::parser::Parser;
use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::Profile;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::parser::Sps;
use crate::decoders::h264::picture::DpbEntry;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::Reference;
use crate::decoders::h264::picture::FRAME;
use crate::decoders::h264::scaling;
use crate::decoders::h264::scaling::ScalingMatrices;
use crate::decoders::h264::sei::SeiMessage;
use crate::decoders::ConfigError;
use crate::decoders::Error;
use crate::decoders::Result;

/// B slices in a baseline profile stream are dropped below this threshold.
const BASELINE_B_SLICE_SEVERITY: u32 = 60;
/// Pictures with out of range prediction weights are dropped below this
/// threshold.
const WEIGHTS_OUT_OF_RANGE_SEVERITY: u32 = 30;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    /// How tolerant the decoder is of non-conformant streams, from 0 (strict)
    /// to 100.
    pub error_threshold: u32,
    /// Number of frame buffers of the DPB, instead of the one the SPS asks
    /// for.
    pub max_dpb_size_override: Option<u32>,
    /// Display the frames inserted for gaps in frame_num and the pictures
    /// that were not decoded, flagged with `DisplayInfo::not_existing`.
    pub output_non_existing: bool,
}

impl DecoderConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.error_threshold > 100 {
            return Err(ConfigError::ErrorThresholdOutOfRange(
                self.error_threshold,
            ));
        }

        match self.max_dpb_size_override {
            Some(size) if size == 0 || size > MAX_DPB_SIZE as u32 => {
                Err(ConfigError::DpbSizeOutOfRange(size))
            }
            _ => Ok(()),
        }
    }
}

/// State of the picture order count and frame_num processes carried from one
/// picture to the next.
#[derive(Clone, Debug, Default)]
struct PocState {
    prev_pic_order_cnt_msb: i32,
    prev_pic_order_cnt_lsb: i32,
    prev_frame_num_offset: i32,
    prev_frame_num: u32,
    /// PrevRefFrameNum, 7.4.3.
    prev_ref_frame_num: u32,
}

/// The picture whose slices are being collected.
struct CurrentPicture {
    first_slice: SliceInfo,
    header: SliceHeader,
    slices: Vec<SliceHeader>,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    primary_pic_type: Option<u8>,
    pic_struct: Option<u8>,
    intra: bool,
    timestamp: u64,
}

/// Walks an Annex B stream, keeps the DPB of the stream up to date and tells
/// the client what to allocate, decode and display.
pub struct Decoder<C: DecoderClient> {
    client: C,
    config: DecoderConfig,
    parser: Parser,
    dpb: Dpb<C::Picture>,
    poc: PocState,

    /// The SPS of the current coded video sequence.
    active_sps: Option<Rc<Sps>>,
    /// What `init_sequence` was last called with.
    sequence_info: Option<SequenceInfo>,
    /// What `init_sequence` last returned. 0 while a sequence is rejected.
    num_client_buffers: u32,

    cur_pic: Option<CurrentPicture>,
    scaling: ScalingMatrices,
    /// The parameter sets `scaling` was resolved from.
    scaling_source: Option<(Rc<Sps>, Rc<Pps>)>,

    /// Picked up from SEI and AUD NAL units for the next picture.
    pending_pic_struct: Option<u8>,
    pending_primary_pic_type: Option<u8>,
    /// From the MVC prefix NAL unit of the next base view slice.
    pending_view_id: Option<u16>,
}

impl<C: DecoderClient> Decoder<C> {
    pub fn new(client: C, config: DecoderConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            client,
            config,
            parser: Default::default(),
            dpb: Dpb::new(),
            poc: Default::default(),
            active_sps: None,
            sequence_info: None,
            num_client_buffers: 0,
            cur_pic: None,
            scaling: ScalingMatrices::flat(),
            scaling_source: None,
            pending_pic_struct: None,
            pending_primary_pic_type: None,
            pending_view_id: None,
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn dpb(&self) -> &Dpb<C::Picture> {
        &self.dpb
    }

    /// Decodes every NAL unit found in `bitstream`, which may hold any number
    /// of them. A picture is only complete once the NAL unit that follows it
    /// is seen, so the last picture of a stream waits for `flush`.
    ///
    /// Stream errors go to `DecoderClient::report_error` and never stop the
    /// decoder.
    pub fn decode(&mut self, timestamp: u64, bitstream: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(bitstream);

        loop {
            match Nalu::next(&mut cursor, bitstream) {
                Ok(Some(nalu)) => self.handle_nalu(timestamp, nalu),
                Ok(None) => break,
                Err(e) => self.report(Error::MalformedSyntax(e.context("Invalid NAL unit"))),
            }
        }

        Ok(())
    }

    /// Finishes the current picture and outputs every picture of the DPB.
    /// The decoder is then ready for a new stream. Parameter sets are kept.
    pub fn flush(&mut self) -> Result<()> {
        self.end_of_stream();
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.finish_picture();
        self.drain_dpb();
        self.dpb.clear();
        self.dpb.set_max_dpb_size(0);

        self.poc = Default::default();
        self.pending_pic_struct = None;
        self.pending_primary_pic_type = None;
        self.pending_view_id = None;

        debug!("Decoder flushed");
    }

    fn report(&mut self, error: Error) {
        warn!("{}", error);
        self.client.report_error(&error);
    }

    fn handle_nalu(&mut self, timestamp: u64, nalu: Nalu<&[u8]>) {
        debug!(
            "Processing NALU {:?}, length is {}",
            nalu.header().nalu_type(),
            nalu.size()
        );

        let nalu_type = *nalu.header().nalu_type();
        match nalu_type {
            NaluType::Slice | NaluType::SliceIdr | NaluType::SliceDpa => {
                self.handle_slice(timestamp, nalu)
            }
            NaluType::SliceDpb | NaluType::SliceDpc => {
                debug!("Skipping data partition without a slice header")
            }
            NaluType::Sps => match self.parser.parse_sps(&nalu) {
                Ok(sps) => {
                    if !self.client.update_picture_parameters(ParameterSet::Sps(&sps)) {
                        warn!("Client refused SPS {}", sps.seq_parameter_set_id);
                    }
                }
                Err(e) => self.report(Error::MalformedSyntax(e.context("Invalid SPS"))),
            },
            NaluType::Pps => match self.parser.parse_pps(&nalu) {
                Ok(pps) => {
                    if !self.client.update_picture_parameters(ParameterSet::Pps(&pps)) {
                        warn!("Client refused PPS {}", pps.pic_parameter_set_id);
                    }
                }
                Err(e) => self.report(Error::MalformedSyntax(e.context("Invalid PPS"))),
            },
            NaluType::Sei => self.handle_sei(&nalu),
            NaluType::AuDelimiter => {
                self.finish_picture();
                match Parser::parse_aud(&nalu) {
                    Ok(aud) => self.pending_primary_pic_type = Some(aud.primary_pic_type),
                    Err(e) => self.report(Error::MalformedSyntax(e.context("Invalid AUD"))),
                }
            }
            NaluType::SeqEnd | NaluType::StreamEnd => self.end_of_stream(),
            NaluType::PrefixUnit => {
                if let Some(NaluHeaderExtension::Mvc(mvc)) = nalu.header().extension() {
                    self.pending_view_id = Some(mvc.view_id);
                }
                self.client.unhandled_nalu(nalu.as_ref());
            }
            _ => {
                debug!("Passing unhandled NALU to the client");
                self.client.unhandled_nalu(nalu.as_ref());
            }
        }

        // A prefix NAL unit only applies to the NAL unit right after it.
        if !matches!(nalu_type, NaluType::PrefixUnit) {
            self.pending_view_id = None;
        }
    }

    fn handle_sei(&mut self, nalu: &Nalu<&[u8]>) {
        let messages = match self.parser.parse_sei(nalu, self.active_sps.as_deref()) {
            Ok(messages) => messages,
            Err(e) => {
                self.report(Error::MalformedSyntax(e.context("Invalid SEI")));
                return;
            }
        };

        for message in messages {
            if let SeiMessage::PicTiming(timing) = message {
                self.pending_pic_struct = timing.pic_struct;
            }
        }
    }

    fn handle_slice(&mut self, timestamp: u64, nalu: Nalu<&[u8]>) {
        let slice = match self.parser.parse_slice_header(nalu) {
            Ok(slice) => slice,
            Err(e) => {
                self.report(Error::MalformedSyntax(e.context("Invalid slice header")));
                return;
            }
        };

        let hdr = &slice.header;
        if hdr.redundant_pic_cnt != 0 {
            debug!("Ignoring redundant slice");
            return;
        }

        let intra = hdr.slice_type.is_i() || hdr.slice_type.is_si();
        if slice.sps.max_num_ref_frames == 0 && !intra {
            self.report(Error::NonConformantStream(format!(
                "{:?} slice without reference frames",
                hdr.slice_type
            )));
            return;
        }

        if hdr.slice_type.is_b() && slice.sps.profile_idc == Profile::Baseline as u8 {
            let error = Error::NonConformantStream("B slice in a baseline stream".into());
            if self.config.error_threshold < BASELINE_B_SLICE_SEVERITY {
                self.report(error);
                return;
            }
            warn!("{}", error);
        }

        let info = SliceInfo::new(hdr, &slice.sps);
        let first_slice = self.cur_pic.as_ref().map(|pic| &pic.first_slice);
        if is_picture_boundary(first_slice, &info) {
            self.finish_picture();
            self.start_picture(timestamp, slice.header, slice.sps, slice.pps, info);
        } else if let Some(pic) = self.cur_pic.as_mut() {
            pic.intra &= intra;
            pic.slices.push(slice.header);
        }
    }

    /// Whether the picture of `hdr` starts a new coded video sequence.
    fn is_new_sequence(&self, hdr: &SliceHeader, sps: &Sps) -> bool {
        let active = match &self.active_sps {
            Some(active) => active,
            None => return true,
        };

        hdr.idr_pic_flag
            || self.dpb.max_dpb_size() == 0
            || active.pic_width_in_mbs_minus1 != sps.pic_width_in_mbs_minus1
            || active.pic_height_in_map_units_minus1 != sps.pic_height_in_map_units_minus1
            || active.log2_max_frame_num_minus4 != sps.log2_max_frame_num_minus4
    }

    fn start_sequence(&mut self, hdr: &SliceHeader, sps: &Rc<Sps>) {
        self.poc.prev_ref_frame_num = 0;
        if !hdr.dec_ref_pic_marking.no_output_of_prior_pics_flag {
            self.drain_dpb();
        }

        self.active_sps = Some(Rc::clone(sps));

        let max_dpb_size = match self.config.max_dpb_size_override {
            Some(size) => size,
            None => sps.max_dpb_frames.max(1),
        };

        let info = sequence_info(sps, max_dpb_size);
        if self.sequence_info.as_ref() != Some(&info) {
            debug!("New sequence: {:?}", info);
            self.num_client_buffers = self.client.init_sequence(&info);
            self.sequence_info = Some(info);

            if self.num_client_buffers == 0 {
                self.report(Error::SequenceRejected);
            }
        }

        let max_dpb_size = self.num_client_buffers.min(max_dpb_size);
        self.dpb.set_max_dpb_size(max_dpb_size as usize);
    }

    fn start_picture(
        &mut self,
        timestamp: u64,
        hdr: SliceHeader,
        sps: Rc<Sps>,
        pps: Rc<Pps>,
        first_slice: SliceInfo,
    ) {
        if self.is_new_sequence(&hdr, &sps) {
            self.start_sequence(&hdr, &sps);
        }

        if self.num_client_buffers == 0 {
            debug!("Dropping picture of a rejected sequence");
            return;
        }

        self.handle_frame_num_gap(&hdr, &sps, timestamp);

        if self.dpb.is_comp_field_pair(&hdr) {
            self.dpb.current_mut().complementary_field_pair = true;
        } else {
            if let Some(output) = self.dpb.init_scratch() {
                self.output_picture(output);
            }

            let picture = self.client.alloc_picture_buffer();
            if picture.is_none() {
                self.report(Error::AllocationFailure);
            }

            let cur = self.dpb.current_mut();
            cur.reference_picture = hdr.nal_ref_idc != 0;
            cur.frame_num = u32::from(hdr.frame_num);
            cur.timestamp = timestamp;
            cur.pic_struct = self.pending_pic_struct;
            cur.view_id = self.pending_view_id.unwrap_or(0);
            cur.sps = Some(Rc::clone(&sps));
            cur.pps = Some(Rc::clone(&pps));
            cur.picture = picture;
        }

        self.compute_pic_order_count(&hdr, &sps);

        let field = Field::from_header(&hdr);
        let cur = self.dpb.current_mut();
        cur.pic_order_cnt = if field == Field::Frame || cur.complementary_field_pair {
            cur.top_field_order_cnt.min(cur.bottom_field_order_cnt)
        } else if field == Field::Top {
            cur.top_field_order_cnt
        } else {
            cur.bottom_field_order_cnt
        };

        self.dpb
            .update_pic_nums(u32::from(hdr.frame_num), field, sps.max_frame_num);

        let same_source = self
            .scaling_source
            .as_ref()
            .map_or(false, |(s, p)| Rc::ptr_eq(s, &sps) && Rc::ptr_eq(p, &pps));
        if !same_source {
            self.scaling = scaling::resolve_pps(&sps, &pps);
            self.scaling_source = Some((Rc::clone(&sps), Rc::clone(&pps)));
        }

        debug!(
            "Starting picture: frame_num {}, {:?}, POC {}",
            hdr.frame_num,
            field,
            self.dpb.current().pic_order_cnt
        );

        self.cur_pic = Some(CurrentPicture {
            first_slice,
            slices: vec![hdr.clone()],
            intra: hdr.slice_type.is_i() || hdr.slice_type.is_si(),
            header: hdr,
            sps,
            pps,
            primary_pic_type: self.pending_primary_pic_type.take(),
            pic_struct: self.pending_pic_struct.take(),
            timestamp,
        });
    }

    /// Hands the picture to the client and updates the DPB with it.
    fn finish_picture(&mut self) {
        let pic = match self.cur_pic.take() {
            Some(pic) => pic,
            None => return,
        };

        let hdr = &pic.header;
        if pic.pps.num_slice_groups_minus1 > 0 {
            warn!("Slice groups are not supported, dropping picture");
            self.dpb.current_mut().not_existing = true;
        }

        let num_out_of_range: u32 = pic
            .slices
            .iter()
            .map(|s| s.pred_weight_table.num_out_of_range)
            .sum();
        if pic.pps.weighted_pred_flag && num_out_of_range > 0 && !pic.intra {
            let error = Error::NonConformantStream(format!(
                "{} prediction weights out of range",
                num_out_of_range
            ));
            if self.config.error_threshold < WEIGHTS_OUT_OF_RANGE_SEVERITY {
                self.report(error);
                self.dpb.current_mut().not_existing = true;
            } else {
                warn!("{}", error);
            }
        }

        if !self.dpb.current().not_existing {
            let field = Field::from_header(hdr);
            let cur = self.dpb.current();
            let second_field = field != Field::Frame && cur.complementary_field_pair;

            let mut top_field_first = match field {
                Field::Frame => cur.top_field_order_cnt < cur.bottom_field_order_cnt,
                _ => second_field == hdr.bottom_field_flag,
            };
            let mut progressive_frame =
                field == Field::Frame && cur.top_field_order_cnt == cur.bottom_field_order_cnt;

            // Some encoders flag every MBAFF frame as progressive through
            // equal field POCs.
            if !pic.sps.frame_mbs_only_flag
                && pic.sps.mb_adaptive_frame_field_flag
                && pic.sps.pic_order_cnt_type == 0
                && !pic.pps.bottom_field_pic_order_in_frame_present_flag
                && progressive_frame
            {
                progressive_frame = false;
                top_field_first = true;
            }

            let mut repeat_first_field = 0;
            if field == Field::Frame {
                match pic.pic_struct {
                    Some(pic_struct @ 3..=6) => {
                        top_field_first = pic_struct & 1 == 1;
                        if pic_struct >= 5 {
                            repeat_first_field = 1;
                        }
                    }
                    Some(7) => repeat_first_field = 2,
                    Some(8) => repeat_first_field = 4,
                    _ => (),
                }
            }

            let info = PictureInfo {
                sps: &pic.sps,
                pps: &pic.pps,
                slices: &pic.slices,
                scaling: &self.scaling,
                picture: cur.picture.as_ref(),
                dpb_index: self.dpb.cur_index(),
                field,
                second_field,
                top_field_first,
                progressive_frame,
                repeat_first_field,
                reference: hdr.nal_ref_idc != 0,
                idr: hdr.idr_pic_flag,
                intra: pic.intra,
                frame_num: u32::from(hdr.frame_num),
                top_field_order_cnt: cur.top_field_order_cnt,
                bottom_field_order_cnt: cur.bottom_field_order_cnt,
                pic_order_cnt: cur.pic_order_cnt,
                primary_pic_type: pic.primary_pic_type,
                timestamp: pic.timestamp,
                dpb: self.dpb.entries(),
            };

            if !self.client.begin_picture(&info) {
                warn!("Client failed to decode picture {}", info.frame_num);
            }
        }

        self.end_picture(hdr, &pic.sps);
    }

    /// Reference marking, storage and output of the current picture, see
    /// 8.2.5 and C.4.
    fn end_picture(&mut self, hdr: &SliceHeader, sps: &Sps) {
        let field = Field::from_header(hdr);
        let marking = &hdr.dec_ref_pic_marking;
        let has_mmco_5 = marking.has_mmco_5();

        if hdr.nal_ref_idc != 0 {
            if hdr.idr_pic_flag {
                self.dpb.mark_idr(field, marking.long_term_reference_flag);
            } else if marking.adaptive_ref_pic_marking_mode_flag {
                self.dpb.adaptive_marking(
                    marking,
                    u32::from(hdr.frame_num),
                    field,
                    sps.max_num_ref_frames,
                    sps.gaps_in_frame_num_value_allowed_flag,
                );
            } else {
                self.dpb.sliding_window_marking(
                    sps.max_num_ref_frames,
                    sps.gaps_in_frame_num_value_allowed_flag,
                );
            }

            if !hdr.idr_pic_flag {
                self.dpb.mark_current_as_short_term(field);
            }
        }

        if hdr.idr_pic_flag && marking.no_output_of_prior_pics_flag {
            debug!("Discarding prior pictures without output");
            for i in 0..MAX_DPB_SIZE {
                self.dpb.entry_mut(i).release();
            }
        }

        self.dpb.remove_unused();

        if (hdr.idr_pic_flag && !marking.no_output_of_prior_pics_flag) || has_mmco_5 {
            while !self.dpb.is_empty() {
                self.bump();
            }
        }

        if hdr.nal_ref_idc != 0 {
            if self.dpb.current().is_empty() {
                while self.dpb.is_full() {
                    self.bump();
                }
                if !self.dpb.store_current() {
                    self.report(Error::ResourceExhaustion);
                }
            }
            self.dpb.current_mut().store_fields(field);
        } else if !self.dpb.current().is_empty() {
            // Second field of a non-reference field pair.
            if self.dpb.cur_index() == CURRENT_SLOT {
                let output = self.dpb.output_entry(CURRENT_SLOT, FRAME);
                self.output_picture(output);
                self.dpb.current_mut().release();
            } else {
                let cur = self.dpb.current_mut();
                cur.state = FRAME;
                cur.top_needed_for_output = true;
                cur.bottom_needed_for_output = true;
            }
        } else {
            self.store_non_reference(field);
        }

        let max_num_reorder_frames = sps.vui_parameters.max_num_reorder_frames as usize;
        if max_num_reorder_frames < MAX_DPB_SIZE {
            while self.dpb.reordering_delay() > max_num_reorder_frames {
                match self.dpb.display_bump() {
                    Some(output) => self.output_picture(output),
                    None => break,
                }
            }
            self.dpb.remove_unused();
        }
    }

    /// C.4.5.2: a non-reference picture only enters a full DPB if something
    /// in it must be output first.
    fn store_non_reference(&mut self, field: Field) {
        while self.dpb.is_full() {
            let poc = self.dpb.current().pic_order_cnt;
            let output_first = self.dpb.entries().iter().any(|e| {
                (e.has_top() && e.top_needed_for_output && e.top_field_order_cnt <= poc)
                    || (e.has_bottom()
                        && e.bottom_needed_for_output
                        && e.bottom_field_order_cnt <= poc)
            });

            if !output_first {
                if field == Field::Frame {
                    let output = self.dpb.output_entry(self.dpb.cur_index(), FRAME);
                    self.output_picture(output);
                    let cur = self.dpb.current_mut();
                    cur.set_reference(Reference::Unused);
                    cur.release();
                } else {
                    // Waits in the scratch slot for its second field.
                    self.dpb.current_mut().store_fields(field);
                }
                return;
            }

            self.bump();
        }

        if !self.dpb.store_current() {
            self.report(Error::ResourceExhaustion);
        }
        self.dpb.current_mut().store_fields(field);
    }

    /// The decoding process for gaps in frame_num, 8.2.5.2.
    fn handle_frame_num_gap(&mut self, hdr: &SliceHeader, sps: &Sps, timestamp: u64) {
        let max_frame_num = sps.max_frame_num;
        let frame_num = u32::from(hdr.frame_num);

        if hdr.idr_pic_flag {
            self.poc.prev_ref_frame_num = 0;
        }

        if frame_num != self.poc.prev_ref_frame_num {
            let mut unused_frame_num = (self.poc.prev_ref_frame_num + 1) % max_frame_num;
            while unused_frame_num != frame_num {
                // Streams cut by some editing tools only keep the low 8 bits
                // of frame_num in their references.
                let mangled = (0..MAX_DPB_SIZE).find(|&i| {
                    let entry = self.dpb.entry(i);
                    !entry.is_empty()
                        && !entry.not_existing
                        && (entry.frame_num & 0xff) == (unused_frame_num & 0xff)
                });

                if let Some(slot) = mangled {
                    debug!(
                        "Renumbering slot {} to frame_num {}",
                        slot, unused_frame_num
                    );
                    self.dpb.set_cur_index(slot);
                    self.dpb.current_mut().frame_num = unused_frame_num;
                    self.dpb
                        .update_pic_nums(unused_frame_num, Field::Frame, max_frame_num);
                } else if sps.gaps_in_frame_num_value_allowed_flag || sps.max_num_ref_frames > 1 {
                    self.insert_non_existing_frame(unused_frame_num, sps, timestamp);
                }

                self.poc.prev_ref_frame_num = unused_frame_num;
                unused_frame_num = (unused_frame_num + 1) % max_frame_num;
            }
        }

        if hdr.dec_ref_pic_marking.has_mmco_5() {
            self.poc.prev_ref_frame_num = 0;
        } else if hdr.nal_ref_idc != 0
            || frame_num == (self.poc.prev_ref_frame_num + 1) % max_frame_num
        {
            self.poc.prev_ref_frame_num = frame_num;
        }
    }

    fn insert_non_existing_frame(&mut self, frame_num: u32, sps: &Sps, timestamp: u64) {
        debug!("Inserting non-existing frame {}", frame_num);

        while self.dpb.is_full() {
            self.bump();
        }

        let slot = match self.dpb.find_free_slot() {
            Some(slot) => slot,
            None => {
                self.report(Error::ResourceExhaustion);
                return;
            }
        };

        self.dpb.set_cur_index(slot);
        *self.dpb.current_mut() = DpbEntry {
            frame_num,
            timestamp,
            ..Default::default()
        };

        // The POC of type 0 depends on syntax the frame does not have.
        if sps.pic_order_cnt_type != 0 {
            let hdr = SliceHeader {
                nal_ref_idc: 1,
                frame_num: frame_num as u16,
                ..Default::default()
            };
            self.compute_pic_order_count(&hdr, sps);
            let cur = self.dpb.current_mut();
            cur.pic_order_cnt = cur.top_field_order_cnt.min(cur.bottom_field_order_cnt);
        }

        self.dpb
            .update_pic_nums(frame_num, Field::Frame, sps.max_frame_num);
        self.dpb.sliding_window_marking(
            sps.max_num_ref_frames,
            sps.gaps_in_frame_num_value_allowed_flag,
        );

        let picture = if self.config.output_non_existing && sps.pic_order_cnt_type != 0 {
            self.client.alloc_picture_buffer()
        } else {
            None
        };

        let cur = self.dpb.current_mut();
        cur.set_reference(Reference::ShortTerm);
        cur.reference_picture = true;
        cur.not_existing = true;
        cur.state = FRAME;
        cur.top_needed_for_output = picture.is_some();
        cur.bottom_needed_for_output = picture.is_some();
        cur.picture = picture;

        self.dpb.remove_unused();
    }

    /// Writes TopFieldOrderCnt and BottomFieldOrderCnt of the current entry,
    /// 8.2.1.
    fn compute_pic_order_count(&mut self, hdr: &SliceHeader, sps: &Sps) {
        match sps.pic_order_cnt_type {
            0 => self.compute_pic_order_count_type_0(hdr, sps),
            1 => self.compute_pic_order_count_type_1(hdr, sps),
            _ => self.compute_pic_order_count_type_2(hdr, sps),
        }
    }

    fn compute_pic_order_count_type_0(&mut self, hdr: &SliceHeader, sps: &Sps) {
        if hdr.idr_pic_flag {
            self.poc.prev_pic_order_cnt_msb = 0;
            self.poc.prev_pic_order_cnt_lsb = 0;
        }

        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();
        let lsb = i32::from(hdr.pic_order_cnt_lsb);
        let prev_lsb = self.poc.prev_pic_order_cnt_lsb;
        let prev_msb = self.poc.prev_pic_order_cnt_msb;

        // (8-3)
        let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_pic_order_cnt_lsb / 2 {
            prev_msb.wrapping_add(max_pic_order_cnt_lsb)
        } else if lsb > prev_lsb && lsb - prev_lsb > max_pic_order_cnt_lsb / 2 {
            prev_msb.wrapping_sub(max_pic_order_cnt_lsb)
        } else {
            prev_msb
        };

        let cur = self.dpb.current_mut();
        match Field::from_header(hdr) {
            // (8-4), (8-5)
            Field::Frame => {
                cur.top_field_order_cnt = msb.wrapping_add(lsb);
                cur.bottom_field_order_cnt = cur
                    .top_field_order_cnt
                    .wrapping_add(hdr.delta_pic_order_cnt_bottom);
            }
            Field::Top => cur.top_field_order_cnt = msb.wrapping_add(lsb),
            Field::Bottom => cur.bottom_field_order_cnt = msb.wrapping_add(lsb),
        }

        if hdr.dec_ref_pic_marking.has_mmco_5() {
            self.poc.prev_pic_order_cnt_msb = 0;
            // The picture becomes POC 0 once the MMCO runs. Only the top field
            // of a frame can be left above it.
            self.poc.prev_pic_order_cnt_lsb = if hdr.is_field() {
                0
            } else {
                let temp = cur.top_field_order_cnt.min(cur.bottom_field_order_cnt);
                cur.top_field_order_cnt.wrapping_sub(temp)
            };
        } else if hdr.nal_ref_idc != 0 {
            self.poc.prev_pic_order_cnt_msb = msb;
            self.poc.prev_pic_order_cnt_lsb = lsb;
        }
    }

    /// FrameNumOffset, (8-6) and (8-11).
    fn frame_num_offset(&self, hdr: &SliceHeader, sps: &Sps) -> i32 {
        if hdr.idr_pic_flag {
            0
        } else if self.poc.prev_frame_num > u32::from(hdr.frame_num) {
            self.poc
                .prev_frame_num_offset
                .wrapping_add(sps.max_frame_num as i32)
        } else {
            self.poc.prev_frame_num_offset
        }
    }

    fn update_frame_num_state(&mut self, hdr: &SliceHeader, frame_num_offset: i32) {
        if hdr.dec_ref_pic_marking.has_mmco_5() {
            self.poc.prev_frame_num_offset = 0;
            self.poc.prev_frame_num = 0;
        } else {
            self.poc.prev_frame_num_offset = frame_num_offset;
            self.poc.prev_frame_num = u32::from(hdr.frame_num);
        }
    }

    fn compute_pic_order_count_type_1(&mut self, hdr: &SliceHeader, sps: &Sps) {
        let frame_num_offset = self.frame_num_offset(hdr, sps);
        let cycle_len = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

        // (8-7)
        let mut abs_frame_num = if cycle_len > 0 {
            frame_num_offset.wrapping_add(i32::from(hdr.frame_num))
        } else {
            0
        };
        if hdr.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        // (8-8), (8-10)
        let mut expected_pic_order_cnt: i32 = 0;
        if abs_frame_num > 0 {
            let cycle_cnt = (abs_frame_num - 1) / cycle_len;
            let frame_num_in_cycle = (abs_frame_num - 1) % cycle_len;

            expected_pic_order_cnt =
                cycle_cnt.wrapping_mul(sps.expected_delta_per_pic_order_cnt_cycle);
            for offset in sps
                .offset_for_ref_frame
                .iter()
                .take(frame_num_in_cycle as usize + 1)
            {
                expected_pic_order_cnt = expected_pic_order_cnt.wrapping_add(*offset);
            }
        }

        if hdr.nal_ref_idc == 0 {
            expected_pic_order_cnt =
                expected_pic_order_cnt.wrapping_add(sps.offset_for_non_ref_pic);
        }

        // (8-9)
        let top = expected_pic_order_cnt.wrapping_add(hdr.delta_pic_order_cnt[0]);
        let cur = self.dpb.current_mut();
        match Field::from_header(hdr) {
            Field::Frame => {
                cur.top_field_order_cnt = top;
                cur.bottom_field_order_cnt = top
                    .wrapping_add(sps.offset_for_top_to_bottom_field)
                    .wrapping_add(hdr.delta_pic_order_cnt[1]);
            }
            Field::Top => cur.top_field_order_cnt = top,
            Field::Bottom => {
                cur.bottom_field_order_cnt = expected_pic_order_cnt
                    .wrapping_add(sps.offset_for_top_to_bottom_field)
                    .wrapping_add(hdr.delta_pic_order_cnt[0]);
            }
        }

        self.update_frame_num_state(hdr, frame_num_offset);
    }

    fn compute_pic_order_count_type_2(&mut self, hdr: &SliceHeader, sps: &Sps) {
        let frame_num_offset = self.frame_num_offset(hdr, sps);

        // (8-12)
        let temp_pic_order_cnt = if hdr.idr_pic_flag {
            0
        } else {
            let doubled = frame_num_offset
                .wrapping_add(i32::from(hdr.frame_num))
                .wrapping_mul(2);
            if hdr.nal_ref_idc == 0 {
                doubled - 1
            } else {
                doubled
            }
        };

        // (8-13)
        let cur = self.dpb.current_mut();
        match Field::from_header(hdr) {
            Field::Frame => {
                cur.top_field_order_cnt = temp_pic_order_cnt;
                cur.bottom_field_order_cnt = temp_pic_order_cnt;
            }
            Field::Top => cur.top_field_order_cnt = temp_pic_order_cnt,
            Field::Bottom => cur.bottom_field_order_cnt = temp_pic_order_cnt,
        }

        self.update_frame_num_state(hdr, frame_num_offset);
    }

    fn bump(&mut self) {
        if let Some(output) = self.dpb.bump(MAX_DPB_SIZE) {
            self.output_picture(output);
        }
    }

    fn drain_dpb(&mut self) {
        for output in self.dpb.flush() {
            self.output_picture(output);
        }
    }

    fn output_picture(&mut self, output: OutputPicture<C::Picture>) {
        if output.not_existing && !self.config.output_non_existing {
            return;
        }

        let picture = match &output.picture {
            Some(picture) => picture,
            None => {
                debug!("No buffer to display POC {}", output.pic_order_cnt);
                return;
            }
        };

        let info = DisplayInfo {
            pic_order_cnt: output.pic_order_cnt,
            timestamp: output.timestamp,
            field: output.field,
            pic_struct: output.pic_struct,
            not_existing: output.not_existing,
        };

        debug!("Displaying {:?}", info);
        self.client.display_picture(picture, &info);
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Reduces `num/den`, mapping any zero to 0/0.
fn reduce(num: u64, den: u64) -> (u32, u32) {
    if num == 0 || den == 0 {
        return (0, 0);
    }

    let (mut num, mut den) = (num, den);
    while num > u64::from(u32::MAX) || den > u64::from(u32::MAX) {
        num >>= 1;
        den >>= 1;
    }

    let (num, den) = (num.max(1) as u32, den.max(1) as u32);
    let divisor = gcd(num, den);
    (num / divisor, den / divisor)
}

/// The stream properties announced to the client for `sps`.
fn sequence_info(sps: &Sps, max_dpb_size: u32) -> SequenceInfo {
    let vui = &sps.vui_parameters;
    let visible = sps.visible_rectangle();
    let display_width = visible.max.x - visible.min.x;
    let display_height = visible.max.y - visible.min.y;

    let (sar_width, sar_height) = vui.sample_aspect_ratio().unwrap_or((1, 1));
    let display_aspect_ratio = reduce(
        u64::from(sar_width) * u64::from(display_width),
        u64::from(sar_height) * u64::from(display_height),
    );

    let frame_rate = if vui.timing_info_present_flag
        && vui.num_units_in_tick > 0
        && vui.time_scale > vui.num_units_in_tick
    {
        // Two ticks per frame, E.2.1.
        Some(reduce(
            (u64::from(vui.time_scale) + 1) >> 1,
            u64::from(vui.num_units_in_tick),
        ))
    } else {
        None
    };

    let video_signal = VideoSignalInfo {
        video_format: vui.video_format,
        video_full_range_flag: vui.video_full_range_flag,
        colour_primaries: vui.colour_primaries,
        transfer_characteristics: vui.transfer_characteristics,
        matrix_coefficients: vui.matrix_coefficients,
    };

    let bit_rate = if vui.nal_hrd_parameters_present_flag {
        vui.nal_hrd_parameters.bit_rate(0)
    } else {
        0
    };

    let max_dpb = MAX_DPB_SIZE as u32;
    SequenceInfo {
        coded_width: sps.width,
        coded_height: sps.height,
        display_width,
        display_height,
        chroma_format_idc: sps.chroma_format_idc,
        bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
        progressive: sps.frame_mbs_only_flag,
        frame_rate,
        display_aspect_ratio,
        video_signal,
        bit_rate,
        min_num_decode_surfaces: vui
            .max_dec_frame_buffering
            .max(sps.max_num_ref_frames)
            .min(max_dpb)
            + 1,
        min_num_dpb_slots: (max_dpb_size + 1).min(max_dpb + 1),
        profile_idc: sps.profile_idc,
        level_idc: sps.level_idc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::test_utils::*;

    #[derive(Default)]
    struct TestClient {
        /// What `init_sequence` returns.
        num_buffers: u32,
        fail_allocations: bool,
        sequences: Vec<SequenceInfo>,
        buffers: Vec<Rc<u32>>,
        decoded: Vec<(i32, bool)>,
        displayed: Vec<(u32, DisplayInfo)>,
        errors: Vec<String>,
        num_parameter_sets: usize,
        num_unhandled: usize,
    }

    impl DecoderClient for TestClient {
        type Picture = Rc<u32>;

        fn init_sequence(&mut self, info: &SequenceInfo) -> u32 {
            self.sequences.push(info.clone());
            self.num_buffers
        }

        fn alloc_picture_buffer(&mut self) -> Option<Self::Picture> {
            if self.fail_allocations {
                return None;
            }
            let buffer = Rc::new(self.buffers.len() as u32);
            self.buffers.push(Rc::clone(&buffer));
            Some(buffer)
        }

        fn display_picture(&mut self, picture: &Self::Picture, info: &DisplayInfo) {
            self.displayed.push((**picture, info.clone()));
        }

        fn update_picture_parameters(&mut self, _set: ParameterSet<'_>) -> bool {
            self.num_parameter_sets += 1;
            true
        }

        fn begin_picture(&mut self, info: &PictureInfo<'_, Self::Picture>) -> bool {
            assert_eq!(info.slices.len(), 1);
            self.decoded.push((info.pic_order_cnt, info.second_field));
            true
        }

        fn unhandled_nalu(&mut self, _nalu: &[u8]) {
            self.num_unhandled += 1;
        }

        fn report_error(&mut self, error: &Error) {
            self.errors.push(error.to_string());
        }
    }

    impl TestClient {
        fn with_buffers(num_buffers: u32) -> Self {
            Self {
                num_buffers,
                ..Default::default()
            }
        }

        fn displayed_pocs(&self) -> Vec<i32> {
            self.displayed.iter().map(|(_, d)| d.pic_order_cnt).collect()
        }
    }

    fn stream(sps: &SpsParams, pps: &PpsParams, slices: &[SliceParams]) -> Vec<u8> {
        let mut out = headers(sps, pps);
        for slice in slices {
            out.extend(slice_nalu(slice, sps, pps));
        }
        out
    }

    fn decoder(client: TestClient, config: DecoderConfig) -> Decoder<TestClient> {
        Decoder::new(client, config).unwrap()
    }

    fn p(frame_num: u32, pic_order_cnt_lsb: u32) -> SliceParams {
        SliceParams {
            frame_num,
            pic_order_cnt_lsb,
            ..SliceParams::p()
        }
    }

    fn b(frame_num: u32, pic_order_cnt_lsb: u32) -> SliceParams {
        SliceParams {
            frame_num,
            pic_order_cnt_lsb,
            ..SliceParams::b()
        }
    }

    fn assert_slots_conserved(decoder: &Decoder<TestClient>) {
        assert_eq!(decoder.dpb().fullness() + decoder.dpb().num_free(), MAX_DPB_SIZE);
    }

    #[test]
    fn config_validation() {
        let config = DecoderConfig {
            error_threshold: 101,
            ..Default::default()
        };
        assert!(matches!(
            Decoder::new(TestClient::default(), config),
            Err(Error::Config(ConfigError::ErrorThresholdOutOfRange(101)))
        ));

        let config = DecoderConfig {
            max_dpb_size_override: Some(17),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DpbSizeOutOfRange(17))
        );

        assert_eq!(DecoderConfig::default().validate(), Ok(()));
    }

    #[test]
    fn decode_ipb() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 2), b(2, 4)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        assert_slots_conserved(&decoder);
        decoder.flush().unwrap();

        let client = decoder.client();
        assert_eq!(client.num_parameter_sets, 2);
        assert_eq!(client.sequences.len(), 1);
        assert_eq!(client.sequences[0].coded_width, 320);
        assert_eq!(client.sequences[0].coded_height, 240);
        assert_eq!(client.sequences[0].min_num_dpb_slots, 17);
        assert_eq!(client.decoded, vec![(0, false), (2, false), (4, false)]);
        assert_eq!(client.displayed_pocs(), vec![0, 2, 4]);
        assert!(client.errors.is_empty());

        let buffers: Vec<u32> = client.displayed.iter().map(|(b, _)| *b).collect();
        assert_eq!(buffers, vec![0, 1, 2]);

        // The DPB let go of every buffer.
        assert!(decoder.dpb().is_empty());
        assert!(client.buffers.iter().all(|b| Rc::strong_count(b) == 1));
    }

    #[test]
    fn output_follows_poc_order() {
        let sps = SpsParams {
            max_num_ref_frames: 2,
            ..Default::default()
        };
        let pps = PpsParams::default();
        // I0 P4 B2, the B frame is displayed before the P frame it follows.
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 4), b(2, 2)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2, 4]);
        assert!(decoder.client().errors.is_empty());
    }

    #[test]
    fn stream_end_flushes() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let mut bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 2)]);
        bitstream.extend(nalu_bytes(0, NaluType::StreamEnd, &[]));

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();

        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2]);
        assert!(decoder.dpb().is_empty());
    }

    #[test]
    fn poc_type_1() {
        let sps = SpsParams {
            pic_order_cnt_type: 1,
            delta_pic_order_always_zero_flag: true,
            offset_for_non_ref_pic: -1,
            offset_for_ref_frame: vec![2],
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 0), b(2, 0)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        let client = decoder.client();
        let decoded: Vec<i32> = client.decoded.iter().map(|(poc, _)| *poc).collect();
        assert_eq!(decoded, vec![0, 2, 1]);
        assert_eq!(client.displayed_pocs(), vec![0, 1, 2]);
    }

    #[test]
    fn poc_type_2_outputs_in_decoding_order() {
        let sps = SpsParams {
            pic_order_cnt_type: 2,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 0), p(2, 0)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();

        // No reordering is possible, so frames leave as soon as they are
        // complete.
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2]);

        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2, 4]);
    }

    #[test]
    fn reorder_cap() {
        let sps = SpsParams {
            max_num_ref_frames: 2,
            vui: Some(VuiRestriction {
                max_num_reorder_frames: 1,
                max_dec_frame_buffering: 2,
            }),
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(
            &sps,
            &pps,
            &[SliceParams::idr(), p(1, 4), b(2, 2), p(2, 8), b(3, 6)],
        );

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        assert_slots_conserved(&decoder);

        // At most one complete frame waits after each picture.
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2, 4]);
        assert_eq!(decoder.dpb().reordering_delay(), 1);

        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn frame_num_gap() {
        let sps = SpsParams {
            pic_order_cnt_type: 2,
            max_num_ref_frames: 2,
            gaps_in_frame_num_value_allowed_flag: true,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(3, 0)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        assert_slots_conserved(&decoder);

        let not_existing: Vec<u32> = decoder
            .dpb()
            .entries()
            .iter()
            .filter(|e| e.not_existing)
            .map(|e| e.frame_num)
            .collect();
        assert_eq!(not_existing.len(), 2);
        assert!(not_existing.contains(&1) && not_existing.contains(&2));

        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 6]);
        assert!(decoder.client().errors.is_empty());
    }

    #[test]
    fn frame_num_gap_output() {
        let sps = SpsParams {
            pic_order_cnt_type: 2,
            max_num_ref_frames: 2,
            gaps_in_frame_num_value_allowed_flag: true,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(3, 0)]);

        let config = DecoderConfig {
            output_non_existing: true,
            ..Default::default()
        };
        let mut decoder = decoder(TestClient::with_buffers(17), config);
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        let client = decoder.client();
        assert_eq!(client.displayed_pocs(), vec![0, 2, 4, 6]);
        let flags: Vec<bool> = client.displayed.iter().map(|(_, d)| d.not_existing).collect();
        assert_eq!(flags, vec![false, true, true, false]);
    }

    #[test]
    fn baseline_b_slice() {
        let sps = SpsParams {
            profile_idc: 66,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), b(1, 2)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0]);
        assert_eq!(decoder.client().errors.len(), 1);

        // A tolerant decoder keeps it.
        let config = DecoderConfig {
            error_threshold: 60,
            ..Default::default()
        };
        let mut decoder = self::decoder(TestClient::with_buffers(17), config);
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2]);
        assert!(decoder.client().errors.is_empty());
    }

    #[test]
    fn p_slice_without_references() {
        let sps = SpsParams {
            max_num_ref_frames: 0,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 2)]);

        let config = DecoderConfig {
            error_threshold: 100,
            ..Default::default()
        };
        let mut decoder = decoder(TestClient::with_buffers(17), config);
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0]);
        assert_eq!(decoder.client().errors.len(), 1);
    }

    #[test]
    fn rejected_sequence() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let bitstream = stream(
            &sps,
            &pps,
            &[SliceParams::idr(), p(1, 2), SliceParams::idr()],
        );

        let mut decoder = decoder(TestClient::with_buffers(0), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        let client = decoder.client();
        assert_eq!(client.sequences.len(), 1);
        assert_eq!(client.errors.len(), 1);
        assert!(client.buffers.is_empty());
        assert!(client.decoded.is_empty());
        assert!(client.displayed.is_empty());
    }

    #[test]
    fn allocation_failure() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 2)]);

        let client = TestClient {
            num_buffers: 17,
            fail_allocations: true,
            ..Default::default()
        };
        let mut decoder = decoder(client, Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        let client = decoder.client();
        assert_eq!(client.errors.len(), 2);
        assert_eq!(client.decoded.len(), 2);
        assert!(client.displayed.is_empty());
    }

    #[test]
    fn complementary_field_pair() {
        let sps = SpsParams {
            frame_mbs_only_flag: false,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let top = SliceParams {
            field_pic_flag: true,
            ..SliceParams::idr()
        };
        let bottom = SliceParams {
            field_pic_flag: true,
            bottom_field_flag: true,
            slice_type: 7,
            pic_order_cnt_lsb: 1,
            ..SliceParams::p()
        };
        let bitstream = stream(&sps, &pps, &[top, bottom]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        let client = decoder.client();
        assert_eq!(client.decoded, vec![(0, false), (0, true)]);
        assert_eq!(client.buffers.len(), 1);
        assert_eq!(client.displayed.len(), 1);
        assert_eq!(client.displayed[0].1.field, Field::Frame);
        assert_eq!(client.displayed[0].1.pic_order_cnt, 0);
        assert!(client.errors.is_empty());
    }

    #[test]
    fn dpb_size_override_bumps_when_full() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 2), p(2, 4)]);

        // The SPS allows 16 frames, so nothing leaves before the flush.
        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        assert!(decoder.client().displayed.is_empty());

        let config = DecoderConfig {
            max_dpb_size_override: Some(1),
            ..Default::default()
        };
        let mut decoder = self::decoder(TestClient::with_buffers(17), config);
        decoder.decode(0, &bitstream).unwrap();
        assert_eq!(decoder.dpb().max_dpb_size(), 1);
        assert_eq!(decoder.client().displayed_pocs(), vec![0]);
        assert_eq!(decoder.dpb().fullness(), 1);

        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2, 4]);
        assert!(decoder.client().errors.is_empty());
    }

    #[test]
    fn full_dpb_bumps_instead_of_overflowing() {
        let sps = SpsParams {
            log2_max_frame_num_minus4: 1,
            log2_max_pic_order_cnt_lsb_minus4: 2,
            max_num_ref_frames: 16,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let mut slices = vec![SliceParams::idr()];
        slices.extend((1..=17).map(|i| p(i, 2 * i)));
        let bitstream = stream(&sps, &pps, &slices);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        assert_slots_conserved(&decoder);

        // The 17th reference frame made room by outputting the first one.
        assert_eq!(decoder.dpb().fullness(), MAX_DPB_SIZE);
        assert_eq!(decoder.client().displayed_pocs(), vec![0]);

        decoder.flush().unwrap();
        let expected: Vec<i32> = (0..=17).map(|i| 2 * i).collect();
        assert_eq!(decoder.client().displayed_pocs(), expected);
        assert!(decoder.client().errors.is_empty());
    }

    #[test]
    fn mmco_5_restarts_output_order() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let reset = SliceParams {
            frame_num: 2,
            pic_order_cnt_lsb: 6,
            mmcos: vec![(5, 0, 0)],
            ..SliceParams::p()
        };
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 4), reset, p(1, 2)]);

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();

        // Everything before the reset is output once it is decoded.
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 4]);
        assert_eq!(decoder.dpb().fullness(), 1);
        assert_eq!(decoder.dpb().entry(0).frame_num, 0);

        decoder.flush().unwrap();
        let client = decoder.client();
        let decoded: Vec<i32> = client.decoded.iter().map(|(poc, _)| *poc).collect();
        assert_eq!(decoded, vec![0, 4, 6, 2]);
        assert_eq!(client.displayed_pocs(), vec![0, 4, 0, 2]);
        assert!(client.errors.is_empty());
    }

    #[test]
    fn idr_without_output_of_prior_pictures() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let discard = SliceParams {
            idr_pic_id: 1,
            no_output_of_prior_pics_flag: true,
            ..SliceParams::idr()
        };
        let bitstream = stream(
            &sps,
            &pps,
            &[SliceParams::idr(), p(1, 2), p(2, 4), discard.clone()],
        );

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        let client = decoder.client();
        assert_eq!(client.decoded.len(), 4);
        assert_eq!(client.sequences.len(), 1);
        // Only the last IDR picture, in buffer 3, is displayed.
        assert_eq!(client.displayed.len(), 1);
        assert_eq!(client.displayed[0].0, 3);
        assert_eq!(client.displayed[0].1.pic_order_cnt, 0);
        assert!(client.buffers.iter().all(|b| Rc::strong_count(b) == 1));
        assert!(client.errors.is_empty());

        // The same IDR picture with output keeps the prior pictures.
        let keep = SliceParams {
            no_output_of_prior_pics_flag: false,
            ..discard
        };
        let bitstream = stream(&sps, &pps, &[SliceParams::idr(), p(1, 2), p(2, 4), keep]);
        let mut decoder = self::decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();
        assert_eq!(decoder.client().displayed_pocs(), vec![0, 2, 4, 0]);
    }

    #[test]
    fn prefix_nalu_sets_the_view_id() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();

        // svc_extension_flag 0, non_idr_flag 0, priority_id 0, view_id 5,
        // temporal_id 0, anchor_pic_flag 1, inter_view_flag 0.
        let mut w = BitWriter::new();
        w.write_bits(0, 8);
        w.write_bits(5, 10);
        w.write_bits(0, 3);
        w.write_bits(0b101, 3);
        let prefix = nalu_bytes(3, NaluType::PrefixUnit, &w.finish());

        let mut bitstream = headers(&sps, &pps);
        bitstream.extend(prefix);
        bitstream.extend(slice_nalu(&SliceParams::idr(), &sps, &pps));
        bitstream.extend(slice_nalu(&p(1, 2), &sps, &pps));

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();

        assert_eq!(decoder.client().num_unhandled, 1);
        assert_eq!(decoder.dpb().entry(0).view_id, 5);
        // The prefix only applied to the slice right after it.
        assert_eq!(decoder.dpb().current().view_id, 0);
    }

    #[test]
    fn unhandled_nalus_reach_the_client() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let mut bitstream = headers(&sps, &pps);
        bitstream.extend(nalu_bytes(0, NaluType::FillerData, &[0xff, 0x80]));

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        assert_eq!(decoder.client().num_unhandled, 1);
    }

    #[test]
    fn broken_slice_is_reported() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        // A slice before any parameter set.
        let mut bitstream = slice_nalu(&SliceParams::idr(), &sps, &pps);
        bitstream.extend(stream(&sps, &pps, &[SliceParams::idr()]));

        let mut decoder = decoder(TestClient::with_buffers(17), Default::default());
        decoder.decode(0, &bitstream).unwrap();
        decoder.flush().unwrap();

        assert_eq!(decoder.client().errors.len(), 1);
        assert_eq!(decoder.client().displayed_pocs(), vec![0]);
    }
}
