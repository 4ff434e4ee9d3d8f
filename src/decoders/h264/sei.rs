// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supplemental enhancement information, D.1 and D.2.

use anyhow::anyhow;
use anyhow::Result;
use log::debug;

use crate::decoders::h264::nalu_reader::NaluReader;
use crate::decoders::h264::param_sets::ParameterSetStore;
use crate::decoders::h264::parser::HrdParams;
use crate::decoders::h264::parser::Sps;

const BUFFERING_PERIOD: u32 = 0;
const PIC_TIMING: u32 = 1;
const RECOVERY_POINT: u32 = 6;
const FRAME_PACKING_ARRANGEMENT: u32 = 45;

/// One `initial_cpb_removal_delay` / `initial_cpb_removal_delay_offset` pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitialCpbRemoval {
    pub delay: u32,
    pub delay_offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub seq_parameter_set_id: u8,
    pub nal: Vec<InitialCpbRemoval>,
    pub vcl: Vec<InitialCpbRemoval>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockTimestamp {
    pub ct_type: u8,
    pub nuit_field_based_flag: bool,
    pub counting_type: u8,
    pub full_timestamp_flag: bool,
    pub discontinuity_flag: bool,
    pub cnt_dropped_flag: bool,
    pub n_frames: u8,
    pub seconds_value: u8,
    pub minutes_value: u8,
    pub hours_value: u8,
    pub time_offset: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub cpb_removal_delay: u32,
    pub dpb_output_delay: u32,
    /// Table D-1. Only meaningful when the VUI sets `pic_struct_present_flag`.
    pub pic_struct: Option<u8>,
    pub clock_timestamps: Vec<Option<ClockTimestamp>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub recovery_frame_cnt: u32,
    pub exact_match_flag: bool,
    pub broken_link_flag: bool,
    pub changing_slice_group_idc: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FramePacking {
    pub frame_packing_arrangement_id: u32,
    pub cancel_flag: bool,
    pub arrangement_type: u8,
    pub quincunx_sampling_flag: bool,
    pub content_interpretation_type: u8,
    pub spatial_flipping_flag: bool,
    pub frame0_flipped_flag: bool,
    pub field_views_flag: bool,
    pub current_frame_is_frame0_flag: bool,
    pub frame0_self_contained_flag: bool,
    pub frame1_self_contained_flag: bool,
    pub frame0_grid_position: (u8, u8),
    pub frame1_grid_position: (u8, u8),
    pub repetition_period: u32,
    pub extension_flag: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    BufferingPeriod(BufferingPeriod),
    PicTiming(PicTiming),
    RecoveryPoint(RecoveryPoint),
    FramePacking(FramePacking),
    /// A payload that was skipped.
    Unparsed { payload_type: u32, payload_size: usize },
}

/// NumClockTS, Table D-1.
fn num_clock_ts(pic_struct: u8) -> usize {
    match pic_struct {
        0..=2 => 1,
        3 | 4 | 7 => 2,
        5 | 6 | 8 => 3,
        _ => 0,
    }
}

/// Reads the 0xFF-extended value that encodes payload types and sizes.
fn read_ff_coded<T: AsRef<[u8]>>(r: &mut NaluReader<T>) -> Result<u32> {
    let mut value: u32 = 0;
    loop {
        let byte: u32 = r.read_bits(8)?;
        value = value
            .checked_add(byte)
            .ok_or_else(|| anyhow!("SEI value overflow"))?;
        if byte != 0xff {
            return Ok(value);
        }
    }
}

/// Reads `num_bits` bits, the lengths coming from the HRD parameters.
fn read_delay<T: AsRef<[u8]>>(r: &mut NaluReader<T>, length_minus1: u8) -> Result<u32> {
    r.read_bits_u32(usize::from(length_minus1) + 1)
}

fn parse_cpb_removals<T: AsRef<[u8]>>(
    r: &mut NaluReader<T>,
    hrd: &HrdParams,
) -> Result<Vec<InitialCpbRemoval>> {
    let mut removals = vec![];
    for _ in 0..=hrd.cpb_cnt_minus1 {
        removals.push(InitialCpbRemoval {
            delay: read_delay(r, hrd.initial_cpb_removal_delay_length_minus1)?,
            delay_offset: read_delay(r, hrd.initial_cpb_removal_delay_length_minus1)?,
        });
    }
    Ok(removals)
}

fn parse_buffering_period<T: AsRef<[u8]>>(
    r: &mut NaluReader<T>,
    param_sets: &ParameterSetStore,
) -> Result<BufferingPeriod> {
    let seq_parameter_set_id = r.read_ue_max(31)?;
    let sps = param_sets
        .sps(seq_parameter_set_id)
        .ok_or_else(|| anyhow!("buffering period for unknown SPS {}", seq_parameter_set_id))?;
    let vui = &sps.vui_parameters;

    let mut bp = BufferingPeriod {
        seq_parameter_set_id,
        ..Default::default()
    };

    if vui.nal_hrd_parameters_present_flag {
        bp.nal = parse_cpb_removals(r, &vui.nal_hrd_parameters)?;
    }

    if vui.vcl_hrd_parameters_present_flag {
        bp.vcl = parse_cpb_removals(r, &vui.vcl_hrd_parameters)?;
    }

    Ok(bp)
}

fn parse_clock_timestamp<T: AsRef<[u8]>>(
    r: &mut NaluReader<T>,
    time_offset_length: u8,
) -> Result<ClockTimestamp> {
    let mut ts = ClockTimestamp {
        ct_type: r.read_bits(2)?,
        nuit_field_based_flag: r.read_bit()?,
        counting_type: r.read_bits(5)?,
        full_timestamp_flag: r.read_bit()?,
        discontinuity_flag: r.read_bit()?,
        cnt_dropped_flag: r.read_bit()?,
        n_frames: r.read_bits(8)?,
        ..Default::default()
    };

    if ts.full_timestamp_flag {
        ts.seconds_value = r.read_bits(6)?;
        ts.minutes_value = r.read_bits(6)?;
        ts.hours_value = r.read_bits(5)?;
    } else if r.read_bit()? {
        ts.seconds_value = r.read_bits(6)?;
        if r.read_bit()? {
            ts.minutes_value = r.read_bits(6)?;
            if r.read_bit()? {
                ts.hours_value = r.read_bits(5)?;
            }
        }
    }

    if time_offset_length > 0 {
        let len = usize::from(time_offset_length);
        let raw = r.read_bits_u32(len)?;
        // i(v), two's complement on `len` bits.
        ts.time_offset = if len < 32 && raw & (1 << (len - 1)) != 0 {
            (i64::from(raw) - (1i64 << len)) as i32
        } else {
            raw as i32
        };
    }

    Ok(ts)
}

fn parse_pic_timing<T: AsRef<[u8]>>(r: &mut NaluReader<T>, sps: &Sps) -> Result<PicTiming> {
    let vui = &sps.vui_parameters;
    let mut pt = PicTiming::default();

    let hrd = vui.hrd_parameters();
    if let Some(hrd) = hrd {
        pt.cpb_removal_delay = read_delay(r, hrd.cpb_removal_delay_length_minus1)?;
        pt.dpb_output_delay = read_delay(r, hrd.dpb_output_delay_length_minus1)?;
    }

    if vui.pic_struct_present_flag {
        let pic_struct = r.read_bits(4)?;
        pt.pic_struct = Some(pic_struct);

        let time_offset_length = hrd.map_or(24, |hrd| hrd.time_offset_length);
        for _ in 0..num_clock_ts(pic_struct) {
            let clock_timestamp_flag = r.read_bit()?;
            pt.clock_timestamps.push(if clock_timestamp_flag {
                Some(parse_clock_timestamp(r, time_offset_length)?)
            } else {
                None
            });
        }
    }

    Ok(pt)
}

fn parse_recovery_point<T: AsRef<[u8]>>(r: &mut NaluReader<T>) -> Result<RecoveryPoint> {
    Ok(RecoveryPoint {
        recovery_frame_cnt: r.read_ue()?,
        exact_match_flag: r.read_bit()?,
        broken_link_flag: r.read_bit()?,
        changing_slice_group_idc: r.read_bits(2)?,
    })
}

fn parse_frame_packing<T: AsRef<[u8]>>(r: &mut NaluReader<T>) -> Result<FramePacking> {
    let mut fp = FramePacking {
        frame_packing_arrangement_id: r.read_ue()?,
        cancel_flag: r.read_bit()?,
        ..Default::default()
    };

    if fp.cancel_flag {
        return Ok(fp);
    }

    fp.arrangement_type = r.read_bits(7)?;
    fp.quincunx_sampling_flag = r.read_bit()?;
    fp.content_interpretation_type = r.read_bits(6)?;
    fp.spatial_flipping_flag = r.read_bit()?;
    fp.frame0_flipped_flag = r.read_bit()?;
    fp.field_views_flag = r.read_bit()?;
    fp.current_frame_is_frame0_flag = r.read_bit()?;
    fp.frame0_self_contained_flag = r.read_bit()?;
    fp.frame1_self_contained_flag = r.read_bit()?;

    if !fp.quincunx_sampling_flag && fp.arrangement_type != 5 {
        fp.frame0_grid_position = (r.read_bits(4)?, r.read_bits(4)?);
        fp.frame1_grid_position = (r.read_bits(4)?, r.read_bits(4)?);
    }

    // frame_packing_arrangement_reserved_byte
    r.skip_bits(8)?;
    fp.repetition_period = r.read_ue_max(16384)?;
    fp.extension_flag = r.read_bit()?;

    Ok(fp)
}

/// Moves the reader forward to `target` bits from the start of the RBSP.
fn skip_to<T: AsRef<[u8]>>(r: &mut NaluReader<T>, target: usize) -> Result<()> {
    let mut remaining = target
        .checked_sub(r.num_bits_read())
        .ok_or_else(|| anyhow!("SEI payload overran its declared size"))?;

    while remaining > 0 {
        let chunk = remaining.min(31);
        r.skip_bits(chunk)?;
        remaining -= chunk;
    }

    Ok(())
}

/// Parses every message of a SEI RBSP. Parsing stops quietly at the trailing
/// bits or at the first truncated message. The messages read up to that point
/// are returned.
pub fn parse_sei_rbsp(
    data: &[u8],
    param_sets: &ParameterSetStore,
    active_sps: Option<&Sps>,
) -> Result<Vec<SeiMessage>> {
    let mut r = NaluReader::new(data);
    let mut messages = vec![];

    while r.has_more_rsbp_data() {
        let (payload_type, payload_size) = match (read_ff_coded(&mut r), read_ff_coded(&mut r)) {
            (Ok(t), Ok(s)) => (t, s as usize),
            _ => {
                debug!("Truncated SEI message header");
                break;
            }
        };

        let start = r.num_bits_read();
        if payload_size * 8 > r.num_bits_left() {
            debug!(
                "SEI payload {} declares {} bytes, only {} bits left",
                payload_type,
                payload_size,
                r.num_bits_left()
            );
            break;
        }

        let message = match payload_type {
            BUFFERING_PERIOD => parse_buffering_period(&mut r, param_sets)
                .map(SeiMessage::BufferingPeriod),
            PIC_TIMING => match active_sps {
                Some(sps) => parse_pic_timing(&mut r, sps).map(SeiMessage::PicTiming),
                None => Err(anyhow!("picture timing without an active SPS")),
            },
            RECOVERY_POINT => parse_recovery_point(&mut r).map(SeiMessage::RecoveryPoint),
            FRAME_PACKING_ARRANGEMENT => {
                parse_frame_packing(&mut r).map(SeiMessage::FramePacking)
            }
            _ => Ok(SeiMessage::Unparsed {
                payload_type,
                payload_size,
            }),
        };

        let message = message.unwrap_or_else(|e| {
            debug!("Skipping SEI payload {}: {:#}", payload_type, e);
            SeiMessage::Unparsed {
                payload_type,
                payload_size,
            }
        });

        messages.push(message);

        if skip_to(&mut r, start + payload_size * 8).is_err() {
            debug!("SEI payload {} overran its size", payload_type);
            break;
        }
    }

    Ok(messages)
}
