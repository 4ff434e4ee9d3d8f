// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Result;
use enumn::N;

use crate::decoders::h264::nalu_reader::NaluReader;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether this NAL unit type carries the 3 byte header extension.
    fn has_header_extension(&self) -> bool {
        matches!(
            self,
            NaluType::PrefixUnit | NaluType::SliceExt | NaluType::SliceDepth
        )
    }
}

/// The SVC flavor of the NAL unit header extension. See G.7.3.1.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SvcHeaderExtension {
    pub idr_flag: bool,
    pub priority_id: u8,
    pub no_inter_layer_pred_flag: bool,
    pub dependency_id: u8,
    pub quality_id: u8,
    pub temporal_id: u8,
    pub use_ref_base_pic_flag: bool,
    pub discardable_flag: bool,
    pub output_flag: bool,
}

/// The MVC flavor of the NAL unit header extension. See H.7.3.1.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcHeaderExtension {
    pub non_idr_flag: bool,
    pub priority_id: u8,
    pub view_id: u16,
    pub temporal_id: u8,
    pub anchor_pic_flag: bool,
    pub inter_view_flag: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NaluHeaderExtension {
    Svc(SvcHeaderExtension),
    Mvc(MvcHeaderExtension),
}

#[derive(Clone, Debug)]
pub struct NaluHeader {
    ref_idc: u8,
    type_: NaluType,
    /// The raw `nal_unit_type`, which is kept for reserved and unspecified
    /// values that map to `NaluType::Unknown`.
    nal_unit_type: u8,
    idr_pic_flag: bool,
    header_bytes: usize,
    extension: Option<NaluHeaderExtension>,
}

impl NaluHeader {
    /// Parses a NAL unit header from the first bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<NaluHeader> {
        let byte = *data.first().ok_or(anyhow!("Broken Data: empty NAL unit"))?;

        if byte & 0x80 != 0 {
            return Err(anyhow!("Broken Data: forbidden_zero_bit is set"));
        }

        let nal_unit_type = byte & 0x1f;
        let type_ = NaluType::n(nal_unit_type).unwrap_or(NaluType::Unknown);
        let ref_idc = (byte & 0x60) >> 5;
        let idr_pic_flag = matches!(type_, NaluType::SliceIdr);

        let (extension, header_bytes) = if type_.has_header_extension() {
            if data.len() < 4 {
                return Err(anyhow!("Broken Data: truncated NAL unit header extension"));
            }

            let mut r = NaluReader::new(&data[1..4]);
            (Some(Self::parse_extension(&mut r)?), 4)
        } else {
            (None, 1)
        };

        Ok(NaluHeader {
            ref_idc,
            type_,
            nal_unit_type,
            idr_pic_flag,
            header_bytes,
            extension,
        })
    }

    fn parse_extension<T: AsRef<[u8]>>(r: &mut NaluReader<T>) -> Result<NaluHeaderExtension> {
        let svc_extension_flag = r.read_bit()?;

        if svc_extension_flag {
            let ext = SvcHeaderExtension {
                idr_flag: r.read_bit()?,
                priority_id: r.read_bits(6)?,
                no_inter_layer_pred_flag: r.read_bit()?,
                dependency_id: r.read_bits(3)?,
                quality_id: r.read_bits(4)?,
                temporal_id: r.read_bits(3)?,
                use_ref_base_pic_flag: r.read_bit()?,
                discardable_flag: r.read_bit()?,
                output_flag: r.read_bit()?,
            };
            // reserved_three_2bits
            r.skip_bits(2)?;
            Ok(NaluHeaderExtension::Svc(ext))
        } else {
            let ext = MvcHeaderExtension {
                non_idr_flag: r.read_bit()?,
                priority_id: r.read_bits(6)?,
                view_id: r.read_bits(10)?,
                temporal_id: r.read_bits(3)?,
                anchor_pic_flag: r.read_bit()?,
                inter_view_flag: r.read_bit()?,
            };
            // reserved_one_bit
            r.skip_bits(1)?;
            Ok(NaluHeaderExtension::Mvc(ext))
        }
    }

    pub fn ref_idc(&self) -> u8 {
        self.ref_idc
    }

    pub fn nalu_type(&self) -> &NaluType {
        &self.type_
    }

    pub fn nal_unit_type(&self) -> u8 {
        self.nal_unit_type
    }

    pub fn idr_pic_flag(&self) -> bool {
        self.idr_pic_flag
    }

    pub fn header_bytes(&self) -> usize {
        self.header_bytes
    }

    pub fn extension(&self) -> Option<&NaluHeaderExtension> {
        self.extension.as_ref()
    }
}

#[derive(Debug)]
pub struct Nalu<T> {
    header: NaluHeader,
    /// The mapping that backs this NALU. Possibly shared with the other NALUs
    /// in the Access Unit.
    data: T,

    size: usize,
    offset: usize,
    sc_offset: usize,
}

impl<T: AsRef<[u8]>> Nalu<T> {
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        // discard all zeroes until the start code pattern is found
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit. Returns `None` once no start
    /// code is left in `bitstream`.
    ///
    /// The cursor is always moved past the start code that was found, so a
    /// caller may keep iterating after a NAL unit with a broken header.
    pub fn next(cursor: &mut Cursor<T>, bitstream: T) -> Result<Option<Nalu<T>>> {
        let pos = usize::try_from(cursor.position())?;
        let data = cursor.get_ref().as_ref();

        // Find the start code for this NALU
        let current_nalu_offset = match Nalu::<T>::find_start_code(data, pos) {
            Some(offset) => offset,
            None => return Ok(None),
        };

        let mut start_code_offset = pos + current_nalu_offset;

        // If the preceding byte is 00, then we actually have a four byte SC,
        // i.e. 00 00 00 01 Where the first 00 is the "zero_byte()"
        if start_code_offset > 0 && data[start_code_offset - 1] == 0 {
            start_code_offset -= 1;
        }

        // The NALU offset is its offset + 3 bytes to skip the start code.
        let nalu_offset = pos + current_nalu_offset + 3;

        // Find the start of the subsequent NALU.
        let mut nalu_size = match Nalu::<T>::find_start_code(data, nalu_offset) {
            Some(offset) => offset,
            // Whatever data is left must be part of the current NALU
            None => data.len() - nalu_offset,
        };

        // Discard trailing_zero_8bits
        while nalu_size > 0 && data[nalu_offset + nalu_size - 1] == 0 {
            nalu_size -= 1;
        }

        let header = NaluHeader::parse(&data[nalu_offset..nalu_offset + nalu_size]);

        // Set the bitstream position to the start of the current NALU
        cursor.set_position(u64::try_from(nalu_offset)?);
        let header = header?;

        let nalu_size = match header.type_ {
            NaluType::SeqEnd | NaluType::StreamEnd => 1,
            _ => nalu_size,
        };

        Ok(Some(Nalu {
            header,
            data: bitstream,
            size: nalu_size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        }))
    }

    pub fn header(&self) -> &NaluHeader {
        &self.header
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn sc_offset(&self) -> usize {
        self.sc_offset
    }

    /// The NAL unit payload, without the header and its extension.
    pub fn payload(&self) -> &[u8] {
        &self.as_ref()[self.header.header_bytes.min(self.size)..]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Nalu<T> {
    fn as_ref(&self) -> &[u8] {
        let data = self.data.as_ref();
        &data[self.offset..self.offset + self.size]
    }
}
