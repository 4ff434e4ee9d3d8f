// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Derivation of the effective scaling matrices from the scaling lists carried
//! by a SPS/PPS pair, following the fall-back rules of Table 7-2.

use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::Sps;

/// Table 7-3, in zig-zag scan order.
pub const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

/// Table 7-4, in zig-zag scan order.
pub const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

/// Raster position of each zig-zag scan index, Table 8-13.
const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20,
    13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59,
    52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// How a scaling list slot was signalled in the bitstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScalingListType {
    /// The presence flag was not set, or the slot was not transmitted at all.
    #[default]
    NotPresent,
    /// The list was transmitted explicitly.
    Present,
    /// The list was transmitted with `useDefaultScalingMatrixFlag` set.
    UseDefault,
}

/// The scaling lists as signalled in a SPS or PPS, in zig-zag scan order.
/// Slots 0..6 are the 4x4 lists and slots 6..12 the 8x8 ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub list_types: [ScalingListType; 12],
    pub lists_4x4: [[u8; 16]; 6],
    pub lists_8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            list_types: [ScalingListType::NotPresent; 12],
            lists_4x4: [[16; 16]; 6],
            lists_8x8: [[16; 64]; 6],
        }
    }
}

/// Effective dequantization weights, in raster order. Only the first two 8x8
/// matrices are meaningful unless the stream is 4:4:4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingMatrices {
    pub scaling_4x4: [[u8; 16]; 6],
    pub scaling_8x8: [[u8; 64]; 6],
}

impl ScalingMatrices {
    /// Flat_4x4_16 and Flat_8x8_16, (7-8) and (7-9).
    pub fn flat() -> Self {
        Self {
            scaling_4x4: [[16; 16]; 6],
            scaling_8x8: [[16; 64]; 6],
        }
    }
}

impl Default for ScalingMatrices {
    fn default() -> Self {
        Self::flat()
    }
}

fn raster_4x4(list: &[u8; 16]) -> [u8; 16] {
    let mut out = [0; 16];
    for (idx, &pos) in ZIGZAG_4X4.iter().enumerate() {
        out[pos] = list[idx];
    }
    out
}

fn raster_8x8(list: &[u8; 64]) -> [u8; 64] {
    let mut out = [0; 64];
    for (idx, &pos) in ZIGZAG_8X8.iter().enumerate() {
        out[pos] = list[idx];
    }
    out
}

fn default_4x4(slot: usize) -> [u8; 16] {
    if slot < 3 {
        raster_4x4(&DEFAULT_4X4_INTRA)
    } else {
        raster_4x4(&DEFAULT_4X4_INTER)
    }
}

fn default_8x8(slot: usize) -> [u8; 64] {
    if slot % 2 == 0 {
        raster_8x8(&DEFAULT_8X8_INTRA)
    } else {
        raster_8x8(&DEFAULT_8X8_INTER)
    }
}

/// Where an absent slot takes its values from.
enum Fallback<'a> {
    /// Fall-back rule A: the defaults for the first slot of each group.
    Defaults,
    /// Fall-back rule B: the sequence-level matrices for the first slot of
    /// each group.
    Sequence(&'a ScalingMatrices),
}

/// Resolves `lists` slot by slot. Slots are evaluated in order since absent
/// slots fall back to slots resolved before them.
fn resolve(lists: &ScalingLists, fallback: Fallback) -> ScalingMatrices {
    let mut m = ScalingMatrices::flat();

    for slot in 0..6 {
        m.scaling_4x4[slot] = match lists.list_types[slot] {
            ScalingListType::Present => raster_4x4(&lists.lists_4x4[slot]),
            ScalingListType::UseDefault => default_4x4(slot),
            ScalingListType::NotPresent => match (slot, &fallback) {
                (0 | 3, Fallback::Defaults) => default_4x4(slot),
                (0 | 3, Fallback::Sequence(seq)) => seq.scaling_4x4[slot],
                _ => m.scaling_4x4[slot - 1],
            },
        };
    }

    for slot in 0..6 {
        m.scaling_8x8[slot] = match lists.list_types[6 + slot] {
            ScalingListType::Present => raster_8x8(&lists.lists_8x8[slot]),
            ScalingListType::UseDefault => default_8x8(slot),
            ScalingListType::NotPresent => match (slot, &fallback) {
                (0 | 1, Fallback::Defaults) => default_8x8(slot),
                (0 | 1, Fallback::Sequence(seq)) => seq.scaling_8x8[slot],
                _ => m.scaling_8x8[slot - 2],
            },
        };
    }

    m
}

/// Derives the sequence-level matrices of `sps`.
pub fn resolve_sps(sps: &Sps) -> ScalingMatrices {
    if !sps.seq_scaling_matrix_present_flag {
        return ScalingMatrices::flat();
    }

    resolve(&sps.scaling_lists, Fallback::Defaults)
}

/// Derives the matrices in effect for pictures using `pps` on top of `sps`.
pub fn resolve_pps(sps: &Sps, pps: &Pps) -> ScalingMatrices {
    let seq = resolve_sps(sps);

    if !pps.pic_scaling_matrix_present_flag {
        return seq;
    }

    if sps.seq_scaling_matrix_present_flag {
        resolve(&pps.scaling_lists, Fallback::Sequence(&seq))
    } else {
        resolve(&pps.scaling_lists, Fallback::Defaults)
    }
}
