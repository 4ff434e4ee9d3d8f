// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Result;

use crate::decoders::h264::parser::Pps;
use crate::decoders::h264::parser::Sps;

pub const MAX_SPS_COUNT: usize = 32;
pub const MAX_PPS_COUNT: usize = 256;

/// The most recent parameter sets for every id. Sets are shared with the
/// pictures that use them, so replacing a set does not affect pictures that
/// are still in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSetStore {
    spses: [Option<Rc<Sps>>; MAX_SPS_COUNT],
    ppses: [Option<Rc<Pps>>; MAX_PPS_COUNT],
}

impl Default for ParameterSetStore {
    fn default() -> Self {
        Self {
            spses: std::array::from_fn(|_| None),
            ppses: std::array::from_fn(|_| None),
        }
    }
}

impl ParameterSetStore {
    pub fn sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.spses.get(usize::from(sps_id))?.as_ref()
    }

    pub fn pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.ppses.get(usize::from(pps_id))?.as_ref()
    }

    /// Publishes `sps`, replacing any set with the same id.
    pub fn insert_sps(&mut self, sps: Sps) -> Result<Rc<Sps>> {
        let slot = self
            .spses
            .get_mut(usize::from(sps.seq_parameter_set_id))
            .ok_or_else(|| anyhow!("SPS id {} out of range", sps.seq_parameter_set_id))?;

        let sps = Rc::new(sps);
        *slot = Some(Rc::clone(&sps));
        Ok(sps)
    }

    /// Publishes `pps`, replacing any set with the same id.
    pub fn insert_pps(&mut self, pps: Pps) -> Result<Rc<Pps>> {
        let slot = self
            .ppses
            .get_mut(usize::from(pps.pic_parameter_set_id))
            .ok_or_else(|| anyhow!("PPS id {} out of range", pps.pic_parameter_set_id))?;

        let pps = Rc::new(pps);
        *slot = Some(Rc::clone(&pps));
        Ok(pps)
    }

    pub fn num_spses(&self) -> usize {
        self.spses.iter().flatten().count()
    }

    pub fn num_ppses(&self) -> usize {
        self.ppses.iter().flatten().count()
    }

    pub fn clear(&mut self) {
        self.spses.iter_mut().for_each(|s| *s = None);
        self.ppses.iter_mut().for_each(|p| *p = None);
    }
}
