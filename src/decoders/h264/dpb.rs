// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;
use log::warn;

use crate::decoders::h264::parser::RefPicMarking;
use crate::decoders::h264::parser::SliceHeader;
use crate::decoders::h264::picture::DpbEntry;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::Reference;
use crate::decoders::h264::picture::BOTTOM_FIELD;
use crate::decoders::h264::picture::FRAME;
use crate::decoders::h264::picture::TOP_FIELD;

/// Number of standard frame buffers in the DPB.
pub const MAX_DPB_SIZE: usize = 16;
/// Index of the scratch slot holding the current picture until it is stored.
pub const CURRENT_SLOT: usize = MAX_DPB_SIZE;

/// A picture leaving the DPB in output order.
#[derive(Clone, Debug)]
pub struct OutputPicture<P> {
    /// The client's buffer, if one was allocated.
    pub picture: Option<P>,
    pub field: Field,
    pub pic_order_cnt: i32,
    pub timestamp: u64,
    pub pic_struct: Option<u8>,
    pub not_existing: bool,
}

pub struct Dpb<P> {
    /// The 16 standard slots followed by the scratch slot.
    entries: [DpbEntry<P>; MAX_DPB_SIZE + 1],
    /// Index of the current picture's entry.
    cur: usize,
    /// Number of standard slots in use before the DPB counts as full.
    max_dpb_size: usize,
    /// -1 means "no long-term frame indices".
    max_long_term_frame_idx: i32,
}

impl<P> Default for Dpb<P> {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| Default::default()),
            cur: CURRENT_SLOT,
            max_dpb_size: 0,
            max_long_term_frame_idx: -1,
        }
    }
}

impl<P: Clone> Dpb<P> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the dpb's max size.
    pub fn set_max_dpb_size(&mut self, max_dpb_size: usize) {
        self.max_dpb_size = max_dpb_size.min(MAX_DPB_SIZE);
    }

    /// Get the dpb's max size.
    pub fn max_dpb_size(&self) -> usize {
        self.max_dpb_size
    }

    pub fn max_long_term_frame_idx(&self) -> i32 {
        self.max_long_term_frame_idx
    }

    /// The 16 standard slots.
    pub fn entries(&self) -> &[DpbEntry<P>] {
        &self.entries[..MAX_DPB_SIZE]
    }

    /// Any slot, the scratch slot included.
    pub fn entry(&self, idx: usize) -> &DpbEntry<P> {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut DpbEntry<P> {
        &mut self.entries[idx]
    }

    pub fn cur_index(&self) -> usize {
        self.cur
    }

    pub fn set_cur_index(&mut self, idx: usize) {
        self.cur = idx.min(CURRENT_SLOT);
    }

    pub fn current(&self) -> &DpbEntry<P> {
        &self.entries[self.cur]
    }

    pub fn current_mut(&mut self) -> &mut DpbEntry<P> {
        &mut self.entries[self.cur]
    }

    /// Number of occupied standard slots.
    pub fn fullness(&self) -> usize {
        self.entries().iter().filter(|e| !e.is_empty()).count()
    }

    /// Number of empty standard slots.
    pub fn num_free(&self) -> usize {
        MAX_DPB_SIZE - self.fullness()
    }

    pub fn is_full(&self) -> bool {
        let fullness = self.fullness();
        fullness > 0 && fullness >= self.max_dpb_size
    }

    pub fn is_empty(&self) -> bool {
        self.fullness() == 0
    }

    /// The first empty standard slot.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.entries().iter().position(|e| e.is_empty())
    }

    /// Returns the number of complete frames waiting for output.
    pub fn reordering_delay(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.is_complete_frame_waiting())
            .count()
    }

    /// Drops every picture and resets the long-term state, without output.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = Default::default();
        }
        self.cur = CURRENT_SLOT;
        self.max_long_term_frame_idx = -1;
    }

    /// Whether the current entry holds a single field that the picture of
    /// `hdr` completes into a complementary field pair.
    pub fn is_comp_field_pair(&self, hdr: &SliceHeader) -> bool {
        let entry = self.current();
        let field = Field::from_header(hdr);

        let opposite_parity = field
            .opposite()
            .map_or(false, |first| entry.state == first.state_bits());
        if !opposite_parity {
            return false;
        }

        let non_ref_pair = !entry.reference_picture && hdr.nal_ref_idc == 0;
        let ref_pair = entry.reference_picture
            && hdr.nal_ref_idc != 0
            && entry.frame_num == u32::from(hdr.frame_num)
            && !hdr.idr_pic_flag
            && !hdr.dec_ref_pic_marking.has_mmco_5();

        non_ref_pair || ref_pair
    }

    /// Points the current picture at the scratch slot and resets it. A field
    /// left waiting there without its pair is returned for output.
    pub fn init_scratch(&mut self) -> Option<OutputPicture<P>> {
        self.cur = CURRENT_SLOT;
        let state = self.entries[CURRENT_SLOT].state;
        let output = if state != 0 {
            Some(self.output_entry(CURRENT_SLOT, state))
        } else {
            None
        };

        self.entries[CURRENT_SLOT] = Default::default();
        output
    }

    /// Copies the current picture into an empty standard slot, which becomes
    /// the current entry. Returns false when every slot is taken.
    pub fn store_current(&mut self) -> bool {
        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => return false,
        };

        if slot != self.cur {
            self.entries[slot] = self.entries[self.cur].clone();
            self.cur = slot;
        }

        debug!("Stored current picture in slot {}", slot);
        true
    }

    /// Unmarks all standard slots, and the scratch slot as well if
    /// `include_scratch` is set.
    pub fn mark_all_as_unused_for_ref(&mut self, include_scratch: bool) {
        let end = if include_scratch {
            MAX_DPB_SIZE + 1
        } else {
            MAX_DPB_SIZE
        };

        for entry in self.entries[..end].iter_mut() {
            entry.set_reference(Reference::Unused);
        }
    }

    /// Empties every standard slot that is neither referenced nor waiting
    /// for output.
    pub fn remove_unused(&mut self) {
        for (i, entry) in self.entries[..MAX_DPB_SIZE].iter_mut().enumerate() {
            if entry.is_unused() && (!entry.is_empty() || entry.picture.is_some()) {
                debug!("Removing unused picture in slot {}", i);
                entry.release();
            }
        }
    }

    /// Derives FrameNumWrap and the pic nums of every standard slot as seen
    /// from the current picture.
    pub fn update_pic_nums(&mut self, frame_num: u32, field: Field, max_frame_num: u32) {
        for entry in self.entries[..MAX_DPB_SIZE].iter_mut() {
            entry.update_pic_nums(frame_num, field, max_frame_num);
        }
    }

    /// Marks the current IDR picture, see 8.2.5.1.
    pub fn mark_idr(&mut self, field: Field, long_term_reference_flag: bool) {
        self.mark_all_as_unused_for_ref(false);

        let cur = self.current_mut();
        if long_term_reference_flag {
            cur.set_field_reference(field, Reference::LongTerm);
            cur.long_term_frame_idx = 0;
            self.max_long_term_frame_idx = 0;
        } else {
            cur.set_field_reference(field, Reference::ShortTerm);
            self.max_long_term_frame_idx = -1;
        }
    }

    /// Marks the fields of the current picture that no MMCO turned into
    /// long-term references as short-term references.
    pub fn mark_current_as_short_term(&mut self, field: Field) {
        let cur = self.current_mut();
        if field.has_top() && cur.top_reference == Reference::Unused {
            cur.top_reference = Reference::ShortTerm;
        }
        if field.has_bottom() && cur.bottom_reference == Reference::Unused {
            cur.bottom_reference = Reference::ShortTerm;
        }
    }

    /// The sliding window reference marking process, see 8.2.5.3.
    pub fn sliding_window_marking(&mut self, max_num_ref_frames: u32, gaps_allowed: bool) {
        // The second field of a complementary reference field pair follows
        // the marking of the first one.
        if self.current().is_short_term() {
            self.current_mut().set_reference(Reference::ShortTerm);
            return;
        }

        let cur_frame_num = self.current().frame_num;
        let mut num_short_term = 0;
        let mut num_long_term = 0;
        let mut num_short_term_existing = 0;

        for entry in self.entries[..MAX_DPB_SIZE].iter_mut() {
            if entry.is_short_term() && entry.frame_num == cur_frame_num {
                // Breaks (7-23), but this entry is the oldest so it goes.
                warn!("frame_num {} is already in the DPB", cur_frame_num);
                if entry.top_reference == Reference::ShortTerm {
                    entry.top_reference = Reference::Unused;
                }
                if entry.bottom_reference == Reference::ShortTerm {
                    entry.bottom_reference = Reference::Unused;
                }
            }

            if entry.is_short_term() {
                num_short_term += 1;
                if !entry.not_existing {
                    num_short_term_existing += 1;
                }
            }
            if entry.is_long_term() {
                num_long_term += 1;
            }
        }

        if num_short_term + num_long_term < max_num_ref_frames {
            return;
        }

        let mut min_frame_num_wrap = i32::MAX;
        let mut victim = 0;
        for (i, entry) in self.entries[..MAX_DPB_SIZE].iter().enumerate() {
            if entry.frame_num_wrap >= min_frame_num_wrap {
                continue;
            }

            if num_short_term > 0 {
                // A lone existing picture is kept over non-existing ones.
                let evictable = num_short_term_existing > 1
                    || num_short_term_existing == num_short_term
                    || entry.not_existing
                    || gaps_allowed;
                if entry.is_short_term() && evictable {
                    victim = i;
                    min_frame_num_wrap = entry.frame_num_wrap;
                }
            } else if entry.is_long_term() {
                victim = i;
                min_frame_num_wrap = entry.frame_num_wrap;
            }
        }

        debug!(
            "Sliding window unmarks slot {} (frame_num_wrap {})",
            victim, self.entries[victim].frame_num_wrap
        );
        self.entries[victim].set_reference(Reference::Unused);
    }

    /// The adaptive memory control reference marking process, see 8.2.5.4.
    /// The current picture's POC is rebased when an MMCO 5 is found.
    pub fn adaptive_marking(
        &mut self,
        marking: &RefPicMarking,
        frame_num: u32,
        field: Field,
        max_num_ref_frames: u32,
        gaps_allowed: bool,
    ) {
        // (8-39)
        let curr_pic_num = match field {
            Field::Frame => frame_num as i32,
            _ => 2 * frame_num as i32 + 1,
        };

        for op in &marking.inner {
            match op.memory_management_control_operation {
                1 => {
                    // (8-40)
                    let pic_num_x = curr_pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);
                    for entry in self.entries[..MAX_DPB_SIZE].iter_mut() {
                        if entry.top_reference == Reference::ShortTerm
                            && entry.top_pic_num == pic_num_x
                        {
                            entry.top_reference = Reference::Unused;
                        }
                        if entry.bottom_reference == Reference::ShortTerm
                            && entry.bottom_pic_num == pic_num_x
                        {
                            entry.bottom_reference = Reference::Unused;
                        }
                    }
                }
                2 => {
                    let long_term_pic_num = op.long_term_pic_num as i32;
                    for entry in self.entries[..MAX_DPB_SIZE].iter_mut() {
                        if entry.top_reference == Reference::LongTerm
                            && entry.top_long_term_pic_num == long_term_pic_num
                        {
                            entry.top_reference = Reference::Unused;
                        }
                        if entry.bottom_reference == Reference::LongTerm
                            && entry.bottom_long_term_pic_num == long_term_pic_num
                        {
                            entry.bottom_reference = Reference::Unused;
                        }
                    }
                }
                3 => {
                    let pic_num_x = curr_pic_num - (op.difference_of_pic_nums_minus1 as i32 + 1);
                    let idx = op.long_term_frame_idx as i32;
                    for entry in self.entries[..MAX_DPB_SIZE].iter_mut() {
                        let top_is_target = entry.top_reference == Reference::ShortTerm
                            && entry.top_pic_num == pic_num_x;
                        let bottom_is_target = entry.bottom_reference == Reference::ShortTerm
                            && entry.bottom_pic_num == pic_num_x;

                        // The index is freed unless it belongs to the other
                        // field of the target.
                        if entry.top_reference == Reference::LongTerm
                            && entry.long_term_frame_idx == idx
                            && !bottom_is_target
                        {
                            entry.top_reference = Reference::Unused;
                        }
                        if entry.bottom_reference == Reference::LongTerm
                            && entry.long_term_frame_idx == idx
                            && !top_is_target
                        {
                            entry.bottom_reference = Reference::Unused;
                        }

                        if top_is_target {
                            entry.top_reference = Reference::LongTerm;
                            entry.long_term_frame_idx = idx;
                            entry.update_long_term_pic_nums(field);
                        }
                        if bottom_is_target {
                            entry.bottom_reference = Reference::LongTerm;
                            entry.long_term_frame_idx = idx;
                            entry.update_long_term_pic_nums(field);
                        }
                    }
                }
                4 => {
                    self.max_long_term_frame_idx = op.max_long_term_frame_idx_plus1 as i32 - 1;
                    let max_idx = self.max_long_term_frame_idx;
                    for entry in self.entries[..MAX_DPB_SIZE].iter_mut() {
                        if entry.top_reference == Reference::LongTerm
                            && entry.long_term_frame_idx > max_idx
                        {
                            entry.top_reference = Reference::Unused;
                        }
                        if entry.bottom_reference == Reference::LongTerm
                            && entry.long_term_frame_idx > max_idx
                        {
                            entry.bottom_reference = Reference::Unused;
                        }
                    }
                }
                5 => {
                    self.mark_all_as_unused_for_ref(false);
                    self.max_long_term_frame_idx = -1;

                    // 7.4.3 and 8.2.1: the picture becomes the new origin.
                    let cur = self.current_mut();
                    cur.frame_num = 0;
                    cur.top_field_order_cnt =
                        cur.top_field_order_cnt.wrapping_sub(cur.pic_order_cnt);
                    cur.bottom_field_order_cnt =
                        cur.bottom_field_order_cnt.wrapping_sub(cur.pic_order_cnt);
                    cur.pic_order_cnt = 0;
                }
                6 => {
                    let idx = op.long_term_frame_idx as i32;
                    let cur_idx = self.cur;
                    for (i, entry) in self.entries[..MAX_DPB_SIZE].iter_mut().enumerate() {
                        if i == cur_idx || entry.long_term_frame_idx != idx {
                            continue;
                        }
                        if entry.top_reference == Reference::LongTerm {
                            entry.top_reference = Reference::Unused;
                        }
                        if entry.bottom_reference == Reference::LongTerm {
                            entry.bottom_reference = Reference::Unused;
                        }
                    }

                    let cur = self.current_mut();
                    cur.set_field_reference(field, Reference::LongTerm);
                    cur.long_term_frame_idx = idx;
                    cur.update_long_term_pic_nums(field);
                }
                other => debug!("Ignoring memory_management_control_operation {}", other),
            }
        }

        self.enforce_max_num_ref_frames(max_num_ref_frames, gaps_allowed);
    }

    /// Missing references can leave more references than allowed after the
    /// MMCOs ran. Evicts the oldest non-existing reference first, then the
    /// oldest existing one, until the limit holds.
    fn enforce_max_num_ref_frames(&mut self, max_num_ref_frames: u32, gaps_allowed: bool) {
        loop {
            let mut num_refs = 0;
            let mut oldest: Option<usize> = None;
            let mut oldest_not_existing: Option<usize> = None;

            for i in 0..MAX_DPB_SIZE {
                if i == self.cur {
                    continue;
                }

                let entry = &mut self.entries[i];
                // With adaptive marking they would never leave otherwise.
                if entry.not_existing && entry.is_short_term_frame() && !gaps_allowed {
                    entry.set_reference(Reference::Unused);
                    continue;
                }

                if !entry.is_reference() {
                    continue;
                }

                num_refs += 1;
                let wrap = entry.frame_num_wrap;
                if oldest.map_or(true, |o| wrap < self.entries[o].frame_num_wrap) {
                    oldest = Some(i);
                }
                if self.entries[i].not_existing
                    && oldest_not_existing.map_or(true, |o| wrap < self.entries[o].frame_num_wrap)
                {
                    oldest_not_existing = Some(i);
                }
            }

            match oldest_not_existing.or(oldest) {
                Some(victim) if num_refs >= max_num_ref_frames => {
                    debug!("Too many references after MMCO, unmarking slot {}", victim);
                    self.entries[victim].set_reference(Reference::Unused);
                }
                _ => break,
            }
        }
    }

    /// Builds the output record of the `fields` of entry `idx`.
    pub fn output_entry(&self, idx: usize, fields: u8) -> OutputPicture<P> {
        let entry = &self.entries[idx];
        let field = Field::from_state(fields);
        let pic_order_cnt = match field {
            Field::Frame => entry.pic_order_cnt,
            Field::Top => entry.top_field_order_cnt,
            Field::Bottom => entry.bottom_field_order_cnt,
        };

        OutputPicture {
            picture: entry.picture.clone(),
            field,
            pic_order_cnt,
            timestamp: entry.timestamp,
            pic_struct: entry.pic_struct,
            not_existing: entry.not_existing,
        }
    }

    /// The bumping process of C.4.5.3, over the first `size` slots. Outputs
    /// the waiting picture with the smallest POC, ties going to the smaller
    /// view order index. If nothing waits, the oldest picture is evicted
    /// without output.
    pub fn bump(&mut self, size: usize) -> Option<OutputPicture<P>> {
        let size = size.min(self.entries.len());

        let mut min: Option<(usize, i32, u32)> = None;
        for (i, entry) in self.entries[..size].iter().enumerate() {
            let fields = [
                (
                    entry.has_top() && entry.top_needed_for_output,
                    entry.top_field_order_cnt,
                ),
                (
                    entry.has_bottom() && entry.bottom_needed_for_output,
                    entry.bottom_field_order_cnt,
                ),
            ];

            for (waiting, poc) in fields {
                let smaller = min.map_or(true, |(_, min_poc, min_vo_idx)| {
                    poc < min_poc || (poc == min_poc && entry.vo_idx < min_vo_idx)
                });
                if waiting && smaller {
                    min = Some((i, poc, entry.vo_idx));
                }
            }
        }

        let idx = match min {
            Some((idx, _, _)) => idx,
            None => {
                self.evict_oldest(size);
                return None;
            }
        };

        let entry = &self.entries[idx];
        let fields = if entry.is_complete_frame_waiting() {
            FRAME
        } else if entry.has_top() && entry.top_needed_for_output {
            TOP_FIELD
        } else {
            BOTTOM_FIELD
        };

        let output = self.output_entry(idx, fields);
        let entry = &mut self.entries[idx];
        if fields & TOP_FIELD != 0 {
            entry.top_needed_for_output = false;
        }
        if fields & BOTTOM_FIELD != 0 {
            entry.bottom_needed_for_output = false;
        }
        if entry.is_unused() {
            entry.release();
        }

        debug!(
            "Bumped {:?} of slot {} with POC {}",
            output.field, idx, output.pic_order_cnt
        );
        Some(output)
    }

    /// Frees the picture with the smallest POC, or the non-existing frame with
    /// the smallest frame_num if there is one.
    fn evict_oldest(&mut self, size: usize) {
        let mut min_poc = i32::MAX;
        let mut oldest = None;
        let mut min_frame_num = u32::MAX;
        let mut oldest_not_existing = None;

        for (i, entry) in self.entries[..size].iter().enumerate() {
            if entry.has_top() && entry.top_field_order_cnt <= min_poc {
                min_poc = entry.top_field_order_cnt;
                oldest = Some(i);
            }
            if entry.has_bottom() && entry.bottom_field_order_cnt <= min_poc {
                min_poc = entry.bottom_field_order_cnt;
                oldest = Some(i);
            }
            if !entry.is_empty() && entry.not_existing && entry.frame_num <= min_frame_num {
                min_frame_num = entry.frame_num;
                oldest_not_existing = Some(i);
            }
        }

        if let Some(victim) = oldest_not_existing.or(oldest) {
            debug!("Evicting slot {} without output", victim);
            let entry = &mut self.entries[victim];
            entry.set_reference(Reference::Unused);
            entry.release();
        }
    }

    /// Outputs the waiting frame with the smallest POC to bound the display
    /// latency. Nothing happens if that POC is duplicated or belongs to a
    /// lone field. The frame stays in the DPB until it is unused.
    pub fn display_bump(&mut self) -> Option<OutputPicture<P>> {
        let mut min_poc: Option<i32> = None;
        let mut min_idx = None;

        for (i, entry) in self.entries[..MAX_DPB_SIZE].iter().enumerate() {
            if entry.has_top()
                && entry.top_needed_for_output
                && min_poc.map_or(true, |p| entry.top_field_order_cnt <= p)
            {
                if min_poc == Some(entry.top_field_order_cnt) {
                    return None;
                }
                min_poc = Some(entry.top_field_order_cnt);
                min_idx = Some(i);
            }
            if entry.has_bottom()
                && entry.bottom_needed_for_output
                && min_poc.map_or(true, |p| entry.bottom_field_order_cnt <= p)
            {
                if min_poc == Some(entry.bottom_field_order_cnt) && min_idx != Some(i) {
                    return None;
                }
                min_poc = Some(entry.bottom_field_order_cnt);
                min_idx = Some(i);
            }
        }

        let idx = min_idx?;
        if self.entries[idx].state != FRAME {
            return None;
        }

        let output = self.output_entry(idx, FRAME);
        let entry = &mut self.entries[idx];
        entry.top_needed_for_output = false;
        entry.bottom_needed_for_output = false;
        Some(output)
    }

    /// Marks everything unused for reference and outputs every waiting
    /// picture, the scratch slot included. Returns the pictures in output
    /// order.
    pub fn flush(&mut self) -> Vec<OutputPicture<P>> {
        self.mark_all_as_unused_for_ref(true);
        for entry in self.entries.iter_mut() {
            if entry.is_unused() {
                entry.release();
            }
        }

        let mut outputs = vec![];
        while !self.is_empty() || self.entries[CURRENT_SLOT].state & FRAME != 0 {
            if let Some(output) = self.bump(MAX_DPB_SIZE + 1) {
                outputs.push(output);
            }
        }

        self.cur = CURRENT_SLOT;
        debug!("Flushed {} pictures", outputs.len());
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::h264::parser::RefPicMarkingInner;

    /// Stores a reference frame with the given frame_num and POC in `slot`.
    fn put_frame(dpb: &mut Dpb<u32>, slot: usize, frame_num: u32, poc: i32) {
        let entry = dpb.entry_mut(slot);
        *entry = DpbEntry {
            frame_num,
            top_field_order_cnt: poc,
            bottom_field_order_cnt: poc,
            pic_order_cnt: poc,
            picture: Some(slot as u32),
            reference_picture: true,
            ..Default::default()
        };
        entry.store_fields(Field::Frame);
        entry.set_reference(Reference::ShortTerm);
    }

    fn mmco(op: u8, diff: u32, long_term_pic_num: u32, idx: u32) -> RefPicMarkingInner {
        RefPicMarkingInner {
            memory_management_control_operation: op,
            difference_of_pic_nums_minus1: diff,
            long_term_pic_num,
            long_term_frame_idx: idx,
            max_long_term_frame_idx_plus1: idx,
        }
    }

    fn adaptive(ops: Vec<RefPicMarkingInner>) -> RefPicMarking {
        RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: ops,
            ..Default::default()
        }
    }

    #[test]
    fn slot_conservation() {
        let mut dpb = Dpb::<u32>::new();
        dpb.set_max_dpb_size(4);
        assert_eq!(dpb.fullness() + dpb.num_free(), MAX_DPB_SIZE);
        assert!(!dpb.is_full());

        for i in 0..4 {
            put_frame(&mut dpb, i, i as u32, 2 * i as i32);
            assert_eq!(dpb.fullness() + dpb.num_free(), MAX_DPB_SIZE);
        }
        assert!(dpb.is_full());

        dpb.bump(MAX_DPB_SIZE);
        dpb.mark_all_as_unused_for_ref(false);
        dpb.remove_unused();
        assert_eq!(dpb.fullness(), 3);
        assert_eq!(dpb.fullness() + dpb.num_free(), MAX_DPB_SIZE);
    }

    #[test]
    fn empty_dpb_is_never_full() {
        let dpb = Dpb::<u32>::new();
        assert_eq!(dpb.max_dpb_size(), 0);
        assert!(!dpb.is_full());
        assert!(dpb.is_empty());
    }

    #[test]
    fn sliding_window_evicts_smallest_frame_num_wrap() {
        let mut dpb = Dpb::<u32>::new();
        dpb.set_max_dpb_size(4);
        put_frame(&mut dpb, 0, 14, 0);
        put_frame(&mut dpb, 1, 15, 2);
        put_frame(&mut dpb, 2, 1, 6);
        dpb.update_pic_nums(2, Field::Frame, 16);

        dpb.current_mut().frame_num = 2;
        dpb.sliding_window_marking(3, false);

        assert!(!dpb.entry(0).is_reference());
        assert!(dpb.entry(1).is_short_term());
        assert!(dpb.entry(2).is_short_term());
    }

    #[test]
    fn sliding_window_below_limit_keeps_everything() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 0);
        put_frame(&mut dpb, 1, 1, 2);
        dpb.update_pic_nums(2, Field::Frame, 16);
        dpb.current_mut().frame_num = 2;
        dpb.sliding_window_marking(4, false);

        assert!(dpb.entry(0).is_short_term());
        assert!(dpb.entry(1).is_short_term());
    }

    #[test]
    fn sliding_window_keeps_lone_existing_picture() {
        let mut dpb = Dpb::<u32>::new();
        // The existing picture is the oldest one.
        put_frame(&mut dpb, 0, 1, 0);
        put_frame(&mut dpb, 1, 2, 0);
        put_frame(&mut dpb, 2, 3, 0);
        dpb.entry_mut(1).not_existing = true;
        dpb.entry_mut(2).not_existing = true;
        dpb.update_pic_nums(4, Field::Frame, 16);

        dpb.current_mut().frame_num = 4;
        dpb.sliding_window_marking(3, false);
        assert!(dpb.entry(0).is_short_term());
        assert!(!dpb.entry(1).is_reference());
        assert!(dpb.entry(2).is_short_term());

        // Unless gaps are allowed, then the oldest goes whatever it is.
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 0);
        put_frame(&mut dpb, 1, 2, 0);
        put_frame(&mut dpb, 2, 3, 0);
        dpb.entry_mut(1).not_existing = true;
        dpb.entry_mut(2).not_existing = true;
        dpb.update_pic_nums(4, Field::Frame, 16);

        dpb.current_mut().frame_num = 4;
        dpb.sliding_window_marking(3, true);
        assert!(!dpb.entry(0).is_reference());
        assert!(dpb.entry(1).is_short_term());
    }

    #[test]
    fn sliding_window_follows_first_field() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 0);
        dpb.set_cur_index(0);
        dpb.entry_mut(0).bottom_reference = Reference::Unused;

        dpb.sliding_window_marking(1, false);
        assert!(dpb.entry(0).is_short_term_frame());
    }

    #[test]
    fn sliding_window_drops_duplicate_frame_num() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 3, 0);
        put_frame(&mut dpb, 1, 2, 0);
        dpb.update_pic_nums(3, Field::Frame, 16);

        dpb.current_mut().frame_num = 3;
        dpb.sliding_window_marking(4, false);
        assert!(!dpb.entry(0).is_reference());
        assert!(dpb.entry(1).is_short_term());
    }

    #[test]
    fn mmco_short_term_unmarking() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 2);
        put_frame(&mut dpb, 1, 2, 4);
        dpb.update_pic_nums(3, Field::Frame, 16);

        // picNumX = 3 - (1 + 1) = 1
        dpb.adaptive_marking(&adaptive(vec![mmco(1, 1, 0, 0)]), 3, Field::Frame, 4, false);
        assert!(!dpb.entry(0).is_reference());
        assert!(dpb.entry(1).is_short_term());
    }

    #[test]
    fn mmco_long_term_lifecycle() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 2);
        put_frame(&mut dpb, 1, 2, 4);
        dpb.update_pic_nums(3, Field::Frame, 16);

        // Allow indices 0..=1, then turn frame_num 2 into long-term index 1.
        let ops = vec![mmco(4, 0, 0, 2), mmco(3, 0, 0, 1)];
        dpb.adaptive_marking(&adaptive(ops), 3, Field::Frame, 4, false);
        assert_eq!(dpb.max_long_term_frame_idx(), 1);
        assert_eq!(dpb.entry(1).top_reference, Reference::LongTerm);
        assert_eq!(dpb.entry(1).long_term_frame_idx, 1);
        assert_eq!(dpb.entry(1).top_long_term_pic_num, 1);
        assert!(dpb.entry(0).is_short_term());

        // Reassigning index 1 to frame_num 1 frees the first holder.
        dpb.adaptive_marking(&adaptive(vec![mmco(3, 1, 0, 1)]), 3, Field::Frame, 4, false);
        assert!(!dpb.entry(1).is_reference());
        assert_eq!(dpb.entry(0).bottom_reference, Reference::LongTerm);

        // MMCO 2 drops it by long-term pic num.
        dpb.adaptive_marking(&adaptive(vec![mmco(2, 0, 1, 0)]), 3, Field::Frame, 4, false);
        assert!(!dpb.entry(0).is_reference());
    }

    #[test]
    fn mmco_max_long_term_frame_idx() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 2);
        dpb.entry_mut(0).set_reference(Reference::LongTerm);
        dpb.entry_mut(0).long_term_frame_idx = 2;

        // max_long_term_frame_idx_plus1 = 0 leaves no long-term index.
        dpb.adaptive_marking(&adaptive(vec![mmco(4, 0, 0, 0)]), 3, Field::Frame, 4, false);
        assert_eq!(dpb.max_long_term_frame_idx(), -1);
        assert!(!dpb.entry(0).is_reference());
    }

    #[test]
    fn mmco_5_resets_current_picture() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 2);
        {
            let cur = dpb.current_mut();
            cur.frame_num = 5;
            cur.top_field_order_cnt = 10;
            cur.bottom_field_order_cnt = 12;
            cur.pic_order_cnt = 10;
        }

        dpb.adaptive_marking(&adaptive(vec![mmco(5, 0, 0, 0)]), 5, Field::Frame, 4, false);
        assert!(!dpb.entry(0).is_reference());
        let cur = dpb.current();
        assert_eq!(cur.frame_num, 0);
        assert_eq!(cur.top_field_order_cnt, 0);
        assert_eq!(cur.bottom_field_order_cnt, 2);
        assert_eq!(cur.pic_order_cnt, 0);
        assert_eq!(dpb.max_long_term_frame_idx(), -1);
    }

    #[test]
    fn mmco_6_marks_current_as_long_term() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 2);
        dpb.entry_mut(0).set_reference(Reference::LongTerm);
        dpb.entry_mut(0).long_term_frame_idx = 0;

        dpb.adaptive_marking(&adaptive(vec![mmco(6, 0, 0, 0)]), 3, Field::Frame, 4, false);
        assert!(!dpb.entry(0).is_reference());
        assert_eq!(dpb.current().top_reference, Reference::LongTerm);
        assert_eq!(dpb.current().bottom_reference, Reference::LongTerm);

        // The current picture is not turned back into a short-term one.
        dpb.mark_current_as_short_term(Field::Frame);
        assert!(dpb.current().is_long_term());
    }

    #[test]
    fn mmco_exhaustion_evicts_non_existing_first() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 0);
        put_frame(&mut dpb, 1, 2, 2);
        put_frame(&mut dpb, 2, 3, 4);
        dpb.entry_mut(2).not_existing = true;
        dpb.update_pic_nums(4, Field::Frame, 16);

        // Gaps allowed: the non-existing frame is evicted by the limit only,
        // leaving room for the current picture.
        dpb.adaptive_marking(&adaptive(vec![]), 4, Field::Frame, 3, true);
        assert!(dpb.entry(0).is_short_term());
        assert!(dpb.entry(1).is_short_term());
        assert!(!dpb.entry(2).is_reference());

        // Then the oldest existing one.
        dpb.adaptive_marking(&adaptive(vec![]), 4, Field::Frame, 2, true);
        assert!(!dpb.entry(0).is_reference());
        assert!(dpb.entry(1).is_short_term());
    }

    #[test]
    fn mmco_exhaustion_drops_non_existing_without_gaps() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 1, 0);
        put_frame(&mut dpb, 1, 2, 2);
        dpb.entry_mut(1).not_existing = true;
        dpb.update_pic_nums(3, Field::Frame, 16);

        dpb.adaptive_marking(&adaptive(vec![]), 3, Field::Frame, 4, false);
        assert!(dpb.entry(0).is_short_term());
        assert!(!dpb.entry(1).is_reference());
    }

    #[test]
    fn bumping_outputs_smallest_poc() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 8);
        put_frame(&mut dpb, 1, 1, 4);
        put_frame(&mut dpb, 2, 2, 6);

        let out = dpb.bump(MAX_DPB_SIZE).unwrap();
        assert_eq!(out.pic_order_cnt, 4);
        assert_eq!(out.picture, Some(1));
        assert_eq!(out.field, Field::Frame);
        // Still a reference, so it stays.
        assert!(!dpb.entry(1).is_empty());

        dpb.entry_mut(2).set_reference(Reference::Unused);
        let out = dpb.bump(MAX_DPB_SIZE).unwrap();
        assert_eq!(out.pic_order_cnt, 6);
        assert!(dpb.entry(2).is_empty());
    }

    #[test]
    fn bumping_breaks_poc_ties_by_view_order() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 4);
        put_frame(&mut dpb, 1, 0, 4);
        put_frame(&mut dpb, 2, 1, 2);
        dpb.entry_mut(0).vo_idx = 1;

        let order: Vec<_> = (0..3)
            .map(|_| dpb.bump(MAX_DPB_SIZE).unwrap().picture)
            .collect();
        assert_eq!(order, vec![Some(2), Some(1), Some(0)]);
    }

    #[test]
    fn bumping_without_waiting_pictures_evicts() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 8);
        put_frame(&mut dpb, 1, 1, 4);
        put_frame(&mut dpb, 2, 2, 6);
        for i in 0..3 {
            dpb.entry_mut(i).top_needed_for_output = false;
            dpb.entry_mut(i).bottom_needed_for_output = false;
        }
        dpb.entry_mut(0).not_existing = true;

        // The non-existing frame goes first even with a larger POC.
        assert!(dpb.bump(MAX_DPB_SIZE).is_none());
        assert!(dpb.entry(0).is_empty());

        assert!(dpb.bump(MAX_DPB_SIZE).is_none());
        assert!(dpb.entry(1).is_empty());
        assert_eq!(dpb.fullness(), 1);
    }

    #[test]
    fn bumping_fields() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 0);
        dpb.entry_mut(0).set_reference(Reference::Unused);
        dpb.entry_mut(0).bottom_field_order_cnt = 1;
        // The bottom field was already output.
        dpb.entry_mut(0).bottom_needed_for_output = false;

        let out = dpb.bump(MAX_DPB_SIZE).unwrap();
        assert_eq!(out.field, Field::Top);
        assert!(dpb.entry(0).is_empty());
    }

    #[test]
    fn display_bump_only_outputs_frames() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 4);
        put_frame(&mut dpb, 1, 1, 2);
        assert_eq!(dpb.reordering_delay(), 2);

        let out = dpb.display_bump().unwrap();
        assert_eq!(out.pic_order_cnt, 2);
        assert_eq!(dpb.reordering_delay(), 1);
        // Still referenced, so it stays in place.
        assert!(!dpb.entry(1).is_empty());

        // A lone field with the smallest POC blocks it.
        let entry = dpb.entry_mut(2);
        entry.store_fields(Field::Top);
        entry.top_field_order_cnt = 0;
        assert!(dpb.display_bump().is_none());
    }

    #[test]
    fn display_bump_bails_on_duplicate_poc() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 2);
        put_frame(&mut dpb, 1, 1, 2);
        assert!(dpb.display_bump().is_none());
        assert_eq!(dpb.reordering_delay(), 2);
    }

    #[test]
    fn flush_drains_in_poc_order() {
        let mut dpb = Dpb::<u32>::new();
        dpb.set_max_dpb_size(16);
        put_frame(&mut dpb, 0, 0, 6);
        put_frame(&mut dpb, 1, 1, 2);
        put_frame(&mut dpb, 2, 2, 4);
        put_frame(&mut dpb, 3, 3, 0);
        dpb.entry_mut(3).top_needed_for_output = false;
        dpb.entry_mut(3).bottom_needed_for_output = false;

        // A lone non-reference field waiting in the scratch slot.
        let scratch = dpb.entry_mut(CURRENT_SLOT);
        scratch.store_fields(Field::Bottom);
        scratch.bottom_field_order_cnt = 3;
        scratch.picture = Some(99);

        let outputs = dpb.flush();
        let pocs: Vec<i32> = outputs.iter().map(|o| o.pic_order_cnt).collect();
        assert_eq!(pocs, vec![2, 3, 4, 6]);
        assert_eq!(outputs[1].field, Field::Bottom);
        assert_eq!(dpb.fullness(), 0);
        assert!(dpb.entry(CURRENT_SLOT).is_empty());
        assert_eq!(dpb.cur_index(), CURRENT_SLOT);
    }

    #[test]
    fn store_current_moves_scratch() {
        let mut dpb = Dpb::<u32>::new();
        put_frame(&mut dpb, 0, 0, 0);
        dpb.current_mut().picture = Some(7);

        assert!(dpb.store_current());
        assert_eq!(dpb.cur_index(), 1);
        assert_eq!(dpb.current().picture, Some(7));

        for i in 0..MAX_DPB_SIZE {
            put_frame(&mut dpb, i, i as u32, 0);
        }
        dpb.set_cur_index(CURRENT_SLOT);
        assert!(!dpb.store_current());
        assert_eq!(dpb.cur_index(), CURRENT_SLOT);
    }
}
