// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod boundary;
pub mod client;
pub mod decoder;
pub mod dpb;
pub mod nalu;
pub mod nalu_reader;
pub mod param_sets;
pub mod parser;
pub mod picture;
pub mod scaling;
pub mod sei;
#[cfg(test)]
pub mod test_utils;
