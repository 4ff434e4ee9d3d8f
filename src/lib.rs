// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 header parsing and decoded picture buffer management.
//!
//! The [`decoders::h264::decoder::Decoder`] consumes an Annex B elementary
//! stream and tells a [`decoders::h264::client::DecoderClient`] which
//! pictures to allocate, decode and display, without reconstructing any pixel
//! itself.

pub mod decoders;
