// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs an H.264 stream through the DPB and prints what gets displayed.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use log::info;
use log::LevelFilter;

use h264_dpb::decoders::h264::client::DecoderClient;
use h264_dpb::decoders::h264::client::DisplayInfo;
use h264_dpb::decoders::h264::client::ParameterSet;
use h264_dpb::decoders::h264::client::PictureInfo;
use h264_dpb::decoders::h264::client::SequenceInfo;
use h264_dpb::decoders::h264::decoder::Decoder;
use h264_dpb::decoders::h264::decoder::DecoderConfig;
use h264_dpb::decoders::Error;

#[derive(Debug, FromArgs)]
/// Parse an H.264 Annex B elementary stream and print its pictures in output
/// order.
struct Args {
    /// the stream to read
    #[argh(positional)]
    input: PathBuf,

    /// enable debug logging
    #[argh(switch)]
    debug: bool,

    /// tolerance to non-conformant streams, from 0 (strict) to 100
    #[argh(option, default = "0")]
    error_threshold: u32,

    /// number of DPB frame buffers, from 1 to 16, instead of the SPS value
    #[argh(option)]
    max_dpb_size: Option<u32>,

    /// also display the frames inserted for gaps in frame_num
    #[argh(switch)]
    output_non_existing: bool,
}

/// Hands out numbered buffers and prints every callback.
#[derive(Default)]
struct PrintingClient {
    next_buffer: u32,
    num_decoded: usize,
    num_displayed: usize,
    num_errors: usize,
}

impl DecoderClient for PrintingClient {
    type Picture = u32;

    fn init_sequence(&mut self, info: &SequenceInfo) -> u32 {
        println!(
            "sequence: {}x{} (display {}x{}), profile {}, level {}, {} DPB slots",
            info.coded_width,
            info.coded_height,
            info.display_width,
            info.display_height,
            info.profile_idc,
            info.level_idc,
            info.min_num_dpb_slots
        );
        info.min_num_dpb_slots
    }

    fn alloc_picture_buffer(&mut self) -> Option<Self::Picture> {
        let buffer = self.next_buffer;
        self.next_buffer = self.next_buffer.wrapping_add(1);
        Some(buffer)
    }

    fn display_picture(&mut self, picture: &Self::Picture, info: &DisplayInfo) {
        self.num_displayed += 1;
        println!(
            "display: buffer {} POC {} {:?}{}",
            picture,
            info.pic_order_cnt,
            info.field,
            if info.not_existing {
                " (not existing)"
            } else {
                ""
            }
        );
    }

    fn update_picture_parameters(&mut self, set: ParameterSet<'_>) -> bool {
        match set {
            ParameterSet::Sps(sps) => info!("SPS {}", sps.seq_parameter_set_id),
            ParameterSet::Pps(pps) => info!("PPS {}", pps.pic_parameter_set_id),
        }
        true
    }

    fn begin_picture(&mut self, info: &PictureInfo<'_, Self::Picture>) -> bool {
        self.num_decoded += 1;
        info!(
            "decode: frame_num {} POC {} {:?}, {} slices",
            info.frame_num,
            info.pic_order_cnt,
            info.field,
            info.slices.len()
        );
        true
    }

    fn report_error(&mut self, _error: &Error) {
        self.num_errors += 1;
    }
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let mut builder = env_logger::Builder::new();
    builder.filter_level(if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    builder.init();

    let bitstream = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let config = DecoderConfig {
        error_threshold: args.error_threshold,
        max_dpb_size_override: args.max_dpb_size,
        output_non_existing: args.output_non_existing,
    };

    let mut decoder = Decoder::new(PrintingClient::default(), config)?;
    decoder.decode(0, &bitstream)?;
    decoder.flush()?;

    let client = decoder.client();
    println!(
        "{} pictures decoded, {} displayed, {} errors",
        client.num_decoded, client.num_displayed, client.num_errors
    );

    Ok(())
}
