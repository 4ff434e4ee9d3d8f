// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

pub mod h264;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed syntax: {0:#}")]
    MalformedSyntax(#[source] anyhow::Error),
    #[error("non-conformant stream: {0}")]
    NonConformantStream(String),
    #[error("no free frame buffer left in the DPB")]
    ResourceExhaustion,
    #[error("the client could not allocate a picture buffer")]
    AllocationFailure,
    #[error("the client rejected the sequence")]
    SequenceRejected,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("error threshold {0} is out of range, expected 0 to 100")]
    ErrorThresholdOutOfRange(u32),
    #[error("DPB size override {0} is out of range, expected 1 to 16")]
    DpbSizeOutOfRange(u32),
}
