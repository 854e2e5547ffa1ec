// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read},
    path::Path,
};

use brotli::Decompressor;

use crate::format::rangeset::BLOCK_SIZE;

/// File name suffix identifying a brotli-compressed data stream
/// (eg. `system.new.dat.br`).
const BROTLI_SUFFIX: &str = ".br";

/// Encoding of the new-data stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataFormat {
    Raw,
    Brotli,
}

impl DataFormat {
    /// Select the format from the file name suffix. The stream is consumed
    /// strictly sequentially and cannot be rewound after a magic-byte sniff,
    /// so the suffix is the only selection mechanism.
    pub fn from_path(path: &Path) -> Self {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.ends_with(BROTLI_SUFFIX) => Self::Brotli,
            _ => Self::Raw,
        }
    }
}

/// Sequential reader for the new-data stream. A single instance is shared by
/// every new command in a transfer list: the decoder's carry-over buffers must
/// survive across target ranges because the compressed stream is continuous
/// and independent of block-range boundaries. Never recreate or reset this
/// between commands within one apply run.
pub enum NewDataReader<R: Read> {
    Raw(R),
    /// Boxed because the decoder state with its scratch buffers is large.
    Brotli(Box<Decompressor<R>>),
}

impl<R: Read> NewDataReader<R> {
    pub fn new(reader: R, format: DataFormat) -> Self {
        match format {
            DataFormat::Raw => Self::Raw(reader),
            DataFormat::Brotli => {
                Self::Brotli(Box::new(Decompressor::new(reader, BLOCK_SIZE as usize)))
            }
        }
    }

    pub fn format(&self) -> DataFormat {
        match self {
            Self::Raw(_) => DataFormat::Raw,
            Self::Brotli(_) => DataFormat::Brotli,
        }
    }
}

impl<R: Read> Read for NewDataReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(r) => r.read(buf),
            Self::Brotli(r) => r.read(buf),
        }
    }
}
