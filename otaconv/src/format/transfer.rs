// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, BufRead},
    num::ParseIntError,
};

use thiserror::Error;
use tracing::trace;

use crate::format::rangeset::{self, RangeSet};

/// Transfer list versions that can be applied. Versions 1 and 2 predate the
/// brotli-compressed data stream and use a different command set; versions
/// above 4 add stash-based commands that this tool does not implement.
pub const SUPPORTED_VERSIONS: &[u32] = &[3, 4];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported transfer list version: {0}")]
    UnsupportedVersion(u64),
    #[error("Invalid declared block count: {0}")]
    InvalidBlockCount(u64),
    #[error("Line {line}: Invalid header integer: {text:?}")]
    InvalidHeader {
        line: usize,
        text: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Line {line}: Malformed command line: {text:?}")]
    MalformedLine { line: usize, text: String },
    #[error("Line {line}: Unsupported command: {keyword:?}")]
    UnsupportedCommand { line: usize, keyword: String },
    #[error("Line {line}: Invalid block ranges")]
    InvalidRanges {
        line: usize,
        #[source]
        source: rangeset::Error,
    },
    #[error("Commands end at block {max_block}, but the list declares {declared_blocks} blocks")]
    InconsistentBlockCount { declared_blocks: u64, max_block: u64 },
    #[error("Transfer list is truncated before line {0}")]
    Truncated(usize),
    #[error("Failed to read transfer list")]
    ListRead(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A single command line from the script. Execution order is the file order;
/// reordering would desynchronize the sequential data stream from the target
/// ranges of later new commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Erase(RangeSet),
    Zero(RangeSet),
    New(RangeSet),
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Erase(_) => "erase",
            Self::Zero(_) => "zero",
            Self::New(_) => "new",
        }
    }

    pub fn ranges(&self) -> &RangeSet {
        match self {
            Self::Erase(r) | Self::Zero(r) | Self::New(r) => r,
        }
    }
}

fn next_header_line(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    line: usize,
) -> Result<String> {
    match lines.next() {
        Some(Ok(text)) => Ok(text),
        Some(Err(e)) => Err(Error::ListRead(e)),
        None => Err(Error::Truncated(line)),
    }
}

fn parse_header_int(text: &str, line: usize) -> Result<u64> {
    text.trim().parse().map_err(|source| Error::InvalidHeader {
        line,
        text: text.to_owned(),
        source,
    })
}

/// Fully parsed transfer list. The whole script is buffered at parse time so
/// that the maximum referenced block is known before any device I/O happens
/// and the command list can then be replayed without rewinding the source.
#[derive(Clone, Debug)]
pub struct TransferList {
    pub version: u32,
    pub declared_blocks: u64,
    pub commands: Vec<Command>,
}

impl TransferList {
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut lines = reader.lines();

        let version_text = next_header_line(&mut lines, 1)?;
        let version = parse_header_int(&version_text, 1)?;
        if !SUPPORTED_VERSIONS.iter().any(|&v| u64::from(v) == version) {
            return Err(Error::UnsupportedVersion(version));
        }
        // Guaranteed to fit after the membership check.
        let version = version as u32;

        let blocks_text = next_header_line(&mut lines, 2)?;
        let declared_blocks = parse_header_int(&blocks_text, 2)?;
        if declared_blocks == 0 {
            return Err(Error::InvalidBlockCount(declared_blocks));
        }

        // Lines 3 and 4 (stash entry count and limit) are read and discarded.
        next_header_line(&mut lines, 3)?;
        next_header_line(&mut lines, 4)?;

        let mut commands = vec![];

        for (index, line) in lines.enumerate() {
            let line = line.map_err(Error::ListRead)?;
            let number = index + 5;

            let mut fields = line.split_whitespace();
            let (keyword, args) = match (fields.next(), fields.next(), fields.next()) {
                (Some(keyword), Some(args), None) => (keyword, args),
                _ => {
                    return Err(Error::MalformedLine {
                        line: number,
                        text: line,
                    });
                }
            };

            let ranges = RangeSet::parse(args).map_err(|source| Error::InvalidRanges {
                line: number,
                source,
            })?;

            trace!("Line {number}: {keyword} {ranges}");

            let command = match keyword {
                "erase" => Command::Erase(ranges),
                "zero" => Command::Zero(ranges),
                "new" => Command::New(ranges),
                _ => {
                    return Err(Error::UnsupportedCommand {
                        line: number,
                        keyword: keyword.to_owned(),
                    });
                }
            };

            commands.push(command);
        }

        let result = Self {
            version,
            declared_blocks,
            commands,
        };
        result.validate()?;

        Ok(result)
    }

    /// One past the highest block referenced by any command.
    pub fn max_block(&self) -> u64 {
        self.commands
            .iter()
            .map(|c| c.ranges().max_end())
            .max()
            .unwrap_or(0)
    }

    /// The declared block count is a lower bound on the highest referenced
    /// block. A list that declares more blocks than its commands touch is
    /// inconsistent and must be rejected before provisioning.
    fn validate(&self) -> Result<()> {
        let max_block = self.max_block();
        if max_block < self.declared_blocks {
            return Err(Error::InconsistentBlockCount {
                declared_blocks: self.declared_blocks,
                max_block,
            });
        }

        Ok(())
    }
}
