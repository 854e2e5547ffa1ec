// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, num::ParseIntError, slice};

use thiserror::Error;

/// Fixed device block size. All ranges and sizing math are in these units.
pub const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid integer: {0:?}")]
    InvalidInteger(String, #[source] ParseIntError),
    #[error("Range count must be non-zero and even: {0}")]
    InvalidCount(u64),
    #[error("Expected {expected} range tokens, but have {actual}")]
    WrongTokenCount { expected: u64, actual: u64 },
    #[error("Empty or inverted range: [{start}, {end})")]
    EmptyRange { start: u64, end: u64 },
}

type Result<T> = std::result::Result<T, Error>;

fn parse_int(token: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|e| Error::InvalidInteger(token.to_owned(), e))
}

/// Half-open range of device blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    /// Number of blocks covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Byte offset and byte length of the range on the target device.
    pub fn to_byte_span(&self) -> (u64, u64) {
        (self.start * BLOCK_SIZE, self.len() * BLOCK_SIZE)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Ordered list of block ranges. Insertion order matters: the data stream for
/// new commands follows command order, not block order, so the ranges must
/// never be sorted or merged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<BlockRange>,
}

impl RangeSet {
    /// Parse the `count,start0,end0,start1,end1,...` grammar. The leading
    /// count must be non-zero, even, and equal to the exact number of
    /// integers that follow. Ranges with `start >= end` are rejected.
    pub fn parse(args: &str) -> Result<Self> {
        let mut tokens = args.split(',');
        let count = parse_int(tokens.next().unwrap_or_default())?;
        if count == 0 || count % 2 != 0 {
            return Err(Error::InvalidCount(count));
        }

        let rest = tokens.collect::<Vec<_>>();
        if rest.len() as u64 != count {
            return Err(Error::WrongTokenCount {
                expected: count,
                actual: rest.len() as u64,
            });
        }

        let mut ranges = Vec::with_capacity(rest.len() / 2);

        for pair in rest.chunks_exact(2) {
            let start = parse_int(pair[0])?;
            let end = parse_int(pair[1])?;

            if start >= end {
                return Err(Error::EmptyRange { start, end });
            }

            ranges.push(BlockRange { start, end });
        }

        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, BlockRange> {
        self.ranges.iter()
    }

    /// Total number of blocks covered by all ranges. Saturates instead of
    /// overflowing on absurd inputs since this is only used for reporting.
    pub fn block_count(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |total, r| total.saturating_add(r.len()))
    }

    /// One past the highest block referenced, or 0 if there are no ranges.
    pub fn max_end(&self) -> u64 {
        self.ranges.iter().map(|r| r.end).max().unwrap_or(0)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = BlockRange;
    type IntoIter = std::iter::Copied<slice::Iter<'a, BlockRange>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter().copied()
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", 2 * self.ranges.len())?;

        for range in &self.ranges {
            write!(f, ",{},{}", range.start, range.end)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_valid() {
        let set = RangeSet::parse("4,0,2,10,11").unwrap();
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![
                BlockRange { start: 0, end: 2 },
                BlockRange { start: 10, end: 11 },
            ],
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.block_count(), 3);
        assert_eq!(set.max_end(), 11);
    }

    #[test]
    fn round_trip() {
        for args in ["2,0,1", "4,0,2,10,11", "6,1,2,3,4,5,6"] {
            let set = RangeSet::parse(args).unwrap();
            assert_eq!(set.to_string(), args);
        }
    }

    #[test]
    fn parse_invalid_count() {
        assert_matches!(RangeSet::parse("0"), Err(Error::InvalidCount(0)));
        assert_matches!(RangeSet::parse("3,0,1,2"), Err(Error::InvalidCount(3)));
    }

    #[test]
    fn parse_wrong_token_count() {
        // Too few.
        assert_matches!(
            RangeSet::parse("4,0,2"),
            Err(Error::WrongTokenCount {
                expected: 4,
                actual: 2,
            })
        );
        // Trailing extra.
        assert_matches!(
            RangeSet::parse("2,0,2,5"),
            Err(Error::WrongTokenCount {
                expected: 2,
                actual: 3,
            })
        );
    }

    #[test]
    fn parse_invalid_integer() {
        assert_matches!(RangeSet::parse(""), Err(Error::InvalidInteger(_, _)));
        assert_matches!(RangeSet::parse("x,0,1"), Err(Error::InvalidInteger(_, _)));
        assert_matches!(RangeSet::parse("2,0,x"), Err(Error::InvalidInteger(_, _)));
        assert_matches!(RangeSet::parse("2,-1,1"), Err(Error::InvalidInteger(_, _)));
    }

    #[test]
    fn parse_empty_range() {
        assert_matches!(
            RangeSet::parse("2,5,5"),
            Err(Error::EmptyRange { start: 5, end: 5 })
        );
        assert_matches!(
            RangeSet::parse("2,6,5"),
            Err(Error::EmptyRange { start: 6, end: 5 })
        );
    }

    #[test]
    fn block_count_saturates() {
        let args = format!("4,0,{0},0,{0}", u64::MAX);
        let set = RangeSet::parse(&args).unwrap();
        assert_eq!(set.block_count(), u64::MAX);
    }

    #[test]
    fn byte_spans() {
        let range = BlockRange { start: 2, end: 4 };
        assert_eq!(range.len(), 2);
        assert_eq!(range.to_byte_span(), (2 * BLOCK_SIZE, 2 * BLOCK_SIZE));
    }
}
