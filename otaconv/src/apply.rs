// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    device::{self, TargetDevice},
    format::{
        newdata::NewDataReader,
        rangeset::{BLOCK_SIZE, BlockRange, RangeSet},
        transfer::{Command, TransferList},
    },
    stream::{self, WriteZerosExt},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to seek target to block {block}")]
    TargetSeek {
        block: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write blocks {range} to target")]
    TargetWrite {
        range: BlockRange,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read data for blocks {range} from data stream")]
    DataRead {
        range: BlockRange,
        #[source]
        source: io::Error,
    },
    #[error("Apply run was interrupted")]
    Interrupted(#[source] io::Error),
    #[error(transparent)]
    Device(#[from] device::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn seek_to_block(device: &mut TargetDevice, block: u64) -> Result<()> {
    device
        .seek(SeekFrom::Start(block * BLOCK_SIZE))
        .map_err(|source| Error::TargetSeek { block, source })?;

    Ok(())
}

/// Discard each range. Discard is only meaningful on a block device; on a
/// plain file target the command is skipped, matching the data movement
/// contract (erase never writes anything).
fn erase(device: &mut TargetDevice, ranges: &RangeSet, cancel_signal: &AtomicBool) -> Result<()> {
    if !device.is_block_device() {
        debug!("Target is not a block device; skipping erase");
        return Ok(());
    }

    for range in ranges {
        stream::check_cancel(cancel_signal).map_err(Error::Interrupted)?;

        device.discard(range)?;
    }

    Ok(())
}

/// Zero-fill each range, one block-sized write at a time.
fn zero(device: &mut TargetDevice, ranges: &RangeSet, cancel_signal: &AtomicBool) -> Result<()> {
    for range in ranges {
        stream::check_cancel(cancel_signal).map_err(Error::Interrupted)?;

        seek_to_block(device, range.start)?;

        device
            .write_zeros_exact(range.len() * BLOCK_SIZE)
            .map_err(|source| Error::TargetWrite { range, source })?;
    }

    Ok(())
}

/// Pull exactly `range.len() * 4096` bytes per range from the shared data
/// stream and write them at the range's target offset. The source is never
/// seeked: every new command in the script consumes the same sequential
/// cursor, so a short read here leaves nothing to resynchronize against and
/// is fatal.
fn copy_new<R: Read>(
    device: &mut TargetDevice,
    ranges: &RangeSet,
    data: &mut NewDataReader<R>,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut block = [0u8; BLOCK_SIZE as usize];

    for range in ranges {
        seek_to_block(device, range.start)?;

        for _ in range.start..range.end {
            stream::check_cancel(cancel_signal).map_err(Error::Interrupted)?;

            data.read_exact(&mut block)
                .map_err(|source| Error::DataRead { range, source })?;
            device
                .write_all(&block)
                .map_err(|source| Error::TargetWrite { range, source })?;
        }
    }

    Ok(())
}

/// Replay the command list in file order against the provisioned target. The
/// first failure aborts the run: later commands assume every earlier one
/// succeeded because of the sequential data stream.
pub fn apply_commands<R: Read>(
    list: &TransferList,
    data: &mut NewDataReader<R>,
    device: &mut TargetDevice,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for (index, command) in list.commands.iter().enumerate() {
        debug!("Command #{index}: {} {}", command.keyword(), command.ranges());

        match command {
            Command::Erase(ranges) => erase(device, ranges, cancel_signal)?,
            Command::Zero(ranges) => zero(device, ranges, cancel_signal)?,
            Command::New(ranges) => copy_new(device, ranges, data, cancel_signal)?,
        }
    }

    Ok(())
}

/// Provision the target sized by the list's maximum referenced block, apply
/// every command, and release the device. The release step runs on every exit
/// path; a release failure is reported, but never masks an earlier error.
pub fn apply<R: Read>(
    list: &TransferList,
    data: &mut NewDataReader<R>,
    target: &Path,
    use_loop: bool,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut device = TargetDevice::provision(target, list.max_block(), use_loop)?;

    let result = apply_commands(list, data, &mut device, cancel_signal);
    let released = device.release();

    match (result, released) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(re)) => {
            warn!("Failed to release target device: {re}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use crate::format::newdata::DataFormat;

    use super::*;

    const B: usize = BLOCK_SIZE as usize;

    fn parse(script: &str) -> TransferList {
        TransferList::from_reader(Cursor::new(script)).unwrap()
    }

    fn apply_raw(script: &str, payload: Vec<u8>, target: &Path) -> Result<()> {
        let list = parse(script);
        let mut data = NewDataReader::new(Cursor::new(payload), DataFormat::Raw);
        let cancel_signal = AtomicBool::new(false);

        apply(&list, &mut data, target, false, &cancel_signal)
    }

    #[test]
    fn zero_and_new() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        apply_raw("4\n4\n0\n0\nzero 2,0,2\nnew 2,2,4\n", vec![0xab; 2 * B], &path).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 4 * B);
        assert!(content[..2 * B].iter().all(|b| *b == 0));
        assert!(content[2 * B..].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn all_zero() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        apply_raw("4\n8\n0\n0\nzero 4,0,5,5,8\n", vec![], &path).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 8 * B);
        assert!(content.iter().all(|b| *b == 0));
    }

    #[test]
    fn erase_is_skipped_on_plain_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        apply_raw("4\n2\n0\n0\nerase 2,0,2\nnew 2,0,2\n", vec![0x5a; 2 * B], &path).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert!(content.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn new_writes_payload_verbatim_at_offset() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        let payload = (0..2 * B).map(|i| i as u8).collect::<Vec<_>>();
        apply_raw("4\n4\n0\n0\nnew 2,2,4\n", payload.clone(), &path).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert!(content[..2 * B].iter().all(|b| *b == 0));
        assert_eq!(&content[2 * B..], &payload[..]);
    }

    #[test]
    fn new_from_brotli_stream() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        let payload = vec![0xabu8; 2 * B];
        let mut compressed = vec![];
        {
            let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(&payload).unwrap();
        }

        // Non-contiguous target ranges over one continuous compressed stream.
        let list = parse("4\n3\n0\n0\nnew 2,2,3\nzero 2,1,2\nnew 2,0,1\n");
        let mut data = NewDataReader::new(Cursor::new(compressed), DataFormat::Brotli);
        let cancel_signal = AtomicBool::new(false);

        apply(&list, &mut data, &path, false, &cancel_signal).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 3 * B);
        assert!(content[..B].iter().all(|b| *b == 0xab));
        assert!(content[B..2 * B].iter().all(|b| *b == 0));
        assert!(content[2 * B..].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn short_data_stream_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        let result = apply_raw("4\n4\n0\n0\nnew 2,0,4\n", vec![0xab; B], &path);
        assert_matches!(result, Err(Error::DataRead { .. }));
    }

    #[test]
    fn cancel_stops_before_any_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("target.img");

        let list = parse("4\n4\n0\n0\nzero 2,0,4\n");
        let mut data = NewDataReader::new(Cursor::new(vec![]), DataFormat::Raw);
        let cancel_signal = AtomicBool::new(true);

        let result = apply(&list, &mut data, &path, false, &cancel_signal);
        assert_matches!(result, Err(Error::Interrupted(_)));

        // The target is provisioned, but untouched by command execution.
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 4 * B);
        assert!(content.iter().all(|b| *b == 0));
    }
}
