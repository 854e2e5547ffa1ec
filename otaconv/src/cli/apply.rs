// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    apply,
    cli::status,
    format::{
        newdata::{DataFormat, NewDataReader},
        rangeset::BLOCK_SIZE,
        transfer::TransferList,
    },
    util::NumBytes,
};

fn load_transfer_list(path: &Path) -> Result<TransferList> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open transfer list for reading: {path:?}"))?;

    let list = TransferList::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse transfer list: {path:?}"))?;

    Ok(list)
}

/// Apply a transfer list to a target image or block device.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to transfer list script.
    pub transfer_list: PathBuf,

    /// Path to new data stream (brotli-compressed if the name ends in .br).
    pub data: PathBuf,

    /// Path to output image or block device.
    pub target: PathBuf,

    /// Bind the image to a free loop device and write through it.
    #[arg(long)]
    pub loop_device: bool,
}

/// Print transfer list details without touching any device.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to transfer list script.
    pub transfer_list: PathBuf,
}

pub fn apply_main(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let list = load_transfer_list(&cli.transfer_list)?;

    status!(
        "Transfer list version {}: {} commands, {} blocks declared, max block {}",
        list.version,
        list.commands.len(),
        list.declared_blocks,
        list.max_block(),
    );

    let format = DataFormat::from_path(&cli.data);
    let data_file = File::open(&cli.data)
        .with_context(|| format!("Failed to open data stream for reading: {:?}", cli.data))?;
    let mut data = NewDataReader::new(BufReader::new(data_file), format);

    status!(
        "Provisioning {:?} ({})",
        cli.target,
        NumBytes(list.max_block().saturating_mul(BLOCK_SIZE)),
    );

    apply::apply(
        &list,
        &mut data,
        &cli.target,
        cli.loop_device,
        cancel_signal,
    )
    .with_context(|| format!("Failed to apply transfer list to {:?}", cli.target))?;

    status!("Successfully applied transfer list");

    Ok(())
}

pub fn info_main(cli: &InfoCli) -> Result<()> {
    let list = load_transfer_list(&cli.transfer_list)?;

    status!("Version: {}", list.version);
    status!("Declared blocks: {}", list.declared_blocks);
    status!("Max block: {}", list.max_block());

    let mut new_blocks = 0;

    for keyword in ["erase", "zero", "new"] {
        let (count, blocks) = list
            .commands
            .iter()
            .filter(|c| c.keyword() == keyword)
            .fold((0u64, 0u64), |(count, blocks), c| {
                (count + 1, blocks.saturating_add(c.ranges().block_count()))
            });

        status!("{keyword}: {count} commands covering {blocks} blocks");

        if keyword == "new" {
            new_blocks = blocks;
        }
    }

    status!(
        "Data stream supplies {}",
        NumBytes(new_blocks.saturating_mul(BLOCK_SIZE)),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn info_summarizes_huge_ranges() {
        // Block totals near u64::MAX must not overflow the summary math.
        let script = format!("4\n1\n0\n0\nnew 2,0,{0}\nnew 2,0,{0}\n", u64::MAX);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(script.as_bytes()).unwrap();

        let cli = InfoCli {
            transfer_list: file.path().to_owned(),
        };
        info_main(&cli).unwrap();
    }
}
