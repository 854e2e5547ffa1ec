// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::format::rangeset::{BLOCK_SIZE, BlockRange};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image size overflow: {0} blocks")]
    SizeOverflow(u64),
    #[error("Failed to create image: {0:?}")]
    ImageCreate(PathBuf, #[source] io::Error),
    #[error("Failed to truncate image to {size} bytes: {path:?}")]
    ImageTruncate {
        path: PathBuf,
        size: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open loop control device")]
    LoopControl(#[source] io::Error),
    #[error("No free loop device available")]
    LoopGetFree(#[source] io::Error),
    #[error("Failed to attach {path:?} to {loop_path:?}")]
    LoopAttach {
        path: PathBuf,
        loop_path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to detach loop device: {0:?}")]
    LoopDetach(PathBuf, #[source] io::Error),
    #[error("Loop devices are not supported on this platform")]
    LoopUnsupported,
    #[error("Failed to discard blocks {range} on {path:?}")]
    Discard {
        path: PathBuf,
        range: BlockRange,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod ioctl {
    use nix::{ioctl_none_bad, ioctl_write_int_bad, ioctl_write_ptr_bad, request_code_none};

    // <linux/loop.h>
    ioctl_write_int_bad!(loop_set_fd, 0x4c00);
    ioctl_none_bad!(loop_clr_fd, 0x4c01);
    ioctl_none_bad!(loop_ctl_get_free, 0x4c82);

    // <linux/fs.h>: BLKDISCARD takes a (byte offset, byte length) pair.
    ioctl_write_ptr_bad!(blkdiscard, request_code_none!(0x12, 119), [u64; 2]);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const LOOP_CONTROL: &str = "/dev/loop-control";

#[cfg(any(target_os = "linux", target_os = "android"))]
fn loop_attach(image: &File, image_path: &Path) -> Result<(File, PathBuf)> {
    use std::os::fd::AsRawFd;

    let control = File::open(LOOP_CONTROL).map_err(Error::LoopControl)?;

    let devnr = unsafe { ioctl::loop_ctl_get_free(control.as_raw_fd()) }
        .map_err(|e| Error::LoopGetFree(e.into()))?;
    let loop_path = PathBuf::from(format!("/dev/loop{devnr}"));

    let loop_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&loop_path)
        .map_err(|source| Error::LoopAttach {
            path: image_path.to_owned(),
            loop_path: loop_path.clone(),
            source,
        })?;

    unsafe { ioctl::loop_set_fd(loop_file.as_raw_fd(), image.as_raw_fd()) }.map_err(|e| {
        Error::LoopAttach {
            path: image_path.to_owned(),
            loop_path: loop_path.clone(),
            source: e.into(),
        }
    })?;

    Ok((loop_file, loop_path))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn loop_attach(_image: &File, _image_path: &Path) -> Result<(File, PathBuf)> {
    Err(Error::LoopUnsupported)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn loop_detach(loop_path: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;

    let loop_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(loop_path)
        .map_err(|e| Error::LoopDetach(loop_path.to_owned(), e))?;

    unsafe { ioctl::loop_clr_fd(loop_file.as_raw_fd()) }
        .map_err(|e| Error::LoopDetach(loop_path.to_owned(), e.into()))?;

    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn loop_detach(_loop_path: &Path) -> Result<()> {
    Err(Error::LoopUnsupported)
}

#[cfg(unix)]
fn is_block_device(file: &File) -> bool {
    use std::os::unix::fs::FileTypeExt;

    file.metadata()
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_block_device(_file: &File) -> bool {
    false
}

/// Open writable handle to the provisioned target, plus the loop binding that
/// must be detached exactly once when the apply run finishes.
pub struct TargetDevice {
    file: File,
    path: PathBuf,
    loop_path: Option<PathBuf>,
    block_device: bool,
}

impl TargetDevice {
    /// Create (or truncate) a regular file at `path` sized to exactly
    /// `total_blocks * 4096` bytes and open it for writing. If `path` already
    /// names a block device, it is reused as-is and never resized. With
    /// `use_loop`, the image is bound to a free loop device and the loop
    /// device becomes the effective write target.
    pub fn provision(path: &Path, total_blocks: u64, use_loop: bool) -> Result<Self> {
        let size = total_blocks
            .checked_mul(BLOCK_SIZE)
            .ok_or(Error::SizeOverflow(total_blocks))?;

        let image = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::ImageCreate(path.to_owned(), e))?;

        if is_block_device(&image) {
            debug!("Reusing caller-supplied block device: {path:?}");

            return Ok(Self {
                file: image,
                path: path.to_owned(),
                loop_path: None,
                block_device: true,
            });
        }

        image.set_len(size).map_err(|source| Error::ImageTruncate {
            path: path.to_owned(),
            size,
            source,
        })?;

        if use_loop {
            let (loop_file, loop_path) = loop_attach(&image, path)?;

            debug!("Attached {path:?} to {loop_path:?}");

            Ok(Self {
                file: loop_file,
                path: loop_path.clone(),
                loop_path: Some(loop_path),
                block_device: true,
            })
        } else {
            Ok(Self {
                file: image,
                path: path.to_owned(),
                loop_path: None,
                block_device: false,
            })
        }
    }

    /// Path of the effective write target (the loop device path when bound).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the write target accepts block-device ioctls like discard.
    pub fn is_block_device(&self) -> bool {
        self.block_device
    }

    /// Issue a discard request for the range's byte span.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn discard(&self, range: BlockRange) -> Result<()> {
        use std::os::fd::AsRawFd;

        let (offset, len) = range.to_byte_span();
        let span = [offset, len];

        unsafe { ioctl::blkdiscard(self.file.as_raw_fd(), &span) }.map_err(|e| Error::Discard {
            path: self.path.clone(),
            range,
            source: e.into(),
        })?;

        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn discard(&self, range: BlockRange) -> Result<()> {
        Err(Error::Discard {
            path: self.path.clone(),
            range,
            source: io::ErrorKind::Unsupported.into(),
        })
    }

    /// Detach the loop device if one was bound. Must be called exactly once
    /// per apply run, on every exit path. The write handle is closed before
    /// the binding is cleared so that no writes are lost.
    pub fn release(self) -> Result<()> {
        let Self {
            file, loop_path, ..
        } = self;

        drop(file);

        if let Some(loop_path) = &loop_path {
            loop_detach(loop_path)?;

            debug!("Detached loop device: {loop_path:?}");
        }

        Ok(())
    }
}

impl Write for TargetDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for TargetDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
